//! Video decode thread
//!
//! Pops packets from the video queue, decodes them straight into FrameRing
//! slots and commits each picture for the renderer.

use crate::decoder::{FrameRing, Packet, PacketQueue, QueueItem, RingError, VideoDecoder};
use crate::player::controller::DecodeStats;
use crate::player::session::SessionContext;
use crate::utils::error::Result;
use log::{debug, info, warn};
use std::sync::atomic::Ordering;
use std::sync::Arc;
use std::thread::{self, JoinHandle};

/// Start the `video-decode` thread
pub(crate) fn spawn(
    ctx: Arc<SessionContext>,
    decoder: Box<dyn VideoDecoder>,
    queue: Arc<PacketQueue<Packet>>,
    frames: Arc<FrameRing>,
) -> std::io::Result<JoinHandle<Result<DecodeStats>>> {
    thread::Builder::new().name("video-decode".to_string()).spawn(move || {
        let mut worker = VideoDecodeWorker {
            ctx,
            decoder,
            queue,
            frames,
            skipping: false,
            stats: DecodeStats::default(),
        };
        let result = worker.run();
        if let Err(e) = &result {
            worker.ctx.fail(e.clone());
        }
        result.map(|()| worker.stats)
    })
}

struct VideoDecodeWorker {
    ctx: Arc<SessionContext>,
    decoder: Box<dyn VideoDecoder>,
    queue: Arc<PacketQueue<Packet>>,
    frames: Arc<FrameRing>,
    skipping: bool,
    stats: DecodeStats,
}

impl VideoDecodeWorker {
    fn run(&mut self) -> Result<()> {
        info!("Video decoder started (time base {})", self.decoder.time_base());
        while let Some(item) = self.queue.pop() {
            match item {
                QueueItem::Packet(packet) => {
                    self.stats.packets += 1;
                    self.apply_skip();
                    match self.decoder.send_packet(packet) {
                        Ok(()) => {}
                        Err(e) if !e.is_fatal() => {
                            self.count_error(&e);
                            continue;
                        }
                        Err(e) => return Err(e),
                    }
                    self.drain_frames()?;
                }
                QueueItem::Flush => {
                    self.decoder.flush();
                    let dropped = self.frames.flush();
                    self.stats.flushes += 1;
                    debug!("Video decoder flushed ({} frames dropped)", dropped);
                    self.ctx.ack_flush();
                }
                QueueItem::EndOfStream => {
                    self.decoder.send_eof()?;
                    self.drain_frames()?;
                    self.frames.mark_eos();
                    debug!("Video decoder drained at end of stream");
                }
            }
        }
        debug!("Video decoder exiting");
        Ok(())
    }

    fn apply_skip(&mut self) {
        let skip = self.ctx.skip.load(Ordering::Acquire);
        if skip != self.skipping {
            self.skipping = skip;
            self.decoder.set_skip_non_reference(skip);
            debug!("Fast-skip {}", if skip { "on" } else { "off" });
        }
    }

    fn count_error(&mut self, error: &crate::utils::error::PlayerError) {
        self.stats.decode_errors += 1;
        self.ctx.decode_errors.fetch_add(1, Ordering::Relaxed);
        warn!("Video packet skipped: {}", error);
    }

    /// Move every picture the decoder has ready into the ring
    fn drain_frames(&mut self) -> Result<()> {
        loop {
            let mut slot = match self.frames.acquire_write() {
                Ok(slot) => slot,
                // a seek is pending; the flush token discards the codec state
                Err(RingError::Flushing) => return Ok(()),
                Err(RingError::Closed) => return Ok(()),
                Err(e) => {
                    debug!("Frame ring refused a slot: {:?}", e);
                    return Ok(());
                }
            };

            let produced = match self.decoder.receive_frame(&mut slot) {
                Ok(produced) => produced,
                Err(e) if !e.is_fatal() => {
                    self.frames.cancel(slot);
                    self.count_error(&e);
                    continue;
                }
                Err(e) => {
                    self.frames.cancel(slot);
                    return Err(e);
                }
            };
            if !produced {
                self.frames.cancel(slot);
                return Ok(());
            }

            let presentation = slot.presentation_time();
            if presentation < self.ctx.seek_floor.load(Ordering::Acquire) {
                self.frames.cancel(slot);
                self.stats.discarded += 1;
                continue;
            }
            self.ctx.decoder_pts.store(presentation, Ordering::Relaxed);
            if self.frames.commit(slot) {
                self.stats.frames += 1;
            }
        }
    }
}
