//! Audio decode thread
//!
//! Pops packets from the audio queue, decodes and resamples them to the
//! output format and queues the PCM for the audio IO thread. The first PCM of
//! a session latches the audio clock.
//!
//! After a seek the clock restarts at the seek target. When the demuxer lands
//! after the target, the gap is filled with silence so the first decoded
//! sample still plays at its own timestamp.

use crate::audio::{AudioOutputStream, PcmPacket};
use crate::decoder::{AudioDecoder, Packet, PacketQueue, QueueItem, Rational};
use crate::player::controller::DecodeStats;
use crate::player::session::{SessionContext, NO_PTS};
use crate::utils::error::Result;
use log::{debug, info, warn};
use std::sync::atomic::Ordering;
use std::sync::Arc;
use std::thread::{self, JoinHandle};

/// Longest gap after a seek target that is filled with silence, in micros
const MAX_SEEK_PAD_MICROS: i64 = 5_000_000;

/// Start the `audio-decode` thread
pub(crate) fn spawn(
    ctx: Arc<SessionContext>,
    decoder: Box<dyn AudioDecoder>,
    queue: Arc<PacketQueue<Packet>>,
    output: Arc<AudioOutputStream>,
    max_buffered_ms: u64,
) -> std::io::Result<JoinHandle<Result<DecodeStats>>> {
    let max_frames = output.params().micros_to_frames(max_buffered_ms as i64 * 1000).max(1) as usize;
    thread::Builder::new().name("audio-decode".to_string()).spawn(move || {
        let mut worker = AudioDecodeWorker {
            ctx,
            decoder,
            queue,
            output,
            max_frames,
            pad_pending: false,
            stats: DecodeStats::default(),
        };
        let result = worker.run();
        if let Err(e) = &result {
            worker.ctx.fail(e.clone());
        }
        result.map(|()| worker.stats)
    })
}

struct AudioDecodeWorker {
    ctx: Arc<SessionContext>,
    decoder: Box<dyn AudioDecoder>,
    queue: Arc<PacketQueue<Packet>>,
    output: Arc<AudioOutputStream>,
    max_frames: usize,
    /// Set by a flush until the first PCM of the new position was queued
    pad_pending: bool,
    stats: DecodeStats,
}

impl AudioDecodeWorker {
    fn run(&mut self) -> Result<()> {
        info!(
            "Audio decoder started (time base {}, ring limit {} frames)",
            self.decoder.time_base(),
            self.max_frames
        );
        while let Some(item) = self.queue.pop() {
            match item {
                QueueItem::Packet(packet) => {
                    self.stats.packets += 1;
                    match self.decoder.send_packet(packet) {
                        Ok(()) => {}
                        Err(e) if !e.is_fatal() => {
                            self.count_error(&e);
                            continue;
                        }
                        Err(e) => return Err(e),
                    }
                    self.drain_pcm()?;
                }
                QueueItem::Flush => {
                    self.decoder.flush();
                    let dropped = self.output.ring().flush();
                    self.stats.flushes += 1;
                    self.pad_pending = true;
                    debug!("Audio decoder flushed ({} frames dropped)", dropped);
                    self.ctx.ack_flush();
                }
                QueueItem::EndOfStream => {
                    self.decoder.send_eof()?;
                    self.drain_pcm()?;
                    self.output.ring().mark_eos();
                    debug!("Audio decoder drained at end of stream");
                }
            }
        }
        debug!("Audio decoder exiting");
        Ok(())
    }

    fn count_error(&mut self, error: &crate::utils::error::PlayerError) {
        self.stats.decode_errors += 1;
        self.ctx.decode_errors.fetch_add(1, Ordering::Relaxed);
        warn!("Audio packet skipped: {}", error);
    }

    fn drain_pcm(&mut self) -> Result<()> {
        let time_base = self.decoder.time_base();
        loop {
            let pcm = match self.decoder.receive_frame() {
                Ok(Some(pcm)) => pcm,
                Ok(None) => return Ok(()),
                Err(e) if !e.is_fatal() => {
                    self.count_error(&e);
                    continue;
                }
                Err(e) => return Err(e),
            };

            let floor = self.ctx.seek_floor.load(Ordering::Acquire);
            let Some(pcm) = trim_before(pcm, time_base, floor, self.output.params().sample_rate) else {
                self.stats.discarded += 1;
                continue;
            };
            if let Some(pts) = pcm.pts {
                self.output.latch(time_base.to_micros(pts));
            }
            if std::mem::take(&mut self.pad_pending) {
                if let Some(silence) = self.seek_padding(&pcm, time_base, floor) {
                    if !self.queue_pcm(silence) {
                        return Ok(());
                    }
                }
            }
            if !self.queue_pcm(pcm) {
                return Ok(());
            }
        }
    }

    /// Silence covering the gap between the seek target and `first`
    ///
    /// Gaps too long to pad move the clock to `first` instead.
    fn seek_padding(&self, first: &PcmPacket, time_base: Rational, floor: i64) -> Option<PcmPacket> {
        let start = time_base.to_micros(first.pts?);
        if floor == NO_PTS || start <= floor {
            return None;
        }
        if start - floor > MAX_SEEK_PAD_MICROS {
            warn!("Seek landed {} ms past its target, clock moved to {} us", (start - floor) / 1000, start);
            self.ctx.clock.reset(start);
            return None;
        }
        let silence = silence_between(floor, start, time_base, self.output.params().sample_rate, first.channels)?;
        debug!("Padding {} frames of silence before {} us", silence.frames(), start);
        Some(silence)
    }

    /// Wait for room in the ring and queue `pcm`; `false` when a flush or
    /// shutdown is pending
    fn queue_pcm(&mut self, pcm: PcmPacket) -> bool {
        if !self.output.ring().wait_for_space(self.max_frames) {
            return false;
        }
        if self.output.ring().push(pcm) {
            self.stats.frames += 1;
        }
        true
    }
}

/// Silent PCM playing from `from` up to `until` (microseconds)
fn silence_between(from: i64, until: i64, time_base: Rational, sample_rate: u32, channels: u16) -> Option<PcmPacket> {
    let frames = ((until - from) as i128 * sample_rate as i128 / 1_000_000) as usize;
    if frames == 0 {
        return None;
    }
    let channels = channels.max(1);
    Some(PcmPacket::new(
        vec![0; frames * channels as usize],
        channels,
        Some(time_base.from_micros(from)),
    ))
}

/// Drop the samples of `pcm` that play before `floor` (microseconds)
///
/// Returns `None` when nothing is left.
fn trim_before(mut pcm: PcmPacket, time_base: Rational, floor: i64, sample_rate: u32) -> Option<PcmPacket> {
    let (Some(pts), true) = (pcm.pts, floor != NO_PTS) else {
        return Some(pcm);
    };
    let start = time_base.to_micros(pts);
    if start >= floor {
        return Some(pcm);
    }

    let skip_frames = ((floor - start) as i128 * sample_rate as i128 / 1_000_000) as usize;
    if skip_frames >= pcm.frames() {
        return None;
    }
    let channels = pcm.channels.max(1) as usize;
    pcm.samples.drain(..skip_frames * channels);
    let skipped_ticks = time_base.from_micros(floor) - pts;
    pcm.pts = Some(pts + skipped_ticks.max(0));
    Some(pcm)
}
