//! Demuxer controller
//!
//! Runs on the session's `demuxer` thread. It owns the [`Demuxer`], starts
//! one decode thread per stream, routes packets into their queues and
//! executes seek requests between packet reads. When the input ends it waits
//! until every output has played out, then joins the decoders and returns a
//! [`SessionOutcome`].

use crate::decoder::{AudioDecoder, Demuxer, Packet, PacketQueue, PushError, QueueItem, SeekDirection, StreamKind, VideoDecoder};
use crate::player::session::{SeekRequest, SessionContext};
use crate::player::{audio_decode, video_decode};
use crate::utils::error::{PlayerError, Result};
use log::{debug, info, warn};
use std::sync::atomic::Ordering;
use std::sync::Arc;
use std::thread::JoinHandle;

/// How a session ended
#[derive(Debug, Clone)]
pub enum SessionOutcome {
    /// Every stream played to its end
    EndOfStream,

    /// The session was cancelled
    Stopped,

    /// A fatal error ended the session
    Failed(PlayerError),
}

/// Counters returned by a decode thread
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub(crate) struct DecodeStats {
    /// Packets taken from the queue
    pub packets: u64,

    /// Frames (pictures or PCM packets) handed to the output
    pub frames: u64,

    /// Packets the codec rejected
    pub decode_errors: u64,

    /// Frames discarded because they precede a seek target
    pub discarded: u64,

    /// Flush tokens handled
    pub flushes: u64,
}

enum PlayOut {
    Done,
    Seek,
    Quit,
}

/// Reader loop of one session
pub(crate) struct DemuxerController {
    ctx: Arc<SessionContext>,
    demuxer: Box<dyn Demuxer>,
    video: Option<Box<dyn VideoDecoder>>,
    audio: Option<Box<dyn AudioDecoder>>,
    max_buffered_ms: u64,
    packets_read: u64,
}

impl DemuxerController {
    /// Prepare a controller; decoders whose stream has no queue are dropped
    pub fn new(
        ctx: Arc<SessionContext>,
        demuxer: Box<dyn Demuxer>,
        video: Option<Box<dyn VideoDecoder>>,
        audio: Option<Box<dyn AudioDecoder>>,
        max_buffered_ms: u64,
    ) -> Self {
        Self {
            video: video.filter(|_| ctx.video_queue.is_some()),
            audio: audio.filter(|_| ctx.audio_queue.is_some()),
            ctx,
            demuxer,
            max_buffered_ms,
            packets_read: 0,
        }
    }

    /// Run the session to completion
    pub fn run(mut self) -> SessionOutcome {
        let decoders = match self.spawn_decoders() {
            Ok(decoders) => decoders,
            Err(e) => {
                self.ctx.fail(e.clone());
                return SessionOutcome::Failed(e);
            }
        };

        let outcome = self.read_loop();
        debug!("Demuxer loop finished after {} packets: {:?}", self.packets_read, outcome);

        for queue in self.queues() {
            queue.close();
        }
        for (name, handle) in decoders {
            match handle.join() {
                Ok(Ok(stats)) => debug!(
                    "{} decoder finished: {} packets, {} frames, {} errors, {} discarded",
                    name, stats.packets, stats.frames, stats.decode_errors, stats.discarded
                ),
                Ok(Err(e)) => debug!("{} decoder ended with {}", name, e),
                Err(_) => warn!("{} decoder thread panicked", name),
            }
        }

        match outcome {
            SessionOutcome::Stopped => self.quit_outcome(),
            other => other,
        }
    }

    fn spawn_decoders(&mut self) -> Result<Vec<(&'static str, JoinHandle<Result<DecodeStats>>)>> {
        let mut handles = Vec::new();
        if let (Some(decoder), Some(queue), Some(frames)) =
            (self.video.take(), self.ctx.video_queue.clone(), self.ctx.frames.clone())
        {
            let handle = video_decode::spawn(Arc::clone(&self.ctx), decoder, queue, frames);
            match handle {
                Ok(handle) => handles.push(("video", handle)),
                Err(e) => {
                    self.abort_spawned(handles);
                    return Err(e.into());
                }
            }
        }
        if let (Some(decoder), Some(queue), Some(output)) =
            (self.audio.take(), self.ctx.audio_queue.clone(), self.ctx.audio.clone())
        {
            let handle = audio_decode::spawn(Arc::clone(&self.ctx), decoder, queue, output, self.max_buffered_ms);
            match handle {
                Ok(handle) => handles.push(("audio", handle)),
                Err(e) => {
                    self.abort_spawned(handles);
                    return Err(e.into());
                }
            }
        }
        Ok(handles)
    }

    fn abort_spawned(&self, handles: Vec<(&'static str, JoinHandle<Result<DecodeStats>>)>) {
        self.ctx.cancel();
        for (_, handle) in handles {
            let _ = handle.join();
        }
    }

    fn queues(&self) -> impl Iterator<Item = &Arc<PacketQueue<Packet>>> {
        [&self.ctx.video_queue, &self.ctx.audio_queue].into_iter().flatten()
    }

    fn quit_outcome(&self) -> SessionOutcome {
        match self.ctx.control().failure.clone() {
            Some(e) => SessionOutcome::Failed(e),
            None => SessionOutcome::Stopped,
        }
    }

    fn take_seek(&self) -> Option<SeekRequest> {
        self.ctx.control().seek
    }

    fn read_loop(&mut self) -> SessionOutcome {
        let mut at_eof = false;
        loop {
            if self.ctx.should_quit() {
                return SessionOutcome::Stopped;
            }
            if let Some(request) = self.take_seek() {
                self.execute_seek(request);
                at_eof = false;
                continue;
            }
            if at_eof {
                match self.wait_played_out() {
                    PlayOut::Done => {
                        info!("Session {} reached end of stream", self.ctx.id);
                        return SessionOutcome::EndOfStream;
                    }
                    PlayOut::Seek => continue,
                    PlayOut::Quit => return SessionOutcome::Stopped,
                }
            }

            match self.demuxer.read_packet() {
                Ok(Some(packet)) => {
                    self.packets_read += 1;
                    self.route(packet);
                }
                Ok(None) => {
                    debug!("Demuxer reached end of input");
                    for queue in self.queues() {
                        if !self.push(queue, QueueItem::EndOfStream) {
                            break;
                        }
                    }
                    at_eof = true;
                }
                Err(e) if !e.is_fatal() => warn!("Skipping unreadable packet: {}", e),
                Err(e) => {
                    self.ctx.fail(e);
                    return SessionOutcome::Stopped;
                }
            }
        }
    }

    fn route(&self, packet: Packet) {
        let queue = match packet.stream {
            StreamKind::Video => self.ctx.video_queue.as_ref(),
            StreamKind::Audio => self.ctx.audio_queue.as_ref(),
        };
        if let Some(queue) = queue {
            self.push(queue, QueueItem::Packet(packet));
        }
    }

    /// Blocking push that gives up when a seek is posted or the queue closes
    ///
    /// Returns whether the item was queued.
    fn push(&self, queue: &PacketQueue<Packet>, item: QueueItem<Packet>) -> bool {
        let mut item = item;
        loop {
            match queue.push(item) {
                Ok(()) => return true,
                Err(PushError::Closed(_)) => return false,
                Err(PushError::Interrupted(back)) => {
                    if self.ctx.should_quit() || self.take_seek().is_some() {
                        return false;
                    }
                    item = back;
                }
            }
        }
    }

    /// Wait until every output has shown its last frame or sample
    ///
    /// Generations only move in [`flush_pipeline`](Self::flush_pipeline) on
    /// this thread, so they are read once before taking the control lock.
    fn wait_played_out(&self) -> PlayOut {
        let video_generation = self.ctx.frames.as_ref().map(|frames| frames.generation());
        let audio_generation = self.ctx.audio.as_ref().map(|output| output.ring().generation());

        let mut control = self.ctx.control();
        loop {
            if self.ctx.should_quit() {
                return PlayOut::Quit;
            }
            if control.seek.is_some() {
                return PlayOut::Seek;
            }
            let video_done = video_generation.is_none() || control.video_done == video_generation;
            let audio_done = audio_generation.is_none() || control.audio_drained == audio_generation;
            if video_done && audio_done {
                return PlayOut::Done;
            }
            self.ctx.wait(&mut control);
        }
    }

    fn execute_seek(&mut self, request: SeekRequest) {
        let from = self.ctx.clock.now();
        let direction = SeekDirection::between(from, request.target);
        debug!(
            "Seek {} from {} us to {} us ({:?})",
            request.id, from, request.target, direction
        );

        let reply = match self.demuxer.seek(request.target, direction) {
            Ok(()) => {
                self.flush_pipeline(request.target);
                info!("Seeked to {} us", request.target);
                Ok(())
            }
            Err(e) => {
                warn!("Seek to {} us failed: {}", request.target, e);
                Err(match e {
                    PlayerError::SeekFailure(msg) => msg,
                    other => other.to_string(),
                })
            }
        };

        let mut control = self.ctx.control();
        control.seek = None;
        control.seek_result = Some((request.id, reply));
        self.ctx.notify();
    }

    /// Empty every buffer between the demuxer and the outputs, then move the
    /// clock to `target`
    fn flush_pipeline(&self, target: i64) {
        let mut dropped = 0;
        for queue in self.queues() {
            dropped += queue.drain();
        }
        if let Some(frames) = &self.ctx.frames {
            frames.begin_flush();
        }
        if let Some(output) = &self.ctx.audio {
            output.ring().begin_flush();
        }
        self.ctx.seek_floor.store(target, Ordering::Release);
        self.ctx.skip.store(false, Ordering::Release);
        {
            let mut control = self.ctx.control();
            control.flush_acks = 0;
            control.video_done = None;
            control.audio_drained = None;
        }

        let mut expected = 0;
        for queue in self.queues() {
            match queue.push(QueueItem::Flush) {
                Ok(()) => expected += 1,
                Err(PushError::Closed(_)) => return,
                Err(PushError::Interrupted(_)) => warn!("Flush token rejected by a drained queue"),
            }
        }

        let mut control = self.ctx.control();
        while control.flush_acks < expected && !self.ctx.should_quit() {
            self.ctx.wait(&mut control);
        }
        drop(control);

        self.ctx.clock.reset(target);
        debug!("Pipeline flushed ({} packets dropped)", dropped);
    }
}
