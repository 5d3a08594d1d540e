//! Session wiring and shared control state
//!
//! A [`SessionContext`] is shared by every thread of one session. It carries
//! the quit flag, the buffers, the master clock and the small control state
//! (pending seek, flush acknowledgements, end-of-stream reports) guarded by
//! one mutex and condition variable.

use crate::audio::{AudioHost, AudioOutputStream, AudioParams, MasterClock, SystemClock};
use crate::decoder::{FrameRing, MediaInfo, OpenedMedia, Packet, PacketQueue};
use crate::player::controller::{DemuxerController, SessionOutcome};
use crate::player::state::SupervisorEvent;
use crate::renderer::{Display, Renderer, RendererHandle, RendererOptions};
use crate::utils::config::Config;
use crate::utils::error::{PlayerError, Result};
use crossbeam_channel::Sender;
use log::{debug, info, warn};
use parking_lot::{Condvar, Mutex, MutexGuard};
use std::sync::atomic::{AtomicBool, AtomicI64, AtomicU64, Ordering};
use std::sync::{Arc, Weak};
use std::thread::{self, JoinHandle};

/// Stand-in for "no timestamp" in atomics
pub(crate) const NO_PTS: i64 = i64::MIN;

/// A seek posted by the facade
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) struct SeekRequest {
    pub id: u64,
    pub target: i64,
}

#[derive(Default)]
pub(crate) struct ControlState {
    pub seek: Option<SeekRequest>,
    pub seek_result: Option<(u64, std::result::Result<(), String>)>,
    pub next_seek_id: u64,
    pub flush_acks: usize,
    /// Ring generation the renderer reported as fully shown
    pub video_done: Option<u64>,
    /// PCM ring generation the audio IO thread reported as played out
    pub audio_drained: Option<u64>,
    pub failure: Option<PlayerError>,
}

/// State shared by the threads of one session
pub(crate) struct SessionContext {
    pub id: u64,
    quit: AtomicBool,
    stop_requested: AtomicBool,
    control: Mutex<ControlState>,
    changed: Condvar,

    pub video_queue: Option<Arc<PacketQueue<Packet>>>,
    pub audio_queue: Option<Arc<PacketQueue<Packet>>>,
    pub frames: Option<Arc<FrameRing>>,
    pub audio: Option<Arc<AudioOutputStream>>,
    pub clock: MasterClock,
    pub skip: Arc<AtomicBool>,

    /// Output time before which decoders discard what they produce
    pub seek_floor: AtomicI64,
    /// Presentation time of the last decoded picture
    pub decoder_pts: AtomicI64,
    pub decode_errors: AtomicU64,
}

impl SessionContext {
    /// Shared state over the given buffers; the caller wires hooks
    pub fn new(
        id: u64,
        video_queue: Option<Arc<PacketQueue<Packet>>>,
        audio_queue: Option<Arc<PacketQueue<Packet>>>,
        frames: Option<Arc<FrameRing>>,
        audio: Option<Arc<AudioOutputStream>>,
        clock: MasterClock,
    ) -> Self {
        Self {
            id,
            quit: AtomicBool::new(false),
            stop_requested: AtomicBool::new(false),
            control: Mutex::new(ControlState::default()),
            changed: Condvar::new(),
            video_queue,
            audio_queue,
            frames,
            audio,
            clock,
            skip: Arc::new(AtomicBool::new(false)),
            seek_floor: AtomicI64::new(NO_PTS),
            decoder_pts: AtomicI64::new(NO_PTS),
            decode_errors: AtomicU64::new(0),
        }
    }

    /// Whether the session is being torn down
    pub fn should_quit(&self) -> bool {
        self.quit.load(Ordering::Acquire)
    }

    /// Whether the facade stopped the session on purpose
    pub fn stop_requested(&self) -> bool {
        self.stop_requested.load(Ordering::Acquire)
    }

    pub fn control(&self) -> MutexGuard<'_, ControlState> {
        self.control.lock()
    }

    /// Block on the control condvar until another thread signals it
    pub fn wait(&self, guard: &mut MutexGuard<'_, ControlState>) {
        self.changed.wait(guard);
    }

    pub fn notify(&self) {
        self.changed.notify_all();
    }

    /// Set the quit flag and wake every blocked thread
    pub fn cancel(&self) {
        if self.quit.swap(true, Ordering::AcqRel) {
            return;
        }
        debug!("Session {} cancelled", self.id);
        for queue in [&self.video_queue, &self.audio_queue].into_iter().flatten() {
            queue.close();
        }
        if let Some(frames) = &self.frames {
            frames.close();
        }
        if let Some(audio) = &self.audio {
            audio.ring().close();
        }
        let _guard = self.control.lock();
        self.changed.notify_all();
    }

    /// Route audio device failures and play-out reports into this session
    pub fn attach_audio_hooks(self: &Arc<Self>) {
        let Some(output) = &self.audio else {
            return;
        };
        let weak: Weak<SessionContext> = Arc::downgrade(self);
        output.set_fatal_hook(move |err| {
            if let Some(ctx) = weak.upgrade() {
                ctx.fail(err);
            }
        });
        let weak: Weak<SessionContext> = Arc::downgrade(self);
        output.ring().set_drained_hook(move |generation| {
            if let Some(ctx) = weak.upgrade() {
                ctx.audio_finished(generation);
            }
        });
    }

    /// Freeze the clock and park the renderer
    pub fn pause(&self) {
        self.clock.pause();
        if let Some(frames) = &self.frames {
            frames.set_paused(true);
        }
    }

    /// Let the clock and the renderer run again
    pub fn resume(&self) {
        self.clock.resume();
        if let Some(frames) = &self.frames {
            frames.set_paused(false);
        }
    }

    /// Cancel on behalf of the facade
    pub fn request_stop(&self) {
        self.stop_requested.store(true, Ordering::Release);
        self.cancel();
    }

    /// Record a fatal error and tear the session down; the first error wins
    pub fn fail(&self, error: PlayerError) {
        {
            let mut control = self.control.lock();
            if control.failure.is_none() && !self.should_quit() {
                log::error!("Session {} failed: {}", self.id, error);
                control.failure = Some(error);
            }
        }
        self.cancel();
    }

    /// Called by a decoder once it has flushed
    pub fn ack_flush(&self) {
        let mut control = self.control.lock();
        control.flush_acks += 1;
        self.changed.notify_all();
    }

    /// Called by the renderer once every frame of `generation` was shown
    pub fn video_finished(&self, generation: u64) {
        let mut control = self.control.lock();
        control.video_done = Some(generation);
        self.changed.notify_all();
    }

    /// Called by the audio IO thread once every sample of `generation` played
    pub fn audio_finished(&self, generation: u64) {
        let mut control = self.control.lock();
        control.audio_drained = Some(generation);
        self.changed.notify_all();
    }

    /// Post a seek and block until the controller has executed it
    pub fn request_seek(&self, target: i64) -> Result<()> {
        let mut control = self.control.lock();
        while control.seek.is_some() && !self.should_quit() {
            self.changed.wait(&mut control);
        }
        if self.should_quit() {
            return Err(PlayerError::Interrupted);
        }

        control.next_seek_id += 1;
        let id = control.next_seek_id;
        control.seek = Some(SeekRequest { id, target });
        // wake a controller blocked on a full queue
        for queue in [&self.video_queue, &self.audio_queue].into_iter().flatten() {
            queue.interrupt();
        }
        self.changed.notify_all();
        debug!("Seek {} to {} us posted", id, target);

        loop {
            if let Some((done, _)) = &control.seek_result {
                if *done == id {
                    let (_, result) = control.seek_result.take().unwrap_or((id, Ok(())));
                    return result.map_err(PlayerError::SeekFailure);
                }
            }
            if self.should_quit() {
                return Err(PlayerError::Interrupted);
            }
            self.changed.wait(&mut control);
        }
    }

    pub fn has_video(&self) -> bool {
        self.frames.is_some()
    }

    pub fn has_audio(&self) -> bool {
        self.audio.is_some()
    }

    /// Last decoded picture time
    pub fn decoder_pts(&self) -> Option<i64> {
        match self.decoder_pts.load(Ordering::Relaxed) {
            NO_PTS => None,
            pts => Some(pts),
        }
    }
}

/// Components a session is built from, owned by the facade
pub(crate) struct Wiring<'a> {
    pub config: &'a Config,
    pub audio_host: &'a dyn AudioHost,
    pub display: &'a Arc<Mutex<Display>>,
    pub events: Sender<SupervisorEvent>,
}

/// One running media session
pub(crate) struct Session {
    pub ctx: Arc<SessionContext>,
    pub info: Arc<MediaInfo>,
    pub locator: String,
    pub title: Option<String>,
    display: Arc<Mutex<Display>>,
    renderer_options: RendererOptions,
    prebuffer_frames: usize,
    prebuffer_audio_frames: usize,
    controller: Option<JoinHandle<SessionOutcome>>,
    renderer: Option<RendererHandle>,
}

impl Session {
    /// Build the pipeline for `opened` and start the controller
    ///
    /// Outputs stay idle until [`start_outputs`](Self::start_outputs).
    pub fn start(id: u64, locator: &str, title: Option<String>, opened: OpenedMedia, wiring: Wiring<'_>) -> Result<Self> {
        let OpenedMedia {
            info,
            demuxer,
            video,
            audio,
        } = opened;
        let config = wiring.config;

        let mut audio_decoder = audio.filter(|_| config.audio.enabled);
        let params = AudioParams::from_config(&config.audio);
        let output = match audio_decoder.as_ref() {
            Some(_) => match wiring.audio_host.open(&params) {
                Ok(device) => Some(Arc::new(AudioOutputStream::new(device, params))),
                Err(e) if video.is_some() => {
                    warn!("Audio device unavailable, playing video only: {}", e);
                    audio_decoder = None;
                    None
                }
                Err(e) => return Err(e),
            },
            None => None,
        };
        if video.is_none() && audio_decoder.is_none() {
            return Err(PlayerError::NoStreams(format!("{} has no decodable stream", locator)));
        }

        let frames = video.as_ref().map(|_| {
            Arc::new(FrameRing::new(
                config.video.frame_ring_capacity,
                config.video.width,
                config.video.height,
            ))
        });
        let clock = match &output {
            Some(output) => MasterClock::Audio(Arc::clone(output)),
            None => MasterClock::System(Arc::new(SystemClock::new())),
        };

        let ctx = Arc::new(SessionContext::new(
            id,
            video
                .as_ref()
                .map(|_| Arc::new(PacketQueue::new(config.video.packet_queue_capacity))),
            audio_decoder
                .as_ref()
                .map(|_| Arc::new(PacketQueue::new(config.audio.packet_queue_capacity))),
            frames,
            output,
            clock.clone(),
        ));
        ctx.attach_audio_hooks();

        info!(
            "Session {} opened {} (video: {}, audio: {}, clock: {})",
            id,
            locator,
            ctx.has_video(),
            ctx.has_audio(),
            clock.kind()
        );
        wiring.display.lock().set_clock(Some(clock));

        let controller = DemuxerController::new(
            Arc::clone(&ctx),
            demuxer,
            video,
            audio_decoder,
            config.audio.max_buffered_ms,
        );
        let events = wiring.events;
        let controller_ctx = Arc::clone(&ctx);
        let handle = thread::Builder::new()
            .name("demuxer".to_string())
            .spawn(move || {
                let outcome = controller.run();
                let _ = events.send(SupervisorEvent::SessionEnded { id: controller_ctx.id });
                outcome
            });
        let handle = match handle {
            Ok(handle) => handle,
            Err(e) => {
                ctx.cancel();
                wiring.display.lock().set_clock(None);
                return Err(e.into());
            }
        };

        Ok(Self {
            ctx,
            info: Arc::new(info),
            locator: locator.to_string(),
            title,
            display: Arc::clone(wiring.display),
            renderer_options: RendererOptions::from_config(config),
            prebuffer_frames: config.player.prebuffer_frames,
            prebuffer_audio_frames: params.micros_to_frames(config.player.prebuffer_audio_ms as i64 * 1000) as usize,
            controller: Some(handle),
            renderer: None,
        })
    }

    /// Block until the buffers reach their prebuffer target
    ///
    /// `progress` receives a percentage whenever the fill level changes. Returns
    /// `Interrupted` when the session is cancelled first, or the session's
    /// failure when it dies while buffering.
    pub fn wait_buffered(ctx: &SessionContext, targets: BufferTargets, mut progress: impl FnMut(u8)) -> Result<()> {
        let mut seen = None;
        loop {
            if ctx.should_quit() {
                return Err(ctx.control().failure.clone().unwrap_or(PlayerError::Interrupted));
            }

            let (filled, target, finished) = match (&ctx.frames, &ctx.audio) {
                (Some(frames), _) => {
                    let target = targets.frames.clamp(1, frames.capacity());
                    let filled = frames.wait_fill(target, seen);
                    (filled, target, frames.is_eos())
                }
                (None, Some(audio)) => {
                    let ring = audio.ring();
                    let target = targets.audio_frames.max(1);
                    let filled = ring.wait_fill(target, seen);
                    (filled, target, ring.is_drained() || ring.lock().eos)
                }
                (None, None) => return Ok(()),
            };

            seen = Some(filled);
            let percent = ((filled.min(target) * 100) / target) as u8;
            progress(percent);
            if filled >= target || finished {
                progress(100);
                return Ok(());
            }
        }
    }

    /// Prebuffer targets of this session
    pub fn buffer_targets(&self) -> BufferTargets {
        BufferTargets {
            frames: self.prebuffer_frames,
            audio_frames: self.prebuffer_audio_frames,
        }
    }

    /// Current fill relative to the prebuffer target, 0 to 100
    pub fn fill_percent(&self) -> u8 {
        let targets = self.buffer_targets();
        let (filled, target) = match (&self.ctx.frames, &self.ctx.audio) {
            (Some(frames), _) => (frames.len(), targets.frames.clamp(1, frames.capacity())),
            (None, Some(audio)) => (audio.ring().accumulated_frames(), targets.audio_frames.max(1)),
            (None, None) => return 0,
        };
        ((filled.min(target) * 100) / target) as u8
    }

    /// Start the renderer and the audio IO thread
    pub fn start_outputs(&mut self) -> Result<()> {
        if let Some(frames) = &self.ctx.frames {
            let mut renderer = Renderer::new(
                Arc::clone(frames),
                Arc::clone(&self.display),
                Arc::clone(&self.ctx.skip),
                self.renderer_options,
            );
            if let (Some(audio), Some(queue)) = (&self.ctx.audio, &self.ctx.audio_queue) {
                renderer = renderer.with_audio(Arc::clone(audio), Arc::clone(queue));
            }
            let weak = Arc::downgrade(&self.ctx);
            renderer = renderer.on_end_of_stream(move |generation| {
                if let Some(ctx) = weak.upgrade() {
                    ctx.video_finished(generation);
                }
            });
            self.renderer = Some(renderer.spawn()?);
        }
        if let Some(audio) = &self.ctx.audio {
            audio.start()?;
        }
        debug!("Session {} outputs started", self.ctx.id);
        Ok(())
    }

    /// Whether the controller thread has returned
    pub fn is_finished(&self) -> bool {
        self.controller.as_ref().map_or(true, |c| c.is_finished())
    }

    /// Renderer counters, when a renderer runs
    pub fn render_stats(&self) -> Option<crate::renderer::RenderStats> {
        self.renderer.as_ref().map(|r| r.stats())
    }

    /// Cancel and join demuxer, decoders and outputs, in that order
    pub fn teardown(mut self) -> SessionOutcome {
        self.ctx.cancel();
        let outcome = match self.controller.take().map(|c| c.join()) {
            Some(Ok(outcome)) => outcome,
            Some(Err(_)) => SessionOutcome::Failed(PlayerError::Internal("demuxer thread panicked".to_string())),
            None => SessionOutcome::Stopped,
        };

        if let Some(mut renderer) = self.renderer.take() {
            match renderer.stop() {
                Ok(stats) => debug!(
                    "Renderer finished: {} rendered, {} dropped",
                    stats.frames_rendered, stats.frames_dropped
                ),
                Err(e) => warn!("Renderer stopped with error: {}", e),
            }
        }
        if let Some(audio) = &self.ctx.audio {
            if let Err(e) = audio.shutdown() {
                warn!("Audio output stopped with error: {}", e);
            }
        }
        self.display.lock().set_clock(None);
        info!("Session {} closed: {:?}", self.ctx.id, outcome);
        outcome
    }
}

/// Fill levels that end buffering
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) struct BufferTargets {
    pub frames: usize,
    pub audio_frames: usize,
}

impl Drop for Session {
    fn drop(&mut self) {
        if self.controller.is_some() {
            self.ctx.cancel();
            if let Some(controller) = self.controller.take() {
                let _ = controller.join();
            }
            if let Some(mut renderer) = self.renderer.take() {
                let _ = renderer.stop();
            }
            if let Some(audio) = &self.ctx.audio {
                let _ = audio.shutdown();
            }
        }
    }
}
