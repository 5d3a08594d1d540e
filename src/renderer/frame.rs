//! Renderer thread: paces decoded frames against the master clock
//!
//! Frames are taken from the [`FrameRing`] in order. A frame that is late by
//! more than the lag threshold is dropped and the decoder is asked to skip
//! non-reference pictures until playback catches up. Early frames are waited
//! for on the ring itself: flush, close and resume wake the renderer, and
//! while paused it parks until playback resumes.
//!
//! The sink, the session's clock and a copy of the last presented frame sit
//! behind the [`Display`] lock, which repaint requests take from outside the
//! pipeline.

use crate::audio::{AudioOutputStream, MasterClock};
use crate::decoder::{FrameRing, Packet, PacketQueue, ReadyFrame, RingError};
use crate::renderer::{VideoFrame, VideoSink};
use crate::utils::config::Config;
use crate::utils::error::{PlayerError, Result};
use log::{debug, info, warn};
use parking_lot::Mutex;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

/// Frame statistics
#[derive(Debug, Clone, Default, PartialEq)]
pub struct RenderStats {
    /// Frames presented
    pub frames_rendered: u64,

    /// Frames dropped for being late
    pub frames_dropped: u64,

    /// Times the decoder was switched into fast-skip
    pub skip_episodes: u64,

    /// Times a starved audio clock was resynced to video
    pub deadlock_recoveries: u64,

    /// Presentation time of the last presented frame, in micros
    pub last_frame_time: Option<i64>,
}

/// The output surface and everything external readers need with it
pub struct Display {
    sink: Box<dyn VideoSink>,
    last_frame: Option<VideoFrame>,
    clock: Option<MasterClock>,
}

impl Display {
    /// Wrap a sink
    pub fn new(sink: Box<dyn VideoSink>) -> Self {
        Self {
            sink,
            last_frame: None,
            clock: None,
        }
    }

    /// Select the clock for the session that is starting, or clear it
    pub fn set_clock(&mut self, clock: Option<MasterClock>) {
        self.clock = clock;
    }

    /// The active session's clock
    pub fn clock(&self) -> Option<MasterClock> {
        self.clock.clone()
    }

    /// Blit and present `frame`, keeping a copy for repaints
    pub fn present(&mut self, frame: &VideoFrame) -> Result<()> {
        self.sink.blit(&frame.data, frame.width, frame.height, 0, 0)?;
        self.sink.present()?;
        match self.last_frame.as_mut() {
            Some(last) => last.copy_from(frame),
            None => self.last_frame = Some(frame.clone()),
        }
        Ok(())
    }

    /// Present the last frame again; returns `false` if nothing was rendered
    pub fn repaint(&mut self) -> Result<bool> {
        let Some(frame) = self.last_frame.as_ref() else {
            return Ok(false);
        };
        self.sink.blit(&frame.data, frame.width, frame.height, 0, 0)?;
        self.sink.present()?;
        Ok(true)
    }

    /// The most recently presented frame
    pub fn last_frame(&self) -> Option<&VideoFrame> {
        self.last_frame.as_ref()
    }
}

/// Timing knobs of the renderer
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RendererOptions {
    /// Lag beyond which frames are dropped
    pub late_threshold: Duration,

    /// Waits shorter than this are skipped
    pub min_sleep: Duration,

    /// How long audio must stay starved before the clock is resynced
    pub deadlock_grace: Duration,
}

impl Default for RendererOptions {
    fn default() -> Self {
        Self {
            late_threshold: Duration::from_millis(100),
            min_sleep: Duration::from_millis(2),
            deadlock_grace: Duration::from_millis(250),
        }
    }
}

impl RendererOptions {
    /// Read the renderer settings from the configuration
    pub fn from_config(config: &Config) -> Self {
        Self {
            late_threshold: config.video.late_frame_threshold(),
            min_sleep: Duration::from_millis(config.video.min_sleep_ms),
            deadlock_grace: Duration::from_millis(config.player.deadlock_grace_ms),
        }
    }
}

enum Pace {
    Render,
    Drop,
    Abandon,
}

/// Renderer thread builder
pub struct Renderer {
    ring: Arc<FrameRing>,
    display: Arc<Mutex<Display>>,
    skip: Arc<AtomicBool>,
    options: RendererOptions,
    audio: Option<(Arc<AudioOutputStream>, Arc<PacketQueue<Packet>>)>,
    on_eos: Box<dyn Fn(u64) + Send>,
    quit: Arc<AtomicBool>,
    stats: Arc<Mutex<RenderStats>>,
}

/// Running renderer thread
pub struct RendererHandle {
    ring: Arc<FrameRing>,
    quit: Arc<AtomicBool>,
    stats: Arc<Mutex<RenderStats>>,
    thread: Option<JoinHandle<Result<RenderStats>>>,
}

impl Renderer {
    /// Prepare a renderer for `ring`
    ///
    /// # Arguments
    ///
    /// * `ring` - Source of decoded frames
    /// * `display` - Sink and clock, shared with repaint requests
    /// * `skip` - Fast-skip request flag read by the video decoder
    /// * `options` - Timing thresholds
    pub fn new(
        ring: Arc<FrameRing>,
        display: Arc<Mutex<Display>>,
        skip: Arc<AtomicBool>,
        options: RendererOptions,
    ) -> Self {
        Self {
            ring,
            display,
            skip,
            options,
            audio: None,
            on_eos: Box::new(|_| {}),
            quit: Arc::new(AtomicBool::new(false)),
            stats: Arc::new(Mutex::new(RenderStats::default())),
        }
    }

    /// Watch the audio path for starvation
    pub fn with_audio(mut self, output: Arc<AudioOutputStream>, queue: Arc<PacketQueue<Packet>>) -> Self {
        self.audio = Some((output, queue));
        self
    }

    /// Called with the ring generation once every frame of a stream was shown
    pub fn on_end_of_stream(mut self, callback: impl Fn(u64) + Send + 'static) -> Self {
        self.on_eos = Box::new(callback);
        self
    }

    /// Start the thread
    pub fn spawn(self) -> Result<RendererHandle> {
        let ring = Arc::clone(&self.ring);
        let quit = Arc::clone(&self.quit);
        let stats = Arc::clone(&self.stats);
        let thread = thread::Builder::new()
            .name("video-render".to_string())
            .spawn(move || self.run())?;
        Ok(RendererHandle {
            ring,
            quit,
            stats,
            thread: Some(thread),
        })
    }

    fn run(self) -> Result<RenderStats> {
        info!("Renderer started ({} slots)", self.ring.capacity());
        let mut starved_since = None;
        let mut eos_generation = None;

        while !self.quit.load(Ordering::Acquire) {
            let frame = match self.ring.acquire_read(None) {
                Ok(frame) => frame,
                Err(RingError::Timeout) | Err(RingError::Flushing) => continue,
                Err(RingError::Closed) => break,
                Err(RingError::EndOfStream) => {
                    let generation = self.ring.generation();
                    if eos_generation != Some(generation) {
                        eos_generation = Some(generation);
                        debug!("Renderer reached end of stream");
                        (self.on_eos)(generation);
                    }
                    self.ring.wait_for_flush(generation, None);
                    continue;
                }
            };

            match self.pace(&frame, &mut starved_since) {
                Pace::Render => self.render(&frame),
                Pace::Drop => self.stats.lock().frames_dropped += 1,
                Pace::Abandon => {}
            }
            self.ring.release(frame);
        }

        let stats = self.stats.lock().clone();
        info!(
            "Renderer stopped: {} rendered, {} dropped",
            stats.frames_rendered, stats.frames_dropped
        );
        Ok(stats)
    }

    fn render(&self, frame: &ReadyFrame) {
        if let Err(e) = self.display.lock().present(frame) {
            warn!("Video sink rejected frame: {}", e);
            return;
        }
        let mut stats = self.stats.lock();
        stats.frames_rendered += 1;
        stats.last_frame_time = Some(frame.presentation_time());
    }

    /// Wait until `frame` is due, or decide to drop it
    fn pace(&self, frame: &ReadyFrame, starved_since: &mut Option<Instant>) -> Pace {
        let frame_time = frame.presentation_time();
        let Some(clock) = self.display.lock().clock() else {
            return Pace::Render;
        };
        clock.on_frame(frame_time);

        let late_threshold = self.options.late_threshold.as_micros() as i64;
        let min_sleep = self.options.min_sleep.as_micros() as i64;

        loop {
            if self.quit.load(Ordering::Acquire) || self.ring.generation() != frame.generation() {
                return Pace::Abandon;
            }

            let lag = clock.now() - frame_time;
            if lag > late_threshold {
                if !self.skip.swap(true, Ordering::AcqRel) {
                    self.stats.lock().skip_episodes += 1;
                    debug!("Video {} ms behind, decoder skipping", lag / 1000);
                }
                return Pace::Drop;
            }
            if -lag < min_sleep {
                if self.skip.swap(false, Ordering::AcqRel) {
                    debug!("Video caught up with the clock");
                }
                *starved_since = None;
                return Pace::Render;
            }

            let mut wait = Duration::from_micros((-lag) as u64);
            if self.audio_starved() {
                let starved_for = starved_since.get_or_insert_with(Instant::now).elapsed();
                if starved_for >= self.options.deadlock_grace {
                    warn!(
                        "Audio starved for {} ms while video waits, resyncing clock to {} us",
                        starved_for.as_millis(),
                        frame_time
                    );
                    clock.resync(frame_time);
                    self.stats.lock().deadlock_recoveries += 1;
                    *starved_since = None;
                    return Pace::Render;
                }
                wait = wait.min(self.options.deadlock_grace - starved_for);
            } else {
                *starved_since = None;
            }

            self.ring.wait_until_due(frame.generation(), wait);
        }
    }

    fn audio_starved(&self) -> bool {
        match &self.audio {
            Some((output, queue)) => queue.is_empty() && output.is_starved(),
            None => false,
        }
    }
}

impl RendererHandle {
    /// Live statistics
    pub fn stats(&self) -> RenderStats {
        self.stats.lock().clone()
    }

    /// Ask the thread to exit and join it
    ///
    /// Closes the ring so a renderer blocked on it wakes up.
    pub fn stop(&mut self) -> Result<RenderStats> {
        self.quit.store(true, Ordering::Release);
        self.ring.close();
        match self.thread.take() {
            Some(thread) => thread
                .join()
                .map_err(|_| PlayerError::Internal("renderer thread panicked".to_string()))?,
            None => Ok(self.stats()),
        }
    }
}

impl Drop for RendererHandle {
    fn drop(&mut self) {
        if self.thread.is_some() {
            if let Err(e) = self.stop() {
                warn!("Renderer shut down with error: {}", e);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::audio::{NullDevice, SystemClock};
    use crate::decoder::Rational;

    /// Sink recording the pts of every presented frame
    #[derive(Clone, Default)]
    struct Recorder(Arc<Mutex<Vec<i64>>>);

    struct RecordingSink {
        recorder: Recorder,
        pending: Option<i64>,
    }

    impl VideoSink for RecordingSink {
        fn blit(&mut self, pixels: &[u8], width: u32, height: u32, _x: i32, _y: i32) -> Result<()> {
            assert_eq!(pixels.len(), (width * height * 4) as usize);
            self.pending = Some(pixels[0] as i64);
            Ok(())
        }

        fn present(&mut self) -> Result<()> {
            if let Some(tag) = self.pending.take() {
                self.recorder.0.lock().push(tag);
            }
            Ok(())
        }
    }

    fn display(recorder: &Recorder) -> Arc<Mutex<Display>> {
        Arc::new(Mutex::new(Display::new(Box::new(RecordingSink {
            recorder: recorder.clone(),
            pending: None,
        }))))
    }

    /// Queue a frame tagged with `tag` in its first byte, due at `millis`
    fn queue_frame(ring: &FrameRing, tag: u8, millis: i64) {
        let mut slot = ring.acquire_write().unwrap();
        slot.fill([tag, 0, 0, 255]);
        slot.time_base = Rational::new(1, 1000);
        slot.pts = millis;
        assert!(ring.commit(slot));
    }

    fn wait_for<F: Fn() -> bool>(condition: F) {
        let deadline = Instant::now() + Duration::from_secs(5);
        while !condition() {
            assert!(Instant::now() < deadline, "condition not reached in time");
            thread::sleep(Duration::from_millis(2));
        }
    }

    #[test]
    fn test_renders_in_order_and_keeps_last_frame() {
        let ring = Arc::new(FrameRing::new(4, 2, 2));
        let recorder = Recorder::default();
        let display = display(&recorder);
        display
            .lock()
            .set_clock(Some(MasterClock::System(Arc::new(SystemClock::new()))));

        queue_frame(&ring, 1, 0);
        queue_frame(&ring, 2, 20);
        queue_frame(&ring, 3, 40);

        let skip = Arc::new(AtomicBool::new(false));
        let mut handle = Renderer::new(Arc::clone(&ring), Arc::clone(&display), skip, RendererOptions::default())
            .spawn()
            .unwrap();

        wait_for(|| recorder.0.lock().len() == 3);
        let stats = handle.stop().unwrap();
        assert_eq!(*recorder.0.lock(), vec![1, 2, 3]);
        assert_eq!(stats.frames_rendered, 3);
        assert_eq!(stats.last_frame_time, Some(40_000));

        assert!(display.lock().repaint().unwrap());
        assert_eq!(recorder.0.lock().last(), Some(&3));
    }

    #[test]
    fn test_late_frames_are_dropped_and_request_skip() {
        let ring = Arc::new(FrameRing::new(4, 2, 2));
        let recorder = Recorder::default();
        let display = display(&recorder);
        let clock = Arc::new(SystemClock::new());
        clock.reset(1_000_000);
        display.lock().set_clock(Some(MasterClock::System(clock)));

        queue_frame(&ring, 1, 500);
        queue_frame(&ring, 2, 1000);

        let skip = Arc::new(AtomicBool::new(false));
        let mut handle = Renderer::new(
            Arc::clone(&ring),
            display,
            Arc::clone(&skip),
            RendererOptions::default(),
        )
        .spawn()
        .unwrap();

        wait_for(|| recorder.0.lock().len() == 1);
        let stats = handle.stop().unwrap();
        assert_eq!(*recorder.0.lock(), vec![2]);
        assert_eq!(stats.frames_dropped, 1);
        assert_eq!(stats.skip_episodes, 1);
        // the on-time frame cleared the request again
        assert!(!skip.load(Ordering::Acquire));
    }

    #[test]
    fn test_reports_end_of_stream_once_per_generation() {
        let ring = Arc::new(FrameRing::new(2, 2, 2));
        let recorder = Recorder::default();
        let display = display(&recorder);
        display
            .lock()
            .set_clock(Some(MasterClock::System(Arc::new(SystemClock::new()))));
        queue_frame(&ring, 1, 0);
        ring.mark_eos();

        let reports = Arc::new(Mutex::new(Vec::new()));
        let mut handle = {
            let reports = Arc::clone(&reports);
            Renderer::new(
                Arc::clone(&ring),
                display,
                Arc::new(AtomicBool::new(false)),
                RendererOptions::default(),
            )
            .on_end_of_stream(move |generation| reports.lock().push(generation))
            .spawn()
            .unwrap()
        };

        wait_for(|| reports.lock().len() == 1);
        thread::sleep(Duration::from_millis(60));
        assert_eq!(*reports.lock(), vec![0]);

        ring.flush();
        ring.mark_eos();
        wait_for(|| reports.lock().len() == 2);
        handle.stop().unwrap();
        assert_eq!(*reports.lock(), vec![0, 1]);
    }

    #[test]
    fn test_starved_audio_clock_is_resynced() {
        let ring = Arc::new(FrameRing::new(2, 2, 2));
        let recorder = Recorder::default();
        let display = display(&recorder);

        // audio never gets data, so its clock stays frozen at zero
        let output = Arc::new(AudioOutputStream::new(
            Box::new(NullDevice::new(Default::default())),
            Default::default(),
        ));
        output.latch(0);
        display.lock().set_clock(Some(MasterClock::Audio(Arc::clone(&output))));
        let queue = Arc::new(PacketQueue::new(1));

        queue_frame(&ring, 7, 5_000);
        let options = RendererOptions {
            deadlock_grace: Duration::from_millis(30),
            ..RendererOptions::default()
        };
        let mut handle = Renderer::new(Arc::clone(&ring), display, Arc::new(AtomicBool::new(false)), options)
            .with_audio(Arc::clone(&output), queue)
            .spawn()
            .unwrap();

        wait_for(|| recorder.0.lock().len() == 1);
        let stats = handle.stop().unwrap();
        assert_eq!(stats.deadlock_recoveries, 1);
        assert!(output.now() >= 5_000_000);
    }

    #[test]
    fn test_paused_renderer_holds_early_frame() {
        let ring = Arc::new(FrameRing::new(2, 2, 2));
        let recorder = Recorder::default();
        let display = display(&recorder);
        let clock = Arc::new(SystemClock::new());
        clock.reset(0);
        clock.pause();
        ring.set_paused(true);
        display.lock().set_clock(Some(MasterClock::System(Arc::clone(&clock))));

        queue_frame(&ring, 4, 50);
        let mut handle = Renderer::new(
            Arc::clone(&ring),
            display,
            Arc::new(AtomicBool::new(false)),
            RendererOptions::default(),
        )
        .spawn()
        .unwrap();

        thread::sleep(Duration::from_millis(150));
        assert!(recorder.0.lock().is_empty());

        clock.resume();
        ring.set_paused(false);
        wait_for(|| recorder.0.lock().len() == 1);
        let stats = handle.stop().unwrap();
        assert_eq!(stats.frames_rendered, 1);
        assert_eq!(stats.frames_dropped, 0);
    }

    #[test]
    fn test_repaint_without_frames() {
        let recorder = Recorder::default();
        let display = display(&recorder);
        assert!(!display.lock().repaint().unwrap());
    }
}
