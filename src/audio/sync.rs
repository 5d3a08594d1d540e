//! Master clock selection for A/V synchronization
//!
//! A session paces video against exactly one clock, chosen when the session
//! starts: the audio device clock when an audio stream plays, otherwise a
//! monotonic system clock latched to the first rendered frame.

use crate::audio::AudioOutputStream;
use parking_lot::Mutex;
use std::sync::Arc;
use std::time::Instant;

/// The session's single time source, in microseconds
#[derive(Clone)]
pub enum MasterClock {
    /// Derived from the audio device's hardware timestamps
    Audio(Arc<AudioOutputStream>),

    /// Monotonic clock referenced to a video frame timestamp
    System(Arc<SystemClock>),
}

impl MasterClock {
    /// Current playback position
    pub fn now(&self) -> i64 {
        match self {
            MasterClock::Audio(output) => output.now(),
            MasterClock::System(clock) => clock.now(),
        }
    }

    /// Jump to `target` after a seek
    pub fn reset(&self, target: i64) {
        match self {
            MasterClock::Audio(output) => output.reset_clock(target),
            MasterClock::System(clock) => clock.reset(target),
        }
    }

    /// Move the clock so it reads `target` now, without touching the device
    pub fn resync(&self, target: i64) {
        match self {
            MasterClock::Audio(output) => output.resync(target),
            MasterClock::System(clock) => clock.resync(target),
        }
    }

    /// Freeze the clock
    pub fn pause(&self) {
        match self {
            MasterClock::Audio(output) => output.pause(),
            MasterClock::System(clock) => clock.pause(),
        }
    }

    /// Unfreeze the clock
    pub fn resume(&self) {
        match self {
            MasterClock::Audio(output) => output.resume(),
            MasterClock::System(clock) => clock.resume(),
        }
    }

    /// Called by the renderer before it paces a frame due at `frame_time`
    ///
    /// The system clock latches to the first frame and starts running; the
    /// audio clock is driven by the device and ignores this.
    pub fn on_frame(&self, frame_time: i64) {
        if let MasterClock::System(clock) = self {
            clock.start_at(frame_time);
        }
    }

    /// Whether the audio device drives this clock
    pub fn is_audio(&self) -> bool {
        matches!(self, MasterClock::Audio(_))
    }

    /// Short name for logs
    pub fn kind(&self) -> &'static str {
        match self {
            MasterClock::Audio(_) => "audio",
            MasterClock::System(_) => "system",
        }
    }
}

struct SystemClockState {
    base: i64,
    running_since: Option<Instant>,
    latched: bool,
    paused: bool,
}

/// Monotonic clock used when a session has no audio
pub struct SystemClock {
    state: Mutex<SystemClockState>,
}

impl Default for SystemClock {
    fn default() -> Self {
        Self::new()
    }
}

impl SystemClock {
    /// A stopped clock that latches to the first frame it sees
    pub fn new() -> Self {
        Self {
            state: Mutex::new(SystemClockState {
                base: 0,
                running_since: None,
                latched: false,
                paused: false,
            }),
        }
    }

    /// Current position in microseconds
    pub fn now(&self) -> i64 {
        let state = self.state.lock();
        Self::now_locked(&state)
    }

    fn now_locked(state: &SystemClockState) -> i64 {
        match state.running_since {
            Some(since) => state.base + since.elapsed().as_micros() as i64,
            None => state.base,
        }
    }

    /// Latch to `frame_time` if nothing was latched yet, then start running
    /// unless paused
    pub fn start_at(&self, frame_time: i64) {
        let mut state = self.state.lock();
        if !state.latched {
            state.base = frame_time;
            state.latched = true;
        }
        if !state.paused && state.running_since.is_none() {
            state.running_since = Some(Instant::now());
        }
    }

    /// Freeze at the current position
    pub fn pause(&self) {
        let mut state = self.state.lock();
        state.base = Self::now_locked(&state);
        state.running_since = None;
        state.paused = true;
    }

    /// Re-latch the reference instant and continue from the frozen position
    pub fn resume(&self) {
        let mut state = self.state.lock();
        state.paused = false;
        if state.latched && state.running_since.is_none() {
            state.running_since = Some(Instant::now());
        }
    }

    /// Stop at `target`; the renderer restarts the clock on its next frame
    pub fn reset(&self, target: i64) {
        let mut state = self.state.lock();
        state.base = target;
        state.latched = true;
        state.running_since = None;
    }

    /// Read `target` now, keeping the running state
    pub fn resync(&self, target: i64) {
        let mut state = self.state.lock();
        state.base = target;
        state.latched = true;
        if state.running_since.is_some() {
            state.running_since = Some(Instant::now());
        }
    }

    /// Whether the clock is advancing
    pub fn is_running(&self) -> bool {
        self.state.lock().running_since.is_some()
    }
}
