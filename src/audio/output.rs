//! Audio output stream: device IO thread and audio master clock
//!
//! The IO thread moves PCM from the [`AudioRingBuffer`] into the device, at
//! most half the hardware buffer per write. The clock is derived from the
//! device's trigger and hardware timestamps plus `clock_offset`, and freezes
//! while paused, before the device starts and during an underrun.
//!
//! Lock order is ring state, then device. The IO thread holds both while a
//! nonblocking write is in progress, so flushes and clock resets never race
//! with a half-finished write.

use crate::audio::ring_buffer::RingState;
use crate::audio::{AudioDevice, AudioParams, AudioRingBuffer, DeviceError, DeviceState, HwParams};
use crate::utils::error::{PlayerError, Result};
use log::{debug, error, info, warn};
use parking_lot::{Mutex, MutexGuard};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

type FatalHook = Box<dyn Fn(PlayerError) + Send + Sync>;

/// Counters kept by the IO thread
#[derive(Debug, Clone, Default, PartialEq)]
pub struct OutputStats {
    /// Frames accepted by the device
    pub frames_written: u64,

    /// Number of write attempts rejected with `WouldBlock`
    pub backoffs: u64,

    /// Duration of the most recent `WouldBlock` back-off
    pub last_backoff: Duration,

    /// Underruns recovered
    pub xruns: u64,

    /// Other recoverable errors (interrupted, suspended)
    pub recoveries: u64,
}

struct Shared {
    ring: Arc<AudioRingBuffer>,
    device: Mutex<Box<dyn AudioDevice>>,
    params: AudioParams,
    hw: HwParams,
    stats: Mutex<OutputStats>,
    on_fatal: Mutex<Option<FatalHook>>,
}

/// Owns the audio device, the PCM ring and the IO thread
pub struct AudioOutputStream {
    shared: Arc<Shared>,
    io_thread: Mutex<Option<JoinHandle<Result<()>>>>,
}

impl AudioOutputStream {
    /// Wrap an opened device; the IO thread starts with [`start`](Self::start)
    pub fn new(device: Box<dyn AudioDevice>, params: AudioParams) -> Self {
        let hw = device.hw_params();
        Self {
            shared: Arc::new(Shared {
                ring: Arc::new(AudioRingBuffer::new(params.channels)),
                device: Mutex::new(device),
                params,
                hw,
                stats: Mutex::new(OutputStats::default()),
                on_fatal: Mutex::new(None),
            }),
            io_thread: Mutex::new(None),
        }
    }

    /// The PCM queue fed by the audio decoder
    pub fn ring(&self) -> &Arc<AudioRingBuffer> {
        &self.shared.ring
    }

    /// Output format
    pub fn params(&self) -> &AudioParams {
        &self.shared.params
    }

    /// Register the callback run when the device fails for good
    pub fn set_fatal_hook(&self, hook: impl Fn(PlayerError) + Send + Sync + 'static) {
        *self.shared.on_fatal.lock() = Some(Box::new(hook));
    }

    /// Spawn the IO thread
    pub fn start(&self) -> Result<()> {
        let mut slot = self.io_thread.lock();
        if slot.is_some() {
            return Ok(());
        }
        let shared = Arc::clone(&self.shared);
        let handle = thread::Builder::new()
            .name("audio-io".to_string())
            .spawn(move || shared.run())?;
        *slot = Some(handle);
        Ok(())
    }

    /// Whether the IO thread was started
    pub fn is_started(&self) -> bool {
        self.io_thread.lock().is_some()
    }

    /// Close the ring and join the IO thread
    pub fn shutdown(&self) -> Result<()> {
        self.shared.ring.close();
        let handle = self.io_thread.lock().take();
        match handle {
            Some(handle) => handle
                .join()
                .map_err(|_| PlayerError::Internal("audio IO thread panicked".to_string()))?,
            None => Ok(()),
        }
    }

    /// Current audio clock in microseconds
    pub fn now(&self) -> i64 {
        let mut state = self.shared.ring.lock();
        self.shared.now_locked(&mut state)
    }

    /// Latch the clock to the first decoded timestamp of the session
    pub fn latch(&self, pts: i64) -> bool {
        let mut state = self.shared.ring.lock();
        if state.latched {
            return false;
        }
        Shared::set_clock(&mut state, pts);
        state.latched = true;
        debug!("Audio clock latched at {} us", pts);
        true
    }

    /// Drop queued PCM and reset the device
    pub fn flush(&self) -> usize {
        let mut state = self.shared.ring.lock();
        let discarded = AudioRingBuffer::clear_locked(&mut state);
        if let Err(e) = self.shared.device.lock().reset() {
            warn!("Audio device reset during flush failed: {}", e);
        }
        self.shared.ring.notify();
        discarded
    }

    /// Set the clock to `target` after a seek; the device restarts from there
    pub fn reset_clock(&self, target: i64) {
        let mut state = self.shared.ring.lock();
        if let Err(e) = self.shared.device.lock().reset() {
            warn!("Audio device reset failed: {}", e);
        }
        Shared::set_clock(&mut state, target);
        state.latched = true;
        self.shared.ring.notify();
    }

    /// Move the running clock so that it reads `target` now
    pub fn resync(&self, target: i64) {
        let mut state = self.shared.ring.lock();
        let current = self.shared.now_locked(&mut state);
        let delta = target - current;
        state.clock_offset += delta;
        state.xrun_time += delta;
        state.last_known_time = target;
    }

    /// Freeze the clock and silence the device
    pub fn pause(&self) {
        let mut state = self.shared.ring.lock();
        if state.paused {
            return;
        }
        let frozen = self.shared.now_locked(&mut state);
        let status = {
            let mut device = self.shared.device.lock();
            let status = device.status();
            if let Err(e) = device.reset() {
                warn!("Audio device reset on pause failed: {}", e);
            }
            status
        };

        // samples still queued in hardware are dropped, so playback resumes
        // that far ahead of the frozen clock
        state.pause_skew = match status.state {
            DeviceState::Running | DeviceState::Draining if state.free_run_since.is_none() => {
                self.shared.params.frames_to_micros(status.delay_frames as u64)
            }
            _ => 0,
        };
        state.paused = true;
        state.last_known_time = frozen;
        self.shared.ring.notify();
        debug!("Audio paused at {} us", frozen);
    }

    /// Reset the device and let the clock run again from its frozen value
    pub fn resume(&self) {
        let mut state = self.shared.ring.lock();
        if !state.paused {
            return;
        }
        if let Err(e) = self.shared.device.lock().reset() {
            warn!("Audio device reset on resume failed: {}", e);
        }
        let restart = state.last_known_time + state.pause_skew;
        let free_running = state.free_run_since.is_some();
        Shared::set_clock(&mut state, restart);
        if free_running {
            state.free_run_since = Some(Instant::now());
        }
        state.paused = false;
        self.shared.ring.notify();
        debug!("Audio resumed at {} us", restart);
    }

    /// Whether the stream is paused
    pub fn is_paused(&self) -> bool {
        self.shared.ring.lock().paused
    }

    /// Whether playback stalled for lack of data
    ///
    /// True when not paused, nothing is queued, the stream did not reach its
    /// end, and the device is not consuming samples.
    pub fn is_starved(&self) -> bool {
        let state = self.shared.ring.lock();
        if state.paused || state.accumulated > 0 || state.drained || state.closed {
            return false;
        }
        let status = self.shared.device.lock().status();
        !matches!(status.state, DeviceState::Running | DeviceState::Draining)
    }

    /// Queued PCM in microseconds
    pub fn buffered_micros(&self) -> i64 {
        let frames = self.shared.ring.accumulated_frames() as u64;
        self.shared.params.frames_to_micros(frames)
    }

    /// Snapshot of the IO counters
    pub fn stats(&self) -> OutputStats {
        self.shared.stats.lock().clone()
    }
}

impl Drop for AudioOutputStream {
    fn drop(&mut self) {
        if let Err(e) = self.shutdown() {
            warn!("Audio output shut down with error: {}", e);
        }
    }
}

impl Shared {
    fn set_clock(state: &mut RingState, value: i64) {
        state.clock_offset = value;
        state.last_known_time = value;
        state.xrun_time = value;
        state.pause_skew = 0;
        state.free_run_since = None;
    }

    fn now_locked(&self, state: &mut RingState) -> i64 {
        if state.paused {
            return state.last_known_time;
        }

        let now = if let Some(since) = state.free_run_since {
            state.clock_offset + since.elapsed().as_micros() as i64
        } else {
            let status = self.device.lock().status();
            match status.state {
                DeviceState::Running | DeviceState::Draining => {
                    state.clock_offset + status.elapsed_since_trigger().as_micros() as i64
                }
                DeviceState::Xrun => state.xrun_time,
                _ => state.last_known_time,
            }
        };

        let now = now.max(state.last_known_time);
        state.last_known_time = now;
        now
    }

    fn report_fatal(&self, error: PlayerError) {
        if let Some(hook) = self.on_fatal.lock().as_ref() {
            hook(error);
        }
    }

    fn run(self: Arc<Self>) -> Result<()> {
        let max_frames = (self.hw.buffer_frames / 2).max(1) as usize;
        let mut chunk: Vec<i16> = Vec::with_capacity(max_frames * self.params.channels as usize);
        info!(
            "Audio IO thread started ({} Hz, buffer {} frames, period {} frames)",
            self.params.sample_rate, self.hw.buffer_frames, self.hw.period_frames
        );

        let mut state = self.ring.lock();
        loop {
            if state.closed {
                debug!("Audio IO thread exiting");
                return Ok(());
            }
            if state.paused {
                self.ring.wait(&mut state);
                continue;
            }
            if state.accumulated == 0 {
                if state.eos && !state.drained {
                    self.play_out(&mut state);
                } else {
                    self.ring.wait(&mut state);
                }
                continue;
            }

            let generation = state.generation;
            let frames = self.ring.peek_locked(&state, &mut chunk, max_frames);
            let result = self.device.lock().write(&chunk);

            match result {
                Ok(written) => {
                    self.ring.consume_locked(&mut state, written);
                    self.after_write(&mut state, written);
                }
                Err(DeviceError::WouldBlock) => {
                    let backoff = self.params.frames_to_duration(frames as u64);
                    {
                        let mut stats = self.stats.lock();
                        stats.backoffs += 1;
                        stats.last_backoff = backoff;
                    }
                    let deadline = Instant::now() + backoff;
                    while !state.closed && !state.paused && state.generation == generation {
                        if !self.ring.wait_until(&mut state, deadline) {
                            break;
                        }
                    }
                }
                Err(err) if err.is_recoverable() => {
                    if let Err(fatal) = self.recover(&mut state, &err) {
                        drop(state);
                        return self.fail(fatal);
                    }
                }
                Err(err) => {
                    drop(state);
                    return self.fail(err);
                }
            }
        }
    }

    fn after_write(&self, state: &mut MutexGuard<'_, RingState>, written: usize) {
        self.stats.lock().frames_written += written as u64;
        let now = self.now_locked(state);
        let delay = self.device.lock().status().delay_frames;
        state.xrun_time = now + self.params.frames_to_micros(delay as u64);
    }

    fn recover(&self, state: &mut MutexGuard<'_, RingState>, err: &DeviceError) -> std::result::Result<(), DeviceError> {
        let resume_at = match err {
            DeviceError::Xrun => state.xrun_time.max(state.last_known_time),
            _ => state.last_known_time,
        };
        self.device.lock().recover(err)?;
        state.clock_offset = resume_at;
        state.last_known_time = resume_at;
        state.xrun_time = resume_at;

        let mut stats = self.stats.lock();
        if *err == DeviceError::Xrun {
            stats.xruns += 1;
            warn!("Audio underrun recovered, clock resumes at {} us", resume_at);
        } else {
            stats.recoveries += 1;
            warn!("Audio device recovered from {}", err);
        }
        Ok(())
    }

    /// Wait for the hardware to play what it holds, then switch the clock to
    /// free-running so video can finish on its own
    fn play_out(&self, state: &mut MutexGuard<'_, RingState>) {
        let status = self.device.lock().status();
        let pending = match status.state {
            DeviceState::Running | DeviceState::Draining => status.delay_frames,
            _ => 0,
        };

        if pending > 0 {
            let deadline = Instant::now() + self.params.frames_to_duration(pending as u64);
            let generation = state.generation;
            while !state.closed && !state.paused && state.generation == generation {
                if !self.ring.wait_until(state, deadline) {
                    break;
                }
            }
            return;
        }

        let now = self.now_locked(state);
        if let Err(e) = self.device.lock().drain() {
            warn!("Audio drain failed: {}", e);
        }
        state.clock_offset = now;
        state.last_known_time = now;
        state.free_run_since = Some(Instant::now());
        state.drained = true;
        self.ring.notify();
        info!("Audio stream played out at {} us", now);

        let generation = state.generation;
        MutexGuard::unlocked(state, || self.ring.report_drained(generation));
    }

    fn fail(&self, err: DeviceError) -> Result<()> {
        error!("Audio device failed: {}", err);
        self.report_fatal(PlayerError::DeviceFatal(err.to_string()));
        Err(PlayerError::DeviceFatal(err.to_string()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::audio::{DeviceStatus, PcmPacket};
    use std::collections::VecDeque;

    /// Device whose clock and failures are driven by the test
    #[derive(Default)]
    struct Script {
        state: Option<DeviceState>,
        written: Vec<i16>,
        attempts: Vec<Instant>,
        failures: VecDeque<DeviceError>,
        elapsed: Duration,
        delay_frames: u32,
        resets: u32,
    }

    struct ScriptedDevice(Arc<Mutex<Script>>);

    impl AudioDevice for ScriptedDevice {
        fn hw_params(&self) -> HwParams {
            HwParams {
                buffer_frames: 4096,
                period_frames: 1024,
            }
        }

        fn write(&mut self, samples: &[i16]) -> std::result::Result<usize, DeviceError> {
            let mut script = self.0.lock();
            script.attempts.push(Instant::now());
            if let Some(err) = script.failures.pop_front() {
                if err == DeviceError::Xrun {
                    script.state = Some(DeviceState::Xrun);
                }
                return Err(err);
            }
            script.written.extend_from_slice(samples);
            script.state = Some(DeviceState::Running);
            Ok(samples.len() / 2)
        }

        fn status(&mut self) -> DeviceStatus {
            let script = self.0.lock();
            DeviceStatus {
                state: script.state.unwrap_or(DeviceState::Prepared),
                htstamp: Duration::from_secs(10) + script.elapsed,
                trigger_tstamp: Duration::from_secs(10),
                delay_frames: script.delay_frames,
                avail_frames: 4096 - script.delay_frames,
            }
        }

        fn recover(&mut self, _error: &DeviceError) -> std::result::Result<(), DeviceError> {
            let mut script = self.0.lock();
            script.state = Some(DeviceState::Prepared);
            script.elapsed = Duration::ZERO;
            Ok(())
        }

        fn reset(&mut self) -> std::result::Result<(), DeviceError> {
            let mut script = self.0.lock();
            script.state = Some(DeviceState::Prepared);
            script.elapsed = Duration::ZERO;
            script.resets += 1;
            Ok(())
        }

        fn drain(&mut self) -> std::result::Result<(), DeviceError> {
            self.0.lock().state = Some(DeviceState::Prepared);
            Ok(())
        }
    }

    fn stream() -> (AudioOutputStream, Arc<Mutex<Script>>) {
        let script = Arc::new(Mutex::new(Script::default()));
        let output = AudioOutputStream::new(
            Box::new(ScriptedDevice(Arc::clone(&script))),
            AudioParams::default(),
        );
        (output, script)
    }

    fn ramp(frames: usize) -> PcmPacket {
        let samples = (0..frames * 2).map(|i| (i % 30_000) as i16).collect();
        PcmPacket::new(samples, 2, Some(0))
    }

    fn wait_for<F: Fn() -> bool>(condition: F) {
        let deadline = Instant::now() + Duration::from_secs(5);
        while !condition() {
            assert!(Instant::now() < deadline, "condition not reached in time");
            thread::sleep(Duration::from_millis(2));
        }
    }

    #[test]
    fn test_would_block_backs_off_for_fragment_duration() {
        let (output, script) = stream();
        script.lock().failures.push_back(DeviceError::WouldBlock);

        let packet = ramp(1000);
        let expected = packet.samples.clone();
        output.ring().push(packet);
        output.start().unwrap();

        wait_for(|| script.lock().written.len() == expected.len());
        output.shutdown().unwrap();

        let stats = output.stats();
        let backoff = AudioParams::default().frames_to_duration(1000);
        assert_eq!(stats.backoffs, 1);
        assert_eq!(stats.last_backoff, backoff);
        assert_eq!(stats.frames_written, 1000);

        let script = script.lock();
        assert_eq!(script.written, expected, "no samples lost or reordered");
        assert_eq!(script.attempts.len(), 2);
        assert!(script.attempts[1] - script.attempts[0] >= backoff);
    }

    #[test]
    fn test_writes_are_bounded_by_half_the_buffer() {
        let (output, script) = stream();
        output.ring().push(ramp(5000));
        output.start().unwrap();

        wait_for(|| script.lock().written.len() == 10_000);
        output.shutdown().unwrap();
        // 2048 + 2048 + 904
        assert_eq!(script.lock().attempts.len(), 3);
    }

    #[test]
    fn test_xrun_rebases_clock_and_continues() {
        let (output, script) = stream();
        {
            let mut state = output.ring().lock();
            state.xrun_time = 2_000_000;
            state.last_known_time = 1_950_000;
        }
        script.lock().failures.push_back(DeviceError::Xrun);
        output.ring().push(ramp(256));
        output.start().unwrap();

        wait_for(|| script.lock().written.len() == 512);
        let stats = output.stats();
        assert_eq!(stats.xruns, 1);
        // the device restarted at elapsed zero from the precomputed xrun time
        assert_eq!(output.now(), 2_000_000);
        output.shutdown().unwrap();
    }

    #[test]
    fn test_clock_runs_with_device_and_freezes_on_pause() {
        let (output, script) = stream();
        output.latch(5_000_000);
        assert_eq!(output.now(), 5_000_000);

        {
            let mut script = script.lock();
            script.state = Some(DeviceState::Running);
            script.elapsed = Duration::from_millis(40);
            script.delay_frames = 480;
        }
        assert_eq!(output.now(), 5_040_000);

        output.pause();
        script.lock().elapsed = Duration::from_millis(500);
        let frozen = output.now();
        assert_eq!(frozen, 5_040_000);
        assert_eq!(output.now(), frozen);

        // resume restarts from the frozen value plus the audio dropped at pause
        output.resume();
        assert_eq!(output.now(), 5_050_000);
    }

    #[test]
    fn test_flush_and_reset_clock() {
        let (output, _script) = stream();
        output.ring().push(ramp(4800));
        assert_eq!(output.flush(), 4800);
        assert!(output.ring().is_empty());

        output.reset_clock(30_000_000);
        assert_eq!(output.now(), 30_000_000);
        // a later latch does not override an explicit reset
        assert!(!output.latch(0));
        assert_eq!(output.now(), 30_000_000);
    }

    #[test]
    fn test_fatal_error_calls_hook() {
        let (output, script) = stream();
        let reported = Arc::new(Mutex::new(None));
        {
            let reported = Arc::clone(&reported);
            output.set_fatal_hook(move |err| *reported.lock() = Some(err.to_string()));
        }
        script
            .lock()
            .failures
            .push_back(DeviceError::Fatal("card removed".to_string()));
        output.ring().push(ramp(16));
        output.start().unwrap();

        wait_for(|| reported.lock().is_some());
        assert!(matches!(output.shutdown(), Err(PlayerError::DeviceFatal(_))));
        assert!(reported.lock().as_deref().unwrap_or("").contains("card removed"));
    }

    #[test]
    fn test_starvation_detection() {
        let (output, script) = stream();
        assert!(output.is_starved());

        output.ring().push(ramp(16));
        assert!(!output.is_starved());
        output.flush();

        script.lock().state = Some(DeviceState::Running);
        assert!(!output.is_starved());

        script.lock().state = Some(DeviceState::Xrun);
        output.pause();
        assert!(!output.is_starved());
    }

    #[test]
    fn test_resync_moves_clock() {
        let (output, _script) = stream();
        output.reset_clock(1_000_000);
        output.resync(1_400_000);
        assert_eq!(output.now(), 1_400_000);
    }
}
