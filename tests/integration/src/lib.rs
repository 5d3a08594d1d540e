//! Integration test utilities for stbplayer
//!
//! This module provides the doubles the scenario tests plug into a player:
//! - A scripted audio host with fault injection and a silence meter
//! - A slow backend that stretches buffering
//! - Recording video sink and status subscriber

use parking_lot::{Condvar, Mutex};
use stbplayer::audio::{AudioDevice, AudioHost, AudioParams, DeviceError, DeviceStatus, HwParams, NullDevice};
use stbplayer::decoder::{Demuxer, MediaBackend, OpenedMedia, OutputFormat, Packet, SeekDirection, TestPatternBackend};
use stbplayer::player::{Notification, Player, PlayerBuilder, PlayerStatus, StatusSink};
use stbplayer::renderer::VideoSink;
use stbplayer::utils::Config;
use std::collections::VecDeque;
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};

/// Small, fast configuration for scenario tests
pub fn test_config() -> Config {
    let mut config = Config::default();
    config.video.width = 64;
    config.video.height = 36;
    config.player.progress_interval_ms = 100;
    config.player.overlay_timeout_ms = 100;
    config
}

/// Player wired to the given doubles
pub struct Harness {
    pub player: Player,
    pub recorder: Arc<Recorder>,
    pub sink: RecordingSink,
    pub host: ScriptedHost,
}

impl Harness {
    /// Player on the test pattern backend
    pub fn new(config: Config) -> Self {
        Self::with_backend(config, TestPatternBackend::new())
    }

    /// Player on `backend`
    pub fn with_backend(config: Config, backend: impl MediaBackend + 'static) -> Self {
        let recorder = Arc::new(Recorder::default());
        let sink = RecordingSink::default();
        let host = ScriptedHost::default();
        let player = PlayerBuilder::new()
            .with_config(config)
            .with_backend(backend)
            .with_audio_host(host.clone())
            .with_sink(sink.clone())
            .with_subscriber(Arc::clone(&recorder) as Arc<dyn StatusSink>)
            .build()
            .expect("player builds");
        Self {
            player,
            recorder,
            sink,
            host,
        }
    }
}

/// Poll `condition` until it holds or `timeout` passes
pub fn wait_until(timeout: Duration, mut condition: impl FnMut() -> bool) -> bool {
    let deadline = Instant::now() + timeout;
    while Instant::now() < deadline {
        if condition() {
            return true;
        }
        thread::sleep(Duration::from_millis(10));
    }
    condition()
}

/// Wait for the player to report `status`
pub fn wait_for_status(player: &Player, status: PlayerStatus, timeout: Duration) -> bool {
    wait_until(timeout, || player.status() == status)
}

/// Subscriber that keeps every notification
#[derive(Default)]
pub struct Recorder {
    events: Mutex<Vec<Notification>>,
    changed: Condvar,
}

impl StatusSink for Recorder {
    fn notify(&self, notification: &Notification) {
        self.events.lock().push(notification.clone());
        self.changed.notify_all();
    }
}

impl Recorder {
    /// Everything received so far
    pub fn events(&self) -> Vec<Notification> {
        self.events.lock().clone()
    }

    /// The sequence of reported statuses, in delivery order
    pub fn statuses(&self) -> Vec<PlayerStatus> {
        self.events
            .lock()
            .iter()
            .filter_map(|event| match event {
                Notification::Status { status, previous, .. } if status != previous => Some(*status),
                _ => None,
            })
            .collect()
    }

    /// Every `(previous, status)` pair that was reported as a change
    pub fn transitions(&self) -> Vec<(PlayerStatus, PlayerStatus)> {
        self.events
            .lock()
            .iter()
            .filter_map(|event| match event {
                Notification::Status { status, previous, .. } if status != previous => Some((*previous, *status)),
                _ => None,
            })
            .collect()
    }

    /// Buffering percentages, in delivery order
    pub fn buffering(&self) -> Vec<u8> {
        self.events
            .lock()
            .iter()
            .filter_map(|event| match event {
                Notification::Buffering { percent } => Some(*percent),
                _ => None,
            })
            .collect()
    }

    /// Error messages attached to status notifications
    pub fn errors(&self) -> Vec<String> {
        self.events
            .lock()
            .iter()
            .filter_map(|event| match event {
                Notification::Status { error: Some(error), .. } => Some(error.clone()),
                _ => None,
            })
            .collect()
    }

    /// Wait until a notification matching `predicate` was delivered
    pub fn wait_for(&self, timeout: Duration, predicate: impl Fn(&Notification) -> bool) -> bool {
        let deadline = Instant::now() + timeout;
        let mut events = self.events.lock();
        loop {
            if events.iter().any(&predicate) {
                return true;
            }
            if self.changed.wait_until(&mut events, deadline).timed_out() {
                return events.iter().any(&predicate);
            }
        }
    }
}

/// Video sink that counts presented frames
#[derive(Clone, Default)]
pub struct RecordingSink {
    inner: Arc<Mutex<SinkLog>>,
}

#[derive(Default)]
struct SinkLog {
    blits: u64,
    presented: u64,
    last_size: Option<(u32, u32)>,
}

impl RecordingSink {
    /// Frames presented so far
    pub fn presented(&self) -> u64 {
        self.inner.lock().presented
    }

    /// Pictures copied so far
    pub fn blits(&self) -> u64 {
        self.inner.lock().blits
    }

    /// Geometry of the last blit
    pub fn last_size(&self) -> Option<(u32, u32)> {
        self.inner.lock().last_size
    }
}

impl VideoSink for RecordingSink {
    fn blit(&mut self, _pixels: &[u8], width: u32, height: u32, _x: i32, _y: i32) -> stbplayer::Result<()> {
        let mut log = self.inner.lock();
        log.blits += 1;
        log.last_size = Some((width, height));
        Ok(())
    }

    fn present(&mut self) -> stbplayer::Result<()> {
        self.inner.lock().presented += 1;
        Ok(())
    }
}

/// Faults a [`ScriptedHost`] injects into the devices it opens
#[derive(Debug, Default)]
pub struct FaultScript {
    /// Errors returned by upcoming writes, front first
    pub write_failures: VecDeque<DeviceError>,

    /// Writes to let through before the first queued failure
    pub fail_after_writes: u64,

    /// Fail `open` with this message
    pub open_failure: Option<String>,

    writes: u64,
    opened: u64,
}

/// Runs of digital silence in the PCM the devices accepted
#[derive(Debug, Default)]
struct SilenceMeter {
    sample_rate: u32,
    current: u64,
    longest: u64,
}

impl SilenceMeter {
    fn feed(&mut self, samples: &[i16], channels: usize) {
        for frame in samples.chunks_exact(channels.max(1)) {
            if frame.iter().all(|&sample| sample == 0) {
                self.current += 1;
                self.longest = self.longest.max(self.current);
            } else {
                self.current = 0;
            }
        }
    }
}

/// Audio host whose devices play in real time and fail on cue
#[derive(Clone, Default)]
pub struct ScriptedHost {
    script: Arc<Mutex<FaultScript>>,
    silence: Arc<Mutex<SilenceMeter>>,
}

impl ScriptedHost {
    /// Queue `error` for a write after `after_writes` successful ones
    pub fn inject(&self, error: DeviceError, after_writes: u64) {
        let mut script = self.script.lock();
        script.fail_after_writes = script.writes + after_writes;
        script.write_failures.push_back(error);
    }

    /// Make every later `open` fail
    pub fn fail_open(&self, message: &str) {
        self.script.lock().open_failure = Some(message.to_string());
    }

    /// Write calls seen across all devices
    pub fn writes(&self) -> u64 {
        self.script.lock().writes
    }

    /// Devices opened so far
    pub fn opened(&self) -> u64 {
        self.script.lock().opened
    }

    /// Longest stretch of silent frames played since the last reset
    pub fn longest_silence(&self) -> Duration {
        let meter = self.silence.lock();
        match meter.sample_rate {
            0 => Duration::ZERO,
            rate => Duration::from_micros(meter.longest * 1_000_000 / rate as u64),
        }
    }

    /// Forget the silence measured so far
    pub fn reset_silence(&self) {
        let mut meter = self.silence.lock();
        meter.current = 0;
        meter.longest = 0;
    }
}

impl AudioHost for ScriptedHost {
    fn open(&self, params: &AudioParams) -> stbplayer::Result<Box<dyn AudioDevice>> {
        let mut script = self.script.lock();
        if let Some(message) = &script.open_failure {
            return Err(stbplayer::PlayerError::DeviceFatal(message.clone()));
        }
        script.opened += 1;
        self.silence.lock().sample_rate = params.sample_rate;
        Ok(Box::new(ScriptedDevice {
            device: NullDevice::new(*params),
            channels: params.channels as usize,
            script: Arc::clone(&self.script),
            silence: Arc::clone(&self.silence),
        }))
    }
}

struct ScriptedDevice {
    device: NullDevice,
    channels: usize,
    script: Arc<Mutex<FaultScript>>,
    silence: Arc<Mutex<SilenceMeter>>,
}

impl AudioDevice for ScriptedDevice {
    fn hw_params(&self) -> HwParams {
        self.device.hw_params()
    }

    fn write(&mut self, samples: &[i16]) -> Result<usize, DeviceError> {
        {
            let mut script = self.script.lock();
            script.writes += 1;
            if script.writes > script.fail_after_writes {
                if let Some(error) = script.write_failures.pop_front() {
                    return Err(error);
                }
            }
        }
        let written = self.device.write(samples)?;
        let accepted = (written * self.channels).min(samples.len());
        self.silence.lock().feed(&samples[..accepted], self.channels);
        Ok(written)
    }

    fn status(&mut self) -> DeviceStatus {
        self.device.status()
    }

    fn recover(&mut self, error: &DeviceError) -> Result<(), DeviceError> {
        self.device.recover(error)
    }

    fn reset(&mut self) -> Result<(), DeviceError> {
        self.device.reset()
    }

    fn drain(&mut self) -> Result<(), DeviceError> {
        self.device.drain()
    }
}

/// Backend that delays every packet read, like a slow network source
pub struct SlowBackend<B> {
    inner: B,
    delay: Duration,
}

impl<B: MediaBackend> SlowBackend<B> {
    /// Wrap `inner`, sleeping `delay` before each packet
    pub fn new(inner: B, delay: Duration) -> Self {
        Self { inner, delay }
    }
}

impl<B: MediaBackend> MediaBackend for SlowBackend<B> {
    fn open(&self, locator: &str, output: &OutputFormat) -> stbplayer::Result<OpenedMedia> {
        let mut opened = self.inner.open(locator, output)?;
        opened.demuxer = Box::new(SlowDemuxer {
            inner: opened.demuxer,
            delay: self.delay,
        });
        Ok(opened)
    }

    fn accepts(&self, locator: &str) -> bool {
        self.inner.accepts(locator)
    }
}

struct SlowDemuxer {
    inner: Box<dyn Demuxer>,
    delay: Duration,
}

impl Demuxer for SlowDemuxer {
    fn read_packet(&mut self) -> stbplayer::Result<Option<Packet>> {
        thread::sleep(self.delay);
        self.inner.read_packet()
    }

    fn seek(&mut self, target: i64, direction: SeekDirection) -> stbplayer::Result<()> {
        self.inner.seek(target, direction)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_scripted_host_injects_after_writes() {
        let host = ScriptedHost::default();
        host.inject(DeviceError::Xrun, 1);
        let mut device = host.open(&AudioParams::default()).unwrap();
        let samples = vec![0i16; 2 * 256];
        assert!(device.write(&samples).is_ok());
        assert_eq!(device.write(&samples), Err(DeviceError::Xrun));
        assert!(device.write(&samples).is_ok());
        assert_eq!(host.writes(), 3);
        assert_eq!(host.opened(), 1);
    }

    #[test]
    fn test_recorder_filters_status_changes() {
        let recorder = Recorder::default();
        recorder.notify(&Notification::Status {
            status: PlayerStatus::Buffering,
            previous: PlayerStatus::Ready,
            error: None,
        });
        recorder.notify(&Notification::Buffering { percent: 40 });
        recorder.notify(&Notification::Status {
            status: PlayerStatus::Ready,
            previous: PlayerStatus::Ready,
            error: Some("seek failed".to_string()),
        });
        assert_eq!(recorder.statuses(), vec![PlayerStatus::Buffering]);
        assert_eq!(recorder.buffering(), vec![40]);
        assert_eq!(recorder.errors(), vec!["seek failed".to_string()]);
        assert!(recorder.wait_for(Duration::ZERO, |n| matches!(n, Notification::Buffering { .. })));
    }
}
