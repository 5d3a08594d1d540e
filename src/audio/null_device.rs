//! Audio device that consumes samples in real time and discards them
//!
//! Used for headless runs without sound hardware and by tests. It follows the same state machine as a real PCM
//! device: it starts once a period is queued, underruns when starved and
//! reports timestamps from the monotonic clock.

use crate::audio::{AudioDevice, AudioHost, AudioParams, DeviceError, DeviceState, DeviceStatus, HwParams};
use crate::utils::error::Result;
use std::thread;
use std::time::{Duration, Instant};

/// Discarding PCM device paced by the wall clock
pub struct NullDevice {
    params: AudioParams,
    state: DeviceState,
    origin: Instant,
    trigger: Instant,
    /// Frames written since the last start, or queued while prepared
    written: u64,
}

impl NullDevice {
    /// Create a prepared device for `params`
    pub fn new(params: AudioParams) -> Self {
        let now = Instant::now();
        Self {
            params,
            state: DeviceState::Prepared,
            origin: now,
            trigger: now,
            written: 0,
        }
    }

    fn played(&self) -> u64 {
        match self.state {
            DeviceState::Running | DeviceState::Draining => {
                let elapsed = self.trigger.elapsed().as_micros() as i64;
                self.params.micros_to_frames(elapsed).min(self.written)
            }
            _ => 0,
        }
    }

    fn update(&mut self) {
        if matches!(self.state, DeviceState::Running | DeviceState::Draining) && self.played() >= self.written {
            self.state = match self.state {
                DeviceState::Draining => DeviceState::Prepared,
                _ => DeviceState::Xrun,
            };
            self.written = 0;
        }
    }

    fn queued(&self) -> u64 {
        match self.state {
            DeviceState::Xrun => 0,
            _ => self.written - self.played(),
        }
    }
}

impl AudioDevice for NullDevice {
    fn hw_params(&self) -> HwParams {
        HwParams {
            buffer_frames: self.params.buffer_frames,
            period_frames: self.params.period_frames,
        }
    }

    fn write(&mut self, samples: &[i16]) -> std::result::Result<usize, DeviceError> {
        self.update();
        if self.state == DeviceState::Xrun {
            return Err(DeviceError::Xrun);
        }

        let channels = self.params.channels.max(1) as usize;
        let frames = (samples.len() / channels) as u64;
        let avail = (self.params.buffer_frames as u64).saturating_sub(self.queued());
        if avail == 0 {
            return Err(DeviceError::WouldBlock);
        }

        let accepted = frames.min(avail);
        self.written += accepted;
        if self.state == DeviceState::Prepared && self.written >= self.params.period_frames as u64 {
            self.state = DeviceState::Running;
            self.trigger = Instant::now();
        }
        Ok(accepted as usize)
    }

    fn status(&mut self) -> DeviceStatus {
        self.update();
        let delay = self.queued();
        DeviceStatus {
            state: self.state,
            htstamp: self.origin.elapsed(),
            trigger_tstamp: self.trigger.duration_since(self.origin),
            delay_frames: delay as u32,
            avail_frames: (self.params.buffer_frames as u64).saturating_sub(delay) as u32,
        }
    }

    fn recover(&mut self, _error: &DeviceError) -> std::result::Result<(), DeviceError> {
        self.state = DeviceState::Prepared;
        self.written = 0;
        Ok(())
    }

    fn reset(&mut self) -> std::result::Result<(), DeviceError> {
        self.state = DeviceState::Prepared;
        self.written = 0;
        Ok(())
    }

    fn drain(&mut self) -> std::result::Result<(), DeviceError> {
        self.update();
        let pending = self.queued();
        if pending > 0 {
            thread::sleep(self.params.frames_to_duration(pending).min(Duration::from_secs(1)));
        }
        self.state = DeviceState::Prepared;
        self.written = 0;
        Ok(())
    }
}

/// Host that hands out [`NullDevice`]s
#[derive(Debug, Default, Clone, Copy)]
pub struct NullHost;

impl AudioHost for NullHost {
    fn open(&self, params: &AudioParams) -> Result<Box<dyn AudioDevice>> {
        Ok(Box::new(NullDevice::new(*params)))
    }
}
