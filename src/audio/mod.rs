//! Audio output module for stbplayer
//!
//! Decoded PCM is queued in an [`AudioRingBuffer`] and written to an
//! [`AudioDevice`] by the output stream's IO thread. The device's hardware
//! timestamps drive the audio master clock.
//!
//! The device contract is deliberately close to a PCM character device:
//! nonblocking interleaved S16LE writes, an explicit state machine, and
//! status snapshots carrying the trigger and hardware timestamps.

#[cfg(feature = "cpal")]
mod cpal_output;
mod null_device;
mod output;
mod ring_buffer;
mod sync;

#[cfg(feature = "cpal")]
pub use cpal_output::{CpalDevice, CpalHost};
pub use null_device::{NullDevice, NullHost};
pub use output::{AudioOutputStream, OutputStats};
pub use ring_buffer::AudioRingBuffer;
pub use sync::{MasterClock, SystemClock};

use crate::utils::error::Result;
use std::time::Duration;
use thiserror::Error;

/// Requested PCM configuration (always S16LE interleaved)
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AudioParams {
    /// Sample rate in Hz
    pub sample_rate: u32,

    /// Number of interleaved channels
    pub channels: u16,

    /// Period size in frames
    pub period_frames: u32,

    /// Hardware buffer size in frames
    pub buffer_frames: u32,
}

impl Default for AudioParams {
    fn default() -> Self {
        Self {
            sample_rate: 48_000,
            channels: 2,
            period_frames: 1024,
            buffer_frames: 4096,
        }
    }
}

impl AudioParams {
    /// Build device parameters from the audio configuration
    pub fn from_config(config: &crate::utils::config::AudioConfig) -> Self {
        Self {
            sample_rate: config.sample_rate,
            channels: config.channels,
            period_frames: config.period_frames,
            buffer_frames: config.buffer_frames,
        }
    }

    /// Playback time of `frames` frames in microseconds
    pub fn frames_to_micros(&self, frames: u64) -> i64 {
        (frames as i128 * 1_000_000 / self.sample_rate.max(1) as i128) as i64
    }

    /// Playback time of `frames` frames
    pub fn frames_to_duration(&self, frames: u64) -> Duration {
        Duration::from_nanos((frames as u128 * 1_000_000_000 / self.sample_rate.max(1) as u128) as u64)
    }

    /// Number of frames played in `micros` microseconds
    pub fn micros_to_frames(&self, micros: i64) -> u64 {
        (micros.max(0) as u128 * self.sample_rate as u128 / 1_000_000) as u64
    }

    /// One sample period in microseconds, rounded up
    pub fn sample_period_micros(&self) -> i64 {
        (1_000_000 + self.sample_rate as i64 - 1) / self.sample_rate.max(1) as i64
    }
}

/// Buffer geometry the device actually accepted
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct HwParams {
    /// Hardware buffer size in frames
    pub buffer_frames: u32,

    /// Period size in frames
    pub period_frames: u32,
}

/// PCM device state machine
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DeviceState {
    /// Opened but not configured
    Open,
    /// Configured and ready to start on the next write
    Prepared,
    /// Consuming samples
    Running,
    /// Ran out of samples
    Xrun,
    /// Playing out remaining samples before stopping
    Draining,
    /// Paused by the application
    Paused,
    /// Suspended by power management
    Suspended,
    /// Hardware went away
    Disconnected,
}

/// Snapshot of the device clock and fill level
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DeviceStatus {
    /// Current state
    pub state: DeviceState,

    /// Hardware timestamp of this snapshot
    pub htstamp: Duration,

    /// Timestamp of the last start (transition into `Running`)
    pub trigger_tstamp: Duration,

    /// Frames queued in hardware that have not been played yet
    pub delay_frames: u32,

    /// Frames that can be written without blocking
    pub avail_frames: u32,
}

impl DeviceStatus {
    /// Time played since the last start, per the hardware clock
    pub fn elapsed_since_trigger(&self) -> Duration {
        self.htstamp.saturating_sub(self.trigger_tstamp)
    }
}

/// Errors reported by an [`AudioDevice`]
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum DeviceError {
    /// The hardware buffer is full; retry later
    #[error("device busy")]
    WouldBlock,

    /// The device underran
    #[error("underrun")]
    Xrun,

    /// A system call was interrupted
    #[error("interrupted")]
    Interrupted,

    /// The stream was suspended
    #[error("suspended")]
    Suspended,

    /// Anything the device cannot recover from
    #[error("{0}")]
    Fatal(String),
}

impl DeviceError {
    /// Whether re-priming the device is enough to continue
    pub fn is_recoverable(&self) -> bool {
        matches!(
            self,
            DeviceError::Xrun | DeviceError::Interrupted | DeviceError::Suspended
        )
    }
}

/// A configured PCM playback device
pub trait AudioDevice: Send {
    /// Buffer geometry negotiated at open time
    fn hw_params(&self) -> HwParams;

    /// Queue interleaved samples without blocking
    ///
    /// # Returns
    ///
    /// Number of frames accepted, or `WouldBlock` when the buffer is full.
    /// A prepared device starts running once it holds a period.
    fn write(&mut self, samples: &[i16]) -> std::result::Result<usize, DeviceError>;

    /// Current state and clock snapshot
    fn status(&mut self) -> DeviceStatus;

    /// Re-prime the device after a recoverable error
    fn recover(&mut self, error: &DeviceError) -> std::result::Result<(), DeviceError>;

    /// Drop queued samples and return to `Prepared`
    fn reset(&mut self) -> std::result::Result<(), DeviceError>;

    /// Play out queued samples, then return to `Prepared`
    fn drain(&mut self) -> std::result::Result<(), DeviceError>;
}

/// Opens [`AudioDevice`]s, one per session
pub trait AudioHost: Send + Sync {
    /// Open and configure a device for `params`
    fn open(&self, params: &AudioParams) -> Result<Box<dyn AudioDevice>>;
}

/// A chunk of decoded, converted PCM
#[derive(Debug, Clone, Default, PartialEq)]
pub struct PcmPacket {
    /// Interleaved S16 samples
    pub samples: Vec<i16>,

    /// Channel count of `samples`
    pub channels: u16,

    /// Presentation timestamp in the producing stream's time base
    pub pts: Option<i64>,
}

impl PcmPacket {
    /// Create a packet from interleaved samples
    pub fn new(samples: Vec<i16>, channels: u16, pts: Option<i64>) -> Self {
        Self {
            samples,
            channels,
            pts,
        }
    }

    /// Number of frames (samples per channel)
    pub fn frames(&self) -> usize {
        self.samples.len() / self.channels.max(1) as usize
    }
}
