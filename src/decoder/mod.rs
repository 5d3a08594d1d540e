//! Demuxing and decoding for stbplayer
//!
//! The engine never talks to a codec library directly. A [`MediaBackend`]
//! opens a locator and hands back one [`Demuxer`] plus an optional decoder per
//! elementary stream; those objects are moved into the session's threads.
//! Compressed data travels between threads as owned [`Packet`]s through
//! [`PacketQueue`]s, and decoded pictures land in the [`FrameRing`].

#[cfg(feature = "ffmpeg")]
mod ffmpeg_decoder;
mod frame_ring;
mod packet_queue;
mod stream_info;
mod test_pattern;

#[cfg(feature = "ffmpeg")]
pub use ffmpeg_decoder::FfmpegBackend;
pub use frame_ring::{FrameRing, ReadyFrame, RingError, WritableFrame};
pub use packet_queue::{PacketQueue, PushError, QueueItem};
pub use stream_info::{AudioStreamInfo, Chapter, MediaInfo, VideoStreamInfo};
pub use test_pattern::TestPatternBackend;

use crate::audio::PcmPacket;
use crate::renderer::VideoFrame;
use crate::utils::error::Result;
use std::fmt;

/// Microseconds per second, the engine's internal time unit
pub const MICROS_PER_SECOND: i64 = 1_000_000;

/// A stream time base, in seconds per tick
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Rational {
    /// Numerator
    pub num: i32,

    /// Denominator
    pub den: i32,
}

impl Rational {
    /// The engine's own time base (1/1000000)
    pub const MICROS: Rational = Rational { num: 1, den: 1_000_000 };

    /// Create a time base of `num/den` seconds per tick
    pub const fn new(num: i32, den: i32) -> Self {
        Self { num, den }
    }

    /// Convert a timestamp in this time base to microseconds, rounding to nearest
    pub fn to_micros(self, ts: i64) -> i64 {
        rescale(ts, self, Rational::MICROS)
    }

    /// Convert microseconds to a timestamp in this time base, rounding to nearest
    pub fn from_micros(self, micros: i64) -> i64 {
        rescale(micros, Rational::MICROS, self)
    }
}

impl Default for Rational {
    fn default() -> Self {
        Rational::MICROS
    }
}

impl fmt::Display for Rational {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.num, self.den)
    }
}

/// Rescale `ts` from time base `from` to time base `to`, rounding to nearest
pub fn rescale(ts: i64, from: Rational, to: Rational) -> i64 {
    if from.den == 0 || to.num == 0 {
        return 0;
    }
    let num = ts as i128 * from.num as i128 * to.den as i128;
    let den = from.den as i128 * to.num as i128;
    let half = den.abs() / 2;
    let rounded = if (num >= 0) == (den > 0) {
        (num.abs() + half) / den.abs()
    } else {
        -((num.abs() + half) / den.abs())
    };
    rounded.clamp(i64::MIN as i128, i64::MAX as i128) as i64
}

/// Elementary stream a packet belongs to
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum StreamKind {
    /// The selected video stream
    Video,
    /// The selected audio stream
    Audio,
}

/// Direction hint for the demuxer's seek primitive
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SeekDirection {
    /// Land on the closest sync point at or before the target
    Backward,
    /// Land on the closest sync point at or after the target
    Forward,
}

impl SeekDirection {
    /// Pick the direction for a jump from `from` to `target` (both in micros)
    pub fn between(from: i64, target: i64) -> Self {
        if target < from {
            SeekDirection::Backward
        } else {
            SeekDirection::Forward
        }
    }
}

/// Owned payload of a compressed packet
pub enum PacketData {
    /// Plain bytes
    Bytes(Vec<u8>),

    /// A packet still owned by FFmpeg, moved through the queue untouched
    #[cfg(feature = "ffmpeg")]
    Ffmpeg(ffmpeg_next::Packet),
}

impl PacketData {
    /// Payload size in bytes
    pub fn len(&self) -> usize {
        match self {
            PacketData::Bytes(bytes) => bytes.len(),
            #[cfg(feature = "ffmpeg")]
            PacketData::Ffmpeg(packet) => packet.size(),
        }
    }

    /// Whether the payload is empty
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// A compressed media unit read by the demuxer
pub struct Packet {
    /// Stream the packet was routed from
    pub stream: StreamKind,

    /// Presentation timestamp in the stream time base
    pub pts: Option<i64>,

    /// Duration in the stream time base
    pub duration: i64,

    /// Whether the packet starts a sync point
    pub keyframe: bool,

    /// Owned payload
    pub data: PacketData,
}

impl fmt::Debug for Packet {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Packet")
            .field("stream", &self.stream)
            .field("pts", &self.pts)
            .field("duration", &self.duration)
            .field("keyframe", &self.keyframe)
            .field("size", &self.data.len())
            .finish()
    }
}

/// Geometry and PCM format every session converts its streams to
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct OutputFormat {
    /// Output width in pixels (BGRA)
    pub width: u32,

    /// Output height in pixels
    pub height: u32,

    /// Output sample rate (S16LE interleaved)
    pub sample_rate: u32,

    /// Output channel count
    pub channels: u16,
}

/// Container reader driven by the demuxer controller thread
pub trait Demuxer: Send {
    /// Read the next packet of a selected stream
    ///
    /// # Returns
    ///
    /// `Ok(None)` at end of stream
    fn read_packet(&mut self) -> Result<Option<Packet>>;

    /// Reposition the reader
    ///
    /// # Arguments
    ///
    /// * `target` - Target position in microseconds
    /// * `direction` - Which side of the target to land on
    fn seek(&mut self, target: i64, direction: SeekDirection) -> Result<()>;
}

/// Video decoder plus its scale/pad conversion stage
pub trait VideoDecoder: Send {
    /// Time base of the timestamps on packets and produced frames
    fn time_base(&self) -> Rational;

    /// Submit a packet; a `Decode` error means the packet was rejected
    fn send_packet(&mut self, packet: Packet) -> Result<()>;

    /// Signal end of stream so buffered pictures can be drained
    fn send_eof(&mut self) -> Result<()>;

    /// Write the next converted picture into `out`
    ///
    /// # Returns
    ///
    /// `Ok(false)` when the decoder needs more input. A `Filter` error is fatal.
    fn receive_frame(&mut self, out: &mut VideoFrame) -> Result<bool>;

    /// Drop every buffered packet and picture
    fn flush(&mut self);

    /// Discard non-reference pictures while `skip` is set
    fn set_skip_non_reference(&mut self, skip: bool);
}

/// Audio decoder plus its resampling stage
pub trait AudioDecoder: Send {
    /// Time base of the timestamps on packets and produced PCM
    fn time_base(&self) -> Rational;

    /// Submit a packet; a `Decode` error means the packet was rejected
    fn send_packet(&mut self, packet: Packet) -> Result<()>;

    /// Signal end of stream so buffered samples can be drained
    fn send_eof(&mut self) -> Result<()>;

    /// Fetch the next converted PCM packet, `Ok(None)` when more input is needed
    fn receive_frame(&mut self) -> Result<Option<PcmPacket>>;

    /// Drop every buffered packet and sample
    fn flush(&mut self);
}

/// Everything a backend hands over for one opened locator
pub struct OpenedMedia {
    /// Stream and container description
    pub info: MediaInfo,

    /// Packet reader
    pub demuxer: Box<dyn Demuxer>,

    /// Decoder for the selected video stream, if any
    pub video: Option<Box<dyn VideoDecoder>>,

    /// Decoder for the selected audio stream, if any
    pub audio: Option<Box<dyn AudioDecoder>>,
}

/// Factory for demuxers and decoders
pub trait MediaBackend: Send + Sync {
    /// Open `locator` and prepare decoders that convert to `output`
    ///
    /// # Returns
    ///
    /// An `Open` error when the container cannot be parsed
    fn open(&self, locator: &str, output: &OutputFormat) -> Result<OpenedMedia>;

    /// Whether this backend handles `locator` at all
    fn accepts(&self, _locator: &str) -> bool {
        true
    }
}

/// Routes locators to the first backend that accepts them
#[derive(Default)]
pub struct BackendChain {
    backends: Vec<Box<dyn MediaBackend>>,
}

impl BackendChain {
    /// Create an empty chain
    pub fn new() -> Self {
        Self::default()
    }

    /// Append a backend; earlier backends win
    pub fn with(mut self, backend: impl MediaBackend + 'static) -> Self {
        self.backends.push(Box::new(backend));
        self
    }
}

impl MediaBackend for BackendChain {
    fn open(&self, locator: &str, output: &OutputFormat) -> Result<OpenedMedia> {
        self.backends
            .iter()
            .find(|b| b.accepts(locator))
            .ok_or_else(|| {
                crate::utils::error::PlayerError::Open(format!("No backend for {}", locator))
            })?
            .open(locator, output)
    }

    fn accepts(&self, locator: &str) -> bool {
        self.backends.iter().any(|b| b.accepts(locator))
    }
}
