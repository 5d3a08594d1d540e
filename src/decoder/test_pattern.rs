//! Synthetic media backend for `testsrc:` locators
//!
//! Produces an interleaved stream of video packets (time base 1/90000, one
//! keyframe per second) and 1024-sample audio packets (time base 1/48000).
//! The video decoder paints moving color bars, the audio decoder a 440 Hz
//! tone. Parameters are `key=value` pairs separated by `;`:
//!
//! ```text
//! testsrc:duration=10;fps=25;audio=1;video=1;chapters=3
//! ```
//!
//! Fault injection keys: `open_error`, `decode_error_every=N`,
//! `filter_error`, `seek_error` and `read_error_after=N`. The last one makes
//! every read after the first N packets fail with an I/O error.

use crate::audio::PcmPacket;
use crate::decoder::{
    AudioDecoder, AudioStreamInfo, Chapter, Demuxer, MediaBackend, MediaInfo, OpenedMedia, OutputFormat, Packet,
    PacketData, Rational, SeekDirection, StreamKind, VideoDecoder, VideoStreamInfo, MICROS_PER_SECOND,
};
use crate::renderer::VideoFrame;
use crate::utils::error::{PlayerError, Result};
use std::collections::VecDeque;
use std::time::Duration;

/// Locator prefix handled by this backend
pub const LOCATOR_PREFIX: &str = "testsrc:";

const VIDEO_TIME_BASE: Rational = Rational::new(1, 90_000);
const SOURCE_SAMPLE_RATE: u32 = 48_000;
const AUDIO_TIME_BASE: Rational = Rational::new(1, SOURCE_SAMPLE_RATE as i32);
const AUDIO_PACKET_FRAMES: u64 = 1024;
const TONE_HZ: f32 = 440.0;

const BARS: [[u8; 4]; 8] = [
    [255, 255, 255, 255],
    [0, 255, 255, 255],
    [255, 255, 0, 255],
    [0, 255, 0, 255],
    [255, 0, 255, 255],
    [0, 0, 255, 255],
    [255, 0, 0, 255],
    [16, 16, 16, 255],
];

#[derive(Debug, Clone, PartialEq)]
struct Pattern {
    duration: Duration,
    fps: u32,
    audio: bool,
    video: bool,
    chapters: u32,
    title: Option<String>,
    open_error: bool,
    decode_error_every: u32,
    filter_error: bool,
    seek_error: bool,
    read_error_after: u64,
}

impl Default for Pattern {
    fn default() -> Self {
        Self {
            duration: Duration::from_secs(10),
            fps: 25,
            audio: true,
            video: true,
            chapters: 0,
            title: None,
            open_error: false,
            decode_error_every: 0,
            filter_error: false,
            seek_error: false,
            read_error_after: 0,
        }
    }
}

fn parse_flag(key: &str, value: Option<&str>) -> Result<bool> {
    match value.unwrap_or("1") {
        "1" | "true" | "yes" | "on" => Ok(true),
        "0" | "false" | "no" | "off" => Ok(false),
        other => Err(PlayerError::Open(format!("invalid value '{}' for {}", other, key))),
    }
}

fn parse_number<T: std::str::FromStr>(key: &str, value: Option<&str>) -> Result<T> {
    value
        .and_then(|v| v.parse().ok())
        .ok_or_else(|| PlayerError::Open(format!("{} needs a numeric value", key)))
}

impl Pattern {
    fn parse(locator: &str) -> Result<Self> {
        let params = locator
            .strip_prefix(LOCATOR_PREFIX)
            .ok_or_else(|| PlayerError::Open(format!("not a test pattern locator: {}", locator)))?;

        let mut pattern = Pattern::default();
        for param in params.split(';').map(str::trim).filter(|p| !p.is_empty()) {
            let (key, value) = match param.split_once('=') {
                Some((key, value)) => (key.trim(), Some(value.trim())),
                None => (param, None),
            };
            match key {
                "duration" => {
                    let secs: f64 = parse_number(key, value)?;
                    if !secs.is_finite() || secs <= 0.0 {
                        return Err(PlayerError::Open("duration must be positive".to_string()));
                    }
                    pattern.duration = Duration::from_secs_f64(secs);
                }
                "fps" => pattern.fps = parse_number::<u32>(key, value)?.clamp(1, 120),
                "audio" => pattern.audio = parse_flag(key, value)?,
                "video" => pattern.video = parse_flag(key, value)?,
                "chapters" => pattern.chapters = parse_number(key, value)?,
                "title" => pattern.title = value.map(str::to_string),
                "open_error" => pattern.open_error = parse_flag(key, value)?,
                "decode_error_every" => pattern.decode_error_every = parse_number(key, value)?,
                "filter_error" => pattern.filter_error = parse_flag(key, value)?,
                "seek_error" => pattern.seek_error = parse_flag(key, value)?,
                "read_error_after" => pattern.read_error_after = parse_number(key, value)?,
                other => return Err(PlayerError::Open(format!("unknown test pattern parameter '{}'", other))),
            }
        }
        Ok(pattern)
    }

    fn duration_micros(&self) -> i64 {
        self.duration.as_micros() as i64
    }

    fn total_frames(&self) -> u64 {
        (self.duration_micros() as u128 * self.fps as u128 / MICROS_PER_SECOND as u128) as u64
    }

    fn total_samples(&self) -> u64 {
        (self.duration_micros() as u128 * SOURCE_SAMPLE_RATE as u128 / MICROS_PER_SECOND as u128) as u64
    }

    fn frame_micros(&self, index: u64) -> i64 {
        (index as i128 * MICROS_PER_SECOND as i128 / self.fps as i128) as i64
    }

    fn frame_pts(&self, index: u64) -> i64 {
        VIDEO_TIME_BASE.from_micros(self.frame_micros(index))
    }

    fn sample_micros(sample: u64) -> i64 {
        AUDIO_TIME_BASE.to_micros(sample as i64)
    }

    fn chapters(&self) -> Vec<Chapter> {
        if self.chapters == 0 {
            return Vec::new();
        }
        let length = self.duration / self.chapters;
        (0..self.chapters)
            .map(|i| Chapter {
                title: Some(format!("Chapter {}", i + 1)),
                start: length * i,
                end: if i + 1 == self.chapters {
                    self.duration
                } else {
                    length * (i + 1)
                },
            })
            .collect()
    }

    fn info(&self, locator: &str, output: &OutputFormat) -> MediaInfo {
        MediaInfo {
            locator: locator.to_string(),
            title: Some(
                self.title
                    .clone()
                    .unwrap_or_else(|| format!("Test pattern ({} s)", self.duration.as_secs())),
            ),
            format: "testsrc".to_string(),
            duration: Some(self.duration),
            video: self.video.then(|| VideoStreamInfo {
                codec: "testsrc".to_string(),
                width: output.width,
                height: output.height,
                frame_rate: Some(self.fps as f64),
                time_base: VIDEO_TIME_BASE,
            }),
            audio: self.audio.then(|| AudioStreamInfo {
                codec: "pcm_s16le".to_string(),
                sample_rate: SOURCE_SAMPLE_RATE,
                channels: 2,
                time_base: AUDIO_TIME_BASE,
            }),
            chapters: self.chapters(),
        }
    }
}

/// Media backend producing synthetic audio and video
#[derive(Debug, Default, Clone, Copy)]
pub struct TestPatternBackend;

impl TestPatternBackend {
    /// Create the backend
    pub fn new() -> Self {
        Self
    }
}

impl MediaBackend for TestPatternBackend {
    fn open(&self, locator: &str, output: &OutputFormat) -> Result<OpenedMedia> {
        let pattern = Pattern::parse(locator)?;
        if pattern.open_error {
            return Err(PlayerError::Open(format!("{}: injected open failure", locator)));
        }
        if !pattern.audio && !pattern.video {
            return Err(PlayerError::NoStreams(locator.to_string()));
        }

        let info = pattern.info(locator, output);
        // decode and filter faults go to the video stream when there is one
        let video_faults = pattern.video;

        let video = pattern.video.then(|| {
            Box::new(PatternVideoDecoder {
                width: output.width,
                height: output.height,
                fps: pattern.fps as u64,
                pending: VecDeque::new(),
                skip_non_reference: false,
                packets: 0,
                decode_error_every: pattern.decode_error_every,
                filter_error: pattern.filter_error,
            }) as Box<dyn VideoDecoder>
        });
        let audio = pattern.audio.then(|| {
            Box::new(PatternAudioDecoder {
                sample_rate: output.sample_rate,
                channels: output.channels.max(1),
                pending: VecDeque::new(),
                packets: 0,
                decode_error_every: if video_faults { 0 } else { pattern.decode_error_every },
                filter_error: !video_faults && pattern.filter_error,
            }) as Box<dyn AudioDecoder>
        });

        Ok(OpenedMedia {
            info,
            demuxer: Box::new(PatternDemuxer {
                pattern,
                next_frame: 0,
                next_sample: 0,
                reads: 0,
            }),
            video,
            audio,
        })
    }

    fn accepts(&self, locator: &str) -> bool {
        locator.starts_with(LOCATOR_PREFIX)
    }
}

struct PatternDemuxer {
    pattern: Pattern,
    next_frame: u64,
    next_sample: u64,
    reads: u64,
}

impl PatternDemuxer {
    fn video_due(&self) -> Option<i64> {
        (self.pattern.video && self.next_frame < self.pattern.total_frames())
            .then(|| self.pattern.frame_micros(self.next_frame))
    }

    fn audio_due(&self) -> Option<i64> {
        (self.pattern.audio && self.next_sample < self.pattern.total_samples())
            .then(|| Pattern::sample_micros(self.next_sample))
    }

    fn video_packet(&mut self) -> Packet {
        let index = self.next_frame;
        self.next_frame += 1;
        Packet {
            stream: StreamKind::Video,
            pts: Some(self.pattern.frame_pts(index)),
            duration: self.pattern.frame_pts(index + 1) - self.pattern.frame_pts(index),
            keyframe: index % self.pattern.fps as u64 == 0,
            data: PacketData::Bytes(index.to_le_bytes().to_vec()),
        }
    }

    fn audio_packet(&mut self) -> Packet {
        let start = self.next_sample;
        let frames = AUDIO_PACKET_FRAMES.min(self.pattern.total_samples() - start);
        self.next_sample += frames;
        Packet {
            stream: StreamKind::Audio,
            pts: Some(start as i64),
            duration: frames as i64,
            keyframe: true,
            data: PacketData::Bytes((frames as u32).to_le_bytes().to_vec()),
        }
    }
}

impl Demuxer for PatternDemuxer {
    fn read_packet(&mut self) -> Result<Option<Packet>> {
        if self.pattern.read_error_after > 0 && self.reads >= self.pattern.read_error_after {
            return Err(PlayerError::Io(std::io::Error::other(format!(
                "injected read failure after {} packets",
                self.reads
            ))));
        }
        self.reads += 1;
        let packet = match (self.video_due(), self.audio_due()) {
            (Some(video), Some(audio)) if video <= audio => self.video_packet(),
            (Some(_), Some(_)) => self.audio_packet(),
            (Some(_), None) => self.video_packet(),
            (None, Some(_)) => self.audio_packet(),
            (None, None) => return Ok(None),
        };
        Ok(Some(packet))
    }

    fn seek(&mut self, target: i64, direction: SeekDirection) -> Result<()> {
        if self.pattern.seek_error {
            return Err(PlayerError::SeekFailure("injected seek failure".to_string()));
        }
        let target = target.clamp(0, self.pattern.duration_micros());
        let fps = self.pattern.fps as u64;

        let mut landing = target;
        if self.pattern.video {
            let frame = (target as u128 * fps as u128 / MICROS_PER_SECOND as u128) as u64;
            let keyframe = match direction {
                SeekDirection::Backward => frame - frame % fps,
                SeekDirection::Forward => frame.div_ceil(fps) * fps,
            };
            self.next_frame = keyframe.min(self.pattern.total_frames());
            landing = self.pattern.frame_micros(self.next_frame);
        }

        // audio never starts ahead of the video keyframe
        let sample = (landing as u128 * SOURCE_SAMPLE_RATE as u128 / MICROS_PER_SECOND as u128) as u64;
        let aligned = match direction {
            SeekDirection::Backward if !self.pattern.video => sample - sample % AUDIO_PACKET_FRAMES,
            _ => sample.div_ceil(AUDIO_PACKET_FRAMES) * AUDIO_PACKET_FRAMES,
        };
        self.next_sample = aligned.min(self.pattern.total_samples());
        Ok(())
    }
}

struct PatternVideoDecoder {
    width: u32,
    height: u32,
    fps: u64,
    pending: VecDeque<(u64, i64)>,
    skip_non_reference: bool,
    packets: u32,
    decode_error_every: u32,
    filter_error: bool,
}

fn payload(packet: &Packet) -> Option<&[u8]> {
    match &packet.data {
        PacketData::Bytes(bytes) => Some(bytes.as_slice()),
        #[cfg(feature = "ffmpeg")]
        PacketData::Ffmpeg(_) => None,
    }
}

impl VideoDecoder for PatternVideoDecoder {
    fn time_base(&self) -> Rational {
        VIDEO_TIME_BASE
    }

    fn send_packet(&mut self, packet: Packet) -> Result<()> {
        self.packets += 1;
        if self.decode_error_every > 0 && self.packets % self.decode_error_every == 0 {
            return Err(PlayerError::Decode(format!("corrupt video packet at {:?}", packet.pts)));
        }
        if self.skip_non_reference && !packet.keyframe {
            return Ok(());
        }
        let index = payload(&packet)
            .and_then(|bytes| bytes.try_into().ok())
            .map(u64::from_le_bytes)
            .ok_or_else(|| PlayerError::Decode("malformed test pattern packet".to_string()))?;
        self.pending.push_back((index, packet.pts.unwrap_or(0)));
        Ok(())
    }

    fn send_eof(&mut self) -> Result<()> {
        Ok(())
    }

    fn receive_frame(&mut self, out: &mut VideoFrame) -> Result<bool> {
        if self.filter_error {
            return Err(PlayerError::Filter("scaler could not be initialized".to_string()));
        }
        let Some((index, pts)) = self.pending.pop_front() else {
            return Ok(false);
        };

        out.resize(self.width, self.height);
        out.pts = pts;
        out.time_base = VIDEO_TIME_BASE;
        out.fill(BARS[((index / self.fps) % BARS.len() as u64) as usize]);

        // one-pixel sweep so consecutive frames differ
        if self.width > 0 {
            let column = (index % self.width as u64) as usize;
            let stride = out.stride();
            for row in out.data.chunks_exact_mut(stride) {
                row[column * 4..column * 4 + 4].copy_from_slice(&[0, 0, 0, 255]);
            }
        }
        Ok(true)
    }

    fn flush(&mut self) {
        self.pending.clear();
    }

    fn set_skip_non_reference(&mut self, skip: bool) {
        self.skip_non_reference = skip;
    }
}

struct PatternAudioDecoder {
    sample_rate: u32,
    channels: u16,
    pending: VecDeque<(i64, u32)>,
    packets: u32,
    decode_error_every: u32,
    filter_error: bool,
}

impl AudioDecoder for PatternAudioDecoder {
    fn time_base(&self) -> Rational {
        AUDIO_TIME_BASE
    }

    fn send_packet(&mut self, packet: Packet) -> Result<()> {
        self.packets += 1;
        if self.decode_error_every > 0 && self.packets % self.decode_error_every == 0 {
            return Err(PlayerError::Decode(format!("corrupt audio packet at {:?}", packet.pts)));
        }
        let frames = payload(&packet)
            .and_then(|bytes| bytes.try_into().ok())
            .map(u32::from_le_bytes)
            .ok_or_else(|| PlayerError::Decode("malformed test pattern packet".to_string()))?;
        self.pending.push_back((packet.pts.unwrap_or(0), frames));
        Ok(())
    }

    fn send_eof(&mut self) -> Result<()> {
        Ok(())
    }

    fn receive_frame(&mut self) -> Result<Option<PcmPacket>> {
        if self.filter_error {
            return Err(PlayerError::Filter("resampler could not be initialized".to_string()));
        }
        let Some((pts, frames)) = self.pending.pop_front() else {
            return Ok(None);
        };

        let out_frames = (frames as u64 * self.sample_rate as u64 / SOURCE_SAMPLE_RATE as u64) as usize;
        let start = AUDIO_TIME_BASE.to_micros(pts) as f64 / MICROS_PER_SECOND as f64;
        let step = 1.0 / self.sample_rate.max(1) as f64;
        let mut samples = Vec::with_capacity(out_frames * self.channels as usize);
        for i in 0..out_frames {
            let t = start + i as f64 * step;
            let value = ((t * TONE_HZ as f64 * std::f64::consts::TAU).sin() * 6_000.0) as i16;
            samples.extend(std::iter::repeat(value).take(self.channels as usize));
        }
        Ok(Some(PcmPacket::new(samples, self.channels, Some(pts))))
    }

    fn flush(&mut self) {
        self.pending.clear();
    }
}
