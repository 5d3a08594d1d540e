//! FFmpeg-based media backend
//!
//! Opens files and URLs with libavformat, selects the best video and audio
//! stream and prepares one decoder per stream. Video is scaled with
//! libswscale into BGRA at the output geometry (letterboxed to keep the
//! aspect ratio); audio is resampled with libswresample to interleaved S16.
//!
//! Positions are relative to the container start: packet timestamps are
//! shifted by their stream's start time and seek targets are shifted back.

use crate::audio::PcmPacket;
use crate::decoder::{
    AudioDecoder, AudioStreamInfo, Chapter, Demuxer, MediaBackend, MediaInfo, OpenedMedia, OutputFormat, Packet,
    PacketData, Rational, SeekDirection, StreamKind, VideoDecoder, VideoStreamInfo,
};
use crate::renderer::VideoFrame;
use crate::utils::error::{IntoPlayerError, PlayerError, Result};
use ffmpeg_next as ffmpeg;
use ffmpeg_next::{format, media};
use log::{debug, info, warn};
use std::sync::Once;
use std::time::Duration;

static INIT: Once = Once::new();

/// Backend for everything libavformat can open
#[derive(Debug, Default)]
pub struct FfmpegBackend {
    _private: (),
}

impl FfmpegBackend {
    /// Create the backend, initializing FFmpeg once per process
    pub fn new() -> Self {
        INIT.call_once(|| {
            if let Err(e) = ffmpeg::init() {
                warn!("FFmpeg initialization failed: {}", e);
            }
        });
        Self::default()
    }
}

fn rational(tb: ffmpeg::Rational) -> Rational {
    Rational::new(tb.numerator(), tb.denominator())
}

fn is_network(locator: &str) -> bool {
    ["http://", "https://", "rtsp://", "rtmp://", "udp://"]
        .iter()
        .any(|scheme| locator.starts_with(scheme))
}

impl MediaBackend for FfmpegBackend {
    fn open(&self, locator: &str, output: &OutputFormat) -> Result<OpenedMedia> {
        let input = if is_network(locator) {
            let mut options = ffmpeg::Dictionary::new();
            options.set("rtsp_transport", "tcp");
            options.set("buffer_size", "1048576");
            format::input_with_dictionary(&locator, options)
        } else {
            format::input(&locator)
        }
        .open_err(locator)?;

        let mut info = MediaInfo {
            locator: locator.to_string(),
            title: input.metadata().get("title").map(str::to_string),
            format: input.format().name().to_string(),
            duration: (input.duration() > 0).then(|| Duration::from_micros(input.duration() as u64)),
            chapters: read_chapters(&input),
            ..MediaInfo::default()
        };

        let video = match input.streams().best(media::Type::Video) {
            Some(stream) => match FfmpegVideoDecoder::open(&stream, output) {
                Ok((decoder, stream_info)) => {
                    info.video = Some(stream_info);
                    Some((stream.index(), decoder))
                }
                Err(e) => {
                    warn!("Video stream of {} not playable: {}", locator, e);
                    None
                }
            },
            None => None,
        };
        let audio = match input.streams().best(media::Type::Audio) {
            Some(stream) => match FfmpegAudioDecoder::open(&stream, output) {
                Ok((decoder, stream_info)) => {
                    info.audio = Some(stream_info);
                    Some((stream.index(), decoder))
                }
                Err(e) => {
                    warn!("Audio stream of {} not playable: {}", locator, e);
                    None
                }
            },
            None => None,
        };

        if video.is_none() && audio.is_none() {
            return Err(PlayerError::NoStreams(locator.to_string()));
        }
        info!(
            "Opened {} ({}, {} chapters, video: {}, audio: {})",
            locator,
            info.format,
            info.chapters.len(),
            info.has_video(),
            info.has_audio()
        );

        let video_index = video.as_ref().map(|(index, _)| *index);
        let audio_index = audio.as_ref().map(|(index, _)| *index);
        let stream_start = |index: Option<usize>| {
            index
                .and_then(|index| input.stream(index))
                .map(|stream| (stream.start_time(), rational(stream.time_base())))
                .filter(|(start, _)| *start != ffmpeg::ffi::AV_NOPTS_VALUE)
        };
        let video_start = stream_start(video_index);
        let audio_start = stream_start(audio_index);
        let start_time = [video_start, audio_start]
            .into_iter()
            .flatten()
            .map(|(start, tb)| tb.to_micros(start))
            .min()
            .unwrap_or(0);
        if start_time != 0 {
            debug!("{} starts at {} us", locator, start_time);
        }

        let demuxer = FfmpegDemuxer {
            input,
            video_index,
            audio_index,
            video_offset: video_start.map_or(0, |(_, tb)| tb.from_micros(start_time)),
            audio_offset: audio_start.map_or(0, |(_, tb)| tb.from_micros(start_time)),
            start_time,
        };
        Ok(OpenedMedia {
            info,
            demuxer: Box::new(demuxer),
            video: video.map(|(_, decoder)| Box::new(decoder) as Box<dyn VideoDecoder>),
            audio: audio.map(|(_, decoder)| Box::new(decoder) as Box<dyn AudioDecoder>),
        })
    }

    fn accepts(&self, locator: &str) -> bool {
        !locator.starts_with(crate::decoder::test_pattern::LOCATOR_PREFIX)
    }
}

fn read_chapters(input: &format::context::Input) -> Vec<Chapter> {
    let mut chapters: Vec<Chapter> = input
        .chapters()
        .map(|chapter| {
            let tb = rational(chapter.time_base());
            Chapter {
                title: chapter.metadata().get("title").map(str::to_string),
                start: Duration::from_micros(tb.to_micros(chapter.start()).max(0) as u64),
                end: Duration::from_micros(tb.to_micros(chapter.end()).max(0) as u64),
            }
        })
        .collect();
    chapters.sort_by_key(|chapter| chapter.start);
    chapters
}

struct FfmpegDemuxer {
    input: format::context::Input,
    video_index: Option<usize>,
    audio_index: Option<usize>,
    /// Container start in each stream's time base
    video_offset: i64,
    audio_offset: i64,
    /// Container start in micros
    start_time: i64,
}

impl Demuxer for FfmpegDemuxer {
    fn read_packet(&mut self) -> Result<Option<Packet>> {
        loop {
            let mut packet = ffmpeg::Packet::empty();
            match packet.read(&mut self.input) {
                Ok(()) => {}
                Err(ffmpeg::Error::Eof) => return Ok(None),
                Err(ffmpeg::Error::Other { errno }) if errno == ffmpeg::util::error::EAGAIN => continue,
                Err(e) => return Err(PlayerError::Io(std::io::Error::other(format!("read failed: {}", e)))),
            }

            let (stream, offset) = if Some(packet.stream()) == self.video_index {
                (StreamKind::Video, self.video_offset)
            } else if Some(packet.stream()) == self.audio_index {
                (StreamKind::Audio, self.audio_offset)
            } else {
                continue;
            };
            if offset != 0 {
                packet.set_pts(packet.pts().map(|pts| pts - offset));
                packet.set_dts(packet.dts().map(|dts| dts - offset));
            }
            return Ok(Some(Packet {
                stream,
                pts: packet.pts().or(packet.dts()),
                duration: packet.duration(),
                keyframe: packet.is_key(),
                data: PacketData::Ffmpeg(packet),
            }));
        }
    }

    fn seek(&mut self, target: i64, direction: SeekDirection) -> Result<()> {
        let position = target + self.start_time;
        let result = match direction {
            SeekDirection::Backward => self.input.seek(position, ..position),
            SeekDirection::Forward => self.input.seek(position, position..),
        };
        result.map_err(|e| PlayerError::SeekFailure(format!("{} us: {}", target, e)))
    }
}

fn take_packet(packet: Packet) -> Result<ffmpeg::Packet> {
    match packet.data {
        PacketData::Ffmpeg(packet) => Ok(packet),
        PacketData::Bytes(bytes) => {
            let mut raw = ffmpeg::Packet::copy(&bytes);
            raw.set_pts(packet.pts);
            raw.set_duration(packet.duration);
            Ok(raw)
        }
    }
}

/// Whether a send/receive error only means "try the other direction"
fn is_again(error: &ffmpeg::Error) -> bool {
    matches!(error, ffmpeg::Error::Other { errno } if *errno == ffmpeg::util::error::EAGAIN)
}

struct FfmpegVideoDecoder {
    decoder: ffmpeg::decoder::Video,
    time_base: Rational,
    scaler: Option<Scaler>,
    output_width: u32,
    output_height: u32,
    decoded: ffmpeg::frame::Video,
    scaled: ffmpeg::frame::Video,
}

/// Scaler plus the letterbox placement of its output
struct Scaler {
    context: ffmpeg::software::scaling::Context,
    source: (ffmpeg::format::Pixel, u32, u32),
    width: u32,
    height: u32,
    x: u32,
    y: u32,
}

// SwsContext is only touched by the owning decode thread
unsafe impl Send for FfmpegVideoDecoder {}

impl FfmpegVideoDecoder {
    fn open(stream: &format::stream::Stream, output: &OutputFormat) -> Result<(Self, VideoStreamInfo)> {
        let mut context =
            ffmpeg::codec::context::Context::from_parameters(stream.parameters()).open_err("video parameters")?;
        context.set_threading(ffmpeg::codec::threading::Config {
            kind: ffmpeg::codec::threading::Type::Frame,
            count: 0,
        });
        let decoder = context.decoder().video().open_err("video decoder")?;

        let rate = stream.avg_frame_rate();
        let stream_info = VideoStreamInfo {
            codec: decoder.id().name().to_string(),
            width: decoder.width(),
            height: decoder.height(),
            frame_rate: (rate.denominator() != 0 && rate.numerator() != 0)
                .then(|| f64::from(rate.numerator()) / f64::from(rate.denominator())),
            time_base: rational(stream.time_base()),
        };
        debug!("Video stream: {:?}", stream_info);

        Ok((
            Self {
                decoder,
                time_base: stream_info.time_base,
                scaler: None,
                output_width: output.width,
                output_height: output.height,
                decoded: ffmpeg::frame::Video::empty(),
                scaled: ffmpeg::frame::Video::empty(),
            },
            stream_info,
        ))
    }

    /// (Re)build the scaler when the decoded geometry or format changes
    fn scaler_for(&mut self) -> Result<&mut Scaler> {
        let source = (self.decoded.format(), self.decoded.width(), self.decoded.height());
        if self.scaler.as_ref().map(|s| s.source) != Some(source) {
            let (width, height) = fit(source.1, source.2, self.output_width, self.output_height);
            let context = ffmpeg::software::scaling::Context::get(
                source.0,
                source.1,
                source.2,
                ffmpeg::format::Pixel::BGRA,
                width,
                height,
                ffmpeg::software::scaling::Flags::BILINEAR,
            )
            .filter_err("scaler")?;
            debug!(
                "Scaler {:?} {}x{} -> BGRA {}x{}",
                source.0, source.1, source.2, width, height
            );
            self.scaler = Some(Scaler {
                context,
                source,
                width,
                height,
                x: (self.output_width - width) / 2,
                y: (self.output_height - height) / 2,
            });
        }
        self.scaler
            .as_mut()
            .ok_or_else(|| PlayerError::Filter("scaler missing".to_string()))
    }
}

/// Largest size with the source aspect ratio that fits the output
fn fit(src_width: u32, src_height: u32, width: u32, height: u32) -> (u32, u32) {
    if src_width == 0 || src_height == 0 {
        return (width, height);
    }
    let scaled_height = (u64::from(width) * u64::from(src_height) / u64::from(src_width)) as u32;
    if scaled_height <= height {
        (width, scaled_height.max(1))
    } else {
        let scaled_width = (u64::from(height) * u64::from(src_width) / u64::from(src_height)) as u32;
        (scaled_width.clamp(1, width), height)
    }
}

impl VideoDecoder for FfmpegVideoDecoder {
    fn time_base(&self) -> Rational {
        self.time_base
    }

    fn send_packet(&mut self, packet: Packet) -> Result<()> {
        let packet = take_packet(packet)?;
        match self.decoder.send_packet(&packet) {
            Ok(()) => Ok(()),
            // frames are pending; they are drained before the next packet
            Err(e) if is_again(&e) => Ok(()),
            Err(e) => Err(PlayerError::Decode(format!("video packet: {}", e))),
        }
    }

    fn send_eof(&mut self) -> Result<()> {
        self.decoder.send_eof().decode_err("video eof")
    }

    fn receive_frame(&mut self, out: &mut VideoFrame) -> Result<bool> {
        match self.decoder.receive_frame(&mut self.decoded) {
            Ok(()) => {}
            Err(ffmpeg::Error::Eof) => return Ok(false),
            Err(e) if is_again(&e) => return Ok(false),
            Err(e) => return Err(PlayerError::Decode(format!("video frame: {}", e))),
        }
        let pts = self.decoded.timestamp().or(self.decoded.pts()).unwrap_or(0);
        let (width, height) = (self.output_width, self.output_height);

        let mut scaled = std::mem::replace(&mut self.scaled, ffmpeg::frame::Video::empty());
        let decoded = std::mem::replace(&mut self.decoded, ffmpeg::frame::Video::empty());
        let result = self.scaler_for().and_then(|scaler| {
            scaler.context.run(&decoded, &mut scaled).filter_err("scale")?;
            Ok((scaler.width, scaler.height, scaler.x, scaler.y))
        });
        self.decoded = decoded;
        let (fit_width, fit_height, x, y) = result?;

        out.resize(width, height);
        out.pts = pts;
        out.time_base = self.time_base;
        if fit_width != width || fit_height != height {
            out.fill([0, 0, 0, 255]);
        }
        let src_stride = scaled.stride(0);
        let dst_stride = out.stride();
        let row_bytes = fit_width as usize * 4;
        let src = scaled.data(0);
        for row in 0..fit_height as usize {
            let src_row = &src[row * src_stride..row * src_stride + row_bytes];
            let offset = (row + y as usize) * dst_stride + x as usize * 4;
            out.data[offset..offset + row_bytes].copy_from_slice(src_row);
        }
        self.scaled = scaled;
        Ok(true)
    }

    fn flush(&mut self) {
        self.decoder.flush();
    }

    fn set_skip_non_reference(&mut self, skip: bool) {
        let discard = if skip {
            ffmpeg::codec::discard::Discard::NonReference
        } else {
            ffmpeg::codec::discard::Discard::Default
        };
        self.decoder.skip_frame(discard);
    }
}

struct FfmpegAudioDecoder {
    decoder: ffmpeg::decoder::Audio,
    time_base: Rational,
    resampler: Option<(ffmpeg::software::resampling::Context, (ffmpeg::format::Sample, u64, u32))>,
    sample_rate: u32,
    channels: u16,
    decoded: ffmpeg::frame::Audio,
}

// SwrContext is only touched by the owning decode thread
unsafe impl Send for FfmpegAudioDecoder {}

impl FfmpegAudioDecoder {
    fn open(stream: &format::stream::Stream, output: &OutputFormat) -> Result<(Self, AudioStreamInfo)> {
        let context =
            ffmpeg::codec::context::Context::from_parameters(stream.parameters()).open_err("audio parameters")?;
        let decoder = context.decoder().audio().open_err("audio decoder")?;

        let stream_info = AudioStreamInfo {
            codec: decoder.id().name().to_string(),
            sample_rate: decoder.rate(),
            channels: decoder.channels(),
            time_base: rational(stream.time_base()),
        };
        debug!("Audio stream: {:?}", stream_info);

        Ok((
            Self {
                decoder,
                time_base: stream_info.time_base,
                resampler: None,
                sample_rate: output.sample_rate,
                channels: output.channels.max(1),
                decoded: ffmpeg::frame::Audio::empty(),
            },
            stream_info,
        ))
    }

    fn resample(&mut self) -> Result<Vec<i16>> {
        let layout = if self.decoded.channel_layout().is_empty() {
            ffmpeg::ChannelLayout::default(i32::from(self.decoded.channels()))
        } else {
            self.decoded.channel_layout()
        };
        let source = (self.decoded.format(), layout.bits(), self.decoded.rate());
        if self.resampler.as_ref().map(|(_, s)| *s) != Some(source) {
            let context = ffmpeg::software::resampling::Context::get(
                source.0,
                layout,
                source.2,
                ffmpeg::format::Sample::I16(ffmpeg::format::sample::Type::Packed),
                ffmpeg::ChannelLayout::default(i32::from(self.channels)),
                self.sample_rate,
            )
            .filter_err("resampler")?;
            self.resampler = Some((context, source));
        }
        let (context, _) = self
            .resampler
            .as_mut()
            .ok_or_else(|| PlayerError::Filter("resampler missing".to_string()))?;

        let mut converted = ffmpeg::frame::Audio::empty();
        context.run(&self.decoded, &mut converted).filter_err("resample")?;
        let bytes = converted.samples() * usize::from(self.channels) * 2;
        let data = converted.data(0);
        Ok(bytemuck::pod_collect_to_vec(&data[..bytes.min(data.len())]))
    }
}

impl AudioDecoder for FfmpegAudioDecoder {
    fn time_base(&self) -> Rational {
        self.time_base
    }

    fn send_packet(&mut self, packet: Packet) -> Result<()> {
        let packet = take_packet(packet)?;
        match self.decoder.send_packet(&packet) {
            Ok(()) => Ok(()),
            Err(e) if is_again(&e) => Ok(()),
            Err(e) => Err(PlayerError::Decode(format!("audio packet: {}", e))),
        }
    }

    fn send_eof(&mut self) -> Result<()> {
        self.decoder.send_eof().decode_err("audio eof")
    }

    fn receive_frame(&mut self) -> Result<Option<PcmPacket>> {
        match self.decoder.receive_frame(&mut self.decoded) {
            Ok(()) => {}
            Err(ffmpeg::Error::Eof) => return Ok(None),
            Err(e) if is_again(&e) => return Ok(None),
            Err(e) => return Err(PlayerError::Decode(format!("audio frame: {}", e))),
        }
        let pts = self.decoded.timestamp().or(self.decoded.pts());
        let samples = self.resample()?;
        Ok(Some(PcmPacket::new(samples, self.channels, pts)))
    }

    fn flush(&mut self) {
        self.decoder.flush();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_fit_keeps_aspect_ratio() {
        assert_eq!(fit(1920, 1080, 1280, 720), (1280, 720));
        assert_eq!(fit(720, 576, 1280, 720), (900, 720));
        assert_eq!(fit(1920, 800, 1280, 720), (1280, 533));
        assert_eq!(fit(0, 0, 64, 36), (64, 36));
    }

    #[test]
    fn test_backend_leaves_test_patterns_alone() {
        let backend = FfmpegBackend::new();
        assert!(!backend.accepts("testsrc:duration=1"));
        assert!(backend.accepts("/media/movie.mkv"));
        assert!(is_network("rtsp://camera/stream"));
    }

    #[test]
    fn test_open_missing_file() {
        let output = OutputFormat {
            width: 64,
            height: 36,
            sample_rate: 48_000,
            channels: 2,
        };
        let result = FfmpegBackend::new().open("/nonexistent/stbplayer.mkv", &output);
        assert!(matches!(result, Err(PlayerError::Open(_))));
    }
}
