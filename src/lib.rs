//! stbplayer: media playback engine for set-top boxes
//!
//! One [`player::Player`] drives one media session at a time: a demuxer
//! thread feeds bounded packet queues, one decoder thread per stream fills
//! the video [`decoder::FrameRing`] and the audio ring, and the renderer and
//! audio IO threads present the result against a single master clock.
//!
//! Codecs, audio devices and the display sit behind traits
//! ([`decoder::MediaBackend`], [`audio::AudioHost`], [`renderer::VideoSink`]).
//! FFmpeg and cpal implementations are behind the `ffmpeg` and `cpal`
//! features; the `testsrc:` backend, [`audio::NullDevice`] and
//! [`renderer::NullSink`] are always available.

pub mod audio;
pub mod decoder;
pub mod player;
pub mod renderer;
pub mod utils;

pub use player::{Notification, Player, PlayerBuilder, PlayerStatus, PlaylistItem, StatusSink};
pub use utils::error::{PlayerError, Result};
