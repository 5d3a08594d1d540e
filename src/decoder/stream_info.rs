//! Media stream information
//!
//! Container-level description of an opened locator: title, duration,
//! the selected elementary streams and the chapter table.

use crate::decoder::Rational;
use std::path::Path;
use std::time::Duration;

/// Description of an opened media locator
#[derive(Debug, Clone, Default)]
pub struct MediaInfo {
    /// File path or URL as handed to `play()`
    pub locator: String,

    /// Title tag from the container metadata
    pub title: Option<String>,

    /// Container format name
    pub format: String,

    /// Total duration, when the container knows it
    pub duration: Option<Duration>,

    /// Selected video stream
    pub video: Option<VideoStreamInfo>,

    /// Selected audio stream
    pub audio: Option<AudioStreamInfo>,

    /// Chapter table, sorted by start time
    pub chapters: Vec<Chapter>,
}

/// Video stream information
#[derive(Debug, Clone, PartialEq)]
pub struct VideoStreamInfo {
    /// Codec name
    pub codec: String,

    /// Coded width
    pub width: u32,

    /// Coded height
    pub height: u32,

    /// Average frame rate, when known
    pub frame_rate: Option<f64>,

    /// Stream time base
    pub time_base: Rational,
}

/// Audio stream information
#[derive(Debug, Clone, PartialEq)]
pub struct AudioStreamInfo {
    /// Codec name
    pub codec: String,

    /// Source sample rate
    pub sample_rate: u32,

    /// Source channel count
    pub channels: u16,

    /// Stream time base
    pub time_base: Rational,
}

/// One entry of the chapter table
#[derive(Debug, Clone, PartialEq)]
pub struct Chapter {
    /// Chapter title, if tagged
    pub title: Option<String>,

    /// Start position
    pub start: Duration,

    /// End position
    pub end: Duration,
}

impl MediaInfo {
    /// Whether a video stream was selected
    pub fn has_video(&self) -> bool {
        self.video.is_some()
    }

    /// Whether an audio stream was selected
    pub fn has_audio(&self) -> bool {
        self.audio.is_some()
    }

    /// Title for display: the metadata title, else the file stem
    pub fn display_title(&self) -> String {
        if let Some(title) = self.title.as_deref().filter(|t| !t.trim().is_empty()) {
            return title.trim().to_string();
        }
        let path = self.locator.rsplit("://").next().unwrap_or(&self.locator);
        Path::new(path)
            .file_stem()
            .map(|s| s.to_string_lossy().into_owned())
            .unwrap_or_else(|| self.locator.clone())
    }

    /// Index of the chapter containing `position`
    ///
    /// Positions before the first chapter map to `None`; positions past the
    /// last chapter's end map to the last chapter.
    pub fn chapter_at(&self, position: Duration) -> Option<usize> {
        self.chapters
            .iter()
            .rposition(|chapter| chapter.start <= position)
    }

    /// Clamp a seek target into the playable range
    pub fn clamp_position(&self, position: Duration) -> Duration {
        match self.duration {
            Some(duration) => position.min(duration),
            None => position,
        }
    }
}
