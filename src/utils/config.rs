//! Configuration management for stbplayer
//!
//! Configuration is layered: built-in defaults, then the system file, then the
//! user file, then an optional explicit file, then `STBPLAYER_*` environment
//! variables. Files may be partial; each layer only overrides the keys it sets.

use crate::utils::error::{IntoPlayerError, PlayerError, Result};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Main engine configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Default)]
#[serde(default)]
pub struct Config {
    /// Session and facade behavior
    pub player: PlayerConfig,

    /// Video pipeline settings
    pub video: VideoConfig,

    /// Audio pipeline settings
    pub audio: AudioConfig,

    /// General application settings
    pub general: GeneralConfig,
}

/// Facade / session configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct PlayerConfig {
    /// Frames the FrameRing must hold before leaving BUFFERING
    pub prebuffer_frames: usize,

    /// PCM (in ms) required before leaving BUFFERING on audio-only media
    pub prebuffer_audio_ms: u64,

    /// Period of the progress timer notification while playing
    pub progress_interval_ms: u64,

    /// Delay of the overlay-hide timer after a status change
    pub overlay_timeout_ms: u64,

    /// Start the next playlist item when a session ends on its own
    pub auto_advance: bool,

    /// How long audio must look starved before the renderer resyncs the clock
    pub deadlock_grace_ms: u64,
}

/// Video pipeline configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct VideoConfig {
    /// Output width handed to the video sink
    pub width: u32,

    /// Output height handed to the video sink
    pub height: u32,

    /// Number of decoded frames in the FrameRing
    pub frame_ring_capacity: usize,

    /// Number of compressed packets queued ahead of the decoder
    pub packet_queue_capacity: usize,

    /// Lag beyond which the renderer drops frames and asks for fast-skip
    pub late_frame_threshold_ms: u64,

    /// Waits shorter than this are skipped by the renderer
    pub min_sleep_ms: u64,
}

/// Audio pipeline configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct AudioConfig {
    /// Decode and play the audio stream
    pub enabled: bool,

    /// Output sample rate
    pub sample_rate: u32,

    /// Output channel count (interleaved S16LE)
    pub channels: u16,

    /// Device period size in frames
    pub period_frames: u32,

    /// Device hardware buffer size in frames
    pub buffer_frames: u32,

    /// Number of compressed packets queued ahead of the decoder
    pub packet_queue_capacity: usize,

    /// Decoded PCM held in the ring before the decoder waits
    pub max_buffered_ms: u64,
}

/// General application configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct GeneralConfig {
    /// Log level (trace, debug, info, warn, error)
    pub log_level: String,
}

impl Default for PlayerConfig {
    fn default() -> Self {
        Self {
            prebuffer_frames: 8,
            prebuffer_audio_ms: 500,
            progress_interval_ms: 1000,
            overlay_timeout_ms: 3000,
            auto_advance: true,
            deadlock_grace_ms: 250,
        }
    }
}

impl Default for VideoConfig {
    fn default() -> Self {
        Self {
            width: 1280,
            height: 720,
            frame_ring_capacity: 10,
            packet_queue_capacity: 1,
            late_frame_threshold_ms: 100,
            min_sleep_ms: 2,
        }
    }
}

impl Default for AudioConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            sample_rate: 48_000,
            channels: 2,
            period_frames: 1024,
            buffer_frames: 4096,
            packet_queue_capacity: 1,
            max_buffered_ms: 2000,
        }
    }
}

impl Default for GeneralConfig {
    fn default() -> Self {
        Self {
            log_level: "info".to_string(),
        }
    }
}

impl VideoConfig {
    /// Lag threshold as a duration
    pub fn late_frame_threshold(&self) -> Duration {
        Duration::from_millis(self.late_frame_threshold_ms)
    }
}

impl Config {
    /// Load configuration from the standard locations
    ///
    /// Sources, later overriding earlier:
    /// 1. Default values
    /// 2. System config file (/etc/stbplayer/config.toml)
    /// 3. User config file (~/.config/stbplayer/config.toml)
    /// 4. Environment variables (STBPLAYER_* prefix)
    pub fn load() -> Result<Self> {
        Self::load_with(None)
    }

    /// Load configuration, layering `explicit` after the user file
    pub fn load_with(explicit: Option<&Path>) -> Result<Self> {
        let mut paths: Vec<PathBuf> = [Self::system_config_path(), Self::user_config_path()]
            .into_iter()
            .flatten()
            .filter(|p| p.exists())
            .collect();

        if let Some(path) = explicit {
            if !path.exists() {
                return Err(PlayerError::Config(format!(
                    "Config file not found: {}",
                    path.display()
                )));
            }
            paths.push(path.to_path_buf());
        }

        let mut config = Self::from_files(&paths)?;
        config.apply_env_overrides(|key| std::env::var(key).ok())?;
        config.validate()?;
        Ok(config)
    }

    /// Build a configuration from defaults plus the given files, in order
    pub fn from_files(paths: &[PathBuf]) -> Result<Self> {
        let mut merged = toml::Value::try_from(Self::default())
            .config_err("Failed to serialize default config")?;

        for path in paths {
            let contents = std::fs::read_to_string(path)
                .config_err(&format!("Failed to read {}", path.display()))?;
            let layer: toml::Value = toml::from_str(&contents)
                .config_err(&format!("Failed to parse {}", path.display()))?;
            merge_values(&mut merged, layer);
            log::debug!("Merged configuration from {}", path.display());
        }

        merged.try_into().config_err("Invalid configuration")
    }

    /// Save configuration to the user config file
    pub fn save(&self) -> Result<()> {
        let path = Self::user_config_path()
            .ok_or_else(|| PlayerError::Config("Cannot determine user config path".to_string()))?;
        self.save_to(&path)
    }

    /// Save configuration as pretty TOML at `path`
    pub fn save_to(&self, path: &Path) -> Result<()> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent).config_err("Failed to create config directory")?;
        }

        let toml = toml::to_string_pretty(self).config_err("Failed to serialize config")?;
        std::fs::write(path, toml).config_err("Failed to write config file")?;
        Ok(())
    }

    /// Apply environment overrides read through `lookup`
    pub fn apply_env_overrides<F>(&mut self, lookup: F) -> Result<()>
    where
        F: Fn(&str) -> Option<String>,
    {
        fn parse<T: std::str::FromStr>(key: &str, value: String) -> Result<T> {
            value
                .trim()
                .parse()
                .map_err(|_| PlayerError::Config(format!("Invalid {}", key)))
        }

        if let Some(v) = lookup("STBPLAYER_VIDEO_WIDTH") {
            self.video.width = parse("STBPLAYER_VIDEO_WIDTH", v)?;
        }
        if let Some(v) = lookup("STBPLAYER_VIDEO_HEIGHT") {
            self.video.height = parse("STBPLAYER_VIDEO_HEIGHT", v)?;
        }
        if let Some(v) = lookup("STBPLAYER_FRAME_RING") {
            self.video.frame_ring_capacity = parse("STBPLAYER_FRAME_RING", v)?;
        }
        if let Some(v) = lookup("STBPLAYER_AUDIO_ENABLED") {
            self.audio.enabled = parse("STBPLAYER_AUDIO_ENABLED", v)?;
        }
        if let Some(v) = lookup("STBPLAYER_AUDIO_PERIOD") {
            self.audio.period_frames = parse("STBPLAYER_AUDIO_PERIOD", v)?;
        }
        if let Some(v) = lookup("STBPLAYER_LOG_LEVEL") {
            self.general.log_level = v;
        }

        Ok(())
    }

    /// Validate configuration values
    pub fn validate(&self) -> Result<()> {
        if self.video.width == 0 || self.video.height == 0 {
            return Err(PlayerError::Config("Video dimensions must be non-zero".to_string()));
        }

        if self.video.frame_ring_capacity < 2 {
            return Err(PlayerError::Config("frame_ring_capacity must be at least 2".to_string()));
        }

        if self.video.packet_queue_capacity == 0 || self.audio.packet_queue_capacity == 0 {
            return Err(PlayerError::Config("Packet queue capacity must be non-zero".to_string()));
        }

        if self.player.prebuffer_frames == 0
            || self.player.prebuffer_frames > self.video.frame_ring_capacity
        {
            return Err(PlayerError::Config(format!(
                "prebuffer_frames must be within 1..={}",
                self.video.frame_ring_capacity
            )));
        }

        if self.audio.sample_rate == 0 || self.audio.channels == 0 {
            return Err(PlayerError::Config("Audio format must be non-zero".to_string()));
        }

        if self.audio.period_frames == 0 || self.audio.buffer_frames < self.audio.period_frames * 2 {
            return Err(PlayerError::Config(
                "buffer_frames must hold at least two periods".to_string(),
            ));
        }

        if self.audio.max_buffered_ms < self.player.prebuffer_audio_ms {
            return Err(PlayerError::Config(
                "max_buffered_ms must not be below prebuffer_audio_ms".to_string(),
            ));
        }

        let valid_log_levels = ["trace", "debug", "info", "warn", "error"];
        if !valid_log_levels.contains(&self.general.log_level.as_str()) {
            return Err(PlayerError::Config(format!(
                "Invalid log level '{}', must be one of: {:?}",
                self.general.log_level, valid_log_levels
            )));
        }

        Ok(())
    }

    /// System config file path
    fn system_config_path() -> Option<PathBuf> {
        #[cfg(unix)]
        return Some(PathBuf::from("/etc/stbplayer/config.toml"));

        #[allow(unreachable_code)]
        None
    }

    /// User config file path
    fn user_config_path() -> Option<PathBuf> {
        dirs::config_dir().map(|p| p.join("stbplayer").join("config.toml"))
    }
}

/// Recursively overlay `layer` onto `base`, table by table
fn merge_values(base: &mut toml::Value, layer: toml::Value) {
    match (base, layer) {
        (toml::Value::Table(base), toml::Value::Table(layer)) => {
            for (key, value) in layer {
                match base.get_mut(&key) {
                    Some(existing) => merge_values(existing, value),
                    None => {
                        base.insert(key, value);
                    }
                }
            }
        }
        (base, layer) => *base = layer,
    }
}
