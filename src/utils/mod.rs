//! Utility module for stbplayer
//!
//! This module provides common utilities used throughout the engine:
//! - Error handling with custom error types
//! - Layered configuration
//! - Small formatting helpers for logs and the console

pub mod config;
pub mod error;

// Re-export commonly used items
pub use config::{AudioConfig, Config, GeneralConfig, PlayerConfig, VideoConfig};
pub use error::{PlayerError, Result};

/// Load the engine configuration from the standard locations
///
/// See [`Config::load`] for the layering order.
pub fn load_config() -> Result<Config> {
    Config::load()
}

/// Format a duration for display
///
/// # Arguments
///
/// * `duration` - Duration to format
///
/// # Returns
///
/// Formatted string in the format "HH:MM:SS" or "MM:SS" for durations under an hour
pub fn format_duration(duration: std::time::Duration) -> String {
    let total_secs = duration.as_secs();
    let hours = total_secs / 3600;
    let minutes = (total_secs % 3600) / 60;
    let seconds = total_secs % 60;

    if hours > 0 {
        format!("{:02}:{:02}:{:02}", hours, minutes, seconds)
    } else {
        format!("{:02}:{:02}", minutes, seconds)
    }
}

/// Format a microsecond timestamp as seconds with millisecond precision
pub fn format_micros(micros: i64) -> String {
    let sign = if micros < 0 { "-" } else { "" };
    let abs = micros.unsigned_abs();
    format!("{}{}.{:03}s", sign, abs / 1_000_000, (abs % 1_000_000) / 1000)
}
