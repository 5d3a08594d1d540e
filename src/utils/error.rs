//! Error types for stbplayer
//!
//! This module defines the error taxonomy of the playback engine. Only
//! session-level outcomes and explicit operation results (open, seek, state
//! transitions) cross the public API; everything else is handled inside the
//! pipeline threads and reported through shared session state.

use thiserror::Error;

/// Main error type for the playback engine
#[derive(Error, Debug)]
pub enum PlayerError {
    /// The container or one of its streams could not be opened
    #[error("Open error: {0}")]
    Open(String),

    /// Neither an audio nor a video stream could be opened
    #[error("No playable streams: {0}")]
    NoStreams(String),

    /// A codec rejected a packet (non-fatal, the packet is skipped)
    #[error("Decode error: {0}")]
    Decode(String),

    /// A scaling/resampling stage failed to initialize (fatal to the session)
    #[error("Filter error: {0}")]
    Filter(String),

    /// The audio device ran out of data
    #[error("Audio device underrun")]
    DeviceUnderrun,

    /// The audio device failed in a way that cannot be recovered
    #[error("Audio device failure: {0}")]
    DeviceFatal(String),

    /// A seek request could not be executed; position is unchanged
    #[error("Seek failed: {0}")]
    SeekFailure(String),

    /// The operation is not legal in the current player state
    #[error("Cannot {op} while {status}")]
    InvalidState {
        /// Operation that was rejected
        op: &'static str,
        /// Player status at the time of the call
        status: String,
    },

    /// A blocking operation was cancelled by a concurrent stop
    #[error("Operation interrupted")]
    Interrupted,

    /// Configuration errors
    #[error("Configuration error: {0}")]
    Config(String),

    /// File I/O errors
    #[error("File error: {0}")]
    Io(#[from] std::io::Error),

    /// Invalid input errors
    #[error("Invalid input: {0}")]
    InvalidInput(String),

    /// Generic error for unexpected situations
    #[error("Internal error: {0}")]
    Internal(String),
}

#[cfg(feature = "ffmpeg")]
impl From<ffmpeg_next::Error> for PlayerError {
    fn from(err: ffmpeg_next::Error) -> Self {
        PlayerError::Decode(format!("FFmpeg error: {}", err))
    }
}

impl Clone for PlayerError {
    fn clone(&self) -> Self {
        match self {
            PlayerError::Open(msg) => PlayerError::Open(msg.clone()),
            PlayerError::NoStreams(msg) => PlayerError::NoStreams(msg.clone()),
            PlayerError::Decode(msg) => PlayerError::Decode(msg.clone()),
            PlayerError::Filter(msg) => PlayerError::Filter(msg.clone()),
            PlayerError::DeviceUnderrun => PlayerError::DeviceUnderrun,
            PlayerError::DeviceFatal(msg) => PlayerError::DeviceFatal(msg.clone()),
            PlayerError::SeekFailure(msg) => PlayerError::SeekFailure(msg.clone()),
            PlayerError::InvalidState { op, status } => PlayerError::InvalidState {
                op,
                status: status.clone(),
            },
            PlayerError::Interrupted => PlayerError::Interrupted,
            PlayerError::Config(msg) => PlayerError::Config(msg.clone()),
            // io::Error is not Clone; keep kind and message
            PlayerError::Io(err) => PlayerError::Io(std::io::Error::new(err.kind(), err.to_string())),
            PlayerError::InvalidInput(msg) => PlayerError::InvalidInput(msg.clone()),
            PlayerError::Internal(msg) => PlayerError::Internal(msg.clone()),
        }
    }
}

impl PlayerError {
    /// Create an invalid-state error for `op` rejected in `status`
    pub fn invalid_state(op: &'static str, status: impl std::fmt::Display) -> Self {
        PlayerError::InvalidState {
            op,
            status: status.to_string(),
        }
    }

    /// Whether this error ends the session it occurred in
    pub fn is_fatal(&self) -> bool {
        !matches!(
            self,
            PlayerError::Decode(_) | PlayerError::DeviceUnderrun | PlayerError::SeekFailure(_)
        )
    }
}

/// Convenience type alias for Results in stbplayer
pub type Result<T> = std::result::Result<T, PlayerError>;

/// Extension trait for converting other errors to PlayerError
pub trait IntoPlayerError<T> {
    /// Map the error into an [`PlayerError::Open`] with the given context
    fn open_err(self, context: &str) -> Result<T>;
    fn decode_err(self, context: &str) -> Result<T>;
    fn filter_err(self, context: &str) -> Result<T>;
    fn device_err(self, context: &str) -> Result<T>;
    fn config_err(self, context: &str) -> Result<T>;
}

impl<T, E: std::fmt::Display> IntoPlayerError<T> for std::result::Result<T, E> {
    fn open_err(self, context: &str) -> Result<T> {
        self.map_err(|e| PlayerError::Open(format!("{}: {}", context, e)))
    }

    fn decode_err(self, context: &str) -> Result<T> {
        self.map_err(|e| PlayerError::Decode(format!("{}: {}", context, e)))
    }

    fn filter_err(self, context: &str) -> Result<T> {
        self.map_err(|e| PlayerError::Filter(format!("{}: {}", context, e)))
    }

    fn device_err(self, context: &str) -> Result<T> {
        self.map_err(|e| PlayerError::DeviceFatal(format!("{}: {}", context, e)))
    }

    fn config_err(self, context: &str) -> Result<T> {
        self.map_err(|e| PlayerError::Config(format!("{}: {}", context, e)))
    }
}

/// Helper macro for creating internal errors with file and line information
#[macro_export]
macro_rules! internal_error {
    ($msg:expr) => {
        $crate::utils::error::PlayerError::Internal(
            format!("{} at {}:{}", $msg, file!(), line!())
        )
    };
    ($fmt:expr, $($arg:tt)*) => {
        $crate::utils::error::PlayerError::Internal(
            format!("{} at {}:{}", format!($fmt, $($arg)*), file!(), line!())
        )
    };
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_display() {
        let err = PlayerError::Open("no such file".to_string());
        assert_eq!(err.to_string(), "Open error: no such file");

        let err = PlayerError::invalid_state("pause", "READY");
        assert_eq!(err.to_string(), "Cannot pause while READY");
    }

    #[test]
    fn test_error_conversion() {
        let io_err = std::io::Error::new(std::io::ErrorKind::NotFound, "File not found");
        let player_err: PlayerError = io_err.into();
        assert!(matches!(player_err, PlayerError::Io(_)));
    }

    #[test]
    fn test_clone_keeps_variant() {
        let io = PlayerError::Io(std::io::Error::new(std::io::ErrorKind::NotFound, "gone"));
        match io.clone() {
            PlayerError::Io(err) => assert_eq!(err.kind(), std::io::ErrorKind::NotFound),
            other => panic!("unexpected {:?}", other),
        }
        assert!(matches!(PlayerError::Filter("x".into()).clone(), PlayerError::Filter(_)));
    }

    #[test]
    fn test_fatality() {
        assert!(!PlayerError::Decode("corrupt slice".into()).is_fatal());
        assert!(!PlayerError::DeviceUnderrun.is_fatal());
        assert!(PlayerError::Filter("swscale".into()).is_fatal());
        assert!(PlayerError::DeviceFatal("unplugged".into()).is_fatal());
    }

    #[test]
    fn test_into_player_error_trait() {
        let result: std::result::Result<(), &str> = Err("bad header");
        match result.open_err("Probing container") {
            Err(PlayerError::Open(msg)) => {
                assert_eq!(msg, "Probing container: bad header");
            }
            _ => panic!("Expected Open error"),
        }
    }

    #[test]
    fn test_internal_error_macro() {
        let err = internal_error!("slot {} missing", 3);
        assert!(err.to_string().contains("slot 3 missing"));
    }
}
