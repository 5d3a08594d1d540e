//! Player module for stbplayer
//!
//! The [`Player`] facade owns at most one session at a time. A session is the
//! set of pipeline threads started for one media locator: the demuxer
//! controller, a decoder per stream, the renderer and the audio IO thread.
//! Status changes, buffering progress and timers reach the host through
//! [`StatusSink`] subscribers on a dedicated notifier thread.

mod audio_decode;
mod controller;
mod media_player;
mod playlist;
mod session;
mod state;
mod video_decode;

pub use controller::SessionOutcome;
pub use media_player::{Player, PlayerBuilder};
pub use playlist::{Playlist, PlaylistItem};

use std::fmt;
use std::time::Duration;

/// Playback status reported by the facade
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum PlayerStatus {
    /// No session, or the last one has ended
    Ready,

    /// A session was started and is filling its buffers
    Buffering,

    /// Outputs are running
    Playing,

    /// Clock frozen, outputs silent
    Paused,
}

impl PlayerStatus {
    /// Whether the state machine allows moving from `self` to `next`
    pub fn can_transition_to(self, next: PlayerStatus) -> bool {
        use PlayerStatus::*;
        matches!(
            (self, next),
            (Ready, Buffering)
                | (Buffering, Playing)
                | (Buffering, Ready)
                | (Playing, Paused)
                | (Paused, Playing)
                | (Playing, Ready)
                | (Paused, Ready)
        )
    }

    /// Whether a session is attached
    pub fn is_active(self) -> bool {
        self != PlayerStatus::Ready
    }
}

impl fmt::Display for PlayerStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            PlayerStatus::Ready => "READY",
            PlayerStatus::Buffering => "BUFFERING",
            PlayerStatus::Playing => "PLAYING",
            PlayerStatus::Paused => "PAUSED",
        };
        f.write_str(name)
    }
}

/// Timers the player raises for the host UI
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum TimerId {
    /// Periodic tick while playing, for progress bars
    Progress,

    /// One-shot after each status change, to hide on-screen overlays
    OverlayHide,
}

/// Event delivered to subscribers
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Notification {
    /// Status changed, or an operation failed without changing it
    Status {
        status: PlayerStatus,
        previous: PlayerStatus,
        error: Option<String>,
    },

    /// A timer fired
    Timer { timer_id: TimerId },

    /// Buffering progress, 0 to 100, non-decreasing within one play call
    Buffering { percent: u8 },
}

/// Receiver of player notifications
///
/// Called on the notifier thread, never on the caller's thread, so a sink
/// may call back into the [`Player`].
pub trait StatusSink: Send + Sync {
    /// Handle one notification
    fn notify(&self, notification: &Notification);
}

impl<F> StatusSink for F
where
    F: Fn(&Notification) + Send + Sync,
{
    fn notify(&self, notification: &Notification) {
        self(notification)
    }
}

/// Handle returned by [`Player::subscribe`]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct SubscriptionId(pub(crate) u64);

/// Playback statistics of the current session
#[derive(Debug, Clone, Default, PartialEq)]
pub struct PlaybackStats {
    /// Video frames presented
    pub frames_rendered: u64,

    /// Video frames dropped for being late
    pub frames_dropped: u64,

    /// Times the renderer asked the decoder to skip non-reference frames
    pub skip_episodes: u64,

    /// Times the renderer resynced the clock because audio was starved
    pub deadlock_recoveries: u64,

    /// Audio underruns recovered
    pub xruns: u64,

    /// Audio writes that hit a full device buffer
    pub backoffs: u64,

    /// Timestamp of the most recently presented picture
    pub last_frame_time: Option<Duration>,

    /// Timestamp of the most recently decoded picture
    pub decoder_pts: Option<Duration>,

    /// Packets rejected by the decoders
    pub decode_errors: u64,
}
