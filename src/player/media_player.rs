//! Player facade
//!
//! [`Player`] is the engine's public surface. Operations are synchronous and
//! may be called from any thread. Work that outlives a call (session end,
//! playlist advance, timers) runs on the player's supervisor thread, and
//! notifications reach subscribers on the notifier thread.

use crate::audio::{AudioHost, NullHost};
use crate::decoder::{BackendChain, MediaBackend, MediaInfo, OutputFormat, TestPatternBackend};
use crate::player::playlist::{Playlist, PlaylistItem};
use crate::player::session::{Session, Wiring};
use crate::player::state::{Notifier, StatusBoard, SupervisorEvent};
use crate::player::{
    Notification, PlaybackStats, PlayerStatus, SessionOutcome, StatusSink, SubscriptionId, TimerId,
};
use crate::renderer::{Display, NullSink, VideoSink};
use crate::utils::config::Config;
use crate::utils::error::{PlayerError, Result};
use crossbeam_channel::{after, never, select, tick, unbounded, Receiver, Sender};
use log::{debug, error, info, warn};
use parking_lot::Mutex;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

/// Builder for [`Player`]
pub struct PlayerBuilder {
    config: Config,
    backend: Option<Box<dyn MediaBackend>>,
    audio_host: Option<Box<dyn AudioHost>>,
    sink: Option<Box<dyn VideoSink>>,
    subscribers: Vec<Arc<dyn StatusSink>>,
}

impl Default for PlayerBuilder {
    fn default() -> Self {
        Self::new()
    }
}

impl PlayerBuilder {
    /// Create a builder with default configuration and devices
    pub fn new() -> Self {
        Self {
            config: Config::default(),
            backend: None,
            audio_host: None,
            sink: None,
            subscribers: Vec::new(),
        }
    }

    /// Set the engine configuration
    pub fn with_config(mut self, config: Config) -> Self {
        self.config = config;
        self
    }

    /// Use `backend` to open media instead of the built-in chain
    pub fn with_backend(mut self, backend: impl MediaBackend + 'static) -> Self {
        self.backend = Some(Box::new(backend));
        self
    }

    /// Use `host` to open audio devices
    pub fn with_audio_host(mut self, host: impl AudioHost + 'static) -> Self {
        self.audio_host = Some(Box::new(host));
        self
    }

    /// Render into `sink`
    pub fn with_sink(mut self, sink: impl VideoSink + 'static) -> Self {
        self.sink = Some(Box::new(sink));
        self
    }

    /// Register a subscriber before the first notification can fire
    pub fn with_subscriber(mut self, sink: Arc<dyn StatusSink>) -> Self {
        self.subscribers.push(sink);
        self
    }

    /// Validate the configuration and start the player threads
    pub fn build(self) -> Result<Player> {
        self.config.validate()?;
        let backend = self.backend.unwrap_or_else(|| Box::new(default_backend()));
        let audio_host = self.audio_host.unwrap_or_else(default_audio_host);
        let sink = self.sink.unwrap_or_else(|| Box::new(NullSink::new()));
        Player::start(self.config, backend, audio_host, sink, self.subscribers)
    }
}

/// Backends compiled into this build, most specific first
pub fn default_backend() -> BackendChain {
    let chain = BackendChain::new().with(TestPatternBackend::new());
    #[cfg(feature = "ffmpeg")]
    let chain = chain.with(crate::decoder::FfmpegBackend::new());
    chain
}

#[cfg(feature = "cpal")]
fn default_audio_host() -> Box<dyn AudioHost> {
    Box::new(crate::audio::CpalHost)
}

#[cfg(not(feature = "cpal"))]
fn default_audio_host() -> Box<dyn AudioHost> {
    Box::new(NullHost)
}

struct Inner {
    config: Config,
    backend: Box<dyn MediaBackend>,
    audio_host: Box<dyn AudioHost>,
    display: Arc<Mutex<Display>>,
    board: StatusBoard,
    session: Mutex<Option<Session>>,
    playlist: Mutex<Playlist>,
    /// Serializes session start-up between callers and the supervisor
    starting: Mutex<()>,
    events: Sender<SupervisorEvent>,
    next_session: AtomicU64,
    shutting_down: AtomicBool,
}

/// Media player facade
///
/// # Example
///
/// ```no_run
/// use stbplayer::player::PlayerBuilder;
///
/// let player = PlayerBuilder::new().build()?;
/// player.play(Some("testsrc:duration=5"))?;
/// player.pause()?;
/// player.play(None)?;
/// player.stop()?;
/// # Ok::<(), stbplayer::utils::error::PlayerError>(())
/// ```
pub struct Player {
    inner: Arc<Inner>,
    supervisor: Option<JoinHandle<()>>,
}

impl Player {
    /// Create a player with default configuration and devices
    pub fn new() -> Result<Self> {
        PlayerBuilder::new().build()
    }

    fn start(
        config: Config,
        backend: Box<dyn MediaBackend>,
        audio_host: Box<dyn AudioHost>,
        sink: Box<dyn VideoSink>,
        subscribers: Vec<Arc<dyn StatusSink>>,
    ) -> Result<Self> {
        let notifier = Notifier::start()?;
        for sink in subscribers {
            notifier.subscribe(sink);
        }
        let (events, event_rx) = unbounded();
        let inner = Arc::new(Inner {
            config,
            backend,
            audio_host,
            display: Arc::new(Mutex::new(Display::new(sink))),
            board: StatusBoard::new(notifier, events.clone()),
            session: Mutex::new(None),
            playlist: Mutex::new(Playlist::default()),
            starting: Mutex::new(()),
            events,
            next_session: AtomicU64::new(1),
            shutting_down: AtomicBool::new(false),
        });

        let supervised = Arc::clone(&inner);
        let supervisor = thread::Builder::new()
            .name("supervisor".to_string())
            .spawn(move || supervise(supervised, event_rx))?;
        info!("Player ready");

        Ok(Self {
            inner,
            supervisor: Some(supervisor),
        })
    }

    /// Start playing `locator`, or resume a paused session with `None`
    ///
    /// Opening is synchronous: `Open` and `NoStreams` errors are returned
    /// here and the player stays `READY`. On success the call blocks while
    /// the session buffers and returns once it is `PLAYING`. A concurrent
    /// [`stop`](Self::stop) ends the wait with `Interrupted`.
    pub fn play(&self, locator: Option<&str>) -> Result<()> {
        match locator {
            Some(locator) => self.inner.start_session(locator, None),
            None => self.inner.resume(),
        }
    }

    /// Freeze playback; only legal while `PLAYING`
    pub fn pause(&self) -> Result<()> {
        let slot = self.inner.session.lock();
        let status = self.inner.board.status();
        let session = match (status, slot.as_ref()) {
            (PlayerStatus::Playing, Some(session)) => session,
            _ => return Err(PlayerError::invalid_state("pause", status)),
        };
        session.ctx.pause();
        self.inner.board.transition(PlayerStatus::Paused, None);
        Ok(())
    }

    /// Tear the session down and return to `READY`
    ///
    /// Suppresses the playlist auto-advance the session's end would trigger.
    pub fn stop(&self) -> Result<()> {
        if self.inner.stop_session() {
            Ok(())
        } else {
            Err(PlayerError::invalid_state("stop", self.inner.board.status()))
        }
    }

    /// Seek to an absolute position, clamped to the media duration
    pub fn seek(&self, position: Duration) -> Result<()> {
        let (ctx, info) = self.inner.seekable("seek")?;
        let target = info.clamp_position(position);
        ctx.request_seek(target.as_micros() as i64)
    }

    /// Seek `delta` chapters away from the current one
    ///
    /// Past the first or last chapter (or without chapters) the neighbouring
    /// playlist item is played instead. Fails with `SeekFailure` when there
    /// is neither, leaving the position unchanged.
    pub fn seek_chapter(&self, delta: i32) -> Result<()> {
        let (ctx, info) = self.inner.seekable("seek chapter")?;
        let now = Duration::from_micros(ctx.clock.now().max(0) as u64);
        let chapters = info.chapters.len() as i64;
        let target = match info.chapter_at(now) {
            Some(current) => current as i64 + delta as i64,
            None if delta > 0 => delta as i64 - 1,
            None => -1,
        };

        if (0..chapters).contains(&target) {
            let chapter = &info.chapters[target as usize];
            debug!("Seeking to chapter {} ({:?})", target, chapter.title);
            return ctx.request_seek(chapter.start.as_micros() as i64);
        }

        let step = delta.signum() as i64;
        let neighbour = {
            let playlist = self.inner.playlist.lock();
            playlist
                .position_of(&info.locator)
                .filter(|_| step != 0)
                .and_then(|index| playlist.offset_from(index, step))
        };
        match neighbour {
            Some(index) => self.inner.play_index(index),
            None => Err(PlayerError::SeekFailure(
                "no chapter or playlist item in that direction".to_string(),
            )),
        }
    }

    /// Current status
    pub fn status(&self) -> PlayerStatus {
        self.inner.board.status()
    }

    /// Locator of the current session
    pub fn media_file(&self) -> Option<String> {
        self.inner.session.lock().as_ref().map(|s| s.locator.clone())
    }

    /// Title of the current media
    pub fn title(&self) -> Option<String> {
        self.inner
            .session
            .lock()
            .as_ref()
            .map(|s| s.title.clone().unwrap_or_else(|| s.info.display_title()))
    }

    /// Duration of the current media, when the container knows it
    pub fn duration(&self) -> Option<Duration> {
        self.inner.session.lock().as_ref().and_then(|s| s.info.duration)
    }

    /// Master clock position of the current session
    pub fn time(&self) -> Option<Duration> {
        let clock = self.inner.session.lock().as_ref().map(|s| s.ctx.clock.clone())?;
        Some(Duration::from_micros(clock.now().max(0) as u64))
    }

    /// Buffer fill, 0 to 100
    ///
    /// While `BUFFERING` this is the published progress; while playing it is
    /// the current fill relative to the prebuffer target.
    pub fn buffer_state(&self) -> u8 {
        match self.inner.board.status() {
            PlayerStatus::Ready => 0,
            PlayerStatus::Buffering => self.inner.board.buffer_percent(),
            PlayerStatus::Playing | PlayerStatus::Paused => self
                .inner
                .session
                .lock()
                .as_ref()
                .map_or(0, |s| s.fill_percent()),
        }
    }

    /// Description of the current media
    pub fn media_info(&self) -> Option<Arc<MediaInfo>> {
        self.inner.session.lock().as_ref().map(|s| Arc::clone(&s.info))
    }

    /// Replace the playlist and play item `selected`
    ///
    /// An empty list clears the playlist without touching playback.
    pub fn set_playlist(&self, items: Vec<PlaylistItem>, selected: usize) -> Result<()> {
        let empty = items.is_empty();
        let count = items.len();
        if !self.inner.playlist.lock().replace(items, selected) {
            return Err(PlayerError::InvalidInput(format!(
                "playlist item {} out of range ({} items)",
                selected, count
            )));
        }
        info!("Playlist set with {} items", count);
        if empty {
            return Ok(());
        }
        self.inner.play_index(selected)
    }

    /// Wrap the playlist around at either end
    pub fn set_repeat(&self, repeat: bool) {
        self.inner.playlist.lock().set_repeat(repeat);
    }

    /// Snapshot of the playlist
    pub fn playlist(&self) -> Playlist {
        self.inner.playlist.lock().clone()
    }

    /// Play the playlist item after the current one
    pub fn next(&self) -> Result<()> {
        self.inner.advance(1)
    }

    /// Play the playlist item before the current one
    pub fn previous(&self) -> Result<()> {
        self.inner.advance(-1)
    }

    /// Receive status, timer and buffering notifications
    pub fn subscribe(&self, sink: Arc<dyn StatusSink>) -> SubscriptionId {
        self.inner.board.notifier().subscribe(sink)
    }

    /// Stop delivering notifications to `id`
    pub fn unsubscribe(&self, id: SubscriptionId) -> bool {
        self.inner.board.notifier().unsubscribe(id)
    }

    /// Redraw the last rendered frame; `false` if nothing was rendered yet
    pub fn repaint(&self) -> Result<bool> {
        self.inner.display.lock().repaint()
    }

    /// Counters of the current session
    pub fn stats(&self) -> PlaybackStats {
        let slot = self.inner.session.lock();
        let Some(session) = slot.as_ref() else {
            return PlaybackStats::default();
        };
        let mut stats = PlaybackStats {
            decoder_pts: session
                .ctx
                .decoder_pts()
                .map(|pts| Duration::from_micros(pts.max(0) as u64)),
            decode_errors: session.ctx.decode_errors.load(Ordering::Relaxed),
            ..PlaybackStats::default()
        };
        if let Some(render) = session.render_stats() {
            stats.frames_rendered = render.frames_rendered;
            stats.frames_dropped = render.frames_dropped;
            stats.skip_episodes = render.skip_episodes;
            stats.deadlock_recoveries = render.deadlock_recoveries;
            stats.last_frame_time = render.last_frame_time.map(|pts| Duration::from_micros(pts.max(0) as u64));
        }
        if let Some(audio) = &session.ctx.audio {
            let output = audio.stats();
            stats.xruns = output.xruns;
            stats.backoffs = output.backoffs;
        }
        stats
    }

    /// Message of the most recent failure
    pub fn last_error(&self) -> Option<String> {
        self.inner.board.last_error()
    }

    /// The engine configuration
    pub fn config(&self) -> &Config {
        &self.inner.config
    }
}

impl Drop for Player {
    fn drop(&mut self) {
        self.inner.shutting_down.store(true, Ordering::Release);
        self.inner.stop_session();
        let _ = self.inner.events.send(SupervisorEvent::Shutdown);
        if let Some(supervisor) = self.supervisor.take() {
            if supervisor.join().is_err() {
                warn!("Supervisor thread panicked");
            }
        }
        // a session the supervisor started while shutting down
        self.inner.stop_session();
        self.inner.board.notifier().shutdown();
        info!("Player shut down");
    }
}

impl Inner {
    fn output_format(&self) -> OutputFormat {
        OutputFormat {
            width: self.config.video.width,
            height: self.config.video.height,
            sample_rate: self.config.audio.sample_rate,
            channels: self.config.audio.channels,
        }
    }

    /// Open `locator`, buffer, and start the outputs
    fn start_session(&self, locator: &str, title: Option<String>) -> Result<()> {
        let _starting = self.starting.lock();
        if self.shutting_down.load(Ordering::Acquire) {
            return Err(PlayerError::Interrupted);
        }
        self.stop_session();

        let opened = match self.backend.open(locator, &self.output_format()) {
            Ok(opened) => opened,
            Err(e) => {
                error!("Cannot open {}: {}", locator, e);
                self.board.report_error(&e.to_string());
                return Err(e);
            }
        };

        let id = self.next_session.fetch_add(1, Ordering::Relaxed);
        let (ctx, targets) = {
            let mut slot = self.session.lock();
            let wiring = Wiring {
                config: &self.config,
                audio_host: self.audio_host.as_ref(),
                display: &self.display,
                events: self.events.clone(),
            };
            let session = match Session::start(id, locator, title, opened, wiring) {
                Ok(session) => session,
                Err(e) => {
                    error!("Cannot start {}: {}", locator, e);
                    self.board.report_error(&e.to_string());
                    return Err(e);
                }
            };
            let ctx = Arc::clone(&session.ctx);
            let targets = session.buffer_targets();
            *slot = Some(session);
            self.board.transition(PlayerStatus::Buffering, None);
            (ctx, targets)
        };

        let buffered = Session::wait_buffered(&ctx, targets, |percent| self.board.set_buffering(percent));

        let mut slot = self.session.lock();
        let current = slot.as_ref().is_some_and(|s| s.ctx.id == id);
        match (buffered, current) {
            (Ok(()), true) => {
                let started = slot.as_mut().map_or(Ok(()), |session| session.start_outputs());
                match started {
                    Ok(()) => {
                        self.board.transition(PlayerStatus::Playing, None);
                        Ok(())
                    }
                    Err(e) => {
                        let session = slot.take();
                        drop(slot);
                        if let Some(session) = session {
                            session.teardown();
                        }
                        self.board.transition(PlayerStatus::Ready, Some(e.to_string()));
                        Err(e)
                    }
                }
            }
            (Ok(()), false) => Err(PlayerError::Interrupted),
            (Err(e), true) => {
                let session = slot.take();
                drop(slot);
                if let Some(session) = session {
                    session.teardown();
                }
                self.board.transition(PlayerStatus::Ready, Some(e.to_string()));
                Err(e)
            }
            (Err(e), false) => Err(e),
        }
    }

    /// Resume a paused session
    fn resume(&self) -> Result<()> {
        let slot = self.session.lock();
        let status = self.board.status();
        let session = match (status, slot.as_ref()) {
            (PlayerStatus::Paused, Some(session)) => session,
            _ => return Err(PlayerError::invalid_state("resume", status)),
        };
        session.ctx.resume();
        self.board.transition(PlayerStatus::Playing, None);
        Ok(())
    }

    /// Stop the current session on request; `false` if there was none
    fn stop_session(&self) -> bool {
        let Some(session) = self.session.lock().take() else {
            return false;
        };
        session.ctx.request_stop();
        session.teardown();
        self.board.transition(PlayerStatus::Ready, None);
        true
    }

    /// Session context and media info, if seeking is legal now
    fn seekable(&self, op: &'static str) -> Result<(Arc<crate::player::session::SessionContext>, Arc<MediaInfo>)> {
        let slot = self.session.lock();
        let status = self.board.status();
        match (status, slot.as_ref()) {
            (PlayerStatus::Playing | PlayerStatus::Paused, Some(session)) => {
                Ok((Arc::clone(&session.ctx), Arc::clone(&session.info)))
            }
            _ => Err(PlayerError::invalid_state(op, status)),
        }
    }

    fn play_index(&self, index: usize) -> Result<()> {
        let item = {
            let mut playlist = self.playlist.lock();
            playlist.select(index).cloned()
        };
        match item {
            Some(item) => {
                info!("Playing playlist item {}: {}", index, item.locator);
                self.start_session(&item.locator, item.title)
            }
            None => Err(PlayerError::InvalidInput(format!("no playlist item {}", index))),
        }
    }

    fn advance(&self, delta: i64) -> Result<()> {
        let index = self.playlist.lock().offset(delta);
        match index {
            Some(index) => self.play_index(index),
            None => Err(PlayerError::InvalidInput("no playlist item in that direction".to_string())),
        }
    }

    /// Handle the end of session `id` reported by its controller
    fn finish_session(&self, id: u64) {
        let session = {
            let mut slot = self.session.lock();
            match slot.as_ref() {
                Some(session) if session.ctx.id == id => slot.take(),
                _ => None,
            }
        };
        let Some(session) = session else {
            return;
        };

        let stop_requested = session.ctx.stop_requested();
        let outcome = session.teardown();
        let error = match &outcome {
            SessionOutcome::Failed(e) => Some(e.to_string()),
            _ => None,
        };
        self.board.transition(PlayerStatus::Ready, error);

        let advance = !stop_requested
            && self.config.player.auto_advance
            && !self.shutting_down.load(Ordering::Acquire)
            && matches!(outcome, SessionOutcome::EndOfStream | SessionOutcome::Failed(_));
        if !advance {
            return;
        }
        let next = self.playlist.lock().offset(1);
        if let Some(index) = next {
            if let Err(e) = self.play_index(index) {
                warn!("Playlist advance to item {} failed: {}", index, e);
            }
        }
    }
}

fn supervise(inner: Arc<Inner>, events: Receiver<SupervisorEvent>) {
    let progress = tick(Duration::from_millis(inner.config.player.progress_interval_ms.max(1)));
    let overlay_timeout = Duration::from_millis(inner.config.player.overlay_timeout_ms);
    let mut overlay_at: Option<Instant> = None;

    loop {
        let overlay = match overlay_at {
            Some(at) => after(at.saturating_duration_since(Instant::now())),
            None => never(),
        };
        select! {
            recv(events) -> event => match event {
                Ok(SupervisorEvent::SessionEnded { id }) => inner.finish_session(id),
                Ok(SupervisorEvent::StatusChanged) => overlay_at = Some(Instant::now() + overlay_timeout),
                Ok(SupervisorEvent::Shutdown) | Err(_) => break,
            },
            recv(progress) -> _ => {
                if inner.board.status() == PlayerStatus::Playing {
                    inner.board.notifier().send(Notification::Timer { timer_id: TimerId::Progress });
                }
            },
            recv(overlay) -> _ => {
                overlay_at = None;
                inner.board.notifier().send(Notification::Timer { timer_id: TimerId::OverlayHide });
            },
        }
    }
    debug!("Supervisor exiting");
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::renderer::NullSink;

    fn config() -> Config {
        let mut config = Config::default();
        config.video.width = 64;
        config.video.height = 36;
        config.player.progress_interval_ms = 50;
        config.player.overlay_timeout_ms = 50;
        config
    }

    fn player() -> Player {
        PlayerBuilder::new()
            .with_config(config())
            .with_audio_host(NullHost)
            .with_sink(NullSink::new())
            .build()
            .unwrap()
    }

    fn wait_for(player: &Player, status: PlayerStatus) {
        let deadline = Instant::now() + Duration::from_secs(10);
        while player.status() != status {
            assert!(Instant::now() < deadline, "player never reached {}", status);
            thread::sleep(Duration::from_millis(10));
        }
    }

    #[test]
    fn test_play_pause_resume_stop() {
        let player = player();
        player.play(Some("testsrc:duration=10;chapters=3")).unwrap();
        assert_eq!(player.status(), PlayerStatus::Playing);
        assert_eq!(player.duration(), Some(Duration::from_secs(10)));
        assert!(player.media_file().unwrap().starts_with("testsrc:"));

        player.pause().unwrap();
        assert_eq!(player.status(), PlayerStatus::Paused);
        assert!(matches!(player.pause(), Err(PlayerError::InvalidState { .. })));

        player.play(None).unwrap();
        assert_eq!(player.status(), PlayerStatus::Playing);

        player.stop().unwrap();
        assert_eq!(player.status(), PlayerStatus::Ready);
        assert_eq!(player.media_file(), None);
        assert!(matches!(player.stop(), Err(PlayerError::InvalidState { .. })));
    }

    #[test]
    fn test_resume_requires_pause() {
        let player = player();
        assert!(matches!(player.play(None), Err(PlayerError::InvalidState { .. })));
        assert!(matches!(player.pause(), Err(PlayerError::InvalidState { .. })));
    }

    #[test]
    fn test_open_error_keeps_ready() {
        let player = player();
        let err = player.play(Some("testsrc:open_error=1")).unwrap_err();
        assert!(matches!(err, PlayerError::Open(_)));
        assert_eq!(player.status(), PlayerStatus::Ready);

        let err = player.play(Some("testsrc:audio=0;video=0")).unwrap_err();
        assert!(matches!(err, PlayerError::NoStreams(_)));
        assert!(player.last_error().is_some());
    }

    #[test]
    fn test_seek_chapter_moves_to_chapter_start() {
        let player = player();
        player.play(Some("testsrc:duration=9;chapters=3;audio=0")).unwrap();
        player.seek_chapter(1).unwrap();
        let now = player.time().unwrap();
        assert!(now >= Duration::from_secs(3), "time {:?}", now);
        assert!(now < Duration::from_secs(6), "time {:?}", now);
        player.stop().unwrap();
    }

    #[test]
    fn test_playlist_advances_at_end_of_stream() {
        let player = player();
        player
            .set_playlist(
                vec![
                    PlaylistItem::new("testsrc:duration=0.4;audio=0"),
                    PlaylistItem::new("testsrc:duration=5;audio=0").with_title("Second"),
                ],
                0,
            )
            .unwrap();

        let deadline = Instant::now() + Duration::from_secs(10);
        while player.title().as_deref() != Some("Second") {
            assert!(Instant::now() < deadline, "playlist never advanced");
            thread::sleep(Duration::from_millis(10));
        }
        wait_for(&player, PlayerStatus::Playing);
        assert_eq!(player.playlist().cursor(), Some(1));
        player.stop().unwrap();
    }

    #[test]
    fn test_set_playlist_rejects_bad_index() {
        let player = player();
        let result = player.set_playlist(vec![PlaylistItem::new("testsrc:")], 3);
        assert!(matches!(result, Err(PlayerError::InvalidInput(_))));
        assert!(player.playlist().is_empty());
    }
}
