//! Integration tests for the stbplayer facade
//!
//! These tests drive complete sessions through the public API:
//! - Playback lifecycle and reported media properties
//! - Seek and chapter navigation
//! - Buffering, stop and pause behavior
//! - Audio device faults and decoder errors
//! - Playlists and configuration files

use anyhow::Result;
use serial_test::serial;
use stbplayer::audio::DeviceError;
use stbplayer::decoder::TestPatternBackend;
use stbplayer::player::{Notification, Player, PlayerStatus, PlaylistItem, TimerId};
use stbplayer::utils::Config;
use stbplayer::PlayerError;
use stbplayer_integration_tests::{test_config, wait_for_status, wait_until, Harness, SlowBackend};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::Duration;

const TIMEOUT: Duration = Duration::from_secs(10);

#[test]
#[serial]
fn test_ten_second_clip_plays() -> Result<()> {
    let harness = Harness::new(test_config());
    let player = &harness.player;

    player.play(Some("testsrc:duration=10"))?;
    assert_eq!(player.status(), PlayerStatus::Playing);
    assert_eq!(player.duration(), Some(Duration::from_secs(10)));
    assert_eq!(player.media_file().as_deref(), Some("testsrc:duration=10"));
    assert_eq!(player.title().as_deref(), Some("Test pattern (10 s)"));

    assert!(wait_until(TIMEOUT, || harness.sink.presented() >= 5));
    assert_eq!(harness.sink.last_size(), Some((64, 36)));
    assert!(player.time().unwrap_or_default() > Duration::ZERO);

    player.stop()?;
    assert_eq!(player.status(), PlayerStatus::Ready);
    assert_eq!(player.time(), None);
    assert_eq!(player.buffer_state(), 0);

    assert!(harness.recorder.wait_for(TIMEOUT, |n| matches!(
        n,
        Notification::Status { status: PlayerStatus::Ready, previous: PlayerStatus::Playing, .. }
    )));
    assert_eq!(
        harness.recorder.statuses(),
        vec![PlayerStatus::Buffering, PlayerStatus::Playing, PlayerStatus::Ready]
    );
    Ok(())
}

#[test]
#[serial]
fn test_seek_moves_clock_to_target() -> Result<()> {
    let harness = Harness::new(test_config());
    let player = &harness.player;
    player.play(Some("testsrc:duration=10"))?;

    player.seek(Duration::from_secs(5))?;
    let now = player.time().unwrap_or_default();
    assert!(now >= Duration::from_secs(5) && now < Duration::from_secs(6), "time {:?}", now);

    player.seek(Duration::from_secs(1))?;
    let now = player.time().unwrap_or_default();
    assert!(now >= Duration::from_secs(1) && now < Duration::from_secs(2), "time {:?}", now);

    // past the end clamps to the duration
    player.seek(Duration::from_secs(60))?;
    assert!(player.time().unwrap_or_default() <= Duration::from_secs(11));
    Ok(())
}

/// The last presented frame is within two frame periods of the clock
fn assert_frame_tracks_clock(player: &Player) {
    let now = player.time().unwrap_or_default().as_micros() as i64;
    let frame = player.stats().last_frame_time.unwrap_or_default().as_micros() as i64;
    assert!((now - frame).abs() < 80_000, "clock {} us, frame {} us", now, frame);
}

fn last_frame_between(player: &Player, from: Duration, until: Duration) -> bool {
    player
        .stats()
        .last_frame_time
        .is_some_and(|time| time >= from && time < until)
}

#[test]
#[serial]
fn test_forward_seek_plays_silence_up_to_keyframe() -> Result<()> {
    let harness = Harness::new(test_config());
    let player = &harness.player;
    player.play(Some("testsrc:duration=10"))?;
    assert!(wait_until(TIMEOUT, || harness.sink.presented() >= 3));

    // the first keyframe after 3.5 s is at 4 s
    harness.host.reset_silence();
    player.seek(Duration::from_millis(3500))?;
    let now = player.time().unwrap_or_default();
    assert!(now >= Duration::from_millis(3500) && now < Duration::from_secs(4), "time {:?}", now);

    assert!(wait_until(TIMEOUT, || last_frame_between(
        player,
        Duration::from_millis(4500),
        Duration::from_secs(6)
    )));
    let silence = harness.host.longest_silence();
    assert!(
        silence >= Duration::from_millis(400) && silence <= Duration::from_millis(650),
        "silence {:?}",
        silence
    );
    assert_frame_tracks_clock(player);
    Ok(())
}

#[test]
#[serial]
fn test_backward_seek_keeps_audio_and_video_together() -> Result<()> {
    let harness = Harness::new(test_config());
    let player = &harness.player;
    player.play(Some("testsrc:duration=10"))?;
    player.seek(Duration::from_secs(6))?;
    assert!(wait_until(TIMEOUT, || last_frame_between(
        player,
        Duration::from_millis(6200),
        Duration::from_secs(8)
    )));

    harness.host.reset_silence();
    player.seek(Duration::from_millis(2500))?;
    let now = player.time().unwrap_or_default();
    assert!(now >= Duration::from_millis(2500) && now < Duration::from_secs(3), "time {:?}", now);

    assert!(wait_until(TIMEOUT, || last_frame_between(
        player,
        Duration::from_millis(3000),
        Duration::from_secs(5)
    )));
    // audio resumes right at the target
    assert!(harness.host.longest_silence() < Duration::from_millis(100));
    assert_frame_tracks_clock(player);
    Ok(())
}

#[test]
#[serial]
fn test_seek_chapter_past_last_chapter_fails() -> Result<()> {
    let harness = Harness::new(test_config());
    let player = &harness.player;
    player.play(Some("testsrc:duration=9;chapters=3"))?;

    player.seek(Duration::from_secs(7))?;
    let err = player.seek_chapter(1).unwrap_err();
    assert!(matches!(err, PlayerError::SeekFailure(_)), "{:?}", err);
    assert_eq!(player.status(), PlayerStatus::Playing);
    assert!(player.time().unwrap_or_default() >= Duration::from_secs(7));

    player.seek_chapter(-1)?;
    let now = player.time().unwrap_or_default();
    assert!(now >= Duration::from_secs(3) && now < Duration::from_secs(6), "time {:?}", now);
    Ok(())
}

#[test]
#[serial]
fn test_seek_failure_keeps_playing() -> Result<()> {
    let harness = Harness::new(test_config());
    let player = &harness.player;
    player.play(Some("testsrc:duration=10;seek_error"))?;

    let err = player.seek(Duration::from_secs(4)).unwrap_err();
    assert!(matches!(err, PlayerError::SeekFailure(_)), "{:?}", err);
    assert_eq!(player.status(), PlayerStatus::Playing);
    assert!(player.time().unwrap_or_default() < Duration::from_secs(4));
    Ok(())
}

#[test]
#[serial]
fn test_stop_during_buffering_interrupts_play() -> Result<()> {
    let backend = SlowBackend::new(TestPatternBackend::new(), Duration::from_millis(60));
    let harness = Arc::new(Harness::with_backend(test_config(), backend));

    let playing = Arc::clone(&harness);
    let play = thread::spawn(move || playing.player.play(Some("testsrc:duration=10")));

    assert!(wait_for_status(&harness.player, PlayerStatus::Buffering, TIMEOUT));
    harness.player.stop()?;
    assert_eq!(harness.player.status(), PlayerStatus::Ready);

    let result = play.join().expect("play thread");
    assert!(matches!(result, Err(PlayerError::Interrupted)), "{:?}", result);
    assert_eq!(harness.player.status(), PlayerStatus::Ready);
    assert_eq!(harness.sink.presented(), 0);
    Ok(())
}

#[test]
#[serial]
fn test_buffering_progress_is_monotonic() -> Result<()> {
    let backend = SlowBackend::new(TestPatternBackend::new(), Duration::from_millis(10));
    let harness = Harness::with_backend(test_config(), backend);
    harness.player.play(Some("testsrc:duration=10"))?;

    assert!(harness.recorder.wait_for(TIMEOUT, |n| matches!(
        n,
        Notification::Status { status: PlayerStatus::Playing, .. }
    )));
    let progress = harness.recorder.buffering();
    assert!(!progress.is_empty());
    assert!(progress.windows(2).all(|w| w[0] <= w[1]), "{:?}", progress);
    assert!(progress.iter().all(|p| *p <= 100));
    Ok(())
}

#[test]
#[serial]
fn test_pause_freezes_clock() -> Result<()> {
    let harness = Harness::new(test_config());
    let player = &harness.player;
    player.play(Some("testsrc:duration=10"))?;
    thread::sleep(Duration::from_millis(300));

    player.pause()?;
    let frozen = player.time().unwrap_or_default();
    let presented = harness.sink.presented();
    thread::sleep(Duration::from_millis(300));
    let later = player.time().unwrap_or_default();
    assert!(later.saturating_sub(frozen) < Duration::from_millis(30), "{:?} -> {:?}", frozen, later);
    assert!(harness.sink.presented() <= presented + 1);

    player.play(None)?;
    assert!(wait_until(TIMEOUT, || player.time().unwrap_or_default() > later + Duration::from_millis(100)));
    Ok(())
}

#[test]
#[serial]
fn test_reported_transitions_are_legal() -> Result<()> {
    let harness = Harness::new(test_config());
    let player = &harness.player;
    player.play(Some("testsrc:duration=5;chapters=2"))?;
    player.pause()?;
    player.seek(Duration::from_secs(2))?;
    player.play(None)?;
    player.play(Some("testsrc:duration=5;audio=0"))?;
    player.stop()?;

    assert!(wait_until(TIMEOUT, || harness_done(&harness)));
    for (previous, status) in harness.recorder.transitions() {
        assert!(previous.can_transition_to(status), "{} -> {}", previous, status);
    }
    Ok(())
}

fn harness_done(harness: &Harness) -> bool {
    let statuses = harness.recorder.statuses();
    statuses.len() >= 8 && statuses.last() == Some(&PlayerStatus::Ready)
}

#[test]
#[serial]
fn test_playlist_advances_and_stops_at_end() -> Result<()> {
    let harness = Harness::new(test_config());
    let player = &harness.player;
    let items = vec![
        PlaylistItem::new("testsrc:duration=0.5;title=First"),
        PlaylistItem::new("testsrc:duration=0.5;title=Second"),
    ];
    player.set_playlist(items, 0)?;
    assert_eq!(player.title().as_deref(), Some("First"));

    assert!(wait_until(TIMEOUT, || player.title().as_deref() == Some("Second")));
    assert_eq!(player.playlist().cursor(), Some(1));

    assert!(wait_for_status(player, PlayerStatus::Ready, TIMEOUT));
    thread::sleep(Duration::from_millis(300));
    assert_eq!(player.status(), PlayerStatus::Ready);
    assert!(matches!(player.next(), Err(PlayerError::InvalidInput(_))));

    player.previous()?;
    assert_eq!(player.title().as_deref(), Some("First"));
    Ok(())
}

#[test]
#[serial]
fn test_seek_chapter_crosses_into_next_playlist_item() -> Result<()> {
    let harness = Harness::new(test_config());
    let player = &harness.player;
    let items = vec![
        PlaylistItem::new("testsrc:duration=10;title=First").with_title("Episode 1"),
        PlaylistItem::new("testsrc:duration=10;title=Second").with_title("Episode 2"),
    ];
    player.set_playlist(items, 0)?;
    assert_eq!(player.title().as_deref(), Some("Episode 1"));

    player.seek_chapter(1)?;
    assert_eq!(player.title().as_deref(), Some("Episode 2"));
    assert_eq!(player.status(), PlayerStatus::Playing);
    Ok(())
}

#[test]
#[serial]
fn test_xrun_is_recovered() -> Result<()> {
    let harness = Harness::new(test_config());
    harness.host.inject(DeviceError::Xrun, 5);
    let player = &harness.player;
    player.play(Some("testsrc:duration=10"))?;

    assert!(wait_until(TIMEOUT, || player.stats().xruns >= 1));
    let before = player.time().unwrap_or_default();
    assert!(wait_until(TIMEOUT, || player.time().unwrap_or_default() > before + Duration::from_millis(200)));
    assert_eq!(player.status(), PlayerStatus::Playing);
    Ok(())
}

#[test]
#[serial]
fn test_fatal_device_error_ends_session() -> Result<()> {
    let harness = Harness::new(test_config());
    harness.host.inject(DeviceError::Fatal("unplugged".to_string()), 3);
    harness.player.play(Some("testsrc:duration=10"))?;

    assert!(wait_for_status(&harness.player, PlayerStatus::Ready, TIMEOUT));
    assert!(harness.recorder.wait_for(TIMEOUT, |n| matches!(
        n,
        Notification::Status { status: PlayerStatus::Ready, error: Some(e), .. } if e.contains("unplugged")
    )));
    assert!(harness.player.last_error().is_some());
    Ok(())
}

#[test]
#[serial]
fn test_missing_audio_device_falls_back_to_video() -> Result<()> {
    let harness = Harness::new(test_config());
    harness.host.fail_open("no sound card");
    let player = &harness.player;

    player.play(Some("testsrc:duration=10"))?;
    assert_eq!(player.status(), PlayerStatus::Playing);
    assert!(wait_until(TIMEOUT, || player.time().unwrap_or_default() > Duration::from_millis(200)));

    let err = player.play(Some("testsrc:duration=10;video=0")).unwrap_err();
    assert!(matches!(err, PlayerError::DeviceFatal(_)), "{:?}", err);
    assert_eq!(player.status(), PlayerStatus::Ready);
    Ok(())
}

#[test]
#[serial]
fn test_decode_errors_are_skipped() -> Result<()> {
    let harness = Harness::new(test_config());
    let player = &harness.player;
    player.play(Some("testsrc:duration=10;decode_error_every=4"))?;

    assert!(wait_until(TIMEOUT, || player.stats().decode_errors > 0));
    assert_eq!(player.status(), PlayerStatus::Playing);
    Ok(())
}

#[test]
#[serial]
fn test_read_error_ends_session() -> Result<()> {
    let harness = Harness::new(test_config());
    let player = &harness.player;
    player.play(Some("testsrc:duration=10;read_error_after=150"))?;

    assert!(wait_for_status(player, PlayerStatus::Ready, TIMEOUT));
    assert!(harness.recorder.wait_for(TIMEOUT, |n| matches!(
        n,
        Notification::Status { status: PlayerStatus::Ready, error: Some(e), .. } if e.contains("read failure")
    )));
    assert!(player.last_error().is_some_and(|e| e.contains("read failure")));
    assert_eq!(player.time(), None);
    Ok(())
}

#[test]
#[serial]
fn test_filter_error_fails_play() {
    let harness = Harness::new(test_config());
    let err = harness.player.play(Some("testsrc:duration=10;filter_error")).unwrap_err();
    assert!(matches!(err, PlayerError::Filter(_)), "{:?}", err);
    assert_eq!(harness.player.status(), PlayerStatus::Ready);
}

#[test]
#[serial]
fn test_repaint_and_timers() -> Result<()> {
    let harness = Harness::new(test_config());
    let player = &harness.player;
    assert!(!player.repaint()?);

    player.play(Some("testsrc:duration=10"))?;
    assert!(wait_until(TIMEOUT, || harness.sink.presented() > 0));
    let presented = harness.sink.presented();
    assert!(player.repaint()?);
    assert!(harness.sink.presented() > presented);

    assert!(harness.recorder.wait_for(TIMEOUT, |n| *n == Notification::Timer { timer_id: TimerId::Progress }));
    assert!(harness.recorder.wait_for(TIMEOUT, |n| *n == Notification::Timer { timer_id: TimerId::OverlayHide }));
    Ok(())
}

#[test]
#[serial]
fn test_unsubscribe_stops_delivery() -> Result<()> {
    let harness = Harness::new(test_config());
    let player = &harness.player;
    let count = Arc::new(AtomicU64::new(0));
    let counter = Arc::clone(&count);
    let id = player.subscribe(Arc::new(move |_: &Notification| {
        counter.fetch_add(1, Ordering::Relaxed);
    }));
    assert!(player.unsubscribe(id));
    assert!(!player.unsubscribe(id));

    player.play(Some("testsrc:duration=2"))?;
    player.stop()?;
    assert!(harness.recorder.wait_for(TIMEOUT, |n| matches!(
        n,
        Notification::Status { status: PlayerStatus::Ready, .. }
    )));
    assert_eq!(count.load(Ordering::Relaxed), 0);
    Ok(())
}

#[test]
fn test_config_files_layer_over_defaults() -> Result<()> {
    let dir = tempfile::tempdir()?;
    let system = dir.path().join("system.toml");
    let user = dir.path().join("user.toml");
    std::fs::write(&system, "[video]\nwidth = 720\nheight = 576\n")?;
    std::fs::write(&user, "[video]\nheight = 480\n[player]\nauto_advance = false\n")?;

    let config = Config::from_files(&[system, user])?;
    assert_eq!(config.video.width, 720);
    assert_eq!(config.video.height, 480);
    assert!(!config.player.auto_advance);
    assert_eq!(config.audio, Config::default().audio);

    let saved = dir.path().join("nested").join("config.toml");
    config.save_to(&saved)?;
    assert_eq!(Config::from_files(&[saved])?, config);

    let missing = dir.path().join("missing.toml");
    assert!(matches!(Config::load_with(Some(missing.as_path())), Err(PlayerError::Config(_))));
    Ok(())
}
