use anyhow::{Context, Result};
use clap::Parser;
use env_logger::Env;
use log::{debug, error, info, warn};
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::sync::mpsc;

use stbplayer::player::{Notification, Player, PlayerBuilder, PlayerStatus, PlaylistItem, TimerId};
use stbplayer::utils::{format_duration, Config};

/// Jump of the `f` and `r` console commands
const SEEK_STEP: Duration = Duration::from_secs(10);

/// stbplayer - set-top-box media playback engine
#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
struct Args {
    /// Media locators to play; several form a playlist
    #[arg(value_name = "LOCATOR")]
    locators: Vec<String>,

    /// Extra configuration file layered over the system and user files
    #[arg(short, long, value_name = "FILE")]
    config: Option<PathBuf>,

    /// Enable debug logging
    #[arg(short, long)]
    debug: bool,

    /// Play video only
    #[arg(long)]
    no_audio: bool,

    /// Start position in seconds
    #[arg(long, value_name = "SECONDS")]
    start_at: Option<f64>,

    /// Loop the playlist
    #[arg(long)]
    repeat: bool,
}

#[tokio::main]
async fn main() -> Result<()> {
    // Parse command line arguments
    let args = Args::parse();

    let mut config = Config::load_with(args.config.as_deref()).context("Failed to load configuration")?;
    if args.no_audio {
        config.audio.enabled = false;
    }

    // Initialize logging
    let log_level = if args.debug { "debug" } else { config.general.log_level.as_str() };
    env_logger::Builder::from_env(Env::default().default_filter_or(log_level))
        .format_timestamp_millis()
        .init();

    #[cfg(feature = "ffmpeg")]
    ffmpeg_next::util::log::set_level(ffmpeg_next::util::log::Level::Error);

    info!("Starting stbplayer v{}", env!("CARGO_PKG_VERSION"));

    if args.locators.is_empty() {
        anyhow::bail!("Nothing to play; pass at least one locator (try testsrc:duration=10)");
    }

    let (status_tx, mut status_rx) = mpsc::unbounded_channel();
    let player = Arc::new(
        PlayerBuilder::new()
            .with_config(config)
            .with_subscriber(Arc::new(move |notification: &Notification| {
                log_notification(notification);
                if let Notification::Status { status, .. } = notification {
                    let _ = status_tx.send(*status);
                }
            }))
            .build()?,
    );
    player.set_repeat(args.repeat);

    let user_stopped = Arc::new(AtomicBool::new(false));
    start_playback(Arc::clone(&player), args.locators, args.start_at).await?;

    print_help();
    let mut commands = BufReader::new(tokio::io::stdin()).lines();
    loop {
        tokio::select! {
            line = commands.next_line() => {
                let Some(line) = line? else { break };
                let quit = handle_command(&player, line.trim(), &user_stopped).await;
                if quit {
                    break;
                }
            }
            status = status_rx.recv() => {
                let Some(status) = status else { break };
                if status == PlayerStatus::Ready && session_over(&player, &user_stopped).await {
                    info!("Playback finished");
                    break;
                }
            }
            _ = tokio::signal::ctrl_c() => {
                info!("Interrupted");
                break;
            }
        }
    }

    tokio::task::spawn_blocking(move || player.stop().ok()).await?;
    Ok(())
}

/// Start the first item; blocks a worker thread while the session buffers
async fn start_playback(player: Arc<Player>, locators: Vec<String>, start_at: Option<f64>) -> Result<()> {
    tokio::task::spawn_blocking(move || -> Result<()> {
        if locators.len() > 1 {
            let items = locators.into_iter().map(PlaylistItem::new).collect();
            player.set_playlist(items, 0)?;
        } else if let Some(locator) = locators.first() {
            player.play(Some(locator.as_str()))?;
        }
        if let Some(seconds) = start_at.filter(|s| *s > 0.0) {
            player.seek(Duration::from_secs_f64(seconds))?;
        }
        Ok(())
    })
    .await?
}

/// Nothing will start on its own after the player went back to READY
async fn session_over(player: &Player, user_stopped: &AtomicBool) -> bool {
    if user_stopped.load(Ordering::Acquire) {
        return false;
    }
    // the supervisor starts the next item after publishing READY
    tokio::time::sleep(Duration::from_millis(200)).await;
    player.status() == PlayerStatus::Ready
}

fn print_help() {
    println!("Commands: p = play/pause, s = stop, n = next chapter, b = previous chapter,");
    println!("          f = forward 10 s, r = rewind 10 s, i = info, q = quit");
}

/// Run one console command; returns whether to quit
async fn handle_command(player: &Arc<Player>, command: &str, user_stopped: &Arc<AtomicBool>) -> bool {
    let player = Arc::clone(player);
    let user_stopped = Arc::clone(user_stopped);
    let command = command.to_string();
    let result = tokio::task::spawn_blocking(move || -> stbplayer::Result<bool> {
        match command.as_str() {
            "p" => match player.status() {
                PlayerStatus::Playing => player.pause()?,
                PlayerStatus::Paused => player.play(None)?,
                PlayerStatus::Ready => {
                    let current = player.playlist().current().map(|item| item.locator.clone());
                    if let Some(locator) = current.or_else(|| player.media_file()) {
                        user_stopped.store(false, Ordering::Release);
                        player.play(Some(locator.as_str()))?;
                    }
                }
                PlayerStatus::Buffering => {}
            },
            "s" => {
                user_stopped.store(true, Ordering::Release);
                player.stop()?;
            }
            "n" => player.seek_chapter(1)?,
            "b" => player.seek_chapter(-1)?,
            "f" => {
                let now = player.time().unwrap_or_default();
                player.seek(now + SEEK_STEP)?;
            }
            "r" => {
                let now = player.time().unwrap_or_default();
                player.seek(now.saturating_sub(SEEK_STEP))?;
            }
            "i" => print_info(&player),
            "q" => return Ok(true),
            "" => {}
            other => println!("Unknown command: {}", other),
        }
        Ok(false)
    })
    .await;

    match result {
        Ok(Ok(quit)) => quit,
        Ok(Err(e)) => {
            warn!("Command failed: {}", e);
            false
        }
        Err(e) => {
            error!("Command task failed: {}", e);
            true
        }
    }
}

fn print_info(player: &Player) {
    let time = player.time().map(format_duration).unwrap_or_else(|| "--:--".to_string());
    let duration = player.duration().map(format_duration).unwrap_or_else(|| "--:--".to_string());
    println!(
        "{} [{}] {} / {} (buffer {}%)",
        player.title().unwrap_or_default(),
        player.status(),
        time,
        duration,
        player.buffer_state()
    );
    let stats = player.stats();
    println!(
        "rendered {} dropped {} skips {} recoveries {} xruns {} decode errors {}",
        stats.frames_rendered,
        stats.frames_dropped,
        stats.skip_episodes,
        stats.deadlock_recoveries,
        stats.xruns,
        stats.decode_errors
    );
}

fn log_notification(notification: &Notification) {
    match notification {
        Notification::Status { status, previous, error: Some(message) } => {
            error!("{} -> {}: {}", previous, status, message)
        }
        Notification::Status { status, previous, error: None } => info!("{} -> {}", previous, status),
        Notification::Buffering { percent } => debug!("Buffering: {}%", percent),
        Notification::Timer { timer_id: TimerId::Progress } => debug!("Progress tick"),
        Notification::Timer { timer_id } => debug!("Timer {:?}", timer_id),
    }
}
