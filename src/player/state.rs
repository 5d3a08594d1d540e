//! Player status board and notification delivery
//!
//! The board holds the facade's status and buffering percentage. Every change
//! is queued to the notifier thread, which calls the subscribers in order,
//! and mirrored to the supervisor so it can rearm the overlay timer.

use crate::player::{Notification, PlayerStatus, StatusSink, SubscriptionId};
use crate::utils::error::Result;
use crossbeam_channel::{unbounded, Receiver, Sender};
use log::{debug, info, warn};
use parking_lot::{Mutex, RwLock};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};

/// Messages handled by the player's supervisor thread
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum SupervisorEvent {
    /// The controller of session `id` returned
    SessionEnded { id: u64 },

    /// The public status changed
    StatusChanged,

    /// The player is being dropped
    Shutdown,
}

type Subscribers = Arc<RwLock<Vec<(SubscriptionId, Arc<dyn StatusSink>)>>>;

/// Subscriber list plus the thread that calls them
pub(crate) struct Notifier {
    sender: Mutex<Option<Sender<Notification>>>,
    subscribers: Subscribers,
    next_id: AtomicU64,
    thread: Mutex<Option<JoinHandle<()>>>,
}

impl Notifier {
    /// Spawn the notifier thread
    pub fn start() -> Result<Self> {
        let (sender, receiver) = unbounded();
        let subscribers: Subscribers = Arc::new(RwLock::new(Vec::new()));
        let delivery = Arc::clone(&subscribers);
        let thread = thread::Builder::new()
            .name("notifier".to_string())
            .spawn(move || deliver(receiver, delivery))?;

        Ok(Self {
            sender: Mutex::new(Some(sender)),
            subscribers,
            next_id: AtomicU64::new(1),
            thread: Mutex::new(Some(thread)),
        })
    }

    /// Register `sink` for every later notification
    pub fn subscribe(&self, sink: Arc<dyn StatusSink>) -> SubscriptionId {
        let id = SubscriptionId(self.next_id.fetch_add(1, Ordering::Relaxed));
        self.subscribers.write().push((id, sink));
        debug!("Subscriber {:?} added", id);
        id
    }

    /// Remove a subscriber; `false` if it was not registered
    pub fn unsubscribe(&self, id: SubscriptionId) -> bool {
        let mut subscribers = self.subscribers.write();
        let before = subscribers.len();
        subscribers.retain(|(existing, _)| *existing != id);
        subscribers.len() != before
    }

    /// Queue a notification for delivery
    pub fn send(&self, notification: Notification) {
        if let Some(sender) = self.sender.lock().as_ref() {
            let _ = sender.send(notification);
        }
    }

    /// Deliver what is queued, then stop the thread
    pub fn shutdown(&self) {
        drop(self.sender.lock().take());
        if let Some(thread) = self.thread.lock().take() {
            if thread.join().is_err() {
                warn!("Notifier thread panicked");
            }
        }
    }
}

impl Drop for Notifier {
    fn drop(&mut self) {
        self.shutdown();
    }
}

fn deliver(receiver: Receiver<Notification>, subscribers: Subscribers) {
    for notification in receiver.iter() {
        // snapshot so sinks may subscribe or unsubscribe from the callback
        let sinks: Vec<Arc<dyn StatusSink>> = subscribers.read().iter().map(|(_, s)| Arc::clone(s)).collect();
        for sink in sinks {
            sink.notify(&notification);
        }
    }
    debug!("Notifier thread exiting");
}

struct BoardState {
    status: PlayerStatus,
    buffer_percent: u8,
    last_error: Option<String>,
}

/// Facade status plus its notification fan-out
pub(crate) struct StatusBoard {
    state: Mutex<BoardState>,
    notifier: Notifier,
    events: Sender<SupervisorEvent>,
}

impl StatusBoard {
    /// Create a board in `Ready` that reports changes to `events`
    pub fn new(notifier: Notifier, events: Sender<SupervisorEvent>) -> Self {
        Self {
            state: Mutex::new(BoardState {
                status: PlayerStatus::Ready,
                buffer_percent: 0,
                last_error: None,
            }),
            notifier,
            events,
        }
    }

    /// Current status
    pub fn status(&self) -> PlayerStatus {
        self.state.lock().status
    }

    /// Move to `next` and notify
    ///
    /// # Returns
    ///
    /// The previous status, or `None` when the transition is not allowed
    pub fn transition(&self, next: PlayerStatus, error: Option<String>) -> Option<PlayerStatus> {
        let previous = {
            let mut state = self.state.lock();
            let previous = state.status;
            if !previous.can_transition_to(next) {
                warn!("Ignoring status change {} -> {}", previous, next);
                return None;
            }
            state.status = next;
            match next {
                PlayerStatus::Buffering => state.buffer_percent = 0,
                PlayerStatus::Playing => state.buffer_percent = 100,
                PlayerStatus::Ready => state.buffer_percent = 0,
                PlayerStatus::Paused => {}
            }
            if error.is_some() {
                state.last_error = error.clone();
            }
            previous
        };

        info!("Player status changed: {} -> {}", previous, next);
        self.notifier.send(Notification::Status {
            status: next,
            previous,
            error,
        });
        let _ = self.events.send(SupervisorEvent::StatusChanged);
        Some(previous)
    }

    /// Report a failed operation that left the status unchanged
    pub fn report_error(&self, error: &str) {
        let status = {
            let mut state = self.state.lock();
            state.last_error = Some(error.to_string());
            state.status
        };
        self.notifier.send(Notification::Status {
            status,
            previous: status,
            error: Some(error.to_string()),
        });
    }

    /// Raise the buffering percentage; lower values are ignored
    pub fn set_buffering(&self, percent: u8) {
        let percent = percent.min(100);
        {
            let mut state = self.state.lock();
            if state.status != PlayerStatus::Buffering || percent <= state.buffer_percent {
                return;
            }
            state.buffer_percent = percent;
        }
        debug!("Buffering {}%", percent);
        self.notifier.send(Notification::Buffering { percent });
    }

    /// Last percentage published while buffering
    pub fn buffer_percent(&self) -> u8 {
        self.state.lock().buffer_percent
    }

    /// Message of the most recent failure
    pub fn last_error(&self) -> Option<String> {
        self.state.lock().last_error.clone()
    }

    /// The subscriber registry
    pub fn notifier(&self) -> &Notifier {
        &self.notifier
    }
}
