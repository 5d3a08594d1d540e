//! Bounded packet queue between the demuxer and a decode thread
//!
//! A fixed arena of slots addressed by read/write indices. The producer blocks
//! while every slot is occupied, the consumer blocks while none is. Besides
//! data packets the queue carries control tokens (`Flush`, `EndOfStream`) so
//! that they stay ordered with the packets around them.

use parking_lot::{Condvar, Mutex};
use std::fmt;

/// One entry travelling through a [`PacketQueue`]
#[derive(Debug)]
pub enum QueueItem<T> {
    /// A data packet
    Packet(T),

    /// Everything before this token belongs to the pre-seek position
    Flush,

    /// No more packets will follow until the next flush
    EndOfStream,
}

/// Why a blocking push gave up; the rejected item is handed back
pub enum PushError<I> {
    /// The queue was closed for shutdown
    Closed(I),

    /// The producer was asked to look at something else (a pending seek)
    Interrupted(I),
}

impl<I> PushError<I> {
    /// Recover the item that was not queued
    pub fn into_inner(self) -> I {
        match self {
            PushError::Closed(item) | PushError::Interrupted(item) => item,
        }
    }
}

impl<I> fmt::Debug for PushError<I> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            PushError::Closed(_) => f.write_str("Closed(..)"),
            PushError::Interrupted(_) => f.write_str("Interrupted(..)"),
        }
    }
}

struct Inner<T> {
    slots: Vec<Option<QueueItem<T>>>,
    read: usize,
    write: usize,
    occupied: usize,
    closed: bool,
    interrupted: bool,
}

/// Bounded FIFO of packets and control tokens
pub struct PacketQueue<T> {
    inner: Mutex<Inner<T>>,
    not_empty: Condvar,
    not_full: Condvar,
    capacity: usize,
}

impl<T> PacketQueue<T> {
    /// Create a queue with room for `capacity` items (at least one)
    pub fn new(capacity: usize) -> Self {
        let capacity = capacity.max(1);
        Self {
            inner: Mutex::new(Inner {
                slots: (0..capacity).map(|_| None).collect(),
                read: 0,
                write: 0,
                occupied: 0,
                closed: false,
                interrupted: false,
            }),
            not_empty: Condvar::new(),
            not_full: Condvar::new(),
            capacity,
        }
    }

    /// Queue an item, blocking while the queue is full
    ///
    /// Returns the item back if the queue is closed or a pending
    /// [`interrupt`](Self::interrupt) is consumed while waiting for room.
    pub fn push(&self, item: QueueItem<T>) -> Result<(), PushError<QueueItem<T>>> {
        let mut inner = self.inner.lock();
        loop {
            if inner.closed {
                return Err(PushError::Closed(item));
            }
            if inner.occupied < self.capacity {
                break;
            }
            if inner.interrupted {
                inner.interrupted = false;
                return Err(PushError::Interrupted(item));
            }
            self.not_full.wait(&mut inner);
        }

        let write = inner.write;
        debug_assert!(inner.slots[write].is_none());
        inner.slots[write] = Some(item);
        inner.write = (write + 1) % self.capacity;
        inner.occupied += 1;
        self.not_empty.notify_one();
        Ok(())
    }

    /// Take the oldest item, blocking while the queue is empty
    ///
    /// Returns `None` once the queue is closed.
    pub fn pop(&self) -> Option<QueueItem<T>> {
        let mut inner = self.inner.lock();
        loop {
            if inner.closed {
                return None;
            }
            if inner.occupied > 0 {
                break;
            }
            self.not_empty.wait(&mut inner);
        }

        let read = inner.read;
        let item = inner.slots[read].take();
        inner.read = (read + 1) % self.capacity;
        inner.occupied -= 1;
        self.not_full.notify_one();
        item
    }

    /// Take the oldest item without blocking
    pub fn try_pop(&self) -> Option<QueueItem<T>> {
        let mut inner = self.inner.lock();
        if inner.closed || inner.occupied == 0 {
            return None;
        }
        let read = inner.read;
        let item = inner.slots[read].take();
        inner.read = (read + 1) % self.capacity;
        inner.occupied -= 1;
        self.not_full.notify_one();
        item
    }

    /// Discard everything queued and clear a pending interrupt
    ///
    /// Returns the number of data packets dropped.
    pub fn drain(&self) -> usize {
        let mut inner = self.inner.lock();
        let mut dropped = 0;
        for slot in inner.slots.iter_mut() {
            if let Some(QueueItem::Packet(_)) = slot.take() {
                dropped += 1;
            }
        }
        inner.read = 0;
        inner.write = 0;
        inner.occupied = 0;
        inner.interrupted = false;
        self.not_full.notify_all();
        dropped
    }

    /// Wake a producer blocked in [`push`](Self::push)
    ///
    /// The request is sticky: if no producer is waiting, the next push that
    /// would block returns `Interrupted` instead.
    pub fn interrupt(&self) {
        let mut inner = self.inner.lock();
        inner.interrupted = true;
        self.not_full.notify_all();
    }

    /// Close the queue and wake every waiter
    pub fn close(&self) {
        let mut inner = self.inner.lock();
        inner.closed = true;
        self.not_empty.notify_all();
        self.not_full.notify_all();
    }

    /// Whether [`close`](Self::close) was called
    pub fn is_closed(&self) -> bool {
        self.inner.lock().closed
    }

    /// Number of queued items
    pub fn len(&self) -> usize {
        self.inner.lock().occupied
    }

    /// Whether nothing is queued
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Maximum number of queued items
    pub fn capacity(&self) -> usize {
        self.capacity
    }
}
