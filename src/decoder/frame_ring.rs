//! Ring of decoded video frames shared by the decoder and renderer threads
//!
//! Every slot owns a preallocated [`VideoFrame`]. The decoder checks out the
//! slot at `decode_index`, fills it outside the lock and commits it as ready;
//! the renderer checks out the slot at `render_index`, presents it and
//! releases it. A slot that is ready or being read is never handed to the
//! decoder, so a frame is never overwritten before the renderer is done.
//!
//! Seeking bumps a generation counter. Frames checked out under an older
//! generation are returned as free slots instead of being queued.
//!
//! The renderer also waits on the ring while a frame is early, so pause,
//! resume, flush and close all wake it through the same condition variable.

use crate::renderer::VideoFrame;
use parking_lot::{Condvar, Mutex};
use std::ops::{Deref, DerefMut};
use std::time::{Duration, Instant};

/// Why a ring operation did not produce a slot
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RingError {
    /// The ring was closed for shutdown
    Closed,

    /// A flush was requested; the producer should go handle it
    Flushing,

    /// The producer marked end of stream and every frame was consumed
    EndOfStream,

    /// No frame became ready within the timeout
    Timeout,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum SlotState {
    Free,
    Writing,
    Ready,
    Reading,
}

struct Slot {
    frame: Option<VideoFrame>,
    state: SlotState,
}

struct Inner {
    slots: Vec<Slot>,
    decode_index: usize,
    render_index: usize,
    ready: usize,
    generation: u64,
    flushing: bool,
    paused: bool,
    eos: bool,
    closed: bool,
}

/// A free slot checked out by the decoder
pub struct WritableFrame {
    index: usize,
    generation: u64,
    frame: VideoFrame,
}

/// A ready slot checked out by the renderer
pub struct ReadyFrame {
    index: usize,
    generation: u64,
    frame: VideoFrame,
}

impl ReadyFrame {
    /// Flush generation the frame was decoded under
    pub fn generation(&self) -> u64 {
        self.generation
    }
}

impl Deref for WritableFrame {
    type Target = VideoFrame;
    fn deref(&self) -> &VideoFrame {
        &self.frame
    }
}

impl DerefMut for WritableFrame {
    fn deref_mut(&mut self) -> &mut VideoFrame {
        &mut self.frame
    }
}

impl Deref for ReadyFrame {
    type Target = VideoFrame;
    fn deref(&self) -> &VideoFrame {
        &self.frame
    }
}

/// Bounded ring of reusable decoded frames
pub struct FrameRing {
    inner: Mutex<Inner>,
    frame_ready: Condvar,
    slot_free: Condvar,
    capacity: usize,
}

impl FrameRing {
    /// Create a ring of `capacity` frames of `width` x `height`
    pub fn new(capacity: usize, width: u32, height: u32) -> Self {
        let capacity = capacity.max(1);
        let slots = (0..capacity)
            .map(|_| Slot {
                frame: Some(VideoFrame::new(width, height)),
                state: SlotState::Free,
            })
            .collect();

        Self {
            inner: Mutex::new(Inner {
                slots,
                decode_index: 0,
                render_index: 0,
                ready: 0,
                generation: 0,
                flushing: false,
                paused: false,
                eos: false,
                closed: false,
            }),
            frame_ready: Condvar::new(),
            slot_free: Condvar::new(),
            capacity,
        }
    }

    /// Check out the next slot for writing, waiting while it is still in use
    pub fn acquire_write(&self) -> Result<WritableFrame, RingError> {
        let mut inner = self.inner.lock();
        loop {
            if inner.closed {
                return Err(RingError::Closed);
            }
            if inner.flushing {
                return Err(RingError::Flushing);
            }
            let index = inner.decode_index;
            if inner.slots[index].state == SlotState::Free {
                if let Some(frame) = inner.slots[index].frame.take() {
                    inner.slots[index].state = SlotState::Writing;
                    return Ok(WritableFrame {
                        index,
                        generation: inner.generation,
                        frame,
                    });
                }
            }
            self.slot_free.wait(&mut inner);
        }
    }

    /// Publish a written frame to the renderer
    ///
    /// Returns `false` if a flush happened while the frame was checked out;
    /// the slot is then recycled without being queued.
    pub fn commit(&self, written: WritableFrame) -> bool {
        let mut inner = self.inner.lock();
        let stale = written.generation != inner.generation;
        let slot = &mut inner.slots[written.index];
        slot.frame = Some(written.frame);

        if stale {
            if slot.state == SlotState::Writing {
                slot.state = SlotState::Free;
            }
            self.slot_free.notify_all();
            return false;
        }

        slot.state = SlotState::Ready;
        inner.decode_index = (written.index + 1) % self.capacity;
        inner.ready += 1;
        self.frame_ready.notify_all();
        true
    }

    /// Return a checked-out slot without publishing it
    pub fn cancel(&self, written: WritableFrame) {
        let mut inner = self.inner.lock();
        let slot = &mut inner.slots[written.index];
        slot.frame = Some(written.frame);
        if slot.state == SlotState::Writing {
            slot.state = SlotState::Free;
        }
        self.slot_free.notify_all();
    }

    /// Check out the next ready frame, waiting at most `timeout` or, with
    /// `None`, until a frame, end of stream or close
    pub fn acquire_read(&self, timeout: Option<Duration>) -> Result<ReadyFrame, RingError> {
        let deadline = timeout.map(|timeout| Instant::now() + timeout);
        let mut inner = self.inner.lock();
        loop {
            if inner.closed {
                return Err(RingError::Closed);
            }
            let index = inner.render_index;
            if inner.slots[index].state == SlotState::Ready {
                if let Some(frame) = inner.slots[index].frame.take() {
                    inner.slots[index].state = SlotState::Reading;
                    inner.ready -= 1;
                    return Ok(ReadyFrame {
                        index,
                        generation: inner.generation,
                        frame,
                    });
                }
            }
            if inner.eos && inner.ready == 0 {
                return Err(RingError::EndOfStream);
            }
            match deadline {
                Some(deadline) => {
                    if self.frame_ready.wait_until(&mut inner, deadline).timed_out() {
                        return Err(RingError::Timeout);
                    }
                }
                None => self.frame_ready.wait(&mut inner),
            }
        }
    }

    /// Block up to `timeout` while a frame of `generation` waits for its time
    ///
    /// Returns early on flush, close or resume. While paused the timeout is
    /// suspended and the call blocks until playback resumes.
    pub fn wait_until_due(&self, generation: u64, timeout: Duration) {
        let deadline = Instant::now() + timeout;
        let mut inner = self.inner.lock();
        let mut parked = false;
        loop {
            if inner.closed || inner.generation != generation {
                return;
            }
            if inner.paused {
                parked = true;
                self.frame_ready.wait(&mut inner);
                continue;
            }
            if parked || self.frame_ready.wait_until(&mut inner, deadline).timed_out() {
                return;
            }
        }
    }

    /// Park or release a renderer waiting in [`wait_until_due`](Self::wait_until_due)
    pub fn set_paused(&self, paused: bool) {
        let mut inner = self.inner.lock();
        inner.paused = paused;
        self.frame_ready.notify_all();
    }

    /// Whether playback is paused
    pub fn is_paused(&self) -> bool {
        self.inner.lock().paused
    }

    /// Hand a rendered frame's slot back to the decoder
    pub fn release(&self, frame: ReadyFrame) {
        let mut inner = self.inner.lock();
        let current = frame.generation == inner.generation;
        let slot = &mut inner.slots[frame.index];
        slot.frame = Some(frame.frame);
        slot.state = SlotState::Free;
        if current {
            inner.render_index = (frame.index + 1) % self.capacity;
        }
        self.slot_free.notify_all();
    }

    /// Ask a producer blocked in [`acquire_write`](Self::acquire_write) to bail out
    pub fn begin_flush(&self) {
        let mut inner = self.inner.lock();
        inner.flushing = true;
        self.slot_free.notify_all();
        self.frame_ready.notify_all();
    }

    /// Drop every queued frame and restart both indices at slot zero
    ///
    /// Frames the renderer currently holds stay checked out and come back as
    /// free slots on release. Returns the number of discarded frames.
    pub fn flush(&self) -> usize {
        let mut inner = self.inner.lock();
        let discarded = inner.ready;
        for slot in inner.slots.iter_mut() {
            if matches!(slot.state, SlotState::Ready | SlotState::Writing) && slot.frame.is_some() {
                slot.state = SlotState::Free;
            }
        }
        inner.decode_index = 0;
        inner.render_index = 0;
        inner.ready = 0;
        inner.eos = false;
        inner.flushing = false;
        inner.generation += 1;
        self.slot_free.notify_all();
        self.frame_ready.notify_all();
        discarded
    }

    /// Mark that no further frames will be committed before the next flush
    pub fn mark_eos(&self) {
        let mut inner = self.inner.lock();
        inner.eos = true;
        self.frame_ready.notify_all();
    }

    /// Close the ring and wake every waiter
    pub fn close(&self) {
        let mut inner = self.inner.lock();
        inner.closed = true;
        self.frame_ready.notify_all();
        self.slot_free.notify_all();
    }

    /// Block while the ready count still equals `seen` and is below
    /// `target`; returns the ready count
    ///
    /// End of stream and close end the wait. With `seen` of `None` the
    /// current count is returned at once.
    pub fn wait_fill(&self, target: usize, seen: Option<usize>) -> usize {
        let mut inner = self.inner.lock();
        while inner.ready < target && !inner.eos && !inner.closed && Some(inner.ready) == seen {
            self.frame_ready.wait(&mut inner);
        }
        inner.ready
    }

    /// Block until the generation moves past `generation` or the ring
    /// closes, at most `timeout` when given; returns whether a flush happened
    pub fn wait_for_flush(&self, generation: u64, timeout: Option<Duration>) -> bool {
        let deadline = timeout.map(|timeout| Instant::now() + timeout);
        let mut inner = self.inner.lock();
        while inner.generation == generation && !inner.closed {
            match deadline {
                Some(deadline) => {
                    if self.frame_ready.wait_until(&mut inner, deadline).timed_out() {
                        break;
                    }
                }
                None => self.frame_ready.wait(&mut inner),
            }
        }
        inner.generation != generation
    }

    /// Number of frames ready for the renderer
    pub fn len(&self) -> usize {
        self.inner.lock().ready
    }

    /// Whether no frame is ready
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Number of slots
    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// Current flush generation
    pub fn generation(&self) -> u64 {
        self.inner.lock().generation
    }

    /// Whether end of stream was marked and not yet flushed
    pub fn is_eos(&self) -> bool {
        self.inner.lock().eos
    }

    /// Whether the ring was closed
    pub fn is_closed(&self) -> bool {
        self.inner.lock().closed
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;
    use std::sync::Arc;
    use std::thread;

    fn write_frame(ring: &FrameRing, pts: i64) -> bool {
        let mut slot = ring.acquire_write().unwrap();
        slot.pts = pts;
        ring.commit(slot)
    }

    #[test]
    fn test_frames_come_out_in_order() {
        let ring = FrameRing::new(3, 4, 4);
        assert!(write_frame(&ring, 10));
        assert!(write_frame(&ring, 20));
        assert_eq!(ring.len(), 2);

        let first = ring.acquire_read(Some(Duration::from_millis(10))).unwrap();
        assert_eq!(first.pts, 10);
        ring.release(first);
        let second = ring.acquire_read(Some(Duration::from_millis(10))).unwrap();
        assert_eq!(second.pts, 20);
        ring.release(second);

        assert_eq!(
            ring.acquire_read(Some(Duration::from_millis(10))).err(),
            Some(RingError::Timeout)
        );
    }

    #[test]
    fn test_producer_waits_for_unreleased_slot() {
        let ring = Arc::new(FrameRing::new(2, 2, 2));
        write_frame(&ring, 1);
        write_frame(&ring, 2);

        let producer = {
            let ring = Arc::clone(&ring);
            thread::spawn(move || write_frame(&ring, 3))
        };

        // reading does not free the slot; only release does
        let held = ring.acquire_read(Some(Duration::from_millis(10))).unwrap();
        thread::sleep(Duration::from_millis(30));
        assert!(!producer.is_finished());

        ring.release(held);
        assert!(producer.join().unwrap());
        assert_eq!(ring.len(), 2);
    }

    #[test]
    fn test_flush_resets_and_recycles_stale_frames() {
        let ring = FrameRing::new(4, 2, 2);
        write_frame(&ring, 1);
        write_frame(&ring, 2);
        write_frame(&ring, 3);

        let held = ring.acquire_read(Some(Duration::from_millis(10))).unwrap();
        let generation = ring.generation();

        ring.begin_flush();
        assert_eq!(ring.acquire_write().err(), Some(RingError::Flushing));
        assert_eq!(ring.flush(), 2);
        assert!(ring.is_empty());
        assert_eq!(ring.generation(), generation + 1);

        // the renderer's stale frame goes back without moving the new indices
        assert_eq!(held.generation(), generation);
        ring.release(held);
        assert!(write_frame(&ring, 100));
        let next = ring.acquire_read(Some(Duration::from_millis(10))).unwrap();
        assert_eq!(next.pts, 100);
        ring.release(next);
    }

    #[test]
    fn test_stale_commit_is_not_published() {
        let ring = FrameRing::new(2, 2, 2);
        let mut slot = ring.acquire_write().unwrap();
        slot.pts = 5;
        ring.flush();
        assert!(!ring.commit(slot));
        assert!(ring.is_empty());
        assert!(write_frame(&ring, 6));
    }

    #[test]
    fn test_eos_and_close() {
        let ring = FrameRing::new(2, 2, 2);
        write_frame(&ring, 1);
        ring.mark_eos();
        assert_eq!(ring.wait_fill(2, Some(0)), 1);

        let last = ring.acquire_read(Some(Duration::from_millis(10))).unwrap();
        ring.release(last);
        assert_eq!(
            ring.acquire_read(Some(Duration::from_secs(1))).err(),
            Some(RingError::EndOfStream)
        );

        ring.close();
        assert_eq!(ring.acquire_write().err(), Some(RingError::Closed));
    }

    #[test]
    fn test_cancel_keeps_decode_index() {
        let ring = FrameRing::new(2, 2, 2);
        let slot = ring.acquire_write().unwrap();
        ring.cancel(slot);
        assert!(write_frame(&ring, 9));
        assert_eq!(ring.acquire_read(Some(Duration::from_millis(10))).unwrap().pts, 9);
    }

    #[test]
    fn test_wait_for_flush() {
        let ring = Arc::new(FrameRing::new(2, 2, 2));
        let generation = ring.generation();
        assert!(!ring.wait_for_flush(generation, Some(Duration::from_millis(5))));

        let flusher = {
            let ring = Arc::clone(&ring);
            thread::spawn(move || {
                thread::sleep(Duration::from_millis(10));
                ring.flush();
            })
        };
        assert!(ring.wait_for_flush(generation, Some(Duration::from_secs(5))));
        flusher.join().unwrap();
    }

    #[test]
    fn test_wait_fill_wakes_on_each_commit() {
        let ring = Arc::new(FrameRing::new(4, 2, 2));
        assert_eq!(ring.wait_fill(3, None), 0);

        let producer = {
            let ring = Arc::clone(&ring);
            thread::spawn(move || {
                thread::sleep(Duration::from_millis(10));
                write_frame(&ring, 1)
            })
        };
        assert_eq!(ring.wait_fill(3, Some(0)), 1);
        assert!(producer.join().unwrap());
    }

    #[test]
    fn test_paused_wait_blocks_until_resume() {
        let ring = Arc::new(FrameRing::new(2, 2, 2));
        let generation = ring.generation();
        ring.set_paused(true);

        let waiter = {
            let ring = Arc::clone(&ring);
            thread::spawn(move || {
                let started = Instant::now();
                ring.wait_until_due(generation, Duration::from_millis(5));
                started.elapsed()
            })
        };
        // the 5 ms deadline does not run while paused
        thread::sleep(Duration::from_millis(60));
        assert!(!waiter.is_finished());

        ring.set_paused(false);
        assert!(waiter.join().unwrap() >= Duration::from_millis(60));
        assert!(!ring.is_paused());
    }

    #[test]
    fn test_due_wait_ends_on_flush_and_close() {
        let ring = Arc::new(FrameRing::new(2, 2, 2));
        let generation = ring.generation();
        let started = Instant::now();
        ring.wait_until_due(generation, Duration::from_millis(10));
        assert!(started.elapsed() >= Duration::from_millis(10));

        ring.set_paused(true);
        let waiter = {
            let ring = Arc::clone(&ring);
            thread::spawn(move || ring.wait_until_due(generation, Duration::from_secs(30)))
        };
        thread::sleep(Duration::from_millis(10));
        ring.flush();
        waiter.join().unwrap();

        let generation = ring.generation();
        let waiter = {
            let ring = Arc::clone(&ring);
            thread::spawn(move || ring.wait_until_due(generation, Duration::from_secs(30)))
        };
        thread::sleep(Duration::from_millis(10));
        ring.close();
        waiter.join().unwrap();
    }

    proptest! {
        #[test]
        fn prop_ring_never_overwrites_ready_frames(
            capacity in 2usize..8,
            ops in proptest::collection::vec(any::<bool>(), 1..200),
        ) {
            let ring = FrameRing::new(capacity, 1, 1);
            let mut written = 0i64;
            let mut expected = 0i64;

            for write in ops {
                if write && ring.len() < capacity {
                    prop_assert!(write_frame(&ring, written));
                    written += 1;
                } else if !write && !ring.is_empty() {
                    let frame = ring.acquire_read(Some(Duration::from_millis(1))).unwrap();
                    prop_assert_eq!(frame.pts, expected);
                    expected += 1;
                    ring.release(frame);
                }
                prop_assert!(ring.len() <= ring.capacity());
            }
        }
    }
}
