//! PCM queue between the audio decoder and the device IO thread
//!
//! A FIFO of variable-length PCM packets guarded by one mutex and one
//! condition variable. The same lock protects the running audio clock
//! (`clock_offset`, `last_known_time`, `xrun_time`) so that flushes,
//! clock resets and device writes are observed atomically.
//!
//! When a generation has played out the IO thread reports it through the
//! drained hook, called without the ring lock held.

use crate::audio::PcmPacket;
use parking_lot::{Condvar, Mutex, MutexGuard};
use std::collections::VecDeque;
use std::time::Instant;

/// State behind the ring's lock
pub(crate) struct RingState {
    pub(crate) packets: VecDeque<PcmPacket>,
    /// Frames of the front packet already handed to the device
    pub(crate) front_offset: usize,
    /// Frames queued and not yet written
    pub(crate) accumulated: usize,
    pub(crate) generation: u64,
    pub(crate) paused: bool,
    pub(crate) flushing: bool,
    pub(crate) eos: bool,
    pub(crate) drained: bool,
    pub(crate) closed: bool,

    /// Clock value at the last device start, in micros
    pub(crate) clock_offset: i64,
    /// Last value handed out by the clock
    pub(crate) last_known_time: i64,
    /// Clock value at which the device will run dry
    pub(crate) xrun_time: i64,
    /// Audio that was queued in hardware when the clock was frozen
    pub(crate) pause_skew: i64,
    /// Whether the clock was latched to a stream timestamp
    pub(crate) latched: bool,
    /// Set once the stream played out; the clock then follows the wall clock
    pub(crate) free_run_since: Option<Instant>,
}

type DrainedHook = Box<dyn Fn(u64) + Send + Sync>;

/// FIFO of decoded PCM packets with the audio clock state
pub struct AudioRingBuffer {
    state: Mutex<RingState>,
    changed: Condvar,
    on_drained: Mutex<Option<DrainedHook>>,
    channels: u16,
}

impl AudioRingBuffer {
    /// Create an empty ring for interleaved PCM with `channels` channels
    pub fn new(channels: u16) -> Self {
        Self {
            state: Mutex::new(RingState {
                packets: VecDeque::new(),
                front_offset: 0,
                accumulated: 0,
                generation: 0,
                paused: false,
                flushing: false,
                eos: false,
                drained: false,
                closed: false,
                clock_offset: 0,
                last_known_time: 0,
                xrun_time: 0,
                pause_skew: 0,
                latched: false,
                free_run_since: None,
            }),
            changed: Condvar::new(),
            on_drained: Mutex::new(None),
            channels: channels.max(1),
        }
    }

    /// Append a packet; returns `false` if it was dropped because the ring is
    /// closed or being flushed
    pub fn push(&self, packet: PcmPacket) -> bool {
        if packet.samples.is_empty() {
            return true;
        }
        let mut state = self.state.lock();
        if state.closed || state.flushing {
            return false;
        }
        state.accumulated += packet.frames();
        state.drained = false;
        state.packets.push_back(packet);
        self.changed.notify_all();
        true
    }

    /// Block while more than `max_frames` frames are queued
    ///
    /// Returns `false` when woken by a flush request or shutdown.
    pub fn wait_for_space(&self, max_frames: usize) -> bool {
        let mut state = self.state.lock();
        loop {
            if state.closed || state.flushing {
                return false;
            }
            if state.accumulated <= max_frames {
                return true;
            }
            self.changed.wait(&mut state);
        }
    }

    /// Block while the queued frame count still equals `seen` and is below
    /// `frames`; returns the queued frame count
    ///
    /// End of stream and shutdown end the wait. With `seen` of `None` the
    /// current count is returned at once.
    pub fn wait_fill(&self, frames: usize, seen: Option<usize>) -> usize {
        let mut state = self.state.lock();
        while state.accumulated < frames && !state.eos && !state.closed && Some(state.accumulated) == seen {
            self.changed.wait(&mut state);
        }
        state.accumulated
    }

    /// Call `hook` with the generation each time that generation has played out
    pub fn set_drained_hook(&self, hook: impl Fn(u64) + Send + Sync + 'static) {
        *self.on_drained.lock() = Some(Box::new(hook));
    }

    /// Run the drained hook; the caller must not hold the ring lock
    pub(crate) fn report_drained(&self, generation: u64) {
        if let Some(hook) = self.on_drained.lock().as_ref() {
            hook(generation);
        }
    }

    /// Wake a decoder blocked in [`wait_for_space`](Self::wait_for_space)
    pub fn begin_flush(&self) {
        let mut state = self.state.lock();
        state.flushing = true;
        self.changed.notify_all();
    }

    /// Drop all queued PCM and start a new generation
    ///
    /// Returns the number of discarded frames.
    pub fn flush(&self) -> usize {
        let mut state = self.lock();
        let discarded = Self::clear_locked(&mut state);
        self.changed.notify_all();
        discarded
    }

    pub(crate) fn clear_locked(state: &mut RingState) -> usize {
        let discarded = state.accumulated;
        state.packets.clear();
        state.front_offset = 0;
        state.accumulated = 0;
        state.generation += 1;
        state.flushing = false;
        state.eos = false;
        state.drained = false;
        state.free_run_since = None;
        discarded
    }

    /// Mark that the decoder produced its last packet
    pub fn mark_eos(&self) {
        let mut state = self.state.lock();
        state.eos = true;
        self.changed.notify_all();
    }

    /// Close the ring and wake every waiter
    pub fn close(&self) {
        let mut state = self.state.lock();
        state.closed = true;
        self.changed.notify_all();
    }

    /// Frames queued and not yet written to the device
    pub fn accumulated_frames(&self) -> usize {
        self.state.lock().accumulated
    }

    /// Whether no PCM is queued
    pub fn is_empty(&self) -> bool {
        self.accumulated_frames() == 0
    }

    /// Whether end of stream was reached and every frame was played out
    pub fn is_drained(&self) -> bool {
        self.state.lock().drained
    }

    /// Current flush generation
    pub fn generation(&self) -> u64 {
        self.state.lock().generation
    }

    /// Whether the ring was closed
    pub fn is_closed(&self) -> bool {
        self.state.lock().closed
    }

    /// Channel count of queued PCM
    pub fn channels(&self) -> u16 {
        self.channels
    }

    pub(crate) fn lock(&self) -> MutexGuard<'_, RingState> {
        self.state.lock()
    }

    pub(crate) fn notify(&self) {
        self.changed.notify_all();
    }

    /// Wait on the ring's condition variable until `deadline`
    pub(crate) fn wait_until(&self, state: &mut MutexGuard<'_, RingState>, deadline: Instant) -> bool {
        !self.changed.wait_until(state, deadline).timed_out()
    }

    pub(crate) fn wait(&self, state: &mut MutexGuard<'_, RingState>) {
        self.changed.wait(state);
    }

    /// Copy up to `max_frames` frames from the queue front into `out`
    ///
    /// Nothing is consumed; call [`consume_locked`](Self::consume_locked)
    /// with the number of frames the device accepted.
    pub(crate) fn peek_locked(&self, state: &RingState, out: &mut Vec<i16>, max_frames: usize) -> usize {
        out.clear();
        let channels = self.channels as usize;
        let mut offset = state.front_offset;
        let mut frames = 0;

        for packet in state.packets.iter() {
            if frames >= max_frames {
                break;
            }
            let available = packet.frames().saturating_sub(offset);
            let take = available.min(max_frames - frames);
            let start = offset * channels;
            out.extend_from_slice(&packet.samples[start..start + take * channels]);
            frames += take;
            offset = 0;
        }
        frames
    }

    /// Remove `frames` frames from the queue front
    pub(crate) fn consume_locked(&self, state: &mut RingState, mut frames: usize) {
        while frames > 0 {
            let Some(front) = state.packets.front() else {
                break;
            };
            let remaining = front.frames() - state.front_offset;
            if frames < remaining {
                state.front_offset += frames;
                state.accumulated -= frames;
                break;
            }
            frames -= remaining;
            state.accumulated -= remaining;
            state.front_offset = 0;
            state.packets.pop_front();
        }
        self.changed.notify_all();
    }
}
