/*
 *  Copyright (C) 2025 Michael Bachmann
 *
 *  This program is free software: you can redistribute it and/or modify
 *  it under the terms of the GNU Affero General Public License as published by
 *  the Free Software Foundation, either version 3 of the License, or
 *  (at your option) any later version.
 *
 *  This program is distributed in the hope that it will be useful,
 *  but WITHOUT ANY WARRANTY; without even the implied warranty of
 *  MERCHANTABILITY or FITNESS FOR A PARTICULAR PURPOSE.  See the
 *  GNU Affero General Public License for more details.
 *
 *  You should have received a copy of the GNU Affero General Public License
 *  along with this program.  If not, see <https://www.gnu.org/licenses/>.
 */

//! Timestamped single-producer/single-consumer frame ring.
//!
//! The ring stores AM824 events (host-order quadlets), `events_per_frame`
//! per frame, and carries one timestamp: the bus time of the sample that
//! would be written next (the tail). The head timestamp is always derived
//! as `tail − fill × nominal_rate`, so reading frames advances it
//! implicitly.
//!
//! The producer and consumer halves may live on different threads; the
//! frame counters are the only cross-thread state and are updated
//! atomically. Control operations (reset, seeding timestamps) are only
//! valid while both sides are quiescent.

use crate::time::Ticks;
use std::{
    cell::UnsafeCell,
    slice::{from_raw_parts, from_raw_parts_mut},
    sync::{
        Arc,
        atomic::{AtomicU64, Ordering},
    },
};

struct RingInner {
    slots: Box<[UnsafeCell<u32>]>,
    capacity_frames: u64,
    events_per_frame: usize,
    frames_written: AtomicU64,
    frames_read: AtomicU64,
    tail_timestamp: AtomicU64,
    nominal_rate_bits: AtomicU64,
    wrap_value: AtomicU64,
}

// The slots are only touched under the SPSC discipline enforced by the
// producer/consumer split below.
unsafe impl Sync for RingInner {}
unsafe impl Send for RingInner {}

impl RingInner {
    fn fill(&self) -> u64 {
        self.frames_written.load(Ordering::Acquire) - self.frames_read.load(Ordering::Acquire)
    }

    fn nominal_rate(&self) -> f64 {
        f64::from_bits(self.nominal_rate_bits.load(Ordering::Acquire))
    }

    fn head_from(&self, tail: u64, fill: u64) -> Ticks {
        let wrap = self.wrap_value.load(Ordering::Acquire);
        let span = (fill as f64 * self.nominal_rate()).round() as u64 % wrap;
        Ticks::new((tail + wrap - span) % wrap)
    }
}

/// Writer half. For capture streams this lives on the iso thread, for
/// playback streams on the client side.
pub struct RingProducer {
    inner: Arc<RingInner>,
    // sub-tick remainder for rate-advanced tail updates
    tail_fraction: f64,
}

/// Reader half, the counterpart of [`RingProducer`].
pub struct RingConsumer {
    inner: Arc<RingInner>,
}

/// Shared control handle for (re)seeding the ring between runs.
#[derive(Clone)]
pub struct RingControl {
    inner: Arc<RingInner>,
}

/// Creates a ring holding at least `capacity_frames` frames of
/// `events_per_frame` quadlets each. Capacity is rounded up to a power of
/// two.
pub fn timestamped_ring(
    capacity_frames: usize,
    events_per_frame: usize,
) -> (RingProducer, RingConsumer, RingControl) {
    let capacity = capacity_frames.next_power_of_two();
    let slots = (0..capacity * events_per_frame)
        .map(|_| UnsafeCell::new(0))
        .collect::<Vec<_>>()
        .into_boxed_slice();
    let inner = Arc::new(RingInner {
        slots,
        capacity_frames: capacity as u64,
        events_per_frame,
        frames_written: AtomicU64::new(0),
        frames_read: AtomicU64::new(0),
        tail_timestamp: AtomicU64::new(0),
        nominal_rate_bits: AtomicU64::new(0f64.to_bits()),
        wrap_value: AtomicU64::new(crate::time::TICKS_PER_WRAP),
    });
    (
        RingProducer {
            inner: inner.clone(),
            tail_fraction: 0.0,
        },
        RingConsumer {
            inner: inner.clone(),
        },
        RingControl { inner },
    )
}

impl RingProducer {
    /// Appends whole frames and sets the tail timestamp to `tail_timestamp`,
    /// the bus time of the *next* frame after this block. Fails without
    /// writing anything when the frames do not fit.
    pub fn write_frames(&mut self, events: &[u32], tail_timestamp: Ticks) -> bool {
        if !self.push(events) {
            return false;
        }
        self.inner
            .tail_timestamp
            .store(tail_timestamp.value(), Ordering::Release);
        self.commit(events);
        true
    }

    /// Appends whole frames, advancing the tail timestamp by
    /// `n × nominal_rate`. Used on the playback path, where the client has
    /// no timestamps of its own.
    pub fn write_frames_rated(&mut self, events: &[u32]) -> bool {
        if !self.push(events) {
            return false;
        }
        let frames = (events.len() / self.inner.events_per_frame) as u64;
        let advance = frames as f64 * self.inner.nominal_rate() + self.tail_fraction;
        let whole = advance.floor();
        self.tail_fraction = advance - whole;
        let tail = Ticks::new(self.inner.tail_timestamp.load(Ordering::Acquire));
        self.inner
            .tail_timestamp
            .store(tail.add(whole as u64).value(), Ordering::Release);
        self.commit(events);
        true
    }

    /// Moves the tail timestamp without storing samples. Used while a
    /// receive stream is disabled so period estimation stays coherent.
    pub fn advance_tail_timestamp(&self, timestamp: Ticks) {
        self.inner
            .tail_timestamp
            .store(timestamp.value(), Ordering::Release);
    }

    pub fn tail_timestamp(&self) -> Ticks {
        Ticks::new(self.inner.tail_timestamp.load(Ordering::Acquire))
    }

    pub fn fill(&self) -> u64 {
        self.inner.fill()
    }

    fn push(&mut self, events: &[u32]) -> bool {
        let epf = self.inner.events_per_frame;
        debug_assert_eq!(events.len() % epf, 0);
        let frames = (events.len() / epf) as u64;
        if self.inner.fill() + frames > self.inner.capacity_frames {
            return false;
        }
        let written = self.inner.frames_written.load(Ordering::Relaxed);
        let start = (written % self.inner.capacity_frames) as usize * epf;
        let total = self.inner.slots.len();
        for (i, &event) in events.iter().enumerate() {
            let idx = (start + i) % total;
            unsafe { *self.inner.slots[idx].get() = event };
        }
        true
    }

    fn commit(&self, events: &[u32]) {
        let frames = (events.len() / self.inner.events_per_frame) as u64;
        self.inner.frames_written.fetch_add(frames, Ordering::Release);
    }
}

impl RingConsumer {
    /// Reads exactly `frames` frames into `dst`. Fails without reading
    /// anything when fewer are buffered.
    pub fn read_frames(&mut self, frames: usize, dst: &mut [u32]) -> bool {
        let epf = self.inner.events_per_frame;
        debug_assert!(dst.len() >= frames * epf);
        if self.inner.fill() < frames as u64 {
            return false;
        }
        let read = self.inner.frames_read.load(Ordering::Relaxed);
        let start = (read % self.inner.capacity_frames) as usize * epf;
        let total = self.inner.slots.len();
        for (i, out) in dst.iter_mut().take(frames * epf).enumerate() {
            let idx = (start + i) % total;
            *out = unsafe { *self.inner.slots[idx].get() };
        }
        self.inner
            .frames_read
            .fetch_add(frames as u64, Ordering::Release);
        true
    }

    pub fn fill(&self) -> u64 {
        self.inner.fill()
    }

    /// Head timestamp and fill, self-consistent under concurrent writes.
    ///
    /// Wait-free: the writer counter is read twice around the timestamp
    /// load and the read retried on a torn observation.
    pub fn head_timestamp(&self) -> (Ticks, u64) {
        loop {
            let w1 = self.inner.frames_written.load(Ordering::Acquire);
            let tail = self.inner.tail_timestamp.load(Ordering::Acquire);
            let w2 = self.inner.frames_written.load(Ordering::Acquire);
            if w1 == w2 {
                let fill = w1 - self.inner.frames_read.load(Ordering::Acquire);
                return (self.inner.head_from(tail, fill), fill);
            }
        }
    }
}

impl RingControl {
    pub fn set_nominal_rate(&self, ticks_per_frame: f64) {
        self.inner
            .nominal_rate_bits
            .store(ticks_per_frame.to_bits(), Ordering::Release);
    }

    pub fn nominal_rate(&self) -> f64 {
        self.inner.nominal_rate()
    }

    pub fn set_wrap_value(&self, wrap: u64) {
        self.inner.wrap_value.store(wrap, Ordering::Release);
    }

    pub fn set_tail_timestamp(&self, timestamp: Ticks) {
        self.inner
            .tail_timestamp
            .store(timestamp.value(), Ordering::Release);
    }

    /// Seeds the head timestamp by deriving the matching tail from the
    /// current fill. Only valid while producer and consumer are quiescent.
    pub fn set_head_timestamp(&self, timestamp: Ticks) {
        let fill = self.inner.fill();
        let span = (fill as f64 * self.inner.nominal_rate()).round() as u64;
        self.inner
            .tail_timestamp
            .store(timestamp.add(span).value(), Ordering::Release);
    }

    pub fn head_timestamp(&self) -> (Ticks, u64) {
        let tail = self.inner.tail_timestamp.load(Ordering::Acquire);
        let fill = self.inner.fill();
        (self.inner.head_from(tail, fill), fill)
    }

    pub fn fill(&self) -> u64 {
        self.inner.fill()
    }

    pub fn capacity(&self) -> u64 {
        self.inner.capacity_frames
    }

    /// Drops all buffered frames and clears the timestamps. Only valid
    /// while producer and consumer are quiescent.
    pub fn reset(&self) {
        self.inner.frames_written.store(0, Ordering::Release);
        self.inner.frames_read.store(0, Ordering::Release);
        self.inner.tail_timestamp.store(0, Ordering::Release);
    }
}

/// A raw view on a client-owned sample buffer attached to an audio port.
///
/// The client guarantees the memory outlives the attachment and is not
/// accessed while a transfer is in flight.
#[derive(Debug, Clone, Copy)]
pub struct AudioBufferPointer {
    ptr: usize,
    len: usize,
}

impl AudioBufferPointer {
    pub fn new(ptr: usize, len: usize) -> Self {
        Self { ptr, len }
    }

    pub fn from_slice<T>(slice: &[T]) -> Self {
        Self::new(slice.as_ptr() as usize, slice.len())
    }

    pub fn buffer<T>(&self) -> &[T] {
        unsafe { from_raw_parts(self.ptr as *const T, self.len) }
    }

    #[allow(clippy::mut_from_ref)]
    pub fn buffer_mut<T>(&self) -> &mut [T] {
        unsafe { from_raw_parts_mut(self.ptr as *mut T, self.len) }
    }

    pub fn len(&self) -> usize {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }
}
