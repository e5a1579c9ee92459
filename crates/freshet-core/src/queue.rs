//! Bounded lock-free SPSC ring queue.
//!
//! Fused operator pairs exchange elements through a queue instead of the
//! push path; [`RingQueue`] is the bounded buffer behind those paths.
//!
//! Design:
//!
//! - Power-of-2 capacity with bitmask indexing
//! - Cache-padded head/tail indices to prevent false sharing
//! - Acquire/Release ordering; one slot reserved to distinguish full from
//!   empty
//!
//! The queue is safe for exactly one producer thread and one consumer
//! thread; serialized drain loops provide the single-consumer guarantee.

use std::cell::UnsafeCell;
use std::mem::MaybeUninit;
use std::sync::atomic::{AtomicUsize, Ordering};

/// Pads a value to a cache line boundary to prevent false sharing.
#[repr(C, align(64))]
#[derive(Debug, Default)]
pub struct CachePadded<T> {
    value: T,
}

impl<T> CachePadded<T> {
    /// Wraps `value` in its own cache line.
    #[must_use]
    pub const fn new(value: T) -> Self {
        Self { value }
    }
}

impl<T> std::ops::Deref for CachePadded<T> {
    type Target = T;

    fn deref(&self) -> &Self::Target {
        &self.value
    }
}

impl<T> std::ops::DerefMut for CachePadded<T> {
    fn deref_mut(&mut self) -> &mut Self::Target {
        &mut self.value
    }
}

/// A bounded single-producer single-consumer queue.
pub struct RingQueue<T> {
    buffer: Box<[UnsafeCell<MaybeUninit<T>>]>,

    /// Consumer index. Padded away from `tail`.
    head: CachePadded<AtomicUsize>,

    /// Producer index. Padded away from `head`.
    tail: CachePadded<AtomicUsize>,

    /// Capacity mask (capacity - 1) for fast modulo.
    mask: usize,
}

// SAFETY: slots are handed off through the head/tail protocol below; a
// producer only writes unpublished slots and a consumer only reads
// published ones, so sending the queue requires only `T: Send`.
unsafe impl<T: Send> Send for RingQueue<T> {}
// SAFETY: see above; shared access is mediated by the atomic indices.
unsafe impl<T: Send> Sync for RingQueue<T> {}

impl<T> RingQueue<T> {
    /// Creates a queue holding up to `capacity - 1` elements, with
    /// `capacity` rounded up to a power of 2 (minimum 2).
    ///
    /// # Panics
    ///
    /// Panics if `capacity` is 0.
    #[must_use]
    pub fn new(capacity: usize) -> Self {
        assert!(capacity > 0, "capacity must be > 0");
        let capacity = capacity.max(2).next_power_of_two();

        let buffer: Vec<UnsafeCell<MaybeUninit<T>>> = (0..capacity)
            .map(|_| UnsafeCell::new(MaybeUninit::uninit()))
            .collect();

        Self {
            buffer: buffer.into_boxed_slice(),
            head: CachePadded::new(AtomicUsize::new(0)),
            tail: CachePadded::new(AtomicUsize::new(0)),
            mask: capacity - 1,
        }
    }

    /// Returns the allocated capacity (one slot of which stays reserved).
    #[inline]
    #[must_use]
    pub fn capacity(&self) -> usize {
        self.mask + 1
    }

    /// Returns `true` when no elements are buffered. Snapshot only.
    #[inline]
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.head.load(Ordering::Acquire) == self.tail.load(Ordering::Acquire)
    }

    /// Returns the buffered element count. Snapshot only.
    #[inline]
    #[must_use]
    pub fn len(&self) -> usize {
        let head = self.head.load(Ordering::Acquire);
        let tail = self.tail.load(Ordering::Acquire);
        tail.wrapping_sub(head) & self.mask
    }

    /// Enqueues `item`.
    ///
    /// # Errors
    ///
    /// Returns the item back when the queue is full.
    #[inline]
    pub fn push(&self, item: T) -> Result<(), T> {
        let tail = self.tail.load(Ordering::Relaxed);
        let next = (tail + 1) & self.mask;

        if next == self.head.load(Ordering::Acquire) {
            return Err(item);
        }

        // SAFETY: this slot is not yet published (tail unchanged) and the
        // single producer has exclusive write access to it.
        unsafe {
            (*self.buffer[tail].get()).write(item);
        }

        self.tail.store(next, Ordering::Release);
        Ok(())
    }

    /// Dequeues the oldest element, if any.
    #[inline]
    #[must_use]
    pub fn pop(&self) -> Option<T> {
        let head = self.head.load(Ordering::Relaxed);

        if head == self.tail.load(Ordering::Acquire) {
            return None;
        }

        // SAFETY: the slot was published by the producer (head < tail) and
        // the single consumer has exclusive read access to it.
        let item = unsafe { (*self.buffer[head].get()).assume_init_read() };

        self.head.store((head + 1) & self.mask, Ordering::Release);
        Some(item)
    }

    /// Discards all buffered elements. Consumer-side operation.
    pub fn clear(&self) {
        while self.pop().is_some() {}
    }
}

impl<T> Drop for RingQueue<T> {
    fn drop(&mut self) {
        self.clear();
    }
}

impl<T> std::fmt::Debug for RingQueue<T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RingQueue")
            .field("capacity", &self.capacity())
            .field("len", &self.len())
            .finish()
    }
}
