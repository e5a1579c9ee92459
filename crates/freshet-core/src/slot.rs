//! Lock-free single-value exchange cell.
//!
//! [`Slot`] holds at most one value and supports atomic overwrite and
//! take. It backs the latest-only operator (where a producer overwrites
//! an un-drained value) and the deferred-scalar machinery (where a value
//! parks until demand arrives).
//!
//! Every access transfers full ownership: `publish` hands the previous
//! value back to the writer and `take` hands the current value to the
//! reader, so no two threads ever observe the same allocation.

use std::ptr;
use std::sync::atomic::{AtomicPtr, Ordering};

/// A single-value atomic cell.
pub struct Slot<T> {
    ptr: AtomicPtr<T>,
}

// SAFETY: the cell only ever hands out owned values; a pointer swapped out
// of `ptr` belongs exclusively to the thread that swapped it.
unsafe impl<T: Send> Send for Slot<T> {}
// SAFETY: see above; shared access goes through atomic swaps only.
unsafe impl<T: Send> Sync for Slot<T> {}

impl<T> Slot<T> {
    /// Creates an empty slot.
    #[must_use]
    pub const fn new() -> Self {
        Self {
            ptr: AtomicPtr::new(ptr::null_mut()),
        }
    }

    /// Stores `value`, returning the value it displaced, if any.
    pub fn publish(&self, value: T) -> Option<T> {
        let next = Box::into_raw(Box::new(value));
        let prev = self.ptr.swap(next, Ordering::AcqRel);
        if prev.is_null() {
            None
        } else {
            // SAFETY: `prev` came out of this cell via swap, so this thread
            // is its sole owner and it was created by `Box::into_raw`.
            Some(*unsafe { Box::from_raw(prev) })
        }
    }

    /// Removes and returns the stored value, if any.
    pub fn take(&self) -> Option<T> {
        let prev = self.ptr.swap(ptr::null_mut(), Ordering::AcqRel);
        if prev.is_null() {
            None
        } else {
            // SAFETY: same ownership argument as in `publish`.
            Some(*unsafe { Box::from_raw(prev) })
        }
    }

    /// Returns `true` while no value is stored.
    ///
    /// A snapshot; a concurrent `publish` can invalidate it immediately.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.ptr.load(Ordering::Acquire).is_null()
    }

    /// Discards the stored value, if any.
    pub fn clear(&self) {
        drop(self.take());
    }
}

impl<T> Default for Slot<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T> Drop for Slot<T> {
    fn drop(&mut self) {
        self.clear();
    }
}

impl<T> std::fmt::Debug for Slot<T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Slot")
            .field("is_empty", &self.is_empty())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;
    use std::thread;

    use super::*;

    #[test]
    fn test_publish_take() {
        let slot = Slot::new();
        assert!(slot.is_empty());

        assert_eq!(slot.publish(1), None);
        assert!(!slot.is_empty());

        assert_eq!(slot.publish(2), Some(1));
        assert_eq!(slot.take(), Some(2));
        assert_eq!(slot.take(), None);
        assert!(slot.is_empty());
    }

    #[test]
    fn test_clear() {
        let slot = Slot::new();
        slot.publish("held");
        slot.clear();
        assert!(slot.is_empty());
    }

    #[test]
    fn test_drop_releases_value() {
        static DROPS: AtomicUsize = AtomicUsize::new(0);

        struct Tracked;
        impl Drop for Tracked {
            fn drop(&mut self) {
                DROPS.fetch_add(1, Ordering::SeqCst);
            }
        }

        DROPS.store(0, Ordering::SeqCst);
        {
            let slot = Slot::new();
            slot.publish(Tracked);
            slot.publish(Tracked); // displaces and drops the first
        }
        assert_eq!(DROPS.load(Ordering::SeqCst), 2);
    }

    #[test]
    fn test_concurrent_overwrite_and_take() {
        const VALUES: usize = 10_000;

        let slot = Arc::new(Slot::new());
        let writer_slot = Arc::clone(&slot);
        let writer = thread::spawn(move || {
            for i in 0..VALUES {
                writer_slot.publish(i);
            }
        });

        let mut last_seen = None;
        while !writer.is_finished() {
            if let Some(v) = slot.take() {
                last_seen = Some(v);
            }
        }
        writer.join().unwrap();

        // Whatever remains is the final published value unless the reader
        // already consumed it.
        if let Some(v) = slot.take() {
            last_seen = Some(v);
        }
        assert_eq!(last_seen, Some(VALUES - 1));
    }
}
