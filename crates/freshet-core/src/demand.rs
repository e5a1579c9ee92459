//! Backpressure arithmetic.
//!
//! Demand is a per-subscription `u64` that saturates at [`UNBOUNDED`]. Once
//! a subscription's demand reaches the sentinel it never decrements; the
//! subscription is in unbounded mode and produced-element accounting stops.
//!
//! The accumulator is shared between the downstream thread (which adds via
//! `request`) and whichever thread is currently draining (which subtracts
//! what it produced), so every operation is a single atomic RMW.

use std::sync::atomic::{AtomicU64, Ordering};

use crate::error::StreamError;

/// Sentinel for "no backpressure": the maximum demand value, absorbing
/// under addition.
pub const UNBOUNDED: u64 = u64::MAX;

/// Validates a request amount.
///
/// # Errors
///
/// Returns [`StreamError::InvalidRequest`] when `n` is zero; the caller
/// surfaces it downstream as a protocol violation.
pub fn validate(n: u64) -> Result<(), StreamError> {
    if n == 0 {
        return Err(StreamError::InvalidRequest(n));
    }
    Ok(())
}

/// Saturating demand addition: any sum reaching [`UNBOUNDED`] stays there.
#[must_use]
pub const fn saturating_add(current: u64, n: u64) -> u64 {
    current.saturating_add(n)
}

/// Atomic demand accumulator for one subscription.
#[derive(Debug, Default)]
pub struct Demand(AtomicU64);

impl Demand {
    /// Creates an accumulator with zero demand.
    #[must_use]
    pub const fn new() -> Self {
        Self(AtomicU64::new(0))
    }

    /// Adds `n` to the accumulator, saturating at [`UNBOUNDED`].
    ///
    /// Returns the demand that was outstanding *before* the addition; a
    /// zero return tells the caller it just transitioned the subscription
    /// from idle to demanded and owns the emission loop.
    pub fn add(&self, n: u64) -> u64 {
        let mut current = self.0.load(Ordering::Acquire);
        loop {
            if current == UNBOUNDED {
                return UNBOUNDED;
            }
            let next = saturating_add(current, n);
            match self.0.compare_exchange_weak(
                current,
                next,
                Ordering::AcqRel,
                Ordering::Acquire,
            ) {
                Ok(_) => return current,
                Err(observed) => current = observed,
            }
        }
    }

    /// Subtracts `n` produced elements, unless the demand is unbounded.
    ///
    /// Returns the remaining demand.
    pub fn produced(&self, n: u64) -> u64 {
        let mut current = self.0.load(Ordering::Acquire);
        loop {
            if current == UNBOUNDED {
                return UNBOUNDED;
            }
            // The drain loop never emits more than it observed as requested.
            let next = current.saturating_sub(n);
            match self.0.compare_exchange_weak(
                current,
                next,
                Ordering::AcqRel,
                Ordering::Acquire,
            ) {
                Ok(_) => return next,
                Err(observed) => current = observed,
            }
        }
    }

    /// Returns the outstanding demand.
    #[must_use]
    pub fn get(&self) -> u64 {
        self.0.load(Ordering::Acquire)
    }

    /// Swaps the accumulator to zero, returning what was outstanding.
    ///
    /// Used to drain demand accumulated before an upstream arrived.
    pub fn take(&self) -> u64 {
        self.0.swap(0, Ordering::AcqRel)
    }

    /// Returns `true` once the unbounded sentinel has been absorbed.
    #[must_use]
    pub fn is_unbounded(&self) -> bool {
        self.get() == UNBOUNDED
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;
    use std::thread;

    use super::*;

    #[test]
    fn test_validate() {
        assert_eq!(validate(0), Err(StreamError::InvalidRequest(0)));
        assert!(validate(1).is_ok());
        assert!(validate(UNBOUNDED).is_ok());
    }

    #[test]
    fn test_add_returns_previous() {
        let demand = Demand::new();
        assert_eq!(demand.add(5), 0);
        assert_eq!(demand.add(3), 5);
        assert_eq!(demand.get(), 8);
    }

    #[test]
    fn test_saturation_is_absorbing() {
        let demand = Demand::new();
        demand.add(UNBOUNDED - 1);
        demand.add(10);
        assert_eq!(demand.get(), UNBOUNDED);

        // Unbounded never decrements.
        assert_eq!(demand.produced(100), UNBOUNDED);
        assert_eq!(demand.get(), UNBOUNDED);
    }

    #[test]
    fn test_produced_subtracts() {
        let demand = Demand::new();
        demand.add(10);
        assert_eq!(demand.produced(4), 6);
        assert_eq!(demand.produced(6), 0);
    }

    #[test]
    fn test_take_drains() {
        let demand = Demand::new();
        demand.add(7);
        assert_eq!(demand.take(), 7);
        assert_eq!(demand.get(), 0);
        assert_eq!(demand.take(), 0);
    }

    #[test]
    fn test_concurrent_accumulation() {
        const THREADS: usize = 4;
        const PER_THREAD: u64 = 10_000;

        let demand = Arc::new(Demand::new());
        let handles: Vec<_> = (0..THREADS)
            .map(|_| {
                let demand = Arc::clone(&demand);
                thread::spawn(move || {
                    for _ in 0..PER_THREAD {
                        demand.add(1);
                    }
                })
            })
            .collect();

        for handle in handles {
            handle.join().unwrap();
        }

        assert_eq!(demand.get(), THREADS as u64 * PER_THREAD);
    }
}
