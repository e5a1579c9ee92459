//! Deferred scalar emission.
//!
//! Operators that reduce a whole sequence to one value (element tests,
//! fallbacks, folds) learn their result at completion time, which may be
//! before or after the downstream asks for it. [`DeferredScalar`] is the
//! four-state CAS machine reconciling the two orders: whichever of
//! {request, value} arrives second performs the emission.

use std::sync::atomic::{AtomicU8, Ordering};

use crate::error::StreamError;
use crate::slot::Slot;
use crate::stream::{Downstream, SubscriptionHandle};

const NO_REQUEST_NO_VALUE: u8 = 0;
const NO_REQUEST_HAS_VALUE: u8 = 1;
const HAS_REQUEST_NO_VALUE: u8 = 2;
const TERMINATED: u8 = 3;
const CANCELLED: u8 = 4;

/// Single-value emission deferred until both demand and the value exist.
pub struct DeferredScalar<R> {
    state: AtomicU8,
    value: Slot<R>,
    downstream: Downstream<R>,
}

impl<R: Send + 'static> DeferredScalar<R> {
    /// Creates the machine for `downstream`.
    #[must_use]
    pub fn new(downstream: Downstream<R>) -> Self {
        Self {
            state: AtomicU8::new(NO_REQUEST_NO_VALUE),
            value: Slot::new(),
            downstream,
        }
    }

    /// Forwards `on_subscribe` to the wrapped downstream.
    pub fn deliver_on_subscribe(&self, handle: SubscriptionHandle<R>) {
        self.downstream.on_subscribe(handle);
    }

    /// Registers demand. Emits immediately when the value already arrived.
    pub fn request(&self, _n: u64) {
        loop {
            match self.state.load(Ordering::Acquire) {
                NO_REQUEST_NO_VALUE => {
                    if self
                        .state
                        .compare_exchange(
                            NO_REQUEST_NO_VALUE,
                            HAS_REQUEST_NO_VALUE,
                            Ordering::AcqRel,
                            Ordering::Acquire,
                        )
                        .is_ok()
                    {
                        return;
                    }
                }
                NO_REQUEST_HAS_VALUE => {
                    if self
                        .state
                        .compare_exchange(
                            NO_REQUEST_HAS_VALUE,
                            TERMINATED,
                            Ordering::AcqRel,
                            Ordering::Acquire,
                        )
                        .is_ok()
                    {
                        if let Some(value) = self.value.take() {
                            self.downstream.on_next(value);
                        }
                        self.downstream.on_complete();
                        return;
                    }
                }
                _ => return,
            }
        }
    }

    /// Supplies the result. Emits immediately when demand already arrived.
    pub fn complete_with(&self, value: R) {
        self.value.publish(value);
        loop {
            match self.state.load(Ordering::Acquire) {
                NO_REQUEST_NO_VALUE => {
                    if self
                        .state
                        .compare_exchange(
                            NO_REQUEST_NO_VALUE,
                            NO_REQUEST_HAS_VALUE,
                            Ordering::AcqRel,
                            Ordering::Acquire,
                        )
                        .is_ok()
                    {
                        return;
                    }
                }
                HAS_REQUEST_NO_VALUE => {
                    if self
                        .state
                        .compare_exchange(
                            HAS_REQUEST_NO_VALUE,
                            TERMINATED,
                            Ordering::AcqRel,
                            Ordering::Acquire,
                        )
                        .is_ok()
                    {
                        if let Some(value) = self.value.take() {
                            self.downstream.on_next(value);
                        }
                        self.downstream.on_complete();
                        return;
                    }
                }
                CANCELLED => {
                    self.value.clear();
                    return;
                }
                _ => return,
            }
        }
    }

    /// Completes without a value.
    pub fn complete_empty(&self) {
        if self.terminate() {
            self.downstream.on_complete();
        }
    }

    /// Fails the sequence.
    pub fn error(&self, error: StreamError) -> bool {
        if self.terminate() {
            self.downstream.on_error(error);
            true
        } else {
            false
        }
    }

    /// Cancels; a parked value is discarded.
    pub fn cancel(&self) {
        self.state.store(CANCELLED, Ordering::Release);
        self.value.clear();
    }

    /// Returns `true` after [`cancel`](Self::cancel).
    #[must_use]
    pub fn is_cancelled(&self) -> bool {
        self.state.load(Ordering::Acquire) == CANCELLED
    }

    fn terminate(&self) -> bool {
        loop {
            let state = self.state.load(Ordering::Acquire);
            if state == TERMINATED || state == CANCELLED {
                return false;
            }
            if self
                .state
                .compare_exchange(state, TERMINATED, Ordering::AcqRel, Ordering::Acquire)
                .is_ok()
            {
                self.value.clear();
                return true;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::TestSubscriber;

    #[test]
    fn test_request_then_value() {
        let ts = TestSubscriber::<i32>::with_request(0);
        let deferred = DeferredScalar::new(ts.downstream());

        deferred.request(1);
        ts.assert_no_values();

        deferred.complete_with(5);
        ts.assert_values(&[5]).assert_complete();
    }

    #[test]
    fn test_value_then_request() {
        let ts = TestSubscriber::<i32>::with_request(0);
        let deferred = DeferredScalar::new(ts.downstream());

        deferred.complete_with(5);
        ts.assert_no_values().assert_not_complete();

        deferred.request(1);
        ts.assert_values(&[5]).assert_complete();
    }

    #[test]
    fn test_cancel_discards_parked_value() {
        let ts = TestSubscriber::<i32>::with_request(0);
        let deferred = DeferredScalar::new(ts.downstream());

        deferred.complete_with(5);
        deferred.cancel();
        deferred.request(1);

        ts.assert_no_values().assert_not_complete();
    }

    #[test]
    fn test_error_wins_over_parked_value() {
        let ts = TestSubscriber::<i32>::with_request(0);
        let deferred = DeferredScalar::new(ts.downstream());

        deferred.complete_with(5);
        assert!(deferred.error(StreamError::callback("failed")));
        deferred.request(1);

        ts.assert_no_values()
            .assert_error(&StreamError::callback("failed"));
    }

    #[test]
    fn test_complete_empty() {
        let ts = TestSubscriber::<i32>::with_request(0);
        let deferred = DeferredScalar::new(ts.downstream());

        deferred.complete_empty();
        ts.assert_no_values().assert_complete();
    }
}
