//! Scalar sources: `empty`, `never`, `just`.
//!
//! Also home to the two degenerate subscriptions the rest of the crate
//! leans on: [`EmptySubscription`] (signals nothing, used wherever a
//! terminal must be delivered before a real subscription exists) and
//! [`ScalarSubscription`] (a single value with a request-once gate and
//! native Sync fusion).

use std::sync::atomic::{AtomicU8, Ordering};
use std::sync::Arc;

use crate::demand;
use crate::error::StreamError;
use crate::hooks;
use crate::slot::Slot;
use crate::stream::{
    Downstream, FusedSubscription, FusionMode, Stage, Subscription, SubscriptionHandle,
};

// ---------------------------------------------------------------------------
// EmptySubscription
// ---------------------------------------------------------------------------

/// A subscription that accepts every signal and does nothing.
///
/// Handed to subscribers that must receive `on_subscribe` before an
/// immediate terminal.
#[derive(Debug, Default, Clone, Copy)]
pub struct EmptySubscription;

impl EmptySubscription {
    /// Delivers `on_subscribe` followed by `on_complete`.
    pub fn complete<T>(downstream: &Downstream<T>) {
        downstream.on_subscribe(SubscriptionHandle::Plain(Arc::new(Self)));
        downstream.on_complete();
    }

    /// Delivers `on_subscribe` followed by `on_error`.
    pub fn error<T>(downstream: &Downstream<T>, error: StreamError) {
        downstream.on_subscribe(SubscriptionHandle::Plain(Arc::new(Self)));
        downstream.on_error(error);
    }
}

impl Subscription for EmptySubscription {
    fn request(&self, _n: u64) {}

    fn cancel(&self) {}
}

// ---------------------------------------------------------------------------
// ScalarSubscription
// ---------------------------------------------------------------------------

const FRESH: u8 = 0;
const EMITTED: u8 = 1;
const CANCELLED: u8 = 2;

/// Emits exactly one value on the first valid request.
///
/// Fuseable in Sync mode: a fused downstream polls the value instead of
/// requesting it.
pub struct ScalarSubscription<T> {
    downstream: Downstream<T>,
    value: Slot<T>,
    state: AtomicU8,
}

impl<T: Send + 'static> ScalarSubscription<T> {
    /// Creates the subscription holding `value` for `downstream`.
    #[must_use]
    pub fn new(downstream: Downstream<T>, value: T) -> Self {
        let slot = Slot::new();
        slot.publish(value);
        Self {
            downstream,
            value: slot,
            state: AtomicU8::new(FRESH),
        }
    }
}

impl<T: Send + 'static> Subscription for ScalarSubscription<T> {
    fn request(&self, n: u64) {
        if let Err(error) = demand::validate(n) {
            if self
                .state
                .compare_exchange(FRESH, CANCELLED, Ordering::AcqRel, Ordering::Acquire)
                .is_ok()
            {
                self.value.clear();
                self.downstream.on_error(error);
            } else {
                hooks::on_error_dropped(&error);
            }
            return;
        }

        if self
            .state
            .compare_exchange(FRESH, EMITTED, Ordering::AcqRel, Ordering::Acquire)
            .is_ok()
        {
            if let Some(value) = self.value.take() {
                self.downstream.on_next(value);
            }
            if self.state.load(Ordering::Acquire) != CANCELLED {
                self.downstream.on_complete();
            }
        }
    }

    fn cancel(&self) {
        self.state.store(CANCELLED, Ordering::Release);
        self.value.clear();
    }
}

impl<T: Send + 'static> FusedSubscription<T> for ScalarSubscription<T> {
    fn request_fusion(&self, requested: FusionMode) -> FusionMode {
        if requested.contains(FusionMode::SYNC) {
            FusionMode::SYNC
        } else {
            FusionMode::NONE
        }
    }

    fn poll(&self) -> Result<Option<T>, StreamError> {
        Ok(self.value.take())
    }

    fn is_empty(&self) -> bool {
        self.value.is_empty()
    }

    fn len(&self) -> usize {
        usize::from(!self.value.is_empty())
    }

    fn clear(&self) {
        self.value.clear();
    }
}

// ---------------------------------------------------------------------------
// Stages
// ---------------------------------------------------------------------------

/// Completes immediately without emitting.
#[derive(Debug, Default, Clone, Copy)]
pub struct EmptyStage;

impl<T> Stage<T> for EmptyStage {
    fn subscribe(&self, downstream: Downstream<T>) {
        EmptySubscription::complete(&downstream);
    }
}

/// Signals `on_subscribe` and then nothing, ever.
#[derive(Debug, Default, Clone, Copy)]
pub struct NeverStage;

impl<T> Stage<T> for NeverStage {
    fn subscribe(&self, downstream: Downstream<T>) {
        downstream.on_subscribe(SubscriptionHandle::Plain(Arc::new(EmptySubscription)));
    }
}

/// Emits a single value and completes.
#[derive(Debug, Clone)]
pub struct JustStage<T> {
    value: T,
}

impl<T: Clone + Send + Sync + 'static> JustStage<T> {
    /// Creates a single-value source.
    #[must_use]
    pub fn new(value: T) -> Self {
        Self { value }
    }
}

impl<T: Clone + Send + Sync + 'static> Stage<T> for JustStage<T> {
    fn subscribe(&self, downstream: Downstream<T>) {
        let subscription = Arc::new(ScalarSubscription::new(
            downstream.clone(),
            self.value.clone(),
        ));
        downstream.on_subscribe(SubscriptionHandle::Fused(subscription));
    }
}

/// A completed source with no elements.
#[must_use]
pub fn empty() -> EmptyStage {
    EmptyStage
}

/// A source that never signals beyond `on_subscribe`.
#[must_use]
pub fn never() -> NeverStage {
    NeverStage
}

/// A single-element source.
pub fn just<T: Clone + Send + Sync + 'static>(value: T) -> JustStage<T> {
    JustStage::new(value)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::TestSubscriber;

    #[test]
    fn test_empty_completes_immediately() {
        let ts = TestSubscriber::<i32>::new();
        empty().subscribe(ts.downstream());

        ts.assert_no_values().assert_complete().assert_no_error();
    }

    #[test]
    fn test_never_only_subscribes() {
        let ts = TestSubscriber::<i32>::new();
        never().subscribe(ts.downstream());

        assert!(ts.handle().is_some());
        ts.assert_no_values().assert_not_complete().assert_no_error();
    }

    #[test]
    fn test_just_emits_single_value() {
        let ts = TestSubscriber::new();
        just(42).subscribe(ts.downstream());

        ts.assert_values(&[42]).assert_complete().assert_no_error();
    }

    #[test]
    fn test_just_backpressured() {
        let ts = TestSubscriber::<i32>::with_request(0);
        just(42).subscribe(ts.downstream());

        ts.assert_no_values().assert_not_complete();
        ts.request(1);
        ts.assert_values(&[42]).assert_complete();
    }

    #[test]
    fn test_just_invalid_request() {
        let ts = TestSubscriber::<i32>::with_request(0);
        just(42).subscribe(ts.downstream());

        ts.request(0);
        ts.assert_no_values()
            .assert_error(&StreamError::InvalidRequest(0));
    }

    #[test]
    fn test_just_sync_fusion_poll() {
        let ts = TestSubscriber::<i32>::with_request(0);
        just(7).subscribe(ts.downstream());

        let handle = ts.handle().unwrap();
        let fused = handle.fused().cloned().expect("scalar source is fuseable");
        assert_eq!(fused.request_fusion(FusionMode::ANY), FusionMode::SYNC);

        assert!(!fused.is_empty());
        assert_eq!(fused.len(), 1);
        assert_eq!(fused.poll(), Ok(Some(7)));
        // Sync contract: the next poll is the completion.
        assert_eq!(fused.poll(), Ok(None));
        assert!(fused.is_empty());
    }

    #[test]
    fn test_scalar_cancel_clears() {
        let ts = TestSubscriber::<i32>::with_request(0);
        just(7).subscribe(ts.downstream());

        ts.cancel();
        ts.request(1);
        ts.assert_no_values().assert_not_complete().assert_no_error();
    }
}
