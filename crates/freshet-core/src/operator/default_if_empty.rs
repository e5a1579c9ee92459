//! Fallback value for sequences that complete without emitting.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Weak};

use crate::demand;
use crate::error::StreamError;
use crate::hooks;
use crate::stream::{Downstream, Stage, Subscriber, Subscription, SubscriptionHandle};
use crate::upstream::UpstreamCell;

use super::deferred::DeferredScalar;

/// Passes elements through; an empty source yields the default instead.
pub struct DefaultIfEmptyStage<T> {
    source: Arc<dyn Stage<T>>,
    default_value: T,
}

impl<T: Clone + Send + Sync + 'static> DefaultIfEmptyStage<T> {
    /// Wraps `source` with `default_value` as the empty fallback.
    #[must_use]
    pub fn new(source: Arc<dyn Stage<T>>, default_value: T) -> Self {
        Self {
            source,
            default_value,
        }
    }
}

impl<T: Clone + Send + Sync + 'static> Stage<T> for DefaultIfEmptyStage<T> {
    fn subscribe(&self, downstream: Downstream<T>) {
        let subscription = Arc::new_cyclic(|self_ref| DefaultIfEmptySubscription {
            self_ref: self_ref.clone(),
            deferred: DeferredScalar::new(downstream.clone()),
            downstream,
            default_value: self.default_value.clone(),
            has_value: AtomicBool::new(false),
            done: AtomicBool::new(false),
            upstream: UpstreamCell::new(),
        });
        self.source.subscribe(Downstream::Plain(subscription));
    }
}

struct DefaultIfEmptySubscription<T> {
    self_ref: Weak<Self>,
    /// Emission path for the fallback only; live elements bypass it.
    deferred: DeferredScalar<T>,
    downstream: Downstream<T>,
    default_value: T,
    has_value: AtomicBool,
    done: AtomicBool,
    upstream: UpstreamCell<T>,
}

impl<T: Clone + Send + Sync + 'static> Subscriber<T> for DefaultIfEmptySubscription<T> {
    fn on_subscribe(&self, upstream: SubscriptionHandle<T>) {
        if !self.upstream.set_once(upstream) {
            return;
        }
        let Some(this) = self.self_ref.upgrade() else {
            return;
        };
        self.downstream.on_subscribe(SubscriptionHandle::Plain(this));
    }

    fn on_next(&self, value: T) {
        if self.done.load(Ordering::Acquire) {
            hooks::on_value_dropped(value);
            return;
        }
        self.has_value.store(true, Ordering::Release);
        self.downstream.on_next(value);
    }

    fn on_error(&self, error: StreamError) {
        if self.done.swap(true, Ordering::AcqRel) {
            hooks::on_error_dropped(&error);
            return;
        }
        self.downstream.on_error(error);
    }

    fn on_complete(&self) {
        if self.done.swap(true, Ordering::AcqRel) {
            return;
        }
        if self.has_value.load(Ordering::Acquire) {
            self.downstream.on_complete();
        } else {
            self.deferred.complete_with(self.default_value.clone());
        }
    }
}

impl<T: Clone + Send + Sync + 'static> Subscription for DefaultIfEmptySubscription<T> {
    fn request(&self, n: u64) {
        if let Err(error) = demand::validate(n) {
            self.upstream.terminate();
            self.on_error(error);
            return;
        }
        self.deferred.request(n);
        self.upstream.request(n);
    }

    fn cancel(&self) {
        self.deferred.cancel();
        self.upstream.terminate();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::operator::range::range;
    use crate::operator::scalar::empty;
    use crate::testing::TestSubscriber;

    #[test]
    fn test_passthrough_when_not_empty() {
        let ts = TestSubscriber::new();
        DefaultIfEmptyStage::new(Arc::new(range(1, 3)) as Arc<dyn Stage<i64>>, 99)
            .subscribe(ts.downstream());

        ts.assert_values(&[1, 2, 3]).assert_complete();
    }

    #[test]
    fn test_default_for_empty_source() {
        let ts = TestSubscriber::new();
        DefaultIfEmptyStage::new(Arc::new(empty()) as Arc<dyn Stage<i64>>, 99)
            .subscribe(ts.downstream());

        ts.assert_values(&[99]).assert_complete();
    }

    #[test]
    fn test_default_waits_for_demand() {
        let ts = TestSubscriber::with_request(0);
        DefaultIfEmptyStage::new(Arc::new(empty()) as Arc<dyn Stage<i64>>, 99)
            .subscribe(ts.downstream());

        ts.assert_no_values().assert_not_complete();
        ts.request(1);
        ts.assert_values(&[99]).assert_complete();
    }
}
