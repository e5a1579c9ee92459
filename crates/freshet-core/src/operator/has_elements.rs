//! Element-existence test: emits `true` on the first element (cancelling
//! the source) or `false` when the source completes empty.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Weak};

use crate::demand::{self, UNBOUNDED};
use crate::error::StreamError;
use crate::hooks;
use crate::stream::{Downstream, Stage, Subscriber, Subscription, SubscriptionHandle};
use crate::upstream::UpstreamCell;

use super::deferred::DeferredScalar;

/// Reduces a sequence to whether it contained any element.
pub struct HasElementsStage<T> {
    source: Arc<dyn Stage<T>>,
}

impl<T: Send + 'static> HasElementsStage<T> {
    /// Wraps `source`.
    #[must_use]
    pub fn new(source: Arc<dyn Stage<T>>) -> Self {
        Self { source }
    }
}

impl<T: Send + 'static> Stage<bool> for HasElementsStage<T> {
    fn subscribe(&self, downstream: Downstream<bool>) {
        let subscription = Arc::new_cyclic(|self_ref| HasElementsSubscription {
            self_ref: self_ref.clone(),
            deferred: DeferredScalar::new(downstream),
            done: AtomicBool::new(false),
            upstream: UpstreamCell::new(),
        });
        self.source.subscribe(Downstream::Plain(subscription));
    }
}

struct HasElementsSubscription<T> {
    self_ref: Weak<Self>,
    deferred: DeferredScalar<bool>,
    done: AtomicBool,
    upstream: UpstreamCell<T>,
}

impl<T: Send + 'static> Subscriber<T> for HasElementsSubscription<T> {
    fn on_subscribe(&self, upstream: SubscriptionHandle<T>) {
        if !self.upstream.set_once(upstream) {
            return;
        }
        let Some(this) = self.self_ref.upgrade() else {
            return;
        };
        self.deferred
            .deliver_on_subscribe(SubscriptionHandle::Plain(this));
        self.upstream.request(UNBOUNDED);
    }

    fn on_next(&self, value: T) {
        if self.done.swap(true, Ordering::AcqRel) {
            hooks::on_value_dropped(value);
            return;
        }
        self.upstream.terminate();
        self.deferred.complete_with(true);
    }

    fn on_error(&self, error: StreamError) {
        if self.done.swap(true, Ordering::AcqRel) {
            hooks::on_error_dropped(&error);
            return;
        }
        self.deferred.error(error);
    }

    fn on_complete(&self) {
        if self.done.swap(true, Ordering::AcqRel) {
            return;
        }
        self.deferred.complete_with(false);
    }
}

impl<T: Send + 'static> Subscription for HasElementsSubscription<T> {
    fn request(&self, n: u64) {
        match demand::validate(n) {
            Ok(()) => self.deferred.request(n),
            Err(error) => {
                self.upstream.terminate();
                if self.done.swap(true, Ordering::AcqRel) {
                    hooks::on_error_dropped(&error);
                } else {
                    self.deferred.error(error);
                }
            }
        }
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
    use crate::processor::DirectProcessor;
    use crate::testing::TestSubscriber;

    #[test]
    fn test_non_empty_source() {
        let processor = DirectProcessor::<i32>::new();
        let ts = TestSubscriber::new();
        HasElementsStage::new(Arc::clone(&processor) as Arc<dyn Stage<i32>>)
            .subscribe(ts.downstream());

        processor.on_next(1);

        ts.assert_values(&[true]).assert_complete();
        // The single answer is known; the source was cancelled.
        assert_eq!(processor.subscriber_count(), 0);
    }

    #[test]
    fn test_empty_source() {
        let ts = TestSubscriber::new();
        HasElementsStage::new(Arc::new(empty()) as Arc<dyn Stage<i32>>)
            .subscribe(ts.downstream());

        ts.assert_values(&[false]).assert_complete();
    }

    #[test]
    fn test_backpressured_answer() {
        let ts = TestSubscriber::with_request(0);
        HasElementsStage::new(Arc::new(range(1, 5)) as Arc<dyn Stage<i64>>)
            .subscribe(ts.downstream());

        ts.assert_no_values().assert_not_complete();
        ts.request(1);
        ts.assert_values(&[true]).assert_complete();
    }

    #[test]
    fn test_error_passthrough() {
        let processor = DirectProcessor::<i32>::new();
        let ts = TestSubscriber::new();
        HasElementsStage::new(Arc::clone(&processor) as Arc<dyn Stage<i32>>)
            .subscribe(ts.downstream());

        processor.on_error(StreamError::callback("boom"));

        ts.assert_no_values()
            .assert_error(&StreamError::callback("boom"));
    }
}
