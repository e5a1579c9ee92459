//! Predicate filtering, the conditional-subscriber exemplar.
//!
//! The node presents the conditional surface upstream: a rejected element
//! returns `false` from `try_on_next` so conditionally-aware sources do
//! not count it against demand. On the plain push path a rejection
//! requests one replacement element instead, keeping downstream demand
//! accounting exact.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Weak};

use crate::error::StreamError;
use crate::hooks;
use crate::stream::{
    ConditionalSubscriber, Downstream, Stage, Subscriber, Subscription, SubscriptionHandle,
};
use crate::upstream::UpstreamCell;

/// Fallible element predicate.
pub type Predicate<T> = Arc<dyn Fn(&T) -> Result<bool, StreamError> + Send + Sync>;

/// Relays only elements matching the predicate.
pub struct FilterStage<T> {
    source: Arc<dyn Stage<T>>,
    predicate: Predicate<T>,
}

impl<T: Send + 'static> FilterStage<T> {
    /// Wraps `source` with `predicate`.
    pub fn new(
        source: Arc<dyn Stage<T>>,
        predicate: impl Fn(&T) -> Result<bool, StreamError> + Send + Sync + 'static,
    ) -> Self {
        Self {
            source,
            predicate: Arc::new(predicate),
        }
    }
}

impl<T: Send + 'static> Stage<T> for FilterStage<T> {
    fn subscribe(&self, downstream: Downstream<T>) {
        let subscription = Arc::new_cyclic(|self_ref| FilterSubscription {
            self_ref: self_ref.clone(),
            downstream,
            predicate: Arc::clone(&self.predicate),
            done: AtomicBool::new(false),
            upstream: UpstreamCell::new(),
        });
        self.source.subscribe(Downstream::Conditional(subscription));
    }
}

struct FilterSubscription<T> {
    self_ref: Weak<Self>,
    downstream: Downstream<T>,
    predicate: Predicate<T>,
    done: AtomicBool,
    upstream: UpstreamCell<T>,
}

impl<T: Send + 'static> FilterSubscription<T> {
    fn fail(&self, error: StreamError) {
        self.upstream.terminate();
        self.on_error(error);
    }
}

impl<T: Send + 'static> Subscriber<T> for FilterSubscription<T> {
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
        if !self.try_on_next(value) {
            // A plain upstream already counted the element; replace it.
            self.upstream.request(1);
        }
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
        self.downstream.on_complete();
    }
}

impl<T: Send + 'static> ConditionalSubscriber<T> for FilterSubscription<T> {
    fn try_on_next(&self, value: T) -> bool {
        if self.done.load(Ordering::Acquire) {
            hooks::on_value_dropped(value);
            return true;
        }
        match (self.predicate)(&value) {
            Ok(true) => self.downstream.try_on_next(value),
            Ok(false) => false,
            Err(error) => {
                self.fail(error);
                true
            }
        }
    }
}

impl<T: Send + 'static> Subscription for FilterSubscription<T> {
    fn request(&self, n: u64) {
        self.upstream.request(n);
    }

    fn cancel(&self) {
        self.upstream.terminate();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::operator::range::range;
    use crate::testing::TestSubscriber;

    #[test]
    fn test_filters_values() {
        let ts = TestSubscriber::new();
        FilterStage::new(Arc::new(range(1, 10)), |v| Ok(v % 2 == 0))
            .subscribe(ts.downstream());

        ts.assert_values(&[2, 4, 6, 8, 10]).assert_complete();
    }

    #[test]
    fn test_exact_demand_against_conditional_source() {
        // The range source counts only accepted elements, so a demand of
        // three yields exactly the first three matches.
        let ts = TestSubscriber::with_request(3);
        FilterStage::new(Arc::new(range(1, 100)), |v| Ok(v % 7 == 0))
            .subscribe(ts.downstream());

        ts.assert_values(&[7, 14, 21]).assert_not_complete();
    }

    #[test]
    fn test_predicate_failure() {
        let ts = TestSubscriber::new();
        FilterStage::new(Arc::new(range(1, 10)), |v| {
            if *v > 2 {
                Err(StreamError::callback("predicate failed"))
            } else {
                Ok(true)
            }
        })
        .subscribe(ts.downstream());

        ts.assert_values(&[1, 2])
            .assert_error(&StreamError::callback("predicate failed"));
    }

    #[test]
    fn test_stacked_filters() {
        let ts = TestSubscriber::new();
        let evens = Arc::new(FilterStage::new(Arc::new(range(1, 30)), |v| Ok(v % 2 == 0)));
        FilterStage::new(evens, |v| Ok(v % 3 == 0)).subscribe(ts.downstream());

        ts.assert_values(&[6, 12, 18, 24, 30]).assert_complete();
    }
}
