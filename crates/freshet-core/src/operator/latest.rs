//! Latest-only backpressure: keep the newest element while the downstream
//! is not ready.
//!
//! The source runs in unbounded mode; downstream demand is the only
//! backpressure. Each arriving element overwrites the value slot; the
//! serialized drain loop emits the slot's content against outstanding
//! demand, so a slow consumer observes only the most recent value.

use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, OnceLock, Weak};

use crate::demand::{self, Demand, UNBOUNDED};
use crate::error::StreamError;
use crate::slot::Slot;
use crate::stream::{Downstream, Stage, Subscriber, Subscription, SubscriptionHandle};
use crate::upstream::UpstreamCell;

/// Emits only the latest source element the downstream could not keep up
/// with.
pub struct LatestStage<T> {
    source: Arc<dyn Stage<T>>,
}

impl<T: Send + 'static> LatestStage<T> {
    /// Wraps `source`.
    #[must_use]
    pub fn new(source: Arc<dyn Stage<T>>) -> Self {
        Self { source }
    }
}

impl<T: Send + 'static> Stage<T> for LatestStage<T> {
    fn subscribe(&self, downstream: Downstream<T>) {
        let subscription = Arc::new_cyclic(|self_ref| LatestSubscription {
            self_ref: self_ref.clone(),
            downstream,
            demand: Demand::new(),
            wip: AtomicUsize::new(0),
            value: Slot::new(),
            error: OnceLock::new(),
            done: AtomicBool::new(false),
            cancelled: AtomicBool::new(false),
            upstream: UpstreamCell::new(),
        });
        self.source.subscribe(Downstream::Plain(subscription));
    }
}

struct LatestSubscription<T> {
    self_ref: Weak<Self>,
    downstream: Downstream<T>,
    demand: Demand,
    wip: AtomicUsize,
    value: Slot<T>,
    error: OnceLock<StreamError>,
    done: AtomicBool,
    cancelled: AtomicBool,
    upstream: UpstreamCell<T>,
}

impl<T: Send + 'static> LatestSubscription<T> {
    fn drain(&self) {
        if self.wip.fetch_add(1, Ordering::AcqRel) != 0 {
            return;
        }

        let mut missed = 1;
        loop {
            if self.check_terminated(self.done.load(Ordering::Acquire), self.value.is_empty()) {
                return;
            }

            let requested = self.demand.get();
            let mut emitted: u64 = 0;
            while emitted != requested {
                let done = self.done.load(Ordering::Acquire);
                let value = self.value.take();
                let empty = value.is_none();

                if self.check_terminated(done, empty) {
                    return;
                }
                let Some(value) = value else {
                    break;
                };

                self.downstream.on_next(value);
                emitted += 1;
            }
            if emitted != 0 && requested != UNBOUNDED {
                self.demand.produced(emitted);
            }

            if self.check_terminated(self.done.load(Ordering::Acquire), self.value.is_empty()) {
                return;
            }

            let previous = self.wip.fetch_sub(missed, Ordering::AcqRel);
            missed = previous - missed;
            if missed == 0 {
                return;
            }
        }
    }

    fn check_terminated(&self, done: bool, empty: bool) -> bool {
        if self.cancelled.load(Ordering::Acquire) {
            self.value.clear();
            return true;
        }

        if done {
            if let Some(error) = self.error.get() {
                self.value.clear();
                self.downstream.on_error(error.clone());
                return true;
            }
            if empty {
                self.downstream.on_complete();
                return true;
            }
        }

        false
    }

    fn terminate_with(&self, error: StreamError) {
        let _ = self.error.set(error);
        self.done.store(true, Ordering::Release);
        self.drain();
    }
}

impl<T: Send + 'static> Subscriber<T> for LatestSubscription<T> {
    fn on_subscribe(&self, upstream: SubscriptionHandle<T>) {
        if !self.upstream.set_once(upstream) {
            return;
        }
        let Some(this) = self.self_ref.upgrade() else {
            return;
        };
        self.downstream.on_subscribe(SubscriptionHandle::Plain(this));
        self.upstream.request(UNBOUNDED);
    }

    fn on_next(&self, value: T) {
        // Overwriting an un-drained element is this operator's contract,
        // not a dropped signal.
        self.value.publish(value);
        self.drain();
    }

    fn on_error(&self, error: StreamError) {
        self.terminate_with(error);
    }

    fn on_complete(&self) {
        self.done.store(true, Ordering::Release);
        self.drain();
    }
}

impl<T: Send + 'static> Subscription for LatestSubscription<T> {
    fn request(&self, n: u64) {
        if let Err(error) = demand::validate(n) {
            self.upstream.terminate();
            self.terminate_with(error);
            return;
        }
        self.demand.add(n);
        self.drain();
    }

    fn cancel(&self) {
        if self.cancelled.swap(true, Ordering::AcqRel) {
            return;
        }
        self.upstream.terminate();
        if self.wip.fetch_add(1, Ordering::AcqRel) == 0 {
            self.value.clear();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::operator::range::range;
    use crate::processor::DirectProcessor;
    use crate::testing::TestSubscriber;

    #[test]
    fn test_unbounded_passes_everything() {
        let ts = TestSubscriber::new();
        LatestStage::new(Arc::new(range(1, 10))).subscribe(ts.downstream());

        ts.assert_values(&[1, 2, 3, 4, 5, 6, 7, 8, 9, 10])
            .assert_complete()
            .assert_no_error();
    }

    #[test]
    fn test_backpressured_keeps_latest() {
        let processor = DirectProcessor::<i32>::new();
        let ts = TestSubscriber::with_request(0);
        LatestStage::new(Arc::clone(&processor) as Arc<dyn Stage<i32>>)
            .subscribe(ts.downstream());

        processor.on_next(1);
        processor.on_next(2);
        ts.assert_no_values();

        ts.request(1);
        ts.assert_values(&[2]).assert_not_complete();

        processor.on_next(3);
        processor.on_next(4);
        ts.request(2);
        ts.assert_values(&[2, 4]).assert_not_complete();

        processor.on_next(5);
        processor.on_complete();
        ts.assert_values(&[2, 4, 5]).assert_complete().assert_no_error();
    }

    #[test]
    fn test_error_takes_precedence() {
        let processor = DirectProcessor::<i32>::new();
        let ts = TestSubscriber::with_request(0);
        LatestStage::new(Arc::clone(&processor) as Arc<dyn Stage<i32>>)
            .subscribe(ts.downstream());

        processor.on_next(1);
        processor.on_error(StreamError::callback("forced failure"));

        ts.assert_no_values()
            .assert_not_complete()
            .assert_error(&StreamError::callback("forced failure"));
    }

    #[test]
    fn test_cancel_clears_pending_value() {
        let processor = DirectProcessor::<i32>::new();
        let ts = TestSubscriber::with_request(0);
        LatestStage::new(Arc::clone(&processor) as Arc<dyn Stage<i32>>)
            .subscribe(ts.downstream());

        processor.on_next(1);
        ts.cancel();
        ts.request(1);

        ts.assert_no_values().assert_not_complete().assert_no_error();
    }
}
