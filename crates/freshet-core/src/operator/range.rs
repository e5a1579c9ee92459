//! Integer range source.
//!
//! A pure synchronous source with two push paths: a fast path when demand
//! is unbounded (emit everything, then complete) and a slow path that
//! emits against finite demand and subtracts what it produced before
//! re-checking for concurrently added requests. The subscription also
//! implements the queue interface natively in Sync mode.

use std::sync::atomic::{AtomicBool, AtomicI64, Ordering};
use std::sync::Arc;

use crate::demand::{self, Demand, UNBOUNDED};
use crate::error::StreamError;
use crate::hooks;
use crate::stream::{
    ConditionalSubscriber, Downstream, FusedSubscription, FusionMode, Stage, Subscriber,
    Subscription, SubscriptionHandle,
};

use super::scalar::{EmptySubscription, ScalarSubscription};

/// Emits the consecutive integers `start .. start + count`.
#[derive(Debug, Clone, Copy)]
pub struct RangeStage {
    start: i64,
    end: i64,
}

impl RangeStage {
    /// Creates a range source.
    ///
    /// # Panics
    ///
    /// Panics when `start + count` is not representable as `i64`.
    #[must_use]
    pub fn new(start: i64, count: u64) -> Self {
        let end = i64::try_from(count)
            .ok()
            .and_then(|count| start.checked_add(count));
        let Some(end) = end else {
            panic!("start + count must stay within i64 range");
        };
        Self { start, end }
    }
}

impl Stage<i64> for RangeStage {
    fn subscribe(&self, downstream: Downstream<i64>) {
        if self.start == self.end {
            EmptySubscription::complete(&downstream);
            return;
        }
        if self.start + 1 == self.end {
            let scalar = Arc::new(ScalarSubscription::new(downstream.clone(), self.start));
            downstream.on_subscribe(SubscriptionHandle::Fused(scalar));
            return;
        }

        let end = self.end;
        match downstream {
            Downstream::Plain(subscriber) => {
                let subscription =
                    Arc::new(RangeSubscription::new(subscriber, self.start, end));
                subscription
                    .downstream
                    .on_subscribe(SubscriptionHandle::Fused(subscription.clone()));
            }
            Downstream::Conditional(subscriber) => {
                let subscription =
                    Arc::new(RangeSubscriptionConditional::new(subscriber, self.start, end));
                subscription
                    .downstream
                    .on_subscribe(SubscriptionHandle::Fused(subscription.clone()));
            }
        }
    }
}

/// Creates a range source; see [`RangeStage::new`].
#[must_use]
pub fn range(start: i64, count: u64) -> RangeStage {
    RangeStage::new(start, count)
}

struct RangeSubscription {
    downstream: Arc<dyn Subscriber<i64>>,
    end: i64,
    index: AtomicI64,
    cancelled: AtomicBool,
    demand: Demand,
}

impl RangeSubscription {
    fn new(downstream: Arc<dyn Subscriber<i64>>, start: i64, end: i64) -> Self {
        Self {
            downstream,
            end,
            index: AtomicI64::new(start),
            cancelled: AtomicBool::new(false),
            demand: Demand::new(),
        }
    }

    fn is_cancelled(&self) -> bool {
        self.cancelled.load(Ordering::Acquire)
    }

    fn fast_path(&self) {
        let end = self.end;
        let mut i = self.index.load(Ordering::Relaxed);
        while i != end {
            if self.is_cancelled() {
                return;
            }
            self.downstream.on_next(i);
            i += 1;
        }
        self.index.store(end, Ordering::Relaxed);
        if !self.is_cancelled() {
            self.downstream.on_complete();
            self.cancelled.store(true, Ordering::Release);
        }
    }

    fn slow_path(&self, mut n: u64) {
        let end = self.end;
        let mut produced: u64 = 0;
        let mut i = self.index.load(Ordering::Relaxed);

        loop {
            if self.is_cancelled() {
                return;
            }

            while produced != n && i != end {
                self.downstream.on_next(i);
                if self.is_cancelled() {
                    return;
                }
                produced += 1;
                i += 1;
            }

            if self.is_cancelled() {
                return;
            }

            if i == end {
                self.downstream.on_complete();
                self.cancelled.store(true, Ordering::Release);
                return;
            }

            n = self.demand.get();
            if n == produced {
                self.index.store(i, Ordering::Relaxed);
                n = self.demand.produced(produced);
                if n == 0 {
                    return;
                }
                produced = 0;
            }
        }
    }
}

impl Subscription for RangeSubscription {
    fn request(&self, n: u64) {
        if let Err(error) = demand::validate(n) {
            if self.cancelled.swap(true, Ordering::AcqRel) {
                hooks::on_error_dropped(&error);
            } else {
                self.downstream.on_error(error);
            }
            return;
        }
        if self.demand.add(n) == 0 {
            if n == UNBOUNDED {
                self.fast_path();
            } else {
                self.slow_path(n);
            }
        }
    }

    fn cancel(&self) {
        self.cancelled.store(true, Ordering::Release);
    }
}

impl FusedSubscription<i64> for RangeSubscription {
    fn request_fusion(&self, requested: FusionMode) -> FusionMode {
        if requested.contains(FusionMode::SYNC) {
            FusionMode::SYNC
        } else {
            FusionMode::NONE
        }
    }

    fn poll(&self) -> Result<Option<i64>, StreamError> {
        let i = self.index.load(Ordering::Relaxed);
        if i == self.end {
            return Ok(None);
        }
        self.index.store(i + 1, Ordering::Relaxed);
        Ok(Some(i))
    }

    fn is_empty(&self) -> bool {
        self.index.load(Ordering::Relaxed) == self.end
    }

    fn len(&self) -> usize {
        usize::try_from(self.end - self.index.load(Ordering::Relaxed)).unwrap_or(0)
    }

    fn clear(&self) {
        self.index.store(self.end, Ordering::Relaxed);
    }
}

/// Slow/fast paths against a conditional downstream: only accepted
/// elements count against demand.
struct RangeSubscriptionConditional {
    downstream: Arc<dyn ConditionalSubscriber<i64>>,
    end: i64,
    index: AtomicI64,
    cancelled: AtomicBool,
    demand: Demand,
}

impl RangeSubscriptionConditional {
    fn new(downstream: Arc<dyn ConditionalSubscriber<i64>>, start: i64, end: i64) -> Self {
        Self {
            downstream,
            end,
            index: AtomicI64::new(start),
            cancelled: AtomicBool::new(false),
            demand: Demand::new(),
        }
    }

    fn is_cancelled(&self) -> bool {
        self.cancelled.load(Ordering::Acquire)
    }

    fn fast_path(&self) {
        let end = self.end;
        let mut i = self.index.load(Ordering::Relaxed);
        while i != end {
            if self.is_cancelled() {
                return;
            }
            self.downstream.try_on_next(i);
            i += 1;
        }
        self.index.store(end, Ordering::Relaxed);
        if !self.is_cancelled() {
            self.downstream.on_complete();
            self.cancelled.store(true, Ordering::Release);
        }
    }

    fn slow_path(&self, mut n: u64) {
        let end = self.end;
        let mut produced: u64 = 0;
        let mut i = self.index.load(Ordering::Relaxed);

        loop {
            if self.is_cancelled() {
                return;
            }

            while produced != n && i != end {
                let accepted = self.downstream.try_on_next(i);
                if self.is_cancelled() {
                    return;
                }
                if accepted {
                    produced += 1;
                }
                i += 1;
            }

            if self.is_cancelled() {
                return;
            }

            if i == end {
                self.downstream.on_complete();
                self.cancelled.store(true, Ordering::Release);
                return;
            }

            n = self.demand.get();
            if n == produced {
                self.index.store(i, Ordering::Relaxed);
                n = self.demand.produced(produced);
                if n == 0 {
                    return;
                }
                produced = 0;
            }
        }
    }
}

impl Subscription for RangeSubscriptionConditional {
    fn request(&self, n: u64) {
        if let Err(error) = demand::validate(n) {
            if self.cancelled.swap(true, Ordering::AcqRel) {
                hooks::on_error_dropped(&error);
            } else {
                self.downstream.on_error(error);
            }
            return;
        }
        if self.demand.add(n) == 0 {
            if n == UNBOUNDED {
                self.fast_path();
            } else {
                self.slow_path(n);
            }
        }
    }

    fn cancel(&self) {
        self.cancelled.store(true, Ordering::Release);
    }
}

impl FusedSubscription<i64> for RangeSubscriptionConditional {
    fn request_fusion(&self, requested: FusionMode) -> FusionMode {
        if requested.contains(FusionMode::SYNC) {
            FusionMode::SYNC
        } else {
            FusionMode::NONE
        }
    }

    fn poll(&self) -> Result<Option<i64>, StreamError> {
        let i = self.index.load(Ordering::Relaxed);
        if i == self.end {
            return Ok(None);
        }
        self.index.store(i + 1, Ordering::Relaxed);
        Ok(Some(i))
    }

    fn is_empty(&self) -> bool {
        self.index.load(Ordering::Relaxed) == self.end
    }

    fn len(&self) -> usize {
        usize::try_from(self.end - self.index.load(Ordering::Relaxed)).unwrap_or(0)
    }

    fn clear(&self) {
        self.index.store(self.end, Ordering::Relaxed);
    }
}
