//! Shared-slice source.
//!
//! Emits the contents of an `Arc<[T]>`. Same two-path shape as the range
//! source: fast path under unbounded demand, produced-subtract slow path
//! otherwise, and the queue interface in Sync mode.

use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;

use crate::demand::{self, Demand, UNBOUNDED};
use crate::error::StreamError;
use crate::hooks;
use crate::stream::{
    Downstream, FusedSubscription, FusionMode, Stage, Subscriber, Subscription,
    SubscriptionHandle,
};

use super::scalar::EmptySubscription;

/// Emits every element of a shared slice, in order.
#[derive(Debug, Clone)]
pub struct SliceStage<T> {
    items: Arc<[T]>,
}

impl<T: Clone + Send + Sync + 'static> SliceStage<T> {
    /// Wraps `items`; the storage is shared across subscriptions.
    pub fn new(items: impl Into<Arc<[T]>>) -> Self {
        Self {
            items: items.into(),
        }
    }
}

impl<T: Clone + Send + Sync + 'static> Stage<T> for SliceStage<T> {
    fn subscribe(&self, downstream: Downstream<T>) {
        if self.items.is_empty() {
            EmptySubscription::complete(&downstream);
            return;
        }
        let subscriber = match downstream {
            Downstream::Plain(ref s) => Arc::clone(s),
            // The slice source has no native conditional path; a
            // conditional downstream is served through its plain surface.
            Downstream::Conditional(ref s) => Arc::clone(s) as Arc<dyn Subscriber<T>>,
        };
        let subscription = Arc::new(SliceSubscription {
            downstream: subscriber,
            items: Arc::clone(&self.items),
            index: AtomicUsize::new(0),
            cancelled: AtomicBool::new(false),
            demand: Demand::new(),
        });
        downstream.on_subscribe(SubscriptionHandle::Fused(subscription));
    }
}

/// Creates a slice source; see [`SliceStage::new`].
pub fn from_slice<T: Clone + Send + Sync + 'static>(items: impl Into<Arc<[T]>>) -> SliceStage<T> {
    SliceStage::new(items)
}

struct SliceSubscription<T> {
    downstream: Arc<dyn Subscriber<T>>,
    items: Arc<[T]>,
    index: AtomicUsize,
    cancelled: AtomicBool,
    demand: Demand,
}

impl<T: Clone + Send + Sync + 'static> SliceSubscription<T> {
    fn is_cancelled(&self) -> bool {
        self.cancelled.load(Ordering::Acquire)
    }

    fn fast_path(&self) {
        let len = self.items.len();
        let mut i = self.index.load(Ordering::Relaxed);
        while i != len {
            if self.is_cancelled() {
                return;
            }
            self.downstream.on_next(self.items[i].clone());
            i += 1;
        }
        self.index.store(len, Ordering::Relaxed);
        if !self.is_cancelled() {
            self.downstream.on_complete();
            self.cancelled.store(true, Ordering::Release);
        }
    }

    fn slow_path(&self, mut n: u64) {
        let len = self.items.len();
        let mut produced: u64 = 0;
        let mut i = self.index.load(Ordering::Relaxed);

        loop {
            if self.is_cancelled() {
                return;
            }

            while produced != n && i != len {
                self.downstream.on_next(self.items[i].clone());
                if self.is_cancelled() {
                    return;
                }
                produced += 1;
                i += 1;
            }

            if self.is_cancelled() {
                return;
            }

            if i == len {
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

impl<T: Clone + Send + Sync + 'static> Subscription for SliceSubscription<T> {
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

impl<T: Clone + Send + Sync + 'static> FusedSubscription<T> for SliceSubscription<T> {
    fn request_fusion(&self, requested: FusionMode) -> FusionMode {
        if requested.contains(FusionMode::SYNC) {
            FusionMode::SYNC
        } else {
            FusionMode::NONE
        }
    }

    fn poll(&self) -> Result<Option<T>, StreamError> {
        let i = self.index.load(Ordering::Relaxed);
        if i == self.items.len() {
            return Ok(None);
        }
        self.index.store(i + 1, Ordering::Relaxed);
        Ok(Some(self.items[i].clone()))
    }

    fn is_empty(&self) -> bool {
        self.index.load(Ordering::Relaxed) == self.items.len()
    }

    fn len(&self) -> usize {
        self.items.len() - self.index.load(Ordering::Relaxed)
    }

    fn clear(&self) {
        self.index.store(self.items.len(), Ordering::Relaxed);
    }
}
