//! Direct (non-queued) processor: a hub that is both a stage and a
//! subscriber.
//!
//! Elements pushed into the processor are broadcast to the subscribers
//! attached at that moment; there is no replay, so a late subscriber
//! observes only future values. Each subscriber carries its own demand:
//! an element arriving for a subscriber without demand errors that
//! subscriber, not the hub.
//!
//! The subscriber registry is a cold-path `RwLock` around attach/detach;
//! the emission path touches only per-subscriber atomics.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, OnceLock};

use parking_lot::RwLock;

use crate::demand::{self, Demand};
use crate::error::StreamError;
use crate::hooks;
use crate::operator::scalar::EmptySubscription;
use crate::stream::{Downstream, Stage, Subscriber, Subscription, SubscriptionHandle};
use crate::upstream::UpstreamCell;

/// A multicast hub without buffering.
pub struct DirectProcessor<T> {
    subscribers: RwLock<Vec<Arc<DirectInner<T>>>>,
    terminated: AtomicBool,
    error: OnceLock<StreamError>,
    upstream: UpstreamCell<T>,
}

impl<T: Clone + Send + 'static> DirectProcessor<T> {
    /// Creates an empty hub.
    #[must_use]
    pub fn new() -> Arc<Self> {
        Arc::new(Self {
            subscribers: RwLock::new(Vec::new()),
            terminated: AtomicBool::new(false),
            error: OnceLock::new(),
            upstream: UpstreamCell::new(),
        })
    }

    /// Returns the number of attached, still-active subscribers.
    #[must_use]
    pub fn subscriber_count(&self) -> usize {
        self.subscribers
            .read()
            .iter()
            .filter(|inner| !inner.cancelled.load(Ordering::Acquire))
            .count()
    }

    /// Returns `true` once a terminal signal was taken.
    #[must_use]
    pub fn is_terminated(&self) -> bool {
        self.terminated.load(Ordering::Acquire)
    }

    fn snapshot(&self) -> Vec<Arc<DirectInner<T>>> {
        let mut subscribers = self.subscribers.write();
        subscribers.retain(|inner| !inner.cancelled.load(Ordering::Acquire));
        subscribers.clone()
    }

    fn drain_subscribers(&self) -> Vec<Arc<DirectInner<T>>> {
        std::mem::take(&mut *self.subscribers.write())
    }
}

impl<T: Clone + Send + 'static> Stage<T> for DirectProcessor<T> {
    fn subscribe(&self, downstream: Downstream<T>) {
        if self.is_terminated() {
            match self.error.get() {
                Some(error) => EmptySubscription::error(&downstream, error.clone()),
                None => EmptySubscription::complete(&downstream),
            }
            return;
        }

        let inner = Arc::new(DirectInner {
            downstream: downstream.clone(),
            demand: Demand::new(),
            cancelled: AtomicBool::new(false),
        });
        downstream.on_subscribe(SubscriptionHandle::Plain(Arc::clone(&inner) as _));

        self.subscribers.write().push(Arc::clone(&inner));

        // Terminal may have raced the attach; make sure the newcomer does
        // not dangle without its terminal signal.
        if self.is_terminated() && !inner.cancelled.swap(true, Ordering::AcqRel) {
            match self.error.get() {
                Some(error) => inner.downstream.on_error(error.clone()),
                None => inner.downstream.on_complete(),
            }
        }
    }
}

impl<T: Clone + Send + 'static> Subscriber<T> for DirectProcessor<T> {
    fn on_subscribe(&self, upstream: SubscriptionHandle<T>) {
        if self.upstream.set_once(upstream) {
            self.upstream.request(demand::UNBOUNDED);
        }
    }

    fn on_next(&self, value: T) {
        if self.is_terminated() {
            hooks::on_value_dropped(value);
            return;
        }

        for inner in self.snapshot() {
            inner.emit(value.clone());
        }
    }

    fn on_error(&self, error: StreamError) {
        if self.terminated.swap(true, Ordering::AcqRel) {
            hooks::on_error_dropped(&error);
            return;
        }
        let _ = self.error.set(error.clone());
        self.upstream.terminate();
        for inner in self.drain_subscribers() {
            if !inner.cancelled.swap(true, Ordering::AcqRel) {
                inner.downstream.on_error(error.clone());
            }
        }
    }

    fn on_complete(&self) {
        if self.terminated.swap(true, Ordering::AcqRel) {
            return;
        }
        self.upstream.terminate();
        for inner in self.drain_subscribers() {
            if !inner.cancelled.swap(true, Ordering::AcqRel) {
                inner.downstream.on_complete();
            }
        }
    }
}

struct DirectInner<T> {
    downstream: Downstream<T>,
    demand: Demand,
    cancelled: AtomicBool,
}

impl<T: Send + 'static> DirectInner<T> {
    fn emit(&self, value: T) {
        if self.cancelled.load(Ordering::Acquire) {
            return;
        }
        if self.demand.get() == 0 {
            self.fail(StreamError::MissingDemand);
            return;
        }
        self.downstream.on_next(value);
        self.demand.produced(1);
    }

    fn fail(&self, error: StreamError) {
        if !self.cancelled.swap(true, Ordering::AcqRel) {
            self.downstream.on_error(error);
        }
    }
}

impl<T: Send + 'static> Subscription for DirectInner<T> {
    fn request(&self, n: u64) {
        match demand::validate(n) {
            Ok(()) => {
                self.demand.add(n);
            }
            Err(error) => self.fail(error),
        }
    }

    fn cancel(&self) {
        self.cancelled.store(true, Ordering::Release);
    }
}
