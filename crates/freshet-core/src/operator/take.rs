//! Takes only the first N elements of the source.

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Weak};

use crate::demand::{self, UNBOUNDED};
use crate::error::StreamError;
use crate::hooks;
use crate::stream::{Downstream, Stage, Subscriber, Subscription, SubscriptionHandle};
use crate::upstream::UpstreamCell;

/// Relays the first `n` elements, then cancels the source and completes.
pub struct TakeStage<T> {
    source: Arc<dyn Stage<T>>,
    n: u64,
}

impl<T: Send + 'static> TakeStage<T> {
    /// Wraps `source`, limiting it to `n` elements.
    #[must_use]
    pub fn new(source: Arc<dyn Stage<T>>, n: u64) -> Self {
        Self { source, n }
    }
}

impl<T: Send + 'static> Stage<T> for TakeStage<T> {
    fn subscribe(&self, downstream: Downstream<T>) {
        let subscription = Arc::new_cyclic(|self_ref| TakeSubscription {
            self_ref: self_ref.clone(),
            downstream,
            limit: self.n,
            remaining: AtomicU64::new(self.n),
            done: AtomicBool::new(false),
            first_request: AtomicBool::new(false),
            upstream: UpstreamCell::new(),
        });
        self.source.subscribe(Downstream::Plain(subscription));
    }
}

struct TakeSubscription<T> {
    self_ref: Weak<Self>,
    downstream: Downstream<T>,
    limit: u64,
    /// Mutated only from the serialized upstream signal path.
    remaining: AtomicU64,
    done: AtomicBool,
    /// Single-shot gate deciding the first request forwarding.
    first_request: AtomicBool,
    upstream: UpstreamCell<T>,
}

impl<T: Send + 'static> Subscriber<T> for TakeSubscription<T> {
    fn on_subscribe(&self, upstream: SubscriptionHandle<T>) {
        if !self.upstream.set_once(upstream) {
            return;
        }
        let Some(this) = self.self_ref.upgrade() else {
            return;
        };

        if self.limit == 0 {
            // The source must never get to emit; tear it down before the
            // downstream has a chance to request anything.
            self.done.store(true, Ordering::Release);
            self.upstream.terminate();
            self.downstream.on_subscribe(SubscriptionHandle::Plain(this));
            self.downstream.on_complete();
            return;
        }

        self.downstream.on_subscribe(SubscriptionHandle::Plain(this));
    }

    fn on_next(&self, value: T) {
        if self.done.load(Ordering::Acquire) {
            hooks::on_value_dropped(value);
            return;
        }

        let remaining = self.remaining.load(Ordering::Relaxed);
        if remaining == 0 {
            self.on_complete();
            return;
        }
        self.remaining.store(remaining - 1, Ordering::Relaxed);
        let stop = remaining == 1;

        self.downstream.on_next(value);

        if stop {
            self.upstream.terminate();
            self.on_complete();
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

impl<T: Send + 'static> Subscription for TakeSubscription<T> {
    fn request(&self, n: u64) {
        if let Err(error) = demand::validate(n) {
            self.upstream.terminate();
            self.on_error(error);
            return;
        }

        if self.first_request.swap(true, Ordering::AcqRel) {
            self.upstream.request(n);
        } else if n >= self.limit {
            // The whole take fits in this request; run the source
            // unbounded and let the element counter stop it.
            self.upstream.request(UNBOUNDED);
        } else {
            self.upstream.request(n);
        }
    }

    fn cancel(&self) {
        self.upstream.terminate();
    }
}
