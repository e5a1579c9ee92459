//! Drop-on-backpressure: discard elements the downstream has no demand
//! for, optionally observing each discard.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Weak};

use crate::demand::{self, Demand, UNBOUNDED};
use crate::error::StreamError;
use crate::hooks;
use crate::stream::{Downstream, Stage, Subscriber, Subscription, SubscriptionHandle};
use crate::upstream::UpstreamCell;

/// Callback observing each dropped element.
pub type OnDrop<T> = Arc<dyn Fn(&T) -> Result<(), StreamError> + Send + Sync>;

/// Runs the source unbounded and drops elements arriving without demand.
pub struct DropStage<T> {
    source: Arc<dyn Stage<T>>,
    on_drop: Option<OnDrop<T>>,
}

impl<T: Send + 'static> DropStage<T> {
    /// Wraps `source`, discarding silently.
    #[must_use]
    pub fn new(source: Arc<dyn Stage<T>>) -> Self {
        Self {
            source,
            on_drop: None,
        }
    }

    /// Wraps `source`, handing each discarded element to `on_drop`.
    ///
    /// A failing callback cancels the source and surfaces the failure as
    /// `on_error`.
    pub fn with_callback(
        source: Arc<dyn Stage<T>>,
        on_drop: impl Fn(&T) -> Result<(), StreamError> + Send + Sync + 'static,
    ) -> Self {
        Self {
            source,
            on_drop: Some(Arc::new(on_drop)),
        }
    }
}

impl<T: Send + 'static> Stage<T> for DropStage<T> {
    fn subscribe(&self, downstream: Downstream<T>) {
        let subscription = Arc::new_cyclic(|self_ref| DropSubscription {
            self_ref: self_ref.clone(),
            downstream,
            on_drop: self.on_drop.clone(),
            demand: Demand::new(),
            done: AtomicBool::new(false),
            upstream: UpstreamCell::new(),
        });
        self.source.subscribe(Downstream::Plain(subscription));
    }
}

struct DropSubscription<T> {
    self_ref: Weak<Self>,
    downstream: Downstream<T>,
    on_drop: Option<OnDrop<T>>,
    demand: Demand,
    done: AtomicBool,
    upstream: UpstreamCell<T>,
}

impl<T: Send + 'static> Subscriber<T> for DropSubscription<T> {
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
        if self.done.load(Ordering::Acquire) {
            if let Some(on_drop) = &self.on_drop {
                if on_drop(&value).is_err() {
                    hooks::on_value_dropped(value);
                }
            }
            return;
        }

        if self.demand.get() != 0 {
            self.downstream.on_next(value);
            self.demand.produced(1);
            return;
        }

        if let Some(on_drop) = &self.on_drop {
            if let Err(error) = on_drop(&value) {
                self.upstream.terminate();
                self.on_error(error);
            }
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

impl<T: Send + 'static> Subscription for DropSubscription<T> {
    fn request(&self, n: u64) {
        if let Err(error) = demand::validate(n) {
            self.upstream.terminate();
            self.on_error(error);
            return;
        }
        self.demand.add(n);
    }

    fn cancel(&self) {
        self.upstream.terminate();
    }
}
