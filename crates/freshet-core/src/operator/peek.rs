//! Lifecycle tap: observe every signal of a sequence without altering it.
//!
//! All callbacks are optional and fallible. A failure from a non-terminal
//! callback cancels the upstream and surfaces as `on_error`. A failure
//! from the after-terminate callback happens after the downstream already
//! received its single terminal, so it is re-reported to the error
//! callback with the prior terminal attached as a suppressed cause and
//! then routed to the unsignalled sink.
//!
//! When the upstream is fuseable the node proxies the queue interface:
//! the element callback fires from inside `poll`, and a Sync-mode
//! terminal poll fires the completion and after-terminate callbacks
//! exactly once. Sync fusion is denied when the requester sets the
//! thread-barrier bit, since these callbacks must not migrate to another
//! thread.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, OnceLock, Weak};

use crate::error::StreamError;
use crate::hooks;
use crate::stream::{
    ConditionalSubscriber, Downstream, FusedSubscription, FusionMode, Stage, Subscriber,
    Subscription, SubscriptionHandle,
};
use crate::upstream::UpstreamCell;

use super::scalar::EmptySubscription;

/// Fallible niladic callback.
pub type SignalHook = Arc<dyn Fn() -> Result<(), StreamError> + Send + Sync>;

/// Fallible per-element callback.
pub type ValueHook<T> = Arc<dyn Fn(&T) -> Result<(), StreamError> + Send + Sync>;

/// Fallible error-observing callback.
pub type ErrorHook = Arc<dyn Fn(&StreamError) -> Result<(), StreamError> + Send + Sync>;

/// Fallible request-observing callback.
pub type RequestHook = Arc<dyn Fn(u64) -> Result<(), StreamError> + Send + Sync>;

struct PeekHooks<T> {
    on_subscribe: Option<SignalHook>,
    on_next: Option<ValueHook<T>>,
    on_error: Option<ErrorHook>,
    on_complete: Option<SignalHook>,
    on_after_terminate: Option<SignalHook>,
    on_request: Option<RequestHook>,
    on_cancel: Option<SignalHook>,
}

impl<T> Default for PeekHooks<T> {
    fn default() -> Self {
        Self {
            on_subscribe: None,
            on_next: None,
            on_error: None,
            on_complete: None,
            on_after_terminate: None,
            on_request: None,
            on_cancel: None,
        }
    }
}

impl<T> Clone for PeekHooks<T> {
    fn clone(&self) -> Self {
        Self {
            on_subscribe: self.on_subscribe.clone(),
            on_next: self.on_next.clone(),
            on_error: self.on_error.clone(),
            on_complete: self.on_complete.clone(),
            on_after_terminate: self.on_after_terminate.clone(),
            on_request: self.on_request.clone(),
            on_cancel: self.on_cancel.clone(),
        }
    }
}

/// Pass-through stage invoking user callbacks on lifecycle events.
pub struct PeekStage<T> {
    source: Arc<dyn Stage<T>>,
    hooks: PeekHooks<T>,
}

impl<T: Send + 'static> PeekStage<T> {
    /// Wraps `source` with no callbacks installed.
    #[must_use]
    pub fn new(source: Arc<dyn Stage<T>>) -> Self {
        Self {
            source,
            hooks: PeekHooks::default(),
        }
    }

    /// Observes `on_subscribe`.
    #[must_use]
    pub fn on_subscribe(
        mut self,
        hook: impl Fn() -> Result<(), StreamError> + Send + Sync + 'static,
    ) -> Self {
        self.hooks.on_subscribe = Some(Arc::new(hook));
        self
    }

    /// Observes every element.
    #[must_use]
    pub fn on_next(
        mut self,
        hook: impl Fn(&T) -> Result<(), StreamError> + Send + Sync + 'static,
    ) -> Self {
        self.hooks.on_next = Some(Arc::new(hook));
        self
    }

    /// Observes the error terminal.
    #[must_use]
    pub fn on_error(
        mut self,
        hook: impl Fn(&StreamError) -> Result<(), StreamError> + Send + Sync + 'static,
    ) -> Self {
        self.hooks.on_error = Some(Arc::new(hook));
        self
    }

    /// Observes the completion terminal.
    #[must_use]
    pub fn on_complete(
        mut self,
        hook: impl Fn() -> Result<(), StreamError> + Send + Sync + 'static,
    ) -> Self {
        self.hooks.on_complete = Some(Arc::new(hook));
        self
    }

    /// Runs after either terminal has been delivered downstream.
    #[must_use]
    pub fn on_after_terminate(
        mut self,
        hook: impl Fn() -> Result<(), StreamError> + Send + Sync + 'static,
    ) -> Self {
        self.hooks.on_after_terminate = Some(Arc::new(hook));
        self
    }

    /// Observes demand requests.
    #[must_use]
    pub fn on_request(
        mut self,
        hook: impl Fn(u64) -> Result<(), StreamError> + Send + Sync + 'static,
    ) -> Self {
        self.hooks.on_request = Some(Arc::new(hook));
        self
    }

    /// Observes cancellation.
    #[must_use]
    pub fn on_cancel(
        mut self,
        hook: impl Fn() -> Result<(), StreamError> + Send + Sync + 'static,
    ) -> Self {
        self.hooks.on_cancel = Some(Arc::new(hook));
        self
    }
}

impl<T: Send + 'static> Stage<T> for PeekStage<T> {
    fn subscribe(&self, downstream: Downstream<T>) {
        let subscription = Arc::new_cyclic(|self_ref| PeekSubscription {
            self_ref: self_ref.clone(),
            downstream,
            hooks: self.hooks.clone(),
            upstream: UpstreamCell::new(),
            fused: OnceLock::new(),
            mode_sync: AtomicBool::new(false),
            done: AtomicBool::new(false),
            complete_hook_fired: AtomicBool::new(false),
            after_hook_fired: AtomicBool::new(false),
        });
        self.source.subscribe(Downstream::Conditional(subscription));
    }
}

struct PeekSubscription<T> {
    self_ref: Weak<Self>,
    downstream: Downstream<T>,
    hooks: PeekHooks<T>,
    upstream: UpstreamCell<T>,
    fused: OnceLock<Arc<dyn FusedSubscription<T>>>,
    mode_sync: AtomicBool,
    done: AtomicBool,
    complete_hook_fired: AtomicBool,
    after_hook_fired: AtomicBool,
}

impl<T: Send + 'static> PeekSubscription<T> {
    /// Delivers the error terminal, running the error callback first and
    /// the after-terminate callback after.
    fn deliver_error(&self, error: StreamError) {
        if self.done.swap(true, Ordering::AcqRel) {
            hooks::on_error_dropped(&error);
            return;
        }

        let mut delivered = error;
        if let Some(hook) = &self.hooks.on_error {
            if let Err(secondary) = hook(&delivered) {
                delivered = secondary.with_suppressed(delivered);
            }
        }

        self.downstream.on_error(delivered.clone());
        self.run_after_terminate(Some(&delivered));
    }

    fn fire_complete_hook(&self) -> Result<(), StreamError> {
        let Some(hook) = &self.hooks.on_complete else {
            return Ok(());
        };
        if self.complete_hook_fired.swap(true, Ordering::AcqRel) {
            return Ok(());
        }
        hook()
    }

    fn run_after_terminate(&self, prior: Option<&StreamError>) {
        let Some(hook) = &self.hooks.on_after_terminate else {
            return;
        };
        if self.after_hook_fired.swap(true, Ordering::AcqRel) {
            return;
        }
        if let Err(failure) = hook() {
            let combined = match prior {
                Some(prior) => failure.with_suppressed(prior.clone()),
                None => failure,
            };
            // The downstream already received its single terminal; the
            // late failure is re-reported to the error callback and then
            // has nowhere left to go.
            if let Some(error_hook) = &self.hooks.on_error {
                let _ = error_hook(&combined);
            }
            hooks::on_error_dropped(&combined);
        }
    }
}

impl<T: Send + 'static> Subscriber<T> for PeekSubscription<T> {
    fn on_subscribe(&self, upstream: SubscriptionHandle<T>) {
        if let Some(hook) = &self.hooks.on_subscribe {
            if let Err(error) = hook() {
                upstream.cancel();
                self.downstream
                    .on_subscribe(SubscriptionHandle::Plain(Arc::new(EmptySubscription)));
                self.deliver_error(error);
                return;
            }
        }

        let fused = upstream.fused().cloned();
        if !self.upstream.set_once(upstream) {
            return;
        }
        if let Some(fused) = fused {
            let _ = self.fused.set(fused);
        }

        let Some(this) = self.self_ref.upgrade() else {
            return;
        };
        if self.fused.get().is_some() {
            self.downstream.on_subscribe(SubscriptionHandle::Fused(this));
        } else {
            self.downstream.on_subscribe(SubscriptionHandle::Plain(this));
        }
    }

    fn on_next(&self, value: T) {
        if self.done.load(Ordering::Acquire) {
            hooks::on_value_dropped(value);
            return;
        }
        if let Some(hook) = &self.hooks.on_next {
            if let Err(error) = hook(&value) {
                self.cancel();
                self.deliver_error(error);
                return;
            }
        }
        self.downstream.on_next(value);
    }

    fn on_error(&self, error: StreamError) {
        self.deliver_error(error);
    }

    fn on_complete(&self) {
        if self.done.load(Ordering::Acquire) {
            return;
        }
        if let Err(error) = self.fire_complete_hook() {
            self.deliver_error(error);
            return;
        }
        if self.done.swap(true, Ordering::AcqRel) {
            return;
        }
        self.downstream.on_complete();
        self.run_after_terminate(None);
    }
}

impl<T: Send + 'static> ConditionalSubscriber<T> for PeekSubscription<T> {
    fn try_on_next(&self, value: T) -> bool {
        if self.done.load(Ordering::Acquire) {
            hooks::on_value_dropped(value);
            return true;
        }
        if let Some(hook) = &self.hooks.on_next {
            if let Err(error) = hook(&value) {
                self.cancel();
                self.deliver_error(error);
                // The element is accounted as produced even though the
                // callback rejected it; under-reporting here would make a
                // conditional source replenish into a dead subscription.
                return true;
            }
        }
        self.downstream.try_on_next(value)
    }
}

impl<T: Send + 'static> Subscription for PeekSubscription<T> {
    fn request(&self, n: u64) {
        if let Some(hook) = &self.hooks.on_request {
            if let Err(error) = hook(n) {
                self.cancel();
                self.deliver_error(error);
                return;
            }
        }
        self.upstream.request(n);
    }

    fn cancel(&self) {
        if let Some(hook) = &self.hooks.on_cancel {
            if let Err(error) = hook() {
                self.upstream.terminate();
                self.deliver_error(error);
                return;
            }
        }
        self.upstream.terminate();
    }
}

impl<T: Send + 'static> FusedSubscription<T> for PeekSubscription<T> {
    fn request_fusion(&self, requested: FusionMode) -> FusionMode {
        let Some(fused) = self.fused.get() else {
            return FusionMode::NONE;
        };

        // Callbacks run on the polling thread, so a barrier request rules
        // Sync out entirely.
        let effective = if requested.contains(FusionMode::THREAD_BARRIER) {
            requested.without(FusionMode::SYNC)
        } else {
            requested
        };
        if !effective.contains(FusionMode::SYNC) {
            return FusionMode::NONE;
        }

        let granted = fused.request_fusion(FusionMode::SYNC);
        if granted.contains(FusionMode::SYNC) {
            self.mode_sync.store(true, Ordering::Release);
            FusionMode::SYNC
        } else {
            FusionMode::NONE
        }
    }

    fn poll(&self) -> Result<Option<T>, StreamError> {
        let Some(fused) = self.fused.get() else {
            return Ok(None);
        };

        match fused.poll() {
            Ok(Some(value)) => {
                if let Some(hook) = &self.hooks.on_next {
                    if let Err(error) = hook(&value) {
                        self.cancel();
                        return Err(error);
                    }
                }
                Ok(Some(value))
            }
            Ok(None) => {
                if self.mode_sync.load(Ordering::Acquire) {
                    if let Err(error) = self.fire_complete_hook() {
                        if let Some(error_hook) = &self.hooks.on_error {
                            let _ = error_hook(&error);
                        }
                        hooks::on_error_dropped(&error);
                    }
                    self.run_after_terminate(None);
                }
                Ok(None)
            }
            Err(error) => Err(error),
        }
    }

    fn is_empty(&self) -> bool {
        self.fused.get().map_or(true, |fused| fused.is_empty())
    }

    fn len(&self) -> usize {
        self.fused.get().map_or(0, |fused| fused.len())
    }

    fn clear(&self) {
        if let Some(fused) = self.fused.get() {
            fused.clear();
        }
    }
}
