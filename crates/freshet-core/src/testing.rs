//! Test support: a recording subscriber and sink-capture fixtures.
//!
//! [`TestSubscriber`] records every signal it receives and offers the
//! assertion helpers the operator tests are written against. It requests
//! its configured initial demand at `on_subscribe` and exposes the
//! captured handle so tests can issue further requests, cancel, or probe
//! the fused interface directly.

use std::any::Any;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use parking_lot::{Mutex, MutexGuard};

use crate::demand::UNBOUNDED;
use crate::error::StreamError;
use crate::hooks;
use crate::stream::{Downstream, Subscriber, SubscriptionHandle};

/// A subscriber that records everything for later assertion.
pub struct TestSubscriber<T> {
    initial_request: u64,
    values: Mutex<Vec<T>>,
    errors: Mutex<Vec<StreamError>>,
    completions: AtomicUsize,
    upstream: Mutex<Option<SubscriptionHandle<T>>>,
}

impl<T: Send + 'static> TestSubscriber<T> {
    /// Creates a subscriber that requests unbounded demand on subscribe.
    #[must_use]
    pub fn new() -> Arc<Self> {
        Self::with_request(UNBOUNDED)
    }

    /// Creates a subscriber with a fixed initial request; `0` means the
    /// test drives demand manually.
    #[must_use]
    pub fn with_request(initial_request: u64) -> Arc<Self> {
        Arc::new(Self {
            initial_request,
            values: Mutex::new(Vec::new()),
            errors: Mutex::new(Vec::new()),
            completions: AtomicUsize::new(0),
            upstream: Mutex::new(None),
        })
    }

    /// Wraps this subscriber as a plain downstream handle.
    #[must_use]
    pub fn downstream(self: &Arc<Self>) -> Downstream<T> {
        Downstream::Plain(Arc::clone(self) as Arc<dyn Subscriber<T>>)
    }

    /// Requests `n` more elements through the captured handle.
    ///
    /// # Panics
    ///
    /// Panics when no `on_subscribe` was received yet.
    pub fn request(&self, n: u64) {
        // The guard is released before requesting: emission is synchronous
        // and may re-enter this subscriber.
        let handle = self.upstream.lock().clone();
        handle.expect("request before on_subscribe").request(n);
    }

    /// Cancels through the captured handle.
    pub fn cancel(&self) {
        let handle = self.upstream.lock().clone();
        if let Some(handle) = handle {
            handle.cancel();
        }
    }

    /// Returns a clone of the captured upstream handle.
    #[must_use]
    pub fn handle(&self) -> Option<SubscriptionHandle<T>> {
        self.upstream.lock().clone()
    }

    /// Returns the number of values received so far.
    #[must_use]
    pub fn value_count(&self) -> usize {
        self.values.lock().len()
    }

    /// Returns `true` once `on_complete` was received.
    #[must_use]
    pub fn is_complete(&self) -> bool {
        self.completions.load(Ordering::SeqCst) > 0
    }

    /// Returns the recorded errors.
    #[must_use]
    pub fn errors(&self) -> Vec<StreamError> {
        self.errors.lock().clone()
    }

    /// Asserts no value was received.
    pub fn assert_no_values(&self) -> &Self {
        assert_eq!(self.value_count(), 0, "expected no values");
        self
    }

    /// Asserts exactly one completion and no error.
    pub fn assert_complete(&self) -> &Self {
        assert_eq!(
            self.completions.load(Ordering::SeqCst),
            1,
            "expected exactly one on_complete"
        );
        self
    }

    /// Asserts no completion was received.
    pub fn assert_not_complete(&self) -> &Self {
        assert_eq!(
            self.completions.load(Ordering::SeqCst),
            0,
            "expected no on_complete"
        );
        self
    }

    /// Asserts no error was received.
    pub fn assert_no_error(&self) -> &Self {
        let errors = self.errors.lock();
        assert!(errors.is_empty(), "expected no errors, got {errors:?}");
        self
    }

    /// Asserts exactly one error equal to `expected` was received.
    pub fn assert_error(&self, expected: &StreamError) -> &Self {
        let errors = self.errors.lock();
        assert_eq!(errors.len(), 1, "expected exactly one error, got {errors:?}");
        assert_eq!(&errors[0], expected);
        self
    }

    /// Asserts exactly one error was received, whatever its value.
    pub fn assert_any_error(&self) -> &Self {
        let errors = self.errors.lock();
        assert_eq!(errors.len(), 1, "expected exactly one error, got {errors:?}");
        self
    }
}

impl<T: Clone + Send + 'static> TestSubscriber<T> {
    /// Returns the values received so far.
    #[must_use]
    pub fn values(&self) -> Vec<T> {
        self.values.lock().clone()
    }
}

impl<T: Clone + PartialEq + std::fmt::Debug + Send + 'static> TestSubscriber<T> {
    /// Asserts the exact value sequence received so far.
    pub fn assert_values(&self, expected: &[T]) -> &Self {
        assert_eq!(self.values.lock().as_slice(), expected);
        self
    }
}

impl<T: Send + 'static> Subscriber<T> for TestSubscriber<T> {
    fn on_subscribe(&self, upstream: SubscriptionHandle<T>) {
        {
            let mut guard = self.upstream.lock();
            assert!(guard.is_none(), "duplicate on_subscribe");
            *guard = Some(upstream.clone());
        }
        if self.initial_request > 0 {
            upstream.request(self.initial_request);
        }
    }

    fn on_next(&self, value: T) {
        self.values.lock().push(value);
    }

    fn on_error(&self, error: StreamError) {
        self.errors.lock().push(error);
    }

    fn on_complete(&self) {
        self.completions.fetch_add(1, Ordering::SeqCst);
    }
}

// ---------------------------------------------------------------------------
// Sink capture
// ---------------------------------------------------------------------------

static HOOK_TEST_LOCK: Mutex<()> = Mutex::new(());

/// Serializes tests that mutate the process-wide sink hooks and resets
/// them on entry. Hold the returned guard for the duration of the test.
#[must_use]
pub fn hook_guard() -> MutexGuard<'static, ()> {
    let guard = HOOK_TEST_LOCK.lock();
    hooks::reset();
    guard
}

/// Captures everything routed to the unsignalled sink for one test.
///
/// Installing the capture takes the hook serialization lock; dropping it
/// restores the default hooks.
pub struct DropCapture {
    _serial: MutexGuard<'static, ()>,
    errors: Arc<Mutex<Vec<StreamError>>>,
    values: Arc<Mutex<Vec<Box<dyn Any + Send>>>>,
}

impl DropCapture {
    /// Installs capturing hooks.
    #[must_use]
    pub fn install() -> Self {
        let serial = hook_guard();

        let errors = Arc::new(Mutex::new(Vec::new()));
        let errors_hook = Arc::clone(&errors);
        hooks::set_error_hook(Arc::new(move |error: &StreamError| {
            errors_hook.lock().push(error.clone());
        }));

        let values = Arc::new(Mutex::new(Vec::new()));
        let values_hook = Arc::clone(&values);
        hooks::set_value_hook(Arc::new(move |value| {
            values_hook.lock().push(value);
        }));

        Self {
            _serial: serial,
            errors,
            values,
        }
    }

    /// Returns the dropped errors captured so far.
    #[must_use]
    pub fn errors(&self) -> Vec<StreamError> {
        self.errors.lock().clone()
    }

    /// Returns the number of dropped values captured so far.
    #[must_use]
    pub fn value_count(&self) -> usize {
        self.values.lock().len()
    }

    /// Returns the dropped values of type `T` captured so far.
    #[must_use]
    pub fn values_of<T: Clone + 'static>(&self) -> Vec<T> {
        self.values
            .lock()
            .iter()
            .filter_map(|boxed| boxed.downcast_ref::<T>().cloned())
            .collect()
    }
}

impl Drop for DropCapture {
    fn drop(&mut self) {
        hooks::reset();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_recording_and_assertions() {
        let ts = TestSubscriber::<i32>::with_request(0);
        let probe = ts.downstream();

        probe.on_next(1);
        probe.on_next(2);
        probe.on_complete();

        ts.assert_values(&[1, 2]).assert_complete().assert_no_error();
    }

    #[test]
    fn test_drop_capture_roundtrip() {
        let capture = DropCapture::install();
        hooks::on_error_dropped(&StreamError::Disconnected);
        hooks::on_value_dropped(41i32);
        hooks::on_value_dropped(1i32);

        assert_eq!(capture.errors(), vec![StreamError::Disconnected]);
        assert_eq!(capture.value_count(), 2);
        assert_eq!(capture.values_of::<i32>(), vec![41, 1]);
    }
}
