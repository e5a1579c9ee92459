//! Upstream subscription reference cells.
//!
//! An operator that holds "the upstream subscription" needs three things
//! from the field: single assignment, cancellation that wins regardless of
//! arrival order, and (for operators that expose `request` before their
//! upstream exists) demand that accumulates until the upstream arrives.
//!
//! [`UpstreamCell`] provides the first two with an atomic state byte over a
//! write-once slot; [`DeferredCell`] layers the deferred-demand protocol on
//! top.

use std::sync::atomic::{AtomicU8, Ordering};
use std::sync::OnceLock;

use crate::demand::Demand;
use crate::error::StreamError;
use crate::hooks;
use crate::stream::SubscriptionHandle;

const EMPTY: u8 = 0;
const READY: u8 = 1;
const CANCELLED: u8 = 2;

/// Single-assignment upstream reference with a cancelled sentinel.
///
/// State machine: *empty* → *ready* on the first [`set_once`], any state →
/// *cancelled* on [`terminate`]. A handle arriving after *cancelled* is
/// cancelled on the spot; a second handle arriving after *ready* is
/// cancelled and reported as a protocol violation, once, to the
/// unsignalled sink.
///
/// [`set_once`]: Self::set_once
/// [`terminate`]: Self::terminate
pub struct UpstreamCell<T> {
    state: AtomicU8,
    slot: OnceLock<SubscriptionHandle<T>>,
}

impl<T> UpstreamCell<T> {
    /// Creates an empty cell.
    #[must_use]
    pub const fn new() -> Self {
        Self {
            state: AtomicU8::new(EMPTY),
            slot: OnceLock::new(),
        }
    }

    /// Installs the upstream handle.
    ///
    /// Returns `true` when `handle` became the cell's subscription. On any
    /// other outcome `handle` has been cancelled before returning.
    pub fn set_once(&self, handle: SubscriptionHandle<T>) -> bool {
        if self.state.load(Ordering::Acquire) == CANCELLED {
            handle.cancel();
            return false;
        }

        match self.slot.set(handle) {
            Ok(()) => {
                match self
                    .state
                    .compare_exchange(EMPTY, READY, Ordering::AcqRel, Ordering::Acquire)
                {
                    Ok(_) => true,
                    Err(_) => {
                        // Terminated while we were installing; unwind.
                        if let Some(handle) = self.slot.get() {
                            handle.cancel();
                        }
                        false
                    }
                }
            }
            Err(handle) => {
                handle.cancel();
                hooks::on_error_dropped(&StreamError::DuplicateSubscription);
                false
            }
        }
    }

    /// Cancels the cell and whatever subscription it holds.
    ///
    /// Returns `true` the first time only; the cancelled state is
    /// absorbing.
    pub fn terminate(&self) -> bool {
        let prev = self.state.swap(CANCELLED, Ordering::AcqRel);
        if prev == CANCELLED {
            return false;
        }
        if let Some(handle) = self.slot.get() {
            handle.cancel();
        }
        true
    }

    /// Forwards `n` to the installed subscription, if one is ready.
    pub fn request(&self, n: u64) {
        if self.state.load(Ordering::Acquire) == READY {
            if let Some(handle) = self.slot.get() {
                handle.request(n);
            }
        }
    }

    /// Returns `true` once a handle is installed and not cancelled.
    #[must_use]
    pub fn ready(&self) -> bool {
        self.state.load(Ordering::Acquire) == READY
    }

    /// Returns `true` after [`terminate`](Self::terminate).
    #[must_use]
    pub fn is_cancelled(&self) -> bool {
        self.state.load(Ordering::Acquire) == CANCELLED
    }

    /// Returns the installed handle while the cell is ready.
    #[must_use]
    pub fn get(&self) -> Option<&SubscriptionHandle<T>> {
        if self.ready() {
            self.slot.get()
        } else {
            None
        }
    }
}

impl<T> Default for UpstreamCell<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T> std::fmt::Debug for UpstreamCell<T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let state = match self.state.load(Ordering::Acquire) {
            EMPTY => "empty",
            READY => "ready",
            _ => "cancelled",
        };
        f.debug_struct("UpstreamCell").field("state", &state).finish()
    }
}

/// Upstream cell with deferred demand.
///
/// Demand requested before the upstream arrives accumulates in a local
/// counter; the accumulated total is drained to the upstream the moment it
/// is installed. Requests and installation may race; the swap-to-zero
/// drain guarantees each unit of demand is forwarded exactly once.
pub struct DeferredCell<T> {
    cell: UpstreamCell<T>,
    pending: Demand,
}

impl<T> DeferredCell<T> {
    /// Creates an empty deferred cell.
    #[must_use]
    pub const fn new() -> Self {
        Self {
            cell: UpstreamCell::new(),
            pending: Demand::new(),
        }
    }

    /// Installs the upstream and drains any demand accumulated so far.
    pub fn set_once(&self, handle: SubscriptionHandle<T>) -> bool {
        if !self.cell.set_once(handle) {
            return false;
        }
        let accumulated = self.pending.take();
        if accumulated > 0 {
            self.cell.request(accumulated);
        }
        true
    }

    /// Requests `n`, forwarding immediately when the upstream is present
    /// and accumulating otherwise.
    pub fn request(&self, n: u64) {
        if self.cell.ready() {
            self.cell.request(n);
            return;
        }

        self.pending.add(n);

        // The upstream may have been installed while we accumulated; drain
        // whatever is still pending so the demand is not stranded.
        if self.cell.ready() {
            let accumulated = self.pending.take();
            if accumulated > 0 {
                self.cell.request(accumulated);
            }
        }
    }

    /// Cancels the cell and the installed subscription, if any.
    pub fn terminate(&self) -> bool {
        self.cell.terminate()
    }

    /// Returns `true` after termination.
    #[must_use]
    pub fn is_cancelled(&self) -> bool {
        self.cell.is_cancelled()
    }
}

impl<T> Default for DeferredCell<T> {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
    use std::sync::Arc;

    use super::*;
    use crate::error::StreamError;
    use crate::stream::Subscription;
    use crate::testing::hook_guard;

    #[derive(Default)]
    struct Probe {
        requested: AtomicU64,
        cancelled: AtomicBool,
    }

    impl Subscription for Probe {
        fn request(&self, n: u64) {
            self.requested.fetch_add(n, Ordering::SeqCst);
        }

        fn cancel(&self) {
            self.cancelled.store(true, Ordering::SeqCst);
        }
    }

    fn handle(probe: &Arc<Probe>) -> SubscriptionHandle<i32> {
        SubscriptionHandle::Plain(Arc::clone(probe) as Arc<dyn Subscription>)
    }

    #[test]
    fn test_set_once_then_request() {
        let cell: UpstreamCell<i32> = UpstreamCell::new();
        let probe = Arc::new(Probe::default());

        assert!(cell.set_once(handle(&probe)));
        assert!(cell.ready());

        cell.request(5);
        assert_eq!(probe.requested.load(Ordering::SeqCst), 5);
    }

    #[test]
    fn test_duplicate_assignment_cancels_and_reports() {
        let _guard = hook_guard();
        let reports = Arc::new(AtomicUsize::new(0));
        let seen = Arc::clone(&reports);
        crate::hooks::set_error_hook(Arc::new(move |error| {
            assert_eq!(*error, StreamError::DuplicateSubscription);
            seen.fetch_add(1, Ordering::SeqCst);
        }));

        let cell: UpstreamCell<i32> = UpstreamCell::new();
        let first = Arc::new(Probe::default());
        let second = Arc::new(Probe::default());

        assert!(cell.set_once(handle(&first)));
        assert!(!cell.set_once(handle(&second)));

        assert!(second.cancelled.load(Ordering::SeqCst));
        assert!(!first.cancelled.load(Ordering::SeqCst));
        assert_eq!(reports.load(Ordering::SeqCst), 1);
        crate::hooks::reset();
    }

    #[test]
    fn test_terminate_cancels_installed() {
        let cell: UpstreamCell<i32> = UpstreamCell::new();
        let probe = Arc::new(Probe::default());
        cell.set_once(handle(&probe));

        assert!(cell.terminate());
        assert!(probe.cancelled.load(Ordering::SeqCst));
        // Absorbing.
        assert!(!cell.terminate());
    }

    #[test]
    fn test_set_after_terminate_cancels_newcomer() {
        let cell: UpstreamCell<i32> = UpstreamCell::new();
        assert!(cell.terminate());

        let late = Arc::new(Probe::default());
        assert!(!cell.set_once(handle(&late)));
        assert!(late.cancelled.load(Ordering::SeqCst));
    }

    #[test]
    fn test_request_after_terminate_is_noop() {
        let cell: UpstreamCell<i32> = UpstreamCell::new();
        let probe = Arc::new(Probe::default());
        cell.set_once(handle(&probe));
        cell.terminate();

        cell.request(10);
        assert_eq!(probe.requested.load(Ordering::SeqCst), 0);
    }

    #[test]
    fn test_deferred_demand_drains_on_set() {
        let cell: DeferredCell<i32> = DeferredCell::new();
        cell.request(3);
        cell.request(4);

        let probe = Arc::new(Probe::default());
        assert!(cell.set_once(handle(&probe)));
        assert_eq!(probe.requested.load(Ordering::SeqCst), 7);

        // Later demand flows straight through.
        cell.request(2);
        assert_eq!(probe.requested.load(Ordering::SeqCst), 9);
    }

    #[test]
    fn test_deferred_terminate_cancels() {
        let cell: DeferredCell<i32> = DeferredCell::new();
        let probe = Arc::new(Probe::default());
        cell.set_once(handle(&probe));
        assert!(cell.terminate());
        assert!(probe.cancelled.load(Ordering::SeqCst));
    }
}
