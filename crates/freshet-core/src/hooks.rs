//! Process-wide sink for signals that had nowhere to go.
//!
//! The protocol allows at most one terminal signal per subscription. Values
//! and errors that arrive after the terminal (or after cancellation) must
//! not be re-delivered, so operators route them here instead. The default
//! behavior is log-and-drop via `tracing`; embedders install their own hooks
//! at program start and reset them at teardown, and test fixtures install
//! capturing hooks for the duration of a test.
//!
//! Dropped values are boxed as `dyn Any` because elements are opaque to the
//! core; a capturing hook can downcast when it knows the concrete type.

use std::any::Any;
use std::sync::Arc;

use parking_lot::RwLock;

use crate::error::StreamError;

/// Hook receiving errors that could not be signalled downstream.
pub type DroppedErrorHook = Arc<dyn Fn(&StreamError) + Send + Sync>;

/// Hook receiving values dropped after a terminal signal or cancellation.
pub type DroppedValueHook = Arc<dyn Fn(Box<dyn Any + Send>) + Send + Sync>;

#[derive(Default)]
struct Hooks {
    on_error: Option<DroppedErrorHook>,
    on_value: Option<DroppedValueHook>,
}

static HOOKS: RwLock<Hooks> = RwLock::new(Hooks {
    on_error: None,
    on_value: None,
});

/// Routes an error that had nowhere to be delivered.
///
/// Never re-raises: the error ends at the installed hook or the default
/// log line.
pub fn on_error_dropped(error: &StreamError) {
    let hooks = HOOKS.read();
    match &hooks.on_error {
        Some(hook) => hook(error),
        None => tracing::warn!(%error, "error dropped: no downstream to deliver to"),
    }
}

/// Routes a value that arrived after its subscription terminated.
pub fn on_value_dropped<T: Send + 'static>(value: T) {
    let hooks = HOOKS.read();
    match &hooks.on_value {
        Some(hook) => hook(Box::new(value)),
        None => tracing::warn!("value dropped after terminal signal"),
    }
}

/// Installs the dropped-error hook, returning the previous one.
pub fn set_error_hook(hook: DroppedErrorHook) -> Option<DroppedErrorHook> {
    HOOKS.write().on_error.replace(hook)
}

/// Installs the dropped-value hook, returning the previous one.
pub fn set_value_hook(hook: DroppedValueHook) -> Option<DroppedValueHook> {
    HOOKS.write().on_value.replace(hook)
}

/// Restores both hooks to the default log-and-drop behavior.
pub fn reset() {
    let mut hooks = HOOKS.write();
    hooks.on_error = None;
    hooks.on_value = None;
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicUsize, Ordering};

    use super::*;
    use crate::testing::hook_guard;

    #[test]
    fn test_error_hook_capture() {
        let _guard = hook_guard();
        let count = Arc::new(AtomicUsize::new(0));
        let seen = Arc::clone(&count);
        set_error_hook(Arc::new(move |_| {
            seen.fetch_add(1, Ordering::SeqCst);
        }));

        on_error_dropped(&StreamError::Disconnected);
        on_error_dropped(&StreamError::InvalidRequest(0));
        assert_eq!(count.load(Ordering::SeqCst), 2);

        reset();
        on_error_dropped(&StreamError::Disconnected);
        assert_eq!(count.load(Ordering::SeqCst), 2);
    }

    #[test]
    fn test_value_hook_downcast() {
        let _guard = hook_guard();
        let count = Arc::new(AtomicUsize::new(0));
        let seen = Arc::clone(&count);
        set_value_hook(Arc::new(move |value| {
            let value = value.downcast::<i32>().expect("i32 payload");
            seen.fetch_add(usize::try_from(*value).unwrap(), Ordering::SeqCst);
        }));

        on_value_dropped(7i32);
        on_value_dropped(5i32);
        assert_eq!(count.load(Ordering::SeqCst), 12);
        reset();
    }
}
