//! Automatic connection management for a connectable stage: connect when
//! the first subscriber arrives, disconnect when the last one leaves.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Weak};

use parking_lot::Mutex;

use crate::error::StreamError;
use crate::stream::{Downstream, Stage, Subscriber, Subscription, SubscriptionHandle};
use crate::upstream::UpstreamCell;

use super::multicast::{Connectable, ConnectionHandle, MulticastStage};

/// Wraps a connectable, driving `connect`/`disconnect` by subscriber
/// count.
pub struct RefCountStage<T> {
    core: Arc<RefCountCore<T>>,
}

struct RefCountCore<T> {
    connectable: Arc<MulticastStage<T>>,
    state: Mutex<RefCountState<T>>,
}

struct RefCountState<T> {
    subscribers: usize,
    connection: Option<ConnectionHandle<T>>,
}

impl<T: Clone + Send + Sync + 'static> RefCountStage<T> {
    /// Wraps `connectable`.
    #[must_use]
    pub fn new(connectable: Arc<MulticastStage<T>>) -> Self {
        Self {
            core: Arc::new(RefCountCore {
                connectable,
                state: Mutex::new(RefCountState {
                    subscribers: 0,
                    connection: None,
                }),
            }),
        }
    }
}

impl<T: Clone + Send + Sync + 'static> RefCountCore<T> {
    fn release(&self) {
        let mut state = self.state.lock();
        state.subscribers = state.subscribers.saturating_sub(1);
        if state.subscribers == 0 {
            if let Some(connection) = state.connection.take() {
                tracing::debug!("last subscriber left, disconnecting shared source");
                connection.disconnect();
            }
        }
    }
}

impl<T: Clone + Send + Sync + 'static> Stage<T> for RefCountStage<T> {
    fn subscribe(&self, downstream: Downstream<T>) {
        let first = {
            let mut state = self.core.state.lock();
            state.subscribers += 1;
            state.subscribers == 1
        };

        let subscription = Arc::new_cyclic(|self_ref| RefCountSubscription {
            self_ref: self_ref.clone(),
            core: Arc::clone(&self.core),
            downstream,
            released: AtomicBool::new(false),
            upstream: UpstreamCell::new(),
        });
        self.core
            .connectable
            .subscribe(Downstream::Plain(subscription));

        if first {
            let connection = self.core.connectable.connect();
            self.core.state.lock().connection = Some(connection);
        }
    }
}

struct RefCountSubscription<T> {
    self_ref: Weak<Self>,
    core: Arc<RefCountCore<T>>,
    downstream: Downstream<T>,
    released: AtomicBool,
    upstream: UpstreamCell<T>,
}

impl<T: Clone + Send + Sync + 'static> RefCountSubscription<T> {
    fn release_once(&self) {
        if !self.released.swap(true, Ordering::AcqRel) {
            self.core.release();
        }
    }
}

impl<T: Clone + Send + Sync + 'static> Subscriber<T> for RefCountSubscription<T> {
    fn on_subscribe(&self, upstream: SubscriptionHandle<T>) {
        if !self.upstream.set_once(upstream) {
            return;
        }
        let Some(this) = self.self_ref.upgrade() else {
            return;
        };
        self.downstream.on_subscribe(SubscriptionHandle::Plain(this));
    }

    fn on_next(&self, value: T) {
        self.downstream.on_next(value);
    }

    fn on_error(&self, error: StreamError) {
        self.downstream.on_error(error);
        self.release_once();
    }

    fn on_complete(&self) {
        self.downstream.on_complete();
        self.release_once();
    }
}

impl<T: Clone + Send + Sync + 'static> Subscription for RefCountSubscription<T> {
    fn request(&self, n: u64) {
        self.upstream.request(n);
    }

    fn cancel(&self) {
        self.upstream.terminate();
        self.release_once();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::processor::DirectProcessor;
    use crate::testing::TestSubscriber;

    fn ref_counted(source: &Arc<DirectProcessor<i32>>) -> RefCountStage<i32> {
        RefCountStage::new(Arc::new(MulticastStage::new(
            Arc::clone(source) as Arc<dyn Stage<i32>>
        )))
    }

    #[test]
    fn test_first_subscriber_connects() {
        let source = DirectProcessor::<i32>::new();
        let stage = ref_counted(&source);

        assert_eq!(source.subscriber_count(), 0);

        let ts = TestSubscriber::new();
        stage.subscribe(ts.downstream());
        assert_eq!(source.subscriber_count(), 1);

        source.on_next(5);
        ts.assert_values(&[5]);
    }

    #[test]
    fn test_second_subscriber_shares_connection() {
        let source = DirectProcessor::<i32>::new();
        let stage = ref_counted(&source);

        let a = TestSubscriber::new();
        stage.subscribe(a.downstream());
        let b = TestSubscriber::new();
        stage.subscribe(b.downstream());

        // Still exactly one subscription to the source.
        assert_eq!(source.subscriber_count(), 1);

        source.on_next(1);
        a.assert_values(&[1]);
        b.assert_values(&[1]);
    }

    #[test]
    fn test_last_cancel_disconnects() {
        let source = DirectProcessor::<i32>::new();
        let stage = ref_counted(&source);

        let a = TestSubscriber::new();
        stage.subscribe(a.downstream());
        let b = TestSubscriber::new();
        stage.subscribe(b.downstream());

        a.cancel();
        assert_eq!(source.subscriber_count(), 1);

        b.cancel();
        assert_eq!(source.subscriber_count(), 0);
    }

    #[test]
    fn test_reconnects_after_full_release() {
        let source = DirectProcessor::<i32>::new();
        let stage = ref_counted(&source);

        let a = TestSubscriber::new();
        stage.subscribe(a.downstream());
        a.cancel();
        assert_eq!(source.subscriber_count(), 0);

        let b = TestSubscriber::new();
        stage.subscribe(b.downstream());
        assert_eq!(source.subscriber_count(), 1);

        source.on_next(2);
        b.assert_values(&[2]);
        a.assert_no_values();
    }

    #[test]
    fn test_natural_terminal_releases() {
        let source = DirectProcessor::<i32>::new();
        let stage = ref_counted(&source);

        let ts = TestSubscriber::new();
        stage.subscribe(ts.downstream());
        source.on_next(1);
        source.on_complete();

        ts.assert_values(&[1]).assert_complete();

        // A new subscriber starts a fresh generation.
        let fresh = TestSubscriber::new();
        stage.subscribe(fresh.downstream());
        assert_eq!(stage.core.state.lock().subscribers, 1);
    }
}
