//! Connectable multicast: one upstream subscription shared by many
//! subscribers.
//!
//! Subscribers attach to the current *connection record*'s processor;
//! nothing flows until [`Connectable::connect`] subscribes the record to
//! the source. A record moves through `idle → started → terminated` by
//! CAS; a fresh record is installed (cold path, under the registry lock)
//! whenever subscribers arrive after the previous record terminated.
//! Disconnecting a started record cancels the upstream and fails the
//! attached subscribers with a disconnection error; source signals
//! arriving after termination go to the unsignalled sink.

use std::sync::atomic::{AtomicU8, Ordering};
use std::sync::Arc;

use parking_lot::Mutex;

use crate::error::StreamError;
use crate::hooks;
use crate::processor::DirectProcessor;
use crate::stream::{Downstream, Stage, Subscriber, SubscriptionHandle};
use crate::upstream::UpstreamCell;

/// A stage whose upstream subscription is shared and explicitly started.
pub trait Connectable<T>: Stage<T> {
    /// Subscribes the shared record to the source, once per record.
    /// Returns a handle that tears the shared connection down.
    fn connect(&self) -> ConnectionHandle<T>;
}

/// Shares one source subscription among all current subscribers.
pub struct MulticastStage<T> {
    source: Arc<dyn Stage<T>>,
    connection: Mutex<Option<Arc<Connection<T>>>>,
}

impl<T: Clone + Send + Sync + 'static> MulticastStage<T> {
    /// Wraps `source`.
    #[must_use]
    pub fn new(source: Arc<dyn Stage<T>>) -> Self {
        Self {
            source,
            connection: Mutex::new(None),
        }
    }

    /// Returns the live connection record, installing a fresh one when
    /// none exists or the previous one terminated.
    fn current(&self) -> Arc<Connection<T>> {
        let mut guard = self.connection.lock();
        match guard.as_ref() {
            Some(connection) if !connection.is_terminated() => Arc::clone(connection),
            _ => {
                let fresh = Arc::new(Connection {
                    processor: DirectProcessor::new(),
                    connected: AtomicU8::new(IDLE),
                    upstream: UpstreamCell::new(),
                });
                *guard = Some(Arc::clone(&fresh));
                tracing::debug!("installed fresh multicast connection record");
                fresh
            }
        }
    }
}

impl<T: Clone + Send + Sync + 'static> Stage<T> for MulticastStage<T> {
    fn subscribe(&self, downstream: Downstream<T>) {
        self.current().processor.subscribe(downstream);
    }
}

impl<T: Clone + Send + Sync + 'static> Connectable<T> for MulticastStage<T> {
    fn connect(&self) -> ConnectionHandle<T> {
        let connection = self.current();
        if connection.try_connect() {
            self.source
                .subscribe(Downstream::Plain(Arc::clone(&connection) as _));
        }
        ConnectionHandle { connection }
    }
}

const IDLE: u8 = 0;
const STARTED: u8 = 1;
const TERMINATED: u8 = 2;

struct Connection<T> {
    processor: Arc<DirectProcessor<T>>,
    connected: AtomicU8,
    upstream: UpstreamCell<T>,
}

impl<T: Clone + Send + 'static> Connection<T> {
    fn is_terminated(&self) -> bool {
        self.connected.load(Ordering::Acquire) == TERMINATED
    }

    fn try_connect(&self) -> bool {
        self.connected
            .compare_exchange(IDLE, STARTED, Ordering::AcqRel, Ordering::Acquire)
            .is_ok()
    }

    fn try_terminate(&self) -> bool {
        self.connected
            .compare_exchange(STARTED, TERMINATED, Ordering::AcqRel, Ordering::Acquire)
            .is_ok()
    }

    fn disconnect(&self) {
        if self.try_terminate() {
            self.upstream.terminate();
            self.processor.on_error(StreamError::Disconnected);
        }
    }
}

impl<T: Clone + Send + 'static> Subscriber<T> for Connection<T> {
    fn on_subscribe(&self, upstream: SubscriptionHandle<T>) {
        if self.upstream.set_once(upstream.clone()) {
            self.processor.on_subscribe(upstream);
        }
    }

    fn on_next(&self, value: T) {
        if self.is_terminated() {
            hooks::on_value_dropped(value);
            return;
        }
        self.processor.on_next(value);
    }

    fn on_error(&self, error: StreamError) {
        if self.try_terminate() {
            self.processor.on_error(error);
        } else {
            hooks::on_error_dropped(&error);
        }
    }

    fn on_complete(&self) {
        if self.try_terminate() {
            self.processor.on_complete();
        }
    }
}

/// Tears down a shared connection.
pub struct ConnectionHandle<T> {
    connection: Arc<Connection<T>>,
}

impl<T: Clone + Send + 'static> ConnectionHandle<T> {
    /// Terminates the connection: the upstream is cancelled and attached
    /// subscribers receive a disconnection error. Idempotent.
    pub fn disconnect(&self) {
        self.connection.disconnect();
    }

    /// Returns `true` once the underlying record terminated.
    #[must_use]
    pub fn is_disconnected(&self) -> bool {
        self.connection.is_terminated()
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::AtomicUsize;

    use super::*;
    use crate::operator::range::range;
    use crate::testing::{DropCapture, TestSubscriber};

    #[test]
    fn test_nothing_flows_before_connect() {
        let processor = DirectProcessor::<i32>::new();
        let multicast = MulticastStage::new(Arc::clone(&processor) as Arc<dyn Stage<i32>>);

        let ts = TestSubscriber::new();
        multicast.subscribe(ts.downstream());

        processor.on_next(1);
        ts.assert_no_values();
        // The source has no subscriber yet.
        assert_eq!(processor.subscriber_count(), 0);
    }

    #[test]
    fn test_late_subscriber_sees_only_future_values() {
        let source = DirectProcessor::<i32>::new();
        let multicast = MulticastStage::new(Arc::clone(&source) as Arc<dyn Stage<i32>>);

        let a = TestSubscriber::new();
        multicast.subscribe(a.downstream());
        let _connection = multicast.connect();

        source.on_next(1);
        source.on_next(2);

        let b = TestSubscriber::new();
        multicast.subscribe(b.downstream());

        source.on_next(3);

        a.assert_values(&[1, 2, 3]);
        b.assert_values(&[3]);
    }

    #[test]
    fn test_connect_subscribes_source_once() {
        struct CountingStage {
            subscribes: AtomicUsize,
        }

        impl Stage<i32> for CountingStage {
            fn subscribe(&self, downstream: Downstream<i32>) {
                self.subscribes.fetch_add(1, Ordering::SeqCst);
                crate::operator::scalar::never().subscribe(downstream);
            }
        }

        let source = Arc::new(CountingStage {
            subscribes: AtomicUsize::new(0),
        });
        let multicast = MulticastStage::new(Arc::clone(&source) as Arc<dyn Stage<i32>>);

        let ts = TestSubscriber::<i32>::new();
        multicast.subscribe(ts.downstream());
        let _c1 = multicast.connect();
        let _c2 = multicast.connect();

        assert_eq!(source.subscribes.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_disconnect_errors_subscribers_and_cancels_source() {
        let source = DirectProcessor::<i32>::new();
        let multicast = MulticastStage::new(Arc::clone(&source) as Arc<dyn Stage<i32>>);

        let ts = TestSubscriber::new();
        multicast.subscribe(ts.downstream());
        let connection = multicast.connect();
        source.on_next(1);

        connection.disconnect();
        assert!(connection.is_disconnected());

        ts.assert_values(&[1]).assert_error(&StreamError::Disconnected);
        assert_eq!(source.subscriber_count(), 0);
    }

    #[test]
    fn test_signals_after_termination_are_sunk() {
        let capture = DropCapture::install();

        let source = DirectProcessor::<i32>::new();
        let multicast = MulticastStage::new(Arc::clone(&source) as Arc<dyn Stage<i32>>);
        let ts = TestSubscriber::new();
        multicast.subscribe(ts.downstream());
        let connection = multicast.connect();

        connection.disconnect();

        // Direct pokes at the record after termination.
        let record = multicast.connection.lock().clone().unwrap();
        record.on_next(7);
        record.on_error(StreamError::callback("late"));

        assert_eq!(capture.values_of::<i32>(), vec![7]);
        assert_eq!(capture.errors(), vec![StreamError::callback("late")]);
    }

    #[test]
    fn test_fresh_record_after_termination() {
        let multicast = MulticastStage::new(Arc::new(range(1, 3)) as Arc<dyn Stage<i64>>);

        let first = TestSubscriber::new();
        multicast.subscribe(first.downstream());
        multicast.connect();
        first.assert_values(&[1, 2, 3]).assert_complete();

        // The old record is spent; a new generation starts cleanly.
        let second = TestSubscriber::new();
        multicast.subscribe(second.downstream());
        multicast.connect();
        second.assert_values(&[1, 2, 3]).assert_complete();
    }
}
