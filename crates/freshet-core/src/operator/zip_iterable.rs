//! Pairwise combination of a stream with an iterable sequence.
//!
//! The iterator is acquired and probed before subscribing: an empty
//! iterable completes the downstream immediately without touching the
//! source. On each source element the next iterator value is taken and
//! the pair is combined; when the iterator runs dry after an emission the
//! source is cancelled and the stream completes.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Weak};

use parking_lot::Mutex;

use crate::error::StreamError;
use crate::hooks;
use crate::stream::{Downstream, Stage, Subscriber, Subscription, SubscriptionHandle};
use crate::upstream::UpstreamCell;

use super::scalar::EmptySubscription;

/// Fallible pairwise combiner.
pub type Zipper<T, U, R> = Arc<dyn Fn(T, U) -> Result<R, StreamError> + Send + Sync>;

/// Combines source elements with iterable elements one-to-one.
pub struct ZipIterableStage<T, I, R>
where
    I: IntoIterator,
{
    source: Arc<dyn Stage<T>>,
    iterable: I,
    zipper: Zipper<T, I::Item, R>,
}

impl<T, I, R> ZipIterableStage<T, I, R>
where
    T: Send + 'static,
    I: IntoIterator + Clone + Send + Sync,
    I::Item: Send + 'static,
    I::IntoIter: Send + 'static,
    R: Send + 'static,
{
    /// Wraps `source`, pairing it against a fresh iterator of `iterable`
    /// per subscription.
    pub fn new(
        source: Arc<dyn Stage<T>>,
        iterable: I,
        zipper: impl Fn(T, I::Item) -> Result<R, StreamError> + Send + Sync + 'static,
    ) -> Self {
        Self {
            source,
            iterable,
            zipper: Arc::new(zipper),
        }
    }
}

impl<T, I, R> Stage<R> for ZipIterableStage<T, I, R>
where
    T: Send + 'static,
    I: IntoIterator + Clone + Send + Sync,
    I::Item: Send + 'static,
    I::IntoIter: Send + 'static,
    R: Send + 'static,
{
    fn subscribe(&self, downstream: Downstream<R>) {
        let mut iterator = self.iterable.clone().into_iter().peekable();
        if iterator.peek().is_none() {
            EmptySubscription::complete(&downstream);
            return;
        }

        let subscription = Arc::new_cyclic(|self_ref| ZipIterableSubscription {
            self_ref: self_ref.clone(),
            downstream,
            iterator: Mutex::new(iterator),
            zipper: Arc::clone(&self.zipper),
            done: AtomicBool::new(false),
            upstream: UpstreamCell::new(),
        });
        self.source.subscribe(Downstream::Plain(subscription));
    }
}

struct ZipIterableSubscription<T, U, R, It>
where
    It: Iterator<Item = U>,
{
    self_ref: Weak<Self>,
    downstream: Downstream<R>,
    /// Serialized by the upstream signal path; the lock is uncontended.
    iterator: Mutex<std::iter::Peekable<It>>,
    zipper: Zipper<T, U, R>,
    done: AtomicBool,
    upstream: UpstreamCell<T>,
}

impl<T, U, R, It> ZipIterableSubscription<T, U, R, It>
where
    T: Send + 'static,
    U: Send + 'static,
    R: Send + 'static,
    It: Iterator<Item = U> + Send + 'static,
{
    fn fail(&self, error: StreamError) {
        self.done.store(true, Ordering::Release);
        self.upstream.terminate();
        self.downstream.on_error(error);
    }
}

impl<T, U, R, It> Subscriber<T> for ZipIterableSubscription<T, U, R, It>
where
    T: Send + 'static,
    U: Send + 'static,
    R: Send + 'static,
    It: Iterator<Item = U> + Send + 'static,
{
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
        if self.done.load(Ordering::Acquire) {
            hooks::on_value_dropped(value);
            return;
        }

        let (zipped, exhausted) = {
            let mut iterator = self.iterator.lock();
            let Some(other) = iterator.next() else {
                // The pre-subscribe probe guarantees a first element, so
                // this only happens on a racing late delivery.
                drop(iterator);
                self.done.store(true, Ordering::Release);
                self.upstream.terminate();
                self.downstream.on_complete();
                return;
            };
            let zipped = (self.zipper)(value, other);
            let exhausted = zipped.is_ok() && iterator.peek().is_none();
            (zipped, exhausted)
        };

        match zipped {
            Ok(result) => {
                self.downstream.on_next(result);
                if exhausted {
                    self.done.store(true, Ordering::Release);
                    self.upstream.terminate();
                    self.downstream.on_complete();
                }
            }
            Err(error) => self.fail(error),
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

impl<T, U, R, It> Subscription for ZipIterableSubscription<T, U, R, It>
where
    T: Send + 'static,
    U: Send + 'static,
    R: Send + 'static,
    It: Iterator<Item = U> + Send + 'static,
{
    fn request(&self, n: u64) {
        self.upstream.request(n);
    }

    fn cancel(&self) {
        self.upstream.terminate();
    }
}
