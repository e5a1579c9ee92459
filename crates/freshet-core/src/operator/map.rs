//! Element transformation through a fallible mapper.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Weak};

use crate::error::StreamError;
use crate::hooks;
use crate::stream::{
    ConditionalSubscriber, Downstream, Stage, Subscriber, Subscription, SubscriptionHandle,
};
use crate::upstream::UpstreamCell;

/// Fallible element mapper.
pub type Mapper<T, R> = Arc<dyn Fn(T) -> Result<R, StreamError> + Send + Sync>;

/// Applies a mapper to every element; a mapper failure cancels the source
/// and surfaces as `on_error`.
pub struct MapStage<T, R> {
    source: Arc<dyn Stage<T>>,
    mapper: Mapper<T, R>,
}

impl<T: Send + 'static, R: Send + 'static> MapStage<T, R> {
    /// Wraps `source` with `mapper`.
    pub fn new(
        source: Arc<dyn Stage<T>>,
        mapper: impl Fn(T) -> Result<R, StreamError> + Send + Sync + 'static,
    ) -> Self {
        Self {
            source,
            mapper: Arc::new(mapper),
        }
    }
}

impl<T: Send + 'static, R: Send + 'static> Stage<R> for MapStage<T, R> {
    fn subscribe(&self, downstream: Downstream<R>) {
        let subscription = Arc::new_cyclic(|self_ref| MapSubscription {
            self_ref: self_ref.clone(),
            downstream,
            mapper: Arc::clone(&self.mapper),
            done: AtomicBool::new(false),
            upstream: UpstreamCell::new(),
        });
        // The node accepts `try_on_next` regardless of the downstream
        // flavor, so it always presents the conditional surface upstream.
        self.source.subscribe(Downstream::Conditional(subscription));
    }
}

struct MapSubscription<T, R> {
    self_ref: Weak<Self>,
    downstream: Downstream<R>,
    mapper: Mapper<T, R>,
    done: AtomicBool,
    upstream: UpstreamCell<T>,
}

impl<T: Send + 'static, R: Send + 'static> MapSubscription<T, R> {
    fn fail(&self, error: StreamError) {
        self.upstream.terminate();
        self.on_error(error);
    }
}

impl<T: Send + 'static, R: Send + 'static> Subscriber<T> for MapSubscription<T, R> {
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
        match (self.mapper)(value) {
            Ok(mapped) => self.downstream.on_next(mapped),
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

impl<T: Send + 'static, R: Send + 'static> ConditionalSubscriber<T> for MapSubscription<T, R> {
    fn try_on_next(&self, value: T) -> bool {
        if self.done.load(Ordering::Acquire) {
            hooks::on_value_dropped(value);
            return true;
        }
        match (self.mapper)(value) {
            Ok(mapped) => self.downstream.try_on_next(mapped),
            Err(error) => {
                self.fail(error);
                true
            }
        }
    }
}

impl<T: Send + 'static, R: Send + 'static> Subscription for MapSubscription<T, R> {
    fn request(&self, n: u64) {
        self.upstream.request(n);
    }

    fn cancel(&self) {
        self.upstream.terminate();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::operator::range::range;
    use crate::testing::TestSubscriber;

    #[test]
    fn test_maps_values() {
        let ts = TestSubscriber::new();
        MapStage::new(Arc::new(range(1, 4)), |v| Ok(v * 10)).subscribe(ts.downstream());

        ts.assert_values(&[10, 20, 30, 40]).assert_complete();
    }

    #[test]
    fn test_mapper_failure_cancels() {
        let ts = TestSubscriber::new();
        MapStage::new(Arc::new(range(1, 10)), |v| {
            if v == 3 {
                Err(StreamError::callback("mapper rejected 3"))
            } else {
                Ok(v)
            }
        })
        .subscribe(ts.downstream());

        ts.assert_values(&[1, 2])
            .assert_error(&StreamError::callback("mapper rejected 3"))
            .assert_not_complete();
    }

    #[test]
    fn test_type_change() {
        let ts = TestSubscriber::new();
        MapStage::new(Arc::new(range(1, 3)), |v| Ok(format!("#{v}")))
            .subscribe(ts.downstream());

        ts.assert_values(&["#1".to_string(), "#2".to_string(), "#3".to_string()])
            .assert_complete();
    }
}
