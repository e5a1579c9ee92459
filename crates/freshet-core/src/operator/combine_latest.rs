//! Combines the latest elements of N sources.
//!
//! Each inner arrival updates its source's latest value; once every
//! source has emitted at least once, every further arrival snapshots the
//! full row into a queue. The serialized drain loop combines queued rows
//! against downstream demand, so concurrent producers never interleave
//! inside the downstream.
//!
//! Producer-side row mutation spans several fields, so it runs inside a
//! short critical section (the same shape this codebase uses to serialize
//! multi-producer pushes); the consumer side is the lock-free drain.
//!
//! Completion rules: a source that completes without ever emitting makes
//! a full row impossible, so the whole stream completes (cancelling the
//! other sources); a source that completes after emitting retains its
//! latest value, and the stream completes once every source is done and
//! the queue has drained. After each emitted row, one replacement element
//! is requested from the source that produced it.

use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, OnceLock};

use parking_lot::Mutex;
use smallvec::SmallVec;

use crate::demand::{self, Demand, UNBOUNDED};
use crate::error::StreamError;
use crate::hooks;
use crate::queue::RingQueue;
use crate::stream::{Downstream, Stage, Subscriber, Subscription, SubscriptionHandle};
use crate::upstream::DeferredCell;

use super::scalar::EmptySubscription;

/// Default per-source prefetch.
pub const DEFAULT_PREFETCH: u64 = 128;

/// Upper bound on the row queue allocation.
const MAX_QUEUE_CAPACITY: usize = 1 << 16;

/// Fallible row combiner; the slice holds one value per source, in
/// source order.
pub type Combiner<T, R> = Arc<dyn Fn(&[T]) -> Result<R, StreamError> + Send + Sync>;

/// Emits a combination of the latest values of all sources.
pub struct CombineLatestStage<T, R> {
    sources: Vec<Arc<dyn Stage<T>>>,
    combiner: Combiner<T, R>,
    prefetch: u64,
}

impl<T, R> CombineLatestStage<T, R>
where
    T: Clone + Send + Sync + 'static,
    R: Send + 'static,
{
    /// Combines `sources` through `combiner` with the default prefetch.
    pub fn new(
        sources: Vec<Arc<dyn Stage<T>>>,
        combiner: impl Fn(&[T]) -> Result<R, StreamError> + Send + Sync + 'static,
    ) -> Self {
        Self::with_prefetch(sources, combiner, DEFAULT_PREFETCH)
    }

    /// Combines `sources` with an explicit per-source prefetch.
    ///
    /// # Panics
    ///
    /// Panics when `prefetch` is zero.
    pub fn with_prefetch(
        sources: Vec<Arc<dyn Stage<T>>>,
        combiner: impl Fn(&[T]) -> Result<R, StreamError> + Send + Sync + 'static,
        prefetch: u64,
    ) -> Self {
        assert!(prefetch > 0, "prefetch must be > 0");
        Self {
            sources,
            combiner: Arc::new(combiner),
            prefetch,
        }
    }
}

impl<T, R> Stage<R> for CombineLatestStage<T, R>
where
    T: Clone + Send + Sync + 'static,
    R: Send + 'static,
{
    fn subscribe(&self, downstream: Downstream<R>) {
        let count = self.sources.len();
        if count == 0 {
            EmptySubscription::complete(&downstream);
            return;
        }

        // Every source holds at most `prefetch` unreplenished permits, so
        // the row queue never outgrows sources * prefetch. The clamp keeps
        // absurd prefetch values from dictating the allocation; overflow
        // past a clamped queue surfaces as a demand error.
        let capacity = count
            .saturating_mul(usize::try_from(self.prefetch).unwrap_or(usize::MAX))
            .saturating_add(1)
            .min(MAX_QUEUE_CAPACITY);

        let coordinator = Arc::new(Coordinator {
            downstream,
            combiner: Arc::clone(&self.combiner),
            cells: (0..count).map(|_| DeferredCell::new()).collect(),
            state: Mutex::new(CombineState {
                latest: vec![None; count],
                emitted_sources: 0,
                completed_sources: 0,
            }),
            queue: RingQueue::new(capacity),
            wip: AtomicUsize::new(0),
            demand: Demand::new(),
            cancelled: AtomicBool::new(false),
            done: AtomicBool::new(false),
            error: OnceLock::new(),
        });

        coordinator
            .downstream
            .on_subscribe(SubscriptionHandle::Plain(Arc::clone(&coordinator) as _));

        // Prefetch is issued before any source has been subscribed; each
        // deferred cell accumulates it and drains the total to its
        // upstream the moment that subscription arrives.
        for cell in &coordinator.cells {
            cell.request(self.prefetch);
        }

        for (index, source) in self.sources.iter().enumerate() {
            if coordinator.cancelled.load(Ordering::Acquire)
                || coordinator.done.load(Ordering::Acquire)
            {
                break;
            }
            let inner = Arc::new(CombineLatestInner {
                index,
                parent: Arc::clone(&coordinator),
            });
            source.subscribe(Downstream::Plain(inner));
        }
    }
}

struct Row<T> {
    source: usize,
    values: SmallVec<[T; 4]>,
}

struct CombineState<T> {
    latest: Vec<Option<T>>,
    emitted_sources: usize,
    completed_sources: usize,
}

struct Coordinator<T, R> {
    downstream: Downstream<R>,
    combiner: Combiner<T, R>,
    /// One deferred cell per source: prefetch is requested into the cell
    /// before the source is subscribed and drains on arrival.
    cells: Vec<DeferredCell<T>>,
    /// Latest-row bookkeeping; the lock also serializes row pushes, so
    /// the queue sees one producer at a time.
    state: Mutex<CombineState<T>>,
    /// Snapshot rows awaiting the drain; popped only by the active
    /// drainer.
    queue: RingQueue<Row<T>>,
    wip: AtomicUsize,
    demand: Demand,
    cancelled: AtomicBool,
    done: AtomicBool,
    error: OnceLock<StreamError>,
}

impl<T, R> Coordinator<T, R>
where
    T: Clone + Send + Sync + 'static,
    R: Send + 'static,
{
    fn inner_value(&self, index: usize, value: T) {
        if self.cancelled.load(Ordering::Acquire) || self.done.load(Ordering::Acquire) {
            hooks::on_value_dropped(value);
            return;
        }

        let queued = {
            let mut state = self.state.lock();
            if state.latest[index].is_none() {
                state.emitted_sources += 1;
            }
            state.latest[index] = Some(value);

            if state.emitted_sources == self.cells.len() {
                let values: SmallVec<[T; 4]> =
                    state.latest.iter().filter_map(Clone::clone).collect();
                // Pushed under the state lock: the queue sees a single
                // serialized producer, the drain is its sole consumer.
                if self
                    .queue
                    .push(Row {
                        source: index,
                        values,
                    })
                    .is_err()
                {
                    drop(state);
                    self.inner_error(StreamError::MissingDemand);
                    return;
                }
                true
            } else {
                false
            }
        };

        if queued {
            self.drain();
        } else {
            // The element advanced no row; replace it so the source keeps
            // flowing toward its first complete combination.
            self.cells[index].request(1);
        }
    }

    fn inner_error(&self, error: StreamError) {
        match self.error.set(error) {
            Ok(()) => {
                self.done.store(true, Ordering::Release);
                self.cancel_sources();
                self.drain();
            }
            Err(error) => hooks::on_error_dropped(&error),
        }
    }

    fn inner_complete(&self, index: usize) {
        let (never_emitted, all_completed) = {
            let mut state = self.state.lock();
            state.completed_sources += 1;
            (
                state.latest[index].is_none(),
                state.completed_sources == self.cells.len(),
            )
        };

        if never_emitted {
            // No full row can ever form again.
            self.done.store(true, Ordering::Release);
            self.cancel_sources();
            self.drain();
        } else if all_completed {
            self.done.store(true, Ordering::Release);
            self.drain();
        }
    }

    fn drain(&self) {
        if self.wip.fetch_add(1, Ordering::AcqRel) != 0 {
            return;
        }

        let mut missed = 1;
        loop {
            let requested = self.demand.get();
            let mut emitted: u64 = 0;

            loop {
                if self.cancelled.load(Ordering::Acquire) {
                    self.clear_queue();
                    return;
                }

                let done = self.done.load(Ordering::Acquire);
                if done {
                    if let Some(error) = self.error.get() {
                        self.clear_queue();
                        self.downstream.on_error(error.clone());
                        return;
                    }
                }

                if emitted == requested {
                    if done && self.queue.is_empty() {
                        self.downstream.on_complete();
                        return;
                    }
                    break;
                }

                let Some(row) = self.queue.pop() else {
                    if done {
                        self.downstream.on_complete();
                        return;
                    }
                    break;
                };

                match (self.combiner)(&row.values) {
                    Ok(value) => {
                        self.downstream.on_next(value);
                        emitted += 1;
                        self.cells[row.source].request(1);
                    }
                    Err(error) => {
                        self.cancel_sources();
                        self.clear_queue();
                        self.downstream.on_error(error);
                        return;
                    }
                }
            }

            if emitted != 0 && requested != UNBOUNDED {
                self.demand.produced(emitted);
            }

            let previous = self.wip.fetch_sub(missed, Ordering::AcqRel);
            missed = previous - missed;
            if missed == 0 {
                return;
            }
        }
    }

    fn cancel_sources(&self) {
        for cell in &self.cells {
            cell.terminate();
        }
    }

    fn clear_queue(&self) {
        self.queue.clear();
    }
}

impl<T, R> Subscription for Coordinator<T, R>
where
    T: Clone + Send + Sync + 'static,
    R: Send + 'static,
{
    fn request(&self, n: u64) {
        match demand::validate(n) {
            Ok(()) => {
                self.demand.add(n);
                self.drain();
            }
            Err(error) => {
                self.cancel_sources();
                self.inner_error(error);
            }
        }
    }

    fn cancel(&self) {
        if self.cancelled.swap(true, Ordering::AcqRel) {
            return;
        }
        self.cancel_sources();
        if self.wip.fetch_add(1, Ordering::AcqRel) == 0 {
            self.clear_queue();
        }
    }
}

struct CombineLatestInner<T, R> {
    index: usize,
    parent: Arc<Coordinator<T, R>>,
}

impl<T, R> Subscriber<T> for CombineLatestInner<T, R>
where
    T: Clone + Send + Sync + 'static,
    R: Send + 'static,
{
    fn on_subscribe(&self, upstream: SubscriptionHandle<T>) {
        // Installing the upstream drains the prefetch the coordinator
        // parked in this cell.
        self.parent.cells[self.index].set_once(upstream);
    }

    fn on_next(&self, value: T) {
        self.parent.inner_value(self.index, value);
    }

    fn on_error(&self, error: StreamError) {
        self.parent.inner_error(error);
    }

    fn on_complete(&self) {
        self.parent.inner_complete(self.index);
    }
}
