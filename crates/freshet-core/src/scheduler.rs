//! Worker adapter over an external executor.
//!
//! Operators never block and never spawn; time- and thread-shifting
//! operators compose over a [`Worker`], which adapts whatever executor the
//! embedder provides into an at-most-once, cancellable task scheduler.
//!
//! Every submission is wrapped in a [`ScheduledTask`] with a three-state
//! cell (*pending*, *finished*, *cancelled*). Completion and cancellation
//! race through a CAS: *finished* is absorbing against cancel, and a task
//! cancelled before its turn simply never runs. A panicking task is caught
//! at the wrapper and routed to the unsignalled sink.
//!
//! The worker's task set is guarded by the one lock this crate permits
//! itself; everything else in the core is lock-free.

use std::panic::{self, AssertUnwindSafe};
use std::sync::atomic::{AtomicU8, Ordering};
use std::sync::{Arc, Weak};

use parking_lot::Mutex;

use crate::error::StreamError;
use crate::hooks;

/// A unit of work accepted by an [`Executor`].
pub type Job = Box<dyn FnOnce() + Send + 'static>;

/// External executor collaborator.
///
/// The core places no requirements on ordering or parallelism; it only
/// assumes `execute` eventually runs the job on some thread.
pub trait Executor: Send + Sync {
    /// Hands `job` to the executor.
    fn execute(&self, job: Job);
}

/// Factory for [`Worker`]s over a shared executor.
pub struct ExecutorScheduler {
    executor: Arc<dyn Executor>,
}

impl ExecutorScheduler {
    /// Wraps `executor`.
    #[must_use]
    pub fn new(executor: Arc<dyn Executor>) -> Self {
        Self { executor }
    }

    /// Creates an independent worker.
    #[must_use]
    pub fn worker(&self) -> Worker {
        Worker {
            inner: Arc::new(WorkerInner {
                executor: Arc::clone(&self.executor),
                tasks: Mutex::new(Some(Vec::new())),
            }),
        }
    }
}

struct WorkerInner {
    executor: Arc<dyn Executor>,
    /// `None` once the worker terminated.
    tasks: Mutex<Option<Vec<Arc<ScheduledTask>>>>,
}

impl WorkerInner {
    fn add(&self, task: &Arc<ScheduledTask>) -> bool {
        let mut guard = self.tasks.lock();
        match guard.as_mut() {
            Some(tasks) => {
                tasks.push(Arc::clone(task));
                true
            }
            None => false,
        }
    }

    fn delete(&self, task: &Arc<ScheduledTask>) {
        let mut guard = self.tasks.lock();
        if let Some(tasks) = guard.as_mut() {
            if let Some(index) = tasks.iter().position(|t| Arc::ptr_eq(t, task)) {
                tasks.swap_remove(index);
            }
        }
    }
}

/// At-most-once cancellable wrapper around submitted tasks.
pub struct Worker {
    inner: Arc<WorkerInner>,
}

impl Worker {
    /// Submits `task` for execution.
    ///
    /// Returns a cancellation handle, or `None` when the worker has
    /// already terminated (the task is then discarded without running).
    pub fn submit(&self, task: Job) -> Option<Arc<ScheduledTask>> {
        let scheduled = Arc::new(ScheduledTask {
            state: AtomicU8::new(PENDING),
            job: Mutex::new(Some(task)),
            worker: Arc::downgrade(&self.inner),
        });

        if !self.inner.add(&scheduled) {
            return None;
        }

        let runner = Arc::clone(&scheduled);
        self.inner.executor.execute(Box::new(move || runner.run()));
        Some(scheduled)
    }

    /// Terminates the worker: further submissions are refused and every
    /// pending task is cancelled.
    pub fn shutdown(&self) {
        let drained = {
            let mut guard = self.inner.tasks.lock();
            guard.take()
        };
        let Some(tasks) = drained else {
            return;
        };
        tracing::debug!(pending = tasks.len(), "worker shutdown");
        for task in tasks {
            task.cancel();
        }
    }

    /// Returns `true` once the worker terminated.
    #[must_use]
    pub fn is_terminated(&self) -> bool {
        self.inner.tasks.lock().is_none()
    }
}

impl Drop for Worker {
    fn drop(&mut self) {
        self.shutdown();
    }
}

const PENDING: u8 = 0;
const FINISHED: u8 = 1;
const CANCELLED: u8 = 2;

/// A submitted task with its completion/cancellation cell.
pub struct ScheduledTask {
    state: AtomicU8,
    job: Mutex<Option<Job>>,
    worker: Weak<WorkerInner>,
}

impl ScheduledTask {
    fn run(self: &Arc<Self>) {
        if self.state.load(Ordering::Acquire) != PENDING {
            // Cancelled before the executor got to us.
            return;
        }

        let job = self.job.lock().take();
        if let Some(job) = job {
            if let Err(payload) = panic::catch_unwind(AssertUnwindSafe(job)) {
                let reason = payload
                    .downcast_ref::<&str>()
                    .map(ToString::to_string)
                    .or_else(|| payload.downcast_ref::<String>().cloned())
                    .unwrap_or_else(|| "scheduled task panicked".to_string());
                hooks::on_error_dropped(&StreamError::callback(reason));
            }
        }

        if self
            .state
            .compare_exchange(PENDING, FINISHED, Ordering::AcqRel, Ordering::Acquire)
            .is_ok()
        {
            if let Some(worker) = self.worker.upgrade() {
                worker.delete(self);
            }
        }
    }

    /// Cancels the task; a task that already finished stays finished.
    ///
    /// Returns `true` when this call performed the cancellation.
    pub fn cancel(&self) -> bool {
        self.state
            .compare_exchange(PENDING, CANCELLED, Ordering::AcqRel, Ordering::Acquire)
            .is_ok()
    }

    /// Returns `true` once the task ran to completion.
    #[must_use]
    pub fn is_finished(&self) -> bool {
        self.state.load(Ordering::Acquire) == FINISHED
    }

    /// Returns `true` once the task was cancelled before running.
    #[must_use]
    pub fn is_cancelled(&self) -> bool {
        self.state.load(Ordering::Acquire) == CANCELLED
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::AtomicUsize;
    use std::sync::mpsc;
    use std::thread;

    use super::*;
    use crate::testing::DropCapture;

    /// Runs jobs immediately on the calling thread.
    struct Inline;

    impl Executor for Inline {
        fn execute(&self, job: Job) {
            job();
        }
    }

    /// Parks jobs until the test releases them.
    struct Held {
        jobs: Mutex<Vec<Job>>,
    }

    impl Held {
        fn new() -> Arc<Self> {
            Arc::new(Self {
                jobs: Mutex::new(Vec::new()),
            })
        }

        fn release_all(&self) {
            let jobs: Vec<Job> = self.jobs.lock().drain(..).collect();
            for job in jobs {
                job();
            }
        }
    }

    impl Executor for Held {
        fn execute(&self, job: Job) {
            self.jobs.lock().push(job);
        }
    }

    #[test]
    fn test_task_runs() {
        let scheduler = ExecutorScheduler::new(Arc::new(Inline));
        let worker = scheduler.worker();

        let count = Arc::new(AtomicUsize::new(0));
        let seen = Arc::clone(&count);
        let task = worker
            .submit(Box::new(move || {
                seen.fetch_add(1, Ordering::SeqCst);
            }))
            .unwrap();

        assert_eq!(count.load(Ordering::SeqCst), 1);
        assert!(task.is_finished());
    }

    #[test]
    fn test_cancel_before_run_skips_task() {
        let held = Held::new();
        let scheduler = ExecutorScheduler::new(Arc::clone(&held) as Arc<dyn Executor>);
        let worker = scheduler.worker();

        let count = Arc::new(AtomicUsize::new(0));
        let seen = Arc::clone(&count);
        let task = worker
            .submit(Box::new(move || {
                seen.fetch_add(1, Ordering::SeqCst);
            }))
            .unwrap();

        assert!(task.cancel());
        held.release_all();

        assert_eq!(count.load(Ordering::SeqCst), 0);
        assert!(task.is_cancelled());
        // Finished never overwrites cancelled.
        assert!(!task.is_finished());
    }

    #[test]
    fn test_finished_absorbs_cancel() {
        let scheduler = ExecutorScheduler::new(Arc::new(Inline));
        let worker = scheduler.worker();

        let task = worker.submit(Box::new(|| {})).unwrap();
        assert!(task.is_finished());
        assert!(!task.cancel());
        assert!(task.is_finished());
    }

    #[test]
    fn test_shutdown_cancels_pending_and_refuses_new() {
        let held = Held::new();
        let scheduler = ExecutorScheduler::new(Arc::clone(&held) as Arc<dyn Executor>);
        let worker = scheduler.worker();

        let count = Arc::new(AtomicUsize::new(0));
        let seen = Arc::clone(&count);
        let task = worker
            .submit(Box::new(move || {
                seen.fetch_add(1, Ordering::SeqCst);
            }))
            .unwrap();

        worker.shutdown();
        assert!(worker.is_terminated());
        assert!(task.is_cancelled());

        assert!(worker.submit(Box::new(|| {})).is_none());

        held.release_all();
        assert_eq!(count.load(Ordering::SeqCst), 0);
    }

    #[test]
    fn test_panic_routed_to_sink() {
        let capture = DropCapture::install();

        let scheduler = ExecutorScheduler::new(Arc::new(Inline));
        let worker = scheduler.worker();
        let task = worker.submit(Box::new(|| panic!("task exploded"))).unwrap();

        assert!(task.is_finished());
        assert_eq!(
            capture.errors(),
            vec![StreamError::callback("task exploded")]
        );
    }

    #[test]
    fn test_thread_executor_end_to_end() {
        struct Spawning;
        impl Executor for Spawning {
            fn execute(&self, job: Job) {
                thread::spawn(job);
            }
        }

        let scheduler = ExecutorScheduler::new(Arc::new(Spawning));
        let worker = scheduler.worker();

        let (tx, rx) = mpsc::channel();
        worker
            .submit(Box::new(move || {
                tx.send(42).unwrap();
            }))
            .unwrap();

        assert_eq!(rx.recv().unwrap(), 42);
    }
}
