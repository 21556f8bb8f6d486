//! The task processor: a fixed pool of worker threads running task steps
//! from a global injector queue and per-worker FIFO queues, with work
//! stealing, overload shedding and an orderly shutdown.

use crate::context;
use crate::deadline::Deadline;
use crate::error::panic_payload_as_str;
use crate::reactor::Reactor;
use crate::striped::StripedReadIndicator;
use crate::task::{
    BoxFuture, CancellationReason, Id, Importance, ResultSlot, State, Task, TaskContext,
    current_task,
};
use anyhow::Result;
use crossbeam_deque::{Injector, Steal};
use crossbeam_utils::Backoff;
use dashmap::DashMap;
use futures::FutureExt;
use parking_lot::Mutex;
use std::fmt;
use std::future::Future;
use std::ops::Deref;
use std::panic::{self, AssertUnwindSafe};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering, fence};
use std::sync::{Arc, Weak};
use std::time::Instant;

#[cfg(test)]
use crate::utils::tracker::{Call, Method, Tracker};

mod builder;
mod counter;
mod pool;
mod shared;
mod spawn;
mod ticker;
mod worker;

// Public API
pub use builder::{Builder, OverloadAction};
pub use counter::TaskProcessorStats;
pub use spawn::{SpawnBuilder, spawn, spawn_builder, spawn_critical};

pub(crate) use builder::{ProcessorConfig, ThreadNameFn};
use counter::TaskCounters;
use pool::ThreadPool;
use shared::Shared;

/// Overload warnings after the first one are logged once per this many.
const OVERLOAD_LOG_PERIOD: usize = 1024;

/// Owner of a running processor. Dropping it shuts the processor down.
///
/// ```no_run
/// use coroengine::TaskProcessor;
///
/// # fn main() -> anyhow::Result<()> {
/// let processor = TaskProcessor::builder().worker_threads(4).try_build()?;
///
/// let answer = processor.block_on(async {
///     let task = coroengine::spawn(async { 40 + 2 });
///     task.get().await
/// })?;
/// assert_eq!(answer, 42);
///
/// processor.shutdown()
/// # }
/// ```
pub struct TaskProcessor {
    handle: Handle,
    pool: ThreadPool,
}

impl TaskProcessor {
    pub fn builder() -> Builder {
        Builder::new()
    }

    pub(crate) fn start(handle: Handle) -> Result<Self> {
        match ThreadPool::spawn(&handle) {
            Ok(pool) => Ok(TaskProcessor { handle, pool }),
            Err(err) => {
                if let Err(reactor_err) = handle.reactor.shutdown() {
                    tracing::error!(error = ?reactor_err, "failed to stop the reactor");
                }
                Err(err)
            }
        }
    }

    /// Spawns a normal importance task.
    pub fn spawn<F>(&self, future: F) -> Task<F::Output>
    where
        F: Future + Send + 'static,
        F::Output: Send + 'static,
    {
        self.handle.spawn(future, Importance::Normal, Deadline::unreachable())
    }

    /// Spawns a task that is never shed for overload.
    pub fn spawn_critical<F>(&self, future: F) -> Task<F::Output>
    where
        F: Future + Send + 'static,
        F::Output: Send + 'static,
    {
        self.handle.spawn(future, Importance::Critical, Deadline::unreachable())
    }

    pub fn spawn_builder(&self) -> SpawnBuilder {
        SpawnBuilder::on(self.handle.clone())
    }

    /// Runs `future` as a critical task and blocks the calling thread until it
    /// finished. A panic in the future is resumed on the caller.
    ///
    /// # Panics
    ///
    /// Panics when called from a task or a worker thread, that would block
    /// the thread the future may need.
    #[track_caller]
    pub fn block_on<F>(&self, future: F) -> F::Output
    where
        F: Future + Send + 'static,
        F::Output: Send + 'static,
    {
        assert!(
            context::current_task().is_none() && !context::is_worker_thread(),
            "block_on must not be called from a task processor thread"
        );

        let task = self.spawn_critical(future);
        task.block_until_finished();
        match task.take_result() {
            Ok(value) => value,
            Err(err) if err.is_panic() => panic::resume_unwind(err.into_panic()),
            Err(err) => panic!("block_on future did not complete: {err}"),
        }
    }

    pub fn stats(&self) -> TaskProcessorStats {
        self.handle.stats()
    }

    pub fn worker_threads(&self) -> usize {
        self.handle.cfg.worker_threads
    }

    /// Stops the processor.
    ///
    /// New spawns are cancelled right away and every live task is cancelled
    /// with [`CancellationReason::Shutdown`]. Workers run until their queues
    /// are empty and are joined; tasks still suspended after that are dropped
    /// without running again and end `Cancelled`.
    pub fn shutdown(self) -> Result<()> {
        self.shutdown_inner()
    }

    fn shutdown_inner(&self) -> Result<()> {
        let inner = &self.handle;
        if inner.shutting_down.swap(true, Ordering::SeqCst) {
            return Ok(());
        }
        assert!(
            !inner.is_current_worker(),
            "a task processor cannot be shut down from its own worker thread"
        );

        // Wait for spawns that started before the flag flipped.
        let backoff = Backoff::new();
        while !inner.spawn_indicator.is_free() {
            backoff.snooze();
        }

        let live = inner.live_tasks();
        tracing::debug!(live = live.len(), "shutting down task processor");
        for task in &live {
            task.request_cancel(CancellationReason::Shutdown);
        }
        drop(live);

        inner.shared.shutdown.store(true, Ordering::Release);
        inner.shared.unpark_all();
        let joined = self.pool.join_all();

        inner.stopped.store(true, Ordering::SeqCst);
        let leftover = inner.live_tasks();
        if !leftover.is_empty() {
            tracing::debug!(leftover = leftover.len(), "dropping suspended tasks");
        }
        for task in leftover {
            task.force_cancel();
        }
        inner.drain_injector();

        let stopped = inner.reactor.shutdown();
        tracing::debug!("task processor stopped");
        joined.and(stopped)
    }

    #[cfg(test)]
    pub(crate) fn handle(&self) -> &Handle {
        &self.handle
    }
}

impl Drop for TaskProcessor {
    fn drop(&mut self) {
        if let Err(e) = self.shutdown_inner() {
            tracing::error!(error = ?e, "error during task processor shutdown");
        }
    }
}

impl fmt::Debug for TaskProcessor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TaskProcessor")
            .field("handle", &self.handle)
            .finish_non_exhaustive()
    }
}

/// Shared reference to a processor's state, held by workers and spawners.
#[derive(Clone)]
pub(crate) struct Handle(Arc<Inner>);

/// Back-link from a task to its processor.
#[derive(Clone, Debug)]
pub(crate) struct WeakHandle(Weak<Inner>);

impl WeakHandle {
    pub(crate) fn upgrade(&self) -> Option<Handle> {
        self.0.upgrade().map(Handle)
    }
}

impl Deref for Handle {
    type Target = Inner;

    fn deref(&self) -> &Inner {
        &self.0
    }
}

impl fmt::Debug for Handle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Handle")
            .field("worker_threads", &self.cfg.worker_threads)
            .field("live_tasks", &self.tasks.len())
            .field("queued", &self.queued.load(Ordering::Relaxed))
            .field("shutting_down", &self.shutting_down.load(Ordering::Relaxed))
            .finish()
    }
}

pub(crate) struct Inner {
    pub(crate) cfg: ProcessorConfig,

    /// Global queue for new tasks and wakeups from outside the workers.
    pub(crate) injector: Injector<Arc<TaskContext>>,

    pub(crate) shared: Shared,

    /// Every live task, for shutdown.
    tasks: DashMap<Id, Arc<TaskContext>>,
    counters: TaskCounters,

    /// Held by in-flight spawns so shutdown knows when none is left.
    spawn_indicator: StripedReadIndicator,

    reactor: Reactor,

    /// Approximate number of queued task steps.
    queued: AtomicUsize,
    overloaded: AtomicBool,
    overload_events: AtomicUsize,

    /// Reference point of task enqueue timestamps.
    epoch: Instant,

    shutting_down: AtomicBool,
    stopped: AtomicBool,

    #[cfg(test)]
    pub(crate) tracker: Tracker,
}

impl Handle {
    pub(crate) fn new(cfg: ProcessorConfig) -> Result<Self> {
        let reactor = Reactor::new(cfg.timer_threads, "coro-timer")?;

        Ok(Handle(Arc::new(Inner {
            injector: Injector::new(),
            shared: Shared::new(cfg.worker_threads),
            tasks: DashMap::new(),
            counters: TaskCounters::default(),
            spawn_indicator: StripedReadIndicator::new(),
            reactor,
            queued: AtomicUsize::new(0),
            overloaded: AtomicBool::new(false),
            overload_events: AtomicUsize::new(0),
            epoch: Instant::now(),
            shutting_down: AtomicBool::new(false),
            stopped: AtomicBool::new(false),
            #[cfg(test)]
            tracker: Tracker::new(),
            cfg,
        })))
    }

    pub(crate) fn downgrade(&self) -> WeakHandle {
        WeakHandle(Arc::downgrade(&self.0))
    }

    pub(crate) fn ptr_eq(&self, other: &Inner) -> bool {
        std::ptr::eq(Arc::as_ptr(&self.0), other)
    }

    /// Wraps the future into a task body that stores its outcome, then hands
    /// the task to the run queues.
    pub(crate) fn spawn<F>(&self, future: F, importance: Importance, deadline: Deadline) -> Task<F::Output>
    where
        F: Future + Send + 'static,
        F::Output: Send + 'static,
    {
        let result: ResultSlot<F::Output> = Arc::new(Mutex::new(None));

        let body: BoxFuture = {
            let result = Arc::clone(&result);
            Box::pin(async move {
                let outcome = AssertUnwindSafe(future).catch_unwind().await;
                if let Err(payload) = &outcome {
                    tracing::debug!(
                        task_id = %current_task::id(),
                        panic = panic_payload_as_str(payload).unwrap_or("<non-string payload>"),
                        "task body panicked"
                    );
                }
                *result.lock() = Some(outcome);
            })
        };

        let ctx = TaskContext::new(importance, deadline, body, self);
        let task = Task::new(Arc::clone(&ctx), result);
        self.submit_new(ctx);
        task
    }

    fn submit_new(&self, task: Arc<TaskContext>) {
        let _spawning = self.spawn_indicator.lock();

        if self.shutting_down.load(Ordering::SeqCst) {
            task.request_cancel(CancellationReason::Shutdown);
        }

        self.tasks.insert(task.id(), Arc::clone(&task));
        self.counters.on_created();
        tracing::trace!(task_id = %task.id(), importance = ?task.importance(), "task spawned");

        #[cfg(test)]
        self.tracker.record(
            Method::Spawn,
            Call::Spawn {
                id: task.id(),
                importance: task.importance(),
            },
        );

        task.enqueue_new();
        if !task.is_critical() && self.is_overloaded() {
            self.on_overload(&task);
        }
        self.schedule(task);
    }
}

impl Inner {
    pub(crate) fn reactor(&self) -> &Reactor {
        &self.reactor
    }

    /// Pushes a queued task to the local queue when called on one of this
    /// processor's workers, to the injector otherwise, and wakes an idle
    /// worker.
    pub(crate) fn schedule(&self, task: Arc<TaskContext>) {
        if self.stopped.load(Ordering::SeqCst) {
            task.force_cancel();
            return;
        }

        task.mark_queued(self.now_nanos());
        self.queued.fetch_add(1, Ordering::Relaxed);

        let mut pending = Some(task);
        context::with_worker(|worker| {
            if worker.processor.ptr_eq(self)
                && let Some(task) = pending.take()
            {
                tracing::trace!(task_id = %task.id(), worker = worker.index, "task queued locally");
                worker.local.push(task);
            }
        });
        if let Some(task) = pending {
            self.injector.push(task);
        }

        fence(Ordering::SeqCst);
        self.shared.unpark_one();
    }

    /// Called by a worker for every task it pops, before running it.
    pub(crate) fn on_dequeued(&self, task: &TaskContext) {
        self.queued.fetch_sub(1, Ordering::Relaxed);

        let Some(max_wait) = self.cfg.max_queue_wait_time else {
            return;
        };
        let waited = self.now_nanos().saturating_sub(task.queued_at());
        let overloaded = u128::from(waited) > max_wait.as_nanos();

        if self.overloaded.swap(overloaded, Ordering::Relaxed) != overloaded {
            if overloaded {
                tracing::warn!(waited_us = waited / 1_000, "task processor entered overload");
            } else {
                tracing::debug!("task processor left overload");
            }
        }
    }

    pub(crate) fn on_task_finished(&self, task: &TaskContext, state: State) {
        self.tasks.remove(&task.id());
        let reason = task.cancellation_reason();
        self.counters.on_finished(state, reason);

        #[cfg(test)]
        self.tracker.record(
            Method::Finish,
            Call::Finish {
                id: task.id(),
                cancelled: state == State::Cancelled,
            },
        );
    }

    fn is_overloaded(&self) -> bool {
        let too_long = self
            .cfg
            .max_queue_length
            .is_some_and(|max| self.queued.load(Ordering::Relaxed) >= max);
        too_long || self.overloaded.load(Ordering::Relaxed)
    }

    fn on_overload(&self, task: &Arc<TaskContext>) {
        let cancel = self.cfg.overload_action == OverloadAction::Cancel;
        if cancel {
            task.request_cancel(CancellationReason::Overload);
        }

        let events = self.overload_events.fetch_add(1, Ordering::Relaxed);
        if events.is_multiple_of(OVERLOAD_LOG_PERIOD) {
            tracing::warn!(
                task_id = %task.id(),
                queued = self.queued.load(Ordering::Relaxed),
                cancel,
                events = events + 1,
                "task processor overloaded"
            );
        }

        #[cfg(test)]
        self.tracker.record(
            Method::Overload,
            Call::Overload {
                id: task.id(),
                cancelled: cancel,
            },
        );
    }

    fn is_current_worker(&self) -> bool {
        context::with_worker(|worker| worker.processor.ptr_eq(self)).unwrap_or(false)
    }

    fn live_tasks(&self) -> Vec<Arc<TaskContext>> {
        self.tasks.iter().map(|entry| Arc::clone(entry.value())).collect()
    }

    fn drain_injector(&self) {
        loop {
            match self.injector.steal() {
                Steal::Success(task) => {
                    self.queued.fetch_sub(1, Ordering::Relaxed);
                    task.force_cancel();
                }
                Steal::Retry => continue,
                Steal::Empty => break,
            }
        }
    }

    fn stats(&self) -> TaskProcessorStats {
        self.counters.snapshot(self.queued.load(Ordering::Relaxed))
    }

    fn now_nanos(&self) -> u64 {
        u64::try_from(self.epoch.elapsed().as_nanos()).unwrap_or(u64::MAX)
    }
}

#[cfg(test)]
mod tests;
