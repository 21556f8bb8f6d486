//! Per-thread runtime context: which processor a worker thread belongs to and
//! which task is executing a step on the current thread.

use crate::processor::Handle;
use crate::task::TaskContext;
use crossbeam_deque::Worker as CbWorker;
use std::cell::RefCell;
use std::sync::Arc;

pub(crate) type LocalQueue = CbWorker<Arc<TaskContext>>;

/// State owned by a worker thread for its whole lifetime.
pub(crate) struct WorkerContext {
    pub(crate) processor: Handle,
    pub(crate) index: usize,

    /// FIFO queue for tasks woken on this worker, other workers steal from it.
    pub(crate) local: LocalQueue,
}

struct Context {
    worker: RefCell<Option<WorkerContext>>,
    current_task: RefCell<Option<Arc<TaskContext>>>,
}

thread_local! {
    static CONTEXT: Context = const {
        Context {
            worker: RefCell::new(None),
            current_task: RefCell::new(None),
        }
    };
}

/// Clears the worker context when the worker thread exits its event loop.
pub(crate) struct WorkerGuard(());

impl Drop for WorkerGuard {
    fn drop(&mut self) {
        let _ = CONTEXT.try_with(|ctx| ctx.worker.borrow_mut().take());
    }
}

#[track_caller]
pub(crate) fn enter_worker(worker: WorkerContext) -> WorkerGuard {
    CONTEXT.with(|ctx| {
        let mut slot = ctx.worker.borrow_mut();
        assert!(slot.is_none(), "thread is already a task processor worker");
        *slot = Some(worker);
    });
    WorkerGuard(())
}

/// Runs `f` with this thread's worker context, `None` off worker threads.
pub(crate) fn with_worker<F, R>(f: F) -> Option<R>
where
    F: FnOnce(&WorkerContext) -> R,
{
    CONTEXT
        .try_with(|ctx| ctx.worker.borrow().as_ref().map(f))
        .ok()
        .flatten()
}

pub(crate) fn is_worker_thread() -> bool {
    with_worker(|_| ()).is_some()
}

/// Index of the worker running on this thread.
pub(crate) fn current_worker_index() -> Option<usize> {
    with_worker(|w| w.index)
}

/// The processor driving the current thread or the current task.
pub(crate) fn current_processor() -> Option<Handle> {
    with_worker(|w| w.processor.clone())
        .or_else(|| with_current_task(|task| task.processor()).flatten())
}

/// Restores the previously running task when a step ends.
pub(crate) struct TaskGuard {
    prev: Option<Arc<TaskContext>>,
}

impl Drop for TaskGuard {
    fn drop(&mut self) {
        let prev = self.prev.take();
        let _ = CONTEXT.try_with(|ctx| *ctx.current_task.borrow_mut() = prev);
    }
}

pub(crate) fn enter_task(task: Arc<TaskContext>) -> TaskGuard {
    let prev = CONTEXT.with(|ctx| ctx.current_task.borrow_mut().replace(task));
    TaskGuard { prev }
}

pub(crate) fn current_task() -> Option<Arc<TaskContext>> {
    CONTEXT
        .try_with(|ctx| ctx.current_task.borrow().clone())
        .ok()
        .flatten()
}

/// Runs `f` on the task executing on this thread, if any.
pub(crate) fn with_current_task<F, R>(f: F) -> Option<R>
where
    F: FnOnce(&Arc<TaskContext>) -> R,
{
    CONTEXT
        .try_with(|ctx| ctx.current_task.borrow().as_ref().map(f))
        .ok()
        .flatten()
}
