//! Queries and controls for the task running on the calling thread.
//!
//! Everything here panics when called outside of a task unless documented
//! otherwise; the `try_` variants return `None` instead.

use crate::context;
use crate::error::WaitError;
use crate::task::context::TaskContext;
use crate::task::id::Id;
use crate::task::state::{CancellationReason, Importance};
use std::sync::{Arc, Weak};
use std::task::{Wake, Waker};

#[track_caller]
fn current() -> Arc<TaskContext> {
    let Some(task) = context::current_task() else {
        panic!("not called from a task");
    };
    task
}

#[track_caller]
pub fn id() -> Id {
    current().id()
}

pub fn try_id() -> Option<Id> {
    context::with_current_task(|task| task.id())
}

#[track_caller]
pub fn importance() -> Importance {
    current().importance()
}

/// Whether anyone asked the current task to stop, blocked or not.
#[track_caller]
pub fn is_cancel_requested() -> bool {
    current().cancellation_reason().is_some()
}

/// Whether the current task should stop now: a cancellation was requested
/// and no [`CancellationBlocker`] is active.
#[track_caller]
pub fn should_cancel() -> bool {
    current().pending_cancellation().is_some()
}

#[track_caller]
pub fn cancellation_reason() -> Option<CancellationReason> {
    current().cancellation_reason()
}

/// Explicit cancellation point for long-running loops that never suspend.
///
/// ```no_run
/// use coroengine::task::current_task;
///
/// # fn step() {}
/// # async fn run() -> Result<(), coroengine::WaitError> {
/// loop {
///     current_task::cancellation_point()?;
///     step();
/// }
/// # }
/// ```
#[track_caller]
pub fn cancellation_point() -> Result<(), WaitError> {
    match current().pending_cancellation() {
        Some(reason) => Err(WaitError::Cancelled(reason)),
        None => Ok(()),
    }
}

/// A handle that wakes the current task from anywhere, also after it
/// finished (then it does nothing).
#[track_caller]
pub fn waker() -> TaskWaker {
    TaskWaker(Arc::downgrade(&current()))
}

/// Cancellation state of the task polling on this thread, ignoring blocked
/// requests. `None` outside of tasks.
pub(crate) fn pending_cancellation() -> Option<CancellationReason> {
    context::with_current_task(|task| task.pending_cancellation()).flatten()
}

/// Makes the current task ignore cancellation while alive.
///
/// Requests made meanwhile are kept and observed again once the blocker is
/// dropped. Blockers nest.
#[must_use = "cancellation is unblocked again when the blocker is dropped"]
#[derive(Debug)]
pub struct CancellationBlocker {
    task: Arc<TaskContext>,
    was_cancellable: bool,
}

impl CancellationBlocker {
    #[track_caller]
    pub fn new() -> Self {
        let task = current();
        let was_cancellable = task.set_cancellable(false);
        CancellationBlocker {
            task,
            was_cancellable,
        }
    }
}

impl Default for CancellationBlocker {
    #[track_caller]
    fn default() -> Self {
        Self::new()
    }
}

impl Drop for CancellationBlocker {
    fn drop(&mut self) {
        self.task.set_cancellable(self.was_cancellable);
    }
}

/// Weak wakeup handle of a task.
#[derive(Debug, Clone)]
pub struct TaskWaker(Weak<TaskContext>);

impl TaskWaker {
    /// Schedules the task if it is suspended; makes its current step run
    /// once more if it is running.
    pub fn wake(&self) {
        if let Some(task) = self.0.upgrade() {
            task.wakeup();
        }
    }

    pub fn task_id(&self) -> Option<Id> {
        self.0.upgrade().map(|task| task.id())
    }
}

impl Wake for TaskWaker {
    fn wake(self: Arc<Self>) {
        TaskWaker::wake(&self);
    }

    fn wake_by_ref(self: &Arc<Self>) {
        TaskWaker::wake(self);
    }
}

impl From<TaskWaker> for Waker {
    fn from(waker: TaskWaker) -> Waker {
        Waker::from(Arc::new(waker))
    }
}
