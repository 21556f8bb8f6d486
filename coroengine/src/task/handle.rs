use crate::context;
use crate::deadline::Deadline;
use crate::error::{TaskError, WaitError};
use crate::sync::Awaitable;
use crate::sync::waiter::{Interrupts, Waiter};
use crate::task::context::TaskContext;
use crate::task::id::Id;
use crate::task::state::{CancellationReason, Importance, State};
use crate::utils::scope_guard::ScopeGuard;
use crate::utils::thread::ThreadUnparker;
use parking_lot::Mutex;
use std::fmt;
use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll};
use std::thread;
use std::time::Duration;

/// Where the task body leaves its outcome. A panic payload is kept so `get`
/// can report or re-raise it.
pub(crate) type ResultSlot<T> = Arc<Mutex<Option<thread::Result<T>>>>;

/// Owning handle of a spawned task.
///
/// The handle observes the task's lifecycle, waits for it and retrieves its
/// result. Dropping a handle of an unfinished task requests its cancellation
/// with [`CancellationReason::Abandoned`]; outside of a task it also blocks
/// until the task finished. Use [`Task::detach`] to let the task run on.
#[must_use = "dropping a task handle cancels the task"]
pub struct Task<T> {
    ctx: Arc<TaskContext>,
    result: ResultSlot<T>,

    /// Finish registration kept alive between `wait_any` polls.
    registration: Option<Arc<Waiter>>,
    detached: bool,
}

impl<T> Task<T> {
    pub(crate) fn new(ctx: Arc<TaskContext>, result: ResultSlot<T>) -> Self {
        Task {
            ctx,
            result,
            registration: None,
            detached: false,
        }
    }

    pub fn id(&self) -> Id {
        self.ctx.id()
    }

    pub fn state(&self) -> State {
        self.ctx.state()
    }

    pub fn importance(&self) -> Importance {
        self.ctx.importance()
    }

    pub fn is_finished(&self) -> bool {
        self.ctx.is_finished()
    }

    /// The first cancellation reason recorded for the task.
    pub fn cancellation_reason(&self) -> Option<CancellationReason> {
        self.ctx.cancellation_reason()
    }

    /// Asks the task to stop at its next cancellation point. Does not wait.
    pub fn request_cancel(&self) {
        self.ctx.request_cancel(CancellationReason::UserRequest);
    }

    /// Waits until the task finished.
    ///
    /// Fails with [`WaitError::Cancelled`] if the *calling* task is cancelled
    /// meanwhile; the awaited task is left untouched.
    pub fn wait(&self) -> TaskWait<'_> {
        TaskWait::new(&self.ctx, Interrupts::new(Deadline::unreachable()))
    }

    pub fn wait_for(&self, timeout: Duration) -> TaskWait<'_> {
        self.wait_until(Deadline::from_duration(timeout))
    }

    pub fn wait_until(&self, deadline: Deadline) -> TaskWait<'_> {
        TaskWait::new(&self.ctx, Interrupts::new(deadline))
    }

    /// Requests cancellation and waits for the task to finish, ignoring
    /// cancellation of the calling task.
    pub async fn cancel_and_wait(&self) {
        self.request_cancel();
        let wait = TaskWait::new(&self.ctx, Interrupts::non_cancellable(Deadline::unreachable()));
        // Neither cancellable nor timed, the wait can only succeed.
        let _ = wait.await;
    }

    /// Waits for the task and returns its result.
    ///
    /// A panic inside the task is returned as [`TaskError::Panicked`], see
    /// [`TaskError::into_panic`] to resume it.
    pub async fn get(self) -> Result<T, TaskError> {
        if let Err(err) = self.wait().await {
            let reason = match err {
                WaitError::Cancelled(reason) => reason,
                WaitError::Timeout => unreachable!("untimed wait timed out"),
            };
            return Err(TaskError::WaitInterrupted {
                id: self.id(),
                reason,
            });
        }
        self.take_result()
    }

    /// Lets the task run to completion on its own.
    pub fn detach(mut self) {
        self.detached = true;
    }

    /// Parks the calling OS thread until the task finished.
    pub(crate) fn block_until_finished(&self) {
        if self.ctx.is_finished() {
            return;
        }
        let waiter = Waiter::new();
        waiter.register(&ThreadUnparker::current());
        let _abandon = ScopeGuard::new(|| {
            waiter.abandon();
        });
        self.ctx.append_finish_waiter(Arc::clone(&waiter));

        while !self.ctx.is_finished() {
            thread::park();
        }
    }

    pub(crate) fn take_result(&self) -> Result<T, TaskError> {
        let id = self.id();
        match self.ctx.state() {
            State::Completed => match self.result.lock().take() {
                Some(Ok(value)) => Ok(value),
                Some(Err(payload)) => Err(TaskError::panicked(id, payload)),
                None => panic!("result of task {id} was already taken"),
            },
            State::Cancelled => Err(TaskError::Cancelled {
                id,
                reason: self
                    .ctx
                    .cancellation_reason()
                    .unwrap_or(CancellationReason::Shutdown),
            }),
            state => unreachable!("task {id} is {state}, its result is not ready"),
        }
    }
}

impl<T> Drop for Task<T> {
    fn drop(&mut self) {
        if let Some(waiter) = self.registration.take() {
            waiter.abandon();
        }
        if self.detached || self.ctx.is_finished() {
            return;
        }

        self.ctx.request_cancel(CancellationReason::Abandoned);

        // Blocking a worker could starve the very task we wait for.
        let worker = context::current_worker_index();
        if context::current_task().is_some() || worker.is_some() {
            tracing::trace!(task_id = %self.ctx.id(), ?worker, "unfinished task handle dropped inside a task");
            return;
        }
        self.block_until_finished();
    }
}

impl<T: Send> Awaitable for Task<T> {
    fn poll_ready(&mut self, cx: &mut Context<'_>) -> Poll<()> {
        self.ctx.poll_finished(&mut self.registration, cx)
    }

    fn unregister(&mut self) {
        if let Some(waiter) = self.registration.take() {
            waiter.abandon();
        }
    }
}

impl<T> fmt::Debug for Task<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Task")
            .field("id", &self.id())
            .field("state", &self.state())
            .field("detached", &self.detached)
            .finish()
    }
}

/// Future returned by [`Task::wait`] and friends.
#[must_use = "futures do nothing unless polled"]
pub struct TaskWait<'a> {
    ctx: &'a TaskContext,
    interrupts: Interrupts,
    waiter: Option<Arc<Waiter>>,
}

impl<'a> TaskWait<'a> {
    fn new(ctx: &'a TaskContext, interrupts: Interrupts) -> Self {
        TaskWait {
            ctx,
            interrupts,
            waiter: None,
        }
    }

    fn release(&mut self) {
        if let Some(waiter) = self.waiter.take() {
            waiter.abandon();
        }
    }
}

impl Future for TaskWait<'_> {
    type Output = Result<(), WaitError>;

    fn poll(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        let this = self.get_mut();

        if this.ctx.poll_finished(&mut this.waiter, cx).is_ready() {
            this.release();
            return Poll::Ready(Ok(()));
        }
        if let Some(err) = this.interrupts.poll(cx) {
            this.release();
            return Poll::Ready(Err(err));
        }
        Poll::Pending
    }
}

impl Drop for TaskWait<'_> {
    fn drop(&mut self) {
        self.release();
    }
}

impl fmt::Debug for TaskWait<'_> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TaskWait")
            .field("task", &self.ctx.id())
            .finish_non_exhaustive()
    }
}
