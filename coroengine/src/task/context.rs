use crate::context;
use crate::deadline::Deadline;
use crate::processor::{Handle, WeakHandle};
use crate::reactor::TimerHandle;
use crate::sync::wait_list::WaitList;
use crate::sync::waiter::{Decision, Waiter};
use crate::task::id::Id;
use crate::task::state::{
    AtomicCancellation, AtomicState, CancellationReason, Importance, State, Suspend, Wakeup,
};
use parking_lot::Mutex;
use std::fmt;
use std::future::Future;
use std::pin::Pin;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Weak};
use std::task::{Context, Poll, Wake, Waker};

pub(crate) type BoxFuture = Pin<Box<dyn Future<Output = ()> + Send + 'static>>;

/// The scheduled unit of work: lifecycle state, cancellation request, the
/// type-erased body and the list of parties waiting for it to finish.
///
/// Shared by the run queues, the processor's registry, the owning `Task`
/// handle and every waker handed out for it.
pub(crate) struct TaskContext {
    id: Id,
    importance: Importance,
    state: AtomicState,
    cancellation: AtomicCancellation,
    cancellable: AtomicBool,
    started: AtomicBool,

    /// Cancel deadline, armed on the reactor when the first step runs.
    deadline: Deadline,
    deadline_timer: Mutex<Option<TimerHandle>>,

    /// Only locked by the worker running a step, or by a forced cancellation
    /// of a task that is not running.
    future: Mutex<Option<BoxFuture>>,
    finish_waiters: WaitList,

    processor: WeakHandle,

    /// Enqueue time in nanoseconds since the processor epoch.
    queued_at: AtomicU64,
}

impl TaskContext {
    pub(crate) fn new(
        importance: Importance,
        deadline: Deadline,
        future: BoxFuture,
        processor: &Handle,
    ) -> Arc<Self> {
        Arc::new(TaskContext {
            id: Id::next(),
            importance,
            state: AtomicState::new(),
            cancellation: AtomicCancellation::new(),
            cancellable: AtomicBool::new(true),
            started: AtomicBool::new(false),
            deadline,
            deadline_timer: Mutex::new(None),
            future: Mutex::new(Some(future)),
            finish_waiters: WaitList::new(),
            processor: processor.downgrade(),
            queued_at: AtomicU64::new(0),
        })
    }

    pub(crate) fn id(&self) -> Id {
        self.id
    }

    pub(crate) fn importance(&self) -> Importance {
        self.importance
    }

    pub(crate) fn state(&self) -> State {
        self.state.load()
    }

    pub(crate) fn is_finished(&self) -> bool {
        self.state.is_finished()
    }

    /// Critical tasks, and tasks that already started, are never shed.
    pub(crate) fn is_critical(&self) -> bool {
        self.importance == Importance::Critical || self.started.load(Ordering::Relaxed)
    }

    pub(crate) fn cancellation_reason(&self) -> Option<CancellationReason> {
        self.cancellation.load()
    }

    /// Cancellation requested and not blocked.
    pub(crate) fn pending_cancellation(&self) -> Option<CancellationReason> {
        self.cancellation
            .load()
            .filter(|_| self.cancellable.load(Ordering::Relaxed))
    }

    /// Returns the previous setting.
    pub(crate) fn set_cancellable(&self, cancellable: bool) -> bool {
        self.cancellable.swap(cancellable, Ordering::Relaxed)
    }

    pub(crate) fn processor(&self) -> Option<Handle> {
        self.processor.upgrade()
    }

    pub(crate) fn mark_queued(&self, nanos: u64) {
        self.queued_at.store(nanos, Ordering::Relaxed);
    }

    pub(crate) fn queued_at(&self) -> u64 {
        self.queued_at.load(Ordering::Relaxed)
    }

    /// Records the first reason and wakes the task so its suspension point
    /// notices. A no-op once the task finished.
    pub(crate) fn request_cancel(self: &Arc<Self>, reason: CancellationReason) {
        if self.is_finished() {
            return;
        }
        if self.cancellation.request(reason) {
            tracing::trace!(task_id = %self.id, %reason, "task cancellation requested");
            self.wakeup();
        }
    }

    pub(crate) fn wakeup(self: &Arc<Self>) {
        if self.state.wakeup() == Wakeup::Schedule {
            self.reschedule();
        }
    }

    /// Hands the task to the processor for its very first step.
    pub(crate) fn enqueue_new(&self) {
        self.state.enqueue_new();
    }

    fn reschedule(self: &Arc<Self>) {
        match self.processor() {
            Some(processor) => processor.schedule(Arc::clone(self)),
            // Processor gone: nothing will ever poll the body again.
            None => self.force_cancel(),
        }
    }

    /// Executes one step on the calling worker thread.
    pub(crate) fn run(self: Arc<Self>) {
        if !self.state.start_step() {
            // Stale queue entry of a task that was force-cancelled.
            return;
        }
        let _current = context::enter_task(Arc::clone(&self));

        if !self.started.swap(true, Ordering::Relaxed) && !self.on_first_step() {
            return;
        }

        let waker = Waker::from(Arc::clone(&self));
        let mut cx = Context::from_waker(&waker);

        let mut slot = self.future.lock();
        let Some(future) = slot.as_mut() else {
            unreachable!("task {} is running without a body", self.id);
        };

        match future.as_mut().poll(&mut cx) {
            Poll::Ready(()) => {
                let future = slot.take();
                drop(slot);
                drop(future);
                self.finish(State::Completed);
            }
            Poll::Pending => {
                drop(slot);
                if self.state.end_step_pending() == Suspend::Requeue {
                    self.reschedule();
                }
            }
        }
    }

    /// Arms the cancel deadline and skips the body of a normal task that was
    /// cancelled while queued. Returns `false` if the task is done.
    fn on_first_step(self: &Arc<Self>) -> bool {
        if let Some(at) = self.deadline.instant() {
            if self.deadline.is_reached() {
                self.cancellation.request(CancellationReason::Deadline);
            } else if let Some(processor) = self.processor() {
                let canceller = Waker::from(Arc::new(DeadlineCanceller(Arc::downgrade(self))));
                *self.deadline_timer.lock() = Some(processor.reactor().add_timer(at, canceller));
            }
        }

        match self.cancellation.load() {
            Some(reason) if self.importance == Importance::Normal => {
                tracing::debug!(task_id = %self.id, %reason, "task cancelled before start");
                let future = self.future.lock().take();
                drop(future);
                self.finish(State::Cancelled);
                false
            }
            _ => true,
        }
    }

    /// Finishes a task that is not running by dropping its body.
    ///
    /// Used at processor shutdown and when a task outlives its processor.
    pub(crate) fn force_cancel(self: &Arc<Self>) {
        if !self.state.force_cancel() {
            return;
        }
        self.cancellation.request(CancellationReason::Shutdown);

        let future = self.future.lock().take();
        {
            let _current = context::enter_task(Arc::clone(self));
            drop(future);
        }
        self.on_finished(State::Cancelled);
    }

    fn finish(self: &Arc<Self>, state: State) {
        self.state.finish(state);
        self.on_finished(state);
    }

    fn on_finished(self: &Arc<Self>, state: State) {
        self.deadline_timer.lock().take();
        if let Some(processor) = self.processor() {
            processor.on_task_finished(self, state);
        }
        tracing::trace!(task_id = %self.id, %state, "task finished");
        self.finish_waiters.wakeup_all();
    }

    /// Readiness poll of "this task finished", reusing the waiter in `slot`
    /// across polls.
    #[track_caller]
    pub(crate) fn poll_finished(&self, slot: &mut Option<Arc<Waiter>>, cx: &Context<'_>) -> Poll<()> {
        if self.is_finished() {
            return Poll::Ready(());
        }
        self.assert_not_current();

        match slot {
            Some(waiter) if waiter.decision() == Decision::Waiting => waiter.register(cx.waker()),
            _ => {
                let waiter = Waiter::new();
                waiter.register(cx.waker());
                self.finish_waiters.append(Arc::clone(&waiter));
                *slot = Some(waiter);
            }
        }

        if self.is_finished() {
            Poll::Ready(())
        } else {
            Poll::Pending
        }
    }

    pub(crate) fn append_finish_waiter(&self, waiter: Arc<Waiter>) {
        self.finish_waiters.append(waiter);
    }

    #[track_caller]
    fn assert_not_current(&self) {
        let is_self = context::with_current_task(|current| current.id == self.id).unwrap_or(false);
        assert!(!is_self, "task {} waits for itself, this would deadlock", self.id);
    }
}

impl Wake for TaskContext {
    fn wake(self: Arc<Self>) {
        self.wakeup();
    }

    fn wake_by_ref(self: &Arc<Self>) {
        self.wakeup();
    }
}

impl fmt::Debug for TaskContext {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TaskContext")
            .field("id", &self.id)
            .field("importance", &self.importance)
            .field("state", &self.state())
            .field("cancellation", &self.cancellation_reason())
            .finish_non_exhaustive()
    }
}

/// Timer waker cancelling a task once its deadline fires.
struct DeadlineCanceller(Weak<TaskContext>);

impl Wake for DeadlineCanceller {
    fn wake(self: Arc<Self>) {
        if let Some(task) = self.0.upgrade() {
            task.request_cancel(CancellationReason::Deadline);
        }
    }
}
