use std::fmt;
use std::sync::atomic::{AtomicU8, Ordering};

/// Observable lifecycle state of a task.
///
/// `New -> Queued -> Running -> (Suspended -> Queued -> Running)* -> Completed | Cancelled`.
/// A task that is cancelled before its first step goes straight from `Queued`
/// to `Cancelled`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum State {
    New,
    Queued,
    Running,
    Suspended,
    Cancelled,
    Completed,
}

impl State {
    pub fn is_finished(self) -> bool {
        matches!(self, State::Cancelled | State::Completed)
    }
}

impl fmt::Display for State {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            State::New => "new",
            State::Queued => "queued",
            State::Running => "running",
            State::Suspended => "suspended",
            State::Cancelled => "cancelled",
            State::Completed => "completed",
        };
        f.write_str(s)
    }
}

/// Why a task was asked to stop.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum CancellationReason {
    /// Explicit `request_cancel` on the task handle.
    UserRequest = 1,
    /// The task's cancellation deadline passed.
    Deadline = 2,
    /// The processor was overloaded when the task was about to start.
    Overload = 3,
    /// The owning `Task` handle was dropped.
    Abandoned = 4,
    /// The processor is shutting down.
    Shutdown = 5,
}

impl CancellationReason {
    fn from_u8(raw: u8) -> Option<Self> {
        match raw {
            1 => Some(CancellationReason::UserRequest),
            2 => Some(CancellationReason::Deadline),
            3 => Some(CancellationReason::Overload),
            4 => Some(CancellationReason::Abandoned),
            5 => Some(CancellationReason::Shutdown),
            _ => None,
        }
    }
}

impl fmt::Display for CancellationReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            CancellationReason::UserRequest => "user request",
            CancellationReason::Deadline => "deadline",
            CancellationReason::Overload => "task processor overload",
            CancellationReason::Abandoned => "task handle dropped",
            CancellationReason::Shutdown => "task processor shutdown",
        };
        f.write_str(s)
    }
}

/// Scheduling importance of a task.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Importance {
    #[default]
    Normal,
    /// Always starts, even when the processor is overloaded or the task was
    /// cancelled while queued.
    Critical,
}

// Raw lifecycle encoding. `RUNNING_NOTIFIED` is `Running` with a wakeup that
// arrived during the step, the task requeues itself instead of suspending.
const NEW: u8 = 0;
const QUEUED: u8 = 1;
const RUNNING: u8 = 2;
const RUNNING_NOTIFIED: u8 = 3;
const SUSPENDED: u8 = 4;
const CANCELLED: u8 = 5;
const COMPLETED: u8 = 6;

/// Outcome of a wakeup applied to the lifecycle state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Wakeup {
    /// The task was suspended and now must be pushed on a queue.
    Schedule,
    /// Nothing to do: already queued, running, new or finished.
    Absorbed,
}

/// Outcome of a step that returned `Pending`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Suspend {
    Suspended,
    /// A wakeup arrived during the step, the task is `Queued` again.
    Requeue,
}

#[derive(Debug)]
pub(crate) struct AtomicState(AtomicU8);

impl AtomicState {
    pub(crate) fn new() -> Self {
        AtomicState(AtomicU8::new(NEW))
    }

    pub(crate) fn load(&self) -> State {
        match self.0.load(Ordering::Acquire) {
            NEW => State::New,
            QUEUED => State::Queued,
            RUNNING | RUNNING_NOTIFIED => State::Running,
            SUSPENDED => State::Suspended,
            CANCELLED => State::Cancelled,
            COMPLETED => State::Completed,
            raw => unreachable!("invalid task state {raw}"),
        }
    }

    pub(crate) fn is_finished(&self) -> bool {
        matches!(self.0.load(Ordering::Acquire), CANCELLED | COMPLETED)
    }

    /// `New -> Queued`, done once by the processor that accepts the task.
    #[track_caller]
    pub(crate) fn enqueue_new(&self) {
        let prev = self.0.swap(QUEUED, Ordering::AcqRel);
        assert_eq!(prev, NEW, "task scheduled twice");
    }

    /// `Queued -> Running`. Fails for stale queue entries of finished tasks.
    pub(crate) fn start_step(&self) -> bool {
        self.0
            .compare_exchange(QUEUED, RUNNING, Ordering::AcqRel, Ordering::Acquire)
            .is_ok()
    }

    pub(crate) fn end_step_pending(&self) -> Suspend {
        match self
            .0
            .compare_exchange(RUNNING, SUSPENDED, Ordering::AcqRel, Ordering::Acquire)
        {
            Ok(_) => Suspend::Suspended,
            Err(RUNNING_NOTIFIED) => {
                self.0.store(QUEUED, Ordering::Release);
                Suspend::Requeue
            }
            Err(raw) => unreachable!("task left the running state during a step: {raw}"),
        }
    }

    pub(crate) fn wakeup(&self) -> Wakeup {
        let mut current = self.0.load(Ordering::Acquire);
        loop {
            let next = match current {
                SUSPENDED => QUEUED,
                RUNNING => RUNNING_NOTIFIED,
                _ => return Wakeup::Absorbed,
            };
            match self
                .0
                .compare_exchange_weak(current, next, Ordering::AcqRel, Ordering::Acquire)
            {
                Ok(_) if next == QUEUED => return Wakeup::Schedule,
                Ok(_) => return Wakeup::Absorbed,
                Err(actual) => current = actual,
            }
        }
    }

    /// Terminal transition at the end of the running step.
    pub(crate) fn finish(&self, state: State) {
        let raw = match state {
            State::Completed => COMPLETED,
            State::Cancelled => CANCELLED,
            other => panic!("{other} is not a terminal state"),
        };
        self.0.store(raw, Ordering::Release);
    }

    /// Moves a task that is not running straight to `Cancelled`.
    ///
    /// Returns `false` if the task is running or already finished.
    pub(crate) fn force_cancel(&self) -> bool {
        let mut current = self.0.load(Ordering::Acquire);
        loop {
            if !matches!(current, NEW | QUEUED | SUSPENDED) {
                return false;
            }
            match self
                .0
                .compare_exchange_weak(current, CANCELLED, Ordering::AcqRel, Ordering::Acquire)
            {
                Ok(_) => return true,
                Err(actual) => current = actual,
            }
        }
    }
}

/// Cancellation request slot. Set at most once; the first reason wins.
#[derive(Debug)]
pub(crate) struct AtomicCancellation(AtomicU8);

impl AtomicCancellation {
    pub(crate) fn new() -> Self {
        AtomicCancellation(AtomicU8::new(0))
    }

    pub(crate) fn load(&self) -> Option<CancellationReason> {
        CancellationReason::from_u8(self.0.load(Ordering::Acquire))
    }

    /// Returns `true` if this call set the reason.
    pub(crate) fn request(&self, reason: CancellationReason) -> bool {
        self.0
            .compare_exchange(0, reason as u8, Ordering::AcqRel, Ordering::Acquire)
            .is_ok()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rstest::rstest;

    #[test]
    fn test_step_lifecycle() {
        let state = AtomicState::new();
        assert_eq!(state.load(), State::New);

        state.enqueue_new();
        assert!(state.start_step());
        assert_eq!(state.load(), State::Running);
        assert!(!state.start_step());

        assert_eq!(state.end_step_pending(), Suspend::Suspended);
        assert_eq!(state.load(), State::Suspended);

        assert_eq!(state.wakeup(), Wakeup::Schedule);
        assert_eq!(state.wakeup(), Wakeup::Absorbed);
        assert_eq!(state.load(), State::Queued);

        assert!(state.start_step());
        state.finish(State::Completed);
        assert!(state.is_finished());
        assert_eq!(state.wakeup(), Wakeup::Absorbed);
        assert!(!state.force_cancel());
    }

    #[test]
    fn test_wakeup_during_step_requeues() {
        let state = AtomicState::new();
        state.enqueue_new();
        assert!(state.start_step());

        assert_eq!(state.wakeup(), Wakeup::Absorbed);
        assert_eq!(state.wakeup(), Wakeup::Absorbed);
        assert_eq!(state.load(), State::Running);

        assert_eq!(state.end_step_pending(), Suspend::Requeue);
        assert_eq!(state.load(), State::Queued);
    }

    #[rstest]
    #[case::new(false, false, true)]
    #[case::queued(true, false, true)]
    #[case::running(true, true, false)]
    fn test_force_cancel(#[case] enqueue: bool, #[case] start: bool, #[case] expected: bool) {
        let state = AtomicState::new();
        if enqueue {
            state.enqueue_new();
        }
        if start {
            assert!(state.start_step());
        }
        assert_eq!(state.force_cancel(), expected);
        assert_eq!(state.is_finished(), expected);
    }

    #[test]
    fn test_first_cancellation_reason_wins() {
        let slot = AtomicCancellation::new();
        assert_eq!(slot.load(), None);

        assert!(slot.request(CancellationReason::Deadline));
        assert!(!slot.request(CancellationReason::UserRequest));
        assert_eq!(slot.load(), Some(CancellationReason::Deadline));
    }
}
