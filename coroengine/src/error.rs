use crate::task::{CancellationReason, Id};
use parking_lot::Mutex;
use std::any::Any;
use std::fmt;

/// Why a suspending call returned before it got what it waited for.
#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
pub enum WaitError {
    /// The waiting task was asked to stop.
    #[error("wait interrupted: current task cancelled ({0})")]
    Cancelled(CancellationReason),

    /// The deadline passed first.
    #[error("wait timed out")]
    Timeout,
}

impl WaitError {
    pub fn is_cancelled(&self) -> bool {
        matches!(self, WaitError::Cancelled(_))
    }

    pub fn is_timeout(&self) -> bool {
        matches!(self, WaitError::Timeout)
    }
}

/// Failure retrieving a task's result through [`Task::get`].
///
/// [`Task::get`]: crate::task::Task::get
#[derive(thiserror::Error)]
pub enum TaskError {
    /// The task ended in the `Cancelled` state, its body did not produce a value.
    #[error("task {id} was cancelled ({reason})")]
    Cancelled { id: Id, reason: CancellationReason },

    /// The task body panicked. The payload can be resumed with
    /// [`std::panic::resume_unwind`], see [`TaskError::into_panic`].
    #[error("task {id} panicked: {message}")]
    Panicked {
        id: Id,
        message: String,
        /// Locked only to keep the error `Sync`.
        payload: Mutex<Box<dyn Any + Send + 'static>>,
    },

    /// The caller was cancelled while waiting for the task.
    #[error("waiting for task {id} was interrupted ({reason})")]
    WaitInterrupted { id: Id, reason: CancellationReason },
}

impl TaskError {
    pub(crate) fn panicked(id: Id, payload: Box<dyn Any + Send + 'static>) -> Self {
        TaskError::Panicked {
            id,
            message: panic_payload_as_str(&payload).unwrap_or("<non-string payload>").to_owned(),
            payload: Mutex::new(payload),
        }
    }

    pub fn is_cancelled(&self) -> bool {
        matches!(self, TaskError::Cancelled { .. })
    }

    pub fn is_panic(&self) -> bool {
        matches!(self, TaskError::Panicked { .. })
    }

    pub fn is_wait_interrupted(&self) -> bool {
        matches!(self, TaskError::WaitInterrupted { .. })
    }

    /// Consumes the error, returning the panic payload.
    ///
    /// # Panics
    ///
    /// Panics if the error does not represent a panic.
    #[track_caller]
    pub fn into_panic(self) -> Box<dyn Any + Send + 'static> {
        match self {
            TaskError::Panicked { payload, .. } => payload.into_inner(),
            other => panic!("`TaskError` is not a panic: {other}"),
        }
    }
}

impl fmt::Debug for TaskError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TaskError::Cancelled { id, reason } => f
                .debug_struct("Cancelled")
                .field("id", id)
                .field("reason", reason)
                .finish(),
            TaskError::Panicked { id, message, .. } => f
                .debug_struct("Panicked")
                .field("id", id)
                .field("message", message)
                .finish_non_exhaustive(),
            TaskError::WaitInterrupted { id, reason } => f
                .debug_struct("WaitInterrupted")
                .field("id", id)
                .field("reason", reason)
                .finish(),
        }
    }
}

/// Failure acquiring tokens from a [`Semaphore`](crate::sync::Semaphore).
#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
pub enum SemaphoreError {
    #[error("cannot acquire {requested} tokens from a semaphore of capacity {capacity}")]
    Unreachable { requested: usize, capacity: usize },

    #[error(transparent)]
    Wait(#[from] WaitError),
}

pub(crate) fn panic_payload_as_str(payload: &Box<dyn Any + Send>) -> Option<&str> {
    if let Some(s) = payload.downcast_ref::<&'static str>() {
        return Some(s);
    }
    payload.downcast_ref::<String>().map(String::as_str)
}
