//! Task-aware synchronization primitives.
//!
//! Every wait here suspends the calling task instead of blocking its worker
//! thread. Cancellable waits fail with [`WaitError::Cancelled`] once the
//! current task is asked to stop, deadline waits with [`WaitError::Timeout`].
//!
//! The queue-based primitives (mutexes, semaphore, task wait lists) keep their
//! waiter lists in plain single-threaded state driven by flat combining over
//! the intrusive MPSC queue, so no OS lock is ever taken on these paths.
//!
//! [`WaitError::Cancelled`]: crate::WaitError::Cancelled
//! [`WaitError::Timeout`]: crate::WaitError::Timeout

mod combiner;
mod event;
mod mutex;
mod semaphore;
mod shared_mutex;
mod single_waiting;
mod wait_any;
pub(crate) mod wait_list;
pub(crate) mod waiter;

// Public API
pub use event::{EventAwaitable, SingleConsumerEvent, SingleUseEvent};
pub use mutex::{Mutex, MutexGuard};
pub use semaphore::{Semaphore, SemaphoreLock};
pub use shared_mutex::{SharedMutex, SharedMutexReadGuard, SharedMutexWriteGuard};
pub use single_waiting::{SingleWaitingTaskMutex, SingleWaitingTaskMutexGuard};
pub use wait_any::{Awaitable, WaitAny, wait_any, wait_any_for, wait_any_until};
