//! Tasks: the unit of concurrent work scheduled on a
//! [`TaskProcessor`](crate::TaskProcessor).

mod context;
pub mod current_task;
mod handle;
mod id;
mod state;

pub(crate) use context::{BoxFuture, TaskContext};
pub(crate) use handle::ResultSlot;
pub use current_task::{CancellationBlocker, TaskWaker};
pub use handle::{Task, TaskWait};
pub use id::Id;
pub use state::{CancellationReason, Importance, State};

#[cfg(test)]
mod tests;
