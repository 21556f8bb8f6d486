//! A cooperative task engine.
//!
//! Tasks are futures scheduled on a [`TaskProcessor`]: a fixed pool of
//! worker threads with work stealing, overload shedding of not-yet-started
//! tasks and cooperative cancellation observed at every suspension point.
//! The [`sync`] primitives are built on lock-free [`container`]s and
//! integrate with that cancellation; [`striped`] counters keep hot paths off
//! shared cache lines.

#[doc(inline)]
pub use coroengine_macros::main;

#[doc(inline)]
pub use coroengine_macros::test;

pub mod container;

mod context;

mod deadline;
pub use deadline::Deadline;

mod error;
pub use error::{SemaphoreError, TaskError, WaitError};

pub mod processor;
pub use processor::{TaskProcessor, spawn, spawn_builder, spawn_critical};

mod reactor;

pub mod striped;

pub mod sync;

pub mod task;
pub use task::Task;

pub mod time;

mod utils;

#[cfg(test)]
mod test_utils;
