//! Functions and types for spawning tasks.
//!
//! [`spawn()`] and [`spawn_critical()`] use the processor of the calling
//! task or worker thread. [`SpawnBuilder`] additionally sets a cancel
//! deadline or targets a specific [`TaskProcessor`].
//!
//! [`TaskProcessor`]: crate::TaskProcessor

use crate::context;
use crate::deadline::Deadline;
use crate::processor::Handle;
use crate::task::{Importance, Task};
use std::future::Future;
use std::time::Duration;

/// Spawns a normal importance task on the current processor.
///
/// # Panics
///
/// Panics outside of a task processor.
#[track_caller]
pub fn spawn<F>(future: F) -> Task<F::Output>
where
    F: Future + Send + 'static,
    F::Output: Send + 'static,
{
    spawn_builder().spawn(future)
}

/// Spawns a task that is never shed for overload and always starts, even if
/// it was cancelled while queued.
#[track_caller]
pub fn spawn_critical<F>(future: F) -> Task<F::Output>
where
    F: Future + Send + 'static,
    F::Output: Send + 'static,
{
    spawn_builder().importance(Importance::Critical).spawn(future)
}

/// Creates a [`SpawnBuilder`] targeting the current processor.
///
/// ```no_run
/// use coroengine::task::Importance;
/// use std::time::Duration;
///
/// # async fn run() {
/// let task = coroengine::spawn_builder()
///     .importance(Importance::Critical)
///     .deadline_after(Duration::from_secs(1))
///     .spawn(async { 42 });
/// # }
/// ```
pub fn spawn_builder() -> SpawnBuilder {
    SpawnBuilder::default()
}

/// Task options applied at spawn time.
#[derive(Debug, Default)]
#[must_use = "a spawn builder does nothing until `spawn` is called"]
pub struct SpawnBuilder {
    /// `None` resolves to the current processor at spawn time.
    processor: Option<Handle>,
    importance: Importance,
    deadline: Deadline,
}

impl SpawnBuilder {
    pub(crate) fn on(processor: Handle) -> Self {
        SpawnBuilder {
            processor: Some(processor),
            ..Default::default()
        }
    }

    pub fn importance(mut self, importance: Importance) -> Self {
        self.importance = importance;
        self
    }

    /// The task is cancelled with
    /// [`CancellationReason::Deadline`](crate::task::CancellationReason::Deadline)
    /// once `deadline` passes. A normal task whose deadline passed before it
    /// started never runs.
    pub fn deadline(mut self, deadline: Deadline) -> Self {
        self.deadline = deadline;
        self
    }

    pub fn deadline_after(self, timeout: Duration) -> Self {
        self.deadline(Deadline::from_duration(timeout))
    }

    #[track_caller]
    pub fn spawn<F>(self, future: F) -> Task<F::Output>
    where
        F: Future + Send + 'static,
        F::Output: Send + 'static,
    {
        let processor = match self.processor {
            Some(processor) => processor,
            None => match context::current_processor() {
                Some(processor) => processor,
                None => panic!("spawn called outside of a task processor"),
            },
        };
        processor.spawn(future, self.importance, self.deadline)
    }
}
