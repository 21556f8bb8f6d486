//! Event threads backing deadlines: timed waits, sleeps and task cancellation
//! deadlines all register a waker here and get woken when the time comes.

mod timer;
pub(crate) use timer::TimerHandle;
use timer::TimerThread;

use crate::context;
use crate::deadline::Deadline;
use crate::processor::ThreadNameFn;
use anyhow::{Result, anyhow};
use std::fmt;
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::task::{Context, Waker};
use std::time::Instant;

pub(crate) struct Reactor {
    timers: Box<[TimerThread]>,
    next: AtomicUsize,
}

impl Reactor {
    #[track_caller]
    pub(crate) fn new(num_threads: usize, thread_prefix: &str) -> Result<Self> {
        assert!(num_threads > 0, "reactor needs at least one timer thread");

        let counter = Arc::new(AtomicUsize::new(0));
        let prefix = thread_prefix.to_owned();
        let name_fn = ThreadNameFn(Arc::new(move || {
            format!("{prefix}-{}", counter.fetch_add(1, Ordering::Relaxed))
        }));

        let timers = (0..num_threads)
            .map(|_| TimerThread::spawn(&name_fn))
            .collect::<Result<Vec<_>>>()?;

        Ok(Reactor {
            timers: timers.into_boxed_slice(),
            next: AtomicUsize::new(0),
        })
    }

    /// Wakes `waker` once `at` is reached, unless the handle is dropped first.
    pub(crate) fn add_timer(&self, at: Instant, waker: Waker) -> TimerHandle {
        let index = self.next.fetch_add(1, Ordering::Relaxed) % self.timers.len();
        self.timers[index].add(at, waker)
    }

    pub(crate) fn shutdown(&self) -> Result<()> {
        let failures = self
            .timers
            .iter()
            .filter_map(|timer| timer.stop().err())
            .count();

        if failures == 0 {
            Ok(())
        } else {
            Err(anyhow!("{failures} timer thread(s) panicked"))
        }
    }
}

impl fmt::Debug for Reactor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Reactor")
            .field("timer_threads", &self.timers.len())
            .finish()
    }
}

/// Deadline half of a timed wait.
///
/// Arms a reactor timer for the polling task the first time the wait would
/// suspend, and again only if the task's waker changed.
#[derive(Debug)]
pub(crate) struct DeadlineTimer {
    deadline: Deadline,
    armed: Option<(TimerHandle, Waker)>,
}

impl DeadlineTimer {
    pub(crate) fn new(deadline: Deadline) -> Self {
        DeadlineTimer {
            deadline,
            armed: None,
        }
    }

    /// Returns `true` once the deadline passed. Otherwise makes sure `cx` is
    /// woken when it does.
    ///
    /// # Panics
    ///
    /// Panics when a reachable deadline has to be armed outside of a task
    /// processor.
    #[track_caller]
    pub(crate) fn poll_expired(&mut self, cx: &Context<'_>) -> bool {
        let Some(at) = self.deadline.instant() else {
            return false;
        };

        if Instant::now() >= at {
            self.armed = None;
            return true;
        }

        if let Some((_, waker)) = &self.armed
            && waker.will_wake(cx.waker())
        {
            return false;
        }

        let Some(processor) = context::current_processor() else {
            panic!("waiting with a deadline requires a running task processor");
        };
        let handle = processor.reactor().add_timer(at, cx.waker().clone());
        self.armed = Some((handle, cx.waker().clone()));
        false
    }
}
