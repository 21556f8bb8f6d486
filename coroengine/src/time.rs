//! Suspending on time: sleeps, timeouts and yielding to other tasks.

use crate::deadline::Deadline;
use crate::error::WaitError;
use crate::reactor::DeadlineTimer;
use crate::sync::waiter::Interrupts;
use pin_project::pin_project;
use std::fmt;
use std::future::Future;
use std::pin::Pin;
use std::task::{Context, Poll};
use std::time::Duration;

/// Suspends the current task for `duration`.
///
/// Returns early with [`WaitError::Cancelled`] when the task is cancelled;
/// never returns [`WaitError::Timeout`].
pub fn sleep_for(duration: Duration) -> Sleep {
    sleep_until(Deadline::from_duration(duration))
}

/// Suspends the current task until `deadline`. An unreachable deadline
/// sleeps until the task is cancelled.
pub fn sleep_until(deadline: Deadline) -> Sleep {
    Sleep {
        interrupts: Interrupts::new(deadline),
    }
}

#[must_use = "futures do nothing unless polled"]
pub struct Sleep {
    interrupts: Interrupts,
}

impl Future for Sleep {
    type Output = Result<(), WaitError>;

    fn poll(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        match self.interrupts.poll(cx) {
            Some(WaitError::Timeout) => Poll::Ready(Ok(())),
            Some(err) => Poll::Ready(Err(err)),
            None => Poll::Pending,
        }
    }
}

impl fmt::Debug for Sleep {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Sleep").finish_non_exhaustive()
    }
}

/// Lets every other queued task run a step before the current one resumes.
pub fn yield_now() -> YieldNow {
    YieldNow { yielded: false }
}

#[derive(Debug)]
#[must_use = "futures do nothing unless polled"]
pub struct YieldNow {
    yielded: bool,
}

impl Future for YieldNow {
    type Output = ();

    fn poll(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<()> {
        // Only yield on first poll. Next time the task runs we return.
        if self.yielded {
            return Poll::Ready(());
        }
        self.yielded = true;

        // Waking a running task requeues it at the back of the queue once
        // this step ends.
        cx.waker().wake_by_ref();
        Poll::Pending
    }
}

/// Runs `future` until it completes or `duration` elapses.
///
/// On timeout the future is dropped when the returned [`Timeout`] is. Only
/// time is checked here: cancellation is up to the inner future.
pub fn timeout<F: Future>(duration: Duration, future: F) -> Timeout<F> {
    timeout_at(Deadline::from_duration(duration), future)
}

pub fn timeout_at<F: Future>(deadline: Deadline, future: F) -> Timeout<F> {
    Timeout {
        future,
        timer: DeadlineTimer::new(deadline),
    }
}

#[pin_project]
#[must_use = "futures do nothing unless polled"]
pub struct Timeout<F> {
    #[pin]
    future: F,
    timer: DeadlineTimer,
}

impl<F: Future> Future for Timeout<F> {
    type Output = Result<F::Output, WaitError>;

    fn poll(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        let this = self.project();

        if let Poll::Ready(output) = this.future.poll(cx) {
            return Poll::Ready(Ok(output));
        }
        if this.timer.poll_expired(cx) {
            return Poll::Ready(Err(WaitError::Timeout));
        }
        Poll::Pending
    }
}

impl<F> fmt::Debug for Timeout<F> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Timeout").finish_non_exhaustive()
    }
}
