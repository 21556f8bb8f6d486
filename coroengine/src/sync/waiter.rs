use crate::deadline::Deadline;
use crate::error::WaitError;
use crate::reactor::DeadlineTimer;
use crate::task::current_task;
use crossbeam_utils::Backoff;
use futures::task::AtomicWaker;
use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;
use std::sync::atomic::{AtomicU8, Ordering};
use std::task::{Context, Poll, Waker};

const WAITING: u8 = 0;
const GRANTED: u8 = 1;
const REJECTED: u8 = 2;
const ABANDONED: u8 = 3;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Decision {
    Waiting,
    Granted,
    Rejected,
    Abandoned,
}

/// A queued request for a resource.
///
/// The grantor and the waiting side race to settle it exactly once: the
/// grantor with [`grant`](Self::grant) or [`reject`](Self::reject), the waiter
/// with [`abandon`](Self::abandon) when it times out, is cancelled or is
/// dropped. Whoever loses learns the outcome from the return value.
#[derive(Debug)]
pub(crate) struct Waiter {
    state: AtomicU8,
    waker: AtomicWaker,
}

impl Waiter {
    pub(crate) fn new() -> Arc<Self> {
        Arc::new(Waiter {
            state: AtomicU8::new(WAITING),
            waker: AtomicWaker::new(),
        })
    }

    pub(crate) fn register(&self, waker: &Waker) {
        self.waker.register(waker);
    }

    pub(crate) fn decision(&self) -> Decision {
        decode(self.state.load(Ordering::Acquire))
    }

    pub(crate) fn is_abandoned(&self) -> bool {
        self.state.load(Ordering::Acquire) == ABANDONED
    }

    /// Returns `false` if the waiter gave up first.
    pub(crate) fn grant(&self) -> bool {
        self.settle(GRANTED)
    }

    pub(crate) fn reject(&self) -> bool {
        self.settle(REJECTED)
    }

    /// Gives up on the request. Returns `Abandoned` if this call settled it,
    /// otherwise the grantor's earlier decision.
    pub(crate) fn abandon(&self) -> Decision {
        match self
            .state
            .compare_exchange(WAITING, ABANDONED, Ordering::AcqRel, Ordering::Acquire)
        {
            Ok(_) => Decision::Abandoned,
            Err(actual) => decode(actual),
        }
    }

    /// Spins until the grantor settled a request that cannot be queued.
    pub(crate) fn spin_until_decided(&self) -> Decision {
        let backoff = Backoff::new();
        loop {
            match self.decision() {
                Decision::Waiting => backoff.snooze(),
                decision => return decision,
            }
        }
    }

    fn settle(&self, to: u8) -> bool {
        let settled = self
            .state
            .compare_exchange(WAITING, to, Ordering::AcqRel, Ordering::Acquire)
            .is_ok();
        if settled {
            self.waker.wake();
        }
        settled
    }
}

fn decode(raw: u8) -> Decision {
    match raw {
        WAITING => Decision::Waiting,
        GRANTED => Decision::Granted,
        REJECTED => Decision::Rejected,
        ABANDONED => Decision::Abandoned,
        _ => unreachable!("invalid waiter state {raw}"),
    }
}

/// The two ways a suspended wait can be interrupted before its condition holds.
#[derive(Debug)]
pub(crate) struct Interrupts {
    timer: DeadlineTimer,
    cancellable: bool,
}

impl Interrupts {
    pub(crate) fn new(deadline: Deadline) -> Self {
        Interrupts {
            timer: DeadlineTimer::new(deadline),
            cancellable: true,
        }
    }

    pub(crate) fn non_cancellable(deadline: Deadline) -> Self {
        Interrupts {
            timer: DeadlineTimer::new(deadline),
            cancellable: false,
        }
    }

    /// Checked after the waker is registered and the condition re-tested.
    #[track_caller]
    pub(crate) fn poll(&mut self, cx: &Context<'_>) -> Option<WaitError> {
        if self.cancellable
            && let Some(reason) = current_task::pending_cancellation()
        {
            return Some(WaitError::Cancelled(reason));
        }
        self.timer.poll_expired(cx).then_some(WaitError::Timeout)
    }
}

/// A primitive that hands out grants to queued waiters.
pub(crate) trait Grantor {
    type Request: Copy + Unpin + Send;

    /// Enqueues the request. When `queue` is `false` and it cannot be granted
    /// right away, the waiter is rejected instead.
    fn submit(&self, waiter: Arc<Waiter>, request: Self::Request, queue: bool);

    /// Returns a grant that reached a waiter after it stopped waiting.
    fn give_back(&self, request: Self::Request);

    /// Drops abandoned waiters and grants whatever became possible.
    fn purge(&self);

    /// Whether the calling thread is applying this grantor's operations.
    fn is_applying_here(&self) -> bool;

    /// Non-suspending attempt.
    ///
    /// Must not be called while applying this grantor's own operations: the
    /// request would only be queued behind the caller and never decided.
    fn try_grant(&self, request: Self::Request) -> bool {
        debug_assert!(
            !self.is_applying_here(),
            "try_grant called from inside the same grantor's combiner"
        );
        let waiter = Waiter::new();
        self.submit(Arc::clone(&waiter), request, false);
        waiter.spin_until_decided() == Decision::Granted
    }
}

enum Phase {
    Init,
    Waiting(Arc<Waiter>),
    Done,
}

/// Future of a queued, interruptible request to a [`Grantor`].
///
/// Resolves `Ok` once granted. On timeout or cancellation the waiter is
/// abandoned; if the grant won that race the wait still succeeds. Dropping
/// the future mid-wait abandons the waiter and returns any late grant.
#[must_use = "futures do nothing unless polled"]
pub(crate) struct Acquire<'a, G: Grantor> {
    grantor: &'a G,
    request: G::Request,
    interrupts: Interrupts,
    phase: Phase,
}

impl<'a, G: Grantor> Acquire<'a, G> {
    pub(crate) fn new(grantor: &'a G, request: G::Request, interrupts: Interrupts) -> Self {
        Acquire {
            grantor,
            request,
            interrupts,
            phase: Phase::Init,
        }
    }
}

impl<G: Grantor> Future for Acquire<'_, G> {
    type Output = Result<(), WaitError>;

    fn poll(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        let this = self.get_mut();

        let waiter = match &this.phase {
            Phase::Init => {
                let waiter = Waiter::new();
                waiter.register(cx.waker());
                this.grantor.submit(Arc::clone(&waiter), this.request, true);
                this.phase = Phase::Waiting(Arc::clone(&waiter));
                waiter
            }
            Phase::Waiting(waiter) => {
                waiter.register(cx.waker());
                Arc::clone(waiter)
            }
            Phase::Done => panic!("`Acquire` polled after completion"),
        };

        if waiter.decision() == Decision::Granted {
            this.phase = Phase::Done;
            return Poll::Ready(Ok(()));
        }

        let Some(err) = this.interrupts.poll(cx) else {
            return Poll::Pending;
        };

        this.phase = Phase::Done;
        match waiter.abandon() {
            Decision::Abandoned => {
                this.grantor.purge();
                Poll::Ready(Err(err))
            }
            Decision::Granted => Poll::Ready(Ok(())),
            decision => unreachable!("queued waiter settled as {decision:?}"),
        }
    }
}

impl<G: Grantor> Drop for Acquire<'_, G> {
    fn drop(&mut self) {
        if let Phase::Waiting(waiter) = std::mem::replace(&mut self.phase, Phase::Done) {
            match waiter.abandon() {
                Decision::Abandoned => self.grantor.purge(),
                Decision::Granted => self.grantor.give_back(self.request),
                _ => {}
            }
        }
    }
}

/// Waits for a grant ignoring cancellation and without a deadline.
pub(crate) async fn acquire_uninterruptible<G: Grantor>(grantor: &G, request: G::Request) {
    let interrupts = Interrupts::non_cancellable(Deadline::unreachable());
    if let Err(err) = Acquire::new(grantor, request, interrupts).await {
        unreachable!("uninterruptible wait failed: {err}");
    }
}
