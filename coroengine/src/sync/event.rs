use crate::deadline::Deadline;
use crate::error::WaitError;
use crate::sync::Awaitable;
use crate::sync::waiter::Interrupts;
use futures::task::AtomicWaker;
use std::fmt;
use std::future::Future;
use std::pin::Pin;
use std::sync::atomic::{AtomicBool, Ordering};
use std::task::{Context, Poll};

/// A flag plus a single waker slot, shared by both event flavors.
struct Signal {
    signaled: AtomicBool,
    waker: AtomicWaker,
    /// Claimed by the one wait future allowed at a time.
    has_waiter: AtomicBool,
}

impl Signal {
    fn new() -> Self {
        Signal {
            signaled: AtomicBool::new(false),
            waker: AtomicWaker::new(),
            has_waiter: AtomicBool::new(false),
        }
    }

    fn send(&self) {
        self.signaled.store(true, Ordering::Release);
        self.waker.wake();
    }

    fn is_set(&self) -> bool {
        self.signaled.load(Ordering::Acquire)
    }

    fn clear(&self) {
        self.signaled.store(false, Ordering::Release);
    }

    fn observe(&self, consume: bool) -> bool {
        if consume {
            self.signaled.swap(false, Ordering::AcqRel)
        } else {
            self.is_set()
        }
    }

    #[track_caller]
    fn claim_waiter(&self) {
        let was_waiting = self.has_waiter.swap(true, Ordering::AcqRel);
        assert!(!was_waiting, "event already has a waiting task");
    }

    fn release_waiter(&self) {
        self.has_waiter.store(false, Ordering::Release);
    }
}

impl Default for Signal {
    fn default() -> Self {
        Signal::new()
    }
}

#[must_use = "futures do nothing unless polled"]
struct EventWait<'a> {
    signal: &'a Signal,
    consume: bool,
    interrupts: Interrupts,
    registered: bool,
}

impl<'a> EventWait<'a> {
    fn new(signal: &'a Signal, consume: bool, interrupts: Interrupts) -> Self {
        EventWait {
            signal,
            consume,
            interrupts,
            registered: false,
        }
    }

    fn unregister(&mut self) {
        if std::mem::take(&mut self.registered) {
            self.signal.release_waiter();
        }
    }
}

impl Future for EventWait<'_> {
    type Output = Result<(), WaitError>;

    fn poll(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        let this = self.get_mut();

        if this.signal.observe(this.consume) {
            this.unregister();
            return Poll::Ready(Ok(()));
        }

        if !this.registered {
            this.signal.claim_waiter();
            this.registered = true;
        }

        this.signal.waker.register(cx.waker());
        if this.signal.observe(this.consume) {
            this.unregister();
            return Poll::Ready(Ok(()));
        }

        match this.interrupts.poll(cx) {
            Some(err) => {
                this.unregister();
                Poll::Ready(Err(err))
            }
            None => Poll::Pending,
        }
    }
}

impl Drop for EventWait<'_> {
    fn drop(&mut self) {
        self.unregister();
    }
}

/// One-shot signal from one task (or thread) to one waiting task.
///
/// `send` before anyone waits is remembered. Only one task may wait at a time.
#[derive(Default)]
pub struct SingleUseEvent {
    signal: Signal,
}

impl SingleUseEvent {
    pub fn new() -> Self {
        SingleUseEvent {
            signal: Signal::new(),
        }
    }

    /// Signals the event and wakes the waiter, if any.
    pub fn send(&self) {
        self.signal.send();
    }

    pub fn is_ready(&self) -> bool {
        self.signal.is_set()
    }

    /// Waits for `send`. Fails if the current task is cancelled first.
    pub async fn wait(&self) -> Result<(), WaitError> {
        self.wait_until(Deadline::unreachable()).await
    }

    pub async fn wait_until(&self, deadline: Deadline) -> Result<(), WaitError> {
        EventWait::new(&self.signal, false, Interrupts::new(deadline)).await
    }

    /// Waits for `send`, ignoring cancellation.
    pub async fn wait_non_cancellable(&self) {
        let wait = EventWait::new(
            &self.signal,
            false,
            Interrupts::non_cancellable(Deadline::unreachable()),
        );
        if let Err(err) = wait.await {
            unreachable!("uninterruptible wait failed: {err}");
        }
    }

    /// Readiness view for [`wait_any`](super::wait_any).
    pub fn awaitable(&self) -> EventAwaitable<'_> {
        EventAwaitable::new(&self.signal)
    }

    /// Re-arms the event.
    ///
    /// Only valid for single-producer/single-consumer reuse: the waiter resets
    /// after it observed the signal and before the producer may send again.
    pub fn reset(&self) {
        self.signal.clear();
    }
}

impl fmt::Debug for SingleUseEvent {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SingleUseEvent")
            .field("ready", &self.is_ready())
            .finish()
    }
}

/// Auto-reset event: every successful wait consumes the pending signal.
///
/// Several `send`s before a wait collapse into one.
#[derive(Default)]
pub struct SingleConsumerEvent {
    signal: Signal,
}

impl SingleConsumerEvent {
    pub fn new() -> Self {
        SingleConsumerEvent {
            signal: Signal::new(),
        }
    }

    pub fn send(&self) {
        self.signal.send();
    }

    pub fn is_ready(&self) -> bool {
        self.signal.is_set()
    }

    pub async fn wait(&self) -> Result<(), WaitError> {
        self.wait_until(Deadline::unreachable()).await
    }

    pub async fn wait_until(&self, deadline: Deadline) -> Result<(), WaitError> {
        EventWait::new(&self.signal, true, Interrupts::new(deadline)).await
    }

    /// Readiness view for [`wait_any`](super::wait_any). Being reported ready
    /// does not consume the signal.
    pub fn awaitable(&self) -> EventAwaitable<'_> {
        EventAwaitable::new(&self.signal)
    }

    /// Drops a pending signal without waiting.
    pub fn reset(&self) {
        self.signal.clear();
    }
}

impl fmt::Debug for SingleConsumerEvent {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SingleConsumerEvent")
            .field("ready", &self.is_ready())
            .finish()
    }
}

/// An event taking part in [`wait_any`](super::wait_any).
///
/// While registered it holds the event's single waiter slot, exactly like a
/// pending `wait`, so the two cannot be mixed on one event.
#[must_use = "an awaitable does nothing unless passed to `wait_any`"]
pub struct EventAwaitable<'a> {
    signal: &'a Signal,
    registered: bool,
}

impl<'a> EventAwaitable<'a> {
    fn new(signal: &'a Signal) -> Self {
        EventAwaitable {
            signal,
            registered: false,
        }
    }

    fn release(&mut self) {
        if std::mem::take(&mut self.registered) {
            self.signal.release_waiter();
        }
    }
}

impl Awaitable for EventAwaitable<'_> {
    fn poll_ready(&mut self, cx: &mut Context<'_>) -> Poll<()> {
        if self.signal.is_set() {
            self.release();
            return Poll::Ready(());
        }

        if !self.registered {
            self.signal.claim_waiter();
            self.registered = true;
        }

        self.signal.waker.register(cx.waker());
        if self.signal.is_set() {
            self.release();
            Poll::Ready(())
        } else {
            Poll::Pending
        }
    }

    fn unregister(&mut self) {
        self.release();
    }
}

impl Drop for EventAwaitable<'_> {
    fn drop(&mut self) {
        self.release();
    }
}

impl fmt::Debug for EventAwaitable<'_> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("EventAwaitable")
            .field("ready", &self.signal.is_set())
            .field("registered", &self.registered)
            .finish()
    }
}
