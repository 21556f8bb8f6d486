use crate::deadline::Deadline;
use crate::error::WaitError;
use crate::sync::waiter::Interrupts;
use crossbeam_utils::Backoff;
use futures::task::AtomicWaker;
use std::cell::UnsafeCell;
use std::fmt;
use std::future::Future;
use std::ops::{Deref, DerefMut};
use std::pin::Pin;
use std::sync::atomic::{AtomicBool, AtomicU8, Ordering};
use std::task::{Context, Poll};
use std::time::Duration;

const UNLOCKED: u8 = 0;
const LOCKED: u8 = 1;
/// Locked, and the single waiter asked for a direct handoff.
const LOCKED_WAITING: u8 = 2;

/// Exclusive lock with room for exactly one waiting task.
///
/// Cheaper than [`Mutex`](super::Mutex) when contention is known to be between
/// two tasks at most: no waiter queue, just an atomic state word and one waker
/// slot. Unlocking with a waiter present transfers ownership directly, the
/// waiter does not have to win a race afterwards.
///
/// A second task trying to wait while another one already waits is a bug and
/// panics.
pub struct SingleWaitingTaskMutex<T: ?Sized> {
    state: AtomicU8,
    /// Set by `unlock` when it handed ownership to the waiter.
    handoff: AtomicBool,
    /// Claimed by the one task allowed to wait.
    has_waiter: AtomicBool,
    waker: AtomicWaker,
    data: UnsafeCell<T>,
}

unsafe impl<T: ?Sized + Send> Send for SingleWaitingTaskMutex<T> {}
unsafe impl<T: ?Sized + Send> Sync for SingleWaitingTaskMutex<T> {}

impl<T> SingleWaitingTaskMutex<T> {
    pub fn new(value: T) -> Self {
        SingleWaitingTaskMutex {
            state: AtomicU8::new(UNLOCKED),
            handoff: AtomicBool::new(false),
            has_waiter: AtomicBool::new(false),
            waker: AtomicWaker::new(),
            data: UnsafeCell::new(value),
        }
    }

    pub fn into_inner(self) -> T {
        self.data.into_inner()
    }
}

impl<T: ?Sized> SingleWaitingTaskMutex<T> {
    pub fn try_lock(&self) -> Option<SingleWaitingTaskMutexGuard<'_, T>> {
        self.state
            .compare_exchange(UNLOCKED, LOCKED, Ordering::Acquire, Ordering::Relaxed)
            .is_ok()
            .then_some(SingleWaitingTaskMutexGuard { mutex: self })
    }

    /// Locks the mutex. Not interrupted by cancellation.
    pub async fn lock(&self) -> SingleWaitingTaskMutexGuard<'_, T> {
        let wait = LockWait::new(self, Interrupts::non_cancellable(Deadline::unreachable()));
        match wait.await {
            Ok(guard) => guard,
            Err(err) => unreachable!("uninterruptible wait failed: {err}"),
        }
    }

    pub async fn try_lock_until(
        &self,
        deadline: Deadline,
    ) -> Result<SingleWaitingTaskMutexGuard<'_, T>, WaitError> {
        LockWait::new(self, Interrupts::new(deadline)).await
    }

    pub async fn try_lock_for(
        &self,
        timeout: Duration,
    ) -> Result<SingleWaitingTaskMutexGuard<'_, T>, WaitError> {
        self.try_lock_until(Deadline::from_duration(timeout)).await
    }

    pub fn get_mut(&mut self) -> &mut T {
        self.data.get_mut()
    }

    fn unlock(&self) {
        loop {
            match self
                .state
                .compare_exchange(LOCKED, UNLOCKED, Ordering::Release, Ordering::Relaxed)
            {
                Ok(_) => return,
                Err(LOCKED_WAITING) => {
                    // Stays locked, ownership moves to the waiter.
                    if self
                        .state
                        .compare_exchange(LOCKED_WAITING, LOCKED, Ordering::AcqRel, Ordering::Relaxed)
                        .is_ok()
                    {
                        self.handoff.store(true, Ordering::Release);
                        self.waker.wake();
                        return;
                    }
                }
                // The waiter withdrew between our two attempts.
                Err(LOCKED) => {}
                Err(raw) => panic!("unlock of an unlocked SingleWaitingTaskMutex ({raw})"),
            }
        }
    }
}

impl<T: ?Sized> fmt::Debug for SingleWaitingTaskMutex<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SingleWaitingTaskMutex")
            .field("locked", &(self.state.load(Ordering::Relaxed) != UNLOCKED))
            .finish_non_exhaustive()
    }
}

struct LockWait<'a, T: ?Sized> {
    mutex: &'a SingleWaitingTaskMutex<T>,
    interrupts: Interrupts,
    registered: bool,
}

impl<'a, T: ?Sized> LockWait<'a, T> {
    fn new(mutex: &'a SingleWaitingTaskMutex<T>, interrupts: Interrupts) -> Self {
        LockWait {
            mutex,
            interrupts,
            registered: false,
        }
    }

    fn acquired(&mut self) -> SingleWaitingTaskMutexGuard<'a, T> {
        if self.registered {
            self.registered = false;
            self.mutex.has_waiter.store(false, Ordering::Release);
        }
        SingleWaitingTaskMutexGuard { mutex: self.mutex }
    }

    /// Takes a pending handoff, or grabs the lock if it was released.
    /// Otherwise announces the waiter so the next unlock hands off.
    fn try_take(&self) -> bool {
        let mutex = self.mutex;
        if mutex.handoff.swap(false, Ordering::Acquire) {
            return true;
        }

        let mut current = mutex.state.load(Ordering::Relaxed);
        loop {
            let (expected, next) = match current {
                UNLOCKED => (UNLOCKED, LOCKED),
                LOCKED => (LOCKED, LOCKED_WAITING),
                _ => return false,
            };
            match mutex
                .state
                .compare_exchange(expected, next, Ordering::Acquire, Ordering::Relaxed)
            {
                Ok(_) => return next == LOCKED,
                Err(actual) => current = actual,
            }
        }
    }

    /// Stops waiting. Returns `true` if ownership arrived anyway.
    fn withdraw(&mut self) -> bool {
        let mutex = self.mutex;
        let withdrew = mutex
            .state
            .compare_exchange(LOCKED_WAITING, LOCKED, Ordering::Relaxed, Ordering::Relaxed)
            .is_ok();

        if withdrew {
            return false;
        }

        // An unlock already moved LOCKED_WAITING -> LOCKED for us, the
        // handoff flag follows right after.
        let backoff = Backoff::new();
        while !mutex.handoff.swap(false, Ordering::Acquire) {
            backoff.spin();
        }
        true
    }
}

impl<'a, T: ?Sized> Future for LockWait<'a, T> {
    type Output = Result<SingleWaitingTaskMutexGuard<'a, T>, WaitError>;

    fn poll(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        let this = self.get_mut();

        if !this.registered {
            if let Some(guard) = this.mutex.try_lock() {
                return Poll::Ready(Ok(guard));
            }
            let was_waiting = this.mutex.has_waiter.swap(true, Ordering::AcqRel);
            assert!(!was_waiting, "SingleWaitingTaskMutex supports a single waiting task");
            this.registered = true;
        }

        this.mutex.waker.register(cx.waker());
        if this.try_take() {
            return Poll::Ready(Ok(this.acquired()));
        }

        match this.interrupts.poll(cx) {
            None => Poll::Pending,
            Some(err) => {
                if this.withdraw() {
                    Poll::Ready(Ok(this.acquired()))
                } else {
                    this.registered = false;
                    this.mutex.has_waiter.store(false, Ordering::Release);
                    Poll::Ready(Err(err))
                }
            }
        }
    }
}

impl<T: ?Sized> Drop for LockWait<'_, T> {
    fn drop(&mut self) {
        if self.registered && self.withdraw() {
            // Ownership arrived after we stopped caring, pass it on.
            drop(self.acquired());
        } else if self.registered {
            self.mutex.has_waiter.store(false, Ordering::Release);
        }
    }
}

#[must_use = "if unused the mutex will immediately unlock"]
pub struct SingleWaitingTaskMutexGuard<'a, T: ?Sized> {
    mutex: &'a SingleWaitingTaskMutex<T>,
}

impl<T: ?Sized> Deref for SingleWaitingTaskMutexGuard<'_, T> {
    type Target = T;

    fn deref(&self) -> &T {
        // Safety: the guard proves exclusive ownership of the lock.
        unsafe { &*self.mutex.data.get() }
    }
}

impl<T: ?Sized> DerefMut for SingleWaitingTaskMutexGuard<'_, T> {
    fn deref_mut(&mut self) -> &mut T {
        // Safety: the guard proves exclusive ownership of the lock.
        unsafe { &mut *self.mutex.data.get() }
    }
}

impl<T: ?Sized> Drop for SingleWaitingTaskMutexGuard<'_, T> {
    fn drop(&mut self) {
        self.mutex.unlock();
    }
}
