use crate::deadline::Deadline;
use crate::error::WaitError;
use crate::sync::combiner::{Combine, Combiner};
use crate::sync::waiter::{Acquire, Grantor, Interrupts, Waiter, acquire_uninterruptible};
use std::cell::UnsafeCell;
use std::collections::VecDeque;
use std::fmt;
use std::ops::{Deref, DerefMut};
use std::sync::Arc;
use std::time::Duration;

enum Op {
    Acquire { waiter: Arc<Waiter>, queue: bool },
    Release,
    Purge,
}

struct State {
    locked: bool,
    waiters: VecDeque<Arc<Waiter>>,
}

impl State {
    /// Passes ownership to the first live waiter, or leaves the mutex free.
    fn hand_off(&mut self) {
        while let Some(waiter) = self.waiters.pop_front() {
            if waiter.grant() {
                self.locked = true;
                return;
            }
        }
    }
}

impl Combine for State {
    type Op = Op;

    fn apply(&mut self, op: Op) {
        match op {
            Op::Acquire { waiter, queue } => {
                if !self.locked {
                    debug_assert!(self.waiters.iter().all(|w| w.is_abandoned()));
                    self.locked = waiter.grant();
                } else if queue {
                    self.waiters.push_back(waiter);
                } else {
                    waiter.reject();
                }
            }
            Op::Release => {
                assert!(self.locked, "unlock of an unlocked mutex");
                self.locked = false;
                self.hand_off();
            }
            Op::Purge => self.waiters.retain(|w| !w.is_abandoned()),
        }
    }
}

struct RawMutex {
    combiner: Combiner<State>,
}

impl Grantor for RawMutex {
    type Request = ();

    fn submit(&self, waiter: Arc<Waiter>, _: (), queue: bool) {
        self.combiner.submit(Op::Acquire { waiter, queue });
    }

    fn give_back(&self, _: ()) {
        self.combiner.submit(Op::Release);
    }

    fn purge(&self) {
        self.combiner.submit(Op::Purge);
    }

    fn is_applying_here(&self) -> bool {
        self.combiner.is_applying_here()
    }
}

/// Task-aware exclusive lock protecting a `T`.
///
/// Contended `lock` suspends the task instead of blocking the worker thread.
/// Unlocking hands ownership straight to the oldest waiter, so a waiter never
/// has to race newcomers for a lock it was woken for.
pub struct Mutex<T: ?Sized> {
    raw: RawMutex,
    data: UnsafeCell<T>,
}

unsafe impl<T: ?Sized + Send> Send for Mutex<T> {}
unsafe impl<T: ?Sized + Send> Sync for Mutex<T> {}

impl<T> Mutex<T> {
    pub fn new(value: T) -> Self {
        Mutex {
            raw: RawMutex {
                combiner: Combiner::new(State {
                    locked: false,
                    waiters: VecDeque::new(),
                }),
            },
            data: UnsafeCell::new(value),
        }
    }

    pub fn into_inner(self) -> T {
        self.data.into_inner()
    }
}

impl<T: ?Sized> Mutex<T> {
    /// Locks the mutex. Not interrupted by cancellation.
    pub async fn lock(&self) -> MutexGuard<'_, T> {
        acquire_uninterruptible(&self.raw, ()).await;
        MutexGuard { mutex: self }
    }

    pub fn try_lock(&self) -> Option<MutexGuard<'_, T>> {
        self.raw.try_grant(()).then_some(MutexGuard { mutex: self })
    }

    /// Locks the mutex unless `deadline` passes or the task is cancelled first.
    pub async fn try_lock_until(&self, deadline: Deadline) -> Result<MutexGuard<'_, T>, WaitError> {
        Acquire::new(&self.raw, (), Interrupts::new(deadline)).await?;
        Ok(MutexGuard { mutex: self })
    }

    pub async fn try_lock_for(&self, timeout: Duration) -> Result<MutexGuard<'_, T>, WaitError> {
        self.try_lock_until(Deadline::from_duration(timeout)).await
    }

    pub fn get_mut(&mut self) -> &mut T {
        self.data.get_mut()
    }
}

impl<T: Default> Default for Mutex<T> {
    fn default() -> Self {
        Mutex::new(T::default())
    }
}

impl<T: ?Sized> fmt::Debug for Mutex<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Mutex").finish_non_exhaustive()
    }
}

/// Exclusive access to the data of a locked [`Mutex`]; unlocks on drop.
#[must_use = "if unused the Mutex will immediately unlock"]
pub struct MutexGuard<'a, T: ?Sized> {
    mutex: &'a Mutex<T>,
}

unsafe impl<T: ?Sized + Sync> Sync for MutexGuard<'_, T> {}

impl<T: ?Sized> Deref for MutexGuard<'_, T> {
    type Target = T;

    fn deref(&self) -> &T {
        // Safety: the guard proves exclusive ownership of the lock.
        unsafe { &*self.mutex.data.get() }
    }
}

impl<T: ?Sized> DerefMut for MutexGuard<'_, T> {
    fn deref_mut(&mut self) -> &mut T {
        // Safety: the guard proves exclusive ownership of the lock.
        unsafe { &mut *self.mutex.data.get() }
    }
}

impl<T: ?Sized> Drop for MutexGuard<'_, T> {
    fn drop(&mut self) {
        self.mutex.raw.give_back(());
    }
}

impl<T: ?Sized + fmt::Debug> fmt::Debug for MutexGuard<'_, T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Debug::fmt(&**self, f)
    }
}
