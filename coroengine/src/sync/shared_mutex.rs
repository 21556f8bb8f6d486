use crate::deadline::Deadline;
use crate::error::WaitError;
use crate::sync::combiner::{Combine, Combiner};
use crate::sync::waiter::{Acquire, Grantor, Interrupts, Waiter, acquire_uninterruptible};
use std::cell::UnsafeCell;
use std::collections::VecDeque;
use std::fmt;
use std::ops::{Deref, DerefMut};
use std::sync::Arc;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Mode {
    Shared,
    Exclusive,
}

enum Op {
    Acquire {
        waiter: Arc<Waiter>,
        mode: Mode,
        queue: bool,
    },
    Release(Mode),
    Purge,
}

#[derive(Default)]
struct State {
    readers: usize,
    writer: bool,
    waiting_writers: VecDeque<Arc<Waiter>>,
    waiting_readers: VecDeque<Arc<Waiter>>,
}

impl State {
    fn writer_waiting(&mut self) -> bool {
        while self
            .waiting_writers
            .front()
            .is_some_and(|w| w.is_abandoned())
        {
            self.waiting_writers.pop_front();
        }
        !self.waiting_writers.is_empty()
    }

    fn can_grant(&mut self, mode: Mode) -> bool {
        match mode {
            Mode::Shared => !self.writer && !self.writer_waiting(),
            Mode::Exclusive => !self.writer && self.readers == 0 && !self.writer_waiting(),
        }
    }

    fn grant(&mut self, waiter: &Waiter, mode: Mode) {
        if waiter.grant() {
            match mode {
                Mode::Shared => self.readers += 1,
                Mode::Exclusive => self.writer = true,
            }
        }
    }

    /// Writers first: the head writer gets the lock once readers drained.
    /// Queued readers are only let in when no writer waits.
    fn dispatch(&mut self) {
        while !self.writer {
            if self.writer_waiting() {
                if self.readers > 0 {
                    return;
                }
                if let Some(writer) = self.waiting_writers.pop_front() {
                    self.grant(&writer, Mode::Exclusive);
                }
                continue;
            }

            while let Some(reader) = self.waiting_readers.pop_front() {
                self.grant(&reader, Mode::Shared);
            }
            return;
        }
    }
}

impl Combine for State {
    type Op = Op;

    fn apply(&mut self, op: Op) {
        match op {
            Op::Acquire { waiter, mode, queue } => {
                if self.can_grant(mode) {
                    self.grant(&waiter, mode);
                } else if !queue {
                    waiter.reject();
                } else {
                    match mode {
                        Mode::Shared => self.waiting_readers.push_back(waiter),
                        Mode::Exclusive => self.waiting_writers.push_back(waiter),
                    }
                }
            }
            Op::Release(Mode::Shared) => {
                assert!(self.readers > 0, "unlock_shared of a SharedMutex with no readers");
                self.readers -= 1;
                self.dispatch();
            }
            Op::Release(Mode::Exclusive) => {
                assert!(self.writer, "unlock of a SharedMutex that is not exclusively locked");
                self.writer = false;
                self.dispatch();
            }
            Op::Purge => {
                self.waiting_readers.retain(|w| !w.is_abandoned());
                self.waiting_writers.retain(|w| !w.is_abandoned());
                self.dispatch();
            }
        }
    }
}

struct RawSharedMutex {
    combiner: Combiner<State>,
}

impl Grantor for RawSharedMutex {
    type Request = Mode;

    fn submit(&self, waiter: Arc<Waiter>, mode: Mode, queue: bool) {
        self.combiner.submit(Op::Acquire { waiter, mode, queue });
    }

    fn give_back(&self, mode: Mode) {
        self.combiner.submit(Op::Release(mode));
    }

    fn purge(&self) {
        self.combiner.submit(Op::Purge);
    }

    fn is_applying_here(&self) -> bool {
        self.combiner.is_applying_here()
    }
}

/// Reader-writer lock for tasks with writer priority.
///
/// Any number of readers may hold the lock together. Once a writer is waiting,
/// readers that arrive later queue behind it, so a steady stream of readers
/// cannot starve writers. On unlock, waiting writers are served before waiting
/// readers.
pub struct SharedMutex<T: ?Sized> {
    raw: RawSharedMutex,
    data: UnsafeCell<T>,
}

unsafe impl<T: ?Sized + Send> Send for SharedMutex<T> {}
unsafe impl<T: ?Sized + Send + Sync> Sync for SharedMutex<T> {}

impl<T> SharedMutex<T> {
    pub fn new(value: T) -> Self {
        SharedMutex {
            raw: RawSharedMutex {
                combiner: Combiner::new(State::default()),
            },
            data: UnsafeCell::new(value),
        }
    }

    pub fn into_inner(self) -> T {
        self.data.into_inner()
    }
}

impl<T: ?Sized> SharedMutex<T> {
    /// Exclusive lock. Not interrupted by cancellation.
    pub async fn lock(&self) -> SharedMutexWriteGuard<'_, T> {
        acquire_uninterruptible(&self.raw, Mode::Exclusive).await;
        SharedMutexWriteGuard { mutex: self }
    }

    pub fn try_lock(&self) -> Option<SharedMutexWriteGuard<'_, T>> {
        self.raw
            .try_grant(Mode::Exclusive)
            .then_some(SharedMutexWriteGuard { mutex: self })
    }

    pub async fn lock_until(&self, deadline: Deadline) -> Result<SharedMutexWriteGuard<'_, T>, WaitError> {
        Acquire::new(&self.raw, Mode::Exclusive, Interrupts::new(deadline)).await?;
        Ok(SharedMutexWriteGuard { mutex: self })
    }

    /// Shared lock. Not interrupted by cancellation.
    pub async fn lock_shared(&self) -> SharedMutexReadGuard<'_, T> {
        acquire_uninterruptible(&self.raw, Mode::Shared).await;
        SharedMutexReadGuard { mutex: self }
    }

    pub fn try_lock_shared(&self) -> Option<SharedMutexReadGuard<'_, T>> {
        self.raw
            .try_grant(Mode::Shared)
            .then_some(SharedMutexReadGuard { mutex: self })
    }

    pub async fn lock_shared_until(
        &self,
        deadline: Deadline,
    ) -> Result<SharedMutexReadGuard<'_, T>, WaitError> {
        Acquire::new(&self.raw, Mode::Shared, Interrupts::new(deadline)).await?;
        Ok(SharedMutexReadGuard { mutex: self })
    }

    pub fn get_mut(&mut self) -> &mut T {
        self.data.get_mut()
    }
}

impl<T: Default> Default for SharedMutex<T> {
    fn default() -> Self {
        SharedMutex::new(T::default())
    }
}

impl<T: ?Sized> fmt::Debug for SharedMutex<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SharedMutex").finish_non_exhaustive()
    }
}

#[must_use = "if unused the SharedMutex will immediately unlock"]
pub struct SharedMutexReadGuard<'a, T: ?Sized> {
    mutex: &'a SharedMutex<T>,
}

impl<T: ?Sized> Deref for SharedMutexReadGuard<'_, T> {
    type Target = T;

    fn deref(&self) -> &T {
        // Safety: no writer holds the lock while a read guard exists.
        unsafe { &*self.mutex.data.get() }
    }
}

impl<T: ?Sized> Drop for SharedMutexReadGuard<'_, T> {
    fn drop(&mut self) {
        self.mutex.raw.give_back(Mode::Shared);
    }
}

#[must_use = "if unused the SharedMutex will immediately unlock"]
pub struct SharedMutexWriteGuard<'a, T: ?Sized> {
    mutex: &'a SharedMutex<T>,
}

impl<T: ?Sized> Deref for SharedMutexWriteGuard<'_, T> {
    type Target = T;

    fn deref(&self) -> &T {
        // Safety: the write guard is the only guard alive.
        unsafe { &*self.mutex.data.get() }
    }
}

impl<T: ?Sized> DerefMut for SharedMutexWriteGuard<'_, T> {
    fn deref_mut(&mut self) -> &mut T {
        // Safety: the write guard is the only guard alive.
        unsafe { &mut *self.mutex.data.get() }
    }
}

impl<T: ?Sized> Drop for SharedMutexWriteGuard<'_, T> {
    fn drop(&mut self) {
        self.mutex.raw.give_back(Mode::Exclusive);
    }
}
