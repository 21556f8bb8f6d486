use crate::deadline::Deadline;
use crate::error::SemaphoreError;
use crate::sync::combiner::{Combine, Combiner};
use crate::sync::waiter::{Acquire, Grantor, Interrupts, Waiter};
use std::collections::VecDeque;
use std::fmt;
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

enum Op {
    Acquire {
        waiter: Arc<Waiter>,
        count: usize,
        queue: bool,
    },
    Release(usize),
    Purge,
}

struct State {
    capacity: usize,
    acquired: usize,
    waiters: VecDeque<(Arc<Waiter>, usize)>,
    /// Mirror of `capacity - acquired` readable without combining.
    available: Arc<AtomicUsize>,
}

impl State {
    fn fits(&self, count: usize) -> bool {
        self.acquired + count <= self.capacity
    }

    /// Grants queued requests in order while they fit.
    fn dispatch(&mut self) {
        while let Some((waiter, count)) = self.waiters.front() {
            if waiter.is_abandoned() {
                self.waiters.pop_front();
                continue;
            }
            if !self.fits(*count) {
                break;
            }
            let count = *count;
            if waiter.grant() {
                self.acquired += count;
            }
            self.waiters.pop_front();
        }
    }

    fn publish(&self) {
        self.available
            .store(self.capacity - self.acquired, Ordering::Release);
    }
}

impl Combine for State {
    type Op = Op;

    fn apply(&mut self, op: Op) {
        match op {
            Op::Acquire {
                waiter,
                count,
                queue,
            } => {
                // Newcomers never overtake queued requests.
                if self.waiters.is_empty() && self.fits(count) {
                    if waiter.grant() {
                        self.acquired += count;
                    }
                } else if queue {
                    self.waiters.push_back((waiter, count));
                } else {
                    waiter.reject();
                }
            }
            Op::Release(count) => {
                assert!(count <= self.acquired, "semaphore released more than acquired");
                self.acquired -= count;
                self.dispatch();
            }
            Op::Purge => {
                self.waiters.retain(|(w, _)| !w.is_abandoned());
                self.dispatch();
            }
        }
        self.publish();
    }
}

struct RawSemaphore {
    combiner: Combiner<State>,
}

impl Grantor for RawSemaphore {
    type Request = usize;

    fn submit(&self, waiter: Arc<Waiter>, count: usize, queue: bool) {
        self.combiner.submit(Op::Acquire {
            waiter,
            count,
            queue,
        });
    }

    fn give_back(&self, count: usize) {
        self.combiner.submit(Op::Release(count));
    }

    fn purge(&self) {
        self.combiner.submit(Op::Purge);
    }

    fn is_applying_here(&self) -> bool {
        self.combiner.is_applying_here()
    }
}

/// Counting semaphore handing out up to `capacity` tokens.
///
/// Waiting tasks are suspended, not spun. Requests are served in arrival
/// order as long as they fit; a large request at the head holds back smaller
/// ones behind it, which keeps it from starving. That ordering is best effort
/// across concurrently arriving requests.
pub struct Semaphore {
    raw: RawSemaphore,
    capacity: usize,
    available: Arc<AtomicUsize>,
}

impl Semaphore {
    pub fn new(capacity: usize) -> Self {
        let available = Arc::new(AtomicUsize::new(capacity));
        Semaphore {
            raw: RawSemaphore {
                combiner: Combiner::new(State {
                    capacity,
                    acquired: 0,
                    waiters: VecDeque::new(),
                    available: Arc::clone(&available),
                }),
            },
            capacity,
            available,
        }
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// Tokens currently not held. Racy by nature, for diagnostics.
    pub fn remaining_approx(&self) -> usize {
        self.available.load(Ordering::Acquire)
    }

    pub async fn lock_shared(&self) -> Result<SemaphoreLock<'_>, SemaphoreError> {
        self.lock_shared_count_until(1, Deadline::unreachable()).await
    }

    pub async fn lock_shared_count(&self, count: usize) -> Result<SemaphoreLock<'_>, SemaphoreError> {
        self.lock_shared_count_until(count, Deadline::unreachable()).await
    }

    pub async fn lock_shared_until(&self, deadline: Deadline) -> Result<SemaphoreLock<'_>, SemaphoreError> {
        self.lock_shared_count_until(1, deadline).await
    }

    pub async fn lock_shared_for(&self, timeout: Duration) -> Result<SemaphoreLock<'_>, SemaphoreError> {
        self.lock_shared_count_until(1, Deadline::from_duration(timeout))
            .await
    }

    /// Acquires `count` tokens, suspending until they are available, the
    /// deadline passes or the task is cancelled.
    pub async fn lock_shared_count_until(
        &self,
        count: usize,
        deadline: Deadline,
    ) -> Result<SemaphoreLock<'_>, SemaphoreError> {
        self.check_reachable(count)?;
        Acquire::new(&self.raw, count, Interrupts::new(deadline)).await?;
        Ok(SemaphoreLock {
            semaphore: self,
            count,
        })
    }

    pub fn try_lock_shared(&self) -> Option<SemaphoreLock<'_>> {
        self.try_lock_shared_count(1).ok().flatten()
    }

    /// `Ok(None)` when the tokens are busy right now.
    pub fn try_lock_shared_count(
        &self,
        count: usize,
    ) -> Result<Option<SemaphoreLock<'_>>, SemaphoreError> {
        self.check_reachable(count)?;
        Ok(self.raw.try_grant(count).then_some(SemaphoreLock {
            semaphore: self,
            count,
        }))
    }

    fn check_reachable(&self, count: usize) -> Result<(), SemaphoreError> {
        if count > self.capacity {
            return Err(SemaphoreError::Unreachable {
                requested: count,
                capacity: self.capacity,
            });
        }
        Ok(())
    }
}

impl fmt::Debug for Semaphore {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Semaphore")
            .field("capacity", &self.capacity)
            .field("remaining", &self.remaining_approx())
            .finish()
    }
}

/// Tokens held from a [`Semaphore`], released on drop.
#[must_use = "if unused the tokens are released immediately"]
#[derive(Debug)]
pub struct SemaphoreLock<'a> {
    semaphore: &'a Semaphore,
    count: usize,
}

impl SemaphoreLock<'_> {
    pub fn count(&self) -> usize {
        self.count
    }

    /// Releases the tokens now, same as dropping the lock.
    pub fn unlock_shared(self) {}
}

impl Drop for SemaphoreLock<'_> {
    fn drop(&mut self) {
        if self.count > 0 {
            self.semaphore.raw.give_back(self.count);
        }
    }
}
