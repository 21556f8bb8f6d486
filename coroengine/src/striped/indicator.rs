use crate::striped::StripedCounter;
use std::fmt;
use std::sync::atomic::{Ordering, fence};

/// Answers "is anyone still holding this object" without a shared refcount.
///
/// Two striped counters grow monotonically: `acquired` on every [`lock`] or
/// clone of a lock, `released` on every drop. The object is free when both
/// sums agree.
///
/// [`lock`]: StripedReadIndicator::lock
pub struct StripedReadIndicator {
    acquired: StripedCounter,
    released: StripedCounter,
}

impl StripedReadIndicator {
    pub fn new() -> Self {
        StripedReadIndicator {
            acquired: StripedCounter::new(),
            released: StripedCounter::new(),
        }
    }

    /// Marks the caller as a reader until the returned token is dropped.
    pub fn lock(&self) -> ReadIndicatorLock<'_> {
        self.acquired.increment();
        // Pairs with the fence in `is_free`: either the checker sees this
        // acquisition or the reader sees whatever the checker published first.
        fence(Ordering::SeqCst);
        ReadIndicatorLock { indicator: self }
    }

    /// Returns `true` if no lock is alive.
    ///
    /// `released` is summed before and after `acquired`. The sums are taken
    /// shard by shard, so a lock cloned onto another shard while the first
    /// original is released can make a single pass balance out by accident;
    /// requiring both `released` passes to agree rules that out.
    pub fn is_free(&self) -> bool {
        let released_before = self.released.read();
        fence(Ordering::SeqCst);
        let acquired = self.acquired.read();
        fence(Ordering::SeqCst);
        let released_after = self.released.read();

        acquired == released_before && released_before == released_after
    }

    /// Number of locks ever taken.
    pub fn acquired_count(&self) -> u64 {
        self.acquired.read()
    }
}

impl Default for StripedReadIndicator {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Debug for StripedReadIndicator {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("StripedReadIndicator")
            .field("acquired", &self.acquired.read())
            .field("released", &self.released.read())
            .finish()
    }
}

/// RAII token of a [`StripedReadIndicator`] reader.
///
/// Cloning takes a new lock on the calling thread's shard; the token can be
/// moved to and dropped on any thread.
#[must_use = "the indicator is released as soon as the lock is dropped"]
pub struct ReadIndicatorLock<'a> {
    indicator: &'a StripedReadIndicator,
}

impl Clone for ReadIndicatorLock<'_> {
    fn clone(&self) -> Self {
        self.indicator.lock()
    }
}

impl Drop for ReadIndicatorLock<'_> {
    fn drop(&mut self) {
        // Writes made under the lock must be visible to whoever observes the
        // release count.
        fence(Ordering::Release);
        self.indicator.released.increment();
    }
}

impl fmt::Debug for ReadIndicatorLock<'_> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ReadIndicatorLock").finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use static_assertions::assert_impl_all;
    use std::sync::atomic::{AtomicBool, AtomicUsize};
    use std::sync::mpsc;
    use std::thread;

    assert_impl_all!(StripedReadIndicator: Send, Sync);
    assert_impl_all!(ReadIndicatorLock<'static>: Send, Sync, Clone);

    #[test]
    fn test_lock_unlock() {
        let indicator = StripedReadIndicator::new();
        assert!(indicator.is_free());

        let lock = indicator.lock();
        assert!(!indicator.is_free());

        let copy = lock.clone();
        drop(lock);
        assert!(!indicator.is_free());

        drop(copy);
        assert!(indicator.is_free());
        assert_eq!(indicator.acquired_count(), 2);
    }

    #[test]
    fn test_never_free_while_lock_migrates_between_threads() {
        let indicator = StripedReadIndicator::new();
        let stop = AtomicBool::new(false);
        let checker_done = AtomicBool::new(false);
        let checks = AtomicUsize::new(0);

        thread::scope(|s| {
            let (to_b, from_a) = mpsc::channel::<ReadIndicatorLock<'_>>();
            let (to_a, from_b) = mpsc::channel::<ReadIndicatorLock<'_>>();
            let (indicator, stop, checker_done, checks) = (&indicator, &stop, &checker_done, &checks);

            // A single logical lock bounces between two threads. Each hop
            // clones it on the receiving thread before dropping the original,
            // so at least one token is alive at every instant.
            to_b.send(indicator.lock()).unwrap();

            s.spawn(move || {
                while checks.load(Ordering::Relaxed) == 0 {
                    thread::yield_now();
                }
                for _ in 0..2_000 {
                    let Ok(lock) = from_b.recv() else { break };
                    let copy = lock.clone();
                    drop(lock);
                    to_b.send(copy).unwrap();
                }
                // Keep both channels open, and thus a token alive, until the
                // checker is done.
                stop.store(true, Ordering::SeqCst);
                while !checker_done.load(Ordering::SeqCst) {
                    thread::yield_now();
                }
            });

            s.spawn(move || {
                while let Ok(lock) = from_a.recv() {
                    let copy = lock.clone();
                    drop(lock);
                    if to_a.send(copy).is_err() {
                        break;
                    }
                }
            });

            s.spawn(move || {
                while !stop.load(Ordering::SeqCst) {
                    assert!(!indicator.is_free());
                    checks.fetch_add(1, Ordering::Relaxed);
                }
                checker_done.store(true, Ordering::SeqCst);
            });
        });

        assert!(checks.load(Ordering::Relaxed) > 0);
        assert!(indicator.is_free());
    }
}
