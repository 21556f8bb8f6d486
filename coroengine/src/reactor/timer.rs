use crate::container::MpscQueue;
use crate::processor::ThreadNameFn;
use crate::utils::thread::{ThreadUnparker, spawn_named};
use anyhow::{Result, anyhow};
use parking_lot::Mutex;
use std::cmp::Ordering;
use std::collections::BinaryHeap;
use std::collections::binary_heap::PeekMut;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering as AtomicOrdering};
use std::task::Waker;
use std::thread::{self, JoinHandle};
use std::time::Instant;

struct TimerEntry {
    at: Instant,
    /// Tie-breaker so equal deadlines fire in registration order.
    seq: u64,
    waker: Waker,
    cancelled: Arc<AtomicBool>,
}

// Reversed so the `BinaryHeap` max is the earliest deadline.
impl Ord for TimerEntry {
    fn cmp(&self, other: &Self) -> Ordering {
        other
            .at
            .cmp(&self.at)
            .then_with(|| other.seq.cmp(&self.seq))
    }
}

impl PartialOrd for TimerEntry {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl PartialEq for TimerEntry {
    fn eq(&self, other: &Self) -> bool {
        self.at == other.at && self.seq == other.seq
    }
}

impl Eq for TimerEntry {}

enum Command {
    Add {
        at: Instant,
        waker: Waker,
        cancelled: Arc<AtomicBool>,
    },
    Shutdown,
}

/// Cancels the timer when dropped. A cancelled timer never wakes its waker.
#[derive(Debug)]
pub(crate) struct TimerHandle {
    /// Set by whoever settles the entry first: this handle, or the timer
    /// thread when it fires or drops it.
    cancelled: Arc<AtomicBool>,
    stale: Arc<AtomicUsize>,
}

impl TimerHandle {
    pub(crate) fn cancel(&self) {
        // Counted before the flag is set, so a purge never removes an entry
        // the count does not include yet.
        self.stale.fetch_add(1, AtomicOrdering::AcqRel);
        if self.cancelled.swap(true, AtomicOrdering::AcqRel) {
            self.stale.fetch_sub(1, AtomicOrdering::AcqRel);
        }
    }
}

impl Drop for TimerHandle {
    fn drop(&mut self) {
        self.cancel();
    }
}

/// One event thread owning a deadline heap. Registrations reach it through
/// an MPSC queue so producers never take a lock.
pub(crate) struct TimerThread {
    commands: Arc<MpscQueue<Command>>,
    /// Cancelled entries still sitting in the heap.
    stale: Arc<AtomicUsize>,
    handle: Mutex<Option<JoinHandle<()>>>,
}

impl TimerThread {
    pub(crate) fn spawn(name_fn: &ThreadNameFn) -> Result<Self> {
        let commands = Arc::new(MpscQueue::new());
        let stale = Arc::new(AtomicUsize::new(0));

        let handle = {
            let commands = Arc::clone(&commands);
            let stale = Arc::clone(&stale);
            spawn_named(name_fn, None, move || run(&commands, &stale))?
        };

        Ok(TimerThread {
            commands,
            stale,
            handle: Mutex::new(Some(handle)),
        })
    }

    pub(crate) fn add(&self, at: Instant, waker: Waker) -> TimerHandle {
        let cancelled = Arc::new(AtomicBool::new(false));
        let node = self.commands.node(Command::Add {
            at,
            waker,
            cancelled: Arc::clone(&cancelled),
        });
        self.commands.push(node);
        TimerHandle {
            cancelled,
            stale: Arc::clone(&self.stale),
        }
    }

    /// Stops the thread; pending timers are dropped without firing.
    pub(crate) fn stop(&self) -> Result<()> {
        let Some(handle) = self.handle.lock().take() else {
            return Ok(());
        };

        self.commands.push(self.commands.node(Command::Shutdown));
        handle
            .join()
            .map_err(|_| anyhow!("timer thread panicked"))
    }
}

fn run(commands: &MpscQueue<Command>, stale: &AtomicUsize) {
    let Some(mut consumer) = commands.try_start_consuming() else {
        panic!("timer queue already has a consumer");
    };
    let waker = ThreadUnparker::current();
    let mut heap = BinaryHeap::<TimerEntry>::new();
    let mut seq = 0u64;

    loop {
        while let Some(node) = consumer.try_pop() {
            match node.into_inner() {
                Command::Add {
                    at,
                    waker,
                    cancelled,
                } => {
                    seq += 1;
                    heap.push(TimerEntry {
                        at,
                        seq,
                        waker,
                        cancelled,
                    });
                }
                Command::Shutdown => {
                    tracing::trace!(pending = heap.len(), "timer thread shutting down");
                    return;
                }
            }
        }

        purge_cancelled(&mut heap, stale);

        let now = Instant::now();
        while let Some(entry) = heap.peek_mut() {
            if entry.at > now && !entry.cancelled.load(AtomicOrdering::Acquire) {
                break;
            }
            let entry = PeekMut::pop(entry);
            if entry.cancelled.swap(true, AtomicOrdering::AcqRel) {
                stale.fetch_sub(1, AtomicOrdering::AcqRel);
            } else {
                entry.waker.wake();
            }
        }

        if !consumer.register_waiter(&waker) {
            continue;
        }

        match heap.peek() {
            Some(next) => thread::park_timeout(next.at.saturating_duration_since(Instant::now())),
            None => thread::park(),
        }
    }
}

/// Rebuilds the heap once cancelled entries make up more than half of it, so
/// their wakers are not kept alive until their deadline.
fn purge_cancelled(heap: &mut BinaryHeap<TimerEntry>, stale: &AtomicUsize) {
    let cancelled = stale.load(AtomicOrdering::Acquire);
    if cancelled == 0 || cancelled * 2 <= heap.len() {
        return;
    }

    let before = heap.len();
    heap.retain(|entry| !entry.cancelled.load(AtomicOrdering::Acquire));
    let removed = before - heap.len();
    stale.fetch_sub(removed, AtomicOrdering::AcqRel);
    tracing::trace!(removed, remaining = heap.len(), "purged cancelled timers");
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_utils::{WakeCounter, counting_waker};
    use futures::task::ArcWake;
    use std::time::Duration;

    fn timer_thread() -> Result<TimerThread> {
        TimerThread::spawn(&ThreadNameFn(Arc::new(|| "coro-timer-test".to_owned())))
    }

    fn wait_for(counter: &WakeCounter, expected: usize) {
        let deadline = Instant::now() + Duration::from_secs(5);
        while counter.count() < expected {
            assert!(Instant::now() < deadline, "timer did not fire");
            thread::sleep(Duration::from_millis(1));
        }
    }

    struct Recorder {
        id: u8,
        log: Arc<Mutex<Vec<u8>>>,
    }

    impl ArcWake for Recorder {
        fn wake_by_ref(arc_self: &Arc<Self>) {
            arc_self.log.lock().push(arc_self.id);
        }
    }

    #[test]
    fn test_fires_in_deadline_order() -> Result<()> {
        let timers = timer_thread()?;
        let log = Arc::new(Mutex::new(Vec::new()));
        let waker = |id| futures::task::waker(Arc::new(Recorder { id, log: Arc::clone(&log) }));

        let start = Instant::now();
        let _late = timers.add(start + Duration::from_millis(30), waker(2));
        let _early = timers.add(start + Duration::from_millis(5), waker(1));
        let _tie = timers.add(start + Duration::from_millis(30), waker(3));

        let deadline = Instant::now() + Duration::from_secs(5);
        while log.lock().len() < 3 {
            assert!(Instant::now() < deadline, "timers did not fire");
            thread::sleep(Duration::from_millis(1));
        }

        assert!(start.elapsed() >= Duration::from_millis(30));
        assert_eq!(*log.lock(), vec![1, 2, 3]);
        timers.stop()
    }

    #[test]
    fn test_cancelled_timer_never_fires() -> Result<()> {
        let timers = timer_thread()?;
        let (counter, waker) = counting_waker();

        let cancelled = timers.add(Instant::now() + Duration::from_millis(10), waker.clone());
        drop(cancelled);
        let _kept = timers.add(Instant::now() + Duration::from_millis(20), waker);

        wait_for(&counter, 1);
        thread::sleep(Duration::from_millis(20));
        assert_eq!(counter.count(), 1);

        timers.stop()?;
        // Stopping twice is a no-op.
        timers.stop()
    }

    #[test]
    fn test_cancelled_timers_release_their_wakers() -> Result<()> {
        let timers = timer_thread()?;
        let (_, live_waker) = counting_waker();
        let _live = timers.add(Instant::now() + Duration::from_secs(60), live_waker);

        let (held, waker) = counting_waker();
        let far = (0..1000)
            .map(|_| timers.add(Instant::now() + Duration::from_secs(3600), waker.clone()))
            .collect::<Vec<_>>();
        drop(waker);

        // Once this fires every far timer sits in the heap.
        let (fired, short_waker) = counting_waker();
        let _first = timers.add(Instant::now() + Duration::from_millis(5), short_waker.clone());
        wait_for(&fired, 1);
        assert_eq!(Arc::strong_count(&held), 1001);

        drop(far);
        let _second = timers.add(Instant::now() + Duration::from_millis(5), short_waker);
        wait_for(&fired, 2);

        assert_eq!(Arc::strong_count(&held), 1);
        assert_eq!(timers.stale.load(AtomicOrdering::SeqCst), 0);
        timers.stop()
    }

    #[test]
    fn test_handle_dropped_after_firing_is_not_stale() -> Result<()> {
        let timers = timer_thread()?;
        let (fired, waker) = counting_waker();

        let handle = timers.add(Instant::now(), waker);
        wait_for(&fired, 1);
        drop(handle);

        assert_eq!(timers.stale.load(AtomicOrdering::SeqCst), 0);
        timers.stop()
    }
}
