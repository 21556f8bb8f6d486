use crate::container::IntrusiveStack;
use std::sync::OnceLock;
use std::sync::atomic::{AtomicBool, Ordering, fence};
use std::thread::{self, Thread};

/// Per-worker parking slot.
#[derive(Debug, Default)]
struct Slot {
    thread: OnceLock<Thread>,

    /// Set by whoever wakes the worker, consumed by the worker.
    unparked: AtomicBool,

    /// The worker index is currently linked into the idle stack.
    in_idle: AtomicBool,
}

/// State shared by all workers of one processor: the shutdown flag and the
/// parking lot of idle workers.
#[derive(Debug)]
pub(crate) struct Shared {
    pub(crate) shutdown: AtomicBool,

    slots: Box<[Slot]>,

    /// LIFO collection of idle worker indices. The most recently parked worker
    /// is woken first as its caches are the hottest.
    idle: IntrusiveStack<usize>,
}

impl Shared {
    pub(crate) fn new(num_workers: usize) -> Self {
        Self {
            shutdown: AtomicBool::new(false),
            slots: (0..num_workers).map(|_| Slot::default()).collect(),
            idle: IntrusiveStack::with_own_pool(),
        }
    }

    #[track_caller]
    pub(crate) fn register_worker(&self, index: usize) {
        let registered = self.slots[index].thread.set(thread::current()).is_ok();
        assert!(registered, "worker {index} registered twice");
    }

    pub(crate) fn is_shutdown(&self) -> bool {
        self.shutdown.load(Ordering::Acquire)
    }

    /// Parks worker `index` until it is handed new work or the processor shuts
    /// down.
    ///
    /// The worker publishes itself as idle first and then re-checks for work,
    /// while schedulers publish work first and then look for an idle worker.
    /// With a full fence on both sides one of them always sees the other.
    pub(crate) fn park<F: Fn() -> bool>(&self, index: usize, has_work: F) {
        let slot = &self.slots[index];

        if !slot.in_idle.swap(true, Ordering::AcqRel) {
            self.idle.push(self.idle.pool().insert(index));
        }
        fence(Ordering::SeqCst);

        if has_work() {
            // Our idle entry goes stale, `unpark_one` skips it.
            slot.in_idle.store(false, Ordering::Release);
            return;
        }

        // Loop to account for spurious wakeups as per docs.
        while !slot.unparked.swap(false, Ordering::Acquire) {
            if self.is_shutdown() {
                return;
            }
            thread::park();
        }
    }

    /// Wakes the most recently parked worker. Callers publish their work and
    /// issue a `SeqCst` fence before.
    pub(crate) fn unpark_one(&self) -> bool {
        while let Some(node) = self.idle.try_pop() {
            let index = node.into_inner();
            if self.slots[index].in_idle.swap(false, Ordering::AcqRel) {
                return self.wake(index);
            }
        }
        false
    }

    pub(crate) fn unpark_all(&self) -> usize {
        while let Some(node) = self.idle.try_pop() {
            drop(node);
        }
        (0..self.slots.len()).map(|index| self.wake(index)).filter(|woken| *woken).count()
    }

    fn wake(&self, index: usize) -> bool {
        let slot = &self.slots[index];
        slot.in_idle.store(false, Ordering::Release);
        slot.unparked.store(true, Ordering::Release);
        match slot.thread.get() {
            Some(thread) => {
                thread.unpark();
                true
            }
            None => false,
        }
    }

    #[cfg(test)]
    pub(crate) fn num_idle(&mut self) -> usize {
        let mut count = 0;
        self.idle.walk(|_| count += 1);
        count
    }
}
