use crate::TaskProcessor;
use anyhow::Result;
use crossbeam_utils::Backoff;
use futures::task::{ArcWake, waker};
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::task::Waker;
use std::time::{Duration, Instant};

/// Waker that only counts how often it was woken.
#[derive(Debug, Default)]
pub(crate) struct WakeCounter(AtomicUsize);

impl WakeCounter {
    pub(crate) fn count(&self) -> usize {
        self.0.load(Ordering::SeqCst)
    }
}

impl ArcWake for WakeCounter {
    fn wake_by_ref(arc_self: &Arc<Self>) {
        arc_self.0.fetch_add(1, Ordering::SeqCst);
    }
}

pub(crate) fn counting_waker() -> (Arc<WakeCounter>, Waker) {
    let counter = Arc::new(WakeCounter::default());
    let waker = waker(Arc::clone(&counter));
    (counter, waker)
}

pub(crate) fn init_processor(worker_threads: usize) -> Result<TaskProcessor> {
    TaskProcessor::builder().worker_threads(worker_threads).try_build()
}

/// Spins until `cond` holds, giving up after `timeout`.
pub(crate) fn spin_until<F: Fn() -> bool>(cond: F, timeout: Duration) -> bool {
    let deadline = Instant::now() + timeout;
    let backoff = Backoff::new();
    while !cond() {
        if Instant::now() >= deadline {
            return false;
        }
        backoff.snooze();
        if backoff.is_completed() {
            std::thread::yield_now();
        }
    }
    true
}
