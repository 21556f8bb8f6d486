use crate::sync::combiner::{Combine, Combiner};
use crate::sync::waiter::Waiter;
use smallvec::SmallVec;
use std::sync::Arc;

const MIN_PURGE_THRESHOLD: usize = 16;

/// Most tasks are awaited by their owner only, keep that case off the heap.
const INLINE_WAITERS: usize = 2;

enum Op {
    Append(Arc<Waiter>),
    WakeupAll,
}

struct State {
    waiters: SmallVec<[Arc<Waiter>; INLINE_WAITERS]>,
    /// Set by the first `WakeupAll`; later appends are granted immediately.
    signaled: bool,
    purge_threshold: usize,
}

impl Combine for State {
    type Op = Op;

    fn apply(&mut self, op: Op) {
        match op {
            Op::Append(waiter) if self.signaled => {
                waiter.grant();
            }
            Op::Append(waiter) => {
                if self.waiters.len() >= self.purge_threshold {
                    self.waiters.retain(|w| !w.is_abandoned());
                    self.purge_threshold = (self.waiters.len() * 2).max(MIN_PURGE_THRESHOLD);
                }
                self.waiters.push(waiter);
            }
            Op::WakeupAll => {
                self.signaled = true;
                for waiter in self.waiters.drain(..) {
                    waiter.grant();
                }
            }
        }
    }
}

/// One-shot broadcast list: every waiter appended before or after the single
/// [`wakeup_all`](Self::wakeup_all) gets granted. Used for task completion.
///
/// Waiters that time out are abandoned in place and swept out lazily once the
/// list grows.
pub(crate) struct WaitList {
    combiner: Combiner<State>,
}

impl WaitList {
    pub(crate) fn new() -> Self {
        WaitList {
            combiner: Combiner::new(State {
                waiters: SmallVec::new(),
                signaled: false,
                purge_threshold: MIN_PURGE_THRESHOLD,
            }),
        }
    }

    pub(crate) fn append(&self, waiter: Arc<Waiter>) {
        self.combiner.submit(Op::Append(waiter));
    }

    pub(crate) fn wakeup_all(&self) {
        self.combiner.submit(Op::WakeupAll);
    }
}

impl std::fmt::Debug for WaitList {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("WaitList").finish_non_exhaustive()
    }
}
