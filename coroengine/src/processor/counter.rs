use crate::striped::StripedCounter;
use crate::task::{CancellationReason, State};

/// Lifecycle counters of one processor. Bumped on every spawn and finish from
/// any thread, read rarely.
#[derive(Debug, Default)]
pub(crate) struct TaskCounters {
    created: StripedCounter,
    finished: StripedCounter,
    cancelled: StripedCounter,
    cancelled_overload: StripedCounter,
}

impl TaskCounters {
    pub(crate) fn on_created(&self) {
        self.created.increment();
    }

    pub(crate) fn on_finished(&self, state: State, reason: Option<CancellationReason>) {
        self.finished.increment();
        if state == State::Cancelled {
            self.cancelled.increment();
            if reason == Some(CancellationReason::Overload) {
                self.cancelled_overload.increment();
            }
        }
    }

    pub(crate) fn snapshot(&self, queue_len: usize) -> TaskProcessorStats {
        TaskProcessorStats {
            created: self.created.read(),
            finished: self.finished.read(),
            cancelled: self.cancelled.read(),
            cancelled_overload: self.cancelled_overload.read(),
            queue_len,
        }
    }
}

/// Point-in-time view of a processor's task counters.
///
/// Counters are read shard by shard while other threads update them, so the
/// fields are only mutually consistent once the processor is quiescent.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct TaskProcessorStats {
    pub created: u64,
    /// Tasks that reached a terminal state, cancelled ones included.
    pub finished: u64,
    pub cancelled: u64,
    /// Cancelled with [`CancellationReason::Overload`].
    pub cancelled_overload: u64,
    /// Tasks waiting in the run queues.
    pub queue_len: usize,
}

impl TaskProcessorStats {
    /// Tasks created and not finished yet.
    pub fn alive(&self) -> u64 {
        self.created.saturating_sub(self.finished)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_snapshot_classifies_outcomes() {
        let counters = TaskCounters::default();
        for _ in 0..4 {
            counters.on_created();
        }
        counters.on_finished(State::Completed, None);
        counters.on_finished(State::Completed, Some(CancellationReason::UserRequest));
        counters.on_finished(State::Cancelled, Some(CancellationReason::Overload));

        let stats = counters.snapshot(1);
        assert_eq!(
            stats,
            TaskProcessorStats {
                created: 4,
                finished: 3,
                cancelled: 1,
                cancelled_overload: 1,
                queue_len: 1,
            }
        );
        assert_eq!(stats.alive(), 1);
    }
}
