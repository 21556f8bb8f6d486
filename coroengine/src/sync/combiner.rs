use crate::container::MpscQueue;
use std::cell::{Cell, UnsafeCell};
use std::fmt;
use std::ptr;

/// Single-threaded state driven by a [`Combiner`].
pub(crate) trait Combine {
    type Op: Send;

    fn apply(&mut self, op: Self::Op);
}

/// Flat combining over an intrusive MPSC queue.
///
/// Every operation is pushed as a node. Whichever thread finds the consumer
/// role free claims it and applies all queued operations, its own and those
/// of concurrent submitters, to the state. Other submitters return as soon as
/// their node is linked; results flow back through the operation itself,
/// typically a [`Waiter`](super::waiter::Waiter) that gets granted.
pub(crate) struct Combiner<S: Combine> {
    ops: MpscQueue<S::Op>,
    state: UnsafeCell<S>,
}

thread_local! {
    /// Combiner whose operations this thread is applying right now.
    static APPLYING: Cell<*const ()> = const { Cell::new(ptr::null()) };
}

/// Marks the current thread as applying a combiner's operations.
struct ApplyingGuard {
    prev: *const (),
}

impl ApplyingGuard {
    fn enter(combiner: *const ()) -> Self {
        ApplyingGuard {
            prev: APPLYING.replace(combiner),
        }
    }
}

impl Drop for ApplyingGuard {
    fn drop(&mut self) {
        let _ = APPLYING.try_with(|applying| applying.set(self.prev));
    }
}

// Safety: `state` is only touched while holding the queue's consumer role.
unsafe impl<S: Combine + Send> Send for Combiner<S> {}
unsafe impl<S: Combine + Send> Sync for Combiner<S> {}

impl<S: Combine> Combiner<S> {
    pub(crate) fn new(state: S) -> Self {
        Combiner {
            ops: MpscQueue::new(),
            state: UnsafeCell::new(state),
        }
    }

    /// Applies `op`, possibly on another thread that is combining right now.
    ///
    /// Operations submitted by one thread are applied in submission order.
    pub(crate) fn submit(&self, op: S::Op) {
        let node = self.ops.node(op);
        let Some(mut consumer) = self.ops.push_and_try_consume(node) else {
            return;
        };
        let _applying = ApplyingGuard::enter(self.id());

        loop {
            while let Some(node) = consumer.try_pop() {
                // Safety: we hold the consumer role. A re-entrant `submit` from
                // inside `apply` only pushes, it cannot claim the role.
                unsafe { (*self.state.get()).apply(node.into_inner()) };
            }

            match consumer.try_stop_consuming() {
                Ok(()) => return,
                Err(again) => consumer = again,
            }
        }
    }

    /// Whether the calling thread is inside `apply` of this combiner. Anything
    /// that waits for its own operation to be applied would spin forever here.
    pub(crate) fn is_applying_here(&self) -> bool {
        APPLYING.try_with(Cell::get).is_ok_and(|applying| applying == self.id())
    }

    fn id(&self) -> *const () {
        ptr::from_ref(self).cast()
    }

    pub(crate) fn get_mut(&mut self) -> &mut S {
        self.state.get_mut()
    }
}

impl<S: Combine> fmt::Debug for Combiner<S> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Combiner")
            .field("ops", &self.ops)
            .finish_non_exhaustive()
    }
}
