use crate::container::pool::{Node, NodePool};
use crate::container::tagged::NIL;
use crossbeam_utils::Backoff;
use futures::task::AtomicWaker;
use std::fmt;
use std::mem;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::task::Waker;

/// Intrusive multi-producer single-consumer queue over pool nodes.
///
/// Producers link nodes at the tail with a single `swap`; the consumer walks
/// from a stub node at the head (Vyukov's algorithm). The consumer role is not
/// bound to a thread: any producer can claim it with
/// [`push_and_try_consume`](Self::push_and_try_consume) and then drains the
/// queue on behalf of everyone else, which is how the flat-combining
/// synchronization primitives are built.
///
/// A single producer's pushes are popped in push order. Nothing is ordered
/// across producers.
pub struct MpscQueue<T> {
    pool: Arc<NodePool<T>>,

    /// Payload-less sentinel slot owned by the queue.
    stub: u32,

    /// Last linked node, producers swap themselves in here.
    tail: AtomicU32,

    /// Consumer cursor, only touched by the current consumer.
    head: AtomicU32,

    /// Whether some thread currently holds the [`Consumer`] token.
    consuming: AtomicBool,

    /// Woken by the next push, see [`Consumer::register_waiter`].
    waiter: AtomicWaker,
}

enum Pop {
    Data(u32),
    Empty,
    /// A producer swapped the tail but has not linked its node yet.
    Inconsistent,
}

impl<T> MpscQueue<T> {
    pub fn new() -> Self {
        Self::with_pool(&NodePool::new())
    }

    pub fn with_pool(pool: &Arc<NodePool<T>>) -> Self {
        let stub = pool.acquire_slot();
        pool.next(stub).store(NIL, Ordering::Relaxed);

        MpscQueue {
            pool: Arc::clone(pool),
            stub,
            tail: AtomicU32::new(stub),
            head: AtomicU32::new(stub),
            consuming: AtomicBool::new(false),
            waiter: AtomicWaker::new(),
        }
    }

    pub fn pool(&self) -> &Arc<NodePool<T>> {
        &self.pool
    }

    /// Allocates a node for `value` from the queue's pool.
    pub fn node(&self, value: T) -> Node<T> {
        self.pool.insert(value)
    }

    /// Links `node` at the tail. Never blocks.
    ///
    /// # Panics
    ///
    /// Panics if the node was allocated from a different pool.
    #[track_caller]
    pub fn push(&self, node: Node<T>) {
        assert!(
            node.belongs_to(&self.pool),
            "node pushed into a queue backed by another pool"
        );
        self.link(node.into_raw());
        self.waiter.wake();
    }

    /// Pushes `node` and tries to become the consumer.
    ///
    /// Returns `Some(consumer)` if the caller now owns the consumer role and
    /// must drain the queue until [`Consumer::try_stop_consuming`] succeeds.
    #[track_caller]
    pub fn push_and_try_consume(&self, node: Node<T>) -> Option<Consumer<'_, T>> {
        self.push(node);
        self.try_start_consuming()
    }

    /// Claims the consumer role without pushing anything.
    pub fn try_start_consuming(&self) -> Option<Consumer<'_, T>> {
        (!self.consuming.swap(true, Ordering::SeqCst)).then_some(Consumer { queue: self })
    }

    /// Approximate emptiness check, exact when called by the consumer.
    pub fn is_empty(&self) -> bool {
        self.tail.load(Ordering::SeqCst) == self.stub
            && self.head.load(Ordering::Relaxed) == self.stub
    }

    fn link(&self, index: u32) {
        self.pool.next(index).store(NIL, Ordering::Relaxed);
        let prev = self.tail.swap(index, Ordering::SeqCst);
        self.pool.next(prev).store(index, Ordering::Release);
    }

    /// One step of Vyukov's pop. Consumer only.
    fn pop_raw(&self) -> Pop {
        let mut head = self.head.load(Ordering::Relaxed);
        let mut next = self.pool.next(head).load(Ordering::Acquire);

        if head == self.stub {
            if next == NIL {
                return if self.tail.load(Ordering::Acquire) == self.stub {
                    Pop::Empty
                } else {
                    Pop::Inconsistent
                };
            }
            self.head.store(next, Ordering::Relaxed);
            head = next;
            next = self.pool.next(head).load(Ordering::Acquire);
        }

        if next != NIL {
            self.head.store(next, Ordering::Relaxed);
            return Pop::Data(head);
        }

        if self.tail.load(Ordering::Acquire) != head {
            return Pop::Inconsistent;
        }

        // `head` is the last node: re-link the stub behind it so it can go.
        self.link(self.stub);
        next = self.pool.next(head).load(Ordering::Acquire);
        if next != NIL {
            self.head.store(next, Ordering::Relaxed);
            return Pop::Data(head);
        }

        Pop::Inconsistent
    }

    /// Pops one node, spinning while a producer finishes linking.
    fn pop_spin(&self) -> Option<Node<T>> {
        let backoff = Backoff::new();
        loop {
            match self.pop_raw() {
                // Safety: the index was linked by `push`, which took it from `into_raw`.
                Pop::Data(index) => return Some(unsafe { Node::from_raw(&self.pool, index) }),
                Pop::Empty => return None,
                Pop::Inconsistent => backoff.snooze(),
            }
        }
    }
}

impl<T> Default for MpscQueue<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T> Drop for MpscQueue<T> {
    fn drop(&mut self) {
        while self.pop_spin().is_some() {}
        self.pool.release_slot(self.stub);
    }
}

impl<T> fmt::Debug for MpscQueue<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("MpscQueue")
            .field("consuming", &self.consuming.load(Ordering::Relaxed))
            .field("is_empty", &self.is_empty())
            .finish()
    }
}

/// Proof of holding the consumer role of an [`MpscQueue`].
///
/// Dropping the token gives up the role without the emptiness recheck; use
/// [`try_stop_consuming`](Self::try_stop_consuming) on the normal path.
#[must_use = "the consumer must drain the queue and stop consuming"]
pub struct Consumer<'a, T> {
    queue: &'a MpscQueue<T>,
}

impl<'a, T> Consumer<'a, T> {
    /// Pops the oldest available node.
    pub fn try_pop(&mut self) -> Option<Node<T>> {
        self.queue.pop_spin()
    }

    /// Registers a waker to be woken exactly once by the next push.
    ///
    /// Returns `false` without keeping the registration when the queue is
    /// already non-empty. Meant for a dedicated consumer about to go idle.
    /// There is one waiter slot, held by whoever owns the consumer role; a
    /// new registration replaces the previous one.
    pub fn register_waiter(&mut self, waker: &Waker) -> bool {
        let queue = self.queue;
        queue.waiter.register(waker);
        if queue.is_empty() {
            return true;
        }

        queue.waiter.take();
        false
    }

    /// Gives up the consumer role.
    ///
    /// Items pushed concurrently with the release could otherwise be stranded,
    /// so after clearing the flag the queue is checked again. If it is not
    /// empty and nobody else claimed the role, the token is handed back as
    /// `Err` and the caller must keep draining.
    pub fn try_stop_consuming(self) -> Result<(), Self> {
        let queue = self.queue;
        mem::forget(self);

        queue.consuming.store(false, Ordering::SeqCst);
        if queue.is_empty() {
            return Ok(());
        }

        match queue.try_start_consuming() {
            Some(consumer) => Err(consumer),
            None => Ok(()),
        }
    }
}

impl<T> Drop for Consumer<'_, T> {
    fn drop(&mut self) {
        self.queue.consuming.store(false, Ordering::SeqCst);
    }
}
