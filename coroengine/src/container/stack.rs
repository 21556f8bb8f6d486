use crate::container::pool::{Node, NodePool};
use crate::container::tagged::{AtomicTaggedIndex, NIL};
use std::fmt;
use std::sync::Arc;
use std::sync::atomic::Ordering;

/// Lock-free LIFO stack of pool nodes (Treiber stack).
///
/// The head is a single tagged index: every successful `push` or `try_pop`
/// bumps the tag, so a pop that raced with a pop-then-push of the same slot
/// fails its CAS instead of installing a stale `next` link.
///
/// ```
/// use coroengine::container::{IntrusiveStack, NodePool};
///
/// let pool = NodePool::new();
/// let stack = IntrusiveStack::new(&pool);
///
/// stack.push(pool.insert("a"));
/// stack.push(pool.insert("b"));
///
/// assert_eq!(stack.try_pop().map(|n| n.into_inner()), Some("b"));
/// assert_eq!(stack.try_pop().map(|n| n.into_inner()), Some("a"));
/// assert!(stack.try_pop().is_none());
/// ```
pub struct IntrusiveStack<T> {
    pool: Arc<NodePool<T>>,
    head: AtomicTaggedIndex,
}

impl<T> IntrusiveStack<T> {
    pub fn new(pool: &Arc<NodePool<T>>) -> Self {
        IntrusiveStack {
            pool: Arc::clone(pool),
            head: AtomicTaggedIndex::empty(),
        }
    }

    /// Creates a stack backed by its own pool.
    pub fn with_own_pool() -> Self {
        Self::new(&NodePool::new())
    }

    pub fn pool(&self) -> &Arc<NodePool<T>> {
        &self.pool
    }

    /// Pushes `node` on top of the stack. Never fails, retries on contention.
    ///
    /// # Panics
    ///
    /// Panics if the node was allocated from a different pool.
    #[track_caller]
    pub fn push(&self, node: Node<T>) {
        assert!(
            node.belongs_to(&self.pool),
            "node pushed onto a stack backed by another pool"
        );
        let index = node.into_raw();
        self.pool.push_index(&self.head, index);
    }

    /// Pops the most recently pushed node.
    pub fn try_pop(&self) -> Option<Node<T>> {
        self.pool
            .pop_index(&self.head)
            // Safety: the index was linked by `push`, which took it from `into_raw`.
            .map(|index| unsafe { Node::from_raw(&self.pool, index) })
    }

    pub fn is_empty(&self) -> bool {
        self.head.load(Ordering::Acquire).index().is_none()
    }

    /// Visits every linked payload from top to bottom.
    ///
    /// Requires exclusive access, no concurrent `push` or `try_pop` can run.
    pub fn walk<F: FnMut(&T)>(&mut self, mut f: F) {
        let mut cursor = self.head.load(Ordering::Acquire).raw_index();
        while cursor != NIL {
            // Safety: `&mut self` guarantees the chain is stable, linked nodes
            // are logically owned by this stack.
            if let Some(value) = unsafe { self.pool.payload(cursor) } {
                f(value);
            }
            cursor = self.pool.next(cursor).load(Ordering::Relaxed);
        }
    }

    /// Unlinks every node and passes it to `f`.
    pub fn dispose_all<F: FnMut(Node<T>)>(&mut self, mut f: F) {
        while let Some(node) = self.try_pop() {
            f(node);
        }
    }
}

impl<T> Drop for IntrusiveStack<T> {
    fn drop(&mut self) {
        self.dispose_all(drop);
    }
}

impl<T> fmt::Debug for IntrusiveStack<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("IntrusiveStack")
            .field("head", &self.head)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rstest::rstest;
    use static_assertions::assert_impl_all;
    use std::collections::HashSet;
    use std::sync::Barrier;
    use std::thread;

    assert_impl_all!(IntrusiveStack<u64>: Send, Sync);

    #[test]
    fn test_lifo_order() {
        let pool = NodePool::new();
        let stack = IntrusiveStack::new(&pool);
        assert!(stack.is_empty());

        for i in 0..5 {
            stack.push(pool.insert(i));
        }

        let popped = std::iter::from_fn(|| stack.try_pop().map(Node::into_inner)).collect::<Vec<_>>();
        assert_eq!(popped, vec![4, 3, 2, 1, 0]);
        assert!(stack.is_empty());
    }

    #[test]
    fn test_walk_and_dispose_all() {
        let mut stack = IntrusiveStack::with_own_pool();
        for i in 1..=4u32 {
            let node = stack.pool().insert(i);
            stack.push(node);
        }

        let mut seen = Vec::new();
        stack.walk(|v| seen.push(*v));
        assert_eq!(seen, vec![4, 3, 2, 1]);

        // Walking does not unlink.
        let mut total = 0;
        stack.dispose_all(|node| total += node.into_inner());
        assert_eq!(total, 10);
        assert!(stack.is_empty());
    }

    #[test]
    #[should_panic(expected = "another pool")]
    fn test_foreign_node_rejected() {
        let stack = IntrusiveStack::with_own_pool();
        let other = NodePool::new();
        stack.push(other.insert(1));
    }

    #[rstest]
    #[case::two_threads(2, 10_000)]
    #[case::eight_threads(8, 5_000)]
    fn test_concurrent_push_pop_no_loss_no_duplication(
        #[case] num_threads: usize,
        #[case] per_thread: usize,
    ) {
        let stack = Arc::new(IntrusiveStack::with_own_pool());
        let barrier = Arc::new(Barrier::new(num_threads));

        // Every thread pushes uniquely tagged nodes and pops greedily while
        // pushing, so the same slots are recycled under contention.
        let handles = (0..num_threads)
            .map(|t| {
                let stack = Arc::clone(&stack);
                let barrier = Arc::clone(&barrier);
                thread::spawn(move || {
                    barrier.wait();
                    let mut popped = Vec::new();
                    for i in 0..per_thread {
                        let node = stack.pool().insert((t, i));
                        stack.push(node);
                        if i % 2 == 0
                            && let Some(node) = stack.try_pop()
                        {
                            popped.push(node.into_inner());
                        }
                    }
                    popped
                })
            })
            .collect::<Vec<_>>();

        let mut all = handles
            .into_iter()
            .flat_map(|h| h.join().unwrap())
            .collect::<Vec<_>>();
        while let Some(node) = stack.try_pop() {
            all.push(node.into_inner());
        }

        let unique = all.iter().copied().collect::<HashSet<_>>();
        assert_eq!(all.len(), num_threads * per_thread);
        assert_eq!(unique.len(), all.len());
        assert!(unique.iter().all(|(t, i)| *t < num_threads && *i < per_thread));
    }
}
