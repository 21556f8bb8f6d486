use crate::container::tagged::{AtomicTaggedIndex, NIL};
use std::cell::UnsafeCell;
use std::fmt;
use std::marker::PhantomData;
use std::mem::ManuallyDrop;
use std::ops::{Deref, DerefMut};
use std::ptr;
use std::sync::Arc;
use std::sync::atomic::{AtomicU32, Ordering};

/// One pool slot: the embedded link plus the payload.
struct Slot<T> {
    next: AtomicU32,
    value: UnsafeCell<Option<T>>,
}

impl<T> Slot<T> {
    fn vacant() -> Self {
        Slot {
            next: AtomicU32::new(NIL),
            value: UnsafeCell::new(None),
        }
    }
}

/// Growable arena of linkable nodes shared by the intrusive containers.
///
/// Slots are appended to a lock-free segmented vector and are never moved or
/// freed while the pool lives. Released slots go back to a tagged free list, so
/// in steady state acquiring a node does not allocate. Because slot memory is
/// stable, a container racing on a node that another thread just unlinked only
/// ever reads a live `next` link, and its tagged CAS rejects the stale value.
///
/// Ownership of a slot is carried by the move-only [`Node`] token. A node sits
/// in at most one container at a time: pushing consumes the token and popping
/// gives it back.
pub struct NodePool<T> {
    slots: boxcar::Vec<Slot<T>>,
    free: AtomicTaggedIndex,
}

// Safety: payloads are only reached through the unique `Node` that owns the
// slot; shared access from other threads is limited to the atomic `next` link.
unsafe impl<T: Send> Send for NodePool<T> {}
unsafe impl<T: Send> Sync for NodePool<T> {}

impl<T> NodePool<T> {
    pub fn new() -> Arc<Self> {
        Arc::new(NodePool {
            slots: boxcar::Vec::new(),
            free: AtomicTaggedIndex::empty(),
        })
    }

    /// Creates a pool with `capacity` slots already on the free list.
    pub fn with_capacity(capacity: usize) -> Arc<Self> {
        let pool = Self::new();
        for _ in 0..capacity {
            let index = pool.grow();
            pool.push_index(&pool.free, index);
        }
        pool
    }

    /// Moves `value` into a free slot and returns the owning node.
    pub fn insert(self: &Arc<Self>, value: T) -> Node<T> {
        let index = self.acquire_slot();

        // Safety: the slot was just taken off the free list, nobody else owns it.
        unsafe { *self.slot(index).value.get() = Some(value) };

        Node {
            pool: Arc::clone(self),
            index,
            _p: PhantomData,
        }
    }

    /// Total number of slots ever allocated, free or in use.
    pub fn allocated(&self) -> usize {
        self.slots.count()
    }

    /// Takes a slot without a payload, used for container sentinels.
    pub(crate) fn acquire_slot(&self) -> u32 {
        self.pop_index(&self.free).unwrap_or_else(|| self.grow())
    }

    pub(crate) fn release_slot(&self, index: u32) {
        // Safety: the caller owned the slot and gives it up here.
        drop(unsafe { (*self.slot(index).value.get()).take() });
        self.push_index(&self.free, index);
    }

    /// Reads the payload of a slot owned by the caller's container.
    ///
    /// # Safety
    ///
    /// The caller must logically own `index` and no `Node` for it may be alive.
    pub(crate) unsafe fn payload(&self, index: u32) -> Option<&T> {
        unsafe { (*self.slot(index).value.get()).as_ref() }
    }

    #[inline]
    pub(crate) fn next(&self, index: u32) -> &AtomicU32 {
        &self.slot(index).next
    }

    /// Treiber push of `index` onto `head`.
    pub(crate) fn push_index(&self, head: &AtomicTaggedIndex, index: u32) {
        let mut current = head.load(Ordering::Relaxed);
        loop {
            self.next(index).store(current.raw_index(), Ordering::Relaxed);
            match head.compare_exchange_weak(
                current,
                current.successor(index),
                Ordering::Release,
                Ordering::Relaxed,
            ) {
                Ok(()) => return,
                Err(actual) => current = actual,
            }
        }
    }

    /// Treiber pop from `head`.
    pub(crate) fn pop_index(&self, head: &AtomicTaggedIndex) -> Option<u32> {
        let mut current = head.load(Ordering::Acquire);
        loop {
            let index = current.index()?;

            // May be stale if another thread popped `index` meanwhile. The slot
            // is still allocated, and the tag makes the CAS below fail.
            let next = self.next(index).load(Ordering::Relaxed);
            match head.compare_exchange_weak(
                current,
                current.successor(next),
                Ordering::Acquire,
                Ordering::Acquire,
            ) {
                Ok(()) => return Some(index),
                Err(actual) => current = actual,
            }
        }
    }

    fn grow(&self) -> u32 {
        let index = self.slots.push(Slot::vacant());
        assert!(index < NIL as usize, "node pool exhausted the index space");
        index as u32
    }

    #[inline]
    fn slot(&self, index: u32) -> &Slot<T> {
        &self.slots[index as usize]
    }
}

impl<T> fmt::Debug for NodePool<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("NodePool")
            .field("allocated", &self.allocated())
            .field("free", &self.free)
            .finish()
    }
}

/// Unique ownership of one pool slot and its payload.
///
/// Dropping a node drops the payload and returns the slot to its pool.
pub struct Node<T> {
    pool: Arc<NodePool<T>>,
    index: u32,
    _p: PhantomData<T>,
}

impl<T> Node<T> {
    /// Moves the payload out and releases the slot.
    pub fn into_inner(self) -> T {
        let this = ManuallyDrop::new(self);
        // Safety: we own the slot and the payload is always set while a node exists.
        let value = unsafe { (*this.pool.slot(this.index).value.get()).take() };
        this.pool.release_slot(this.index);
        // Safety: `this` is never used again, the pool handle is dropped once.
        drop(unsafe { ptr::read(&this.pool) });
        value.expect("node payload missing")
    }

    pub(crate) fn belongs_to(&self, pool: &Arc<NodePool<T>>) -> bool {
        Arc::ptr_eq(&self.pool, pool)
    }

    /// Hands ownership of the slot to a container.
    pub(crate) fn into_raw(self) -> u32 {
        let this = ManuallyDrop::new(self);
        // Safety: `this` is never used again, the pool handle is dropped once.
        drop(unsafe { ptr::read(&this.pool) });
        this.index
    }

    /// Takes back ownership of a slot that was handed out by `into_raw`.
    ///
    /// # Safety
    ///
    /// `index` must come from `into_raw` on a node of `pool` and must not have
    /// been reclaimed already.
    pub(crate) unsafe fn from_raw(pool: &Arc<NodePool<T>>, index: u32) -> Self {
        Node {
            pool: Arc::clone(pool),
            index,
            _p: PhantomData,
        }
    }
}

impl<T> Deref for Node<T> {
    type Target = T;

    fn deref(&self) -> &T {
        // Safety: the node owns its slot.
        unsafe { (*self.pool.slot(self.index).value.get()).as_ref() }.expect("node payload missing")
    }
}

impl<T> DerefMut for Node<T> {
    fn deref_mut(&mut self) -> &mut T {
        // Safety: the node owns its slot and we hold `&mut self`.
        unsafe { (*self.pool.slot(self.index).value.get()).as_mut() }.expect("node payload missing")
    }
}

impl<T> Drop for Node<T> {
    fn drop(&mut self) {
        self.pool.release_slot(self.index);
    }
}

impl<T: fmt::Debug> fmt::Debug for Node<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Node")
            .field("index", &self.index)
            .field("value", &**self)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use static_assertions::{assert_impl_all, assert_not_impl_any};
    use std::cell::Cell;

    assert_impl_all!(NodePool<u64>: Send, Sync);
    assert_impl_all!(Node<u64>: Send, Sync);
    assert_not_impl_any!(Node<Cell<u64>>: Sync);
    assert_not_impl_any!(Node<u64>: Clone);

    #[test]
    fn test_slots_are_recycled() {
        let pool = NodePool::new();

        let a = pool.insert(1);
        let b = pool.insert(2);
        assert_eq!(pool.allocated(), 2);
        assert_eq!((*a, *b), (1, 2));

        drop(a);
        assert_eq!(b.into_inner(), 2);

        let _c = pool.insert(3);
        let _d = pool.insert(4);
        assert_eq!(pool.allocated(), 2);
    }

    #[test]
    fn test_with_capacity_preallocates() {
        let pool = NodePool::with_capacity(8);
        assert_eq!(pool.allocated(), 8);

        let nodes = (0..8).map(|i| pool.insert(i)).collect::<Vec<_>>();
        assert_eq!(pool.allocated(), 8);
        assert_eq!(nodes.iter().map(|n| **n).sum::<i32>(), 28);
    }

    #[test]
    fn test_payload_dropped_with_node() {
        let pool = NodePool::new();
        let payload = Arc::new(());

        let mut node = pool.insert(Arc::clone(&payload));
        assert_eq!(Arc::strong_count(&payload), 2);

        *node = Arc::new(());
        assert_eq!(Arc::strong_count(&payload), 1);

        let raw = node.into_raw();
        let node = unsafe { Node::from_raw(&pool, raw) };
        assert!(node.belongs_to(&pool));
        drop(node);
        assert_eq!(pool.allocated(), 1);
    }
}
