use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};

/// Index value meaning "no node".
pub(crate) const NIL: u32 = u32::MAX;

/// A node index paired with a modification tag.
///
/// Every successful update of a tagged head bumps the tag, so a head that went
/// from `A` to `B` and back to `A` still compares unequal to the stale `A` a
/// concurrent compare-and-swap is holding on to.
#[derive(Clone, Copy, PartialEq, Eq)]
pub(crate) struct TaggedIndex {
    index: u32,
    tag: u32,
}

impl TaggedIndex {
    pub(crate) const EMPTY: TaggedIndex = TaggedIndex { index: NIL, tag: 0 };

    #[inline]
    fn pack(self) -> u64 {
        (u64::from(self.tag) << 32) | u64::from(self.index)
    }

    #[inline]
    fn unpack(raw: u64) -> Self {
        TaggedIndex {
            index: raw as u32,
            tag: (raw >> 32) as u32,
        }
    }

    /// The referenced index, `None` when the head is empty.
    #[inline]
    pub(crate) fn index(self) -> Option<u32> {
        (self.index != NIL).then_some(self.index)
    }

    #[inline]
    pub(crate) fn raw_index(self) -> u32 {
        self.index
    }

    #[inline]
    pub(crate) fn tag(self) -> u32 {
        self.tag
    }

    /// The value to install after this one: points at `index`, tag bumped.
    #[inline]
    pub(crate) fn successor(self, index: u32) -> Self {
        TaggedIndex {
            index,
            tag: self.tag.wrapping_add(1),
        }
    }
}

impl fmt::Debug for TaggedIndex {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.index() {
            Some(index) => write!(f, "TaggedIndex({index}#{})", self.tag),
            None => write!(f, "TaggedIndex(nil#{})", self.tag),
        }
    }
}

/// A [`TaggedIndex`] stored as one atomic word.
pub(crate) struct AtomicTaggedIndex(AtomicU64);

impl AtomicTaggedIndex {
    pub(crate) const fn empty() -> Self {
        AtomicTaggedIndex(AtomicU64::new(NIL as u64))
    }

    #[inline]
    pub(crate) fn load(&self, order: Ordering) -> TaggedIndex {
        TaggedIndex::unpack(self.0.load(order))
    }

    #[inline]
    pub(crate) fn compare_exchange_weak(
        &self,
        current: TaggedIndex,
        new: TaggedIndex,
        success: Ordering,
        failure: Ordering,
    ) -> Result<(), TaggedIndex> {
        self.0
            .compare_exchange_weak(current.pack(), new.pack(), success, failure)
            .map(|_| ())
            .map_err(TaggedIndex::unpack)
    }
}

impl fmt::Debug for AtomicTaggedIndex {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.load(Ordering::Relaxed).fmt(f)
    }
}
