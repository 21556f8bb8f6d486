use crossbeam_utils::CachePadded;
use std::cell::Cell;
use std::fmt;
use std::sync::OnceLock;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::thread;

/// Sharded monotonic counter.
///
/// `add` touches the shard picked for the calling thread:
/// - the current CPU (`sched_getcpu`, served from the vDSO on Linux),
/// - else a shard assigned round-robin to the thread on first use,
/// - else, while thread-locals are being torn down, one fallback atomic.
///
/// `read` sums all shards. The sum is only approximately consistent with
/// concurrent writers, which is fine for liveness checks and statistics.
pub struct StripedCounter {
    shards: Box<[CachePadded<AtomicU64>]>,
    fallback: CachePadded<AtomicU64>,
    mask: usize,
}

impl StripedCounter {
    /// Creates a counter with one shard per CPU, rounded up to a power of two.
    pub fn new() -> Self {
        Self::with_shards(default_shard_count())
    }

    #[track_caller]
    pub fn with_shards(shards: usize) -> Self {
        assert!(shards > 0, "striped counter needs at least one shard");
        let shards = shards.next_power_of_two();

        StripedCounter {
            shards: (0..shards).map(|_| CachePadded::new(AtomicU64::new(0))).collect(),
            fallback: CachePadded::new(AtomicU64::new(0)),
            mask: shards - 1,
        }
    }

    #[inline]
    pub fn add(&self, delta: u64) {
        match current_shard(self.mask) {
            Some(shard) => self.shards[shard].fetch_add(delta, Ordering::Relaxed),
            None => self.fallback.fetch_add(delta, Ordering::Relaxed),
        };
    }

    #[inline]
    pub fn increment(&self) {
        self.add(1);
    }

    /// Sums all shards.
    pub fn read(&self) -> u64 {
        self.shards
            .iter()
            .map(|shard| shard.load(Ordering::Acquire))
            .fold(self.fallback.load(Ordering::Acquire), u64::wrapping_add)
    }

    pub fn num_shards(&self) -> usize {
        self.shards.len()
    }
}

impl Default for StripedCounter {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Debug for StripedCounter {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("StripedCounter")
            .field("value", &self.read())
            .field("shards", &self.shards.len())
            .finish()
    }
}

fn default_shard_count() -> usize {
    static SHARDS: OnceLock<usize> = OnceLock::new();
    *SHARDS.get_or_init(|| {
        thread::available_parallelism()
            .map(|n| n.get())
            .unwrap_or(1)
            .next_power_of_two()
    })
}

thread_local! {
    static THREAD_SHARD: Cell<Option<usize>> = const { Cell::new(None) };
}

#[inline]
fn current_shard(mask: usize) -> Option<usize> {
    #[cfg(target_os = "linux")]
    {
        // Safety: no preconditions, returns -1 when unsupported.
        let cpu = unsafe { libc::sched_getcpu() };
        if cpu >= 0 {
            return Some(cpu as usize & mask);
        }
    }

    thread_shard(mask)
}

fn thread_shard(mask: usize) -> Option<usize> {
    static NEXT_SHARD: AtomicUsize = AtomicUsize::new(0);

    THREAD_SHARD
        .try_with(|shard| {
            let id = shard.get().unwrap_or_else(|| {
                let id = NEXT_SHARD.fetch_add(1, Ordering::Relaxed);
                shard.set(Some(id));
                id
            });
            id & mask
        })
        .ok()
}
