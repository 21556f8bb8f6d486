//! Sharded counters that keep writers off a shared cache line.
//!
//! Writers touch the shard of the CPU they run on. Readers sum every shard,
//! which is slow, so reads are reserved for rare checks such as shutdown.

mod counter;
mod indicator;

// Public API
pub use counter::StripedCounter;
pub use indicator::{ReadIndicatorLock, StripedReadIndicator};
