//! Lock-free intrusive containers over a shared node pool.
//!
//! Nodes are slots of a [`NodePool`]; a linked node is owned by exactly one
//! container, which the move-only [`Node`] token enforces at compile time.

mod mpsc;
mod pool;
mod stack;
mod tagged;

// Public API
pub use mpsc::{Consumer, MpscQueue};
pub use pool::{Node, NodePool};
pub use stack::IntrusiveStack;
