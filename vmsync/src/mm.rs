//! Memory source for the lock-free structures: a slab of fixed-size node slots and the
//! epoch-based policy deciding when a retired slot may be reused.
pub mod reclaim;
pub mod slab;

pub use slab::NodeSlab;
