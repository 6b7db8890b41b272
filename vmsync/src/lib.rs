//! Low-level synchronization for the VM runtime.
//!
//! Two primitives live here:
//!
//! - [`ConcurrentQueue`], a lock-free multi-producer/multi-consumer FIFO used to hand work
//!   between collector and worker threads without taking a lock. Nodes come from a
//!   [`NodeSlab`](mm::NodeSlab) and are addressed by versioned 32-bit indices; retired nodes
//!   are recycled only after epoch-based reclamation proves nobody can still see them.
//! - [`WaitQueue`], a FIFO condition variable built from a caller-owned mutex and one
//!   manual-reset [`Event`] per waiting thread, and [`Monitor`], the reentrant lock + wait
//!   queue pairing used for object wait/notify.
//!
//! Configuration is explicit: queue sizing travels in [`QueueOptions`] values handed to the
//! constructors.
mod error;
pub mod mm;
pub mod options;
pub mod queue;
pub mod sync;
pub mod versioned;

pub use error::{AllocError, PushError, WaitError};
pub use options::QueueOptions;
pub use queue::ConcurrentQueue;
pub use sync::{Event, Monitor, MonitorGuard, RawEvent, WaitOutcome, WaitQueue};

pub mod prelude {
    pub use super::error::{AllocError, PushError, WaitError};
    pub use super::options::QueueOptions;
    pub use super::queue::ConcurrentQueue;
    pub use super::sync::{EventStatus, Monitor, RawEvent, WaitOutcome, WaitQueue};
}
