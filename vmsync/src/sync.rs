//! Blocking synchronization primitives.
//!
//! [`WaitQueue`] is a condition variable assembled from a mutex and one manual-reset
//! [`Event`] per waiting thread; it is the only place in this crate where a thread is
//! suspended. [`Monitor`] pairs it with a reentrant lock for object wait/notify.
pub mod event;
pub mod monitor;
pub mod wait_queue;

pub use event::{Event, EventStatus, RawEvent};
pub use monitor::*;
pub use wait_queue::{WaitOutcome, WaitQueue};
