use std::fmt;

use errno::Errno;
use thiserror::Error;

/// A node slab could not provide a slot.
///
/// Raised before any shared queue state is touched, so a failed push leaves the queue exactly
/// as it was.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum AllocError {
    /// Every slot up to the configured maximum is in use (or still waiting to be reclaimed).
    #[error("node slab exhausted: all {capacity} slots are in use")]
    Exhausted { capacity: usize },
    /// The global allocator refused a new slab segment.
    #[error("out of memory while growing node slab by {slots} slots")]
    OutOfMemory { slots: usize },
}

/// A push that could not get a node slot. Carries the value back to the caller.
#[derive(Clone, PartialEq, Eq, Error)]
#[error("failed to push value: {error}")]
pub struct PushError<T> {
    pub value: T,
    pub error: AllocError,
}

impl<T> PushError<T> {
    /// Takes the rejected value back.
    pub fn into_inner(self) -> T {
        self.value
    }
}

impl<T> fmt::Debug for PushError<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PushError")
            .field("error", &self.error)
            .finish_non_exhaustive()
    }
}

/// A wait on a [`WaitQueue`](crate::sync::WaitQueue) failed at the OS level.
///
/// The caller's mutex is held again and the waiter is no longer linked when this is returned.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum WaitError {
    #[error("failed to create wait event: {0}")]
    EventCreation(Errno),
    #[error("wait on event failed: {0}")]
    Os(Errno),
}
