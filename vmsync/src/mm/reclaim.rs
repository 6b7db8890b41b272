//! Deferred reuse of retired slab slots.
//!
//! A node removed from a lock-free structure can still be reachable from snapshots taken by
//! other threads earlier in their retry loops. Every operation that reads slots runs pinned to
//! the global `crossbeam-epoch` collector, and a retired slot is handed back to its slab only
//! from a deferred function, i.e. after every thread that was pinned at retirement time has
//! unpinned.
use std::sync::Arc;

use crossbeam_epoch::{self as epoch, Guard};

use super::slab::NodeSlab;

/// Pins the current thread for the duration of one queue operation.
#[inline]
pub fn pin() -> Guard {
    epoch::pin()
}

/// Schedules `index` to be released to `slab` once no pinned thread can observe it.
///
/// # Safety
///
/// The caller must have just made `index` unreachable for new readers (unlinked it with a
/// successful CAS), must have moved its payload out, and must retire it exactly once. Threads
/// that can still hold the index have to be pinned; that is what delays the release.
pub unsafe fn retire<T: Send>(slab: &Arc<NodeSlab<T>>, index: u32, guard: &Guard) {
    let slab = Arc::clone(slab);
    // SAFETY: the deferred function only touches free-list bookkeeping. The retired slot holds
    // no live `T`, and dropping the last `Arc` frees slot memory without running `T`'s
    // destructor, so running it after `T`'s lifetime has ended is fine. It runs once every
    // thread pinned at retirement has unpinned, which is the release contract.
    unsafe {
        guard.defer_unchecked(move || slab.release(index));
    }
}

/// Pushes this thread's deferred functions to the global collector and tries to advance the
/// epoch. Callers that want retired slots back promptly (tests, shutdown) call this in a loop.
pub fn flush() {
    pin().flush();
}
