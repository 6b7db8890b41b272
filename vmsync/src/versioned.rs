//! Versioned references into a node slab.
//!
//! A [`VersionedRef`] packs a 32-bit slot index and a 32-bit sequence number into a single
//! 64-bit word so that lock-free structures can compare-and-swap "which node" and "how many
//! times this word changed" together. The sequence number is what makes a CAS on a reused
//! slot index fail (the ABA hazard); it is bumped on every successful update.
//!
//! # Sizing
//!
//! Both halves are 32 bits wide. A stale snapshot can only be confused with a fresh value if
//! the same word is updated exactly 2^32 times while a thread still holds the old snapshot.
//! Slot reuse is additionally deferred by epoch reclamation (see [`crate::mm::reclaim`]), so
//! the counter is a second line of defence rather than the only one.
use std::fmt;
use std::sync::atomic::Ordering;

use atomic::Atomic;

/// Slot index reserved for "no node".
pub const NULL_INDEX: u32 = u32::MAX;

/// `(slot index, sequence)` pair compared and swapped as one 64-bit value.
#[derive(Clone, Copy, PartialEq, Eq, Hash)]
#[repr(C, align(8))]
pub struct VersionedRef {
    index: u32,
    seq: u32,
}

unsafe impl bytemuck::NoUninit for VersionedRef {}

impl VersionedRef {
    pub const fn new(index: u32, seq: u32) -> Self {
        Self { index, seq }
    }

    /// Reference to no node, carrying sequence `seq`.
    pub const fn null(seq: u32) -> Self {
        Self::new(NULL_INDEX, seq)
    }

    pub const fn index(self) -> u32 {
        self.index
    }

    pub const fn seq(self) -> u32 {
        self.seq
    }

    pub const fn is_null(self) -> bool {
        self.index == NULL_INDEX
    }

    /// The value a successful CAS installs when it moves this reference to `index`.
    pub const fn advance(self, index: u32) -> Self {
        Self::new(index, self.seq.wrapping_add(1))
    }
}

impl fmt::Debug for VersionedRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.is_null() {
            write!(f, "VersionedRef(null@{})", self.seq)
        } else {
            write!(f, "VersionedRef({}@{})", self.index, self.seq)
        }
    }
}

/// Atomic cell holding a [`VersionedRef`].
pub struct AtomicVersionedRef {
    value: Atomic<VersionedRef>,
}

impl AtomicVersionedRef {
    pub const fn new(value: VersionedRef) -> Self {
        Self {
            value: Atomic::new(value),
        }
    }

    /// Whether the platform updates the packed word with a native atomic instruction.
    pub fn is_lock_free() -> bool {
        Atomic::<VersionedRef>::is_lock_free()
    }

    #[inline]
    pub fn load(&self, order: Ordering) -> VersionedRef {
        self.value.load(order)
    }

    #[inline]
    pub fn store(&self, value: VersionedRef, order: Ordering) {
        self.value.store(value, order)
    }

    #[inline]
    pub fn compare_exchange(
        &self,
        current: VersionedRef,
        new: VersionedRef,
        success: Ordering,
        failure: Ordering,
    ) -> Result<VersionedRef, VersionedRef> {
        self.value.compare_exchange(current, new, success, failure)
    }
}

impl fmt::Debug for AtomicVersionedRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Debug::fmt(&self.load(Ordering::Relaxed), f)
    }
}
