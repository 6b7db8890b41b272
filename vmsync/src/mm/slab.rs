//! Fixed-size node slots for lock-free structures.
//!
//! A [`NodeSlab`] hands out slots addressed by a 32-bit index. Slots live in segments that are
//! allocated lazily and installed with a CAS; a segment is never freed before the slab itself,
//! so a stale index always points at readable memory. Released slots go onto a free list (a
//! Treiber stack whose head is a [`VersionedRef`], so concurrent pops are ABA-safe).
//!
//! The slab never drops payloads. Whoever moves a value into a slot is responsible for moving
//! it out again before the slot is released.
use std::cell::UnsafeCell;
use std::marker::PhantomData;
use std::mem::MaybeUninit;
use std::ptr;
use std::sync::atomic::{AtomicBool, AtomicPtr, AtomicU32, AtomicUsize, Ordering};

use crate::error::AllocError;
use crate::options::QueueOptions;
use crate::versioned::{AtomicVersionedRef, VersionedRef, NULL_INDEX};

pub struct Slot<T> {
    /// Successor link used by the queue.
    pub(crate) next: AtomicVersionedRef,
    /// Successor link while the slot sits on the free list.
    free_next: AtomicU32,
    /// Set while the slot sits on the free list.
    vacant: AtomicBool,
    value: UnsafeCell<MaybeUninit<T>>,
}

impl<T> Slot<T> {
    fn empty() -> Self {
        Self {
            next: AtomicVersionedRef::new(VersionedRef::null(0)),
            free_next: AtomicU32::new(NULL_INDEX),
            vacant: AtomicBool::new(false),
            value: UnsafeCell::new(MaybeUninit::uninit()),
        }
    }

    /// Bitwise copy of the payload.
    ///
    /// # Safety
    ///
    /// The slot must hold an initialized value that is not being written concurrently. The copy
    /// aliases the slot's value: exactly one copy may ever be treated as owned.
    pub(crate) unsafe fn read_value(&self) -> T {
        unsafe { (*self.value.get()).as_ptr().read() }
    }

    /// # Safety
    ///
    /// The caller must own the slot (just claimed it and not yet published it).
    pub(crate) unsafe fn write_value(&self, value: T) {
        unsafe {
            (*self.value.get()).write(value);
        }
    }
}

pub struct NodeSlab<T> {
    segments: Box<[AtomicPtr<Slot<T>>]>,
    segment_shift: u32,
    max_nodes: u32,
    /// First index that has never been handed out.
    bump: AtomicU32,
    free: AtomicVersionedRef,
    in_use: AtomicUsize,
    _marker: PhantomData<T>,
}

unsafe impl<T: Send> Send for NodeSlab<T> {}
unsafe impl<T: Send> Sync for NodeSlab<T> {}

impl<T> NodeSlab<T> {
    pub fn new(options: QueueOptions) -> Self {
        let options = options.normalized();
        let segment_count = options.max_nodes.div_ceil(options.segment_len);
        Self {
            segments: (0..segment_count)
                .map(|_| AtomicPtr::new(ptr::null_mut()))
                .collect(),
            segment_shift: options.segment_len.trailing_zeros(),
            max_nodes: options.max_nodes as u32,
            bump: AtomicU32::new(0),
            free: AtomicVersionedRef::new(VersionedRef::null(0)),
            in_use: AtomicUsize::new(0),
            _marker: PhantomData,
        }
    }

    pub fn capacity(&self) -> usize {
        self.max_nodes as usize
    }

    /// Slots handed out and not yet released.
    pub fn in_use(&self) -> usize {
        self.in_use.load(Ordering::Relaxed)
    }

    fn segment_len(&self) -> usize {
        1 << self.segment_shift
    }

    /// Slot at `index`.
    ///
    /// `index` must have been returned by [`allocate`](Self::allocate) or
    /// [`allocate_sentinel`](Self::allocate_sentinel) at some point; stale indices are fine.
    #[inline]
    pub(crate) fn slot(&self, index: u32) -> &Slot<T> {
        let segment = self.segments[(index >> self.segment_shift) as usize].load(Ordering::Acquire);
        assert!(!segment.is_null(), "slot {index} was never allocated");
        let offset = index as usize & (self.segment_len() - 1);
        // Segments are installed before any index inside them is handed out and stay alive
        // until the slab is dropped.
        unsafe { &*segment.add(offset) }
    }

    /// Claims a slot and moves `value` into it. The slot's `next` link is null.
    pub fn allocate(&self, value: T) -> Result<u32, AllocError> {
        let index = self.claim()?;
        unsafe {
            self.slot(index).write_value(value);
        }
        Ok(index)
    }

    /// Claims a slot without a payload, for use as a sentinel.
    pub fn allocate_sentinel(&self) -> Result<u32, AllocError> {
        self.claim()
    }

    /// Returns a slot to the free list.
    ///
    /// # Panics
    ///
    /// Panics if the slot is already on the free list.
    ///
    /// # Safety
    ///
    /// `index` must have been handed out by this slab and not released since. Its payload must
    /// already have been moved out, and no thread may still read or write the slot through a
    /// stale index: the next claim hands it to a new owner. The queue only calls this from an
    /// epoch-deferred function.
    pub unsafe fn release(&self, index: u32) {
        let slot = self.slot(index);
        assert!(
            !slot.vacant.swap(true, Ordering::AcqRel),
            "slot {index} released twice"
        );
        let mut head = self.free.load(Ordering::Acquire);
        loop {
            slot.free_next.store(head.index(), Ordering::Relaxed);
            match self.free.compare_exchange(
                head,
                head.advance(index),
                Ordering::Release,
                Ordering::Acquire,
            ) {
                Ok(_) => break,
                Err(current) => head = current,
            }
        }
        self.in_use.fetch_sub(1, Ordering::Relaxed);
    }

    /// Claims a slot without touching its payload.
    pub(crate) fn claim(&self) -> Result<u32, AllocError> {
        let index = match self.pop_free() {
            Some(index) => index,
            None => self.bump_index()?,
        };
        self.in_use.fetch_add(1, Ordering::Relaxed);

        let slot = self.slot(index);
        slot.vacant.store(false, Ordering::Release);
        // Keep the link sequence increasing across reuse of the slot.
        let next = slot.next.load(Ordering::Relaxed);
        slot.next
            .store(VersionedRef::null(next.seq().wrapping_add(1)), Ordering::Relaxed);
        Ok(index)
    }

    fn pop_free(&self) -> Option<u32> {
        let mut head = self.free.load(Ordering::Acquire);
        loop {
            if head.is_null() {
                return None;
            }
            let next = self.slot(head.index()).free_next.load(Ordering::Relaxed);
            match self.free.compare_exchange(
                head,
                VersionedRef::new(next, head.seq().wrapping_add(1)),
                Ordering::AcqRel,
                Ordering::Acquire,
            ) {
                Ok(_) => return Some(head.index()),
                Err(current) => head = current,
            }
        }
    }

    fn bump_index(&self) -> Result<u32, AllocError> {
        let mut index = self.bump.load(Ordering::Acquire);
        loop {
            if index >= self.max_nodes {
                // A release may have landed since the free list was checked.
                return self.pop_free().ok_or_else(|| {
                    log::debug!("node slab exhausted at {} slots", self.max_nodes);
                    AllocError::Exhausted {
                        capacity: self.max_nodes as usize,
                    }
                });
            }
            // The segment must exist before the index can be observed by anyone.
            self.ensure_segment((index >> self.segment_shift) as usize)?;
            match self.bump.compare_exchange_weak(
                index,
                index + 1,
                Ordering::AcqRel,
                Ordering::Acquire,
            ) {
                Ok(_) => return Ok(index),
                Err(current) => index = current,
            }
        }
    }

    fn ensure_segment(&self, segment: usize) -> Result<(), AllocError> {
        let entry = &self.segments[segment];
        if !entry.load(Ordering::Acquire).is_null() {
            return Ok(());
        }

        let len = self.segment_len();
        let mut slots: Vec<Slot<T>> = Vec::new();
        slots
            .try_reserve_exact(len)
            .map_err(|_| AllocError::OutOfMemory { slots: len })?;
        slots.extend((0..len).map(|_| Slot::empty()));
        let raw = Box::into_raw(slots.into_boxed_slice()) as *mut Slot<T>;

        match entry.compare_exchange(ptr::null_mut(), raw, Ordering::AcqRel, Ordering::Acquire) {
            Ok(_) => {
                log::debug!("node slab: installed segment {segment} ({len} slots)");
            }
            Err(_) => unsafe {
                // Another thread installed this segment first.
                drop(Box::from_raw(ptr::slice_from_raw_parts_mut(raw, len)));
            },
        }
        Ok(())
    }
}

impl<T> Drop for NodeSlab<T> {
    fn drop(&mut self) {
        let len = self.segment_len();
        for entry in self.segments.iter_mut() {
            let raw = *entry.get_mut();
            if !raw.is_null() {
                unsafe {
                    drop(Box::from_raw(ptr::slice_from_raw_parts_mut(raw, len)));
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn small(max_nodes: usize) -> NodeSlab<u64> {
        NodeSlab::new(QueueOptions::new(16, max_nodes))
    }

    #[test]
    fn exhausts_at_capacity() {
        let slab = small(20);
        let indices: Vec<u32> = (0..20).map(|i| slab.allocate(i).unwrap()).collect();
        assert_eq!(indices, (0..20).collect::<Vec<u32>>());
        assert_eq!(slab.allocate(99), Err(AllocError::Exhausted { capacity: 20 }));
        assert_eq!(slab.in_use(), 20);
    }

    #[test]
    fn released_slot_is_reused() {
        let slab = small(4);
        for i in 0..4 {
            slab.allocate(i).unwrap();
        }
        unsafe { slab.release(2) };
        assert_eq!(slab.in_use(), 3);
        assert_eq!(slab.allocate(42).unwrap(), 2);
        assert_eq!(unsafe { slab.slot(2).read_value() }, 42);
    }

    #[test]
    fn reuse_keeps_link_sequence_increasing() {
        let slab = small(2);
        let index = slab.allocate_sentinel().unwrap();
        let first = slab.slot(index).next.load(Ordering::Relaxed);
        unsafe { slab.release(index) };
        assert_eq!(slab.allocate_sentinel().unwrap(), index);
        let second = slab.slot(index).next.load(Ordering::Relaxed);
        assert!(first.is_null() && second.is_null());
        assert_eq!(second.seq(), first.seq().wrapping_add(1));
    }

    #[test]
    #[should_panic(expected = "released twice")]
    fn double_release_is_caught() {
        let slab = small(4);
        let index = slab.allocate(1).unwrap();
        unsafe {
            slab.release(index);
            slab.release(index);
        }
    }

    #[test]
    fn released_slot_has_one_owner_at_a_time() {
        let slab = small(4);
        let index = slab.allocate(1).unwrap();
        unsafe { slab.release(index) };
        let first = slab.allocate(2).unwrap();
        let second = slab.allocate(3).unwrap();
        assert_eq!(first, index);
        assert_ne!(first, second);
        assert_eq!(slab.in_use(), 2);
        assert_eq!(unsafe { slab.slot(first).read_value() }, 2);
        assert_eq!(unsafe { slab.slot(second).read_value() }, 3);
    }

    #[test]
    fn segments_are_installed_lazily() {
        let slab = small(64);
        assert!(slab.segments.iter().all(|s| s.load(Ordering::Relaxed).is_null()));
        slab.allocate(1).unwrap();
        assert_eq!(
            slab.segments
                .iter()
                .filter(|s| !s.load(Ordering::Relaxed).is_null())
                .count(),
            1
        );
        for i in 0..16 {
            slab.allocate(i).unwrap();
        }
        assert!(!slab.segments[1].load(Ordering::Relaxed).is_null());
        assert!(slab.segments[2].load(Ordering::Relaxed).is_null());
    }
}
