//! Lock-free multi-producer/multi-consumer FIFO queue (Michael & Scott).
//!
//! Used to hand units of work between collector and worker threads where blocking is not an
//! option. `head` and `tail` are [`VersionedRef`]s into a [`NodeSlab`]; every update is a
//! single 64-bit CAS that also bumps the sequence number. `head` always names a sentinel whose
//! payload is never read, and `tail` names the last node or lags behind it, in which case any
//! thread that notices helps to advance it.
//!
//! Removed sentinels are retired through [`reclaim`], so a thread holding a stale snapshot of
//! a node can never see that node's slot reused underneath it.
use std::fmt;
use std::mem::ManuallyDrop;
use std::sync::atomic::Ordering;
use std::sync::Arc;

use crate::error::{AllocError, PushError};
use crate::mm::reclaim;
use crate::mm::slab::NodeSlab;
use crate::options::QueueOptions;
use crate::versioned::{AtomicVersionedRef, VersionedRef};

/// Collector flushes attempted by a push that finds the slab exhausted.
const EXHAUSTED_FLUSHES: usize = 4;

pub struct ConcurrentQueue<T> {
    head: AtomicVersionedRef,
    tail: AtomicVersionedRef,
    slab: Arc<NodeSlab<T>>,
}

impl<T: Send> ConcurrentQueue<T> {
    /// Creates an empty queue with default slab sizing.
    ///
    /// # Panics
    ///
    /// Panics if the first slab segment cannot be allocated.
    pub fn new() -> Self {
        Self::with_options(QueueOptions::default())
    }

    /// Creates an empty queue with explicit slab sizing.
    ///
    /// # Panics
    ///
    /// Panics if the first slab segment cannot be allocated.
    pub fn with_options(options: QueueOptions) -> Self {
        match Self::try_with_options(options) {
            Ok(queue) => queue,
            Err(err) => panic!("failed to create work queue: {err}"),
        }
    }

    pub fn try_with_options(options: QueueOptions) -> Result<Self, AllocError> {
        let slab = Arc::new(NodeSlab::new(options));
        let sentinel = slab.allocate_sentinel()?;
        Ok(Self {
            head: AtomicVersionedRef::new(VersionedRef::new(sentinel, 0)),
            tail: AtomicVersionedRef::new(VersionedRef::new(sentinel, 0)),
            slab,
        })
    }

    /// Appends `value` at the tail.
    ///
    /// Fails only if no node slot is available; the queue is then left untouched and the value
    /// is handed back inside the error.
    pub fn push(&self, value: T) -> Result<(), PushError<T>> {
        // Claiming does not need a pin: slot memory outlives every index.
        let node = match self.claim_node() {
            Ok(node) => node,
            Err(error) => return Err(PushError { value, error }),
        };
        unsafe {
            self.slab.slot(node).write_value(value);
        }

        let _guard = reclaim::pin();

        loop {
            let tail = self.tail.load(Ordering::Acquire);
            let tail_slot = self.slab.slot(tail.index());
            let next = tail_slot.next.load(Ordering::Acquire);

            if tail != self.tail.load(Ordering::Acquire) {
                continue;
            }

            if next.is_null() {
                if tail_slot
                    .next
                    .compare_exchange(
                        next,
                        next.advance(node),
                        Ordering::Release,
                        Ordering::Relaxed,
                    )
                    .is_ok()
                {
                    // Linked. Swinging the tail is best effort, others will help.
                    let _ = self.tail.compare_exchange(
                        tail,
                        tail.advance(node),
                        Ordering::Release,
                        Ordering::Relaxed,
                    );
                    return Ok(());
                }
            } else {
                // Tail lags behind a node linked by another producer.
                let _ = self.tail.compare_exchange(
                    tail,
                    tail.advance(next.index()),
                    Ordering::Release,
                    Ordering::Relaxed,
                );
            }
        }
    }

    /// Claims a slot for a new node. When the slab is full, this thread's pending retirements
    /// are pushed to the global collector a few times before giving up. Every flush pins
    /// afresh, so the global epoch can move forward between attempts and retired slots
    /// become reusable.
    ///
    /// Must be called unpinned: a pin held across the flushes holds the epoch back.
    fn claim_node(&self) -> Result<u32, AllocError> {
        let mut attempts = 0;
        loop {
            match self.slab.claim() {
                Err(AllocError::Exhausted { .. }) if attempts < EXHAUSTED_FLUSHES => {
                    reclaim::flush();
                    attempts += 1;
                }
                result => return result,
            }
        }
    }

    /// Removes the value at the head, or returns `None` if the queue is empty.
    pub fn pop(&self) -> Option<T> {
        let guard = reclaim::pin();

        loop {
            let head = self.head.load(Ordering::Acquire);
            let tail = self.tail.load(Ordering::Acquire);
            let next = self.slab.slot(head.index()).next.load(Ordering::Acquire);

            if head != self.head.load(Ordering::Acquire) {
                continue;
            }

            if head.index() == tail.index() {
                if next.is_null() {
                    return None;
                }
                let _ = self.tail.compare_exchange(
                    tail,
                    tail.advance(next.index()),
                    Ordering::Release,
                    Ordering::Relaxed,
                );
                continue;
            }

            if next.is_null() {
                continue;
            }

            // Capture the value before head moves: once it does, another consumer may retire
            // the node. Only the thread whose CAS succeeds owns the copy.
            let value = ManuallyDrop::new(unsafe { self.slab.slot(next.index()).read_value() });

            if self
                .head
                .compare_exchange(
                    head,
                    head.advance(next.index()),
                    Ordering::AcqRel,
                    Ordering::Acquire,
                )
                .is_ok()
            {
                // SAFETY: the CAS unlinked the old sentinel, only this thread retires it, and
                // its payload (if any) was moved out when it became the sentinel.
                unsafe { reclaim::retire(&self.slab, head.index(), &guard) };
                return Some(ManuallyDrop::into_inner(value));
            }
        }
    }

    /// Whether the queue was empty at the moment of the check.
    pub fn is_empty(&self) -> bool {
        let _guard = reclaim::pin();
        let head = self.head.load(Ordering::Acquire);
        self.slab.slot(head.index()).next.load(Ordering::Acquire).is_null()
    }

    /// Maximum number of node slots, including the sentinel and retired nodes not yet reclaimed.
    pub fn capacity(&self) -> usize {
        self.slab.capacity()
    }

    /// Node slots currently claimed from the slab.
    pub fn nodes_in_use(&self) -> usize {
        self.slab.in_use()
    }
}

impl<T: Send> Default for ConcurrentQueue<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T> Drop for ConcurrentQueue<T> {
    fn drop(&mut self) {
        // No other thread can reach the queue any more: walk the list and drop what is left.
        let mut current = self.head.load(Ordering::Relaxed);
        loop {
            let next = self.slab.slot(current.index()).next.load(Ordering::Relaxed);
            if next.is_null() {
                break;
            }
            unsafe {
                drop(self.slab.slot(next.index()).read_value());
            }
            current = next;
        }
        // Slot memory is released with the last reference to the slab, which may be held by
        // deferred retirements still queued in the epoch collector.
    }
}

impl<T> fmt::Debug for ConcurrentQueue<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ConcurrentQueue")
            .field("head", &self.head)
            .field("tail", &self.tail)
            .field("nodes_in_use", &self.slab.in_use())
            .field("capacity", &self.slab.capacity())
            .finish()
    }
}
