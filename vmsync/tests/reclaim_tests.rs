//! Kept to a single test: the epoch collector is process-wide, and a thread pinned by another
//! test would hold the epoch back.
use vmsync::{AllocError, ConcurrentQueue, QueueOptions};

#[test]
fn full_slab_push_recovers_retired_slot_by_itself() {
    // Sentinel plus one value fills the slab.
    let queue = ConcurrentQueue::with_options(QueueOptions::new(16, 2));
    queue.push(1u32).unwrap();
    assert_eq!(
        queue.push(2).unwrap_err().error,
        AllocError::Exhausted { capacity: 2 }
    );

    // Retires the old sentinel into this thread's deferred bag.
    assert_eq!(queue.pop(), Some(1));

    // No outside flushing: the push has to get the epoch moving on its own.
    queue.push(2).unwrap();
    assert_eq!(queue.nodes_in_use(), 2);
    assert_eq!(queue.pop(), Some(2));
    assert_eq!(queue.pop(), None);
}
