use clap::Parser;

use crate::versioned::NULL_INDEX;

/// Sizing of the node slab backing a [`ConcurrentQueue`](crate::ConcurrentQueue).
///
/// Passed explicitly to the queue constructor; there is no process-wide default instance.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct QueueOptions {
    /// Number of node slots allocated at once when the slab grows. Rounded up to a power of two.
    pub segment_len: usize,
    /// Upper bound on node slots (live values, the sentinel, and retired nodes awaiting
    /// reclamation). Pushing beyond it fails with [`AllocError::Exhausted`](crate::AllocError).
    pub max_nodes: usize,
}

impl QueueOptions {
    pub const MIN_SEGMENT_LEN: usize = 16;
    pub const MAX_SEGMENT_LEN: usize = 1 << 16;
    /// Slot indices are 32 bits wide and one value is reserved for null.
    pub const MAX_NODES: usize = NULL_INDEX as usize;

    pub const fn new(segment_len: usize, max_nodes: usize) -> Self {
        Self {
            segment_len,
            max_nodes,
        }
    }

    /// Clamps both fields into their supported ranges.
    pub fn normalized(self) -> Self {
        let segment_len = self
            .segment_len
            .clamp(Self::MIN_SEGMENT_LEN, Self::MAX_SEGMENT_LEN)
            .next_power_of_two();
        let max_nodes = self.max_nodes.clamp(2, Self::MAX_NODES);
        Self {
            segment_len,
            max_nodes,
        }
    }
}

impl Default for QueueOptions {
    fn default() -> Self {
        Self::new(1024, 1 << 22)
    }
}

/// Command line options of the `vmsync` stress driver.
///
/// Parsed once in `main` and handed down by reference.
#[derive(Parser, Debug, Clone)]
#[clap(about = "Stress the lock-free work queue and the event-based wait queue")]
pub struct Options {
    /// Number of threads pushing into the work queue.
    #[clap(long, default_value_t = 8)]
    pub producers: usize,

    /// Number of threads draining the work queue.
    #[clap(long, default_value_t = 8)]
    pub consumers: usize,

    /// Values pushed by every producer.
    #[clap(long, default_value_t = 10_000)]
    pub pushes_per_producer: usize,

    /// Node slots allocated per slab segment.
    #[clap(long, default_value_t = 1024)]
    pub segment_len: usize,

    /// Maximum node slots of the work queue.
    #[clap(long, default_value_t = 1 << 22)]
    pub max_nodes: usize,

    /// Threads taking turns through a monitor.
    #[clap(long, default_value_t = 4)]
    pub monitor_threads: usize,

    /// Turns taken through the monitor by all threads together.
    #[clap(long, default_value_t = 10_000)]
    pub handoffs: usize,

    /// Randomly yield inside producer and consumer loops to shake out interleavings.
    #[clap(long, default_value_t = false)]
    pub jitter: bool,
}

impl Options {
    pub fn queue_options(&self) -> QueueOptions {
        QueueOptions::new(self.segment_len, self.max_nodes).normalized()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn normalization_clamps_sizes() {
        let options = QueueOptions::new(1000, 0).normalized();
        assert_eq!(options.segment_len, 1024);
        assert_eq!(options.max_nodes, 2);

        let options = QueueOptions::new(1, usize::MAX).normalized();
        assert_eq!(options.segment_len, QueueOptions::MIN_SEGMENT_LEN);
        assert_eq!(options.max_nodes, QueueOptions::MAX_NODES);
    }

    #[test]
    fn parses_command_line() {
        let options = Options::parse_from(["vmsync", "--producers", "2", "--max-nodes", "64"]);
        assert_eq!(options.producers, 2);
        assert_eq!(options.consumers, 8);
        assert_eq!(options.queue_options().max_nodes, 64);
    }
}
