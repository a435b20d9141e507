//! Background compaction of partition segments into chunks.
//!
//! - [`queue`]: per-partition debounced work queue
//! - [`compactor`]: one compaction run over one partition
//! - [`worker`]: threads draining the queue and retrying failed runs

pub mod compactor;
pub mod queue;
pub mod worker;

pub use compactor::{CompactionOutcome, CompactionSummary, Compactor};
pub use queue::CoalescingQueue;
pub use worker::CompactionWorker;
