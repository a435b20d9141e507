//! Engine counters.
//!
//! One [`EngineMetrics`] is created by the [`StorageEngine`] and shared by
//! reference with its partitions and the compaction worker; there is no
//! process-wide registry.
//!
//! [`StorageEngine`]: crate::engine::StorageEngine

use std::sync::atomic::{AtomicU64, Ordering};

/// Atomic counters updated on the write, commit and compaction paths.
#[derive(Debug, Default)]
pub struct EngineMetrics {
    records_staged: AtomicU64,
    records_deduplicated: AtomicU64,
    records_skipped: AtomicU64,
    commits: AtomicU64,
    records_committed: AtomicU64,
    bytes_written: AtomicU64,
    compactions: AtomicU64,
    compaction_failures: AtomicU64,
    records_compacted: AtomicU64,
    records_dropped: AtomicU64,
    index_updates: AtomicU64,
}

/// Point-in-time copy of [`EngineMetrics`].
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct MetricsSnapshot {
    /// Records that changed a staged set.
    pub records_staged: u64,
    /// Inserts ignored because an equal or newer version existed.
    pub records_deduplicated: u64,
    /// Inserts skipped because this node keeps no local replica.
    pub records_skipped: u64,
    /// Commits that published a snapshot.
    pub commits: u64,
    /// Records made durable by commits.
    pub records_committed: u64,
    /// Bytes written to segments and chunks.
    pub bytes_written: u64,
    /// Completed compaction runs that wrote a chunk.
    pub compactions: u64,
    /// Failed compaction runs.
    pub compaction_failures: u64,
    /// Records read from segments by compaction.
    pub records_compacted: u64,
    /// Superseded record versions dropped by compaction.
    pub records_dropped: u64,
    /// Derived index states published.
    pub index_updates: u64,
}

impl EngineMetrics {
    /// Creates zeroed counters.
    pub fn new() -> Self {
        Self::default()
    }

    /// Records the outcome of staging `attempted` records of which `staged`
    /// changed the staged set.
    pub fn record_inserts(&self, attempted: u64, staged: u64) {
        self.records_staged.fetch_add(staged, Ordering::Relaxed);
        self.records_deduplicated
            .fetch_add(attempted.saturating_sub(staged), Ordering::Relaxed);
    }

    /// Records inserts skipped for lack of a local replica.
    pub fn record_skipped(&self, count: u64) {
        self.records_skipped.fetch_add(count, Ordering::Relaxed);
    }

    /// Records a published commit.
    pub fn record_commit(&self, records: u64, bytes: u64) {
        self.commits.fetch_add(1, Ordering::Relaxed);
        self.records_committed.fetch_add(records, Ordering::Relaxed);
        self.bytes_written.fetch_add(bytes, Ordering::Relaxed);
    }

    /// Records a completed compaction run.
    pub fn record_compaction(&self, records_in: u64, records_out: u64, bytes: u64) {
        self.compactions.fetch_add(1, Ordering::Relaxed);
        self.records_compacted.fetch_add(records_in, Ordering::Relaxed);
        self.records_dropped
            .fetch_add(records_in.saturating_sub(records_out), Ordering::Relaxed);
        self.bytes_written.fetch_add(bytes, Ordering::Relaxed);
    }

    /// Records a failed compaction run.
    pub fn record_compaction_failure(&self) {
        self.compaction_failures.fetch_add(1, Ordering::Relaxed);
    }

    /// Records a published index state.
    pub fn record_index_update(&self) {
        self.index_updates.fetch_add(1, Ordering::Relaxed);
    }

    /// Copies the current counter values.
    pub fn snapshot(&self) -> MetricsSnapshot {
        MetricsSnapshot {
            records_staged: self.records_staged.load(Ordering::Relaxed),
            records_deduplicated: self.records_deduplicated.load(Ordering::Relaxed),
            records_skipped: self.records_skipped.load(Ordering::Relaxed),
            commits: self.commits.load(Ordering::Relaxed),
            records_committed: self.records_committed.load(Ordering::Relaxed),
            bytes_written: self.bytes_written.load(Ordering::Relaxed),
            compactions: self.compactions.load(Ordering::Relaxed),
            compaction_failures: self.compaction_failures.load(Ordering::Relaxed),
            records_compacted: self.records_compacted.load(Ordering::Relaxed),
            records_dropped: self.records_dropped.load(Ordering::Relaxed),
            index_updates: self.index_updates.load(Ordering::Relaxed),
        }
    }
}
