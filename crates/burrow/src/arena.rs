//! RecordArena - per-partition staging set with record-id deduplication.
//!
//! The arena holds records accepted for one partition but not yet durable,
//! together with the highest committed version of every record id. Both
//! live behind one mutex scoped to the partition, so concurrent writers to
//! different partitions never contend.
//!
//! # Deduplication
//!
//! - id staged or committed with an equal or newer version: no-op
//! - id staged with an older version: the staged value is replaced
//! - id committed with an older version: staged as an update

use crate::key::RecordId;
use crate::record::RecordRef;
use parking_lot::Mutex;
use std::collections::HashMap;

/// A staged record and its arrival sequence.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StagedRecord {
    /// Arrival order within the arena; replacement assigns a new sequence.
    pub seq: u64,
    /// The staged record.
    pub record: RecordRef,
}

#[derive(Debug, Default)]
struct ArenaState {
    staged: HashMap<RecordId, StagedRecord>,
    committed: HashMap<RecordId, u64>,
    next_seq: u64,
}

impl ArenaState {
    fn stage(&mut self, mut record: RecordRef) -> bool {
        let id = record.record_id;
        if let Some(staged) = self.staged.get(&id) {
            if staged.record.record_version >= record.record_version {
                return false;
            }
        }
        if let Some(&committed) = self.committed.get(&id) {
            if committed >= record.record_version {
                return false;
            }
            record.is_update = true;
        }

        let seq = self.next_seq;
        self.next_seq += 1;
        self.staged.insert(id, StagedRecord { seq, record });
        true
    }
}

/// Staging buffer for one partition.
#[derive(Debug, Default)]
pub struct RecordArena {
    inner: Mutex<ArenaState>,
}

impl RecordArena {
    /// Creates an empty arena.
    pub fn new() -> Self {
        Self::default()
    }

    /// Stages one record.
    ///
    /// Returns true if the staged set changed.
    pub fn insert_record(&self, record: RecordRef) -> bool {
        self.inner.lock().stage(record)
    }

    /// Stages a batch under a single lock acquisition.
    ///
    /// Returns true if any record changed the staged set.
    pub fn insert_records<I>(&self, records: I) -> bool
    where
        I: IntoIterator<Item = RecordRef>,
    {
        self.stage_records(records) > 0
    }

    /// Stages a batch and returns how many records changed the staged set.
    pub fn stage_records<I>(&self, records: I) -> usize
    where
        I: IntoIterator<Item = RecordRef>,
    {
        let mut state = self.inner.lock();
        let mut staged = 0;
        for record in records {
            if state.stage(record) {
                staged += 1;
            }
        }
        staged
    }

    /// Returns a copy of the staged records in arrival order.
    pub fn staged_batch(&self) -> Vec<StagedRecord> {
        let state = self.inner.lock();
        let mut batch: Vec<StagedRecord> = state.staged.values().cloned().collect();
        batch.sort_by_key(|staged| staged.seq);
        batch
    }

    /// Removes `batch` from the staged set after it became durable.
    ///
    /// Records replaced while the batch was being written keep their newer
    /// staged value and become updates of the committed version.
    pub fn mark_committed(&self, batch: &[StagedRecord]) {
        let mut state = self.inner.lock();
        for staged in batch {
            let id = staged.record.record_id;
            let written = match state.staged.get_mut(&id) {
                Some(current) if current.seq == staged.seq => true,
                Some(current) => {
                    current.record.is_update = true;
                    false
                }
                None => false,
            };
            if written {
                state.staged.remove(&id);
            }
            let version = state.committed.entry(id).or_insert(0);
            *version = (*version).max(staged.record.record_version);
        }
    }

    /// Seeds committed versions, e.g. when reopening a partition.
    pub fn restore_committed<I>(&self, versions: I)
    where
        I: IntoIterator<Item = (RecordId, u64)>,
    {
        let mut state = self.inner.lock();
        for (id, version) in versions {
            let entry = state.committed.entry(id).or_insert(version);
            *entry = (*entry).max(version);
        }
    }

    /// Highest committed version of `id`.
    pub fn committed_version(&self, id: &RecordId) -> Option<u64> {
        self.inner.lock().committed.get(id).copied()
    }

    /// Number of staged records.
    pub fn len(&self) -> usize {
        self.inner.lock().staged.len()
    }

    /// Returns true if nothing is staged.
    pub fn is_empty(&self) -> bool {
        self.inner.lock().staged.is_empty()
    }

    /// Number of distinct committed record ids.
    pub fn committed_len(&self) -> usize {
        self.inner.lock().committed.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::key::Hash160;
    use std::sync::Arc;

    fn record(id: &str, version: u64, payload: &'static str) -> RecordRef {
        RecordRef::new(Hash160::digest(id.as_bytes()), version, payload)
    }

    #[test]
    fn test_duplicate_insert_is_noop() {
        let arena = RecordArena::new();
        assert!(arena.insert_record(record("h1", 1, "a")));
        assert!(!arena.insert_record(record("h1", 1, "a")));
        assert_eq!(arena.len(), 1);
    }

    #[test]
    fn test_newer_version_replaces_older_is_ignored() {
        let arena = RecordArena::new();
        arena.insert_record(record("h1", 2, "b"));
        assert!(!arena.insert_record(record("h1", 1, "a")));
        assert!(arena.insert_record(record("h1", 3, "c")));

        let batch = arena.staged_batch();
        assert_eq!(batch.len(), 1);
        assert_eq!(batch[0].record.record_version, 3);
        assert_eq!(&batch[0].record.payload[..], b"c");
    }

    #[test]
    fn test_batch_reports_any_change() {
        let arena = RecordArena::new();
        assert!(arena.insert_records(vec![record("a", 1, "x"), record("a", 1, "x")]));
        assert!(!arena.insert_records(vec![record("a", 1, "x")]));
        assert!(arena.insert_records(vec![record("a", 1, "x"), record("b", 1, "y")]));
        assert_eq!(arena.len(), 2);
    }

    #[test]
    fn test_staged_batch_is_in_arrival_order() {
        let arena = RecordArena::new();
        for name in ["c", "a", "b"] {
            arena.insert_record(record(name, 1, "p"));
        }
        arena.insert_record(record("c", 2, "p"));
        let ids: Vec<RecordId> = arena
            .staged_batch()
            .into_iter()
            .map(|s| s.record.record_id)
            .collect();
        assert_eq!(
            ids,
            vec![
                Hash160::digest(b"a"),
                Hash160::digest(b"b"),
                Hash160::digest(b"c")
            ]
        );
    }

    #[test]
    fn test_mark_committed_keeps_concurrent_replacement() {
        let arena = RecordArena::new();
        arena.insert_record(record("a", 1, "old"));
        arena.insert_record(record("b", 1, "b"));
        let batch = arena.staged_batch();

        // replaced while the batch is being written
        arena.insert_record(record("a", 2, "new"));
        arena.mark_committed(&batch);

        let remaining = arena.staged_batch();
        assert_eq!(remaining.len(), 1);
        assert_eq!(remaining[0].record.record_version, 2);
        assert!(remaining[0].record.is_update);
        assert_eq!(arena.committed_version(&Hash160::digest(b"a")), Some(1));
        assert_eq!(arena.committed_len(), 2);
    }

    #[test]
    fn test_update_flag_does_not_depend_on_commit_timing() {
        // replacement staged while the first version is being committed
        let during = RecordArena::new();
        during.insert_record(record("a", 1, "v1"));
        let batch = during.staged_batch();
        during.insert_record(record("a", 2, "v2"));
        during.mark_committed(&batch);

        // the same replacement staged after the commit
        let after = RecordArena::new();
        after.insert_record(record("a", 1, "v1"));
        after.mark_committed(&after.staged_batch());
        after.insert_record(record("a", 2, "v2"));

        assert_eq!(during.staged_batch()[0].record, after.staged_batch()[0].record);
        assert!(during.staged_batch()[0].record.is_update);
    }

    #[test]
    fn test_committed_ids_are_deduplicated() {
        let arena = RecordArena::new();
        arena.insert_record(record("a", 1, "x"));
        arena.mark_committed(&arena.staged_batch());
        assert!(arena.is_empty());

        assert!(!arena.insert_record(record("a", 1, "x")));
        assert!(arena.insert_record(record("a", 2, "y")));
        assert!(arena.staged_batch()[0].record.is_update);
    }

    #[test]
    fn test_restore_committed() {
        let arena = RecordArena::new();
        arena.restore_committed(vec![(Hash160::digest(b"a"), 5)]);
        assert!(!arena.insert_record(record("a", 5, "x")));
        assert!(arena.insert_record(record("a", 6, "x")));
    }

    #[test]
    fn test_concurrent_inserts() {
        let arena = Arc::new(RecordArena::new());
        std::thread::scope(|scope| {
            for _ in 0..4 {
                let arena = Arc::clone(&arena);
                scope.spawn(move || {
                    // every thread inserts the same ids
                    for i in 0..250 {
                        arena.insert_record(record(&format!("id-{}", i), 1, "p"));
                    }
                });
            }
        });
        assert_eq!(arena.len(), 250);
    }
}
