//! A reader holding a snapshot keeps a fixed view while commits and
//! compactions publish newer snapshots.

use alopex_burrow::compaction::{CompactionOutcome, Compactor};
use alopex_burrow::storage::PartitionLayout;
use alopex_burrow::{
    CommittedRecord, EngineMetrics, Hash160, IndexMaintainer, Partition, PartitionReader,
    RecordRef, SnapshotLifecycle, StandaloneReplicationScheme, SyncMode,
};
use std::sync::Arc;
use std::thread;
use tempfile::TempDir;

fn open_partition(dir: &std::path::Path) -> Arc<Partition> {
    Arc::new(
        Partition::open(
            Hash160::digest(b"isolation"),
            "events",
            &PartitionLayout::new(dir),
            SyncMode::None,
            Arc::new(EngineMetrics::new()),
        )
        .unwrap(),
    )
}

fn collect(reader: &PartitionReader) -> Vec<CommittedRecord> {
    let mut records = Vec::new();
    reader.fetch_records(|r| records.push(r.clone())).unwrap();
    records
}

#[test]
fn test_reader_is_isolated_from_commits_and_compaction() {
    let temp_dir = TempDir::new().unwrap();
    let partition = open_partition(temp_dir.path());
    for batch in 0..4u32 {
        for i in 0..10u32 {
            partition.insert_record(RecordRef::new(
                Hash160::digest(&(batch * 10 + i).to_le_bytes()),
                1,
                format!("v1-{}", i),
            ));
        }
        partition.commit().unwrap();
    }

    let held = partition.reader();
    let held_version = held.snapshot().version();
    let held_nrecs = held.snapshot().nrecs();
    let before = collect(&held);
    assert_eq!(before.len(), 40);
    let held_segments: Vec<_> = held
        .snapshot()
        .segment_files()
        .iter()
        .map(|f| f.path().to_path_buf())
        .collect();

    let writer = {
        let partition = Arc::clone(&partition);
        thread::spawn(move || {
            for round in 0..20u32 {
                // rewrite some ids with newer versions and add new ones
                for i in 0..5u32 {
                    partition.insert_record(RecordRef::new(
                        Hash160::digest(&i.to_le_bytes()),
                        u64::from(round) + 2,
                        "newer",
                    ));
                    partition.insert_record(RecordRef::new(
                        Hash160::digest(&(1000 + round * 5 + i).to_le_bytes()),
                        1,
                        "fresh",
                    ));
                }
                partition.commit().unwrap();
            }
        })
    };

    let compactor = Compactor::new(
        Arc::new(StandaloneReplicationScheme),
        Arc::new(IndexMaintainer::new()),
        Arc::new(EngineMetrics::new()),
        1,
        SyncMode::None,
    );
    let mut compacted = 0;
    for _ in 0..10 {
        if let CompactionOutcome::Compacted(_) = compactor.compact(&partition).unwrap() {
            compacted += 1;
        }
    }
    writer.join().unwrap();
    if let CompactionOutcome::Compacted(_) = compactor.compact(&partition).unwrap() {
        compacted += 1;
    }
    assert!(compacted >= 1);

    // the held view is unchanged
    assert_eq!(held.snapshot().version(), held_version);
    assert_eq!(held.snapshot().nrecs(), held_nrecs);
    assert_eq!(collect(&held), before);
    assert_eq!(held.snapshot().lifecycle(), SnapshotLifecycle::Superseded);
    for path in &held_segments {
        assert!(path.exists(), "{} was reclaimed while pinned", path.display());
    }

    // the latest view sees every commit, with newer versions winning
    let latest = partition.reader();
    assert_eq!(latest.snapshot().nrecs(), 40 + 20 * 10);
    assert!(latest.snapshot().descriptor().segments.is_empty());
    let records = collect(&latest);
    assert_eq!(records.len(), 40 + 20 * 5);
    let rewritten = records
        .iter()
        .filter(|r| r.record.record_version == 21)
        .count();
    assert_eq!(rewritten, 5);

    drop(held);
    for path in &held_segments {
        assert!(!path.exists(), "{} outlived its last snapshot", path.display());
    }
}
