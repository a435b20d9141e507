//! Compaction of committed segments into a columnar chunk.
//!
//! A run only touches the oldest segments that every remote replica has
//! received, so records a lagging replica still needs stay in their
//! segments. Within the selected segments, superseded versions of a record
//! id are dropped; the surviving records keep their offsets.

use crate::error::{BurrowError, Result};
use crate::index::IndexMaintainer;
use crate::key::RecordId;
use crate::metrics::EngineMetrics;
use crate::partition::Partition;
use crate::record::CommittedRecord;
use crate::replication::ReplicationScheme;
use crate::snapshot::{ChunkEntry, SegmentEntry};
use crate::storage::layout::DataFileKind;
use crate::storage::{chunk, segment, FileGuard, SyncMode};
use std::collections::HashMap;
use std::sync::Arc;
use tracing::{debug, info};

/// Result of a successful run that wrote a chunk.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CompactionSummary {
    /// Number of segments replaced by the chunk.
    pub compacted_segments: usize,
    /// Records read from the segments.
    pub records_in: u64,
    /// Records written to the chunk.
    pub records_out: u64,
    /// Size of the chunk file.
    pub bytes_written: u64,
    /// Descriptor entry of the new chunk.
    pub chunk: ChunkEntry,
    /// Snapshot version that published the chunk.
    pub version: u64,
}

/// Outcome of [`Compactor::compact`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CompactionOutcome {
    /// Too few segments were below the replication horizon.
    Skipped {
        /// Segments that could have been compacted.
        eligible_segments: usize,
    },
    /// A chunk replaced the oldest segments.
    Compacted(CompactionSummary),
}

/// Runs compactions against partitions.
pub struct Compactor {
    scheme: Arc<dyn ReplicationScheme>,
    indexes: Arc<IndexMaintainer>,
    metrics: Arc<EngineMetrics>,
    min_segments: usize,
    sync_mode: SyncMode,
}

impl std::fmt::Debug for Compactor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Compactor")
            .field("min_segments", &self.min_segments)
            .field("sync_mode", &self.sync_mode)
            .finish_non_exhaustive()
    }
}

impl Compactor {
    /// Creates a compactor.
    pub fn new(
        scheme: Arc<dyn ReplicationScheme>,
        indexes: Arc<IndexMaintainer>,
        metrics: Arc<EngineMetrics>,
        min_segments: usize,
        sync_mode: SyncMode,
    ) -> Self {
        Self {
            scheme,
            indexes,
            metrics,
            min_segments: min_segments.max(1),
            sync_mode,
        }
    }

    /// Minimum number of eligible segments for a run to write a chunk.
    pub fn min_segments(&self) -> usize {
        self.min_segments
    }

    /// Compacts `partition` and brings its derived indexes up to date.
    ///
    /// Any failure is reported as [`BurrowError::CompactionFailed`]; the
    /// published snapshot is unchanged unless the chunk was published.
    pub fn compact(&self, partition: &Partition) -> Result<CompactionOutcome> {
        let outcome = self.run(partition).and_then(|outcome| {
            self.indexes.maintain(partition.writer())?;
            Ok(outcome)
        });
        let reaped = partition.writer().reap_snapshots();
        if reaped > 0 {
            debug!(partition = %partition.key(), reaped, "Forgot released snapshots");
        }
        outcome.map_err(|err| match err {
            BurrowError::CompactionFailed(_) => err,
            other => BurrowError::CompactionFailed(format!(
                "partition {}: {}",
                partition.key(),
                other
            )),
        })
    }

    fn run(&self, partition: &Partition) -> Result<CompactionOutcome> {
        let snapshot = partition.snapshot();
        let horizon = partition.compaction_horizon(self.scheme.as_ref(), &snapshot)?;
        let descriptor = snapshot.descriptor();
        let eligible: Vec<SegmentEntry> = descriptor
            .segments
            .iter()
            .take_while(|s| s.end_offset() <= horizon)
            .copied()
            .collect();

        if eligible.is_empty() || eligible.len() < self.min_segments {
            debug!(
                partition = %partition.key(),
                eligible = eligible.len(),
                horizon,
                "Skipping compaction"
            );
            return Ok(CompactionOutcome::Skipped {
                eligible_segments: eligible.len(),
            });
        }

        let mut records_in = 0u64;
        let mut inputs = Vec::with_capacity(eligible.len());
        for (entry, file) in eligible.iter().zip(snapshot.segment_files()) {
            let contents = segment::read_segment(file.path())?;
            if contents.first_offset != entry.first_offset {
                return Err(BurrowError::Corrupted(format!(
                    "segment {} does not start at offset {}",
                    file.path().display(),
                    entry.first_offset
                )));
            }
            records_in += contents.records.len() as u64;
            inputs.extend(contents.into_committed());
        }
        let merged = merge_records(inputs);

        let first_offset = eligible[0].first_offset;
        let end_offset = eligible[eligible.len() - 1].end_offset();
        let generation = descriptor.next_generation;
        let path = snapshot
            .base_path()
            .join(DataFileKind::Chunk(generation).file_name());
        let bytes_written = chunk::write_chunk(
            &path,
            generation,
            first_offset,
            end_offset,
            &merged,
            self.sync_mode,
        )?;

        let chunk = ChunkEntry {
            generation,
            first_offset,
            end_offset,
            record_count: merged.len() as u32,
        };
        let guard = Arc::new(FileGuard::new(path));
        let published = match partition
            .writer()
            .publish_compaction(&eligible, chunk, Arc::clone(&guard))
        {
            Ok(published) => published,
            Err(err) => {
                guard.mark_obsolete();
                return Err(err);
            }
        };

        let records_out = merged.len() as u64;
        self.metrics
            .record_compaction(records_in, records_out, bytes_written);
        info!(
            partition = %partition.key(),
            version = published.version(),
            segments = eligible.len(),
            records_in,
            records_out,
            generation,
            "Compacted segments into chunk"
        );

        Ok(CompactionOutcome::Compacted(CompactionSummary {
            compacted_segments: eligible.len(),
            records_in,
            records_out,
            bytes_written,
            chunk,
            version: published.version(),
        }))
    }
}

/// Keeps the winning version of every record id, in offset order.
///
/// The highest `record_version` wins; equal versions resolve to the higher
/// offset.
fn merge_records(records: Vec<CommittedRecord>) -> Vec<CommittedRecord> {
    let mut merged: HashMap<RecordId, CommittedRecord> = HashMap::with_capacity(records.len());
    for record in records {
        match merged.get(&record.record.record_id) {
            Some(existing) => {
                let should_replace = (record.record.record_version, record.offset)
                    > (existing.record.record_version, existing.offset);
                if should_replace {
                    merged.insert(record.record.record_id, record);
                }
            }
            None => {
                merged.insert(record.record.record_id, record);
            }
        }
    }

    let mut merged: Vec<CommittedRecord> = merged.into_values().collect();
    merged.sort_by_key(|r| r.offset);
    merged
}
