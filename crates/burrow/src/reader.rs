//! PartitionReader - scans over one partition snapshot.
//!
//! A reader owns a [`PartitionSnapshot`] handle, so the files it scans stay
//! on disk and its view stays fixed while commits and compactions publish
//! newer snapshots.

use crate::error::{BurrowError, Result};
use crate::key::RecordId;
use crate::record::CommittedRecord;
use crate::snapshot::PartitionSnapshot;
use crate::storage::{chunk, segment};
use std::collections::HashMap;

/// Reader over a fixed partition snapshot.
#[derive(Debug, Clone)]
pub struct PartitionReader {
    snapshot: PartitionSnapshot,
}

impl PartitionReader {
    /// Creates a reader over `snapshot`.
    pub fn new(snapshot: PartitionSnapshot) -> Self {
        Self { snapshot }
    }

    /// The snapshot this reader observes.
    pub fn snapshot(&self) -> &PartitionSnapshot {
        &self.snapshot
    }

    /// Delivers the live record of every record id in offset order.
    ///
    /// Among several versions of an id the highest `record_version` wins;
    /// equal versions resolve to the later offset. Returns the number of
    /// records delivered.
    pub fn fetch_records<F>(&self, mut callback: F) -> Result<u64>
    where
        F: FnMut(&CommittedRecord),
    {
        let mut delivered = 0;
        for record in self.live_records()? {
            callback(&record);
            delivered += 1;
        }
        Ok(delivered)
    }

    /// Delivers every live record whose delivery position `i` satisfies
    /// `i % modulo == index`.
    ///
    /// Readers using the same `modulo` and distinct indexes partition the
    /// records between them.
    pub fn fetch_records_with_sampling<F>(
        &self,
        modulo: u64,
        index: u64,
        mut callback: F,
    ) -> Result<u64>
    where
        F: FnMut(&CommittedRecord),
    {
        if modulo == 0 {
            return Err(BurrowError::Validation(
                "sampling modulo must be non-zero".to_string(),
            ));
        }
        if index >= modulo {
            return Err(BurrowError::Validation(format!(
                "sampling index {} must be below modulo {}",
                index, modulo
            )));
        }

        let mut delivered = 0;
        for (position, record) in self.live_records()?.iter().enumerate() {
            if position as u64 % modulo == index {
                callback(record);
                delivered += 1;
            }
        }
        Ok(delivered)
    }

    /// Delivers the stored records with offsets in `[from, until)` in offset
    /// order, superseded versions included where compaction has not dropped
    /// them.
    pub fn fetch_range<F>(&self, from: u64, until: u64, mut callback: F) -> Result<u64>
    where
        F: FnMut(&CommittedRecord),
    {
        if until < from {
            return Err(BurrowError::Validation(format!(
                "offset range end {} is before start {}",
                until, from
            )));
        }
        let mut delivered = 0;
        for record in self.stored_records(from, until)? {
            callback(&record);
            delivered += 1;
        }
        Ok(delivered)
    }

    fn live_records(&self) -> Result<Vec<CommittedRecord>> {
        let records = self.stored_records(0, self.snapshot.nrecs())?;

        let mut winners: HashMap<RecordId, (u64, u64)> = HashMap::with_capacity(records.len());
        for record in &records {
            let candidate = (record.record.record_version, record.offset);
            winners
                .entry(record.record.record_id)
                .and_modify(|best| {
                    if candidate > *best {
                        *best = candidate;
                    }
                })
                .or_insert(candidate);
        }

        Ok(records
            .into_iter()
            .filter(|record| {
                winners.get(&record.record.record_id).map(|&(_, offset)| offset)
                    == Some(record.offset)
            })
            .collect())
    }

    /// Loads records in `[from, until)` from chunks, then segments.
    ///
    /// Chunks cover offsets below the compacted offset and segments the
    /// rest, so concatenation preserves offset order.
    fn stored_records(&self, from: u64, until: u64) -> Result<Vec<CommittedRecord>> {
        let descriptor = self.snapshot.descriptor();
        let mut records = Vec::new();
        if from >= until {
            return Ok(records);
        }

        for (entry, file) in descriptor.chunks.iter().zip(self.snapshot.chunk_files()) {
            if entry.end_offset <= from || entry.first_offset >= until {
                continue;
            }
            let contents = chunk::read_chunk(file.path())?;
            records.extend(
                contents
                    .records
                    .into_iter()
                    .filter(|r| r.offset >= from && r.offset < until),
            );
        }

        for (entry, file) in descriptor
            .segments
            .iter()
            .zip(self.snapshot.segment_files())
        {
            if entry.end_offset() <= from || entry.first_offset >= until {
                continue;
            }
            let contents = segment::read_segment(file.path())?;
            records.extend(
                contents
                    .into_committed()
                    .into_iter()
                    .filter(|r| r.offset >= from && r.offset < until),
            );
        }
        Ok(records)
    }
}
