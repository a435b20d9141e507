//! PartitionWriter - staging, commit and snapshot publication for one
//! partition.
//!
//! All publications of a partition (commits, compactions, index updates) go
//! through the writer's commit lock, so snapshot versions form a total order.
//! Each publication follows the same steps:
//!
//! 1. Write any new data file (temp file + rename)
//! 2. Persist the new descriptor (`SNAPSHOT`, temp file + rename)
//! 3. Install the new snapshot in the [`SnapshotCell`]
//!
//! A failure before the descriptor rename leaves the published snapshot
//! unchanged. Once the descriptor is renamed into place the snapshot is
//! installed, even if the directory sync after the rename fails.

use crate::arena::RecordArena;
use crate::error::{BurrowError, Result};
use crate::key::PartitionKey;
use crate::metrics::EngineMetrics;
use crate::record::RecordRef;
use crate::snapshot::{
    ChunkEntry, IndexEntry, PartitionSnapshot, PartitionState, SegmentEntry, SnapshotCell,
    SnapshotLifecycle,
};
use crate::storage::layout::{DataFileKind, PartitionLayout, DESCRIPTOR_FILE};
use crate::storage::{chunk, segment, sync_dir, write_atomic_with, FileGuard, SyncMode};
use parking_lot::Mutex;
use std::fs;
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing::{debug, info, warn};

/// Single writer of one partition.
pub struct PartitionWriter {
    key: PartitionKey,
    table: Arc<str>,
    base_path: Arc<PathBuf>,
    sync_mode: SyncMode,
    arena: RecordArena,
    snapshots: SnapshotCell,
    commit_lock: Mutex<()>,
    metrics: Arc<EngineMetrics>,
    dir_sync: fn(&Path) -> std::io::Result<()>,
}

impl std::fmt::Debug for PartitionWriter {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PartitionWriter")
            .field("key", &self.key)
            .field("table", &self.table)
            .field("base_path", &self.base_path)
            .field("sync_mode", &self.sync_mode)
            .field("staged", &self.arena.len())
            .finish_non_exhaustive()
    }
}

impl PartitionWriter {
    /// Creates a new, empty partition.
    ///
    /// Fails if the partition already has a descriptor on disk.
    pub fn create(
        key: PartitionKey,
        table: &str,
        layout: &PartitionLayout,
        sync_mode: SyncMode,
        metrics: Arc<EngineMetrics>,
    ) -> Result<Self> {
        let dir = layout.partition_dir(table, &key);
        if dir.join(DESCRIPTOR_FILE).exists() {
            return Err(BurrowError::Validation(format!(
                "partition {} of table {} already exists",
                key, table
            )));
        }
        Self::open(key, table, layout, sync_mode, metrics)
    }

    /// Opens a partition, creating it if no descriptor exists.
    ///
    /// Files not referenced by the descriptor are left-overs of interrupted
    /// commits or compactions and are deleted.
    pub fn open(
        key: PartitionKey,
        table: &str,
        layout: &PartitionLayout,
        sync_mode: SyncMode,
        metrics: Arc<EngineMetrics>,
    ) -> Result<Self> {
        let dir = layout.partition_dir(table, &key);
        fs::create_dir_all(&dir)?;

        let descriptor_path = dir.join(DESCRIPTOR_FILE);
        let descriptor = match fs::read(&descriptor_path) {
            Ok(data) => PartitionState::decode(&data)?,
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => PartitionState::default(),
            Err(err) => return Err(err.into()),
        };

        remove_unreferenced_files(&dir, &descriptor)?;

        let mut segment_files = Vec::with_capacity(descriptor.segments.len());
        let mut chunk_files = Vec::with_capacity(descriptor.chunks.len());
        let arena = RecordArena::new();
        for entry in &descriptor.chunks {
            let path = dir.join(DataFileKind::Chunk(entry.generation).file_name());
            let contents = chunk::read_chunk(&path)?;
            arena.restore_committed(
                contents
                    .records
                    .iter()
                    .map(|r| (r.record.record_id, r.record.record_version)),
            );
            chunk_files.push(Arc::new(FileGuard::new(path)));
        }
        for entry in &descriptor.segments {
            let path = dir.join(DataFileKind::Segment(entry.first_offset).file_name());
            let contents = segment::read_segment(&path)?;
            if contents.first_offset != entry.first_offset
                || contents.records.len() != entry.record_count as usize
            {
                return Err(BurrowError::Corrupted(format!(
                    "segment {} does not match its descriptor entry",
                    path.display()
                )));
            }
            arena.restore_committed(
                contents
                    .records
                    .iter()
                    .map(|r| (r.record_id, r.record_version)),
            );
            segment_files.push(Arc::new(FileGuard::new(path)));
        }

        let table: Arc<str> = Arc::from(table);
        let base_path = Arc::new(dir);
        let version = descriptor.version;
        let nrecs = descriptor.nrecs;
        let initial = PartitionSnapshot::new(
            key,
            Arc::clone(&table),
            Arc::clone(&base_path),
            descriptor,
            segment_files,
            chunk_files,
        )?;
        debug!(
            partition = %key,
            version,
            nrecs,
            "Opened partition"
        );

        Ok(Self {
            key,
            table,
            base_path,
            sync_mode,
            arena,
            snapshots: SnapshotCell::new(initial),
            commit_lock: Mutex::new(()),
            metrics,
            dir_sync: sync_dir,
        })
    }

    /// Partition key.
    pub fn key(&self) -> &PartitionKey {
        &self.key
    }

    /// Owning table.
    pub fn table(&self) -> &str {
        &self.table
    }

    /// Partition directory.
    pub fn base_path(&self) -> &Path {
        &self.base_path
    }

    /// Sync mode used for data and descriptor files.
    pub fn sync_mode(&self) -> SyncMode {
        self.sync_mode
    }

    /// Stages one record. Returns true if the staged set changed.
    pub fn insert_record(&self, record: RecordRef) -> bool {
        let changed = self.arena.insert_record(record);
        self.metrics.record_inserts(1, u64::from(changed));
        changed
    }

    /// Stages a batch. Returns true if any record changed the staged set.
    pub fn insert_records<I>(&self, records: I) -> bool
    where
        I: IntoIterator<Item = RecordRef>,
    {
        let records: Vec<RecordRef> = records.into_iter().collect();
        let attempted = records.len() as u64;
        let staged = self.arena.stage_records(records);
        self.metrics.record_inserts(attempted, staged as u64);
        staged > 0
    }

    /// Number of staged, not yet committed records.
    pub fn staged_len(&self) -> usize {
        self.arena.len()
    }

    /// Returns the published snapshot.
    pub fn snapshot(&self) -> PartitionSnapshot {
        self.snapshots.current()
    }

    /// Lifecycle of a snapshot version of this partition.
    pub fn lifecycle_of(&self, version: u64) -> Option<SnapshotLifecycle> {
        self.snapshots.lifecycle_of(version)
    }

    /// Forgets superseded snapshots that no holder references anymore.
    pub fn reap_snapshots(&self) -> usize {
        self.snapshots.reap()
    }

    /// Makes the staged records durable and publishes a new snapshot.
    ///
    /// With nothing staged, returns the published snapshot unchanged. On
    /// failure nothing is published and the records stay staged.
    pub fn commit(&self) -> Result<PartitionSnapshot> {
        let _guard = self.commit_lock.lock();
        let current = self.snapshots.current();
        let batch = self.arena.staged_batch();
        if batch.is_empty() {
            return Ok(current);
        }

        let first_offset = current.nrecs();
        let records: Vec<RecordRef> = batch.iter().map(|s| s.record.clone()).collect();
        let path = self
            .base_path
            .join(DataFileKind::Segment(first_offset).file_name());
        let bytes = segment::write_segment(&path, first_offset, &records, self.sync_mode)?;

        let entry = SegmentEntry {
            first_offset,
            record_count: records.len() as u32,
        };
        let mut descriptor = current.descriptor().clone();
        descriptor.version += 1;
        descriptor.nrecs = entry.end_offset();
        descriptor.segments.push(entry);

        let mut segment_files = current.segment_files().to_vec();
        segment_files.push(Arc::new(FileGuard::new(path)));
        let chunk_files = current.chunk_files().to_vec();

        let next = self.publish_locked(descriptor, segment_files, chunk_files)?;
        self.arena.mark_committed(&batch);
        self.metrics.record_commit(records.len() as u64, bytes);
        info!(
            partition = %self.key,
            version = next.version(),
            nrecs = next.nrecs(),
            records = records.len(),
            "Committed partition batch"
        );
        Ok(next)
    }

    /// Replaces `compacted` segments with `chunk` and publishes the result.
    ///
    /// `compacted` must be the oldest segments of the published snapshot.
    /// Their files are deleted once every snapshot referencing them is
    /// released.
    pub fn publish_compaction(
        &self,
        compacted: &[SegmentEntry],
        chunk: ChunkEntry,
        chunk_file: Arc<FileGuard>,
    ) -> Result<PartitionSnapshot> {
        let _guard = self.commit_lock.lock();
        let current = self.snapshots.current();
        let segments = &current.descriptor().segments;
        if compacted.is_empty() || !segments.starts_with(compacted) {
            return Err(BurrowError::CompactionFailed(format!(
                "partition {} changed its oldest segments during compaction",
                self.key
            )));
        }

        let removed = compacted.len();
        let mut descriptor = current.descriptor().clone();
        descriptor.version += 1;
        descriptor.segments.drain(..removed);
        descriptor.chunks.push(chunk);
        descriptor.compacted_offset = descriptor.compacted_offset.max(chunk.end_offset);
        descriptor.next_generation = descriptor.next_generation.max(chunk.generation + 1);

        let segment_files = current.segment_files()[removed..].to_vec();
        let mut chunk_files = current.chunk_files().to_vec();
        chunk_files.push(chunk_file);

        let next = self.publish_locked(descriptor, segment_files, chunk_files)?;
        for guard in &current.segment_files()[..removed] {
            guard.mark_obsolete();
        }
        Ok(next)
    }

    /// Records the committed state of a derived index.
    pub fn publish_index_state(&self, name: &str, entry: IndexEntry) -> Result<PartitionSnapshot> {
        let _guard = self.commit_lock.lock();
        let current = self.snapshots.current();
        let mut descriptor = current.descriptor().clone();
        descriptor.version += 1;
        descriptor.indexes.insert(name.to_string(), entry);

        let next = self.publish_locked(
            descriptor,
            current.segment_files().to_vec(),
            current.chunk_files().to_vec(),
        )?;
        self.metrics.record_index_update();
        Ok(next)
    }

    /// Persists `descriptor` and publishes it. The commit lock must be held.
    fn publish_locked(
        &self,
        descriptor: PartitionState,
        segment_files: Vec<Arc<FileGuard>>,
        chunk_files: Vec<Arc<FileGuard>>,
    ) -> Result<PartitionSnapshot> {
        let data = descriptor.encode();
        let next = PartitionSnapshot::new(
            self.key,
            Arc::clone(&self.table),
            Arc::clone(&self.base_path),
            descriptor,
            segment_files,
            chunk_files,
        )?;
        let installed = write_atomic_with(
            &self.base_path.join(DESCRIPTOR_FILE),
            self.sync_mode,
            |writer| {
                writer.write_all(&data)?;
                Ok(())
            },
            self.dir_sync,
        )?;
        // the descriptor on disk now names `next`
        self.snapshots.publish(next.clone())?;
        if let Err(err) = installed.dir_synced {
            warn!(
                partition = %self.key,
                version = next.version(),
                error = %err,
                "Published snapshot before its directory sync succeeded"
            );
        }
        Ok(next)
    }
}

/// Deletes data files the descriptor does not reference, and temp files of
/// interrupted writes. An index file is referenced when its name is the
/// recorded state of an index.
fn remove_unreferenced_files(dir: &Path, descriptor: &PartitionState) -> Result<()> {
    for (kind, path) in PartitionLayout::list_data_files(dir)? {
        let referenced = match kind {
            DataFileKind::Segment(first_offset) => descriptor
                .segments
                .iter()
                .any(|s| s.first_offset == first_offset),
            DataFileKind::Chunk(generation) => {
                descriptor.chunks.iter().any(|c| c.generation == generation)
            }
            DataFileKind::Index { .. } => path
                .file_name()
                .and_then(|name| name.to_str())
                .is_some_and(|name| {
                    descriptor
                        .indexes
                        .values()
                        .any(|entry| entry.state == name.as_bytes())
                }),
        };
        if !referenced {
            remove_orphan(&path);
        }
    }

    for entry in fs::read_dir(dir)? {
        let path = entry?.path();
        if path.extension().is_some_and(|ext| ext == "tmp") {
            remove_orphan(&path);
        }
    }
    Ok(())
}

fn remove_orphan(path: &Path) {
    match fs::remove_file(path) {
        Ok(()) => debug!("Removed orphan file: {}", path.display()),
        Err(err) => warn!("Failed to remove orphan file {}: {:?}", path.display(), err),
    }
}
