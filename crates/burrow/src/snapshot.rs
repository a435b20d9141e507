//! Versioned, copy-on-write partition snapshots.
//!
//! A [`PartitionSnapshot`] is an immutable view of a partition: the encoded
//! [`PartitionState`] descriptor plus shared handles to every data file it
//! references. Publishing never mutates a snapshot; it installs a new one in
//! the partition's [`SnapshotCell`].
//!
//! # Lifecycle
//!
//! ```text
//! Staged ──publish──▶ Published ──newer publish──▶ Superseded ──last drop──▶ Collectible
//! ```
//!
//! Data files dropped by compaction stay on disk until the last snapshot that
//! references them is released (see [`FileGuard`]).

use crate::error::{BurrowError, Result};
use crate::key::PartitionKey;
use crate::storage::{ByteReader, FileGuard};
use parking_lot::{Mutex, RwLock};
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU8, Ordering};
use std::sync::{Arc, Weak};
use tracing::debug;

/// Magic bytes for the partition descriptor: "BSNP"
pub const DESCRIPTOR_MAGIC: [u8; 4] = *b"BSNP";

/// Current descriptor format version.
pub const DESCRIPTOR_VERSION: u16 = 1;

/// A committed segment referenced by the descriptor.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SegmentEntry {
    /// Offset of the first record in the segment.
    pub first_offset: u64,
    /// Number of records in the segment.
    pub record_count: u32,
}

impl SegmentEntry {
    /// Offset one past the last record of the segment.
    pub fn end_offset(&self) -> u64 {
        self.first_offset + u64::from(self.record_count)
    }
}

/// A compacted chunk referenced by the descriptor.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ChunkEntry {
    /// Compaction generation; names the chunk file.
    pub generation: u32,
    /// First offset covered by the chunk.
    pub first_offset: u64,
    /// Offset one past the last offset covered by the chunk.
    pub end_offset: u64,
    /// Number of surviving records stored in the chunk.
    pub record_count: u32,
}

/// Committed state of one derived index.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct IndexEntry {
    /// Partition offset the index is built up to.
    pub offset: u64,
    /// Opaque index state.
    pub state: Vec<u8>,
}

/// Descriptor of a partition's durable state.
///
/// Segments cover offsets at or after `compacted_offset`; chunks cover the
/// offsets before it. Both lists are ordered by offset.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct PartitionState {
    /// Snapshot version that published this state.
    pub version: u64,
    /// Number of record versions ever committed; the next commit offset.
    pub nrecs: u64,
    /// Offsets below this value live in chunks.
    pub compacted_offset: u64,
    /// Generation assigned to the next chunk.
    pub next_generation: u32,
    /// Uncompacted segments.
    pub segments: Vec<SegmentEntry>,
    /// Compacted chunks.
    pub chunks: Vec<ChunkEntry>,
    /// Derived index states by index name.
    pub indexes: BTreeMap<String, IndexEntry>,
}

impl PartitionState {
    /// Encodes the descriptor with a trailing CRC32.
    pub fn encode(&self) -> Vec<u8> {
        let mut buf = Vec::with_capacity(48 + self.segments.len() * 12 + self.chunks.len() * 24);
        buf.extend_from_slice(&DESCRIPTOR_MAGIC);
        buf.extend_from_slice(&DESCRIPTOR_VERSION.to_le_bytes());
        buf.extend_from_slice(&[0u8; 2]);
        buf.extend_from_slice(&self.version.to_le_bytes());
        buf.extend_from_slice(&self.nrecs.to_le_bytes());
        buf.extend_from_slice(&self.compacted_offset.to_le_bytes());
        buf.extend_from_slice(&self.next_generation.to_le_bytes());

        buf.extend_from_slice(&(self.segments.len() as u32).to_le_bytes());
        for segment in &self.segments {
            buf.extend_from_slice(&segment.first_offset.to_le_bytes());
            buf.extend_from_slice(&segment.record_count.to_le_bytes());
        }

        buf.extend_from_slice(&(self.chunks.len() as u32).to_le_bytes());
        for chunk in &self.chunks {
            buf.extend_from_slice(&chunk.generation.to_le_bytes());
            buf.extend_from_slice(&chunk.first_offset.to_le_bytes());
            buf.extend_from_slice(&chunk.end_offset.to_le_bytes());
            buf.extend_from_slice(&chunk.record_count.to_le_bytes());
        }

        buf.extend_from_slice(&(self.indexes.len() as u32).to_le_bytes());
        for (name, entry) in &self.indexes {
            buf.extend_from_slice(&(name.len() as u16).to_le_bytes());
            buf.extend_from_slice(name.as_bytes());
            buf.extend_from_slice(&entry.offset.to_le_bytes());
            buf.extend_from_slice(&(entry.state.len() as u32).to_le_bytes());
            buf.extend_from_slice(&entry.state);
        }

        let crc = crc32fast::hash(&buf);
        buf.extend_from_slice(&crc.to_le_bytes());
        buf
    }

    /// Decodes and verifies a descriptor.
    pub fn decode(data: &[u8]) -> Result<Self> {
        if data.len() < 4 {
            return Err(BurrowError::Corrupted(
                "descriptor shorter than its checksum".to_string(),
            ));
        }
        let (body, crc) = data.split_at(data.len() - 4);
        let mut reader = ByteReader::new(body);
        let magic = reader.magic()?;
        if magic != DESCRIPTOR_MAGIC {
            return Err(BurrowError::InvalidMagic {
                expected: DESCRIPTOR_MAGIC,
                actual: magic,
            });
        }
        let format_version = reader.u16()?;
        if format_version > DESCRIPTOR_VERSION {
            return Err(BurrowError::UnsupportedVersion(format_version));
        }
        let expected = ByteReader::new(crc).u32()?;
        let actual = crc32fast::hash(body);
        if expected != actual {
            return Err(BurrowError::ChecksumMismatch { expected, actual });
        }
        reader.u16()?;

        let mut state = PartitionState {
            version: reader.u64()?,
            nrecs: reader.u64()?,
            compacted_offset: reader.u64()?,
            next_generation: reader.u32()?,
            ..Self::default()
        };

        let segment_count = reader.u32()?;
        for _ in 0..segment_count {
            state.segments.push(SegmentEntry {
                first_offset: reader.u64()?,
                record_count: reader.u32()?,
            });
        }

        let chunk_count = reader.u32()?;
        for _ in 0..chunk_count {
            state.chunks.push(ChunkEntry {
                generation: reader.u32()?,
                first_offset: reader.u64()?,
                end_offset: reader.u64()?,
                record_count: reader.u32()?,
            });
        }

        let index_count = reader.u32()?;
        for _ in 0..index_count {
            let name_len = reader.u16()? as usize;
            let name = std::str::from_utf8(reader.bytes(name_len)?)
                .map_err(|_| BurrowError::Corrupted("index name is not UTF-8".to_string()))?
                .to_string();
            let offset = reader.u64()?;
            let state_len = reader.u32()? as usize;
            let blob = reader.bytes(state_len)?.to_vec();
            state.indexes.insert(
                name,
                IndexEntry {
                    offset,
                    state: blob,
                },
            );
        }

        if !reader.is_empty() {
            return Err(BurrowError::Corrupted(
                "trailing bytes in descriptor".to_string(),
            ));
        }
        Ok(state)
    }
}

/// Lifecycle stage of a snapshot.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum SnapshotLifecycle {
    /// Built by a commit or compaction, not yet visible.
    Staged = 0,
    /// Handed out to new readers.
    Published = 1,
    /// Replaced by a newer snapshot; still valid for existing holders.
    Superseded = 2,
    /// No holder remains; owned resources can be reclaimed.
    Collectible = 3,
}

impl SnapshotLifecycle {
    fn from_u8(value: u8) -> Self {
        match value {
            0 => Self::Staged,
            1 => Self::Published,
            2 => Self::Superseded,
            _ => Self::Collectible,
        }
    }
}

/// State shared by every clone of a snapshot.
#[derive(Debug)]
struct SnapshotState {
    descriptor: PartitionState,
    segment_files: Vec<Arc<FileGuard>>,
    chunk_files: Vec<Arc<FileGuard>>,
    lifecycle: AtomicU8,
}

/// Immutable view of a partition at one version.
///
/// Cloning copies the scalar fields and shares the underlying state.
#[derive(Debug, Clone)]
pub struct PartitionSnapshot {
    key: PartitionKey,
    version: u64,
    nrecs: u64,
    base_path: Arc<PathBuf>,
    table_ref: Arc<str>,
    state: Arc<SnapshotState>,
}

impl PartitionSnapshot {
    /// Builds a staged snapshot.
    ///
    /// `segment_files` and `chunk_files` hold one guard per descriptor entry,
    /// in the same order.
    pub fn new(
        key: PartitionKey,
        table_ref: Arc<str>,
        base_path: Arc<PathBuf>,
        descriptor: PartitionState,
        segment_files: Vec<Arc<FileGuard>>,
        chunk_files: Vec<Arc<FileGuard>>,
    ) -> Result<Self> {
        if segment_files.len() != descriptor.segments.len()
            || chunk_files.len() != descriptor.chunks.len()
        {
            return Err(BurrowError::Validation(format!(
                "descriptor lists {} segments and {} chunks, got {} and {} files",
                descriptor.segments.len(),
                descriptor.chunks.len(),
                segment_files.len(),
                chunk_files.len()
            )));
        }
        Ok(Self {
            key,
            version: descriptor.version,
            nrecs: descriptor.nrecs,
            base_path,
            table_ref,
            state: Arc::new(SnapshotState {
                descriptor,
                segment_files,
                chunk_files,
                lifecycle: AtomicU8::new(SnapshotLifecycle::Staged as u8),
            }),
        })
    }

    /// Partition key.
    pub fn key(&self) -> &PartitionKey {
        &self.key
    }

    /// Snapshot version; strictly increasing per partition.
    pub fn version(&self) -> u64 {
        self.version
    }

    /// Number of committed record versions.
    pub fn nrecs(&self) -> u64 {
        self.nrecs
    }

    /// Partition directory.
    pub fn base_path(&self) -> &Path {
        &self.base_path
    }

    /// Owning table.
    pub fn table_ref(&self) -> &str {
        &self.table_ref
    }

    /// Decoded descriptor.
    pub fn descriptor(&self) -> &PartitionState {
        &self.state.descriptor
    }

    /// Serialized descriptor.
    pub fn state_blob(&self) -> Vec<u8> {
        self.state.descriptor.encode()
    }

    /// Guards of the referenced segments, in descriptor order.
    pub fn segment_files(&self) -> &[Arc<FileGuard>] {
        &self.state.segment_files
    }

    /// Guards of the referenced chunks, in descriptor order.
    pub fn chunk_files(&self) -> &[Arc<FileGuard>] {
        &self.state.chunk_files
    }

    /// Committed state of a derived index.
    pub fn index_entry(&self, name: &str) -> Option<&IndexEntry> {
        self.state.descriptor.indexes.get(name)
    }

    /// Current lifecycle stage.
    ///
    /// A live handle never observes `Collectible`; see
    /// [`SnapshotCell::lifecycle_of`].
    pub fn lifecycle(&self) -> SnapshotLifecycle {
        SnapshotLifecycle::from_u8(self.state.lifecycle.load(Ordering::Acquire))
    }

    /// Number of handles sharing this snapshot's state.
    pub fn holder_count(&self) -> usize {
        Arc::strong_count(&self.state)
    }

    fn set_lifecycle(&self, lifecycle: SnapshotLifecycle) {
        self.state.lifecycle.store(lifecycle as u8, Ordering::Release);
    }
}

/// Holder of a partition's current snapshot.
///
/// Superseded snapshots are tracked weakly so their reclamation can be
/// observed without keeping them alive.
#[derive(Debug)]
pub struct SnapshotCell {
    current: RwLock<PartitionSnapshot>,
    superseded: Mutex<Vec<(u64, Weak<SnapshotState>)>>,
}

impl SnapshotCell {
    /// Publishes `initial` as the first snapshot.
    pub fn new(initial: PartitionSnapshot) -> Self {
        initial.set_lifecycle(SnapshotLifecycle::Published);
        Self {
            current: RwLock::new(initial),
            superseded: Mutex::new(Vec::new()),
        }
    }

    /// Returns a handle to the published snapshot.
    pub fn current(&self) -> PartitionSnapshot {
        self.current.read().clone()
    }

    /// Version of the published snapshot.
    pub fn current_version(&self) -> u64 {
        self.current.read().version
    }

    /// Installs `next`, superseding the published snapshot.
    ///
    /// `next.version()` must be greater than the published version.
    pub fn publish(&self, next: PartitionSnapshot) -> Result<()> {
        let previous = {
            let mut current = self.current.write();
            if next.version <= current.version {
                return Err(BurrowError::Validation(format!(
                    "snapshot version {} does not supersede {}",
                    next.version, current.version
                )));
            }
            next.set_lifecycle(SnapshotLifecycle::Published);
            std::mem::replace(&mut *current, next)
        };
        previous.set_lifecycle(SnapshotLifecycle::Superseded);
        self.superseded
            .lock()
            .push((previous.version, Arc::downgrade(&previous.state)));
        debug!(
            partition = %previous.key,
            version = previous.version,
            holders = previous.holder_count() - 1,
            "Snapshot superseded"
        );
        // the cell's handle is released here; files go once readers finish
        drop(previous);
        Ok(())
    }

    /// Lifecycle of the snapshot with `version`, if this cell knows it.
    pub fn lifecycle_of(&self, version: u64) -> Option<SnapshotLifecycle> {
        if self.current.read().version == version {
            return Some(SnapshotLifecycle::Published);
        }
        let superseded = self.superseded.lock();
        let (_, weak) = superseded.iter().find(|(v, _)| *v == version)?;
        Some(if weak.strong_count() > 0 {
            SnapshotLifecycle::Superseded
        } else {
            SnapshotLifecycle::Collectible
        })
    }

    /// Forgets collectible snapshots. Returns how many were removed.
    pub fn reap(&self) -> usize {
        let mut superseded = self.superseded.lock();
        let before = superseded.len();
        superseded.retain(|(_, weak)| weak.strong_count() > 0);
        before - superseded.len()
    }

    /// Number of superseded snapshots still tracked.
    pub fn superseded_len(&self) -> usize {
        self.superseded.lock().len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::key::Hash160;
    use std::fs;
    use tempfile::TempDir;

    fn snapshot(version: u64, nrecs: u64, files: Vec<Arc<FileGuard>>) -> PartitionSnapshot {
        let segments = files
            .iter()
            .enumerate()
            .map(|(i, _)| SegmentEntry {
                first_offset: i as u64,
                record_count: 1,
            })
            .collect();
        let descriptor = PartitionState {
            version,
            nrecs,
            segments,
            ..PartitionState::default()
        };
        PartitionSnapshot::new(
            Hash160::digest(b"p"),
            Arc::from("events"),
            Arc::new(PathBuf::from("/data/events/p")),
            descriptor,
            files,
            Vec::new(),
        )
        .unwrap()
    }

    fn sample_state() -> PartitionState {
        let mut indexes = BTreeMap::new();
        indexes.insert(
            "record_bloom".to_string(),
            IndexEntry {
                offset: 12,
                state: vec![1, 2, 3],
            },
        );
        PartitionState {
            version: 7,
            nrecs: 20,
            compacted_offset: 12,
            next_generation: 2,
            segments: vec![
                SegmentEntry {
                    first_offset: 12,
                    record_count: 5,
                },
                SegmentEntry {
                    first_offset: 17,
                    record_count: 3,
                },
            ],
            chunks: vec![ChunkEntry {
                generation: 1,
                first_offset: 0,
                end_offset: 12,
                record_count: 9,
            }],
            indexes,
        }
    }

    #[test]
    fn test_descriptor_encode_decode() {
        let state = sample_state();
        let decoded = PartitionState::decode(&state.encode()).unwrap();
        assert_eq!(decoded, state);
        assert_eq!(decoded.segments[1].end_offset(), 20);
    }

    #[test]
    fn test_descriptor_corruption() {
        let mut data = sample_state().encode();
        data[20] ^= 0x01;
        assert!(matches!(
            PartitionState::decode(&data),
            Err(BurrowError::ChecksumMismatch { .. })
        ));
        assert!(PartitionState::decode(&data[..3]).is_err());

        let mut bad_magic = sample_state().encode();
        bad_magic[0] = b'Z';
        assert!(matches!(
            PartitionState::decode(&bad_magic),
            Err(BurrowError::InvalidMagic { .. })
        ));
    }

    #[test]
    fn test_clone_shares_state() {
        let snap = snapshot(1, 0, Vec::new());
        let copy = snap.clone();
        assert_eq!(snap.holder_count(), 2);
        assert_eq!(copy.version(), 1);
        assert_eq!(copy.table_ref(), "events");
        assert_eq!(copy.state_blob(), snap.state_blob());
        assert_eq!(copy.lifecycle(), SnapshotLifecycle::Staged);
    }

    #[test]
    fn test_mismatched_files_are_rejected() {
        let descriptor = PartitionState {
            segments: vec![SegmentEntry {
                first_offset: 0,
                record_count: 1,
            }],
            ..PartitionState::default()
        };
        let result = PartitionSnapshot::new(
            Hash160::digest(b"p"),
            Arc::from("t"),
            Arc::new(PathBuf::new()),
            descriptor,
            Vec::new(),
            Vec::new(),
        );
        assert!(matches!(result, Err(BurrowError::Validation(_))));
    }

    #[test]
    fn test_lifecycle_transitions() {
        let cell = SnapshotCell::new(snapshot(1, 0, Vec::new()));
        let held = cell.current();
        assert_eq!(held.lifecycle(), SnapshotLifecycle::Published);

        let next = snapshot(2, 1, Vec::new());
        assert_eq!(next.lifecycle(), SnapshotLifecycle::Staged);
        cell.publish(next).unwrap();

        assert_eq!(held.lifecycle(), SnapshotLifecycle::Superseded);
        assert_eq!(cell.lifecycle_of(1), Some(SnapshotLifecycle::Superseded));
        assert_eq!(cell.lifecycle_of(2), Some(SnapshotLifecycle::Published));
        assert_eq!(cell.current().nrecs(), 1);
        assert_eq!(held.nrecs(), 0);

        drop(held);
        assert_eq!(cell.lifecycle_of(1), Some(SnapshotLifecycle::Collectible));
        assert_eq!(cell.reap(), 1);
        assert_eq!(cell.lifecycle_of(1), None);
        assert_eq!(cell.superseded_len(), 0);
    }

    #[test]
    fn test_publish_requires_newer_version() {
        let cell = SnapshotCell::new(snapshot(3, 0, Vec::new()));
        assert!(cell.publish(snapshot(3, 1, Vec::new())).is_err());
        assert!(cell.publish(snapshot(2, 1, Vec::new())).is_err());
        assert_eq!(cell.current_version(), 3);
    }

    #[test]
    fn test_obsolete_file_outlives_superseded_reader() {
        let temp_dir = TempDir::new().unwrap();
        let path = temp_dir.path().join("0000000000000000.seg");
        fs::write(&path, b"seg").unwrap();
        let guard = Arc::new(FileGuard::new(&path));

        let cell = SnapshotCell::new(snapshot(1, 1, vec![Arc::clone(&guard)]));
        let reader = cell.current();
        cell.publish(snapshot(2, 1, Vec::new())).unwrap();
        guard.mark_obsolete();
        drop(guard);

        assert!(path.exists());
        drop(reader);
        assert!(!path.exists());
        assert_eq!(cell.lifecycle_of(1), Some(SnapshotLifecycle::Collectible));
    }
}
