//! Derived datasets maintained alongside partition data.
//!
//! A [`DerivedDataset`] folds newly committed records into an opaque state
//! blob. The [`IndexMaintainer`] feeds each registered dataset the records
//! committed since its last update and publishes the resulting state into
//! the partition descriptor, so index state and data advance under the same
//! snapshot versioning.
//!
//! [`RecordIdBloomIndex`] keeps a Bloom filter of record ids in an index
//! file per update.

use crate::error::{BurrowError, Result};
use crate::key::RecordId;
use crate::reader::PartitionReader;
use crate::record::CommittedRecord;
use crate::snapshot::{IndexEntry, PartitionSnapshot};
use crate::storage::layout::DataFileKind;
use crate::storage::{write_atomic, ByteReader, SyncMode};
use crate::writer::PartitionWriter;
use parking_lot::RwLock;
use std::fs;
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing::{debug, warn};

/// Input of one dataset update.
#[derive(Debug)]
pub struct IndexUpdate<'a> {
    /// Records with offsets in `[last_offset, current_offset)`.
    pub records: &'a [CommittedRecord],
    /// Offset the previous state was built up to.
    pub last_offset: u64,
    /// Offset the new state covers.
    pub current_offset: u64,
    /// Previous state, if the dataset was updated before.
    pub last_state: Option<&'a [u8]>,
    /// Partition directory, for datasets keeping files.
    pub base_path: &'a Path,
    /// Sync mode for files the dataset writes.
    pub sync_mode: SyncMode,
}

/// Result of a dataset update.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct IndexCommit {
    /// State to record in the descriptor.
    pub new_state: Vec<u8>,
    /// Files to delete once the new state is published.
    pub delete_after_commit: Vec<PathBuf>,
}

/// Index derived from the committed records of a partition.
///
/// Files a dataset keeps in the partition directory are named with
/// [`DataFileKind::Index`] and recorded as its state; any other index file
/// is deleted when the partition is reopened.
pub trait DerivedDataset: Send + Sync {
    /// Unique name; used as the descriptor key and in index file names.
    fn name(&self) -> &str;

    /// Folds `update.records` into the previous state.
    fn update(&self, update: IndexUpdate<'_>) -> Result<IndexCommit>;

    /// Rebuilds the state from scratch for `snapshot`.
    ///
    /// Called when the recorded state is ahead of the snapshot.
    fn rebuild(&self, _snapshot: &PartitionSnapshot, _sync_mode: SyncMode) -> Result<IndexCommit> {
        Err(BurrowError::NotYetImplemented("derived dataset rebuild"))
    }
}

/// Drives the registered datasets of every partition.
#[derive(Default)]
pub struct IndexMaintainer {
    datasets: RwLock<Vec<Arc<dyn DerivedDataset>>>,
}

impl std::fmt::Debug for IndexMaintainer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("IndexMaintainer")
            .field("datasets", &self.names())
            .finish()
    }
}

impl IndexMaintainer {
    /// Creates a maintainer with no datasets.
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers a dataset. Names must be unique and usable in file names.
    pub fn register(&self, dataset: Arc<dyn DerivedDataset>) -> Result<()> {
        let name = dataset.name();
        if name.is_empty()
            || !name
                .chars()
                .all(|c| c.is_ascii_alphanumeric() || c == '_' || c == '-')
        {
            return Err(BurrowError::Validation(format!(
                "invalid derived dataset name: {:?}",
                name
            )));
        }
        let mut datasets = self.datasets.write();
        if datasets.iter().any(|d| d.name() == name) {
            return Err(BurrowError::Validation(format!(
                "derived dataset {} is already registered",
                name
            )));
        }
        datasets.push(dataset);
        Ok(())
    }

    /// Names of the registered datasets.
    pub fn names(&self) -> Vec<String> {
        self.datasets
            .read()
            .iter()
            .map(|d| d.name().to_string())
            .collect()
    }

    /// Brings every dataset up to the published snapshot of `writer`.
    ///
    /// Returns the number of datasets whose state was published.
    pub fn maintain(&self, writer: &PartitionWriter) -> Result<usize> {
        let datasets: Vec<Arc<dyn DerivedDataset>> = self.datasets.read().clone();
        let mut updated = 0;
        for dataset in datasets {
            if self.maintain_one(dataset.as_ref(), writer)? {
                updated += 1;
            }
        }
        Ok(updated)
    }

    fn maintain_one(&self, dataset: &dyn DerivedDataset, writer: &PartitionWriter) -> Result<bool> {
        let name = dataset.name();
        let snapshot = writer.snapshot();
        let nrecs = snapshot.nrecs();
        let entry = snapshot.index_entry(name).cloned();

        let commit = match &entry {
            Some(entry) if entry.offset == nrecs => return Ok(false),
            None if nrecs == 0 => return Ok(false),
            Some(entry) if entry.offset > nrecs => {
                match dataset.rebuild(&snapshot, writer.sync_mode()) {
                    Ok(commit) => commit,
                    Err(BurrowError::NotYetImplemented(what)) => {
                        warn!(
                            partition = %snapshot.key(),
                            index = name,
                            offset = entry.offset,
                            nrecs,
                            "Index is ahead of its partition and cannot be rebuilt: {}",
                            what
                        );
                        return Ok(false);
                    }
                    Err(err) => return Err(err),
                }
            }
            _ => {
                let last_offset = entry.as_ref().map_or(0, |e| e.offset);
                let mut records = Vec::new();
                PartitionReader::new(snapshot.clone()).fetch_range(last_offset, nrecs, |r| {
                    records.push(r.clone())
                })?;
                dataset.update(IndexUpdate {
                    records: &records,
                    last_offset,
                    current_offset: nrecs,
                    last_state: entry.as_ref().map(|e| e.state.as_slice()),
                    base_path: snapshot.base_path(),
                    sync_mode: writer.sync_mode(),
                })?
            }
        };

        writer.publish_index_state(
            name,
            IndexEntry {
                offset: nrecs,
                state: commit.new_state,
            },
        )?;
        for path in &commit.delete_after_commit {
            match fs::remove_file(path) {
                Ok(()) => debug!("Removed stale index file: {}", path.display()),
                Err(err) if err.kind() == std::io::ErrorKind::NotFound => {}
                Err(err) => warn!("Failed to remove index file {}: {:?}", path.display(), err),
            }
        }
        debug!(partition = %snapshot.key(), index = name, offset = nrecs, "Updated index");
        Ok(true)
    }
}

/// Magic bytes for Bloom filter index files: "BBLM"
pub const BLOOM_MAGIC: [u8; 4] = *b"BBLM";

/// Number of hash functions of the record id filter.
const BLOOM_HASH_COUNT: u8 = 3;

/// Bloom filter over record ids.
///
/// `h_i(x) = xxhash64(x, seed=i) % size_bits` for `i` in `0..hash_count`,
/// with about 10 bits per expected item.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BloomFilter {
    bits: Vec<u64>,
    hash_count: u8,
}

impl BloomFilter {
    /// Creates an empty filter sized for `expected_items`.
    pub fn new(expected_items: usize) -> Self {
        // 10 bits per item gives ~1% false positives with k=3
        let num_bits = expected_items.saturating_mul(10).max(64);
        Self {
            bits: vec![0u64; num_bits.div_ceil(64)],
            hash_count: BLOOM_HASH_COUNT,
        }
    }

    /// Adds a record id.
    pub fn insert(&mut self, id: &RecordId) {
        let num_bits = self.bits.len() * 64;
        for seed in 0..self.hash_count {
            let bit = bit_index(id, seed, num_bits);
            self.bits[bit / 64] |= 1u64 << (bit % 64);
        }
    }

    /// Returns false if `id` was definitely never inserted.
    pub fn maybe_contains(&self, id: &RecordId) -> bool {
        let num_bits = self.bits.len() * 64;
        (0..self.hash_count).all(|seed| {
            let bit = bit_index(id, seed, num_bits);
            self.bits[bit / 64] & (1u64 << (bit % 64)) != 0
        })
    }

    /// Encodes the filter with magic and a trailing CRC32.
    pub fn encode(&self) -> Vec<u8> {
        let mut buf = Vec::with_capacity(12 + self.bits.len() * 8 + 4);
        buf.extend_from_slice(&BLOOM_MAGIC);
        buf.extend_from_slice(&(self.bits.len() as u32).to_le_bytes());
        // hash count + 3 bytes reserved
        buf.extend_from_slice(&[self.hash_count, 0, 0, 0]);
        for word in &self.bits {
            buf.extend_from_slice(&word.to_le_bytes());
        }
        let crc = crc32fast::hash(&buf);
        buf.extend_from_slice(&crc.to_le_bytes());
        buf
    }

    /// Decodes and verifies a filter.
    pub fn decode(data: &[u8]) -> Result<Self> {
        if data.len() < 4 {
            return Err(BurrowError::Corrupted(
                "bloom filter shorter than its checksum".to_string(),
            ));
        }
        let (body, crc) = data.split_at(data.len() - 4);
        let expected = ByteReader::new(crc).u32()?;
        let actual = crc32fast::hash(body);
        if expected != actual {
            return Err(BurrowError::ChecksumMismatch { expected, actual });
        }

        let mut reader = ByteReader::new(body);
        let magic = reader.magic()?;
        if magic != BLOOM_MAGIC {
            return Err(BurrowError::InvalidMagic {
                expected: BLOOM_MAGIC,
                actual: magic,
            });
        }
        let num_words = reader.u32()? as usize;
        let hash_count = reader.bytes(4)?[0];
        if num_words == 0 || hash_count == 0 {
            return Err(BurrowError::Corrupted("empty bloom filter".to_string()));
        }
        let mut bits = Vec::with_capacity(num_words);
        for _ in 0..num_words {
            bits.push(reader.u64()?);
        }
        if !reader.is_empty() {
            return Err(BurrowError::Corrupted(
                "trailing bytes in bloom filter".to_string(),
            ));
        }
        Ok(Self { bits, hash_count })
    }
}

/// Name under which [`RecordIdBloomIndex`] registers by default.
pub const RECORD_ID_BLOOM: &str = "record_id_bloom";

/// Bloom filter of the record ids committed to a partition.
///
/// Each update writes a new index file named for the covered offset; the
/// descriptor state holds that file name. The previous file is deleted once
/// the new state is published.
#[derive(Debug, Clone)]
pub struct RecordIdBloomIndex {
    name: String,
    expected_items: usize,
}

impl RecordIdBloomIndex {
    /// Creates the index with filters sized for `expected_items`.
    pub fn new(expected_items: usize) -> Self {
        Self {
            name: RECORD_ID_BLOOM.to_string(),
            expected_items,
        }
    }

    /// Loads the filter published in `snapshot`, if any.
    pub fn load(&self, snapshot: &PartitionSnapshot) -> Result<Option<BloomFilter>> {
        let Some(entry) = snapshot.index_entry(&self.name) else {
            return Ok(None);
        };
        let path = snapshot.base_path().join(state_file_name(&entry.state)?);
        match fs::read(&path) {
            Ok(data) => BloomFilter::decode(&data).map(Some),
            // replaced by a newer update since the snapshot was taken
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => Ok(None),
            Err(err) => Err(err.into()),
        }
    }

    /// Returns false only if `id` is definitely not among the records of
    /// `snapshot`.
    pub fn might_contain(&self, snapshot: &PartitionSnapshot, id: &RecordId) -> Result<bool> {
        let covered = snapshot
            .index_entry(&self.name)
            .is_some_and(|entry| entry.offset == snapshot.nrecs());
        if !covered {
            return Ok(true);
        }
        Ok(self
            .load(snapshot)?
            .map_or(true, |filter| filter.maybe_contains(id)))
    }
}

impl DerivedDataset for RecordIdBloomIndex {
    fn name(&self) -> &str {
        &self.name
    }

    fn update(&self, update: IndexUpdate<'_>) -> Result<IndexCommit> {
        let previous = match update.last_state {
            Some(state) => Some(update.base_path.join(state_file_name(state)?)),
            None => None,
        };
        let mut filter = match &previous {
            Some(path) => BloomFilter::decode(&fs::read(path)?)?,
            None => BloomFilter::new(self.expected_items),
        };
        for record in update.records {
            filter.insert(&record.record.record_id);
        }

        let file_name = DataFileKind::Index {
            name: self.name.clone(),
            offset: update.current_offset,
        }
        .file_name();
        let path = update.base_path.join(&file_name);
        let data = filter.encode();
        write_atomic(&path, update.sync_mode, |writer| {
            writer.write_all(&data)?;
            Ok(())
        })?;

        Ok(IndexCommit {
            new_state: file_name.into_bytes(),
            delete_after_commit: previous.into_iter().filter(|p| *p != path).collect(),
        })
    }

    fn rebuild(&self, snapshot: &PartitionSnapshot, sync_mode: SyncMode) -> Result<IndexCommit> {
        let mut records = Vec::new();
        PartitionReader::new(snapshot.clone())
            .fetch_range(0, snapshot.nrecs(), |r| records.push(r.clone()))?;
        let mut commit = self.update(IndexUpdate {
            records: &records,
            last_offset: 0,
            current_offset: snapshot.nrecs(),
            last_state: None,
            base_path: snapshot.base_path(),
            sync_mode,
        })?;
        if let Some(entry) = snapshot.index_entry(&self.name) {
            let stale = snapshot.base_path().join(state_file_name(&entry.state)?);
            commit.delete_after_commit.push(stale);
        }
        Ok(commit)
    }
}

fn bit_index(id: &RecordId, seed: u8, num_bits: usize) -> usize {
    (xxhash_rust::xxh64::xxh64(id.as_bytes(), u64::from(seed)) % num_bits as u64) as usize
}

fn state_file_name(state: &[u8]) -> Result<&str> {
    let name = std::str::from_utf8(state)
        .map_err(|_| BurrowError::Corrupted("index state is not a file name".to_string()))?;
    match DataFileKind::parse_file_name(name) {
        Some(DataFileKind::Index { .. }) => Ok(name),
        _ => Err(BurrowError::Corrupted(format!(
            "index state names no index file: {:?}",
            name
        ))),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::key::Hash160;
    use crate::metrics::EngineMetrics;
    use crate::record::RecordRef;
    use crate::storage::PartitionLayout;
    use tempfile::TempDir;

    fn open_writer(dir: &Path) -> PartitionWriter {
        PartitionWriter::open(
            Hash160::digest(b"partition"),
            "events",
            &PartitionLayout::new(dir),
            SyncMode::None,
            Arc::new(EngineMetrics::new()),
        )
        .unwrap()
    }

    fn commit_ids(writer: &PartitionWriter, ids: &[&str]) {
        for id in ids {
            writer.insert_record(RecordRef::new(Hash160::digest(id.as_bytes()), 1, "v"));
        }
        writer.commit().unwrap();
    }

    fn maintainer(expected_items: usize) -> (IndexMaintainer, Arc<RecordIdBloomIndex>) {
        let index = Arc::new(RecordIdBloomIndex::new(expected_items));
        let maintainer = IndexMaintainer::new();
        maintainer.register(index.clone()).unwrap();
        (maintainer, index)
    }

    #[test]
    fn test_bloom_filter() {
        let mut filter = BloomFilter::new(100);
        for i in 0..100 {
            filter.insert(&Hash160::digest(format!("in-{}", i).as_bytes()));
        }
        for i in 0..100 {
            assert!(filter.maybe_contains(&Hash160::digest(format!("in-{}", i).as_bytes())));
        }
        let false_positives = (0..1000)
            .filter(|i| filter.maybe_contains(&Hash160::digest(format!("out-{}", i).as_bytes())))
            .count();
        assert!(false_positives < 100, "false positives: {}", false_positives);

        let decoded = BloomFilter::decode(&filter.encode()).unwrap();
        assert_eq!(decoded, filter);
    }

    #[test]
    fn test_bloom_filter_rejects_corruption() {
        let mut data = BloomFilter::new(10).encode();
        data[14] ^= 0x01;
        assert!(matches!(
            BloomFilter::decode(&data),
            Err(BurrowError::ChecksumMismatch { .. })
        ));
    }

    #[test]
    fn test_register_rejects_duplicates_and_bad_names() {
        let (maintainer, _) = maintainer(10);
        assert!(maintainer
            .register(Arc::new(RecordIdBloomIndex::new(10)))
            .is_err());

        struct BadName;
        impl DerivedDataset for BadName {
            fn name(&self) -> &str {
                "bad/name"
            }
            fn update(&self, _update: IndexUpdate<'_>) -> Result<IndexCommit> {
                Ok(IndexCommit::default())
            }
        }
        assert!(maintainer.register(Arc::new(BadName)).is_err());
        assert_eq!(maintainer.names(), vec![RECORD_ID_BLOOM.to_string()]);
    }

    #[test]
    fn test_maintain_follows_commits() {
        let temp_dir = TempDir::new().unwrap();
        let writer = open_writer(temp_dir.path());
        let (maintainer, index) = maintainer(100);

        // nothing committed yet
        assert_eq!(maintainer.maintain(&writer).unwrap(), 0);

        commit_ids(&writer, &["a", "b"]);
        assert_eq!(maintainer.maintain(&writer).unwrap(), 1);
        let first_file = writer
            .base_path()
            .join(DataFileKind::Index { name: RECORD_ID_BLOOM.to_string(), offset: 2 }.file_name());
        assert!(first_file.exists());
        assert_eq!(maintainer.maintain(&writer).unwrap(), 0);

        commit_ids(&writer, &["c"]);
        let stale = writer.snapshot();
        assert!(index.might_contain(&stale, &Hash160::digest(b"zzz")).unwrap());

        assert_eq!(maintainer.maintain(&writer).unwrap(), 1);
        assert!(!first_file.exists());

        let snapshot = writer.snapshot();
        assert_eq!(snapshot.index_entry(RECORD_ID_BLOOM).unwrap().offset, 3);
        for id in ["a", "b", "c"] {
            assert!(index.might_contain(&snapshot, &Hash160::digest(id.as_bytes())).unwrap());
        }
        let filter = index.load(&snapshot).unwrap().unwrap();
        assert!(filter.maybe_contains(&Hash160::digest(b"c")));
    }

    #[test]
    fn test_index_ahead_of_partition_is_rebuilt() {
        let temp_dir = TempDir::new().unwrap();
        let writer = open_writer(temp_dir.path());
        commit_ids(&writer, &["a"]);
        writer
            .publish_index_state(
                RECORD_ID_BLOOM,
                IndexEntry {
                    offset: 50,
                    state: b"record_id_bloom_0000000000000032.idx".to_vec(),
                },
            )
            .unwrap();

        let (maintainer, index) = maintainer(10);
        assert_eq!(maintainer.maintain(&writer).unwrap(), 1);
        let snapshot = writer.snapshot();
        assert_eq!(snapshot.index_entry(RECORD_ID_BLOOM).unwrap().offset, 1);
        assert!(index.might_contain(&snapshot, &Hash160::digest(b"a")).unwrap());
    }

    #[test]
    fn test_rebuild_defaults_to_not_implemented() {
        struct Counter;
        impl DerivedDataset for Counter {
            fn name(&self) -> &str {
                "counter"
            }
            fn update(&self, update: IndexUpdate<'_>) -> Result<IndexCommit> {
                Ok(IndexCommit {
                    new_state: (update.records.len() as u64).to_le_bytes().to_vec(),
                    delete_after_commit: Vec::new(),
                })
            }
        }

        let temp_dir = TempDir::new().unwrap();
        let writer = open_writer(temp_dir.path());
        commit_ids(&writer, &["a"]);
        writer
            .publish_index_state("counter", IndexEntry { offset: 9, state: Vec::new() })
            .unwrap();

        let maintainer = IndexMaintainer::new();
        maintainer.register(Arc::new(Counter)).unwrap();
        assert_eq!(maintainer.maintain(&writer).unwrap(), 0);
        assert_eq!(writer.snapshot().index_entry("counter").unwrap().offset, 9);
        assert!(matches!(
            Counter.rebuild(&writer.snapshot(), SyncMode::None),
            Err(BurrowError::NotYetImplemented(_))
        ));
    }
}
