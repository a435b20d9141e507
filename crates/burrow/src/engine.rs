//! StorageEngine - the per-node entry point.
//!
//! The engine routes inserts to partitions through the time-window
//! partitioner, consults the replication scheme before storing anything
//! locally, and requests background compaction after each commit. It owns
//! the node's metrics, partition map, derived index maintainer and
//! compaction worker; nothing is shared through globals.
//!
//! # Example
//!
//! ```rust,ignore
//! use alopex_burrow::{
//!     EngineConfig, Hash160, RecordRef, StandaloneReplicationScheme, StorageEngine,
//! };
//! use std::sync::Arc;
//!
//! let config = EngineConfig::new("/var/lib/burrow");
//! let engine = StorageEngine::open(config, Arc::new(StandaloneReplicationScheme))?;
//! engine.start()?;
//! let record = RecordRef::new(Hash160::digest(b"order-17"), 1, payload);
//! engine.insert("orders", b"eu-west", now_ns, vec![record])?;
//! let key = engine.partitioner().key_for(b"eu-west", now_ns);
//! engine.commit("orders", &key)?;
//! engine.reader(&key)?.fetch_records(|r| println!("{}", r.offset))?;
//! ```

use crate::compaction::{CompactionWorker, Compactor};
use crate::config::EngineConfig;
use crate::error::{BurrowError, Result};
use crate::index::{IndexMaintainer, RecordIdBloomIndex};
use crate::key::{PartitionKey, RecordId};
use crate::metrics::{EngineMetrics, MetricsSnapshot};
use crate::partition::{Partition, PartitionMap};
use crate::partitioner::{TimeWindowPartitioner, Timestamp};
use crate::reader::PartitionReader;
use crate::record::RecordRef;
use crate::replication::{ReplicaId, ReplicationScheme};
use crate::snapshot::PartitionSnapshot;
use crate::storage::layout::validate_table_name;
use crate::storage::PartitionLayout;
use std::fs;
use std::sync::Arc;
use tracing::{debug, info};

/// Storage engine of one node.
pub struct StorageEngine {
    config: EngineConfig,
    partitioner: TimeWindowPartitioner,
    scheme: Arc<dyn ReplicationScheme>,
    metrics: Arc<EngineMetrics>,
    partitions: Arc<PartitionMap>,
    indexes: Arc<IndexMaintainer>,
    bloom: Arc<RecordIdBloomIndex>,
    worker: CompactionWorker,
}

impl std::fmt::Debug for StorageEngine {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("StorageEngine")
            .field("config", &self.config)
            .field("partitions", &self.partitions.len())
            .field("worker", &self.worker)
            .finish_non_exhaustive()
    }
}

impl StorageEngine {
    /// Opens the engine over `config.data_dir`, reopening every stored
    /// partition. The compaction worker is not started.
    pub fn open(config: EngineConfig, scheme: Arc<dyn ReplicationScheme>) -> Result<Self> {
        config.validate()?;
        let partitioner = TimeWindowPartitioner::new(config.partition_window)?;
        fs::create_dir_all(&config.data_dir)?;

        let metrics = Arc::new(EngineMetrics::new());
        let partitions = Arc::new(PartitionMap::new(
            PartitionLayout::new(&config.data_dir),
            config.sync_mode,
            Arc::clone(&metrics),
        ));
        let mut tables = 0;
        for entry in fs::read_dir(&config.data_dir)? {
            let entry = entry?;
            if !entry.file_type()?.is_dir() {
                continue;
            }
            let Some(table) = entry.file_name().to_str().map(str::to_string) else {
                continue;
            };
            if validate_table_name(&table).is_err() {
                debug!("Ignoring directory {} in data dir", table);
                continue;
            }
            partitions.open_table(&table)?;
            tables += 1;
        }

        let indexes = Arc::new(IndexMaintainer::new());
        let bloom = Arc::new(RecordIdBloomIndex::new(config.bloom_expected_items));
        indexes.register(bloom.clone())?;

        let compactor = Compactor::new(
            Arc::clone(&scheme),
            Arc::clone(&indexes),
            Arc::clone(&metrics),
            config.compaction.min_segments,
            config.sync_mode,
        );
        let worker = CompactionWorker::new(
            partitions.clone(),
            compactor,
            config.compaction.clone(),
            Arc::clone(&metrics),
        );

        info!(
            data_dir = %config.data_dir.display(),
            tables,
            partitions = partitions.len(),
            "Opened storage engine"
        );
        Ok(Self {
            config,
            partitioner,
            scheme,
            metrics,
            partitions,
            indexes,
            bloom,
            worker,
        })
    }

    /// Engine configuration.
    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    /// Partitioner routing inserts.
    pub fn partitioner(&self) -> &TimeWindowPartitioner {
        &self.partitioner
    }

    /// Replication scheme of this node.
    pub fn scheme(&self) -> &Arc<dyn ReplicationScheme> {
        &self.scheme
    }

    /// Open partitions.
    pub fn partitions(&self) -> &PartitionMap {
        &self.partitions
    }

    /// Derived index maintainer; register additional datasets here.
    pub fn indexes(&self) -> &IndexMaintainer {
        &self.indexes
    }

    /// Compaction worker.
    pub fn worker(&self) -> &CompactionWorker {
        &self.worker
    }

    /// Starts background compaction.
    pub fn start(&self) -> Result<()> {
        self.worker.start()
    }

    /// Stops background compaction, waiting for in-flight runs.
    pub fn stop(&self) {
        self.worker.stop();
    }

    /// Point-in-time copy of the engine counters.
    pub fn metrics(&self) -> MetricsSnapshot {
        self.metrics.snapshot()
    }

    /// Stages `records` in the partition of `stream_key` at `time`.
    ///
    /// Returns `Ok(false)` without storing anything when this node keeps no
    /// replica of the partition, and otherwise whether the staged set
    /// changed.
    pub fn insert<I>(
        &self,
        table: &str,
        stream_key: &[u8],
        time: Timestamp,
        records: I,
    ) -> Result<bool>
    where
        I: IntoIterator<Item = RecordRef>,
    {
        let key = self.partitioner.key_for(stream_key, time);
        if !self.scheme.keep_local_replica_for(&key)? {
            let skipped = records.into_iter().count() as u64;
            self.metrics.record_skipped(skipped);
            debug!(partition = %key, table, skipped, "Not a local replica; skipping insert");
            return Ok(false);
        }
        let partition = self.partitions.find_or_create(table, &key)?;
        Ok(partition.insert_records(records))
    }

    /// Commits the staged records of a partition and requests its
    /// compaction.
    pub fn commit(&self, table: &str, key: &PartitionKey) -> Result<PartitionSnapshot> {
        let partition = self.partition(key)?;
        if partition.table() != table {
            return Err(BurrowError::Validation(format!(
                "partition {} belongs to table {}, not {}",
                key,
                partition.table(),
                table
            )));
        }
        let before = partition.snapshot().version();
        let snapshot = partition.commit()?;
        if snapshot.version() != before {
            self.schedule_compaction(key);
        }
        Ok(snapshot)
    }

    /// Returns the open partition for `key`.
    pub fn partition(&self, key: &PartitionKey) -> Result<Arc<Partition>> {
        self.partitions
            .find(key)
            .ok_or(BurrowError::PartitionNotFound(*key))
    }

    /// Returns a reader over the published snapshot of `key`.
    pub fn reader(&self, key: &PartitionKey) -> Result<PartitionReader> {
        Ok(self.partition(key)?.reader())
    }

    /// Partition keys of `stream_key` covering `[from, until)`.
    pub fn partition_keys(
        &self,
        stream_key: &[u8],
        from: Timestamp,
        until: Timestamp,
    ) -> Result<Vec<PartitionKey>> {
        self.partitioner.keys_for(stream_key, from, until)
    }

    /// Records a replica's acknowledged offset for `key`.
    ///
    /// An advanced offset may unblock compaction, so one is requested.
    pub fn record_replicated_offset(
        &self,
        key: &PartitionKey,
        replica: &ReplicaId,
        offset: u64,
    ) -> Result<bool> {
        let advanced = self.partition(key)?.record_replicated_offset(replica, offset)?;
        if advanced {
            self.schedule_compaction(key);
        }
        Ok(advanced)
    }

    /// Returns false only if `id` is definitely not stored in `key`.
    pub fn might_contain(&self, key: &PartitionKey, id: &RecordId) -> Result<bool> {
        let snapshot = self.partition(key)?.snapshot();
        self.bloom.might_contain(&snapshot, id)
    }

    /// Requests a compaction of `key` after the debounce window.
    pub fn request_compaction(&self, key: &PartitionKey) -> Result<bool> {
        self.partition(key)?;
        self.worker.request(*key)
    }

    fn schedule_compaction(&self, key: &PartitionKey) {
        if let Err(err) = self.worker.request(*key) {
            debug!(partition = %key, "Compaction not requested: {}", err);
        }
    }
}
