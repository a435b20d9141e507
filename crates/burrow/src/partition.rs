//! Partitions and the per-node partition map.

use crate::error::{BurrowError, Result};
use crate::key::PartitionKey;
use crate::metrics::EngineMetrics;
use crate::reader::PartitionReader;
use crate::record::RecordRef;
use crate::replication::{ReplicaId, ReplicationScheme, ReplicationState};
use crate::snapshot::PartitionSnapshot;
use crate::storage::layout::{validate_table_name, REPLICATION_FILE};
use crate::storage::{write_atomic, PartitionLayout, SyncMode};
use crate::writer::PartitionWriter;
use parking_lot::{Mutex, RwLock};
use std::collections::HashMap;
use std::fs;
use std::io::Write;
use std::sync::Arc;
use tracing::debug;

/// One partition of a table: its writer and its replication progress.
#[derive(Debug)]
pub struct Partition {
    writer: PartitionWriter,
    replication: Mutex<ReplicationState>,
}

impl Partition {
    /// Opens a partition, creating it on first use.
    pub fn open(
        key: PartitionKey,
        table: &str,
        layout: &PartitionLayout,
        sync_mode: SyncMode,
        metrics: Arc<EngineMetrics>,
    ) -> Result<Self> {
        validate_table_name(table)?;
        let writer = PartitionWriter::open(key, table, layout, sync_mode, metrics)?;
        let replication = match fs::read(writer.base_path().join(REPLICATION_FILE)) {
            Ok(data) => ReplicationState::decode(&data)?,
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => ReplicationState::new(),
            Err(err) => return Err(err.into()),
        };
        Ok(Self {
            writer,
            replication: Mutex::new(replication),
        })
    }

    /// Partition key.
    pub fn key(&self) -> &PartitionKey {
        self.writer.key()
    }

    /// Owning table.
    pub fn table(&self) -> &str {
        self.writer.table()
    }

    /// The partition's writer.
    pub fn writer(&self) -> &PartitionWriter {
        &self.writer
    }

    /// Stages one record. Returns true if the staged set changed.
    pub fn insert_record(&self, record: RecordRef) -> bool {
        self.writer.insert_record(record)
    }

    /// Stages a batch. Returns true if any record changed the staged set.
    pub fn insert_records<I>(&self, records: I) -> bool
    where
        I: IntoIterator<Item = RecordRef>,
    {
        self.writer.insert_records(records)
    }

    /// Commits the staged records.
    pub fn commit(&self) -> Result<PartitionSnapshot> {
        self.writer.commit()
    }

    /// Returns the published snapshot.
    pub fn snapshot(&self) -> PartitionSnapshot {
        self.writer.snapshot()
    }

    /// Returns a reader over the published snapshot.
    pub fn reader(&self) -> PartitionReader {
        PartitionReader::new(self.snapshot())
    }

    /// Offset acknowledged by `replica`; 0 if it never reported one.
    pub fn replicated_offset_for(&self, replica: &ReplicaId) -> u64 {
        self.replication.lock().replicated_offset_for(replica)
    }

    /// Copy of the replication table.
    pub fn replication_state(&self) -> ReplicationState {
        self.replication.lock().clone()
    }

    /// Records and persists a replica's acknowledged offset.
    ///
    /// Fails with [`BurrowError::OffsetRegression`] for an offset below the
    /// recorded one, and with [`BurrowError::Validation`] for an offset past
    /// the committed records. The table is unchanged on failure.
    pub fn record_replicated_offset(&self, replica: &ReplicaId, offset: u64) -> Result<bool> {
        let nrecs = self.snapshot().nrecs();
        if offset > nrecs {
            return Err(BurrowError::Validation(format!(
                "replica {} reported offset {} past committed {}",
                replica, offset, nrecs
            )));
        }

        let mut state = self.replication.lock();
        let mut next = state.clone();
        if !next.record_offset(replica, offset)? {
            return Ok(false);
        }
        let data = next.encode();
        write_atomic(
            &self.writer.base_path().join(REPLICATION_FILE),
            self.writer.sync_mode(),
            |writer| {
                writer.write_all(&data)?;
                Ok(())
            },
        )?;
        *state = next;
        debug!(
            partition = %self.key(),
            replica = %replica,
            offset,
            "Recorded replicated offset"
        );
        Ok(true)
    }

    /// Minimum offset acknowledged by the remote replicas of this partition.
    ///
    /// Returns `None` when the scheme names no remote replica.
    pub fn replication_horizon(&self, scheme: &dyn ReplicationScheme) -> Result<Option<u64>> {
        let replicas = scheme.replicas_for(self.key())?;
        Ok(self.replication.lock().replication_horizon(&replicas))
    }

    /// Offset below which `snapshot` may be compacted.
    pub fn compaction_horizon(
        &self,
        scheme: &dyn ReplicationScheme,
        snapshot: &PartitionSnapshot,
    ) -> Result<u64> {
        let nrecs = snapshot.nrecs();
        Ok(self
            .replication_horizon(scheme)?
            .map_or(nrecs, |horizon| horizon.min(nrecs)))
    }

    /// Remote replicas that have not received every committed record.
    pub fn lagging_replicas(&self, scheme: &dyn ReplicationScheme) -> Result<Vec<ReplicaId>> {
        let replicas = scheme.replicas_for(self.key())?;
        let head = self.snapshot().nrecs();
        Ok(self.replication.lock().lagging_replicas(&replicas, head))
    }
}

/// Resolves partitions by key.
pub trait PartitionSource: Send + Sync {
    /// Returns the partition for `key` if this node has it open.
    fn partition(&self, key: &PartitionKey) -> Option<Arc<Partition>>;
}

/// All partitions open on this node.
#[derive(Debug)]
pub struct PartitionMap {
    layout: PartitionLayout,
    sync_mode: SyncMode,
    metrics: Arc<EngineMetrics>,
    partitions: RwLock<HashMap<PartitionKey, Arc<Partition>>>,
}

impl PartitionMap {
    /// Creates an empty map over `layout`.
    pub fn new(layout: PartitionLayout, sync_mode: SyncMode, metrics: Arc<EngineMetrics>) -> Self {
        Self {
            layout,
            sync_mode,
            metrics,
            partitions: RwLock::new(HashMap::new()),
        }
    }

    /// Directory layout of the map.
    pub fn layout(&self) -> &PartitionLayout {
        &self.layout
    }

    /// Returns the partition for `key`, opening or creating it on first use.
    pub fn find_or_create(&self, table: &str, key: &PartitionKey) -> Result<Arc<Partition>> {
        if let Some(partition) = self.find(key) {
            return self.check_table(partition, table);
        }

        let mut partitions = self.partitions.write();
        if let Some(partition) = partitions.get(key) {
            return self.check_table(Arc::clone(partition), table);
        }
        let partition = Arc::new(Partition::open(
            *key,
            table,
            &self.layout,
            self.sync_mode,
            Arc::clone(&self.metrics),
        )?);
        partitions.insert(*key, Arc::clone(&partition));
        debug!(partition = %key, table, "Opened partition");
        Ok(partition)
    }

    /// Returns the partition for `key` if it is open.
    pub fn find(&self, key: &PartitionKey) -> Option<Arc<Partition>> {
        self.partitions.read().get(key).cloned()
    }

    /// Opens every partition stored for `table`. Returns how many were opened.
    pub fn open_table(&self, table: &str) -> Result<usize> {
        validate_table_name(table)?;
        let keys = self.layout.list_partitions(table)?;
        for key in &keys {
            self.find_or_create(table, key)?;
        }
        Ok(keys.len())
    }

    /// Keys of the open partitions.
    pub fn keys(&self) -> Vec<PartitionKey> {
        let mut keys: Vec<PartitionKey> = self.partitions.read().keys().copied().collect();
        keys.sort();
        keys
    }

    /// Number of open partitions.
    pub fn len(&self) -> usize {
        self.partitions.read().len()
    }

    /// Returns true if no partition is open.
    pub fn is_empty(&self) -> bool {
        self.partitions.read().is_empty()
    }

    fn check_table(&self, partition: Arc<Partition>, table: &str) -> Result<Arc<Partition>> {
        if partition.table() != table {
            return Err(BurrowError::Validation(format!(
                "partition {} belongs to table {}, not {}",
                partition.key(),
                partition.table(),
                table
            )));
        }
        Ok(partition)
    }
}

impl PartitionSource for PartitionMap {
    fn partition(&self, key: &PartitionKey) -> Option<Arc<Partition>> {
        self.find(key)
    }
}
