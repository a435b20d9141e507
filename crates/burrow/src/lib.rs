//! Burrow - Alopex partitioned table storage engine
//!
//! This crate stores table records in partitions keyed by stream and time
//! window, replicates them under a pluggable placement policy, and compacts
//! committed segments into columnar chunks in the background.
//!
//! # Components
//!
//! - [`TimeWindowPartitioner`]: maps `(stream key, timestamp)` to a partition
//! - [`PartitionWriter`]: deduplicating staging, commit and snapshot
//!   publication for one partition
//! - [`PartitionReader`]: scans over an immutable [`PartitionSnapshot`]
//! - [`ReplicationScheme`] / [`ReplicationState`]: replica placement and
//!   per-replica progress
//! - [`CompactionWorker`]: debounced background compaction bounded by the
//!   replication horizon
//! - [`codec`]: bit-packing, PFOR and run-length page encodings
//! - [`StorageEngine`]: the per-node entry point tying these together
//!
//! # Example
//!
//! ```rust,ignore
//! use alopex_burrow::{
//!     EngineConfig, Hash160, RecordRef, StandaloneReplicationScheme, StorageEngine,
//! };
//! use std::sync::Arc;
//!
//! let scheme = Arc::new(StandaloneReplicationScheme);
//! let engine = StorageEngine::open(EngineConfig::new(dir), scheme)?;
//! engine.start()?;
//!
//! // Stage records in the partition of stream "eu-west" at `now_ns`
//! let record = RecordRef::new(Hash160::digest(b"order-17"), 1, payload);
//! engine.insert("orders", b"eu-west", now_ns, vec![record])?;
//!
//! // Make them durable and visible to new readers
//! let key = engine.partitioner().key_for(b"eu-west", now_ns);
//! engine.commit("orders", &key)?;
//! ```

#![deny(missing_docs)]

pub mod arena;
pub mod codec;
pub mod compaction;
pub mod config;
pub mod engine;
pub mod error;
pub mod index;
pub mod key;
pub mod metrics;
pub mod partition;
pub mod partitioner;
pub mod reader;
pub mod record;
pub mod replication;
pub mod snapshot;
pub mod storage;
pub mod writer;

pub use compaction::{CompactionOutcome, CompactionWorker, Compactor};
pub use config::{CompactionConfig, EngineConfig, SyncMode};
pub use engine::StorageEngine;
pub use error::{BurrowError, Result};
pub use index::{DerivedDataset, IndexCommit, IndexMaintainer, IndexUpdate, RecordIdBloomIndex};
pub use key::{Hash160, PartitionKey, RecordId};
pub use metrics::{EngineMetrics, MetricsSnapshot};
pub use partition::{Partition, PartitionMap, PartitionSource};
pub use partitioner::{
    partition_key_for, partition_keys_for, TimeWindow, TimeWindowPartitioner, Timestamp,
};
pub use reader::PartitionReader;
pub use record::{CommittedRecord, RecordRef};
pub use replication::{
    DistributedReplicationScheme, HashRingPlacement, MembershipView, PlacementStrategy, ReplicaId,
    ReplicaRef, ReplicationScheme, ReplicationState, StandaloneReplicationScheme,
    StaticMembership,
};
pub use snapshot::{PartitionSnapshot, SnapshotLifecycle};
pub use writer::PartitionWriter;
