//! Error and Result types for Burrow storage operations.

use crate::key::PartitionKey;
use std::io;
use thiserror::Error;

/// A convenience `Result` type for Burrow operations.
pub type Result<T> = std::result::Result<T, BurrowError>;

/// The error type for storage engine operations.
#[derive(Debug, Error)]
pub enum BurrowError {
    /// A time range whose end lies before its start.
    #[error("Invalid range: until {until} is before from {from}")]
    InvalidRange {
        /// Inclusive start of the requested range.
        from: i64,
        /// Exclusive end of the requested range.
        until: i64,
    },

    /// A malformed argument that is not a time range.
    #[error("Validation error: {0}")]
    Validation(String),

    /// A codec input exceeded the declared maximum value.
    #[error("Value out of range: {value} exceeds max {max}")]
    ValueOutOfRange {
        /// Rejected value.
        value: u64,
        /// Declared maximum value of the encoder.
        max: u64,
    },

    /// A replica reported an offset lower than one it reported before.
    #[error("Offset regression for replica {replica}: current {current}, attempted {attempted}")]
    OffsetRegression {
        /// Replica that reported the offset.
        replica: String,
        /// Offset currently recorded for the replica.
        current: u64,
        /// Rejected lower offset.
        attempted: u64,
    },

    /// The placement policy could not name any replica for a partition.
    #[error("No replicas available for partition {key}")]
    NoReplicasAvailable {
        /// Partition that could not be placed.
        key: PartitionKey,
    },

    /// A compaction run failed; the partition is retried later.
    #[error("Compaction failed: {0}")]
    CompactionFailed(String),

    /// A collaborator hook that has no implementation.
    #[error("Not yet implemented: {0}")]
    NotYetImplemented(&'static str),

    /// Requested partition is not known to this node.
    #[error("Partition not found: {0}")]
    PartitionNotFound(PartitionKey),

    /// Invalid magic bytes in a file header.
    #[error("Invalid magic bytes: expected {expected:?}, got {actual:?}")]
    InvalidMagic {
        /// Magic bytes the reader expected.
        expected: [u8; 4],
        /// Magic bytes found in the file.
        actual: [u8; 4],
    },

    /// Unsupported on-disk format version.
    #[error("Unsupported version: {0}")]
    UnsupportedVersion(u16),

    /// Stored checksum does not match the computed one.
    #[error("Checksum mismatch: expected {expected}, got {actual}")]
    ChecksumMismatch {
        /// Expected CRC32 checksum.
        expected: u32,
        /// Actual computed CRC32 checksum.
        actual: u32,
    },

    /// Structurally invalid on-disk data.
    #[error("Corrupted data: {0}")]
    Corrupted(String),

    /// The background worker has been stopped.
    #[error("Compaction worker is stopped")]
    WorkerStopped,

    /// Underlying I/O error.
    #[error("I/O error: {0}")]
    IoError(#[from] io::Error),
}
