//! Per-partition replication progress.
//!
//! The table maps each replica to the highest partition offset it has
//! durably received. Offsets only move forward: a lower report is rejected,
//! since compaction trusts these values when reclaiming segments.

use super::scheme::{ReplicaId, ReplicaRef};
use crate::error::{BurrowError, Result};
use crate::storage::ByteReader;

/// Magic bytes for the replication state file: "BREP"
pub const REPLICATION_MAGIC: [u8; 4] = *b"BREP";

/// Current replication state format version.
pub const REPLICATION_VERSION: u16 = 1;

/// Replicated offsets of one partition.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ReplicationState {
    offsets: Vec<(ReplicaId, u64)>,
}

impl ReplicationState {
    /// Creates an empty table.
    pub fn new() -> Self {
        Self::default()
    }

    /// Offset acknowledged by `replica`; 0 if it never reported one.
    pub fn replicated_offset_for(&self, replica: &ReplicaId) -> u64 {
        self.offsets
            .iter()
            .find(|(id, _)| id == replica)
            .map_or(0, |&(_, offset)| offset)
    }

    /// Records that `replica` has received every record below `offset`.
    ///
    /// Reporting the current offset again is accepted. A lower offset fails
    /// with [`BurrowError::OffsetRegression`] and leaves the table unchanged.
    /// Returns true if the recorded offset advanced.
    pub fn record_offset(&mut self, replica: &ReplicaId, offset: u64) -> Result<bool> {
        match self.offsets.iter_mut().find(|(id, _)| id == replica) {
            Some((_, current)) if offset < *current => Err(BurrowError::OffsetRegression {
                replica: replica.to_string(),
                current: *current,
                attempted: offset,
            }),
            Some((_, current)) => {
                let advanced = offset > *current;
                *current = offset;
                Ok(advanced)
            }
            None => {
                self.offsets.push((replica.clone(), offset));
                Ok(offset > 0)
            }
        }
    }

    /// Minimum offset acknowledged by every replica in `required`.
    ///
    /// Returns `None` when no replica is required.
    pub fn replication_horizon(&self, required: &[ReplicaRef]) -> Option<u64> {
        required
            .iter()
            .map(|replica| self.replicated_offset_for(&replica.id))
            .min()
    }

    /// Required replicas whose offset is behind `head`.
    pub fn lagging_replicas(&self, required: &[ReplicaRef], head: u64) -> Vec<ReplicaId> {
        required
            .iter()
            .filter(|replica| self.replicated_offset_for(&replica.id) < head)
            .map(|replica| replica.id.clone())
            .collect()
    }

    /// Iterates over the recorded replicas and offsets.
    pub fn iter(&self) -> impl Iterator<Item = (&ReplicaId, u64)> {
        self.offsets.iter().map(|(id, offset)| (id, *offset))
    }

    /// Number of replicas with a recorded offset.
    pub fn len(&self) -> usize {
        self.offsets.len()
    }

    /// Returns true if no replica has reported.
    pub fn is_empty(&self) -> bool {
        self.offsets.is_empty()
    }

    /// Encodes the table with a trailing CRC32.
    pub fn encode(&self) -> Vec<u8> {
        let mut buf = Vec::new();
        buf.extend_from_slice(&REPLICATION_MAGIC);
        buf.extend_from_slice(&REPLICATION_VERSION.to_le_bytes());
        buf.extend_from_slice(&(self.offsets.len() as u32).to_le_bytes());
        for (id, offset) in &self.offsets {
            let id = id.as_str().as_bytes();
            buf.extend_from_slice(&(id.len() as u16).to_le_bytes());
            buf.extend_from_slice(id);
            buf.extend_from_slice(&offset.to_le_bytes());
        }
        let crc = crc32fast::hash(&buf);
        buf.extend_from_slice(&crc.to_le_bytes());
        buf
    }

    /// Decodes and verifies a table.
    pub fn decode(data: &[u8]) -> Result<Self> {
        if data.len() < 4 {
            return Err(BurrowError::Corrupted(
                "replication state shorter than its checksum".to_string(),
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
        if magic != REPLICATION_MAGIC {
            return Err(BurrowError::InvalidMagic {
                expected: REPLICATION_MAGIC,
                actual: magic,
            });
        }
        let version = reader.u16()?;
        if version > REPLICATION_VERSION {
            return Err(BurrowError::UnsupportedVersion(version));
        }
        let count = reader.u32()?;
        let mut offsets = Vec::new();
        for _ in 0..count {
            let len = reader.u16()? as usize;
            let id = std::str::from_utf8(reader.bytes(len)?)
                .map_err(|_| BurrowError::Corrupted("replica id is not UTF-8".to_string()))?;
            offsets.push((ReplicaId::new(id), reader.u64()?));
        }
        if !reader.is_empty() {
            return Err(BurrowError::Corrupted(
                "trailing bytes in replication state".to_string(),
            ));
        }
        Ok(Self { offsets })
    }
}
