//! Record types shared by the write and read paths.

use crate::error::{BurrowError, Result};
use crate::key::{Hash160, RecordId};
use bytes::Bytes;

/// Fixed-size prefix of an encoded record: id, version, flags, payload length.
pub const RECORD_HEADER_SIZE: usize = Hash160::LEN + 8 + 1 + 4;

const FLAG_UPDATE: u8 = 0b0000_0001;

/// A record addressed by its id.
///
/// At most one live record per `record_id` exists in a partition; among
/// several versions the highest `record_version` wins.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RecordRef {
    /// Content- or caller-derived id.
    pub record_id: RecordId,
    /// Version used for last-writer-wins resolution.
    pub record_version: u64,
    /// Opaque payload.
    pub payload: Bytes,
    /// True when this record replaces an earlier committed version.
    pub is_update: bool,
}

impl RecordRef {
    /// Creates a record.
    pub fn new(record_id: RecordId, record_version: u64, payload: impl Into<Bytes>) -> Self {
        Self {
            record_id,
            record_version,
            payload: payload.into(),
            is_update: false,
        }
    }

    /// Marks the record as an update of an earlier version.
    pub fn with_update(mut self, is_update: bool) -> Self {
        self.is_update = is_update;
        self
    }

    /// Encoded size in bytes.
    pub fn encoded_size(&self) -> usize {
        RECORD_HEADER_SIZE + self.payload.len()
    }

    /// Appends the binary encoding to `buf`.
    pub fn encode_into(&self, buf: &mut Vec<u8>) {
        buf.reserve(self.encoded_size());
        buf.extend_from_slice(self.record_id.as_bytes());
        buf.extend_from_slice(&self.record_version.to_le_bytes());
        buf.push(if self.is_update { FLAG_UPDATE } else { 0 });
        buf.extend_from_slice(&(self.payload.len() as u32).to_le_bytes());
        buf.extend_from_slice(&self.payload);
    }

    /// Decodes one record occupying all of `data`.
    pub fn decode_from(data: &[u8]) -> Result<Self> {
        if data.len() < RECORD_HEADER_SIZE {
            return Err(BurrowError::Corrupted(format!(
                "record of {} bytes is shorter than its header",
                data.len()
            )));
        }
        let mut id = [0u8; Hash160::LEN];
        id.copy_from_slice(&data[..Hash160::LEN]);
        let mut pos = Hash160::LEN;

        let mut buf8 = [0u8; 8];
        buf8.copy_from_slice(&data[pos..pos + 8]);
        let record_version = u64::from_le_bytes(buf8);
        pos += 8;

        let flags = data[pos];
        pos += 1;

        let mut buf4 = [0u8; 4];
        buf4.copy_from_slice(&data[pos..pos + 4]);
        let payload_len = u32::from_le_bytes(buf4) as usize;
        pos += 4;

        if data.len() - pos != payload_len {
            return Err(BurrowError::Corrupted(format!(
                "record payload length {} does not match {} remaining bytes",
                payload_len,
                data.len() - pos
            )));
        }

        Ok(Self {
            record_id: Hash160::from_bytes(id),
            record_version,
            payload: Bytes::copy_from_slice(&data[pos..]),
            is_update: flags & FLAG_UPDATE != 0,
        })
    }
}

/// A durable record together with its partition offset.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CommittedRecord {
    /// Position in the partition's commit order.
    pub offset: u64,
    /// The record.
    pub record: RecordRef,
}
