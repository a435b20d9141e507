//! Segment files written by partition commits.
//!
//! A segment holds one committed batch in commit order. Record `i` of a
//! segment has partition offset `first_offset + i`.
//!
//! ## File Structure
//!
//! ```text
//! ┌──────────────────────────────────────────────┐
//! │  Header (24 bytes)                           │
//! │  - Magic: "BSEG" (4 bytes)                   │
//! │  - Version: u16 (2 bytes)                    │
//! │  - Reserved: 2 bytes                         │
//! │  - First offset: u64 (8 bytes)               │
//! │  - Record count: u32 (4 bytes)               │
//! │  - Header CRC32: u32 (4 bytes)               │
//! ├──────────────────────────────────────────────┤
//! │  Entries (repeated record count times)       │
//! │  - Length: u32, CRC32: u32, record bytes     │
//! └──────────────────────────────────────────────┘
//! ```

use super::{magic_at, u16_at, u32_at, u64_at, write_atomic, SyncMode};
use crate::error::{BurrowError, Result};
use crate::record::{CommittedRecord, RecordRef};
use std::fs;
use std::path::Path;

/// Magic bytes for segment file header: "BSEG"
pub const SEGMENT_MAGIC: [u8; 4] = *b"BSEG";

/// Current segment format version.
pub const SEGMENT_VERSION: u16 = 1;

/// Header size in bytes.
pub const SEGMENT_HEADER_SIZE: usize = 24;

const ENTRY_HEADER_SIZE: usize = 8;

/// Decoded contents of a segment file.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SegmentContents {
    /// Partition offset of the first record.
    pub first_offset: u64,
    /// Records in commit order.
    pub records: Vec<RecordRef>,
}

impl SegmentContents {
    /// Offset one past the last record.
    pub fn end_offset(&self) -> u64 {
        self.first_offset + self.records.len() as u64
    }

    /// Converts the records into committed records with their offsets.
    pub fn into_committed(self) -> Vec<CommittedRecord> {
        let first_offset = self.first_offset;
        self.records
            .into_iter()
            .enumerate()
            .map(|(i, record)| CommittedRecord {
                offset: first_offset + i as u64,
                record,
            })
            .collect()
    }
}

/// Encodes a segment into a byte buffer.
pub fn encode_segment(first_offset: u64, records: &[RecordRef]) -> Vec<u8> {
    let body_len: usize = records
        .iter()
        .map(|r| ENTRY_HEADER_SIZE + r.encoded_size())
        .sum();
    let mut buf = Vec::with_capacity(SEGMENT_HEADER_SIZE + body_len);
    buf.extend_from_slice(&SEGMENT_MAGIC);
    buf.extend_from_slice(&SEGMENT_VERSION.to_le_bytes());
    buf.extend_from_slice(&[0u8; 2]);
    buf.extend_from_slice(&first_offset.to_le_bytes());
    buf.extend_from_slice(&(records.len() as u32).to_le_bytes());
    let header_crc = crc32fast::hash(&buf);
    buf.extend_from_slice(&header_crc.to_le_bytes());

    let mut entry = Vec::new();
    for record in records {
        entry.clear();
        record.encode_into(&mut entry);
        buf.extend_from_slice(&(entry.len() as u32).to_le_bytes());
        buf.extend_from_slice(&crc32fast::hash(&entry).to_le_bytes());
        buf.extend_from_slice(&entry);
    }
    buf
}

/// Decodes a segment from its bytes.
pub fn decode_segment(data: &[u8]) -> Result<SegmentContents> {
    if data.len() < SEGMENT_HEADER_SIZE {
        return Err(BurrowError::Corrupted(format!(
            "segment of {} bytes is shorter than its header",
            data.len()
        )));
    }
    let magic = magic_at(data, 0);
    if magic != SEGMENT_MAGIC {
        return Err(BurrowError::InvalidMagic {
            expected: SEGMENT_MAGIC,
            actual: magic,
        });
    }
    let version = u16_at(data, 4);
    if version > SEGMENT_VERSION {
        return Err(BurrowError::UnsupportedVersion(version));
    }
    let expected = u32_at(data, 20);
    let actual = crc32fast::hash(&data[..20]);
    if expected != actual {
        return Err(BurrowError::ChecksumMismatch { expected, actual });
    }
    let first_offset = u64_at(data, 8);
    let count = u32_at(data, 16) as usize;

    let mut records = Vec::with_capacity(count.min(data.len() / ENTRY_HEADER_SIZE));
    let mut pos = SEGMENT_HEADER_SIZE;
    for _ in 0..count {
        if data.len() < pos + ENTRY_HEADER_SIZE {
            return Err(BurrowError::Corrupted(format!(
                "segment truncated after {} of {} records",
                records.len(),
                count
            )));
        }
        let len = u32_at(data, pos) as usize;
        let expected = u32_at(data, pos + 4);
        pos += ENTRY_HEADER_SIZE;
        let entry = data.get(pos..pos + len).ok_or_else(|| {
            BurrowError::Corrupted(format!(
                "segment entry {} extends past end of file",
                records.len()
            ))
        })?;
        let actual = crc32fast::hash(entry);
        if expected != actual {
            return Err(BurrowError::ChecksumMismatch { expected, actual });
        }
        records.push(RecordRef::decode_from(entry)?);
        pos += len;
    }
    if pos != data.len() {
        return Err(BurrowError::Corrupted(format!(
            "{} trailing bytes after segment records",
            data.len() - pos
        )));
    }

    Ok(SegmentContents {
        first_offset,
        records,
    })
}

/// Writes a segment file atomically. Returns the file size.
pub fn write_segment(
    path: &Path,
    first_offset: u64,
    records: &[RecordRef],
    sync_mode: SyncMode,
) -> Result<u64> {
    let data = encode_segment(first_offset, records);
    write_atomic(path, sync_mode, |writer| {
        std::io::Write::write_all(writer, &data)?;
        Ok(())
    })
}

/// Reads and verifies a segment file.
pub fn read_segment(path: &Path) -> Result<SegmentContents> {
    let data = fs::read(path)?;
    decode_segment(&data)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::key::Hash160;
    use tempfile::TempDir;

    fn sample_records() -> Vec<RecordRef> {
        vec![
            RecordRef::new(Hash160::digest(b"a"), 1, "alpha"),
            RecordRef::new(Hash160::digest(b"b"), 4, "").with_update(true),
            RecordRef::new(Hash160::digest(b"c"), 2, vec![0u8; 300]),
        ]
    }

    #[test]
    fn test_write_read_segment() {
        let temp_dir = TempDir::new().unwrap();
        let path = temp_dir.path().join("0000000000000010.seg");
        let records = sample_records();
        let size = write_segment(&path, 16, &records, SyncMode::None).unwrap();
        assert_eq!(size, fs::metadata(&path).unwrap().len());

        let contents = read_segment(&path).unwrap();
        assert_eq!(contents.first_offset, 16);
        assert_eq!(contents.end_offset(), 19);
        assert_eq!(contents.records, records);

        let committed = contents.into_committed();
        let offsets: Vec<u64> = committed.iter().map(|c| c.offset).collect();
        assert_eq!(offsets, vec![16, 17, 18]);
    }

    #[test]
    fn test_empty_segment() {
        let data = encode_segment(3, &[]);
        assert_eq!(data.len(), SEGMENT_HEADER_SIZE);
        let contents = decode_segment(&data).unwrap();
        assert_eq!(contents.first_offset, 3);
        assert!(contents.records.is_empty());
    }

    #[test]
    fn test_corruption_is_detected() {
        let data = encode_segment(0, &sample_records());

        let mut bad_magic = data.clone();
        bad_magic[0] = b'X';
        assert!(matches!(
            decode_segment(&bad_magic),
            Err(BurrowError::InvalidMagic { .. })
        ));

        let mut bad_header = data.clone();
        bad_header[9] ^= 0x01;
        assert!(matches!(
            decode_segment(&bad_header),
            Err(BurrowError::ChecksumMismatch { .. })
        ));

        let mut bad_entry = data.clone();
        let last = bad_entry.len() - 1;
        bad_entry[last] ^= 0xff;
        assert!(matches!(
            decode_segment(&bad_entry),
            Err(BurrowError::ChecksumMismatch { .. })
        ));

        assert!(matches!(
            decode_segment(&data[..data.len() - 3]),
            Err(BurrowError::Corrupted(_))
        ));
    }

    #[test]
    fn test_newer_version_is_rejected() {
        let mut data = encode_segment(0, &[]);
        data[4..6].copy_from_slice(&(SEGMENT_VERSION + 1).to_le_bytes());
        assert!(matches!(
            decode_segment(&data),
            Err(BurrowError::UnsupportedVersion(_))
        ));
    }
}
