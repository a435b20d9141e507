//! Columnar chunk files written by compaction.
//!
//! A chunk replaces a run of segments. It keeps the surviving record of every
//! record id in offset order, split into one [`ColumnPage`] per field.
//!
//! ## File Structure
//!
//! ```text
//! ┌──────────────────────────────────────────────┐
//! │  Header (36 bytes)                           │
//! │  - Magic: "BCHK" (4 bytes)                   │
//! │  - Version: u16 (2 bytes)                    │
//! │  - Reserved: 2 bytes                         │
//! │  - Generation: u32 (4 bytes)                 │
//! │  - First offset: u64 (8 bytes)               │
//! │  - End offset: u64 (8 bytes)                 │
//! │  - Record count: u32 (4 bytes)               │
//! │  - Header CRC32: u32 (4 bytes)               │
//! ├──────────────────────────────────────────────┤
//! │  Column pages                                │
//! │  - offsets - first offset (PFOR)             │
//! │  - record versions (PFOR)                    │
//! │  - update flags (bit-packed)                 │
//! │  - payload lengths (bit-packed or plain)     │
//! │  - record ids (raw, 20 bytes each)           │
//! │  - payloads (raw, concatenated)              │
//! ├──────────────────────────────────────────────┤
//! │  Reverse magic: "KHCB" (4 bytes)             │
//! └──────────────────────────────────────────────┘
//! ```

use super::{magic_at, u16_at, u32_at, u64_at, write_atomic, SyncMode};
use crate::codec::{ColumnPage, PageEncoding};
use crate::error::{BurrowError, Result};
use crate::key::{Hash160, RecordId};
use crate::record::{CommittedRecord, RecordRef};
use bytes::Bytes;
use std::fs;
use std::io::{Cursor, Read, Write};
use std::path::Path;

/// Magic bytes for chunk file header: "BCHK"
pub const CHUNK_MAGIC: [u8; 4] = *b"BCHK";

/// Reverse magic bytes for chunk file footer: "KHCB"
pub const CHUNK_MAGIC_REVERSE: [u8; 4] = *b"KHCB";

/// Current chunk format version.
pub const CHUNK_VERSION: u16 = 1;

/// Header size in bytes.
pub const CHUNK_HEADER_SIZE: usize = 36;

/// Chunk file header.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ChunkHeader {
    /// Compaction generation that wrote the chunk.
    pub generation: u32,
    /// First partition offset covered by the chunk.
    pub first_offset: u64,
    /// Offset one past the last offset covered by the chunk.
    pub end_offset: u64,
    /// Number of records stored.
    pub record_count: u32,
}

impl ChunkHeader {
    fn write_to<W: Write>(&self, writer: &mut W) -> Result<()> {
        let mut buf = Vec::with_capacity(CHUNK_HEADER_SIZE);
        buf.extend_from_slice(&CHUNK_MAGIC);
        buf.extend_from_slice(&CHUNK_VERSION.to_le_bytes());
        buf.extend_from_slice(&[0u8; 2]);
        buf.extend_from_slice(&self.generation.to_le_bytes());
        buf.extend_from_slice(&self.first_offset.to_le_bytes());
        buf.extend_from_slice(&self.end_offset.to_le_bytes());
        buf.extend_from_slice(&self.record_count.to_le_bytes());
        let crc = crc32fast::hash(&buf);
        buf.extend_from_slice(&crc.to_le_bytes());
        writer.write_all(&buf)?;
        Ok(())
    }

    fn read_from<R: Read>(reader: &mut R) -> Result<Self> {
        let mut buf = [0u8; CHUNK_HEADER_SIZE];
        reader.read_exact(&mut buf)?;

        let magic = magic_at(&buf, 0);
        if magic != CHUNK_MAGIC {
            return Err(BurrowError::InvalidMagic {
                expected: CHUNK_MAGIC,
                actual: magic,
            });
        }
        let version = u16_at(&buf, 4);
        if version > CHUNK_VERSION {
            return Err(BurrowError::UnsupportedVersion(version));
        }
        let expected = u32_at(&buf, 32);
        let actual = crc32fast::hash(&buf[..32]);
        if expected != actual {
            return Err(BurrowError::ChecksumMismatch { expected, actual });
        }

        Ok(Self {
            generation: u32_at(&buf, 8),
            first_offset: u64_at(&buf, 12),
            end_offset: u64_at(&buf, 20),
            record_count: u32_at(&buf, 28),
        })
    }
}

/// Decoded contents of a chunk file.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChunkContents {
    /// File header.
    pub header: ChunkHeader,
    /// Records in offset order.
    pub records: Vec<CommittedRecord>,
}

/// Encodes records, sorted by offset, into chunk bytes.
pub fn encode_chunk(
    generation: u32,
    first_offset: u64,
    end_offset: u64,
    records: &[CommittedRecord],
) -> Result<Vec<u8>> {
    if let Some(record) = records
        .iter()
        .find(|r| r.offset < first_offset || r.offset >= end_offset)
    {
        return Err(BurrowError::Validation(format!(
            "offset {} outside chunk range [{}, {})",
            record.offset, first_offset, end_offset
        )));
    }

    let header = ChunkHeader {
        generation,
        first_offset,
        end_offset,
        record_count: records.len() as u32,
    };

    let offsets: Vec<u64> = records.iter().map(|r| r.offset - first_offset).collect();
    let versions: Vec<u64> = records.iter().map(|r| r.record.record_version).collect();
    let flags: Vec<u32> = records.iter().map(|r| u32::from(r.record.is_update)).collect();
    let lengths: Vec<u32> = records
        .iter()
        .map(|r| r.record.payload.len() as u32)
        .collect();
    let mut ids = Vec::with_capacity(records.len() * Hash160::LEN);
    let mut payloads = Vec::with_capacity(lengths.iter().map(|&l| l as usize).sum());
    for record in records {
        ids.extend_from_slice(record.record.record_id.as_bytes());
        payloads.extend_from_slice(&record.record.payload);
    }

    let pages = [
        ColumnPage::encode_u64(&offsets),
        ColumnPage::encode_u64(&versions),
        ColumnPage::encode_u32(&flags)?,
        ColumnPage::encode_u32(&lengths)?,
        ColumnPage::raw(ids, records.len()),
        ColumnPage::raw(payloads, records.len()),
    ];

    let mut buf = Vec::with_capacity(
        CHUNK_HEADER_SIZE + pages.iter().map(|p| p.encoded_size()).sum::<usize>() + 4,
    );
    header.write_to(&mut buf)?;
    for page in &pages {
        page.write_to(&mut buf)?;
    }
    buf.extend_from_slice(&CHUNK_MAGIC_REVERSE);
    Ok(buf)
}

/// Decodes chunk bytes.
pub fn decode_chunk(data: &[u8]) -> Result<ChunkContents> {
    let mut cursor = Cursor::new(data);
    let header = ChunkHeader::read_from(&mut cursor)?;
    let count = header.record_count as usize;

    let offsets = read_page(&mut cursor, count)?.decode_u64()?;
    let versions = read_page(&mut cursor, count)?.decode_u64()?;
    let flags = read_page(&mut cursor, count)?.decode_u32()?;
    let lengths = read_page(&mut cursor, count)?.decode_u32()?;
    let ids = read_raw_page(&mut cursor, count)?;
    let payloads = Bytes::from(read_raw_page(&mut cursor, count)?);

    let mut footer = [0u8; 4];
    cursor.read_exact(&mut footer)?;
    if footer != CHUNK_MAGIC_REVERSE {
        return Err(BurrowError::InvalidMagic {
            expected: CHUNK_MAGIC_REVERSE,
            actual: footer,
        });
    }
    if cursor.position() as usize != data.len() {
        return Err(BurrowError::Corrupted(
            "trailing bytes after chunk footer".to_string(),
        ));
    }
    if ids.len() != count * Hash160::LEN {
        return Err(BurrowError::Corrupted(format!(
            "record id column holds {} bytes for {} records",
            ids.len(),
            count
        )));
    }
    let total_payload: usize = lengths.iter().map(|&l| l as usize).sum();
    if total_payload != payloads.len() {
        return Err(BurrowError::Corrupted(format!(
            "payload lengths sum to {} but column holds {} bytes",
            total_payload,
            payloads.len()
        )));
    }

    let mut records = Vec::with_capacity(count);
    let mut payload_pos = 0usize;
    for i in 0..count {
        let mut id = [0u8; Hash160::LEN];
        id.copy_from_slice(&ids[i * Hash160::LEN..(i + 1) * Hash160::LEN]);
        let len = lengths[i] as usize;
        let record = RecordRef {
            record_id: RecordId::from_bytes(id),
            record_version: versions[i],
            payload: payloads.slice(payload_pos..payload_pos + len),
            is_update: flags[i] != 0,
        };
        payload_pos += len;
        let offset = header.first_offset.checked_add(offsets[i]).ok_or_else(|| {
            BurrowError::Corrupted(format!("record offset overflows at {}", i))
        })?;
        records.push(CommittedRecord { offset, record });
    }

    Ok(ChunkContents { header, records })
}

fn read_page(cursor: &mut Cursor<&[u8]>, count: usize) -> Result<ColumnPage> {
    let page = ColumnPage::read_from(cursor)?;
    if page.count as usize != count {
        return Err(BurrowError::Corrupted(format!(
            "column page holds {} values, expected {}",
            page.count, count
        )));
    }
    Ok(page)
}

fn read_raw_page(cursor: &mut Cursor<&[u8]>, count: usize) -> Result<Vec<u8>> {
    let page = read_page(cursor, count)?;
    if page.encoding != PageEncoding::Raw {
        return Err(BurrowError::Corrupted(format!(
            "expected raw page, found {:?}",
            page.encoding
        )));
    }
    Ok(page.data)
}

/// Writes a chunk file atomically. Returns the file size.
pub fn write_chunk(
    path: &Path,
    generation: u32,
    first_offset: u64,
    end_offset: u64,
    records: &[CommittedRecord],
    sync_mode: SyncMode,
) -> Result<u64> {
    let data = encode_chunk(generation, first_offset, end_offset, records)?;
    write_atomic(path, sync_mode, |writer| {
        writer.write_all(&data)?;
        Ok(())
    })
}

/// Reads and verifies a chunk file.
pub fn read_chunk(path: &Path) -> Result<ChunkContents> {
    let data = fs::read(path)?;
    decode_chunk(&data)
}
