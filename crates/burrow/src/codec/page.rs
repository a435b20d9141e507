//! Self-describing column pages.
//!
//! ## Page Layout
//!
//! ```text
//! 0x00  1  encoding (u8)
//! 0x01  4  value count (u32 LE)
//! 0x05  4  data length (u32 LE)
//! 0x09  N  codec data
//! 0x09+N 4 crc32 over bytes 0x00..0x09+N (u32 LE)
//! ```

use super::bits_for;
use super::bitpack::{BitPackDecoder, BitPackEncoder};
use super::pfor::{PforDecoder, PforEncoder};
use super::rle::{RunLengthDecoder, RunLengthEncoder};
use crate::error::{BurrowError, Result};
use std::io::{Read, Write};

/// Widest `u32` column still bit-packed; wider columns are stored plain.
pub const MAX_PACKED_WIDTH: u32 = 24;

const PAGE_HEADER_SIZE: usize = 9;

/// Encoding of a column page.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum PageEncoding {
    /// Literal 4-byte values ([`RunLengthEncoder`]).
    Plain = 0,
    /// Fixed-width packing ([`BitPackEncoder`]).
    BitPacked = 1,
    /// Patched frame-of-reference ([`PforEncoder`]).
    Pfor = 2,
    /// Uninterpreted bytes.
    Raw = 3,
}

impl PageEncoding {
    /// Creates a PageEncoding from a u8 value.
    pub fn from_u8(value: u8) -> Option<Self> {
        match value {
            0 => Some(Self::Plain),
            1 => Some(Self::BitPacked),
            2 => Some(Self::Pfor),
            3 => Some(Self::Raw),
            _ => None,
        }
    }
}

/// One encoded column.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ColumnPage {
    /// Codec used for `data`.
    pub encoding: PageEncoding,
    /// Number of values in the page.
    pub count: u32,
    /// Codec output.
    pub data: Vec<u8>,
}

impl ColumnPage {
    /// Encodes `u32` values, bit-packing unless the widest value needs more
    /// than [`MAX_PACKED_WIDTH`] bits.
    pub fn encode_u32(values: &[u32]) -> Result<Self> {
        let max_val = values.iter().copied().max().unwrap_or(0);
        if bits_for(u64::from(max_val)) > MAX_PACKED_WIDTH {
            let mut encoder = RunLengthEncoder::with_capacity(values.len());
            for &value in values {
                encoder.encode(value);
            }
            return Ok(Self::new(PageEncoding::Plain, values.len(), encoder.finish()));
        }

        let mut encoder = BitPackEncoder::new(max_val);
        for &value in values {
            encoder.encode(value)?;
        }
        Ok(Self::new(
            PageEncoding::BitPacked,
            values.len(),
            encoder.finish(),
        ))
    }

    /// Encodes `u64` values with PFOR.
    pub fn encode_u64(values: &[u64]) -> Self {
        let mut encoder = PforEncoder::new();
        for &value in values {
            encoder.encode(value);
        }
        Self::new(PageEncoding::Pfor, values.len(), encoder.finish())
    }

    /// Wraps raw bytes holding `count` logical values.
    pub fn raw(data: Vec<u8>, count: usize) -> Self {
        Self::new(PageEncoding::Raw, count, data)
    }

    fn new(encoding: PageEncoding, count: usize, data: Vec<u8>) -> Self {
        Self {
            encoding,
            count: count as u32,
            data,
        }
    }

    /// Decodes a `Plain` or `BitPacked` page.
    pub fn decode_u32(&self) -> Result<Vec<u32>> {
        let count = self.count as usize;
        let mut values = Vec::with_capacity(count);
        match self.encoding {
            PageEncoding::Plain => {
                let mut decoder = RunLengthDecoder::new(&self.data);
                while values.len() < count {
                    match decoder.next() {
                        Some(value) => values.push(value),
                        None => break,
                    }
                }
            }
            PageEncoding::BitPacked => {
                let mut decoder = BitPackDecoder::new(&self.data)?;
                while values.len() < count {
                    match decoder.next() {
                        Some(value) => values.push(value),
                        None => break,
                    }
                }
            }
            other => {
                return Err(BurrowError::Corrupted(format!(
                    "{:?} page cannot be decoded as u32",
                    other
                )))
            }
        }
        self.check_count(values.len())?;
        Ok(values)
    }

    /// Decodes a `Pfor` page.
    pub fn decode_u64(&self) -> Result<Vec<u64>> {
        if self.encoding != PageEncoding::Pfor {
            return Ok(self.decode_u32()?.into_iter().map(u64::from).collect());
        }
        let count = self.count as usize;
        let mut decoder = PforDecoder::new(&self.data);
        let mut values = Vec::with_capacity(count);
        while values.len() < count {
            match decoder.next() {
                Some(value) => values.push(value),
                None => break,
            }
        }
        self.check_count(values.len())?;
        Ok(values)
    }

    fn check_count(&self, decoded: usize) -> Result<()> {
        if decoded != self.count as usize {
            return Err(BurrowError::Corrupted(format!(
                "{:?} page declares {} values, decoded {}",
                self.encoding, self.count, decoded
            )));
        }
        Ok(())
    }

    /// Size of the page on disk.
    pub fn encoded_size(&self) -> usize {
        PAGE_HEADER_SIZE + self.data.len() + 4
    }

    /// Writes the page with its checksum.
    pub fn write_to<W: Write>(&self, writer: &mut W) -> Result<()> {
        let mut header = [0u8; PAGE_HEADER_SIZE];
        header[0] = self.encoding as u8;
        header[1..5].copy_from_slice(&self.count.to_le_bytes());
        header[5..9].copy_from_slice(&(self.data.len() as u32).to_le_bytes());

        let mut hasher = crc32fast::Hasher::new();
        hasher.update(&header);
        hasher.update(&self.data);

        writer.write_all(&header)?;
        writer.write_all(&self.data)?;
        writer.write_all(&hasher.finalize().to_le_bytes())?;
        Ok(())
    }

    /// Reads a page and verifies its checksum.
    pub fn read_from<R: Read>(reader: &mut R) -> Result<Self> {
        let mut header = [0u8; PAGE_HEADER_SIZE];
        reader.read_exact(&mut header)?;
        let encoding = PageEncoding::from_u8(header[0]).ok_or_else(|| {
            BurrowError::Corrupted(format!("unknown page encoding {}", header[0]))
        })?;
        let count = u32::from_le_bytes([header[1], header[2], header[3], header[4]]);
        let len = u32::from_le_bytes([header[5], header[6], header[7], header[8]]) as usize;

        let mut data = vec![0u8; len];
        reader.read_exact(&mut data)?;
        let mut crc = [0u8; 4];
        reader.read_exact(&mut crc)?;
        let expected = u32::from_le_bytes(crc);

        let mut hasher = crc32fast::Hasher::new();
        hasher.update(&header);
        hasher.update(&data);
        let actual = hasher.finalize();
        if expected != actual {
            return Err(BurrowError::ChecksumMismatch { expected, actual });
        }

        Ok(Self {
            encoding,
            count,
            data,
        })
    }
}
