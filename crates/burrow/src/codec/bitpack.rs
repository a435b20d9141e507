//! Fixed-width bit packing for bounded integers.
//!
//! Every value is stored with `ceil(log2(max_val + 1))` bits. Values are
//! buffered and written in blocks of up to [`BLOCK_SIZE`].
//!
//! ```text
//! max_val: u32 LE
//! block*:  n: u8 | ceil(n * width / 8) bytes, LSB-first
//! ```

use super::{bits_for, push_bits, read_bits};
use crate::error::{BurrowError, Result};
use bitvec::prelude::*;

/// Maximum number of values per packed block.
pub const BLOCK_SIZE: usize = 128;

const HEADER_SIZE: usize = 4;

/// Encoder packing values known to be `<= max_val`.
#[derive(Debug, Clone)]
pub struct BitPackEncoder {
    max_val: u32,
    width: u32,
    buffer: Vec<u32>,
    data: Vec<u8>,
}

impl BitPackEncoder {
    /// Creates an encoder for values in `0..=max_val`.
    pub fn new(max_val: u32) -> Self {
        Self {
            max_val,
            width: bits_for(u64::from(max_val)),
            buffer: Vec::with_capacity(BLOCK_SIZE),
            data: max_val.to_le_bytes().to_vec(),
        }
    }

    /// Bits used per value.
    pub fn width(&self) -> u32 {
        self.width
    }

    /// Buffers one value, writing a block once [`BLOCK_SIZE`] are pending.
    ///
    /// # Errors
    ///
    /// `ValueOutOfRange` when `value > max_val`; nothing is buffered.
    pub fn encode(&mut self, value: u32) -> Result<()> {
        if value > self.max_val {
            return Err(BurrowError::ValueOutOfRange {
                value: u64::from(value),
                max: u64::from(self.max_val),
            });
        }
        self.buffer.push(value);
        if self.buffer.len() == BLOCK_SIZE {
            self.write_block();
        }
        Ok(())
    }

    /// Writes any buffered values as a (possibly short) block.
    pub fn flush(&mut self) {
        if !self.buffer.is_empty() {
            self.write_block();
        }
    }

    /// Bytes written so far. Buffered values appear after [`flush`](Self::flush).
    pub fn data(&self) -> &[u8] {
        &self.data
    }

    /// Size of [`data`](Self::data) in bytes.
    pub fn size(&self) -> usize {
        self.data.len()
    }

    /// Flushes and returns the encoded bytes.
    pub fn finish(mut self) -> Vec<u8> {
        self.flush();
        self.data
    }

    fn write_block(&mut self) {
        let mut bits: BitVec<u8, Lsb0> =
            BitVec::with_capacity(self.buffer.len() * self.width as usize);
        self.data.push(self.buffer.len() as u8);
        for value in self.buffer.drain(..) {
            push_bits(&mut bits, u64::from(value), self.width);
        }
        self.data.extend_from_slice(&bits.into_vec());
    }
}

/// Decoder for [`BitPackEncoder`] output.
#[derive(Debug, Clone)]
pub struct BitPackDecoder<'a> {
    data: &'a [u8],
    pos: usize,
    max_val: u32,
    width: u32,
    block: Vec<u32>,
    block_pos: usize,
}

impl<'a> BitPackDecoder<'a> {
    /// Creates a decoder, reading the header from `data`.
    ///
    /// # Errors
    ///
    /// `Corrupted` when the header is missing.
    pub fn new(data: &'a [u8]) -> Result<Self> {
        let header = data
            .get(..HEADER_SIZE)
            .ok_or_else(|| BurrowError::Corrupted("bit-pack header truncated".to_string()))?;
        let mut buf = [0u8; HEADER_SIZE];
        buf.copy_from_slice(header);
        let max_val = u32::from_le_bytes(buf);
        Ok(Self {
            data,
            pos: HEADER_SIZE,
            max_val,
            width: bits_for(u64::from(max_val)),
            block: Vec::with_capacity(BLOCK_SIZE),
            block_pos: 0,
        })
    }

    /// Declared maximum value.
    pub fn max_val(&self) -> u32 {
        self.max_val
    }

    /// Returns the next value without advancing.
    pub fn peek(&mut self) -> Option<u32> {
        if !self.fill() {
            return None;
        }
        self.block.get(self.block_pos).copied()
    }

    /// Returns the next value and advances.
    #[allow(clippy::should_implement_trait)]
    pub fn next(&mut self) -> Option<u32> {
        let value = self.peek()?;
        self.block_pos += 1;
        Some(value)
    }

    fn fill(&mut self) -> bool {
        while self.block_pos >= self.block.len() {
            let Some(&count) = self.data.get(self.pos) else {
                return false;
            };
            let count = count as usize;
            let len = (count * self.width as usize).div_ceil(8);
            let Some(bytes) = self.data.get(self.pos + 1..self.pos + 1 + len) else {
                return false;
            };
            let bits = BitSlice::<u8, Lsb0>::from_slice(bytes);
            self.block.clear();
            for i in 0..count {
                let value = read_bits(bits, i * self.width as usize, self.width);
                self.block.push(value as u32);
            }
            self.block_pos = 0;
            self.pos += 1 + len;
        }
        true
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn decode_all(data: &[u8]) -> Vec<u32> {
        let mut decoder = BitPackDecoder::new(data).unwrap();
        let mut values = Vec::new();
        while let Some(value) = decoder.next() {
            values.push(value);
        }
        values
    }

    #[test]
    fn test_width_from_max_val() {
        assert_eq!(BitPackEncoder::new(0).width(), 0);
        assert_eq!(BitPackEncoder::new(1).width(), 1);
        assert_eq!(BitPackEncoder::new(7).width(), 3);
        assert_eq!(BitPackEncoder::new(8).width(), 4);
        assert_eq!(BitPackEncoder::new(u32::MAX).width(), 32);
    }

    #[test]
    fn test_roundtrip_across_blocks() {
        let values: Vec<u32> = (0..300).map(|i| (i * 7) % 1000).collect();
        let mut encoder = BitPackEncoder::new(999);
        for &v in &values {
            encoder.encode(v).unwrap();
        }
        assert_eq!(decode_all(&encoder.finish()), values);
    }

    #[test]
    fn test_block_is_written_at_capacity() {
        let mut encoder = BitPackEncoder::new(1);
        for _ in 0..BLOCK_SIZE {
            encoder.encode(1).unwrap();
        }
        // header + count byte + 128 bits
        assert_eq!(encoder.size(), 4 + 1 + 16);
        encoder.encode(0).unwrap();
        assert_eq!(encoder.size(), 21);
        encoder.flush();
        assert_eq!(encoder.size(), 23);
    }

    #[test]
    fn test_out_of_range_is_rejected() {
        let mut encoder = BitPackEncoder::new(10);
        encoder.encode(10).unwrap();
        let err = encoder.encode(11).unwrap_err();
        assert!(matches!(
            err,
            BurrowError::ValueOutOfRange { value: 11, max: 10 }
        ));
        assert_eq!(decode_all(&encoder.finish()), vec![10]);
    }

    #[test]
    fn test_peek_does_not_advance() {
        let mut encoder = BitPackEncoder::new(15);
        for v in [3, 9, 15] {
            encoder.encode(v).unwrap();
        }
        let data = encoder.finish();
        let mut decoder = BitPackDecoder::new(&data).unwrap();
        assert_eq!(decoder.peek(), Some(3));
        assert_eq!(decoder.peek(), Some(3));
        assert_eq!(decoder.next(), Some(3));
        assert_eq!(decoder.next(), Some(9));
        assert_eq!(decoder.peek(), Some(15));
        assert_eq!(decoder.next(), Some(15));
        assert_eq!(decoder.peek(), None);
    }

    #[test]
    fn test_zero_width_values() {
        let mut encoder = BitPackEncoder::new(0);
        for _ in 0..5 {
            encoder.encode(0).unwrap();
        }
        let data = encoder.finish();
        assert_eq!(data.len(), 5);
        assert_eq!(decode_all(&data), vec![0; 5]);
    }

    #[test]
    fn test_missing_header() {
        assert!(BitPackDecoder::new(&[1, 2]).is_err());
    }
}
