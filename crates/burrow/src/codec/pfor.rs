//! Patched frame-of-reference (PFOR) codec.
//!
//! Values are grouped into frames of up to [`FRAME_SIZE`]. Each frame stores
//! its minimum as the reference and packs `value - reference` with a width
//! chosen to minimise the frame size. Deltas that do not fit the width keep
//! their low bits in the packed area and are patched with their high bits
//! from an exception table.
//!
//! ```text
//! frame*: n: u8 | reference: u64 LE | width: u8 | exceptions: u8
//!         | ceil(n * width / 8) packed bytes, LSB-first
//!         | exceptions * (index: u8 | high bits: u64 LE)
//! ```
//!
//! [`PforEncoder::flush`] must run before [`PforEncoder::data`] is read;
//! values still buffered are not part of the output.

use super::{bits_for, push_bits, read_bits};
use bitvec::prelude::*;

/// Maximum number of values per frame.
pub const FRAME_SIZE: usize = 128;

const FRAME_HEADER_SIZE: usize = 1 + 8 + 1 + 1;
const EXCEPTION_SIZE: usize = 1 + 8;

/// Encoder producing PFOR frames.
#[derive(Debug, Default, Clone)]
pub struct PforEncoder {
    buffer: Vec<u64>,
    data: Vec<u8>,
}

impl PforEncoder {
    /// Creates an empty encoder.
    pub fn new() -> Self {
        Self {
            buffer: Vec::with_capacity(FRAME_SIZE),
            data: Vec::new(),
        }
    }

    /// Buffers one value; a full frame is written automatically.
    pub fn encode(&mut self, value: u64) {
        self.buffer.push(value);
        if self.buffer.len() == FRAME_SIZE {
            self.write_frame();
        }
    }

    /// Finalises the current frame, patch table included.
    pub fn flush(&mut self) {
        if !self.buffer.is_empty() {
            self.write_frame();
        }
    }

    /// Encoded frames written so far.
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

    fn write_frame(&mut self) {
        let reference = self.buffer.iter().copied().min().unwrap_or(0);
        let deltas: Vec<u64> = self.buffer.iter().map(|v| v - reference).collect();
        let width = choose_width(&deltas);

        let mut packed: BitVec<u8, Lsb0> = BitVec::with_capacity(deltas.len() * width as usize);
        let mut exceptions = Vec::new();
        for (index, &delta) in deltas.iter().enumerate() {
            push_bits(&mut packed, delta, width);
            if width < u64::BITS && delta >> width != 0 {
                exceptions.push((index as u8, delta >> width));
            }
        }

        self.data.push(deltas.len() as u8);
        self.data.extend_from_slice(&reference.to_le_bytes());
        self.data.push(width as u8);
        self.data.push(exceptions.len() as u8);
        self.data.extend_from_slice(&packed.into_vec());
        for (index, high) in exceptions {
            self.data.push(index);
            self.data.extend_from_slice(&high.to_le_bytes());
        }
        self.buffer.clear();
    }
}

/// Picks the packed width giving the smallest frame.
fn choose_width(deltas: &[u64]) -> u32 {
    let max_width = bits_for(deltas.iter().copied().max().unwrap_or(0));
    let mut best = (usize::MAX, max_width);
    for width in 0..=max_width {
        let exceptions = if width >= u64::BITS {
            0
        } else {
            deltas.iter().filter(|&&d| d >> width != 0).count()
        };
        let cost = (deltas.len() * width as usize).div_ceil(8) + exceptions * EXCEPTION_SIZE;
        if cost < best.0 {
            best = (cost, width);
        }
    }
    best.1
}

/// Decoder yielding values in their original order.
#[derive(Debug, Clone)]
pub struct PforDecoder<'a> {
    data: &'a [u8],
    pos: usize,
    frame: Vec<u64>,
    frame_pos: usize,
}

impl<'a> PforDecoder<'a> {
    /// Creates a decoder over flushed PFOR frames.
    pub fn new(data: &'a [u8]) -> Self {
        Self {
            data,
            pos: 0,
            frame: Vec::with_capacity(FRAME_SIZE),
            frame_pos: 0,
        }
    }

    /// Returns the next value, or `None` once the frames are exhausted.
    #[allow(clippy::should_implement_trait)]
    pub fn next(&mut self) -> Option<u64> {
        while self.frame_pos >= self.frame.len() {
            if !self.read_frame() {
                return None;
            }
        }
        let value = self.frame[self.frame_pos];
        self.frame_pos += 1;
        Some(value)
    }

    fn read_frame(&mut self) -> bool {
        let Some(header) = self.data.get(self.pos..self.pos + FRAME_HEADER_SIZE) else {
            return false;
        };
        let count = header[0] as usize;
        let mut buf = [0u8; 8];
        buf.copy_from_slice(&header[1..9]);
        let reference = u64::from_le_bytes(buf);
        let width = u32::from(header[9]);
        let exception_count = header[10] as usize;
        if width > u64::BITS {
            return false;
        }

        let packed_len = (count * width as usize).div_ceil(8);
        let packed_start = self.pos + FRAME_HEADER_SIZE;
        let patch_start = packed_start + packed_len;
        let frame_end = patch_start + exception_count * EXCEPTION_SIZE;
        let (Some(packed), Some(patches)) = (
            self.data.get(packed_start..patch_start),
            self.data.get(patch_start..frame_end),
        ) else {
            return false;
        };

        let bits = BitSlice::<u8, Lsb0>::from_slice(packed);
        let mut deltas: Vec<u64> = (0..count)
            .map(|i| read_bits(bits, i * width as usize, width))
            .collect();
        for patch in patches.chunks_exact(EXCEPTION_SIZE) {
            let index = patch[0] as usize;
            buf.copy_from_slice(&patch[1..]);
            let high = u64::from_le_bytes(buf);
            match deltas.get_mut(index) {
                Some(delta) if width < u64::BITS => *delta |= high << width,
                _ => return false,
            }
        }

        self.frame.clear();
        self.frame
            .extend(deltas.into_iter().map(|d| reference.wrapping_add(d)));
        self.frame_pos = 0;
        self.pos = frame_end;
        true
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn roundtrip(values: &[u64]) -> Vec<u64> {
        let mut encoder = PforEncoder::new();
        for &v in values {
            encoder.encode(v);
        }
        encoder.flush();
        let mut decoder = PforDecoder::new(encoder.data());
        let mut out = Vec::new();
        while let Some(v) = decoder.next() {
            out.push(v);
        }
        out
    }

    #[test]
    fn test_roundtrip_with_outliers() {
        let mut values: Vec<u64> = (0..300).map(|i| 1_000 + (i % 13)).collect();
        values[5] = u64::MAX;
        values[140] = 1 << 40;
        values[299] = 0;
        assert_eq!(roundtrip(&values), values);
    }

    #[test]
    fn test_outliers_are_patched_not_widened() {
        let mut values = vec![3u64; 100];
        values[50] = 1 << 50;
        let mut encoder = PforEncoder::new();
        for &v in &values {
            encoder.encode(v);
        }
        encoder.flush();
        // one frame, narrow packing, one exception
        assert_eq!(encoder.data()[10], 1);
        assert!(encoder.size() < 100);
    }

    #[test]
    fn test_constant_frame_uses_zero_width() {
        let values = vec![42u64; FRAME_SIZE];
        let mut encoder = PforEncoder::new();
        for &v in &values {
            encoder.encode(v);
        }
        // frame written without an explicit flush
        assert_eq!(encoder.size(), FRAME_HEADER_SIZE);
        assert_eq!(roundtrip(&values), values);
    }

    #[test]
    fn test_unflushed_values_are_not_visible() {
        let mut encoder = PforEncoder::new();
        encoder.encode(1);
        encoder.encode(2);
        assert_eq!(encoder.size(), 0);
        assert_eq!(roundtrip(&[]), Vec::<u64>::new());
        assert_eq!(PforDecoder::new(encoder.data()).next(), None);
    }

    #[test]
    fn test_full_range_values() {
        let values = vec![0, u64::MAX, 1, u64::MAX - 1];
        assert_eq!(roundtrip(&values), values);
    }

    #[test]
    fn test_truncated_frame_stops_decoding() {
        let data = PforEncoder::new().finish();
        assert!(data.is_empty());
        let mut encoder = PforEncoder::new();
        for v in 0..10 {
            encoder.encode(v);
        }
        let data = encoder.finish();
        let mut decoder = PforDecoder::new(&data[..data.len() - 1]);
        assert_eq!(decoder.next(), None);
    }
}
