//! Literal run-length codec.
//!
//! Values are stored as consecutive 4-byte little-endian integers. Every
//! [`RunLengthDecoder::next`] call consumes exactly four bytes.

/// Width of one encoded value in bytes.
pub const VALUE_SIZE: usize = 4;

/// Encoder for literal `u32` sequences.
#[derive(Debug, Default, Clone)]
pub struct RunLengthEncoder {
    data: Vec<u8>,
}

impl RunLengthEncoder {
    /// Creates an empty encoder.
    pub fn new() -> Self {
        Self::default()
    }

    /// Creates an encoder with room for `count` values.
    pub fn with_capacity(count: usize) -> Self {
        Self {
            data: Vec::with_capacity(count * VALUE_SIZE),
        }
    }

    /// Appends one value.
    pub fn encode(&mut self, value: u32) {
        self.data.extend_from_slice(&value.to_le_bytes());
    }

    /// Encoded bytes.
    pub fn data(&self) -> &[u8] {
        &self.data
    }

    /// Encoded size in bytes.
    pub fn size(&self) -> usize {
        self.data.len()
    }

    /// Consumes the encoder and returns its bytes.
    pub fn finish(self) -> Vec<u8> {
        self.data
    }
}

/// Decoder for [`RunLengthEncoder`] output.
#[derive(Debug, Clone)]
pub struct RunLengthDecoder<'a> {
    data: &'a [u8],
    pos: usize,
}

impl<'a> RunLengthDecoder<'a> {
    /// Creates a decoder over `data`.
    pub fn new(data: &'a [u8]) -> Self {
        Self { data, pos: 0 }
    }

    /// Returns the next value and advances four bytes.
    ///
    /// Callers track element counts; `None` only guards reads past the end.
    #[allow(clippy::should_implement_trait)]
    pub fn next(&mut self) -> Option<u32> {
        let bytes = self.data.get(self.pos..self.pos + VALUE_SIZE)?;
        self.pos += VALUE_SIZE;
        let mut buf = [0u8; VALUE_SIZE];
        buf.copy_from_slice(bytes);
        Some(u32::from_le_bytes(buf))
    }

    /// Byte position of the read cursor.
    pub fn position(&self) -> usize {
        self.pos
    }
}
