//! XZ variable-length integers.
//!
//! Little-endian base-128 with a continuation bit in the MSB. A VLI is at most
//! nine bytes and at most `2^63 - 1`; the final byte must have its MSB clear.
//! [`VliDecoder`] accepts one byte at a time so values can span arbitrary
//! input chunk boundaries.

use crate::binary::ByteReader;
use crate::error::{ArchiveError, ErrorCode, Result};

/// Largest value a VLI can encode.
pub const VLI_MAX: u64 = (1 << 63) - 1;

/// Maximum encoded length in bytes.
pub const VLI_MAX_LEN: usize = 9;

fn too_long() -> ArchiveError {
    ArchiveError::structural(
        ErrorCode::CompressionXzBadData,
        "variable-length integer exceeds 9 bytes",
    )
}

/// Decode a complete VLI from a cursor.
pub fn read_vli(reader: &mut ByteReader<'_>) -> Result<u64> {
    let mut decoder = VliDecoder::new();
    loop {
        let byte = reader.u8().map_err(|_| {
            ArchiveError::structural(
                ErrorCode::CompressionXzTruncated,
                "truncated variable-length integer",
            )
        })?;
        if let Some(value) = decoder.push(byte)? {
            return Ok(value);
        }
    }
}

/// Append the VLI encoding of `value` (must be `<= VLI_MAX`).
pub fn write_vli(out: &mut Vec<u8>, mut value: u64) {
    debug_assert!(value <= VLI_MAX);
    loop {
        let byte = (value & 0x7F) as u8;
        value >>= 7;
        if value == 0 {
            out.push(byte);
            return;
        }
        out.push(byte | 0x80);
    }
}

/// Encoded length of `value` in bytes.
pub fn vli_len(value: u64) -> usize {
    let mut len = 1;
    let mut v = value >> 7;
    while v != 0 {
        len += 1;
        v >>= 7;
    }
    len
}

/// Incremental VLI decoder that is fed one byte per call.
#[derive(Debug, Clone, Default)]
pub struct VliDecoder {
    value: u64,
    shift: u32,
}

impl VliDecoder {
    /// Create a decoder ready for the first byte.
    pub fn new() -> Self {
        Self::default()
    }

    /// Feed the next byte. Returns `Some(value)` once the final byte (MSB
    /// clear) arrives, `None` while more bytes are needed.
    pub fn push(&mut self, byte: u8) -> Result<Option<u64>> {
        if self.shift >= 63 {
            // A ninth byte may only contribute the low 7 bits and must be final.
            return Err(too_long());
        }
        self.value |= u64::from(byte & 0x7F) << self.shift;
        if byte & 0x80 == 0 {
            if self.shift > 0 && byte == 0 {
                return Err(ArchiveError::structural(
                    ErrorCode::CompressionXzBadData,
                    "non-minimal variable-length integer encoding",
                ));
            }
            let value = self.value;
            self.reset();
            return Ok(Some(value));
        }
        self.shift += 7;
        if self.shift > 56 {
            return Err(too_long());
        }
        Ok(None)
    }

    /// Whether the decoder is mid-value.
    pub fn in_progress(&self) -> bool {
        self.shift != 0 || self.value != 0
    }

    /// Discard any partial state.
    pub fn reset(&mut self) {
        self.value = 0;
        self.shift = 0;
    }
}
