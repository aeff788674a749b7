//! XZ integrity check types.
//!
//! The check type is fixed per stream by the stream flags. Reserved ids have
//! defined sizes, so a decoder can skip a check it cannot verify; whether
//! skipping is allowed is the caller's profile decision.

use ferropack_core::crc::{Crc32, Crc64};
use sha2::{Digest, Sha256};

/// The check type declared in the stream flags.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CheckType {
    /// No check.
    None,
    /// CRC-32.
    Crc32,
    /// CRC-64/ECMA-182.
    Crc64,
    /// SHA-256.
    Sha256,
    /// A reserved id with a defined size that this build cannot verify.
    Unsupported(u8),
}

impl CheckType {
    /// Decode a check id (the low nibble of the second stream-flag byte).
    /// Returns `None` for ids outside the defined range.
    pub fn from_id(id: u8) -> Option<Self> {
        match id {
            0x00 => Some(Self::None),
            0x01 => Some(Self::Crc32),
            0x04 => Some(Self::Crc64),
            0x0A => Some(Self::Sha256),
            0x02..=0x0F => Some(Self::Unsupported(id)),
            _ => None,
        }
    }

    /// The id encoded in the stream flags.
    pub fn id(self) -> u8 {
        match self {
            Self::None => 0x00,
            Self::Crc32 => 0x01,
            Self::Crc64 => 0x04,
            Self::Sha256 => 0x0A,
            Self::Unsupported(id) => id,
        }
    }

    /// Size in bytes of the stored check field.
    ///
    /// The format defines sizes for every id, including reserved ones:
    /// 0, then 4/4/4, 8/8/8, 16/16/16, 32/32/32, 64/64/64.
    pub fn size(self) -> usize {
        match self.id() {
            0x00 => 0,
            0x01..=0x03 => 4,
            0x04..=0x06 => 8,
            0x07..=0x09 => 16,
            0x0A..=0x0C => 32,
            _ => 64,
        }
    }

    /// The display name used in reports.
    pub fn name(self) -> &'static str {
        match self {
            Self::None => "none",
            Self::Crc32 => "crc32",
            Self::Crc64 => "crc64",
            Self::Sha256 => "sha256",
            Self::Unsupported(_) => "unsupported",
        }
    }
}

/// A running check accumulator for one block's uncompressed data.
#[derive(Clone)]
pub enum CheckState {
    /// No check is computed.
    None,
    /// CRC-32 accumulator.
    Crc32(Crc32),
    /// CRC-64 accumulator.
    Crc64(Crc64),
    /// SHA-256 accumulator.
    Sha256(Box<Sha256>),
    /// The stored bytes are skipped without verification.
    Skip,
}

impl CheckState {
    /// Create an accumulator for the given type.
    pub fn new(check: CheckType) -> Self {
        match check {
            CheckType::None => Self::None,
            CheckType::Crc32 => Self::Crc32(Crc32::new()),
            CheckType::Crc64 => Self::Crc64(Crc64::new()),
            CheckType::Sha256 => Self::Sha256(Box::new(Sha256::new())),
            CheckType::Unsupported(_) => Self::Skip,
        }
    }

    /// Feed uncompressed block data.
    pub fn update(&mut self, data: &[u8]) {
        match self {
            Self::None | Self::Skip => {}
            Self::Crc32(crc) => crc.update(data),
            Self::Crc64(crc) => crc.update(data),
            Self::Sha256(sha) => sha.update(data),
        }
    }

    /// Compare against the stored check bytes. Returns `true` on match; an
    /// unverifiable check always matches (the caller decides whether skipping
    /// was allowed in the first place).
    pub fn verify(self, stored: &[u8]) -> bool {
        match self {
            Self::None | Self::Skip => true,
            Self::Crc32(crc) => stored == crc.finalize().to_le_bytes(),
            Self::Crc64(crc) => stored == crc.finalize().to_le_bytes(),
            Self::Sha256(sha) => stored == sha.finalize().as_slice(),
        }
    }
}
