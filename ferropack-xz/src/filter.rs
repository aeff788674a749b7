//! Non-last XZ filters: Delta and the BCJ branch converters.
//!
//! Filters are length-preserving byte transforms that sit between LZMA2 and
//! the block's uncompressed data. Each keeps whatever trailing bytes it could
//! not yet transform (branch instructions need a few bytes of lookahead) and
//! carries its state across chunks within a block; output is therefore
//! identical regardless of how the input was chunked.

use ferropack_core::error::{ArchiveError, ErrorCode, Result};

/// Filter id for Delta.
pub const FILTER_DELTA: u64 = 0x03;
/// Filter id for BCJ x86.
pub const FILTER_X86: u64 = 0x04;
/// Filter id for BCJ PowerPC.
pub const FILTER_POWERPC: u64 = 0x05;
/// Filter id for BCJ IA-64.
pub const FILTER_IA64: u64 = 0x06;
/// Filter id for BCJ ARM.
pub const FILTER_ARM: u64 = 0x07;
/// Filter id for BCJ ARM Thumb.
pub const FILTER_ARM_THUMB: u64 = 0x08;
/// Filter id for BCJ SPARC.
pub const FILTER_SPARC: u64 = 0x09;
/// Filter id for BCJ ARM64.
pub const FILTER_ARM64: u64 = 0x0A;
/// Filter id for LZMA2 (always the last filter).
pub const FILTER_LZMA2: u64 = 0x21;

fn unsupported(message: impl Into<String>) -> ArchiveError {
    ArchiveError::unsupported(ErrorCode::CompressionXzUnsupportedFilter, message.into())
}

/// Delta filter decoder.
///
/// Adds the byte `distance` positions back to each input byte. History is
/// zero-initialized and block-scoped.
#[derive(Debug, Clone)]
pub struct DeltaFilter {
    distance: usize,
    history: [u8; 256],
    pos: usize,
}

impl DeltaFilter {
    /// Create from the one-byte property (`distance - 1`).
    pub fn new(props: &[u8]) -> Result<Self> {
        if props.len() != 1 {
            return Err(unsupported("delta filter requires exactly one property byte"));
        }
        Ok(Self {
            distance: usize::from(props[0]) + 1,
            history: [0u8; 256],
            pos: 0,
        })
    }

    /// Decode a chunk in place.
    pub fn feed(&mut self, data: &mut [u8]) {
        for byte in data.iter_mut() {
            let prev = self.history[self.pos];
            *byte = byte.wrapping_add(prev);
            self.history[self.pos] = *byte;
            self.pos = (self.pos + 1) % self.distance;
        }
    }
}

/// BCJ filter variants.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BcjKind {
    /// x86 call/jmp rewriting with the previous-mask history table.
    X86,
    /// PowerPC branch-and-link.
    PowerPc,
    /// IA-64 branch bundles.
    Ia64,
    /// ARM BL.
    Arm,
    /// ARM Thumb BL pairs.
    ArmThumb,
    /// SPARC CALL.
    Sparc,
    /// ARM64 BL and ADRP.
    Arm64,
}

impl BcjKind {
    /// Map a filter id.
    pub fn from_id(id: u64) -> Option<Self> {
        match id {
            FILTER_X86 => Some(Self::X86),
            FILTER_POWERPC => Some(Self::PowerPc),
            FILTER_IA64 => Some(Self::Ia64),
            FILTER_ARM => Some(Self::Arm),
            FILTER_ARM_THUMB => Some(Self::ArmThumb),
            FILTER_SPARC => Some(Self::Sparc),
            FILTER_ARM64 => Some(Self::Arm64),
            _ => None,
        }
    }

    /// The instruction alignment, which the start offset must honor.
    pub fn alignment(self) -> u32 {
        match self {
            Self::X86 => 1,
            Self::ArmThumb => 2,
            Self::PowerPc | Self::Arm | Self::Sparc | Self::Arm64 => 4,
            Self::Ia64 => 16,
        }
    }
}

// x86 previous-mask tables from the XZ format specification.
const X86_ALLOWED_STATUS: [bool; 8] = [true, true, true, false, true, false, false, false];
const X86_MASK_TO_BIT: [u32; 8] = [0, 1, 2, 2, 3, 3, 3, 3];

#[inline]
fn x86_msbyte_set(byte: u8) -> bool {
    byte == 0x00 || byte == 0xFF
}

/// A BCJ branch-converter decoder.
///
/// `pos` is the uncompressed stream position of the first pending byte; the
/// caller seeds it with the filter's start offset plus the bytes already
/// emitted in the surrounding stream.
#[derive(Debug, Clone)]
pub struct BcjFilter {
    kind: BcjKind,
    pos: u32,
    x86_prev_mask: u32,
    pending: Vec<u8>,
}

impl BcjFilter {
    /// Create a decoder. `props` is empty or a 4-byte little-endian start
    /// offset that must be a multiple of the filter's alignment.
    pub fn new(kind: BcjKind, props: &[u8], stream_pos: u32) -> Result<Self> {
        let start_offset = match props.len() {
            0 => 0,
            4 => u32::from_le_bytes([props[0], props[1], props[2], props[3]]),
            _ => {
                return Err(unsupported(
                    "BCJ filter properties must be empty or a 4-byte start offset",
                ))
            }
        };
        if start_offset % kind.alignment() != 0 {
            return Err(unsupported(format!(
                "BCJ start offset {start_offset} is not a multiple of {}",
                kind.alignment()
            )));
        }
        Ok(Self {
            kind,
            pos: start_offset.wrapping_add(stream_pos),
            x86_prev_mask: 0,
            pending: Vec::new(),
        })
    }

    /// Feed decoded LZMA2 bytes; transformed bytes are appended to `out` and
    /// at most a small lookahead tail is retained.
    pub fn feed(&mut self, data: &[u8], out: &mut Vec<u8>) {
        self.pending.extend_from_slice(data);
        let processed = self.apply();
        out.extend_from_slice(&self.pending[..processed]);
        self.pending.drain(..processed);
        self.pos = self.pos.wrapping_add(processed as u32);
    }

    /// Emit the untransformable tail at end of block.
    pub fn flush(&mut self, out: &mut Vec<u8>) {
        out.append(&mut self.pending);
    }

    fn apply(&mut self) -> usize {
        match self.kind {
            BcjKind::X86 => self.apply_x86(),
            BcjKind::PowerPc => self.apply_powerpc(),
            BcjKind::Ia64 => self.apply_ia64(),
            BcjKind::Arm => self.apply_arm(),
            BcjKind::ArmThumb => self.apply_armthumb(),
            BcjKind::Sparc => self.apply_sparc(),
            BcjKind::Arm64 => self.apply_arm64(),
        }
    }

    fn apply_x86(&mut self) -> usize {
        let buf = &mut self.pending;
        if buf.len() <= 4 {
            return 0;
        }
        let size = buf.len() - 4;
        let mut prev_mask = self.x86_prev_mask;
        // Position of the previous 0xE8/0xE9, one before the buffer start
        // initially so the mask from the previous call stays meaningful.
        let mut prev_pos: i64 = -1;
        let mut i = 0usize;

        while i < size {
            if buf[i] & 0xFE != 0xE8 {
                i += 1;
                continue;
            }
            let distance = i as i64 - prev_pos;
            if distance > 3 {
                prev_mask = 0;
            } else {
                prev_mask = (prev_mask << (distance - 1)) & 7;
                if prev_mask != 0 {
                    let byte = buf[i + 4 - X86_MASK_TO_BIT[prev_mask as usize] as usize];
                    if !X86_ALLOWED_STATUS[prev_mask as usize] || x86_msbyte_set(byte) {
                        prev_pos = i as i64;
                        prev_mask = (prev_mask << 1) | 1;
                        i += 1;
                        continue;
                    }
                }
            }
            prev_pos = i as i64;

            if x86_msbyte_set(buf[i + 4]) {
                let mut src =
                    u32::from_le_bytes([buf[i + 1], buf[i + 2], buf[i + 3], buf[i + 4]]);
                let mut dest;
                loop {
                    dest = src.wrapping_sub(self.pos.wrapping_add(i as u32).wrapping_add(5));
                    if prev_mask == 0 {
                        break;
                    }
                    let shift = X86_MASK_TO_BIT[prev_mask as usize] * 8;
                    let byte = (dest >> (24 - shift)) as u8;
                    if !x86_msbyte_set(byte) {
                        break;
                    }
                    src = dest ^ ((1u32 << (32 - shift)) - 1);
                }
                dest &= 0x01FF_FFFF;
                if dest & 0x0100_0000 != 0 {
                    dest |= 0xFE00_0000;
                }
                buf[i + 1..i + 5].copy_from_slice(&dest.to_le_bytes());
                i += 5;
            } else {
                prev_mask = (prev_mask << 1) | 1;
                i += 1;
            }
        }

        let distance = i as i64 - prev_pos;
        self.x86_prev_mask = if distance > 3 {
            0
        } else {
            (prev_mask << (distance - 1)) & 7
        };
        i
    }

    fn apply_powerpc(&mut self) -> usize {
        let buf = &mut self.pending;
        let mut i = 0usize;
        while i + 4 <= buf.len() {
            let mut instr = u32::from_be_bytes([buf[i], buf[i + 1], buf[i + 2], buf[i + 3]]);
            if instr & 0xFC00_0003 == 0x4800_0001 {
                let addr = (instr & 0x03FF_FFFC)
                    .wrapping_sub(self.pos.wrapping_add(i as u32))
                    & 0x03FF_FFFC;
                instr = 0x4800_0001 | addr;
                buf[i..i + 4].copy_from_slice(&instr.to_be_bytes());
            }
            i += 4;
        }
        i
    }

    fn apply_ia64(&mut self) -> usize {
        const BRANCH_TABLE: [u8; 32] = [
            0, 0, 0, 0, 0, 0, 0, 0, 0, 0, 0, 0, 0, 0, 0, 0, 4, 4, 6, 6, 0, 0, 7, 7, 4, 4, 0, 0,
            4, 4, 0, 0,
        ];
        let buf = &mut self.pending;
        let mut i = 0usize;
        while i + 16 <= buf.len() {
            let mask = BRANCH_TABLE[usize::from(buf[i] & 0x1F)];
            for slot in 0..3usize {
                if (mask >> slot) & 1 == 0 {
                    continue;
                }
                let bit_pos = 5 + slot * 41;
                let byte_pos = bit_pos >> 3;
                let bit_res = (bit_pos & 7) as u32;
                let mut instr = 0u64;
                for j in 0..6 {
                    instr |= u64::from(buf[i + j + byte_pos]) << (8 * j);
                }
                let mut norm = instr >> bit_res;
                if (norm >> 37) & 0x0F == 0x05 && (norm >> 9) & 0x3FFFF == 0 {
                    let mut addr = ((norm >> 13) & 0x0F_FFFF) as u32;
                    addr |= (((norm >> 36) & 1) as u32) << 20;
                    addr <<= 4;
                    addr = addr.wrapping_sub(self.pos.wrapping_add(i as u32));
                    addr >>= 4;
                    norm &= !(0x8F_FFFFu64 << 13);
                    norm |= u64::from(addr & 0x0F_FFFF) << 13;
                    norm |= u64::from(addr & 0x10_0000) << (36 - 20);
                    instr &= (1 << bit_res) - 1;
                    instr |= norm << bit_res;
                    for j in 0..6 {
                        buf[i + j + byte_pos] = (instr >> (8 * j)) as u8;
                    }
                }
            }
            i += 16;
        }
        i
    }

    fn apply_arm(&mut self) -> usize {
        let buf = &mut self.pending;
        let mut i = 0usize;
        while i + 4 <= buf.len() {
            if buf[i + 3] == 0xEB {
                let mut addr = u32::from(buf[i])
                    | (u32::from(buf[i + 1]) << 8)
                    | (u32::from(buf[i + 2]) << 16);
                addr <<= 2;
                addr = addr.wrapping_sub(self.pos.wrapping_add(i as u32).wrapping_add(8));
                addr >>= 2;
                buf[i] = addr as u8;
                buf[i + 1] = (addr >> 8) as u8;
                buf[i + 2] = (addr >> 16) as u8;
            }
            i += 4;
        }
        i
    }

    fn apply_armthumb(&mut self) -> usize {
        let buf = &mut self.pending;
        let mut i = 0usize;
        while i + 4 <= buf.len() {
            if buf[i + 1] & 0xF8 == 0xF0 && buf[i + 3] & 0xF8 == 0xF8 {
                let mut addr = (u32::from(buf[i + 1] & 0x07) << 19)
                    | (u32::from(buf[i]) << 11)
                    | (u32::from(buf[i + 3] & 0x07) << 8)
                    | u32::from(buf[i + 2]);
                addr <<= 1;
                addr = addr.wrapping_sub(self.pos.wrapping_add(i as u32).wrapping_add(4));
                addr >>= 1;
                buf[i + 1] = 0xF0 | ((addr >> 19) & 0x07) as u8;
                buf[i] = (addr >> 11) as u8;
                buf[i + 3] = 0xF8 | ((addr >> 8) & 0x07) as u8;
                buf[i + 2] = addr as u8;
                i += 2;
            }
            i += 2;
        }
        // Keep 2-byte alignment for the retained tail.
        i.min(buf.len())
    }

    fn apply_sparc(&mut self) -> usize {
        let buf = &mut self.pending;
        let mut i = 0usize;
        while i + 4 <= buf.len() {
            let mut instr = u32::from_be_bytes([buf[i], buf[i + 1], buf[i + 2], buf[i + 3]]);
            if instr >> 22 == 0x100 || instr >> 22 == 0x1FF {
                instr <<= 2;
                instr = instr.wrapping_sub(self.pos.wrapping_add(i as u32));
                instr >>= 2;
                instr = (0x4000_0000u32.wrapping_sub(instr & 0x40_0000))
                    | 0x4000_0000
                    | (instr & 0x3F_FFFF);
                buf[i..i + 4].copy_from_slice(&instr.to_be_bytes());
            }
            i += 4;
        }
        i
    }

    fn apply_arm64(&mut self) -> usize {
        let buf = &mut self.pending;
        let mut i = 0usize;
        while i + 4 <= buf.len() {
            let pc = self.pos.wrapping_add(i as u32);
            let instr = u32::from_le_bytes([buf[i], buf[i + 1], buf[i + 2], buf[i + 3]]);
            if instr >> 26 == 0x25 {
                // BL: 26-bit immediate, PC-relative in words.
                let src = instr;
                let neg_pc = 0u32.wrapping_sub(pc >> 2);
                let out = 0x9400_0000 | (src.wrapping_add(neg_pc) & 0x03FF_FFFF);
                buf[i..i + 4].copy_from_slice(&out.to_le_bytes());
            } else if instr & 0x9F00_0000 == 0x9000_0000 {
                // ADRP: only +/-512 MiB immediates are converted.
                let src = ((instr >> 29) & 3) | ((instr >> 3) & 0x001F_FFFC);
                if (src.wrapping_add(0x0002_0000)) & 0x001C_0000 == 0 {
                    let neg_pc = 0u32.wrapping_sub(pc >> 12);
                    let dest = src.wrapping_add(neg_pc);
                    let mut out = instr & 0x9000_001F;
                    out |= (dest & 3) << 29;
                    out |= (dest & 0x0003_FFFC) << 3;
                    out |= 0u32.wrapping_sub(dest & 0x0002_0000) & 0x00E0_0000;
                    buf[i..i + 4].copy_from_slice(&out.to_le_bytes());
                }
            }
            i += 4;
        }
        i
    }
}

/// One configured filter stage.
#[derive(Debug, Clone)]
pub enum FilterStage {
    /// Delta decoder.
    Delta(DeltaFilter),
    /// BCJ branch converter.
    Bcj(BcjFilter),
}

impl FilterStage {
    /// Feed bytes through the stage.
    pub fn feed(&mut self, data: &[u8], out: &mut Vec<u8>) {
        match self {
            Self::Delta(filter) => {
                let start = out.len();
                out.extend_from_slice(data);
                filter.feed(&mut out[start..]);
            }
            Self::Bcj(filter) => filter.feed(data, out),
        }
    }

    /// Flush retained bytes at end of block.
    pub fn flush(&mut self, out: &mut Vec<u8>) {
        match self {
            Self::Delta(_) => {}
            Self::Bcj(filter) => filter.flush(out),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn feed_in_chunks(kind: BcjKind, data: &[u8], chunk: usize) -> Vec<u8> {
        let mut filter = BcjFilter::new(kind, &[], 0).unwrap();
        let mut out = Vec::new();
        for piece in data.chunks(chunk.max(1)) {
            filter.feed(piece, &mut out);
        }
        filter.flush(&mut out);
        out
    }

    #[test]
    fn test_delta_decode_inverts_encode() {
        // Delta encode with distance 1 is a difference chain.
        let original: Vec<u8> = (0u16..600).map(|v| (v % 251) as u8).collect();
        let mut encoded = Vec::with_capacity(original.len());
        let mut prev = 0u8;
        for &byte in &original {
            encoded.push(byte.wrapping_sub(prev));
            prev = byte;
        }

        let mut filter = DeltaFilter::new(&[0]).unwrap();
        let mut decoded = encoded.clone();
        filter.feed(&mut decoded);
        assert_eq!(decoded, original);
    }

    #[test]
    fn test_delta_state_carries_across_chunks() {
        let original: Vec<u8> = (0u16..300).map(|v| (v * 7 % 256) as u8).collect();
        let mut encoded = Vec::with_capacity(original.len());
        for (i, &byte) in original.iter().enumerate() {
            let prev = if i >= 4 { original[i - 4] } else { 0 };
            encoded.push(byte.wrapping_sub(prev));
        }

        let mut filter = DeltaFilter::new(&[3]).unwrap();
        let mut decoded = Vec::new();
        for piece in encoded.chunks(7) {
            let start = decoded.len();
            decoded.extend_from_slice(piece);
            filter.feed(&mut decoded[start..]);
        }
        assert_eq!(decoded, original);
    }

    #[test]
    fn test_delta_props_validation() {
        assert!(DeltaFilter::new(&[]).is_err());
        assert!(DeltaFilter::new(&[0, 0]).is_err());
        assert!(DeltaFilter::new(&[255]).is_ok());
    }

    #[test]
    fn test_bcj_start_offset_alignment() {
        assert!(BcjFilter::new(BcjKind::Arm, &4u32.to_le_bytes(), 0).is_ok());
        assert!(BcjFilter::new(BcjKind::Arm, &2u32.to_le_bytes(), 0).is_err());
        assert!(BcjFilter::new(BcjKind::Ia64, &16u32.to_le_bytes(), 0).is_ok());
        assert!(BcjFilter::new(BcjKind::X86, &1u32.to_le_bytes(), 0).is_ok());
        assert!(BcjFilter::new(BcjKind::X86, &[1, 2, 3], 0).is_err());
    }

    #[test]
    fn test_x86_identity_on_plain_data() {
        // No 0xE8/0xE9 opcodes: the filter must pass data through untouched.
        let data: Vec<u8> = (0u16..512).map(|v| (v % 0xE0) as u8).collect();
        let out = feed_in_chunks(BcjKind::X86, &data, 512);
        assert_eq!(out, data);
    }

    #[test]
    fn test_bcj_chunking_invariance() {
        // Data peppered with branch-looking bytes; every chunking must give
        // identical output for every architecture.
        let mut data = Vec::new();
        for i in 0u32..600 {
            match i % 9 {
                0 => data.push(0xE8),
                1 => data.push(0x00),
                2 => data.push(0xEB),
                3 => data.push(0xFF),
                4 => data.push(0x94),
                _ => data.push((i * 37 % 256) as u8),
            }
        }
        for kind in [
            BcjKind::X86,
            BcjKind::PowerPc,
            BcjKind::Ia64,
            BcjKind::Arm,
            BcjKind::ArmThumb,
            BcjKind::Sparc,
            BcjKind::Arm64,
        ] {
            let whole = feed_in_chunks(kind, &data, data.len());
            for chunk in [1usize, 2, 3, 5, 16, 17, 100] {
                let pieces = feed_in_chunks(kind, &data, chunk);
                assert_eq!(pieces, whole, "{kind:?} differs for chunk size {chunk}");
            }
            assert_eq!(whole.len(), data.len(), "{kind:?} changed the length");
        }
    }

    #[test]
    fn test_arm_bl_rewrite_is_position_dependent() {
        // One BL instruction at offset 0 and the same at offset 4 must decode
        // to different immediates.
        let instr = [0x10, 0x00, 0x00, 0xEB, 0x10, 0x00, 0x00, 0xEB];
        let out = feed_in_chunks(BcjKind::Arm, &instr, 8);
        assert_eq!(out.len(), 8);
        let first = u32::from(out[0]) | (u32::from(out[1]) << 8) | (u32::from(out[2]) << 16);
        let second = u32::from(out[4]) | (u32::from(out[5]) << 8) | (u32::from(out[6]) << 16);
        assert_ne!(first, second);
    }
}
