//! LZMA2 chunk decoding.
//!
//! LZMA2 frames LZMA in chunks whose control byte selects end-of-stream,
//! an uncompressed run, or a range-coded chunk with state/props/dictionary
//! reset flags. The dictionary survives across chunks and is the single
//! source of truth for match copies.

use crate::lzma::{
    LzmaModel, LzmaProperties, LzmaState, DIST_ALIGN_BITS, END_POS_MODEL_INDEX, LEN_LOW_BITS,
    LEN_MID_BITS, LEN_HIGH_BITS, MATCH_LEN_MIN,
};
use crate::range::RangeDecoder;
use ferropack_core::cancel::CancelToken;
use ferropack_core::error::{ArchiveError, ErrorCode, Result};

/// Derive the dictionary size from the LZMA2 properties byte.
///
/// `(2 | (bits & 1)) << (bits / 2 + 11)` for `bits < 40`; 40 means 4 GiB - 1.
/// Values above 40 are invalid.
pub fn dict_size_from_props(bits: u8) -> Option<u32> {
    match bits {
        0..=39 => {
            let base = 2u32 | u32::from(bits & 1);
            Some(base << ((bits >> 1) + 11))
        }
        40 => Some(0xFFFF_FFFF),
        _ => None,
    }
}

fn bad_data(message: impl Into<String>) -> ArchiveError {
    ArchiveError::structural(ErrorCode::CompressionXzBadData, message.into())
}

/// Sliding history window.
///
/// Grows on demand up to twice the declared dictionary size, then compacts
/// back down to one dictionary size, so match distances stay valid without a
/// preallocated ring buffer.
#[derive(Debug)]
struct History {
    buf: Vec<u8>,
    dict_size: usize,
    /// Total bytes produced since the last dictionary reset.
    total: u64,
}

impl History {
    fn new(dict_size: u32) -> Self {
        Self {
            buf: Vec::new(),
            dict_size: (dict_size as usize).max(4096),
            total: 0,
        }
    }

    fn reset(&mut self) {
        self.buf.clear();
        self.total = 0;
    }

    #[inline]
    fn push(&mut self, byte: u8) {
        self.buf.push(byte);
        self.total += 1;
    }

    /// The byte `dist` positions behind the most recent byte (`dist == 0` is
    /// the last byte pushed).
    #[inline]
    fn byte_back(&self, dist: usize) -> u8 {
        self.buf[self.buf.len() - 1 - dist]
    }

    /// Whether a match distance is addressable right now.
    #[inline]
    fn distance_valid(&self, dist: u32) -> bool {
        (u64::from(dist) < self.total) && ((dist as usize) < self.dict_size)
    }

    fn compact(&mut self) {
        if self.buf.len() > self.dict_size * 2 {
            let cut = self.buf.len() - self.dict_size;
            self.buf.drain(..cut);
        }
    }
}

/// Decoder for the LZMA2 layer of one XZ block.
pub struct Lzma2Decoder {
    history: History,
    props: Option<LzmaProperties>,
    model: Option<LzmaModel>,
    state: LzmaState,
    rep: [u32; 4],
    /// Uncompressed position since the last dictionary reset; drives
    /// `pos_state` and the literal position context.
    pos: u64,
    /// The first chunk of a block must reset the dictionary.
    need_dict_reset: bool,
    cancel: CancelToken,
}

impl Lzma2Decoder {
    /// Create a decoder with the block's declared dictionary size.
    pub fn new(dict_size: u32, cancel: CancelToken) -> Self {
        Self {
            history: History::new(dict_size),
            props: None,
            model: None,
            state: LzmaState::new(),
            rep: [0; 4],
            pos: 0,
            need_dict_reset: true,
            cancel,
        }
    }

    /// Decode an uncompressed chunk body.
    pub fn uncompressed_chunk(
        &mut self,
        data: &[u8],
        reset_dict: bool,
        out: &mut Vec<u8>,
    ) -> Result<()> {
        if reset_dict {
            self.reset_dictionary();
        } else if self.need_dict_reset {
            return Err(bad_data("first LZMA2 chunk must reset the dictionary"));
        }
        // An uncompressed chunk also resets the LZMA state.
        self.state = LzmaState::new();
        self.rep = [0; 4];
        self.model = None;
        for &byte in data {
            self.history.push(byte);
        }
        self.pos += data.len() as u64;
        out.extend_from_slice(data);
        self.history.compact();
        Ok(())
    }

    /// Decode one range-coded chunk.
    ///
    /// `control` carries the reset mode in bits 5..6 and the high bits of the
    /// uncompressed size; `props_byte` is present when the reset mode says so.
    pub fn lzma_chunk(
        &mut self,
        control: u8,
        props_byte: Option<u8>,
        compressed: &[u8],
        uncompressed_size: usize,
        out: &mut Vec<u8>,
    ) -> Result<()> {
        let reset_mode = (control >> 5) & 0x03;
        if let Some(byte) = props_byte {
            debug_assert!(reset_mode >= 2);
            self.props = Some(LzmaProperties::from_byte(byte).ok_or_else(|| {
                ArchiveError::unsupported(
                    ErrorCode::CompressionXzUnsupportedFilter,
                    format!("invalid LZMA properties byte 0x{byte:02X}"),
                )
            })?);
            self.model = None;
        }
        if reset_mode == 3 {
            self.reset_dictionary();
        } else if self.need_dict_reset {
            return Err(bad_data("first LZMA2 chunk must reset the dictionary"));
        }
        if reset_mode >= 1 {
            self.state = LzmaState::new();
            self.rep = [0; 4];
            self.model = self.props.map(LzmaModel::new);
        }
        let props = self
            .props
            .ok_or_else(|| bad_data("LZMA2 chunk before any properties byte"))?;
        if self.model.is_none() {
            return Err(bad_data("LZMA2 chunk reuses state that was never set"));
        }

        let mut rc = RangeDecoder::new(compressed)?;
        let start_len = out.len();
        self.decode_symbols(&mut rc, props, uncompressed_size, out)?;
        debug_assert_eq!(out.len() - start_len, uncompressed_size);
        if rc.bytes_consumed() != compressed.len() || !rc.is_finished() {
            return Err(bad_data(
                "LZMA2 chunk did not consume its declared compressed size",
            ));
        }
        self.history.compact();
        Ok(())
    }

    fn reset_dictionary(&mut self) {
        self.history.reset();
        self.pos = 0;
        self.need_dict_reset = false;
        // A dictionary reset implies a state reset as well.
        self.state = LzmaState::new();
        self.rep = [0; 4];
        self.model = None;
    }

    fn decode_symbols(
        &mut self,
        rc: &mut RangeDecoder<'_>,
        props: LzmaProperties,
        uncompressed_size: usize,
        out: &mut Vec<u8>,
    ) -> Result<()> {
        let pos_mask = props.pos_mask();
        let mut remaining = uncompressed_size;
        let mut iterations = 0u32;

        while remaining > 0 {
            iterations += 1;
            if iterations & 1023 == 0 {
                self.cancel.check()?;
            }

            let pos_state = (self.pos & pos_mask) as usize;
            let state_idx = self.state.index();
            let model = self.model.as_mut().expect("model initialized above");

            if rc.decode_bit(&mut model.is_match[state_idx][pos_state])? == 0 {
                // Literal.
                let prev_byte = if self.history.total == 0 {
                    0
                } else {
                    self.history.byte_back(0)
                };
                let context = model.literal.context(self.pos, prev_byte, props.lc, props.lp);
                let symbol = if self.state.is_literal() {
                    let mut symbol = 1usize;
                    while symbol < 0x100 {
                        let bit = rc.decode_bit(&mut model.literal.probs[context][symbol])?;
                        symbol = (symbol << 1) | bit as usize;
                    }
                    symbol
                } else {
                    if !self.history.distance_valid(self.rep[0]) {
                        return Err(bad_data("matched literal references invalid distance"));
                    }
                    let mut match_byte = usize::from(self.history.byte_back(self.rep[0] as usize));
                    let mut symbol = 1usize;
                    loop {
                        let match_bit = (match_byte >> 7) & 1;
                        match_byte = (match_byte << 1) & 0xFF;
                        let index = 0x100 + (match_bit << 8) + symbol;
                        let bit = rc.decode_bit(&mut model.literal.probs[context][index])? as usize;
                        symbol = (symbol << 1) | bit;
                        if symbol >= 0x100 {
                            break;
                        }
                        if bit != match_bit {
                            while symbol < 0x100 {
                                let bit =
                                    rc.decode_bit(&mut model.literal.probs[context][symbol])?;
                                symbol = (symbol << 1) | bit as usize;
                            }
                            break;
                        }
                    }
                    symbol
                };
                let byte = (symbol - 0x100) as u8;
                self.history.push(byte);
                out.push(byte);
                self.pos += 1;
                remaining -= 1;
                self.state.update_literal();
                continue;
            }

            // Match or rep.
            let len;
            let dist;
            if rc.decode_bit(&mut model.is_rep[state_idx])? == 0 {
                // New match: length then distance.
                let model = self.model.as_mut().expect("model initialized above");
                len = decode_length(rc, &mut model.match_len, pos_state)?;
                let len_state = (len - MATCH_LEN_MIN).min(3) as usize;
                let slot = rc.decode_bit_tree(&mut model.distance.slot[len_state], 6)?;
                dist = if slot < 4 {
                    slot
                } else {
                    let direct_bits = (slot >> 1) - 1;
                    let mut d = (2 | (slot & 1)) << direct_bits;
                    if (slot as usize) < END_POS_MODEL_INDEX {
                        // Reference layout: tree base at dist - slot.
                        let base = d as usize - slot as usize;
                        let add = rc.decode_bit_tree_reverse(
                            &mut model.distance.special[base..base + (1 << direct_bits)],
                            direct_bits,
                        )?;
                        d += add;
                    } else {
                        let direct = rc.decode_direct_bits(direct_bits - DIST_ALIGN_BITS)?;
                        d += direct << DIST_ALIGN_BITS;
                        d += rc
                            .decode_bit_tree_reverse(&mut model.distance.align, DIST_ALIGN_BITS)?;
                    }
                    d
                };
                if dist == 0xFFFF_FFFF {
                    // The end marker is not used inside sized LZMA2 chunks.
                    return Err(bad_data("unexpected LZMA end marker in sized chunk"));
                }
                self.rep = [dist, self.rep[0], self.rep[1], self.rep[2]];
                self.state.update_match();
            } else if rc.decode_bit(&mut model.is_rep0[state_idx])? == 0 {
                if rc.decode_bit(&mut model.is_rep0_long[state_idx][pos_state])? == 0 {
                    // Short rep: a single byte at rep0.
                    if !self.history.distance_valid(self.rep[0]) {
                        return Err(bad_data("short rep references invalid distance"));
                    }
                    let byte = self.history.byte_back(self.rep[0] as usize);
                    self.history.push(byte);
                    out.push(byte);
                    self.pos += 1;
                    remaining -= 1;
                    self.state.update_short_rep();
                    continue;
                }
                dist = self.rep[0];
                let model = self.model.as_mut().expect("model initialized above");
                len = decode_length(rc, &mut model.rep_len, pos_state)?;
                self.state.update_long_rep();
            } else {
                if rc.decode_bit(&mut model.is_rep1[state_idx])? == 0 {
                    dist = self.rep[1];
                    self.rep[1] = self.rep[0];
                } else if rc.decode_bit(&mut model.is_rep2[state_idx])? == 0 {
                    dist = self.rep[2];
                    self.rep[2] = self.rep[1];
                    self.rep[1] = self.rep[0];
                } else {
                    dist = self.rep[3];
                    self.rep[3] = self.rep[2];
                    self.rep[2] = self.rep[1];
                    self.rep[1] = self.rep[0];
                }
                self.rep[0] = dist;
                let model = self.model.as_mut().expect("model initialized above");
                len = decode_length(rc, &mut model.rep_len, pos_state)?;
                self.state.update_long_rep();
            }

            if len as usize > remaining {
                return Err(bad_data("match overruns the chunk's uncompressed size"));
            }
            if !self.history.distance_valid(dist) {
                return Err(bad_data("match distance exceeds dictionary contents"));
            }
            for _ in 0..len {
                let byte = self.history.byte_back(dist as usize);
                self.history.push(byte);
                out.push(byte);
            }
            self.pos += u64::from(len);
            remaining -= len as usize;
        }
        Ok(())
    }
}

fn decode_length(
    rc: &mut RangeDecoder<'_>,
    len_model: &mut crate::lzma::LengthModel,
    pos_state: usize,
) -> Result<u32> {
    if rc.decode_bit(&mut len_model.choice)? == 0 {
        let len = rc.decode_bit_tree(&mut len_model.low[pos_state], LEN_LOW_BITS)?;
        Ok(len + MATCH_LEN_MIN)
    } else if rc.decode_bit(&mut len_model.choice2)? == 0 {
        let len = rc.decode_bit_tree(&mut len_model.mid[pos_state], LEN_MID_BITS)?;
        Ok(len + MATCH_LEN_MIN + (1 << LEN_LOW_BITS))
    } else {
        let len = rc.decode_bit_tree(&mut len_model.high, LEN_HIGH_BITS)?;
        Ok(len + MATCH_LEN_MIN + (1 << LEN_LOW_BITS) + (1 << LEN_MID_BITS))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_dict_size_from_props() {
        assert_eq!(dict_size_from_props(0), Some(4096));
        assert_eq!(dict_size_from_props(1), Some(6144));
        assert_eq!(dict_size_from_props(2), Some(8192));
        assert_eq!(dict_size_from_props(38), Some(1 << 30));
        assert_eq!(dict_size_from_props(39), Some(3 << 29));
        assert_eq!(dict_size_from_props(40), Some(0xFFFF_FFFF));
        assert_eq!(dict_size_from_props(41), None);
    }

    #[test]
    fn test_uncompressed_chunks_flow_through_dictionary() {
        let mut dec = Lzma2Decoder::new(1 << 16, CancelToken::new());
        let mut out = Vec::new();
        dec.uncompressed_chunk(b"hello ", true, &mut out).unwrap();
        dec.uncompressed_chunk(b"world", false, &mut out).unwrap();
        assert_eq!(out, b"hello world");
    }

    #[test]
    fn test_first_chunk_must_reset_dictionary() {
        let mut dec = Lzma2Decoder::new(1 << 16, CancelToken::new());
        let mut out = Vec::new();
        assert!(dec.uncompressed_chunk(b"x", false, &mut out).is_err());
    }

    #[test]
    fn test_history_compaction_keeps_distances() {
        let mut history = History::new(4096);
        for i in 0..20000u32 {
            history.push(i as u8);
        }
        history.compact();
        // Last byte is (19999 % 256).
        assert_eq!(history.byte_back(0), (19999 % 256) as u8);
        assert!(history.distance_valid(4095));
        assert!(!history.distance_valid(4096));
    }
}
