//! Incremental XZ stream decoder.
//!
//! A push machine: callers feed arbitrary input chunks with [`XzDecoder::update`]
//! and terminate with [`XzDecoder::finish`]. The decoder buffers at most one
//! structural unit (header, LZMA2 chunk, footer) of unconsumed input; needing
//! more than the configured ceiling for a single transition is an error, so
//! memory stays bounded no matter how hostile the input. Concatenated streams
//! and 4-byte NUL stream padding are accepted.

use crate::block::BlockHeader;
use crate::check::{CheckState, CheckType};
use crate::filter::FilterStage;
use crate::index::{IndexParser, IndexRecord};
use crate::lzma2::Lzma2Decoder;
use ferropack_core::cancel::CancelToken;
use ferropack_core::crc::Crc32;
use ferropack_core::error::{ArchiveError, ErrorCode, Result};
use ferropack_core::limits::{Profile, ResourceLimits};
use ferropack_core::progress::{ProgressCallback, ProgressKind, ProgressTap};

/// XZ stream header magic.
pub const XZ_MAGIC: [u8; 6] = [0xFD, 0x37, 0x7A, 0x58, 0x5A, 0x00];

/// XZ stream footer magic.
pub const XZ_FOOTER_MAGIC: [u8; 2] = [0x59, 0x5A];

/// Ratio enforcement starts only after this much output, so tiny
/// highly-compressible inputs do not trip the bomb guard.
const RATIO_FLOOR: u64 = 1 << 20;

fn bad(message: impl Into<String>) -> ArchiveError {
    ArchiveError::structural(ErrorCode::CompressionXzBadData, message.into())
}

fn truncated(message: impl Into<String>) -> ArchiveError {
    ArchiveError::structural(ErrorCode::CompressionXzTruncated, message.into())
}

/// Decoded stream flags.
#[derive(Debug, Clone, Copy)]
pub struct StreamFlags {
    /// The stream's check type.
    pub check: CheckType,
    /// The raw two flag bytes, compared byte-identical against the footer.
    pub raw: [u8; 2],
}

impl StreamFlags {
    /// Decode the two flag bytes.
    pub fn decode(raw: [u8; 2]) -> Result<Self> {
        if raw[0] != 0x00 || raw[1] & 0xF0 != 0 {
            return Err(bad("reserved stream flag bits are set"));
        }
        let check = CheckType::from_id(raw[1] & 0x0F).expect("low nibble is always defined");
        Ok(Self { check, raw })
    }
}

/// Decoder configuration.
#[derive(Debug, Clone, Default)]
pub struct XzOptions {
    /// Resource ceilings.
    pub limits: ResourceLimits,
    /// Strictness profile; `compat` skips unverifiable checks with a warning.
    pub profile: Profile,
    /// Cooperative cancellation token.
    pub cancel: CancelToken,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum State {
    StreamHeader,
    BlockOrIndex,
    BlockHeader { size: usize },
    BlockData,
    BlockPadding { need: usize },
    BlockCheck,
    Index,
    Footer,
    StreamPadding,
    Finished,
}

struct BlockProgress {
    header: BlockHeader,
    lzma2: Lzma2Decoder,
    stages: Vec<FilterStage>,
    /// LZMA2 stream bytes consumed, terminator included.
    compressed: u64,
    /// Sum of chunk uncompressed sizes (filters preserve length).
    uncompressed: u64,
    check: CheckState,
}

/// Streaming XZ decoder.
pub struct XzDecoder {
    limits: ResourceLimits,
    profile: Profile,
    cancel: CancelToken,
    progress: ProgressTap<'static>,

    buf: Vec<u8>,
    start: usize,
    finished_input: bool,

    state: State,
    flags: Option<StreamFlags>,
    block: Option<BlockProgress>,
    index: Option<IndexParser>,
    /// Records reconstructed from decoded blocks of the current stream.
    records: Vec<IndexRecord>,
    /// Encoded size of the most recently parsed index.
    index_size: u64,
    /// Cumulative records across concatenated streams.
    total_records: u64,
    /// Uncompressed bytes emitted in the current stream (seeds BCJ filters).
    stream_out: u64,
    streams_completed: u64,
    had_padding: bool,
    total_in: u64,
    total_out: u64,
}

impl XzDecoder {
    /// Create a decoder with the given options.
    pub fn new(options: XzOptions) -> Self {
        Self::with_progress(options, None)
    }

    /// Create a decoder that reports progress after every decoded chunk.
    pub fn with_progress(
        options: XzOptions,
        progress: Option<ProgressCallback<'static>>,
    ) -> Self {
        Self {
            limits: options.limits,
            profile: options.profile,
            cancel: options.cancel,
            progress: ProgressTap::new(ProgressKind::Decompress, progress),
            buf: Vec::new(),
            start: 0,
            finished_input: false,
            state: State::StreamHeader,
            flags: None,
            block: None,
            index: None,
            records: Vec::new(),
            index_size: 0,
            total_records: 0,
            stream_out: 0,
            streams_completed: 0,
            had_padding: false,
            total_in: 0,
            total_out: 0,
        }
    }

    /// Feed more input, appending any decoded bytes to `out`.
    pub fn update(&mut self, input: &[u8], out: &mut Vec<u8>) -> Result<()> {
        debug_assert!(!self.finished_input, "update after finish");
        if self.start > 0 && self.start >= self.buf.len() / 2 && self.start >= 4096 {
            self.buf.drain(..self.start);
            self.start = 0;
        }
        self.buf.extend_from_slice(input);
        self.run(out)
    }

    /// Signal end of input and drain any remaining output.
    pub fn finish(&mut self, out: &mut Vec<u8>) -> Result<()> {
        self.finished_input = true;
        self.run(out)?;
        if self.state != State::Finished {
            return Err(truncated("input ended inside an XZ stream"));
        }
        Ok(())
    }

    /// Whether the final footer (and padding) has been fully consumed.
    pub fn is_finished(&self) -> bool {
        self.state == State::Finished
    }

    /// Total uncompressed bytes produced so far.
    pub fn total_out(&self) -> u64 {
        self.total_out
    }

    /// Number of completely decoded streams.
    pub fn streams_completed(&self) -> u64 {
        self.streams_completed
    }

    /// Whether any inter-stream NUL padding was seen.
    pub fn had_padding(&self) -> bool {
        self.had_padding
    }

    fn buffered(&self) -> usize {
        self.buf.len() - self.start
    }

    /// Whether `n` unconsumed bytes are available. A transition that needs
    /// more than the buffered-input ceiling is a hard error regardless of
    /// how much the caller has pushed; waiting at end of input is a
    /// truncation error.
    fn ensure(&mut self, n: usize) -> Result<bool> {
        if n as u64 > self.limits.max_xz_buffered_input_bytes {
            return Err(ArchiveError::limit(
                ErrorCode::CompressionXzBufferLimit,
                format!(
                    "decoder transition needs {n} buffered bytes, limit is {}",
                    self.limits.max_xz_buffered_input_bytes
                ),
            )
            .with_context("requiredBufferedInputBytes", n.to_string())
            .with_context(
                "limitBufferedInputBytes",
                self.limits.max_xz_buffered_input_bytes.to_string(),
            ));
        }
        if self.buffered() >= n {
            return Ok(true);
        }
        if self.finished_input {
            return Err(truncated(format!(
                "input ended while {n} more bytes were required"
            )));
        }
        Ok(false)
    }

    fn consume(&mut self, n: usize) {
        self.start += n;
        self.total_in += n as u64;
    }

    fn run(&mut self, out: &mut Vec<u8>) -> Result<()> {
        loop {
            self.cancel.check()?;
            let progressed = match self.state {
                State::StreamHeader => self.step_stream_header()?,
                State::BlockOrIndex => self.step_block_or_index()?,
                State::BlockHeader { size } => self.step_block_header(size)?,
                State::BlockData => self.step_block_data(out)?,
                State::BlockPadding { need } => self.step_block_padding(need)?,
                State::BlockCheck => self.step_block_check()?,
                State::Index => self.step_index()?,
                State::Footer => self.step_footer()?,
                State::StreamPadding => self.step_stream_padding()?,
                State::Finished => false,
            };
            if !progressed {
                return Ok(());
            }
        }
    }

    fn step_stream_header(&mut self) -> Result<bool> {
        if !self.ensure(12)? {
            return Ok(false);
        }
        let header = &self.buf[self.start..self.start + 12];
        if header[..6] != XZ_MAGIC {
            return Err(bad("not an XZ stream: bad magic bytes"));
        }
        let flags = StreamFlags::decode([header[6], header[7]])?;
        let stored = u32::from_le_bytes([header[8], header[9], header[10], header[11]]);
        let computed = Crc32::compute(&header[6..8]);
        if stored != computed {
            return Err(ArchiveError::integrity(
                ErrorCode::CompressionXzBadData,
                "stream header CRC32 mismatch",
            ));
        }
        if let CheckType::Unsupported(id) = flags.check {
            if !self
                .profile
                .downgrades(ErrorCode::CompressionXzUnsupportedCheck)
            {
                return Err(ArchiveError::unsupported(
                    ErrorCode::CompressionXzUnsupportedCheck,
                    format!("stream uses unsupported check id 0x{id:02X}"),
                )
                .with_context("checkId", id.to_string()));
            }
            log::warn!("skipping unsupported XZ check id 0x{id:02X} (compat profile)");
        }
        self.flags = Some(flags);
        self.records.clear();
        self.stream_out = 0;
        self.consume(12);
        self.state = State::BlockOrIndex;
        Ok(true)
    }

    fn step_block_or_index(&mut self) -> Result<bool> {
        if !self.ensure(1)? {
            return Ok(false);
        }
        let first = self.buf[self.start];
        if first == 0x00 {
            self.index = Some(IndexParser::new(self.total_records));
            self.state = State::Index;
        } else {
            self.state = State::BlockHeader {
                size: (usize::from(first) + 1) * 4,
            };
        }
        Ok(true)
    }

    fn step_block_header(&mut self, size: usize) -> Result<bool> {
        if !self.ensure(size)? {
            return Ok(false);
        }
        let header = BlockHeader::parse(&self.buf[self.start..self.start + size])?;
        if u64::from(header.dict_size) > self.limits.max_dictionary_bytes {
            return Err(ArchiveError::resource_limit(
                "DictionaryBytes",
                u64::from(header.dict_size),
                self.limits.max_dictionary_bytes,
            ));
        }
        let stages = header.build_stages(self.stream_out)?;
        let check = CheckState::new(self.flags.expect("flags set").check);
        let lzma2 = Lzma2Decoder::new(header.dict_size, self.cancel.clone());
        self.block = Some(BlockProgress {
            header,
            lzma2,
            stages,
            compressed: 0,
            uncompressed: 0,
            check,
        });
        self.consume(size);
        self.state = State::BlockData;
        Ok(true)
    }

    fn step_block_data(&mut self, out: &mut Vec<u8>) -> Result<bool> {
        if !self.ensure(1)? {
            return Ok(false);
        }
        let control = self.buf[self.start];

        if control == 0x00 {
            // End of the block's LZMA2 stream: flush filters, settle counts.
            let check_size = self.flags.expect("flags set").check.size() as u64;
            let tail;
            let padding;
            {
                let block = self.block.as_mut().expect("block in progress");
                block.compressed += 1;
                let mut data = Vec::new();
                for i in 0..block.stages.len() {
                    let mut next = Vec::new();
                    block.stages[i].feed(&data, &mut next);
                    block.stages[i].flush(&mut next);
                    data = next;
                }
                block.check.update(&data);
                if let Some(declared) = block.header.compressed_size {
                    if declared != block.compressed {
                        return Err(bad(format!(
                            "block compressed size mismatch: header says {declared}, got {}",
                            block.compressed
                        )));
                    }
                }
                if let Some(declared) = block.header.uncompressed_size {
                    if declared != block.uncompressed {
                        return Err(bad(format!(
                            "block uncompressed size mismatch: header says {declared}, got {}",
                            block.uncompressed
                        )));
                    }
                }
                let unpadded =
                    block.header.header_size as u64 + block.compressed + check_size;
                self.records.push(IndexRecord {
                    unpadded,
                    uncompressed: block.uncompressed,
                });
                padding = ((4 - (block.compressed % 4)) % 4) as usize;
                tail = data;
            }
            let total = self.total_records + self.records.len() as u64;
            if total > self.limits.max_xz_index_records {
                return Err(ArchiveError::resource_limit(
                    "IndexRecords",
                    total,
                    self.limits.max_xz_index_records,
                ));
            }
            self.consume(1);
            self.emit(tail, 1, out)?;
            self.state = State::BlockPadding { need: padding };
            return Ok(true);
        }

        if control == 0x01 || control == 0x02 {
            if !self.ensure(3)? {
                return Ok(false);
            }
            let size = usize::from(u16::from_be_bytes([
                self.buf[self.start + 1],
                self.buf[self.start + 2],
            ])) + 1;
            let total = 3 + size;
            if !self.ensure(total)? {
                return Ok(false);
            }
            let body = &self.buf[self.start + 3..self.start + total];
            let block = self.block.as_mut().expect("block in progress");
            let mut produced = Vec::with_capacity(size);
            block
                .lzma2
                .uncompressed_chunk(body, control == 0x01, &mut produced)?;
            let emitted = route(&mut block.stages, produced);
            block.check.update(&emitted);
            block.compressed += total as u64;
            block.uncompressed += size as u64;
            self.consume(total);
            self.emit(emitted, total as u64, out)?;
            return Ok(true);
        }

        if control < 0x80 {
            return Err(bad(format!("invalid LZMA2 control byte 0x{control:02X}")));
        }

        let reset = (control >> 5) & 0x03;
        let header_len = if reset >= 2 { 6 } else { 5 };
        if !self.ensure(header_len)? {
            return Ok(false);
        }
        let h = &self.buf[self.start..self.start + header_len];
        let out_size =
            (((usize::from(control) & 0x1F) << 16) | usize::from(u16::from_be_bytes([h[1], h[2]])))
                + 1;
        let comp_size = usize::from(u16::from_be_bytes([h[3], h[4]])) + 1;
        let props = if reset >= 2 { Some(h[5]) } else { None };
        let total = header_len + comp_size;
        if !self.ensure(total)? {
            return Ok(false);
        }
        let body = &self.buf[self.start + header_len..self.start + total];
        let block = self.block.as_mut().expect("block in progress");
        let mut produced = Vec::with_capacity(out_size);
        block
            .lzma2
            .lzma_chunk(control, props, body, out_size, &mut produced)?;
        let emitted = route(&mut block.stages, produced);
        block.check.update(&emitted);
        block.compressed += total as u64;
        block.uncompressed += out_size as u64;
        self.consume(total);
        self.emit(emitted, total as u64, out)?;
        Ok(true)
    }

    fn step_block_padding(&mut self, need: usize) -> Result<bool> {
        if !self.ensure(need)? {
            return Ok(false);
        }
        if self.buf[self.start..self.start + need].iter().any(|&b| b != 0) {
            return Err(bad("non-zero block padding"));
        }
        self.consume(need);
        self.state = State::BlockCheck;
        Ok(true)
    }

    fn step_block_check(&mut self) -> Result<bool> {
        let size = self.flags.expect("flags set").check.size();
        if !self.ensure(size)? {
            return Ok(false);
        }
        let block = self.block.take().expect("block in progress");
        let stored = &self.buf[self.start..self.start + size];
        if !block.check.verify(stored) {
            return Err(ArchiveError::integrity(
                ErrorCode::CompressionXzBadData,
                format!(
                    "block {} check mismatch",
                    self.flags.expect("flags set").check.name()
                ),
            ));
        }
        self.consume(size);
        self.state = State::BlockOrIndex;
        Ok(true)
    }

    fn step_index(&mut self) -> Result<bool> {
        let mut progressed = false;
        while self.buffered() > 0 {
            let byte = self.buf[self.start];
            let done = self
                .index
                .as_mut()
                .expect("index parser active")
                .push(byte, &self.limits)?;
            self.consume(1);
            progressed = true;
            if done {
                let parser = self.index.take().expect("index parser active");
                if parser.records() != &self.records[..] {
                    return Err(bad(
                        "index records disagree with the decoded blocks",
                    ));
                }
                self.index_size = parser.bytes_consumed();
                self.total_records += parser.records().len() as u64;
                self.state = State::Footer;
                return Ok(true);
            }
        }
        if !progressed && self.finished_input {
            return Err(truncated("input ended inside the index"));
        }
        Ok(progressed)
    }

    fn step_footer(&mut self) -> Result<bool> {
        if !self.ensure(12)? {
            return Ok(false);
        }
        let footer = &self.buf[self.start..self.start + 12];
        let stored = u32::from_le_bytes([footer[0], footer[1], footer[2], footer[3]]);
        let computed = Crc32::compute(&footer[4..10]);
        if stored != computed {
            return Err(ArchiveError::integrity(
                ErrorCode::CompressionXzBadData,
                "stream footer CRC32 mismatch",
            ));
        }
        let backward =
            (u64::from(u32::from_le_bytes([footer[4], footer[5], footer[6], footer[7]])) + 1) * 4;
        if backward != self.index_size {
            return Err(bad(format!(
                "footer backward size {backward} does not match index size {}",
                self.index_size
            )));
        }
        let flags = self.flags.expect("flags set");
        if footer[8..10] != flags.raw {
            return Err(bad("stream footer flags differ from the header"));
        }
        if footer[10..12] != XZ_FOOTER_MAGIC {
            return Err(bad("bad stream footer magic"));
        }
        self.consume(12);
        self.streams_completed += 1;
        self.state = State::StreamPadding;
        Ok(true)
    }

    fn step_stream_padding(&mut self) -> Result<bool> {
        let mut progressed = false;
        loop {
            if self.buffered() >= 4 {
                let word = &self.buf[self.start..self.start + 4];
                if word == [0, 0, 0, 0] {
                    self.consume(4);
                    self.had_padding = true;
                    progressed = true;
                    continue;
                }
                self.state = State::StreamHeader;
                return Ok(true);
            }
            if !self.finished_input {
                return Ok(progressed);
            }
            if self.buffered() == 0 {
                self.state = State::Finished;
                return Ok(true);
            }
            let rest = &self.buf[self.start..];
            if rest.iter().all(|&b| b == 0) {
                return Err(bad("stream padding is not a multiple of four bytes"));
            }
            // A partial next stream header; the header step reports it.
            self.state = State::StreamHeader;
            return Ok(true);
        }
    }

    /// Account, limit-check, and append one emitted chunk. Violations abort
    /// before any overflowing bytes reach the output.
    fn emit(&mut self, data: Vec<u8>, in_delta: u64, out: &mut Vec<u8>) -> Result<()> {
        let new_total = self.total_out + data.len() as u64;
        if new_total > self.limits.max_total_uncompressed_bytes {
            return Err(ArchiveError::resource_limit(
                "TotalUncompressedBytes",
                new_total,
                self.limits.max_total_uncompressed_bytes,
            ));
        }
        if new_total > RATIO_FLOOR {
            let ratio = new_total / self.total_in.max(1);
            if ratio > self.limits.max_compression_ratio {
                return Err(ArchiveError::resource_limit(
                    "CompressionRatio",
                    ratio,
                    self.limits.max_compression_ratio,
                ));
            }
        }
        self.total_out = new_total;
        self.stream_out += data.len() as u64;
        self.progress.advance(in_delta, data.len() as u64);
        out.extend_from_slice(&data);
        Ok(())
    }
}

fn route(stages: &mut [FilterStage], data: Vec<u8>) -> Vec<u8> {
    let mut data = data;
    for stage in stages {
        let mut next = Vec::with_capacity(data.len());
        stage.feed(&data, &mut next);
        data = next;
    }
    data
}

/// Decompress a complete XZ buffer with default options.
pub fn decompress(data: &[u8]) -> Result<Vec<u8>> {
    decompress_with(data, XzOptions::default())
}

/// Decompress a complete XZ buffer.
pub fn decompress_with(data: &[u8], options: XzOptions) -> Result<Vec<u8>> {
    let mut decoder = XzDecoder::new(options);
    let mut out = Vec::new();
    decoder.update(data, &mut out)?;
    decoder.finish(&mut out)?;
    Ok(out)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::filter::{FILTER_DELTA, FILTER_X86};
    use crate::testutil::{build_stream, delta_encode, simple_stream, BlockSpec};
    use std::cell::RefCell;
    use std::rc::Rc;

    #[test]
    fn test_roundtrip_every_check_type() {
        let data = b"the quick brown fox jumps over the lazy dog";
        for check in [
            CheckType::None,
            CheckType::Crc32,
            CheckType::Crc64,
            CheckType::Sha256,
        ] {
            let stream = simple_stream(data, check);
            let out = decompress(&stream).unwrap();
            assert_eq!(out, data, "round trip failed for {check:?}");
        }
    }

    #[test]
    fn test_empty_stream_roundtrip() {
        let stream = build_stream(&[], CheckType::Crc32);
        assert_eq!(decompress(&stream).unwrap(), b"");
    }

    #[test]
    fn test_chunked_input_matches_monolithic() {
        let data: Vec<u8> = (0u32..4096).map(|i| (i * 31 % 251) as u8).collect();
        let stream = build_stream(
            &[BlockSpec::stored(&data), BlockSpec::stored(b"tail block")],
            CheckType::Crc64,
        );
        let whole = decompress(&stream).unwrap();

        for chunk_size in [1usize, 2, 7, 64, 1000] {
            let mut decoder = XzDecoder::new(XzOptions::default());
            let mut out = Vec::new();
            for piece in stream.chunks(chunk_size) {
                decoder.update(piece, &mut out).unwrap();
            }
            decoder.finish(&mut out).unwrap();
            assert_eq!(out, whole, "chunk size {chunk_size} diverged");
        }
    }

    #[test]
    fn test_concatenated_streams_with_padding() {
        for pad in [0usize, 4, 8, 16] {
            let mut data = simple_stream(b"first stream ", CheckType::Crc32);
            data.extend_from_slice(&vec![0u8; pad]);
            data.extend_from_slice(&simple_stream(b"second stream", CheckType::Sha256));
            let out = decompress(&data).unwrap();
            assert_eq!(out, b"first stream second stream", "padding {pad}");
        }
    }

    #[test]
    fn test_declared_block_sizes_are_verified() {
        let mut spec = BlockSpec::stored(b"sized block payload");
        spec.declare_sizes = true;
        let stream = build_stream(&[spec], CheckType::Crc32);
        assert_eq!(decompress(&stream).unwrap(), b"sized block payload");
    }

    #[test]
    fn test_delta_filter_chain() {
        let data: Vec<u8> = (0u32..512).map(|i| (i % 200) as u8).collect();
        let spec = BlockSpec {
            filters: vec![(FILTER_DELTA, vec![0])],
            dict_props: 0x00,
            lzma2_payload: delta_encode(&data, 1),
            uncompressed: data.clone(),
            declare_sizes: false,
        };
        let stream = build_stream(&[spec], CheckType::Crc32);
        assert_eq!(decompress(&stream).unwrap(), data);
    }

    #[test]
    fn test_delta_then_x86_chain() {
        // Constant data delta-encodes to one 0x10 plus zeros, which contains
        // no branch opcodes, so the x86 stage is the identity on the encoded
        // payload and the full chain must still reproduce the input.
        let data = vec![0x10u8; 300];
        let payload = delta_encode(&data, 1);
        assert!(payload.iter().all(|&b| b & 0xFE != 0xE8));
        let spec = BlockSpec {
            filters: vec![(FILTER_DELTA, vec![0]), (FILTER_X86, vec![])],
            dict_props: 0x00,
            lzma2_payload: payload,
            uncompressed: data.clone(),
            declare_sizes: false,
        };
        let stream = build_stream(&[spec], CheckType::Crc32);
        assert_eq!(decompress(&stream).unwrap(), data);
    }

    #[test]
    fn test_bad_magic_is_rejected() {
        let mut stream = simple_stream(b"x", CheckType::Crc32);
        stream[0] = 0xFE;
        let err = decompress(&stream).unwrap_err();
        assert_eq!(err.code(), ErrorCode::CompressionXzBadData);
    }

    #[test]
    fn test_corrupt_block_check_is_integrity_error() {
        let stream = simple_stream(b"checked payload!", CheckType::Crc32);
        // Layout: header 12, block header 12, LZMA2 20, check 4, index 8,
        // footer 12. Flip a bit of the stored check value.
        assert_eq!(stream.len(), 68);
        let check_pos = stream.len() - 12 - 8 - 4;
        let mut corrupt = stream.clone();
        corrupt[check_pos] ^= 0x01;
        let err = decompress(&corrupt).unwrap_err();
        assert!(matches!(err, ArchiveError::Integrity { .. }));
    }

    #[test]
    fn test_truncated_input() {
        let stream = simple_stream(b"will be cut short", CheckType::Crc32);
        let err = decompress(&stream[..stream.len() - 5]).unwrap_err();
        assert_eq!(err.code(), ErrorCode::CompressionXzTruncated);
        assert!(decompress(b"").is_err());
    }

    #[test]
    fn test_trailing_garbage_is_rejected() {
        let mut stream = simple_stream(b"data", CheckType::Crc32);
        stream.extend_from_slice(&[0, 0, 1, 0]);
        assert!(decompress(&stream).is_err());
    }

    #[test]
    fn test_index_record_limit_during_streaming() {
        let stream = build_stream(
            &[BlockSpec::stored(b"one"), BlockSpec::stored(b"two")],
            CheckType::Crc32,
        );
        let mut options = XzOptions::default();
        options.limits.max_xz_index_records = 1;
        let err = decompress_with(&stream, options).unwrap_err();
        assert_eq!(err.code(), ErrorCode::CompressionResourceLimit);
        let ctx = err.context().unwrap();
        assert_eq!(ctx.get("limitIndexRecords").unwrap(), "1");
    }

    #[test]
    fn test_buffered_input_ceiling() {
        let big = vec![0xABu8; 4000];
        let stream = simple_stream(&big, CheckType::Crc32);
        let mut options = XzOptions::default();
        options.limits.max_xz_buffered_input_bytes = 64;
        let err = decompress_with(&stream, options).unwrap_err();
        assert_eq!(err.code(), ErrorCode::CompressionXzBufferLimit);
        assert!(err
            .context()
            .unwrap()
            .contains_key("requiredBufferedInputBytes"));
    }

    #[test]
    fn test_total_output_limit_blocks_overflow_output() {
        let stream = simple_stream(&vec![7u8; 1000], CheckType::Crc32);
        let mut options = XzOptions::default();
        options.limits.max_total_uncompressed_bytes = 100;
        let mut decoder = XzDecoder::new(options);
        let mut out = Vec::new();
        let err = decoder.update(&stream, &mut out).unwrap_err();
        assert_eq!(err.code(), ErrorCode::CompressionResourceLimit);
        // Nothing beyond the ceiling was emitted.
        assert!(out.is_empty());
    }

    #[test]
    fn test_cancellation_stops_the_pipeline() {
        let stream = simple_stream(b"cancel me", CheckType::Crc32);
        let options = XzOptions::default();
        let token = options.cancel.clone();
        let mut decoder = XzDecoder::new(options);
        token.cancel();
        let mut out = Vec::new();
        assert!(matches!(
            decoder.update(&stream, &mut out),
            Err(ArchiveError::Cancelled)
        ));
        assert!(out.is_empty());
    }

    #[test]
    fn test_progress_events_are_monotonic() {
        let data: Vec<u8> = (0u32..200_000).map(|i| (i % 256) as u8).collect();
        let stream = build_stream(&[BlockSpec::stored(&data)], CheckType::Crc32);
        let seen: Rc<RefCell<Vec<(u64, u64)>>> = Rc::new(RefCell::new(Vec::new()));
        let sink = seen.clone();
        let mut decoder = XzDecoder::with_progress(
            XzOptions::default(),
            Some(Box::new(move |ev| {
                sink.borrow_mut().push((ev.bytes_in, ev.bytes_out));
            })),
        );
        let mut out = Vec::new();
        decoder.update(&stream, &mut out).unwrap();
        decoder.finish(&mut out).unwrap();
        assert_eq!(out, data);
        let events = seen.borrow();
        // Multiple 64 KiB chunks means multiple events.
        assert!(events.len() >= 3);
        for pair in events.windows(2) {
            assert!(pair[1].0 >= pair[0].0);
            assert!(pair[1].1 >= pair[0].1);
        }
    }

    #[test]
    fn test_streams_and_padding_accounting() {
        let mut data = simple_stream(b"a", CheckType::Crc32);
        data.extend_from_slice(&[0u8; 4]);
        data.extend_from_slice(&simple_stream(b"b", CheckType::Crc32));
        let mut decoder = XzDecoder::new(XzOptions::default());
        let mut out = Vec::new();
        decoder.update(&data, &mut out).unwrap();
        decoder.finish(&mut out).unwrap();
        assert_eq!(out, b"ab");
        assert_eq!(decoder.streams_completed(), 2);
        assert!(decoder.had_padding());
        assert!(decoder.is_finished());
    }
}
