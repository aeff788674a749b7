//! Seekable preflight: bound the cost of an XZ input before decompressing.
//!
//! Walks streams from the tail (footer, index, then each block header) and
//! accumulates the resources a full decode would need. Nothing is ever
//! decompressed; a limit violation surfaces as a typed error whose context
//! names the required and configured values.

use crate::block::BlockHeader;
use crate::index::IndexParser;
use crate::stream::{StreamFlags, XZ_FOOTER_MAGIC, XZ_MAGIC};
use ferropack_core::crc::Crc32;
use ferropack_core::error::{ArchiveError, ErrorCode, Result};
use ferropack_core::limits::ResourceLimits;
use ferropack_core::source::RandomAccess;

fn bad(message: impl Into<String>) -> ArchiveError {
    ArchiveError::structural(ErrorCode::CompressionXzBadData, message.into())
}

/// What a full decode of the input would require.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct XzPreflight {
    /// Number of concatenated streams.
    pub streams: u64,
    /// Total number of blocks.
    pub blocks: u64,
    /// Index records a decoder must track.
    pub required_index_records: u64,
    /// Encoded bytes of all indexes.
    pub required_index_bytes: u64,
    /// Largest LZMA2 dictionary any block declares.
    pub max_dictionary_bytes: u64,
    /// Total declared uncompressed size.
    pub total_uncompressed: u64,
    /// Whether inter-stream NUL padding is present.
    pub had_padding: bool,
}

/// Walk the input from the tail and compute its resource requirements.
pub fn preflight<S: RandomAccess>(source: &mut S, limits: &ResourceLimits) -> Result<XzPreflight> {
    let size = source.size()?;
    let mut end = size;
    let mut info = XzPreflight::default();
    let mut headers_visited = 0u64;

    loop {
        // Strip stream padding (whole NUL words only).
        while end >= 4 {
            let word = source.read_vec_at(end - 4, 4)?;
            if word != [0, 0, 0, 0] {
                break;
            }
            end -= 4;
            info.had_padding = true;
        }
        if end == 0 {
            break;
        }
        if end < 32 {
            return Err(ArchiveError::structural(
                ErrorCode::CompressionXzTruncated,
                "input is too small to hold an XZ stream",
            ));
        }

        // Footer.
        let footer = source.read_vec_at(end - 12, 12)?;
        if footer[10..12] != XZ_FOOTER_MAGIC {
            return Err(bad("bad stream footer magic"));
        }
        let stored = u32::from_le_bytes([footer[0], footer[1], footer[2], footer[3]]);
        if stored != Crc32::compute(&footer[4..10]) {
            return Err(ArchiveError::integrity(
                ErrorCode::CompressionXzBadData,
                "stream footer CRC32 mismatch",
            ));
        }
        let flags = StreamFlags::decode([footer[8], footer[9]])?;
        let backward =
            (u64::from(u32::from_le_bytes([footer[4], footer[5], footer[6], footer[7]])) + 1) * 4;
        let new_index_bytes = info.required_index_bytes + backward;
        if new_index_bytes > limits.max_xz_index_bytes {
            return Err(ArchiveError::resource_limit(
                "IndexBytes",
                new_index_bytes,
                limits.max_xz_index_bytes,
            ));
        }
        if backward > end - 24 {
            return Err(bad("footer backward size runs past the stream start"));
        }

        // Index.
        let index_start = end - 12 - backward;
        let index_bytes = source.read_vec_at(index_start, backward as usize)?;
        let mut parser = IndexParser::new(info.required_index_records);
        let mut complete = false;
        for (i, &byte) in index_bytes.iter().enumerate() {
            if parser.push(byte, limits)? {
                if i != index_bytes.len() - 1 {
                    return Err(bad("index is shorter than the footer backward size"));
                }
                complete = true;
            }
        }
        if !complete {
            return Err(bad("index is longer than the footer backward size"));
        }
        info.required_index_bytes = new_index_bytes;
        info.required_index_records += parser.records().len() as u64;
        info.blocks += parser.records().len() as u64;

        // Blocks region and stream header.
        let mut blocks_size = 0u64;
        for record in parser.records() {
            blocks_size = blocks_size
                .checked_add(record.unpadded.div_ceil(4) * 4)
                .ok_or_else(|| bad("index sizes overflow"))?;
            info.total_uncompressed = info
                .total_uncompressed
                .checked_add(record.uncompressed)
                .ok_or_else(|| bad("index sizes overflow"))?;
        }
        if info.total_uncompressed > limits.max_total_uncompressed_bytes {
            return Err(ArchiveError::resource_limit(
                "TotalUncompressedBytes",
                info.total_uncompressed,
                limits.max_total_uncompressed_bytes,
            ));
        }
        let header_start = index_start
            .checked_sub(blocks_size + 12)
            .ok_or_else(|| bad("blocks region runs past the start of the input"))?;
        let header = source.read_vec_at(header_start, 12)?;
        if header[..6] != XZ_MAGIC {
            return Err(bad("stream header magic not found where the index points"));
        }
        let header_flags = [header[6], header[7]];
        if header_flags != flags.raw {
            return Err(bad("stream header flags differ from the footer"));
        }
        let stored = u32::from_le_bytes([header[8], header[9], header[10], header[11]]);
        if stored != Crc32::compute(&header_flags) {
            return Err(ArchiveError::integrity(
                ErrorCode::CompressionXzBadData,
                "stream header CRC32 mismatch",
            ));
        }

        // Visit each block header for its dictionary requirement.
        let mut offset = header_start + 12;
        for record in parser.records() {
            headers_visited += 1;
            if headers_visited > limits.max_xz_preflight_block_headers {
                return Err(ArchiveError::resource_limit(
                    "PreflightBlockHeaders",
                    headers_visited,
                    limits.max_xz_preflight_block_headers,
                ));
            }
            let first = source.read_vec_at(offset, 1)?[0];
            if first == 0 {
                return Err(bad("index record points at the index, not a block"));
            }
            let header_size = (usize::from(first) + 1) * 4;
            let header = source.read_vec_at(offset, header_size)?;
            let parsed = BlockHeader::parse(&header)?;
            info.max_dictionary_bytes =
                info.max_dictionary_bytes.max(u64::from(parsed.dict_size));
            offset += record.unpadded.div_ceil(4) * 4;
        }
        if info.max_dictionary_bytes > limits.max_dictionary_bytes {
            return Err(ArchiveError::resource_limit(
                "DictionaryBytes",
                info.max_dictionary_bytes,
                limits.max_dictionary_bytes,
            ));
        }

        info.streams += 1;
        end = header_start;
    }

    if info.streams == 0 {
        return Err(bad("no XZ stream found"));
    }
    Ok(info)
}
