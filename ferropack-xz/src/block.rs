//! XZ block headers and filter-chain assembly.

use crate::filter::{
    BcjFilter, BcjKind, DeltaFilter, FilterStage, FILTER_DELTA, FILTER_LZMA2,
};
use crate::lzma2::dict_size_from_props;
use ferropack_core::binary::ByteReader;
use ferropack_core::crc::Crc32;
use ferropack_core::error::{ArchiveError, ErrorCode, Result};
use ferropack_core::vli::read_vli;

/// Maximum number of filters in a chain.
pub const MAX_FILTERS: usize = 4;

fn bad(message: impl Into<String>) -> ArchiveError {
    ArchiveError::structural(ErrorCode::CompressionXzBadData, message.into())
}

/// One filter entry as listed in a block header.
#[derive(Debug, Clone)]
pub struct FilterEntry {
    /// Filter id.
    pub id: u64,
    /// Raw property bytes.
    pub props: Vec<u8>,
}

/// A parsed block header.
#[derive(Debug, Clone)]
pub struct BlockHeader {
    /// Total encoded header size including the size byte and CRC.
    pub header_size: usize,
    /// Declared compressed size, when the 0x40 flag was set.
    pub compressed_size: Option<u64>,
    /// Declared uncompressed size, when the 0x80 flag was set.
    pub uncompressed_size: Option<u64>,
    /// The filter chain in listed (encoder) order; the last entry is LZMA2.
    pub filters: Vec<FilterEntry>,
    /// Dictionary size declared by the LZMA2 properties byte.
    pub dict_size: u32,
}

impl BlockHeader {
    /// Parse a complete block header, `data[0]` being the size byte.
    ///
    /// The caller has already used `data[0]` to compute the total length
    /// `(data[0] + 1) * 4` and collected exactly that many bytes.
    pub fn parse(data: &[u8]) -> Result<Self> {
        debug_assert!(!data.is_empty());
        let header_size = (usize::from(data[0]) + 1) * 4;
        if data.len() != header_size || data[0] == 0 {
            return Err(bad("block header size mismatch"));
        }

        // CRC32 covers everything except the CRC field itself.
        let stored_crc = u32::from_le_bytes([
            data[header_size - 4],
            data[header_size - 3],
            data[header_size - 2],
            data[header_size - 1],
        ]);
        let computed_crc = Crc32::compute(&data[..header_size - 4]);
        if stored_crc != computed_crc {
            return Err(ArchiveError::integrity(
                ErrorCode::CompressionXzBadData,
                format!(
                    "block header CRC32 mismatch: stored {stored_crc:08X}, computed {computed_crc:08X}"
                ),
            ));
        }

        let mut reader = ByteReader::new(&data[1..header_size - 4]);
        let flags = reader.u8()?;
        if flags & 0x3C != 0 {
            return Err(bad("reserved block header flag bits are set"));
        }
        let filter_count = usize::from(flags & 0x03) + 1;
        let has_compressed = flags & 0x40 != 0;
        let has_uncompressed = flags & 0x80 != 0;

        let compressed_size = if has_compressed {
            let value = read_vli(&mut reader)?;
            if value == 0 {
                return Err(bad("declared compressed size of zero"));
            }
            Some(value)
        } else {
            None
        };
        let uncompressed_size = if has_uncompressed {
            Some(read_vli(&mut reader)?)
        } else {
            None
        };

        let mut filters = Vec::with_capacity(filter_count);
        for _ in 0..filter_count {
            let id = read_vli(&mut reader)?;
            let props_size = read_vli(&mut reader)?;
            if props_size > reader.remaining() as u64 {
                return Err(bad("filter properties overrun the block header"));
            }
            let props = reader.bytes(props_size as usize)?.to_vec();
            filters.push(FilterEntry { id, props });
        }

        // Bytes between the last filter and the CRC must be zero padding.
        while !reader.is_empty() {
            if reader.u8()? != 0 {
                return Err(bad("non-zero padding in block header"));
            }
        }

        let dict_size = validate_chain(&filters)?;
        Ok(Self {
            header_size,
            compressed_size,
            uncompressed_size,
            filters,
            dict_size,
        })
    }

    /// Build the decode-side stages for the non-last filters.
    ///
    /// Stages are returned in decode order (the stage closest to LZMA2
    /// first). `stream_pos` seeds each BCJ filter with the uncompressed bytes
    /// already emitted in the current stream.
    pub fn build_stages(&self, stream_pos: u64) -> Result<Vec<FilterStage>> {
        let mut stages = Vec::new();
        for entry in self.filters[..self.filters.len() - 1].iter().rev() {
            let stage = match entry.id {
                FILTER_DELTA => FilterStage::Delta(DeltaFilter::new(&entry.props)?),
                id => {
                    let kind = BcjKind::from_id(id).expect("validated in parse");
                    FilterStage::Bcj(BcjFilter::new(kind, &entry.props, stream_pos as u32)?)
                }
            };
            stages.push(stage);
        }
        Ok(stages)
    }
}

/// Validate filter ordering rules and return the LZMA2 dictionary size.
fn validate_chain(filters: &[FilterEntry]) -> Result<u32> {
    let last = filters.last().expect("at least one filter");
    if last.id != FILTER_LZMA2 {
        return Err(ArchiveError::unsupported(
            ErrorCode::CompressionXzUnsupportedFilter,
            format!("last filter must be LZMA2, found id 0x{:02X}", last.id),
        ));
    }
    if last.props.len() != 1 {
        return Err(ArchiveError::unsupported(
            ErrorCode::CompressionXzUnsupportedFilter,
            "LZMA2 filter requires a single properties byte",
        ));
    }
    let dict_size = dict_size_from_props(last.props[0]).ok_or_else(|| {
        ArchiveError::unsupported(
            ErrorCode::CompressionXzUnsupportedFilter,
            format!("invalid LZMA2 dictionary property {}", last.props[0]),
        )
    })?;

    for entry in &filters[..filters.len() - 1] {
        if entry.id != FILTER_DELTA && BcjKind::from_id(entry.id).is_none() {
            return Err(ArchiveError::unsupported(
                ErrorCode::CompressionXzUnsupportedFilter,
                format!("unsupported non-last filter id 0x{:02X}", entry.id),
            ));
        }
    }
    Ok(dict_size)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testutil::encode_block_header as encode_header;

    #[test]
    fn test_parse_minimal_lzma2_header() {
        let header = encode_header(&[(FILTER_LZMA2, vec![0x00])], None, None);
        let parsed = BlockHeader::parse(&header).unwrap();
        assert_eq!(parsed.filters.len(), 1);
        assert_eq!(parsed.dict_size, 4096);
        assert_eq!(parsed.compressed_size, None);
        assert_eq!(parsed.uncompressed_size, None);
    }

    #[test]
    fn test_parse_sizes_and_multi_filter() {
        let header = encode_header(
            &[
                (FILTER_DELTA, vec![0]),
                (0x04, vec![]),
                (FILTER_LZMA2, vec![0x02]),
            ],
            Some(1234),
            Some(567_890),
        );
        let parsed = BlockHeader::parse(&header).unwrap();
        assert_eq!(parsed.compressed_size, Some(1234));
        assert_eq!(parsed.uncompressed_size, Some(567_890));
        assert_eq!(parsed.filters.len(), 3);
        assert_eq!(parsed.dict_size, 8192);
        let stages = parsed.build_stages(0).unwrap();
        assert_eq!(stages.len(), 2);
        // Decode order: BCJ x86 first, delta last.
        assert!(matches!(stages[0], FilterStage::Bcj(_)));
        assert!(matches!(stages[1], FilterStage::Delta(_)));
    }

    #[test]
    fn test_crc_mismatch_rejected() {
        let mut header = encode_header(&[(FILTER_LZMA2, vec![0x00])], None, None);
        let len = header.len();
        header[len - 1] ^= 0x01;
        assert!(BlockHeader::parse(&header).is_err());
    }

    #[test]
    fn test_nonzero_padding_rejected() {
        // Force padding by using a filter with no props, then poison it.
        let mut header = encode_header(&[(FILTER_LZMA2, vec![0x00])], Some(5), None);
        // Find a zero padding byte before the CRC and flip it, then fix CRC.
        let crc_start = header.len() - 4;
        let mut poisoned = false;
        for i in (1..crc_start).rev() {
            if header[i] == 0 {
                header[i] = 0x55;
                poisoned = true;
                break;
            }
        }
        assert!(poisoned);
        let crc = Crc32::compute(&header[..crc_start]);
        header[crc_start..].copy_from_slice(&crc.to_le_bytes());
        assert!(BlockHeader::parse(&header).is_err());
    }

    #[test]
    fn test_non_lzma2_last_filter_rejected() {
        let header = encode_header(&[(FILTER_DELTA, vec![0])], None, None);
        let err = BlockHeader::parse(&header).unwrap_err();
        assert_eq!(
            err.code(),
            ferropack_core::error::ErrorCode::CompressionXzUnsupportedFilter
        );
    }

    #[test]
    fn test_unknown_filter_rejected() {
        let header = encode_header(
            &[(0x42, vec![]), (FILTER_LZMA2, vec![0x00])],
            None,
            None,
        );
        assert!(BlockHeader::parse(&header).is_err());
    }
}
