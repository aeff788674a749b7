//! Hand-rolled XZ stream construction for tests.
//!
//! Writing XZ is not a product feature, so these encoders live behind
//! `cfg(test)`. They produce format-exact streams using LZMA2 uncompressed
//! chunks, which is enough to exercise every structural path of the decoder.

use crate::check::CheckType;
use crate::index::IndexRecord;
use ferropack_core::crc::{Crc32, Crc64};
use ferropack_core::vli::write_vli;
use sha2::{Digest, Sha256};

/// Encode a block header for the given filter list and optional sizes.
pub(crate) fn encode_block_header(
    filters: &[(u64, Vec<u8>)],
    compressed_size: Option<u64>,
    uncompressed_size: Option<u64>,
) -> Vec<u8> {
    let mut body = Vec::new();
    let mut flags = (filters.len() - 1) as u8;
    if compressed_size.is_some() {
        flags |= 0x40;
    }
    if uncompressed_size.is_some() {
        flags |= 0x80;
    }
    body.push(flags);
    if let Some(size) = compressed_size {
        write_vli(&mut body, size);
    }
    if let Some(size) = uncompressed_size {
        write_vli(&mut body, size);
    }
    for (id, props) in filters {
        write_vli(&mut body, *id);
        write_vli(&mut body, props.len() as u64);
        body.extend_from_slice(props);
    }
    let unpadded = 1 + body.len() + 4;
    let total = unpadded.div_ceil(4) * 4;
    let size_byte = (total / 4 - 1) as u8;
    let mut header = vec![size_byte];
    header.extend_from_slice(&body);
    header.resize(total - 4, 0);
    let crc = Crc32::compute(&header);
    header.extend_from_slice(&crc.to_le_bytes());
    header
}

/// Encode data as LZMA2 uncompressed chunks plus the end marker.
pub(crate) fn lzma2_store(data: &[u8]) -> Vec<u8> {
    let mut out = Vec::new();
    let mut first = true;
    for chunk in data.chunks(0x10000) {
        out.push(if first { 0x01 } else { 0x02 });
        out.extend_from_slice(&((chunk.len() - 1) as u16).to_be_bytes());
        out.extend_from_slice(chunk);
        first = false;
    }
    out.push(0x00);
    out
}

/// The stored check field for a block's uncompressed data.
pub(crate) fn check_bytes(check: CheckType, data: &[u8]) -> Vec<u8> {
    match check {
        CheckType::None => Vec::new(),
        CheckType::Crc32 => Crc32::compute(data).to_le_bytes().to_vec(),
        CheckType::Crc64 => Crc64::compute(data).to_le_bytes().to_vec(),
        CheckType::Sha256 => Sha256::digest(data).to_vec(),
        CheckType::Unsupported(_) => vec![0u8; check.size()],
    }
}

/// One block for [`build_stream`].
pub(crate) struct BlockSpec {
    /// Non-last filters in encoder order (id, props).
    pub filters: Vec<(u64, Vec<u8>)>,
    /// LZMA2 dictionary properties byte.
    pub dict_props: u8,
    /// The LZMA2 layer payload (already filter-encoded when filters are set).
    pub lzma2_payload: Vec<u8>,
    /// The block's final uncompressed data (what checks cover).
    pub uncompressed: Vec<u8>,
    /// Whether to declare sizes in the block header.
    pub declare_sizes: bool,
}

impl BlockSpec {
    /// A plain stored block.
    pub fn stored(data: &[u8]) -> Self {
        Self {
            filters: Vec::new(),
            dict_props: 0x00,
            lzma2_payload: data.to_vec(),
            uncompressed: data.to_vec(),
            declare_sizes: false,
        }
    }
}

/// Build one complete XZ stream.
pub(crate) fn build_stream(blocks: &[BlockSpec], check: CheckType) -> Vec<u8> {
    let mut out = Vec::new();
    // Stream header.
    out.extend_from_slice(&[0xFD, 0x37, 0x7A, 0x58, 0x5A, 0x00]);
    let flag_bytes = [0x00, check.id()];
    out.extend_from_slice(&flag_bytes);
    out.extend_from_slice(&Crc32::compute(&flag_bytes).to_le_bytes());

    let mut records = Vec::new();
    for spec in blocks {
        let lzma2 = lzma2_store(&spec.lzma2_payload);
        let mut filters = spec.filters.clone();
        filters.push((crate::filter::FILTER_LZMA2, vec![spec.dict_props]));
        let header = if spec.declare_sizes {
            encode_block_header(
                &filters,
                Some(lzma2.len() as u64),
                Some(spec.uncompressed.len() as u64),
            )
        } else {
            encode_block_header(&filters, None, None)
        };
        out.extend_from_slice(&header);
        out.extend_from_slice(&lzma2);
        let padding = (4 - (lzma2.len() % 4)) % 4;
        out.extend_from_slice(&vec![0u8; padding]);
        out.extend_from_slice(&check_bytes(check, &spec.uncompressed));
        records.push(IndexRecord {
            unpadded: (header.len() + lzma2.len() + check.size()) as u64,
            uncompressed: spec.uncompressed.len() as u64,
        });
    }

    // Index.
    let mut index = vec![0x00];
    write_vli(&mut index, records.len() as u64);
    for record in &records {
        write_vli(&mut index, record.unpadded);
        write_vli(&mut index, record.uncompressed);
    }
    while index.len() % 4 != 0 {
        index.push(0);
    }
    let index_crc = Crc32::compute(&index);
    index.extend_from_slice(&index_crc.to_le_bytes());
    let index_len = index.len();
    out.extend_from_slice(&index);

    // Footer.
    let backward = (index_len as u32 / 4) - 1;
    let mut footer_body = Vec::new();
    footer_body.extend_from_slice(&backward.to_le_bytes());
    footer_body.extend_from_slice(&flag_bytes);
    out.extend_from_slice(&Crc32::compute(&footer_body).to_le_bytes());
    out.extend_from_slice(&footer_body);
    out.extend_from_slice(&[0x59, 0x5A]);
    out
}

/// A single-block stream of stored data.
pub(crate) fn simple_stream(data: &[u8], check: CheckType) -> Vec<u8> {
    build_stream(&[BlockSpec::stored(data)], check)
}

/// Delta-encode (the inverse of the delta decode filter).
pub(crate) fn delta_encode(data: &[u8], distance: usize) -> Vec<u8> {
    let mut out = Vec::with_capacity(data.len());
    for (i, &byte) in data.iter().enumerate() {
        let prev = if i >= distance { data[i - distance] } else { 0 };
        out.push(byte.wrapping_sub(prev));
    }
    out
}
