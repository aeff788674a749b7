//! XZ index parsing.
//!
//! The index lists one `(unpadded size, uncompressed size)` record per block
//! and is protected by a CRC32. [`IndexParser`] is fed one byte at a time so
//! the streaming decoder can parse it without unbounded buffering; the
//! preflight feeds it a complete slice.

use ferropack_core::crc::Crc32;
use ferropack_core::error::{ArchiveError, ErrorCode, Result};
use ferropack_core::limits::ResourceLimits;
use ferropack_core::vli::VliDecoder;

fn bad(message: impl Into<String>) -> ArchiveError {
    ArchiveError::structural(ErrorCode::CompressionXzBadData, message.into())
}

/// One index record.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct IndexRecord {
    /// Block header + compressed data + check, without padding.
    pub unpadded: u64,
    /// Uncompressed size of the block.
    pub uncompressed: u64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum IndexState {
    Indicator,
    Count,
    Unpadded,
    Uncompressed,
    Padding,
    Crc,
    Done,
}

/// Byte-at-a-time index parser with CRC verification and limit accounting.
#[derive(Debug)]
pub struct IndexParser {
    state: IndexState,
    vli: VliDecoder,
    crc: Crc32,
    /// Bytes consumed so far, CRC field included.
    bytes: u64,
    remaining_records: u64,
    pending_unpadded: u64,
    records: Vec<IndexRecord>,
    crc_bytes: [u8; 4],
    crc_filled: usize,
    /// Records already seen in earlier streams, for cumulative limits.
    prior_records: u64,
}

impl IndexParser {
    /// Create a parser expecting the index indicator byte first.
    ///
    /// `prior_records` counts records from earlier streams in the same input
    /// so cumulative limits apply across concatenated streams.
    pub fn new(prior_records: u64) -> Self {
        Self {
            state: IndexState::Indicator,
            vli: VliDecoder::new(),
            crc: Crc32::new(),
            bytes: 0,
            remaining_records: 0,
            pending_unpadded: 0,
            records: Vec::new(),
            crc_bytes: [0; 4],
            crc_filled: 0,
            prior_records,
        }
    }

    /// Total encoded index size consumed so far.
    pub fn bytes_consumed(&self) -> u64 {
        self.bytes
    }

    /// Parsed records (valid once `push` returned `true`).
    pub fn records(&self) -> &[IndexRecord] {
        &self.records
    }

    /// Feed one byte. Returns `true` once the index (including its CRC) is
    /// complete and verified.
    pub fn push(&mut self, byte: u8, limits: &ResourceLimits) -> Result<bool> {
        self.bytes += 1;
        if self.bytes > limits.max_xz_index_bytes {
            return Err(ArchiveError::resource_limit(
                "IndexBytes",
                self.bytes,
                limits.max_xz_index_bytes,
            ));
        }
        if self.state != IndexState::Crc {
            self.crc.update(&[byte]);
        }
        match self.state {
            IndexState::Indicator => {
                if byte != 0x00 {
                    return Err(bad("index does not start with the indicator byte"));
                }
                self.state = IndexState::Count;
            }
            IndexState::Count => {
                if let Some(count) = self.vli.push(byte)? {
                    let total = self.prior_records.saturating_add(count);
                    if total > limits.max_xz_index_records {
                        return Err(ArchiveError::resource_limit(
                            "IndexRecords",
                            total,
                            limits.max_xz_index_records,
                        ));
                    }
                    self.remaining_records = count;
                    self.records.reserve(count.min(1 << 16) as usize);
                    self.state = if count == 0 {
                        IndexState::Padding
                    } else {
                        IndexState::Unpadded
                    };
                }
            }
            IndexState::Unpadded => {
                if let Some(value) = self.vli.push(byte)? {
                    if value == 0 {
                        return Err(bad("index record with zero unpadded size"));
                    }
                    self.pending_unpadded = value;
                    self.state = IndexState::Uncompressed;
                }
            }
            IndexState::Uncompressed => {
                if let Some(value) = self.vli.push(byte)? {
                    self.records.push(IndexRecord {
                        unpadded: self.pending_unpadded,
                        uncompressed: value,
                    });
                    self.remaining_records -= 1;
                    self.state = if self.remaining_records == 0 {
                        IndexState::Padding
                    } else {
                        IndexState::Unpadded
                    };
                }
            }
            IndexState::Padding => {
                if byte != 0 {
                    return Err(bad("non-zero index padding"));
                }
            }
            IndexState::Crc => {
                self.crc_bytes[self.crc_filled] = byte;
                self.crc_filled += 1;
                if self.crc_filled == 4 {
                    let stored = u32::from_le_bytes(self.crc_bytes);
                    let computed = self.crc.clone().finalize();
                    if stored != computed {
                        return Err(ArchiveError::integrity(
                            ErrorCode::CompressionXzBadData,
                            format!(
                                "index CRC32 mismatch: stored {stored:08X}, computed {computed:08X}"
                            ),
                        ));
                    }
                    self.state = IndexState::Done;
                    return Ok(true);
                }
            }
            IndexState::Done => return Err(bad("data after complete index")),
        }

        // Zero padding until 4-byte alignment, then the CRC.
        if self.state == IndexState::Padding && self.bytes % 4 == 0 {
            self.state = IndexState::Crc;
        }
        Ok(false)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use ferropack_core::vli::write_vli;

    fn encode_index(records: &[IndexRecord]) -> Vec<u8> {
        let mut out = vec![0x00];
        write_vli(&mut out, records.len() as u64);
        for record in records {
            write_vli(&mut out, record.unpadded);
            write_vli(&mut out, record.uncompressed);
        }
        while out.len() % 4 != 0 {
            out.push(0);
        }
        let crc = Crc32::compute(&out);
        out.extend_from_slice(&crc.to_le_bytes());
        out
    }

    fn parse(bytes: &[u8], limits: &ResourceLimits) -> Result<Vec<IndexRecord>> {
        let mut parser = IndexParser::new(0);
        for (i, &byte) in bytes.iter().enumerate() {
            if parser.push(byte, limits)? {
                assert_eq!(i, bytes.len() - 1, "index parser finished early");
                return Ok(parser.records().to_vec());
            }
        }
        Err(bad("index parser never finished"))
    }

    #[test]
    fn test_roundtrip_two_records() {
        let records = [
            IndexRecord {
                unpadded: 100,
                uncompressed: 4096,
            },
            IndexRecord {
                unpadded: 30_000,
                uncompressed: 1 << 30,
            },
        ];
        let encoded = encode_index(&records);
        let parsed = parse(&encoded, &ResourceLimits::DEFAULT).unwrap();
        assert_eq!(parsed, records);
    }

    #[test]
    fn test_record_limit_carries_context() {
        let records = [
            IndexRecord {
                unpadded: 8,
                uncompressed: 8,
            },
            IndexRecord {
                unpadded: 8,
                uncompressed: 8,
            },
        ];
        let encoded = encode_index(&records);
        let mut limits = ResourceLimits::DEFAULT;
        limits.max_xz_index_records = 1;
        let err = parse(&encoded, &limits).unwrap_err();
        let ctx = err.context().unwrap();
        assert_eq!(ctx.get("requiredIndexRecords").unwrap(), "2");
        assert_eq!(ctx.get("limitIndexRecords").unwrap(), "1");
    }

    #[test]
    fn test_crc_mismatch_rejected() {
        let mut encoded = encode_index(&[IndexRecord {
            unpadded: 8,
            uncompressed: 8,
        }]);
        let len = encoded.len();
        encoded[len - 1] ^= 1;
        assert!(parse(&encoded, &ResourceLimits::DEFAULT).is_err());
    }

    #[test]
    fn test_bad_indicator_rejected() {
        let mut parser = IndexParser::new(0);
        assert!(parser.push(0x01, &ResourceLimits::DEFAULT).is_err());
    }

    #[test]
    fn test_index_bytes_limit() {
        let records: Vec<IndexRecord> = (0..100)
            .map(|i| IndexRecord {
                unpadded: 1000 + i,
                uncompressed: 5000 + i,
            })
            .collect();
        let encoded = encode_index(&records);
        let mut limits = ResourceLimits::DEFAULT;
        limits.max_xz_index_bytes = 16;
        let err = parse(&encoded, &limits).unwrap_err();
        assert!(err.context().unwrap().contains_key("limitIndexBytes"));
    }
}
