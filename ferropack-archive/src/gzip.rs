//! GZIP member metadata.
//!
//! The deflate body is handled by the codec layer; this module only surfaces
//! the optional header fields (original name, mtime, comment) that callers
//! want for display.

use ferropack_core::binary::ByteReader;
use ferropack_core::error::{ArchiveError, ErrorCode, Result};

const FLAG_FHCRC: u8 = 0x02;
const FLAG_FEXTRA: u8 = 0x04;
const FLAG_FNAME: u8 = 0x08;
const FLAG_FCOMMENT: u8 = 0x10;

/// Parsed gzip member header fields.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct GzipHeader {
    /// Original file name, when stored.
    pub name: Option<String>,
    /// Comment, when stored.
    pub comment: Option<String>,
    /// Modification time (Unix seconds), when nonzero.
    pub mtime: Option<i64>,
    /// OS byte.
    pub os: u8,
    /// Total header length in bytes.
    pub header_len: usize,
}

fn bad(message: &str) -> ArchiveError {
    ArchiveError::structural(ErrorCode::CompressionBadData, message.to_string())
}

fn read_cstring(reader: &mut ByteReader<'_>) -> Result<String> {
    let mut bytes = Vec::new();
    loop {
        let byte = reader.u8().map_err(|_| bad("unterminated gzip string"))?;
        if byte == 0 {
            break;
        }
        bytes.push(byte);
    }
    // Header strings are ISO 8859-1 by specification.
    Ok(bytes.iter().map(|&b| char::from(b)).collect())
}

impl GzipHeader {
    /// Parse a gzip member header from the start of `data`.
    pub fn parse(data: &[u8]) -> Result<Self> {
        let mut reader = ByteReader::new(data);
        let magic = reader.bytes(2).map_err(|_| bad("gzip header too short"))?;
        if magic != [0x1F, 0x8B] {
            return Err(bad("not a gzip stream"));
        }
        let method = reader.u8()?;
        if method != 8 {
            return Err(ArchiveError::unsupported(
                ErrorCode::ZipUnsupportedMethod,
                format!("gzip compression method {method} is not deflate"),
            ));
        }
        let flags = reader.u8()?;
        let mtime = reader.u32_le()?;
        reader.skip(2)?; // XFL + OS
        let os = data[9];

        if flags & FLAG_FEXTRA != 0 {
            let len = reader.u16_le()? as usize;
            reader.skip(len).map_err(|_| bad("gzip extra field truncated"))?;
        }
        let name = if flags & FLAG_FNAME != 0 {
            Some(read_cstring(&mut reader)?)
        } else {
            None
        };
        let comment = if flags & FLAG_FCOMMENT != 0 {
            Some(read_cstring(&mut reader)?)
        } else {
            None
        };
        if flags & FLAG_FHCRC != 0 {
            reader.skip(2)?;
        }

        Ok(Self {
            name,
            comment,
            mtime: if mtime == 0 { None } else { Some(i64::from(mtime)) },
            os,
            header_len: reader.position(),
        })
    }
}
