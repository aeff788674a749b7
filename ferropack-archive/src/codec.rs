//! Codec registry and stream transforms.
//!
//! Maps compression-method ids and detected layers to concrete transforms.
//! The registry is process-wide, populated once, and read-only afterwards;
//! callers may stage additional ZIP method mappings before first use.

use ferropack_core::entry::CompressionMethod;
use ferropack_core::error::{ArchiveError, ErrorCode, Result};
use ferropack_core::limits::ResourceLimits;
use ferropack_xz::{XzDecoder, XzOptions};
use std::collections::BTreeMap;
use std::io::Read;
use std::sync::{Mutex, OnceLock};

fn to_io(err: ArchiveError) -> std::io::Error {
    std::io::Error::new(std::io::ErrorKind::InvalidData, err)
}

/// Recover a typed error that crossed an `io::Read` boundary.
pub(crate) fn from_io(err: std::io::Error) -> ArchiveError {
    if err.get_ref().is_some_and(|e| e.is::<ArchiveError>()) {
        match err.into_inner().expect("checked above").downcast::<ArchiveError>() {
            Ok(inner) => *inner,
            Err(_) => unreachable!("downcast checked above"),
        }
    } else {
        ArchiveError::Io(err)
    }
}

/// A stream transform identifier.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum Codec {
    /// No transform.
    Store,
    /// Raw DEFLATE (no container), as used inside ZIP.
    DeflateRaw,
    /// zlib-wrapped DEFLATE.
    Deflate,
    /// gzip members (concatenated members are accepted).
    Gzip,
    /// bzip2.
    Bzip2,
    /// Zstandard.
    Zstd,
    /// Brotli.
    Brotli,
    /// XZ (decode only).
    Xz,
}

impl Codec {
    /// Whether this codec can also compress (XZ and bzip2 are decode-only).
    pub fn can_compress(self) -> bool {
        !matches!(self, Self::Xz | Self::Bzip2)
    }

    /// Wrap `input` in a lazy decoding reader.
    pub fn reader<'a>(
        self,
        input: Box<dyn Read + 'a>,
        limits: &ResourceLimits,
    ) -> Result<Box<dyn Read + 'a>> {
        Ok(match self {
            Self::Store => input,
            Self::DeflateRaw => Box::new(flate2::read::DeflateDecoder::new(input)),
            Self::Deflate => Box::new(flate2::read::ZlibDecoder::new(input)),
            Self::Gzip => Box::new(flate2::read::MultiGzDecoder::new(input)),
            Self::Bzip2 => Box::new(bzip2::read::BzDecoder::new(input)),
            Self::Zstd => Box::new(
                zstd::stream::read::Decoder::new(input).map_err(ArchiveError::from)?,
            ),
            Self::Brotli => Box::new(brotli::Decompressor::new(input, 8192)),
            Self::Xz => {
                let mut options = XzOptions::default();
                options.limits = *limits;
                Box::new(XzStreamReader::new(input, options))
            }
        })
    }

    /// Decompress a whole buffer, enforcing the per-entry output ceiling.
    pub fn decompress(self, data: &[u8], limits: &ResourceLimits) -> Result<Vec<u8>> {
        if self == Self::Bzip2 {
            check_bzip2_block_size(data, limits)?;
        }
        let reader = self.reader(Box::new(data), limits)?;
        read_limited(reader, data.len() as u64, limits)
    }

    /// Compress a whole buffer. `level` follows each backend's own scale.
    pub fn compress(self, data: &[u8], level: u32) -> Result<Vec<u8>> {
        match self {
            Self::Store => Ok(data.to_vec()),
            Self::DeflateRaw => {
                let mut encoder = flate2::read::DeflateEncoder::new(
                    data,
                    flate2::Compression::new(level.min(9)),
                );
                let mut out = Vec::new();
                encoder.read_to_end(&mut out)?;
                Ok(out)
            }
            Self::Deflate => {
                let mut encoder =
                    flate2::read::ZlibEncoder::new(data, flate2::Compression::new(level.min(9)));
                let mut out = Vec::new();
                encoder.read_to_end(&mut out)?;
                Ok(out)
            }
            Self::Gzip => {
                let mut encoder =
                    flate2::read::GzEncoder::new(data, flate2::Compression::new(level.min(9)));
                let mut out = Vec::new();
                encoder.read_to_end(&mut out)?;
                Ok(out)
            }
            Self::Zstd => {
                zstd::stream::encode_all(data, level.min(21) as i32).map_err(ArchiveError::from)
            }
            Self::Brotli => {
                let mut encoder =
                    brotli::CompressorReader::new(data, 8192, level.min(11), 22);
                let mut out = Vec::new();
                encoder.read_to_end(&mut out)?;
                Ok(out)
            }
            Self::Xz | Self::Bzip2 => Err(ArchiveError::unsupported(
                ErrorCode::ZipUnsupportedMethod,
                format!("{self:?} encoding is not supported"),
            )),
        }
    }
}

/// Reject bzip2 streams whose block size digit exceeds the limit.
fn check_bzip2_block_size(data: &[u8], limits: &ResourceLimits) -> Result<()> {
    if data.len() >= 4 && &data[..3] == b"BZh" {
        let digit = data[3].wrapping_sub(b'0');
        if (1..=9).contains(&digit) && digit > limits.max_bzip2_block_size {
            return Err(ArchiveError::resource_limit(
                "Bzip2BlockSize",
                u64::from(digit),
                u64::from(limits.max_bzip2_block_size),
            ));
        }
    }
    Ok(())
}

/// Drain a reader while enforcing output and ratio ceilings.
pub(crate) fn read_limited(
    mut reader: Box<dyn Read + '_>,
    input_len: u64,
    limits: &ResourceLimits,
) -> Result<Vec<u8>> {
    let mut out = Vec::new();
    let mut chunk = [0u8; 16 * 1024];
    loop {
        let n = match reader.read(&mut chunk) {
            Ok(0) => break,
            Ok(n) => n,
            Err(e) if e.kind() == std::io::ErrorKind::Interrupted => continue,
            Err(e) => return Err(from_io(e)),
        };
        let new_len = out.len() as u64 + n as u64;
        if new_len > limits.max_entry_uncompressed_bytes {
            return Err(ArchiveError::resource_limit(
                "EntryUncompressedBytes",
                new_len,
                limits.max_entry_uncompressed_bytes,
            ));
        }
        if new_len > (1 << 20) && new_len / input_len.max(1) > limits.max_compression_ratio {
            return Err(ArchiveError::resource_limit(
                "CompressionRatio",
                new_len / input_len.max(1),
                limits.max_compression_ratio,
            ));
        }
        out.extend_from_slice(&chunk[..n]);
    }
    Ok(out)
}

/// Adapts the push-mode [`XzDecoder`] to `io::Read`.
struct XzStreamReader<R> {
    inner: R,
    decoder: XzDecoder,
    out: Vec<u8>,
    pos: usize,
    eof: bool,
}

impl<R: Read> XzStreamReader<R> {
    fn new(inner: R, options: XzOptions) -> Self {
        Self {
            inner,
            decoder: XzDecoder::new(options),
            out: Vec::new(),
            pos: 0,
            eof: false,
        }
    }
}

impl<R: Read> Read for XzStreamReader<R> {
    fn read(&mut self, buf: &mut [u8]) -> std::io::Result<usize> {
        while self.pos == self.out.len() && !self.eof {
            self.out.clear();
            self.pos = 0;
            let mut chunk = [0u8; 16 * 1024];
            let n = self.inner.read(&mut chunk)?;
            if n == 0 {
                self.decoder.finish(&mut self.out).map_err(to_io)?;
                self.eof = true;
            } else {
                self.decoder.update(&chunk[..n], &mut self.out).map_err(to_io)?;
            }
        }
        let n = buf.len().min(self.out.len() - self.pos);
        buf[..n].copy_from_slice(&self.out[self.pos..self.pos + n]);
        self.pos += n;
        Ok(n)
    }
}

/// The process-wide method registry.
#[derive(Debug)]
pub struct CodecRegistry {
    zip_methods: BTreeMap<u16, Codec>,
}

impl CodecRegistry {
    fn with_builtin(custom: &[(u16, Codec)]) -> Self {
        let mut zip_methods = BTreeMap::new();
        zip_methods.insert(0, Codec::Store);
        zip_methods.insert(8, Codec::DeflateRaw);
        zip_methods.insert(12, Codec::Bzip2);
        zip_methods.insert(93, Codec::Zstd);
        zip_methods.insert(95, Codec::Xz);
        for &(id, codec) in custom {
            zip_methods.insert(id, codec);
        }
        Self { zip_methods }
    }

    /// The codec for a ZIP method id, if registered.
    pub fn zip_method(&self, id: u16) -> Option<Codec> {
        self.zip_methods.get(&id).copied()
    }
}

static STAGED: Mutex<Vec<(u16, Codec)>> = Mutex::new(Vec::new());
static REGISTRY: OnceLock<CodecRegistry> = OnceLock::new();

/// Stage a custom ZIP method mapping. Must be called before the registry is
/// first used; later calls fail.
pub fn register_zip_method(id: u16, codec: Codec) -> Result<()> {
    if REGISTRY.get().is_some() {
        return Err(ArchiveError::structural(
            ErrorCode::CompressionBadData,
            "codec registry is already initialized",
        ));
    }
    STAGED
        .lock()
        .expect("registry staging lock")
        .push((id, codec));
    Ok(())
}

/// The global registry, initialized on first use.
pub fn registry() -> &'static CodecRegistry {
    REGISTRY.get_or_init(|| {
        let staged = STAGED.lock().expect("registry staging lock");
        CodecRegistry::with_builtin(&staged)
    })
}

/// Resolve a [`CompressionMethod`] to its transform via the registry.
pub fn codec_for_method(method: CompressionMethod) -> Result<Codec> {
    let id = method.zip_id().unwrap_or(u16::MAX);
    registry().zip_method(id).ok_or_else(|| {
        ArchiveError::unsupported(
            ErrorCode::ZipUnsupportedMethod,
            format!("no codec registered for compression method {method}"),
        )
        .with_context("methodId", id.to_string())
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn roundtrip(codec: Codec, payload: &[u8]) {
        let compressed = codec.compress(payload, 6).unwrap();
        let restored = codec
            .decompress(&compressed, &ResourceLimits::DEFAULT)
            .unwrap();
        assert_eq!(restored, payload, "{codec:?} round trip failed");
    }

    #[test]
    fn test_roundtrip_all_writable_codecs() {
        let payload: Vec<u8> = b"compressible compressible compressible data! "
            .iter()
            .copied()
            .cycle()
            .take(10_000)
            .collect();
        for codec in [
            Codec::Store,
            Codec::DeflateRaw,
            Codec::Deflate,
            Codec::Gzip,
            Codec::Zstd,
            Codec::Brotli,
        ] {
            roundtrip(codec, &payload);
            roundtrip(codec, b"");
        }
    }

    #[test]
    fn test_decode_only_codecs_refuse_to_compress() {
        assert!(Codec::Xz.compress(b"x", 6).is_err());
        assert!(Codec::Bzip2.compress(b"x", 6).is_err());
        assert!(!Codec::Xz.can_compress());
    }

    #[test]
    fn test_entry_output_ceiling() {
        let payload = vec![0u8; 200_000];
        let compressed = Codec::DeflateRaw.compress(&payload, 6).unwrap();
        let mut limits = ResourceLimits::DEFAULT;
        limits.max_entry_uncompressed_bytes = 1000;
        let err = Codec::DeflateRaw.decompress(&compressed, &limits).unwrap_err();
        assert_eq!(err.code(), ErrorCode::CompressionResourceLimit);
    }

    #[test]
    fn test_registry_builtin_methods() {
        assert_eq!(registry().zip_method(0), Some(Codec::Store));
        assert_eq!(registry().zip_method(8), Some(Codec::DeflateRaw));
        assert_eq!(registry().zip_method(12), Some(Codec::Bzip2));
        assert_eq!(registry().zip_method(93), Some(Codec::Zstd));
        assert_eq!(registry().zip_method(95), Some(Codec::Xz));
        assert_eq!(registry().zip_method(7777), None);
    }

    #[test]
    fn test_bzip2_block_size_limit() {
        let mut limits = ResourceLimits::DEFAULT;
        limits.max_bzip2_block_size = 1;
        // "BZh9" header with nothing behind it; the block-size gate fires
        // before any decoding is attempted.
        let err = Codec::Bzip2.decompress(b"BZh91AY&SY", &limits).unwrap_err();
        assert!(err.context().unwrap().contains_key("limitBzip2BlockSize"));
    }

    #[test]
    fn test_gzip_concatenated_members() {
        let mut data = Codec::Gzip.compress(b"first ", 6).unwrap();
        data.extend_from_slice(&Codec::Gzip.compress(b"second", 6).unwrap());
        let out = Codec::Gzip.decompress(&data, &ResourceLimits::DEFAULT).unwrap();
        assert_eq!(out, b"first second");
    }
}
