//! Container and codec detection.
//!
//! Classification looks at magic signatures from the head of the input (and
//! the ustar magic at offset 257 for TAR), with a filename hint as fallback
//! for formats whose signature is weak or absent (plain TAR, brotli).

use crate::codec::Codec;

/// Everything the toolkit can classify.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ArchiveFormat {
    /// ZIP archive.
    Zip,
    /// TAR archive.
    Tar,
    /// gzip stream.
    Gzip,
    /// bzip2 stream.
    Bzip2,
    /// XZ stream.
    Xz,
    /// Zstandard stream.
    Zstd,
    /// Brotli stream (no signature; hint-only).
    Brotli,
    /// Nothing recognizable.
    Unknown,
}

impl ArchiveFormat {
    /// Detect from leading bytes (at least 262 bytes for TAR detection).
    pub fn from_magic(magic: &[u8]) -> Self {
        if magic.len() >= 4
            && magic.starts_with(&[0x50, 0x4B])
            && matches!(&magic[2..4], [0x03, 0x04] | [0x05, 0x06] | [0x07, 0x08])
        {
            return Self::Zip;
        }
        if magic.starts_with(&[0x1F, 0x8B]) {
            return Self::Gzip;
        }
        if magic.len() >= 6 && magic.starts_with(&[0xFD, 0x37, 0x7A, 0x58, 0x5A, 0x00]) {
            return Self::Xz;
        }
        if magic.len() >= 3 && magic.starts_with(b"BZh") {
            return Self::Bzip2;
        }
        if magic.len() >= 4 && magic.starts_with(&[0x28, 0xB5, 0x2F, 0xFD]) {
            return Self::Zstd;
        }
        if magic.len() >= 262 && &magic[257..262] == b"ustar" {
            return Self::Tar;
        }
        Self::Unknown
    }

    /// Detect from a filename extension.
    pub fn from_filename(name: &str) -> Self {
        let lower = name.to_ascii_lowercase();
        if lower.ends_with(".zip") {
            Self::Zip
        } else if lower.ends_with(".tar") {
            Self::Tar
        } else if lower.ends_with(".gz") || lower.ends_with(".tgz") {
            Self::Gzip
        } else if lower.ends_with(".bz2") || lower.ends_with(".tbz2") {
            Self::Bzip2
        } else if lower.ends_with(".xz") || lower.ends_with(".txz") {
            Self::Xz
        } else if lower.ends_with(".zst") {
            Self::Zstd
        } else if lower.ends_with(".br") {
            Self::Brotli
        } else {
            Self::Unknown
        }
    }

    /// Detect from magic first, falling back to the filename hint.
    pub fn classify(magic: &[u8], filename_hint: Option<&str>) -> Self {
        let by_magic = Self::from_magic(magic);
        if by_magic != Self::Unknown {
            return by_magic;
        }
        match filename_hint.map(Self::from_filename) {
            Some(Self::Unknown) | None => Self::Unknown,
            Some(hinted) => hinted,
        }
    }

    /// Whether this is a single-file compression layer.
    pub fn is_compression_only(self) -> bool {
        matches!(
            self,
            Self::Gzip | Self::Bzip2 | Self::Xz | Self::Zstd | Self::Brotli
        )
    }

    /// Whether this is a multi-entry container.
    pub fn is_container(self) -> bool {
        matches!(self, Self::Zip | Self::Tar)
    }

    /// The codec implementing this compression layer.
    pub fn codec(self) -> Option<Codec> {
        match self {
            Self::Gzip => Some(Codec::Gzip),
            Self::Bzip2 => Some(Codec::Bzip2),
            Self::Xz => Some(Codec::Xz),
            Self::Zstd => Some(Codec::Zstd),
            Self::Brotli => Some(Codec::Brotli),
            _ => None,
        }
    }

    /// The report name of this format.
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Zip => "zip",
            Self::Tar => "tar",
            Self::Gzip => "gzip",
            Self::Bzip2 => "bzip2",
            Self::Xz => "xz",
            Self::Zstd => "zstd",
            Self::Brotli => "brotli",
            Self::Unknown => "unknown",
        }
    }
}

impl std::fmt::Display for ArchiveFormat {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// How the input was handed to the library.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InputKind {
    /// An in-memory byte buffer.
    Bytes,
    /// A sequential stream.
    Stream,
    /// A blob with random access.
    Blob,
    /// A file path.
    File,
    /// A URL-backed range session.
    Url,
}

impl InputKind {
    /// The report name of this input kind.
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Bytes => "bytes",
            Self::Stream => "stream",
            Self::Blob => "blob",
            Self::File => "file",
            Self::Url => "url",
        }
    }
}

/// The outcome of layered classification: compression layers outside-in,
/// then the innermost format.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Detection {
    /// How the input was provided.
    pub input_kind: InputKind,
    /// Outside-in compression layers, e.g. `[xz]` for a `.tar.xz`.
    pub layers: Vec<ArchiveFormat>,
    /// The innermost recognized format.
    pub format: ArchiveFormat,
}
