//! Format-agnostic archive entry metadata.
//!
//! Entries are immutable snapshots created while a container's directory or
//! header stream is parsed. They are plain value types: they never borrow
//! from the reader that produced them.

/// Compression method attached to an entry.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum CompressionMethod {
    /// No compression (stored).
    #[default]
    Store,
    /// Raw DEFLATE (ZIP method 8).
    Deflate,
    /// Bzip2 (ZIP method 12).
    Bzip2,
    /// Zstandard (ZIP method 93).
    Zstd,
    /// XZ (ZIP method 95).
    Xz,
    /// Unknown or unsupported method id.
    Unknown(u16),
}

impl CompressionMethod {
    /// Map a ZIP method id.
    pub fn from_zip_id(id: u16) -> Self {
        match id {
            0 => Self::Store,
            8 => Self::Deflate,
            12 => Self::Bzip2,
            93 => Self::Zstd,
            95 => Self::Xz,
            other => Self::Unknown(other),
        }
    }

    /// The ZIP method id for this method, when one exists.
    pub fn zip_id(self) -> Option<u16> {
        match self {
            Self::Store => Some(0),
            Self::Deflate => Some(8),
            Self::Bzip2 => Some(12),
            Self::Zstd => Some(93),
            Self::Xz => Some(95),
            Self::Unknown(id) => Some(id),
        }
    }

    /// Human-readable method name.
    pub fn name(self) -> &'static str {
        match self {
            Self::Store => "store",
            Self::Deflate => "deflate",
            Self::Bzip2 => "bzip2",
            Self::Zstd => "zstd",
            Self::Xz => "xz",
            Self::Unknown(_) => "unknown",
        }
    }
}

impl std::fmt::Display for CompressionMethod {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Unknown(id) => write!(f, "unknown({id})"),
            _ => f.write_str(self.name()),
        }
    }
}

/// Entry type marker.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum EntryKind {
    /// Regular file.
    #[default]
    File,
    /// Directory.
    Directory,
    /// Symbolic link.
    Symlink,
    /// Hard link.
    Hardlink,
    /// Anything else (fifo, device, unknown typeflag).
    Other,
}

impl EntryKind {
    /// Whether this is a regular file.
    pub fn is_file(self) -> bool {
        matches!(self, Self::File)
    }

    /// Whether this is a directory.
    pub fn is_dir(self) -> bool {
        matches!(self, Self::Directory)
    }

    /// Whether this is a symlink.
    pub fn is_symlink(self) -> bool {
        matches!(self, Self::Symlink)
    }
}

/// Where an entry's decoded name came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum NameSource {
    /// The name bytes were valid UTF-8 (or flagged as UTF-8 by the format).
    #[default]
    Utf8,
    /// The name was decoded from CP437.
    Cp437,
    /// The name came from an Info-ZIP Unicode Path extra field.
    UnicodeExtra,
}

impl NameSource {
    /// The wire name used in reports.
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Utf8 => "utf8",
            Self::Cp437 => "cp437",
            Self::UnicodeExtra => "unicode-extra",
        }
    }
}

/// Host attributes carried by an entry.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct FileAttributes {
    /// Unix mode bits.
    pub unix_mode: Option<u32>,
    /// DOS attribute byte.
    pub dos_attributes: Option<u8>,
    /// Owner uid.
    pub uid: Option<u32>,
    /// Owner gid.
    pub gid: Option<u32>,
    /// Owner user name (TAR).
    pub uname: Option<String>,
    /// Owner group name (TAR).
    pub gname: Option<String>,
}

/// An entry in an archive, as observed by a reader.
#[derive(Debug, Clone, Default)]
pub struct ArchiveEntry {
    /// Decoded, path-normalized name. Never contains a NUL byte.
    pub name: String,
    /// The raw name bytes as stored in the container.
    pub raw_name: Vec<u8>,
    /// How `name` was decoded from `raw_name`.
    pub name_source: NameSource,
    /// Entry type marker.
    pub kind: EntryKind,
    /// Uncompressed size in bytes.
    pub size: u64,
    /// Compressed size in bytes.
    pub compressed_size: u64,
    /// Compression method.
    pub method: CompressionMethod,
    /// CRC-32 of the uncompressed data, when the format stores one.
    pub crc32: Option<u32>,
    /// Absolute byte offset of the entry's header within the container.
    pub header_offset: u64,
    /// Modification time, seconds since the Unix epoch.
    pub modified: Option<i64>,
    /// Access time, seconds since the Unix epoch.
    pub accessed: Option<i64>,
    /// Creation time, seconds since the Unix epoch.
    pub created: Option<i64>,
    /// Whether the entry payload is encrypted.
    pub encrypted: bool,
    /// Whether the entry required ZIP64 fields.
    pub zip64: bool,
    /// Entry comment, when present.
    pub comment: Option<String>,
    /// Symlink target, when the entry is a link.
    pub link_target: Option<String>,
    /// Host attributes.
    pub attributes: FileAttributes,
}

impl ArchiveEntry {
    /// Create a file entry with the given name and size.
    pub fn file(name: impl Into<String>, size: u64) -> Self {
        let name = name.into();
        Self {
            raw_name: name.as_bytes().to_vec(),
            name,
            size,
            compressed_size: size,
            ..Self::default()
        }
    }

    /// Create a directory entry.
    pub fn directory(name: impl Into<String>) -> Self {
        let mut entry = Self::file(name, 0);
        entry.kind = EntryKind::Directory;
        entry
    }

    /// Whether this is a regular file.
    pub fn is_file(&self) -> bool {
        self.kind.is_file()
    }

    /// Whether this is a directory.
    pub fn is_dir(&self) -> bool {
        self.kind.is_dir()
    }

    /// Whether this is a symlink.
    pub fn is_symlink(&self) -> bool {
        self.kind.is_symlink()
    }

    /// Uncompressed:compressed ratio, used by bomb heuristics.
    pub fn expansion_ratio(&self) -> u64 {
        if self.compressed_size == 0 {
            if self.size == 0 { 1 } else { u64::MAX }
        } else {
            self.size / self.compressed_size
        }
    }

    /// Reasons a path is unsafe to extract, in evaluation order.
    ///
    /// Checks NUL bytes, absolute paths (Unix and Windows forms, including
    /// drive letters), and `..` traversal segments.
    pub fn path_violation(&self) -> Option<PathViolation> {
        path_violation(&self.name)
    }

    /// A sanitized relative path with traversal and absolute components
    /// removed. Suitable for extraction.
    pub fn sanitized_name(&self) -> String {
        sanitize_path(&self.name)
    }
}

/// Why a path was rejected.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PathViolation {
    /// The name contains a NUL byte.
    NulByte,
    /// The name is absolute (`/...`, `\...`) or carries a drive letter.
    Absolute,
    /// The name contains a `..` segment.
    Traversal,
}

impl PathViolation {
    /// Short description for report messages.
    pub fn describe(self) -> &'static str {
        match self {
            Self::NulByte => "name contains a NUL byte",
            Self::Absolute => "absolute path",
            Self::Traversal => "parent-directory traversal",
        }
    }
}

/// Evaluate path safety for an arbitrary name.
pub fn path_violation(name: &str) -> Option<PathViolation> {
    if name.contains('\0') {
        return Some(PathViolation::NulByte);
    }
    if name.starts_with('/') || name.starts_with('\\') {
        return Some(PathViolation::Absolute);
    }
    let bytes = name.as_bytes();
    if bytes.len() >= 2 && bytes[1] == b':' && bytes[0].is_ascii_alphabetic() {
        return Some(PathViolation::Absolute);
    }
    for segment in name.split(['/', '\\']) {
        if segment == ".." {
            return Some(PathViolation::Traversal);
        }
    }
    None
}

/// Strip traversal and absolute components from a name.
pub fn sanitize_path(name: &str) -> String {
    let mut out = String::new();
    let trailing_dir = name.ends_with('/');
    for segment in name.split(['/', '\\']) {
        if segment.is_empty() || segment == "." || segment == ".." {
            continue;
        }
        let segment = segment.replace('\0', "_");
        let bytes = segment.as_bytes();
        let segment = if bytes.len() >= 2 && bytes[1] == b':' && bytes[0].is_ascii_alphabetic() {
            segment[2..].to_string()
        } else {
            segment
        };
        if segment.is_empty() {
            continue;
        }
        if !out.is_empty() {
            out.push('/');
        }
        out.push_str(&segment);
    }
    if trailing_dir && !out.is_empty() {
        out.push('/');
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_method_zip_ids() {
        assert_eq!(CompressionMethod::from_zip_id(0), CompressionMethod::Store);
        assert_eq!(
            CompressionMethod::from_zip_id(8),
            CompressionMethod::Deflate
        );
        assert_eq!(CompressionMethod::from_zip_id(93), CompressionMethod::Zstd);
        assert_eq!(CompressionMethod::from_zip_id(95), CompressionMethod::Xz);
        assert!(matches!(
            CompressionMethod::from_zip_id(14),
            CompressionMethod::Unknown(14)
        ));
        assert_eq!(CompressionMethod::Deflate.zip_id(), Some(8));
    }

    #[test]
    fn test_path_violations() {
        assert_eq!(path_violation("docs/a.txt"), None);
        assert_eq!(path_violation("../etc/passwd"), Some(PathViolation::Traversal));
        assert_eq!(path_violation("a/../../b"), Some(PathViolation::Traversal));
        assert_eq!(path_violation("/etc/passwd"), Some(PathViolation::Absolute));
        assert_eq!(path_violation("C:\\boot.ini"), Some(PathViolation::Absolute));
        assert_eq!(path_violation("bad\0name"), Some(PathViolation::NulByte));
    }

    #[test]
    fn test_sanitize_path() {
        assert_eq!(sanitize_path("../etc/passwd"), "etc/passwd");
        assert_eq!(sanitize_path("/abs/file.txt"), "abs/file.txt");
        assert_eq!(sanitize_path("./a/./b/../c"), "a/b/c");
        assert_eq!(sanitize_path("dir/"), "dir/");
        assert_eq!(sanitize_path("C:\\win\\path"), "win/path");
    }

    #[test]
    fn test_expansion_ratio() {
        let mut entry = ArchiveEntry::file("a", 1000);
        entry.compressed_size = 10;
        assert_eq!(entry.expansion_ratio(), 100);
        entry.compressed_size = 0;
        assert_eq!(entry.expansion_ratio(), u64::MAX);
        entry.size = 0;
        assert_eq!(entry.expansion_ratio(), 1);
    }

    #[test]
    fn test_entry_builders() {
        let dir = ArchiveEntry::directory("sub/");
        assert!(dir.is_dir());
        let file = ArchiveEntry::file("a.txt", 5);
        assert!(file.is_file());
        assert_eq!(file.raw_name, b"a.txt");
    }
}
