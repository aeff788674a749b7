//! Resource ceilings and strictness profiles.
//!
//! Every decoder and reader in the workspace checks these ceilings before
//! allocating and after each decoded chunk. The two presets are frozen;
//! callers override individual fields on a copy rather than mutating the
//! presets themselves.

use crate::error::ErrorCode;

/// Named resource ceilings applied across all formats.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ResourceLimits {
    /// Maximum number of entries a container may declare.
    pub max_entries: u64,
    /// Maximum uncompressed bytes for a single entry.
    pub max_entry_uncompressed_bytes: u64,
    /// Maximum total uncompressed bytes across an operation.
    pub max_total_uncompressed_bytes: u64,
    /// Maximum uncompressed:compressed ratio before a bomb is assumed.
    pub max_compression_ratio: u64,
    /// Maximum LZMA2 dictionary size accepted, in bytes.
    pub max_dictionary_bytes: u64,
    /// Maximum number of XZ index records across all streams.
    pub max_xz_index_records: u64,
    /// Maximum encoded size of all XZ indexes, in bytes.
    pub max_xz_index_bytes: u64,
    /// Maximum unconsumed input the XZ decoder may buffer for one transition.
    pub max_xz_buffered_input_bytes: u64,
    /// Maximum block headers the XZ preflight will visit.
    pub max_xz_preflight_block_headers: u64,
    /// Maximum encoded central directory size accepted.
    pub max_zip_central_directory_bytes: u64,
    /// Maximum archive or entry comment size accepted.
    pub max_zip_comment_bytes: u64,
    /// How far back from EOF the EOCD scan may look.
    pub zip_eocd_search_window: u64,
    /// Maximum bzip2 block size digit accepted (1..=9, in 100 kB units).
    pub max_bzip2_block_size: u8,
}

impl ResourceLimits {
    /// Default ceilings for interactive use.
    pub const DEFAULT: Self = Self {
        max_entries: 1_000_000,
        max_entry_uncompressed_bytes: 4 << 30,
        max_total_uncompressed_bytes: 16 << 30,
        max_compression_ratio: 2048,
        max_dictionary_bytes: 1 << 30,
        max_xz_index_records: 1 << 20,
        max_xz_index_bytes: 16 << 20,
        max_xz_buffered_input_bytes: 1 << 20,
        max_xz_preflight_block_headers: 1 << 16,
        max_zip_central_directory_bytes: 256 << 20,
        max_zip_comment_bytes: 65_535,
        zip_eocd_search_window: (64 << 10) + 22,
        max_bzip2_block_size: 9,
    };

    /// Tighter ceilings for unattended (agent) use.
    pub const AGENT: Self = Self {
        max_entries: 10_000,
        max_entry_uncompressed_bytes: 256 << 20,
        max_total_uncompressed_bytes: 1 << 30,
        max_compression_ratio: 512,
        max_dictionary_bytes: 64 << 20,
        max_xz_index_records: 1 << 14,
        max_xz_index_bytes: 1 << 20,
        max_xz_buffered_input_bytes: 1 << 20,
        max_xz_preflight_block_headers: 1 << 12,
        max_zip_central_directory_bytes: 16 << 20,
        max_zip_comment_bytes: 65_535,
        zip_eocd_search_window: (64 << 10) + 22,
        max_bzip2_block_size: 9,
    };
}

impl Default for ResourceLimits {
    fn default() -> Self {
        Self::DEFAULT
    }
}

/// A named bundle of strictness behavior and limit defaults.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Profile {
    /// Tolerant: a fixed set of structural and encoding issues become
    /// audit warnings instead of errors.
    Compat,
    /// Raise on every anomaly.
    #[default]
    Strict,
    /// Strict behavior with the tighter `AGENT` limits.
    Agent,
}

impl Profile {
    /// The limit preset associated with this profile.
    pub fn limits(self) -> ResourceLimits {
        match self {
            Self::Compat | Self::Strict => ResourceLimits::DEFAULT,
            Self::Agent => ResourceLimits::AGENT,
        }
    }

    /// Whether this profile downgrades the given code from error to warning.
    ///
    /// This is the single gate the readers and decoders consult before
    /// tolerating a structural anomaly. The set is explicit rather than
    /// inferred: only `compat` downgrades, and only these classes:
    ///
    /// - `COMPRESSION_XZ_UNSUPPORTED_CHECK`: skip the unverifiable check
    /// - `ZIP_BAD_EOCD`: duplicate EOCD records, trailing bytes after EOCD
    /// - `ZIP_BAD_HEADER`: malformed UTF-8 names, NUL bytes in names,
    ///   truncated central directory
    ///
    /// Integrity failures (CRC, HMAC) never downgrade.
    pub fn downgrades(self, code: ErrorCode) -> bool {
        match self {
            Self::Strict | Self::Agent => false,
            Self::Compat => matches!(
                code,
                ErrorCode::CompressionXzUnsupportedCheck
                    | ErrorCode::ZipBadEocd
                    | ErrorCode::ZipBadHeader
            ),
        }
    }

    /// The profile name used in reports.
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Compat => "compat",
            Self::Strict => "strict",
            Self::Agent => "agent",
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_presets_differ() {
        assert!(ResourceLimits::AGENT.max_entries < ResourceLimits::DEFAULT.max_entries);
        assert!(
            ResourceLimits::AGENT.max_total_uncompressed_bytes
                < ResourceLimits::DEFAULT.max_total_uncompressed_bytes
        );
        assert_eq!(ResourceLimits::default(), ResourceLimits::DEFAULT);
    }

    #[test]
    fn test_field_override_leaves_preset_frozen() {
        let mut mine = ResourceLimits::DEFAULT;
        mine.max_xz_index_records = 1;
        assert_eq!(ResourceLimits::DEFAULT.max_xz_index_records, 1 << 20);
        assert_eq!(mine.max_xz_index_records, 1);
    }

    #[test]
    fn test_profile_downgrades() {
        assert!(Profile::Compat.downgrades(ErrorCode::CompressionXzUnsupportedCheck));
        assert!(Profile::Compat.downgrades(ErrorCode::ZipBadEocd));
        assert!(Profile::Compat.downgrades(ErrorCode::ZipBadHeader));
        assert!(!Profile::Strict.downgrades(ErrorCode::CompressionXzUnsupportedCheck));
        assert!(!Profile::Agent.downgrades(ErrorCode::CompressionXzUnsupportedCheck));
        // Integrity and security failures never downgrade.
        assert!(!Profile::Compat.downgrades(ErrorCode::ZipBadCrc));
        assert!(!Profile::Compat.downgrades(ErrorCode::ZipAuthFailed));
        assert!(!Profile::Compat.downgrades(ErrorCode::TarPathTraversal));
    }

    #[test]
    fn test_profile_limits() {
        assert_eq!(Profile::Agent.limits(), ResourceLimits::AGENT);
        assert_eq!(Profile::Strict.limits(), ResourceLimits::DEFAULT);
    }
}
