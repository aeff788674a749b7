//! Error types for ferropack operations.
//!
//! Every failure carries a stable string code from a fixed catalogue, a short
//! remediation hint, and a context map whose values are always strings (offsets
//! included, to avoid JSON precision loss). [`ArchiveError::to_json`] renders
//! the schema-versioned object consumed by external tooling.

use std::collections::BTreeMap;
use std::io;
use thiserror::Error;

/// String-only context attached to errors and report issues.
pub type ErrorContext = BTreeMap<String, String>;

/// Stable machine-readable error codes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[non_exhaustive]
pub enum ErrorCode {
    /// Malformed data in a compression stream (non-XZ).
    CompressionBadData,
    /// Any resource ceiling from the limits configuration was exceeded.
    CompressionResourceLimit,
    /// Malformed XZ structure.
    CompressionXzBadData,
    /// XZ input ended before a complete structure.
    CompressionXzTruncated,
    /// XZ stream uses a check type this build does not implement.
    CompressionXzUnsupportedCheck,
    /// XZ block uses an unknown filter id or invalid filter properties.
    CompressionXzUnsupportedFilter,
    /// A single XZ state transition would need more buffered input than allowed.
    CompressionXzBufferLimit,
    /// EOCD record missing, duplicated, or inconsistent.
    ZipBadEocd,
    /// Archive spans multiple disks.
    ZipMultiDisk,
    /// Central or local header malformed.
    ZipBadHeader,
    /// Entry data failed CRC-32 or size verification.
    ZipBadCrc,
    /// WinZip AES authentication code mismatch.
    ZipAuthFailed,
    /// Entry is encrypted and no password was supplied.
    ZipPasswordRequired,
    /// Supplied password failed the format's verifier.
    ZipBadPassword,
    /// Compression method with no registered codec.
    ZipUnsupportedMethod,
    /// Sizes or offsets require ZIP64 but the writer was configured without it.
    ZipZip64Required,
    /// Exact-path duplicate rejected by policy.
    ZipNameCollision,
    /// NFC case-fold collision between distinct names.
    ZipUnicodeCollision,
    /// Exact-path duplicate in a TAR archive rejected by policy.
    TarNameCollision,
    /// NFC case-fold collision in a TAR archive.
    TarUnicodeCollision,
    /// Symlink entry rejected by policy.
    ArchiveSymlinkRejected,
    /// Entry that cannot be represented or decoded, rejected by policy.
    ArchiveUnsupportedEntry,
    /// Malformed TAR header block.
    TarBadHeader,
    /// TAR header checksum mismatch.
    TarBadChecksum,
    /// Entry path escapes the extraction root.
    TarPathTraversal,
    /// TAR size field beyond the supported 2^63-1 range.
    TarSizeOverflow,
    /// Input matched no known container or codec signature.
    ArchiveUnknownFormat,
    /// Cooperative cancellation was requested.
    OperationCancelled,
    /// Underlying I/O failure.
    IoError,
}

impl ErrorCode {
    /// The stable wire representation of this code.
    pub fn as_str(self) -> &'static str {
        match self {
            Self::CompressionBadData => "COMPRESSION_BAD_DATA",
            Self::CompressionResourceLimit => "COMPRESSION_RESOURCE_LIMIT",
            Self::CompressionXzBadData => "COMPRESSION_XZ_BAD_DATA",
            Self::CompressionXzTruncated => "COMPRESSION_XZ_TRUNCATED",
            Self::CompressionXzUnsupportedCheck => "COMPRESSION_XZ_UNSUPPORTED_CHECK",
            Self::CompressionXzUnsupportedFilter => "COMPRESSION_XZ_UNSUPPORTED_FILTER",
            Self::CompressionXzBufferLimit => "COMPRESSION_XZ_BUFFER_LIMIT",
            Self::ZipBadEocd => "ZIP_BAD_EOCD",
            Self::ZipMultiDisk => "ZIP_MULTI_DISK",
            Self::ZipBadHeader => "ZIP_BAD_HEADER",
            Self::ZipBadCrc => "ZIP_BAD_CRC",
            Self::ZipAuthFailed => "ZIP_AUTH_FAILED",
            Self::ZipPasswordRequired => "ZIP_PASSWORD_REQUIRED",
            Self::ZipBadPassword => "ZIP_BAD_PASSWORD",
            Self::ZipUnsupportedMethod => "ZIP_UNSUPPORTED_METHOD",
            Self::ZipZip64Required => "ZIP_ZIP64_REQUIRED",
            Self::ZipNameCollision => "ZIP_NAME_COLLISION",
            Self::ZipUnicodeCollision => "ZIP_UNICODE_COLLISION",
            Self::TarNameCollision => "TAR_NAME_COLLISION",
            Self::TarUnicodeCollision => "TAR_UNICODE_COLLISION",
            Self::ArchiveSymlinkRejected => "ARCHIVE_SYMLINK_REJECTED",
            Self::ArchiveUnsupportedEntry => "ARCHIVE_UNSUPPORTED_ENTRY",
            Self::TarBadHeader => "TAR_BAD_HEADER",
            Self::TarBadChecksum => "TAR_BAD_CHECKSUM",
            Self::TarPathTraversal => "TAR_PATH_TRAVERSAL",
            Self::TarSizeOverflow => "TAR_SIZE_OVERFLOW",
            Self::ArchiveUnknownFormat => "ARCHIVE_UNKNOWN_FORMAT",
            Self::OperationCancelled => "OPERATION_CANCELLED",
            Self::IoError => "IO_ERROR",
        }
    }

    /// A short human-readable remediation hint for this code.
    pub fn hint(self) -> &'static str {
        match self {
            Self::CompressionBadData | Self::CompressionXzBadData => {
                "The input is corrupt or was produced by an incompatible tool."
            }
            Self::CompressionResourceLimit | Self::CompressionXzBufferLimit => {
                "Raise the relevant resource limit if the input is trusted."
            }
            Self::CompressionXzTruncated => "The input ended early; obtain the complete file.",
            Self::CompressionXzUnsupportedCheck => {
                "Re-create the stream with CRC32, CRC64, SHA-256, or no check."
            }
            Self::CompressionXzUnsupportedFilter => {
                "Only LZMA2, Delta, and BCJ filters are supported."
            }
            Self::ZipBadEocd => "The archive tail is damaged or this is not a ZIP file.",
            Self::ZipMultiDisk => "Multi-disk archives are not supported; re-create as one file.",
            Self::ZipBadHeader | Self::TarBadHeader => {
                "The archive is corrupt or uses an unsupported variant."
            }
            Self::ZipBadCrc | Self::TarBadChecksum => {
                "Stored and computed checksums differ; the data is damaged."
            }
            Self::ZipAuthFailed => "Wrong password, or the encrypted data was tampered with.",
            Self::ZipPasswordRequired => "Supply a password to read this entry.",
            Self::ZipBadPassword => "The password does not match this entry.",
            Self::ZipUnsupportedMethod => "No codec is registered for this compression method.",
            Self::ZipZip64Required => "Enable ZIP64 to store entries of this size.",
            Self::ZipNameCollision
            | Self::ZipUnicodeCollision
            | Self::TarNameCollision
            | Self::TarUnicodeCollision => {
                "Rename the colliding entries or choose a different collision policy."
            }
            Self::ArchiveSymlinkRejected => {
                "Drop symlinks or switch the symlink policy to allow dropping them."
            }
            Self::ArchiveUnsupportedEntry => {
                "Supply a password or drop entries the toolkit cannot decode."
            }
            Self::TarPathTraversal => "Reject or sanitize the entry path before extraction.",
            Self::TarSizeOverflow => "Sizes of 2^63 bytes and above are not supported.",
            Self::ArchiveUnknownFormat => "No known container or codec signature was found.",
            Self::OperationCancelled => "The operation was cancelled by its caller.",
            Self::IoError => "Check the underlying source or destination.",
        }
    }
}

impl std::fmt::Display for ErrorCode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// The main error type for ferropack operations.
///
/// Variants follow the taxonomy from the report contract: structural,
/// integrity, unsupported, limit, security, I/O, and cancellation. Every
/// variant except `Io` and `Cancelled` carries its code explicitly; those two
/// map to fixed codes.
#[derive(Debug, Error)]
pub enum ArchiveError {
    /// I/O error from an underlying source or sink.
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),

    /// Malformed container or stream structure.
    #[error("{message}")]
    Structural {
        /// Stable error code.
        code: ErrorCode,
        /// Human-readable description.
        message: String,
        /// String-only context values.
        context: ErrorContext,
    },

    /// A stored checksum or authentication code did not match.
    #[error("{message}")]
    Integrity {
        /// Stable error code.
        code: ErrorCode,
        /// Human-readable description.
        message: String,
        /// String-only context values.
        context: ErrorContext,
    },

    /// The input uses a feature this build does not implement.
    #[error("{message}")]
    Unsupported {
        /// Stable error code.
        code: ErrorCode,
        /// Human-readable description.
        message: String,
        /// String-only context values.
        context: ErrorContext,
    },

    /// A configured resource ceiling was exceeded.
    #[error("{message}")]
    Limit {
        /// Stable error code.
        code: ErrorCode,
        /// Human-readable description.
        message: String,
        /// String-only context values.
        context: ErrorContext,
    },

    /// A security policy rejected the input.
    #[error("{message}")]
    Security {
        /// Stable error code.
        code: ErrorCode,
        /// Human-readable description.
        message: String,
        /// String-only context values.
        context: ErrorContext,
    },

    /// The operation was cancelled via its cancellation token.
    #[error("operation cancelled")]
    Cancelled,
}

/// Result type alias for ferropack operations.
pub type Result<T> = std::result::Result<T, ArchiveError>;

impl ArchiveError {
    fn make(
        variant: fn(ErrorCode, String, ErrorContext) -> Self,
        code: ErrorCode,
        message: impl Into<String>,
    ) -> Self {
        variant(code, message.into(), ErrorContext::new())
    }

    /// Create a structural error with the given code.
    pub fn structural(code: ErrorCode, message: impl Into<String>) -> Self {
        Self::make(
            |code, message, context| Self::Structural {
                code,
                message,
                context,
            },
            code,
            message,
        )
    }

    /// Create an integrity error with the given code.
    pub fn integrity(code: ErrorCode, message: impl Into<String>) -> Self {
        Self::make(
            |code, message, context| Self::Integrity {
                code,
                message,
                context,
            },
            code,
            message,
        )
    }

    /// Create an unsupported-feature error with the given code.
    pub fn unsupported(code: ErrorCode, message: impl Into<String>) -> Self {
        Self::make(
            |code, message, context| Self::Unsupported {
                code,
                message,
                context,
            },
            code,
            message,
        )
    }

    /// Create a limit error with the given code.
    pub fn limit(code: ErrorCode, message: impl Into<String>) -> Self {
        Self::make(
            |code, message, context| Self::Limit {
                code,
                message,
                context,
            },
            code,
            message,
        )
    }

    /// Create a security error with the given code.
    pub fn security(code: ErrorCode, message: impl Into<String>) -> Self {
        Self::make(
            |code, message, context| Self::Security {
                code,
                message,
                context,
            },
            code,
            message,
        )
    }

    /// Create a `COMPRESSION_RESOURCE_LIMIT` error whose context names the
    /// required and configured values as `required<What>` / `limit<What>`.
    pub fn resource_limit(what: &str, required: u64, limit: u64) -> Self {
        Self::limit(
            ErrorCode::CompressionResourceLimit,
            format!("{what} limit exceeded: required {required}, limit {limit}"),
        )
        .with_context(format!("required{what}"), required.to_string())
        .with_context(format!("limit{what}"), limit.to_string())
    }

    /// Attach a context key/value pair. Keys colliding with top-level report
    /// keys (`name`, `code`, `message`, `hint`, `schemaVersion`) are prefixed.
    pub fn with_context(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        let mut key = key.into();
        if matches!(
            key.as_str(),
            "name" | "code" | "message" | "hint" | "context" | "schemaVersion"
        ) {
            key.insert_str(0, "ctx.");
        }
        if let Some(context) = self.context_mut() {
            context.insert(key, value.into());
        }
        self
    }

    /// The stable code for this error.
    pub fn code(&self) -> ErrorCode {
        match self {
            Self::Io(_) => ErrorCode::IoError,
            Self::Cancelled => ErrorCode::OperationCancelled,
            Self::Structural { code, .. }
            | Self::Integrity { code, .. }
            | Self::Unsupported { code, .. }
            | Self::Limit { code, .. }
            | Self::Security { code, .. } => *code,
        }
    }

    /// The taxonomy name for this error, used as the JSON `name` field.
    pub fn name(&self) -> &'static str {
        match self {
            Self::Io(_) => "IoError",
            Self::Structural { .. } => "StructuralError",
            Self::Integrity { .. } => "IntegrityError",
            Self::Unsupported { .. } => "UnsupportedError",
            Self::Limit { .. } => "LimitError",
            Self::Security { .. } => "SecurityError",
            Self::Cancelled => "CancelledError",
        }
    }

    /// The context map, if this variant carries one.
    pub fn context(&self) -> Option<&ErrorContext> {
        match self {
            Self::Structural { context, .. }
            | Self::Integrity { context, .. }
            | Self::Unsupported { context, .. }
            | Self::Limit { context, .. }
            | Self::Security { context, .. } => Some(context),
            Self::Io(_) | Self::Cancelled => None,
        }
    }

    fn context_mut(&mut self) -> Option<&mut ErrorContext> {
        match self {
            Self::Structural { context, .. }
            | Self::Integrity { context, .. }
            | Self::Unsupported { context, .. }
            | Self::Limit { context, .. }
            | Self::Security { context, .. } => Some(context),
            Self::Io(_) | Self::Cancelled => None,
        }
    }

    /// Render the schema-versioned JSON object for this error.
    pub fn to_json(&self) -> serde_json::Value {
        let context: serde_json::Map<String, serde_json::Value> = self
            .context()
            .map(|ctx| {
                ctx.iter()
                    .map(|(k, v)| (k.clone(), serde_json::Value::String(v.clone())))
                    .collect()
            })
            .unwrap_or_default();
        serde_json::json!({
            "schemaVersion": "1",
            "name": self.name(),
            "code": self.code().as_str(),
            "message": self.to_string(),
            "hint": self.code().hint(),
            "context": context,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_code_strings_are_stable() {
        assert_eq!(
            ErrorCode::CompressionXzBadData.as_str(),
            "COMPRESSION_XZ_BAD_DATA"
        );
        assert_eq!(ErrorCode::ZipAuthFailed.as_str(), "ZIP_AUTH_FAILED");
        assert_eq!(ErrorCode::TarPathTraversal.as_str(), "TAR_PATH_TRAVERSAL");
    }

    #[test]
    fn test_resource_limit_context() {
        let err = ArchiveError::resource_limit("IndexRecords", 2, 1);
        let ctx = err.context().unwrap();
        assert_eq!(ctx.get("requiredIndexRecords").unwrap(), "2");
        assert_eq!(ctx.get("limitIndexRecords").unwrap(), "1");
        assert_eq!(err.code(), ErrorCode::CompressionResourceLimit);
    }

    #[test]
    fn test_context_never_shadows_top_level_keys() {
        let err = ArchiveError::structural(ErrorCode::ZipBadHeader, "bad header")
            .with_context("code", "sneaky");
        let ctx = err.context().unwrap();
        assert!(ctx.contains_key("ctx.code"));
        assert!(!ctx.contains_key("code"));
    }

    #[test]
    fn test_json_shape() {
        let err = ArchiveError::integrity(ErrorCode::ZipBadCrc, "CRC mismatch")
            .with_context("entryName", "a.txt")
            .with_context("offset", "12345678901");
        let json = err.to_json();
        assert_eq!(json["schemaVersion"], "1");
        assert_eq!(json["name"], "IntegrityError");
        assert_eq!(json["code"], "ZIP_BAD_CRC");
        assert_eq!(json["context"]["offset"], "12345678901");
        assert_eq!(json["hint"], ErrorCode::ZipBadCrc.hint());
    }

    #[test]
    fn test_io_error_conversion() {
        let io_err = io::Error::new(io::ErrorKind::NotFound, "file not found");
        let err: ArchiveError = io_err.into();
        assert_eq!(err.code(), ErrorCode::IoError);
        assert!(matches!(err, ArchiveError::Io(_)));
    }
}
