//! # Ferropack Core
//!
//! Core components shared by the ferropack archive crates:
//!
//! - [`error`]: typed error taxonomy with stable codes and JSON rendering
//! - [`limits`]: resource ceilings and strictness profiles
//! - [`progress`] / [`cancel`]: pipeline observability and cooperative abort
//! - [`binary`]: bounds-checked little-endian cursors
//! - [`crc`]: CRC-32 and CRC-64/ECMA-182
//! - [`vli`]: XZ variable-length integers, chunk-boundary safe
//! - [`source`] / [`sink`]: the `RandomAccess` and `Sink` boundary traits
//!   plus memory, file, mmap, stream, and LRU-cached implementations
//! - [`entry`]: format-agnostic entry metadata and path hygiene
//!
//! Everything here is synchronous and single-threaded by design: work only
//! advances when a consumer pulls, and each reader or writer owns its own
//! state. See the workspace-level design notes for the concurrency contract.

#![warn(missing_docs)]
#![warn(clippy::all)]
#![allow(clippy::module_name_repetitions)]

pub mod binary;
pub mod cancel;
pub mod crc;
pub mod entry;
pub mod error;
pub mod limits;
pub mod progress;
pub mod sink;
pub mod source;
pub mod vli;

// Re-exports for convenience
pub use binary::{ByteReader, ByteWriter};
pub use cancel::CancelToken;
pub use crc::{Crc32, Crc64};
pub use entry::{
    ArchiveEntry, CompressionMethod, EntryKind, FileAttributes, NameSource, PathViolation,
};
pub use error::{ArchiveError, ErrorCode, ErrorContext, Result};
pub use limits::{Profile, ResourceLimits};
pub use progress::{ProgressCallback, ProgressEvent, ProgressKind, ProgressTap};
pub use sink::{FileSink, Sink, StreamSink, VecSink};
pub use source::{CachedSource, FileSource, MemorySource, MmapSource, RandomAccess};

/// Prelude module for convenient imports.
pub mod prelude {
    pub use crate::binary::{ByteReader, ByteWriter};
    pub use crate::cancel::CancelToken;
    pub use crate::crc::{Crc32, Crc64};
    pub use crate::entry::{ArchiveEntry, CompressionMethod, EntryKind};
    pub use crate::error::{ArchiveError, ErrorCode, Result};
    pub use crate::limits::{Profile, ResourceLimits};
    pub use crate::sink::{Sink, VecSink};
    pub use crate::source::{MemorySource, RandomAccess};
}
