//! # Ferropack Archive
//!
//! Container formats and the passes built on top of them:
//!
//! - [`codec`]: the method registry and gzip/deflate/brotli/zstd/bzip2/xz
//!   stream transforms
//! - [`detect`]: signature and filename classification, layer peeling
//! - [`zip`]: reader and writer per APPNOTE 6.3.10 (ZIP64, Unicode extras,
//!   ZipCrypto, WinZip AES)
//! - [`tar`]: ustar + PAX reader and writer
//! - [`gzip`]: gzip member header metadata
//! - [`facade`]: classify-and-load across all of the above
//! - [`audit`]: the read-only report pass
//! - [`normalize`]: the deterministic policy-driven rewrite

#![warn(missing_docs)]
#![warn(clippy::all)]
#![allow(clippy::module_name_repetitions)]

pub mod audit;
pub mod codec;
mod cp437;
pub mod detect;
pub mod facade;
pub mod gzip;
pub mod normalize;
pub mod tar;
pub mod zip;

pub use audit::{audit_bytes, AuditIssue, AuditReport, AuditSummary, Severity};
pub use codec::{register_zip_method, registry, Codec, CodecRegistry};
pub use detect::{ArchiveFormat, Detection, InputKind};
pub use facade::{list_entries, load, sniff, ArchiveContents, LoadedArchive, OpenOptions};
pub use normalize::{
    collision_key, normalize, CollisionPolicy, DropPolicy, NormalizeOptions, NormalizeOutcome,
};
pub use tar::{read_tar, TarArchive, TarEntry, TarEntryOptions, TarReaderOptions, TarWriter};
pub use zip::{
    AesStrength, Encryption, EntryOptions, Zip64Mode, ZipReader, ZipReaderOptions, ZipWriter,
};
