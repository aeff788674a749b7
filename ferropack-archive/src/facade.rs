//! The archive facade: classify an input, peel compression layers, and load
//! a uniform view of its entries.
//!
//! Both the audit and normalize passes sit on top of [`load`], which handles
//! the layering (`.tar.xz`, `.tar.gz`, ...) so they only ever see a ZIP or
//! TAR container, a bare codec stream, or an unknown blob.

use crate::codec::Codec;
use crate::detect::{ArchiveFormat, Detection, InputKind};
use crate::tar::{read_tar, TarArchive, TarReaderOptions};
use crate::zip::reader::ReaderNote;
use crate::zip::{ZipReader, ZipReaderOptions};
use ferropack_core::cancel::CancelToken;
use ferropack_core::entry::ArchiveEntry;
use ferropack_core::error::{ArchiveError, ErrorCode, Result};
use ferropack_core::limits::{Profile, ResourceLimits};
use ferropack_core::source::MemorySource;

/// Maximum number of compression layers peeled before giving up.
const MAX_LAYERS: usize = 4;

/// Options shared by the facade, audit, and normalize entry points.
#[derive(Clone, Default)]
pub struct OpenOptions {
    /// Strictness profile.
    pub profile: Profile,
    /// Resource ceilings.
    pub limits: ResourceLimits,
    /// Password for encrypted ZIP entries.
    pub password: Option<Vec<u8>>,
    /// Filename hint for weak-signature formats.
    pub filename_hint: Option<String>,
    /// Cooperative cancellation.
    pub cancel: CancelToken,
}

/// Container-specific contents of a loaded input.
#[derive(Debug)]
pub enum ArchiveContents {
    /// A ZIP archive.
    Zip {
        /// Parsed entries in central-directory order.
        entries: Vec<ArchiveEntry>,
        /// Entry payloads, when loading was requested and possible.
        data: Vec<Option<Vec<u8>>>,
        /// Structural notes tolerated by the profile.
        notes: Vec<ReaderNote>,
        /// Bytes after the EOCD record.
        trailing_bytes: u64,
        /// Archive comment.
        comment: Option<String>,
    },
    /// A TAR archive (payloads are always materialized).
    Tar(TarArchive),
    /// A bare codec stream with no inner container.
    Stream {
        /// Decompressed size of the innermost payload.
        decompressed_bytes: u64,
    },
}

/// A classified and (optionally) materialized input.
#[derive(Debug)]
pub struct LoadedArchive {
    /// The layered classification.
    pub detection: Detection,
    /// Container contents.
    pub contents: ArchiveContents,
}

fn strip_extension(hint: Option<&str>) -> Option<String> {
    let hint = hint?;
    hint.rsplit_once('.').map(|(stem, _)| stem.to_string())
}

/// Classify the input without decompressing anything.
pub fn sniff(data: &[u8], filename_hint: Option<&str>) -> ArchiveFormat {
    ArchiveFormat::classify(&data[..data.len().min(512)], filename_hint)
}

/// Classify and load the input, peeling compression layers.
///
/// With `want_data`, ZIP entry payloads are decompressed and verified where
/// possible; entries that need a missing password or an unregistered codec
/// load as `None` so policy layers can decide what to do with them.
pub fn load(data: &[u8], options: &OpenOptions, want_data: bool) -> Result<LoadedArchive> {
    let mut layers = Vec::new();
    let mut current: Vec<u8> = data.to_vec();
    let mut hint = options.filename_hint.clone();

    let format = loop {
        options.cancel.check()?;
        let format = sniff(&current, hint.as_deref());
        if format.is_compression_only() {
            if layers.len() >= MAX_LAYERS {
                return Err(ArchiveError::structural(
                    ErrorCode::ArchiveUnknownFormat,
                    format!("more than {MAX_LAYERS} nested compression layers"),
                ));
            }
            let codec = format.codec().expect("compression-only formats map to codecs");
            current = codec.decompress(&current, &options.limits)?;
            layers.push(format);
            hint = strip_extension(hint.as_deref());
            continue;
        }
        break format;
    };

    let detection = Detection {
        input_kind: InputKind::Bytes,
        layers,
        format,
    };

    let contents = match format {
        ArchiveFormat::Zip => {
            let reader_options = ZipReaderOptions {
                profile: options.profile,
                limits: options.limits,
                password: options.password.clone(),
                cancel: options.cancel.clone(),
                progress: None,
            };
            let mut reader = ZipReader::new(MemorySource::new(current), reader_options)?;
            let entries = reader.entries().to_vec();
            let mut data = vec![None; entries.len()];
            if want_data {
                for (index, entry) in entries.iter().enumerate() {
                    if !entry.is_file() {
                        continue;
                    }
                    if entry.encrypted && options.password.is_none() {
                        continue;
                    }
                    if matches!(
                        entry.method,
                        ferropack_core::entry::CompressionMethod::Unknown(_)
                    ) {
                        continue;
                    }
                    data[index] = Some(reader.read(index)?);
                }
            }
            ArchiveContents::Zip {
                entries,
                data,
                notes: reader.notes().to_vec(),
                trailing_bytes: reader.tail().trailing_bytes,
                comment: reader.comment().map(str::to_string),
            }
        }
        ArchiveFormat::Tar => {
            let tar_options = TarReaderOptions {
                profile: options.profile,
                limits: options.limits,
                cancel: options.cancel.clone(),
            };
            ArchiveContents::Tar(read_tar(&current[..], &tar_options)?)
        }
        ArchiveFormat::Unknown if detection.layers.is_empty() => {
            return Err(ArchiveError::structural(
                ErrorCode::ArchiveUnknownFormat,
                "input matches no known container or codec signature",
            ));
        }
        _ => ArchiveContents::Stream {
            decompressed_bytes: current.len() as u64,
        },
    };

    Ok(LoadedArchive {
        detection,
        contents,
    })
}

/// Convenience: list entries of any supported input.
pub fn list_entries(data: &[u8], options: &OpenOptions) -> Result<Vec<ArchiveEntry>> {
    let loaded = load(data, options, false)?;
    Ok(match loaded.contents {
        ArchiveContents::Zip { entries, .. } => entries,
        ArchiveContents::Tar(archive) => {
            archive.entries.into_iter().map(|e| e.entry).collect()
        }
        ArchiveContents::Stream { .. } => Vec::new(),
    })
}

/// The codec that can re-create a given layer, when writing is supported.
pub fn rewrap_codec(layer: ArchiveFormat) -> Result<Codec> {
    let codec = layer.codec().ok_or_else(|| {
        ArchiveError::unsupported(
            ErrorCode::ArchiveUnknownFormat,
            format!("{layer} is not a compression layer"),
        )
    })?;
    if !codec.can_compress() {
        return Err(ArchiveError::unsupported(
            ErrorCode::ZipUnsupportedMethod,
            format!("cannot re-create a {layer} layer: encoding is not supported"),
        ));
    }
    Ok(codec)
}
