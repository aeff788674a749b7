//! The normalize pass: a deterministic, policy-driven rewrite.
//!
//! Resolves exact duplicates and Unicode case-fold collisions, drops or
//! rejects symlinks and undecodable entries, optionally zeroes volatile
//! metadata and sorts by name, then writes a fresh container of the same
//! format (re-creating a gzip/zstd/brotli layer when the input had one).

use crate::detect::ArchiveFormat;
use crate::facade::{load, rewrap_codec, ArchiveContents, OpenOptions};
use crate::tar::{TarEntryOptions, TarWriter};
use crate::zip::{EntryOptions, ZipWriter};
use caseless::default_case_fold_str;
use ferropack_core::entry::{ArchiveEntry, CompressionMethod, EntryKind};
use ferropack_core::error::{ArchiveError, ErrorCode, Result};
use ferropack_core::limits::Profile;
use ferropack_core::sink::{Sink, VecSink};
use unicode_normalization::UnicodeNormalization;

/// The collision key: `NFC(fullCaseFold(NFC(pathNormalize(name))))`.
pub fn collision_key(name: &str) -> String {
    let normalized = name.replace('\\', "/");
    let nfc: String = normalized.nfc().collect();
    let folded = default_case_fold_str(&nfc);
    folded.nfc().collect()
}

/// What to do when two entries collide.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum CollisionPolicy {
    /// Fail with a typed error.
    #[default]
    Error,
    /// Keep the entry that appears last in the archive.
    LastWins,
    /// Keep every entry, renaming later ones deterministically.
    Rename,
}

/// What to do with entries that cannot or should not be carried over.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum DropPolicy {
    /// Fail with a typed error.
    #[default]
    Error,
    /// Silently drop the entry.
    Drop,
}

/// Normalize configuration.
#[derive(Clone, Default)]
pub struct NormalizeOptions {
    /// Shared load options (profile, limits, password).
    pub open: OpenOptions,
    /// Policy for exact-path duplicates.
    pub on_duplicate: CollisionPolicy,
    /// Policy for NFC case-fold collisions.
    pub on_case_collision: CollisionPolicy,
    /// Policy for symlinks and hardlinks.
    pub on_symlink: DropPolicy,
    /// Policy for encrypted or undecodable entries.
    pub on_unsupported: DropPolicy,
    /// Zero mtimes and ownership, and sort entries by normalized name.
    pub deterministic: bool,
}

/// What the rewrite did.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct NormalizeOutcome {
    /// Entries written to the output.
    pub entries_written: u64,
    /// Entries dropped by policy.
    pub dropped: u64,
    /// Entries renamed by the collision policy.
    pub renamed: u64,
}

struct WorkEntry {
    entry: ArchiveEntry,
    data: Vec<u8>,
}

fn collision_error(container: ArchiveFormat, a: &str, b: &str, key: &str) -> ArchiveError {
    let code = if container == ArchiveFormat::Zip {
        ErrorCode::ZipNameCollision
    } else {
        ErrorCode::TarNameCollision
    };
    ArchiveError::security(
        code,
        format!("entries {a:?} and {b:?} collide (key {key:?})"),
    )
    .with_context("nameA", a)
    .with_context("nameB", b)
    .with_context("key", key)
}

/// Rewrite `data` into `sink` under the given policies.
pub fn normalize<S: Sink>(
    data: &[u8],
    sink: S,
    options: &NormalizeOptions,
) -> Result<NormalizeOutcome> {
    // Normalize exists to repair archives the strict reader would refuse,
    // so the load itself is tolerant; the caller's profile still supplies
    // the resource limits.
    let mut open = options.open.clone();
    open.profile = Profile::Compat;
    let loaded = load(data, &open, true)?;

    // A compressed container gets its (writable) layer re-created around the
    // normalized output; bare codec streams have nothing to normalize.
    let layers = loaded.detection.layers.clone();
    for layer in &layers {
        rewrap_codec(*layer)?;
    }

    let (container, mut work) = match loaded.contents {
        ArchiveContents::Zip { entries, data, .. } => {
            let mut work = Vec::with_capacity(entries.len());
            for (entry, data) in entries.into_iter().zip(data) {
                work.push((entry, data));
            }
            (ArchiveFormat::Zip, work)
        }
        ArchiveContents::Tar(archive) => (
            ArchiveFormat::Tar,
            archive
                .entries
                .into_iter()
                .map(|e| (e.entry, Some(e.data)))
                .collect(),
        ),
        ArchiveContents::Stream { .. } => {
            return Err(ArchiveError::unsupported(
                ErrorCode::ArchiveUnknownFormat,
                "a bare codec stream has no entries to normalize",
            ))
        }
    };

    let mut outcome = NormalizeOutcome::default();

    // Symlink and unsupported policies first, so collision policies only see
    // entries that will actually be written.
    let mut filtered: Vec<WorkEntry> = Vec::with_capacity(work.len());
    for (entry, data) in work.drain(..) {
        if matches!(entry.kind, EntryKind::Symlink | EntryKind::Hardlink) {
            match options.on_symlink {
                DropPolicy::Error => {
                    return Err(ArchiveError::security(
                        ErrorCode::ArchiveSymlinkRejected,
                        format!("entry {:?} is a link", entry.name),
                    )
                    .with_context("entryName", entry.name))
                }
                DropPolicy::Drop => {
                    outcome.dropped += 1;
                    continue;
                }
            }
        }
        let undecodable = entry.kind == EntryKind::Other
            || (entry.is_file() && data.is_none())
            || matches!(entry.method, CompressionMethod::Unknown(_));
        if undecodable {
            match options.on_unsupported {
                DropPolicy::Error => {
                    return Err(ArchiveError::unsupported(
                        ErrorCode::ArchiveUnsupportedEntry,
                        format!("entry {:?} cannot be decoded", entry.name),
                    )
                    .with_context("entryName", entry.name))
                }
                DropPolicy::Drop => {
                    outcome.dropped += 1;
                    continue;
                }
            }
        }
        filtered.push(WorkEntry {
            entry,
            data: data.unwrap_or_default(),
        });
    }

    // Exact duplicates.
    let mut survivors: Vec<WorkEntry> = Vec::with_capacity(filtered.len());
    for work in filtered {
        if let Some(index) = survivors
            .iter()
            .position(|w| w.entry.name == work.entry.name)
        {
            match options.on_duplicate {
                CollisionPolicy::Error => {
                    let key = collision_key(&work.entry.name);
                    return Err(collision_error(
                        container,
                        &survivors[index].entry.name,
                        &work.entry.name,
                        &key,
                    ));
                }
                CollisionPolicy::LastWins => {
                    survivors[index] = work;
                }
                CollisionPolicy::Rename => {
                    let renamed = rename_unique(&work.entry.name, &survivors);
                    let mut work = work;
                    work.entry.name = renamed;
                    outcome.renamed += 1;
                    survivors.push(work);
                }
            }
        } else {
            survivors.push(work);
        }
    }

    // Case-fold collisions between distinct surviving names.
    let mut resolved: Vec<WorkEntry> = Vec::with_capacity(survivors.len());
    for work in survivors {
        let key = collision_key(&work.entry.name);
        if let Some(index) = resolved
            .iter()
            .position(|w| collision_key(&w.entry.name) == key && w.entry.name != work.entry.name)
        {
            match options.on_case_collision {
                CollisionPolicy::Error => {
                    return Err(collision_error(
                        container,
                        &resolved[index].entry.name,
                        &work.entry.name,
                        &key,
                    ));
                }
                CollisionPolicy::LastWins => {
                    resolved[index] = work;
                }
                CollisionPolicy::Rename => {
                    let renamed = rename_unique(&work.entry.name, &resolved);
                    let mut work = work;
                    work.entry.name = renamed;
                    outcome.renamed += 1;
                    resolved.push(work);
                }
            }
        } else {
            resolved.push(work);
        }
    }

    if options.deterministic {
        for work in &mut resolved {
            work.entry.modified = Some(0);
            work.entry.accessed = None;
            work.entry.created = None;
            work.entry.attributes.uid = None;
            work.entry.attributes.gid = None;
            work.entry.attributes.uname = None;
            work.entry.attributes.gname = None;
        }
        resolved.sort_by(|a, b| {
            collision_key(&a.entry.name)
                .cmp(&collision_key(&b.entry.name))
                .then_with(|| a.entry.name.cmp(&b.entry.name))
        });
    }

    outcome.entries_written = resolved.len() as u64;

    // Write the container, then re-create any compression layers inside-out.
    let container_bytes = match container {
        ArchiveFormat::Zip => write_zip(&resolved)?,
        _ => write_tar(&resolved, options.deterministic)?,
    };
    let mut bytes = container_bytes;
    for layer in layers.iter().rev() {
        bytes = rewrap_codec(*layer)?.compress(&bytes, 6)?;
    }

    let mut sink = sink;
    sink.write(&bytes)?;
    sink.close()?;
    Ok(outcome)
}

fn rename_unique(name: &str, taken: &[WorkEntry]) -> String {
    let (stem, dir_slash) = match name.strip_suffix('/') {
        Some(stem) => (stem, "/"),
        None => (name, ""),
    };
    let mut counter = 2u32;
    loop {
        let candidate = format!("{stem}~{counter}{dir_slash}");
        let key = collision_key(&candidate);
        if !taken
            .iter()
            .any(|w| w.entry.name == candidate || collision_key(&w.entry.name) == key)
        {
            return candidate;
        }
        counter += 1;
    }
}

fn write_zip(entries: &[WorkEntry]) -> Result<Vec<u8>> {
    let mut writer = ZipWriter::new(VecSink::new());
    for work in entries {
        let method = match work.entry.method {
            CompressionMethod::Store | CompressionMethod::Deflate | CompressionMethod::Zstd => {
                work.entry.method
            }
            _ => CompressionMethod::Deflate,
        };
        let options = EntryOptions {
            method,
            modified: work.entry.modified,
            comment: work.entry.comment.clone(),
            unix_mode: work.entry.attributes.unix_mode,
            ..EntryOptions::default()
        };
        if work.entry.is_dir() {
            writer.add(&work.entry.name, b"", &EntryOptions {
                method: CompressionMethod::Store,
                ..options
            })?;
        } else {
            writer.add(&work.entry.name, &work.data, &options)?;
        }
    }
    Ok(writer.into_sink()?.into_vec())
}

fn write_tar(entries: &[WorkEntry], deterministic: bool) -> Result<Vec<u8>> {
    let mut writer = TarWriter::new(VecSink::new());
    for work in entries {
        let attrs = &work.entry.attributes;
        let options = TarEntryOptions {
            mode: attrs.unix_mode.unwrap_or(0o644),
            mtime: if deterministic {
                0
            } else {
                work.entry.modified.unwrap_or(0)
            },
            uid: attrs.uid.unwrap_or(0),
            gid: attrs.gid.unwrap_or(0),
            uname: attrs.uname.clone().unwrap_or_default(),
            gname: attrs.gname.clone().unwrap_or_default(),
        };
        if work.entry.is_dir() {
            writer.add_directory(&work.entry.name, &options)?;
        } else {
            writer.add_file(&work.entry.name, &work.data, &options)?;
        }
    }
    Ok(writer.into_sink()?.into_vec())
}
