//! ZIP reading: EOCD discovery, central-directory parsing, entry streams.
//!
//! The reader walks the container tail first, resolves ZIP64 indirection,
//! then parses every central record eagerly into immutable entries. Opening
//! an entry re-reads its local header (local extras may differ from the
//! central copy) and composes the stream pipeline: range read, decryption,
//! decompression, resource guard, CRC/size verification, progress tap.

use super::crypto::{ZipCrypto, ENCRYPTION_HEADER_SIZE};
use super::encryption::{AesContext, AUTH_CODE_LEN, VERIFIER_LEN};
use super::header::{
    CentralRecord, Eocd, LocalRecord, Zip64Eocd, Zip64Locator, EOCD_FIXED_LEN,
    END_OF_CENTRAL_DIR_SIG, FLAG_DATA_DESCRIPTOR, FLAG_UTF8, METHOD_AES_MARKER,
    ZIP64_EOCD_LOCATOR_SIG,
};
use crate::codec::{codec_for_method, from_io};
use ferropack_core::cancel::CancelToken;
use ferropack_core::crc::Crc32;
use ferropack_core::entry::{
    ArchiveEntry, CompressionMethod, EntryKind, FileAttributes, NameSource,
};
use ferropack_core::error::{ArchiveError, ErrorCode, Result};
use ferropack_core::limits::{Profile, ResourceLimits};
use ferropack_core::progress::{ProgressEvent, ProgressKind};
use ferropack_core::source::RandomAccess;
use std::cell::RefCell;
use std::io::Read;
use std::rc::Rc;

fn bad(message: impl Into<String>) -> ArchiveError {
    ArchiveError::structural(ErrorCode::ZipBadHeader, message.into())
}

fn to_io(err: ArchiveError) -> std::io::Error {
    std::io::Error::new(std::io::ErrorKind::InvalidData, err)
}

/// A shared progress callback usable across entry opens.
pub type SharedProgress = Rc<RefCell<Box<dyn FnMut(&ProgressEvent)>>>;

/// Reader configuration.
#[derive(Default)]
pub struct ZipReaderOptions {
    /// Strictness profile.
    pub profile: Profile,
    /// Resource ceilings.
    pub limits: ResourceLimits,
    /// Password for encrypted entries.
    pub password: Option<Vec<u8>>,
    /// Cooperative cancellation.
    pub cancel: CancelToken,
    /// Progress callback for entry extraction.
    pub progress: Option<SharedProgress>,
}

/// A structural anomaly tolerated by the current profile.
#[derive(Debug, Clone)]
pub struct ReaderNote {
    /// Stable issue code.
    pub code: &'static str,
    /// Human-readable description.
    pub message: String,
    /// Container offset, when meaningful.
    pub offset: Option<u64>,
}

/// The resolved archive tail (EOCD, after ZIP64 indirection).
#[derive(Debug, Clone)]
pub struct ZipTail {
    /// Total entry count.
    pub total_entries: u64,
    /// Central directory size in bytes.
    pub cd_size: u64,
    /// Central directory offset.
    pub cd_offset: u64,
    /// Whether ZIP64 records were involved.
    pub zip64: bool,
    /// Raw archive comment.
    pub comment: Vec<u8>,
    /// Offset of the (classic) EOCD record.
    pub eocd_offset: u64,
    /// Bytes between the end of the EOCD and EOF.
    pub trailing_bytes: u64,
}

/// Locate and resolve the EOCD, collecting profile-tolerated notes.
pub fn discover_tail<S: RandomAccess>(
    source: &mut S,
    limits: &ResourceLimits,
    profile: Profile,
    notes: &mut Vec<ReaderNote>,
) -> Result<ZipTail> {
    let size = source.size()?;
    if size < EOCD_FIXED_LEN as u64 {
        return Err(ArchiveError::structural(
            ErrorCode::ZipBadEocd,
            "input is too small to be a ZIP archive",
        ));
    }
    let window = size.min(limits.zip_eocd_search_window.max(EOCD_FIXED_LEN as u64));
    let base = size - window;
    let tail = source.read_vec_at(base, window as usize)?;

    let sig = END_OF_CENTRAL_DIR_SIG.to_le_bytes();
    let candidates: Vec<usize> = tail
        .windows(4)
        .enumerate()
        .filter(|(_, w)| *w == sig)
        .map(|(i, _)| i)
        .collect();
    if candidates.is_empty() {
        return Err(ArchiveError::structural(
            ErrorCode::ZipBadEocd,
            "end of central directory record not found",
        ));
    }

    // The real record is the last one whose comment ends exactly at EOF; a
    // signature planted inside a comment parses with the wrong comment
    // length. Multiple records ending at EOF are genuinely ambiguous.
    let mut abutting: Vec<Eocd> = Vec::new();
    let mut last_parseable: Option<Eocd> = None;
    for &pos in &candidates {
        if let Ok(eocd) = Eocd::parse(&tail, base, pos) {
            if eocd.offset + eocd.len() as u64 == size {
                abutting.push(eocd.clone());
            }
            last_parseable = Some(eocd);
        }
    }
    let eocd = abutting.last().cloned().or(last_parseable).ok_or_else(|| {
        ArchiveError::structural(ErrorCode::ZipBadEocd, "no parseable EOCD record")
    })?;

    if abutting.len() > 1 {
        let note = ReaderNote {
            code: "ZIP_MULTIPLE_EOCD",
            message: format!("{} EOCD records end at EOF", abutting.len()),
            offset: Some(abutting[0].offset),
        };
        if profile.downgrades(ErrorCode::ZipBadEocd) {
            log::warn!("{}", note.message);
            notes.push(note);
        } else {
            return Err(ArchiveError::structural(
                ErrorCode::ZipBadEocd,
                note.message,
            ));
        }
    }

    let trailing_bytes = size - (eocd.offset + eocd.len() as u64);
    if trailing_bytes > 0 {
        let note = ReaderNote {
            code: "ZIP_EOCD_NOT_AT_EOF",
            message: format!("{trailing_bytes} byte(s) follow the EOCD record"),
            offset: Some(eocd.offset + eocd.len() as u64),
        };
        if profile.downgrades(ErrorCode::ZipBadEocd) {
            notes.push(note);
        } else {
            return Err(ArchiveError::structural(
                ErrorCode::ZipBadEocd,
                note.message,
            ));
        }
    }

    if eocd.comment.len() as u64 > limits.max_zip_comment_bytes {
        return Err(ArchiveError::resource_limit(
            "CommentBytes",
            eocd.comment.len() as u64,
            limits.max_zip_comment_bytes,
        ));
    }

    let mut total_entries = u64::from(eocd.total_entries);
    let mut cd_size = u64::from(eocd.cd_size);
    let mut cd_offset = u64::from(eocd.cd_offset);
    let mut disk_number = u32::from(eocd.disk_number);
    let mut cd_disk = u32::from(eocd.cd_disk);
    let mut entries_match = eocd.entries_on_disk == eocd.total_entries;
    let mut zip64 = false;

    if eocd.needs_zip64() {
        if eocd.offset < 20 {
            return Err(ArchiveError::structural(
                ErrorCode::ZipBadEocd,
                "ZIP64 sentinel without room for a locator",
            ));
        }
        let locator_bytes = source.read_vec_at(eocd.offset - 20, 20)?;
        if locator_bytes[..4] != ZIP64_EOCD_LOCATOR_SIG.to_le_bytes() {
            return Err(ArchiveError::structural(
                ErrorCode::ZipBadEocd,
                "ZIP64 sentinel present but the locator is missing",
            ));
        }
        let locator = Zip64Locator::parse(&locator_bytes)?;
        if locator.total_disks > 1 {
            return Err(ArchiveError::unsupported(
                ErrorCode::ZipMultiDisk,
                "multi-disk archives are not supported",
            ));
        }
        let record_bytes = source.read_vec_at(locator.eocd_offset, 56)?;
        let record = Zip64Eocd::parse(&record_bytes)?;
        total_entries = record.total_entries;
        cd_size = record.cd_size;
        cd_offset = record.cd_offset;
        disk_number = record.disk_number;
        cd_disk = record.cd_disk;
        entries_match = true;
        zip64 = true;
    }

    if disk_number != 0 || cd_disk != 0 || !entries_match {
        return Err(ArchiveError::unsupported(
            ErrorCode::ZipMultiDisk,
            "multi-disk archives are not supported",
        ));
    }
    if total_entries > limits.max_entries {
        return Err(ArchiveError::resource_limit(
            "Entries",
            total_entries,
            limits.max_entries,
        ));
    }
    if cd_size > limits.max_zip_central_directory_bytes {
        return Err(ArchiveError::resource_limit(
            "CentralDirectoryBytes",
            cd_size,
            limits.max_zip_central_directory_bytes,
        ));
    }
    if cd_offset + cd_size > eocd.offset {
        return Err(bad("central directory overlaps the EOCD record"));
    }

    Ok(ZipTail {
        total_entries,
        cd_size,
        cd_offset,
        zip64,
        comment: eocd.comment.clone(),
        eocd_offset: eocd.offset,
        trailing_bytes,
    })
}

/// Resource-bounding summary produced without streaming any entry data.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ZipPreflight {
    /// Total entry count.
    pub total_entries: u64,
    /// Central directory size in bytes.
    pub cd_size: u64,
    /// Whether ZIP64 records are present.
    pub zip64: bool,
    /// Archive comment length.
    pub comment_len: u64,
}

/// Walk EOCD and ZIP64 records only, refusing inputs whose directory would
/// exceed the configured ceilings.
pub fn preflight<S: RandomAccess>(source: &mut S, limits: &ResourceLimits) -> Result<ZipPreflight> {
    let mut notes = Vec::new();
    let tail = discover_tail(source, limits, Profile::Compat, &mut notes)?;
    Ok(ZipPreflight {
        total_entries: tail.total_entries,
        cd_size: tail.cd_size,
        zip64: tail.zip64,
        comment_len: tail.comment.len() as u64,
    })
}

/// ZIP archive reader over a random-access source.
pub struct ZipReader<S: RandomAccess> {
    source: S,
    options: ZipReaderOptions,
    tail: ZipTail,
    records: Vec<CentralRecord>,
    entries: Vec<ArchiveEntry>,
    notes: Vec<ReaderNote>,
    comment: Option<String>,
}

impl<S: RandomAccess> ZipReader<S> {
    /// Open an archive, parsing its entire central directory.
    pub fn new(mut source: S, options: ZipReaderOptions) -> Result<Self> {
        let mut notes = Vec::new();
        let tail = discover_tail(&mut source, &options.limits, options.profile, &mut notes)?;

        let cd = source.read_vec_at(tail.cd_offset, tail.cd_size as usize)?;
        let mut reader = ferropack_core::binary::ByteReader::new(&cd);
        let mut records = Vec::with_capacity(tail.total_entries.min(1 << 16) as usize);
        for i in 0..tail.total_entries {
            options.cancel.check()?;
            match CentralRecord::parse(&mut reader) {
                Ok(record) => records.push(record),
                Err(err) if options.profile.downgrades(ErrorCode::ZipBadHeader) => {
                    notes.push(ReaderNote {
                        code: "ZIP_TRUNCATED_CENTRAL_DIRECTORY",
                        message: format!(
                            "central directory ended after {i} of {} entries: {err}",
                            tail.total_entries
                        ),
                        offset: Some(tail.cd_offset + reader.position() as u64),
                    });
                    break;
                }
                Err(err) => return Err(err),
            }
        }

        let mut entries = Vec::with_capacity(records.len());
        for record in &records {
            entries.push(build_entry(record, options.profile, &mut notes)?);
        }

        let comment = if tail.comment.is_empty() {
            None
        } else {
            Some(decode_text(&tail.comment, true, None))
        };

        Ok(Self {
            source,
            options,
            tail,
            records,
            entries,
            notes,
            comment,
        })
    }

    /// The parsed entries, in central-directory order.
    pub fn entries(&self) -> &[ArchiveEntry] {
        &self.entries
    }

    /// Structural notes tolerated by the profile.
    pub fn notes(&self) -> &[ReaderNote] {
        &self.notes
    }

    /// The resolved tail summary.
    pub fn tail(&self) -> &ZipTail {
        &self.tail
    }

    /// The archive comment, when present.
    pub fn comment(&self) -> Option<&str> {
        self.comment.as_deref()
    }

    /// Open entry `index` as a verified streaming reader.
    pub fn open(&mut self, index: usize) -> Result<EntryReader<'_>> {
        let record = self
            .records
            .get(index)
            .ok_or_else(|| bad(format!("entry index {index} out of range")))?
            .clone();
        let entry = self.entries[index].clone();

        // Local extras may differ in size from the central copy; re-read to
        // find the true data start.
        let fixed = self
            .source
            .read_vec_at(record.local_header_offset, LocalRecord::FIXED_LEN)?;
        let local = LocalRecord::parse(&fixed)?;
        if local.flags != record.flags {
            log::debug!(
                "local flags 0x{:04X} differ from central 0x{:04X} for {}",
                local.flags,
                record.flags,
                entry.name
            );
        }
        let data_start = record.local_header_offset
            + LocalRecord::FIXED_LEN as u64
            + local.name_len as u64
            + local.extra_len as u64;

        let mut raw: Box<dyn Read + '_> = Box::new(RangeReader {
            source: &mut self.source,
            offset: data_start,
            remaining: record.compressed_size,
        });

        let mut expected_crc = Some(record.crc32);
        if record.is_encrypted() {
            let password = self.options.password.as_deref().ok_or_else(|| {
                ArchiveError::security(
                    ErrorCode::ZipPasswordRequired,
                    format!("entry '{}' is encrypted", entry.name),
                )
            })?;
            if let Some(aes) = record.aes.filter(|_| record.method == METHOD_AES_MARKER) {
                let salt_len = aes.strength.salt_len();
                let mut head = vec![0u8; salt_len + VERIFIER_LEN];
                raw.read_exact(&mut head).map_err(from_io)?;
                let context = AesContext::new(password, &head[..salt_len], aes.strength)?;
                if !context.verifier_matches(&head[salt_len..]) {
                    return Err(ArchiveError::security(
                        ErrorCode::ZipBadPassword,
                        format!("wrong password for entry '{}'", entry.name),
                    ));
                }
                let overhead = (salt_len + VERIFIER_LEN + AUTH_CODE_LEN) as u64;
                if record.compressed_size < overhead {
                    return Err(bad("AES entry is smaller than its overhead"));
                }
                if aes.vendor_version == 2 {
                    expected_crc = None;
                }
                raw = Box::new(AesReader {
                    inner: raw,
                    context: Some(context),
                    data_remaining: record.compressed_size - overhead,
                });
            } else {
                let mut header = [0u8; ENCRYPTION_HEADER_SIZE];
                raw.read_exact(&mut header).map_err(from_io)?;
                let check_word = if record.flags & FLAG_DATA_DESCRIPTOR != 0 {
                    u32::from(record.dos_time) << 16
                } else {
                    record.crc32
                };
                let mut cipher = ZipCrypto::new(password);
                cipher.consume_header(&header, check_word)?;
                raw = Box::new(ZipCryptoReader { inner: raw, cipher });
            }
        }

        let method = CompressionMethod::from_zip_id(record.actual_method());
        let codec = codec_for_method(method)?;
        let decoded = codec.reader(raw, &self.options.limits)?;

        Ok(EntryReader {
            inner: decoded,
            crc: Crc32::new(),
            produced: 0,
            expected_crc,
            expected_size: record.uncompressed_size,
            max_bytes: self.options.limits.max_entry_uncompressed_bytes,
            cancel: self.options.cancel.clone(),
            verified: false,
            entry_name: entry.name.clone(),
            progress: self.options.progress.clone(),
        })
    }

    /// Read and verify a whole entry.
    pub fn read(&mut self, index: usize) -> Result<Vec<u8>> {
        let size_hint = self.entries[index].size.min(1 << 20) as usize;
        let mut reader = self.open(index)?;
        let mut out = Vec::with_capacity(size_hint);
        reader.read_to_end(&mut out).map_err(from_io)?;
        Ok(out)
    }

    /// Consume the reader, returning the source.
    pub fn into_source(self) -> S {
        self.source
    }
}

fn decode_text(raw: &[u8], utf8_flag: bool, unicode_override: Option<&str>) -> String {
    if let Some(text) = unicode_override {
        return text.to_string();
    }
    if utf8_flag {
        String::from_utf8_lossy(raw).into_owned()
    } else {
        crate::cp437::decode(raw)
    }
}

fn build_entry(
    record: &CentralRecord,
    profile: Profile,
    notes: &mut Vec<ReaderNote>,
) -> Result<ArchiveEntry> {
    let utf8 = record.flags & FLAG_UTF8 != 0;
    let (mut name, name_source) = if utf8 {
        match String::from_utf8(record.raw_name.clone()) {
            Ok(name) => (name, NameSource::Utf8),
            Err(_) if profile.downgrades(ErrorCode::ZipBadHeader) => {
                notes.push(ReaderNote {
                    code: "ZIP_MALFORMED_NAME",
                    message: "UTF-8 flagged name is not valid UTF-8".to_string(),
                    offset: Some(record.local_header_offset),
                });
                (
                    String::from_utf8_lossy(&record.raw_name).into_owned(),
                    NameSource::Utf8,
                )
            }
            Err(_) => {
                return Err(bad("UTF-8 flagged name is not valid UTF-8"));
            }
        }
    } else if let Some(unicode) = &record.unicode_path {
        (unicode.clone(), NameSource::UnicodeExtra)
    } else {
        (crate::cp437::decode(&record.raw_name), NameSource::Cp437)
    };

    if name.contains('\0') {
        if profile.downgrades(ErrorCode::ZipBadHeader) {
            notes.push(ReaderNote {
                code: "ZIP_NUL_IN_NAME",
                message: format!("entry name contains a NUL byte: {name:?}"),
                offset: Some(record.local_header_offset),
            });
            name = name.replace('\0', "\u{FFFD}");
        } else {
            return Err(bad("entry name contains a NUL byte"));
        }
    }

    let comment = if record.raw_comment.is_empty() {
        None
    } else {
        Some(decode_text(
            &record.raw_comment,
            utf8,
            record.unicode_comment.as_deref(),
        ))
    };

    let kind = if name.ends_with('/') {
        EntryKind::Directory
    } else {
        EntryKind::File
    };
    let unix_mode = if record.version_made_by >> 8 == 3 {
        Some(record.external_attr >> 16)
    } else {
        None
    };
    let crc32 = match record.aes {
        Some(aes) if aes.vendor_version == 2 => None,
        _ => Some(record.crc32),
    };

    Ok(ArchiveEntry {
        name,
        raw_name: record.raw_name.clone(),
        name_source,
        kind,
        size: record.uncompressed_size,
        compressed_size: record.compressed_size,
        method: CompressionMethod::from_zip_id(record.actual_method()),
        crc32,
        header_offset: record.local_header_offset,
        modified: Some(record.modified()),
        accessed: record.times.atime,
        created: record.times.ctime,
        encrypted: record.is_encrypted(),
        zip64: record.zip64,
        comment,
        link_target: None,
        attributes: FileAttributes {
            unix_mode,
            dos_attributes: Some((record.external_attr & 0xFF) as u8),
            uid: None,
            gid: None,
            uname: None,
            gname: None,
        },
    })
}

/// Reads a fixed byte range from a random-access source.
struct RangeReader<'a, S: RandomAccess> {
    source: &'a mut S,
    offset: u64,
    remaining: u64,
}

impl<S: RandomAccess> Read for RangeReader<'_, S> {
    fn read(&mut self, buf: &mut [u8]) -> std::io::Result<usize> {
        if self.remaining == 0 || buf.is_empty() {
            return Ok(0);
        }
        let want = buf.len().min(self.remaining.min(usize::MAX as u64) as usize);
        let n = self
            .source
            .read_at(self.offset, &mut buf[..want])
            .map_err(to_io)?;
        if n == 0 {
            return Err(to_io(bad("entry data is truncated")));
        }
        self.offset += n as u64;
        self.remaining -= n as u64;
        Ok(n)
    }
}

/// Decrypts a ZipCrypto stream.
struct ZipCryptoReader<'a> {
    inner: Box<dyn Read + 'a>,
    cipher: ZipCrypto,
}

impl Read for ZipCryptoReader<'_> {
    fn read(&mut self, buf: &mut [u8]) -> std::io::Result<usize> {
        let n = self.inner.read(buf)?;
        self.cipher.decrypt_buffer(&mut buf[..n]);
        Ok(n)
    }
}

/// Decrypts WinZip AES and verifies the trailing authentication code.
struct AesReader<'a> {
    inner: Box<dyn Read + 'a>,
    context: Option<AesContext>,
    data_remaining: u64,
}

impl Read for AesReader<'_> {
    fn read(&mut self, buf: &mut [u8]) -> std::io::Result<usize> {
        if self.data_remaining == 0 {
            if let Some(context) = self.context.take() {
                let mut auth = [0u8; AUTH_CODE_LEN];
                self.inner.read_exact(&mut auth)?;
                context.verify_auth(&auth).map_err(to_io)?;
            }
            return Ok(0);
        }
        if buf.is_empty() {
            return Ok(0);
        }
        let want = buf.len().min(self.data_remaining.min(usize::MAX as u64) as usize);
        let n = self.inner.read(&mut buf[..want])?;
        if n == 0 {
            return Err(to_io(bad("AES entry data is truncated")));
        }
        if let Some(context) = self.context.as_mut() {
            context.decrypt(&mut buf[..n]);
        }
        self.data_remaining -= n as u64;
        Ok(n)
    }
}

/// The outermost entry stream: counts, limits, verifies, reports progress.
pub struct EntryReader<'a> {
    inner: Box<dyn Read + 'a>,
    crc: Crc32,
    produced: u64,
    expected_crc: Option<u32>,
    expected_size: u64,
    max_bytes: u64,
    cancel: CancelToken,
    verified: bool,
    entry_name: String,
    progress: Option<SharedProgress>,
}

impl EntryReader<'_> {
    fn verify_eof(&mut self) -> Result<()> {
        if self.verified {
            return Ok(());
        }
        self.verified = true;
        if self.produced != self.expected_size {
            return Err(ArchiveError::integrity(
                ErrorCode::ZipBadCrc,
                format!(
                    "entry '{}' decompressed to {} bytes, expected {}",
                    self.entry_name, self.produced, self.expected_size
                ),
            ));
        }
        if let Some(expected) = self.expected_crc {
            let computed = self.crc.clone().finalize();
            if computed != expected {
                return Err(ArchiveError::integrity(
                    ErrorCode::ZipBadCrc,
                    format!(
                        "entry '{}' CRC mismatch: stored {expected:08X}, computed {computed:08X}",
                        self.entry_name
                    ),
                )
                .with_context("entryName", self.entry_name.clone()));
            }
        }
        Ok(())
    }
}

impl Read for EntryReader<'_> {
    fn read(&mut self, buf: &mut [u8]) -> std::io::Result<usize> {
        self.cancel.check().map_err(to_io)?;
        let n = self.inner.read(buf)?;
        if n == 0 {
            self.verify_eof().map_err(to_io)?;
            return Ok(0);
        }
        self.produced += n as u64;
        if self.produced > self.max_bytes {
            return Err(to_io(ArchiveError::resource_limit(
                "EntryUncompressedBytes",
                self.produced,
                self.max_bytes,
            )));
        }
        if self.produced > self.expected_size {
            return Err(to_io(ArchiveError::integrity(
                ErrorCode::ZipBadCrc,
                format!(
                    "entry '{}' produced more than its declared {} bytes",
                    self.entry_name, self.expected_size
                ),
            )));
        }
        self.crc.update(&buf[..n]);
        if let Some(progress) = &self.progress {
            let mut callback = progress.borrow_mut();
            (*callback)(&ProgressEvent {
                kind: ProgressKind::Extract,
                entry_name: Some(self.entry_name.clone()),
                bytes_in: 0,
                bytes_out: self.produced,
                total_in: None,
                total_out: Some(self.expected_size),
            });
        }
        Ok(n)
    }
}
