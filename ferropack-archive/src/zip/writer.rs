//! ZIP writing: staging, ZIP64 promotion, encryption, finalize.
//!
//! On a seekable sink the writer reserves zeroed CRC/size fields in each
//! local header, streams the entry payload, then patches the header in
//! place. On a forward-only sink it sets general-purpose bit 3 and emits a
//! data descriptor after each entry instead.

use super::crypto::ZipCrypto;
use super::encryption::{AesContext, AesStrength};
use super::header::{
    unix_to_dos, AesExtra, CENTRAL_DIR_HEADER_SIG, DATA_DESCRIPTOR_SIG, END_OF_CENTRAL_DIR_SIG,
    FLAG_DATA_DESCRIPTOR, FLAG_ENCRYPTED, FLAG_UTF8, LOCAL_FILE_HEADER_SIG, METHOD_AES_MARKER,
    WINZIP_AES_EXTRA_ID, ZIP64_EOCD_LOCATOR_SIG, ZIP64_EOCD_SIG, ZIP64_EXTRA_ID,
    ZIP64_MARKER_16, ZIP64_MARKER_32,
};
use crate::codec::Codec;
use ferropack_core::binary::ByteWriter;
use ferropack_core::crc::Crc32;
use ferropack_core::entry::CompressionMethod;
use ferropack_core::error::{ArchiveError, ErrorCode, Result};
use ferropack_core::sink::Sink;

/// Largest value a 32-bit header field may carry before ZIP64 is required.
const MAX_32: u64 = 0xFFFF_FFFE;

/// ZIP64 promotion policy.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Zip64Mode {
    /// Promote per entry when a size or offset needs it.
    #[default]
    Auto,
    /// Always write ZIP64 records.
    Force,
    /// Never write ZIP64; overflowing entries are refused.
    Off,
}

/// Per-entry encryption selection.
#[derive(Clone, Default)]
pub enum Encryption {
    /// Plaintext.
    #[default]
    None,
    /// Legacy ZipCrypto.
    ZipCrypto {
        /// Entry password.
        password: Vec<u8>,
    },
    /// WinZip AES.
    Aes {
        /// Entry password.
        password: Vec<u8>,
        /// Key strength.
        strength: AesStrength,
        /// 1 = AE-1 (CRC kept), 2 = AE-2 (CRC zeroed).
        vendor_version: u16,
    },
}

/// Options for one staged entry.
#[derive(Clone)]
pub struct EntryOptions {
    /// Compression method (store, deflate, or zstd).
    pub method: CompressionMethod,
    /// Backend-scale compression level.
    pub level: u32,
    /// Encryption selection.
    pub encryption: Encryption,
    /// Modification time (Unix seconds); defaults to the DOS epoch.
    pub modified: Option<i64>,
    /// Entry comment.
    pub comment: Option<String>,
    /// Unix mode bits for the external attributes.
    pub unix_mode: Option<u32>,
    /// Declared uncompressed size, validated against ZIP64 policy before
    /// anything is written.
    pub declared_size: Option<u64>,
}

impl Default for EntryOptions {
    fn default() -> Self {
        Self {
            method: CompressionMethod::Deflate,
            level: 6,
            encryption: Encryption::None,
            modified: None,
            comment: None,
            unix_mode: None,
            declared_size: None,
        }
    }
}

impl EntryOptions {
    /// Stored entry options.
    pub fn stored() -> Self {
        Self {
            method: CompressionMethod::Store,
            ..Self::default()
        }
    }
}

struct PendingEntry {
    name: Vec<u8>,
    flags: u16,
    stored_method: u16,
    dos_time: u16,
    dos_date: u16,
    crc_field: u32,
    compressed_size: u64,
    uncompressed_size: u64,
    local_header_offset: u64,
    zip64: bool,
    aes_extra: Option<[u8; 7]>,
    comment: Vec<u8>,
    external_attr: u32,
    version_needed: u16,
}

impl PendingEntry {
    fn zip64_extra(&self) -> Vec<u8> {
        if !self.zip64 {
            return Vec::new();
        }
        let mut extra = ByteWriter::with_capacity(28);
        extra.u16_le(ZIP64_EXTRA_ID).u16_le(if self.local_header_offset > MAX_32 {
            24
        } else {
            16
        });
        extra
            .u64_le(self.uncompressed_size)
            .u64_le(self.compressed_size);
        if self.local_header_offset > MAX_32 {
            extra.u64_le(self.local_header_offset);
        }
        extra.into_vec()
    }
}

/// ZIP archive writer over any sink.
pub struct ZipWriter<S: Sink> {
    sink: S,
    zip64: Zip64Mode,
    patch: bool,
    entries: Vec<PendingEntry>,
    finished: bool,
}

impl<S: Sink> ZipWriter<S> {
    /// Create a writer with automatic ZIP64 promotion.
    pub fn new(sink: S) -> Self {
        Self::with_zip64(sink, Zip64Mode::Auto)
    }

    /// Create a writer with an explicit ZIP64 policy.
    pub fn with_zip64(sink: S, zip64: Zip64Mode) -> Self {
        let patch = sink.is_seekable();
        Self {
            sink,
            zip64,
            patch,
            entries: Vec::new(),
            finished: false,
        }
    }

    /// Stage one entry.
    pub fn add(&mut self, name: &str, data: &[u8], options: &EntryOptions) -> Result<()> {
        if self.finished {
            return Err(ArchiveError::structural(
                ErrorCode::ZipBadHeader,
                "archive is already closed",
            ));
        }
        let local_header_offset = self.sink.position();
        let uncompressed_size = data.len() as u64;
        let declared = options.declared_size.unwrap_or(uncompressed_size).max(uncompressed_size);

        // Refuse before anything reaches the sink when ZIP64 is off.
        if self.zip64 == Zip64Mode::Off && (declared > MAX_32 || local_header_offset > MAX_32) {
            return Err(ArchiveError::structural(
                ErrorCode::ZipZip64Required,
                format!(
                    "entry '{name}' needs ZIP64 (size {declared}, offset {local_header_offset})"
                ),
            )
            .with_context("entryName", name.to_string()));
        }

        let codec = match options.method {
            CompressionMethod::Store => Codec::Store,
            CompressionMethod::Deflate => Codec::DeflateRaw,
            CompressionMethod::Zstd => Codec::Zstd,
            other => {
                return Err(ArchiveError::unsupported(
                    ErrorCode::ZipUnsupportedMethod,
                    format!("cannot write entries with method {other}"),
                ))
            }
        };
        let crc32 = Crc32::compute(data);
        let mut payload = codec.compress(data, options.level)?;
        let (dos_date, dos_time) = unix_to_dos(options.modified.unwrap_or(0));

        let mut flags = 0u16;
        let name_bytes = name.as_bytes().to_vec();
        let comment_bytes = options
            .comment
            .as_deref()
            .unwrap_or_default()
            .as_bytes()
            .to_vec();
        let utf8 = !name_bytes.is_ascii() || !comment_bytes.is_ascii();
        if utf8 {
            flags |= FLAG_UTF8;
        }
        if !self.patch {
            flags |= FLAG_DATA_DESCRIPTOR;
        }

        let mut stored_method = options
            .method
            .zip_id()
            .expect("writable methods have ids");
        let mut crc_field = crc32;
        let mut aes_extra = None;

        match &options.encryption {
            Encryption::None => {}
            Encryption::ZipCrypto { password } => {
                flags |= FLAG_ENCRYPTED;
                let check_word = if flags & FLAG_DATA_DESCRIPTOR != 0 {
                    u32::from(dos_time) << 16
                } else {
                    crc32
                };
                let mut cipher = ZipCrypto::new(password);
                let header = cipher.generate_header(check_word);
                cipher.encrypt_buffer(&mut payload);
                let mut framed = Vec::with_capacity(payload.len() + header.len());
                framed.extend_from_slice(&header);
                framed.append(&mut payload);
                payload = framed;
            }
            Encryption::Aes {
                password,
                strength,
                vendor_version,
            } => {
                if !(1..=2).contains(vendor_version) {
                    return Err(ArchiveError::structural(
                        ErrorCode::ZipBadHeader,
                        format!("unknown AES vendor version {vendor_version}"),
                    ));
                }
                flags |= FLAG_ENCRYPTED;
                let salt = AesContext::generate_salt(*strength);
                let mut context = AesContext::new(password, &salt, *strength)?;
                let verifier = context.verifier();
                context.encrypt(&mut payload);
                let auth = context.finalize_auth();
                let mut framed =
                    Vec::with_capacity(salt.len() + verifier.len() + payload.len() + auth.len());
                framed.extend_from_slice(&salt);
                framed.extend_from_slice(&verifier);
                framed.append(&mut payload);
                framed.extend_from_slice(&auth);
                payload = framed;

                aes_extra = Some(
                    AesExtra {
                        vendor_version: *vendor_version,
                        strength: *strength,
                        method: stored_method,
                    }
                    .encode(),
                );
                stored_method = METHOD_AES_MARKER;
                if *vendor_version == 2 {
                    crc_field = 0;
                }
            }
        }

        let compressed_size = payload.len() as u64;
        let needs_zip64 = match self.zip64 {
            Zip64Mode::Force => true,
            Zip64Mode::Auto => {
                declared > MAX_32 || compressed_size > MAX_32 || local_header_offset > MAX_32
            }
            Zip64Mode::Off => {
                if compressed_size > MAX_32 {
                    return Err(ArchiveError::structural(
                        ErrorCode::ZipZip64Required,
                        format!("entry '{name}' compressed size overflows 32 bits"),
                    ));
                }
                false
            }
        };

        let version_needed = version_needed_for(stored_method, needs_zip64);
        let entry = PendingEntry {
            name: name_bytes,
            flags,
            stored_method,
            dos_time,
            dos_date,
            crc_field,
            compressed_size,
            uncompressed_size,
            local_header_offset,
            zip64: needs_zip64,
            aes_extra,
            comment: comment_bytes,
            external_attr: options.unix_mode.map_or(0o100_644 << 16, |m| m << 16),
            version_needed,
        };

        self.write_local_header(&entry)?;
        self.sink.write(&payload)?;
        if self.patch {
            self.patch_local_header(&entry)?;
        } else {
            self.write_data_descriptor(&entry)?;
        }
        self.entries.push(entry);
        Ok(())
    }

    /// Stage a directory entry.
    pub fn add_directory(&mut self, name: &str) -> Result<()> {
        let dir_name = if name.ends_with('/') {
            name.to_string()
        } else {
            format!("{name}/")
        };
        let mut options = EntryOptions::stored();
        options.unix_mode = Some(0o40_755);
        self.add(&dir_name, b"", &options)
    }

    fn local_extra(&self, entry: &PendingEntry) -> Vec<u8> {
        let mut extra = ByteWriter::new();
        if entry.zip64 {
            // Sizes start zeroed; patch mode fixes them in place, descriptor
            // mode carries them in the ZIP64 descriptor instead.
            extra.u16_le(ZIP64_EXTRA_ID).u16_le(16);
            extra.u64_le(0).u64_le(0);
        }
        if let Some(aes) = &entry.aes_extra {
            extra.u16_le(WINZIP_AES_EXTRA_ID).u16_le(7).bytes(aes);
        }
        extra.into_vec()
    }

    fn write_local_header(&mut self, entry: &PendingEntry) -> Result<()> {
        let extra = self.local_extra(entry);
        let mut header = ByteWriter::with_capacity(30 + entry.name.len() + extra.len());
        header
            .u32_le(LOCAL_FILE_HEADER_SIG)
            .u16_le(entry.version_needed)
            .u16_le(entry.flags)
            .u16_le(entry.stored_method)
            .u16_le(entry.dos_time)
            .u16_le(entry.dos_date)
            .u32_le(0)
            .u32_le(if entry.zip64 { ZIP64_MARKER_32 } else { 0 })
            .u32_le(if entry.zip64 { ZIP64_MARKER_32 } else { 0 })
            .u16_le(entry.name.len() as u16)
            .u16_le(extra.len() as u16)
            .bytes(&entry.name)
            .bytes(&extra);
        self.sink.write(header.as_slice())
    }

    fn patch_local_header(&mut self, entry: &PendingEntry) -> Result<()> {
        let mut fields = ByteWriter::with_capacity(12);
        fields.u32_le(entry.crc_field);
        if entry.zip64 {
            fields.u32_le(ZIP64_MARKER_32).u32_le(ZIP64_MARKER_32);
        } else {
            fields
                .u32_le(entry.compressed_size as u32)
                .u32_le(entry.uncompressed_size as u32);
        }
        self.sink
            .write_at(entry.local_header_offset + 14, fields.as_slice())?;
        if entry.zip64 {
            // The ZIP64 extra sits right after the name; its two u64 size
            // fields follow the 4-byte extra header.
            let extra_offset =
                entry.local_header_offset + 30 + entry.name.len() as u64 + 4;
            let mut sizes = ByteWriter::with_capacity(16);
            sizes
                .u64_le(entry.uncompressed_size)
                .u64_le(entry.compressed_size);
            self.sink.write_at(extra_offset, sizes.as_slice())?;
        }
        Ok(())
    }

    fn write_data_descriptor(&mut self, entry: &PendingEntry) -> Result<()> {
        let mut descriptor = ByteWriter::with_capacity(24);
        descriptor.u32_le(DATA_DESCRIPTOR_SIG).u32_le(entry.crc_field);
        if entry.zip64 {
            descriptor
                .u64_le(entry.compressed_size)
                .u64_le(entry.uncompressed_size);
        } else {
            descriptor
                .u32_le(entry.compressed_size as u32)
                .u32_le(entry.uncompressed_size as u32);
        }
        self.sink.write(descriptor.as_slice())
    }

    fn write_central_record(&mut self, index: usize) -> Result<u64> {
        let entry = &self.entries[index];
        let zip64_extra = entry.zip64_extra();
        let mut extra = ByteWriter::new();
        extra.bytes(&zip64_extra);
        if let Some(aes) = &entry.aes_extra {
            extra.u16_le(WINZIP_AES_EXTRA_ID).u16_le(7).bytes(aes);
        }
        let extra = extra.into_vec();

        let mut record =
            ByteWriter::with_capacity(46 + entry.name.len() + extra.len() + entry.comment.len());
        record
            .u32_le(CENTRAL_DIR_HEADER_SIG)
            .u16_le(0x031E) // made by: Unix, spec 3.0
            .u16_le(entry.version_needed)
            .u16_le(entry.flags)
            .u16_le(entry.stored_method)
            .u16_le(entry.dos_time)
            .u16_le(entry.dos_date)
            .u32_le(entry.crc_field)
            // The ZIP64 extra always carries both sizes for promoted
            // entries, so the 32-bit fields must be sentinels.
            .u32_le(if entry.zip64 {
                ZIP64_MARKER_32
            } else {
                entry.compressed_size as u32
            })
            .u32_le(if entry.zip64 {
                ZIP64_MARKER_32
            } else {
                entry.uncompressed_size as u32
            })
            .u16_le(entry.name.len() as u16)
            .u16_le(extra.len() as u16)
            .u16_le(entry.comment.len() as u16)
            .u16_le(0) // disk start
            .u16_le(0) // internal attributes
            .u32_le(entry.external_attr)
            .u32_le(if entry.local_header_offset > MAX_32 {
                ZIP64_MARKER_32
            } else {
                entry.local_header_offset as u32
            })
            .bytes(&entry.name)
            .bytes(&extra)
            .bytes(&entry.comment);
        let len = record.len() as u64;
        self.sink.write(record.as_slice())?;
        Ok(len)
    }

    /// Write the central directory and EOCD records.
    pub fn close(&mut self, comment: Option<&str>) -> Result<()> {
        if self.finished {
            return Ok(());
        }
        let comment_bytes = comment.unwrap_or_default().as_bytes();
        if comment_bytes.len() > 65_535 {
            return Err(ArchiveError::structural(
                ErrorCode::ZipBadHeader,
                "archive comment exceeds 65535 bytes",
            ));
        }

        let cd_offset = self.sink.position();
        let mut cd_size = 0u64;
        for index in 0..self.entries.len() {
            cd_size += self.write_central_record(index)?;
        }

        let total_entries = self.entries.len() as u64;
        let needs_zip64 = self.zip64 == Zip64Mode::Force
            || self.entries.iter().any(|e| e.zip64)
            || total_entries > u64::from(ZIP64_MARKER_16 - 1)
            || cd_size > MAX_32
            || cd_offset > MAX_32;

        if needs_zip64 {
            let zip64_eocd_offset = self.sink.position();
            let mut record = ByteWriter::with_capacity(56);
            record
                .u32_le(ZIP64_EOCD_SIG)
                .u64_le(44)
                .u16_le(0x031E)
                .u16_le(45)
                .u32_le(0)
                .u32_le(0)
                .u64_le(total_entries)
                .u64_le(total_entries)
                .u64_le(cd_size)
                .u64_le(cd_offset);
            self.sink.write(record.as_slice())?;

            let mut locator = ByteWriter::with_capacity(20);
            locator
                .u32_le(ZIP64_EOCD_LOCATOR_SIG)
                .u32_le(0)
                .u64_le(zip64_eocd_offset)
                .u32_le(1);
            self.sink.write(locator.as_slice())?;
        }

        // With ZIP64 records present the classic EOCD carries sentinels so
        // readers follow the locator.
        let entries_16 = if needs_zip64 {
            ZIP64_MARKER_16
        } else {
            total_entries as u16
        };
        let mut eocd = ByteWriter::with_capacity(22 + comment_bytes.len());
        eocd.u32_le(END_OF_CENTRAL_DIR_SIG)
            .u16_le(0)
            .u16_le(0)
            .u16_le(entries_16)
            .u16_le(entries_16)
            .u32_le(if needs_zip64 {
                ZIP64_MARKER_32
            } else {
                clamp_32(cd_size)
            })
            .u32_le(if needs_zip64 {
                ZIP64_MARKER_32
            } else {
                clamp_32(cd_offset)
            })
            .u16_le(comment_bytes.len() as u16)
            .bytes(comment_bytes);
        self.sink.write(eocd.as_slice())?;
        self.sink.close()?;
        self.finished = true;
        Ok(())
    }

    /// Consume the writer, closing it first if needed.
    pub fn into_sink(mut self) -> Result<S> {
        self.close(None)?;
        Ok(self.sink)
    }
}

fn clamp_32(value: u64) -> u32 {
    if value > MAX_32 {
        ZIP64_MARKER_32
    } else {
        value as u32
    }
}

fn version_needed_for(method: u16, zip64: bool) -> u16 {
    let mut version = match method {
        0 => 10,
        METHOD_AES_MARKER => 51,
        93 => 63,
        _ => 20,
    };
    if zip64 {
        version = version.max(45);
    }
    version
}
