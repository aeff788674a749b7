//! TAR archive support: ustar with PAX extended headers.
//!
//! Numeric fields are NUL/space-terminated octal with a base-256 fallback
//! (bit 7 of the first byte set means a signed big-endian value). PAX `x`
//! records override the following header's path, linkpath, size, mtime, and
//! ownership fields; names longer than 100 bytes are written as PAX records.

use ferropack_core::cancel::CancelToken;
use ferropack_core::entry::{ArchiveEntry, EntryKind, FileAttributes};
use ferropack_core::error::{ArchiveError, ErrorCode, Result};
use ferropack_core::limits::{Profile, ResourceLimits};
use ferropack_core::sink::Sink;
use std::collections::HashMap;
use std::io::Read;

/// TAR block size.
pub const BLOCK_SIZE: usize = 512;

const PAX_HEADER: u8 = b'x';
const PAX_GLOBAL_HEADER: u8 = b'g';
const GNU_LONGNAME: u8 = b'L';
const GNU_LONGLINK: u8 = b'K';

fn bad(message: impl Into<String>) -> ArchiveError {
    ArchiveError::structural(ErrorCode::TarBadHeader, message.into())
}

/// Parse a NUL/space-terminated string field.
fn parse_string(data: &[u8]) -> String {
    let end = data.iter().position(|&b| b == 0).unwrap_or(data.len());
    String::from_utf8_lossy(&data[..end])
        .trim_end_matches(' ')
        .to_string()
}

/// Parse an octal or base-256 numeric field.
fn parse_numeric(data: &[u8]) -> Result<u64> {
    if data.is_empty() {
        return Ok(0);
    }
    if data[0] & 0x80 != 0 {
        // Base-256: signed big-endian with the top bit of byte 0 as marker.
        if data[0] & 0x40 != 0 {
            return Err(ArchiveError::structural(
                ErrorCode::TarSizeOverflow,
                "negative base-256 numeric field",
            ));
        }
        let mut value: u64 = u64::from(data[0] & 0x3F);
        for &byte in &data[1..] {
            if value > (u64::MAX >> 8) {
                return Err(ArchiveError::structural(
                    ErrorCode::TarSizeOverflow,
                    "base-256 numeric field overflows 64 bits",
                ));
            }
            value = (value << 8) | u64::from(byte);
        }
        if value > i64::MAX as u64 {
            return Err(ArchiveError::structural(
                ErrorCode::TarSizeOverflow,
                "numeric field exceeds 2^63 - 1",
            ));
        }
        return Ok(value);
    }
    let text = parse_string(data);
    let text = text.trim();
    if text.is_empty() {
        return Ok(0);
    }
    u64::from_str_radix(text, 8).map_err(|_| bad(format!("invalid octal field: {text:?}")))
}

/// Write an octal field with a trailing NUL.
fn write_octal(field: &mut [u8], value: u64) {
    let s = format!("{value:0width$o}", width = field.len() - 1);
    let bytes = s.as_bytes();
    if bytes.len() < field.len() {
        field[..bytes.len()].copy_from_slice(bytes);
    } else {
        // Does not fit in octal: base-256.
        field[0] = 0x80;
        let len = field.len() - 1;
        for i in 0..len {
            field[field.len() - 1 - i] = (value >> (8 * i)) as u8;
        }
        field[0] |= ((value >> (8 * len)) & 0x3F) as u8;
    }
}

/// One raw 512-byte header, parsed.
#[derive(Debug, Clone)]
pub struct TarHeader {
    /// Full entry name (prefix joined when ustar).
    pub name: String,
    /// Mode bits.
    pub mode: u32,
    /// Owner uid.
    pub uid: u32,
    /// Owner gid.
    pub gid: u32,
    /// Payload size in bytes.
    pub size: u64,
    /// Modification time (Unix seconds).
    pub mtime: i64,
    /// Type flag byte.
    pub typeflag: u8,
    /// Link target.
    pub linkname: String,
    /// Whether the ustar magic was present.
    pub ustar: bool,
    /// Owner user name.
    pub uname: String,
    /// Owner group name.
    pub gname: String,
}

impl TarHeader {
    /// Parse a block; `None` for an all-zero terminator block.
    ///
    /// The header checksum is always verified; integrity failures are never
    /// profile-dependent. Both the unsigned and the historical signed sum
    /// are accepted.
    pub fn from_block(block: &[u8; BLOCK_SIZE]) -> Result<Option<Self>> {
        if block.iter().all(|&b| b == 0) {
            return Ok(None);
        }

        let stored = parse_numeric(&block[148..156])? as u32;
        let mut unsigned: u32 = 0;
        let mut signed: i64 = 0;
        for (i, &byte) in block.iter().enumerate() {
            let b = if (148..156).contains(&i) { b' ' } else { byte };
            unsigned = unsigned.wrapping_add(u32::from(b));
            signed = signed.wrapping_add(i64::from(b as i8));
        }
        if stored != unsigned && i64::from(stored) != signed {
            return Err(ArchiveError::integrity(
                ErrorCode::TarBadChecksum,
                format!("header checksum mismatch: stored {stored}, computed {unsigned}"),
            ));
        }

        let name = parse_string(&block[0..100]);
        let mode = parse_numeric(&block[100..108])? as u32;
        let uid = parse_numeric(&block[108..116])? as u32;
        let gid = parse_numeric(&block[116..124])? as u32;
        let size = parse_numeric(&block[124..136])?;
        let mtime = parse_numeric(&block[136..148])? as i64;
        let typeflag = block[156];
        let linkname = parse_string(&block[157..257]);
        let ustar = &block[257..262] == b"ustar";
        let (uname, gname, prefix) = if ustar {
            (
                parse_string(&block[265..297]),
                parse_string(&block[297..329]),
                parse_string(&block[345..500]),
            )
        } else {
            (String::new(), String::new(), String::new())
        };

        let full_name = if prefix.is_empty() {
            name
        } else {
            format!("{prefix}/{name}")
        };

        Ok(Some(Self {
            name: full_name,
            mode,
            uid,
            gid,
            size,
            mtime,
            typeflag,
            linkname,
            ustar,
            uname,
            gname,
        }))
    }

    /// Entry kind from the type flag.
    pub fn kind(&self) -> EntryKind {
        match self.typeflag {
            b'0' | 0 => {
                if self.name.ends_with('/') {
                    EntryKind::Directory
                } else {
                    EntryKind::File
                }
            }
            b'5' => EntryKind::Directory,
            b'1' => EntryKind::Hardlink,
            b'2' => EntryKind::Symlink,
            _ => EntryKind::Other,
        }
    }

    /// Apply PAX attribute overrides.
    pub fn apply_pax(&mut self, attrs: &HashMap<String, String>) -> Result<()> {
        if let Some(path) = attrs.get("path") {
            self.name = path.clone();
        }
        if let Some(linkpath) = attrs.get("linkpath") {
            self.linkname = linkpath.clone();
        }
        if let Some(size) = attrs.get("size") {
            self.size = size.parse::<u64>().ok().filter(|&s| s <= i64::MAX as u64).ok_or_else(
                || {
                    ArchiveError::structural(
                        ErrorCode::TarSizeOverflow,
                        format!("PAX size record out of range: {size:?}"),
                    )
                },
            )?;
        }
        if let Some(mtime) = attrs.get("mtime") {
            // PAX mtime may carry a fractional part; keep the whole seconds.
            let whole = mtime.split('.').next().unwrap_or(mtime);
            if let Ok(t) = whole.parse::<i64>() {
                self.mtime = t;
            }
        }
        if let Some(uid) = attrs.get("uid").and_then(|v| v.parse().ok()) {
            self.uid = uid;
        }
        if let Some(gid) = attrs.get("gid").and_then(|v| v.parse().ok()) {
            self.gid = gid;
        }
        if let Some(uname) = attrs.get("uname") {
            self.uname = uname.clone();
        }
        if let Some(gname) = attrs.get("gname") {
            self.gname = gname.clone();
        }
        Ok(())
    }

    /// Parse PAX record data: repeated `"<len> <key>=<value>\n"`.
    pub fn parse_pax_data(data: &[u8]) -> Result<HashMap<String, String>> {
        let mut attrs = HashMap::new();
        let mut pos = 0usize;
        while pos < data.len() {
            let space = data[pos..]
                .iter()
                .position(|&b| b == b' ')
                .map(|p| pos + p)
                .ok_or_else(|| bad("PAX record without a length delimiter"))?;
            let len_text = std::str::from_utf8(&data[pos..space])
                .map_err(|_| bad("PAX record length is not ASCII"))?;
            let record_len: usize = len_text
                .parse()
                .map_err(|_| bad(format!("invalid PAX record length {len_text:?}")))?;
            if record_len == 0 || pos + record_len > data.len() {
                return Err(bad("PAX record length out of bounds"));
            }
            let record_end = pos + record_len;
            if data[record_end - 1] != b'\n' {
                return Err(bad("PAX record does not end with a newline"));
            }
            let body = &data[space + 1..record_end - 1];
            let eq = body
                .iter()
                .position(|&b| b == b'=')
                .ok_or_else(|| bad("PAX record without '='"))?;
            let key = String::from_utf8_lossy(&body[..eq]).into_owned();
            let value = String::from_utf8_lossy(&body[eq + 1..]).into_owned();
            attrs.insert(key, value);
            pos = record_end;
        }
        Ok(attrs)
    }

    fn to_entry(&self) -> ArchiveEntry {
        ArchiveEntry {
            name: self.name.clone(),
            raw_name: self.name.as_bytes().to_vec(),
            name_source: ferropack_core::entry::NameSource::Utf8,
            kind: self.kind(),
            size: self.size,
            compressed_size: self.size,
            method: ferropack_core::entry::CompressionMethod::Store,
            crc32: None,
            header_offset: 0,
            modified: Some(self.mtime),
            accessed: None,
            created: None,
            encrypted: false,
            zip64: false,
            comment: None,
            link_target: if self.linkname.is_empty() {
                None
            } else {
                Some(self.linkname.clone())
            },
            attributes: FileAttributes {
                unix_mode: Some(self.mode),
                dos_attributes: None,
                uid: Some(self.uid),
                gid: Some(self.gid),
                uname: if self.uname.is_empty() {
                    None
                } else {
                    Some(self.uname.clone())
                },
                gname: if self.gname.is_empty() {
                    None
                } else {
                    Some(self.gname.clone())
                },
            },
        }
    }
}

/// One materialized TAR entry: metadata plus payload.
#[derive(Debug, Clone)]
pub struct TarEntry {
    /// Format-agnostic entry metadata.
    pub entry: ArchiveEntry,
    /// Entry payload (empty for directories and links).
    pub data: Vec<u8>,
}

/// Reader options.
#[derive(Debug, Clone, Default)]
pub struct TarReaderOptions {
    /// Strictness profile.
    pub profile: Profile,
    /// Resource ceilings.
    pub limits: ResourceLimits,
    /// Cooperative cancellation.
    pub cancel: CancelToken,
}

/// The fully read archive.
#[derive(Debug, Clone, Default)]
pub struct TarArchive {
    /// Entries in archive order.
    pub entries: Vec<TarEntry>,
    /// Bytes after the two terminator blocks.
    pub trailing_bytes: u64,
    /// Whether the terminator blocks were present at all.
    pub terminated: bool,
}

/// Read a complete TAR archive from a sequential stream.
pub fn read_tar<R: Read>(mut reader: R, options: &TarReaderOptions) -> Result<TarArchive> {
    let mut archive = TarArchive::default();
    let mut pax_attrs: Option<HashMap<String, String>> = None;
    let mut global_attrs: HashMap<String, String> = HashMap::new();
    let mut gnu_longname: Option<String> = None;
    let mut gnu_longlink: Option<String> = None;
    let mut total_bytes = 0u64;

    let mut block = [0u8; BLOCK_SIZE];
    loop {
        options.cancel.check()?;
        if !read_block(&mut reader, &mut block)? {
            // EOF without terminator blocks: tolerated, but noted.
            return Ok(archive);
        }

        let header = match TarHeader::from_block(&block) {
            Ok(Some(header)) => header,
            Ok(None) => {
                // First terminator block; expect a second, then EOF.
                archive.terminated = true;
                if read_block(&mut reader, &mut block)? {
                    let mut trailing = if block.iter().all(|&b| b == 0) { 0 } else { BLOCK_SIZE as u64 };
                    let mut sink = [0u8; BLOCK_SIZE];
                    loop {
                        let n = reader.read(&mut sink)?;
                        if n == 0 {
                            break;
                        }
                        trailing += n as u64;
                    }
                    archive.trailing_bytes = trailing;
                }
                return Ok(archive);
            }
            Err(err) => return Err(err),
        };

        let mut header = header;
        if header.typeflag == PAX_HEADER || header.typeflag == PAX_GLOBAL_HEADER {
            let data = read_payload(&mut reader, header.size, &options.limits)?;
            let attrs = TarHeader::parse_pax_data(&data)?;
            if header.typeflag == PAX_GLOBAL_HEADER {
                global_attrs.extend(attrs);
            } else {
                pax_attrs = Some(attrs);
            }
            continue;
        }
        if header.typeflag == GNU_LONGNAME || header.typeflag == GNU_LONGLINK {
            let data = read_payload(&mut reader, header.size, &options.limits)?;
            let text = String::from_utf8_lossy(&data)
                .trim_end_matches('\0')
                .to_string();
            if header.typeflag == GNU_LONGNAME {
                gnu_longname = Some(text);
            } else {
                gnu_longlink = Some(text);
            }
            continue;
        }

        if !global_attrs.is_empty() {
            header.apply_pax(&global_attrs)?;
        }
        if let Some(attrs) = pax_attrs.take() {
            header.apply_pax(&attrs)?;
        }
        if let Some(name) = gnu_longname.take() {
            header.name = name;
        }
        if let Some(link) = gnu_longlink.take() {
            header.linkname = link;
        }

        archive.entries.push(TarEntry {
            data: if header.kind() == EntryKind::File {
                let data = read_payload(&mut reader, header.size, &options.limits)?;
                total_bytes += data.len() as u64;
                if total_bytes > options.limits.max_total_uncompressed_bytes {
                    return Err(ArchiveError::resource_limit(
                        "TotalUncompressedBytes",
                        total_bytes,
                        options.limits.max_total_uncompressed_bytes,
                    ));
                }
                data
            } else {
                skip_payload(&mut reader, header.size)?;
                Vec::new()
            },
            entry: header.to_entry(),
        });
        if archive.entries.len() as u64 > options.limits.max_entries {
            return Err(ArchiveError::resource_limit(
                "Entries",
                archive.entries.len() as u64,
                options.limits.max_entries,
            ));
        }
    }
}

fn read_block<R: Read>(reader: &mut R, block: &mut [u8; BLOCK_SIZE]) -> Result<bool> {
    let mut filled = 0usize;
    while filled < BLOCK_SIZE {
        let n = reader.read(&mut block[filled..])?;
        if n == 0 {
            if filled == 0 {
                return Ok(false);
            }
            return Err(bad("archive ends inside a header block"));
        }
        filled += n;
    }
    Ok(true)
}

fn read_payload<R: Read>(reader: &mut R, size: u64, limits: &ResourceLimits) -> Result<Vec<u8>> {
    if size > limits.max_entry_uncompressed_bytes {
        return Err(ArchiveError::resource_limit(
            "EntryUncompressedBytes",
            size,
            limits.max_entry_uncompressed_bytes,
        ));
    }
    let mut data = vec![0u8; size as usize];
    let mut filled = 0usize;
    while filled < data.len() {
        let n = reader.read(&mut data[filled..])?;
        if n == 0 {
            return Err(bad("archive ends inside entry data"));
        }
        filled += n;
    }
    skip_padding(reader, size)?;
    Ok(data)
}

fn skip_payload<R: Read>(reader: &mut R, size: u64) -> Result<()> {
    let mut remaining = size;
    let mut chunk = [0u8; BLOCK_SIZE];
    while remaining > 0 {
        let want = remaining.min(BLOCK_SIZE as u64) as usize;
        let n = reader.read(&mut chunk[..want])?;
        if n == 0 {
            return Err(bad("archive ends inside entry data"));
        }
        remaining -= n as u64;
    }
    skip_padding(reader, size)
}

fn skip_padding<R: Read>(reader: &mut R, size: u64) -> Result<()> {
    let padding = (BLOCK_SIZE as u64 - (size % BLOCK_SIZE as u64)) % BLOCK_SIZE as u64;
    if padding > 0 {
        let mut pad = [0u8; BLOCK_SIZE];
        let mut filled = 0usize;
        while (filled as u64) < padding {
            let n = reader.read(&mut pad[filled..padding as usize])?;
            if n == 0 {
                return Err(bad("archive ends inside block padding"));
            }
            filled += n;
        }
    }
    Ok(())
}

/// Attributes for one written entry.
#[derive(Debug, Clone)]
pub struct TarEntryOptions {
    /// Mode bits.
    pub mode: u32,
    /// Modification time.
    pub mtime: i64,
    /// Owner uid.
    pub uid: u32,
    /// Owner gid.
    pub gid: u32,
    /// Owner user name.
    pub uname: String,
    /// Owner group name.
    pub gname: String,
}

impl Default for TarEntryOptions {
    fn default() -> Self {
        Self {
            mode: 0o644,
            mtime: 0,
            uid: 0,
            gid: 0,
            uname: String::new(),
            gname: String::new(),
        }
    }
}

/// TAR archive writer over a sink.
pub struct TarWriter<S: Sink> {
    sink: S,
    finished: bool,
}

impl<S: Sink> TarWriter<S> {
    /// Create a writer.
    pub fn new(sink: S) -> Self {
        Self {
            sink,
            finished: false,
        }
    }

    /// Add a regular file.
    pub fn add_file(&mut self, name: &str, data: &[u8], options: &TarEntryOptions) -> Result<()> {
        self.write_entry(name, b'0', data.len() as u64, Some(data), "", options)
    }

    /// Add a directory.
    pub fn add_directory(&mut self, name: &str, options: &TarEntryOptions) -> Result<()> {
        let dir_name = if name.ends_with('/') {
            name.to_string()
        } else {
            format!("{name}/")
        };
        self.write_entry(&dir_name, b'5', 0, None, "", options)
    }

    /// Add a symlink.
    pub fn add_symlink(
        &mut self,
        name: &str,
        target: &str,
        options: &TarEntryOptions,
    ) -> Result<()> {
        self.write_entry(name, b'2', 0, None, target, options)
    }

    fn write_entry(
        &mut self,
        name: &str,
        typeflag: u8,
        size: u64,
        data: Option<&[u8]>,
        linkname: &str,
        options: &TarEntryOptions,
    ) -> Result<()> {
        let mut pax = Vec::new();
        if name.len() > 100 {
            pax.extend_from_slice(format_pax_record("path", name).as_bytes());
        }
        if linkname.len() > 100 {
            pax.extend_from_slice(format_pax_record("linkpath", linkname).as_bytes());
        }
        if !pax.is_empty() {
            let pax_header = encode_header(
                "PaxHeader",
                PAX_HEADER,
                pax.len() as u64,
                "",
                &TarEntryOptions::default(),
            )?;
            self.sink.write(&pax_header)?;
            self.sink.write(&pax)?;
            self.write_padding(pax.len() as u64)?;
        }

        let short_name = if name.len() > 100 {
            // PAX carries the real path; keep a recognizable tail here.
            let tail_start = name.len() - 100;
            &name[tail_start..]
        } else {
            name
        };
        let short_link = if linkname.len() > 100 {
            &linkname[linkname.len() - 100..]
        } else {
            linkname
        };
        let header = encode_header(short_name, typeflag, size, short_link, options)?;
        self.sink.write(&header)?;
        if let Some(data) = data {
            self.sink.write(data)?;
            self.write_padding(data.len() as u64)?;
        }
        Ok(())
    }

    fn write_padding(&mut self, size: u64) -> Result<()> {
        let padding = (BLOCK_SIZE as u64 - (size % BLOCK_SIZE as u64)) % BLOCK_SIZE as u64;
        if padding > 0 {
            self.sink.write(&vec![0u8; padding as usize])?;
        }
        Ok(())
    }

    /// Write the two terminator blocks and close the sink.
    pub fn finish(&mut self) -> Result<()> {
        if !self.finished {
            self.sink.write(&[0u8; BLOCK_SIZE])?;
            self.sink.write(&[0u8; BLOCK_SIZE])?;
            self.sink.close()?;
            self.finished = true;
        }
        Ok(())
    }

    /// Consume the writer, finishing first.
    pub fn into_sink(mut self) -> Result<S> {
        self.finish()?;
        Ok(self.sink)
    }
}

/// Format one PAX record; the length prefix includes its own digits.
fn format_pax_record(key: &str, value: &str) -> String {
    let base_len = key.len() + value.len() + 3; // space, '=', newline
    let mut total = base_len + 1;
    loop {
        let digits = total.to_string().len();
        if base_len + digits == total {
            break;
        }
        total = base_len + digits;
    }
    format!("{total} {key}={value}\n")
}

fn encode_header(
    name: &str,
    typeflag: u8,
    size: u64,
    linkname: &str,
    options: &TarEntryOptions,
) -> Result<[u8; BLOCK_SIZE]> {
    let mut block = [0u8; BLOCK_SIZE];
    let name_bytes = name.as_bytes();
    if name_bytes.len() > 100 {
        return Err(bad("header name longer than 100 bytes"));
    }
    block[..name_bytes.len()].copy_from_slice(name_bytes);
    write_octal(&mut block[100..108], u64::from(options.mode));
    write_octal(&mut block[108..116], u64::from(options.uid));
    write_octal(&mut block[116..124], u64::from(options.gid));
    write_octal(&mut block[124..136], size);
    write_octal(&mut block[136..148], options.mtime.max(0) as u64);
    block[148..156].copy_from_slice(b"        ");
    block[156] = typeflag;
    let link_bytes = linkname.as_bytes();
    block[157..157 + link_bytes.len().min(100)]
        .copy_from_slice(&link_bytes[..link_bytes.len().min(100)]);
    block[257..263].copy_from_slice(b"ustar\0");
    block[263..265].copy_from_slice(b"00");
    let uname = options.uname.as_bytes();
    block[265..265 + uname.len().min(31)].copy_from_slice(&uname[..uname.len().min(31)]);
    let gname = options.gname.as_bytes();
    block[297..297 + gname.len().min(31)].copy_from_slice(&gname[..gname.len().min(31)]);

    let checksum: u32 = block.iter().map(|&b| u32::from(b)).sum();
    let checksum_text = format!("{checksum:06o}\0 ");
    block[148..156].copy_from_slice(&checksum_text.as_bytes()[..8]);
    Ok(block)
}
