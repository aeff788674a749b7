//! Output sinks.
//!
//! A [`Sink`] is append-only: `write` advances `position`. Sinks that can
//! also patch already-written bytes report `is_seekable()` and implement
//! `write_at`, which never moves `position`. The ZIP writer uses that
//! capability to patch local headers in place instead of emitting data
//! descriptors.

use crate::error::{ArchiveError, ErrorCode, Result};
use std::fs::File;
use std::io::{Seek, SeekFrom, Write};

/// An append-only byte destination with optional positioned writes.
pub trait Sink {
    /// Bytes appended so far. Monotonic; unaffected by `write_at`.
    fn position(&self) -> u64;

    /// Append bytes, advancing `position`.
    fn write(&mut self, buf: &[u8]) -> Result<()>;

    /// Whether `write_at` is available.
    fn is_seekable(&self) -> bool {
        false
    }

    /// Overwrite previously appended bytes at `offset`. Does not move
    /// `position`. Only valid when `is_seekable()` is true and the range
    /// `[offset, offset + buf.len())` was already written.
    fn write_at(&mut self, _offset: u64, _buf: &[u8]) -> Result<()> {
        Err(ArchiveError::unsupported(
            ErrorCode::CompressionBadData,
            "sink does not support positioned writes",
        ))
    }

    /// Flush and release the destination. Further writes are invalid.
    fn close(&mut self) -> Result<()> {
        Ok(())
    }
}

impl<S: Sink + ?Sized> Sink for &mut S {
    fn position(&self) -> u64 {
        (**self).position()
    }

    fn write(&mut self, buf: &[u8]) -> Result<()> {
        (**self).write(buf)
    }

    fn is_seekable(&self) -> bool {
        (**self).is_seekable()
    }

    fn write_at(&mut self, offset: u64, buf: &[u8]) -> Result<()> {
        (**self).write_at(offset, buf)
    }

    fn close(&mut self) -> Result<()> {
        (**self).close()
    }
}

/// A growable in-memory sink. Seekable.
#[derive(Debug, Default)]
pub struct VecSink {
    data: Vec<u8>,
}

impl VecSink {
    /// Create an empty sink.
    pub fn new() -> Self {
        Self::default()
    }

    /// Consume the sink, yielding the written bytes.
    pub fn into_vec(self) -> Vec<u8> {
        self.data
    }

    /// Borrow the written bytes.
    pub fn as_slice(&self) -> &[u8] {
        &self.data
    }
}

impl Sink for VecSink {
    fn position(&self) -> u64 {
        self.data.len() as u64
    }

    fn write(&mut self, buf: &[u8]) -> Result<()> {
        self.data.extend_from_slice(buf);
        Ok(())
    }

    fn is_seekable(&self) -> bool {
        true
    }

    fn write_at(&mut self, offset: u64, buf: &[u8]) -> Result<()> {
        let start = offset as usize;
        let end = start.checked_add(buf.len()).ok_or_else(|| {
            ArchiveError::structural(ErrorCode::CompressionBadData, "write_at range overflow")
        })?;
        if end > self.data.len() {
            return Err(ArchiveError::structural(
                ErrorCode::CompressionBadData,
                format!(
                    "write_at past end of sink: range {start}..{end}, written {}",
                    self.data.len()
                ),
            ));
        }
        self.data[start..end].copy_from_slice(buf);
        Ok(())
    }
}

/// A file-backed sink. Seekable.
#[derive(Debug)]
pub struct FileSink {
    file: File,
    position: u64,
}

impl FileSink {
    /// Create a sink over a freshly created file.
    pub fn create(path: impl AsRef<std::path::Path>) -> Result<Self> {
        Ok(Self {
            file: File::create(path)?,
            position: 0,
        })
    }

    /// Wrap an open file positioned at its start.
    pub fn from_file(file: File) -> Self {
        Self { file, position: 0 }
    }
}

impl Sink for FileSink {
    fn position(&self) -> u64 {
        self.position
    }

    fn write(&mut self, buf: &[u8]) -> Result<()> {
        self.file.seek(SeekFrom::Start(self.position))?;
        self.file.write_all(buf)?;
        self.position += buf.len() as u64;
        Ok(())
    }

    fn is_seekable(&self) -> bool {
        true
    }

    fn write_at(&mut self, offset: u64, buf: &[u8]) -> Result<()> {
        if offset + buf.len() as u64 > self.position {
            return Err(ArchiveError::structural(
                ErrorCode::CompressionBadData,
                "write_at past end of sink",
            ));
        }
        self.file.seek(SeekFrom::Start(offset))?;
        self.file.write_all(buf)?;
        Ok(())
    }

    fn close(&mut self) -> Result<()> {
        self.file.flush()?;
        Ok(())
    }
}

/// A forward-only sink over any `std::io::Write`. Not seekable.
#[derive(Debug)]
pub struct StreamSink<W: Write> {
    inner: W,
    position: u64,
}

impl<W: Write> StreamSink<W> {
    /// Wrap a writer.
    pub fn new(inner: W) -> Self {
        Self { inner, position: 0 }
    }

    /// Consume the sink, yielding the inner writer.
    pub fn into_inner(self) -> W {
        self.inner
    }
}

impl<W: Write> Sink for StreamSink<W> {
    fn position(&self) -> u64 {
        self.position
    }

    fn write(&mut self, buf: &[u8]) -> Result<()> {
        self.inner.write_all(buf)?;
        self.position += buf.len() as u64;
        Ok(())
    }

    fn close(&mut self) -> Result<()> {
        self.inner.flush()?;
        Ok(())
    }
}
