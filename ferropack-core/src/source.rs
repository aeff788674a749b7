//! Random-access byte sources.
//!
//! Readers consume a [`RandomAccess`] handle for the lifetime of the reader.
//! Implementations are provided for in-memory buffers, files (seek-based, so
//! they work on every platform), memory-mapped files, and an LRU block cache
//! that fronts any other source.

use crate::error::{ArchiveError, ErrorCode, Result};
use lru::LruCache;
use std::fs::File;
use std::io::{Read, Seek, SeekFrom};
use std::num::NonZeroUsize;
use std::path::Path;
use std::rc::Rc;

/// A byte source addressable by absolute offset.
pub trait RandomAccess {
    /// Total size in bytes.
    fn size(&mut self) -> Result<u64>;

    /// Read up to `buf.len()` bytes starting at `offset`. Returns the number
    /// of bytes read, which is less than requested only at end of input.
    fn read_at(&mut self, offset: u64, buf: &mut [u8]) -> Result<usize>;

    /// Release underlying resources. Further reads are invalid.
    fn close(&mut self) -> Result<()> {
        Ok(())
    }

    /// Read exactly `buf.len()` bytes at `offset`, failing on a short read.
    fn read_exact_at(&mut self, offset: u64, buf: &mut [u8]) -> Result<()> {
        let mut filled = 0usize;
        while filled < buf.len() {
            let n = self.read_at(offset + filled as u64, &mut buf[filled..])?;
            if n == 0 {
                return Err(ArchiveError::structural(
                    ErrorCode::CompressionBadData,
                    format!(
                        "unexpected end of input: wanted {} bytes at offset {offset}, got {filled}",
                        buf.len()
                    ),
                ));
            }
            filled += n;
        }
        Ok(())
    }

    /// Convenience: read a fresh `Vec` of exactly `len` bytes at `offset`.
    fn read_vec_at(&mut self, offset: u64, len: usize) -> Result<Vec<u8>> {
        let mut buf = vec![0u8; len];
        self.read_exact_at(offset, &mut buf)?;
        Ok(buf)
    }
}

/// An in-memory source.
#[derive(Debug, Clone)]
pub struct MemorySource {
    data: Rc<Vec<u8>>,
}

impl MemorySource {
    /// Wrap an owned buffer.
    pub fn new(data: Vec<u8>) -> Self {
        Self {
            data: Rc::new(data),
        }
    }

    /// Borrow the underlying bytes.
    pub fn as_slice(&self) -> &[u8] {
        &self.data
    }
}

impl From<&[u8]> for MemorySource {
    fn from(data: &[u8]) -> Self {
        Self::new(data.to_vec())
    }
}

impl From<Vec<u8>> for MemorySource {
    fn from(data: Vec<u8>) -> Self {
        Self::new(data)
    }
}

impl RandomAccess for MemorySource {
    fn size(&mut self) -> Result<u64> {
        Ok(self.data.len() as u64)
    }

    fn read_at(&mut self, offset: u64, buf: &mut [u8]) -> Result<usize> {
        let len = self.data.len() as u64;
        if offset >= len {
            return Ok(0);
        }
        let start = offset as usize;
        let n = buf.len().min(self.data.len() - start);
        buf[..n].copy_from_slice(&self.data[start..start + n]);
        Ok(n)
    }
}

/// A file-backed source using seek-then-read.
#[derive(Debug)]
pub struct FileSource {
    file: File,
    size: u64,
}

impl FileSource {
    /// Open a file for random access.
    pub fn open(path: impl AsRef<Path>) -> Result<Self> {
        let file = File::open(path)?;
        Self::from_file(file)
    }

    /// Wrap an already-open file.
    pub fn from_file(file: File) -> Result<Self> {
        let size = file.metadata()?.len();
        Ok(Self { file, size })
    }
}

impl RandomAccess for FileSource {
    fn size(&mut self) -> Result<u64> {
        Ok(self.size)
    }

    fn read_at(&mut self, offset: u64, buf: &mut [u8]) -> Result<usize> {
        if offset >= self.size {
            return Ok(0);
        }
        self.file.seek(SeekFrom::Start(offset))?;
        let mut filled = 0usize;
        while filled < buf.len() {
            match self.file.read(&mut buf[filled..]) {
                Ok(0) => break,
                Ok(n) => filled += n,
                Err(e) if e.kind() == std::io::ErrorKind::Interrupted => continue,
                Err(e) => return Err(e.into()),
            }
        }
        Ok(filled)
    }
}

/// A memory-mapped file source.
///
/// The mapping stays valid for the lifetime of the source; mutation of the
/// underlying file by other processes is the caller's concern, as with any
/// mmap use.
#[derive(Debug)]
pub struct MmapSource {
    map: memmap2::Mmap,
}

impl MmapSource {
    /// Map a file read-only.
    pub fn open(path: impl AsRef<Path>) -> Result<Self> {
        let file = File::open(path)?;
        Self::from_file(&file)
    }

    /// Map an already-open file read-only.
    pub fn from_file(file: &File) -> Result<Self> {
        // SAFETY: read-only mapping of a file we just opened; the map is
        // dropped before the source is reused for anything else.
        let map = unsafe { memmap2::Mmap::map(file)? };
        Ok(Self { map })
    }
}

impl RandomAccess for MmapSource {
    fn size(&mut self) -> Result<u64> {
        Ok(self.map.len() as u64)
    }

    fn read_at(&mut self, offset: u64, buf: &mut [u8]) -> Result<usize> {
        let len = self.map.len() as u64;
        if offset >= len {
            return Ok(0);
        }
        let start = offset as usize;
        let n = buf.len().min(self.map.len() - start);
        buf[..n].copy_from_slice(&self.map[start..start + n]);
        Ok(n)
    }
}

/// Default block size for [`CachedSource`].
pub const DEFAULT_BLOCK_SIZE: usize = 64 * 1024;

/// Default block count for [`CachedSource`].
pub const DEFAULT_MAX_BLOCKS: usize = 64;

/// An LRU block cache in front of another source.
///
/// Reads are served from fixed-size blocks; repeated reads of the same block
/// coalesce into a single fetch from the inner source, and eviction is
/// least-recently-used.
pub struct CachedSource<S: RandomAccess> {
    inner: S,
    block_size: usize,
    cache: LruCache<u64, Rc<Vec<u8>>>,
    size: Option<u64>,
}

impl<S: RandomAccess> CachedSource<S> {
    /// Wrap `inner` with the default block geometry.
    pub fn new(inner: S) -> Self {
        Self::with_geometry(inner, DEFAULT_BLOCK_SIZE, DEFAULT_MAX_BLOCKS)
    }

    /// Wrap `inner` with explicit `block_size` and `max_blocks`.
    pub fn with_geometry(inner: S, block_size: usize, max_blocks: usize) -> Self {
        let capacity = NonZeroUsize::new(max_blocks.max(1)).unwrap();
        Self {
            inner,
            block_size: block_size.max(1),
            cache: LruCache::new(capacity),
            size: None,
        }
    }

    fn block(&mut self, index: u64) -> Result<Rc<Vec<u8>>> {
        if let Some(block) = self.cache.get(&index) {
            return Ok(block.clone());
        }
        let offset = index * self.block_size as u64;
        let mut buf = vec![0u8; self.block_size];
        let n = self.inner.read_at(offset, &mut buf)?;
        buf.truncate(n);
        let block = Rc::new(buf);
        self.cache.put(index, block.clone());
        Ok(block)
    }

    /// Consume the cache, returning the inner source.
    pub fn into_inner(self) -> S {
        self.inner
    }
}

impl<S: RandomAccess> RandomAccess for CachedSource<S> {
    fn size(&mut self) -> Result<u64> {
        if let Some(size) = self.size {
            return Ok(size);
        }
        let size = self.inner.size()?;
        self.size = Some(size);
        Ok(size)
    }

    fn read_at(&mut self, offset: u64, buf: &mut [u8]) -> Result<usize> {
        let mut filled = 0usize;
        while filled < buf.len() {
            let pos = offset + filled as u64;
            let index = pos / self.block_size as u64;
            let within = (pos % self.block_size as u64) as usize;
            let block = self.block(index)?;
            if within >= block.len() {
                break; // end of input
            }
            let n = (buf.len() - filled).min(block.len() - within);
            buf[filled..filled + n].copy_from_slice(&block[within..within + n]);
            filled += n;
            if block.len() < self.block_size {
                break; // short block means end of input
            }
        }
        Ok(filled)
    }

    fn close(&mut self) -> Result<()> {
        self.cache.clear();
        self.inner.close()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::cell::Cell;
    use std::io::Write;

    #[test]
    fn test_memory_source() {
        let mut src = MemorySource::from(&b"hello world"[..]);
        assert_eq!(src.size().unwrap(), 11);
        let mut buf = [0u8; 5];
        assert_eq!(src.read_at(6, &mut buf).unwrap(), 5);
        assert_eq!(&buf, b"world");
        assert_eq!(src.read_at(11, &mut buf).unwrap(), 0);
        // Short read at the tail.
        assert_eq!(src.read_at(9, &mut buf).unwrap(), 2);
    }

    #[test]
    fn test_file_source() {
        let mut tmp = tempfile::NamedTempFile::new().unwrap();
        tmp.write_all(b"0123456789").unwrap();
        let mut src = FileSource::open(tmp.path()).unwrap();
        assert_eq!(src.size().unwrap(), 10);
        let mut buf = [0u8; 4];
        src.read_exact_at(3, &mut buf).unwrap();
        assert_eq!(&buf, b"3456");
    }

    #[test]
    fn test_mmap_source() {
        let mut tmp = tempfile::NamedTempFile::new().unwrap();
        tmp.write_all(b"mapped bytes").unwrap();
        let mut src = MmapSource::open(tmp.path()).unwrap();
        assert_eq!(src.size().unwrap(), 12);
        assert_eq!(src.read_vec_at(0, 6).unwrap(), b"mapped");
    }

    /// Counts fetches so cache coalescing can be observed.
    struct CountingSource<'a> {
        data: &'a [u8],
        fetches: &'a Cell<usize>,
    }

    impl RandomAccess for CountingSource<'_> {
        fn size(&mut self) -> Result<u64> {
            Ok(self.data.len() as u64)
        }

        fn read_at(&mut self, offset: u64, buf: &mut [u8]) -> Result<usize> {
            self.fetches.set(self.fetches.get() + 1);
            let start = (offset as usize).min(self.data.len());
            let n = buf.len().min(self.data.len() - start);
            buf[..n].copy_from_slice(&self.data[start..start + n]);
            Ok(n)
        }
    }

    #[test]
    fn test_cached_source_coalesces_block_reads() {
        let data: Vec<u8> = (0..=255u8).cycle().take(1000).collect();
        let fetches = Cell::new(0);
        let inner = CountingSource {
            data: &data,
            fetches: &fetches,
        };
        let mut cached = CachedSource::with_geometry(inner, 256, 4);

        let first = cached.read_vec_at(0, 100).unwrap();
        let second = cached.read_vec_at(100, 100).unwrap();
        assert_eq!(first, data[..100]);
        assert_eq!(second, data[100..200]);
        // Both reads fall inside block 0: exactly one underlying fetch.
        assert_eq!(fetches.get(), 1);

        // Crossing a block boundary fetches exactly the second block.
        let spanning = cached.read_vec_at(200, 100).unwrap();
        assert_eq!(spanning, data[200..300]);
        assert_eq!(fetches.get(), 2);
    }

    #[test]
    fn test_cached_source_evicts_lru() {
        let data = vec![7u8; 4096];
        let fetches = Cell::new(0);
        let inner = CountingSource {
            data: &data,
            fetches: &fetches,
        };
        let mut cached = CachedSource::with_geometry(inner, 256, 2);
        cached.read_vec_at(0, 1).unwrap(); // block 0
        cached.read_vec_at(256, 1).unwrap(); // block 1
        cached.read_vec_at(512, 1).unwrap(); // block 2, evicts block 0
        assert_eq!(fetches.get(), 3);
        cached.read_vec_at(0, 1).unwrap(); // block 0 again: refetch
        assert_eq!(fetches.get(), 4);
    }
}
