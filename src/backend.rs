use std::fs::{File, OpenOptions};
use std::io::{Read, Seek, SeekFrom, Write};
use std::path::Path;

use crate::{DiskError, Result};

/// A resizable, byte-addressed backing store for disk image containers.
///
/// Container accessors are written against this trait rather than against
/// `std::fs::File` directly, so images can be parsed from memory in tests
/// and fuzzing as well as from real files.
pub trait StorageBackend {
    /// Current length in bytes.
    fn len(&mut self) -> Result<u64>;

    /// Resize to `len` bytes. Growth zero-fills the new range.
    fn set_len(&mut self, len: u64) -> Result<()>;

    /// Read exactly `buf.len()` bytes at `offset`.
    ///
    /// A read that would cross the end of the backing is an error; it is never
    /// silently truncated.
    fn read_at(&mut self, offset: u64, buf: &mut [u8]) -> Result<()>;

    /// Write all `buf.len()` bytes at `offset`, extending the backing if
    /// required. Any gap created by the extension reads as zeros.
    fn write_at(&mut self, offset: u64, buf: &[u8]) -> Result<()>;

    /// Flush any buffered state to durable storage.
    fn flush(&mut self) -> Result<()>;
}

/// In-memory storage backend used for tests and fuzzing.
#[derive(Clone, Debug, Default)]
pub struct MemBackend {
    bytes: Vec<u8>,
}

impl MemBackend {
    /// An image of `len` zero bytes.
    pub fn zeroed(len: u64) -> Result<Self> {
        let mut backend = Self::default();
        backend.set_len(len)?;
        Ok(backend)
    }

    /// Translate an (offset, length) pair into vector indices.
    fn span(offset: u64, len: usize) -> Result<(usize, usize)> {
        let start: usize = offset.try_into().map_err(|_| DiskError::OffsetOverflow)?;
        let end = start.checked_add(len).ok_or(DiskError::OffsetOverflow)?;
        Ok((start, end))
    }
}

impl StorageBackend for MemBackend {
    fn len(&mut self) -> Result<u64> {
        Ok(self.bytes.len() as u64)
    }

    fn set_len(&mut self, len: u64) -> Result<()> {
        let len: usize = len.try_into().map_err(|_| DiskError::OffsetOverflow)?;
        self.bytes.resize(len, 0);
        Ok(())
    }

    fn read_at(&mut self, offset: u64, buf: &mut [u8]) -> Result<()> {
        let (start, end) = Self::span(offset, buf.len())?;
        let src = self.bytes.get(start..end).ok_or(DiskError::OutOfBounds {
            offset,
            len: buf.len(),
            capacity: self.bytes.len() as u64,
        })?;
        buf.copy_from_slice(src);
        Ok(())
    }

    fn write_at(&mut self, offset: u64, buf: &[u8]) -> Result<()> {
        let (start, end) = Self::span(offset, buf.len())?;
        if self.bytes.len() < end {
            self.bytes.resize(end, 0);
        }
        self.bytes[start..end].copy_from_slice(buf);
        Ok(())
    }

    fn flush(&mut self) -> Result<()> {
        Ok(())
    }
}

/// Storage backend over a `std::fs::File`.
///
/// Owns exactly one file descriptor, released when the backend is dropped.
#[derive(Debug)]
pub struct FileBackend {
    file: File,
    writable: bool,
}

impl FileBackend {
    /// Open an existing image file for reading and writing.
    pub fn open_rw(path: impl AsRef<Path>) -> Result<Self> {
        let file = OpenOptions::new().read(true).write(true).open(path)?;
        Ok(Self {
            file,
            writable: true,
        })
    }

    /// Open an existing image file for reading only. Writes and resizes fail
    /// with [`DiskError::ReadOnly`].
    pub fn open_read_only(path: impl AsRef<Path>) -> Result<Self> {
        let file = OpenOptions::new().read(true).open(path)?;
        Ok(Self {
            file,
            writable: false,
        })
    }

    /// Create (or truncate) a file of `len` zero bytes.
    pub fn create(path: impl AsRef<Path>, len: u64) -> Result<Self> {
        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(true)
            .open(path)?;
        file.set_len(len)?;
        Ok(Self {
            file,
            writable: true,
        })
    }

    pub fn into_file(self) -> File {
        self.file
    }
}

impl StorageBackend for FileBackend {
    fn len(&mut self) -> Result<u64> {
        Ok(self.file.metadata()?.len())
    }

    fn set_len(&mut self, len: u64) -> Result<()> {
        if !self.writable {
            return Err(DiskError::ReadOnly);
        }
        self.file.set_len(len)?;
        Ok(())
    }

    fn read_at(&mut self, offset: u64, buf: &mut [u8]) -> Result<()> {
        let end = offset
            .checked_add(buf.len() as u64)
            .ok_or(DiskError::OffsetOverflow)?;
        let capacity = self.len()?;
        if end > capacity {
            return Err(DiskError::OutOfBounds {
                offset,
                len: buf.len(),
                capacity,
            });
        }
        self.file.seek(SeekFrom::Start(offset))?;
        self.file.read_exact(buf)?;
        Ok(())
    }

    fn write_at(&mut self, offset: u64, buf: &[u8]) -> Result<()> {
        if !self.writable {
            return Err(DiskError::ReadOnly);
        }
        offset
            .checked_add(buf.len() as u64)
            .ok_or(DiskError::OffsetOverflow)?;
        self.file.seek(SeekFrom::Start(offset))?;
        self.file.write_all(buf)?;
        Ok(())
    }

    fn flush(&mut self) -> Result<()> {
        self.file.sync_all()?;
        Ok(())
    }
}
