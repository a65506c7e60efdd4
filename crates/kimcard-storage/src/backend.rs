use std::fs::{File, OpenOptions};
use std::io::{Read, Seek, SeekFrom, Write};
use std::path::Path;

use crate::error::{ImdError, Result};

/// Byte-addressed storage underneath a disk image.
///
/// Reads past the end of the backend fail with
/// [`ImdError::OutOfBounds`]; writes past the end grow the backend and
/// zero-fill any gap.
pub trait StorageBackend {
    fn len(&mut self) -> Result<u64>;

    fn set_len(&mut self, len: u64) -> Result<()>;

    fn read_at(&mut self, offset: u64, buf: &mut [u8]) -> Result<()>;

    fn write_at(&mut self, offset: u64, buf: &[u8]) -> Result<()>;

    /// Push buffered writes down to the medium (`f_sync` on files).
    fn flush(&mut self) -> Result<()>;
}

/// In-memory backend used by fixtures and tests.
#[derive(Default, Debug)]
pub struct MemBackend {
    data: Vec<u8>,
}

impl MemBackend {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_len(len: u64) -> Result<Self> {
        Ok(Self {
            data: vec![0; usize::try_from(len).map_err(|_| ImdError::Unsupported("len"))?],
        })
    }

    pub fn from_vec(data: Vec<u8>) -> Self {
        Self { data }
    }

    pub fn into_vec(self) -> Vec<u8> {
        self.data
    }

    pub fn as_slice(&self) -> &[u8] {
        &self.data
    }
}

impl StorageBackend for MemBackend {
    fn len(&mut self) -> Result<u64> {
        Ok(self.data.len() as u64)
    }

    fn set_len(&mut self, len: u64) -> Result<()> {
        let len = usize::try_from(len).map_err(|_| ImdError::Unsupported("len"))?;
        self.data.resize(len, 0);
        Ok(())
    }

    fn read_at(&mut self, offset: u64, buf: &mut [u8]) -> Result<()> {
        let end = offset
            .checked_add(buf.len() as u64)
            .ok_or(ImdError::Unsupported("offset"))?;
        if end > self.data.len() as u64 {
            return Err(ImdError::OutOfBounds {
                offset,
                len: buf.len(),
                size: self.data.len() as u64,
            });
        }
        let start = offset as usize;
        buf.copy_from_slice(&self.data[start..start + buf.len()]);
        Ok(())
    }

    fn write_at(&mut self, offset: u64, buf: &[u8]) -> Result<()> {
        let end = offset
            .checked_add(buf.len() as u64)
            .ok_or(ImdError::Unsupported("offset"))?;
        let end = usize::try_from(end).map_err(|_| ImdError::Unsupported("offset"))?;
        if end > self.data.len() {
            self.data.resize(end, 0);
        }
        let start = offset as usize;
        self.data[start..end].copy_from_slice(buf);
        Ok(())
    }

    fn flush(&mut self) -> Result<()> {
        Ok(())
    }
}

/// Backend over a file on the SD card (or any filesystem).
#[derive(Debug)]
pub struct FileBackend {
    file: File,
}

impl FileBackend {
    /// Create (truncating) a file of `len` zero bytes.
    pub fn create<P: AsRef<Path>>(path: P, len: u64) -> Result<Self> {
        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(true)
            .open(path)?;
        file.set_len(len)?;
        Ok(Self { file })
    }

    pub fn open_rw<P: AsRef<Path>>(path: P) -> Result<Self> {
        let file = OpenOptions::new().read(true).write(true).open(path)?;
        Ok(Self { file })
    }

    pub fn open_read_only<P: AsRef<Path>>(path: P) -> Result<Self> {
        let file = OpenOptions::new().read(true).open(path)?;
        Ok(Self { file })
    }
}

impl StorageBackend for FileBackend {
    fn len(&mut self) -> Result<u64> {
        Ok(self.file.metadata()?.len())
    }

    fn set_len(&mut self, len: u64) -> Result<()> {
        self.file.set_len(len)?;
        Ok(())
    }

    fn read_at(&mut self, offset: u64, buf: &mut [u8]) -> Result<()> {
        let size = self.file.metadata()?.len();
        let end = offset
            .checked_add(buf.len() as u64)
            .ok_or(ImdError::Unsupported("offset"))?;
        if end > size {
            return Err(ImdError::OutOfBounds {
                offset,
                len: buf.len(),
                size,
            });
        }
        self.file.seek(SeekFrom::Start(offset))?;
        self.file.read_exact(buf)?;
        Ok(())
    }

    fn write_at(&mut self, offset: u64, buf: &[u8]) -> Result<()> {
        self.file.seek(SeekFrom::Start(offset))?;
        self.file.write_all(buf)?;
        Ok(())
    }

    fn flush(&mut self) -> Result<()> {
        self.file.sync_data()?;
        Ok(())
    }
}
