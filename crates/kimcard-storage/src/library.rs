//! File-level image management over the image directory on the SD card.
//!
//! The library knows nothing about mounts; the layer that owns the drive
//! bank refuses operations on mounted images before calling down here.

use std::fs;
use std::io;
use std::path::{Path, PathBuf};

use thiserror::Error;
use tracing::info;

use crate::backend::FileBackend;
use crate::error::ImdError;
use crate::imd::{CreateImageOpts, ImdDisk};

/// Longest accepted image name, in bytes.
pub const MAX_IMAGE_NAME: usize = 63;

#[derive(Debug, Error)]
pub enum LibraryError {
    #[error("invalid image name")]
    BadName,

    #[error("image not found")]
    NotFound,

    #[error("image already exists")]
    Exists,

    #[error("invalid image: {0}")]
    InvalidImage(#[source] ImdError),

    #[error("i/o error: {0}")]
    Io(#[from] io::Error),
}

/// A directory of IMD image files.
pub struct ImageLibrary {
    root: PathBuf,
}

impl ImageLibrary {
    pub fn new<P: Into<PathBuf>>(root: P) -> Self {
        Self { root: root.into() }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Image names are 1–63 bytes of printable ASCII with no path
    /// separators.
    pub fn validate_name(name: &str) -> Result<(), LibraryError> {
        if name.is_empty() || name.len() > MAX_IMAGE_NAME {
            return Err(LibraryError::BadName);
        }
        if !name
            .bytes()
            .all(|b| (0x20..0x7F).contains(&b) && b != b'/' && b != b'\\')
        {
            return Err(LibraryError::BadName);
        }
        Ok(())
    }

    pub fn path_of(&self, name: &str) -> Result<PathBuf, LibraryError> {
        Self::validate_name(name)?;
        Ok(self.root.join(name))
    }

    pub fn exists(&self, name: &str) -> Result<bool, LibraryError> {
        Ok(self.path_of(name)?.is_file())
    }

    /// Sorted names of every file in the directory.
    pub fn list(&self) -> Result<Vec<String>, LibraryError> {
        let mut names = Vec::new();
        for entry in fs::read_dir(&self.root)? {
            let entry = entry?;
            if entry.file_type()?.is_file() {
                if let Ok(name) = entry.file_name().into_string() {
                    names.push(name);
                }
            }
        }
        names.sort();
        Ok(names)
    }

    pub fn copy(&self, src: &str, dst: &str, overwrite: bool) -> Result<(), LibraryError> {
        let from = self.path_of(src)?;
        let to = self.path_of(dst)?;
        if !from.is_file() {
            return Err(LibraryError::NotFound);
        }
        if to.exists() && !overwrite {
            return Err(LibraryError::Exists);
        }
        fs::copy(&from, &to)?;
        info!(src, dst, "copied image");
        Ok(())
    }

    pub fn rename(&self, src: &str, dst: &str) -> Result<(), LibraryError> {
        let from = self.path_of(src)?;
        let to = self.path_of(dst)?;
        if !from.is_file() {
            return Err(LibraryError::NotFound);
        }
        if to.exists() {
            return Err(LibraryError::Exists);
        }
        fs::rename(&from, &to)?;
        info!(src, dst, "renamed image");
        Ok(())
    }

    pub fn erase(&self, name: &str) -> Result<(), LibraryError> {
        let path = self.path_of(name)?;
        if !path.is_file() {
            return Err(LibraryError::NotFound);
        }
        fs::remove_file(&path)?;
        info!(name, "erased image");
        Ok(())
    }

    pub fn read_file(&self, name: &str) -> Result<Vec<u8>, LibraryError> {
        let path = self.path_of(name)?;
        if !path.is_file() {
            return Err(LibraryError::NotFound);
        }
        Ok(fs::read(path)?)
    }

    pub fn write_file(&self, name: &str, bytes: &[u8], overwrite: bool) -> Result<(), LibraryError> {
        let path = self.path_of(name)?;
        if path.exists() && !overwrite {
            return Err(LibraryError::Exists);
        }
        fs::write(path, bytes)?;
        Ok(())
    }

    /// Create a fresh image file (see [`ImdDisk::create_image`]).
    pub fn create(&self, name: &str, opts: &CreateImageOpts) -> Result<(), LibraryError> {
        let path = self.path_of(name)?;
        if path.exists() {
            return Err(LibraryError::Exists);
        }
        let backend = FileBackend::create(&path, 0).map_err(io_or_invalid)?;
        match ImdDisk::create_image(backend, opts) {
            Ok(_) => {
                info!(
                    name,
                    cylinders = opts.cylinders,
                    sectors = opts.sectors,
                    "created image"
                );
                Ok(())
            }
            Err(err) => {
                // Leave no half-written image behind.
                let _ = fs::remove_file(&path);
                Err(LibraryError::InvalidImage(err))
            }
        }
    }

    /// Open and parse an image for mounting.
    pub fn open(&self, name: &str, read_only: bool) -> Result<ImdDisk<FileBackend>, LibraryError> {
        let path = self.path_of(name)?;
        if !path.is_file() {
            return Err(LibraryError::NotFound);
        }
        let backend = if read_only {
            FileBackend::open_read_only(&path)
        } else {
            FileBackend::open_rw(&path)
        }
        .map_err(io_or_invalid)?;
        ImdDisk::open(backend, name, read_only).map_err(LibraryError::InvalidImage)
    }
}

fn io_or_invalid(err: ImdError) -> LibraryError {
    match err {
        ImdError::Io(msg) => LibraryError::Io(io::Error::other(msg)),
        other => LibraryError::InvalidImage(other),
    }
}
