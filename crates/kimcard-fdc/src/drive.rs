use kimcard_storage::{ImdDisk, LibraryError, StorageBackend};
use thiserror::Error;
use tracing::info;

pub const MAX_DRIVES: usize = 4;

/// Why a mount (or an operation that requires an unmounted image) failed.
#[derive(Debug, Error)]
pub enum MountError {
    #[error("invalid image name")]
    BadName,

    #[error("image not found")]
    NotFound,

    #[error("image mounted")]
    ImageMounted,

    #[error("drive mounted")]
    DriveMounted,

    #[error("no such drive")]
    BadDrive,

    #[error("invalid image")]
    InvalidImage(#[source] kimcard_storage::ImdError),

    #[error("i/o error: {0}")]
    Io(String),
}

impl From<LibraryError> for MountError {
    fn from(err: LibraryError) -> Self {
        match err {
            LibraryError::BadName => MountError::BadName,
            LibraryError::NotFound => MountError::NotFound,
            LibraryError::Exists => MountError::Io("image already exists".to_string()),
            LibraryError::InvalidImage(inner) => MountError::InvalidImage(inner),
            LibraryError::Io(inner) => MountError::Io(inner.to_string()),
        }
    }
}

/// The up-to-four mounted drives of one controller.
pub struct DriveBank<B: StorageBackend> {
    drives: [Option<ImdDisk<B>>; MAX_DRIVES],
}

impl<B: StorageBackend> DriveBank<B> {
    pub fn new() -> Self {
        Self {
            drives: std::array::from_fn(|_| None),
        }
    }

    /// Mount an already-opened image. A drive holds at most one image and an
    /// image name is mounted on at most one drive.
    pub fn mount(&mut self, drive: usize, disk: ImdDisk<B>) -> Result<(), MountError> {
        if drive >= MAX_DRIVES {
            return Err(MountError::BadDrive);
        }
        if self.drives[drive].is_some() {
            return Err(MountError::DriveMounted);
        }
        if self.is_image_mounted(disk.name()) {
            return Err(MountError::ImageMounted);
        }
        info!(drive, image = disk.name(), read_only = disk.read_only(), "mounted image");
        self.drives[drive] = Some(disk);
        Ok(())
    }

    /// Unmount and return the image, closing it when dropped by the caller.
    pub fn unmount(&mut self, drive: usize) -> Result<ImdDisk<B>, MountError> {
        if drive >= MAX_DRIVES {
            return Err(MountError::BadDrive);
        }
        let disk = self.drives[drive].take().ok_or(MountError::NotFound)?;
        info!(drive, image = disk.name(), "unmounted image");
        Ok(disk)
    }

    pub fn get(&self, drive: usize) -> Option<&ImdDisk<B>> {
        self.drives.get(drive).and_then(|d| d.as_ref())
    }

    pub fn get_mut(&mut self, drive: usize) -> Option<&mut ImdDisk<B>> {
        self.drives.get_mut(drive).and_then(|d| d.as_mut())
    }

    pub fn is_image_mounted(&self, name: &str) -> bool {
        self.drives
            .iter()
            .flatten()
            .any(|disk| disk.name() == name)
    }

    /// `(drive, image name, read-only)` for every mounted drive.
    pub fn mounted(&self) -> Vec<(usize, String, bool)> {
        self.drives
            .iter()
            .enumerate()
            .filter_map(|(i, d)| {
                d.as_ref()
                    .map(|disk| (i, disk.name().to_string(), disk.read_only()))
            })
            .collect()
    }
}

impl<B: StorageBackend> Default for DriveBank<B> {
    fn default() -> Self {
        Self::new()
    }
}
