//! IMD disk-image engine for the K-1013 floppy controller emulation.
//!
//! The crate is split the same way the on-disk format is layered:
//!
//! - [`backend`]: byte-addressed storage ([`MemBackend`] for fixtures and
//!   tests, [`FileBackend`] for images on the SD card).
//! - [`imd`]: the IMD parser/mutator: track walking, sector reads and
//!   writes, in-place uncompression of compressed sectors, track formatting
//!   and image creation.
//! - [`status`]: the uPD765 ST0/ST1/ST2/ST3 bit vocabulary the controller
//!   folds engine outcomes into.
//! - [`library`]: file-level image management (list/copy/rename/erase) over
//!   the image directory.

mod backend;
mod error;
pub mod imd;
pub mod library;
pub mod status;

pub use backend::{FileBackend, MemBackend, StorageBackend};
pub use error::{ImdError, Result};
pub use imd::{
    CreateImageOpts, DataRequest, FormatRequest, ImdDisk, Mode, SectorType, Transfer,
    MAX_SECTORS_PER_TRACK, SECTOR_SIZES,
};
pub use library::{ImageLibrary, LibraryError, MAX_IMAGE_NAME};
pub use status::{St0, St1, St2, St3, TransferStatus};
