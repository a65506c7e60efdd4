use thiserror::Error;

pub type Result<T> = std::result::Result<T, ImdError>;

/// Errors surfaced by the storage backends and the IMD engine.
///
/// Protocol-level outcomes (sector not found, wrong cylinder, end of track,
/// …) are *not* errors: they are reported through
/// [`TransferStatus`](crate::TransferStatus) so the controller can fold them
/// into its result bytes. An `ImdError` means the image itself or the medium
/// underneath it failed.
#[derive(Debug, Error)]
pub enum ImdError {
    #[error("i/o error: {0}")]
    Io(String),

    #[error("corrupt image: {0}")]
    CorruptImage(&'static str),

    #[error("unsupported: {0}")]
    Unsupported(&'static str),

    #[error("out of bounds access at offset {offset}+{len} (backend size {size})")]
    OutOfBounds { offset: u64, len: usize, size: u64 },

    #[error("image is read-only")]
    ReadOnly,

    #[error("no track at head {head} cylinder {cylinder}")]
    NoTrack { head: u8, cylinder: u8 },
}

impl From<std::io::Error> for ImdError {
    fn from(err: std::io::Error) -> Self {
        ImdError::Io(err.to_string())
    }
}
