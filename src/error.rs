//! Error taxonomy shared by the image builder, burn engine and mount manager
//!
//! Validation problems surface as `InvalidArgument`/`NotFound` before any
//! work starts. Native failures carry the failing operation and raw code so the
//! caller can report them, but the code itself never travels further than this
//! type.

use std::path::Path;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum DiscError {
    #[error("Invalid argument: {0}")]
    InvalidArgument(String),

    #[error("Not found: {0}")]
    NotFound(String),

    #[error("{operation} failed with 0x{code:X}. {message}")]
    Native {
        operation: String,
        code: u32,
        message: String,
    },

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Operation cancelled")]
    Cancelled,

    #[error("Not supported: {0}")]
    NotSupported(String),
}

pub type Result<T> = std::result::Result<T, DiscError>;

impl DiscError {
    /// Build a `Native` error from a raw result code, looking up the
    /// system message for it.
    pub fn native(operation: impl Into<String>, code: u32) -> Self {
        let message = if code <= i32::MAX as u32 {
            std::io::Error::from_raw_os_error(code as i32).to_string()
        } else {
            "Unknown error".to_string()
        };

        DiscError::Native {
            operation: operation.into(),
            code,
            message,
        }
    }

    /// Map an I/O error raised while touching `path`.
    ///
    /// A vanished file or directory becomes `NotFound`; everything else stays `Io`.
    pub fn from_io_at(err: std::io::Error, path: &Path) -> Self {
        if err.kind() == std::io::ErrorKind::NotFound {
            DiscError::NotFound(path.display().to_string())
        } else {
            DiscError::Io(err)
        }
    }

    pub fn is_cancelled(&self) -> bool {
        matches!(self, DiscError::Cancelled)
    }
}
