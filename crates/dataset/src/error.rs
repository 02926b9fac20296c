use std::path::{Path, PathBuf};

use thiserror::Error;

pub use compression::CompressionError;
pub use encryption::EncryptionError;

/// Read and write pipeline failures aggregating subsystem errors.
#[derive(Debug, Error)]
pub enum DatasetError {
    /// Key management, framing or integrity failure.
    #[error("Encryption failure: {source}")]
    Encryption {
        #[from]
        source: EncryptionError,
    },

    /// Codec failure while compressing or decompressing an object.
    #[error("Compression failure: {source}")]
    Compression {
        #[from]
        source: CompressionError,
    },

    #[error("IO error on {}: {source}", .path.display())]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    /// Bytes that do not decode in the selected format.
    #[error("Malformed {format} data: {message}")]
    Format {
        format: &'static str,
        message: String,
    },

    #[error("Invalid option {key}={value:?}: {reason}")]
    InvalidOption {
        key: String,
        value: String,
        reason: String,
    },

    /// Output already present and the save mode forbids touching it.
    #[error("Output path {} already exists", .path.display())]
    OutputExists { path: PathBuf },

    #[error("No input found at {}", .path.display())]
    NoInput { path: PathBuf },
}

impl DatasetError {
    pub fn io(path: impl AsRef<Path>, source: std::io::Error) -> Self {
        DatasetError::Io {
            path: path.as_ref().to_path_buf(),
            source,
        }
    }

    pub fn format(format: &'static str, message: impl Into<String>) -> Self {
        DatasetError::Format {
            format,
            message: message.into(),
        }
    }

    pub fn invalid_option(
        key: impl Into<String>,
        value: impl Into<String>,
        reason: impl Into<String>,
    ) -> Self {
        DatasetError::InvalidOption {
            key: key.into(),
            value: value.into(),
            reason: reason.into(),
        }
    }

    /// Attach `path` to a bare IO error raised by the encryption layer.
    pub(crate) fn with_path(err: EncryptionError, path: &Path) -> Self {
        match err {
            EncryptionError::Io(source) => DatasetError::io(path, source),
            other => other.into(),
        }
    }

    /// True when the requested partitioning needs a split the mode forbids.
    pub fn is_not_splittable(&self) -> bool {
        matches!(
            self,
            DatasetError::Encryption {
                source: EncryptionError::NotSplittable { .. }
            }
        )
    }

    /// True when stored bytes failed authentication or framing checks.
    pub fn is_integrity_failure(&self) -> bool {
        matches!(self, DatasetError::Encryption { source } if source.is_integrity_failure())
    }
}

pub type Result<T> = std::result::Result<T, DatasetError>;
