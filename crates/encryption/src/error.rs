use thiserror::Error;

use crate::mode::CryptoMode;

/// Encryption-related errors
///
/// These errors are designed to be informative for debugging while
/// avoiding leaking sensitive information in production logs.
#[derive(Error, Debug)]
pub enum EncryptionError {
    /// Key management errors
    #[error("Key generation failed: {0}")]
    KeyGeneration(String),

    #[error("Data key unwrap failed: {0}")]
    Unwrap(String),

    #[error("Invalid key length: expected {expected}, got {actual}")]
    InvalidKeyLength { expected: usize, actual: usize },

    #[error("Key file {} already exists; refusing to replace it", path.display())]
    KeyFileExists { path: std::path::PathBuf },

    /// Cipher mode errors
    #[error("Unsupported crypto mode: {0}")]
    UnsupportedMode(String),

    #[error(
        "Crypto mode {mode} is not splittable: range [{start}, {end}) does not cover the whole object of {object_len} bytes"
    )]
    NotSplittable {
        mode: CryptoMode,
        start: u64,
        end: u64,
        object_len: u64,
    },

    /// Integrity errors
    #[error("Integrity verification failed for block {block_index}")]
    Integrity { block_index: u64 },

    /// Framing errors (malformed record header, truncated stream)
    #[error("Malformed encrypted stream at offset {offset}: {reason}")]
    Framing { offset: u64, reason: String },

    /// Configuration errors
    #[error("Invalid configuration: {0}")]
    InvalidConfiguration(String),

    /// Serialization errors
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

impl EncryptionError {
    pub fn framing(offset: u64, reason: impl Into<String>) -> Self {
        EncryptionError::Framing {
            offset,
            reason: reason.into(),
        }
    }

    pub fn key_generation(reason: impl Into<String>) -> Self {
        EncryptionError::KeyGeneration(reason.into())
    }

    pub fn unwrap_failed(reason: impl Into<String>) -> Self {
        EncryptionError::Unwrap(reason.into())
    }

    /// True for failures that mean the stored bytes cannot be trusted.
    pub fn is_integrity_failure(&self) -> bool {
        matches!(
            self,
            EncryptionError::Integrity { .. } | EncryptionError::Framing { .. }
        )
    }
}

/// Result type alias for encryption operations
pub type Result<T> = std::result::Result<T, EncryptionError>;
