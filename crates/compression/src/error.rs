use thiserror::Error;

/// Failures while compressing or decompressing one object.
#[derive(Debug, Error)]
pub enum CompressionError {
    /// The codec name or level could not be parsed.
    #[error("Invalid compression codec: {reason}")]
    InvalidCodec { reason: String },

    /// Reading or writing the codec stream failed.
    #[error("{algorithm} stream I/O failed: {source}")]
    Io {
        algorithm: &'static str,
        #[source]
        source: std::io::Error,
    },

    /// The codec rejected its input, e.g. a corrupt frame.
    #[error("{algorithm} codec error: {message}")]
    Codec {
        algorithm: &'static str,
        message: String,
    },

    /// Decompressing freshly compressed output did not reproduce the input.
    #[error("{algorithm} round trip did not reproduce the input")]
    IntegrityFailure { algorithm: &'static str },
}

impl CompressionError {
    pub fn invalid_codec(reason: impl Into<String>) -> Self {
        CompressionError::InvalidCodec {
            reason: reason.into(),
        }
    }

    pub fn codec(algorithm: &'static str, message: impl Into<String>) -> Self {
        CompressionError::Codec {
            algorithm,
            message: message.into(),
        }
    }

    pub fn integrity(algorithm: &'static str) -> Self {
        CompressionError::IntegrityFailure { algorithm }
    }

    pub fn io(algorithm: &'static str, source: std::io::Error) -> Self {
        CompressionError::Io { algorithm, source }
    }
}
