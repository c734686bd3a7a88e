//! Error taxonomy shared across the workspace.

use thiserror::Error;

/// Core error type.
///
/// The variants map onto recovery policies rather than call sites: a
/// `PathCodec` error drops the transaction with a warning, an `Encoding`
/// error falls back to raw bytes during recording, a `Format` error skips
/// the optimization, and so on.
#[derive(Debug, Error)]
pub enum Error {
    /// The URL <-> path mapping could not be computed or inverted.
    #[error("path codec error: {0}")]
    PathCodec(String),

    /// A content or charset codec failed; carries the codec tag.
    #[error("{tag} encoding error: {message}")]
    Encoding { tag: String, message: String },

    /// Minify/beautify failure.
    #[error("format error: {0}")]
    Format(String),

    /// Disk I/O failure.
    #[error("filesystem error: {0}")]
    Filesystem(#[from] std::io::Error),

    /// Upstream transport failure.
    #[error("network error: {0}")]
    Network(String),

    /// Bad configuration or CLI input.
    #[error("validation error: {0}")]
    Validation(String),
}

impl Error {
    /// Builds an [`Error::Encoding`] for the given codec tag.
    pub fn encoding(tag: impl Into<String>, message: impl Into<String>) -> Self {
        Error::Encoding {
            tag: tag.into(),
            message: message.into(),
        }
    }
}

/// Result type for core operations.
pub type Result<T> = std::result::Result<T, Error>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn encoding_error_carries_tag() {
        let err = Error::encoding("gzip", "bad magic");
        assert_eq!(err.to_string(), "gzip encoding error: bad magic");
    }

    #[test]
    fn filesystem_error_wraps_io() {
        let io = std::io::Error::new(std::io::ErrorKind::NotFound, "missing");
        let err: Error = io.into();
        assert!(matches!(err, Error::Filesystem(_)));
    }
}
