//! Error types for the proxy runtime.

use thiserror::Error;

/// Proxy error type.
#[derive(Debug, Error)]
pub enum ProxyError {
    /// CA certificate error.
    #[error("CA error: {0}")]
    Ca(#[from] CaManagerError),

    /// IO error.
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// Core pipeline error (codecs, charset, inventory).
    #[error(transparent)]
    Core(#[from] lyrebird_core::Error),

    /// Proxy server error.
    #[error("proxy error: {0}")]
    Proxy(String),

    /// Inventory watcher error.
    #[error("watcher error: {0}")]
    Watcher(String),
}

/// CA manager error type.
#[derive(Debug, Error)]
pub enum CaManagerError {
    /// Failed to generate the CA certificate.
    #[error("failed to generate CA: {0}")]
    Generation(String),

    /// Failed to read the CA certificate.
    #[error("failed to read CA: {0}")]
    Read(#[from] std::io::Error),

    /// Failed to parse the CA certificate.
    #[error("failed to parse CA: {0}")]
    Parse(String),

    /// Failed to write the CA certificate.
    #[error("failed to write CA: {0}")]
    Write(String),
}

/// Result type for proxy operations.
pub type Result<T> = std::result::Result<T, ProxyError>;
