//! Error types for pfxfer core

use pfxfer_types::FileInfo;
use thiserror::Error;

/// Errors that can occur in pfxfer core
#[derive(Debug, Error)]
pub enum TransferError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Interrupted while waiting for bandwidth")]
    Interrupted,

    #[error("Download not found: {0}")]
    NotFound(FileInfo),

    #[error("Already downloading: {0}")]
    AlreadyDownloading(FileInfo),

    #[error("Invalid operation: {0}")]
    InvalidOperation(String),

    #[error("Serialization error: {0}")]
    Serialization(String),
}

impl TransferError {
    /// Check if this error is retryable
    pub fn is_retryable(&self) -> bool {
        matches!(self, TransferError::Io(_) | TransferError::Interrupted)
    }
}

// Limited streams implement std::io traits and must surface an interrupted
// bandwidth wait as an I/O failure. ErrorKind::Interrupted is not used since
// `write_all` silently retries on it.
impl From<TransferError> for std::io::Error {
    fn from(error: TransferError) -> Self {
        match error {
            TransferError::Io(e) => e,
            other => std::io::Error::new(std::io::ErrorKind::Other, other),
        }
    }
}

/// True if an I/O error was produced by an interrupted bandwidth wait
pub fn is_interrupted_io(error: &std::io::Error) -> bool {
    error
        .get_ref()
        .and_then(|inner| inner.downcast_ref::<TransferError>())
        .map(|e| matches!(e, TransferError::Interrupted))
        .unwrap_or(false)
}

impl From<serde_json::Error> for TransferError {
    fn from(error: serde_json::Error) -> Self {
        TransferError::Serialization(error.to_string())
    }
}
