//! Error types for storage operations.

use std::io;
use thiserror::Error;

/// Result type for storage operations.
pub type StorageResult<T> = Result<T, StorageError>;

/// Errors that can occur during storage operations.
#[derive(Debug, Error)]
pub enum StorageError {
    /// An I/O error occurred.
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),

    /// Attempted to read beyond the end of storage.
    #[error("read beyond end of storage: offset {offset}, len {len}, size {size}")]
    ReadPastEnd {
        /// The requested read offset.
        offset: u64,
        /// The requested read length.
        len: usize,
        /// The current storage size.
        size: u64,
    },

    /// The stored bytes cannot be interpreted.
    #[error("storage corrupted: {0}")]
    Corrupted(String),

    /// The backend refuses writes.
    #[error("storage is unavailable for writing")]
    Unavailable,
}

impl StorageError {
    /// Returns true if the error came from the device rather than from the
    /// caller asking for a bad range.
    pub fn is_device_error(&self) -> bool {
        matches!(self, StorageError::Io(_) | StorageError::Unavailable)
    }
}
