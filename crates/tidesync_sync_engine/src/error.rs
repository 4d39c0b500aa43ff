//! Error types for the sync engine.

use thiserror::Error;
use tidesync_core::CoreError;

/// Result type for sync operations.
pub type SyncResult<T> = Result<T, SyncError>;

/// Errors that can occur during sync operations.
#[derive(Error, Debug)]
pub enum SyncError {
    /// Local database error (storage, schema, corruption).
    #[error("database error: {0}")]
    Core(#[from] CoreError),

    /// A remote call failed.
    #[error("dispatch failed: {message}")]
    Dispatch {
        /// Error message.
        message: String,
        /// Whether the call can be retried.
        retryable: bool,
    },

    /// No remote capability is registered for the table.
    #[error("no remote registered for table {table}")]
    RemoteNotRegistered {
        /// Table name.
        table: String,
    },

    /// The engine has been shut down.
    #[error("sync engine stopped")]
    EngineStopped,
}

impl SyncError {
    /// Returns true if the error comes from local storage.
    pub fn is_storage(&self) -> bool {
        matches!(self, SyncError::Core(e) if e.is_storage())
    }

    /// Returns true if a declared schema conflicts with persisted data.
    pub fn is_schema_mismatch(&self) -> bool {
        matches!(self, SyncError::Core(CoreError::SchemaMismatch { .. }))
    }

    /// Returns true if this error can be retried.
    pub fn is_retryable(&self) -> bool {
        match self {
            SyncError::Dispatch { retryable, .. } => *retryable,
            _ => false,
        }
    }
}

/// Errors returned by remote table capabilities.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum RemoteError {
    /// The remote could not be reached.
    #[error("remote unavailable: {0}")]
    Unavailable(String),

    /// The remote refused the change.
    #[error("remote rejected change: {0}")]
    Rejected(String),
}

impl RemoteError {
    /// Returns true if the same call may succeed later.
    pub fn is_retryable(&self) -> bool {
        matches!(self, RemoteError::Unavailable(_))
    }
}

impl From<RemoteError> for SyncError {
    fn from(e: RemoteError) -> Self {
        SyncError::Dispatch {
            retryable: e.is_retryable(),
            message: e.to_string(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tidesync_storage::StorageError;

    #[test]
    fn classification() {
        let storage = SyncError::from(CoreError::from(StorageError::Unavailable));
        assert!(storage.is_storage());
        assert!(!storage.is_schema_mismatch());

        let mismatch = SyncError::from(CoreError::schema_mismatch("tasks", "primary changed"));
        assert!(mismatch.is_schema_mismatch());
        assert!(!mismatch.is_storage());

        assert!(!SyncError::EngineStopped.is_retryable());
    }

    #[test]
    fn remote_errors_become_dispatch_errors() {
        let err = SyncError::from(RemoteError::Unavailable("timeout".into()));
        assert!(err.is_retryable());
        assert!(err.to_string().contains("timeout"));

        let err = SyncError::from(RemoteError::Rejected("conflict".into()));
        assert!(!err.is_retryable());
    }
}
