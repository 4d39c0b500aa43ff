//! Error types for TideSync core.

use std::io;
use thiserror::Error;

/// Result type for core operations.
pub type CoreResult<T> = Result<T, CoreError>;

/// Errors that can occur in TideSync core operations.
#[derive(Debug, Error)]
pub enum CoreError {
    /// Storage backend error.
    #[error("storage error: {0}")]
    Storage(#[from] tidesync_storage::StorageError),

    /// CBOR codec error.
    #[error("codec error: {0}")]
    Codec(#[from] tidesync_codec::CodecError),

    /// I/O error.
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),

    /// A journal is corrupted or has an unknown layout.
    #[error("journal corruption: {message}")]
    JournalCorruption {
        /// Description of the corruption.
        message: String,
    },

    /// A journal frame failed its checksum.
    #[error("checksum mismatch at offset {offset}: expected {expected:08x}, got {actual:08x}")]
    ChecksumMismatch {
        /// Offset of the frame in the journal.
        offset: u64,
        /// Checksum stored in the frame.
        expected: u32,
        /// Checksum computed over the frame.
        actual: u32,
    },

    /// The declared schema cannot be applied to the persisted data.
    #[error("schema mismatch on table {table}: {message}")]
    SchemaMismatch {
        /// Table whose declaration conflicts.
        table: String,
        /// Description of the conflict.
        message: String,
    },

    /// A declared schema is malformed.
    #[error("invalid schema: {message}")]
    InvalidSchema {
        /// Description of the problem.
        message: String,
    },

    /// Table not found.
    #[error("unknown table: {name}")]
    UnknownTable {
        /// Name of the table.
        name: String,
    },

    /// A record has no usable primary key.
    #[error("invalid primary key for table {table}: {message}")]
    InvalidPrimaryKey {
        /// Table the record was written to.
        table: String,
        /// Description of the problem.
        message: String,
    },

    /// Database is already open or locked.
    #[error("database locked: another process has exclusive access")]
    DatabaseLocked,

    /// A log append failed and the store write before it could not be
    /// undone. The store holds a change the pending log does not know about.
    #[error("unlogged write to {table}/{id}: {message}")]
    UnloggedWrite {
        /// Table of the record.
        table: String,
        /// Primary key of the record.
        id: String,
        /// Both failures.
        message: String,
    },

    /// Invalid argument provided.
    #[error("invalid argument: {message}")]
    InvalidArgument {
        /// Description of the invalid argument.
        message: String,
    },
}

impl CoreError {
    /// Creates a journal corruption error.
    pub fn journal_corruption(message: impl Into<String>) -> Self {
        Self::JournalCorruption {
            message: message.into(),
        }
    }

    /// Creates a schema mismatch error.
    pub fn schema_mismatch(table: impl Into<String>, message: impl Into<String>) -> Self {
        Self::SchemaMismatch {
            table: table.into(),
            message: message.into(),
        }
    }

    /// Creates an invalid schema error.
    pub fn invalid_schema(message: impl Into<String>) -> Self {
        Self::InvalidSchema {
            message: message.into(),
        }
    }

    /// Creates an unknown table error.
    pub fn unknown_table(name: impl Into<String>) -> Self {
        Self::UnknownTable { name: name.into() }
    }

    /// Creates an invalid primary key error.
    pub fn invalid_primary_key(table: impl Into<String>, message: impl Into<String>) -> Self {
        Self::InvalidPrimaryKey {
            table: table.into(),
            message: message.into(),
        }
    }

    /// Creates an invalid argument error.
    pub fn invalid_argument(message: impl Into<String>) -> Self {
        Self::InvalidArgument {
            message: message.into(),
        }
    }

    /// Returns true if the error originates in the storage layer.
    pub fn is_storage(&self) -> bool {
        matches!(
            self,
            Self::Storage(_) | Self::Io(_) | Self::UnloggedWrite { .. }
        )
    }

    /// Returns true if persisted data failed validation on load.
    pub fn is_corruption(&self) -> bool {
        matches!(
            self,
            Self::JournalCorruption { .. } | Self::ChecksumMismatch { .. }
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tidesync_storage::StorageError;

    #[test]
    fn error_display() {
        let err = CoreError::ChecksumMismatch {
            offset: 64,
            expected: 0x1234_5678,
            actual: 0xDEAD_BEEF,
        };
        assert_eq!(
            err.to_string(),
            "checksum mismatch at offset 64: expected 12345678, got deadbeef"
        );

        let err = CoreError::schema_mismatch("tasks", "primary column changed");
        assert_eq!(
            err.to_string(),
            "schema mismatch on table tasks: primary column changed"
        );
    }

    #[test]
    fn classification() {
        assert!(CoreError::from(StorageError::Unavailable).is_storage());
        assert!(CoreError::journal_corruption("bad magic").is_corruption());
        assert!(!CoreError::unknown_table("notes").is_storage());
    }
}
