//! # TideSync Storage
//!
//! Storage backend trait and implementations for TideSync.
//!
//! Backends are **opaque byte stores**: they know nothing about journal
//! frames, entity records or the pending-change log. The core crate owns
//! every format decision and only asks a backend to read, append, flush and,
//! for compaction, atomically swap its whole content.
//!
//! ## Available Backends
//!
//! - [`InMemoryBackend`] - For tests and ephemeral engines
//! - [`FileBackend`] - For persistent storage using OS file APIs
//!
//! ## Example
//!
//! ```rust
//! use tidesync_storage::{StorageBackend, InMemoryBackend};
//!
//! let mut backend = InMemoryBackend::new();
//! let offset = backend.append(b"pending").unwrap();
//! assert_eq!(backend.read_at(offset, 7).unwrap(), b"pending");
//!
//! backend.replace(b"compacted").unwrap();
//! assert_eq!(backend.size().unwrap(), 9);
//! ```

#![deny(unsafe_code)]
#![warn(missing_docs)]

mod backend;
mod error;
mod file;
mod memory;

pub use backend::StorageBackend;
pub use error::{StorageError, StorageResult};
pub use file::FileBackend;
pub use memory::InMemoryBackend;
