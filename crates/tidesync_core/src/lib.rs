//! # TideSync Core
//!
//! Local persistence for the TideSync offline-first sync engine.
//!
//! This crate provides:
//! - Framed, checksummed journals with torn-tail recovery
//! - An entity store with primary keys and secondary indexes
//! - The pending-change log recording every accepted local mutation
//! - The merge engine collapsing an entity's pending entries into one action
//! - A persisted schema catalog and the [`Database`] facade tying them together
//!
//! ## Example
//!
//! ```rust,ignore
//! use tidesync_codec::record;
//! use tidesync_core::{ColumnDef, Database, TableSchema};
//!
//! let tasks = TableSchema::new("tasks")
//!     .column(ColumnDef::new("id").primary())
//!     .column(ColumnDef::new("done").default_value(false));
//!
//! let db = Database::open_in_memory(vec![tasks])?;
//! let outcome = db.write("tasks", record! { "id" => "t1" })?;
//! assert!(outcome.created);
//! ```

#![deny(unsafe_code)]
#![warn(missing_docs)]

mod catalog;
mod config;
mod database;
mod dir;
mod entity;
mod error;
mod journal;
mod pending;
mod schema;
mod types;

pub use catalog::{Catalog, SchemaChange, TableEntry};
pub use config::Config;
pub use database::{Backends, Database, JournalReport, VerifyReport, WriteOutcome};
pub use dir::DatabaseDir;
pub use entity::EntityStore;
pub use error::{CoreError, CoreResult};
pub use journal::{framed_len, Frame, Journal};
pub use pending::{merge, merge_entries, LogEntry, MergedAction, PendingAction, PendingLog};
pub use schema::{validate_schemas, ColumnDef, ColumnDefault, TableSchema};
pub use types::{EntityId, EntityKey, EntryId, MonotonicClock, Timestamp};

/// Crate version.
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
