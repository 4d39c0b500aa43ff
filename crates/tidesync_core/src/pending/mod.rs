//! Pending-change log and merge engine.

mod action;
mod log;
mod merge;

pub use action::{LogEntry, PendingAction};
pub(crate) use log::LOG_MAGIC;
pub use log::PendingLog;
pub use merge::{merge, merge_entries, MergedAction};
