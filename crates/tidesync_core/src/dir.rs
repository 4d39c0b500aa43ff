//! Database directory management.
//!
//! ```text
//! <db_path>/
//! ├─ LOCK          # Advisory lock for single-owner access
//! ├─ CATALOG       # Table and index catalog
//! ├─ store.log     # Entity store journal
//! └─ pending.log   # Pending-change log journal
//! ```

use crate::error::{CoreError, CoreResult};
use fs2::FileExt;
use std::fs::{self, File, OpenOptions};
use std::path::{Path, PathBuf};

const LOCK_FILE: &str = "LOCK";
const CATALOG_FILE: &str = "CATALOG";
const STORE_FILE: &str = "store.log";
const LOG_FILE: &str = "pending.log";

/// Holds the database directory and its exclusive lock.
///
/// Only one `DatabaseDir` can exist per directory at a time; the lock is
/// released when it is dropped.
#[derive(Debug)]
pub struct DatabaseDir {
    path: PathBuf,
    _lock_file: File,
}

impl DatabaseDir {
    /// Opens or creates a database directory and takes its lock.
    ///
    /// # Errors
    ///
    /// Returns an error if:
    /// - The directory doesn't exist and `create_if_missing` is false
    /// - Another owner holds the lock (returns `DatabaseLocked`)
    /// - I/O errors occur
    pub fn open(path: &Path, create_if_missing: bool) -> CoreResult<Self> {
        if !path.exists() {
            if create_if_missing {
                fs::create_dir_all(path)?;
            } else {
                return Err(CoreError::invalid_argument(format!(
                    "database directory does not exist: {}",
                    path.display()
                )));
            }
        }

        if !path.is_dir() {
            return Err(CoreError::invalid_argument(format!(
                "path is not a directory: {}",
                path.display()
            )));
        }

        let lock_file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(false)
            .open(path.join(LOCK_FILE))?;

        if lock_file.try_lock_exclusive().is_err() {
            return Err(CoreError::DatabaseLocked);
        }

        Ok(Self {
            path: path.to_path_buf(),
            _lock_file: lock_file,
        })
    }

    /// Returns the path to the database directory.
    #[must_use]
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Returns the path to the catalog file.
    #[must_use]
    pub fn catalog_path(&self) -> PathBuf {
        catalog_path(&self.path)
    }

    /// Returns the path to the entity store journal.
    #[must_use]
    pub fn store_path(&self) -> PathBuf {
        store_path(&self.path)
    }

    /// Returns the path to the pending-change log journal.
    #[must_use]
    pub fn log_path(&self) -> PathBuf {
        log_path(&self.path)
    }
}

pub(crate) fn catalog_path(root: &Path) -> PathBuf {
    root.join(CATALOG_FILE)
}

pub(crate) fn store_path(root: &Path) -> PathBuf {
    root.join(STORE_FILE)
}

pub(crate) fn log_path(root: &Path) -> PathBuf {
    root.join(LOG_FILE)
}
