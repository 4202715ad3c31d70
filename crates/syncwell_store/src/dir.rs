//! Store directory layout and locking.
//!
//! ```text
//! <store_path>/
//! ├─ LOCK              # advisory lock, one process at a time
//! ├─ operations.log    # live operations
//! ├─ archive.log       # ids of completed operations whose body was dropped
//! ├─ conflicts.log     # conflicts
//! └─ errors.log        # captured errors
//! ```

use crate::error::{StoreError, StoreResult};
use fs2::FileExt;
use std::fs::{self, File, OpenOptions};
use std::path::{Path, PathBuf};

const LOCK_FILE: &str = "LOCK";
const OPERATIONS_FILE: &str = "operations.log";
const ARCHIVE_FILE: &str = "archive.log";
const CONFLICTS_FILE: &str = "conflicts.log";
const ERRORS_FILE: &str = "errors.log";

/// An opened store directory holding the exclusive lock.
///
/// The lock is released when this value is dropped.
#[derive(Debug)]
pub struct StoreDir {
    path: PathBuf,
    _lock_file: File,
}

impl StoreDir {
    /// Opens or creates a store directory and takes its lock.
    ///
    /// Fails with [`StoreError::Locked`] if another handle holds it.
    pub fn open(path: &Path, create_if_missing: bool) -> StoreResult<Self> {
        if !path.exists() {
            if create_if_missing {
                fs::create_dir_all(path)?;
            } else {
                return Err(StoreError::InvalidArgument(format!(
                    "store directory does not exist: {}",
                    path.display()
                )));
            }
        }
        if !path.is_dir() {
            return Err(StoreError::InvalidArgument(format!(
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
            return Err(StoreError::Locked);
        }

        Ok(Self {
            path: path.to_path_buf(),
            _lock_file: lock_file,
        })
    }

    /// Returns the directory path.
    #[must_use]
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Path of the operations log.
    #[must_use]
    pub fn operations_path(&self) -> PathBuf {
        self.path.join(OPERATIONS_FILE)
    }

    /// Path of the archive log.
    #[must_use]
    pub fn archive_path(&self) -> PathBuf {
        self.path.join(ARCHIVE_FILE)
    }

    /// Path of the conflicts log.
    #[must_use]
    pub fn conflicts_path(&self) -> PathBuf {
        self.path.join(CONFLICTS_FILE)
    }

    /// Path of the errors log.
    #[must_use]
    pub fn errors_path(&self) -> PathBuf {
        self.path.join(ERRORS_FILE)
    }
}
