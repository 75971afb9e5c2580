// SPDX-License-Identifier: MIT OR Apache-2.0
use std::fs::{File, OpenOptions};
use std::io::Write;
use std::path::{Path, PathBuf};

use fs4::fs_std::FileExt;
use thiserror::Error;
use tracing::info;

/// Errors raised while acquiring the single-instance lock.
#[derive(Debug, Error)]
pub enum LockError {
    /// Another instance already holds the lock.
    #[error("another instance is already running (lock held at {0})")]
    AlreadyRunning(PathBuf),
    /// The lock file could not be opened or written.
    #[error("failed to open lock file {path}: {source}")]
    Io {
        /// Path of the lock file.
        path: PathBuf,
        /// Underlying I/O error.
        #[source]
        source: std::io::Error,
    },
}

/// Holds an advisory exclusive lock on a file for the lifetime of the
/// process, releasing it (and removing the file) on drop.
///
/// Invariant: at most one [`InstanceLock`] is ever held on the same path
/// across processes; a contended [`InstanceLock::acquire`] fails fast
/// rather than blocking, matching the orchestrator's abort-on-contention
/// startup step.
pub struct InstanceLock {
    file: File,
    path: PathBuf,
}

impl InstanceLock {
    /// Acquire the single-instance lock at `path`, creating the file and
    /// its parent directory if needed. Fails immediately if another
    /// process already holds it.
    pub fn acquire(path: &Path) -> Result<Self, LockError> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent).map_err(|source| LockError::Io {
                path: path.to_path_buf(),
                source,
            })?;
        }

        let mut file = OpenOptions::new()
            .create(true)
            .truncate(false)
            .read(true)
            .write(true)
            .open(path)
            .map_err(|source| LockError::Io {
                path: path.to_path_buf(),
                source,
            })?;

        if file.try_lock_exclusive().is_err() {
            return Err(LockError::AlreadyRunning(path.to_path_buf()));
        }

        file.set_len(0).ok();
        let _ = write!(file, "{}", std::process::id());
        info!(path = %path.display(), "acquired single-instance lock");

        Ok(Self { file, path: path.to_path_buf() })
    }
}

impl Drop for InstanceLock {
    fn drop(&mut self) {
        let _ = FileExt::unlock(&self.file);
        let _ = std::fs::remove_file(&self.path);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn acquires_and_releases_lock() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join(".lock");
        {
            let _lock = InstanceLock::acquire(&path).unwrap();
            assert!(path.exists());
        }
        assert!(!path.exists());
    }

    #[test]
    fn second_acquire_on_same_path_fails() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join(".lock");
        let _first = InstanceLock::acquire(&path).unwrap();
        let second = InstanceLock::acquire(&path);
        assert!(matches!(second, Err(LockError::AlreadyRunning(_))));
    }
}
