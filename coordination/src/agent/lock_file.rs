//! Per-target mutual exclusion (spec §4.10).
//!
//! The on-target agent guards each container against concurrent
//! activation/deactivation with a plain exclusive-create lock file rather
//! than flock: it must survive being inspected (or cleaned up) by an
//! operator between agent invocations, same as the original `disnix-lock`.

use std::io::ErrorKind;
use std::path::{Path, PathBuf};

use thiserror::Error;

#[derive(Debug, Error)]
pub enum LockFileError {
    #[error("lock already held at {0}")]
    AlreadyLocked(PathBuf),

    #[error("I/O error accessing lock file {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
}

/// A held lock file, released (best-effort) on drop.
pub struct LockFileGuard {
    path: PathBuf,
}

impl LockFileGuard {
    /// Acquire the lock at `path`, failing immediately if it's already held.
    pub fn acquire(path: impl Into<PathBuf>) -> Result<Self, LockFileError> {
        let path = path.into();
        match std::fs::OpenOptions::new().write(true).create_new(true).open(&path) {
            Ok(_) => Ok(Self { path }),
            Err(err) if err.kind() == ErrorKind::AlreadyExists => Err(LockFileError::AlreadyLocked(path)),
            Err(source) => Err(LockFileError::Io { path, source }),
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl Drop for LockFileGuard {
    fn drop(&mut self) {
        if let Err(err) = std::fs::remove_file(&self.path) {
            if err.kind() != ErrorKind::NotFound {
                tracing::warn!(path = %self.path.display(), error = %err, "failed to remove lock file");
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn second_acquire_fails_while_first_is_held() {
        let dir = tempfile::tempdir().unwrap();
        let lock_path = dir.path().join("container.lock");
        let first = LockFileGuard::acquire(&lock_path).unwrap();
        let second = LockFileGuard::acquire(&lock_path);
        assert!(matches!(second, Err(LockFileError::AlreadyLocked(_))));
        drop(first);
        assert!(LockFileGuard::acquire(&lock_path).is_ok());
    }

    #[test]
    fn drop_removes_the_lock_file() {
        let dir = tempfile::tempdir().unwrap();
        let lock_path = dir.path().join("container.lock");
        {
            let _guard = LockFileGuard::acquire(&lock_path).unwrap();
            assert!(lock_path.exists());
        }
        assert!(!lock_path.exists());
    }
}
