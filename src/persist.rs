//! Atomic JSON persistence and cross-process locking.
//!
//! Every store in docflow writes the same way: serialize to a temp file in
//! the target directory, then rename over the live file. A reader never sees
//! a torn write; after a crash the last renamed file is complete truth.
//! Failed writes remove their temp file so retries start clean.
//!
//! Locking uses the `fs2` crate for cross-platform file locks (flock /
//! LockFileEx). The lock file is a sentinel next to the store file; the lock
//! is released when the guard drops.

use std::fs::{File, OpenOptions};
use std::io;
use std::path::{Path, PathBuf};

use fs2::FileExt;
use serde::de::DeserializeOwned;
use serde::Serialize;
use thiserror::Error;
use tracing::debug;

/// Errors from persistence and locking operations.
#[derive(Debug, Error)]
pub enum PersistError {
    #[error("I/O error on {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: io::Error,
    },

    #[error("Failed to serialize {path}: {source}")]
    Serialize {
        path: PathBuf,
        #[source]
        source: serde_json::Error,
    },

    #[error("Failed to parse {path}: {source}")]
    Parse {
        path: PathBuf,
        #[source]
        source: serde_json::Error,
    },

    #[error("Store is locked by another process: {0}")]
    Locked(PathBuf),

    #[error("Failed to acquire lock on {path}: {source}")]
    LockFailed {
        path: PathBuf,
        #[source]
        source: io::Error,
    },
}

fn io_err(path: &Path, source: io::Error) -> PersistError {
    PersistError::Io {
        path: path.to_path_buf(),
        source,
    }
}

/// Temp-file sibling for an atomic write (`store.json` → `store.json.tmp`).
fn temp_path(path: &Path) -> PathBuf {
    let mut name = path
        .file_name()
        .map(|n| n.to_os_string())
        .unwrap_or_default();
    name.push(".tmp");
    path.with_file_name(name)
}

/// Serialize `value` as pretty JSON and atomically replace `path`.
///
/// The write either fully lands (rename succeeded) or leaves the previous
/// file untouched; the temp file is removed on any failure.
pub fn atomic_write_json<T: Serialize>(path: &Path, value: &T) -> Result<(), PersistError> {
    if let Some(parent) = path.parent() {
        if !parent.as_os_str().is_empty() {
            std::fs::create_dir_all(parent).map_err(|e| io_err(parent, e))?;
        }
    }

    let payload = serde_json::to_vec_pretty(value).map_err(|e| PersistError::Serialize {
        path: path.to_path_buf(),
        source: e,
    })?;

    let tmp = temp_path(path);
    std::fs::write(&tmp, &payload).map_err(|e| io_err(&tmp, e))?;

    if let Err(e) = std::fs::rename(&tmp, path) {
        let _ = std::fs::remove_file(&tmp);
        return Err(io_err(path, e));
    }

    debug!(path = %path.display(), bytes = payload.len(), "persisted");
    Ok(())
}

/// Load and parse a JSON file. `Ok(None)` if the file does not exist.
pub fn load_json<T: DeserializeOwned>(path: &Path) -> Result<Option<T>, PersistError> {
    let content = match std::fs::read_to_string(path) {
        Ok(c) => c,
        Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(None),
        Err(e) => return Err(io_err(path, e)),
    };

    let value = serde_json::from_str(&content).map_err(|e| PersistError::Parse {
        path: path.to_path_buf(),
        source: e,
    })?;
    Ok(Some(value))
}

/// Rewrite a possibly non-finite float to `None`, which serializes as null.
/// Naive encoders would otherwise emit output unreadable by strict parsers.
pub fn finite_or_none(value: Option<f64>) -> Option<f64> {
    value.filter(|v| v.is_finite())
}

/// A guard holding an exclusive cross-process lock on a sentinel file.
///
/// The lock is released when the guard is dropped (fs2 unlocks on close).
pub struct StoreLock {
    _file: File,
    path: PathBuf,
}

impl StoreLock {
    /// Acquire the lock, blocking until it is available.
    pub fn acquire(path: &Path) -> Result<Self, PersistError> {
        let file = Self::open_sentinel(path)?;
        file.lock_exclusive().map_err(|e| PersistError::LockFailed {
            path: path.to_path_buf(),
            source: e,
        })?;
        debug!(path = %path.display(), "acquired store lock");
        Ok(Self {
            _file: file,
            path: path.to_path_buf(),
        })
    }

    /// Try to acquire the lock without blocking.
    pub fn try_acquire(path: &Path) -> Result<Self, PersistError> {
        let file = Self::open_sentinel(path)?;
        // Fully qualified: std::fs::File grows a conflicting try_lock_exclusive
        // on newer toolchains.
        match FileExt::try_lock_exclusive(&file) {
            Ok(()) => Ok(Self {
                _file: file,
                path: path.to_path_buf(),
            }),
            Err(e) if e.kind() == io::ErrorKind::WouldBlock => {
                Err(PersistError::Locked(path.to_path_buf()))
            }
            Err(e) => Err(PersistError::LockFailed {
                path: path.to_path_buf(),
                source: e,
            }),
        }
    }

    fn open_sentinel(path: &Path) -> Result<File, PersistError> {
        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent).map_err(|e| io_err(parent, e))?;
            }
        }
        OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(false)
            .open(path)
            .map_err(|e| io_err(path, e))
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl Drop for StoreLock {
    fn drop(&mut self) {
        debug!(path = %self.path.display(), "released store lock");
    }
}

impl std::fmt::Debug for StoreLock {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("StoreLock").field("path", &self.path).finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde::Deserialize;
    use tempfile::TempDir;

    #[derive(Debug, PartialEq, Serialize, Deserialize)]
    struct Sample {
        name: String,
        count: u64,
    }

    #[test]
    fn write_then_load_roundtrip() {
        let tmp = TempDir::new().unwrap();
        let path = tmp.path().join("nested/dir/sample.json");

        let sample = Sample {
            name: "alpha".into(),
            count: 3,
        };
        atomic_write_json(&path, &sample).unwrap();

        let loaded: Option<Sample> = load_json(&path).unwrap();
        assert_eq!(loaded, Some(sample));
        assert!(!temp_path(&path).exists(), "temp file must not survive");
    }

    #[test]
    fn load_missing_is_none() {
        let tmp = TempDir::new().unwrap();
        let loaded: Option<Sample> = load_json(&tmp.path().join("missing.json")).unwrap();
        assert_eq!(loaded, None);
    }

    #[test]
    fn overwrite_replaces_contents() {
        let tmp = TempDir::new().unwrap();
        let path = tmp.path().join("sample.json");

        atomic_write_json(
            &path,
            &Sample {
                name: "a".into(),
                count: 1,
            },
        )
        .unwrap();
        atomic_write_json(
            &path,
            &Sample {
                name: "b".into(),
                count: 2,
            },
        )
        .unwrap();

        let loaded: Sample = load_json(&path).unwrap().unwrap();
        assert_eq!(loaded.name, "b");
    }

    #[test]
    fn finite_or_none_rewrites_non_finite() {
        assert_eq!(finite_or_none(Some(1.5)), Some(1.5));
        assert_eq!(finite_or_none(Some(f64::NAN)), None);
        assert_eq!(finite_or_none(Some(f64::INFINITY)), None);
        assert_eq!(finite_or_none(None), None);
    }

    #[test]
    fn lock_contention() {
        let tmp = TempDir::new().unwrap();
        let path = tmp.path().join("store.lock");

        let guard = StoreLock::try_acquire(&path).unwrap();
        let second = StoreLock::try_acquire(&path);
        assert!(matches!(second, Err(PersistError::Locked(_))));

        drop(guard);
        let _third = StoreLock::try_acquire(&path).unwrap();
    }
}
