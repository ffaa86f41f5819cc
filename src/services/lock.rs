//! Advisory per-dataset lock files.
//!
//! Only guards against two uploads of the same dataset on one host. The
//! marker is removed when the [`LockGuard`] is dropped, so every return path,
//! error and cancelled future releases it.

use chrono::Utc;
use std::fs::OpenOptions;
use std::io::Write;
use std::path::{Path, PathBuf};
use std::time::{Duration, SystemTime};

use crate::error::{ArchiveError, Result};
use crate::utils::validation::sanitize_marker_name;

const MARKER_EXTENSION: &str = "lock";

#[derive(Debug, Clone)]
pub struct LockManager {
    dir: PathBuf,
}

/// Holds a dataset lock until dropped
#[derive(Debug)]
pub struct LockGuard {
    path: PathBuf,
    released: bool,
}

impl LockManager {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }

    pub fn marker_path(&self, dataset_key: &str) -> PathBuf {
        self.dir.join(format!(
            "{}.{}",
            sanitize_marker_name(dataset_key),
            MARKER_EXTENSION
        ))
    }

    /// Creates the marker for `dataset_key`, failing with `Locked` if another
    /// run already holds it.
    pub fn acquire(&self, dataset_key: &str) -> Result<LockGuard> {
        std::fs::create_dir_all(&self.dir).map_err(|e| ArchiveError::io(&self.dir, e))?;
        let path = self.marker_path(dataset_key);

        let mut file = match OpenOptions::new().write(true).create_new(true).open(&path) {
            Ok(file) => file,
            Err(e) if e.kind() == std::io::ErrorKind::AlreadyExists => {
                return Err(ArchiveError::Locked(path));
            }
            Err(e) => return Err(ArchiveError::io(path, e)),
        };

        let guard = LockGuard {
            path,
            released: false,
        };
        writeln!(
            file,
            "pid={} dataset={} locked_at={}",
            std::process::id(),
            dataset_key,
            Utc::now().to_rfc3339()
        )
        .map_err(|e| ArchiveError::io(&guard.path, e))?;

        tracing::debug!("🔒 Locked {}", guard.path.display());
        Ok(guard)
    }

    pub fn is_locked(&self, dataset_key: &str) -> bool {
        self.marker_path(dataset_key).exists()
    }

    /// Deletes markers older than `max_age`, returning how many were removed.
    ///
    /// For operators cleaning up after a host crash; a live run's marker is
    /// never older than the run itself.
    pub fn remove_stale(&self, max_age: Duration) -> Result<usize> {
        let entries = match std::fs::read_dir(&self.dir) {
            Ok(entries) => entries,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(0),
            Err(e) => return Err(ArchiveError::io(&self.dir, e)),
        };

        let now = SystemTime::now();
        let mut removed = 0;
        for entry in entries {
            let entry = entry.map_err(|e| ArchiveError::io(&self.dir, e))?;
            let path = entry.path();
            if path.extension().and_then(|e| e.to_str()) != Some(MARKER_EXTENSION) {
                continue;
            }
            let age = entry
                .metadata()
                .and_then(|m| m.modified())
                .ok()
                .and_then(|modified| now.duration_since(modified).ok())
                .unwrap_or_default();
            if age >= max_age {
                std::fs::remove_file(&path).map_err(|e| ArchiveError::io(&path, e))?;
                tracing::warn!("Removed stale lock {}", path.display());
                removed += 1;
            }
        }
        Ok(removed)
    }
}

impl LockGuard {
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Releases now, reporting a failure to delete the marker
    pub fn release(mut self) -> Result<()> {
        self.released = true;
        remove_marker(&self.path)
    }
}

impl Drop for LockGuard {
    fn drop(&mut self) {
        if self.released {
            return;
        }
        if let Err(e) = remove_marker(&self.path) {
            tracing::error!("Failed to release lock: {}", e);
        }
    }
}

fn remove_marker(path: &Path) -> Result<()> {
    match std::fs::remove_file(path) {
        Ok(()) => {
            tracing::debug!("🔓 Released {}", path.display());
            Ok(())
        }
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
        Err(e) => Err(ArchiveError::io(path, e)),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_acquire_and_drop() {
        let dir = TempDir::new().unwrap();
        let locks = LockManager::new(dir.path());

        {
            let guard = locks.acquire("QC_Shew_1_42").unwrap();
            assert!(guard.path().exists());
            assert!(locks.is_locked("QC_Shew_1_42"));
        }
        assert!(!locks.is_locked("QC_Shew_1_42"));
    }

    #[test]
    fn test_second_acquire_fails_while_held() {
        let dir = TempDir::new().unwrap();
        let locks = LockManager::new(dir.path());

        let guard = locks.acquire("ds_1").unwrap();
        assert!(matches!(locks.acquire("ds_1"), Err(ArchiveError::Locked(_))));
        assert!(locks.acquire("ds_2").is_ok());

        guard.release().unwrap();
        assert!(locks.acquire("ds_1").is_ok());
    }

    #[test]
    fn test_released_on_error_path() {
        fn failing_step(locks: &LockManager) -> Result<()> {
            let _guard = locks.acquire("ds_err")?;
            Err(ArchiveError::SubmissionRejected("boom".to_string()))
        }

        let dir = TempDir::new().unwrap();
        let locks = LockManager::new(dir.path());
        assert!(failing_step(&locks).is_err());
        assert!(!locks.is_locked("ds_err"));
    }

    #[test]
    fn test_marker_name_is_sanitized() {
        let locks = LockManager::new("/tmp/locks");
        assert_eq!(
            locks.marker_path("a/b c"),
            PathBuf::from("/tmp/locks/a_b_c.lock")
        );
    }

    #[test]
    fn test_remove_stale() {
        let dir = TempDir::new().unwrap();
        let locks = LockManager::new(dir.path());
        let guard = locks.acquire("old").unwrap();
        std::fs::write(dir.path().join("notes.txt"), "keep").unwrap();

        assert_eq!(locks.remove_stale(Duration::from_secs(3600)).unwrap(), 0);
        assert_eq!(locks.remove_stale(Duration::ZERO).unwrap(), 1);
        assert!(!guard.path().exists());
        assert!(dir.path().join("notes.txt").exists());
    }
}
