//! Cross-process exclusion for one output directory.
//!
//! The lock is a marker file created with `create_new`, so two processes
//! racing for it cannot both succeed. Dropping the guard removes the file.
//! A process killed without unwinding leaves the marker behind; it must then
//! be removed by hand (`chexray unlock <output_dir>`).

use crate::error::{TrainingError, TrainingResult};
use std::fs::{File, OpenOptions};
use std::io::Write;
use std::path::{Path, PathBuf};

#[derive(Debug)]
pub struct TrainingLock {
    path: PathBuf,
    held: bool,
}

impl TrainingLock {
    pub fn acquire(path: &Path) -> TrainingResult<Self> {
        Self::acquire_with(path, |file| {
            writeln!(file, "pid={}", std::process::id())?;
            writeln!(file, "acquired_at={}", chrono::Utc::now().to_rfc3339())
        })
    }

    /// Create the marker, then fill it with `describe`.
    ///
    /// The guard exists before the marker is written, so a failed write
    /// removes the marker again.
    fn acquire_with(path: &Path, describe: impl FnOnce(&mut File) -> std::io::Result<()>) -> TrainingResult<Self> {
        let mut file = match OpenOptions::new().write(true).create_new(true).open(path) {
            Ok(file) => file,
            Err(err) if err.kind() == std::io::ErrorKind::AlreadyExists => {
                return Err(TrainingError::LockConflict { path: path.to_path_buf() });
            }
            Err(err) => return Err(err.into()),
        };
        let lock = Self { path: path.to_path_buf(), held: true };
        let written = describe(&mut file);
        drop(file);
        written?;
        tracing::debug!("acquired {}", path.display());
        Ok(lock)
    }

    #[must_use]
    pub fn path(&self) -> &Path {
        &self.path
    }

    #[must_use]
    pub fn is_held(&self) -> bool {
        self.held
    }

    /// Remove the marker. Calling it again is a no-op.
    pub fn release(&mut self) -> TrainingResult<()> {
        if !self.held {
            return Ok(());
        }
        self.held = false;
        match std::fs::remove_file(&self.path) {
            Ok(()) => {
                tracing::debug!("released {}", self.path.display());
                Ok(())
            }
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(err) => Err(err.into()),
        }
    }

    /// Remove a marker left behind by a process that did not exit cleanly.
    ///
    /// Returns whether a marker existed.
    pub fn force_remove(path: &Path) -> TrainingResult<bool> {
        match std::fs::remove_file(path) {
            Ok(()) => Ok(true),
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => Ok(false),
            Err(err) => Err(err.into()),
        }
    }
}

impl Drop for TrainingLock {
    fn drop(&mut self) {
        if let Err(err) = self.release() {
            tracing::warn!("failed to release {}: {err}", self.path.display());
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_second_acquire_conflicts() {
        let temp = TempDir::new().unwrap();
        let path = temp.path().join(".training.lock");

        let _held = TrainingLock::acquire(&path).unwrap();
        let err = TrainingLock::acquire(&path).unwrap_err();
        assert!(matches!(err, TrainingError::LockConflict { .. }));
    }

    #[test]
    fn test_acquire_succeeds_after_release() {
        let temp = TempDir::new().unwrap();
        let path = temp.path().join(".training.lock");

        let mut lock = TrainingLock::acquire(&path).unwrap();
        lock.release().unwrap();
        lock.release().unwrap();
        assert!(!path.exists());

        let _again = TrainingLock::acquire(&path).unwrap();
    }

    #[test]
    fn test_drop_releases() {
        let temp = TempDir::new().unwrap();
        let path = temp.path().join(".training.lock");
        {
            let lock = TrainingLock::acquire(&path).unwrap();
            assert!(lock.is_held());
            assert!(path.exists());
        }
        assert!(!path.exists());
    }

    #[test]
    fn test_force_remove_reports_presence() {
        let temp = TempDir::new().unwrap();
        let path = temp.path().join(".training.lock");
        std::fs::write(&path, "pid=1\n").unwrap();
        assert!(TrainingLock::force_remove(&path).unwrap());
        assert!(!TrainingLock::force_remove(&path).unwrap());
    }

    #[test]
    fn test_failed_marker_write_leaves_no_marker() {
        let temp = TempDir::new().unwrap();
        let path = temp.path().join(".training.lock");

        let err = TrainingLock::acquire_with(&path, |_| Err(std::io::Error::other("disk full"))).unwrap_err();
        assert!(matches!(err, TrainingError::Io(_)));
        assert!(!path.exists());

        let held = TrainingLock::acquire(&path).unwrap();
        assert!(held.is_held());
    }
}
