//! # Store Lock
//!
//! Uses `fs2` for cross-platform file locking (flock on Unix, LockFile on
//! Windows) so two supervisors never share one store file.

use std::fs::{File, OpenOptions};
use std::io::Write;
use std::path::{Path, PathBuf};

use fs2::FileExt;
use tracing::debug;

use crate::ports::KVStoreError;

/// Exclusive lock next to a store file. Released on drop.
#[derive(Debug)]
pub struct StoreLock {
    file: File,
    path: PathBuf,
}

impl StoreLock {
    /// Lock `<store>.lock`. Fails immediately when another process holds it.
    pub fn acquire(store_path: &Path) -> Result<Self, KVStoreError> {
        let path = lock_path(store_path);
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }

        let mut file = OpenOptions::new()
            .create(true)
            .write(true)
            .truncate(false)
            .open(&path)?;

        file.try_lock_exclusive().map_err(|_| KVStoreError::Locked {
            message: format!("{} is held by another process", path.display()),
        })?;

        file.set_len(0)?;
        write!(file, "{}", std::process::id())?;
        file.sync_all()?;
        debug!(path = %path.display(), "store lock acquired");

        Ok(Self { file, path })
    }

    #[must_use]
    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl Drop for StoreLock {
    fn drop(&mut self) {
        let _ = self.file.unlock();
        let _ = std::fs::remove_file(&self.path);
    }
}

fn lock_path(store_path: &Path) -> PathBuf {
    let mut name = store_path
        .file_name()
        .map(|n| n.to_os_string())
        .unwrap_or_default();
    name.push(".lock");
    store_path.with_file_name(name)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_second_lock_fails() {
        let dir = tempfile::tempdir().unwrap();
        let store = dir.path().join("store.db");

        let first = StoreLock::acquire(&store).unwrap();
        assert_eq!(first.path(), dir.path().join("store.db.lock"));
        assert!(matches!(
            StoreLock::acquire(&store),
            Err(KVStoreError::Locked { .. })
        ));

        drop(first);
        assert!(StoreLock::acquire(&store).is_ok());
    }
}
