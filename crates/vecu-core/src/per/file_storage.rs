//! File storage backend.
//!
//! Byte payloads under relative paths below the configured base. Unlike the
//! key/value backend, entries may nest in subdirectories; listing and quota
//! accounting are recursive.

use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Mutex;

use super::error::{PerError, PerResult};
use super::fsops;

/// Reject traversal, absolute paths, and drive separators.
fn rel_path_is_safe(rel: &str) -> bool {
    !rel.is_empty()
        && !rel.contains("..")
        && !rel.contains(':')
        && !Path::new(rel).is_absolute()
}

/// An open file storage instance.
#[derive(Debug)]
pub struct FileStorage {
    base_path: PathBuf,
    quota_bytes: u64,
    lock: Mutex<()>,
}

impl FileStorage {
    /// Open a file store over `base_path` with the given quota, creating the
    /// directory if needed.
    ///
    /// # Errors
    ///
    /// Returns [`PerError::Unknown`] if the directory cannot be created.
    pub fn new(base_path: impl Into<PathBuf>, quota_bytes: u64) -> PerResult<Self> {
        let base_path = base_path.into();
        fs::create_dir_all(&base_path).map_err(|_| PerError::Unknown)?;
        Ok(Self {
            base_path,
            quota_bytes,
            lock: Mutex::new(()),
        })
    }

    /// Write `data` to the file at `rel`, atomically, creating parent
    /// directories as needed.
    ///
    /// # Errors
    ///
    /// [`PerError::PermissionDenied`] for unsafe paths,
    /// [`PerError::QuotaExceeded`] if the write would exceed the quota, and
    /// [`PerError::Unknown`] for I/O failures.
    pub fn write_file(&self, rel: &str, data: &[u8]) -> PerResult<()> {
        let _guard = self.lock.lock().expect("file storage lock poisoned");

        if !rel_path_is_safe(rel) {
            return Err(PerError::PermissionDenied);
        }

        let file = self.base_path.join(rel);
        if let Some(parent) = file.parent() {
            let _ = fs::create_dir_all(parent);
        }

        let current = self.used_space_locked();
        let old_size = fs::metadata(&file).map_or(0, |m| m.len());
        let new_usage = current.saturating_sub(old_size) + data.len() as u64;
        if new_usage > self.quota_bytes {
            return Err(PerError::QuotaExceeded);
        }

        fsops::atomic_write(&file, data).map_err(|_| PerError::Unknown)
    }

    /// Read the full contents of the file at `rel`.
    ///
    /// # Errors
    ///
    /// [`PerError::PermissionDenied`] for unsafe paths,
    /// [`PerError::NotFound`] if the file does not exist, and
    /// [`PerError::Unknown`] for other I/O failures.
    pub fn read_file(&self, rel: &str) -> PerResult<Vec<u8>> {
        let _guard = self.lock.lock().expect("file storage lock poisoned");

        if !rel_path_is_safe(rel) {
            return Err(PerError::PermissionDenied);
        }

        match fs::read(self.base_path.join(rel)) {
            Ok(data) => Ok(data),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Err(PerError::NotFound),
            Err(_) => Err(PerError::Unknown),
        }
    }

    /// Remove the file at `rel` and make the removal durable.
    ///
    /// # Errors
    ///
    /// [`PerError::PermissionDenied`] for unsafe paths,
    /// [`PerError::NotFound`] if the file did not exist or removal failed.
    pub fn remove_file(&self, rel: &str) -> PerResult<()> {
        let _guard = self.lock.lock().expect("file storage lock poisoned");

        if !rel_path_is_safe(rel) {
            return Err(PerError::PermissionDenied);
        }

        let file = self.base_path.join(rel);
        fs::remove_file(&file).map_err(|_| PerError::NotFound)?;
        if let Some(parent) = file.parent() {
            let _ = fsops::fsync_dir(parent);
        }
        Ok(())
    }

    /// List all stored files as paths relative to the base, recursively.
    ///
    /// # Errors
    ///
    /// [`PerError::Unknown`] if the base directory cannot be read.
    pub fn list_files(&self) -> PerResult<Vec<String>> {
        let _guard = self.lock.lock().expect("file storage lock poisoned");

        let mut files = Vec::new();
        collect_files(&self.base_path, &self.base_path, &mut files)
            .map_err(|_| PerError::Unknown)?;
        Ok(files)
    }

    /// Total size in bytes of all stored files, recursive.
    #[must_use]
    pub fn used_space(&self) -> u64 {
        let _guard = self.lock.lock().expect("file storage lock poisoned");
        self.used_space_locked()
    }

    /// Flush pending changes. Writes are synchronous, so this is a no-op.
    ///
    /// # Errors
    ///
    /// None in this backend.
    pub fn sync_to_storage(&self) -> PerResult<()> {
        Ok(())
    }

    /// Drop staged changes. Nothing is staged in this backend.
    ///
    /// # Errors
    ///
    /// None in this backend.
    pub fn discard_pending_changes(&self) -> PerResult<()> {
        Ok(())
    }

    /// Directory this instance stores its entries under.
    #[must_use]
    pub fn base_path(&self) -> &Path {
        &self.base_path
    }

    fn used_space_locked(&self) -> u64 {
        fn dir_size(dir: &Path) -> u64 {
            let Ok(entries) = fs::read_dir(dir) else {
                return 0;
            };
            entries
                .flatten()
                .map(|e| {
                    let path = e.path();
                    if path.is_dir() {
                        dir_size(&path)
                    } else {
                        e.metadata().map_or(0, |m| m.len())
                    }
                })
                .sum()
        }
        dir_size(&self.base_path)
    }
}

fn collect_files(dir: &Path, base: &Path, out: &mut Vec<String>) -> std::io::Result<()> {
    for entry in fs::read_dir(dir)? {
        let entry = entry?;
        let path = entry.path();
        if path.is_dir() {
            collect_files(&path, base, out)?;
        } else if entry.file_type()?.is_file() {
            if let Ok(rel) = path.strip_prefix(base) {
                out.push(rel.to_string_lossy().into_owned());
            }
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn open(quota: u64) -> (tempfile::TempDir, FileStorage) {
        let dir = tempfile::tempdir().unwrap();
        let store = FileStorage::new(dir.path().join("fs"), quota).unwrap();
        (dir, store)
    }

    #[test]
    fn test_write_read_remove_round_trip() {
        let (_dir, store) = open(1024);

        store.write_file("test.bin", &[1, 2, 3, 4, 5]).unwrap();
        assert_eq!(store.read_file("test.bin").unwrap(), vec![1, 2, 3, 4, 5]);

        store.remove_file("test.bin").unwrap();
        assert_eq!(store.read_file("test.bin").unwrap_err(), PerError::NotFound);
    }

    #[test]
    fn test_nested_paths_and_recursive_listing() {
        let (_dir, store) = open(1024);

        store.write_file("a/b/deep.bin", b"xy").unwrap();
        store.write_file("top.bin", b"z").unwrap();

        let mut files = store.list_files().unwrap();
        files.sort();
        assert_eq!(files, vec!["a/b/deep.bin", "top.bin"]);
        assert_eq!(store.used_space(), 3);
    }

    #[test]
    fn test_unsafe_paths_are_rejected() {
        let (_dir, store) = open(1024);

        for rel in ["", "../escape", "a/../b", "/absolute", "c:drive"] {
            assert_eq!(
                store.write_file(rel, b"x").unwrap_err(),
                PerError::PermissionDenied,
                "write_file({rel:?})"
            );
            assert_eq!(store.read_file(rel).unwrap_err(), PerError::PermissionDenied);
            assert_eq!(
                store.remove_file(rel).unwrap_err(),
                PerError::PermissionDenied
            );
        }
    }

    #[test]
    fn test_quota_counts_nested_files() {
        let (_dir, store) = open(4);

        store.write_file("a/one.bin", b"12").unwrap();
        store.write_file("two.bin", b"34").unwrap();
        assert_eq!(
            store.write_file("three.bin", b"5").unwrap_err(),
            PerError::QuotaExceeded
        );
    }
}
