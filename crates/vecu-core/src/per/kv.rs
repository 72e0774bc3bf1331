//! Key/value storage backend.
//!
//! One regular file per key under the configured base path. Writes follow
//! the crash-safe protocol in [`fsops`](super::fsops); the quota is the sum
//! of file sizes directly under the base (non-recursive).

use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Mutex;

use super::error::{PerError, PerResult};
use super::fsops;

/// Guard against path traversal in keys.
fn key_is_safe(key: &str) -> bool {
    !key.is_empty() && !key.contains('/') && !key.contains('\\') && !key.contains("..")
}

/// An open key/value storage instance.
///
/// Operations serialize on an internal mutex; opening the same base path
/// from multiple processes is undefined.
#[derive(Debug)]
pub struct KeyValueStorage {
    base_path: PathBuf,
    quota_bytes: u64,
    lock: Mutex<()>,
}

impl KeyValueStorage {
    /// Open a backend over `base_path` with the given quota, creating the
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

    /// Store `value` under `key`, atomically.
    ///
    /// # Errors
    ///
    /// [`PerError::PermissionDenied`] for unsafe keys,
    /// [`PerError::QuotaExceeded`] if the write would exceed the quota, and
    /// [`PerError::Unknown`] for I/O failures. After a failure the previous
    /// value, if any, is still readable.
    pub fn set_value(&self, key: &str, value: &[u8]) -> PerResult<()> {
        let _guard = self.lock.lock().expect("kv lock poisoned");

        if !key_is_safe(key) {
            return Err(PerError::PermissionDenied);
        }

        let file = self.base_path.join(key);

        let current = self.used_space_locked();
        let old_size = fs::metadata(&file).map_or(0, |m| m.len());
        let new_usage = current.saturating_sub(old_size) + value.len() as u64;
        if new_usage > self.quota_bytes {
            return Err(PerError::QuotaExceeded);
        }

        fsops::atomic_write(&file, value).map_err(|_| PerError::Unknown)
    }

    /// Read the value stored under `key`. Empty values are valid.
    ///
    /// # Errors
    ///
    /// [`PerError::PermissionDenied`] for unsafe keys,
    /// [`PerError::NotFound`] if the key does not exist, and
    /// [`PerError::Unknown`] for other I/O failures.
    pub fn get_value(&self, key: &str) -> PerResult<Vec<u8>> {
        let _guard = self.lock.lock().expect("kv lock poisoned");

        if !key_is_safe(key) {
            return Err(PerError::PermissionDenied);
        }

        match fs::read(self.base_path.join(key)) {
            Ok(data) => Ok(data),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Err(PerError::NotFound),
            Err(_) => Err(PerError::Unknown),
        }
    }

    /// Read the value stored under `key` as UTF-8 text.
    ///
    /// # Errors
    ///
    /// As [`get_value`](Self::get_value); additionally
    /// [`PerError::Corruption`] if the stored bytes are not valid UTF-8.
    pub fn get_value_string(&self, key: &str) -> PerResult<String> {
        let bytes = self.get_value(key)?;
        String::from_utf8(bytes).map_err(|_| PerError::Corruption)
    }

    /// Whether `key` currently has a value.
    ///
    /// # Errors
    ///
    /// [`PerError::PermissionDenied`] for unsafe keys.
    pub fn has_key(&self, key: &str) -> PerResult<bool> {
        let _guard = self.lock.lock().expect("kv lock poisoned");

        if !key_is_safe(key) {
            return Err(PerError::PermissionDenied);
        }
        Ok(self.base_path.join(key).is_file())
    }

    /// Remove the value stored under `key` and make the removal durable.
    ///
    /// # Errors
    ///
    /// [`PerError::PermissionDenied`] for unsafe keys,
    /// [`PerError::NotFound`] if the key did not exist or removal failed.
    pub fn remove_key(&self, key: &str) -> PerResult<()> {
        let _guard = self.lock.lock().expect("kv lock poisoned");

        if !key_is_safe(key) {
            return Err(PerError::PermissionDenied);
        }

        fs::remove_file(self.base_path.join(key)).map_err(|_| PerError::NotFound)?;
        let _ = fsops::fsync_dir(&self.base_path);
        Ok(())
    }

    /// List all keys currently stored.
    ///
    /// # Errors
    ///
    /// [`PerError::Unknown`] if the base directory cannot be read.
    pub fn get_all_keys(&self) -> PerResult<Vec<String>> {
        let _guard = self.lock.lock().expect("kv lock poisoned");

        let entries = fs::read_dir(&self.base_path).map_err(|_| PerError::Unknown)?;
        let mut keys = Vec::new();
        for entry in entries.flatten() {
            if entry.file_type().is_ok_and(|t| t.is_file()) {
                keys.push(entry.file_name().to_string_lossy().into_owned());
            }
        }
        Ok(keys)
    }

    /// Total size in bytes of all stored values.
    #[must_use]
    pub fn used_space(&self) -> u64 {
        let _guard = self.lock.lock().expect("kv lock poisoned");
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

    /// Usage sum without taking the lock; callable from locked operations.
    fn used_space_locked(&self) -> u64 {
        let Ok(entries) = fs::read_dir(&self.base_path) else {
            return 0;
        };
        entries
            .flatten()
            .filter_map(|e| e.metadata().ok())
            .filter(std::fs::Metadata::is_file)
            .map(|m| m.len())
            .sum()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn open(quota: u64) -> (tempfile::TempDir, KeyValueStorage) {
        let dir = tempfile::tempdir().unwrap();
        let kv = KeyValueStorage::new(dir.path().join("kv"), quota).unwrap();
        (dir, kv)
    }

    #[test]
    fn test_set_get_remove_round_trip() {
        let (_dir, kv) = open(1024);

        kv.set_value("foo", b"bar").unwrap();
        assert_eq!(kv.get_value("foo").unwrap(), b"bar");
        assert_eq!(kv.get_value_string("foo").unwrap(), "bar");
        assert!(kv.has_key("foo").unwrap());

        kv.remove_key("foo").unwrap();
        assert_eq!(kv.get_value("foo").unwrap_err(), PerError::NotFound);
        assert!(!kv.has_key("foo").unwrap());
    }

    #[test]
    fn test_empty_value_is_valid() {
        let (_dir, kv) = open(1024);
        kv.set_value("empty", b"").unwrap();
        assert_eq!(kv.get_value("empty").unwrap(), Vec::<u8>::new());
    }

    #[test]
    fn test_unsafe_keys_are_rejected() {
        let (_dir, kv) = open(1024);

        for key in ["", "a/b", "a\\b", "..", "up..down"] {
            assert_eq!(
                kv.set_value(key, b"x").unwrap_err(),
                PerError::PermissionDenied,
                "set_value({key:?})"
            );
            assert_eq!(kv.get_value(key).unwrap_err(), PerError::PermissionDenied);
            assert_eq!(kv.has_key(key).unwrap_err(), PerError::PermissionDenied);
            assert_eq!(kv.remove_key(key).unwrap_err(), PerError::PermissionDenied);
        }
    }

    #[test]
    fn test_quota_rejects_and_keeps_prior_value() {
        let (_dir, kv) = open(8);

        kv.set_value("k", b"1234").unwrap();
        assert_eq!(
            kv.set_value("other", b"123456").unwrap_err(),
            PerError::QuotaExceeded
        );
        assert_eq!(kv.get_value("k").unwrap(), b"1234");

        // Overwriting the same key only counts the delta.
        kv.set_value("k", b"12345678").unwrap();
        assert_eq!(kv.used_space(), 8);
    }

    #[test]
    fn test_failed_write_leaves_no_temp_file() {
        let (_dir, kv) = open(1024);

        // A directory squatting on the final path forces the rename to fail.
        fs::create_dir(kv.base_path().join("blocked")).unwrap();
        assert_eq!(
            kv.set_value("blocked", b"data").unwrap_err(),
            PerError::Unknown
        );

        let leftovers: Vec<_> = fs::read_dir(kv.base_path())
            .unwrap()
            .flatten()
            .filter(|e| e.file_name().to_string_lossy().ends_with(".tmp"))
            .collect();
        assert!(leftovers.is_empty());
    }

    #[test]
    fn test_get_all_keys() {
        let (_dir, kv) = open(1024);
        kv.set_value("a", b"1").unwrap();
        kv.set_value("b", b"2").unwrap();

        let mut keys = kv.get_all_keys().unwrap();
        keys.sort();
        assert_eq!(keys, vec!["a", "b"]);
    }
}
