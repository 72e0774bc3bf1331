//! Filesystem primitives for the crash-safe write protocol.

use std::fs::{self, File};
use std::io::{self, Write};
use std::path::{Path, PathBuf};

/// Sibling temporary path for an atomic write (`<name>.tmp`).
pub(crate) fn tmp_path(path: &Path) -> PathBuf {
    let mut name = path.as_os_str().to_os_string();
    name.push(".tmp");
    PathBuf::from(name)
}

/// fsync a directory so a rename inside it is durable.
pub(crate) fn fsync_dir(dir: &Path) -> io::Result<()> {
    File::open(dir)?.sync_all()
}

/// Write `data` to `path` atomically: sibling temp file, flush, fsync,
/// rename over the final name, fsync the containing directory.
///
/// On any failure the temp file is removed best-effort and the original
/// file (if any) is left untouched.
pub(crate) fn atomic_write(path: &Path, data: &[u8]) -> io::Result<()> {
    let tmp = tmp_path(path);

    let result = (|| {
        let mut file = File::create(&tmp)?;
        file.write_all(data)?;
        file.sync_all()?;
        drop(file);

        fs::rename(&tmp, path)?;

        if let Some(dir) = path.parent() {
            fsync_dir(dir)?;
        }
        Ok(())
    })();

    if result.is_err() {
        let _ = fs::remove_file(&tmp);
    }
    result
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_atomic_write_replaces_contents() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("entry");

        atomic_write(&path, b"first").unwrap();
        assert_eq!(fs::read(&path).unwrap(), b"first");

        atomic_write(&path, b"second").unwrap();
        assert_eq!(fs::read(&path).unwrap(), b"second");
    }

    #[test]
    fn test_atomic_write_cleans_temp_on_failure() {
        let dir = tempfile::tempdir().unwrap();
        // A directory at the final path makes the rename step fail.
        let path = dir.path().join("blocked");
        fs::create_dir(&path).unwrap();

        assert!(atomic_write(&path, b"data").is_err());
        assert!(!tmp_path(&path).exists());
    }
}
