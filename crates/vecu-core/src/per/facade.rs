//! Storage facade.
//!
//! Opens storage backends through the registry by instance specifier, and
//! provides the reset/recover entry points defined for them.

use std::fs;
use std::sync::Arc;

use super::error::{PerError, PerResult};
use super::file_storage::FileStorage;
use super::fsops;
use super::kv::KeyValueStorage;
use super::registry::{StorageConfig, StorageRegistry, StorageType};

fn resolve(
    registry: &StorageRegistry,
    instance_spec: &str,
    expected: StorageType,
) -> PerResult<StorageConfig> {
    if !registry.is_initialized() {
        return Err(PerError::Unknown);
    }
    match registry.lookup(instance_spec) {
        Some(cfg) if cfg.storage_type == expected => Ok(cfg),
        _ => Err(PerError::NotFound),
    }
}

/// Open the key/value storage registered under `instance_spec`.
///
/// # Errors
///
/// [`PerError::Unknown`] if the registry is not initialized,
/// [`PerError::NotFound`] if the specifier is unknown or not a kv store.
pub fn open_key_value_storage(
    registry: &StorageRegistry,
    instance_spec: &str,
) -> PerResult<Arc<KeyValueStorage>> {
    let cfg = resolve(registry, instance_spec, StorageType::Kv)?;
    Ok(Arc::new(KeyValueStorage::new(
        cfg.base_path,
        cfg.quota_bytes,
    )?))
}

/// Open the file storage registered under `instance_spec`.
///
/// # Errors
///
/// [`PerError::Unknown`] if the registry is not initialized,
/// [`PerError::NotFound`] if the specifier is unknown or not a file store.
pub fn open_file_storage(
    registry: &StorageRegistry,
    instance_spec: &str,
) -> PerResult<Arc<FileStorage>> {
    let cfg = resolve(registry, instance_spec, StorageType::Files)?;
    Ok(Arc::new(FileStorage::new(cfg.base_path, cfg.quota_bytes)?))
}

/// Delete every entry of the key/value storage under `instance_spec`.
///
/// # Errors
///
/// As [`open_key_value_storage`].
pub fn reset_key_value_storage(registry: &StorageRegistry, instance_spec: &str) -> PerResult<()> {
    let cfg = resolve(registry, instance_spec, StorageType::Kv)?;
    if !cfg.base_path.exists() {
        return Ok(());
    }
    for entry in fs::read_dir(&cfg.base_path)
        .map_err(|_| PerError::Unknown)?
        .flatten()
    {
        if entry.file_type().is_ok_and(|t| t.is_file()) {
            let _ = fs::remove_file(entry.path());
        }
    }
    let _ = fsops::fsync_dir(&cfg.base_path);
    Ok(())
}

/// Delete every entry of the file storage under `instance_spec`,
/// recursively.
///
/// # Errors
///
/// As [`open_file_storage`].
pub fn reset_file_storage(registry: &StorageRegistry, instance_spec: &str) -> PerResult<()> {
    let cfg = resolve(registry, instance_spec, StorageType::Files)?;
    if !cfg.base_path.exists() {
        return Ok(());
    }
    remove_files_recursive(&cfg.base_path);
    let _ = fsops::fsync_dir(&cfg.base_path);
    Ok(())
}

fn remove_files_recursive(dir: &std::path::Path) {
    let Ok(entries) = fs::read_dir(dir) else {
        return;
    };
    for entry in entries.flatten() {
        let path = entry.path();
        if path.is_dir() {
            remove_files_recursive(&path);
        } else {
            let _ = fs::remove_file(&path);
        }
    }
}

/// Recovery hook for key/value storage. The `recover_on_start` manifest
/// flag is advisory; nothing is rebuilt today.
///
/// # Errors
///
/// None today.
pub fn recover_key_value_storage(
    _registry: &StorageRegistry,
    _instance_spec: &str,
) -> PerResult<()> {
    Ok(())
}

/// Recovery hook for file storage. See [`recover_key_value_storage`].
///
/// # Errors
///
/// None today.
pub fn recover_file_storage(_registry: &StorageRegistry, _instance_spec: &str) -> PerResult<()> {
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn registry_with(dir: &std::path::Path) -> StorageRegistry {
        let manifest = dir.join("persistency.json");
        fs::write(
            &manifest,
            format!(
                r#"{{"storages":[
                    {{"instance_spec":"EM/KV/Settings","type":"kv","base_path":{:?},"quota_bytes":4096}},
                    {{"instance_spec":"EM/FS/State","type":"files","base_path":{:?},"quota_bytes":4096}}
                ]}}"#,
                dir.join("kv"),
                dir.join("fs"),
            ),
        )
        .unwrap();

        let registry = StorageRegistry::new();
        registry.init_from_file(&manifest).unwrap();
        registry
    }

    #[test]
    fn test_open_requires_initialized_registry() {
        let registry = StorageRegistry::new();
        assert_eq!(
            open_key_value_storage(&registry, "EM/KV/Settings").unwrap_err(),
            PerError::Unknown
        );
    }

    #[test]
    fn test_open_checks_spec_and_type() {
        let dir = tempfile::tempdir().unwrap();
        let registry = registry_with(dir.path());

        assert!(open_key_value_storage(&registry, "EM/KV/Settings").is_ok());
        assert_eq!(
            open_key_value_storage(&registry, "EM/FS/State").unwrap_err(),
            PerError::NotFound
        );
        assert_eq!(
            open_file_storage(&registry, "no/such/spec").unwrap_err(),
            PerError::NotFound
        );
    }

    #[test]
    fn test_reset_key_value_storage_removes_entries() {
        let dir = tempfile::tempdir().unwrap();
        let registry = registry_with(dir.path());

        let kv = open_key_value_storage(&registry, "EM/KV/Settings").unwrap();
        kv.set_value("a", b"1").unwrap();
        kv.set_value("b", b"2").unwrap();

        reset_key_value_storage(&registry, "EM/KV/Settings").unwrap();
        assert!(kv.get_all_keys().unwrap().is_empty());
    }

    #[test]
    fn test_reset_file_storage_removes_nested_entries() {
        let dir = tempfile::tempdir().unwrap();
        let registry = registry_with(dir.path());

        let store = open_file_storage(&registry, "EM/FS/State").unwrap();
        store.write_file("a/b.bin", b"1").unwrap();
        store.write_file("c.bin", b"2").unwrap();

        reset_file_storage(&registry, "EM/FS/State").unwrap();
        assert!(store.list_files().unwrap().is_empty());
    }
}
