//! Storage registry.
//!
//! Catalog mapping logical instance specifiers to on-disk storage
//! configurations, initialized once per process from a persistency manifest.

use std::collections::HashMap;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Mutex;
use std::sync::atomic::{AtomicBool, Ordering};

use serde::{Deserialize, Serialize};
use tracing::warn;

use super::error::{PerError, PerResult};

/// Kind of storage behind an instance specifier.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum StorageType {
    /// Flat key/value store, one file per key.
    Kv,
    /// File store allowing nested relative paths.
    Files,
}

/// On-disk configuration of one storage instance.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StorageConfig {
    /// Storage kind.
    #[serde(rename = "type", default = "default_storage_type")]
    pub storage_type: StorageType,

    /// Directory all entries of this instance live under.
    pub base_path: PathBuf,

    /// Maximum total size of all entries, in bytes.
    #[serde(default = "default_quota_bytes")]
    pub quota_bytes: u64,

    /// Advisory recovery hint from the manifest.
    #[serde(default)]
    pub recover_on_start: bool,
}

const fn default_storage_type() -> StorageType {
    StorageType::Files
}

const fn default_quota_bytes() -> u64 {
    u64::MAX
}

#[derive(Debug, Deserialize)]
struct RegistryManifest {
    storages: Vec<StorageEntry>,
}

#[derive(Debug, Deserialize)]
struct StorageEntry {
    instance_spec: String,
    #[serde(flatten)]
    config: StorageConfig,
}

/// Registry of storage instances for this process.
///
/// Initialization is single-shot: once [`init_from_file`] has returned `Ok`,
/// [`is_initialized`] stays `true` for the process lifetime unless
/// [`clear`] is called explicitly. The initialized flag is published with
/// release ordering relative to the map contents, so a `lookup` on another
/// thread that observes `is_initialized() == true` sees the configured
/// entries.
///
/// [`init_from_file`]: StorageRegistry::init_from_file
/// [`is_initialized`]: StorageRegistry::is_initialized
/// [`clear`]: StorageRegistry::clear
#[derive(Debug, Default)]
pub struct StorageRegistry {
    map: Mutex<HashMap<String, StorageConfig>>,
    initialized: AtomicBool,
}

impl StorageRegistry {
    /// Create an empty, uninitialized registry.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Load the registry from a persistency manifest file.
    ///
    /// Every configured `base_path` is created if absent, then the mapping
    /// is published atomically and the registry marked initialized.
    ///
    /// # Errors
    ///
    /// Returns [`PerError::NotFound`] if the file cannot be opened and
    /// [`PerError::Corruption`] if it does not parse; in both cases the map
    /// is left empty.
    pub fn init_from_file(&self, path: impl AsRef<Path>) -> PerResult<()> {
        let path = path.as_ref();
        let mut map = self.map.lock().expect("registry lock poisoned");
        map.clear();

        let text = fs::read_to_string(path).map_err(|_| PerError::NotFound)?;
        let manifest: RegistryManifest =
            serde_json::from_str(&text).map_err(|_| PerError::Corruption)?;

        let mut loaded = HashMap::new();
        for entry in manifest.storages {
            if let Err(e) = fs::create_dir_all(&entry.config.base_path) {
                warn!(
                    instance = %entry.instance_spec,
                    base_path = %entry.config.base_path.display(),
                    error = %e,
                    "failed to create storage base directory"
                );
            }
            loaded.insert(entry.instance_spec, entry.config);
        }

        *map = loaded;
        self.initialized.store(true, Ordering::Release);
        Ok(())
    }

    /// Look up the configuration for an instance specifier.
    #[must_use]
    pub fn lookup(&self, instance_spec: &str) -> Option<StorageConfig> {
        let map = self.map.lock().expect("registry lock poisoned");
        map.get(instance_spec).cloned()
    }

    /// Whether [`init_from_file`](Self::init_from_file) has completed.
    #[must_use]
    pub fn is_initialized(&self) -> bool {
        self.initialized.load(Ordering::Acquire)
    }

    /// Remove all entries and reset the initialized flag.
    pub fn clear(&self) {
        let mut map = self.map.lock().expect("registry lock poisoned");
        map.clear();
        self.initialized.store(false, Ordering::Release);
    }
}
