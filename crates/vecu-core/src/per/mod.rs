//! Persistency module.
//!
//! Durable storage for application state: a process-wide registry mapping
//! logical instance specifiers to on-disk configurations, plus atomic
//! key/value and file stores opened through it.

mod error;
mod facade;
mod file_storage;
mod fsops;
mod kv;
mod registry;

pub use error::{PerError, PerResult};
pub use facade::{
    open_file_storage, open_key_value_storage, recover_file_storage, recover_key_value_storage,
    reset_file_storage, reset_key_value_storage,
};
pub use file_storage::FileStorage;
pub use kv::KeyValueStorage;
pub use registry::{StorageConfig, StorageRegistry, StorageType};
