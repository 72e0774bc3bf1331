//! Error vocabulary shared by the persistency APIs.

/// Error kinds reported by storage and registry operations.
#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
pub enum PerError {
    /// Key, file, or registry entry does not exist.
    #[error("entry not found")]
    NotFound,

    /// The write would exceed the configured quota.
    #[error("storage quota exceeded")]
    QuotaExceeded,

    /// The registry manifest could not be parsed.
    #[error("storage configuration corrupted")]
    Corruption,

    /// The key or path is unsafe (empty, absolute, or traversing).
    #[error("permission denied")]
    PermissionDenied,

    /// I/O failure, or the registry was not initialized.
    #[error("unknown storage error")]
    Unknown,
}

/// Result type used throughout the persistency APIs.
pub type PerResult<T> = Result<T, PerError>;
