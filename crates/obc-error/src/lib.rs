#![forbid(unsafe_code)]
//! Error types for obcache.
//!
//! Defines `CacheError` and a `Result<T>` alias used throughout the
//! workspace. Includes errno mappings for block-layer callers.

use thiserror::Error;

/// Unified error type for all cache operations.
#[derive(Debug, Error)]
pub enum CacheError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("backend error {code}: {detail}")]
    Backend { code: i32, detail: String },

    #[error("object not found: {0}")]
    ObjectNotFound(String),

    #[error("cache exhausted: {0}")]
    Exhausted(String),

    #[error("image {0} is not registered")]
    ImageUnregistered(u16),

    #[error("invalid configuration: {0}")]
    InvalidConfig(String),

    #[error("operation cancelled")]
    Cancelled,
}

impl CacheError {
    /// Whether a write that failed with this error should be queued for
    /// retry rather than surfaced.
    #[must_use]
    pub fn is_transient(&self) -> bool {
        matches!(self, Self::Io(_) | Self::Backend { .. })
    }

    /// Convert this error into a POSIX errno for block-device callers.
    #[must_use]
    pub fn to_errno(&self) -> libc::c_int {
        match self {
            Self::Io(err) => err.raw_os_error().unwrap_or(libc::EIO),
            Self::Backend { .. } => libc::EIO,
            Self::ObjectNotFound(_) => libc::ENOENT,
            Self::Exhausted(_) => libc::ENOMEM,
            Self::ImageUnregistered(_) => libc::ENODEV,
            Self::InvalidConfig(_) => libc::EINVAL,
            Self::Cancelled => libc::ECANCELED,
        }
    }
}

/// Result alias using `CacheError`.
pub type Result<T> = std::result::Result<T, CacheError>;
