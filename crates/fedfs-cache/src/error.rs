//! Cache error types.

use std::io;
use thiserror::Error;

/// Cache service error type.
#[derive(Debug, Error)]
pub enum CacheError {
    /// No entry is stored under the key.
    #[error("cache entry not found: {0}")]
    NotFound(String),

    /// The key is empty or otherwise unusable.
    #[error("invalid cache key: {0:?}")]
    InvalidKey(String),

    /// The on-disk index could not be read or written.
    #[error("cache index error: {0}")]
    Index(String),

    /// I/O error.
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),
}

impl CacheError {
    /// Create a NotFound error.
    pub fn not_found(key: impl Into<String>) -> Self {
        Self::NotFound(key.into())
    }

    /// Create an InvalidKey error.
    pub fn invalid_key(key: impl Into<String>) -> Self {
        Self::InvalidKey(key.into())
    }

    /// Create an Index error.
    pub fn index(msg: impl Into<String>) -> Self {
        Self::Index(msg.into())
    }
}

impl From<serde_json::Error> for CacheError {
    fn from(e: serde_json::Error) -> Self {
        Self::Index(e.to_string())
    }
}

/// Cache result type.
pub type CacheResult<T> = Result<T, CacheError>;
