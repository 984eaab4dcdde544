//! Filesystem error types.
//!
//! Every variant that concerns a resource carries the offending path so a
//! caller can report it without extra context.

use std::io;

use fedfs_cache::CacheError;
use thiserror::Error;

/// Error taxonomy, independent of the payload each variant carries.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, strum::Display, strum::AsRefStr)]
#[strum(serialize_all = "snake_case")]
pub enum ErrorKind {
    NotAccessible,
    AlreadyExists,
    UnknownProviderId,
    FederationContractViolation,
    MethodNotSupported,
    MetadataIo,
    InvalidPath,
    Config,
    Provider,
    Io,
    Cache,
}

/// fedfs error type.
#[derive(Debug, Error)]
pub enum FsError {
    /// Node is detached, stale or does not exist.
    #[error("not accessible: {path}")]
    NotAccessible { path: String },

    /// An existing sibling already has this name.
    #[error("already exists: {path}")]
    AlreadyExists { path: String },

    /// No provider factory is registered under this id.
    #[error("unknown provider id {id:?} (while resolving {path})")]
    UnknownProviderId { id: String, path: String },

    /// A federation answer was out of range or inconsistent.
    #[error("federation contract violation at {path}: {reason}")]
    FederationContractViolation { path: String, reason: String },

    /// The effective provider lacks the capability an operation needs.
    #[error("{method} not supported by provider {provider:?} for {path}")]
    MethodNotSupported {
        method: &'static str,
        provider: String,
        path: String,
    },

    /// The metadata store failed to load or save.
    #[error("metadata store error: {0}")]
    MetadataIo(String),

    /// Malformed path or path hint.
    #[error("invalid path: {0}")]
    InvalidPath(String),

    /// Configuration could not be read or parsed.
    #[error("config error: {0}")]
    Config(String),

    /// Provider-reported failure.
    #[error("provider error on {path}: {message}")]
    Provider { path: String, message: String },

    /// I/O error while serving a resource.
    #[error("I/O error on {path}: {source}")]
    Io {
        path: String,
        #[source]
        source: io::Error,
    },

    /// Cache service error.
    #[error("cache error: {0}")]
    Cache(#[from] CacheError),
}

impl FsError {
    /// Create a NotAccessible error.
    pub fn not_accessible(path: impl ToString) -> Self {
        Self::NotAccessible {
            path: path.to_string(),
        }
    }

    /// Create an AlreadyExists error.
    pub fn already_exists(path: impl ToString) -> Self {
        Self::AlreadyExists {
            path: path.to_string(),
        }
    }

    /// Create an UnknownProviderId error.
    pub fn unknown_provider(id: impl Into<String>, path: impl ToString) -> Self {
        Self::UnknownProviderId {
            id: id.into(),
            path: path.to_string(),
        }
    }

    /// Create a FederationContractViolation error.
    pub fn federation_violation(path: impl ToString, reason: impl Into<String>) -> Self {
        Self::FederationContractViolation {
            path: path.to_string(),
            reason: reason.into(),
        }
    }

    /// Create a MethodNotSupported error.
    pub fn not_supported(
        method: &'static str,
        provider: impl Into<String>,
        path: impl ToString,
    ) -> Self {
        Self::MethodNotSupported {
            method,
            provider: provider.into(),
            path: path.to_string(),
        }
    }

    /// Create a MetadataIo error.
    pub fn metadata(msg: impl Into<String>) -> Self {
        Self::MetadataIo(msg.into())
    }

    /// Create an InvalidPath error.
    pub fn invalid_path(msg: impl Into<String>) -> Self {
        Self::InvalidPath(msg.into())
    }

    /// Create a Provider error.
    pub fn provider(path: impl ToString, message: impl Into<String>) -> Self {
        Self::Provider {
            path: path.to_string(),
            message: message.into(),
        }
    }

    /// Create an Io error.
    pub fn io(path: impl ToString, source: io::Error) -> Self {
        Self::Io {
            path: path.to_string(),
            source,
        }
    }

    /// The taxonomy kind of this error.
    pub fn kind(&self) -> ErrorKind {
        match self {
            FsError::NotAccessible { .. } => ErrorKind::NotAccessible,
            FsError::AlreadyExists { .. } => ErrorKind::AlreadyExists,
            FsError::UnknownProviderId { .. } => ErrorKind::UnknownProviderId,
            FsError::FederationContractViolation { .. } => ErrorKind::FederationContractViolation,
            FsError::MethodNotSupported { .. } => ErrorKind::MethodNotSupported,
            FsError::MetadataIo(_) => ErrorKind::MetadataIo,
            FsError::InvalidPath(_) => ErrorKind::InvalidPath,
            FsError::Config(_) => ErrorKind::Config,
            FsError::Provider { .. } => ErrorKind::Provider,
            FsError::Io { .. } => ErrorKind::Io,
            FsError::Cache(_) => ErrorKind::Cache,
        }
    }

    /// The resource path the error concerns, if any.
    pub fn path(&self) -> Option<&str> {
        match self {
            FsError::NotAccessible { path }
            | FsError::AlreadyExists { path }
            | FsError::UnknownProviderId { path, .. }
            | FsError::FederationContractViolation { path, .. }
            | FsError::MethodNotSupported { path, .. }
            | FsError::Provider { path, .. }
            | FsError::Io { path, .. } => Some(path),
            _ => None,
        }
    }
}

impl From<rusqlite::Error> for FsError {
    fn from(e: rusqlite::Error) -> Self {
        Self::MetadataIo(e.to_string())
    }
}

/// Convert FsError to std::io::Error so streams can surface it.
impl From<FsError> for io::Error {
    fn from(e: FsError) -> Self {
        match e {
            FsError::Io { source, .. } => source,
            FsError::NotAccessible { .. } => io::Error::new(io::ErrorKind::NotFound, e),
            FsError::AlreadyExists { .. } => io::Error::new(io::ErrorKind::AlreadyExists, e),
            FsError::MethodNotSupported { .. } => io::Error::new(io::ErrorKind::Unsupported, e),
            FsError::InvalidPath(_) => io::Error::new(io::ErrorKind::InvalidInput, e),
            other => io::Error::other(other),
        }
    }
}

/// fedfs result type.
pub type FsResult<T> = Result<T, FsError>;
