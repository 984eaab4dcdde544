//! Filesystem configuration, loaded from TOML.
//!
//! ```toml
//! default_provider = "default"
//!
//! [metadata]
//! path = "/var/lib/fedfs/tree.db"
//! flush = "delayed"
//!
//! [cache]
//! kind = "disk"
//! dir = "/var/cache/fedfs"
//! ```
//!
//! Every field is optional.

use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

use crate::error::{FsError, FsResult};
use crate::provider::DEFAULT_PROVIDER_ID;

/// When tree metadata is written to the store.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum FlushMode {
    /// Save after every mutation that asks for a flush.
    #[default]
    Immediate,
    /// Only mark the tree dirty; save on explicit flush or shutdown.
    Delayed,
}

/// Which cache service backs content.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CacheKind {
    #[default]
    Disk,
    Memory,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct MetadataConfig {
    /// SQLite file; `None` keeps metadata in memory.
    pub path: Option<PathBuf>,
    pub flush: FlushMode,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct CacheConfig {
    pub kind: CacheKind,
    /// Disk cache directory; defaults to [`default_cache_dir`].
    pub dir: Option<PathBuf>,
}

impl CacheConfig {
    /// Configured directory, or the platform default.
    pub fn resolved_dir(&self) -> PathBuf {
        self.dir.clone().unwrap_or_else(default_cache_dir)
    }
}

/// Top-level configuration.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct FsConfig {
    /// Provider used where no ancestor assigns one.
    pub default_provider: String,
    pub metadata: MetadataConfig,
    pub cache: CacheConfig,
}

impl Default for FsConfig {
    fn default() -> Self {
        Self {
            default_provider: DEFAULT_PROVIDER_ID.to_string(),
            metadata: MetadataConfig::default(),
            cache: CacheConfig::default(),
        }
    }
}

impl FsConfig {
    /// Read and parse a TOML config file.
    pub fn load(path: impl AsRef<Path>) -> FsResult<Self> {
        let path = path.as_ref();
        let text = std::fs::read_to_string(path)
            .map_err(|e| FsError::Config(format!("{}: {e}", path.display())))?;
        Self::from_toml_str(&text)
            .map_err(|e| FsError::Config(format!("{}: {e}", path.display())))
    }

    pub fn from_toml_str(s: &str) -> FsResult<Self> {
        toml::from_str(s).map_err(|e| FsError::Config(e.to_string()))
    }

    pub fn to_toml_string(&self) -> FsResult<String> {
        toml::to_string_pretty(self).map_err(|e| FsError::Config(e.to_string()))
    }
}

/// Platform cache directory plus `fedfs`, or `./.fedfs-cache` without one.
pub fn default_cache_dir() -> PathBuf {
    dirs::cache_dir()
        .map(|dir| dir.join("fedfs"))
        .unwrap_or_else(|| PathBuf::from(".fedfs-cache"))
}
