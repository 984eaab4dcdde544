//! # fedfs-kernel
//!
//! A virtual, federated resource tree. Paths like `/Project/folder/file`
//! are backed by pluggable content providers; which provider serves a path
//! is decided on demand by walking the tree:
//!
//! - An explicit provider id on a node (or the configured default at the
//!   top) picks the candidate.
//! - Federating providers may hand non-existing segments, or whole deep
//!   paths, to other providers. Those decisions are recorded on the tree
//!   and persisted.
//!
//! Entry points:
//!
//! - [`FederatedFs`] - the tree, its lock, providers, cache and metadata store
//! - [`Resource`] - a handle for one path: I/O, properties, structure
//! - [`ContentProvider`] - the provider contract; [`CachingProvider`] turns a
//!   [`RemoteSource`] into one that keeps local copies in a cache service
//!
//! Provider code never runs while the tree lock is held.

pub mod config;
pub mod error;
mod fs;
pub mod path;
pub mod persist;
pub mod provider;
mod resolve;
mod store;
pub mod tree;
mod uri_index;

pub use config::{CacheConfig, CacheKind, FlushMode, FsConfig, MetadataConfig};
pub use error::{ErrorKind, FsError, FsResult};
pub use fs::{FederatedFs, FsBuilder};
pub use path::{PathHints, ResourcePath, parse_with_hints};
pub use persist::{MemoryMetadataStore, MetadataStore, NodeRecord, SqliteMetadataStore, TreeSnapshot};
pub use provider::{
    CachingProvider, Capabilities, ContentProvider, DEFAULT_PROVIDER_ID, DefaultProvider,
    FederationInfo, PerRoot, ProviderContext, ProviderEnv, ProviderFactory, ProviderMetadata,
    ProviderRegistry, ProviderScope, ReadStream, RemoteContent, RemoteSource, RemovedResource,
    ResolvedProvider, ResourceWrite, TIMESTAMP_PROPERTY, UpstreamStatus, WRITE_THROUGH_FLAG, WriteOutcome,
    WriteStream,
};
pub use store::{CreateMode, RemoveMode, Resource, ResourceMetadata};
pub use tree::{NodeId, NodeType, ResourceTree};

// Re-exported so provider implementations need only this crate.
pub use fedfs_cache as cache;
