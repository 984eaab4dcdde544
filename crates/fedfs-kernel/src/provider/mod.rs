//! Content provider contract.
//!
//! A provider serves I/O and metadata for the subtree it is the effective
//! provider of. Optional operations are advertised through
//! [`Capabilities`]; callers check the flag before dispatching, and the
//! default trait methods answer [`FsError::MethodNotSupported`].

mod caching;
mod default;
mod registry;

pub use caching::{CachingProvider, RemoteContent, RemoteSource, WRITE_THROUGH_FLAG};
pub use default::{DEFAULT_PROVIDER_ID, DefaultProvider};
pub use registry::{PerRoot, ProviderEnv, ProviderFactory, ProviderRegistry, ProviderScope};

use std::collections::BTreeMap;
use std::io::{Read, Write};
use std::sync::Arc;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use bitflags::bitflags;

use crate::error::{FsError, FsResult};
use crate::path::ResourcePath;
use crate::store::Resource;
use crate::tree::NodeType;

/// Persistent property holding the last known content timestamp (unix millis).
pub const TIMESTAMP_PROPERTY: &str = "fedfs.timestamp";

bitflags! {
    /// Optional operations a provider implements.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
    pub struct Capabilities: u32 {
        /// Answers `federated_provider_for_path` for non-existing paths.
        const FEDERATION = 0b0_0001;
        /// Answers `federated_info_for_path` with a root offset.
        const DEEP_FEDERATION = 0b0_0010;
        /// Supports `lock` / `unlock`.
        const LOCKING = 0b0_0100;
        /// Supports `create_remote` / `delete_remote`.
        const REMOTE = 0b0_1000;
        /// Lets callers tag resources with a remote URI.
        const REMOTE_URI = 0b1_0000;
    }
}

/// Byte stream returned by [`ContentProvider::open_read`].
pub type ReadStream = Box<dyn Read + Send>;

/// Write stream returned by [`ContentProvider::open_write`].
pub type WriteStream = Box<dyn ResourceWrite>;

/// A provider write. Nothing is visible until [`ResourceWrite::commit`].
pub trait ResourceWrite: Write + Send {
    fn commit(self: Box<Self>) -> FsResult<WriteOutcome>;
}

/// Result of a committed write.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WriteOutcome {
    pub timestamp: SystemTime,
    pub upstream: UpstreamStatus,
}

/// What happened to a write beyond the local cache.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub enum UpstreamStatus {
    /// Write-through was not requested.
    #[default]
    NotRequested,
    Pushed,
    /// The push failed; the cached content is kept.
    Failed(String),
}

/// Metadata a provider reports for one resource.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ProviderMetadata {
    pub read_only: bool,
    pub timestamp: Option<SystemTime>,
    pub exists_remotely: bool,
    pub locked: bool,
    pub content_type: Option<String>,
}

/// Answer to a deep federation query.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FederationInfo {
    pub provider_id: String,
    /// Segments up from the queried path to the federated root; 1 is the
    /// queried path itself.
    pub root_offset: usize,
}

impl FederationInfo {
    pub fn new(provider_id: impl Into<String>, root_offset: usize) -> Self {
        Self {
            provider_id: provider_id.into(),
            root_offset,
        }
    }
}

/// What a provider sees of the resource it is asked about.
///
/// The handle may be used to call back into the tree; every such call is
/// its own lock transaction.
#[derive(Debug, Clone)]
pub struct ProviderContext {
    resource: Resource,
    root: ResourcePath,
    local_only: bool,
    removed: Option<RemovedResource>,
}

/// State of a resource captured just before it left the tree.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RemovedResource {
    pub node_type: NodeType,
    pub remote_uri: Option<String>,
    pub properties: BTreeMap<String, String>,
}

impl ProviderContext {
    pub(crate) fn new(resource: Resource, root: ResourcePath, local_only: bool) -> Self {
        Self {
            resource,
            root,
            local_only,
            removed: None,
        }
    }

    pub(crate) fn with_removed(mut self, removed: RemovedResource) -> Self {
        self.removed = Some(removed);
        self
    }

    pub fn resource(&self) -> &Resource {
        &self.resource
    }

    pub fn path(&self) -> &ResourcePath {
        self.resource.path()
    }

    /// Root-store path of the provider serving this resource.
    pub fn root(&self) -> &ResourcePath {
        &self.root
    }

    pub fn local_only(&self) -> bool {
        self.local_only
    }

    /// Cache key for the resource.
    pub fn cache_key(&self) -> String {
        self.path().cache_key()
    }

    /// Set only for [`ContentProvider::remove_resource`].
    pub fn removed(&self) -> Option<&RemovedResource> {
        self.removed.as_ref()
    }
}

/// A pluggable backend.
pub trait ContentProvider: Send + Sync {
    /// Provider id this instance was created for.
    fn id(&self) -> &str;

    fn capabilities(&self) -> Capabilities {
        Capabilities::empty()
    }

    fn open_read(&self, ctx: &ProviderContext) -> FsResult<ReadStream>;

    fn open_write(&self, ctx: &ProviderContext, append: bool) -> FsResult<WriteStream>;

    fn fetch_metadata(&self, ctx: &ProviderContext) -> FsResult<ProviderMetadata>;

    /// Called after a resource was created locally under this provider.
    fn add_resource(&self, _ctx: &ProviderContext) -> FsResult<()> {
        Ok(())
    }

    /// Called after a resource served by this provider was removed.
    ///
    /// The context's handle is already stale; what the resource held is in
    /// [`ProviderContext::removed`].
    fn remove_resource(&self, _ctx: &ProviderContext) -> FsResult<()> {
        Ok(())
    }

    /// Provider that should take over resolution of `path`, if not this one.
    ///
    /// Asked once per non-existing segment below the current root, always
    /// with the full path being resolved. A hand-off roots the new provider
    /// at that segment.
    fn federated_provider_for_path(&self, path: &ResourcePath) -> FsResult<Option<String>> {
        Err(FsError::not_supported("federation", self.id(), path))
    }

    /// Provider and root offset governing an arbitrarily deep `path`.
    fn federated_info_for_path(&self, path: &ResourcePath) -> FsResult<Option<FederationInfo>> {
        Err(FsError::not_supported("deep federation", self.id(), path))
    }

    fn lock(&self, ctx: &ProviderContext) -> FsResult<()> {
        Err(FsError::not_supported("lock", self.id(), ctx.path()))
    }

    fn unlock(&self, ctx: &ProviderContext) -> FsResult<()> {
        Err(FsError::not_supported("unlock", self.id(), ctx.path()))
    }

    /// Create the resource on the remote side.
    fn create_remote(&self, ctx: &ProviderContext, _node_type: NodeType) -> FsResult<()> {
        Err(FsError::not_supported("create remote", self.id(), ctx.path()))
    }

    fn delete_remote(&self, ctx: &ProviderContext) -> FsResult<()> {
        Err(FsError::not_supported("delete remote", self.id(), ctx.path()))
    }
}

/// Effective provider for a node, as bound by resolution.
#[derive(Clone)]
pub struct ResolvedProvider {
    pub(crate) provider_id: String,
    pub(crate) root: ResourcePath,
    pub(crate) provider: Arc<dyn ContentProvider>,
}

impl ResolvedProvider {
    pub(crate) fn new(
        provider_id: impl Into<String>,
        root: ResourcePath,
        provider: Arc<dyn ContentProvider>,
    ) -> Self {
        Self {
            provider_id: provider_id.into(),
            root,
            provider,
        }
    }

    pub fn id(&self) -> &str {
        &self.provider_id
    }

    /// Root-store path the provider was instantiated for.
    pub fn root(&self) -> &ResourcePath {
        &self.root
    }

    pub fn provider(&self) -> &Arc<dyn ContentProvider> {
        &self.provider
    }

    pub fn capabilities(&self) -> Capabilities {
        self.provider.capabilities()
    }

    /// Returns true if both refer to the same live instance.
    pub fn same_instance(&self, other: &ResolvedProvider) -> bool {
        Arc::ptr_eq(&self.provider, &other.provider)
    }
}

impl std::fmt::Debug for ResolvedProvider {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ResolvedProvider")
            .field("provider_id", &self.provider_id)
            .field("root", &self.root.to_string())
            .finish()
    }
}

/// Encode a timestamp for [`TIMESTAMP_PROPERTY`].
pub fn encode_timestamp(ts: SystemTime) -> String {
    ts.duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis())
        .unwrap_or_default()
        .to_string()
}

/// Decode a [`TIMESTAMP_PROPERTY`] value.
pub fn decode_timestamp(value: &str) -> Option<SystemTime> {
    let millis = value.parse::<u64>().ok()?;
    UNIX_EPOCH.checked_add(Duration::from_millis(millis))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_timestamp_property_round_trip() {
        let ts = UNIX_EPOCH + Duration::from_millis(1_700_000_000_123);
        assert_eq!(encode_timestamp(ts), "1700000000123");
        assert_eq!(decode_timestamp("1700000000123"), Some(ts));
        assert_eq!(decode_timestamp("soon"), None);
    }

    #[test]
    fn test_capability_sets() {
        let caps = Capabilities::FEDERATION | Capabilities::REMOTE_URI;
        assert!(caps.contains(Capabilities::FEDERATION));
        assert!(!caps.contains(Capabilities::DEEP_FEDERATION));
        assert!(Capabilities::default().is_empty());
    }
}
