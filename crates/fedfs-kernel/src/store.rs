//! Per-path handles.
//!
//! A [`Resource`] pairs a path with its tree node. Tree reads and
//! mutations take the filesystem lock for the duration of one call;
//! anything that reaches a provider resolves first, releases the lock and
//! only then calls out. Structural changes are flushed before the
//! provider hears about them.

use std::any::Any;
use std::collections::BTreeMap;
use std::io::{Read, Write};
use std::sync::Arc;
use std::time::SystemTime;

use parking_lot::RwLockUpgradableReadGuard;

use crate::error::{FsError, FsResult};
use crate::fs::FsCore;
use crate::path::ResourcePath;
use crate::provider::{
    Capabilities, ProviderContext, ReadStream, RemovedResource, ResolvedProvider,
    TIMESTAMP_PROPERTY, WriteOutcome, WriteStream, decode_timestamp,
};
use crate::resolve::resolve;
use crate::tree::{NodeId, NodeType, SessionValue};

/// How [`Resource::create_child`] creates the child.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum CreateMode {
    /// Local-only resource; the provider is only notified.
    #[default]
    Local,
    /// Ask the effective provider to create it remotely.
    Remote,
}

/// How [`Resource::remove`] treats cached content.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum RemoveMode {
    /// Detach from the tree; cached content stays.
    #[default]
    Detach,
    /// Detach and purge every cache entry under the path.
    Force,
}

/// Metadata of one resource.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ResourceMetadata {
    pub path: ResourcePath,
    pub node_type: NodeType,
    pub local_only: bool,
    pub provider_id: String,
    pub read_only: bool,
    pub timestamp: Option<SystemTime>,
    pub exists_remotely: bool,
    pub locked: bool,
    pub content_type: Option<String>,
}

/// Handle to one path in a [`crate::FederatedFs`].
#[derive(Clone)]
pub struct Resource {
    core: Arc<FsCore>,
    path: ResourcePath,
    node: NodeId,
}

impl std::fmt::Debug for Resource {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Resource")
            .field("path", &self.path.to_string())
            .field("node", &self.node)
            .finish()
    }
}

impl Resource {
    pub(crate) fn new(core: Arc<FsCore>, path: ResourcePath, node: NodeId) -> Self {
        Self { core, path, node }
    }

    pub fn path(&self) -> &ResourcePath {
        &self.path
    }

    pub fn name(&self) -> Option<&str> {
        self.path.name()
    }

    pub fn node_id(&self) -> NodeId {
        self.node
    }

    fn stale(&self) -> FsError {
        FsError::not_accessible(&self.path)
    }

    /// Read node fields under the read lock.
    fn with_node<T>(&self, f: impl FnOnce(&crate::tree::TreeNode) -> T) -> FsResult<T> {
        let tree = self.core.tree.read();
        tree.node(self.node).map(f).ok_or_else(|| self.stale())
    }

    /// Returns false for phantoms and removed nodes.
    pub fn exists(&self) -> bool {
        self.with_node(|n| n.exists()).unwrap_or(false)
    }

    pub fn node_type(&self) -> FsResult<NodeType> {
        self.with_node(|n| n.node_type())
    }

    pub fn is_local_only(&self) -> FsResult<bool> {
        self.with_node(|n| n.local_only())
    }

    pub fn assigned_provider_id(&self) -> FsResult<Option<String>> {
        self.with_node(|n| n.assigned_provider_id().map(str::to_string))
    }

    pub fn dynamic_provider_id(&self) -> FsResult<Option<String>> {
        self.with_node(|n| n.dynamic_provider_id().map(str::to_string))
    }

    fn require_exists(&self) -> FsResult<()> {
        if self.with_node(|n| n.exists())? {
            Ok(())
        } else {
            Err(self.stale())
        }
    }

    // ------------------------------------------------------------------
    // Provider dispatch
    // ------------------------------------------------------------------

    /// The effective provider.
    pub fn provider(&self) -> FsResult<ResolvedProvider> {
        resolve(&self.core, self.node).map_err(|e| match e {
            FsError::NotAccessible { .. } => self.stale(),
            other => other,
        })
    }

    /// Root-store path of the effective provider, for scoping external
    /// scheduling rules.
    pub fn rule_scope(&self) -> FsResult<ResourcePath> {
        Ok(self.provider()?.root().clone())
    }

    fn context(&self, resolved: &ResolvedProvider) -> FsResult<ProviderContext> {
        let local_only = self.is_local_only()?;
        Ok(ProviderContext::new(
            self.clone(),
            resolved.root().clone(),
            local_only,
        ))
    }

    fn dispatch(&self) -> FsResult<(ResolvedProvider, ProviderContext)> {
        let resolved = self.provider()?;
        let ctx = self.context(&resolved)?;
        Ok((resolved, ctx))
    }

    fn require_capability(
        &self,
        resolved: &ResolvedProvider,
        capability: Capabilities,
        method: &'static str,
    ) -> FsResult<()> {
        if resolved.capabilities().contains(capability) {
            Ok(())
        } else {
            Err(FsError::not_supported(method, resolved.id(), &self.path))
        }
    }

    /// Metadata from the effective provider.
    ///
    /// Local-only resources skip the provider: they are always writable and
    /// carry only their locally recorded timestamp.
    pub fn metadata(&self) -> FsResult<ResourceMetadata> {
        let (node_type, exists, local_only) =
            self.with_node(|n| (n.node_type(), n.exists(), n.local_only()))?;
        if !exists {
            return Err(self.stale());
        }

        let resolved = self.provider()?;
        let mut meta = ResourceMetadata {
            path: self.path.clone(),
            node_type,
            local_only,
            provider_id: resolved.id().to_string(),
            read_only: false,
            timestamp: None,
            exists_remotely: false,
            locked: false,
            content_type: None,
        };

        if local_only {
            meta.timestamp = self
                .persistent_property(TIMESTAMP_PROPERTY)?
                .as_deref()
                .and_then(decode_timestamp);
            return Ok(meta);
        }

        let ctx = self.context(&resolved)?;
        let reported = resolved.provider().fetch_metadata(&ctx)?;
        meta.read_only = reported.read_only;
        meta.timestamp = reported.timestamp;
        meta.exists_remotely = reported.exists_remotely;
        meta.locked = reported.locked;
        meta.content_type = reported.content_type;
        Ok(meta)
    }

    /// Read-only flag for display; `true` if it cannot be determined.
    pub fn is_read_only_for_display(&self) -> bool {
        match self.metadata() {
            Ok(meta) => meta.read_only,
            Err(e) => {
                tracing::warn!(path = %self.path, error = %e, "read-only check failed; assuming read-only");
                true
            }
        }
    }

    pub fn open_read(&self) -> FsResult<ReadStream> {
        self.require_exists()?;
        let (resolved, ctx) = self.dispatch()?;
        resolved.provider().open_read(&ctx)
    }

    pub fn read_all(&self) -> FsResult<Vec<u8>> {
        let mut stream = self.open_read()?;
        let mut buf = Vec::new();
        stream
            .read_to_end(&mut buf)
            .map_err(|e| FsError::io(&self.path, e))?;
        Ok(buf)
    }

    /// Open a write stream; nothing is visible until it is committed.
    pub fn open_write(&self, append: bool) -> FsResult<WriteStream> {
        self.require_exists()?;
        let (resolved, ctx) = self.dispatch()?;
        resolved.provider().open_write(&ctx, append)
    }

    pub fn write_all(&self, data: &[u8], append: bool) -> FsResult<WriteOutcome> {
        let mut stream = self.open_write(append)?;
        stream
            .write_all(data)
            .map_err(|e| FsError::io(&self.path, e))?;
        stream.commit()
    }

    pub fn lock(&self) -> FsResult<()> {
        self.require_exists()?;
        let (resolved, ctx) = self.dispatch()?;
        self.require_capability(&resolved, Capabilities::LOCKING, "lock")?;
        resolved.provider().lock(&ctx)
    }

    pub fn unlock(&self) -> FsResult<()> {
        self.require_exists()?;
        let (resolved, ctx) = self.dispatch()?;
        self.require_capability(&resolved, Capabilities::LOCKING, "unlock")?;
        resolved.provider().unlock(&ctx)
    }

    // ------------------------------------------------------------------
    // Structure
    // ------------------------------------------------------------------

    /// Existing children, sorted by name.
    pub fn children(&self) -> FsResult<Vec<Resource>> {
        let tree = self.core.tree.read();
        if tree.node(self.node).is_none() {
            return Err(self.stale());
        }
        tree.existing_children(self.node)?
            .into_iter()
            .map(|(name, id)| -> FsResult<Resource> {
                Ok(Resource::new(
                    Arc::clone(&self.core),
                    self.path.child(&name)?,
                    id,
                ))
            })
            .collect()
    }

    /// Handle for a child, creating a phantom if it is unseen.
    pub fn child(&self, name: &str) -> FsResult<Resource> {
        let path = self.path.child(name)?;
        let tree = self.core.tree.upgradable_read();
        let node = tree.node(self.node).ok_or_else(|| self.stale())?;
        if let Some(&id) = node.children.get(name) {
            return Ok(Resource::new(Arc::clone(&self.core), path, id));
        }

        let mut tree = RwLockUpgradableReadGuard::upgrade(tree);
        let (id, _) = tree.resolve_path(&path)?;
        Ok(Resource::new(Arc::clone(&self.core), path, id))
    }

    /// Create an existing child.
    ///
    /// The tree change is flushed before the provider is told; if the
    /// provider fails, the child is removed again.
    pub fn create_child(&self, name: &str, node_type: NodeType, mode: CreateMode) -> FsResult<Resource> {
        let path = self.path.child(name)?;
        let child = {
            let mut tree = self.core.tree.write();
            let id = tree.add_child(
                self.node,
                name,
                node_type,
                None,
                mode == CreateMode::Local,
            )?;
            self.core.persist(&mut tree)?;
            Resource::new(Arc::clone(&self.core), path, id)
        };

        let notified = child.dispatch().and_then(|(resolved, ctx)| match mode {
            CreateMode::Local => resolved.provider().add_resource(&ctx),
            CreateMode::Remote => {
                child.require_capability(&resolved, Capabilities::REMOTE, "create remote")?;
                resolved.provider().create_remote(&ctx, node_type)
            }
        });

        if let Err(e) = notified {
            tracing::debug!(path = %child.path, error = %e, "rolling back child creation");
            child.rollback();
            return Err(e);
        }
        Ok(child)
    }

    fn rollback(&self) {
        let mut tree = self.core.tree.write();
        if tree.node(self.node).is_none() {
            return;
        }
        let result = tree
            .remove(self.node)
            .and_then(|_| self.core.persist(&mut tree));
        if let Err(e) = result {
            tracing::warn!(path = %self.path, error = %e, "rollback failed");
        }
    }

    /// Mark a phantom as existing (discovered remotely). Returns false if it
    /// already existed.
    pub fn mark_exists(&self, node_type: Option<NodeType>) -> FsResult<bool> {
        let mut tree = self.core.tree.write();
        if tree.node(self.node).is_none() {
            return Err(self.stale());
        }
        let changed = tree.mark_exists(self.node, node_type, false)?;
        if changed {
            self.core.persist(&mut tree)?;
        }
        Ok(changed)
    }

    /// Set or clear the explicit provider id.
    pub fn set_provider_id(&self, provider_id: Option<&str>) -> FsResult<()> {
        let mut tree = self.core.tree.write();
        if tree.node(self.node).is_none() {
            return Err(self.stale());
        }
        tree.set_assigned_provider(self.node, provider_id)?;
        self.core.persist(&mut tree)
    }

    /// Remove this resource and its subtree.
    pub fn remove(&self, mode: RemoveMode) -> FsResult<()> {
        // Resolve first; the node is gone afterwards.
        let dispatch = match self.dispatch() {
            Ok(pair) => Some(pair),
            Err(FsError::NotAccessible { .. }) => return Err(self.stale()),
            Err(e) => {
                tracing::debug!(path = %self.path, error = %e, "removing without provider notification");
                None
            }
        };

        let removed = {
            let mut tree = self.core.tree.write();
            let Some(node) = tree.node(self.node) else {
                return Err(self.stale());
            };
            let removed = RemovedResource {
                node_type: node.node_type(),
                remote_uri: node.remote_uri().map(str::to_string),
                properties: node.persistent_properties().clone(),
            };
            tree.remove(self.node)?;
            self.core.persist(&mut tree)?;
            removed
        };

        if mode == RemoveMode::Force {
            let purged = self.core.cache.remove_recursive(&self.path.cache_key())?;
            tracing::debug!(path = %self.path, purged, "purged cache entries");
        }

        if let Some((resolved, ctx)) = dispatch {
            resolved.provider().remove_resource(&ctx.with_removed(removed))?;
        }
        Ok(())
    }

    /// Delete on the remote side, then remove locally with a cache purge.
    pub fn delete_remote(&self) -> FsResult<()> {
        self.require_exists()?;
        let (resolved, ctx) = self.dispatch()?;
        self.require_capability(&resolved, Capabilities::REMOTE, "delete remote")?;
        resolved.provider().delete_remote(&ctx)?;
        self.remove(RemoveMode::Force)
    }

    // ------------------------------------------------------------------
    // Properties
    // ------------------------------------------------------------------

    /// `None` for phantoms and unset keys.
    pub fn persistent_property(&self, key: &str) -> FsResult<Option<String>> {
        let tree = self.core.tree.read();
        if tree.node(self.node).is_none() {
            return Err(self.stale());
        }
        Ok(tree.persistent_property(self.node, key))
    }

    pub fn persistent_properties(&self) -> FsResult<BTreeMap<String, String>> {
        self.with_node(|n| n.persistent_properties().clone())
    }

    pub fn set_persistent_property(&self, key: &str, value: &str) -> FsResult<()> {
        let mut tree = self.core.tree.write();
        tree.set_persistent_property(self.node, key, value)
            .map_err(|_| self.stale())?;
        self.core.persist(&mut tree)
    }

    pub fn remove_persistent_property(&self, key: &str) -> FsResult<Option<String>> {
        let mut tree = self.core.tree.write();
        let old = tree
            .remove_persistent_property(self.node, key)
            .map_err(|_| self.stale())?;
        if old.is_some() {
            self.core.persist(&mut tree)?;
        }
        Ok(old)
    }

    pub fn session_property(&self, key: &str) -> FsResult<Option<SessionValue>> {
        let tree = self.core.tree.read();
        if tree.node(self.node).is_none() {
            return Err(self.stale());
        }
        Ok(tree.session_property(self.node, key))
    }

    pub fn set_session_property<T: Any + Send + Sync>(&self, key: &str, value: T) -> FsResult<()> {
        let mut tree = self.core.tree.write();
        tree.set_session_property(self.node, key, Arc::new(value))
            .map_err(|_| self.stale())
    }

    pub fn remove_session_property(&self, key: &str) -> FsResult<Option<SessionValue>> {
        let mut tree = self.core.tree.write();
        tree.remove_session_property(self.node, key)
            .map_err(|_| self.stale())
    }

    /// Returns true if the session property `key` holds `true`.
    pub fn session_flag(&self, key: &str) -> bool {
        self.session_property(key)
            .ok()
            .flatten()
            .and_then(|value| value.downcast_ref::<bool>().copied())
            .unwrap_or(false)
    }

    pub fn set_session_flag(&self, key: &str, value: bool) -> FsResult<()> {
        self.set_session_property(key, value)
    }

    // ------------------------------------------------------------------
    // Remote URIs
    // ------------------------------------------------------------------

    fn check_uri_support(&self) -> FsResult<()> {
        if self.is_local_only()? {
            return Ok(());
        }
        let resolved = self.provider()?;
        self.require_capability(&resolved, Capabilities::REMOTE_URI, "remote uri")
    }

    pub fn remote_uri(&self) -> FsResult<Option<String>> {
        self.check_uri_support()?;
        self.with_node(|n| n.remote_uri().map(str::to_string))
    }

    /// Tag (or untag) the resource with a remote URI; updates the reverse index.
    pub fn set_remote_uri(&self, uri: Option<&str>) -> FsResult<()> {
        self.require_exists()?;
        self.check_uri_support()?;
        let mut tree = self.core.tree.write();
        tree.set_remote_uri(self.node, uri).map_err(|_| self.stale())?;
        self.core.persist(&mut tree)
    }
}
