//! The filesystem instance: tree, lock, providers, cache and metadata store.

use std::sync::Arc;

use fedfs_cache::{CacheService, DiskCache, MemoryCache};
use parking_lot::{RwLock, RwLockUpgradableReadGuard};

use crate::config::{CacheKind, FlushMode, FsConfig};
use crate::error::FsResult;
use crate::path::{PathHints, ResourcePath, parse_with_hints};
use crate::persist::{MemoryMetadataStore, MetadataStore, SqliteMetadataStore};
use crate::provider::{DEFAULT_PROVIDER_ID, DefaultProvider, ProviderFactory, ProviderRegistry};
use crate::store::Resource;
use crate::tree::ResourceTree;

/// State shared by a [`FederatedFs`] and every [`Resource`] handle.
pub(crate) struct FsCore {
    /// The process-wide tree lock. Never held across provider calls.
    pub(crate) tree: RwLock<ResourceTree>,
    pub(crate) registry: ProviderRegistry,
    pub(crate) cache: Arc<dyn CacheService>,
    pub(crate) default_provider: String,
    metadata: Box<dyn MetadataStore>,
    flush_mode: FlushMode,
}

impl FsCore {
    /// Flush after a mutation, honoring the flush mode.
    pub(crate) fn persist(&self, tree: &mut ResourceTree) -> FsResult<()> {
        match self.flush_mode {
            FlushMode::Immediate => self.save(tree),
            FlushMode::Delayed => Ok(()),
        }
    }

    /// Write the tree if it is dirty.
    pub(crate) fn save(&self, tree: &mut ResourceTree) -> FsResult<()> {
        if !tree.is_dirty() {
            return Ok(());
        }
        let snapshot = tree.snapshot();
        self.metadata.save(&snapshot)?;
        tree.clear_dirty();
        tracing::debug!(roots = snapshot.roots.len(), "flushed tree metadata");
        Ok(())
    }
}

impl Drop for FsCore {
    fn drop(&mut self) {
        let tree = self.tree.get_mut();
        if !tree.is_dirty() {
            return;
        }
        if let Err(e) = self.metadata.save(&tree.snapshot()) {
            tracing::warn!(error = %e, "failed to flush tree metadata on shutdown");
        }
    }
}

/// Builder for [`FederatedFs`].
pub struct FsBuilder {
    cache: Option<Arc<dyn CacheService>>,
    metadata: Option<Box<dyn MetadataStore>>,
    flush_mode: FlushMode,
    default_provider: String,
    factories: Vec<Box<dyn FnOnce(&ProviderRegistry)>>,
}

impl Default for FsBuilder {
    fn default() -> Self {
        Self {
            cache: None,
            metadata: None,
            flush_mode: FlushMode::default(),
            default_provider: DEFAULT_PROVIDER_ID.to_string(),
            factories: Vec::new(),
        }
    }
}

impl FsBuilder {
    /// Cache service; defaults to a [`MemoryCache`].
    pub fn cache(mut self, cache: Arc<dyn CacheService>) -> Self {
        self.cache = Some(cache);
        self
    }

    /// Metadata store; defaults to a [`MemoryMetadataStore`].
    pub fn metadata(mut self, store: impl MetadataStore + 'static) -> Self {
        self.metadata = Some(Box::new(store));
        self
    }

    pub fn flush_mode(mut self, mode: FlushMode) -> Self {
        self.flush_mode = mode;
        self
    }

    /// Provider id used where no ancestor assigns one.
    pub fn default_provider(mut self, id: impl Into<String>) -> Self {
        self.default_provider = id.into();
        self
    }

    pub fn provider(mut self, id: impl Into<String>, factory: impl ProviderFactory + 'static) -> Self {
        let id = id.into();
        self.factories
            .push(Box::new(move |registry: &ProviderRegistry| registry.register(id, factory)));
        self
    }

    /// Load the tree from the metadata store and assemble the filesystem.
    pub fn build(self) -> FsResult<FederatedFs> {
        let cache = self
            .cache
            .unwrap_or_else(|| Arc::new(MemoryCache::new()));
        let metadata = self
            .metadata
            .unwrap_or_else(|| Box::new(MemoryMetadataStore::new()));

        let tree = match metadata.load()? {
            Some(snapshot) => {
                tracing::debug!(roots = snapshot.roots.len(), "loaded tree metadata");
                ResourceTree::restore(&snapshot)
            }
            None => ResourceTree::new(),
        };

        let registry = ProviderRegistry::new(Arc::clone(&cache));
        registry.register(DEFAULT_PROVIDER_ID, DefaultProvider::factory());
        for register in self.factories {
            register(&registry);
        }

        Ok(FederatedFs {
            core: Arc::new(FsCore {
                tree: RwLock::new(tree),
                registry,
                cache,
                default_provider: self.default_provider,
                metadata,
                flush_mode: self.flush_mode,
            }),
        })
    }
}

/// A federated filesystem instance.
///
/// Cheap to clone; clones share the same tree.
#[derive(Clone)]
pub struct FederatedFs {
    core: Arc<FsCore>,
}

impl std::fmt::Debug for FederatedFs {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("FederatedFs")
            .field("tree", &*self.core.tree.read())
            .field("registry", &self.core.registry)
            .field("flush_mode", &self.core.flush_mode)
            .finish()
    }
}

impl FederatedFs {
    pub fn builder() -> FsBuilder {
        FsBuilder::default()
    }

    /// Memory cache, memory metadata, immediate flush.
    pub fn in_memory() -> FsResult<Self> {
        Self::builder().build()
    }

    /// Assemble a filesystem from configuration.
    pub fn open(config: &FsConfig) -> FsResult<Self> {
        let cache: Arc<dyn CacheService> = match config.cache.kind {
            CacheKind::Memory => Arc::new(MemoryCache::new()),
            CacheKind::Disk => Arc::new(DiskCache::open(config.cache.resolved_dir())?),
        };

        let builder = Self::builder()
            .cache(cache)
            .flush_mode(config.metadata.flush)
            .default_provider(config.default_provider.clone());
        let builder = match &config.metadata.path {
            Some(path) => builder.metadata(SqliteMetadataStore::open(path)?),
            None => builder.metadata(MemoryMetadataStore::new()),
        };
        builder.build()
    }

    /// Register (or replace) a provider factory.
    ///
    /// Cached resolutions are dropped, so nodes bound to an instance of a
    /// replaced factory resolve again against the new one.
    pub fn register_provider(&self, id: impl Into<String>, factory: impl ProviderFactory + 'static) {
        let mut tree = self.core.tree.write();
        self.core.registry.register(id, factory);
        tree.clear_bindings();
    }

    pub fn registry(&self) -> &ProviderRegistry {
        &self.core.registry
    }

    pub fn cache(&self) -> &Arc<dyn CacheService> {
        &self.core.cache
    }

    /// Handle for `uri`, a path with optional `;key=value` hints.
    ///
    /// Unseen segments become phantoms; hints apply only if this call
    /// created the addressed node.
    pub fn resource(&self, uri: &str) -> FsResult<Resource> {
        let (path, hints) = parse_with_hints(uri)?;
        self.resource_with_hints(path, &hints)
    }

    /// Handle for an already parsed path.
    pub fn resource_at(&self, path: &ResourcePath) -> FsResult<Resource> {
        self.resource_with_hints(path.clone(), &PathHints::default())
    }

    fn resource_with_hints(&self, path: ResourcePath, hints: &PathHints) -> FsResult<Resource> {
        let tree = self.core.tree.upgradable_read();
        if let Some(id) = tree.lookup(&path) {
            return Ok(Resource::new(Arc::clone(&self.core), path, id));
        }

        let mut tree = RwLockUpgradableReadGuard::upgrade(tree);
        let (id, created) = tree.resolve_path(&path)?;
        if created && !hints.is_empty() {
            tree.apply_hints(id, hints)?;
            self.core.persist(&mut tree)?;
        }
        Ok(Resource::new(Arc::clone(&self.core), path, id))
    }

    /// Create a root (or materialize a phantom one).
    pub fn add_root(&self, name: &str, provider_id: Option<&str>) -> FsResult<Resource> {
        let mut tree = self.core.tree.write();
        let id = tree.add_root(name, provider_id)?;
        self.core.persist(&mut tree)?;
        let path = ResourcePath::workspace().child(name)?;
        Ok(Resource::new(Arc::clone(&self.core), path, id))
    }

    /// Existing roots, in creation order.
    pub fn roots(&self) -> Vec<Resource> {
        let tree = self.core.tree.read();
        tree.roots()
            .into_iter()
            .filter_map(|name| {
                let path = ResourcePath::workspace().child(&name).ok()?;
                let id = tree.lookup(&path)?;
                Some(Resource::new(Arc::clone(&self.core), path, id))
            })
            .collect()
    }

    /// Paths tagged with remote `uri`, optionally only those under `prefix`.
    pub fn paths_for_uri(&self, uri: &str, prefix: Option<&ResourcePath>) -> Vec<ResourcePath> {
        let tree = self.core.tree.upgradable_read();
        if let Some(paths) = tree.cached_paths_for_uri(uri, prefix) {
            return paths;
        }
        let mut tree = RwLockUpgradableReadGuard::upgrade(tree);
        tree.paths_for_uri(uri, prefix)
    }

    /// Save the tree now if anything changed, regardless of flush mode.
    pub fn flush(&self) -> FsResult<()> {
        let mut tree = self.core.tree.write();
        self.core.save(&mut tree)
    }

    /// Returns true if there are unsaved metadata changes.
    pub fn is_dirty(&self) -> bool {
        self.core.tree.read().is_dirty()
    }
}
