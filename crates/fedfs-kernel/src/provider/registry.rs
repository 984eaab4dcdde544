//! Provider factories and the live instance table.

use std::collections::HashMap;
use std::sync::Arc;

use dashmap::DashMap;
use fedfs_cache::CacheService;
use parking_lot::RwLock;

use super::ContentProvider;
use crate::error::{FsError, FsResult};
use crate::path::ResourcePath;

/// How instances of one provider id are shared.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ProviderScope {
    /// One instance per provider id.
    #[default]
    Global,
    /// One instance per provider id and root-store path.
    PerRoot,
}

/// Everything a factory gets to build an instance.
#[derive(Clone)]
pub struct ProviderEnv {
    pub provider_id: String,
    /// Root-store path; the workspace path for global providers.
    pub root: ResourcePath,
    pub cache: Arc<dyn CacheService>,
}

impl std::fmt::Debug for ProviderEnv {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ProviderEnv")
            .field("provider_id", &self.provider_id)
            .field("root", &self.root)
            .finish_non_exhaustive()
    }
}

/// Builds provider instances for one provider id.
pub trait ProviderFactory: Send + Sync {
    fn scope(&self) -> ProviderScope {
        ProviderScope::Global
    }

    fn create(&self, env: &ProviderEnv) -> FsResult<Arc<dyn ContentProvider>>;
}

impl<F> ProviderFactory for F
where
    F: Fn(&ProviderEnv) -> FsResult<Arc<dyn ContentProvider>> + Send + Sync,
{
    fn create(&self, env: &ProviderEnv) -> FsResult<Arc<dyn ContentProvider>> {
        self(env)
    }
}

/// Wraps a factory so each root store gets its own instance.
pub struct PerRoot<F>(pub F);

impl<F: ProviderFactory> ProviderFactory for PerRoot<F> {
    fn scope(&self) -> ProviderScope {
        ProviderScope::PerRoot
    }

    fn create(&self, env: &ProviderEnv) -> FsResult<Arc<dyn ContentProvider>> {
        self.0.create(env)
    }
}

type InstanceKey = (String, String);

/// Registered factories plus the instances created from them.
pub struct ProviderRegistry {
    factories: RwLock<HashMap<String, Arc<dyn ProviderFactory>>>,
    instances: DashMap<InstanceKey, Arc<dyn ContentProvider>>,
    cache: Arc<dyn CacheService>,
}

impl std::fmt::Debug for ProviderRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ProviderRegistry")
            .field("factories", &self.ids())
            .field("instances", &self.instances.len())
            .finish()
    }
}

impl ProviderRegistry {
    pub fn new(cache: Arc<dyn CacheService>) -> Self {
        Self {
            factories: RwLock::new(HashMap::new()),
            instances: DashMap::new(),
            cache,
        }
    }

    /// Register (or replace) the factory for `id`.
    ///
    /// Instances created by a replaced factory are dropped.
    pub fn register(&self, id: impl Into<String>, factory: impl ProviderFactory + 'static) {
        let id = id.into();
        let replaced = self
            .factories
            .write()
            .insert(id.clone(), Arc::new(factory))
            .is_some();
        if replaced {
            self.instances.retain(|(instance_id, _), _| instance_id != &id);
        }
        tracing::debug!(provider = %id, replaced, "registered provider factory");
    }

    pub fn is_registered(&self, id: &str) -> bool {
        self.factories.read().contains_key(id)
    }

    /// Registered provider ids, sorted.
    pub fn ids(&self) -> Vec<String> {
        let mut ids: Vec<String> = self.factories.read().keys().cloned().collect();
        ids.sort();
        ids
    }

    /// Number of live instances.
    pub fn instance_count(&self) -> usize {
        self.instances.len()
    }

    /// Get or create the instance of `id` for the root store at `root`.
    ///
    /// `for_path` is only used to report errors.
    pub fn instantiate(
        &self,
        id: &str,
        root: &ResourcePath,
        for_path: &ResourcePath,
    ) -> FsResult<Arc<dyn ContentProvider>> {
        let factory = self
            .factories
            .read()
            .get(id)
            .cloned()
            .ok_or_else(|| FsError::unknown_provider(id, for_path))?;

        let root = match factory.scope() {
            ProviderScope::Global => ResourcePath::workspace(),
            ProviderScope::PerRoot => root.clone(),
        };
        let key = (id.to_string(), root.to_string());

        if let Some(existing) = self.instances.get(&key) {
            return Ok(Arc::clone(existing.value()));
        }

        // Factories run without any registry lock held; a losing racer's
        // instance is discarded.
        let env = ProviderEnv {
            provider_id: id.to_string(),
            root: root.clone(),
            cache: Arc::clone(&self.cache),
        };
        let created = factory.create(&env)?;
        tracing::debug!(provider = %id, root = %root, "instantiated provider");

        let instance = Arc::clone(self.instances.entry(key).or_insert(created).value());
        Ok(instance)
    }
}
