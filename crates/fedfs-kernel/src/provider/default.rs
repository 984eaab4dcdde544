//! Provider used when no ancestor assigns one.

use std::io;
use std::sync::Arc;

use fedfs_cache::{CacheError, CacheService, CommitEvent};

use super::caching::{CachedWrite, stamp_timestamp};
use super::{
    Capabilities, ContentProvider, ProviderContext, ProviderEnv, ProviderFactory,
    ProviderMetadata, ReadStream, TIMESTAMP_PROPERTY, WriteStream, decode_timestamp,
};
use crate::error::FsResult;

/// Id the default provider is registered under.
pub const DEFAULT_PROVIDER_ID: &str = "default";

/// Serves content straight from the cache service.
///
/// Nothing is remote: never-written files read as empty and every resource
/// is writable.
pub struct DefaultProvider {
    id: String,
    cache: Arc<dyn CacheService>,
}

impl DefaultProvider {
    pub fn new(cache: Arc<dyn CacheService>) -> Self {
        Self::with_id(DEFAULT_PROVIDER_ID, cache)
    }

    pub fn with_id(id: impl Into<String>, cache: Arc<dyn CacheService>) -> Self {
        Self {
            id: id.into(),
            cache,
        }
    }

    /// Global-scope factory.
    pub fn factory() -> impl ProviderFactory {
        |env: &ProviderEnv| -> FsResult<Arc<dyn ContentProvider>> {
            Ok(Arc::new(DefaultProvider::with_id(
                env.provider_id.clone(),
                Arc::clone(&env.cache),
            )))
        }
    }
}

impl ContentProvider for DefaultProvider {
    fn id(&self) -> &str {
        &self.id
    }

    fn capabilities(&self) -> Capabilities {
        Capabilities::REMOTE_URI
    }

    fn open_read(&self, ctx: &ProviderContext) -> FsResult<ReadStream> {
        match self.cache.get(&ctx.cache_key()) {
            Ok(reader) => Ok(Box::new(reader)),
            Err(CacheError::NotFound(_)) => Ok(Box::new(io::empty())),
            Err(e) => Err(e.into()),
        }
    }

    fn open_write(&self, ctx: &ProviderContext, append: bool) -> FsResult<WriteStream> {
        let resource = ctx.resource().clone();
        let writer = self.cache.wrap_write(
            &ctx.cache_key(),
            append,
            Some(Box::new(move |event: CommitEvent| {
                stamp_timestamp(&resource, event.info.timestamp);
            })),
        )?;
        Ok(Box::new(CachedWrite::new(writer, None)))
    }

    fn fetch_metadata(&self, ctx: &ProviderContext) -> FsResult<ProviderMetadata> {
        let timestamp = ctx
            .resource()
            .persistent_property(TIMESTAMP_PROPERTY)?
            .as_deref()
            .and_then(decode_timestamp);
        Ok(ProviderMetadata {
            read_only: false,
            timestamp,
            ..ProviderMetadata::default()
        })
    }
}
