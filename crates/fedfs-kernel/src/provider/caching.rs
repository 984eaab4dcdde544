//! Reusable provider that backs a remote source with the cache service.
//!
//! - The first read of a resource fetches it from the remote once and
//!   stores it; later reads are served from the cache alone.
//! - Writes land in the cache. With the [`WRITE_THROUGH_FLAG`] session
//!   flag set, the commit also pushes the new content upstream; a failed
//!   push is reported in the [`WriteOutcome`] and the cache keeps the write.
//! - Local-only resources never touch the remote.

use std::io::{self, Read, Write};
use std::sync::Arc;
use std::time::SystemTime;

use dashmap::DashMap;
use fedfs_cache::{CacheError, CacheService, CacheWriter, CommitCallback, CommitEvent};
use parking_lot::Mutex;

use super::{
    Capabilities, ContentProvider, ProviderContext, ProviderMetadata, ReadStream, ResourceWrite,
    TIMESTAMP_PROPERTY, UpstreamStatus, WriteOutcome, WriteStream, decode_timestamp,
    encode_timestamp,
};
use crate::error::FsResult;
use crate::path::ResourcePath;
use crate::store::Resource;

/// Session flag that turns on write-through for writes opened while set.
pub const WRITE_THROUGH_FLAG: &str = "fedfs.write-through";

/// Content fetched from a remote source.
pub struct RemoteContent {
    pub reader: Box<dyn Read + Send>,
    /// Remote modification time of this content.
    pub timestamp: SystemTime,
}

impl RemoteContent {
    pub fn from_bytes(data: impl Into<Vec<u8>>, timestamp: SystemTime) -> Self {
        Self {
            reader: Box::new(io::Cursor::new(data.into())),
            timestamp,
        }
    }
}

impl std::fmt::Debug for RemoteContent {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RemoteContent")
            .field("timestamp", &self.timestamp)
            .finish_non_exhaustive()
    }
}

/// The remote half a concrete provider supplies.
pub trait RemoteSource: Send + Sync {
    fn fetch(&self, path: &ResourcePath) -> FsResult<RemoteContent>;

    /// Push the complete new content of `path` upstream.
    ///
    /// `append` tells how the content was produced locally.
    fn push(&self, path: &ResourcePath, content: &mut dyn Read, append: bool) -> FsResult<()>;

    fn is_read_only(&self, _path: &ResourcePath) -> FsResult<bool> {
        Ok(false)
    }

    fn exists_remotely(&self, _path: &ResourcePath) -> FsResult<bool> {
        Ok(true)
    }

    fn content_type(&self, _path: &ResourcePath) -> Option<String> {
        None
    }
}

impl<T: RemoteSource + ?Sized> RemoteSource for Arc<T> {
    fn fetch(&self, path: &ResourcePath) -> FsResult<RemoteContent> {
        (**self).fetch(path)
    }

    fn push(&self, path: &ResourcePath, content: &mut dyn Read, append: bool) -> FsResult<()> {
        (**self).push(path, content, append)
    }

    fn is_read_only(&self, path: &ResourcePath) -> FsResult<bool> {
        (**self).is_read_only(path)
    }

    fn exists_remotely(&self, path: &ResourcePath) -> FsResult<bool> {
        (**self).exists_remotely(path)
    }

    fn content_type(&self, path: &ResourcePath) -> Option<String> {
        (**self).content_type(path)
    }
}

/// [`ContentProvider`] over a [`RemoteSource`] with a local cache.
pub struct CachingProvider<R> {
    id: String,
    cache: Arc<dyn CacheService>,
    remote: Arc<R>,
    fetch_gates: DashMap<String, Arc<Mutex<()>>>,
}

impl<R: RemoteSource + 'static> CachingProvider<R> {
    pub fn new(id: impl Into<String>, cache: Arc<dyn CacheService>, remote: R) -> Self {
        Self {
            id: id.into(),
            cache,
            remote: Arc::new(remote),
            fetch_gates: DashMap::new(),
        }
    }

    pub fn remote(&self) -> &R {
        &self.remote
    }

    /// Fetch the resource into the cache unless it is already there.
    fn ensure_cached(&self, ctx: &ProviderContext) -> FsResult<()> {
        if ctx.local_only() {
            return Ok(());
        }
        let key = ctx.cache_key();
        if self.cache.has(&key) {
            return Ok(());
        }

        // One fetch per key; concurrent readers wait and then hit the cache.
        let gate = Arc::clone(&self.fetch_gates.entry(key.clone()).or_default());
        let result = {
            let _guard = gate.lock();
            if self.cache.has(&key) {
                Ok(())
            } else {
                self.fill(ctx, &key)
            }
        };
        self.fetch_gates
            .remove_if(&key, |_, held| Arc::strong_count(held) <= 2);
        result
    }

    /// Install remote content unless a local write committed meanwhile.
    fn fill(&self, ctx: &ProviderContext, key: &str) -> FsResult<()> {
        let RemoteContent {
            mut reader,
            timestamp,
        } = self.remote.fetch(ctx.path())?;
        match self.cache.put_if_absent(key, &mut reader)? {
            Some(info) => {
                tracing::debug!(
                    path = %ctx.path(),
                    provider = %self.id,
                    bytes = info.written,
                    "filled cache from remote"
                );
                stamp_timestamp(ctx.resource(), timestamp);
            }
            None => tracing::debug!(
                path = %ctx.path(),
                provider = %self.id,
                "local write landed during fetch; remote content dropped"
            ),
        }
        Ok(())
    }

    fn stored_timestamp(ctx: &ProviderContext) -> FsResult<Option<SystemTime>> {
        Ok(ctx
            .resource()
            .persistent_property(TIMESTAMP_PROPERTY)?
            .as_deref()
            .and_then(decode_timestamp))
    }
}

impl<R: RemoteSource + 'static> ContentProvider for CachingProvider<R> {
    fn id(&self) -> &str {
        &self.id
    }

    fn capabilities(&self) -> Capabilities {
        Capabilities::REMOTE_URI
    }

    fn open_read(&self, ctx: &ProviderContext) -> FsResult<ReadStream> {
        self.ensure_cached(ctx)?;
        match self.cache.get(&ctx.cache_key()) {
            Ok(reader) => Ok(Box::new(reader)),
            Err(CacheError::NotFound(_)) => Ok(Box::new(io::empty())),
            Err(e) => Err(e.into()),
        }
    }

    fn open_write(&self, ctx: &ProviderContext, append: bool) -> FsResult<WriteStream> {
        if append {
            self.ensure_cached(ctx)?;
        }

        let write_through = !ctx.local_only() && ctx.resource().session_flag(WRITE_THROUGH_FLAG);
        let status = write_through.then(|| Arc::new(Mutex::new(None)));

        let resource = ctx.resource().clone();
        let remote = Arc::clone(&self.remote);
        let provider_id = self.id.clone();
        let slot = status.clone();
        let on_commit: CommitCallback = Box::new(move |event: CommitEvent| {
            stamp_timestamp(&resource, event.info.timestamp);
            let Some(slot) = slot else {
                return;
            };
            let mut content = event.content;
            let outcome = match remote.push(resource.path(), &mut content, event.info.append) {
                Ok(()) => UpstreamStatus::Pushed,
                Err(e) => {
                    tracing::warn!(
                        path = %resource.path(),
                        provider = %provider_id,
                        error = %e,
                        "write-through push failed; cached content kept"
                    );
                    UpstreamStatus::Failed(e.to_string())
                }
            };
            *slot.lock() = Some(outcome);
        });

        let writer = self
            .cache
            .wrap_write(&ctx.cache_key(), append, Some(on_commit))?;
        Ok(Box::new(CachedWrite::new(writer, status)))
    }

    fn fetch_metadata(&self, ctx: &ProviderContext) -> FsResult<ProviderMetadata> {
        if ctx.local_only() {
            return Ok(ProviderMetadata {
                timestamp: Self::stored_timestamp(ctx)?,
                ..ProviderMetadata::default()
            });
        }

        let path = ctx.path();
        let read_only = self.remote.is_read_only(path)?;
        let mut timestamp = Self::stored_timestamp(ctx)?;
        if timestamp.is_none() && read_only {
            self.ensure_cached(ctx)?;
            timestamp = Self::stored_timestamp(ctx)?;
        }

        Ok(ProviderMetadata {
            read_only,
            timestamp,
            exists_remotely: self.remote.exists_remotely(path)?,
            locked: false,
            content_type: self.remote.content_type(path),
        })
    }
}

/// Cache-backed [`ResourceWrite`].
pub(crate) struct CachedWrite {
    writer: CacheWriter,
    upstream: Option<Arc<Mutex<Option<UpstreamStatus>>>>,
}

impl CachedWrite {
    pub(crate) fn new(
        writer: CacheWriter,
        upstream: Option<Arc<Mutex<Option<UpstreamStatus>>>>,
    ) -> Self {
        Self { writer, upstream }
    }
}

impl Write for CachedWrite {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        self.writer.write(buf)
    }

    fn flush(&mut self) -> io::Result<()> {
        self.writer.flush()
    }
}

impl ResourceWrite for CachedWrite {
    fn commit(self: Box<Self>) -> FsResult<WriteOutcome> {
        let CachedWrite { writer, upstream } = *self;
        let info = writer.commit()?;
        let upstream = upstream
            .and_then(|slot| slot.lock().take())
            .unwrap_or_default();
        Ok(WriteOutcome {
            timestamp: info.timestamp,
            upstream,
        })
    }
}

/// Record a content timestamp on `resource`; failures are only logged.
pub(crate) fn stamp_timestamp(resource: &Resource, timestamp: SystemTime) {
    if let Err(e) = resource.set_persistent_property(TIMESTAMP_PROPERTY, &encode_timestamp(timestamp)) {
        tracing::warn!(path = %resource.path(), error = %e, "could not record timestamp");
    }
}
