//! The cache service contract shared by every backend.
//!
//! Values are addressed by `/`-separated keys (normally a resource path).
//! Readers pin the value they opened: replacing, appending to or removing a
//! key never changes bytes an open [`CacheReader`] is still consuming.

use std::io::{self, Read, Write};
use std::time::SystemTime;

use crate::error::{CacheError, CacheResult};

/// Callback fired after a write has been durably committed.
pub type CommitCallback = Box<dyn FnOnce(CommitEvent) + Send>;

/// Summary of a committed write.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CommitInfo {
    /// Normalized key that was written.
    pub key: String,
    /// Time the new value became visible.
    pub timestamp: SystemTime,
    /// Whether the write appended to the previous value.
    pub append: bool,
    /// Bytes written through this writer (not the total value length).
    pub written: u64,
}

/// Delivered to a [`CommitCallback`] once the new value is in place.
pub struct CommitEvent {
    /// What was committed.
    pub info: CommitInfo,
    /// Reader over the complete new value.
    pub content: CacheReader,
}

impl std::fmt::Debug for CommitEvent {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CommitEvent")
            .field("info", &self.info)
            .field("len", &self.content.len())
            .finish()
    }
}

/// Stream over one cached value.
pub struct CacheReader {
    inner: Box<dyn Read + Send>,
    len: u64,
}

impl CacheReader {
    pub(crate) fn new(inner: Box<dyn Read + Send>, len: u64) -> Self {
        Self { inner, len }
    }

    /// Length of the value when the reader was opened.
    pub fn len(&self) -> u64 {
        self.len
    }

    /// Returns true if the value is empty.
    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    /// Read the remaining bytes into a vector.
    pub fn read_to_vec(mut self) -> io::Result<Vec<u8>> {
        let mut buf = Vec::with_capacity(self.len as usize);
        self.inner.read_to_end(&mut buf)?;
        Ok(buf)
    }
}

impl Read for CacheReader {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        self.inner.read(buf)
    }
}

impl std::fmt::Debug for CacheReader {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CacheReader").field("len", &self.len).finish()
    }
}

/// Backend half of a [`CacheWriter`]: buffers bytes until commit.
///
/// Dropping a pending write without committing must discard it.
pub(crate) trait PendingWrite: Write + Send {
    /// Make the buffered bytes the key's new value and return a reader over it.
    fn commit(self: Box<Self>) -> CacheResult<(CacheReader, SystemTime)>;
}

/// Write stream returned by [`CacheService::wrap_write`].
///
/// Nothing becomes visible until [`CacheWriter::commit`]. Dropping the
/// writer without committing discards everything written.
pub struct CacheWriter {
    key: String,
    append: bool,
    written: u64,
    pending: Option<Box<dyn PendingWrite>>,
    on_commit: Option<CommitCallback>,
}

impl CacheWriter {
    pub(crate) fn new(
        key: String,
        append: bool,
        pending: Box<dyn PendingWrite>,
        on_commit: Option<CommitCallback>,
    ) -> Self {
        Self {
            key,
            append,
            written: 0,
            pending: Some(pending),
            on_commit,
        }
    }

    /// Key this writer targets.
    pub fn key(&self) -> &str {
        &self.key
    }

    /// Commit the write, then run the commit callback (if any).
    pub fn commit(mut self) -> CacheResult<CommitInfo> {
        let pending = self
            .pending
            .take()
            .ok_or_else(|| CacheError::index("writer already committed"))?;
        let (content, timestamp) = pending.commit()?;

        let info = CommitInfo {
            key: std::mem::take(&mut self.key),
            timestamp,
            append: self.append,
            written: self.written,
        };

        if let Some(callback) = self.on_commit.take() {
            callback(CommitEvent {
                info: info.clone(),
                content,
            });
        }

        Ok(info)
    }
}

impl Write for CacheWriter {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        let pending = self
            .pending
            .as_mut()
            .ok_or_else(|| io::Error::other("writer already committed"))?;
        let n = pending.write(buf)?;
        self.written += n as u64;
        Ok(n)
    }

    fn flush(&mut self) -> io::Result<()> {
        match self.pending.as_mut() {
            Some(pending) => pending.flush(),
            None => Ok(()),
        }
    }
}

impl std::fmt::Debug for CacheWriter {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CacheWriter")
            .field("key", &self.key)
            .field("append", &self.append)
            .field("written", &self.written)
            .finish()
    }
}

/// Key-addressed byte store.
///
/// Implementations guard their own key space; callers never need an
/// external lock. All methods are blocking.
pub trait CacheService: Send + Sync {
    /// Open a reader over the current value of `key`.
    fn get(&self, key: &str) -> CacheResult<CacheReader>;

    /// Returns true if `key` currently holds a value.
    ///
    /// A removed key reports `false` immediately, even while readers keep
    /// its storage alive.
    fn has(&self, key: &str) -> bool;

    /// Remove `key`. Removing a missing key is not an error.
    fn remove(&self, key: &str) -> CacheResult<()>;

    /// Remove `prefix` and every key below it. Returns how many keys were removed.
    ///
    /// An empty prefix removes everything.
    fn remove_recursive(&self, prefix: &str) -> CacheResult<usize>;

    /// Open a writer for `key`; `on_commit` runs after the commit is durable.
    fn wrap_write(
        &self,
        key: &str,
        append: bool,
        on_commit: Option<CommitCallback>,
    ) -> CacheResult<CacheWriter>;

    /// Store the whole of `data` under `key` only if the key is still empty
    /// when the value lands.
    ///
    /// Returns `None` (and discards `data`) when some other write got there
    /// first. The presence check and the install happen under one lock.
    fn put_if_absent(&self, key: &str, data: &mut dyn Read) -> CacheResult<Option<CommitInfo>>;

    /// All keys currently holding a value, in sorted order.
    fn keys(&self) -> Vec<String>;

    /// Number of replaced or removed values still held open by readers.
    fn pending_releases(&self) -> usize;

    /// Store the whole of `data` under `key`, replacing or appending.
    fn put(&self, key: &str, data: &mut dyn Read, append: bool) -> CacheResult<CommitInfo> {
        let mut writer = self.wrap_write(key, append, None)?;
        io::copy(data, &mut writer)?;
        writer.commit()
    }

    /// Convenience wrapper around [`CacheService::put`] for in-memory bytes.
    fn put_bytes(&self, key: &str, data: &[u8], append: bool) -> CacheResult<CommitInfo> {
        let mut reader = data;
        self.put(key, &mut reader, append)
    }
}

/// Normalize a key: drop empty segments and surrounding slashes.
pub(crate) fn normalize_key(key: &str) -> CacheResult<String> {
    let normalized = normalize_prefix(key);
    if normalized.is_empty() {
        return Err(CacheError::invalid_key(key));
    }
    Ok(normalized)
}

/// Like [`normalize_key`] but an empty result is allowed (it means "everything").
pub(crate) fn normalize_prefix(key: &str) -> String {
    key.split('/')
        .filter(|s| !s.is_empty())
        .collect::<Vec<_>>()
        .join("/")
}

/// Returns true if `key` is `prefix` itself or lies below it.
pub(crate) fn is_under(key: &str, prefix: &str) -> bool {
    prefix.is_empty()
        || key == prefix
        || (key.len() > prefix.len()
            && key.starts_with(prefix)
            && key.as_bytes()[prefix.len()] == b'/')
}
