//! In-memory cache backend.
//!
//! Used for tests and for deployments that do not need cached content to
//! survive a restart. Values are shared with readers through `Arc`, so an
//! open reader keeps its snapshot alive after the key is replaced.

use std::collections::BTreeMap;
use std::io::{self, Read, Write};
use std::sync::{Arc, Weak};
use std::time::SystemTime;

use parking_lot::Mutex;

use crate::error::{CacheError, CacheResult};
use crate::service::{
    is_under, normalize_key, normalize_prefix, CacheReader, CacheService, CacheWriter,
    CommitCallback, CommitInfo, PendingWrite,
};

type Value = Arc<Vec<u8>>;

#[derive(Debug, Default)]
struct MemoryInner {
    entries: Mutex<BTreeMap<String, Value>>,
    /// Values dropped from the map while a reader still held them.
    retired: Mutex<Vec<Weak<Vec<u8>>>>,
}

impl MemoryInner {
    fn retire(&self, old: Value) {
        if Arc::strong_count(&old) > 1 {
            self.retired.lock().push(Arc::downgrade(&old));
        }
    }
}

/// In-memory cache backend.
///
/// Thread-safe via an internal mutex. All data is lost when dropped.
#[derive(Debug, Clone, Default)]
pub struct MemoryCache {
    inner: Arc<MemoryInner>,
}

impl MemoryCache {
    /// Create an empty cache.
    pub fn new() -> Self {
        Self::default()
    }

    fn reader(value: Value) -> CacheReader {
        let len = value.len() as u64;
        CacheReader::new(Box::new(SharedBytes { value, pos: 0 }), len)
    }
}

/// Read cursor over a shared value.
struct SharedBytes {
    value: Value,
    pos: usize,
}

impl Read for SharedBytes {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        let remaining = &self.value[self.pos.min(self.value.len())..];
        let n = remaining.len().min(buf.len());
        buf[..n].copy_from_slice(&remaining[..n]);
        self.pos += n;
        Ok(n)
    }
}

struct MemoryPending {
    inner: Arc<MemoryInner>,
    key: String,
    append: bool,
    buf: Vec<u8>,
}

impl Write for MemoryPending {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        self.buf.extend_from_slice(buf);
        Ok(buf.len())
    }

    fn flush(&mut self) -> io::Result<()> {
        Ok(())
    }
}

impl PendingWrite for MemoryPending {
    fn commit(self: Box<Self>) -> CacheResult<(CacheReader, SystemTime)> {
        let MemoryPending {
            inner,
            key,
            append,
            buf,
        } = *self;

        let mut entries = inner.entries.lock();
        let appended = if append {
            entries.get_mut(&key).map(|current| {
                // Copy-on-write when a reader still holds the current value.
                if Arc::strong_count(current) > 1 {
                    inner.retire(Arc::clone(current));
                }
                Arc::make_mut(current).extend_from_slice(&buf);
                Arc::clone(current)
            })
        } else {
            None
        };

        let value = match appended {
            Some(value) => value,
            None => {
                let value = Arc::new(buf);
                if let Some(old) = entries.insert(key, Arc::clone(&value)) {
                    inner.retire(old);
                }
                value
            }
        };

        Ok((MemoryCache::reader(value), SystemTime::now()))
    }
}

impl CacheService for MemoryCache {
    fn get(&self, key: &str) -> CacheResult<CacheReader> {
        let key = normalize_key(key)?;
        let entries = self.inner.entries.lock();
        entries
            .get(&key)
            .map(|value| Self::reader(Arc::clone(value)))
            .ok_or_else(|| CacheError::not_found(key))
    }

    fn has(&self, key: &str) -> bool {
        match normalize_key(key) {
            Ok(key) => self.inner.entries.lock().contains_key(&key),
            Err(_) => false,
        }
    }

    fn remove(&self, key: &str) -> CacheResult<()> {
        let key = normalize_key(key)?;
        let removed = self.inner.entries.lock().remove(&key);
        if let Some(old) = removed {
            self.inner.retire(old);
        }
        Ok(())
    }

    fn remove_recursive(&self, prefix: &str) -> CacheResult<usize> {
        let prefix = normalize_prefix(prefix);
        let mut entries = self.inner.entries.lock();
        let doomed: Vec<String> = entries
            .range(prefix.clone()..)
            .map(|(k, _)| k)
            .take_while(|k| k.starts_with(&prefix))
            .filter(|k| is_under(k, &prefix))
            .cloned()
            .collect();

        for key in &doomed {
            if let Some(old) = entries.remove(key) {
                self.inner.retire(old);
            }
        }
        Ok(doomed.len())
    }

    fn wrap_write(
        &self,
        key: &str,
        append: bool,
        on_commit: Option<CommitCallback>,
    ) -> CacheResult<CacheWriter> {
        let key = normalize_key(key)?;
        let pending = MemoryPending {
            inner: Arc::clone(&self.inner),
            key: key.clone(),
            append,
            buf: Vec::new(),
        };
        Ok(CacheWriter::new(key, append, Box::new(pending), on_commit))
    }

    fn put_if_absent(&self, key: &str, data: &mut dyn Read) -> CacheResult<Option<CommitInfo>> {
        let key = normalize_key(key)?;
        let mut buf = Vec::new();
        data.read_to_end(&mut buf)?;
        let written = buf.len() as u64;

        let mut entries = self.inner.entries.lock();
        if entries.contains_key(&key) {
            return Ok(None);
        }
        entries.insert(key.clone(), Arc::new(buf));
        Ok(Some(CommitInfo {
            key,
            timestamp: SystemTime::now(),
            append: false,
            written,
        }))
    }

    fn keys(&self) -> Vec<String> {
        self.inner.entries.lock().keys().cloned().collect()
    }

    fn pending_releases(&self) -> usize {
        let mut retired = self.inner.retired.lock();
        retired.retain(|weak| weak.strong_count() > 0);
        retired.len()
    }
}
