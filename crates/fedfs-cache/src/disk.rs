//! Disk-backed cache backend.
//!
//! # Layout
//!
//! ```text
//! <root>/index.json              key -> blob file name
//! <root>/blobs/<hash>-<gen>.blob one file per value generation
//! <root>/pending/<gen>.tmp       uncommitted writes
//! ```
//!
//! Blob names come from the BLAKE3 hash of the key plus a generation
//! counter, so a replacement never overwrites a file a reader may still
//! have open. The replaced slot is retired and its file is deleted when
//! the last reader drops it.

use std::collections::BTreeMap;
use std::fs::{self, File, OpenOptions};
use std::io::{self, Read, Write};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Weak};
use std::time::SystemTime;

use parking_lot::Mutex;
use serde::{Deserialize, Serialize};

use crate::error::{CacheError, CacheResult};
use crate::service::{
    is_under, normalize_key, normalize_prefix, CacheReader, CacheService, CacheWriter,
    CommitCallback, CommitInfo, PendingWrite,
};

const INDEX_FILE: &str = "index.json";
const BLOB_DIR: &str = "blobs";
const PENDING_DIR: &str = "pending";
const INDEX_VERSION: u32 = 1;

/// One generation of one key's value on disk.
#[derive(Debug)]
struct BlobSlot {
    file: PathBuf,
    retired: AtomicBool,
}

impl BlobSlot {
    fn new(file: PathBuf) -> Self {
        Self {
            file,
            retired: AtomicBool::new(false),
        }
    }

    fn file_name(&self) -> String {
        self.file
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_default()
    }
}

impl Drop for BlobSlot {
    fn drop(&mut self) {
        if !self.retired.load(Ordering::SeqCst) {
            return;
        }
        match fs::remove_file(&self.file) {
            Ok(()) => tracing::debug!(file = %self.file.display(), "released cache blob"),
            Err(e) if e.kind() == io::ErrorKind::NotFound => {}
            Err(e) => tracing::warn!(
                file = %self.file.display(),
                error = %e,
                "failed to delete retired cache blob"
            ),
        }
    }
}

/// Serialized form of `index.json`.
#[derive(Debug, Default, Serialize, Deserialize)]
struct IndexFile {
    version: u32,
    entries: BTreeMap<String, String>,
}

#[derive(Debug, Default)]
struct DiskState {
    index: BTreeMap<String, Arc<BlobSlot>>,
    retired: Vec<Weak<BlobSlot>>,
}

impl DiskState {
    /// Index entries as stored in `index.json`.
    fn entries(&self) -> BTreeMap<String, String> {
        self.index
            .iter()
            .map(|(k, slot)| (k.clone(), slot.file_name()))
            .collect()
    }

    /// Drop the map's reference to a slot; deletion waits for open readers.
    fn retire(&mut self, slot: Arc<BlobSlot>) {
        slot.retired.store(true, Ordering::SeqCst);
        if Arc::strong_count(&slot) > 1 {
            tracing::debug!(file = %slot.file.display(), "cache blob still open, deferring delete");
            self.retired.push(Arc::downgrade(&slot));
        }
    }
}

#[derive(Debug)]
struct DiskInner {
    root: PathBuf,
    state: Mutex<DiskState>,
    next_generation: AtomicU64,
}

impl DiskInner {
    fn blob_dir(&self) -> PathBuf {
        self.root.join(BLOB_DIR)
    }

    fn pending_dir(&self) -> PathBuf {
        self.root.join(PENDING_DIR)
    }

    fn next_generation(&self) -> u64 {
        self.next_generation.fetch_add(1, Ordering::SeqCst)
    }

    fn blob_path(&self, key: &str, generation: u64) -> PathBuf {
        let hash = blake3::hash(key.as_bytes());
        let name = format!("{}-{:016x}.blob", hex::encode(&hash.as_bytes()[..16]), generation);
        self.blob_dir().join(name)
    }

    /// Rewrite `index.json` atomically (temp file + rename).
    fn write_index(&self, entries: BTreeMap<String, String>) -> CacheResult<()> {
        let index = IndexFile {
            version: INDEX_VERSION,
            entries,
        };
        let tmp = self.root.join(format!("{}.tmp", INDEX_FILE));
        {
            let mut file = File::create(&tmp)?;
            serde_json::to_writer(&mut file, &index)?;
            file.sync_all()?;
        }
        fs::rename(&tmp, self.root.join(INDEX_FILE))?;
        Ok(())
    }

    /// Open a pending write under `pending/`.
    fn pending(self: &Arc<Self>, key: String, append: bool) -> CacheResult<DiskPending> {
        let path = self
            .pending_dir()
            .join(format!("{:016x}.tmp", self.next_generation()));
        let file = File::create(&path)?;
        Ok(DiskPending {
            inner: Arc::clone(self),
            key,
            append,
            path,
            file: Some(file),
        })
    }

    fn open_reader(slot: &Arc<BlobSlot>) -> CacheResult<CacheReader> {
        let file = File::open(&slot.file)?;
        let len = file.metadata()?.len();
        Ok(CacheReader::new(
            Box::new(BlobReader {
                file,
                _slot: Arc::clone(slot),
            }),
            len,
        ))
    }
}

/// Reader that pins its slot; field order drops the file handle first.
struct BlobReader {
    file: File,
    _slot: Arc<BlobSlot>,
}

impl Read for BlobReader {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        self.file.read(buf)
    }
}

/// Disk-backed cache backend.
#[derive(Debug, Clone)]
pub struct DiskCache {
    inner: Arc<DiskInner>,
}

impl DiskCache {
    /// Open (or create) a cache rooted at `root`.
    ///
    /// Blob files not referenced by the index are left over from deletions
    /// that were pending when the process stopped; they are removed here.
    pub fn open(root: impl Into<PathBuf>) -> CacheResult<Self> {
        let root: PathBuf = root.into();
        fs::create_dir_all(root.join(BLOB_DIR))?;
        let pending_dir = root.join(PENDING_DIR);
        if pending_dir.exists() {
            fs::remove_dir_all(&pending_dir)?;
        }
        fs::create_dir_all(&pending_dir)?;

        let index = Self::load_index(&root)?;
        let blob_dir = root.join(BLOB_DIR);

        let mut state = DiskState::default();
        let mut max_generation = 0u64;
        for (key, name) in index.entries {
            let file = blob_dir.join(&name);
            if !file.exists() {
                tracing::warn!(key = %key, file = %name, "cache index references missing blob");
                continue;
            }
            max_generation = max_generation.max(parse_generation(&name).unwrap_or(0));
            state.index.insert(key, Arc::new(BlobSlot::new(file)));
        }

        let live: std::collections::HashSet<String> =
            state.index.values().map(|slot| slot.file_name()).collect();
        for entry in fs::read_dir(&blob_dir)? {
            let entry = entry?;
            let name = entry.file_name().to_string_lossy().into_owned();
            if !live.contains(&name) {
                tracing::debug!(file = %name, "removing orphan cache blob");
                if let Err(e) = fs::remove_file(entry.path()) {
                    tracing::warn!(file = %name, error = %e, "failed to remove orphan cache blob");
                }
            }
        }

        Ok(Self {
            inner: Arc::new(DiskInner {
                root,
                state: Mutex::new(state),
                next_generation: AtomicU64::new(max_generation + 1),
            }),
        })
    }

    /// Get the root directory.
    pub fn root(&self) -> &Path {
        &self.inner.root
    }

    fn load_index(root: &Path) -> CacheResult<IndexFile> {
        let path = root.join(INDEX_FILE);
        let bytes = match fs::read(&path) {
            Ok(bytes) => bytes,
            Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(IndexFile::default()),
            Err(e) => return Err(e.into()),
        };
        let index: IndexFile = serde_json::from_slice(&bytes)?;
        if index.version != INDEX_VERSION {
            return Err(CacheError::index(format!(
                "unsupported index version {} in {}",
                index.version,
                path.display()
            )));
        }
        Ok(index)
    }
}

/// Parse the generation out of `<hash>-<gen>.blob`.
fn parse_generation(name: &str) -> Option<u64> {
    let stem = name.strip_suffix(".blob")?;
    let (_, generation) = stem.rsplit_once('-')?;
    u64::from_str_radix(generation, 16).ok()
}

struct DiskPending {
    inner: Arc<DiskInner>,
    key: String,
    append: bool,
    path: PathBuf,
    file: Option<File>,
}

impl DiskPending {
    /// Flush and sync the pending file.
    fn finish(&mut self) -> CacheResult<()> {
        if let Some(mut file) = self.file.take() {
            file.flush()?;
            file.sync_all()?;
        }
        Ok(())
    }

    /// Move the pending bytes into place. Caller holds the state lock.
    ///
    /// Every commit lands in a fresh generation file, and the in-memory
    /// map only changes once `index.json` names it. On error the previous
    /// value stays current.
    fn install(&self, state: &mut DiskState) -> CacheResult<Arc<BlobSlot>> {
        let target = self.inner.blob_path(&self.key, self.inner.next_generation());
        let previous = state.index.get(&self.key).cloned();

        let staged = match previous.as_ref() {
            Some(current) if self.append => Self::concat(&current.file, &self.path, &target),
            _ => fs::rename(&self.path, &target).map_err(CacheError::from),
        };
        if let Err(e) = staged {
            discard(&target);
            return Err(e);
        }

        let slot = Arc::new(BlobSlot::new(target));
        let mut entries = state.entries();
        entries.insert(self.key.clone(), slot.file_name());
        if let Err(e) = self.inner.write_index(entries) {
            discard(&slot.file);
            return Err(e);
        }

        state.index.insert(self.key.clone(), Arc::clone(&slot));
        if let Some(previous) = previous {
            state.retire(previous);
        }
        Ok(slot)
    }

    /// Write `head` followed by `tail` into a new file at `target`.
    fn concat(head: &Path, tail: &Path, target: &Path) -> CacheResult<()> {
        fs::copy(head, target)?;
        let mut dest = OpenOptions::new().append(true).open(target)?;
        io::copy(&mut File::open(tail)?, &mut dest)?;
        dest.sync_all()?;
        Ok(())
    }
}

/// Remove a blob that never made it into the index.
fn discard(file: &Path) {
    if let Err(e) = fs::remove_file(file) {
        if e.kind() != io::ErrorKind::NotFound {
            tracing::warn!(file = %file.display(), error = %e, "failed to remove unused cache blob");
        }
    }
}

impl Write for DiskPending {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        match self.file.as_mut() {
            Some(file) => file.write(buf),
            None => Err(io::Error::other("pending write already closed")),
        }
    }

    fn flush(&mut self) -> io::Result<()> {
        match self.file.as_mut() {
            Some(file) => file.flush(),
            None => Ok(()),
        }
    }
}

impl PendingWrite for DiskPending {
    fn commit(mut self: Box<Self>) -> CacheResult<(CacheReader, SystemTime)> {
        self.finish()?;

        let inner = Arc::clone(&self.inner);
        let mut state = inner.state.lock();
        let slot = self.install(&mut state)?;
        let reader = DiskInner::open_reader(&slot)?;
        Ok((reader, SystemTime::now()))
    }
}

impl Drop for DiskPending {
    fn drop(&mut self) {
        drop(self.file.take());
        // Committed writes have already moved the file away.
        if let Err(e) = fs::remove_file(&self.path) {
            if e.kind() != io::ErrorKind::NotFound {
                tracing::warn!(file = %self.path.display(), error = %e, "failed to discard pending write");
            }
        }
    }
}

impl CacheService for DiskCache {
    fn get(&self, key: &str) -> CacheResult<CacheReader> {
        let key = normalize_key(key)?;
        let state = self.inner.state.lock();
        let slot = state
            .index
            .get(&key)
            .ok_or_else(|| CacheError::not_found(key.clone()))?;
        DiskInner::open_reader(slot)
    }

    fn has(&self, key: &str) -> bool {
        match normalize_key(key) {
            Ok(key) => self.inner.state.lock().index.contains_key(&key),
            Err(_) => false,
        }
    }

    fn remove(&self, key: &str) -> CacheResult<()> {
        let key = normalize_key(key)?;
        let mut state = self.inner.state.lock();
        if state.index.contains_key(&key) {
            let mut entries = state.entries();
            entries.remove(&key);
            self.inner.write_index(entries)?;
            if let Some(slot) = state.index.remove(&key) {
                state.retire(slot);
            }
        }
        Ok(())
    }

    fn remove_recursive(&self, prefix: &str) -> CacheResult<usize> {
        let prefix = normalize_prefix(prefix);
        let mut state = self.inner.state.lock();
        let doomed: Vec<String> = state
            .index
            .range(prefix.clone()..)
            .map(|(k, _)| k)
            .take_while(|k| k.starts_with(&prefix))
            .filter(|k| is_under(k, &prefix))
            .cloned()
            .collect();
        if doomed.is_empty() {
            return Ok(0);
        }

        let mut entries = state.entries();
        for key in &doomed {
            entries.remove(key);
        }
        self.inner.write_index(entries)?;

        for key in &doomed {
            if let Some(slot) = state.index.remove(key) {
                state.retire(slot);
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
        let pending = self.inner.pending(key.clone(), append)?;
        Ok(CacheWriter::new(key, append, Box::new(pending), on_commit))
    }

    fn put_if_absent(&self, key: &str, data: &mut dyn Read) -> CacheResult<Option<CommitInfo>> {
        let key = normalize_key(key)?;
        let mut pending = self.inner.pending(key.clone(), false)?;
        let written = io::copy(data, &mut pending)?;
        pending.finish()?;

        let mut state = self.inner.state.lock();
        if state.index.contains_key(&key) {
            tracing::debug!(key = %key, "key filled meanwhile, dropping create-only write");
            return Ok(None);
        }
        pending.install(&mut state)?;
        Ok(Some(CommitInfo {
            key,
            timestamp: SystemTime::now(),
            append: false,
            written,
        }))
    }

    fn keys(&self) -> Vec<String> {
        self.inner.state.lock().index.keys().cloned().collect()
    }

    fn pending_releases(&self) -> usize {
        let mut state = self.inner.state.lock();
        state.retired.retain(|weak| weak.strong_count() > 0);
        state.retired.len()
    }
}
