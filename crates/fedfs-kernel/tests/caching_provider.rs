//! `CachingProvider` over a scripted remote.

use std::collections::HashMap;
use std::io::Read;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Barrier, Mutex};
use std::thread;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use fedfs_kernel::provider::{decode_timestamp, encode_timestamp};
use fedfs_kernel::{
    CachingProvider, ContentProvider, CreateMode, FederatedFs, FsError, FsResult, NodeType,
    ProviderEnv, RemoteContent, RemoteSource, Resource, ResourcePath, UpstreamStatus,
    WRITE_THROUGH_FLAG,
};

fn remote_time() -> SystemTime {
    UNIX_EPOCH + Duration::from_millis(1_700_000_000_123)
}

#[derive(Default)]
struct MockRemote {
    files: Mutex<HashMap<String, Vec<u8>>>,
    fetches: AtomicUsize,
    pushes: Mutex<Vec<(String, Vec<u8>, bool)>>,
    fail_push: AtomicBool,
    read_only: bool,
    fetch_delay: Option<Duration>,
}

impl MockRemote {
    fn with_file(self, path: &str, content: &[u8]) -> Self {
        self.files
            .lock()
            .unwrap()
            .insert(path.to_string(), content.to_vec());
        self
    }

    fn fetches(&self) -> usize {
        self.fetches.load(Ordering::SeqCst)
    }
}

impl RemoteSource for MockRemote {
    fn fetch(&self, path: &ResourcePath) -> FsResult<RemoteContent> {
        self.fetches.fetch_add(1, Ordering::SeqCst);
        if let Some(delay) = self.fetch_delay {
            thread::sleep(delay);
        }
        let data = self
            .files
            .lock()
            .unwrap()
            .get(&path.to_string())
            .cloned()
            .ok_or_else(|| FsError::provider(path, "no such remote file"))?;
        Ok(RemoteContent::from_bytes(data, remote_time()))
    }

    fn push(&self, path: &ResourcePath, content: &mut dyn Read, append: bool) -> FsResult<()> {
        if self.fail_push.load(Ordering::SeqCst) {
            return Err(FsError::provider(path, "remote rejected the write"));
        }
        let mut data = Vec::new();
        content
            .read_to_end(&mut data)
            .map_err(|e| FsError::io(path, e))?;
        self.pushes
            .lock()
            .unwrap()
            .push((path.to_string(), data, append));
        Ok(())
    }

    fn is_read_only(&self, _path: &ResourcePath) -> FsResult<bool> {
        Ok(self.read_only)
    }
}

fn remote_fs(remote: &Arc<MockRemote>) -> FederatedFs {
    let remote = Arc::clone(remote);
    FederatedFs::builder()
        .provider("remote", move |env: &ProviderEnv| -> FsResult<Arc<dyn ContentProvider>> {
            Ok(Arc::new(CachingProvider::new(
                env.provider_id.clone(),
                Arc::clone(&env.cache),
                Arc::clone(&remote),
            )))
        })
        .build()
        .unwrap()
}

/// A remote file discovered under the `R` root.
fn discovered(fs: &FederatedFs, name: &str) -> Resource {
    let root = match fs.roots().into_iter().find(|r| r.name() == Some("R")) {
        Some(root) => root,
        None => fs.add_root("R", Some("remote")).unwrap(),
    };
    let file = root.child(name).unwrap();
    file.mark_exists(Some(NodeType::File)).unwrap();
    file
}

#[test]
fn first_read_fetches_once() {
    let remote = Arc::new(MockRemote::default().with_file("/R/doc", b"remote body"));
    let fs = remote_fs(&remote);
    let doc = discovered(&fs, "doc");

    assert_eq!(doc.read_all().unwrap(), b"remote body");
    assert_eq!(doc.read_all().unwrap(), b"remote body");
    assert_eq!(remote.fetches(), 1);

    let meta = doc.metadata().unwrap();
    assert_eq!(meta.provider_id, "remote");
    assert_eq!(meta.timestamp, Some(remote_time()));
    assert!(meta.exists_remotely);
}

#[test]
fn concurrent_first_reads_share_one_fetch() {
    let remote = Arc::new(MockRemote {
        fetch_delay: Some(Duration::from_millis(20)),
        ..MockRemote::default()
    }
    .with_file("/R/doc", b"slow"));
    let fs = remote_fs(&remote);
    let doc = discovered(&fs, "doc");

    let barrier = Barrier::new(6);
    thread::scope(|s| {
        for _ in 0..6 {
            let doc = doc.clone();
            let barrier = &barrier;
            s.spawn(move || {
                barrier.wait();
                assert_eq!(doc.read_all().unwrap(), b"slow");
            });
        }
    });
    assert_eq!(remote.fetches(), 1);
}

#[test]
fn write_during_fetch_is_not_overwritten() {
    let remote = Arc::new(MockRemote {
        fetch_delay: Some(Duration::from_millis(300)),
        ..MockRemote::default()
    }
    .with_file("/R/doc", b"remote-old"));
    let fs = remote_fs(&remote);
    let doc = discovered(&fs, "doc");

    let written_at = thread::scope(|s| {
        let reader = {
            let doc = doc.clone();
            s.spawn(move || doc.read_all().unwrap())
        };
        thread::sleep(Duration::from_millis(100));
        let outcome = doc.write_all(b"user-new", false).unwrap();
        assert_eq!(reader.join().unwrap(), b"user-new");
        outcome.timestamp
    });

    assert_eq!(remote.fetches(), 1);
    assert_eq!(doc.read_all().unwrap(), b"user-new");
    let meta = doc.metadata().unwrap();
    // Stored timestamps keep millisecond precision.
    assert_eq!(meta.timestamp, decode_timestamp(&encode_timestamp(written_at)));
    assert_ne!(meta.timestamp, Some(remote_time()));
}

#[test]
fn fetch_failure_surfaces_and_caches_nothing() {
    let remote = Arc::new(MockRemote::default());
    let fs = remote_fs(&remote);
    let doc = discovered(&fs, "missing");

    assert!(matches!(doc.read_all(), Err(FsError::Provider { .. })));
    assert!(!fs.cache().has("R/missing"));
}

#[test]
fn local_only_resources_never_touch_the_remote() {
    let remote = Arc::new(MockRemote::default());
    let fs = remote_fs(&remote);
    let root = fs.add_root("R", Some("remote")).unwrap();
    let scratch = root
        .create_child("scratch", NodeType::File, CreateMode::Local)
        .unwrap();
    scratch.set_session_flag(WRITE_THROUGH_FLAG, true).unwrap();

    assert!(scratch.read_all().unwrap().is_empty());
    let outcome = scratch.write_all(b"local", false).unwrap();
    assert_eq!(outcome.upstream, UpstreamStatus::NotRequested);
    assert_eq!(scratch.read_all().unwrap(), b"local");

    let meta = scratch.metadata().unwrap();
    assert!(!meta.read_only);
    assert!(meta.timestamp.is_some());

    assert_eq!(remote.fetches(), 0);
    assert!(remote.pushes.lock().unwrap().is_empty());
}

#[test]
fn read_only_metadata_fills_the_cache() {
    let remote = Arc::new(MockRemote {
        read_only: true,
        ..MockRemote::default()
    }
    .with_file("/R/doc", b"pinned"));
    let fs = remote_fs(&remote);
    let doc = discovered(&fs, "doc");

    let meta = doc.metadata().unwrap();
    assert!(meta.read_only);
    assert_eq!(meta.timestamp, Some(remote_time()));
    assert_eq!(remote.fetches(), 1);
    assert!(doc.is_read_only_for_display());

    assert_eq!(doc.read_all().unwrap(), b"pinned");
    assert_eq!(remote.fetches(), 1);
}

#[test]
fn writable_metadata_does_not_fetch() {
    let remote = Arc::new(MockRemote::default().with_file("/R/doc", b"x"));
    let fs = remote_fs(&remote);
    let doc = discovered(&fs, "doc");

    let meta = doc.metadata().unwrap();
    assert!(!meta.read_only);
    assert_eq!(meta.timestamp, None);
    assert_eq!(remote.fetches(), 0);
}

#[test]
fn append_fetches_before_extending() {
    let remote = Arc::new(MockRemote::default().with_file("/R/log", b"abc"));
    let fs = remote_fs(&remote);
    let log = discovered(&fs, "log");

    log.write_all(b"def", true).unwrap();
    assert_eq!(log.read_all().unwrap(), b"abcdef");
    assert_eq!(remote.fetches(), 1);
}

#[test]
fn write_through_pushes_committed_content() {
    let remote = Arc::new(MockRemote::default().with_file("/R/doc", b"old"));
    let fs = remote_fs(&remote);
    let doc = discovered(&fs, "doc");

    let plain = doc.write_all(b"cached only", false).unwrap();
    assert_eq!(plain.upstream, UpstreamStatus::NotRequested);
    assert!(remote.pushes.lock().unwrap().is_empty());

    doc.set_session_flag(WRITE_THROUGH_FLAG, true).unwrap();
    let outcome = doc.write_all(b"new", false).unwrap();
    assert_eq!(outcome.upstream, UpstreamStatus::Pushed);
    assert_eq!(
        *remote.pushes.lock().unwrap(),
        vec![("/R/doc".to_string(), b"new".to_vec(), false)]
    );
    assert_eq!(doc.read_all().unwrap(), b"new");
    assert_eq!(remote.fetches(), 0);
}

#[test]
fn failed_push_keeps_cached_write() {
    let remote = Arc::new(MockRemote::default());
    remote.fail_push.store(true, Ordering::SeqCst);
    let fs = remote_fs(&remote);
    let doc = discovered(&fs, "doc");
    doc.set_session_flag(WRITE_THROUGH_FLAG, true).unwrap();

    let outcome = doc.write_all(b"kept", false).unwrap();
    assert!(matches!(outcome.upstream, UpstreamStatus::Failed(_)));
    assert_eq!(doc.read_all().unwrap(), b"kept");
    assert_eq!(remote.fetches(), 0);
}
