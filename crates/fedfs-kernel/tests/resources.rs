//! Resource handles: structure, I/O, properties, URIs and persistence.

use std::sync::{Arc, Barrier, Mutex, mpsc};
use std::thread;
use std::time::Duration;

use fedfs_kernel::{
    ContentProvider, CreateMode, DefaultProvider, FederatedFs, FlushMode, FsError, FsResult,
    MemoryMetadataStore, MetadataStore, NodeRecord, NodeType, ProviderContext, ProviderEnv,
    ProviderMetadata, ReadStream, RemoveMode, ResourcePath, SqliteMetadataStore, WriteStream,
};

fn p(s: &str) -> ResourcePath {
    ResourcePath::parse(s).unwrap()
}

/// Notification seen by a [`Hooked`] provider.
#[derive(Debug, Clone, PartialEq, Eq)]
enum Event {
    Added {
        path: String,
        exists: bool,
        saved: bool,
    },
    Removed {
        path: String,
        uri: Option<String>,
        owner: Option<String>,
        handle_stale: bool,
    },
}

#[derive(Default)]
struct Hooks {
    events: Mutex<Vec<Event>>,
    store: Option<Arc<MemoryMetadataStore>>,
    /// New folders get an `index` file, created from inside `add_resource`.
    implicit_index: bool,
    /// `add_resource` fails for children with this name.
    reject: Option<&'static str>,
}

impl Hooks {
    fn events(&self) -> Vec<Event> {
        self.events.lock().unwrap().clone()
    }
}

/// Default storage plus add/remove hooks.
struct Hooked {
    hooks: Arc<Hooks>,
    inner: DefaultProvider,
}

impl ContentProvider for Hooked {
    fn id(&self) -> &str {
        self.inner.id()
    }

    fn open_read(&self, ctx: &ProviderContext) -> FsResult<ReadStream> {
        self.inner.open_read(ctx)
    }

    fn open_write(&self, ctx: &ProviderContext, append: bool) -> FsResult<WriteStream> {
        self.inner.open_write(ctx, append)
    }

    fn fetch_metadata(&self, ctx: &ProviderContext) -> FsResult<ProviderMetadata> {
        self.inner.fetch_metadata(ctx)
    }

    fn add_resource(&self, ctx: &ProviderContext) -> FsResult<()> {
        let res = ctx.resource();
        let saved = self.hooks.store.as_ref().is_some_and(|store| {
            let snapshot = store.load().unwrap().unwrap_or_default();
            is_saved(&snapshot.roots, res.path().segments())
        });
        self.hooks.events.lock().unwrap().push(Event::Added {
            path: res.path().to_string(),
            exists: res.exists(),
            saved,
        });

        if self.hooks.reject.is_some() && self.hooks.reject == res.name() {
            return Err(FsError::provider(res.path(), "backend refused the name"));
        }
        if self.hooks.implicit_index && res.node_type()? == NodeType::Folder {
            res.create_child("index", NodeType::File, CreateMode::Local)?;
        }
        Ok(())
    }

    fn remove_resource(&self, ctx: &ProviderContext) -> FsResult<()> {
        let removed = ctx.removed().cloned();
        self.hooks.events.lock().unwrap().push(Event::Removed {
            path: ctx.path().to_string(),
            uri: removed.as_ref().and_then(|r| r.remote_uri.clone()),
            owner: removed.and_then(|r| r.properties.get("owner").cloned()),
            handle_stale: ctx.resource().persistent_properties().is_err(),
        });
        Ok(())
    }
}

fn is_saved(records: &[NodeRecord], segments: &[String]) -> bool {
    let Some((first, rest)) = segments.split_first() else {
        return true;
    };
    records
        .iter()
        .find(|r| &r.name == first)
        .is_some_and(|r| is_saved(&r.children, rest))
}

/// Tree whose `P` root is served by a [`Hooked`] provider.
fn hooked_fs(hooks: &Arc<Hooks>, store: Arc<MemoryMetadataStore>) -> FederatedFs {
    let hooks = Arc::clone(hooks);
    let fs = FederatedFs::builder()
        .metadata(store)
        .provider("hooked", move |env: &ProviderEnv| -> FsResult<Arc<dyn ContentProvider>> {
            Ok(Arc::new(Hooked {
                hooks: Arc::clone(&hooks),
                inner: DefaultProvider::with_id(env.provider_id.clone(), Arc::clone(&env.cache)),
            }))
        })
        .build()
        .unwrap();
    fs.add_root("P", Some("hooked")).unwrap();
    fs
}

#[test]
fn create_write_read_and_list() {
    let fs = FederatedFs::in_memory().unwrap();
    let root = fs.add_root("P", None).unwrap();
    assert_eq!(root.node_type().unwrap(), NodeType::Project);

    let dir = root.create_child("docs", NodeType::Folder, CreateMode::Local).unwrap();
    let file = dir.create_child("a.txt", NodeType::File, CreateMode::Local).unwrap();
    dir.create_child("b.txt", NodeType::File, CreateMode::Local).unwrap();
    // Phantoms are not listed.
    let _ = dir.child("ghost").unwrap();

    let names: Vec<String> = dir
        .children()
        .unwrap()
        .iter()
        .map(|c| c.name().unwrap().to_string())
        .collect();
    assert_eq!(names, vec!["a.txt", "b.txt"]);

    // Never-written files read as empty.
    assert!(file.read_all().unwrap().is_empty());

    file.write_all(b"hello", false).unwrap();
    file.write_all(b" world", true).unwrap();
    assert_eq!(file.read_all().unwrap(), b"hello world");
    assert!(fs.cache().has("P/docs/a.txt"));

    let meta = file.metadata().unwrap();
    assert_eq!(meta.provider_id, "default");
    assert!(meta.local_only);
    assert!(!meta.read_only);
    assert!(meta.timestamp.is_some());
    assert!(!file.is_read_only_for_display());
}

#[test]
fn uncommitted_writes_are_invisible() {
    let fs = FederatedFs::in_memory().unwrap();
    let root = fs.add_root("P", None).unwrap();
    let file = root.create_child("f", NodeType::File, CreateMode::Local).unwrap();
    file.write_all(b"old", false).unwrap();

    let mut stream = file.open_write(false).unwrap();
    std::io::Write::write_all(&mut stream, b"new").unwrap();
    assert_eq!(file.read_all().unwrap(), b"old");
    drop(stream);
    assert_eq!(file.read_all().unwrap(), b"old");
}

#[test]
fn phantoms_reject_io_and_properties() {
    let fs = FederatedFs::in_memory().unwrap();
    fs.add_root("P", None).unwrap();
    let ghost = fs.resource("/P/ghost").unwrap();

    assert!(!ghost.exists());
    assert!(matches!(ghost.read_all(), Err(FsError::NotAccessible { .. })));
    assert!(matches!(ghost.metadata(), Err(FsError::NotAccessible { .. })));
    assert!(matches!(
        ghost.set_persistent_property("k", "v"),
        Err(FsError::NotAccessible { .. })
    ));
    assert_eq!(ghost.persistent_property("k").unwrap(), None);
    assert!(ghost.is_read_only_for_display());
}

#[test]
fn mark_exists_needs_an_existing_parent() {
    let fs = FederatedFs::in_memory().unwrap();
    fs.add_root("P", None).unwrap();

    let g = fs.resource("/P/g").unwrap();
    assert!(g.mark_exists(Some(NodeType::File)).unwrap());
    assert!(!g.mark_exists(None).unwrap());
    assert!(g.exists());
    assert!(!g.is_local_only().unwrap());

    let deep = fs.resource("/P/x/y").unwrap();
    assert!(matches!(deep.mark_exists(None), Err(FsError::NotAccessible { .. })));
}

#[test]
fn concurrent_create_of_same_name() {
    let fs = FederatedFs::in_memory().unwrap();
    let root = fs.add_root("P", None).unwrap();
    let barrier = Barrier::new(2);

    let results: Vec<_> = thread::scope(|s| {
        let handles: Vec<_> = (0..2)
            .map(|_| {
                let root = root.clone();
                let barrier = &barrier;
                s.spawn(move || {
                    barrier.wait();
                    root.create_child("same", NodeType::File, CreateMode::Local)
                })
            })
            .collect();
        handles.into_iter().map(|h| h.join().unwrap()).collect()
    });

    let ok = results.iter().filter(|r| r.is_ok()).count();
    let exists = results
        .iter()
        .filter(|r| matches!(r, Err(FsError::AlreadyExists { .. })))
        .count();
    assert_eq!((ok, exists), (1, 1));
    assert_eq!(root.children().unwrap().len(), 1);
}

#[test]
fn removal_makes_handles_stale() {
    let fs = FederatedFs::in_memory().unwrap();
    let root = fs.add_root("P", None).unwrap();
    let dir = root.create_child("d", NodeType::Folder, CreateMode::Local).unwrap();
    let file = dir.create_child("f", NodeType::File, CreateMode::Local).unwrap();
    file.write_all(b"x", false).unwrap();
    file.set_remote_uri(Some("u://f")).unwrap();
    assert_eq!(fs.paths_for_uri("u://f", None), vec![p("/P/d/f")]);

    dir.remove(RemoveMode::Detach).unwrap();

    assert!(!file.exists());
    assert!(matches!(file.read_all(), Err(FsError::NotAccessible { .. })));
    assert!(matches!(file.persistent_property("k"), Err(FsError::NotAccessible { .. })));
    assert!(matches!(dir.remove(RemoveMode::Detach), Err(FsError::NotAccessible { .. })));
    assert!(fs.paths_for_uri("u://f", None).is_empty());
    assert!(!fs.resource("/P/d/f").unwrap().exists());

    // Detach keeps cached content.
    assert!(fs.cache().has("P/d/f"));

    // Re-adding the same names starts from scratch.
    let dir = root.create_child("d", NodeType::Folder, CreateMode::Local).unwrap();
    let again = dir.create_child("f", NodeType::File, CreateMode::Local).unwrap();
    assert!(again.persistent_properties().unwrap().is_empty());
    assert_eq!(again.remote_uri().unwrap(), None);
}

#[test]
fn force_remove_purges_cache() {
    let fs = FederatedFs::in_memory().unwrap();
    let root = fs.add_root("P", None).unwrap();
    let dir = root.create_child("d", NodeType::Folder, CreateMode::Local).unwrap();
    dir.create_child("f", NodeType::File, CreateMode::Local)
        .unwrap()
        .write_all(b"x", false)
        .unwrap();
    root.create_child("keep", NodeType::File, CreateMode::Local)
        .unwrap()
        .write_all(b"y", false)
        .unwrap();

    dir.remove(RemoveMode::Force).unwrap();
    assert!(!fs.cache().has("P/d/f"));
    assert!(fs.cache().has("P/keep"));
}

#[test]
fn remote_create_without_capability_rolls_back() {
    let fs = FederatedFs::in_memory().unwrap();
    let root = fs.add_root("P", None).unwrap();

    let err = root
        .create_child("r", NodeType::File, CreateMode::Remote)
        .unwrap_err();
    assert!(matches!(err, FsError::MethodNotSupported { .. }), "{err:?}");
    assert!(!fs.resource("/P/r").unwrap().exists());

    // The name is free again.
    root.create_child("r", NodeType::File, CreateMode::Local).unwrap();
}

#[test]
fn add_resource_sees_a_saved_node() {
    let store = Arc::new(MemoryMetadataStore::new());
    let hooks = Arc::new(Hooks {
        store: Some(Arc::clone(&store)),
        ..Hooks::default()
    });
    let fs = hooked_fs(&hooks, Arc::clone(&store));
    let root = fs.resource("/P").unwrap();

    let saves = store.save_count();
    root.create_child("f", NodeType::File, CreateMode::Local).unwrap();
    assert_eq!(store.save_count(), saves + 1);
    assert_eq!(
        hooks.events(),
        vec![Event::Added {
            path: "/P/f".into(),
            exists: true,
            saved: true,
        }]
    );
}

#[test]
fn add_resource_can_create_children() {
    let hooks = Arc::new(Hooks {
        implicit_index: true,
        ..Hooks::default()
    });
    let fs = hooked_fs(&hooks, Arc::new(MemoryMetadataStore::new()));

    // Runs on its own thread so a lock held across the callback fails the
    // test instead of hanging it.
    let (done, finished) = mpsc::channel();
    let worker = fs.clone();
    thread::spawn(move || {
        let root = worker.resource("/P").unwrap();
        let result = root
            .create_child("docs", NodeType::Folder, CreateMode::Local)
            .map(|docs| docs.path().clone());
        let _ = done.send(result);
    });
    let docs = finished
        .recv_timeout(Duration::from_secs(10))
        .expect("create_child did not return")
        .unwrap();
    assert_eq!(docs, p("/P/docs"));

    let index = fs.resource("/P/docs/index").unwrap();
    assert!(index.exists());
    assert_eq!(index.node_type().unwrap(), NodeType::File);
    let added: Vec<String> = hooks
        .events()
        .into_iter()
        .filter_map(|e| match e {
            Event::Added { path, .. } => Some(path),
            Event::Removed { .. } => None,
        })
        .collect();
    assert_eq!(added, vec!["/P/docs", "/P/docs/index"]);
}

#[test]
fn failed_add_resource_rolls_back() {
    let store = Arc::new(MemoryMetadataStore::new());
    let hooks = Arc::new(Hooks {
        store: Some(Arc::clone(&store)),
        reject: Some("bad"),
        ..Hooks::default()
    });
    let fs = hooked_fs(&hooks, Arc::clone(&store));
    let root = fs.resource("/P").unwrap();

    let err = root
        .create_child("bad", NodeType::File, CreateMode::Local)
        .unwrap_err();
    assert!(matches!(err, FsError::Provider { .. }), "{err:?}");

    // The node was saved before the callback, and the rollback saved again.
    assert!(matches!(hooks.events().as_slice(), [Event::Added { saved: true, .. }]));
    assert!(!fs.resource("/P/bad").unwrap().exists());
    assert!(root.children().unwrap().is_empty());
    let snapshot = store.load().unwrap().unwrap();
    assert!(!is_saved(&snapshot.roots, &["P".to_string(), "bad".to_string()]));

    root.create_child("good", NodeType::File, CreateMode::Local).unwrap();
    assert_eq!(root.children().unwrap().len(), 1);
}

#[test]
fn remove_resource_gets_the_removed_state() {
    let hooks = Arc::new(Hooks::default());
    let fs = hooked_fs(&hooks, Arc::new(MemoryMetadataStore::new()));
    let root = fs.resource("/P").unwrap();
    let file = root.create_child("f", NodeType::File, CreateMode::Local).unwrap();
    file.set_remote_uri(Some("u://f")).unwrap();
    file.set_persistent_property("owner", "ops").unwrap();

    file.remove(RemoveMode::Detach).unwrap();

    let removed = hooks
        .events()
        .into_iter()
        .find(|e| matches!(e, Event::Removed { .. }))
        .unwrap();
    assert_eq!(
        removed,
        Event::Removed {
            path: "/P/f".into(),
            uri: Some("u://f".into()),
            owner: Some("ops".into()),
            handle_stale: true,
        }
    );
}

#[test]
fn lock_requires_capability() {
    let fs = FederatedFs::in_memory().unwrap();
    let root = fs.add_root("P", None).unwrap();
    let file = root.create_child("f", NodeType::File, CreateMode::Local).unwrap();

    let err = file.lock().unwrap_err();
    assert!(
        matches!(err, FsError::MethodNotSupported { method: "lock", ref provider, .. } if provider == "default"),
        "{err:?}"
    );
    assert!(matches!(file.delete_remote(), Err(FsError::MethodNotSupported { .. })));
}

#[test]
fn properties_and_session_flags() {
    let fs = FederatedFs::in_memory().unwrap();
    let root = fs.add_root("P", None).unwrap();
    let file = root.create_child("f", NodeType::File, CreateMode::Local).unwrap();

    file.set_persistent_property("owner", "ops").unwrap();
    assert_eq!(file.persistent_property("owner").unwrap().as_deref(), Some("ops"));
    assert_eq!(file.remove_persistent_property("owner").unwrap().as_deref(), Some("ops"));
    assert_eq!(file.remove_persistent_property("owner").unwrap(), None);

    file.set_session_property("count", 3u32).unwrap();
    let value = file.session_property("count").unwrap().unwrap();
    assert_eq!(value.downcast_ref::<u32>(), Some(&3));

    assert!(!file.session_flag("flag"));
    file.set_session_flag("flag", true).unwrap();
    assert!(file.session_flag("flag"));
    // Non-bool values do not count as a set flag.
    assert!(!file.session_flag("count"));
}

#[test]
fn uri_lookup_respects_prefix() {
    let fs = FederatedFs::in_memory().unwrap();
    let p_root = fs.add_root("P", None).unwrap();
    let q_root = fs.add_root("Q", None).unwrap();
    let a = p_root.create_child("a", NodeType::File, CreateMode::Local).unwrap();
    let b = q_root.create_child("b", NodeType::File, CreateMode::Local).unwrap();
    a.set_remote_uri(Some("https://h/doc")).unwrap();
    b.set_remote_uri(Some("https://h/doc")).unwrap();

    assert_eq!(
        fs.paths_for_uri("https://h/doc", None),
        vec![p("/P/a"), p("/Q/b")]
    );
    assert_eq!(
        fs.paths_for_uri("https://h/doc", Some(&p("/Q"))),
        vec![p("/Q/b")]
    );

    a.set_remote_uri(None).unwrap();
    assert_eq!(fs.paths_for_uri("https://h/doc", None), vec![p("/Q/b")]);
    assert_eq!(b.remote_uri().unwrap().as_deref(), Some("https://h/doc"));
}

#[test]
fn immediate_flush_saves_every_change() {
    let store = Arc::new(MemoryMetadataStore::new());
    let fs = FederatedFs::builder()
        .metadata(Arc::clone(&store))
        .build()
        .unwrap();

    let root = fs.add_root("P", None).unwrap();
    assert_eq!(store.save_count(), 1);
    root.set_persistent_property("k", "v").unwrap();
    assert_eq!(store.save_count(), 2);
    assert!(!fs.is_dirty());
}

#[test]
fn delayed_flush_saves_on_drop() {
    let store = Arc::new(MemoryMetadataStore::new());
    {
        let fs = FederatedFs::builder()
            .metadata(Arc::clone(&store))
            .flush_mode(FlushMode::Delayed)
            .build()
            .unwrap();
        let root = fs.add_root("P", None).unwrap();
        root.create_child("f", NodeType::File, CreateMode::Local).unwrap();
        assert_eq!(store.save_count(), 0);
    }
    assert_eq!(store.save_count(), 1);

    let fs = FederatedFs::builder()
        .metadata(Arc::clone(&store))
        .build()
        .unwrap();
    assert!(fs.resource("/P/f").unwrap().exists());
}

#[test]
fn sqlite_metadata_survives_restart() {
    let dir = tempfile::tempdir().unwrap();
    let db = dir.path().join("tree.db");

    {
        let fs = FederatedFs::builder()
            .metadata(SqliteMetadataStore::open(&db).unwrap())
            .build()
            .unwrap();
        let root = fs.add_root("P", None).unwrap();
        let file = root.create_child("f", NodeType::File, CreateMode::Local).unwrap();
        file.set_persistent_property("owner", "ops").unwrap();
        file.set_remote_uri(Some("u://f")).unwrap();
        file.set_session_flag("flag", true).unwrap();
        fs.resource("/P/later;provider=default").unwrap();
    }

    let fs = FederatedFs::builder()
        .metadata(SqliteMetadataStore::open(&db).unwrap())
        .build()
        .unwrap();
    let roots: Vec<String> = fs.roots().iter().map(|r| r.path().to_string()).collect();
    assert_eq!(roots, vec!["/P"]);

    let file = fs.resource("/P/f").unwrap();
    assert!(file.exists());
    assert_eq!(file.node_type().unwrap(), NodeType::File);
    assert_eq!(file.persistent_property("owner").unwrap().as_deref(), Some("ops"));
    assert_eq!(fs.paths_for_uri("u://f", None), vec![p("/P/f")]);
    // Session state is process-local.
    assert!(!file.session_flag("flag"));

    let later = fs.resource("/P/later").unwrap();
    assert!(!later.exists());
    assert_eq!(later.assigned_provider_id().unwrap().as_deref(), Some("default"));
}
