//! Metadata persistence for the resource tree.
//!
//! The whole tree is saved as one snapshot: roots, nodes, provider ids,
//! remote URIs and persistent properties. Session properties and provider
//! bindings never leave the process.

use std::collections::BTreeMap;
use std::path::Path;

use parking_lot::Mutex;
use rusqlite::{Connection, OptionalExtension, params};
use serde::{Deserialize, Serialize};

use crate::error::{FsError, FsResult};
use crate::tree::NodeType;

/// Serializable form of the whole tree.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct TreeSnapshot {
    pub roots: Vec<NodeRecord>,
}

/// One persisted node and its persisted descendants.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NodeRecord {
    pub name: String,
    pub node_type: NodeType,
    pub exists: bool,
    pub local_only: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub assigned_provider_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub dynamic_provider_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub remote_uri: Option<String>,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub properties: BTreeMap<String, String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub children: Vec<NodeRecord>,
}

/// Load-at-startup / save-on-flush store for tree metadata.
pub trait MetadataStore: Send + Sync {
    /// The last saved snapshot, or `None` if nothing was ever saved.
    fn load(&self) -> FsResult<Option<TreeSnapshot>>;

    /// Replace the stored snapshot.
    fn save(&self, snapshot: &TreeSnapshot) -> FsResult<()>;
}

impl<T: MetadataStore + ?Sized> MetadataStore for std::sync::Arc<T> {
    fn load(&self) -> FsResult<Option<TreeSnapshot>> {
        (**self).load()
    }

    fn save(&self, snapshot: &TreeSnapshot) -> FsResult<()> {
        (**self).save(snapshot)
    }
}

/// Keeps the last snapshot in memory.
#[derive(Debug, Default)]
pub struct MemoryMetadataStore {
    saved: Mutex<Option<TreeSnapshot>>,
    saves: Mutex<u64>,
}

impl MemoryMetadataStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Start from an existing snapshot.
    pub fn with_snapshot(snapshot: TreeSnapshot) -> Self {
        Self {
            saved: Mutex::new(Some(snapshot)),
            saves: Mutex::new(0),
        }
    }

    /// How many times `save` has been called.
    pub fn save_count(&self) -> u64 {
        *self.saves.lock()
    }
}

impl MetadataStore for MemoryMetadataStore {
    fn load(&self) -> FsResult<Option<TreeSnapshot>> {
        Ok(self.saved.lock().clone())
    }

    fn save(&self, snapshot: &TreeSnapshot) -> FsResult<()> {
        *self.saved.lock() = Some(snapshot.clone());
        *self.saves.lock() += 1;
        Ok(())
    }
}

const SCHEMA: &str = r#"
-- One row per persisted node; parent is NULL for roots
CREATE TABLE IF NOT EXISTS nodes (
    id INTEGER PRIMARY KEY,
    parent INTEGER REFERENCES nodes(id),
    position INTEGER NOT NULL,
    name TEXT NOT NULL,
    node_type TEXT NOT NULL,
    exists_flag INTEGER NOT NULL,
    local_only INTEGER NOT NULL,
    assigned_provider TEXT,
    dynamic_provider TEXT,
    remote_uri TEXT
);
CREATE INDEX IF NOT EXISTS idx_nodes_parent ON nodes(parent, position);

-- Persistent properties
CREATE TABLE IF NOT EXISTS properties (
    node INTEGER NOT NULL REFERENCES nodes(id),
    key TEXT NOT NULL,
    value TEXT NOT NULL,
    PRIMARY KEY (node, key)
);

-- Bookkeeping (distinguishes "saved empty" from "never saved")
CREATE TABLE IF NOT EXISTS meta (
    key TEXT PRIMARY KEY,
    value TEXT NOT NULL
);
"#;

/// SQLite-backed metadata store.
pub struct SqliteMetadataStore {
    conn: Mutex<Connection>,
}

impl std::fmt::Debug for SqliteMetadataStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SqliteMetadataStore").finish_non_exhaustive()
    }
}

impl SqliteMetadataStore {
    /// Open or create a database at the given path.
    pub fn open<P: AsRef<Path>>(path: P) -> FsResult<Self> {
        let conn = Connection::open(path)?;
        conn.execute_batch(SCHEMA)?;
        Ok(Self {
            conn: Mutex::new(conn),
        })
    }

    /// Create an in-memory database (for testing).
    pub fn in_memory() -> FsResult<Self> {
        let conn = Connection::open_in_memory()?;
        conn.execute_batch(SCHEMA)?;
        Ok(Self {
            conn: Mutex::new(conn),
        })
    }
}

struct Row {
    id: i64,
    parent: Option<i64>,
    record: NodeRecord,
}

impl MetadataStore for SqliteMetadataStore {
    fn load(&self) -> FsResult<Option<TreeSnapshot>> {
        let conn = self.conn.lock();

        let saved: Option<String> = conn
            .query_row("SELECT value FROM meta WHERE key = 'saved_at'", [], |row| {
                row.get(0)
            })
            .optional()?;
        if saved.is_none() {
            return Ok(None);
        }

        let mut stmt = conn.prepare(
            "SELECT id, parent, name, node_type, exists_flag, local_only,
                    assigned_provider, dynamic_provider, remote_uri
             FROM nodes ORDER BY parent, position",
        )?;
        let rows = stmt.query_map([], |row| {
            let node_type: String = row.get(3)?;
            Ok((
                row.get::<_, i64>(0)?,
                row.get::<_, Option<i64>>(1)?,
                row.get::<_, String>(2)?,
                node_type,
                row.get::<_, bool>(4)?,
                row.get::<_, bool>(5)?,
                row.get::<_, Option<String>>(6)?,
                row.get::<_, Option<String>>(7)?,
                row.get::<_, Option<String>>(8)?,
            ))
        })?;

        let mut nodes = Vec::new();
        for row in rows {
            let (id, parent, name, node_type, exists, local_only, assigned, dynamic, uri) = row?;
            let node_type = node_type
                .parse::<NodeType>()
                .map_err(|_| FsError::metadata(format!("node {id}: bad node type {node_type:?}")))?;
            nodes.push(Row {
                id,
                parent,
                record: NodeRecord {
                    name,
                    node_type,
                    exists,
                    local_only,
                    assigned_provider_id: assigned,
                    dynamic_provider_id: dynamic,
                    remote_uri: uri,
                    properties: BTreeMap::new(),
                    children: Vec::new(),
                },
            });
        }

        let mut stmt = conn.prepare("SELECT node, key, value FROM properties")?;
        let props = stmt.query_map([], |row| {
            Ok((
                row.get::<_, i64>(0)?,
                row.get::<_, String>(1)?,
                row.get::<_, String>(2)?,
            ))
        })?;
        let mut by_node: BTreeMap<i64, BTreeMap<String, String>> = BTreeMap::new();
        for prop in props {
            let (node, key, value) = prop?;
            by_node.entry(node).or_default().insert(key, value);
        }
        for row in &mut nodes {
            if let Some(props) = by_node.remove(&row.id) {
                row.record.properties = props;
            }
        }

        Ok(Some(assemble(nodes)?))
    }

    fn save(&self, snapshot: &TreeSnapshot) -> FsResult<()> {
        let mut conn = self.conn.lock();
        let tx = conn.transaction()?;
        tx.execute("DELETE FROM properties", [])?;
        tx.execute("DELETE FROM nodes", [])?;

        let mut next_id = 1i64;
        for (position, root) in snapshot.roots.iter().enumerate() {
            insert_node(&tx, root, None, position as i64, &mut next_id)?;
        }

        let now = std::time::SystemTime::now()
            .duration_since(std::time::UNIX_EPOCH)
            .map(|d| d.as_millis() as i64)
            .unwrap_or_default();
        tx.execute(
            "INSERT INTO meta (key, value) VALUES ('saved_at', ?1)
             ON CONFLICT(key) DO UPDATE SET value = excluded.value",
            params![now.to_string()],
        )?;
        tx.commit()?;
        Ok(())
    }
}

fn insert_node(
    tx: &rusqlite::Transaction<'_>,
    record: &NodeRecord,
    parent: Option<i64>,
    position: i64,
    next_id: &mut i64,
) -> FsResult<()> {
    let id = *next_id;
    *next_id += 1;

    tx.execute(
        "INSERT INTO nodes (id, parent, position, name, node_type, exists_flag, local_only,
                            assigned_provider, dynamic_provider, remote_uri)
         VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10)",
        params![
            id,
            parent,
            position,
            record.name,
            record.node_type.as_ref(),
            record.exists,
            record.local_only,
            record.assigned_provider_id,
            record.dynamic_provider_id,
            record.remote_uri,
        ],
    )?;
    for (key, value) in &record.properties {
        tx.execute(
            "INSERT INTO properties (node, key, value) VALUES (?1, ?2, ?3)",
            params![id, key, value],
        )?;
    }
    for (position, child) in record.children.iter().enumerate() {
        insert_node(tx, child, Some(id), position as i64, next_id)?;
    }
    Ok(())
}

/// Turn flat rows (ordered by parent, position) into nested records.
fn assemble(rows: Vec<Row>) -> FsResult<TreeSnapshot> {
    let mut children_of: BTreeMap<Option<i64>, Vec<(i64, NodeRecord)>> = BTreeMap::new();
    for row in rows {
        children_of
            .entry(row.parent)
            .or_default()
            .push((row.id, row.record));
    }

    fn attach(
        id: i64,
        mut record: NodeRecord,
        children_of: &mut BTreeMap<Option<i64>, Vec<(i64, NodeRecord)>>,
    ) -> NodeRecord {
        if let Some(children) = children_of.remove(&Some(id)) {
            record.children = children
                .into_iter()
                .map(|(child_id, child)| attach(child_id, child, children_of))
                .collect();
        }
        record
    }

    let roots = children_of.remove(&None).unwrap_or_default();
    let roots = roots
        .into_iter()
        .map(|(id, record)| attach(id, record, &mut children_of))
        .collect();

    if !children_of.is_empty() {
        return Err(FsError::metadata(format!(
            "{} node group(s) reference a missing parent",
            children_of.len()
        )));
    }
    Ok(TreeSnapshot { roots })
}
