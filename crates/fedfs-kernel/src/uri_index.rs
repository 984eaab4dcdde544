//! Reverse index from remote URI strings to the paths tagged with them.
//!
//! Built lazily from a full tree scan, kept current by URI set/clear, and
//! dropped on node removal (removal clears URIs without reporting them).

use std::collections::{BTreeSet, HashMap};

use crate::path::ResourcePath;

#[derive(Debug, Default)]
pub struct UriIndex {
    map: Option<HashMap<String, BTreeSet<ResourcePath>>>,
}

impl UriIndex {
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns true once a full scan has populated the index.
    pub fn is_built(&self) -> bool {
        self.map.is_some()
    }

    /// Replace the index with the given `(uri, path)` pairs.
    pub fn rebuild(&mut self, entries: impl IntoIterator<Item = (String, ResourcePath)>) {
        let mut map: HashMap<String, BTreeSet<ResourcePath>> = HashMap::new();
        for (uri, path) in entries {
            map.entry(uri).or_default().insert(path);
        }
        tracing::debug!(uris = map.len(), "rebuilt uri index");
        self.map = Some(map);
    }

    /// Force a rebuild on next lookup.
    pub fn invalidate(&mut self) {
        self.map = None;
    }

    /// Record that `path` moved from `old` to `new`. No-op until built.
    pub fn update(&mut self, path: &ResourcePath, old: Option<&str>, new: Option<&str>) {
        let Some(map) = self.map.as_mut() else {
            return;
        };
        if let Some(old) = old {
            if let Some(paths) = map.get_mut(old) {
                paths.remove(path);
                if paths.is_empty() {
                    map.remove(old);
                }
            }
        }
        if let Some(new) = new {
            map.entry(new.to_string()).or_default().insert(path.clone());
        }
    }

    /// Paths tagged with `uri`, optionally restricted to those under `prefix`.
    ///
    /// Returns `None` if the index has not been built.
    pub fn lookup(&self, uri: &str, prefix: Option<&ResourcePath>) -> Option<Vec<ResourcePath>> {
        let map = self.map.as_ref()?;
        let paths = map
            .get(uri)
            .map(|paths| {
                paths
                    .iter()
                    .filter(|p| prefix.is_none_or(|prefix| p.starts_with(prefix)))
                    .cloned()
                    .collect()
            })
            .unwrap_or_default();
        Some(paths)
    }
}
