//! The in-memory resource tree.
//!
//! Nodes live in a generational arena; parents own their children by id and
//! children keep a plain back-reference to their parent. The tree itself is
//! not synchronized: [`crate::FederatedFs`] wraps it in a single
//! process-wide reader/writer lock.
//!
//! Every change that can alter provider resolution (existence, provider
//! ids, removal) bumps [`ResourceTree::epoch`] and drops the provider
//! bindings of the affected subtree.

mod node;

pub use node::{NodeId, NodeType, SessionValue, TreeNode};

use indexmap::IndexMap;

use crate::error::{FsError, FsResult};
use crate::path::{PathHints, ResourcePath};
use crate::persist::{NodeRecord, TreeSnapshot};
use crate::provider::ResolvedProvider;
use crate::uri_index::UriIndex;

struct Slot {
    generation: u32,
    node: Option<TreeNode>,
}

/// Root table plus node arena.
#[derive(Default)]
pub struct ResourceTree {
    slots: Vec<Slot>,
    free: Vec<u32>,
    roots: IndexMap<String, NodeId>,
    uri_index: UriIndex,
    dirty: bool,
    epoch: u64,
}

impl std::fmt::Debug for ResourceTree {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ResourceTree")
            .field("roots", &self.roots.keys().collect::<Vec<_>>())
            .field("live_nodes", &self.live_count())
            .field("dirty", &self.dirty)
            .field("epoch", &self.epoch)
            .finish()
    }
}

impl ResourceTree {
    pub fn new() -> Self {
        Self::default()
    }

    /// Structural change counter.
    pub fn epoch(&self) -> u64 {
        self.epoch
    }

    /// Returns true if persisted state changed since the last save.
    pub fn is_dirty(&self) -> bool {
        self.dirty
    }

    pub(crate) fn clear_dirty(&mut self) {
        self.dirty = false;
    }

    fn touch(&mut self) {
        self.dirty = true;
        self.epoch += 1;
    }

    // ------------------------------------------------------------------
    // Arena
    // ------------------------------------------------------------------

    pub fn node(&self, id: NodeId) -> Option<&TreeNode> {
        self.slots
            .get(id.index as usize)
            .filter(|slot| slot.generation == id.generation)
            .and_then(|slot| slot.node.as_ref())
    }

    fn node_mut(&mut self, id: NodeId) -> Option<&mut TreeNode> {
        self.slots
            .get_mut(id.index as usize)
            .filter(|slot| slot.generation == id.generation)
            .and_then(|slot| slot.node.as_mut())
    }

    fn alloc(&mut self, node: TreeNode) -> NodeId {
        if let Some(index) = self.free.pop() {
            let slot = &mut self.slots[index as usize];
            slot.node = Some(node);
            return NodeId {
                index,
                generation: slot.generation,
            };
        }
        let index = self.slots.len() as u32;
        self.slots.push(Slot {
            generation: 0,
            node: Some(node),
        });
        NodeId {
            index,
            generation: 0,
        }
    }

    fn release(&mut self, id: NodeId) {
        if let Some(slot) = self.slots.get_mut(id.index as usize) {
            if slot.generation == id.generation && slot.node.take().is_some() {
                slot.generation = slot.generation.wrapping_add(1);
                self.free.push(id.index);
            }
        }
    }

    fn live_count(&self) -> usize {
        self.slots.iter().filter(|s| s.node.is_some()).count()
    }

    /// `id` and all of its descendants, parents before children.
    fn subtree(&self, id: NodeId) -> Vec<NodeId> {
        let mut out = Vec::new();
        let mut stack = vec![id];
        while let Some(next) = stack.pop() {
            if let Some(node) = self.node(next) {
                out.push(next);
                stack.extend(node.children.values().copied());
            }
        }
        out
    }

    fn not_accessible(&self, id: NodeId) -> FsError {
        match self.path_of(id) {
            Some(path) => FsError::not_accessible(path),
            None => FsError::not_accessible(format!("<detached node {id}>")),
        }
    }

    fn check_live(&self, id: NodeId) -> FsResult<()> {
        match self.node(id) {
            Some(_) => Ok(()),
            None => Err(self.not_accessible(id)),
        }
    }

    fn check_exists(&self, id: NodeId) -> FsResult<()> {
        match self.node(id) {
            Some(node) if node.exists => Ok(()),
            _ => Err(self.not_accessible(id)),
        }
    }

    // ------------------------------------------------------------------
    // Paths
    // ------------------------------------------------------------------

    /// Path of a live node.
    pub fn path_of(&self, id: NodeId) -> Option<ResourcePath> {
        let chain = self.ancestry(id)?;
        let segments = chain
            .iter()
            .filter_map(|&nid| self.node(nid).map(|n| n.name.clone()))
            .collect();
        Some(ResourcePath::from_segments(segments))
    }

    /// Node ids from the root down to `id` inclusive.
    pub fn ancestry(&self, id: NodeId) -> Option<Vec<NodeId>> {
        let mut chain = vec![id];
        let mut current = self.node(id)?;
        while let Some(parent) = current.parent {
            chain.push(parent);
            current = self.node(parent)?;
        }
        chain.reverse();
        Some(chain)
    }

    /// Find the node for `path` without creating anything.
    pub fn lookup(&self, path: &ResourcePath) -> Option<NodeId> {
        let (first, rest) = path.segments().split_first()?;
        let mut current = *self.roots.get(first)?;
        for seg in rest {
            current = *self.node(current)?.children.get(seg)?;
        }
        Some(current)
    }

    /// Walk `path` from its root, creating phantoms for unseen segments.
    ///
    /// An unknown first segment creates a new, non-existing root. Returns
    /// the node and whether it was created by this call.
    pub fn resolve_path(&mut self, path: &ResourcePath) -> FsResult<(NodeId, bool)> {
        let (first, rest) = path
            .segments()
            .split_first()
            .ok_or_else(|| FsError::invalid_path("the workspace path has no node"))?;

        let mut created = false;
        let mut current = match self.roots.get(first) {
            Some(&id) => id,
            None => {
                let id = self.alloc(TreeNode::phantom(first.as_str(), None));
                self.roots.insert(first.clone(), id);
                tracing::debug!(root = %first, "created root on first touch");
                created = true;
                id
            }
        };

        for seg in rest {
            let existing = self
                .node(current)
                .ok_or_else(|| self.not_accessible(current))?
                .children
                .get(seg)
                .copied();
            current = match existing {
                Some(id) => {
                    created = false;
                    id
                }
                None => {
                    let id = self.alloc(TreeNode::phantom(seg.as_str(), Some(current)));
                    if let Some(parent) = self.node_mut(current) {
                        parent.children.insert(seg.clone(), id);
                    }
                    created = true;
                    id
                }
            };
        }
        Ok((current, created))
    }

    // ------------------------------------------------------------------
    // Roots and structure
    // ------------------------------------------------------------------

    /// Names of existing roots, in creation order.
    pub fn roots(&self) -> Vec<String> {
        self.roots
            .iter()
            .filter(|(_, id)| self.node(**id).is_some_and(|n| n.exists))
            .map(|(name, _)| name.clone())
            .collect()
    }

    /// Create (or materialize a phantom) root.
    pub fn add_root(&mut self, name: &str, provider_id: Option<&str>) -> FsResult<NodeId> {
        let path = ResourcePath::workspace().child(name)?;
        let (id, _) = self.resolve_path(&path)?;
        let node = self
            .node_mut(id)
            .ok_or_else(|| FsError::not_accessible(&path))?;
        if node.exists {
            return Err(FsError::already_exists(&path));
        }
        node.exists = true;
        node.node_type = NodeType::Project;
        node.local_only = true;
        if let Some(provider_id) = provider_id {
            node.assigned_provider_id = Some(provider_id.to_string());
        }
        self.invalidate_bindings(id);
        self.touch();
        Ok(id)
    }

    /// Add an existing child under an existing parent.
    ///
    /// A phantom of the same name is reused; an existing sibling of the
    /// same name is an error.
    pub fn add_child(
        &mut self,
        parent: NodeId,
        name: &str,
        node_type: NodeType,
        provider_id: Option<&str>,
        local_only: bool,
    ) -> FsResult<NodeId> {
        self.check_exists(parent)?;
        let parent_path = self
            .path_of(parent)
            .ok_or_else(|| self.not_accessible(parent))?;
        let child_path = parent_path.child(name)?;

        let existing = self
            .node(parent)
            .and_then(|p| p.children.get(name).copied());

        let id = match existing {
            Some(id) => {
                let child = self
                    .node_mut(id)
                    .ok_or_else(|| FsError::not_accessible(&child_path))?;
                if child.exists {
                    return Err(FsError::already_exists(&child_path));
                }
                child.exists = true;
                child.node_type = node_type;
                child.local_only = local_only;
                if let Some(provider_id) = provider_id {
                    child.assigned_provider_id = Some(provider_id.to_string());
                }
                self.invalidate_bindings(id);
                id
            }
            None => {
                let mut child = TreeNode::phantom(name, Some(parent));
                child.exists = true;
                child.node_type = node_type;
                child.local_only = local_only;
                child.assigned_provider_id = provider_id.map(str::to_string);
                let id = self.alloc(child);
                if let Some(parent) = self.node_mut(parent) {
                    parent.children.insert(name.to_string(), id);
                }
                id
            }
        };

        self.touch();
        Ok(id)
    }

    /// Mark a phantom as existing. Returns false if it already existed.
    pub fn mark_exists(
        &mut self,
        id: NodeId,
        node_type: Option<NodeType>,
        local_only: bool,
    ) -> FsResult<bool> {
        self.check_live(id)?;
        let parent = self.node(id).and_then(|n| n.parent);
        if let Some(parent) = parent {
            self.check_exists(parent)?;
        }

        let node = self.node_mut(id).ok_or_else(|| FsError::not_accessible(id))?;
        if node.exists {
            return Ok(false);
        }
        node.exists = true;
        node.local_only = local_only;
        if let Some(node_type) = node_type {
            node.node_type = node_type;
        }
        self.invalidate_bindings(id);
        self.touch();
        Ok(true)
    }

    /// Mark `id` and every non-existing ancestor as existing.
    ///
    /// Implicit ancestors become local-only folders (projects at the root).
    pub fn materialize(&mut self, id: NodeId) -> FsResult<()> {
        let chain = self.ancestry(id).ok_or_else(|| self.not_accessible(id))?;
        let mut changed = false;
        for (depth, &nid) in chain.iter().enumerate() {
            let is_target = nid == id;
            let Some(node) = self.node_mut(nid) else {
                continue;
            };
            if node.exists {
                continue;
            }
            node.exists = true;
            if !is_target {
                node.local_only = true;
                if node.node_type == NodeType::Unknown {
                    node.node_type = if depth == 0 {
                        NodeType::Project
                    } else {
                        NodeType::Folder
                    };
                }
            }
            changed = true;
        }
        if changed {
            if let Some(&top) = chain.first() {
                self.invalidate_bindings(top);
            }
            self.touch();
        }
        Ok(())
    }

    /// Detach `id` from the tree and discard its whole subtree.
    ///
    /// Handles to removed nodes become stale. Returns the removed path.
    pub fn remove(&mut self, id: NodeId) -> FsResult<ResourcePath> {
        let path = self.path_of(id).ok_or_else(|| self.not_accessible(id))?;
        let (name, parent) = match self.node(id) {
            Some(node) => (node.name.clone(), node.parent),
            None => return Err(FsError::not_accessible(&path)),
        };

        match parent {
            Some(parent) => {
                if let Some(parent) = self.node_mut(parent) {
                    parent.children.remove(&name);
                }
            }
            None => {
                self.roots.shift_remove(&name);
            }
        }

        let removed = self.subtree(id);
        for &nid in &removed {
            self.release(nid);
        }
        self.uri_index.invalidate();
        self.touch();
        tracing::debug!(path = %path, nodes = removed.len(), "removed subtree");
        Ok(path)
    }

    /// Names of existing children, sorted.
    pub fn list_existing_children(&self, id: NodeId) -> FsResult<Vec<String>> {
        Ok(self
            .existing_children(id)?
            .into_iter()
            .map(|(name, _)| name)
            .collect())
    }

    /// Existing children with their ids, sorted by name.
    pub fn existing_children(&self, id: NodeId) -> FsResult<Vec<(String, NodeId)>> {
        let node = self.node(id).ok_or_else(|| self.not_accessible(id))?;
        let mut children: Vec<(String, NodeId)> = node
            .children
            .iter()
            .filter(|(_, child)| self.node(**child).is_some_and(|c| c.exists))
            .map(|(name, child)| (name.clone(), *child))
            .collect();
        children.sort_by(|a, b| a.0.cmp(&b.0));
        Ok(children)
    }

    /// Seed a freshly resolved node from path hints.
    pub(crate) fn apply_hints(&mut self, id: NodeId, hints: &PathHints) -> FsResult<()> {
        self.check_live(id)?;
        if let Some(provider_id) = hints.provider.as_deref() {
            self.set_assigned_provider(id, Some(provider_id))?;
        }
        if let Some(node_type) = hints.node_type {
            if let Some(node) = self.node_mut(id) {
                node.node_type = node_type;
            }
            self.dirty = true;
        }
        if let Some(uri) = hints.uri.as_deref() {
            self.write_remote_uri(id, Some(uri))?;
        }
        if hints.create == Some(true) {
            self.materialize(id)?;
        }
        Ok(())
    }

    // ------------------------------------------------------------------
    // Provider ids and bindings
    // ------------------------------------------------------------------

    /// Set or clear the explicit provider id of `id`.
    ///
    /// Federation decisions below it were made by the old provider and are
    /// discarded.
    pub fn set_assigned_provider(&mut self, id: NodeId, provider_id: Option<&str>) -> FsResult<()> {
        self.check_live(id)?;
        for nid in self.subtree(id) {
            if let Some(node) = self.node_mut(nid) {
                node.binding = None;
                if nid == id {
                    node.assigned_provider_id = provider_id.map(str::to_string);
                } else {
                    node.dynamic_provider_id = None;
                }
            }
        }
        self.touch();
        Ok(())
    }

    /// Record a federation decision on `id`.
    ///
    /// A different decision already on the node is a contract violation.
    pub(crate) fn set_dynamic_provider(&mut self, id: NodeId, provider_id: &str) -> FsResult<()> {
        let node = self.node(id).ok_or_else(|| self.not_accessible(id))?;
        match node.dynamic_provider_id.as_deref() {
            Some(current) if current == provider_id => return Ok(()),
            Some(current) => {
                let path = self.path_of(id).unwrap_or_default();
                return Err(FsError::federation_violation(
                    path,
                    format!("federated to {provider_id:?} but already federated to {current:?}"),
                ));
            }
            None => {}
        }

        self.invalidate_bindings(id);
        if let Some(node) = self.node_mut(id) {
            node.dynamic_provider_id = Some(provider_id.to_string());
        }
        self.touch();
        Ok(())
    }

    pub(crate) fn binding(&self, id: NodeId) -> Option<ResolvedProvider> {
        self.node(id).and_then(|n| n.binding.clone())
    }

    pub(crate) fn set_binding(&mut self, id: NodeId, binding: ResolvedProvider) {
        if let Some(node) = self.node_mut(id) {
            node.binding = Some(binding);
        }
    }

    /// Forget every binding, e.g. after a provider factory was replaced.
    ///
    /// Bumps the epoch so resolutions already in flight do not bind the
    /// old instances. Nothing persisted changes.
    pub(crate) fn clear_bindings(&mut self) {
        for node in self.slots.iter_mut().filter_map(|slot| slot.node.as_mut()) {
            node.binding = None;
        }
        self.epoch += 1;
    }

    fn invalidate_bindings(&mut self, id: NodeId) {
        for nid in self.subtree(id) {
            if let Some(node) = self.node_mut(nid) {
                node.binding = None;
            }
        }
    }

    // ------------------------------------------------------------------
    // Properties
    // ------------------------------------------------------------------

    pub fn persistent_property(&self, id: NodeId, key: &str) -> Option<String> {
        self.node(id)
            .filter(|n| n.exists)
            .and_then(|n| n.persistent.get(key).cloned())
    }

    pub fn set_persistent_property(&mut self, id: NodeId, key: &str, value: &str) -> FsResult<()> {
        self.check_exists(id)?;
        let node = self.node_mut(id).ok_or_else(|| FsError::not_accessible(id))?;
        node.persistent.insert(key.to_string(), value.to_string());
        self.dirty = true;
        Ok(())
    }

    /// Returns the removed value, if any.
    pub fn remove_persistent_property(&mut self, id: NodeId, key: &str) -> FsResult<Option<String>> {
        self.check_exists(id)?;
        let node = self.node_mut(id).ok_or_else(|| FsError::not_accessible(id))?;
        let old = node.persistent.remove(key);
        if old.is_some() {
            self.dirty = true;
        }
        Ok(old)
    }

    pub fn session_property(&self, id: NodeId, key: &str) -> Option<SessionValue> {
        self.node(id)
            .filter(|n| n.exists)
            .and_then(|n| n.session.get(key).cloned())
    }

    pub fn set_session_property(&mut self, id: NodeId, key: &str, value: SessionValue) -> FsResult<()> {
        self.check_exists(id)?;
        let node = self.node_mut(id).ok_or_else(|| FsError::not_accessible(id))?;
        node.session.insert(key.to_string(), value);
        Ok(())
    }

    pub fn remove_session_property(&mut self, id: NodeId, key: &str) -> FsResult<Option<SessionValue>> {
        self.check_exists(id)?;
        let node = self.node_mut(id).ok_or_else(|| FsError::not_accessible(id))?;
        Ok(node.session.remove(key))
    }

    // ------------------------------------------------------------------
    // Remote URIs
    // ------------------------------------------------------------------

    /// Set or clear the remote URI of an existing node.
    pub fn set_remote_uri(&mut self, id: NodeId, uri: Option<&str>) -> FsResult<()> {
        self.check_exists(id)?;
        self.write_remote_uri(id, uri)
    }

    /// Like [`Self::set_remote_uri`] without the existence check (path hints).
    pub(crate) fn write_remote_uri(&mut self, id: NodeId, uri: Option<&str>) -> FsResult<()> {
        let path = self.path_of(id).ok_or_else(|| self.not_accessible(id))?;
        let node = self.node_mut(id).ok_or_else(|| FsError::not_accessible(&path))?;
        let old = std::mem::replace(&mut node.remote_uri, uri.map(str::to_string));
        self.uri_index.update(&path, old.as_deref(), uri);
        self.dirty = true;
        Ok(())
    }

    /// Index lookup that needs no rebuild; `None` if the index is cold.
    pub fn cached_paths_for_uri(
        &self,
        uri: &str,
        prefix: Option<&ResourcePath>,
    ) -> Option<Vec<ResourcePath>> {
        self.uri_index.lookup(uri, prefix)
    }

    /// Paths tagged with `uri`, rebuilding the index if needed.
    pub fn paths_for_uri(&mut self, uri: &str, prefix: Option<&ResourcePath>) -> Vec<ResourcePath> {
        if !self.uri_index.is_built() {
            let entries: Vec<(String, ResourcePath)> = self
                .slots
                .iter()
                .enumerate()
                .filter_map(|(index, slot)| {
                    let node = slot.node.as_ref()?;
                    let uri = node.remote_uri.clone()?;
                    let id = NodeId {
                        index: index as u32,
                        generation: slot.generation,
                    };
                    Some((uri, self.path_of(id)?))
                })
                .collect();
            self.uri_index.rebuild(entries);
        }
        self.uri_index.lookup(uri, prefix).unwrap_or_default()
    }

    // ------------------------------------------------------------------
    // Persistence
    // ------------------------------------------------------------------

    /// Serializable view of everything that survives a restart.
    pub fn snapshot(&self) -> TreeSnapshot {
        let roots = self
            .roots
            .values()
            .filter_map(|&id| self.record(id))
            .collect();
        TreeSnapshot { roots }
    }

    fn record(&self, id: NodeId) -> Option<NodeRecord> {
        let node = self.node(id)?;
        let mut names: Vec<&String> = node.children.keys().collect();
        names.sort();
        let children: Vec<NodeRecord> = names
            .into_iter()
            .filter_map(|name| self.record(node.children[name]))
            .collect();

        if node.is_bare_phantom() && children.is_empty() {
            return None;
        }

        Some(NodeRecord {
            name: node.name.clone(),
            node_type: node.node_type,
            exists: node.exists,
            local_only: node.local_only,
            assigned_provider_id: node.assigned_provider_id.clone(),
            dynamic_provider_id: node.dynamic_provider_id.clone(),
            remote_uri: node.remote_uri.clone(),
            properties: node.persistent.clone(),
            children,
        })
    }

    /// Rebuild a tree from a snapshot.
    pub fn restore(snapshot: &TreeSnapshot) -> Self {
        let mut tree = Self::new();
        for record in &snapshot.roots {
            let id = tree.restore_node(record, None);
            tree.roots.insert(record.name.clone(), id);
        }
        tree
    }

    fn restore_node(&mut self, record: &NodeRecord, parent: Option<NodeId>) -> NodeId {
        let mut node = TreeNode::phantom(record.name.as_str(), parent);
        node.node_type = record.node_type;
        node.exists = record.exists;
        node.local_only = record.local_only;
        node.assigned_provider_id = record.assigned_provider_id.clone();
        node.dynamic_provider_id = record.dynamic_provider_id.clone();
        node.remote_uri = record.remote_uri.clone();
        node.persistent = record.properties.clone();
        let id = self.alloc(node);

        for child in &record.children {
            let child_id = self.restore_node(child, Some(id));
            if let Some(node) = self.node_mut(id) {
                node.children.insert(child.name.clone(), child_id);
            }
        }
        id
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn p(s: &str) -> ResourcePath {
        ResourcePath::parse(s).unwrap()
    }

    fn tree_with_root(name: &str) -> (ResourceTree, NodeId) {
        let mut tree = ResourceTree::new();
        let root = tree.add_root(name, None).unwrap();
        (tree, root)
    }

    #[test]
    fn test_resolve_creates_phantoms_and_root() {
        let mut tree = ResourceTree::new();
        let (id, created) = tree.resolve_path(&p("/P/F/g")).unwrap();
        assert!(created);
        assert!(!tree.node(id).unwrap().exists());
        assert_eq!(tree.path_of(id).unwrap(), p("/P/F/g"));

        // Phantom roots are not listed.
        assert!(tree.roots().is_empty());

        let (again, created) = tree.resolve_path(&p("/P/F/g")).unwrap();
        assert_eq!(again, id);
        assert!(!created);
    }

    #[test]
    fn test_resolve_workspace_is_invalid() {
        let mut tree = ResourceTree::new();
        assert!(matches!(
            tree.resolve_path(&ResourcePath::workspace()),
            Err(FsError::InvalidPath(_))
        ));
    }

    #[test]
    fn test_add_child_reuses_phantom() {
        let (mut tree, root) = tree_with_root("P");
        let (phantom, _) = tree.resolve_path(&p("/P/F")).unwrap();

        let id = tree.add_child(root, "F", NodeType::Folder, None, true).unwrap();
        assert_eq!(id, phantom);
        assert!(tree.node(id).unwrap().exists());
        assert_eq!(tree.list_existing_children(root).unwrap(), vec!["F"]);
    }

    #[test]
    fn test_add_child_collision() {
        let (mut tree, root) = tree_with_root("P");
        tree.add_child(root, "F", NodeType::Folder, None, true).unwrap();
        let err = tree
            .add_child(root, "F", NodeType::File, None, true)
            .unwrap_err();
        assert!(matches!(err, FsError::AlreadyExists { ref path } if path == "/P/F"));
    }

    #[test]
    fn test_add_child_under_phantom_parent() {
        let mut tree = ResourceTree::new();
        let (phantom, _) = tree.resolve_path(&p("/P/F")).unwrap();
        let err = tree
            .add_child(phantom, "g", NodeType::File, None, true)
            .unwrap_err();
        assert!(matches!(err, FsError::NotAccessible { .. }));
    }

    #[test]
    fn test_remove_clears_subtree() {
        let (mut tree, root) = tree_with_root("P");
        let folder = tree.add_child(root, "F", NodeType::Folder, None, true).unwrap();
        let file = tree.add_child(folder, "g", NodeType::File, None, true).unwrap();
        tree.set_persistent_property(file, "k", "v").unwrap();
        tree.set_persistent_property(folder, "k", "v").unwrap();

        let removed = tree.remove(folder).unwrap();
        assert_eq!(removed, p("/P/F"));
        assert!(tree.node(folder).is_none());
        assert!(tree.node(file).is_none());
        assert!(tree.lookup(&p("/P/F/g")).is_none());
        assert!(tree.list_existing_children(root).unwrap().is_empty());

        // Re-adding does not resurrect old state.
        let again = tree.add_child(root, "F", NodeType::Folder, None, true).unwrap();
        assert_ne!(again, folder);
        assert!(tree.node(again).unwrap().persistent_properties().is_empty());
    }

    #[test]
    fn test_stale_handle_is_not_accessible() {
        let (mut tree, root) = tree_with_root("P");
        let folder = tree.add_child(root, "F", NodeType::Folder, None, true).unwrap();
        tree.remove(folder).unwrap();
        // The slot is reused with a new generation.
        let other = tree.add_child(root, "G", NodeType::Folder, None, true).unwrap();
        assert_eq!(other.index, folder.index);

        assert!(matches!(
            tree.set_persistent_property(folder, "k", "v"),
            Err(FsError::NotAccessible { .. })
        ));
        assert!(matches!(tree.remove(folder), Err(FsError::NotAccessible { .. })));
    }

    #[test]
    fn test_properties_need_existing_node() {
        let mut tree = ResourceTree::new();
        let (phantom, _) = tree.resolve_path(&p("/P/x")).unwrap();
        assert!(tree.set_persistent_property(phantom, "k", "v").is_err());
        assert!(tree.persistent_property(phantom, "k").is_none());
    }

    #[test]
    fn test_dynamic_provider_conflict() {
        let mut tree = ResourceTree::new();
        let (id, _) = tree.resolve_path(&p("/A/B")).unwrap();
        tree.set_dynamic_provider(id, "Y").unwrap();
        tree.set_dynamic_provider(id, "Y").unwrap();
        assert!(matches!(
            tree.set_dynamic_provider(id, "Z"),
            Err(FsError::FederationContractViolation { .. })
        ));
    }

    #[test]
    fn test_assigning_provider_drops_federation_below() {
        let (mut tree, root) = tree_with_root("A");
        let (below, _) = tree.resolve_path(&p("/A/B")).unwrap();
        tree.set_dynamic_provider(below, "Y").unwrap();

        let epoch = tree.epoch();
        tree.set_assigned_provider(root, Some("X")).unwrap();
        assert!(tree.epoch() > epoch);
        assert_eq!(tree.node(root).unwrap().assigned_provider_id(), Some("X"));
        assert_eq!(tree.node(below).unwrap().dynamic_provider_id(), None);
    }

    #[test]
    fn test_materialize_creates_implicit_folders() {
        let mut tree = ResourceTree::new();
        let (id, _) = tree.resolve_path(&p("/P/a/b")).unwrap();
        tree.materialize(id).unwrap();

        let root = tree.lookup(&p("/P")).unwrap();
        let a = tree.lookup(&p("/P/a")).unwrap();
        assert_eq!(tree.node(root).unwrap().node_type(), NodeType::Project);
        assert_eq!(tree.node(a).unwrap().node_type(), NodeType::Folder);
        assert!(tree.node(a).unwrap().local_only());
        assert!(tree.node(id).unwrap().exists());
        assert_eq!(tree.roots(), vec!["P"]);
    }

    #[test]
    fn test_uri_index_lazily_built_and_invalidated() {
        let (mut tree, root) = tree_with_root("P");
        let file = tree.add_child(root, "f", NodeType::File, None, false).unwrap();
        tree.set_remote_uri(file, Some("https://h/f")).unwrap();

        assert!(tree.cached_paths_for_uri("https://h/f", None).is_none());
        assert_eq!(tree.paths_for_uri("https://h/f", None), vec![p("/P/f")]);

        tree.set_remote_uri(file, None).unwrap();
        assert_eq!(tree.cached_paths_for_uri("https://h/f", None), Some(vec![]));

        tree.set_remote_uri(file, Some("https://h/f")).unwrap();
        tree.remove(file).unwrap();
        assert!(tree.cached_paths_for_uri("https://h/f", None).is_none());
        assert!(tree.paths_for_uri("https://h/f", None).is_empty());
    }

    #[test]
    fn test_snapshot_omits_bare_phantoms() {
        let (mut tree, root) = tree_with_root("P");
        let folder = tree.add_child(root, "F", NodeType::Folder, None, true).unwrap();
        tree.set_persistent_property(folder, "color", "blue").unwrap();
        tree.resolve_path(&p("/P/ghost/deeper")).unwrap();
        let (federated, _) = tree.resolve_path(&p("/P/fed")).unwrap();
        tree.set_dynamic_provider(federated, "Y").unwrap();

        let snapshot = tree.snapshot();
        assert_eq!(snapshot.roots.len(), 1);
        let names: Vec<&str> = snapshot.roots[0]
            .children
            .iter()
            .map(|c| c.name.as_str())
            .collect();
        assert_eq!(names, vec!["F", "fed"]);

        let restored = ResourceTree::restore(&snapshot);
        let f = restored.lookup(&p("/P/F")).unwrap();
        assert_eq!(restored.persistent_property(f, "color").as_deref(), Some("blue"));
        let fed = restored.lookup(&p("/P/fed")).unwrap();
        assert_eq!(restored.node(fed).unwrap().dynamic_provider_id(), Some("Y"));
        assert!(!restored.is_dirty());
    }
}
