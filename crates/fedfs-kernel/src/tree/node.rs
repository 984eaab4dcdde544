//! Tree node records and arena handles.

use std::any::Any;
use std::collections::{BTreeMap, HashMap};
use std::fmt;
use std::sync::Arc;

use serde::{Deserialize, Serialize};

use crate::provider::ResolvedProvider;

/// Kind of resource a node stands for.
#[derive(
    Debug,
    Clone,
    Copy,
    PartialEq,
    Eq,
    Hash,
    Default,
    Serialize,
    Deserialize,
    strum::Display,
    strum::EnumString,
    strum::AsRefStr,
)]
#[serde(rename_all = "lowercase")]
#[strum(serialize_all = "lowercase")]
pub enum NodeType {
    #[default]
    Unknown,
    File,
    Folder,
    Project,
}

impl NodeType {
    /// Returns true for node types that may hold children.
    pub fn is_container(&self) -> bool {
        matches!(self, NodeType::Folder | NodeType::Project)
    }
}

/// Handle to a node slot in the tree arena.
///
/// The generation changes whenever a slot is freed, so a handle taken
/// before a removal never aliases a node created afterwards.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct NodeId {
    pub(crate) index: u32,
    pub(crate) generation: u32,
}

impl fmt::Display for NodeId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "#{}.{}", self.index, self.generation)
    }
}

/// Process-lifetime property value.
pub type SessionValue = Arc<dyn Any + Send + Sync>;

/// One path segment's record.
pub struct TreeNode {
    pub(crate) name: String,
    pub(crate) node_type: NodeType,
    pub(crate) exists: bool,
    pub(crate) local_only: bool,
    pub(crate) assigned_provider_id: Option<String>,
    pub(crate) dynamic_provider_id: Option<String>,
    pub(crate) persistent: BTreeMap<String, String>,
    pub(crate) session: HashMap<String, SessionValue>,
    pub(crate) remote_uri: Option<String>,
    pub(crate) parent: Option<NodeId>,
    pub(crate) children: HashMap<String, NodeId>,
    pub(crate) binding: Option<ResolvedProvider>,
}

impl TreeNode {
    /// A phantom: not existing, no ids, no properties.
    pub(crate) fn phantom(name: impl Into<String>, parent: Option<NodeId>) -> Self {
        Self {
            name: name.into(),
            node_type: NodeType::Unknown,
            exists: false,
            local_only: false,
            assigned_provider_id: None,
            dynamic_provider_id: None,
            persistent: BTreeMap::new(),
            session: HashMap::new(),
            remote_uri: None,
            parent,
            children: HashMap::new(),
            binding: None,
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn node_type(&self) -> NodeType {
        self.node_type
    }

    pub fn exists(&self) -> bool {
        self.exists
    }

    pub fn local_only(&self) -> bool {
        self.local_only
    }

    pub fn assigned_provider_id(&self) -> Option<&str> {
        self.assigned_provider_id.as_deref()
    }

    pub fn dynamic_provider_id(&self) -> Option<&str> {
        self.dynamic_provider_id.as_deref()
    }

    pub fn remote_uri(&self) -> Option<&str> {
        self.remote_uri.as_deref()
    }

    pub fn persistent_properties(&self) -> &BTreeMap<String, String> {
        &self.persistent
    }

    /// Assigned id if set, otherwise the federation-decided one.
    pub(crate) fn own_provider_id(&self) -> Option<&str> {
        self.assigned_provider_id
            .as_deref()
            .or(self.dynamic_provider_id.as_deref())
    }

    /// Returns true if nothing distinguishes this node from a fresh phantom.
    pub(crate) fn is_bare_phantom(&self) -> bool {
        !self.exists
            && self.assigned_provider_id.is_none()
            && self.dynamic_provider_id.is_none()
            && self.remote_uri.is_none()
            && self.persistent.is_empty()
    }
}

impl fmt::Debug for TreeNode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TreeNode")
            .field("name", &self.name)
            .field("node_type", &self.node_type)
            .field("exists", &self.exists)
            .field("local_only", &self.local_only)
            .field("assigned_provider_id", &self.assigned_provider_id)
            .field("dynamic_provider_id", &self.dynamic_provider_id)
            .field("remote_uri", &self.remote_uri)
            .field("children", &self.children.len())
            .finish()
    }
}
