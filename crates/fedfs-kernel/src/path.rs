//! Resource paths and first-resolution hints.
//!
//! A path is a `/`-separated segment sequence; the first segment selects a
//! root. Externally supplied URIs may carry a `;key=value;...` suffix with
//! hints that seed a node the first time it is resolved:
//!
//! ```text
//! /project/src/lib.rs;provider=rest;type=file;uri=https://host/lib.rs;create=true
//! ```

use std::fmt;

use serde::{Deserialize, Serialize};

use crate::error::{FsError, FsResult};
use crate::tree::NodeType;

/// An absolute resource path.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Default, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ResourcePath {
    segments: Vec<String>,
}

impl ResourcePath {
    /// Parse a plain path (no hints). Empty segments are ignored.
    pub fn parse(s: &str) -> FsResult<Self> {
        let segments: Vec<String> = s
            .split('/')
            .filter(|seg| !seg.is_empty())
            .map(str::to_string)
            .collect();

        for seg in &segments {
            validate_segment(seg).map_err(|reason| {
                FsError::invalid_path(format!("{s:?}: {reason}"))
            })?;
        }
        Ok(Self { segments })
    }

    /// Build a path from already-validated segments.
    pub(crate) fn from_segments(segments: Vec<String>) -> Self {
        Self { segments }
    }

    /// The workspace path (no segments).
    pub fn workspace() -> Self {
        Self::default()
    }

    pub fn segments(&self) -> &[String] {
        &self.segments
    }

    /// Number of segments.
    pub fn len(&self) -> usize {
        self.segments.len()
    }

    pub fn is_empty(&self) -> bool {
        self.segments.is_empty()
    }

    /// Last segment, if any.
    pub fn name(&self) -> Option<&str> {
        self.segments.last().map(String::as_str)
    }

    /// First segment: the root this path lives under.
    pub fn root_name(&self) -> Option<&str> {
        self.segments.first().map(String::as_str)
    }

    pub fn parent(&self) -> Option<Self> {
        if self.segments.is_empty() {
            return None;
        }
        Some(self.prefix(self.segments.len() - 1))
    }

    /// Append one segment.
    pub fn child(&self, name: &str) -> FsResult<Self> {
        validate_segment(name)
            .map_err(|reason| FsError::invalid_path(format!("{name:?}: {reason}")))?;
        let mut segments = self.segments.clone();
        segments.push(name.to_string());
        Ok(Self { segments })
    }

    /// The first `len` segments (clamped to the path length).
    pub fn prefix(&self, len: usize) -> Self {
        Self {
            segments: self.segments[..len.min(self.segments.len())].to_vec(),
        }
    }

    /// Returns true if `self` equals `other` or lies below it.
    pub fn starts_with(&self, other: &ResourcePath) -> bool {
        self.segments.starts_with(&other.segments)
    }

    /// Key used for this path in the cache service.
    pub fn cache_key(&self) -> String {
        self.segments.join("/")
    }
}

impl fmt::Display for ResourcePath {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.segments.is_empty() {
            return f.write_str("/");
        }
        for seg in &self.segments {
            write!(f, "/{seg}")?;
        }
        Ok(())
    }
}

impl std::str::FromStr for ResourcePath {
    type Err = FsError;

    fn from_str(s: &str) -> FsResult<Self> {
        Self::parse(s)
    }
}

fn validate_segment(seg: &str) -> Result<(), &'static str> {
    if seg.is_empty() {
        return Err("empty segment");
    }
    if seg == "." || seg == ".." {
        return Err("relative segments are not allowed");
    }
    if seg.contains(['/', ';', '\0']) {
        return Err("segment contains a reserved character");
    }
    Ok(())
}

/// Out-of-band hints parsed from a `;key=value` suffix.
///
/// Only consumed when the addressed node is created by that resolution.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PathHints {
    /// Pre-seed `assignedProviderId`.
    pub provider: Option<String>,
    /// Pre-seed the node type.
    pub node_type: Option<NodeType>,
    /// Pre-seed the remote URI.
    pub uri: Option<String>,
    /// Mark the node existing on first resolution.
    pub create: Option<bool>,
}

impl PathHints {
    pub fn is_empty(&self) -> bool {
        self == &Self::default()
    }
}

/// Split `s` into a path and its hints.
///
/// Unknown hint keys are ignored; malformed values are an error.
pub fn parse_with_hints(s: &str) -> FsResult<(ResourcePath, PathHints)> {
    let mut parts = s.split(';');
    let path = ResourcePath::parse(parts.next().unwrap_or_default())?;

    let mut hints = PathHints::default();
    for part in parts.filter(|p| !p.is_empty()) {
        let (key, value) = part
            .split_once('=')
            .ok_or_else(|| FsError::invalid_path(format!("hint without value: {part:?}")))?;
        match key.trim() {
            "provider" => hints.provider = Some(value.to_string()),
            "type" => {
                let node_type = value
                    .parse::<NodeType>()
                    .map_err(|_| FsError::invalid_path(format!("unknown type hint {value:?}")))?;
                hints.node_type = Some(node_type);
            }
            "uri" => hints.uri = Some(value.to_string()),
            "create" => {
                let create = value
                    .parse::<bool>()
                    .map_err(|_| FsError::invalid_path(format!("bad create hint {value:?}")))?;
                hints.create = Some(create);
            }
            other => tracing::debug!(hint = %other, "ignoring unknown path hint"),
        }
    }
    Ok((path, hints))
}
