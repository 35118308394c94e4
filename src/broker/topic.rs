//! Topic management
//!
//! A `Topic` is one node of the hierarchical namespace. The namespace is
//! stored flat, keyed by full path, so a node refers to its parent and
//! children by path and never owns them. Only `TopicService`'s worker builds
//! or mutates nodes; everything else sees clones.

use serde::{Deserialize, Serialize};
use uuid::Uuid;

pub const TOPIC_SEPARATOR: char = '/';

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Topic {
    id: String,
    name: String,
    full_path: String,
    parent: Option<String>,
    children: Vec<String>,
}

impl Topic {
    /// Create a node named `name` below `parent` (a full path), or a root node.
    pub fn new(name: &str, parent: Option<&str>) -> Self {
        let full_path = match parent {
            Some(p) => format!("{p}{TOPIC_SEPARATOR}{name}"),
            None => name.to_string(),
        };
        Self {
            id: Uuid::new_v4().to_string(),
            name: name.to_string(),
            full_path,
            parent: parent.map(str::to_string),
            children: Vec::new(),
        }
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    /// The raw segment of this node.
    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn full_path(&self) -> &str {
        &self.full_path
    }

    pub fn parent(&self) -> Option<&str> {
        self.parent.as_deref()
    }

    /// Full paths of the children, in creation order.
    pub fn children(&self) -> &[String] {
        &self.children
    }

    pub fn is_root(&self) -> bool {
        self.parent.is_none()
    }

    pub fn is_leaf(&self) -> bool {
        self.children.is_empty()
    }

    pub(crate) fn add_child(&mut self, full_path: &str) {
        if !self.children.iter().any(|c| c == full_path) {
            self.children.push(full_path.to_string());
        }
    }

    pub(crate) fn remove_child(&mut self, full_path: &str) {
        self.children.retain(|c| c != full_path);
    }
}

/// Splits a raw topic string into its non-empty segments.
///
/// `"/a//b/"` and `"a/b"` both yield `["a", "b"]`.
pub fn segments(path: &str) -> Vec<&str> {
    path.split(TOPIC_SEPARATOR)
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .collect()
}

/// Canonical form of a topic path, or `None` if it has no segments.
pub fn normalize(path: &str) -> Option<String> {
    let parts = segments(path);
    if parts.is_empty() {
        None
    } else {
        Some(parts.join(&TOPIC_SEPARATOR.to_string()))
    }
}
