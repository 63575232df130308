//! Item identifiers
//!
//! A node is addressed by a backend-assigned unique id, by a path, or by a
//! unique id plus a path relative to the node it identifies. Properties are
//! addressed by their parent node and name.

use crate::error::{RepositoryError, Result};
use crate::name::{Name, Path};
use serde::{Deserialize, Serialize};
use std::fmt;

/// Identifier of a node
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct NodeId {
    unique_id: Option<String>,
    path: Option<Path>,
}

impl NodeId {
    /// Node identified by its unique id alone
    pub fn from_unique_id(unique_id: impl Into<String>) -> Self {
        Self {
            unique_id: Some(unique_id.into()),
            path: None,
        }
    }

    /// Node identified by an absolute path
    pub fn from_path(path: Path) -> Result<Self> {
        if !path.is_absolute() {
            return Err(RepositoryError::MalformedPath(format!(
                "node id path must be absolute: {}",
                path
            )));
        }
        Ok(Self {
            unique_id: None,
            path: Some(path),
        })
    }

    pub fn unique_id(&self) -> Option<&str> {
        self.unique_id.as_deref()
    }

    pub fn path(&self) -> Option<&Path> {
        self.path.as_ref()
    }
}

impl fmt::Display for NodeId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match (&self.unique_id, &self.path) {
            (Some(id), Some(path)) => write!(f, "[{}]/{}", id, path),
            (Some(id), None) => write!(f, "[{}]", id),
            (None, Some(path)) => write!(f, "{}", path),
            (None, None) => f.write_str("<unaddressed>"),
        }
    }
}

/// Identifier of a property
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct PropertyId {
    parent: NodeId,
    name: Name,
}

impl PropertyId {
    pub fn parent(&self) -> &NodeId {
        &self.parent
    }

    pub fn name(&self) -> &Name {
        &self.name
    }
}

impl fmt::Display for PropertyId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.parent, self.name)
    }
}

/// Identifier of any item
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ItemId {
    Node(NodeId),
    Property(PropertyId),
}

impl ItemId {
    pub fn denotes_node(&self) -> bool {
        matches!(self, ItemId::Node(_))
    }

    /// The node itself, or the owning node of a property
    pub fn owning_node(&self) -> &NodeId {
        match self {
            ItemId::Node(id) => id,
            ItemId::Property(id) => id.parent(),
        }
    }

    pub fn as_node(&self) -> Option<&NodeId> {
        match self {
            ItemId::Node(id) => Some(id),
            ItemId::Property(_) => None,
        }
    }

    pub fn as_property(&self) -> Option<&PropertyId> {
        match self {
            ItemId::Property(id) => Some(id),
            ItemId::Node(_) => None,
        }
    }
}

impl From<NodeId> for ItemId {
    fn from(id: NodeId) -> Self {
        ItemId::Node(id)
    }
}

impl From<PropertyId> for ItemId {
    fn from(id: PropertyId) -> Self {
        ItemId::Property(id)
    }
}

impl fmt::Display for ItemId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ItemId::Node(id) => id.fmt(f),
            ItemId::Property(id) => id.fmt(f),
        }
    }
}

/// Factory for item identifiers
///
/// Backends may derive ids differently; the workspace layer only creates ids
/// through the factory its service hands out.
pub trait IdFactory: Send + Sync {
    /// Node with the given unique id
    fn create_node_id_from_unique_id(&self, unique_id: &str) -> NodeId {
        NodeId::from_unique_id(unique_id)
    }

    /// Node reached from `parent` by the relative path `rel_path`
    fn create_node_id(&self, parent: &NodeId, rel_path: &Path) -> Result<NodeId>;

    /// Property `name` of `parent`
    fn create_property_id(&self, parent: &NodeId, name: Name) -> PropertyId {
        PropertyId {
            parent: parent.clone(),
            name,
        }
    }
}

/// Stock id factory
///
/// Relative paths are appended to the parent's own path; a parent addressed
/// only by unique id gets the relative path attached to that id.
#[derive(Debug, Default, Clone, Copy)]
pub struct DefaultIdFactory;

impl IdFactory for DefaultIdFactory {
    fn create_node_id(&self, parent: &NodeId, rel_path: &Path) -> Result<NodeId> {
        if rel_path.is_absolute() {
            return Err(RepositoryError::MalformedPath(format!(
                "expected a relative path, got {}",
                rel_path
            )));
        }
        let path = match &parent.path {
            Some(base) => base.join(rel_path)?.normalize()?,
            None => rel_path.normalize()?,
        };
        Ok(NodeId {
            unique_id: parent.unique_id.clone(),
            path: Some(path),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_relative_node_id_keeps_unique_id() {
        let factory = DefaultIdFactory;
        let parent = NodeId::from_unique_id("abc");
        let id = factory
            .create_node_id(&parent, &Path::parse("child/grand").unwrap())
            .unwrap();
        assert_eq!(id.unique_id(), Some("abc"));
        assert_eq!(id.path().unwrap().to_string(), "child/grand");
        assert_eq!(id.to_string(), "[abc]/child/grand");
    }

    #[test]
    fn test_relative_node_id_from_path_parent() {
        let factory = DefaultIdFactory;
        let parent = NodeId::from_path(Path::parse("/a/b").unwrap()).unwrap();
        let id = factory
            .create_node_id(&parent, &Path::parse("../c").unwrap())
            .unwrap();
        assert_eq!(id.unique_id(), None);
        assert_eq!(id.path().unwrap().to_string(), "/a/c");

        assert!(factory.create_node_id(&parent, &Path::root()).is_err());
        assert!(NodeId::from_path(Path::parse("rel").unwrap()).is_err());
    }

    #[test]
    fn test_property_id() {
        let factory = DefaultIdFactory;
        let node = factory.create_node_id_from_unique_id("n1");
        let prop = factory.create_property_id(&node, Name::new("jcr:title").unwrap());
        assert_eq!(prop.parent(), &node);
        assert_eq!(prop.to_string(), "[n1]/jcr:title");

        let item: ItemId = prop.clone().into();
        assert!(!item.denotes_node());
        assert_eq!(item.owning_node(), &node);
        assert_eq!(item.as_property(), Some(&prop));
    }
}
