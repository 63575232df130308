//! Local mirror of tree items

use crate::id::{ItemId, NodeId, PropertyId};
use crate::name::{Name, Path};
use crate::service::{ChildInfo, NodeInfo, PropertyInfo};
use crate::value::{PropertyType, QValue};

/// Existence status of an [`ItemState`]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ItemStatus {
    /// Created locally, not yet known to the backend
    New,
    /// Backed by an item in the remote workspace
    Existing,
    /// Backed, but the backend reported a change not reflected yet
    Stale,
    /// Removed locally or remotely
    Removed,
}

/// Node-specific part of an [`ItemState`]
#[derive(Debug, Clone, PartialEq)]
pub struct NodeData {
    /// `None` for the root node
    pub name: Option<Name>,
    pub primary_type: Name,
    pub mixins: Vec<Name>,
    pub parent: Option<NodeId>,
    pub children: Vec<ChildInfo>,
    pub property_names: Vec<Name>,
    pub references: Vec<PropertyId>,
}

/// Property-specific part of an [`ItemState`]
#[derive(Debug, Clone, PartialEq)]
pub struct PropertyData {
    pub property_type: PropertyType,
    pub multi_valued: bool,
    pub values: Vec<QValue>,
}

#[derive(Debug, Clone, PartialEq)]
pub enum ItemData {
    Node(NodeData),
    Property(PropertyData),
}

/// Local mirror of one tree item
#[derive(Debug, Clone, PartialEq)]
pub struct ItemState {
    id: ItemId,
    status: ItemStatus,
    path: Option<Path>,
    /// Id of the backed counterpart; `None` for new items
    workspace_id: Option<ItemId>,
    data: ItemData,
}

impl ItemState {
    /// State for a node created locally
    pub fn new_node(id: NodeId, name: Name, primary_type: Name, parent: NodeId) -> Self {
        Self {
            id: ItemId::Node(id),
            status: ItemStatus::New,
            path: None,
            workspace_id: None,
            data: ItemData::Node(NodeData {
                name: Some(name),
                primary_type,
                mixins: Vec::new(),
                parent: Some(parent),
                children: Vec::new(),
                property_names: Vec::new(),
                references: Vec::new(),
            }),
        }
    }

    /// State for a property created locally
    pub fn new_property(
        id: PropertyId,
        property_type: PropertyType,
        multi_valued: bool,
        values: Vec<QValue>,
    ) -> Self {
        Self {
            id: ItemId::Property(id),
            status: ItemStatus::New,
            path: None,
            workspace_id: None,
            data: ItemData::Property(PropertyData {
                property_type,
                multi_valued,
                values,
            }),
        }
    }

    pub fn from_node_info(info: NodeInfo) -> Self {
        let id = ItemId::Node(info.id);
        Self {
            workspace_id: Some(id.clone()),
            id,
            status: ItemStatus::Existing,
            path: Some(info.path),
            data: ItemData::Node(NodeData {
                name: info.name,
                primary_type: info.primary_type,
                mixins: info.mixins,
                parent: info.parent,
                children: info.children,
                property_names: info.property_names,
                references: info.references,
            }),
        }
    }

    pub fn from_property_info(info: PropertyInfo) -> Self {
        let id = ItemId::Property(info.id);
        Self {
            workspace_id: Some(id.clone()),
            id,
            status: ItemStatus::Existing,
            path: Some(info.path),
            data: ItemData::Property(PropertyData {
                property_type: info.property_type,
                multi_valued: info.multi_valued,
                values: info.values,
            }),
        }
    }

    pub fn id(&self) -> &ItemId {
        &self.id
    }

    pub fn status(&self) -> ItemStatus {
        self.status
    }

    pub fn path(&self) -> Option<&Path> {
        self.path.as_ref()
    }

    pub fn workspace_id(&self) -> Option<&ItemId> {
        self.workspace_id.as_ref()
    }

    pub fn data(&self) -> &ItemData {
        &self.data
    }

    pub fn is_node(&self) -> bool {
        matches!(self.data, ItemData::Node(_))
    }

    pub fn as_node(&self) -> Option<&NodeData> {
        match &self.data {
            ItemData::Node(node) => Some(node),
            ItemData::Property(_) => None,
        }
    }

    pub fn as_property(&self) -> Option<&PropertyData> {
        match &self.data {
            ItemData::Property(property) => Some(property),
            ItemData::Node(_) => None,
        }
    }

    /// Parent node, if any
    pub fn parent(&self) -> Option<&NodeId> {
        match (&self.id, &self.data) {
            (ItemId::Property(id), _) => Some(id.parent()),
            (ItemId::Node(_), ItemData::Node(node)) => node.parent.as_ref(),
            _ => None,
        }
    }

    /// Whether the backend holds a counterpart
    pub fn is_backed(&self) -> bool {
        self.workspace_id.is_some()
    }

    pub(crate) fn set_status(&mut self, status: ItemStatus) {
        self.status = status;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn name(s: &str) -> Name {
        Name::new(s).unwrap()
    }

    #[test]
    fn test_new_states_are_not_backed() {
        let parent = NodeId::from_unique_id("p");
        let state = ItemState::new_node(
            NodeId::from_unique_id("n"),
            name("child"),
            name("nt:unstructured"),
            parent.clone(),
        );
        assert_eq!(state.status(), ItemStatus::New);
        assert!(!state.is_backed());
        assert!(state.is_node());
        assert_eq!(state.parent(), Some(&parent));
    }

    #[test]
    fn test_from_property_info() {
        let parent = NodeId::from_unique_id("p");
        let id = crate::id::DefaultIdFactory;
        let pid = crate::id::IdFactory::create_property_id(&id, &parent, name("jcr:title"));
        let state = ItemState::from_property_info(PropertyInfo {
            id: pid.clone(),
            path: Path::parse("/a/jcr:title").unwrap(),
            property_type: PropertyType::String,
            multi_valued: false,
            values: vec![QValue::String("Hello".into())],
        });
        assert_eq!(state.status(), ItemStatus::Existing);
        assert_eq!(state.workspace_id(), Some(&ItemId::Property(pid)));
        assert_eq!(state.parent(), Some(&parent));
        assert_eq!(state.as_property().unwrap().values.len(), 1);
        assert!(state.as_node().is_none());
    }
}
