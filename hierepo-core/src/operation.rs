//! Mutation intents
//!
//! Tree and property edits are grouped into a [`ChangeLog`](crate::ChangeLog)
//! and applied as one batch. Workspace operations (versioning, locking,
//! cross-workspace copies) are atomic on their own and are executed one at a
//! time. `Move` is the only kind that can be used both ways.

use crate::event::InternalEventListener;
use crate::id::{ItemId, NodeId, PropertyId};
use crate::name::{Name, Path};
use crate::value::{PropertyType, QValue};
use std::fmt;
use std::sync::Arc;

/// Caller-supplied listener that receives the raw result of a merge
#[derive(Clone)]
pub struct MergeListener(pub Arc<dyn InternalEventListener>);

impl fmt::Debug for MergeListener {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("MergeListener")
    }
}

/// One mutation intent
#[derive(Debug, Clone)]
pub enum Operation {
    AddNode {
        parent: NodeId,
        name: Name,
        node_type: Name,
        /// Unique id requested for the new node
        uuid: Option<String>,
    },
    AddProperty {
        parent: NodeId,
        name: Name,
        property_type: PropertyType,
        values: Vec<QValue>,
        multi_valued: bool,
    },
    SetPropertyValue {
        property: PropertyId,
        property_type: PropertyType,
        values: Vec<QValue>,
        multi_valued: bool,
    },
    Remove {
        item: ItemId,
    },
    SetMixin {
        node: NodeId,
        mixins: Vec<Name>,
    },
    ReorderNodes {
        parent: NodeId,
        insert: NodeId,
        /// `None` moves the node to the end of the child list
        before: Option<NodeId>,
    },
    Move {
        source: NodeId,
        dest_parent: NodeId,
        dest_name: Name,
    },
    Clone {
        workspace: String,
        source: NodeId,
        dest_parent: NodeId,
        dest_name: Name,
        remove_existing: bool,
    },
    Copy {
        workspace: String,
        source: NodeId,
        dest_parent: NodeId,
        dest_name: Name,
    },
    Update {
        node: NodeId,
        source_workspace: String,
    },
    Checkout {
        node: NodeId,
    },
    Checkin {
        node: NodeId,
    },
    Restore {
        /// Target node; `None` restores each version onto its own node
        node: Option<NodeId>,
        /// Path below `node` to restore into
        rel_path: Option<Path>,
        versions: Vec<NodeId>,
        remove_existing: bool,
    },
    Merge {
        node: NodeId,
        source_workspace: String,
        best_effort: bool,
        listener: MergeListener,
    },
    ResolveMergeConflict {
        node: NodeId,
        version: NodeId,
        /// `true` when the conflict is resolved in favor of the merged version
        resolve_done: bool,
    },
    Lock {
        node: NodeId,
        deep: bool,
    },
    LockRefresh {
        node: NodeId,
    },
    LockRelease {
        node: NodeId,
    },
    AddLabel {
        version_history: NodeId,
        version: NodeId,
        label: Name,
        move_label: bool,
    },
    RemoveLabel {
        version_history: NodeId,
        version: NodeId,
        label: Name,
    },
}

impl Operation {
    pub fn add_node(parent: NodeId, name: Name, node_type: Name) -> Self {
        Operation::AddNode {
            parent,
            name,
            node_type,
            uuid: None,
        }
    }

    /// Single-valued property
    pub fn add_property(parent: NodeId, name: Name, value: QValue) -> Self {
        Operation::AddProperty {
            parent,
            name,
            property_type: value.property_type(),
            values: vec![value],
            multi_valued: false,
        }
    }

    pub fn add_multi_property(
        parent: NodeId,
        name: Name,
        property_type: PropertyType,
        values: Vec<QValue>,
    ) -> Self {
        Operation::AddProperty {
            parent,
            name,
            property_type,
            values,
            multi_valued: true,
        }
    }

    /// New value for a single-valued property
    pub fn set_property_value(property: PropertyId, value: QValue) -> Self {
        Operation::SetPropertyValue {
            property,
            property_type: value.property_type(),
            values: vec![value],
            multi_valued: false,
        }
    }

    pub fn remove(item: impl Into<ItemId>) -> Self {
        Operation::Remove { item: item.into() }
    }

    pub fn move_node(source: NodeId, dest_parent: NodeId, dest_name: Name) -> Self {
        Operation::Move {
            source,
            dest_parent,
            dest_name,
        }
    }

    pub fn restore(node: Option<NodeId>, versions: Vec<NodeId>, remove_existing: bool) -> Self {
        Operation::Restore {
            node,
            rel_path: None,
            versions,
            remove_existing,
        }
    }

    pub fn merge(
        node: NodeId,
        source_workspace: impl Into<String>,
        best_effort: bool,
        listener: Arc<dyn InternalEventListener>,
    ) -> Self {
        Operation::Merge {
            node,
            source_workspace: source_workspace.into(),
            best_effort,
            listener: MergeListener(listener),
        }
    }

    /// Short name of the operation kind
    pub fn kind(&self) -> &'static str {
        match self {
            Operation::AddNode { .. } => "AddNode",
            Operation::AddProperty { .. } => "AddProperty",
            Operation::SetPropertyValue { .. } => "SetPropertyValue",
            Operation::Remove { .. } => "Remove",
            Operation::SetMixin { .. } => "SetMixin",
            Operation::ReorderNodes { .. } => "ReorderNodes",
            Operation::Move { .. } => "Move",
            Operation::Clone { .. } => "Clone",
            Operation::Copy { .. } => "Copy",
            Operation::Update { .. } => "Update",
            Operation::Checkout { .. } => "Checkout",
            Operation::Checkin { .. } => "Checkin",
            Operation::Restore { .. } => "Restore",
            Operation::Merge { .. } => "Merge",
            Operation::ResolveMergeConflict { .. } => "ResolveMergeConflict",
            Operation::Lock { .. } => "LockOperation",
            Operation::LockRefresh { .. } => "LockRefresh",
            Operation::LockRelease { .. } => "LockRelease",
            Operation::AddLabel { .. } => "AddLabel",
            Operation::RemoveLabel { .. } => "RemoveLabel",
        }
    }

    /// Kinds that only exist as part of a batch
    pub fn is_batch_only(&self) -> bool {
        matches!(
            self,
            Operation::AddNode { .. }
                | Operation::AddProperty { .. }
                | Operation::SetPropertyValue { .. }
                | Operation::Remove { .. }
                | Operation::SetMixin { .. }
                | Operation::ReorderNodes { .. }
        )
    }

    /// Kinds that may appear in a change log
    pub fn is_batchable(&self) -> bool {
        self.is_batch_only() || matches!(self, Operation::Move { .. })
    }
}

impl fmt::Display for Operation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Operation::AddNode { parent, name, node_type, .. } => {
                write!(f, "AddNode({} / {} : {})", parent, name, node_type)
            }
            Operation::AddProperty { parent, name, property_type, values, .. } => write!(
                f,
                "AddProperty({} / {} : {}, {} value(s))",
                parent,
                name,
                property_type,
                values.len()
            ),
            Operation::SetPropertyValue { property, values, .. } => {
                write!(f, "SetPropertyValue({}, {} value(s))", property, values.len())
            }
            Operation::Remove { item } => write!(f, "Remove({})", item),
            Operation::SetMixin { node, mixins } => write!(f, "SetMixin({}, {:?})", node, mixins),
            Operation::ReorderNodes { parent, insert, before } => match before {
                Some(before) => write!(f, "ReorderNodes({}: {} before {})", parent, insert, before),
                None => write!(f, "ReorderNodes({}: {} to end)", parent, insert),
            },
            Operation::Move { source, dest_parent, dest_name } => {
                write!(f, "Move({} -> {} / {})", source, dest_parent, dest_name)
            }
            Operation::Clone { workspace, source, dest_parent, dest_name, .. } => write!(
                f,
                "Clone({}:{} -> {} / {})",
                workspace, source, dest_parent, dest_name
            ),
            Operation::Copy { workspace, source, dest_parent, dest_name } => write!(
                f,
                "Copy({}:{} -> {} / {})",
                workspace, source, dest_parent, dest_name
            ),
            Operation::Update { node, source_workspace } => {
                write!(f, "Update({} from {})", node, source_workspace)
            }
            Operation::Restore { node, versions, .. } => match node {
                Some(node) => write!(f, "Restore({}, {} version(s))", node, versions.len()),
                None => write!(f, "Restore({} version(s))", versions.len()),
            },
            Operation::Merge { node, source_workspace, best_effort, .. } => write!(
                f,
                "Merge({} from {}, best_effort={})",
                node, source_workspace, best_effort
            ),
            Operation::ResolveMergeConflict { node, version, resolve_done } => write!(
                f,
                "ResolveMergeConflict({}, {}, done={})",
                node, version, resolve_done
            ),
            Operation::Lock { node, deep } => write!(f, "LockOperation({}, deep={})", node, deep),
            Operation::AddLabel { version, label, .. } => {
                write!(f, "AddLabel({} @ {})", label, version)
            }
            Operation::RemoveLabel { version, label, .. } => {
                write!(f, "RemoveLabel({} @ {})", label, version)
            }
            Operation::Checkout { node }
            | Operation::Checkin { node }
            | Operation::LockRefresh { node }
            | Operation::LockRelease { node } => write!(f, "{}({})", self.kind(), node),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn node(id: &str) -> NodeId {
        NodeId::from_unique_id(id)
    }

    fn name(s: &str) -> Name {
        Name::new(s).unwrap()
    }

    #[test]
    fn test_batchable_kinds() {
        let add = Operation::add_node(node("root"), name("foo"), name("nt:folder"));
        assert!(add.is_batch_only());
        assert!(add.is_batchable());

        let mv = Operation::move_node(node("a"), node("b"), name("c"));
        assert!(!mv.is_batch_only());
        assert!(mv.is_batchable());

        let checkin = Operation::Checkin { node: node("a") };
        assert!(!checkin.is_batchable());
        assert_eq!(checkin.kind(), "Checkin");
    }

    #[test]
    fn test_display() {
        let op = Operation::add_property(
            node("n1"),
            name("jcr:title"),
            QValue::String("Hello".into()),
        );
        assert_eq!(op.to_string(), "AddProperty([n1] / jcr:title : String, 1 value(s))");
        assert_eq!(
            Operation::Checkin { node: node("n1") }.to_string(),
            "Checkin([n1])"
        );
        let reorder = Operation::ReorderNodes {
            parent: node("p"),
            insert: node("a"),
            before: None,
        };
        assert_eq!(reorder.to_string(), "ReorderNodes([p]: [a] to end)");
    }
}
