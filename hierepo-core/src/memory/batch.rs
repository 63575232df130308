//! Recorded batches and their atomic application

use super::schema::{is_protected, Schema};
use super::tree::{MemProperty, WorkspaceTree};
use super::versions::{self, VersionStore};
use super::Journal;
use crate::error::{RepositoryError, Result};
use crate::event::Event;
use crate::id::{ItemId, NodeId, PropertyId};
use crate::name::{names, well_known, Name};
use crate::service::Batch;
use crate::value::{PropertyType, QValue, ValuePayload};

/// One recorded tree edit
#[derive(Debug, Clone)]
pub(crate) enum BatchOp {
    AddNode {
        parent: NodeId,
        name: Name,
        node_type: Name,
        uuid: Option<String>,
    },
    AddProperty {
        parent: NodeId,
        name: Name,
        property: MemProperty,
    },
    SetValue {
        id: PropertyId,
        property: MemProperty,
    },
    Remove(ItemId),
    SetMixins {
        node: NodeId,
        mixins: Vec<Name>,
    },
    Reorder {
        parent: NodeId,
        src: NodeId,
        before: Option<NodeId>,
    },
    Move {
        src: NodeId,
        dest_parent: NodeId,
        dest_name: Name,
    },
}

fn decode(payload: ValuePayload, property_type: PropertyType) -> Result<MemProperty> {
    let multi_valued = payload.is_multiple();
    Ok(MemProperty {
        property_type,
        multi_valued,
        values: payload.into_values(property_type)?,
    })
}

/// Batch of the in-memory backend
///
/// Payloads are decoded as they are recorded, so malformed values fail the
/// recording call. Ids are resolved only when the batch is submitted.
#[derive(Debug)]
pub struct MemoryBatch {
    pub(super) session_id: String,
    pub(super) user_id: String,
    pub(super) workspace: String,
    pub(super) lock_tokens: Vec<String>,
    target: ItemId,
    ops: Vec<BatchOp>,
    journal: Journal,
}

impl MemoryBatch {
    pub(super) fn new(
        session_id: String,
        user_id: String,
        workspace: String,
        lock_tokens: Vec<String>,
        target: ItemId,
        journal: Journal,
    ) -> Self {
        Self {
            session_id,
            user_id,
            workspace,
            lock_tokens,
            target,
            ops: Vec::new(),
            journal,
        }
    }

    /// Item the batch was created for
    pub fn target(&self) -> &ItemId {
        &self.target
    }

    pub fn len(&self) -> usize {
        self.ops.len()
    }

    pub fn is_empty(&self) -> bool {
        self.ops.is_empty()
    }

    fn record(&mut self, entry: &str, op: BatchOp) {
        self.journal.record(format!("batch.{}", entry));
        self.ops.push(op);
    }

    /// Apply every recorded edit to `tree` and `store`.
    ///
    /// The caller applies the batch to scratch copies and keeps them only on
    /// success.
    pub(super) fn apply(
        &self,
        tree: &mut WorkspaceTree,
        store: &mut VersionStore,
        schema: Schema<'_>,
    ) -> Result<Vec<Event>> {
        let tokens = self.lock_tokens.as_slice();
        let mut events = Vec::new();
        let mut removed = Vec::new();

        for op in &self.ops {
            match op {
                BatchOp::AddNode { parent, name, node_type, uuid } => {
                    let parent = tree.resolve(parent)?;
                    tree.check_writable(&parent, tokens)?;
                    schema.check_name(name)?;
                    schema.check_primary_type(node_type)?;
                    check_new_child(tree, schema, &parent, name)?;
                    let (uuid, event) =
                        tree.add_node(&parent, name.clone(), node_type.clone(), uuid.clone())?;
                    events.push(event);
                    events.extend(sync_type_properties(tree, store, schema, &uuid)?);
                }
                BatchOp::AddProperty { parent, name, property } => {
                    let uuid = tree.resolve(parent)?;
                    tree.check_writable(&uuid, tokens)?;
                    schema.check_name(name)?;
                    reject_protected(name)?;
                    events.push(tree.add_property(&uuid, name, property.clone())?);
                }
                BatchOp::SetValue { id, property } => {
                    let uuid = tree.resolve(id.parent())?;
                    tree.check_writable(&uuid, tokens)?;
                    reject_protected(id.name())?;
                    events.push(tree.change_property(&uuid, id.name(), property.clone())?);
                }
                BatchOp::Remove(ItemId::Node(node)) => {
                    let uuid = tree.resolve(node)?;
                    tree.check_writable(&uuid, tokens)?;
                    if let Some(parent) = tree.node(&uuid)?.parent.clone() {
                        tree.check_writable(&parent, tokens)?;
                    }
                    removed.extend(tree.descendants(&uuid));
                    events.extend(tree.remove_node(&uuid)?);
                }
                BatchOp::Remove(ItemId::Property(id)) => {
                    let uuid = tree.resolve(id.parent())?;
                    tree.check_writable(&uuid, tokens)?;
                    reject_protected(id.name())?;
                    events.push(tree.remove_property(&uuid, id.name())?);
                }
                BatchOp::SetMixins { node, mixins } => {
                    let uuid = tree.resolve(node)?;
                    tree.check_writable(&uuid, tokens)?;
                    for mixin in mixins {
                        schema.check_mixin(mixin)?;
                    }
                    events.extend(tree.set_mixins(&uuid, mixins.clone())?);
                    events.extend(sync_type_properties(tree, store, schema, &uuid)?);
                }
                BatchOp::Reorder { parent, src, before } => {
                    let parent = tree.resolve(parent)?;
                    tree.check_writable(&parent, tokens)?;
                    if !schema.has_orderable_children(tree.node(&parent)?) {
                        return Err(RepositoryError::ConstraintViolation(format!(
                            "child nodes of {} are not orderable",
                            tree.path_of(&parent)?
                        )));
                    }
                    let src = tree.resolve(src)?;
                    let before = before.as_ref().map(|b| tree.resolve(b)).transpose()?;
                    events.extend(tree.reorder(&parent, &src, before.as_deref())?);
                }
                BatchOp::Move { src, dest_parent, dest_name } => {
                    let uuid = tree.resolve(src)?;
                    let dest_parent = tree.resolve(dest_parent)?;
                    events.extend(move_subtree(tree, schema, tokens, &uuid, &dest_parent, dest_name)?);
                }
            }
        }

        check_referential_integrity(tree, &removed)?;
        Ok(events)
    }
}

/// Fail when `parent` already has a child `name` and does not allow
/// same-name siblings
pub(super) fn check_new_child(
    tree: &WorkspaceTree,
    schema: Schema<'_>,
    parent: &str,
    name: &Name,
) -> Result<()> {
    if tree.child(parent, name, 1).is_some() && !schema.allows_same_name_siblings(tree.node(parent)?) {
        return Err(RepositoryError::ItemExists(format!(
            "{} already has a child named {}",
            tree.path_of(parent)?,
            name
        )));
    }
    Ok(())
}

pub(super) fn move_subtree(
    tree: &mut WorkspaceTree,
    schema: Schema<'_>,
    tokens: &[String],
    uuid: &str,
    dest_parent: &str,
    dest_name: &Name,
) -> Result<Vec<Event>> {
    tree.check_writable(uuid, tokens)?;
    if let Some(parent) = tree.node(uuid)?.parent.clone() {
        tree.check_writable(&parent, tokens)?;
    }
    tree.check_writable(dest_parent, tokens)?;
    schema.check_name(dest_name)?;
    check_new_child(tree, schema, dest_parent, dest_name)?;
    tree.move_node(uuid, dest_parent, dest_name.clone())
}

fn reject_protected(name: &Name) -> Result<()> {
    if is_protected(name) {
        return Err(RepositoryError::ConstraintViolation(format!(
            "{} is maintained by the repository",
            name
        )));
    }
    Ok(())
}

/// Bring `jcr:uuid` and the version properties in line with the node's types
pub(super) fn sync_type_properties(
    tree: &mut WorkspaceTree,
    store: &mut VersionStore,
    schema: Schema<'_>,
    uuid: &str,
) -> Result<Vec<Event>> {
    let node = tree.node(uuid)?;
    let versionable = schema.node_is(node, names::MIX_VERSIONABLE);
    let referenceable = schema.node_is(node, names::MIX_REFERENCEABLE);

    if versionable && !node.is_versionable() {
        return versions::init_versionable(tree, store, uuid);
    }

    let mut events = Vec::new();
    if !versionable && node.is_versionable() {
        for name in [
            names::JCR_VERSION_HISTORY,
            names::JCR_BASE_VERSION,
            names::JCR_PREDECESSORS,
            names::JCR_IS_CHECKED_OUT,
            names::JCR_MERGE_FAILED,
        ] {
            events.extend(tree.remove_property_if_present(uuid, &well_known(name))?);
        }
    }
    let jcr_uuid = well_known(names::JCR_UUID);
    if referenceable {
        let value = MemProperty::single(QValue::String(uuid.to_string()));
        events.extend(tree.set_property(uuid, &jcr_uuid, value)?);
    } else {
        events.extend(tree.remove_property_if_present(uuid, &jcr_uuid)?);
    }
    Ok(events)
}

/// Fail when a removed node is still the target of a reference property
pub(super) fn check_referential_integrity(tree: &WorkspaceTree, removed: &[String]) -> Result<()> {
    for uuid in removed.iter().filter(|u| !tree.contains(u)) {
        if let Some(referrer) = tree.references_to(uuid).first() {
            return Err(RepositoryError::ConstraintViolation(format!(
                "removed node {} is still referenced by {}",
                uuid, referrer
            )));
        }
    }
    Ok(())
}

impl Batch for MemoryBatch {
    fn add_node(&mut self, parent: &NodeId, name: &Name, node_type: &Name, uuid: Option<&str>) -> Result<()> {
        self.record(
            "add_node",
            BatchOp::AddNode {
                parent: parent.clone(),
                name: name.clone(),
                node_type: node_type.clone(),
                uuid: uuid.map(str::to_string),
            },
        );
        Ok(())
    }

    fn add_property(
        &mut self,
        parent: &NodeId,
        name: &Name,
        value: ValuePayload,
        property_type: PropertyType,
    ) -> Result<()> {
        let property = decode(value, property_type)?;
        self.record(
            "add_property",
            BatchOp::AddProperty {
                parent: parent.clone(),
                name: name.clone(),
                property,
            },
        );
        Ok(())
    }

    fn set_value(&mut self, property: &PropertyId, value: ValuePayload, property_type: PropertyType) -> Result<()> {
        let decoded = decode(value, property_type)?;
        self.record(
            "set_value",
            BatchOp::SetValue {
                id: property.clone(),
                property: decoded,
            },
        );
        Ok(())
    }

    fn remove(&mut self, item: &ItemId) -> Result<()> {
        self.record("remove", BatchOp::Remove(item.clone()));
        Ok(())
    }

    fn set_mixins(&mut self, node: &NodeId, mixins: &[Name]) -> Result<()> {
        self.record(
            "set_mixins",
            BatchOp::SetMixins {
                node: node.clone(),
                mixins: mixins.to_vec(),
            },
        );
        Ok(())
    }

    fn reorder_nodes(&mut self, parent: &NodeId, src: &NodeId, before: Option<&NodeId>) -> Result<()> {
        self.record(
            "reorder_nodes",
            BatchOp::Reorder {
                parent: parent.clone(),
                src: src.clone(),
                before: before.cloned(),
            },
        );
        Ok(())
    }

    fn move_node(&mut self, src: &NodeId, dest_parent: &NodeId, dest_name: &Name) -> Result<()> {
        self.record(
            "move_node",
            BatchOp::Move {
                src: src.clone(),
                dest_parent: dest_parent.clone(),
                dest_name: dest_name.clone(),
            },
        );
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::memory::schema::{builtin_namespaces, builtin_node_types};
    use crate::memory::tree::{node_id, property_id, ROOT_UUID};
    use crate::registry::{NamespaceRegistry, NodeTypeRegistry};

    struct Fixture {
        tree: WorkspaceTree,
        store: VersionStore,
        node_types: NodeTypeRegistry,
        namespaces: NamespaceRegistry,
        journal: Journal,
    }

    impl Fixture {
        fn new() -> Self {
            Self {
                tree: WorkspaceTree::new("default"),
                store: VersionStore::default(),
                node_types: NodeTypeRegistry::new(builtin_node_types()),
                namespaces: NamespaceRegistry::new(builtin_namespaces(), true),
                journal: Journal::default(),
            }
        }

        fn batch(&self) -> MemoryBatch {
            MemoryBatch::new(
                "s1".into(),
                "alice".into(),
                "default".into(),
                Vec::new(),
                ItemId::Node(node_id(ROOT_UUID)),
                self.journal.clone(),
            )
        }

        fn apply(&mut self, batch: &MemoryBatch) -> Result<Vec<Event>> {
            let schema = Schema {
                node_types: &self.node_types,
                namespaces: &self.namespaces,
            };
            batch.apply(&mut self.tree, &mut self.store, schema)
        }
    }

    fn name(s: &str) -> Name {
        Name::new(s).unwrap()
    }

    fn root() -> NodeId {
        node_id(ROOT_UUID)
    }

    fn text(s: &str) -> ValuePayload {
        ValuePayload::Single(s.to_string())
    }

    #[test]
    fn test_recording_decodes_payloads() {
        let fixture = Fixture::new();
        let mut batch = fixture.batch();
        batch
            .add_property(&root(), &name("count"), text("7"), PropertyType::Long)
            .unwrap();
        let err = batch
            .add_property(&root(), &name("count"), text("seven"), PropertyType::Long)
            .unwrap_err();
        assert!(matches!(err, RepositoryError::InvalidPayload(_)));
        assert_eq!(batch.len(), 1);
        assert_eq!(fixture.journal.entries(), vec!["batch.add_property".to_string()]);
    }

    #[test]
    fn test_apply_in_order() {
        let mut fixture = Fixture::new();
        let mut batch = fixture.batch();
        batch
            .add_node(&root(), &name("a"), &well_known(names::NT_UNSTRUCTURED), Some("node-a"))
            .unwrap();
        let a = node_id("node-a");
        batch
            .add_property(&a, &name("title"), text("hello"), PropertyType::String)
            .unwrap();
        batch
            .set_value(&property_id("node-a", &name("title")), text("bye"), PropertyType::String)
            .unwrap();

        let events = fixture.apply(&batch).unwrap();
        assert_eq!(events.len(), 3);
        let title = fixture.tree.node("node-a").unwrap().properties.get("title").unwrap();
        assert_eq!(title.values, vec![QValue::String("bye".into())]);
    }

    #[test]
    fn test_protected_properties_rejected() {
        let mut fixture = Fixture::new();
        let mut batch = fixture.batch();
        batch
            .add_property(&root(), &well_known(names::JCR_UUID), text("x"), PropertyType::String)
            .unwrap();
        assert!(matches!(
            fixture.apply(&batch),
            Err(RepositoryError::ConstraintViolation(_))
        ));
    }

    #[test]
    fn test_versionable_mixin_starts_history() {
        let mut fixture = Fixture::new();
        let mut batch = fixture.batch();
        batch
            .add_node(&root(), &name("doc"), &well_known(names::NT_UNSTRUCTURED), Some("doc"))
            .unwrap();
        batch
            .set_mixins(&node_id("doc"), &[well_known(names::MIX_VERSIONABLE)])
            .unwrap();
        fixture.apply(&batch).unwrap();

        let doc = fixture.tree.node("doc").unwrap();
        assert!(doc.is_versionable());
        assert!(doc.is_checked_out());
        assert_eq!(
            doc.properties.get(names::JCR_UUID).unwrap().values,
            vec![QValue::String("doc".into())]
        );

        let mut batch = fixture.batch();
        batch.set_mixins(&node_id("doc"), &[]).unwrap();
        fixture.apply(&batch).unwrap();
        let doc = fixture.tree.node("doc").unwrap();
        assert!(!doc.is_versionable());
        assert!(!doc.properties.contains_key(names::JCR_UUID));
    }

    #[test]
    fn test_removing_referenced_node_fails() {
        let mut fixture = Fixture::new();
        let mut batch = fixture.batch();
        batch
            .add_node(&root(), &name("target"), &well_known(names::NT_UNSTRUCTURED), Some("t"))
            .unwrap();
        batch
            .add_property(&root(), &name("link"), text("t"), PropertyType::Reference)
            .unwrap();
        fixture.apply(&batch).unwrap();

        let mut batch = fixture.batch();
        batch.remove(&ItemId::Node(node_id("t"))).unwrap();
        assert!(matches!(
            fixture.apply(&batch),
            Err(RepositoryError::ConstraintViolation(_))
        ));

        let mut batch = fixture.batch();
        batch
            .remove(&ItemId::Property(property_id(ROOT_UUID, &name("link"))))
            .unwrap();
        batch.remove(&ItemId::Node(node_id("t"))).unwrap();
        let events = fixture.apply(&batch).unwrap();
        assert_eq!(events.len(), 2);
    }

    #[test]
    fn test_unknown_types_and_prefixes() {
        let mut fixture = Fixture::new();
        let mut batch = fixture.batch();
        batch
            .add_node(&root(), &name("a"), &name("app:thing"), None)
            .unwrap();
        assert!(matches!(
            fixture.apply(&batch),
            Err(RepositoryError::NoSuchNodeType(_))
        ));

        let mut batch = fixture.batch();
        batch
            .add_node(&root(), &name("app:a"), &well_known(names::NT_UNSTRUCTURED), None)
            .unwrap();
        assert!(matches!(fixture.apply(&batch), Err(RepositoryError::Namespace(_))));
    }

    #[test]
    fn test_folder_children_are_not_orderable() {
        let mut fixture = Fixture::new();
        let mut batch = fixture.batch();
        batch
            .add_node(&root(), &name("dir"), &well_known(names::NT_FOLDER), Some("dir"))
            .unwrap();
        batch
            .add_node(&node_id("dir"), &name("x"), &well_known(names::NT_FOLDER), Some("x"))
            .unwrap();
        batch
            .add_node(&node_id("dir"), &name("y"), &well_known(names::NT_FOLDER), Some("y"))
            .unwrap();
        fixture.apply(&batch).unwrap();

        let mut batch = fixture.batch();
        batch
            .reorder_nodes(&node_id("dir"), &node_id("y"), Some(&node_id("x")))
            .unwrap();
        assert!(matches!(
            fixture.apply(&batch),
            Err(RepositoryError::ConstraintViolation(_))
        ));

        let mut batch = fixture.batch();
        batch
            .add_node(&node_id("dir"), &name("x"), &well_known(names::NT_FOLDER), None)
            .unwrap();
        assert!(matches!(fixture.apply(&batch), Err(RepositoryError::ItemExists(_))));
    }
}
