//! Namespace and node type checks applied to writes

use super::tree::MemNode;
use crate::error::{RepositoryError, Result};
use crate::name::{names, well_known, Name};
use crate::registry::{NamespaceRegistry, NodeTypeRegistry};
use crate::service::NodeTypeDefinition;
use std::collections::BTreeMap;

/// Properties maintained by the repository itself
const PROTECTED_PROPERTIES: &[&str] = &[
    names::JCR_PRIMARY_TYPE,
    names::JCR_MIXIN_TYPES,
    names::JCR_UUID,
    names::JCR_BASE_VERSION,
    names::JCR_VERSION_HISTORY,
    names::JCR_PREDECESSORS,
    names::JCR_IS_CHECKED_OUT,
    names::JCR_MERGE_FAILED,
    names::JCR_LOCK_OWNER,
    names::JCR_LOCK_IS_DEEP,
];

pub(crate) fn is_protected(name: &Name) -> bool {
    PROTECTED_PROPERTIES.contains(&name.as_str())
}

pub(crate) fn builtin_namespaces() -> BTreeMap<String, String> {
    [
        ("", ""),
        ("jcr", "http://www.jcp.org/jcr/1.0"),
        ("nt", "http://www.jcp.org/jcr/nt/1.0"),
        ("mix", "http://www.jcp.org/jcr/mix/1.0"),
        ("xml", "http://www.w3.org/XML/1998/namespace"),
        ("rep", "internal"),
    ]
    .into_iter()
    .map(|(p, u)| (p.to_string(), u.to_string()))
    .collect()
}

pub(crate) fn builtin_node_types() -> Vec<NodeTypeDefinition> {
    let def = |name: &'static str, supertypes: &[&'static str], is_mixin: bool| {
        NodeTypeDefinition::new(
            well_known(name),
            supertypes.iter().map(|s| well_known(*s)).collect(),
            is_mixin,
        )
    };
    let mut unstructured = def(names::NT_UNSTRUCTURED, &[names::NT_BASE], false);
    unstructured.orderable_child_nodes = true;
    let mut root = def(names::REP_ROOT, &[names::NT_UNSTRUCTURED], false);
    root.orderable_child_nodes = true;

    vec![
        def(names::NT_BASE, &[], false),
        unstructured,
        root,
        def(names::NT_HIERARCHY_NODE, &[names::NT_BASE], false),
        def(names::NT_FOLDER, &[names::NT_HIERARCHY_NODE], false),
        def(names::NT_FILE, &[names::NT_HIERARCHY_NODE], false),
        def(names::NT_RESOURCE, &[names::NT_BASE, names::MIX_REFERENCEABLE], false),
        def(names::MIX_REFERENCEABLE, &[], true),
        def(names::MIX_VERSIONABLE, &[names::MIX_REFERENCEABLE], true),
        def(names::MIX_LOCKABLE, &[], true),
    ]
}

/// Read-only view of the registries a write is validated against
#[derive(Clone, Copy)]
pub(crate) struct Schema<'a> {
    pub node_types: &'a NodeTypeRegistry,
    pub namespaces: &'a NamespaceRegistry,
}

impl<'a> Schema<'a> {
    pub fn check_name(&self, name: &Name) -> Result<()> {
        if self.namespaces.uri(name.prefix()).is_none() {
            return Err(RepositoryError::Namespace(format!(
                "unknown prefix in name {}",
                name
            )));
        }
        Ok(())
    }

    pub fn check_primary_type(&self, name: &Name) -> Result<()> {
        match self.node_types.get(name) {
            None => Err(RepositoryError::NoSuchNodeType(name.to_string())),
            Some(def) if def.is_mixin => Err(RepositoryError::ConstraintViolation(format!(
                "{} is a mixin and cannot be a primary type",
                name
            ))),
            Some(_) => Ok(()),
        }
    }

    pub fn check_mixin(&self, name: &Name) -> Result<()> {
        match self.node_types.get(name) {
            None => Err(RepositoryError::NoSuchNodeType(name.to_string())),
            Some(def) if !def.is_mixin => Err(RepositoryError::ConstraintViolation(format!(
                "{} is not a mixin type",
                name
            ))),
            Some(_) => Ok(()),
        }
    }

    /// Whether the node's primary type or one of its mixins is `candidate`
    /// or derives from it
    pub fn node_is(&self, node: &MemNode, candidate: &'static str) -> bool {
        std::iter::once(&node.primary_type)
            .chain(node.mixins.iter())
            .any(|t| self.type_is(t, candidate))
    }

    /// Nodes of unstructured types may have several children of one name
    pub fn allows_same_name_siblings(&self, node: &MemNode) -> bool {
        self.node_is(node, names::NT_UNSTRUCTURED)
    }

    pub fn has_orderable_children(&self, node: &MemNode) -> bool {
        self.node_types
            .definitions()
            .iter()
            .filter(|d| d.orderable_child_nodes)
            .any(|d| self.node_types.is_derived_from(&node.primary_type, &d.name))
    }

    pub fn type_is(&self, node_type: &Name, candidate: &'static str) -> bool {
        self.node_types
            .is_derived_from(node_type, &well_known(candidate))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_builtin_types_are_consistent() {
        let node_types = NodeTypeRegistry::new(builtin_node_types());
        let namespaces = NamespaceRegistry::new(builtin_namespaces(), true);
        let schema = Schema {
            node_types: &node_types,
            namespaces: &namespaces,
        };

        assert!(schema.check_primary_type(&well_known(names::NT_FOLDER)).is_ok());
        assert!(schema.check_primary_type(&well_known(names::MIX_LOCKABLE)).is_err());
        assert!(schema.check_mixin(&well_known(names::MIX_VERSIONABLE)).is_ok());
        assert!(schema.check_mixin(&Name::new("app:missing").unwrap()).is_err());
        assert!(schema.type_is(&well_known(names::MIX_VERSIONABLE), names::MIX_REFERENCEABLE));

        let node = MemNode {
            uuid: "n1".to_string(),
            name: Some(Name::new("doc").unwrap()),
            parent: None,
            primary_type: well_known(names::NT_FOLDER),
            mixins: vec![well_known(names::MIX_VERSIONABLE)],
            children: Vec::new(),
            properties: BTreeMap::new(),
        };
        assert!(schema.node_is(&node, names::MIX_REFERENCEABLE));
        assert!(!schema.node_is(&node, names::NT_UNSTRUCTURED));
        assert!(schema.check_name(&Name::new("title").unwrap()).is_ok());
        assert!(matches!(
            schema.check_name(&Name::new("app:title").unwrap()),
            Err(RepositoryError::Namespace(_))
        ));
        assert!(is_protected(&well_known(names::JCR_UUID)));
    }
}
