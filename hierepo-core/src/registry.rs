//! Local views of the backend's namespace and node-type registries

use crate::error::{RepositoryError, Result};
use crate::name::Name;
use crate::service::NodeTypeDefinition;
use std::collections::{BTreeMap, HashSet};

/// Prefixes built into every repository
pub const RESERVED_PREFIXES: &[&str] = &["", "jcr", "nt", "mix", "xml", "rep"];

/// Prefix to URI mapping of one session
#[derive(Debug, Clone, Default)]
pub struct NamespaceRegistry {
    namespaces: BTreeMap<String, String>,
    level2: bool,
}

impl NamespaceRegistry {
    /// `level2` tells whether the backend accepts registry changes at all.
    pub fn new(namespaces: BTreeMap<String, String>, level2: bool) -> Self {
        Self { namespaces, level2 }
    }

    pub fn uri(&self, prefix: &str) -> Option<&str> {
        self.namespaces.get(prefix).map(String::as_str)
    }

    pub fn prefix(&self, uri: &str) -> Option<&str> {
        self.namespaces
            .iter()
            .find(|(_, u)| u.as_str() == uri)
            .map(|(p, _)| p.as_str())
    }

    pub fn prefixes(&self) -> Vec<String> {
        self.namespaces.keys().cloned().collect()
    }

    pub fn mappings(&self) -> &BTreeMap<String, String> {
        &self.namespaces
    }

    fn ensure_writable(&self) -> Result<()> {
        if !self.level2 {
            return Err(RepositoryError::UnsupportedOperation(
                "repository does not support namespace registration".to_string(),
            ));
        }
        Ok(())
    }

    fn is_reserved_uri(&self, uri: &str) -> bool {
        self.prefix(uri)
            .is_some_and(|p| RESERVED_PREFIXES.contains(&p))
    }

    /// Reject a registration the backend would refuse
    pub fn check_registration(&self, prefix: &str, uri: &str) -> Result<()> {
        self.ensure_writable()?;
        if RESERVED_PREFIXES.contains(&prefix) || prefix.to_ascii_lowercase().starts_with("xml") {
            return Err(RepositoryError::Namespace(format!(
                "reserved prefix: {}",
                prefix
            )));
        }
        if prefix.is_empty() || prefix.contains(':') || uri.is_empty() {
            return Err(RepositoryError::Namespace(format!(
                "invalid namespace mapping {} -> {}",
                prefix, uri
            )));
        }
        if self.is_reserved_uri(uri) {
            return Err(RepositoryError::Namespace(format!("reserved uri: {}", uri)));
        }
        if let Some(existing) = self.uri(prefix) {
            if existing != uri {
                return Err(RepositoryError::Namespace(format!(
                    "prefix {} is already mapped to {}",
                    prefix, existing
                )));
            }
        }
        Ok(())
    }

    /// Record a mapping; an older prefix for the same URI is dropped.
    pub fn insert(&mut self, prefix: &str, uri: &str) {
        self.namespaces.retain(|_, u| u != uri);
        self.namespaces.insert(prefix.to_string(), uri.to_string());
    }

    pub fn check_unregistration(&self, uri: &str) -> Result<()> {
        self.ensure_writable()?;
        if self.is_reserved_uri(uri) {
            return Err(RepositoryError::Namespace(format!(
                "cannot unregister built-in namespace {}",
                uri
            )));
        }
        if self.prefix(uri).is_none() {
            return Err(RepositoryError::Namespace(format!(
                "unknown namespace: {}",
                uri
            )));
        }
        Ok(())
    }

    pub fn remove_uri(&mut self, uri: &str) {
        self.namespaces.retain(|_, u| u != uri);
    }
}

/// Node type definitions known to a session
#[derive(Debug, Clone, Default)]
pub struct NodeTypeRegistry {
    definitions: BTreeMap<Name, NodeTypeDefinition>,
}

impl NodeTypeRegistry {
    pub fn new(definitions: Vec<NodeTypeDefinition>) -> Self {
        let mut registry = Self::default();
        registry.insert_all(&definitions);
        registry
    }

    pub fn get(&self, name: &Name) -> Option<&NodeTypeDefinition> {
        self.definitions.get(name)
    }

    pub fn definitions(&self) -> Vec<NodeTypeDefinition> {
        self.definitions.values().cloned().collect()
    }

    /// Definitions that list `name` as a supertype
    pub fn subtypes_of<'a>(&'a self, name: &'a Name) -> impl Iterator<Item = &'a NodeTypeDefinition> {
        self.definitions
            .values()
            .filter(move |d| d.supertypes.contains(name))
    }

    pub fn contains(&self, name: &Name) -> bool {
        self.definitions.contains_key(name)
    }

    pub fn len(&self) -> usize {
        self.definitions.len()
    }

    pub fn is_empty(&self) -> bool {
        self.definitions.is_empty()
    }

    /// Whether `node_type` equals `candidate` or inherits from it
    pub fn is_derived_from(&self, node_type: &Name, candidate: &Name) -> bool {
        let mut seen = HashSet::new();
        let mut pending = vec![node_type];
        while let Some(current) = pending.pop() {
            if current == candidate {
                return true;
            }
            if !seen.insert(current) {
                continue;
            }
            if let Some(def) = self.definitions.get(current) {
                pending.extend(def.supertypes.iter());
            }
        }
        false
    }

    /// Reject definitions that already exist or name unknown supertypes
    pub fn check_new(&self, definitions: &[NodeTypeDefinition]) -> Result<()> {
        let incoming: HashSet<&Name> = definitions.iter().map(|d| &d.name).collect();
        for def in definitions {
            if self.contains(&def.name) {
                return Err(RepositoryError::ItemExists(format!(
                    "node type {} is already registered",
                    def.name
                )));
            }
            if let Some(missing) = def
                .supertypes
                .iter()
                .find(|s| !self.contains(s) && !incoming.contains(s))
            {
                return Err(RepositoryError::NoSuchNodeType(format!(
                    "supertype {} of {}",
                    missing, def.name
                )));
            }
        }
        Ok(())
    }

    pub fn insert_all(&mut self, definitions: &[NodeTypeDefinition]) {
        for def in definitions {
            self.definitions.insert(def.name.clone(), def.clone());
        }
    }

    pub fn remove_all(&mut self, names: &[Name]) {
        for name in names {
            self.definitions.remove(name);
        }
    }
}
