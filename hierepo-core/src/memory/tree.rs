//! Node tree of one in-memory workspace

use crate::error::{RepositoryError, Result};
use crate::event::{Event, EventType};
use crate::id::{DefaultIdFactory, IdFactory, NodeId, PropertyId};
use crate::name::{names, well_known, Name, Path, PathElement};
use crate::service::{ChildInfo, NodeInfo, PropertyInfo};
use crate::value::{PropertyType, QValue};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap};

/// Unique id of the root node in every workspace
pub const ROOT_UUID: &str = "cafebabe-cafe-babe-cafe-babecafebabe";

pub(crate) fn node_id(uuid: &str) -> NodeId {
    NodeId::from_unique_id(uuid)
}

pub(crate) fn property_id(uuid: &str, name: &Name) -> PropertyId {
    DefaultIdFactory.create_property_id(&node_id(uuid), name.clone())
}

/// Stored property
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub(crate) struct MemProperty {
    pub property_type: PropertyType,
    pub multi_valued: bool,
    pub values: Vec<QValue>,
}

impl MemProperty {
    pub fn single(value: QValue) -> Self {
        Self {
            property_type: value.property_type(),
            multi_valued: false,
            values: vec![value],
        }
    }

    pub fn multiple(property_type: PropertyType, values: Vec<QValue>) -> Self {
        Self {
            property_type,
            multi_valued: true,
            values,
        }
    }

    /// Unique ids this property refers to
    pub fn references(&self) -> impl Iterator<Item = &str> {
        self.values.iter().filter_map(|v| match v {
            QValue::Reference(id) => Some(id.as_str()),
            _ => None,
        })
    }
}

/// Stored node
#[derive(Debug, Clone, Serialize, Deserialize)]
pub(crate) struct MemNode {
    pub uuid: String,
    pub name: Option<Name>,
    pub parent: Option<String>,
    pub primary_type: Name,
    #[serde(default)]
    pub mixins: Vec<Name>,
    /// Unique ids of the children, in order
    #[serde(default)]
    pub children: Vec<String>,
    #[serde(default)]
    pub properties: BTreeMap<Name, MemProperty>,
}

impl MemNode {
    /// Property by name, including the type properties derived from the node
    pub fn property(&self, name: &Name) -> Option<MemProperty> {
        match name.as_str() {
            names::JCR_PRIMARY_TYPE => Some(MemProperty::single(QValue::Name(self.primary_type.clone()))),
            names::JCR_MIXIN_TYPES if !self.mixins.is_empty() => Some(MemProperty::multiple(
                PropertyType::Name,
                self.mixins.iter().cloned().map(QValue::Name).collect(),
            )),
            _ => self.properties.get(name).cloned(),
        }
    }

    pub fn is_versionable(&self) -> bool {
        self.properties.contains_key(names::JCR_VERSION_HISTORY)
    }

    /// First value of a single-valued reference property
    pub fn reference(&self, name: &str) -> Option<String> {
        self.properties
            .get(name)
            .and_then(|p| p.references().next())
            .map(str::to_string)
    }

    /// All values of a reference property
    pub fn references(&self, name: &str) -> Vec<String> {
        self.properties
            .get(name)
            .map(|p| p.references().map(str::to_string).collect())
            .unwrap_or_default()
    }

    pub fn is_checked_out(&self) -> bool {
        !matches!(
            self.properties
                .get(names::JCR_IS_CHECKED_OUT)
                .and_then(|p| p.values.first()),
            Some(QValue::Boolean(false))
        )
    }
}

/// Lock held on a node; locks are scoped to the session that took them
#[derive(Debug, Clone)]
pub(crate) struct LockRecord {
    pub token: String,
    pub owner: String,
    pub session_id: String,
    pub is_deep: bool,
    pub created_at: DateTime<Utc>,
}

/// All nodes of one workspace, keyed by unique id
#[derive(Debug, Clone, Serialize, Deserialize)]
pub(crate) struct WorkspaceTree {
    pub name: String,
    pub root: String,
    pub nodes: HashMap<String, MemNode>,
    #[serde(skip)]
    pub locks: HashMap<String, LockRecord>,
}

impl WorkspaceTree {
    pub fn new(name: impl Into<String>) -> Self {
        let root = MemNode {
            uuid: ROOT_UUID.to_string(),
            name: None,
            parent: None,
            primary_type: well_known(names::REP_ROOT),
            mixins: Vec::new(),
            children: Vec::new(),
            properties: BTreeMap::new(),
        };
        Self {
            name: name.into(),
            root: ROOT_UUID.to_string(),
            nodes: HashMap::from([(ROOT_UUID.to_string(), root)]),
            locks: HashMap::new(),
        }
    }

    pub fn node(&self, uuid: &str) -> Result<&MemNode> {
        self.nodes
            .get(uuid)
            .ok_or_else(|| RepositoryError::ItemNotFound(format!("no node with id {}", uuid)))
    }

    pub fn node_mut(&mut self, uuid: &str) -> Result<&mut MemNode> {
        self.nodes
            .get_mut(uuid)
            .ok_or_else(|| RepositoryError::ItemNotFound(format!("no node with id {}", uuid)))
    }

    pub fn contains(&self, uuid: &str) -> bool {
        self.nodes.contains_key(uuid)
    }

    /// Unique id of the node `id` denotes
    pub fn resolve(&self, id: &NodeId) -> Result<String> {
        match (id.unique_id(), id.path()) {
            (Some(uuid), None) => Ok(self.node(uuid)?.uuid.clone()),
            (Some(uuid), Some(rel_path)) => {
                self.node(uuid)?;
                self.walk(uuid, rel_path, id)
            }
            (None, Some(path)) => self.walk(&self.root, path, id),
            (None, None) => Err(RepositoryError::IllegalArgument(
                "node id has neither a unique id nor a path".to_string(),
            )),
        }
    }

    fn walk(&self, start: &str, path: &Path, id: &NodeId) -> Result<String> {
        let not_found = || RepositoryError::PathNotFound(id.to_string());
        let mut current = start.to_string();
        for element in path.elements() {
            current = match element {
                PathElement::Root => self.root.clone(),
                PathElement::Current => current,
                PathElement::Parent => self.node(&current)?.parent.clone().ok_or_else(not_found)?,
                PathElement::Named { name, index } => self
                    .child(&current, name, *index)
                    .ok_or_else(not_found)?
                    .to_string(),
            };
        }
        Ok(current)
    }

    /// The `index`-th child of `parent` named `name` (1-based)
    pub fn child(&self, parent: &str, name: &Name, index: u32) -> Option<&str> {
        let parent = self.nodes.get(parent)?;
        parent
            .children
            .iter()
            .filter(|c| self.nodes.get(c.as_str()).and_then(|n| n.name.as_ref()) == Some(name))
            .nth(index.max(1) as usize - 1)
            .map(String::as_str)
    }

    fn sibling_index(&self, node: &MemNode) -> u32 {
        let Some(parent) = node.parent.as_ref().and_then(|p| self.nodes.get(p)) else {
            return 1;
        };
        let mut index = 0;
        for child in &parent.children {
            if self.nodes.get(child).and_then(|n| n.name.as_ref()) == node.name.as_ref() {
                index += 1;
            }
            if *child == node.uuid {
                break;
            }
        }
        index.max(1)
    }

    pub fn path_of(&self, uuid: &str) -> Result<Path> {
        let mut chain = Vec::new();
        let mut current = self.node(uuid)?;
        while let Some(parent) = &current.parent {
            chain.push(current);
            current = self.node(parent)?;
        }
        let mut path = Path::root();
        for node in chain.iter().rev() {
            if let Some(name) = &node.name {
                path = path.child_with_index(name.clone(), self.sibling_index(node));
            }
        }
        Ok(path)
    }

    /// `uuid` and all nodes below it, parents before children
    pub fn descendants(&self, uuid: &str) -> Vec<String> {
        let mut out = Vec::new();
        let mut stack = vec![uuid.to_string()];
        while let Some(current) = stack.pop() {
            if let Some(node) = self.nodes.get(&current) {
                stack.extend(node.children.iter().rev().cloned());
                out.push(current);
            }
        }
        out
    }

    /// Whether `ancestor` lies strictly above `uuid`
    pub fn is_ancestor(&self, ancestor: &str, uuid: &str) -> bool {
        let mut current = self.nodes.get(uuid).and_then(|n| n.parent.as_deref());
        while let Some(parent) = current {
            if parent == ancestor {
                return true;
            }
            current = self.nodes.get(parent).and_then(|n| n.parent.as_deref());
        }
        false
    }

    /// Reference properties anywhere in the workspace that point at `uuid`
    pub fn references_to(&self, uuid: &str) -> Vec<PropertyId> {
        let mut references: Vec<PropertyId> = self
            .nodes
            .values()
            .flat_map(|node| {
                node.properties
                    .iter()
                    .filter(|(_, p)| p.references().any(|r| r == uuid))
                    .map(move |(name, _)| property_id(&node.uuid, name))
            })
            .collect();
        references.sort_by_key(|p| p.to_string());
        references
    }

    pub fn uses_node_type(&self, node_type: &Name) -> bool {
        self.nodes
            .values()
            .any(|n| n.primary_type == *node_type || n.mixins.contains(node_type))
    }

    pub fn node_info(&self, uuid: &str) -> Result<NodeInfo> {
        let node = self.node(uuid)?;

        let mut counts: HashMap<&Name, u32> = HashMap::new();
        let children = node
            .children
            .iter()
            .filter_map(|c| self.nodes.get(c))
            .filter_map(|child| {
                let name = child.name.as_ref()?;
                let index = counts.entry(name).or_insert(0);
                *index += 1;
                Some(ChildInfo {
                    name: name.clone(),
                    index: *index,
                    id: node_id(&child.uuid),
                })
            })
            .collect();

        let mut property_names = vec![well_known(names::JCR_PRIMARY_TYPE)];
        if !node.mixins.is_empty() {
            property_names.push(well_known(names::JCR_MIXIN_TYPES));
        }
        property_names.extend(node.properties.keys().cloned());

        Ok(NodeInfo {
            id: node_id(uuid),
            path: self.path_of(uuid)?,
            name: node.name.clone(),
            primary_type: node.primary_type.clone(),
            mixins: node.mixins.clone(),
            parent: node.parent.as_deref().map(node_id),
            children,
            property_names,
            references: self.references_to(uuid),
        })
    }

    pub fn property_info(&self, id: &PropertyId) -> Result<PropertyInfo> {
        let uuid = self.resolve(id.parent())?;
        let property = self
            .node(&uuid)?
            .property(id.name())
            .ok_or_else(|| RepositoryError::ItemNotFound(id.to_string()))?;
        Ok(PropertyInfo {
            id: property_id(&uuid, id.name()),
            path: self.path_of(&uuid)?.child(id.name().clone()),
            property_type: property.property_type,
            multi_valued: property.multi_valued,
            values: property.values,
        })
    }

    // ── Edits ──────────────────────────────────────────────────

    fn property_event(&self, event_type: EventType, uuid: &str, name: &Name) -> Result<Event> {
        Ok(Event::new(event_type, property_id(uuid, name).into(), Some(node_id(uuid)))
            .with_path(self.path_of(uuid)?.child(name.clone())))
    }

    pub fn add_node(
        &mut self,
        parent: &str,
        name: Name,
        primary_type: Name,
        uuid: Option<String>,
    ) -> Result<(String, Event)> {
        self.node(parent)?;
        let uuid = uuid.unwrap_or_else(|| uuid::Uuid::new_v4().to_string());
        if self.contains(&uuid) {
            return Err(RepositoryError::ItemExists(format!(
                "node with id {} already exists",
                uuid
            )));
        }
        self.nodes.insert(
            uuid.clone(),
            MemNode {
                uuid: uuid.clone(),
                name: Some(name),
                parent: Some(parent.to_string()),
                primary_type,
                mixins: Vec::new(),
                children: Vec::new(),
                properties: BTreeMap::new(),
            },
        );
        self.node_mut(parent)?.children.push(uuid.clone());

        let event = Event::new(EventType::NodeAdded, node_id(&uuid).into(), Some(node_id(parent)))
            .with_path(self.path_of(&uuid)?);
        Ok((uuid, event))
    }

    pub fn add_property(&mut self, uuid: &str, name: &Name, property: MemProperty) -> Result<Event> {
        let node = self.node_mut(uuid)?;
        if node.properties.contains_key(name) {
            return Err(RepositoryError::ItemExists(format!(
                "property {} already exists on {}",
                name, uuid
            )));
        }
        node.properties.insert(name.clone(), property);
        self.property_event(EventType::PropertyAdded, uuid, name)
    }

    pub fn change_property(&mut self, uuid: &str, name: &Name, property: MemProperty) -> Result<Event> {
        let slot = self
            .node_mut(uuid)?
            .properties
            .get_mut(name)
            .ok_or_else(|| RepositoryError::ItemNotFound(format!("no property {} on {}", name, uuid)))?;
        *slot = property;
        self.property_event(EventType::PropertyChanged, uuid, name)
    }

    /// Add or overwrite a property; `None` when nothing changed
    pub fn set_property(&mut self, uuid: &str, name: &Name, property: MemProperty) -> Result<Option<Event>> {
        let previous = self.node_mut(uuid)?.properties.insert(name.clone(), property.clone());
        let event_type = match previous {
            None => EventType::PropertyAdded,
            Some(old) if old == property => return Ok(None),
            Some(_) => EventType::PropertyChanged,
        };
        self.property_event(event_type, uuid, name).map(Some)
    }

    pub fn remove_property(&mut self, uuid: &str, name: &Name) -> Result<Event> {
        self.remove_property_if_present(uuid, name)?
            .ok_or_else(|| RepositoryError::ItemNotFound(format!("no property {} on {}", name, uuid)))
    }

    pub fn remove_property_if_present(&mut self, uuid: &str, name: &Name) -> Result<Option<Event>> {
        let event = self.property_event(EventType::PropertyRemoved, uuid, name)?;
        Ok(self
            .node_mut(uuid)?
            .properties
            .remove(name)
            .map(|_| event))
    }

    /// Remove a node with everything below it
    pub fn remove_node(&mut self, uuid: &str) -> Result<Vec<Event>> {
        let Some(parent) = self.node(uuid)?.parent.clone() else {
            return Err(RepositoryError::ConstraintViolation(
                "cannot remove the root node".to_string(),
            ));
        };

        let doomed = self.descendants(uuid);
        let mut events = Vec::new();
        for id in &doomed {
            let node = self.node(id)?;
            let path = self.path_of(id)?;
            for name in node.properties.keys() {
                events.push(
                    Event::new(EventType::PropertyRemoved, property_id(id, name).into(), Some(node_id(id)))
                        .with_path(path.child(name.clone())),
                );
            }
            events.push(
                Event::new(EventType::NodeRemoved, node_id(id).into(), node.parent.as_deref().map(node_id))
                    .with_path(path),
            );
        }

        self.node_mut(&parent)?.children.retain(|c| c != uuid);
        for id in &doomed {
            self.nodes.remove(id);
            self.locks.remove(id);
        }
        Ok(events)
    }

    pub fn move_node(&mut self, uuid: &str, dest_parent: &str, dest_name: Name) -> Result<Vec<Event>> {
        let Some(old_parent) = self.node(uuid)?.parent.clone() else {
            return Err(RepositoryError::ConstraintViolation(
                "cannot move the root node".to_string(),
            ));
        };
        self.node(dest_parent)?;
        if dest_parent == uuid || self.is_ancestor(uuid, dest_parent) {
            return Err(RepositoryError::ConstraintViolation(format!(
                "cannot move {} below itself",
                self.path_of(uuid)?
            )));
        }

        let old_path = self.path_of(uuid)?;
        self.node_mut(&old_parent)?.children.retain(|c| c != uuid);
        self.node_mut(dest_parent)?.children.push(uuid.to_string());
        let moved = self.node_mut(uuid)?;
        moved.parent = Some(dest_parent.to_string());
        moved.name = Some(dest_name);

        Ok(vec![
            Event::new(EventType::NodeRemoved, node_id(uuid).into(), Some(node_id(&old_parent)))
                .with_path(old_path),
            Event::new(EventType::NodeAdded, node_id(uuid).into(), Some(node_id(dest_parent)))
                .with_path(self.path_of(uuid)?),
        ])
    }

    /// Move `src` before `before` among its siblings, or to the end
    pub fn reorder(&mut self, parent: &str, src: &str, before: Option<&str>) -> Result<Vec<Event>> {
        let children = &self.node(parent)?.children;
        if !children.iter().any(|c| c == src) {
            return Err(RepositoryError::ItemNotFound(format!(
                "{} is not a child of {}",
                src, parent
            )));
        }
        if let Some(before) = before {
            if !children.iter().any(|c| c == before) {
                return Err(RepositoryError::ItemNotFound(format!(
                    "{} is not a child of {}",
                    before, parent
                )));
            }
            if before == src {
                return Ok(Vec::new());
            }
        }

        let old_path = self.path_of(src)?;
        let node = self.node_mut(parent)?;
        node.children.retain(|c| c != src);
        let position = before
            .and_then(|b| node.children.iter().position(|c| c == b))
            .unwrap_or(node.children.len());
        node.children.insert(position, src.to_string());

        Ok(vec![
            Event::new(EventType::NodeRemoved, node_id(src).into(), Some(node_id(parent)))
                .with_path(old_path),
            Event::new(EventType::NodeAdded, node_id(src).into(), Some(node_id(parent)))
                .with_path(self.path_of(src)?),
        ])
    }

    /// Replace the mixin list; reported as a change of `jcr:mixinTypes`
    pub fn set_mixins(&mut self, uuid: &str, mixins: Vec<Name>) -> Result<Option<Event>> {
        let node = self.node_mut(uuid)?;
        if node.mixins == mixins {
            return Ok(None);
        }
        let event_type = match (node.mixins.is_empty(), mixins.is_empty()) {
            (true, _) => EventType::PropertyAdded,
            (false, true) => EventType::PropertyRemoved,
            (false, false) => EventType::PropertyChanged,
        };
        node.mixins = mixins;
        self.property_event(event_type, uuid, &well_known(names::JCR_MIXIN_TYPES))
            .map(Some)
    }

    /// Replace all stored properties of a node, reporting the difference
    pub fn replace_properties(
        &mut self,
        uuid: &str,
        properties: BTreeMap<Name, MemProperty>,
    ) -> Result<Vec<Event>> {
        let old = std::mem::replace(&mut self.node_mut(uuid)?.properties, properties);
        let current = &self.node(uuid)?.properties;

        let mut changes = Vec::new();
        for name in old.keys().filter(|n| !current.contains_key(*n)) {
            changes.push((EventType::PropertyRemoved, name.clone()));
        }
        for (name, property) in current {
            match old.get(name) {
                None => changes.push((EventType::PropertyAdded, name.clone())),
                Some(previous) if previous != property => {
                    changes.push((EventType::PropertyChanged, name.clone()))
                }
                Some(_) => {}
            }
        }
        changes
            .into_iter()
            .map(|(event_type, name)| self.property_event(event_type, uuid, &name))
            .collect()
    }

    /// Copy the subtree at `src` of `source` below `dest_parent`.
    ///
    /// With `keep_uuids` the copies share the unique ids of the originals;
    /// otherwise fresh ids are assigned and `jcr:uuid` is rewritten.
    pub fn copy_subtree_from(
        &mut self,
        source: &WorkspaceTree,
        src: &str,
        dest_parent: &str,
        dest_name: Name,
        keep_uuids: bool,
    ) -> Result<(String, Vec<Event>)> {
        self.node(dest_parent)?;
        let originals = source.descendants(src);
        if originals.is_empty() {
            return Err(RepositoryError::ItemNotFound(format!("no node with id {}", src)));
        }
        let mapping: HashMap<String, String> = originals
            .iter()
            .map(|o| {
                let copy = if keep_uuids {
                    o.clone()
                } else {
                    uuid::Uuid::new_v4().to_string()
                };
                (o.clone(), copy)
            })
            .collect();
        if let Some(taken) = mapping.values().find(|id| self.contains(id)) {
            return Err(RepositoryError::ItemExists(format!(
                "node with id {} already exists",
                taken
            )));
        }

        for original in &originals {
            let node = source.node(original)?;
            let uuid = mapping[original].clone();
            let (parent, name) = if original == src {
                (dest_parent.to_string(), Some(dest_name.clone()))
            } else {
                let parent = node
                    .parent
                    .as_ref()
                    .and_then(|p| mapping.get(p))
                    .cloned()
                    .ok_or_else(|| RepositoryError::Internal(format!("orphaned node {}", original)))?;
                (parent, node.name.clone())
            };
            let mut properties = node.properties.clone();
            if !keep_uuids {
                if let Some(p) = properties.get_mut(names::JCR_UUID) {
                    p.values = vec![QValue::String(uuid.clone())];
                }
            }
            self.nodes.insert(
                uuid.clone(),
                MemNode {
                    uuid: uuid.clone(),
                    name,
                    parent: Some(parent.clone()),
                    primary_type: node.primary_type.clone(),
                    mixins: node.mixins.clone(),
                    children: Vec::new(),
                    properties,
                },
            );
            self.node_mut(&parent)?.children.push(uuid);
        }

        let mut events = Vec::new();
        for original in &originals {
            let uuid = &mapping[original];
            let node = self.node(uuid)?;
            let path = self.path_of(uuid)?;
            events.push(
                Event::new(EventType::NodeAdded, node_id(uuid).into(), node.parent.as_deref().map(node_id))
                    .with_path(path.clone()),
            );
            for name in node.properties.keys() {
                events.push(
                    Event::new(EventType::PropertyAdded, property_id(uuid, name).into(), Some(node_id(uuid)))
                        .with_path(path.child(name.clone())),
                );
            }
        }
        Ok((mapping[src].clone(), events))
    }

    // ── Guards ─────────────────────────────────────────────────

    /// The node holding the lock that applies to `uuid`, if any
    pub fn lock_holder(&self, uuid: &str) -> Option<(&str, &LockRecord)> {
        if let Some((holder, lock)) = self.locks.get_key_value(uuid) {
            return Some((holder.as_str(), lock));
        }
        let mut current = self.nodes.get(uuid).and_then(|n| n.parent.as_deref());
        while let Some(parent) = current {
            if let Some((holder, lock)) = self.locks.get_key_value(parent) {
                if lock.is_deep {
                    return Some((holder.as_str(), lock));
                }
            }
            current = self.nodes.get(parent).and_then(|n| n.parent.as_deref());
        }
        None
    }

    pub fn check_lock(&self, uuid: &str, tokens: &[String]) -> Result<()> {
        if let Some((holder, lock)) = self.lock_holder(uuid) {
            if !tokens.iter().any(|t| *t == lock.token) {
                return Err(RepositoryError::Lock(format!(
                    "{} is locked by {}",
                    self.path_of(holder)?,
                    lock.owner
                )));
            }
        }
        Ok(())
    }

    /// Fail when `uuid` or its nearest versionable ancestor is checked in
    pub fn check_checked_out(&self, uuid: &str) -> Result<()> {
        let mut current = Some(uuid);
        while let Some(id) = current {
            let node = self.node(id)?;
            if node.is_versionable() {
                if node.is_checked_out() {
                    return Ok(());
                }
                return Err(RepositoryError::Version(format!(
                    "{} is checked in",
                    self.path_of(id)?
                )));
            }
            current = node.parent.as_deref();
        }
        Ok(())
    }

    pub fn check_writable(&self, uuid: &str, tokens: &[String]) -> Result<()> {
        self.check_lock(uuid, tokens)?;
        self.check_checked_out(uuid)
    }
}
