//! Linear-plus-merge version histories
//!
//! Versions record the stored properties of a versionable node at checkin;
//! children are not versioned. Histories are shared by all workspaces, so a
//! node cloned into another workspace keeps its history.

use super::tree::{MemNode, MemProperty, WorkspaceTree};
use crate::error::{RepositoryError, Result};
use crate::event::Event;
use crate::name::{names, well_known, Name};
use crate::value::{PropertyType, QValue};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashSet};

/// Properties describing version state rather than content
const BOOKKEEPING: &[&str] = &[
    names::JCR_UUID,
    names::JCR_BASE_VERSION,
    names::JCR_VERSION_HISTORY,
    names::JCR_PREDECESSORS,
    names::JCR_IS_CHECKED_OUT,
    names::JCR_MERGE_FAILED,
    names::JCR_LOCK_OWNER,
    names::JCR_LOCK_IS_DEEP,
];

fn content_properties(node: &MemNode) -> BTreeMap<Name, MemProperty> {
    node.properties
        .iter()
        .filter(|(name, _)| !BOOKKEEPING.contains(&name.as_str()))
        .map(|(name, p)| (name.clone(), p.clone()))
        .collect()
}

fn bookkeeping_properties(node: &MemNode) -> BTreeMap<Name, MemProperty> {
    node.properties
        .iter()
        .filter(|(name, _)| BOOKKEEPING.contains(&name.as_str()))
        .map(|(name, p)| (name.clone(), p.clone()))
        .collect()
}

fn reference(uuid: &str) -> QValue {
    QValue::Reference(uuid.to_string())
}

fn references(uuids: &[String]) -> MemProperty {
    MemProperty::multiple(PropertyType::Reference, uuids.iter().map(|u| reference(u)).collect())
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub(crate) struct Version {
    pub uuid: String,
    pub name: String,
    pub predecessors: Vec<String>,
    pub frozen: BTreeMap<Name, MemProperty>,
    pub created: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub(crate) struct VersionHistory {
    pub uuid: String,
    /// Unique id of the versionable node
    pub versionable: String,
    pub versions: Vec<Version>,
    /// Label to version uuid
    #[serde(default)]
    pub labels: BTreeMap<Name, String>,
}

impl VersionHistory {
    pub fn version(&self, uuid: &str) -> Option<&Version> {
        self.versions.iter().find(|v| v.uuid == uuid)
    }

    /// Whether `ancestor` precedes `uuid` in this history
    pub fn precedes(&self, ancestor: &str, uuid: &str) -> bool {
        let mut seen = HashSet::new();
        let mut pending: Vec<&str> = self
            .version(uuid)
            .map(|v| v.predecessors.iter().map(String::as_str).collect())
            .unwrap_or_default();
        while let Some(current) = pending.pop() {
            if current == ancestor {
                return true;
            }
            if seen.insert(current) {
                if let Some(v) = self.version(current) {
                    pending.extend(v.predecessors.iter().map(String::as_str));
                }
            }
        }
        false
    }
}

/// Every version history of the repository, keyed by history uuid
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub(crate) struct VersionStore {
    histories: BTreeMap<String, VersionHistory>,
}

impl VersionStore {
    pub fn history(&self, uuid: &str) -> Result<&VersionHistory> {
        self.histories
            .get(uuid)
            .ok_or_else(|| RepositoryError::ItemNotFound(format!("no version history {}", uuid)))
    }

    fn history_mut(&mut self, uuid: &str) -> Result<&mut VersionHistory> {
        self.histories
            .get_mut(uuid)
            .ok_or_else(|| RepositoryError::ItemNotFound(format!("no version history {}", uuid)))
    }

    /// History and version that `version` identifies
    pub fn find_version(&self, version: &str) -> Option<(&VersionHistory, &Version)> {
        self.histories
            .values()
            .find_map(|h| h.version(version).map(|v| (h, v)))
    }

    /// Start a history for `versionable`; returns the history and root
    /// version uuids
    fn create_history(&mut self, versionable: &str) -> (String, String) {
        let history = uuid::Uuid::new_v4().to_string();
        let root = uuid::Uuid::new_v4().to_string();
        self.histories.insert(
            history.clone(),
            VersionHistory {
                uuid: history.clone(),
                versionable: versionable.to_string(),
                versions: vec![Version {
                    uuid: root.clone(),
                    name: "jcr:rootVersion".to_string(),
                    predecessors: Vec::new(),
                    frozen: BTreeMap::new(),
                    created: Utc::now(),
                }],
                labels: BTreeMap::new(),
            },
        );
        (history, root)
    }

    pub fn add_label(&mut self, history: &str, version: &str, label: &Name, move_label: bool) -> Result<()> {
        let history = self.history_mut(history)?;
        if history.version(version).is_none() {
            return Err(RepositoryError::Version(format!(
                "version {} is not part of history {}",
                version, history.uuid
            )));
        }
        match history.labels.get(label) {
            Some(existing) if existing == version => return Ok(()),
            Some(existing) if !move_label => {
                return Err(RepositoryError::Version(format!(
                    "label {} already names version {}",
                    label, existing
                )));
            }
            _ => {}
        }
        history.labels.insert(label.clone(), version.to_string());
        Ok(())
    }

    pub fn remove_label(&mut self, history: &str, version: &str, label: &Name) -> Result<()> {
        let history = self.history_mut(history)?;
        match history.labels.get(label) {
            Some(existing) if existing == version => {
                history.labels.remove(label);
                Ok(())
            }
            _ => Err(RepositoryError::Version(format!(
                "label {} does not name version {}",
                label, version
            ))),
        }
    }
}

fn history_of<'s>(store: &'s VersionStore, node: &MemNode) -> Result<&'s VersionHistory> {
    let history = node.reference(names::JCR_VERSION_HISTORY).ok_or_else(|| {
        RepositoryError::UnsupportedOperation(format!("node {} is not versionable", node.uuid))
    })?;
    store.history(&history)
}

/// Make a node versionable: start its history and set the version
/// properties.
pub(crate) fn init_versionable(
    tree: &mut WorkspaceTree,
    store: &mut VersionStore,
    uuid: &str,
) -> Result<Vec<Event>> {
    let (history, root) = store.create_history(uuid);
    let updates = [
        (names::JCR_UUID, MemProperty::single(QValue::String(uuid.to_string()))),
        (names::JCR_VERSION_HISTORY, MemProperty::single(reference(&history))),
        (names::JCR_BASE_VERSION, MemProperty::single(reference(&root))),
        (names::JCR_PREDECESSORS, references(&[root])),
        (names::JCR_IS_CHECKED_OUT, MemProperty::single(QValue::Boolean(true))),
    ];
    set_all(tree, uuid, updates)
}

fn set_all<const N: usize>(
    tree: &mut WorkspaceTree,
    uuid: &str,
    updates: [(&'static str, MemProperty); N],
) -> Result<Vec<Event>> {
    let mut events = Vec::new();
    for (name, property) in updates {
        events.extend(tree.set_property(uuid, &well_known(name), property)?);
    }
    Ok(events)
}

pub(crate) fn checkin(
    tree: &mut WorkspaceTree,
    store: &mut VersionStore,
    uuid: &str,
) -> Result<Vec<Event>> {
    let node = tree.node(uuid)?;
    let history = history_of(store, node)?.uuid.clone();
    if !node.is_checked_out() {
        return Ok(Vec::new());
    }
    if node.properties.contains_key(names::JCR_MERGE_FAILED) {
        return Err(RepositoryError::Version(format!(
            "{} has unresolved merge conflicts",
            tree.path_of(uuid)?
        )));
    }

    let predecessors = node.references(names::JCR_PREDECESSORS);
    let frozen = content_properties(node);
    let history = store.history_mut(&history)?;
    let version = Version {
        uuid: uuid::Uuid::new_v4().to_string(),
        name: format!("1.{}", history.versions.len() - 1),
        predecessors,
        frozen,
        created: Utc::now(),
    };
    let version_uuid = version.uuid.clone();
    history.versions.push(version);

    let updates = [
        (names::JCR_BASE_VERSION, MemProperty::single(reference(&version_uuid))),
        (names::JCR_PREDECESSORS, references(&[])),
        (names::JCR_IS_CHECKED_OUT, MemProperty::single(QValue::Boolean(false))),
    ];
    set_all(tree, uuid, updates)
}

pub(crate) fn checkout(tree: &mut WorkspaceTree, store: &VersionStore, uuid: &str) -> Result<Vec<Event>> {
    let node = tree.node(uuid)?;
    history_of(store, node)?;
    if node.is_checked_out() {
        return Ok(Vec::new());
    }
    let base = node.reference(names::JCR_BASE_VERSION).into_iter().collect::<Vec<_>>();

    let updates = [
        (names::JCR_PREDECESSORS, references(&base)),
        (names::JCR_IS_CHECKED_OUT, MemProperty::single(QValue::Boolean(true))),
    ];
    set_all(tree, uuid, updates)
}

/// Put the content of `version` back onto the node; the node ends up checked
/// in with `version` as its base version.
pub(crate) fn restore(
    tree: &mut WorkspaceTree,
    store: &VersionStore,
    uuid: &str,
    version: &str,
) -> Result<Vec<Event>> {
    let node = tree.node(uuid)?;
    let history = history_of(store, node)?;
    let frozen = history
        .version(version)
        .ok_or_else(|| {
            RepositoryError::Version(format!(
                "version {} does not belong to the history of {}",
                version, uuid
            ))
        })?
        .frozen
        .clone();

    let mut properties = bookkeeping_properties(node);
    properties.extend(frozen);
    properties.insert(well_known(names::JCR_BASE_VERSION), MemProperty::single(reference(version)));
    properties.insert(well_known(names::JCR_PREDECESSORS), references(&[]));
    properties.insert(well_known(names::JCR_IS_CHECKED_OUT), MemProperty::single(QValue::Boolean(false)));
    properties.remove(names::JCR_MERGE_FAILED);
    tree.replace_properties(uuid, properties)
}

/// Unique id of the versionable node `version` was created from
pub(crate) fn versionable_of(store: &VersionStore, version: &str) -> Result<String> {
    store
        .find_version(version)
        .map(|(history, _)| history.versionable.clone())
        .ok_or_else(|| RepositoryError::Version(format!("no version {}", version)))
}

/// Merge the corresponding node of `source` into `dest`.
///
/// The node is updated when the source's base version succeeds its own,
/// left alone when it precedes it, and otherwise fails the merge; with
/// `best_effort` the failing version is recorded in `jcr:mergeFailed`
/// instead.
pub(crate) fn merge(
    dest: &mut WorkspaceTree,
    source: &WorkspaceTree,
    store: &VersionStore,
    uuid: &str,
    best_effort: bool,
) -> Result<Vec<Event>> {
    let Ok(theirs) = source.node(uuid) else {
        return Ok(Vec::new());
    };
    let ours = dest.node(uuid)?;

    if !ours.is_versionable() {
        let mut properties = bookkeeping_properties(ours);
        properties.extend(content_properties(theirs));
        return dest.replace_properties(uuid, properties);
    }

    let history = history_of(store, ours)?;
    let (Some(our_base), Some(their_base)) = (
        ours.reference(names::JCR_BASE_VERSION),
        theirs.reference(names::JCR_BASE_VERSION),
    ) else {
        return Err(RepositoryError::Internal(format!(
            "versionable node {} has no base version",
            uuid
        )));
    };

    if our_base == their_base || history.precedes(&their_base, &our_base) {
        return Ok(Vec::new());
    }
    if history.precedes(&our_base, &their_base) {
        let mut properties = theirs.properties.clone();
        for name in [names::JCR_LOCK_OWNER, names::JCR_LOCK_IS_DEEP] {
            properties.remove(name);
            if let Some(p) = ours.properties.get(name) {
                properties.insert(well_known(name), p.clone());
            }
        }
        return dest.replace_properties(uuid, properties);
    }

    if !best_effort {
        return Err(RepositoryError::Merge(format!(
            "{} has diverged from version {}",
            dest.path_of(uuid)?,
            their_base
        )));
    }
    let mut failed = ours.references(names::JCR_MERGE_FAILED);
    if failed.contains(&their_base) {
        return Ok(Vec::new());
    }
    failed.push(their_base);
    Ok(dest
        .set_property(uuid, &well_known(names::JCR_MERGE_FAILED), references(&failed))?
        .into_iter()
        .collect())
}

/// Record the outcome of conflict resolution on a node
pub(crate) fn resolve_merge_conflict(
    tree: &mut WorkspaceTree,
    uuid: &str,
    merge_failed: &[String],
    predecessors: &[String],
) -> Result<Vec<Event>> {
    let mut events = Vec::new();
    let merge_failed_name = well_known(names::JCR_MERGE_FAILED);
    if merge_failed.is_empty() {
        events.extend(tree.remove_property_if_present(uuid, &merge_failed_name)?);
    } else {
        events.extend(tree.set_property(uuid, &merge_failed_name, references(merge_failed))?);
    }
    events.extend(tree.set_property(uuid, &well_known(names::JCR_PREDECESSORS), references(predecessors))?);
    Ok(events)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::memory::tree::ROOT_UUID;

    fn setup() -> (WorkspaceTree, VersionStore, String) {
        let mut tree = WorkspaceTree::new("default");
        let mut store = VersionStore::default();
        let (uuid, _) = tree
            .add_node(ROOT_UUID, Name::new("doc").unwrap(), well_known(names::NT_UNSTRUCTURED), None)
            .unwrap();
        init_versionable(&mut tree, &mut store, &uuid).unwrap();
        (tree, store, uuid)
    }

    fn set_title(tree: &mut WorkspaceTree, uuid: &str, title: &str) {
        tree.set_property(uuid, &Name::new("title").unwrap(), MemProperty::single(QValue::String(title.into())))
            .unwrap();
    }

    #[test]
    fn test_checkin_checkout_cycle() {
        let (mut tree, mut store, uuid) = setup();
        set_title(&mut tree, &uuid, "v1");

        let events = checkin(&mut tree, &mut store, &uuid).unwrap();
        assert_eq!(events.len(), 3);
        assert!(!tree.node(&uuid).unwrap().is_checked_out());
        assert!(tree.check_checked_out(&uuid).is_err());
        assert!(checkin(&mut tree, &mut store, &uuid).unwrap().is_empty());

        let v1 = tree.node(&uuid).unwrap().reference(names::JCR_BASE_VERSION).unwrap();
        checkout(&mut tree, &store, &uuid).unwrap();
        assert_eq!(tree.node(&uuid).unwrap().references(names::JCR_PREDECESSORS), vec![v1.clone()]);

        set_title(&mut tree, &uuid, "v2");
        checkin(&mut tree, &mut store, &uuid).unwrap();
        let v2 = tree.node(&uuid).unwrap().reference(names::JCR_BASE_VERSION).unwrap();
        let (history, version) = store.find_version(&v2).unwrap();
        assert_eq!(version.name, "1.1");
        assert!(history.precedes(&v1, &v2));
        assert!(!history.precedes(&v2, &v1));

        restore(&mut tree, &store, &uuid, &v1).unwrap();
        let node = tree.node(&uuid).unwrap();
        assert_eq!(
            node.properties.get("title").unwrap().values,
            vec![QValue::String("v1".into())]
        );
        assert_eq!(node.reference(names::JCR_BASE_VERSION), Some(v1));
        assert_eq!(versionable_of(&store, &v2).unwrap(), uuid);
    }

    #[test]
    fn test_labels() {
        let (mut tree, mut store, uuid) = setup();
        checkout(&mut tree, &store, &uuid).unwrap();
        checkin(&mut tree, &mut store, &uuid).unwrap();
        let node = tree.node(&uuid).unwrap();
        let history = node.reference(names::JCR_VERSION_HISTORY).unwrap();
        let v1 = node.reference(names::JCR_BASE_VERSION).unwrap();
        let root = store.history(&history).unwrap().versions[0].uuid.clone();
        let label = Name::new("stable").unwrap();

        store.add_label(&history, &v1, &label, false).unwrap();
        assert!(store.add_label(&history, &root, &label, false).is_err());
        store.add_label(&history, &root, &label, true).unwrap();
        assert!(store.remove_label(&history, &v1, &label).is_err());
        store.remove_label(&history, &root, &label).unwrap();
        assert!(store.add_label(&history, "nope", &label, false).is_err());
    }

    #[test]
    fn test_merge_outcomes() {
        let (mut dest, mut store, uuid) = setup();
        checkin(&mut dest, &mut store, &uuid).unwrap();
        let mut source = dest.clone();

        // source moves ahead: dest is updated
        checkout(&mut source, &store, &uuid).unwrap();
        set_title(&mut source, &uuid, "theirs");
        checkin(&mut source, &mut store, &uuid).unwrap();
        assert!(!merge(&mut dest, &source, &store, &uuid, false).unwrap().is_empty());
        assert_eq!(
            dest.node(&uuid).unwrap().properties.get("title").unwrap().values,
            vec![QValue::String("theirs".into())]
        );

        // both diverge: merge fails, or records the conflict
        checkout(&mut dest, &store, &uuid).unwrap();
        checkin(&mut dest, &mut store, &uuid).unwrap();
        checkout(&mut source, &store, &uuid).unwrap();
        checkin(&mut source, &mut store, &uuid).unwrap();
        assert!(matches!(
            merge(&mut dest, &source, &store, &uuid, false),
            Err(RepositoryError::Merge(_))
        ));
        merge(&mut dest, &source, &store, &uuid, true).unwrap();
        let their_base = source.node(&uuid).unwrap().reference(names::JCR_BASE_VERSION).unwrap();
        assert_eq!(
            dest.node(&uuid).unwrap().references(names::JCR_MERGE_FAILED),
            vec![their_base.clone()]
        );
        checkout(&mut dest, &store, &uuid).unwrap();
        assert!(matches!(
            checkin(&mut dest, &mut store, &uuid),
            Err(RepositoryError::Version(_))
        ));

        resolve_merge_conflict(&mut dest, &uuid, &[], &[their_base]).unwrap();
        assert!(!dest.node(&uuid).unwrap().properties.contains_key(names::JCR_MERGE_FAILED));
    }
}
