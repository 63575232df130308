//! Remote service facade
//!
//! The narrow RPC-shaped surface the workspace layer needs from a backend:
//! item info loading, batches of tree edits, direct workspace operations,
//! observation and the namespace/node-type registries.

use crate::error::Result;
use crate::event::{Event, EventFilter, EventListener};
use crate::id::{IdFactory, ItemId, NodeId, PropertyId};
use crate::name::{Name, Path};
use crate::value::{PropertyType, QValue, ValuePayload};
use async_trait::async_trait;
use bytes::Bytes;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};
use std::sync::{Arc, Mutex, PoisonError};

/// Keys of well-known repository descriptors
pub mod descriptor_keys {
    pub const REP_NAME_DESC: &str = "jcr.repository.name";
    pub const REP_VERSION_DESC: &str = "jcr.repository.version";
    pub const LEVEL_1_SUPPORTED: &str = "level.1.supported";
    pub const LEVEL_2_SUPPORTED: &str = "level.2.supported";
    pub const OPTION_TRANSACTIONS_SUPPORTED: &str = "option.transactions.supported";
    pub const OPTION_VERSIONING_SUPPORTED: &str = "option.versioning.supported";
    pub const OPTION_OBSERVATION_SUPPORTED: &str = "option.observation.supported";
    pub const OPTION_LOCKING_SUPPORTED: &str = "option.locking.supported";
}

/// Descriptors advertised by a backend
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct RepositoryDescriptors(BTreeMap<String, String>);

impl RepositoryDescriptors {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&mut self, key: impl Into<String>, value: impl Into<String>) {
        self.0.insert(key.into(), value.into());
    }

    pub fn get(&self, key: &str) -> Option<&str> {
        self.0.get(key).map(String::as_str)
    }

    /// Whether the descriptor is present and reads `true`
    pub fn is_enabled(&self, key: &str) -> bool {
        self.get(key)
            .map(|v| v.trim().eq_ignore_ascii_case("true"))
            .unwrap_or(false)
    }

    pub fn observation_supported(&self) -> bool {
        self.is_enabled(descriptor_keys::OPTION_OBSERVATION_SUPPORTED)
    }

    pub fn level2_supported(&self) -> bool {
        self.is_enabled(descriptor_keys::LEVEL_2_SUPPORTED)
    }
}

/// Per-session state shared with the backend
///
/// Holds the lock tokens the session owns; tokens are added when the session
/// takes a lock and may be transferred in and out by the caller.
#[derive(Debug)]
pub struct SessionInfo {
    id: String,
    user_id: String,
    workspace_name: String,
    lock_tokens: Mutex<BTreeSet<String>>,
}

impl SessionInfo {
    pub fn new(user_id: impl Into<String>, workspace_name: impl Into<String>) -> Self {
        Self {
            id: uuid::Uuid::new_v4().to_string(),
            user_id: user_id.into(),
            workspace_name: workspace_name.into(),
            lock_tokens: Mutex::new(BTreeSet::new()),
        }
    }

    /// Unique id of this session
    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn user_id(&self) -> &str {
        &self.user_id
    }

    pub fn workspace_name(&self) -> &str {
        &self.workspace_name
    }

    pub fn lock_tokens(&self) -> Vec<String> {
        self.tokens().iter().cloned().collect()
    }

    pub fn holds_lock_token(&self, token: &str) -> bool {
        self.tokens().contains(token)
    }

    pub fn add_lock_token(&self, token: impl Into<String>) {
        self.tokens().insert(token.into());
    }

    /// Remove a token; returns silently if the session does not hold it
    pub fn remove_lock_token(&self, token: &str) {
        self.tokens().remove(token);
    }

    fn tokens(&self) -> std::sync::MutexGuard<'_, BTreeSet<String>> {
        self.lock_tokens.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

/// Child node entry of a [`NodeInfo`]
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChildInfo {
    pub name: Name,
    /// 1-based same-name-sibling index
    pub index: u32,
    pub id: NodeId,
}

/// Backend description of a node
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NodeInfo {
    pub id: NodeId,
    pub path: Path,
    /// `None` for the root node
    pub name: Option<Name>,
    pub primary_type: Name,
    pub mixins: Vec<Name>,
    pub parent: Option<NodeId>,
    pub children: Vec<ChildInfo>,
    pub property_names: Vec<Name>,
    /// Reference properties that point at this node
    pub references: Vec<PropertyId>,
}

/// Backend description of a property
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PropertyInfo {
    pub id: PropertyId,
    pub path: Path,
    pub property_type: PropertyType,
    pub multi_valued: bool,
    pub values: Vec<QValue>,
}

/// Description of a lock held on a node
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LockInfo {
    pub node: NodeId,
    /// Only revealed to the session that holds the lock
    pub token: Option<String>,
    pub owner: String,
    pub is_deep: bool,
    pub is_session_scoped: bool,
    pub created_at: DateTime<Utc>,
}

/// Definition of a node type as registered with the backend
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NodeTypeDefinition {
    pub name: Name,
    #[serde(default)]
    pub supertypes: Vec<Name>,
    #[serde(default)]
    pub is_mixin: bool,
    #[serde(default)]
    pub orderable_child_nodes: bool,
    #[serde(default)]
    pub primary_item: Option<Name>,
}

impl NodeTypeDefinition {
    pub fn new(name: Name, supertypes: Vec<Name>, is_mixin: bool) -> Self {
        Self {
            name,
            supertypes,
            is_mixin,
            orderable_child_nodes: false,
            primary_item: None,
        }
    }
}

/// Actions checked by [`RepositoryService::is_granted`]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Permission {
    Read,
    AddNode,
    SetProperty,
    Remove,
}

/// How unique ids found in imported XML are treated
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ImportUuidBehavior {
    CreateNew,
    RemoveExisting,
    ReplaceExisting,
    CollisionThrow,
}

/// Accumulator for one atomic group of tree edits
///
/// Calls only record the edit; nothing reaches the backend before
/// [`RepositoryService::submit`].
pub trait Batch: Send {
    fn add_node(
        &mut self,
        parent: &NodeId,
        name: &Name,
        node_type: &Name,
        uuid: Option<&str>,
    ) -> Result<()>;

    fn add_property(
        &mut self,
        parent: &NodeId,
        name: &Name,
        value: ValuePayload,
        property_type: PropertyType,
    ) -> Result<()>;

    fn set_value(
        &mut self,
        property: &PropertyId,
        value: ValuePayload,
        property_type: PropertyType,
    ) -> Result<()>;

    fn remove(&mut self, item: &ItemId) -> Result<()>;

    fn set_mixins(&mut self, node: &NodeId, mixins: &[Name]) -> Result<()>;

    fn reorder_nodes(
        &mut self,
        parent: &NodeId,
        src: &NodeId,
        before: Option<&NodeId>,
    ) -> Result<()>;

    fn move_node(&mut self, src: &NodeId, dest_parent: &NodeId, dest_name: &Name) -> Result<()>;
}

/// Remote repository backend
///
/// Every mutating call returns the events the change produced.
#[async_trait]
pub trait RepositoryService: Send + Sync + 'static {
    type Batch: Batch + 'static;

    fn id_factory(&self) -> &dyn IdFactory;

    async fn repository_descriptors(&self) -> Result<RepositoryDescriptors>;

    async fn workspace_names(&self, session: &SessionInfo) -> Result<Vec<String>>;

    async fn is_granted(
        &self,
        session: &SessionInfo,
        item: &ItemId,
        actions: &[Permission],
    ) -> Result<bool>;

    async fn root_id(&self, session: &SessionInfo) -> Result<NodeId>;

    async fn node_info(&self, session: &SessionInfo, node: &NodeId) -> Result<NodeInfo>;

    async fn property_info(
        &self,
        session: &SessionInfo,
        property: &PropertyId,
    ) -> Result<PropertyInfo>;

    // ── Batches ────────────────────────────────────────────────

    async fn create_batch(&self, session: &SessionInfo, target: &ItemId) -> Result<Self::Batch>;

    async fn submit(&self, batch: Self::Batch) -> Result<Vec<Event>>;

    // ── Workspace operations ───────────────────────────────────

    async fn clone_node(
        &self,
        session: &SessionInfo,
        src_workspace: &str,
        src: &NodeId,
        dest_parent: &NodeId,
        dest_name: &Name,
        remove_existing: bool,
    ) -> Result<Vec<Event>>;

    async fn copy(
        &self,
        session: &SessionInfo,
        src_workspace: &str,
        src: &NodeId,
        dest_parent: &NodeId,
        dest_name: &Name,
    ) -> Result<Vec<Event>>;

    async fn move_node(
        &self,
        session: &SessionInfo,
        src: &NodeId,
        dest_parent: &NodeId,
        dest_name: &Name,
    ) -> Result<Vec<Event>>;

    async fn update(
        &self,
        session: &SessionInfo,
        node: &NodeId,
        src_workspace: &str,
    ) -> Result<Vec<Event>>;

    async fn import_xml(
        &self,
        session: &SessionInfo,
        parent: &NodeId,
        xml: Bytes,
        uuid_behavior: ImportUuidBehavior,
    ) -> Result<Vec<Event>>;

    // ── Versioning ─────────────────────────────────────────────

    async fn checkout(&self, session: &SessionInfo, node: &NodeId) -> Result<Vec<Event>>;

    async fn checkin(&self, session: &SessionInfo, node: &NodeId) -> Result<Vec<Event>>;

    /// Restore a single version onto `node`
    async fn restore(
        &self,
        session: &SessionInfo,
        node: &NodeId,
        version: &NodeId,
        remove_existing: bool,
    ) -> Result<Vec<Event>>;

    /// Restore each version onto the node it was created from
    async fn restore_versions(
        &self,
        session: &SessionInfo,
        versions: &[NodeId],
        remove_existing: bool,
    ) -> Result<Vec<Event>>;

    async fn merge(
        &self,
        session: &SessionInfo,
        node: &NodeId,
        src_workspace: &str,
        best_effort: bool,
    ) -> Result<Vec<Event>>;

    async fn resolve_merge_conflict(
        &self,
        session: &SessionInfo,
        node: &NodeId,
        merge_failed: &[NodeId],
        predecessors: &[NodeId],
    ) -> Result<Vec<Event>>;

    async fn add_version_label(
        &self,
        session: &SessionInfo,
        version_history: &NodeId,
        version: &NodeId,
        label: &Name,
        move_label: bool,
    ) -> Result<Vec<Event>>;

    async fn remove_version_label(
        &self,
        session: &SessionInfo,
        version_history: &NodeId,
        version: &NodeId,
        label: &Name,
    ) -> Result<Vec<Event>>;

    // ── Locking ────────────────────────────────────────────────

    async fn lock_info(&self, session: &SessionInfo, node: &NodeId) -> Result<Option<LockInfo>>;

    async fn lock(&self, session: &SessionInfo, node: &NodeId, deep: bool) -> Result<Vec<Event>>;

    async fn refresh_lock(&self, session: &SessionInfo, node: &NodeId) -> Result<Vec<Event>>;

    async fn unlock(&self, session: &SessionInfo, node: &NodeId) -> Result<Vec<Event>>;

    // ── Namespaces and node types ──────────────────────────────

    /// Prefix to URI mapping
    async fn registered_namespaces(&self, session: &SessionInfo) -> Result<BTreeMap<String, String>>;

    async fn register_namespace(&self, session: &SessionInfo, prefix: &str, uri: &str) -> Result<()>;

    async fn unregister_namespace(&self, session: &SessionInfo, uri: &str) -> Result<()>;

    async fn node_type_definitions(&self, session: &SessionInfo) -> Result<Vec<NodeTypeDefinition>>;

    async fn register_node_types(
        &self,
        session: &SessionInfo,
        definitions: &[NodeTypeDefinition],
    ) -> Result<()>;

    async fn reregister_node_types(
        &self,
        session: &SessionInfo,
        definitions: &[NodeTypeDefinition],
    ) -> Result<()>;

    async fn unregister_node_types(&self, session: &SessionInfo, names: &[Name]) -> Result<()>;

    // ── Observation and lifecycle ──────────────────────────────

    async fn add_event_listener(
        &self,
        session: &SessionInfo,
        root: &NodeId,
        listener: Arc<dyn EventListener>,
        filter: EventFilter,
    ) -> Result<()>;

    async fn remove_event_listener(
        &self,
        session: &SessionInfo,
        root: &NodeId,
        listener: &Arc<dyn EventListener>,
    ) -> Result<()>;

    /// Release everything the backend holds for the session
    async fn dispose(&self, session: &SessionInfo) -> Result<()>;
}
