//! In-memory repository backend
//!
//! A complete [`RepositoryService`] kept in process memory, used by the
//! integration tests and the CLI. Every workspace is a tree of uuid-addressed
//! nodes; writes are applied to a copy of the workspace and committed only
//! when they succeed as a whole. State can be saved to and loaded from a
//! JSON snapshot.

mod batch;
mod import;
mod locks;
mod observation;
mod schema;
mod tree;
mod versions;

pub use batch::MemoryBatch;
pub use tree::ROOT_UUID;

use crate::error::{RepositoryError, Result};
use crate::event::{Event, EventFilter, EventListener};
use crate::id::{DefaultIdFactory, IdFactory, ItemId, NodeId, PropertyId};
use crate::name::{names, Name};
use crate::registry::{NamespaceRegistry, NodeTypeRegistry};
use crate::service::{
    descriptor_keys, ImportUuidBehavior, LockInfo, NodeInfo, NodeTypeDefinition, Permission,
    PropertyInfo, RepositoryDescriptors, RepositoryService, SessionInfo,
};
use async_trait::async_trait;
use bytes::Bytes;
use observation::Observation;
use schema::Schema;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};
use std::path::Path as FsPath;
use std::sync::{Arc, Mutex, PoisonError};
use tokio::sync::RwLock;
use tracing::{debug, info};
use tree::WorkspaceTree;
use versions::VersionStore;

/// Names of the service calls made, in order
#[derive(Debug, Clone, Default)]
pub(crate) struct Journal(Arc<Mutex<Vec<String>>>);

impl Journal {
    pub fn record(&self, entry: impl Into<String>) {
        self.0.lock().unwrap_or_else(PoisonError::into_inner).push(entry.into());
    }

    pub fn entries(&self) -> Vec<String> {
        self.0.lock().unwrap_or_else(PoisonError::into_inner).clone()
    }

    pub fn clear(&self) {
        self.0.lock().unwrap_or_else(PoisonError::into_inner).clear();
    }
}

struct RepositoryState {
    workspaces: BTreeMap<String, WorkspaceTree>,
    versions: VersionStore,
    namespaces: NamespaceRegistry,
    node_types: NodeTypeRegistry,
}

impl RepositoryState {
    fn new(workspaces: BTreeMap<String, WorkspaceTree>) -> Self {
        Self {
            workspaces,
            versions: VersionStore::default(),
            namespaces: NamespaceRegistry::new(schema::builtin_namespaces(), true),
            node_types: NodeTypeRegistry::new(schema::builtin_node_types()),
        }
    }

    fn workspace(&self, name: &str) -> Result<&WorkspaceTree> {
        self.workspaces
            .get(name)
            .ok_or_else(|| RepositoryError::NoSuchWorkspace(name.to_string()))
    }
}

/// On-disk form of the repository state
#[derive(Serialize, Deserialize)]
struct Snapshot {
    workspaces: BTreeMap<String, WorkspaceTree>,
    versions: VersionStore,
    namespaces: BTreeMap<String, String>,
    node_types: Vec<NodeTypeDefinition>,
}

/// Session a write is made for
#[derive(Clone, Copy)]
struct Origin<'a> {
    workspace: &'a str,
    session_id: &'a str,
    user_id: &'a str,
}

impl<'a> From<&'a SessionInfo> for Origin<'a> {
    fn from(session: &'a SessionInfo) -> Self {
        Self {
            workspace: session.workspace_name(),
            session_id: session.id(),
            user_id: session.user_id(),
        }
    }
}

/// Working copies a write is applied to
struct Scratch<'a> {
    tree: WorkspaceTree,
    versions: VersionStore,
    schema: Schema<'a>,
    /// Committed state of every workspace, for cross-workspace reads
    workspaces: &'a BTreeMap<String, WorkspaceTree>,
}

fn source<'w>(workspaces: &'w BTreeMap<String, WorkspaceTree>, name: &str) -> Result<&'w WorkspaceTree> {
    workspaces
        .get(name)
        .ok_or_else(|| RepositoryError::NoSuchWorkspace(name.to_string()))
}

fn unique_id(id: &NodeId) -> Result<String> {
    id.unique_id()
        .map(str::to_string)
        .ok_or_else(|| RepositoryError::ItemNotFound(format!("{} does not name a version item", id)))
}

/// Repository service backed by process memory
pub struct InMemoryRepositoryService {
    state: RwLock<RepositoryState>,
    id_factory: DefaultIdFactory,
    observation_supported: bool,
    read_only_users: BTreeSet<String>,
    observation: Observation,
    journal: Journal,
}

impl Default for InMemoryRepositoryService {
    fn default() -> Self {
        Self::new()
    }
}

impl InMemoryRepositoryService {
    /// Repository with a single workspace named `default`
    pub fn new() -> Self {
        Self::with_workspaces(&["default"])
    }

    pub fn with_workspaces(names: &[&str]) -> Self {
        let workspaces = names
            .iter()
            .map(|n| (n.to_string(), WorkspaceTree::new(*n)))
            .collect();
        Self::from_state(RepositoryState::new(workspaces))
    }

    fn from_state(state: RepositoryState) -> Self {
        Self {
            state: RwLock::new(state),
            id_factory: DefaultIdFactory,
            observation_supported: true,
            read_only_users: BTreeSet::new(),
            observation: Observation::default(),
            journal: Journal::default(),
        }
    }

    /// Advertise no observation support and refuse listener registrations
    pub fn without_observation(mut self) -> Self {
        self.observation_supported = false;
        self
    }

    /// Sessions of `user_id` may read but not write
    pub fn with_read_only_user(mut self, user_id: impl Into<String>) -> Self {
        self.read_only_users.insert(user_id.into());
        self
    }

    pub async fn create_workspace(&self, name: &str) -> Result<()> {
        let mut state = self.state.write().await;
        if state.workspaces.contains_key(name) {
            return Err(RepositoryError::ItemExists(format!("workspace {} already exists", name)));
        }
        state.workspaces.insert(name.to_string(), WorkspaceTree::new(name));
        info!("created workspace {}", name);
        Ok(())
    }

    /// Service calls made so far, batch recordings included
    pub fn journal(&self) -> Vec<String> {
        self.journal.entries()
    }

    pub fn clear_journal(&self) {
        self.journal.clear();
    }

    /// Wait until every queued notification has reached its listener
    pub async fn flush_notifications(&self) {
        self.observation.flush().await;
    }

    /// Number of registered event listeners over all sessions
    pub fn listener_count(&self) -> usize {
        self.observation.listener_count()
    }

    /// Write the repository content to a JSON file. Locks are not saved.
    pub async fn save_snapshot(&self, path: &FsPath) -> Result<()> {
        let data = {
            let state = self.state.read().await;
            let snapshot = Snapshot {
                workspaces: state.workspaces.clone(),
                versions: state.versions.clone(),
                namespaces: state.namespaces.mappings().clone(),
                node_types: state.node_types.definitions(),
            };
            serde_json::to_string_pretty(&snapshot)?
        };
        let tmp_path = path.with_extension("tmp");
        std::fs::write(&tmp_path, data)?;
        std::fs::rename(&tmp_path, path)?;
        debug!("saved snapshot to {:?}", path);
        Ok(())
    }

    /// Load a repository saved with [`save_snapshot`](Self::save_snapshot)
    pub fn load_snapshot(path: &FsPath) -> Result<Self> {
        let data = std::fs::read_to_string(path)?;
        let mut snapshot: Snapshot = serde_json::from_str(&data)?;
        for tree in snapshot.workspaces.values_mut() {
            for node in tree.nodes.values_mut() {
                node.properties.remove(names::JCR_LOCK_OWNER);
                node.properties.remove(names::JCR_LOCK_IS_DEEP);
            }
        }
        let state = RepositoryState {
            workspaces: snapshot.workspaces,
            versions: snapshot.versions,
            namespaces: NamespaceRegistry::new(snapshot.namespaces, true),
            node_types: NodeTypeRegistry::new(snapshot.node_types),
        };
        debug!("loaded snapshot from {:?}", path);
        Ok(Self::from_state(state))
    }

    fn check_write_access(&self, session: &SessionInfo) -> Result<()> {
        if self.read_only_users.contains(session.user_id()) {
            return Err(RepositoryError::AccessDenied(format!(
                "{} may not modify the repository",
                session.user_id()
            )));
        }
        Ok(())
    }

    async fn read<T>(&self, session: &SessionInfo, f: impl FnOnce(&WorkspaceTree) -> Result<T>) -> Result<T> {
        let state = self.state.read().await;
        f(state.workspace(session.workspace_name())?)
    }

    /// Apply `change` to copies of the origin's workspace and of the version
    /// store; commit both and publish the events only if it succeeds.
    async fn mutate<T>(
        &self,
        origin: Origin<'_>,
        change: impl FnOnce(&mut Scratch<'_>) -> Result<(T, Vec<Event>)>,
    ) -> Result<(T, Vec<Event>)> {
        let mut state = self.state.write().await;
        let (tree, versions, value, events) = {
            let RepositoryState {
                workspaces,
                versions,
                namespaces,
                node_types,
            } = &*state;
            let mut scratch = Scratch {
                tree: state.workspace(origin.workspace)?.clone(),
                versions: versions.clone(),
                schema: Schema {
                    node_types,
                    namespaces,
                },
                workspaces,
            };
            let (value, events) = change(&mut scratch)?;
            (scratch.tree, scratch.versions, value, events)
        };

        state.workspaces.insert(origin.workspace.to_string(), tree);
        state.versions = versions;

        let events: Vec<Event> = events
            .into_iter()
            .map(|e| e.with_user(origin.user_id))
            .collect();
        let state = &*state;
        self.observation.publish(
            origin.workspace,
            origin.session_id,
            &events,
            state.workspace(origin.workspace)?,
            &state.node_types,
        );
        Ok((value, events))
    }

    /// [`mutate`](Self::mutate) for changes that produce only events
    async fn write(
        &self,
        session: &SessionInfo,
        change: impl FnOnce(&mut Scratch<'_>) -> Result<Vec<Event>>,
    ) -> Result<Vec<Event>> {
        self.check_write_access(session)?;
        let (_, events) = self
            .mutate(session.into(), |scratch| Ok(((), change(scratch)?)))
            .await?;
        Ok(events)
    }
}

#[async_trait]
impl RepositoryService for InMemoryRepositoryService {
    type Batch = MemoryBatch;

    fn id_factory(&self) -> &dyn IdFactory {
        &self.id_factory
    }

    async fn repository_descriptors(&self) -> Result<RepositoryDescriptors> {
        self.journal.record("repository_descriptors");
        let mut descriptors = RepositoryDescriptors::new();
        descriptors.insert(descriptor_keys::REP_NAME_DESC, "hierepo in-memory repository");
        descriptors.insert(descriptor_keys::REP_VERSION_DESC, env!("CARGO_PKG_VERSION"));
        descriptors.insert(descriptor_keys::LEVEL_1_SUPPORTED, "true");
        descriptors.insert(descriptor_keys::LEVEL_2_SUPPORTED, "true");
        descriptors.insert(descriptor_keys::OPTION_TRANSACTIONS_SUPPORTED, "false");
        descriptors.insert(descriptor_keys::OPTION_VERSIONING_SUPPORTED, "true");
        descriptors.insert(descriptor_keys::OPTION_LOCKING_SUPPORTED, "true");
        descriptors.insert(
            descriptor_keys::OPTION_OBSERVATION_SUPPORTED,
            self.observation_supported.to_string(),
        );
        Ok(descriptors)
    }

    async fn workspace_names(&self, _session: &SessionInfo) -> Result<Vec<String>> {
        self.journal.record("workspace_names");
        Ok(self.state.read().await.workspaces.keys().cloned().collect())
    }

    async fn is_granted(&self, session: &SessionInfo, item: &ItemId, actions: &[Permission]) -> Result<bool> {
        self.journal.record("is_granted");
        self.read(session, |_| Ok(())).await?;
        debug!(item = %item, "checking permissions");
        let read_only = self.read_only_users.contains(session.user_id());
        Ok(!read_only || actions.iter().all(|a| *a == Permission::Read))
    }

    async fn root_id(&self, session: &SessionInfo) -> Result<NodeId> {
        self.journal.record("root_id");
        self.read(session, |tree| Ok(tree::node_id(&tree.root))).await
    }

    async fn node_info(&self, session: &SessionInfo, node: &NodeId) -> Result<NodeInfo> {
        self.journal.record("node_info");
        self.read(session, |tree| tree.node_info(&tree.resolve(node)?)).await
    }

    async fn property_info(&self, session: &SessionInfo, property: &PropertyId) -> Result<PropertyInfo> {
        self.journal.record("property_info");
        self.read(session, |tree| tree.property_info(property)).await
    }

    // ── Batches ────────────────────────────────────────────────

    async fn create_batch(&self, session: &SessionInfo, target: &ItemId) -> Result<MemoryBatch> {
        self.journal.record("create_batch");
        self.check_write_access(session)?;
        self.read(session, |_| Ok(())).await?;
        Ok(MemoryBatch::new(
            session.id().to_string(),
            session.user_id().to_string(),
            session.workspace_name().to_string(),
            session.lock_tokens(),
            target.clone(),
            self.journal.clone(),
        ))
    }

    async fn submit(&self, batch: MemoryBatch) -> Result<Vec<Event>> {
        self.journal.record("submit");
        debug!(target = %batch.target(), operations = batch.len(), "applying batch");
        let origin = Origin {
            workspace: &batch.workspace,
            session_id: &batch.session_id,
            user_id: &batch.user_id,
        };
        let (_, events) = self
            .mutate(origin, |scratch| {
                let events = batch.apply(&mut scratch.tree, &mut scratch.versions, scratch.schema)?;
                Ok(((), events))
            })
            .await?;
        Ok(events)
    }

    // ── Workspace operations ───────────────────────────────────

    async fn clone_node(
        &self,
        session: &SessionInfo,
        src_workspace: &str,
        src: &NodeId,
        dest_parent: &NodeId,
        dest_name: &Name,
        remove_existing: bool,
    ) -> Result<Vec<Event>> {
        self.journal.record("clone_node");
        if src_workspace == session.workspace_name() {
            return Err(RepositoryError::ConstraintViolation(format!(
                "cannot clone within workspace {}",
                src_workspace
            )));
        }
        let tokens = session.lock_tokens();
        self.write(session, |scratch| {
            let source = source(scratch.workspaces, src_workspace)?;
            let src = source.resolve(src)?;
            let dest_parent = scratch.tree.resolve(dest_parent)?;
            let tree = &mut scratch.tree;
            tree.check_writable(&dest_parent, &tokens)?;
            scratch.schema.check_name(dest_name)?;
            batch::check_new_child(tree, scratch.schema, &dest_parent, dest_name)?;

            let mut events = Vec::new();
            let mut removed = Vec::new();
            for id in source.descendants(&src) {
                if !tree.contains(&id) {
                    continue;
                }
                if !remove_existing {
                    return Err(RepositoryError::ItemExists(format!(
                        "node with id {} already exists at {}",
                        id,
                        tree.path_of(&id)?
                    )));
                }
                if id == dest_parent || tree.is_ancestor(&id, &dest_parent) {
                    return Err(RepositoryError::ConstraintViolation(format!(
                        "clone would remove its own destination {}",
                        tree.path_of(&dest_parent)?
                    )));
                }
                tree.check_writable(&id, &tokens)?;
                removed.extend(tree.descendants(&id));
                events.extend(tree.remove_node(&id)?);
            }

            let (_, added) = tree.copy_subtree_from(source, &src, &dest_parent, dest_name.clone(), true)?;
            events.extend(added);
            batch::check_referential_integrity(tree, &removed)?;
            Ok(events)
        })
        .await
    }

    async fn copy(
        &self,
        session: &SessionInfo,
        src_workspace: &str,
        src: &NodeId,
        dest_parent: &NodeId,
        dest_name: &Name,
    ) -> Result<Vec<Event>> {
        self.journal.record("copy");
        let tokens = session.lock_tokens();
        self.write(session, |scratch| {
            let source = source(scratch.workspaces, src_workspace)?;
            let src = source.resolve(src)?;
            let dest_parent = scratch.tree.resolve(dest_parent)?;
            scratch.tree.check_writable(&dest_parent, &tokens)?;
            scratch.schema.check_name(dest_name)?;
            batch::check_new_child(&scratch.tree, scratch.schema, &dest_parent, dest_name)?;

            let (copy, mut events) =
                scratch
                    .tree
                    .copy_subtree_from(source, &src, &dest_parent, dest_name.clone(), false)?;
            // copies of versionable nodes start a history of their own
            for id in scratch.tree.descendants(&copy) {
                if scratch.tree.node(&id)?.is_versionable() {
                    events.extend(versions::init_versionable(&mut scratch.tree, &mut scratch.versions, &id)?);
                }
            }
            Ok(events)
        })
        .await
    }

    async fn move_node(
        &self,
        session: &SessionInfo,
        src: &NodeId,
        dest_parent: &NodeId,
        dest_name: &Name,
    ) -> Result<Vec<Event>> {
        self.journal.record("move_node");
        let tokens = session.lock_tokens();
        self.write(session, |scratch| {
            let uuid = scratch.tree.resolve(src)?;
            let dest_parent = scratch.tree.resolve(dest_parent)?;
            batch::move_subtree(&mut scratch.tree, scratch.schema, &tokens, &uuid, &dest_parent, dest_name)
        })
        .await
    }

    async fn update(&self, session: &SessionInfo, node: &NodeId, src_workspace: &str) -> Result<Vec<Event>> {
        self.journal.record("update");
        let tokens = session.lock_tokens();
        self.write(session, |scratch| {
            let source = source(scratch.workspaces, src_workspace)?;
            let tree = &mut scratch.tree;
            let uuid = tree.resolve(node)?;
            let Ok(theirs) = source.node(&uuid) else {
                return Err(RepositoryError::ItemNotFound(format!(
                    "no node corresponding to {} in workspace {}",
                    tree.path_of(&uuid)?,
                    src_workspace
                )));
            };
            tree.check_writable(&uuid, &tokens)?;

            let mut events = Vec::new();
            for child in tree.node(&uuid)?.children.clone() {
                events.extend(tree.remove_node(&child)?);
            }
            events.extend(tree.set_mixins(&uuid, theirs.mixins.clone())?);
            events.extend(tree.replace_properties(&uuid, theirs.properties.clone())?);
            for child in &theirs.children {
                let name = source.node(child)?.name.clone().ok_or_else(|| {
                    RepositoryError::Internal(format!("child node {} has no name", child))
                })?;
                let (_, added) = tree.copy_subtree_from(source, child, &uuid, name, true)?;
                events.extend(added);
            }
            Ok(events)
        })
        .await
    }

    async fn import_xml(
        &self,
        session: &SessionInfo,
        parent: &NodeId,
        xml: Bytes,
        uuid_behavior: ImportUuidBehavior,
    ) -> Result<Vec<Event>> {
        self.journal.record("import_xml");
        let document = import::parse_document(&xml)?;
        let tokens = session.lock_tokens();
        self.write(session, |scratch| {
            let parent = scratch.tree.resolve(parent)?;
            scratch.tree.check_writable(&parent, &tokens)?;
            import::import_document(
                &mut scratch.tree,
                &mut scratch.versions,
                scratch.schema,
                &parent,
                &document,
                uuid_behavior,
            )
        })
        .await
    }

    // ── Versioning ─────────────────────────────────────────────

    async fn checkout(&self, session: &SessionInfo, node: &NodeId) -> Result<Vec<Event>> {
        self.journal.record("checkout");
        let tokens = session.lock_tokens();
        self.write(session, |scratch| {
            let uuid = scratch.tree.resolve(node)?;
            scratch.tree.check_lock(&uuid, &tokens)?;
            versions::checkout(&mut scratch.tree, &scratch.versions, &uuid)
        })
        .await
    }

    async fn checkin(&self, session: &SessionInfo, node: &NodeId) -> Result<Vec<Event>> {
        self.journal.record("checkin");
        let tokens = session.lock_tokens();
        self.write(session, |scratch| {
            let uuid = scratch.tree.resolve(node)?;
            scratch.tree.check_lock(&uuid, &tokens)?;
            versions::checkin(&mut scratch.tree, &mut scratch.versions, &uuid)
        })
        .await
    }

    async fn restore(
        &self,
        session: &SessionInfo,
        node: &NodeId,
        version: &NodeId,
        _remove_existing: bool,
    ) -> Result<Vec<Event>> {
        self.journal.record("restore");
        let version = unique_id(version)?;
        let tokens = session.lock_tokens();
        self.write(session, |scratch| {
            let uuid = scratch.tree.resolve(node)?;
            scratch.tree.check_lock(&uuid, &tokens)?;
            versions::restore(&mut scratch.tree, &scratch.versions, &uuid, &version)
        })
        .await
    }

    async fn restore_versions(
        &self,
        session: &SessionInfo,
        versions: &[NodeId],
        _remove_existing: bool,
    ) -> Result<Vec<Event>> {
        self.journal.record("restore_versions");
        let version_ids = versions.iter().map(unique_id).collect::<Result<Vec<_>>>()?;
        let tokens = session.lock_tokens();
        self.write(session, |scratch| {
            let mut events = Vec::new();
            for version in &version_ids {
                let uuid = versions::versionable_of(&scratch.versions, version)?;
                scratch.tree.check_lock(&uuid, &tokens)?;
                events.extend(versions::restore(&mut scratch.tree, &scratch.versions, &uuid, version)?);
            }
            Ok(events)
        })
        .await
    }

    async fn merge(
        &self,
        session: &SessionInfo,
        node: &NodeId,
        src_workspace: &str,
        best_effort: bool,
    ) -> Result<Vec<Event>> {
        self.journal.record("merge");
        let tokens = session.lock_tokens();
        self.write(session, |scratch| {
            let source = source(scratch.workspaces, src_workspace)?;
            let uuid = scratch.tree.resolve(node)?;
            scratch.tree.check_lock(&uuid, &tokens)?;
            let mut events = Vec::new();
            for id in scratch.tree.descendants(&uuid) {
                events.extend(versions::merge(
                    &mut scratch.tree,
                    source,
                    &scratch.versions,
                    &id,
                    best_effort,
                )?);
            }
            Ok(events)
        })
        .await
    }

    async fn resolve_merge_conflict(
        &self,
        session: &SessionInfo,
        node: &NodeId,
        merge_failed: &[NodeId],
        predecessors: &[NodeId],
    ) -> Result<Vec<Event>> {
        self.journal.record("resolve_merge_conflict");
        let merge_failed = merge_failed.iter().map(unique_id).collect::<Result<Vec<_>>>()?;
        let predecessors = predecessors.iter().map(unique_id).collect::<Result<Vec<_>>>()?;
        let tokens = session.lock_tokens();
        self.write(session, |scratch| {
            let uuid = scratch.tree.resolve(node)?;
            scratch.tree.check_lock(&uuid, &tokens)?;
            versions::resolve_merge_conflict(&mut scratch.tree, &uuid, &merge_failed, &predecessors)
        })
        .await
    }

    async fn add_version_label(
        &self,
        session: &SessionInfo,
        version_history: &NodeId,
        version: &NodeId,
        label: &Name,
        move_label: bool,
    ) -> Result<Vec<Event>> {
        self.journal.record("add_version_label");
        let history = unique_id(version_history)?;
        let version = unique_id(version)?;
        self.write(session, |scratch| {
            scratch.versions.add_label(&history, &version, label, move_label)?;
            Ok(Vec::new())
        })
        .await
    }

    async fn remove_version_label(
        &self,
        session: &SessionInfo,
        version_history: &NodeId,
        version: &NodeId,
        label: &Name,
    ) -> Result<Vec<Event>> {
        self.journal.record("remove_version_label");
        let history = unique_id(version_history)?;
        let version = unique_id(version)?;
        self.write(session, |scratch| {
            scratch.versions.remove_label(&history, &version, label)?;
            Ok(Vec::new())
        })
        .await
    }

    // ── Locking ────────────────────────────────────────────────

    async fn lock_info(&self, session: &SessionInfo, node: &NodeId) -> Result<Option<LockInfo>> {
        self.journal.record("lock_info");
        let tokens = session.lock_tokens();
        self.read(session, |tree| {
            Ok(locks::lock_info_for(tree, &tree.resolve(node)?, &tokens))
        })
        .await
    }

    async fn lock(&self, session: &SessionInfo, node: &NodeId, deep: bool) -> Result<Vec<Event>> {
        self.journal.record("lock");
        self.check_write_access(session)?;
        let (info, events) = self
            .mutate(session.into(), |scratch| {
                let uuid = scratch.tree.resolve(node)?;
                if !scratch.schema.node_is(scratch.tree.node(&uuid)?, names::MIX_LOCKABLE) {
                    return Err(RepositoryError::Lock(format!(
                        "{} is not lockable",
                        scratch.tree.path_of(&uuid)?
                    )));
                }
                locks::lock(&mut scratch.tree, &uuid, session.id(), session.user_id(), deep)
            })
            .await?;
        if let Some(token) = info.token {
            session.add_lock_token(token);
        }
        Ok(events)
    }

    async fn refresh_lock(&self, session: &SessionInfo, node: &NodeId) -> Result<Vec<Event>> {
        self.journal.record("refresh_lock");
        let tokens = session.lock_tokens();
        self.read(session, |tree| locks::refresh(tree, &tree.resolve(node)?, &tokens))
            .await?;
        Ok(Vec::new())
    }

    async fn unlock(&self, session: &SessionInfo, node: &NodeId) -> Result<Vec<Event>> {
        self.journal.record("unlock");
        self.check_write_access(session)?;
        let tokens = session.lock_tokens();
        let (token, events) = self
            .mutate(session.into(), |scratch| {
                let uuid = scratch.tree.resolve(node)?;
                locks::unlock(&mut scratch.tree, &uuid, &tokens)
            })
            .await?;
        session.remove_lock_token(&token);
        Ok(events)
    }

    // ── Namespaces and node types ──────────────────────────────

    async fn registered_namespaces(&self, _session: &SessionInfo) -> Result<BTreeMap<String, String>> {
        self.journal.record("registered_namespaces");
        Ok(self.state.read().await.namespaces.mappings().clone())
    }

    async fn register_namespace(&self, session: &SessionInfo, prefix: &str, uri: &str) -> Result<()> {
        self.journal.record("register_namespace");
        self.check_write_access(session)?;
        let mut state = self.state.write().await;
        state.namespaces.check_registration(prefix, uri)?;
        state.namespaces.insert(prefix, uri);
        info!("registered namespace {} -> {}", prefix, uri);
        Ok(())
    }

    async fn unregister_namespace(&self, session: &SessionInfo, uri: &str) -> Result<()> {
        self.journal.record("unregister_namespace");
        self.check_write_access(session)?;
        let mut state = self.state.write().await;
        state.namespaces.check_unregistration(uri)?;
        state.namespaces.remove_uri(uri);
        info!("unregistered namespace {}", uri);
        Ok(())
    }

    async fn node_type_definitions(&self, _session: &SessionInfo) -> Result<Vec<NodeTypeDefinition>> {
        self.journal.record("node_type_definitions");
        Ok(self.state.read().await.node_types.definitions())
    }

    async fn register_node_types(&self, session: &SessionInfo, definitions: &[NodeTypeDefinition]) -> Result<()> {
        self.journal.record("register_node_types");
        self.check_write_access(session)?;
        let mut state = self.state.write().await;
        for def in definitions {
            let schema = Schema {
                node_types: &state.node_types,
                namespaces: &state.namespaces,
            };
            schema.check_name(&def.name)?;
        }
        state.node_types.check_new(definitions)?;
        state.node_types.insert_all(definitions);
        info!("registered {} node types", definitions.len());
        Ok(())
    }

    async fn reregister_node_types(&self, session: &SessionInfo, definitions: &[NodeTypeDefinition]) -> Result<()> {
        self.journal.record("reregister_node_types");
        self.check_write_access(session)?;
        let mut state = self.state.write().await;
        for def in definitions {
            if !state.node_types.contains(&def.name) {
                return Err(RepositoryError::NoSuchNodeType(def.name.to_string()));
            }
            if let Some(missing) = def.supertypes.iter().find(|s| !state.node_types.contains(s)) {
                return Err(RepositoryError::NoSuchNodeType(format!(
                    "supertype {} of {}",
                    missing, def.name
                )));
            }
        }
        state.node_types.insert_all(definitions);
        info!("re-registered {} node types", definitions.len());
        Ok(())
    }

    async fn unregister_node_types(&self, session: &SessionInfo, names: &[Name]) -> Result<()> {
        self.journal.record("unregister_node_types");
        self.check_write_access(session)?;
        let mut state = self.state.write().await;
        for name in names {
            if !state.node_types.contains(name) {
                return Err(RepositoryError::NoSuchNodeType(name.to_string()));
            }
            if state.workspaces.values().any(|tree| tree.uses_node_type(name)) {
                return Err(RepositoryError::ConstraintViolation(format!(
                    "node type {} is still in use",
                    name
                )));
            }
            if let Some(subtype) = state.node_types.subtypes_of(name).find(|d| !names.contains(&d.name)) {
                return Err(RepositoryError::ConstraintViolation(format!(
                    "node type {} is a supertype of {}",
                    name, subtype.name
                )));
            }
        }
        state.node_types.remove_all(names);
        info!("unregistered {} node types", names.len());
        Ok(())
    }

    // ── Observation and lifecycle ──────────────────────────────

    async fn add_event_listener(
        &self,
        session: &SessionInfo,
        root: &NodeId,
        listener: Arc<dyn EventListener>,
        filter: EventFilter,
    ) -> Result<()> {
        self.journal.record("add_event_listener");
        if !self.observation_supported {
            return Err(RepositoryError::UnsupportedOperation(
                "observation is not supported".to_string(),
            ));
        }
        let root = self
            .read(session, |tree| tree.path_of(&tree.resolve(root)?))
            .await?;
        debug!(session = session.id(), root = %root, "registering event listener");
        self.observation
            .register(session.id(), session.workspace_name(), root, listener, filter);
        Ok(())
    }

    async fn remove_event_listener(
        &self,
        session: &SessionInfo,
        _root: &NodeId,
        listener: &Arc<dyn EventListener>,
    ) -> Result<()> {
        self.journal.record("remove_event_listener");
        if !self.observation.unregister(session.id(), listener) {
            debug!(session = session.id(), "event listener was not registered");
        }
        Ok(())
    }

    async fn dispose(&self, session: &SessionInfo) -> Result<()> {
        self.journal.record("dispose");
        let listeners = self.observation.unregister_session(session.id());

        let mut state = self.state.write().await;
        let mut released = 0;
        for name in state.workspaces.keys().cloned().collect::<Vec<_>>() {
            let Some(tree) = state.workspaces.get_mut(&name) else {
                continue;
            };
            let (tokens, events) = locks::release_session(tree, session.id())?;
            released += tokens.len();
            for token in &tokens {
                session.remove_lock_token(token);
            }
            let events: Vec<Event> = events
                .into_iter()
                .map(|e| e.with_user(session.user_id()))
                .collect();
            let state = &*state;
            self.observation.publish(
                &name,
                session.id(),
                &events,
                state.workspace(&name)?,
                &state.node_types,
            );
        }
        debug!(session = session.id(), listeners, released, "disposed session");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::name::well_known;
    use crate::service::Batch;

    fn name(s: &str) -> Name {
        Name::new(s).unwrap()
    }

    #[tokio::test]
    async fn test_failed_batch_leaves_workspace_untouched() {
        let service = InMemoryRepositoryService::new();
        let session = SessionInfo::new("alice", "default");
        let root = service.root_id(&session).await.unwrap();

        let mut batch = service.create_batch(&session, &root.clone().into()).await.unwrap();
        batch
            .add_node(&root, &name("a"), &well_known(names::NT_UNSTRUCTURED), None)
            .unwrap();
        batch
            .add_node(&root, &name("b"), &name("app:missing"), None)
            .unwrap();
        assert!(service.submit(batch).await.is_err());

        let info = service.node_info(&session, &root).await.unwrap();
        assert!(info.children.is_empty());
        assert_eq!(
            service.journal(),
            vec![
                "root_id",
                "create_batch",
                "batch.add_node",
                "batch.add_node",
                "submit",
                "node_info"
            ]
        );
    }

    #[tokio::test]
    async fn test_read_only_user() {
        let service = InMemoryRepositoryService::new().with_read_only_user("guest");
        let session = SessionInfo::new("guest", "default");
        let root = service.root_id(&session).await.unwrap();

        assert!(service
            .is_granted(&session, &root.clone().into(), &[Permission::Read])
            .await
            .unwrap());
        assert!(!service
            .is_granted(&session, &root.clone().into(), &[Permission::Read, Permission::AddNode])
            .await
            .unwrap());
        assert!(matches!(
            service.create_batch(&session, &root.into()).await,
            Err(RepositoryError::AccessDenied(_))
        ));
    }

    #[tokio::test]
    async fn test_unknown_workspace() {
        let service = InMemoryRepositoryService::new();
        let session = SessionInfo::new("alice", "missing");
        assert!(matches!(
            service.root_id(&session).await,
            Err(RepositoryError::NoSuchWorkspace(_))
        ));
        service.create_workspace("missing").await.unwrap();
        assert!(service.root_id(&session).await.is_ok());
        assert!(service.create_workspace("missing").await.is_err());
    }

    #[tokio::test]
    async fn test_node_type_unregistration_rules() {
        let service = InMemoryRepositoryService::new();
        let session = SessionInfo::new("alice", "default");
        let base = NodeTypeDefinition::new(name("app:base"), vec![well_known(names::NT_BASE)], false);
        let leaf = NodeTypeDefinition::new(name("app:leaf"), vec![name("app:base")], false);

        assert!(matches!(
            service.register_node_types(&session, &[base.clone()]).await,
            Err(RepositoryError::Namespace(_))
        ));
        service.register_namespace(&session, "app", "urn:app").await.unwrap();
        service
            .register_node_types(&session, &[base.clone(), leaf.clone()])
            .await
            .unwrap();

        assert!(matches!(
            service.unregister_node_types(&session, &[name("app:base")]).await,
            Err(RepositoryError::ConstraintViolation(_))
        ));
        service
            .unregister_node_types(&session, &[name("app:base"), name("app:leaf")])
            .await
            .unwrap();
        assert!(!service
            .node_type_definitions(&session)
            .await
            .unwrap()
            .iter()
            .any(|d| d.name == name("app:leaf")));
    }
}
