//! Workspace manager
//!
//! Entry point of the workspace layer for one session: owns the item state
//! cache, the listener registry and the external change listener, and
//! executes change logs and workspace operations against the backend.

use crate::cache::WorkspaceItemStateCache;
use crate::changelog::ChangeLog;
use crate::config::WorkspaceConfig;
use crate::dispatch::OperationDispatcher;
use crate::error::{RepositoryError, Result};
use crate::event::{Event, EventFilter, EventListener, InternalEventListener};
use crate::id::{IdFactory, ItemId, NodeId};
use crate::listeners::ListenerRegistry;
use crate::name::{Name, Path};
use crate::operation::Operation;
use crate::registry::{NamespaceRegistry, NodeTypeRegistry};
use crate::service::{
    ImportUuidBehavior, LockInfo, NodeTypeDefinition, Permission, RepositoryService, SessionInfo,
};
use crate::state::ItemState;
use bytes::Bytes;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, RwLock};
use tracing::{debug, info, warn};

/// Receives changes the backend pushes for other sessions' writes and
/// forwards them as external changes.
struct ExternalChangeListener {
    listeners: Arc<ListenerRegistry>,
}

impl EventListener for ExternalChangeListener {
    fn on_event(&self, events: Vec<Event>) {
        self.listeners.deliver(&events, false, None);
    }
}

/// Workspace layer for one session
pub struct WorkspaceManager<S: RepositoryService> {
    service: Arc<S>,
    session: Arc<SessionInfo>,
    config: WorkspaceConfig,
    cache: Arc<WorkspaceItemStateCache<S>>,
    listeners: Arc<ListenerRegistry>,
    namespaces: RwLock<NamespaceRegistry>,
    node_types: RwLock<NodeTypeRegistry>,
    /// Registration with the backend; `None` when the backend does not
    /// support observation
    external_listener: Option<(NodeId, Arc<dyn EventListener>)>,
    disposed: AtomicBool,
}

impl<S: RepositoryService> WorkspaceManager<S> {
    /// Set up the workspace layer for `session`.
    pub async fn new(service: Arc<S>, session: Arc<SessionInfo>, config: WorkspaceConfig) -> Result<Self> {
        let listeners = Arc::new(ListenerRegistry::new());
        let cache = Arc::new(WorkspaceItemStateCache::new(
            service.clone(),
            session.clone(),
            config.cache_capacity,
        ));
        listeners.add(cache.clone());

        let descriptors = service.repository_descriptors().await?;

        let namespaces = NamespaceRegistry::new(
            service.registered_namespaces(&session).await?,
            descriptors.level2_supported(),
        );
        let node_types = NodeTypeRegistry::new(service.node_type_definitions(&session).await?);

        let external_listener = if descriptors.observation_supported() && config.observe_external_changes {
            let root = service.root_id(&session).await?;
            let listener: Arc<dyn EventListener> = Arc::new(ExternalChangeListener {
                listeners: listeners.clone(),
            });
            let mut filter = EventFilter::all();
            filter.no_local = config.exclude_local_events;
            service
                .add_event_listener(&session, &root, listener.clone(), filter)
                .await?;
            debug!(session = session.id(), "registered external change listener");
            Some((root, listener))
        } else {
            debug!(session = session.id(), "backend does not deliver external changes");
            None
        };

        info!(
            user = session.user_id(),
            workspace = session.workspace_name(),
            "workspace manager ready"
        );

        Ok(Self {
            service,
            session,
            config,
            cache,
            listeners,
            namespaces: RwLock::new(namespaces),
            node_types: RwLock::new(node_types),
            external_listener,
            disposed: AtomicBool::new(false),
        })
    }

    pub fn session(&self) -> &Arc<SessionInfo> {
        &self.session
    }

    pub fn service(&self) -> &Arc<S> {
        &self.service
    }

    pub fn config(&self) -> &WorkspaceConfig {
        &self.config
    }

    pub fn cache(&self) -> &Arc<WorkspaceItemStateCache<S>> {
        &self.cache
    }

    pub fn id_factory(&self) -> &dyn IdFactory {
        self.service.id_factory()
    }

    /// Whether changes made by other sessions reach this manager
    pub fn observes_external_changes(&self) -> bool {
        self.external_listener.is_some()
    }

    pub fn is_disposed(&self) -> bool {
        self.disposed.load(Ordering::SeqCst)
    }

    fn dispatcher(&self) -> OperationDispatcher<'_, S> {
        OperationDispatcher {
            service: &self.service,
            session: &self.session,
            cache: &self.cache,
            listeners: &self.listeners,
            log_operations: self.config.log_operations,
        }
    }

    fn ensure_open(&self) -> Result<()> {
        if self.is_disposed() {
            return Err(RepositoryError::InvalidItemState(
                "workspace manager has been disposed".to_string(),
            ));
        }
        Ok(())
    }

    // ── Listeners ──────────────────────────────────────────────

    /// Register a listener for local and external changes
    pub fn add_event_listener(&self, listener: Arc<dyn InternalEventListener>) {
        self.listeners.add(listener);
    }

    pub fn remove_event_listener(&self, listener: &Arc<dyn InternalEventListener>) {
        self.listeners.remove(listener);
    }

    // ── Cache reads ────────────────────────────────────────────

    pub async fn root_state(&self) -> Result<ItemState> {
        self.cache.root_state().await
    }

    pub async fn item_state(&self, id: &ItemId) -> Result<ItemState> {
        self.cache.item_state(id).await
    }

    pub async fn has_item_state(&self, id: &ItemId) -> bool {
        self.cache.has_item_state(id).await
    }

    pub async fn referencing_states(&self, node: &NodeId) -> Result<Vec<ItemState>> {
        self.cache.referencing_states(node).await
    }

    pub async fn has_referencing_states(&self, node: &NodeId) -> bool {
        self.cache.has_referencing_states(node).await
    }

    // ── Execution ──────────────────────────────────────────────

    /// Apply a change log as one atomic batch
    pub async fn execute_change_log(&self, change_log: &ChangeLog) -> Result<()> {
        self.ensure_open()?;
        self.dispatcher().execute_change_log(change_log).await
    }

    /// Execute a single workspace operation
    pub async fn execute(&self, operation: &Operation) -> Result<()> {
        self.ensure_open()?;
        self.dispatcher().execute_standalone(operation).await
    }

    // ── Workspace services ─────────────────────────────────────

    pub async fn workspace_names(&self) -> Result<Vec<String>> {
        self.service.workspace_names(&self.session).await
    }

    pub async fn lock_info(&self, node: &NodeId) -> Result<Option<LockInfo>> {
        self.service.lock_info(&self.session, node).await
    }

    pub fn lock_tokens(&self) -> Vec<String> {
        self.session.lock_tokens()
    }

    /// Hand a lock token to this session.
    ///
    /// Always succeeds: the backend cannot tell whether another session
    /// still holds the token.
    pub fn add_lock_token(&self, token: impl Into<String>) {
        self.session.add_lock_token(token);
    }

    pub fn remove_lock_token(&self, token: &str) {
        self.session.remove_lock_token(token);
    }

    /// Check `actions` on the item at `rel_path` below `parent`
    pub async fn is_granted_at(
        &self,
        parent: &NodeId,
        rel_path: &Path,
        actions: &[Permission],
    ) -> Result<bool> {
        let id = self.id_factory().create_node_id(parent, rel_path)?;
        self.service
            .is_granted(&self.session, &ItemId::Node(id), actions)
            .await
    }

    /// Check `actions` on an item. Items that only exist locally are always
    /// accessible.
    pub async fn is_granted(&self, state: &ItemState, actions: &[Permission]) -> Result<bool> {
        match state.workspace_id() {
            Some(id) => self.service.is_granted(&self.session, id, actions).await,
            None => Ok(true),
        }
    }

    pub async fn can_read(&self, state: &ItemState) -> Result<bool> {
        self.is_granted(state, &[Permission::Read]).await
    }

    pub async fn can_remove(&self, state: &ItemState) -> Result<bool> {
        self.is_granted(state, &[Permission::Remove]).await
    }

    /// Whether the session may access the named workspace
    pub async fn can_access(&self, workspace_name: &str) -> Result<bool> {
        Ok(self
            .workspace_names()
            .await?
            .iter()
            .any(|name| name == workspace_name))
    }

    /// Import XML below `parent`; the resulting events are local.
    pub async fn import_xml(
        &self,
        parent: &NodeId,
        xml: Bytes,
        uuid_behavior: ImportUuidBehavior,
    ) -> Result<()> {
        self.ensure_open()?;
        let events = self
            .service
            .import_xml(&self.session, parent, xml, uuid_behavior)
            .await?;
        self.listeners.deliver(&events, true, None);
        Ok(())
    }

    // ── Namespaces and node types ──────────────────────────────

    pub fn namespace_uri(&self, prefix: &str) -> Option<String> {
        self.namespaces
            .read()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
            .uri(prefix)
            .map(str::to_string)
    }

    pub fn namespace_prefixes(&self) -> Vec<String> {
        self.namespaces
            .read()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
            .prefixes()
    }

    pub async fn register_namespace(&self, prefix: &str, uri: &str) -> Result<()> {
        self.namespaces
            .read()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
            .check_registration(prefix, uri)?;
        self.service
            .register_namespace(&self.session, prefix, uri)
            .await?;
        self.namespaces
            .write()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
            .insert(prefix, uri);
        Ok(())
    }

    pub async fn unregister_namespace(&self, uri: &str) -> Result<()> {
        self.namespaces
            .read()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
            .check_unregistration(uri)?;
        self.service.unregister_namespace(&self.session, uri).await?;
        self.namespaces
            .write()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
            .remove_uri(uri);
        Ok(())
    }

    pub fn node_type(&self, name: &Name) -> Option<NodeTypeDefinition> {
        self.node_types
            .read()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
            .get(name)
            .cloned()
    }

    /// Whether `node_type` is `candidate` or inherits from it
    pub fn is_node_type(&self, node_type: &Name, candidate: &Name) -> bool {
        self.node_types
            .read()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
            .is_derived_from(node_type, candidate)
    }

    pub async fn register_node_types(&self, definitions: &[NodeTypeDefinition]) -> Result<()> {
        self.node_types
            .read()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
            .check_new(definitions)?;
        self.service
            .register_node_types(&self.session, definitions)
            .await?;
        self.node_types
            .write()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
            .insert_all(definitions);
        Ok(())
    }

    pub async fn reregister_node_types(&self, definitions: &[NodeTypeDefinition]) -> Result<()> {
        self.service
            .reregister_node_types(&self.session, definitions)
            .await?;
        self.node_types
            .write()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
            .insert_all(definitions);
        Ok(())
    }

    pub async fn unregister_node_types(&self, names: &[Name]) -> Result<()> {
        self.service
            .unregister_node_types(&self.session, names)
            .await?;
        self.node_types
            .write()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
            .remove_all(names);
        Ok(())
    }

    // ── Lifecycle ──────────────────────────────────────────────

    /// Unregister the external change listener and release the session.
    ///
    /// Failures are logged, never returned. Calls after the first are no-ops.
    pub async fn dispose(&self) {
        if self.disposed.swap(true, Ordering::SeqCst) {
            debug!(session = self.session.id(), "workspace manager already disposed");
            return;
        }

        if let Some((root, listener)) = &self.external_listener {
            if let Err(e) = self
                .service
                .remove_event_listener(&self.session, root, listener)
                .await
            {
                warn!("Exception while disposing workspace manager: {}", e);
            }
        }
        if let Err(e) = self.service.dispose(&self.session).await {
            warn!("Exception while disposing session info: {}", e);
        }
        info!(session = self.session.id(), "workspace manager disposed");
    }
}
