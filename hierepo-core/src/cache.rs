//! Item state cache bound to one session
//!
//! Holds the states loaded from the backend and keeps them current by
//! listening to committed changes. All reads and all event applications go
//! through one mutex; the mutex is never held while the backend is called.
//! A load that overlaps an event delivery is cached as stale, so the next
//! read fetches the item again.

use crate::error::{RepositoryError, Result};
use crate::event::{Event, EventBundle, EventType, InternalEventListener};
use crate::id::{ItemId, NodeId};
use crate::name::names;
use crate::service::{RepositoryService, SessionInfo};
use crate::state::{ItemState, ItemStatus};
use lru::LruCache;
use std::collections::{HashMap, HashSet};
use std::num::NonZeroUsize;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use tracing::{debug, warn};

struct CacheInner {
    states: LruCache<ItemId, ItemState>,
    /// Ids a caller used that differ from the backend's canonical id
    aliases: HashMap<ItemId, ItemId>,
    root_id: Option<NodeId>,
    /// Incremented by every applied event bundle
    generation: u64,
}

impl CacheInner {
    fn resolve(&self, id: &ItemId) -> ItemId {
        self.aliases.get(id).cloned().unwrap_or_else(|| id.clone())
    }

    fn mark_stale(&mut self, id: &ItemId) {
        if let Some(state) = self.states.peek_mut(id) {
            state.set_status(ItemStatus::Stale);
        }
    }

    fn mark_node_stale(&mut self, node: Option<&NodeId>) {
        if let Some(node) = node {
            self.mark_stale(&ItemId::Node(node.clone()));
        }
    }

    /// Evict `root` and every cached state below it
    fn evict_subtree(&mut self, root: &ItemId) {
        let mut removed: HashSet<NodeId> = HashSet::new();
        self.states.pop(root);
        if let ItemId::Node(node) = root {
            removed.insert(node.clone());
        }

        loop {
            let doomed: Vec<ItemId> = self
                .states
                .iter()
                .filter(|(_, state)| state.parent().is_some_and(|p| removed.contains(p)))
                .map(|(id, _)| id.clone())
                .collect();
            if doomed.is_empty() {
                break;
            }
            for id in doomed {
                self.states.pop(&id);
                if let ItemId::Node(node) = id {
                    removed.insert(node);
                }
            }
        }
    }

    fn apply(&mut self, event: &Event) {
        let parent = event
            .parent_id
            .as_ref()
            .or_else(|| event.item_id.as_property().map(|p| p.parent()));

        match event.event_type {
            EventType::NodeAdded | EventType::PropertyAdded => {
                self.mark_node_stale(parent);
            }
            EventType::NodeRemoved | EventType::PropertyRemoved => {
                self.evict_subtree(&event.item_id);
                self.mark_node_stale(parent);
            }
            EventType::PropertyChanged => {
                self.mark_stale(&event.item_id);
                // node states mirror their type information
                let type_property = event.item_id.as_property().is_some_and(|p| {
                    matches!(p.name().as_str(), names::JCR_PRIMARY_TYPE | names::JCR_MIXIN_TYPES)
                });
                if type_property {
                    self.mark_node_stale(parent);
                }
            }
        }
        if event.event_type.concerns_node() {
            // path-based aliases may point elsewhere after structural changes
            self.aliases.clear();
        }
    }
}

/// Cache of [`ItemState`]s for one session
pub struct WorkspaceItemStateCache<S: RepositoryService> {
    service: Arc<S>,
    session: Arc<SessionInfo>,
    inner: Mutex<CacheInner>,
}

impl<S: RepositoryService> WorkspaceItemStateCache<S> {
    pub fn new(service: Arc<S>, session: Arc<SessionInfo>, capacity: usize) -> Self {
        let capacity = NonZeroUsize::new(capacity).unwrap_or(NonZeroUsize::MIN);
        Self {
            service,
            session,
            inner: Mutex::new(CacheInner {
                states: LruCache::new(capacity),
                aliases: HashMap::new(),
                root_id: None,
                generation: 0,
            }),
        }
    }

    fn lock(&self) -> MutexGuard<'_, CacheInner> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Number of cached states
    pub fn len(&self) -> usize {
        self.lock().states.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Whether a current state for `id` is cached, without loading it
    pub fn is_cached(&self, id: &ItemId) -> bool {
        let inner = self.lock();
        let key = inner.resolve(id);
        inner
            .states
            .peek(&key)
            .is_some_and(|s| s.status() == ItemStatus::Existing)
    }

    /// Cached status of `id`, without loading it
    pub fn cached_status(&self, id: &ItemId) -> Option<ItemStatus> {
        let inner = self.lock();
        let key = inner.resolve(id);
        inner.states.peek(&key).map(ItemState::status)
    }

    pub async fn root_state(&self) -> Result<ItemState> {
        let cached = self.lock().root_id.clone();
        let root_id = match cached {
            Some(id) => id,
            None => {
                let id = self.service.root_id(&self.session).await?;
                self.lock().root_id = Some(id.clone());
                id
            }
        };
        self.item_state(&ItemId::Node(root_id)).await
    }

    /// Look up a state, loading it from the backend when it is missing or
    /// stale.
    pub async fn item_state(&self, id: &ItemId) -> Result<ItemState> {
        let generation = {
            let mut inner = self.lock();
            let key = inner.resolve(id);
            if let Some(state) = inner.states.get(&key) {
                if state.status() == ItemStatus::Existing {
                    return Ok(state.clone());
                }
            }
            inner.generation
        };

        let loaded = self.load(id).await;
        self.store(id, loaded, generation)
    }

    async fn load(&self, id: &ItemId) -> Result<ItemState> {
        match id {
            ItemId::Node(node) => self
                .service
                .node_info(&self.session, node)
                .await
                .map(ItemState::from_node_info),
            ItemId::Property(property) => self
                .service
                .property_info(&self.session, property)
                .await
                .map(ItemState::from_property_info),
        }
    }

    /// Record the outcome of a load that started at `generation`.
    ///
    /// The loaded state is returned either way, but it is only cached as
    /// current when no events were applied while it was in flight.
    fn store(&self, id: &ItemId, loaded: Result<ItemState>, generation: u64) -> Result<ItemState> {
        let mut inner = self.lock();
        match loaded {
            Ok(state) => {
                let canonical = state.id().clone();
                if inner.generation == generation {
                    if canonical != *id {
                        inner.aliases.insert(id.clone(), canonical.clone());
                    }
                    debug!(id = %canonical, "loaded item state");
                    inner.states.put(canonical, state.clone());
                } else {
                    debug!(id = %canonical, "events arrived during load, caching state as stale");
                    let mut stale = state.clone();
                    stale.set_status(ItemStatus::Stale);
                    inner.states.put(canonical, stale);
                }
                Ok(state)
            }
            Err(e) => {
                if matches!(
                    e,
                    RepositoryError::ItemNotFound(_) | RepositoryError::PathNotFound(_)
                ) {
                    let key = inner.resolve(id);
                    inner.states.pop(&key);
                    inner.aliases.remove(id);
                }
                Err(e)
            }
        }
    }

    /// Whether `id` exists, loading it if necessary
    pub async fn has_item_state(&self, id: &ItemId) -> bool {
        match self.item_state(id).await {
            Ok(_) => true,
            Err(RepositoryError::ItemNotFound(_)) | Err(RepositoryError::PathNotFound(_)) => false,
            Err(e) => {
                warn!(id = %id, "existence check failed: {}", e);
                false
            }
        }
    }

    /// States of the reference properties pointing at `node`
    pub async fn referencing_states(&self, node: &NodeId) -> Result<Vec<ItemState>> {
        let state = self.item_state(&ItemId::Node(node.clone())).await?;
        let references = state
            .as_node()
            .map(|n| n.references.clone())
            .unwrap_or_default();

        let mut states = Vec::with_capacity(references.len());
        for reference in references {
            match self.item_state(&ItemId::Property(reference)).await {
                Ok(state) => states.push(state),
                Err(RepositoryError::ItemNotFound(_)) => {}
                Err(e) => return Err(e),
            }
        }
        Ok(states)
    }

    pub async fn has_referencing_states(&self, node: &NodeId) -> bool {
        self.referencing_states(node)
            .await
            .map(|states| !states.is_empty())
            .unwrap_or(false)
    }
}

impl<S: RepositoryService> InternalEventListener for WorkspaceItemStateCache<S> {
    fn on_event(&self, bundle: &EventBundle<'_>) {
        let mut inner = self.lock();
        inner.generation = inner.generation.wrapping_add(1);
        for event in bundle.events() {
            inner.apply(event);
        }
        debug!(
            events = bundle.len(),
            is_local = bundle.is_local(),
            cached = inner.states.len(),
            "applied events to item state cache"
        );
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::id::PropertyId;
    use crate::memory::{InMemoryRepositoryService, ROOT_UUID};
    use crate::name::Name;
    use crate::service::Batch;
    use crate::value::{PropertyType, QValue, ValuePayload};

    fn name(s: &str) -> Name {
        Name::new(s).unwrap()
    }

    fn long(value: i64) -> ValuePayload {
        ValuePayload::from_values(&[QValue::Long(value)], PropertyType::Long, false).unwrap()
    }

    /// Node `a` with a Long property `count` set to 0
    async fn setup(service: &InMemoryRepositoryService, session: &SessionInfo) -> PropertyId {
        let root = NodeId::from_unique_id(ROOT_UUID);
        let a = NodeId::from_unique_id("a");
        let mut batch = service.create_batch(session, &root.clone().into()).await.unwrap();
        batch
            .add_node(&root, &name("a"), &name("nt:unstructured"), Some("a"))
            .unwrap();
        batch
            .add_property(&a, &name("count"), long(0), PropertyType::Long)
            .unwrap();
        service.submit(batch).await.unwrap();
        service.id_factory().create_property_id(&a, name("count"))
    }

    async fn set_count(
        service: &InMemoryRepositoryService,
        session: &SessionInfo,
        count: &PropertyId,
        value: i64,
    ) -> Vec<Event> {
        let mut batch = service.create_batch(session, &count.clone().into()).await.unwrap();
        batch.set_value(count, long(value), PropertyType::Long).unwrap();
        service.submit(batch).await.unwrap()
    }

    fn values(state: &ItemState) -> Vec<QValue> {
        state.as_property().unwrap().values.clone()
    }

    #[tokio::test]
    async fn test_load_overlapping_event_is_cached_stale() {
        let service = Arc::new(InMemoryRepositoryService::new());
        let alice = SessionInfo::new("alice", "default");
        let count = setup(&service, &alice).await;
        let id = ItemId::Property(count.clone());

        let bob = Arc::new(SessionInfo::new("bob", "default"));
        let cache = WorkspaceItemStateCache::new(service.clone(), bob, 100);

        // bob's read observes 0, alice's change is delivered before it completes
        let generation = cache.lock().generation;
        let loaded = cache.load(&id).await;
        let events = set_count(&service, &alice, &count, 1).await;
        cache.on_event(&EventBundle::new(&events, false, None));

        let returned = cache.store(&id, loaded, generation).unwrap();
        assert_eq!(values(&returned), vec![QValue::Long(0)]);
        assert_eq!(cache.cached_status(&id), Some(ItemStatus::Stale));
        assert!(!cache.is_cached(&id));

        let current = cache.item_state(&id).await.unwrap();
        assert_eq!(values(&current), vec![QValue::Long(1)]);
        assert_eq!(cache.cached_status(&id), Some(ItemStatus::Existing));
    }

    #[tokio::test]
    async fn test_load_without_events_is_cached() {
        let service = Arc::new(InMemoryRepositoryService::new());
        let alice = SessionInfo::new("alice", "default");
        let count = setup(&service, &alice).await;
        let id = ItemId::Property(count.clone());
        let cache = WorkspaceItemStateCache::new(service.clone(), Arc::new(alice), 100);

        let generation = cache.lock().generation;
        let loaded = cache.load(&id).await;
        cache.store(&id, loaded, generation).unwrap();
        assert!(cache.is_cached(&id));

        // an event bundle applied after the load finished does not reach back
        cache.on_event(&EventBundle::new(&[], false, None));
        let state = cache.item_state(&id).await.unwrap();
        assert_eq!(values(&state), vec![QValue::Long(0)]);
        assert_eq!(cache.cached_status(&id), Some(ItemStatus::Existing));
    }
}
