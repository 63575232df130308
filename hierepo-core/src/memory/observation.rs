//! Delivery of committed changes to registered event listeners
//!
//! Listeners are called from a background task, one notice at a time, so
//! every listener sees batches in commit order and never runs inside the
//! write that produced them.

use super::tree::WorkspaceTree;
use crate::event::{Event, EventFilter, EventListener};
use crate::name::Path;
use crate::registry::NodeTypeRegistry;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use tokio::sync::{mpsc, oneshot};
use tracing::{debug, warn};

struct Registration {
    session_id: String,
    workspace: String,
    root: Path,
    listener: Arc<dyn EventListener>,
    filter: EventFilter,
}

impl Registration {
    fn accepts(
        &self,
        event: &Event,
        origin_session: &str,
        tree: &WorkspaceTree,
        node_types: &NodeTypeRegistry,
    ) -> bool {
        if !self.filter.accepts_type(event.event_type) {
            return false;
        }
        if self.filter.no_local && self.session_id == origin_session {
            return false;
        }

        let Some(parent_path) = event.path.as_ref().and_then(Path::parent) else {
            return false;
        };
        let below_root = parent_path == self.root
            || (self.filter.is_deep && parent_path.is_descendant_of(&self.root));
        if !below_root {
            return false;
        }

        let parent_uuid = event.parent_id.as_ref().and_then(|p| p.unique_id());
        if let Some(ids) = &self.filter.unique_ids {
            if !parent_uuid.is_some_and(|p| ids.iter().any(|id| id == p)) {
                return false;
            }
        }
        if let Some(wanted) = &self.filter.node_type_names {
            let Some(parent) = parent_uuid.and_then(|p| tree.nodes.get(p)) else {
                return false;
            };
            let matches = std::iter::once(&parent.primary_type)
                .chain(parent.mixins.iter())
                .any(|t| wanted.iter().any(|w| node_types.is_derived_from(t, w)));
            if !matches {
                return false;
            }
        }
        true
    }
}

enum Notice {
    Deliver {
        listener: Arc<dyn EventListener>,
        events: Vec<Event>,
    },
    Flush(oneshot::Sender<()>),
}

async fn run(mut receiver: mpsc::UnboundedReceiver<Notice>) {
    while let Some(notice) = receiver.recv().await {
        match notice {
            Notice::Deliver { listener, events } => listener.on_event(events),
            Notice::Flush(done) => {
                let _ = done.send(());
            }
        }
    }
    debug!("observation worker stopped");
}

/// Registered listeners of one repository and the worker feeding them
#[derive(Default)]
pub(crate) struct Observation {
    registrations: Mutex<Vec<Registration>>,
    sender: Mutex<Option<mpsc::UnboundedSender<Notice>>>,
}

impl Observation {
    fn registrations(&self) -> MutexGuard<'_, Vec<Registration>> {
        self.registrations.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Sender of the worker, started on first use. `None` outside a runtime.
    fn sender(&self) -> Option<mpsc::UnboundedSender<Notice>> {
        let mut sender = self.sender.lock().unwrap_or_else(PoisonError::into_inner);
        if let Some(existing) = sender.as_ref().filter(|s| !s.is_closed()) {
            return Some(existing.clone());
        }
        let handle = tokio::runtime::Handle::try_current().ok()?;
        let (tx, rx) = mpsc::unbounded_channel();
        handle.spawn(run(rx));
        debug!("observation worker started");
        *sender = Some(tx.clone());
        Some(tx)
    }

    pub fn register(
        &self,
        session_id: &str,
        workspace: &str,
        root: Path,
        listener: Arc<dyn EventListener>,
        filter: EventFilter,
    ) {
        self.registrations().push(Registration {
            session_id: session_id.to_string(),
            workspace: workspace.to_string(),
            root,
            listener,
            filter,
        });
    }

    /// Remove a listener of `session_id`; returns whether it was registered
    pub fn unregister(&self, session_id: &str, listener: &Arc<dyn EventListener>) -> bool {
        let mut registrations = self.registrations();
        let before = registrations.len();
        registrations.retain(|r| !(r.session_id == session_id && Arc::ptr_eq(&r.listener, listener)));
        registrations.len() != before
    }

    /// Drop every listener of a session; returns how many were removed
    pub fn unregister_session(&self, session_id: &str) -> usize {
        let mut registrations = self.registrations();
        let before = registrations.len();
        registrations.retain(|r| r.session_id != session_id);
        before - registrations.len()
    }

    pub fn listener_count(&self) -> usize {
        self.registrations().len()
    }

    /// Queue the events of one commit for every listener whose filter
    /// accepts some of them.
    pub fn publish(
        &self,
        workspace: &str,
        origin_session: &str,
        events: &[Event],
        tree: &WorkspaceTree,
        node_types: &NodeTypeRegistry,
    ) {
        if events.is_empty() {
            return;
        }
        let deliveries: Vec<(Arc<dyn EventListener>, Vec<Event>)> = self
            .registrations()
            .iter()
            .filter(|r| r.workspace == workspace)
            .filter_map(|r| {
                let accepted: Vec<Event> = events
                    .iter()
                    .filter(|e| r.accepts(e, origin_session, tree, node_types))
                    .cloned()
                    .collect();
                (!accepted.is_empty()).then(|| (r.listener.clone(), accepted))
            })
            .collect();
        if deliveries.is_empty() {
            return;
        }

        match self.sender() {
            Some(sender) => {
                for (listener, events) in deliveries {
                    if sender.send(Notice::Deliver { listener, events }).is_err() {
                        warn!("observation worker is gone; dropping events");
                        return;
                    }
                }
            }
            None => {
                for (listener, events) in deliveries {
                    listener.on_event(events);
                }
            }
        }
    }

    /// Wait until everything published so far has been delivered
    pub async fn flush(&self) {
        let Some(sender) = self.sender() else {
            return;
        };
        let (done, wait) = oneshot::channel();
        if sender.send(Notice::Flush(done)).is_ok() {
            let _ = wait.await;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::event::EventType;
    use crate::memory::tree::ROOT_UUID;
    use crate::name::{names, well_known, Name};

    #[derive(Default)]
    struct Recorder {
        seen: Mutex<Vec<Event>>,
    }

    impl EventListener for Recorder {
        fn on_event(&self, events: Vec<Event>) {
            self.seen.lock().unwrap().extend(events);
        }
    }

    fn setup() -> (WorkspaceTree, NodeTypeRegistry, Vec<Event>) {
        let mut tree = WorkspaceTree::new("default");
        let (a, added) = tree
            .add_node(ROOT_UUID, Name::new("a").unwrap(), well_known(names::NT_FOLDER), None)
            .unwrap();
        let (_, nested) = tree
            .add_node(&a, Name::new("b").unwrap(), well_known(names::NT_FOLDER), None)
            .unwrap();
        let node_types = NodeTypeRegistry::new(crate::memory::schema::builtin_node_types());
        (tree, node_types, vec![added, nested])
    }

    #[tokio::test]
    async fn test_filters_by_session_and_depth() {
        let (tree, node_types, events) = setup();
        let observation = Observation::default();
        let all = Arc::new(Recorder::default());
        let shallow = Arc::new(Recorder::default());
        let others_only = Arc::new(Recorder::default());

        observation.register("s1", "default", Path::root(), all.clone(), EventFilter::all());
        let mut filter = EventFilter::all();
        filter.is_deep = false;
        observation.register("s1", "default", Path::root(), shallow.clone(), filter);
        observation.register(
            "s2",
            "default",
            Path::root(),
            others_only.clone(),
            EventFilter::all().excluding_local(),
        );

        observation.publish("default", "s2", &events, &tree, &node_types);
        observation.flush().await;

        assert_eq!(all.seen.lock().unwrap().len(), 2);
        assert_eq!(shallow.seen.lock().unwrap().len(), 1);
        assert!(others_only.seen.lock().unwrap().is_empty());
        assert_eq!(observation.listener_count(), 3);
        assert_eq!(observation.unregister_session("s1"), 2);
    }

    #[tokio::test]
    async fn test_filters_by_type_and_parent() {
        let (tree, node_types, events) = setup();
        let observation = Observation::default();
        let folders = Arc::new(Recorder::default());
        let removals = Arc::new(Recorder::default());

        let mut filter = EventFilter::all();
        filter.node_type_names = Some(vec![well_known(names::NT_HIERARCHY_NODE)]);
        observation.register("s1", "default", Path::root(), folders.clone(), filter);
        let mut filter = EventFilter::all();
        filter.event_types = EventType::NodeRemoved.mask();
        let removals_dyn: Arc<dyn EventListener> = removals.clone();
        observation.register("s1", "default", Path::root(), removals_dyn.clone(), filter);

        observation.publish("default", "s1", &events, &tree, &node_types);
        observation.publish("other", "s1", &events, &tree, &node_types);
        observation.flush().await;

        // only /a/b has a folder as its parent
        assert_eq!(folders.seen.lock().unwrap().len(), 1);
        assert!(removals.seen.lock().unwrap().is_empty());
        assert!(observation.unregister("s1", &removals_dyn));
        assert!(!observation.unregister("s1", &removals_dyn));
    }
}
