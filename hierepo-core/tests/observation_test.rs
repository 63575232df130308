//! Delivery of local and external changes, and session disposal

use hierepo_core::memory::ROOT_UUID;
use hierepo_core::{
    ChangeLog, EventBundle, InMemoryRepositoryService, InternalEventListener, ItemId, ItemStatus,
    Name, NodeId, Operation, Path, QValue, RepositoryError, SessionInfo, WorkspaceConfig,
    WorkspaceManager,
};
use std::sync::{Arc, Mutex};

type Manager = WorkspaceManager<InMemoryRepositoryService>;

#[derive(Debug, Clone)]
struct Delivery {
    paths: Vec<String>,
    users: Vec<Option<String>>,
    is_local: bool,
    from_change_log: bool,
}

#[derive(Default)]
struct Recorder {
    deliveries: Mutex<Vec<Delivery>>,
}

impl Recorder {
    fn deliveries(&self) -> Vec<Delivery> {
        self.deliveries.lock().unwrap().clone()
    }

    fn local(&self) -> Vec<Delivery> {
        self.deliveries().into_iter().filter(|d| d.is_local).collect()
    }

    fn external(&self) -> Vec<Delivery> {
        self.deliveries().into_iter().filter(|d| !d.is_local).collect()
    }
}

impl InternalEventListener for Recorder {
    fn on_event(&self, bundle: &EventBundle<'_>) {
        let events = bundle.events();
        self.deliveries.lock().unwrap().push(Delivery {
            paths: events
                .iter()
                .map(|e| e.path.as_ref().map(|p| p.to_string()).unwrap_or_default())
                .collect(),
            users: events.iter().map(|e| e.user_id.clone()).collect(),
            is_local: bundle.is_local(),
            from_change_log: bundle.change_log().is_some(),
        });
    }
}

fn name(s: &str) -> Name {
    Name::new(s).unwrap()
}

fn root() -> NodeId {
    NodeId::from_unique_id(ROOT_UUID)
}

fn at(path: &str) -> NodeId {
    NodeId::from_path(Path::parse(path).unwrap()).unwrap()
}

fn add_child(node_name: &str) -> ChangeLog {
    ChangeLog::with_operations(
        root(),
        vec![Operation::add_node(root(), name(node_name), name("nt:unstructured"))],
    )
}

async fn open(
    service: &Arc<InMemoryRepositoryService>,
    user: &str,
    config: WorkspaceConfig,
) -> (Manager, Arc<Recorder>) {
    let session = Arc::new(SessionInfo::new(user, "default"));
    let workspace = WorkspaceManager::new(service.clone(), session, config)
        .await
        .unwrap();
    let recorder = Arc::new(Recorder::default());
    workspace.add_event_listener(recorder.clone());
    (workspace, recorder)
}

#[tokio::test]
async fn test_changes_reach_other_sessions_as_external() {
    let service = Arc::new(InMemoryRepositoryService::new());
    let (alice, alice_events) = open(&service, "alice", WorkspaceConfig::default()).await;
    let (bob, bob_events) = open(&service, "bob", WorkspaceConfig::default()).await;
    assert!(alice.observes_external_changes());
    assert_eq!(service.listener_count(), 2);

    alice.execute_change_log(&add_child("a")).await.unwrap();
    service.flush_notifications().await;

    let local = alice_events.deliveries();
    assert_eq!(local.len(), 1, "own changes arrive once, on the local path");
    assert!(local[0].is_local);
    assert!(local[0].from_change_log);

    let external = bob_events.deliveries();
    assert_eq!(external.len(), 1);
    assert!(!external[0].is_local);
    assert!(!external[0].from_change_log);
    assert_eq!(external[0].paths, local[0].paths);
    assert_eq!(external[0].paths, vec!["/a"]);
    assert_eq!(external[0].users, vec![Some("alice".to_string())]);

    bob.execute_change_log(&add_child("b")).await.unwrap();
    service.flush_notifications().await;
    assert_eq!(alice_events.external().len(), 1);
    assert_eq!(alice_events.external()[0].paths, vec!["/b"]);
    assert_eq!(bob_events.local().len(), 1);
}

#[tokio::test]
async fn test_external_changes_invalidate_the_cache() {
    let service = Arc::new(InMemoryRepositoryService::new());
    let (alice, _) = open(&service, "alice", WorkspaceConfig::default()).await;
    let (bob, _) = open(&service, "bob", WorkspaceConfig::default()).await;

    let root_item = ItemId::Node(root());
    assert!(bob.root_state().await.unwrap().as_node().unwrap().children.is_empty());
    assert!(bob.cache().is_cached(&root_item));

    alice.execute_change_log(&add_child("a")).await.unwrap();
    service.flush_notifications().await;

    assert_eq!(bob.cache().cached_status(&root_item), Some(ItemStatus::Stale));
    let root_state = bob.root_state().await.unwrap();
    assert_eq!(root_state.as_node().unwrap().children.len(), 1);
    assert_eq!(bob.cache().cached_status(&root_item), Some(ItemStatus::Existing));
}

#[tokio::test]
async fn test_local_events_from_backend_when_not_excluded() {
    let service = Arc::new(InMemoryRepositoryService::new());
    let config = WorkspaceConfig {
        exclude_local_events: false,
        ..WorkspaceConfig::default()
    };
    let (alice, events) = open(&service, "alice", config).await;

    alice.execute_change_log(&add_child("a")).await.unwrap();
    service.flush_notifications().await;

    assert_eq!(events.local().len(), 1);
    assert_eq!(events.external().len(), 1);
}

#[tokio::test]
async fn test_backend_without_observation() {
    let service = Arc::new(InMemoryRepositoryService::new().without_observation());
    let (alice, _) = open(&service, "alice", WorkspaceConfig::default()).await;
    let (bob, bob_events) = open(&service, "bob", WorkspaceConfig::default()).await;
    assert!(!bob.observes_external_changes());
    assert_eq!(service.listener_count(), 0);

    alice.execute_change_log(&add_child("a")).await.unwrap();
    service.flush_notifications().await;
    assert!(bob_events.deliveries().is_empty());

    bob.execute_change_log(&add_child("b")).await.unwrap();
    assert_eq!(bob_events.local().len(), 1);

    alice.dispose().await;
    bob.dispose().await;
}

#[tokio::test]
async fn test_external_observation_disabled_by_config() {
    let service = Arc::new(InMemoryRepositoryService::new());
    let config = WorkspaceConfig {
        observe_external_changes: false,
        ..WorkspaceConfig::default()
    };
    let (workspace, _) = open(&service, "alice", config).await;
    assert!(!workspace.observes_external_changes());
    assert_eq!(service.listener_count(), 0);
}

#[tokio::test]
async fn test_workspace_operation_events_are_local_without_change_log() {
    let service = Arc::new(InMemoryRepositoryService::new());
    let (alice, alice_events) = open(&service, "alice", WorkspaceConfig::default()).await;
    let (_bob, bob_events) = open(&service, "bob", WorkspaceConfig::default()).await;

    let log = ChangeLog::with_operations(
        root(),
        vec![
            Operation::add_node(root(), name("a"), name("nt:unstructured")),
            Operation::SetMixin {
                node: at("/a"),
                mixins: vec![name("mix:lockable")],
            },
        ],
    );
    alice.execute_change_log(&log).await.unwrap();
    alice
        .execute(&Operation::Lock { node: at("/a"), deep: false })
        .await
        .unwrap();
    service.flush_notifications().await;

    let lock_delivery = alice_events.local().pop().unwrap();
    assert!(!lock_delivery.from_change_log);
    assert_eq!(lock_delivery.paths, vec!["/a/jcr:lockOwner", "/a/jcr:lockIsDeep"]);

    let external = bob_events.external();
    assert_eq!(external.len(), 2);
    assert_eq!(external[1].paths, lock_delivery.paths);
}

#[tokio::test]
async fn test_removed_listener_gets_nothing() {
    let service = Arc::new(InMemoryRepositoryService::new());
    let (alice, events) = open(&service, "alice", WorkspaceConfig::default()).await;

    let listener: Arc<dyn InternalEventListener> = events.clone();
    alice.remove_event_listener(&listener);
    alice.execute_change_log(&add_child("a")).await.unwrap();
    assert!(events.deliveries().is_empty());
}

#[tokio::test]
async fn test_dispose_is_idempotent() {
    let service = Arc::new(InMemoryRepositoryService::new());
    let (alice, _) = open(&service, "alice", WorkspaceConfig::default()).await;
    let (_bob, bob_events) = open(&service, "bob", WorkspaceConfig::default()).await;
    assert_eq!(service.listener_count(), 2);
    service.clear_journal();

    alice.dispose().await;
    assert!(alice.is_disposed());
    assert_eq!(service.listener_count(), 1);
    assert_eq!(service.journal(), vec!["remove_event_listener", "dispose"]);

    alice.dispose().await;
    assert_eq!(service.journal(), vec!["remove_event_listener", "dispose"]);

    let err = alice.execute_change_log(&add_child("a")).await.unwrap_err();
    assert!(matches!(err, RepositoryError::InvalidItemState(_)));
    let err = alice
        .execute(&Operation::Checkin { node: root() })
        .await
        .unwrap_err();
    assert!(matches!(err, RepositoryError::InvalidItemState(_)));
    assert!(bob_events.deliveries().is_empty());
}

#[tokio::test]
async fn test_dispose_releases_session_locks() {
    let service = Arc::new(InMemoryRepositoryService::new());
    let (alice, _) = open(&service, "alice", WorkspaceConfig::default()).await;
    let (bob, bob_events) = open(&service, "bob", WorkspaceConfig::default()).await;

    let log = ChangeLog::with_operations(
        root(),
        vec![
            Operation::add_node(root(), name("doc"), name("nt:unstructured")),
            Operation::SetMixin {
                node: at("/doc"),
                mixins: vec![name("mix:lockable")],
            },
        ],
    );
    alice.execute_change_log(&log).await.unwrap();
    alice
        .execute(&Operation::Lock { node: at("/doc"), deep: true })
        .await
        .unwrap();
    assert_eq!(alice.lock_tokens().len(), 1);
    assert!(matches!(
        bob.execute(&Operation::Lock { node: at("/doc"), deep: false }).await,
        Err(RepositoryError::Lock(_))
    ));

    alice.dispose().await;
    service.flush_notifications().await;
    assert!(alice.lock_tokens().is_empty());
    let removed: Vec<Delivery> = bob_events
        .external()
        .into_iter()
        .filter(|d| d.paths.iter().any(|p| p == "/doc/jcr:lockOwner"))
        .collect();
    // once when locked, once when released
    assert_eq!(removed.len(), 2);

    assert!(bob.lock_info(&at("/doc")).await.unwrap().is_none());
    bob.execute(&Operation::Lock { node: at("/doc"), deep: false })
        .await
        .unwrap();
}

#[tokio::test]
async fn test_external_changes_keep_commit_order() {
    let service = Arc::new(InMemoryRepositoryService::new());
    let (alice, _) = open(&service, "alice", WorkspaceConfig::default()).await;
    let (_bob, bob_events) = open(&service, "bob", WorkspaceConfig::default()).await;

    let log = ChangeLog::with_operations(
        root(),
        vec![
            Operation::add_node(root(), name("a"), name("nt:unstructured")),
            Operation::add_property(at("/a"), name("title"), QValue::Long(1)),
            Operation::remove(at("/a")),
        ],
    );
    alice.execute_change_log(&log).await.unwrap();
    service.flush_notifications().await;

    let external = bob_events.external();
    assert_eq!(external.len(), 1);
    assert_eq!(
        external[0].paths,
        vec!["/a", "/a/title", "/a/title", "/a"],
        "added node, added property, removed property, removed node"
    );
}
