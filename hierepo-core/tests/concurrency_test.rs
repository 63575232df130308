//! Foreground execution racing external changes on a multi-threaded runtime

use futures::future::join_all;
use hierepo_core::memory::ROOT_UUID;
use hierepo_core::{
    ChangeLog, InMemoryRepositoryService, ItemId, ItemStatus, Name, NodeId, Operation, QValue,
    SessionInfo, WorkspaceConfig, WorkspaceManager,
};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

type Manager = WorkspaceManager<InMemoryRepositoryService>;

const WRITES: i64 = 25;

fn name(s: &str) -> Name {
    Name::new(s).unwrap()
}

fn node(uuid: &str) -> NodeId {
    NodeId::from_unique_id(uuid)
}

fn count(manager: &Manager, uuid: &str) -> ItemId {
    manager
        .id_factory()
        .create_property_id(&node(uuid), name("count"))
        .into()
}

async fn open(service: &Arc<InMemoryRepositoryService>, user: &str) -> Arc<Manager> {
    let session = Arc::new(SessionInfo::new(user, "default"));
    Arc::new(
        WorkspaceManager::new(service.clone(), session, WorkspaceConfig::default())
            .await
            .unwrap(),
    )
}

/// Two sessions sharing a workspace with nodes `a` and `b`, each carrying a
/// `count` of 0 that both sessions have already read
async fn setup() -> (Arc<InMemoryRepositoryService>, Arc<Manager>, Arc<Manager>) {
    let service = Arc::new(InMemoryRepositoryService::new());
    let alice = open(&service, "alice").await;
    let bob = open(&service, "bob").await;

    let mut log = ChangeLog::new(node(ROOT_UUID));
    for child in ["a", "b"] {
        log.push(Operation::AddNode {
            parent: node(ROOT_UUID),
            name: name(child),
            node_type: name("nt:unstructured"),
            uuid: Some(child.to_string()),
        });
        log.push(Operation::add_property(node(child), name("count"), QValue::Long(0)));
    }
    alice.execute_change_log(&log).await.unwrap();
    service.flush_notifications().await;

    for manager in [&alice, &bob] {
        for uuid in ["a", "b"] {
            let state = manager.item_state(&count(manager, uuid)).await.unwrap();
            assert_eq!(state.as_property().unwrap().values, vec![QValue::Long(0)]);
        }
    }
    (service, alice, bob)
}

async fn write_counts(manager: Arc<Manager>, uuid: &'static str) {
    let property = manager
        .id_factory()
        .create_property_id(&node(uuid), name("count"));
    for value in 1..=WRITES {
        let log = ChangeLog::with_operations(
            node(uuid),
            vec![Operation::set_property_value(property.clone(), QValue::Long(value))],
        );
        manager.execute_change_log(&log).await.unwrap();
    }
}

async fn assert_count(manager: &Manager, uuid: &str, expected: i64) {
    let id = count(manager, uuid);
    let state = manager.item_state(&id).await.unwrap();
    assert_eq!(
        state.as_property().unwrap().values,
        vec![QValue::Long(expected)],
        "{} sees a stale count on {}",
        manager.session().user_id(),
        uuid
    );
    assert_eq!(manager.cache().cached_status(&id), Some(ItemStatus::Existing));
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_foreground_and_external_changes_both_visible() {
    let (service, alice, bob) = setup().await;

    // alice's writes are foreground for her and external for bob, and the
    // other way round for bob's
    let writers = vec![
        tokio::spawn(write_counts(alice.clone(), "a")),
        tokio::spawn(write_counts(bob.clone(), "b")),
    ];
    for joined in join_all(writers).await {
        joined.unwrap();
    }
    service.flush_notifications().await;

    for manager in [&alice, &bob] {
        assert_count(manager, "a", WRITES).await;
        assert_count(manager, "b", WRITES).await;
    }
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_reads_racing_external_changes_settle_on_latest_value() {
    let (service, alice, bob) = setup().await;
    let done = Arc::new(AtomicBool::new(false));

    let writer = tokio::spawn(write_counts(bob.clone(), "a"));
    let reader = {
        let alice = alice.clone();
        let done = done.clone();
        tokio::spawn(async move {
            let id = count(&alice, "a");
            while !done.load(Ordering::SeqCst) {
                alice.item_state(&id).await.unwrap();
                tokio::task::yield_now().await;
            }
        })
    };

    writer.await.unwrap();
    service.flush_notifications().await;
    done.store(true, Ordering::SeqCst);
    reader.await.unwrap();

    // a load that overlapped an invalidation must not stay cached as current
    assert_count(&alice, "a", WRITES).await;
    assert_count(&alice, "b", 0).await;
}
