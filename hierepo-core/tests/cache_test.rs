//! Item state cache behavior seen through the workspace manager

use hierepo_core::memory::ROOT_UUID;
use hierepo_core::{
    ChangeLog, InMemoryRepositoryService, ItemId, ItemStatus, Name, NodeId, Operation, Path,
    QValue, RepositoryError, SessionInfo, WorkspaceConfig, WorkspaceManager,
};
use std::sync::Arc;

type Manager = WorkspaceManager<InMemoryRepositoryService>;

fn name(s: &str) -> Name {
    Name::new(s).unwrap()
}

fn root() -> ItemId {
    NodeId::from_unique_id(ROOT_UUID).into()
}

fn node(uuid: &str) -> NodeId {
    NodeId::from_unique_id(uuid)
}

fn property(manager: &Manager, uuid: &str, property: &str) -> ItemId {
    manager
        .id_factory()
        .create_property_id(&node(uuid), name(property))
        .into()
}

async fn setup(capacity: usize) -> (Arc<InMemoryRepositoryService>, Manager) {
    let service = Arc::new(InMemoryRepositoryService::new());
    let config = WorkspaceConfig {
        cache_capacity: capacity,
        ..WorkspaceConfig::default()
    };
    let session = Arc::new(SessionInfo::new("alice", "default"));
    let manager = WorkspaceManager::new(service.clone(), session, config)
        .await
        .unwrap();

    let mut log = ChangeLog::new(node(ROOT_UUID));
    for child in ["a", "b"] {
        log.push(Operation::AddNode {
            parent: node(ROOT_UUID),
            name: name(child),
            node_type: name("nt:unstructured"),
            uuid: Some(child.to_string()),
        });
        log.push(Operation::add_property(node(child), name("title"), QValue::String(child.into())));
    }
    log.push(Operation::add_node(node("a"), name("x"), name("nt:unstructured")));
    manager.execute_change_log(&log).await.unwrap();
    (service, manager)
}

async fn run(manager: &Manager, operations: Vec<Operation>) {
    let log = ChangeLog::with_operations(node(ROOT_UUID), operations);
    manager.execute_change_log(&log).await.unwrap();
}

#[tokio::test]
async fn test_reads_are_served_from_cache() {
    let (service, manager) = setup(100).await;
    manager.item_state(&node("a").into()).await.unwrap();
    service.clear_journal();

    let state = manager.item_state(&node("a").into()).await.unwrap();
    assert_eq!(state.status(), ItemStatus::Existing);
    assert!(state.is_backed());
    assert!(service.journal().is_empty());

    // a path lookup is remembered under the canonical id
    let path_id: ItemId = NodeId::from_path(Path::parse("/a").unwrap()).unwrap().into();
    manager.item_state(&path_id).await.unwrap();
    manager.item_state(&path_id).await.unwrap();
    assert_eq!(service.journal(), vec!["node_info"]);
}

#[tokio::test]
async fn test_least_recently_used_state_is_evicted() {
    let (_service, manager) = setup(2).await;
    manager.root_state().await.unwrap();
    manager.item_state(&node("a").into()).await.unwrap();
    manager.item_state(&node("b").into()).await.unwrap();

    assert_eq!(manager.cache().len(), 2);
    assert!(!manager.cache().is_cached(&root()));
    assert!(manager.cache().is_cached(&node("a").into()));
    assert!(manager.cache().is_cached(&node("b").into()));

    // evicted states are simply loaded again
    let root_state = manager.root_state().await.unwrap();
    assert_eq!(root_state.as_node().unwrap().children.len(), 2);
    assert!(!manager.cache().is_cached(&node("a").into()));
}

#[tokio::test]
async fn test_added_items_mark_the_parent_stale() {
    let (_service, manager) = setup(100).await;
    manager.root_state().await.unwrap();
    manager.item_state(&node("b").into()).await.unwrap();

    run(&manager, vec![Operation::add_node(node(ROOT_UUID), name("c"), name("nt:unstructured"))]).await;
    assert_eq!(manager.cache().cached_status(&root()), Some(ItemStatus::Stale));
    assert_eq!(manager.cache().cached_status(&node("b").into()), Some(ItemStatus::Existing));

    run(&manager, vec![Operation::add_property(node("b"), name("extra"), QValue::Long(1))]).await;
    assert_eq!(manager.cache().cached_status(&node("b").into()), Some(ItemStatus::Stale));

    let reloaded = manager.root_state().await.unwrap();
    assert_eq!(reloaded.as_node().unwrap().children.len(), 3);
    assert_eq!(manager.cache().cached_status(&root()), Some(ItemStatus::Existing));
}

#[tokio::test]
async fn test_removal_evicts_the_subtree() {
    let (_service, manager) = setup(100).await;
    manager.root_state().await.unwrap();
    let a = manager.item_state(&node("a").into()).await.unwrap();
    let child = a.as_node().unwrap().children[0].id.clone();
    manager.item_state(&child.clone().into()).await.unwrap();
    manager.item_state(&property(&manager, "a", "title")).await.unwrap();

    run(&manager, vec![Operation::remove(node("a"))]).await;

    assert_eq!(manager.cache().cached_status(&node("a").into()), None);
    assert_eq!(manager.cache().cached_status(&child.clone().into()), None);
    assert_eq!(manager.cache().cached_status(&property(&manager, "a", "title")), None);
    assert_eq!(manager.cache().cached_status(&root()), Some(ItemStatus::Stale));

    assert!(matches!(
        manager.item_state(&child.into()).await,
        Err(RepositoryError::ItemNotFound(_))
    ));
    assert!(!manager.has_item_state(&node("a").into()).await);
}

#[tokio::test]
async fn test_value_change_marks_only_the_property() {
    let (_service, manager) = setup(100).await;
    manager.item_state(&node("a").into()).await.unwrap();
    let title = property(&manager, "a", "title");
    manager.item_state(&title).await.unwrap();

    let ItemId::Property(title_id) = title.clone() else {
        unreachable!()
    };
    run(&manager, vec![Operation::set_property_value(title_id, QValue::String("new".into()))]).await;
    assert_eq!(manager.cache().cached_status(&title), Some(ItemStatus::Stale));
    assert_eq!(manager.cache().cached_status(&node("a").into()), Some(ItemStatus::Existing));

    let state = manager.item_state(&title).await.unwrap();
    assert_eq!(state.as_property().unwrap().values, vec![QValue::String("new".into())]);
}

#[tokio::test]
async fn test_type_changes_mark_the_node_stale() {
    let (_service, manager) = setup(100).await;
    let set_mixins = |mixins: &[&str]| {
        vec![Operation::SetMixin {
            node: node("a"),
            mixins: mixins.iter().map(|m| name(m)).collect(),
        }]
    };
    run(&manager, set_mixins(&["mix:lockable", "mix:referenceable"])).await;
    let a = manager.item_state(&node("a").into()).await.unwrap();
    assert!(a.as_node().unwrap().property_names.contains(&name("jcr:uuid")));

    // only jcr:mixinTypes changes, yet the node mirrors its mixins
    run(&manager, set_mixins(&["mix:referenceable", "mix:lockable"])).await;
    assert_eq!(manager.cache().cached_status(&node("a").into()), Some(ItemStatus::Stale));

    let a = manager.item_state(&node("a").into()).await.unwrap();
    assert_eq!(
        a.as_node().unwrap().mixins,
        vec![name("mix:referenceable"), name("mix:lockable")]
    );
}

#[tokio::test]
async fn test_missing_items_are_not_cached() {
    let (service, manager) = setup(100).await;
    let before = manager.cache().len();
    assert!(matches!(
        manager.item_state(&node("missing").into()).await,
        Err(RepositoryError::ItemNotFound(_))
    ));
    assert!(!manager.has_item_state(&property(&manager, "a", "missing")).await);
    assert_eq!(manager.cache().len(), before);

    service.clear_journal();
    assert!(!manager.has_item_state(&node("missing").into()).await);
    assert_eq!(service.journal(), vec!["node_info"]);
}
