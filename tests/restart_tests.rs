//! Graceful cluster shutdown and restart from persisted ownership

mod common;

use common::{eventually, TestCluster, TestHandler};
use std::sync::Arc;

use cache_topology::member::persistent_state_of;
use cache_topology::{
    CacheMode, InMemoryStateStore, PersistentStateStore, ScopedPersistentState, TopologyError,
};

/// Run `users` on a and b, shut it down and return what both persisted
async fn persisted_state() -> ScopedPersistentState {
    let cluster = TestCluster::start(&["a", "b"]).await;
    let handlers = [TestHandler::new(), TestHandler::new()];
    cluster.join("a", "users", handlers[0].clone()).await.unwrap();
    cluster.join("b", "users", handlers[1].clone()).await.unwrap();
    cluster.settled("users", &["a", "b"]).await;

    cluster.node("b").member().shutdown_cache("users").await.unwrap();
    eventually("both members persisted", || async {
        handlers.iter().all(|handler| handler.persisted().is_some())
    })
    .await;

    let first = handlers[0].persisted().unwrap();
    assert_eq!(handlers[1].persisted(), Some(first.clone()));
    assert!(cluster.node("a").coordinator().cache_names().await.is_empty());
    assert!(cluster.node("b").member().cache_topology("users").await.is_none());
    first
}

async fn join_with_checksum(
    cluster: &TestCluster,
    name: &str,
    checksum: &str,
) -> cache_topology::Result<cache_topology::topology::CacheStatusResponse> {
    let node = cluster.node(name);
    let mut join_info = node.join_info(CacheMode::Distributed, 16, 2);
    join_info.persistent_state_checksum = Some(checksum.to_string());
    node.join("users", join_info, TestHandler::new()).await
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_restart_restores_persisted_ownership() {
    let state = persisted_state().await;
    let store = Arc::new(InMemoryStateStore::new());
    store.store(state.clone());

    let cluster = TestCluster::new(&["a", "b"], Some(store.clone()));
    cluster.install_view(&["a", "b"]).await;

    let first = join_with_checksum(&cluster, "a", &state.checksum).await.unwrap();
    assert!(first.current_topology.is_none());
    let err = cluster.node("a").member().force_rebalance("users").await.unwrap_err();
    assert!(matches!(err, TopologyError::MissingMembers { .. }));

    let second = join_with_checksum(&cluster, "b", &state.checksum).await.unwrap();
    let restored = second.current_topology.unwrap();
    assert!(restored.topology_id > state.topology_id);
    let ownership = persistent_state_of("users", &restored).unwrap();
    assert_eq!(ownership.consistent_hash, state.consistent_hash);
    assert!(store.load("users").is_none());

    cluster.settled("users", &["a", "b"]).await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_restart_rejects_mismatched_state() {
    let state = persisted_state().await;
    let store = Arc::new(InMemoryStateStore::new());
    store.store(state.clone());

    let cluster = TestCluster::new(&["a", "b"], Some(store));
    cluster.install_view(&["a", "b"]).await;

    let err = join_with_checksum(&cluster, "b", "00ff").await.unwrap_err();
    assert!(matches!(err, TopologyError::JoinRejected { .. }));
    let err = cluster.join("b", "users", TestHandler::new()).await.unwrap_err();
    assert!(matches!(err, TopologyError::JoinRejected { .. }));

    join_with_checksum(&cluster, "b", &state.checksum).await.unwrap();
}
