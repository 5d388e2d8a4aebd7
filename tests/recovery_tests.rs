//! Coordinator failover, crashes during rebalance and partition merges

mod common;

use common::{eventually, TestCluster, TestHandler};

use cache_topology::{ClusterEventKind, ClusterManagerStatus, NodeId};

async fn three_node_cache(cluster: &TestCluster) -> u32 {
    for name in ["a", "b", "c"] {
        cluster.join(name, "users", TestHandler::new()).await.unwrap();
    }
    cluster.settled("users", &["a", "b", "c"]).await.topology_id
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_new_coordinator_recovers_after_crash() {
    let cluster = TestCluster::start(&["a", "b", "c"]).await;
    let before = three_node_cache(&cluster).await;

    cluster.crash("a");
    cluster.install_view(&["b", "c"]).await;

    let recovered = cluster.settled("users", &["b", "c"]).await;
    assert!(recovered.topology_id > before);
    let coordinator = cluster.node("b");
    assert_eq!(coordinator.coordinator().status(), ClusterManagerStatus::Coordinator);
    assert_eq!(coordinator.coordinator().cache_names().await, vec!["users".to_string()]);
    assert_eq!(
        cluster.node("c").coordinator().status(),
        ClusterManagerStatus::RegularMember
    );
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_crash_during_rebalance_completes_without_member() {
    let cluster = TestCluster::start(&["a", "b", "c"]).await;
    cluster.join("a", "users", TestHandler::new()).await.unwrap();
    cluster.join("b", "users", TestHandler::new()).await.unwrap();
    cluster.settled("users", &["a", "b"]).await;

    let stalled = TestHandler::stalled();
    cluster.join("c", "users", stalled.clone()).await.unwrap();
    let coordinator = cluster.node("a");
    eventually("only c unconfirmed", || async {
        coordinator.coordinator().pending_confirmations("users").await == vec![NodeId::from("c")]
    })
    .await;
    eventually("c started its transfer", || async { stalled.held_confirmations() == 1 }).await;

    cluster.crash("c");
    cluster.install_view(&["a", "b"]).await;
    cluster.settled("users", &["a", "b"]).await;
    assert!(coordinator.coordinator().pending_confirmations("users").await.is_empty());
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_partitions_merge_into_one_topology() {
    let cluster = TestCluster::start(&["a", "b", "c"]).await;
    three_node_cache(&cluster).await;

    cluster.partition(&[&["a"], &["b", "c"]]);
    cluster.install_view(&["a"]).await;
    cluster.install_view(&["b", "c"]).await;
    let alone = cluster.settled("users", &["a"]).await;
    let majority = cluster.settled("users", &["b", "c"]).await;

    cluster.heal();
    cluster.install_merge_view(&["a", "b", "c"]).await;
    let merged = cluster.settled("users", &["a", "b", "c"]).await;

    assert!(merged.topology_id > alone.topology_id.max(majority.topology_id));
    let events = cluster.node("a").events().clone();
    assert!(events.count(ClusterEventKind::ConflictResolutionStarted) >= 1);
    eventually("conflict resolution finished", || async {
        events.count(ClusterEventKind::ConflictResolutionFinished) >= 1
    })
    .await;
    assert_eq!(
        cluster.node("b").coordinator().status(),
        ClusterManagerStatus::RegularMember
    );
}
