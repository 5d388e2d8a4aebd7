//! Joining, leaving and rebalancing across an in-memory cluster

mod common;

use common::{eventually, TestCluster, TestHandler};

use cache_topology::{CacheMode, NodeId, Phase, TopologyError};

fn strictly_increasing(ids: &[u32]) -> bool {
    ids.windows(2).all(|pair| pair[0] < pair[1])
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_members_join_and_rebalance() {
    let cluster = TestCluster::start(&["a", "b", "c"]).await;
    let handlers = [TestHandler::new(), TestHandler::new(), TestHandler::new()];

    let response = cluster.join("a", "users", handlers[0].clone()).await.unwrap();
    let initial = response.current_topology.unwrap();
    assert_eq!(initial.current_ch.members(), &[NodeId::from("a")]);
    assert_eq!(initial.phase, Phase::NoRebalance);

    cluster.join("b", "users", handlers[1].clone()).await.unwrap();
    cluster.settled("users", &["a", "b"]).await;
    cluster.join("c", "users", handlers[2].clone()).await.unwrap();
    let topology = cluster.settled("users", &["a", "b", "c"]).await;

    for handler in &handlers {
        assert!(strictly_increasing(&handler.topology_ids()));
    }
    let phases = handlers[0].phases();
    let four_phases = [
        Phase::ReadOldWriteAll,
        Phase::ReadAllWriteAll,
        Phase::ReadNewWriteAll,
        Phase::NoRebalance,
    ];
    assert!(phases.windows(4).any(|window| window == four_phases));

    let coordinator = cluster.node("a");
    assert!(coordinator.coordinator().is_coordinator());
    assert!(coordinator.coordinator().pending_confirmations("users").await.is_empty());
    eventually("stable topology", || async {
        cluster
            .node("c")
            .member()
            .stable_topology("users")
            .await
            .map_or(false, |stable| stable.topology_id == topology.topology_id)
    })
    .await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_scattered_cache_rebalances_in_two_phases() {
    let cluster = TestCluster::start(&["a", "b", "c"]).await;
    let handlers = [TestHandler::new(), TestHandler::new(), TestHandler::new()];

    let members = ["a", "b", "c"];
    for (joined, handler) in handlers.iter().enumerate() {
        cluster
            .join_with_mode(members[joined], "sessions", CacheMode::Scattered, handler.clone())
            .await
            .unwrap();
        cluster.settled("sessions", &members[..=joined]).await;
    }
    let topology = cluster.settled("sessions", &members).await;

    for handler in &handlers {
        let phases = handler.phases();
        assert!(strictly_increasing(&handler.topology_ids()));
        assert!(!phases.contains(&Phase::ReadOldWriteAll));
        assert!(!phases.contains(&Phase::ReadAllWriteAll));
        assert!(!phases.contains(&Phase::ReadNewWriteAll));
    }
    let phases = handlers[0].phases();
    assert!(phases
        .windows(2)
        .any(|window| window == [Phase::Transitory, Phase::NoRebalance]));

    let node_a = cluster.node("a");
    let coordinator = node_a.coordinator();
    assert!(coordinator.pending_confirmations("sessions").await.is_empty());
    eventually("stable topology", || async {
        cluster
            .node("b")
            .member()
            .stable_topology("sessions")
            .await
            .map_or(false, |stable| stable.topology_id == topology.topology_id)
    })
    .await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_rebalance_waits_while_disabled() {
    let cluster = TestCluster::start(&["a", "b", "c"]).await;
    cluster.join("a", "users", TestHandler::new()).await.unwrap();
    cluster.join("b", "users", TestHandler::new()).await.unwrap();
    cluster.settled("users", &["a", "b"]).await;

    let member = cluster.node("b");
    member.member().set_rebalancing_enabled(None, false).await.unwrap();
    assert!(!member.member().is_rebalancing_enabled(None).await.unwrap());
    eventually("policy broadcast", || async {
        !cluster.node("c").member().is_cluster_rebalancing_enabled()
    })
    .await;

    cluster.join("c", "users", TestHandler::new()).await.unwrap();
    let status = cluster.node("a").coordinator().cache_status("users").await.unwrap();
    let current = status.current_topology.unwrap();
    assert!(!current.is_rebalance_in_progress());
    assert!(!current.current_ch.contains_member(&NodeId::from("c")));

    member.member().set_rebalancing_enabled(None, true).await.unwrap();
    cluster.settled("users", &["a", "b", "c"]).await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_leave_rebalances_remaining_members() {
    let cluster = TestCluster::start(&["a", "b", "c"]).await;
    for name in ["a", "b", "c"] {
        cluster.join(name, "users", TestHandler::new()).await.unwrap();
    }
    let before = cluster.settled("users", &["a", "b", "c"]).await;

    cluster.node("c").leave("users").await.unwrap();
    let after = cluster.settled("users", &["a", "b"]).await;
    assert!(after.topology_id > before.topology_id);
    assert!(cluster.node("c").member().cache_topology("users").await.is_none());
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_join_is_rejected_twice_locally() {
    let cluster = TestCluster::start(&["a", "b"]).await;
    cluster.join("b", "users", TestHandler::new()).await.unwrap();

    let err = cluster.join("b", "users", TestHandler::new()).await.unwrap_err();
    assert!(matches!(err, TopologyError::IllegalLifecycleState(_)));
}
