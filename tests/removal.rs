//! Node drain lifecycle tests for the placement driver

use minikv_pd::common::PlacementConfig;
use minikv_pd::coordinator::{MemoryProbe, MemoryRegister, NodeInfo, PartitionMetaInfo, RemovalState};
use minikv_pd::Coordinator;
use std::sync::Arc;

fn nodes(ids: &[&str]) -> Vec<NodeInfo> {
    ids.iter()
        .map(|id| NodeInfo::new(*id, format!("{}:6000", id)))
        .collect()
}

fn setup(probe: Arc<MemoryProbe>) -> (Arc<MemoryRegister>, Coordinator) {
    let register = Arc::new(MemoryRegister::new());
    register.create_partition(PartitionMetaInfo::new("ns0", 0, 3, &["X", "A", "B"]));
    register.create_partition(PartitionMetaInfo::new("ns0", 1, 2, &["X", "A", "B"]));
    register.create_partition(PartitionMetaInfo::new("ns1", 0, 2, &["A", "B"]));

    let config = PlacementConfig {
        ready_poll_interval_ms: 10,
        ready_wait_timeout_ms: 50,
        ..Default::default()
    };
    let coord = Coordinator::new(
        config,
        NodeInfo::new("pd-1", "pd-1:5000"),
        register.clone(),
        probe,
    );
    coord.membership().apply_live_nodes(nodes(&["X", "A", "B", "Y"]));
    (register, coord)
}

#[tokio::test]
async fn test_drain_moves_data_and_finishes() {
    let (register, coord) = setup(Arc::new(MemoryProbe::new()));
    coord.membership().mark_removing("X").unwrap();
    assert_eq!(coord.removing_nodes()["X"], RemovalState::Marked);
    // draining nodes are not offered for placement
    assert!(!coord.current_nodes(None).contains_key("X"));

    let progress = coord.run_removal_pass().await;
    assert_eq!(progress["X"], Some(RemovalState::Pending));
    assert_eq!(coord.removing_nodes()["X"], RemovalState::Pending);

    // at the factor: replacement added first, then X dropped
    let p0 = register.partition("ns0", 0).unwrap();
    assert_eq!(p0.raft_nodes(), &["A", "B", "Y"]);
    assert_eq!(p0.replica_info.raft_ids["Y"], 4);
    assert_eq!(p0.epoch(), 2);
    // above the factor: dropped directly
    let p1 = register.partition("ns0", 1).unwrap();
    assert_eq!(p1.raft_nodes(), &["A", "B"]);
    assert_eq!(p1.epoch(), 1);
    // untouched
    assert_eq!(register.partition("ns1", 0).unwrap().epoch(), 0);

    let progress = coord.run_removal_pass().await;
    assert_eq!(progress["X"], Some(RemovalState::DataTransferred));
    let progress = coord.run_removal_pass().await;
    assert_eq!(progress["X"], Some(RemovalState::Done));

    // done but still live: nothing changes
    let progress = coord.run_removal_pass().await;
    assert!(progress.is_empty());
    assert_eq!(coord.removing_nodes()["X"], RemovalState::Done);

    coord.membership().apply_live_nodes(nodes(&["A", "B", "Y"]));
    let progress = coord.run_removal_pass().await;
    assert_eq!(progress["X"], None);
    assert!(coord.removing_nodes().is_empty());
}

#[tokio::test]
async fn test_replacement_not_ready_keeps_pending() {
    let probe = Arc::new(MemoryProbe::new());
    probe.set_ready("Y", false);
    let (register, coord) = setup(probe.clone());
    coord.membership().mark_removing("X").unwrap();

    let progress = coord.run_removal_pass().await;
    assert_eq!(progress["X"], Some(RemovalState::Pending));
    // the replacement is placed but X stays until it catches up
    let p0 = register.partition("ns0", 0).unwrap();
    assert_eq!(p0.raft_nodes(), &["X", "A", "B", "Y"]);
    assert!(probe.calls() >= 2);

    // no pass ever moves the state backwards
    let mut last = coord.removing_nodes()["X"];
    for _ in 0..3 {
        coord.run_removal_pass().await;
        let state = coord.removing_nodes()["X"];
        assert!(state >= last);
        last = state;
    }
    assert_eq!(last, RemovalState::Done);
}

#[tokio::test]
async fn test_mark_requires_live_node() {
    let (_register, coord) = setup(Arc::new(MemoryProbe::new()));
    assert!(matches!(
        coord.membership().mark_removing("Z"),
        Err(minikv_pd::Error::NodeNotFound(_))
    ));
    // only the leader accepts operator marks
    assert!(matches!(
        coord.mark_node_removing("X"),
        Err(minikv_pd::Error::NotLeader(_))
    ));
    assert!(coord.run_removal_pass().await.is_empty());
}
