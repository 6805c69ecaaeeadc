//! Leadership lifecycle tests for the placement driver

use async_trait::async_trait;
use minikv_pd::common::PlacementConfig;
use minikv_pd::coordinator::{
    MemoryProbe, MemoryRegister, NamespaceMap, NodeInfo, PartitionMetaInfo, PartitionReplicaInfo, Register,
};
use minikv_pd::Coordinator;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio_test::assert_ok;
use tokio_util::sync::CancellationToken;

fn nodes(ids: &[&str]) -> Vec<NodeInfo> {
    ids.iter()
        .map(|id| NodeInfo::new(*id, format!("{}:6000", id)))
        .collect()
}

async fn eventually(mut cond: impl FnMut() -> bool) -> bool {
    for _ in 0..300 {
        if cond() {
            return true;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    false
}

fn coordinator(register: Arc<dyn Register>, id: &str, config: PlacementConfig) -> Coordinator {
    Coordinator::new(
        config,
        NodeInfo::new(id, format!("{}:5000", id)),
        register,
        Arc::new(MemoryProbe::new()),
    )
}

#[tokio::test]
async fn test_leader_tracks_membership_and_checks() {
    let register = Arc::new(MemoryRegister::new());
    register.create_partition(PartitionMetaInfo::new("ns0", 0, 2, &["A", "B"]));
    let coord = coordinator(register.clone(), "pd-1", PlacementConfig::default());
    assert_ok!(coord.start().await);
    assert!(eventually(|| coord.is_leader()).await);

    let before = coord.membership_epoch();
    register.set_data_nodes(nodes(&["A", "B"]));
    assert!(eventually(|| coord.membership_epoch() > before).await);
    assert_eq!(coord.current_nodes(None).len(), 2);
    assert!(eventually(|| coord.metrics().live_nodes.get() == 2).await);

    // the join schedules a check, which finds everything healthy
    assert!(eventually(|| coord.metrics().check_passes.get() >= 1).await);
    assert!(eventually(|| coord.is_cluster_stable()).await);

    coord.stop().await;
}

#[tokio::test]
async fn test_leader_migrates_in_background() {
    let register = Arc::new(MemoryRegister::new());
    register.create_partition(PartitionMetaInfo::new("ns0", 0, 3, &["A", "B", "C"]));
    let config = PlacementConfig {
        check_interval_ms: 30,
        migrate_wait_ms: 100,
        ..Default::default()
    };
    let coord = coordinator(register.clone(), "pd-1", config);
    register.set_data_nodes(nodes(&["A", "B", "C", "D"]));
    assert_ok!(coord.start().await);
    assert!(eventually(|| coord.current_nodes(None).len() == 4).await);

    register.set_data_nodes(nodes(&["A", "C", "D"]));
    let migrated = eventually(|| {
        register
            .partition("ns0", 0)
            .is_some_and(|p| p.replica_info.contains("D"))
    })
    .await;
    assert!(migrated);
    let part = register.partition("ns0", 0).unwrap();
    assert_eq!(part.raft_nodes(), &["A", "C", "D"]);
    assert!(eventually(|| coord.metrics().migrations.get() == 1).await);

    coord.stop().await;
}

#[tokio::test]
async fn test_leadership_flap_restarts_term() {
    let register = Arc::new(MemoryRegister::new());
    let coord = coordinator(register.clone(), "pd-1", PlacementConfig::default());
    assert_ok!(coord.start().await);
    assert!(eventually(|| coord.is_leader()).await);

    register.set_leader(Some(NodeInfo::new("pd-2", "pd-2:5000")));
    assert!(eventually(|| !coord.is_leader()).await);
    assert_eq!(coord.leader().unwrap().id, "pd-2");

    // membership is only followed while leading
    register.set_data_nodes(nodes(&["A"]));
    tokio::time::sleep(Duration::from_millis(50)).await;
    assert_eq!(coord.membership().live_count(), 0);

    register.set_leader(Some(NodeInfo::new("pd-1", "pd-1:5000")));
    assert!(eventually(|| coord.is_leader()).await);
    assert!(eventually(|| coord.membership().live_count() == 1).await);
    assert_eq!(coord.metrics().leader_transitions.get(), 3);

    // leader loss cancels the term
    register.set_leader(None);
    assert!(eventually(|| !coord.is_leader()).await);
    assert!(coord.leader().is_none());

    coord.stop().await;
}

#[tokio::test]
async fn test_stop_unwinds_all_tasks() {
    let register = Arc::new(MemoryRegister::new());
    register.set_data_nodes(nodes(&["A", "B", "C"]));
    let coord = coordinator(register.clone(), "pd-1", PlacementConfig::default());
    assert_ok!(coord.start().await);
    assert!(eventually(|| coord.is_leader()).await);
    coord.trigger_check_namespaces(
        minikv_pd::coordinator::NamespaceNameInfo::all(),
        Duration::from_secs(3600),
    );

    let stopped = tokio::time::timeout(Duration::from_secs(5), coord.stop()).await;
    assert!(stopped.is_ok());
    assert!(!coord.is_leader());
    assert!(register.leader().is_none());
}

#[tokio::test]
async fn test_second_coordinator_follows() {
    let register = Arc::new(MemoryRegister::new());
    let first = coordinator(register.clone(), "pd-1", PlacementConfig::default());
    let second = coordinator(register.clone(), "pd-2", PlacementConfig::default());
    assert_ok!(first.start().await);
    assert!(eventually(|| first.is_leader()).await);
    assert_ok!(second.start().await);

    assert!(eventually(|| second.leader().is_some_and(|l| l.id == "pd-1")).await);
    assert!(!second.is_leader());

    second.stop().await;
    first.stop().await;
}

#[tokio::test]
async fn test_panicking_checker_steps_down() {
    let register = Arc::new(MemoryRegister::new());
    // slot high-water mark behind the assigned slots
    let mut broken = PartitionMetaInfo::new("ns0", 0, 3, &["A", "B", "C"]);
    broken.replica_info.max_raft_id = 0;
    register.create_partition(broken);
    register.set_data_nodes(nodes(&["A", "B", "C", "D"]));
    let config = PlacementConfig {
        check_interval_ms: 20,
        migrate_wait_ms: 0,
        emergency_migrate_wait_ms: 0,
        check_settle_delay_ms: 0,
        ..Default::default()
    };
    let coord = coordinator(register.clone(), "pd-1", config);
    assert_ok!(coord.start().await);
    assert!(eventually(|| coord.is_leader()).await);
    assert!(eventually(|| coord.membership().live_count() == 4).await);

    // losing B makes the checker add D, which trips the slot id check
    register.set_data_nodes(nodes(&["A", "C", "D"]));
    assert!(eventually(|| coord.is_stopped()).await);
    assert!(!coord.is_leader());
    // leadership is released for another coordinator to take
    assert!(eventually(|| register.leader().is_none()).await);
    assert!(register.coordinators().is_empty());
    assert_eq!(register.partition("ns0", 0).unwrap().epoch(), 0);

    let stopped = tokio::time::timeout(Duration::from_secs(5), coord.stopped()).await;
    assert!(stopped.is_ok());
    let stopped = tokio::time::timeout(Duration::from_secs(5), coord.stop()).await;
    assert!(stopped.is_ok());
}

/// Delegates to a [`MemoryRegister`] but panics on every full listing.
struct PanickingListRegister {
    inner: MemoryRegister,
}

#[async_trait]
impl Register for PanickingListRegister {
    async fn init_cluster_id(&self, cluster_id: &str) -> minikv_pd::Result<()> {
        self.inner.init_cluster_id(cluster_id).await
    }

    async fn register(&self, node: &NodeInfo) -> minikv_pd::Result<()> {
        self.inner.register(node).await
    }

    async fn unregister(&self, node: &NodeInfo) -> minikv_pd::Result<()> {
        self.inner.unregister(node).await
    }

    async fn acquire_and_watch_leader(
        &self,
        leader_tx: mpsc::Sender<Option<NodeInfo>>,
        stop: CancellationToken,
    ) {
        self.inner.acquire_and_watch_leader(leader_tx, stop).await
    }

    async fn watch_data_nodes(&self, nodes_tx: mpsc::Sender<Vec<NodeInfo>>, stop: CancellationToken) {
        self.inner.watch_data_nodes(nodes_tx, stop).await
    }

    async fn get_all_namespaces(&self) -> minikv_pd::Result<(NamespaceMap, u64)> {
        panic!("namespace listing blew up");
    }

    async fn get_namespace_partition(&self, name: &str, partition: i32) -> minikv_pd::Result<PartitionMetaInfo> {
        self.inner.get_namespace_partition(name, partition).await
    }

    async fn update_partition_replicas(
        &self,
        name: &str,
        partition: i32,
        info: &PartitionReplicaInfo,
        expected_epoch: u64,
    ) -> minikv_pd::Result<u64> {
        self.inner
            .update_partition_replicas(name, partition, info, expected_epoch)
            .await
    }
}

#[tokio::test]
async fn test_leadership_watch_panic_leaves_no_term() {
    let register = Arc::new(PanickingListRegister {
        inner: MemoryRegister::new(),
    });
    let coord = coordinator(register.clone(), "pd-1", PlacementConfig::default());
    assert_ok!(coord.start().await);

    // the watch saw itself elected, then died loading namespaces
    assert!(eventually(|| coord.leader().is_some_and(|l| l.id == "pd-1")).await);
    tokio::time::sleep(Duration::from_millis(50)).await;
    assert!(!coord.is_leader());
    register.inner.set_data_nodes(nodes(&["A", "B"]));
    tokio::time::sleep(Duration::from_millis(50)).await;
    assert_eq!(coord.membership().live_count(), 0);

    let stopped = tokio::time::timeout(Duration::from_secs(5), coord.stop()).await;
    assert!(stopped.is_ok());
    assert!(register.inner.coordinators().is_empty());
}
