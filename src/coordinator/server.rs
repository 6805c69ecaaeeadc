//! Coordinator server
//!
//! Owns leadership. Every time this node becomes leader a fresh cancellation
//! token is created (a child of the process shutdown token) and the four
//! leader-scoped tasks are spawned on it: the data node watch, the namespace
//! checker, the removal manager and the rebalancer. Any leadership
//! transition cancels the previous term's token before anything else.
//! A panic in one of those tasks stops the coordinator and releases
//! leadership.

use crate::common::{Error, PlacementConfig, PlacementMetrics, Result};
use crate::coordinator::checker::{CheckOutcome, PendingMigrations};
use crate::coordinator::membership::{ClusterMembership, NodeMap};
use crate::coordinator::metadata::{NamespaceNameInfo, NodeInfo, RemovalState};
use crate::coordinator::placement::DataPlacement;
use crate::coordinator::probe::ReplicaProbe;
use crate::coordinator::register::Register;
use crate::ops::verify::{verify_cluster, VerifyReport};
use parking_lot::Mutex;
use std::collections::{BTreeSet, HashMap};
use std::future::Future;
use std::sync::atomic::AtomicBool;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;

/// State shared by the coordinator and its background tasks.
pub(crate) struct CoordinatorCore {
    pub(crate) my_node: NodeInfo,
    pub(crate) config: PlacementConfig,
    pub(crate) register: Arc<dyn Register>,
    pub(crate) membership: Arc<ClusterMembership>,
    pub(crate) placement: Arc<DataPlacement>,
    pub(crate) metrics: Arc<PlacementMetrics>,
    /// Last leader seen on the leadership watch
    leader: Mutex<NodeInfo>,
    /// Token of the current leadership term, if leader
    term: Mutex<Option<CancellationToken>>,
    shutdown: CancellationToken,
    tracker: TaskTracker,
    check_tx: mpsc::Sender<NamespaceNameInfo>,
    pub(crate) check_rx: tokio::sync::Mutex<mpsc::Receiver<NamespaceNameInfo>>,
    pub(crate) doing_check: AtomicBool,
}

pub struct Coordinator {
    core: Arc<CoordinatorCore>,
}

impl Coordinator {
    pub fn new(
        config: PlacementConfig,
        my_node: NodeInfo,
        register: Arc<dyn Register>,
        probe: Arc<dyn ReplicaProbe>,
    ) -> Self {
        let membership = Arc::new(ClusterMembership::new());
        let metrics = Arc::new(PlacementMetrics::new());
        let placement = Arc::new(DataPlacement::new(
            register.clone(),
            membership.clone(),
            probe,
            metrics.clone(),
            config.clone(),
        ));
        let (check_tx, check_rx) = mpsc::channel(config.check_queue_depth.max(1));

        Self {
            core: Arc::new(CoordinatorCore {
                my_node,
                config,
                register,
                membership,
                placement,
                metrics,
                leader: Mutex::new(NodeInfo::default()),
                term: Mutex::new(None),
                shutdown: CancellationToken::new(),
                tracker: TaskTracker::new(),
                check_tx,
                check_rx: tokio::sync::Mutex::new(check_rx),
                doing_check: AtomicBool::new(false),
            }),
        }
    }

    /// Register this node and start watching leadership.
    pub async fn start(&self) -> Result<()> {
        let core = &self.core;
        tracing::info!("Starting placement coordinator: {}", core.my_node.id);
        if let Err(e) = core.register.register(&core.my_node).await {
            tracing::warn!("failed to register pd coordinator: {}", e);
            return Err(Error::RegistrationFailed(e.to_string()));
        }

        let core = self.core.clone();
        self.core.tracker.spawn(async move { core.handle_leadership().await });
        Ok(())
    }

    /// True once `stop` was called or a leader task panicked.
    pub fn is_stopped(&self) -> bool {
        self.core.shutdown.is_cancelled()
    }

    /// Resolves when the coordinator shuts down, by `stop` or by a failed
    /// leader task.
    pub async fn stopped(&self) {
        self.core.shutdown.cancelled().await
    }

    /// Cancel every task, unregister and wait for the tasks to unwind.
    pub async fn stop(&self) {
        self.core.shutdown.cancel();
        if let Err(e) = self.core.register.unregister(&self.core.my_node).await {
            tracing::warn!("failed to unregister pd coordinator: {}", e);
        }
        self.core.tracker.close();
        self.core.tracker.wait().await;
        tracing::info!("coordinator stopped.");
    }

    pub fn node(&self) -> &NodeInfo {
        &self.core.my_node
    }

    pub fn is_leader(&self) -> bool {
        self.core.is_leader()
    }

    /// Last leader seen on the leadership watch, if any.
    pub fn leader(&self) -> Option<NodeInfo> {
        let leader = self.core.leader.lock();
        (!leader.id.is_empty()).then(|| leader.clone())
    }

    /// Live nodes usable for placement, optionally filtered by tags.
    pub fn current_nodes(&self, tags: Option<&BTreeSet<String>>) -> NodeMap {
        self.current_nodes_with_epoch(tags).0
    }

    pub fn current_nodes_with_epoch(&self, tags: Option<&BTreeSet<String>>) -> (NodeMap, u64) {
        let empty = BTreeSet::new();
        self.core
            .membership
            .current_nodes_with_epoch(tags.unwrap_or(&empty))
    }

    pub fn membership_epoch(&self) -> u64 {
        self.core.membership.epoch()
    }

    pub fn membership(&self) -> &ClusterMembership {
        &self.core.membership
    }

    pub fn placement(&self) -> &DataPlacement {
        &self.core.placement
    }

    pub fn metrics(&self) -> &PlacementMetrics {
        &self.core.metrics
    }

    pub fn removing_nodes(&self) -> HashMap<String, RemovalState> {
        self.core.membership.removing_nodes()
    }

    /// Start draining a live data node. Only the leader accepts marks.
    pub fn mark_node_removing(&self, node_id: &str) -> Result<()> {
        if !self.core.is_leader() {
            let leader = self.core.leader.lock().id.clone();
            return Err(Error::NotLeader(leader));
        }
        self.core.membership.mark_removing(node_id)?;
        self.core
            .metrics
            .removing_nodes
            .set(self.core.membership.removing_nodes().len() as u64);
        tracing::info!("node {} marked as removing", node_id);
        Ok(())
    }

    /// Stable once a full check pass found every partition healthy.
    pub fn is_cluster_stable(&self) -> bool {
        !self.core.membership.is_unstable()
    }

    /// While upgrading, migrations are deferred.
    pub fn set_upgrading(&self, upgrading: bool) {
        tracing::info!("cluster upgrade state set to {}", upgrading);
        self.core.membership.set_upgrading(upgrading);
    }

    /// Queue an on-demand check after `delay`. Dropped if the queue stays
    /// full past the enqueue timeout.
    pub fn trigger_check_namespaces(&self, target: NamespaceNameInfo, delay: Duration) {
        self.core.trigger_check_namespaces(target, delay);
    }

    /// Run one check pass now. `None` scans every namespace.
    pub async fn check_namespaces_once(
        &self,
        target: Option<NamespaceNameInfo>,
        pending: &mut PendingMigrations,
    ) -> CheckOutcome {
        let token = self.core.shutdown.child_token();
        self.core.do_check_namespaces(&token, target, pending).await
    }

    /// Run one removal lifecycle pass now. Returns the state changes applied.
    pub async fn run_removal_pass(&self) -> HashMap<String, Option<RemovalState>> {
        let token = self.core.shutdown.child_token();
        self.core.removal_pass(&token).await
    }

    /// Add `node_id` as a replica of a partition, reading the partition fresh.
    pub async fn add_replica(&self, name: &str, partition: i32, node_id: &str) -> Result<()> {
        if !self.core.is_leader() {
            let leader = self.core.leader.lock().id.clone();
            return Err(Error::NotLeader(leader));
        }
        let mut part = self.core.register.get_namespace_partition(name, partition).await?;
        let (live, _) = self.core.membership.all_nodes_with_epoch();
        let Some(node) = live.get(node_id) else {
            return Err(Error::NodeNotFound(node_id.to_string()));
        };
        if !node.has_tags(&part.tags) {
            return Err(Error::TagsMismatch {
                node: node_id.to_string(),
                partition: part.desc(),
            });
        }
        if self.core.membership.removing_nodes().contains_key(node_id) {
            return Err(Error::NodeRemoving(node_id.to_string()));
        }
        if part.raft_nodes().len() > part.replica {
            return Err(Error::ReplicaEnough(part.desc()));
        }
        self.core.placement.add_replica(&mut part, node_id).await
    }

    /// Remove `node_id` from the replicas of a partition, reading it fresh.
    pub async fn remove_replica(&self, name: &str, partition: i32, node_id: &str) -> Result<()> {
        if !self.core.is_leader() {
            let leader = self.core.leader.lock().id.clone();
            return Err(Error::NotLeader(leader));
        }
        let mut part = self.core.register.get_namespace_partition(name, partition).await?;
        self.core.placement.remove_replica(&mut part, node_id).await
    }

    /// Read-only placement report over all namespaces.
    pub async fn verify(&self) -> Result<VerifyReport> {
        verify_cluster(self.core.register.as_ref(), &self.core.membership).await
    }
}

impl CoordinatorCore {
    pub(crate) fn is_leader(&self) -> bool {
        let is_me = self.leader.lock().id == self.my_node.id;
        is_me
            && self
                .term
                .lock()
                .as_ref()
                .is_some_and(|t| !t.is_cancelled())
    }

    /// Token of the current term, or the shutdown token outside a term.
    pub(crate) fn scope_token(&self) -> CancellationToken {
        self.term
            .lock()
            .clone()
            .unwrap_or_else(|| self.shutdown.clone())
    }

    fn cancel_term(&self) {
        if let Some(token) = self.term.lock().take() {
            token.cancel();
        }
    }

    async fn handle_leadership(self: Arc<Self>) {
        let core = self.clone();
        // the watch runs in its own task so a panic surfaces as a JoinError
        if let Err(e) = tokio::spawn(async move { core.watch_leader().await }).await {
            if e.is_panic() {
                tracing::error!("leadership watch panicked: {}", e);
            }
        }
        tracing::warn!("leadership watch exit.");
        self.cancel_term();
    }

    async fn watch_leader(self: Arc<Self>) {
        let (leader_tx, mut leader_rx) = mpsc::channel(1);
        let register = self.register.clone();
        let stop = self.shutdown.clone();
        self.tracker.spawn(async move {
            register.acquire_and_watch_leader(leader_tx, stop).await;
        });

        loop {
            let notified = tokio::select! {
                _ = self.shutdown.cancelled() => return,
                notified = leader_rx.recv() => notified,
            };
            match notified {
                None => {
                    tracing::warn!("leader chan closed.");
                    return;
                }
                Some(None) => {
                    tracing::warn!("leader is lost.");
                    self.cancel_term();
                    *self.leader.lock() = NodeInfo::default();
                }
                Some(Some(leader)) => self.on_leader_changed(leader).await,
            }
        }
    }

    async fn on_leader_changed(self: &Arc<Self>, leader: NodeInfo) {
        {
            let mut current = self.leader.lock();
            if current.id == leader.id && current.epoch == leader.epoch {
                return;
            }
            tracing::info!(
                "leader changed from {}({}) to {}({})",
                current.id,
                current.epoch,
                leader.id,
                leader.epoch
            );
            *current = leader.clone();
        }
        self.metrics.leader_transitions.inc();
        self.cancel_term();

        if leader.id != self.my_node.id {
            tracing::info!("I am follower ({}). Leader is: {}", self.my_node.id, leader.id);
            self.membership.clear_removing();
            self.metrics.removing_nodes.set(0);
            return;
        }

        tracing::info!("I am leader now.");
        match self.register.get_all_namespaces().await {
            Ok((all, _)) => {
                tracing::info!("namespace loaded: {}", all.len());
                self.placement.refresh_load(&all);
            }
            Err(e) => tracing::error!("load namespace info failed: {}", e),
        }

        let token = self.shutdown.child_token();
        *self.term.lock() = Some(token.clone());
        self.spawn_leader_tasks(token);
    }

    fn spawn_leader_tasks(self: &Arc<Self>, token: CancellationToken) {
        let core = self.clone();
        let t = token.clone();
        self.spawn_term_task("data node watch", &token, async move { core.handle_data_nodes(t).await });

        let core = self.clone();
        let t = token.clone();
        self.spawn_term_task("namespace checker", &token, async move { core.check_namespaces(t).await });

        let core = self.clone();
        let t = token.clone();
        self.spawn_term_task("removal manager", &token, async move { core.handle_removing_nodes(t).await });

        let placement = self.placement.clone();
        let t = token.clone();
        self.spawn_term_task("rebalancer", &token, async move { placement.rebalance_loop(t).await });
    }

    /// Run a leader task in its own task. A panic in it ends the term and
    /// shuts the coordinator down, releasing leadership.
    fn spawn_term_task<F>(self: &Arc<Self>, name: &'static str, token: &CancellationToken, task: F)
    where
        F: Future<Output = ()> + Send + 'static,
    {
        let core = self.clone();
        let token = token.clone();
        self.tracker.spawn(async move {
            let Err(e) = tokio::spawn(task).await else {
                return;
            };
            if !e.is_panic() {
                return;
            }
            tracing::error!("{} panicked, stepping down: {}", name, e);
            token.cancel();
            core.shutdown.cancel();
            if let Err(e) = core.register.unregister(&core.my_node).await {
                tracing::warn!("failed to unregister pd coordinator: {}", e);
            }
        });
    }

    /// Follow the live data node list for one leadership term.
    async fn handle_data_nodes(self: Arc<Self>, token: CancellationToken) {
        let (nodes_tx, mut nodes_rx) = mpsc::channel(1);
        let register = self.register.clone();
        let stop = token.clone();
        self.tracker.spawn(async move {
            register.watch_data_nodes(nodes_tx, stop).await;
        });
        tracing::debug!("start watch the nodes.");

        loop {
            let nodes = tokio::select! {
                _ = token.cancelled() => break,
                nodes = nodes_rx.recv() => match nodes {
                    Some(nodes) => nodes,
                    None => break,
                },
            };
            tracing::debug!("current data nodes: {}", nodes.len());
            let change = self.membership.apply_live_nodes(nodes);
            for id in &change.lost {
                tracing::warn!("node failed: {}", id);
            }
            for id in &change.joined {
                tracing::info!("new node joined: {}", id);
            }
            self.metrics.membership_epoch.set(change.epoch);
            self.metrics
                .live_nodes
                .set(self.membership.live_count() as u64);

            if !change.is_empty() {
                self.membership.set_unstable(true);
                self.trigger_check_namespaces(NamespaceNameInfo::all(), self.config.join_check_delay());
            }
        }
        tracing::info!("stop watch the nodes.");
    }

    pub(crate) fn trigger_check_namespaces(&self, target: NamespaceNameInfo, delay: Duration) {
        let check_tx = self.check_tx.clone();
        let scope = self.scope_token();
        let enqueue_timeout = self.config.check_enqueue_timeout();
        let metrics = self.metrics.clone();
        self.tracker.spawn(async move {
            tokio::select! {
                _ = scope.cancelled() => return,
                _ = tokio::time::sleep(delay) => {}
            }
            tokio::select! {
                _ = scope.cancelled() => {}
                sent = tokio::time::timeout(enqueue_timeout, check_tx.send(target)) => {
                    if sent.is_err() {
                        metrics.check_requests_dropped.inc();
                        tracing::debug!("check queue full, request dropped");
                    }
                }
            }
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::coordinator::metadata::PartitionMetaInfo;
    use crate::coordinator::probe::MemoryProbe;
    use crate::coordinator::register::MemoryRegister;

    async fn wait_until(mut cond: impl FnMut() -> bool) -> bool {
        for _ in 0..200 {
            if cond() {
                return true;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        false
    }

    fn coordinator(register: Arc<MemoryRegister>, id: &str) -> Coordinator {
        Coordinator::new(
            PlacementConfig::default(),
            NodeInfo::new(id, format!("{}:5000", id)),
            register,
            Arc::new(MemoryProbe::new()),
        )
    }

    #[tokio::test]
    async fn test_start_becomes_leader_and_stops() {
        let register = Arc::new(MemoryRegister::new());
        let coord = coordinator(register.clone(), "pd-1");
        coord.start().await.unwrap();
        assert!(wait_until(|| coord.is_leader()).await);
        assert_eq!(coord.leader().unwrap().id, "pd-1");

        coord.stop().await;
        assert!(!coord.is_leader());
        assert!(register.coordinators().is_empty());
    }

    #[tokio::test]
    async fn test_duplicate_registration_is_fatal() {
        let register = Arc::new(MemoryRegister::new());
        register
            .register(&NodeInfo::new("pd-1", "pd-1:5000"))
            .await
            .unwrap();
        let coord = coordinator(register, "pd-1");
        assert!(matches!(
            coord.start().await,
            Err(Error::RegistrationFailed(_))
        ));
    }

    #[tokio::test]
    async fn test_add_and_remove_replica() {
        let register = Arc::new(MemoryRegister::new());
        register.create_partition(PartitionMetaInfo::new("ns0", 0, 2, &["A"]));
        let mut ssd = PartitionMetaInfo::new("ns1", 0, 2, &["A", "B"]);
        ssd.tags.insert("ssd".to_string());
        register.create_partition(ssd);
        register.set_data_nodes(vec![
            NodeInfo::new("A", "a").with_tags(["ssd"]),
            NodeInfo::new("B", "b").with_tags(["ssd"]),
            NodeInfo::new("C", "c"),
            NodeInfo::new("D", "d"),
        ]);
        let coord = coordinator(register.clone(), "pd-1");
        coord.start().await.unwrap();
        assert!(wait_until(|| coord.is_leader()).await);
        assert!(wait_until(|| coord.membership().live_count() == 4).await);
        // let the join check run so no pass overlaps the edits below
        assert!(wait_until(|| coord.metrics().check_passes.get() >= 1).await);

        coord.add_replica("ns0", 0, "B").await.unwrap();
        // one transient seat above the factor is allowed
        coord.add_replica("ns0", 0, "C").await.unwrap();
        assert!(matches!(
            coord.add_replica("ns0", 0, "D").await,
            Err(Error::ReplicaEnough(_))
        ));
        assert!(matches!(
            coord.add_replica("ns0", 0, "Z").await,
            Err(Error::NodeNotFound(_))
        ));

        coord.remove_replica("ns0", 0, "C").await.unwrap();
        let part = register.partition("ns0", 0).unwrap();
        assert_eq!(part.raft_nodes(), &["A", "B"]);
        assert_eq!(part.epoch(), 3);

        coord.mark_node_removing("D").unwrap();
        assert!(matches!(
            coord.add_replica("ns0", 0, "D").await,
            Err(Error::NodeRemoving(_))
        ));

        coord.stop().await;
    }

    #[tokio::test]
    async fn test_add_replica_requires_partition_tags() {
        let register = Arc::new(MemoryRegister::new());
        let mut ssd = PartitionMetaInfo::new("ns1", 0, 2, &["A"]);
        ssd.tags.insert("ssd".to_string());
        register.create_partition(ssd);
        register.set_data_nodes(vec![
            NodeInfo::new("A", "a").with_tags(["ssd"]),
            NodeInfo::new("B", "b"),
            NodeInfo::new("C", "c").with_tags(["ssd", "fast"]),
        ]);
        let coord = coordinator(register.clone(), "pd-1");
        coord.start().await.unwrap();
        assert!(wait_until(|| coord.membership().live_count() == 3).await);
        assert!(wait_until(|| coord.metrics().check_passes.get() >= 1).await);

        assert!(matches!(
            coord.add_replica("ns1", 0, "B").await,
            Err(Error::TagsMismatch { .. })
        ));
        assert_eq!(register.partition("ns1", 0).unwrap().epoch(), 0);

        // extra tags on the node are fine
        coord.add_replica("ns1", 0, "C").await.unwrap();
        assert_eq!(register.partition("ns1", 0).unwrap().raft_nodes(), &["A", "C"]);

        coord.stop().await;
    }

    #[tokio::test]
    async fn test_replica_edits_need_leadership() {
        let register = Arc::new(MemoryRegister::new());
        register.create_partition(PartitionMetaInfo::new("ns0", 0, 2, &["A"]));
        let coord = coordinator(register.clone(), "pd-1");
        coord.membership().apply_live_nodes(vec![NodeInfo::new("A", "a"), NodeInfo::new("B", "b")]);

        assert!(matches!(
            coord.add_replica("ns0", 0, "B").await,
            Err(Error::NotLeader(_))
        ));
        assert!(matches!(
            coord.remove_replica("ns0", 0, "A").await,
            Err(Error::NotLeader(_))
        ));
        assert_eq!(register.partition("ns0", 0).unwrap().epoch(), 0);
    }

    #[tokio::test]
    async fn test_full_check_queue_drops_without_blocking() {
        let register = Arc::new(MemoryRegister::new());
        let config = PlacementConfig {
            check_queue_depth: 3,
            check_enqueue_timeout_ms: 20,
            ..Default::default()
        };
        // never started, so nothing drains the queue
        let coord = Coordinator::new(
            config,
            NodeInfo::new("pd-1", "pd-1:5000"),
            register,
            Arc::new(MemoryProbe::new()),
        );

        let begin = std::time::Instant::now();
        for partition in 0..5 {
            coord.trigger_check_namespaces(NamespaceNameInfo::new("ns0", partition), Duration::ZERO);
        }
        assert!(begin.elapsed() < Duration::from_millis(20));

        assert!(wait_until(|| coord.metrics().check_requests_dropped.get() == 2).await);
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert_eq!(coord.metrics().check_requests_dropped.get(), 2);

        coord.stop().await;
    }

    #[tokio::test]
    async fn test_follower_clears_removing_nodes() {
        let register = Arc::new(MemoryRegister::new());
        let coord = coordinator(register.clone(), "pd-1");
        coord.start().await.unwrap();
        assert!(wait_until(|| coord.is_leader()).await);

        register.set_data_nodes(vec![NodeInfo::new("A", "a"), NodeInfo::new("B", "b")]);
        assert!(wait_until(|| coord.membership().live_count() == 2).await);
        coord.mark_node_removing("A").unwrap();
        assert_eq!(coord.removing_nodes().len(), 1);

        register.set_leader(Some(NodeInfo::new("pd-2", "pd-2:5000")));
        assert!(wait_until(|| !coord.is_leader()).await);
        assert!(wait_until(|| coord.removing_nodes().is_empty()).await);
        assert!(matches!(
            coord.mark_node_removing("B"),
            Err(Error::NotLeader(_))
        ));

        coord.stop().await;
    }
}
