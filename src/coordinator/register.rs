//! Coordination store client
//!
//! The placement driver never talks to the backing store directly: leader
//! election, the data node watch and partition metadata CRUD all go through
//! the [`Register`] trait. [`MemoryRegister`] keeps everything in process and
//! backs the standalone binary and the tests.

use crate::common::{Error, Result};
use crate::coordinator::metadata::{NodeInfo, PartitionMetaInfo, PartitionReplicaInfo};
use async_trait::async_trait;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::Path;
use tokio::sync::{mpsc, watch};
use tokio_util::sync::CancellationToken;

/// All partitions keyed by namespace name, each list ordered by partition.
pub type NamespaceMap = BTreeMap<String, Vec<PartitionMetaInfo>>;

#[async_trait]
pub trait Register: Send + Sync {
    /// Bind this client to one cluster. Every key it touches afterwards
    /// lives under that cluster.
    async fn init_cluster_id(&self, cluster_id: &str) -> Result<()>;

    /// Register this coordinator so it can take part in leader election.
    async fn register(&self, node: &NodeInfo) -> Result<()>;

    async fn unregister(&self, node: &NodeInfo) -> Result<()>;

    /// Campaign for leadership and deliver every leader change until `stop`
    /// fires. `None` means the leader is lost. Returning closes the channel.
    async fn acquire_and_watch_leader(
        &self,
        leader_tx: mpsc::Sender<Option<NodeInfo>>,
        stop: CancellationToken,
    );

    /// Deliver the full live data node list on every change until `stop`
    /// fires. Returning closes the channel.
    async fn watch_data_nodes(&self, nodes_tx: mpsc::Sender<Vec<NodeInfo>>, stop: CancellationToken);

    /// All namespace partitions plus the register version they were read at.
    async fn get_all_namespaces(&self) -> Result<(NamespaceMap, u64)>;

    async fn get_namespace_partition(&self, name: &str, partition: i32) -> Result<PartitionMetaInfo>;

    /// Compare-and-swap the replica assignment of one partition. Fails with
    /// [`Error::VersionConflict`] when `expected_epoch` is stale; returns the
    /// new version on success.
    async fn update_partition_replicas(
        &self,
        name: &str,
        partition: i32,
        info: &PartitionReplicaInfo,
        expected_epoch: u64,
    ) -> Result<u64>;
}

#[derive(Default)]
struct MemoryState {
    cluster_id: Option<String>,
    coordinators: Vec<NodeInfo>,
    namespaces: BTreeMap<String, BTreeMap<i32, PartitionMetaInfo>>,
    version: u64,
    leader_epoch: u64,
    fail_updates: bool,
    fail_reads: bool,
}

/// In-process register.
///
/// The first registered coordinator becomes leader when a campaign starts
/// and nobody holds leadership. Tests steer leadership and membership with
/// [`MemoryRegister::set_leader`] and [`MemoryRegister::set_data_nodes`].
pub struct MemoryRegister {
    state: Mutex<MemoryState>,
    leader: watch::Sender<Option<NodeInfo>>,
    data_nodes: watch::Sender<Vec<NodeInfo>>,
}

impl MemoryRegister {
    pub fn new() -> Self {
        let (leader, _) = watch::channel(None);
        let (data_nodes, _) = watch::channel(Vec::new());
        Self {
            state: Mutex::new(MemoryState::default()),
            leader,
            data_nodes,
        }
    }

    /// Force a leader (or leader loss). Each call gets a new leader epoch.
    pub fn set_leader(&self, node: Option<NodeInfo>) {
        let node = node.map(|mut n| {
            let mut state = self.state.lock();
            state.leader_epoch += 1;
            n.epoch = state.leader_epoch;
            n
        });
        self.leader.send_replace(node);
    }

    pub fn leader(&self) -> Option<NodeInfo> {
        self.leader.borrow().clone()
    }

    /// Replace the live data node list seen by watchers.
    pub fn set_data_nodes(&self, nodes: Vec<NodeInfo>) {
        self.data_nodes.send_replace(nodes);
    }

    pub fn data_nodes(&self) -> Vec<NodeInfo> {
        self.data_nodes.borrow().clone()
    }

    /// Create or overwrite a partition.
    pub fn create_partition(&self, part: PartitionMetaInfo) {
        let mut state = self.state.lock();
        state.version += 1;
        state
            .namespaces
            .entry(part.name.clone())
            .or_default()
            .insert(part.partition, part);
    }

    pub fn partition(&self, name: &str, partition: i32) -> Option<PartitionMetaInfo> {
        let state = self.state.lock();
        state.namespaces.get(name)?.get(&partition).cloned()
    }

    /// Make replica updates fail with a store error.
    pub fn fail_updates(&self, fail: bool) {
        self.state.lock().fail_updates = fail;
    }

    /// Make metadata reads fail with a store error.
    pub fn fail_reads(&self, fail: bool) {
        self.state.lock().fail_reads = fail;
    }

    /// Cluster this register was bound to, if any.
    pub fn cluster_id(&self) -> Option<String> {
        self.state.lock().cluster_id.clone()
    }

    pub fn coordinators(&self) -> Vec<NodeInfo> {
        self.state.lock().coordinators.clone()
    }

    fn campaign(&self) {
        if self.leader.borrow().is_some() {
            return;
        }
        let candidate = self.state.lock().coordinators.first().cloned();
        if let Some(node) = candidate {
            tracing::info!("memory register elected leader {}", node.id);
            self.set_leader(Some(node));
        }
    }
}

impl Default for MemoryRegister {
    fn default() -> Self {
        Self::new()
    }
}

/// Initial register content, loaded from JSON by the binary.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ClusterSeed {
    #[serde(default)]
    pub data_nodes: Vec<NodeInfo>,
    #[serde(default)]
    pub partitions: Vec<PartitionMetaInfo>,
}

impl ClusterSeed {
    pub fn from_json(data: &str) -> Result<Self> {
        Ok(serde_json::from_str(data)?)
    }

    pub fn load(path: &Path) -> Result<Self> {
        let data = std::fs::read_to_string(path)?;
        Self::from_json(&data)
    }

    /// Build a register holding this seed.
    pub fn into_register(self) -> MemoryRegister {
        let register = MemoryRegister::new();
        for mut part in self.partitions {
            fill_slot_ids(&mut part.replica_info);
            register.create_partition(part);
        }
        register.set_data_nodes(self.data_nodes);
        register
    }
}

/// Hand-written seeds may list replicas without slot ids.
fn fill_slot_ids(info: &mut PartitionReplicaInfo) {
    let highest = info.raft_ids.values().copied().max().unwrap_or(0);
    info.max_raft_id = info.max_raft_id.max(highest);
    let missing: Vec<String> = info
        .raft_nodes
        .iter()
        .filter(|n| !info.raft_ids.contains_key(*n))
        .cloned()
        .collect();
    for node_id in missing {
        info.max_raft_id += 1;
        info.raft_ids.insert(node_id, info.max_raft_id);
    }
}

/// Forward every value of a watch channel into `tx` until `stop` fires or
/// the receiving side goes away.
async fn forward_watch<T: Clone>(
    mut rx: watch::Receiver<T>,
    tx: mpsc::Sender<T>,
    stop: CancellationToken,
) {
    loop {
        let value = rx.borrow_and_update().clone();
        tokio::select! {
            res = tx.send(value) => {
                if res.is_err() {
                    return;
                }
            }
            _ = stop.cancelled() => return,
        }
        tokio::select! {
            changed = rx.changed() => {
                if changed.is_err() {
                    return;
                }
            }
            _ = stop.cancelled() => return,
        }
    }
}

#[async_trait]
impl Register for MemoryRegister {
    async fn init_cluster_id(&self, cluster_id: &str) -> Result<()> {
        if cluster_id.is_empty() {
            return Err(Error::InvalidConfig("cluster id is empty".into()));
        }
        let mut state = self.state.lock();
        match &state.cluster_id {
            Some(current) if current != cluster_id => Err(Error::InvalidConfig(format!(
                "register already bound to cluster {}, not {}",
                current, cluster_id
            ))),
            Some(_) => Ok(()),
            None => {
                tracing::info!("memory register bound to cluster {}", cluster_id);
                state.cluster_id = Some(cluster_id.to_string());
                Ok(())
            }
        }
    }

    async fn register(&self, node: &NodeInfo) -> Result<()> {
        let mut state = self.state.lock();
        if state.coordinators.iter().any(|n| n.id == node.id) {
            return Err(Error::AlreadyExists(node.id.clone()));
        }
        state.coordinators.push(node.clone());
        Ok(())
    }

    async fn unregister(&self, node: &NodeInfo) -> Result<()> {
        self.state.lock().coordinators.retain(|n| n.id != node.id);
        let is_leader = self
            .leader
            .borrow()
            .as_ref()
            .is_some_and(|l| l.id == node.id);
        if is_leader {
            self.leader.send_replace(None);
        }
        Ok(())
    }

    async fn acquire_and_watch_leader(
        &self,
        leader_tx: mpsc::Sender<Option<NodeInfo>>,
        stop: CancellationToken,
    ) {
        self.campaign();
        forward_watch(self.leader.subscribe(), leader_tx, stop).await;
    }

    async fn watch_data_nodes(&self, nodes_tx: mpsc::Sender<Vec<NodeInfo>>, stop: CancellationToken) {
        forward_watch(self.data_nodes.subscribe(), nodes_tx, stop).await;
    }

    async fn get_all_namespaces(&self) -> Result<(NamespaceMap, u64)> {
        let state = self.state.lock();
        if state.fail_reads {
            return Err(Error::Register("read failure injected".into()));
        }
        let all = state
            .namespaces
            .iter()
            .map(|(name, parts)| (name.clone(), parts.values().cloned().collect()))
            .collect();
        Ok((all, state.version))
    }

    async fn get_namespace_partition(&self, name: &str, partition: i32) -> Result<PartitionMetaInfo> {
        let state = self.state.lock();
        if state.fail_reads {
            return Err(Error::Register("read failure injected".into()));
        }
        state
            .namespaces
            .get(name)
            .and_then(|parts| parts.get(&partition))
            .cloned()
            .ok_or_else(|| Error::PartitionNotFound {
                name: name.to_string(),
                partition,
            })
    }

    async fn update_partition_replicas(
        &self,
        name: &str,
        partition: i32,
        info: &PartitionReplicaInfo,
        expected_epoch: u64,
    ) -> Result<u64> {
        let mut state = self.state.lock();
        if state.fail_updates {
            return Err(Error::Register("update failure injected".into()));
        }
        let part = state
            .namespaces
            .get_mut(name)
            .and_then(|parts| parts.get_mut(&partition))
            .ok_or_else(|| Error::PartitionNotFound {
                name: name.to_string(),
                partition,
            })?;
        if part.replica_info.epoch != expected_epoch {
            return Err(Error::VersionConflict {
                name: name.to_string(),
                partition,
                expected: expected_epoch,
                actual: part.replica_info.epoch,
            });
        }
        let new_epoch = expected_epoch + 1;
        part.replica_info = PartitionReplicaInfo {
            epoch: new_epoch,
            ..info.clone()
        };
        state.version += 1;
        Ok(new_epoch)
    }
}
