//! Cluster metadata types
//!
//! Stores:
//! - Node identity records (id, address, tags, epoch)
//! - Partition placement (replica list, slot ids, version)
//! - Removal lifecycle state of draining nodes

use crate::common::utils::partition_desc;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeSet, HashMap};

/// Identity record of a data node or coordinator.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct NodeInfo {
    pub id: String,
    pub addr: String,
    #[serde(default)]
    pub tags: BTreeSet<String>,
    #[serde(default)]
    pub epoch: u64,
}

impl NodeInfo {
    pub fn new(id: impl Into<String>, addr: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            addr: addr.into(),
            tags: BTreeSet::new(),
            epoch: 0,
        }
    }

    pub fn with_tags<I, S>(mut self, tags: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.tags = tags.into_iter().map(Into::into).collect();
        self
    }

    /// Does this node carry every tag in `required`?
    pub fn has_tags(&self, required: &BTreeSet<String>) -> bool {
        required.iter().all(|tag| self.tags.contains(tag))
    }
}

/// Replica assignment of one partition, versioned by `epoch`.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct PartitionReplicaInfo {
    /// Ordered replica node ids (the ISR)
    pub raft_nodes: Vec<String>,
    /// Node id -> slot id
    #[serde(default)]
    pub raft_ids: HashMap<String, u64>,
    /// High-water mark of assigned slot ids
    #[serde(default)]
    pub max_raft_id: u64,
    /// Optimistic version in the register
    #[serde(default)]
    pub epoch: u64,
}

impl PartitionReplicaInfo {
    pub fn contains(&self, node_id: &str) -> bool {
        self.raft_nodes.iter().any(|n| n == node_id)
    }

    /// Append a replica with a freshly incremented slot id.
    pub fn push_replica(&mut self, node_id: &str) -> u64 {
        let slot = self.max_raft_id + 1;
        // a slot id that is not ahead of the high-water mark would alias an
        // older assignment on the same seat
        assert!(
            self.raft_ids.values().all(|&id| id < slot),
            "slot id {} is not ahead of assigned slots",
            slot
        );
        self.max_raft_id = slot;
        self.raft_ids.insert(node_id.to_string(), slot);
        self.raft_nodes.push(node_id.to_string());
        slot
    }

    /// Drop a replica and its slot id. Returns whether it was present.
    pub fn remove_replica(&mut self, node_id: &str) -> bool {
        let before = self.raft_nodes.len();
        self.raft_nodes.retain(|n| n != node_id);
        self.raft_ids.remove(node_id);
        self.raft_nodes.len() != before
    }

    /// No duplicates and the slot map mirrors the replica list.
    pub fn is_consistent(&self) -> bool {
        let unique: BTreeSet<&String> = self.raft_nodes.iter().collect();
        unique.len() == self.raft_nodes.len()
            && self.raft_ids.len() == self.raft_nodes.len()
            && self.raft_nodes.iter().all(|n| self.raft_ids.contains_key(n))
    }
}

/// The unit of placement: one partition of a namespace.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PartitionMetaInfo {
    pub name: String,
    pub partition: i32,
    /// Desired replication factor
    pub replica: usize,
    /// Tags a hosting node must carry
    #[serde(default)]
    pub tags: BTreeSet<String>,
    #[serde(flatten)]
    pub replica_info: PartitionReplicaInfo,
}

impl PartitionMetaInfo {
    /// Build a partition whose initial replicas get slot ids 1..=n.
    pub fn new(name: impl Into<String>, partition: i32, replica: usize, nodes: &[&str]) -> Self {
        let mut replica_info = PartitionReplicaInfo::default();
        for node in nodes {
            replica_info.push_replica(node);
        }
        Self {
            name: name.into(),
            partition,
            replica,
            tags: BTreeSet::new(),
            replica_info,
        }
    }

    pub fn desc(&self) -> String {
        partition_desc(&self.name, self.partition)
    }

    pub fn raft_nodes(&self) -> &[String] {
        &self.replica_info.raft_nodes
    }

    pub fn epoch(&self) -> u64 {
        self.replica_info.epoch
    }

    /// Number of replicas present in `alive`.
    pub fn alive_count<V>(&self, alive: &HashMap<String, V>) -> usize {
        self.replica_info
            .raft_nodes
            .iter()
            .filter(|n| alive.contains_key(n.as_str()))
            .count()
    }
}

/// A migration-check work item. An empty name or a negative partition
/// means "check everything".
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NamespaceNameInfo {
    pub name: String,
    pub partition: i32,
}

impl NamespaceNameInfo {
    pub fn new(name: impl Into<String>, partition: i32) -> Self {
        Self {
            name: name.into(),
            partition,
        }
    }

    pub fn all() -> Self {
        Self {
            name: String::new(),
            partition: -1,
        }
    }

    pub fn is_full_check(&self) -> bool {
        self.name.is_empty() || self.partition < 0
    }
}

/// Lifecycle of a node being drained. Ordered: states only move forward.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RemovalState {
    Marked,
    Pending,
    DataTransferred,
    Done,
}

impl std::fmt::Display for RemovalState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            RemovalState::Marked => write!(f, "marked"),
            RemovalState::Pending => write!(f, "pending"),
            RemovalState::DataTransferred => write!(f, "data_transferred"),
            RemovalState::Done => write!(f, "done"),
        }
    }
}
