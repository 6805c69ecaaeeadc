//! Cluster membership state
//!
//! Live data nodes and the removing set sit behind one reader/writer lock.
//! The membership epoch and the cluster flags are atomics so staleness checks
//! never take the lock. The epoch is only bumped while the write lock is
//! held, together with the snapshot swap, so a reader that copies the map and
//! the epoch under the read lock always gets a consistent pair.

use crate::coordinator::metadata::{NodeInfo, RemovalState};
use parking_lot::RwLock;
use std::collections::{BTreeSet, HashMap};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};

/// Live node id -> node record.
pub type NodeMap = HashMap<String, NodeInfo>;

#[derive(Default)]
struct MembershipInner {
    data_nodes: NodeMap,
    removing: HashMap<String, RemovalState>,
}

/// Result of applying one membership delivery.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct MembershipChange {
    pub lost: Vec<String>,
    pub joined: Vec<String>,
    pub epoch: u64,
}

impl MembershipChange {
    pub fn is_empty(&self) -> bool {
        self.lost.is_empty() && self.joined.is_empty()
    }
}

#[derive(Default)]
pub struct ClusterMembership {
    inner: RwLock<MembershipInner>,
    epoch: AtomicU64,
    unstable: AtomicBool,
    upgrading: AtomicBool,
}

impl ClusterMembership {
    pub fn new() -> Self {
        Self::default()
    }

    /// Replace the live node set with a full delivery from the watch.
    ///
    /// Lost nodes bump the epoch once, joined nodes bump it once more and
    /// mark the cluster unstable.
    pub fn apply_live_nodes(&self, nodes: Vec<NodeInfo>) -> MembershipChange {
        let new_nodes: NodeMap = nodes.into_iter().map(|n| (n.id.clone(), n)).collect();

        let mut inner = self.inner.write();
        let mut lost: Vec<String> = inner
            .data_nodes
            .keys()
            .filter(|id| !new_nodes.contains_key(*id))
            .cloned()
            .collect();
        let mut joined: Vec<String> = new_nodes
            .keys()
            .filter(|id| !inner.data_nodes.contains_key(*id))
            .cloned()
            .collect();
        lost.sort();
        joined.sort();

        inner.data_nodes = new_nodes;
        if !lost.is_empty() {
            self.epoch.fetch_add(1, Ordering::SeqCst);
        }
        if !joined.is_empty() {
            self.epoch.fetch_add(1, Ordering::SeqCst);
            self.unstable.store(true, Ordering::SeqCst);
        }
        let epoch = self.epoch.load(Ordering::SeqCst);
        drop(inner);

        MembershipChange { lost, joined, epoch }
    }

    pub fn epoch(&self) -> u64 {
        self.epoch.load(Ordering::SeqCst)
    }

    /// Live nodes usable for placement: draining nodes and nodes missing any
    /// of `tags` are filtered out.
    pub fn current_nodes(&self, tags: &BTreeSet<String>) -> NodeMap {
        self.current_nodes_with_epoch(tags).0
    }

    /// Like [`current_nodes`](Self::current_nodes), paired with the epoch
    /// the snapshot was taken at.
    pub fn current_nodes_with_epoch(&self, tags: &BTreeSet<String>) -> (NodeMap, u64) {
        let inner = self.inner.read();
        let nodes = inner
            .data_nodes
            .iter()
            .filter(|(id, node)| !inner.removing.contains_key(*id) && node.has_tags(tags))
            .map(|(id, node)| (id.clone(), node.clone()))
            .collect();
        let epoch = self.epoch.load(Ordering::SeqCst);
        (nodes, epoch)
    }

    /// Every live node, draining ones included.
    pub fn all_nodes_with_epoch(&self) -> (NodeMap, u64) {
        let inner = self.inner.read();
        let nodes = inner.data_nodes.clone();
        let epoch = self.epoch.load(Ordering::SeqCst);
        (nodes, epoch)
    }

    pub fn is_live(&self, node_id: &str) -> bool {
        self.inner.read().data_nodes.contains_key(node_id)
    }

    pub fn live_count(&self) -> usize {
        self.inner.read().data_nodes.len()
    }

    pub fn removing_nodes(&self) -> HashMap<String, RemovalState> {
        self.inner.read().removing.clone()
    }

    /// Start draining a live node.
    pub fn mark_removing(&self, node_id: &str) -> crate::Result<()> {
        let mut inner = self.inner.write();
        if !inner.data_nodes.contains_key(node_id) {
            return Err(crate::Error::NodeNotFound(node_id.to_string()));
        }
        if inner.removing.contains_key(node_id) {
            return Err(crate::Error::AlreadyExists(node_id.to_string()));
        }
        inner
            .removing
            .insert(node_id.to_string(), RemovalState::Marked);
        Ok(())
    }

    /// Merge the outcome of a removal pass.
    ///
    /// Only nodes still tracked are touched, states never move backwards and
    /// `None` deletes the record.
    pub fn apply_removal_progress(&self, progress: HashMap<String, Option<RemovalState>>) {
        let mut inner = self.inner.write();
        for (node_id, state) in progress {
            match state {
                None => {
                    inner.removing.remove(&node_id);
                }
                Some(state) => {
                    if let Some(current) = inner.removing.get_mut(&node_id) {
                        if state > *current {
                            *current = state;
                        }
                    }
                }
            }
        }
    }

    /// Forget all drain state (used when stepping down to follower).
    pub fn clear_removing(&self) {
        self.inner.write().removing.clear();
    }

    pub fn is_unstable(&self) -> bool {
        self.unstable.load(Ordering::SeqCst)
    }

    pub fn set_unstable(&self, unstable: bool) {
        self.unstable.store(unstable, Ordering::SeqCst);
    }

    pub fn is_upgrading(&self) -> bool {
        self.upgrading.load(Ordering::SeqCst)
    }

    pub fn set_upgrading(&self, upgrading: bool) {
        self.upgrading.store(upgrading, Ordering::SeqCst);
    }
}
