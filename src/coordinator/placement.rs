//! Data placement decisions
//!
//! Chooses hosts for new replicas, picks replicas to evict from
//! over-replicated partitions, validates replica lists before they are
//! persisted and runs the background rebalancer inside its time-of-day window.

use crate::common::utils::{log_failure, FlagGuard};
use crate::common::{Error, PlacementConfig, PlacementMetrics, Result};
use crate::coordinator::membership::{ClusterMembership, NodeMap};
use crate::coordinator::metadata::{NodeInfo, PartitionMetaInfo};
use crate::coordinator::probe::ReplicaProbe;
use crate::coordinator::register::{NamespaceMap, Register};
use chrono::Timelike;
use parking_lot::RwLock;
use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tokio_util::sync::CancellationToken;

/// One replica move planned by the rebalancer.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BalanceMove {
    pub name: String,
    pub partition: i32,
    pub from: String,
    pub to: String,
}

pub struct DataPlacement {
    register: Arc<dyn Register>,
    membership: Arc<ClusterMembership>,
    probe: Arc<dyn ReplicaProbe>,
    metrics: Arc<PlacementMetrics>,
    config: PlacementConfig,
    /// Replicas hosted per node, from the last full listing
    node_load: RwLock<HashMap<String, usize>>,
    /// Set while a rebalance round is moving replicas
    balancing: AtomicBool,
}

impl DataPlacement {
    pub fn new(
        register: Arc<dyn Register>,
        membership: Arc<ClusterMembership>,
        probe: Arc<dyn ReplicaProbe>,
        metrics: Arc<PlacementMetrics>,
        config: PlacementConfig,
    ) -> Self {
        Self {
            register,
            membership,
            probe,
            metrics,
            config,
            node_load: RwLock::new(HashMap::new()),
            balancing: AtomicBool::new(false),
        }
    }

    /// Recount replicas per node from a full namespace listing.
    pub fn refresh_load(&self, all: &NamespaceMap) {
        let mut load: HashMap<String, usize> = HashMap::new();
        for part in all.values().flatten() {
            for node in part.raft_nodes() {
                *load.entry(node.clone()).or_default() += 1;
            }
        }
        *self.node_load.write() = load;
    }

    pub fn node_load(&self, node_id: &str) -> usize {
        self.node_load.read().get(node_id).copied().unwrap_or(0)
    }

    pub fn is_balancing(&self) -> bool {
        self.balancing.load(Ordering::SeqCst)
    }

    /// Choose a host for one more replica of `part`: not already a replica,
    /// carries every partition tag, fewest hosted replicas (ties by id).
    pub fn allocate(&self, part: &PartitionMetaInfo, candidates: &NodeMap) -> Result<NodeInfo> {
        let chosen = {
            let load = self.node_load.read();
            let load_of = |id: &str| load.get(id).copied().unwrap_or(0);
            candidates
                .values()
                .filter(|n| !part.replica_info.contains(&n.id) && n.has_tags(&part.tags))
                .min_by(|a, b| load_of(&a.id).cmp(&load_of(&b.id)).then_with(|| a.id.cmp(&b.id)))
                .cloned()
        };

        match chosen {
            Some(node) => {
                *self.node_load.write().entry(node.id.clone()).or_default() += 1;
                Ok(node)
            }
            None => Err(Error::NodeUnavailable(part.desc())),
        }
    }

    /// Pick the replica to drop from an over-replicated partition.
    ///
    /// A replica that is not live goes first, otherwise the most loaded live
    /// one (ties: the later one in replica order). Never empties a partition.
    pub fn choose_eviction_target(&self, part: &PartitionMetaInfo, live: &NodeMap) -> Option<String> {
        let nodes = part.raft_nodes();
        if nodes.len() < 2 {
            return None;
        }
        if let Some(dead) = nodes.iter().find(|n| !live.contains_key(n.as_str())) {
            return Some(dead.clone());
        }
        let load = self.node_load.read();
        nodes
            .iter()
            .enumerate()
            .max_by_key(|(idx, n)| (load.get(n.as_str()).copied().unwrap_or(0), *idx))
            .map(|(_, n)| n.clone())
    }

    /// Validate a replica list before it is persisted: no duplicates, slot
    /// map mirrors the list, at most one seat above the desired factor.
    pub fn check_conflict(&self, part: &PartitionMetaInfo) -> Result<()> {
        if !part.replica_info.is_consistent() || part.raft_nodes().len() > part.replica + 1 {
            return Err(Error::NamespaceNodeConflict(part.desc()));
        }
        Ok(())
    }

    /// Append `node_id` to the replicas of `part` and persist it. On success
    /// `part` carries the new version; on failure it is left untouched.
    pub async fn add_replica(&self, part: &mut PartitionMetaInfo, node_id: &str) -> Result<()> {
        if part.replica_info.contains(node_id) {
            return Err(Error::NamespaceNodeConflict(part.desc()));
        }
        let mut updated = part.clone();
        let slot = updated.replica_info.push_replica(node_id);
        self.check_conflict(&updated)?;
        self.persist(&mut updated, part.epoch()).await?;
        *part = updated;

        self.metrics.replicas_added.inc();
        tracing::info!("partition {} replica {} added with slot {}", part.desc(), node_id, slot);
        Ok(())
    }

    /// Drop `node_id` from the replicas of `part` and persist it. The last
    /// replica of a partition can not be removed.
    pub async fn remove_replica(&self, part: &mut PartitionMetaInfo, node_id: &str) -> Result<()> {
        if !part.replica_info.contains(node_id) {
            return Ok(());
        }
        if part.raft_nodes().len() <= 1 {
            tracing::info!("single replica can not be removed from partition {}", part.desc());
            return Err(Error::ReplicaNotEnough(part.desc()));
        }
        let mut updated = part.clone();
        updated.replica_info.remove_replica(node_id);
        self.persist(&mut updated, part.epoch()).await?;
        *part = updated;

        self.metrics.replicas_removed.inc();
        tracing::info!("partition {} replica removed from node {}", part.desc(), node_id);
        Ok(())
    }

    /// Compare-and-swap `part` into the register at `expected_epoch`.
    pub(crate) async fn persist(&self, part: &mut PartitionMetaInfo, expected_epoch: u64) -> Result<()> {
        match self
            .register
            .update_partition_replicas(&part.name, part.partition, &part.replica_info, expected_epoch)
            .await
        {
            Ok(epoch) => {
                part.replica_info.epoch = epoch;
                Ok(())
            }
            Err(e) => {
                self.metrics.update_conflicts.inc();
                log_failure(format_args!("update partition {} replica info failed", part.desc()), &e);
                Err(e)
            }
        }
    }

    /// Allocate a host among `candidates`, add it and wait until the new
    /// replica reports caught up. Returns the new replica's node id.
    pub async fn add_replica_and_wait_ready(
        &self,
        token: &CancellationToken,
        part: &mut PartitionMetaInfo,
        candidates: &NodeMap,
    ) -> Result<String> {
        let node = self.allocate(part, candidates)?;
        self.add_replica(part, &node.id).await?;
        self.wait_replica_ready(token, &node, part).await?;
        Ok(node.id)
    }

    /// Poll the probe until `node` reports its replica of `part` ready.
    pub async fn wait_replica_ready(
        &self,
        token: &CancellationToken,
        node: &NodeInfo,
        part: &PartitionMetaInfo,
    ) -> Result<()> {
        let deadline = tokio::time::Instant::now() + self.config.ready_wait_timeout();
        loop {
            if token.is_cancelled() {
                return Err(Error::Stopped);
            }
            match self.probe.is_replica_ready(node, part).await {
                Ok(true) => {
                    tracing::info!("partition {} replica on {} is ready", part.desc(), node.id);
                    return Ok(());
                }
                Ok(false) => {}
                Err(e) if e.is_retryable() => {
                    tracing::debug!("ready check of {} on {} failed: {}", part.desc(), node.id, e)
                }
                Err(e) => return Err(e),
            }
            if tokio::time::Instant::now() >= deadline {
                return Err(Error::Timeout(format!(
                    "replica of {} on {} not ready",
                    part.desc(),
                    node.id
                )));
            }
            tokio::select! {
                _ = token.cancelled() => return Err(Error::Stopped),
                _ = tokio::time::sleep(self.config.ready_poll_interval()) => {}
            }
        }
    }

    /// Is `hour` (0-23, local time) inside the balance window? The window
    /// may wrap past midnight; equal bounds disable balancing.
    pub fn in_balance_window(&self, hour: u32) -> bool {
        let start = self.config.balance_start_hour;
        let end = self.config.balance_end_hour;
        match start.cmp(&end) {
            std::cmp::Ordering::Equal => false,
            std::cmp::Ordering::Less => hour >= start && hour < end,
            std::cmp::Ordering::Greater => hour >= start || hour < end,
        }
    }

    /// Background rebalancer, bound to one leadership term.
    pub async fn rebalance_loop(&self, token: CancellationToken) {
        tracing::debug!("start rebalance loop");
        let period = self.config.balance_interval();
        let mut ticker = tokio::time::interval_at(tokio::time::Instant::now() + period, period);
        loop {
            tokio::select! {
                _ = token.cancelled() => break,
                _ = ticker.tick() => {
                    let hour = chrono::Local::now().hour();
                    if !self.in_balance_window(hour) {
                        continue;
                    }
                    match self.balance_round(&token).await {
                        Ok(0) => {}
                        Ok(moved) => tracing::info!("rebalance moved {} replicas", moved),
                        Err(e) => log_failure(format_args!("rebalance round failed"), &e),
                    }
                }
            }
        }
        tracing::info!("rebalance loop quit");
    }

    /// One rebalance round: move up to `max_balance_moves` replicas from the
    /// most loaded node to the least loaded one.
    pub async fn balance_round(&self, token: &CancellationToken) -> Result<usize> {
        if self.membership.is_unstable() || self.membership.is_upgrading() {
            tracing::debug!("skip rebalance: cluster unstable or upgrading");
            return Ok(0);
        }
        let Some(_busy) = FlagGuard::try_acquire(&self.balancing) else {
            return Ok(0);
        };
        let (nodes, epoch) = self.membership.current_nodes_with_epoch(&BTreeSet::new());
        if nodes.len() < 2 {
            return Ok(0);
        }
        let (mut all, _) = self.register.get_all_namespaces().await?;
        self.refresh_load(&all);

        let mut moved = 0;
        while moved < self.config.max_balance_moves {
            if token.is_cancelled() {
                return Err(Error::Stopped);
            }
            if self.membership.epoch() != epoch {
                tracing::info!("nodes changed while balancing, stop this round");
                break;
            }
            let Some(mv) = plan_balance_move(&all, &nodes) else {
                break;
            };
            let Some(part) = all
                .get_mut(&mv.name)
                .and_then(|parts| parts.iter_mut().find(|p| p.partition == mv.partition))
            else {
                break;
            };
            let Some(target) = nodes.get(&mv.to) else {
                break;
            };
            tracing::info!(
                "rebalance partition {}: move replica from {} to {}",
                part.desc(),
                mv.from,
                mv.to
            );
            self.add_replica(part, &target.id).await?;
            self.wait_replica_ready(token, target, part).await?;
            if self.membership.epoch() != epoch {
                // keep the extra replica, the checker trims it once stable
                tracing::info!("nodes changed while moving {}, keep both replicas", part.desc());
                break;
            }
            self.remove_replica(part, &mv.from).await?;
            self.metrics.balance_moves.inc();
            moved += 1;
        }
        Ok(moved)
    }
}

/// Plan one move from the most loaded live node to the least loaded one,
/// only when they differ by more than one replica. The partition must be
/// fully healthy and the target must carry its tags.
pub fn plan_balance_move(all: &NamespaceMap, nodes: &NodeMap) -> Option<BalanceMove> {
    let mut counts: BTreeMap<&str, usize> = nodes.keys().map(|id| (id.as_str(), 0)).collect();
    for part in all.values().flatten() {
        for node in part.raft_nodes() {
            if let Some(count) = counts.get_mut(node.as_str()) {
                *count += 1;
            }
        }
    }
    let (most, most_count) = counts.iter().max_by_key(|(_, c)| **c)?;
    let (least, least_count) = counts.iter().min_by_key(|(_, c)| **c)?;
    if *most_count <= *least_count + 1 {
        return None;
    }
    let target = nodes.get(*least)?;

    all.values()
        .flatten()
        .find(|part| {
            part.replica_info.contains(most)
                && !part.replica_info.contains(least)
                && part.raft_nodes().len() == part.replica
                && part.alive_count(nodes) == part.raft_nodes().len()
                && target.has_tags(&part.tags)
        })
        .map(|part| BalanceMove {
            name: part.name.clone(),
            partition: part.partition,
            from: most.to_string(),
            to: least.to_string(),
        })
}
