//! Partition migration
//!
//! Replaces lost replicas of one partition: allocates hosts for the missing
//! seats, trims lost replicas once the list is over capacity and persists the
//! result with a compare-and-swap on the partition version.

use crate::common::Result;
use crate::coordinator::membership::NodeMap;
use crate::coordinator::metadata::PartitionMetaInfo;
use crate::coordinator::server::CoordinatorCore;

impl CoordinatorCore {
    /// Migrate `part` onto `alive_nodes`. Returns `Ok(false)` when nothing
    /// was written.
    pub(crate) async fn handle_namespace_migrate(
        &self,
        part: &PartitionMetaInfo,
        alive_nodes: &NodeMap,
        alive_epoch: u64,
    ) -> Result<bool> {
        let desc = part.desc();
        if alive_epoch != self.membership.epoch() {
            tracing::info!("nodes changed before migrating namespace {}", desc);
            return Ok(false);
        }

        let mut updated = part.clone();
        let mut failed = Vec::new();
        let mut alive_replicas = 0;
        for replica in part.raft_nodes() {
            if alive_nodes.contains_key(replica) {
                alive_replicas += 1;
            } else {
                failed.push(replica.clone());
            }
        }

        let mut changed = false;
        for _ in alive_replicas..part.replica {
            match self.placement.allocate(&updated, alive_nodes) {
                Ok(node) => {
                    let slot = updated.replica_info.push_replica(&node.id);
                    tracing::info!("namespace {} new replica {} (slot {})", desc, node.id, slot);
                    changed = true;
                }
                Err(e) => {
                    tracing::info!("failed to get a new replica node for namespace {}: {}", desc, e);
                    break;
                }
            }
        }

        let seats = updated.raft_nodes().len();
        if seats > updated.replica {
            let trim: Vec<String> = failed
                .into_iter()
                .take(seats - updated.replica)
                .collect();
            for node_id in &trim {
                updated.replica_info.remove_replica(node_id);
                changed = true;
            }
            if !trim.is_empty() {
                tracing::info!("namespace {} removed failed replicas {:?}", desc, trim);
            }
        }

        if !changed {
            return Ok(false);
        }
        self.placement.check_conflict(&updated)?;
        if alive_epoch != self.membership.epoch() {
            tracing::info!("nodes changed while migrating namespace {}", desc);
            return Ok(false);
        }

        self.placement.persist(&mut updated, part.epoch()).await?;
        self.metrics.migrations.inc();
        tracing::info!(
            "namespace {} migrated, replicas: {:?}, version: {}",
            desc,
            updated.raft_nodes(),
            updated.epoch()
        );
        Ok(true)
    }
}
