//! Node removal lifecycle
//!
//! Drains nodes marked as removing. For every partition a draining node
//! holds, a replacement is added and waited on when the partition would
//! otherwise drop to or below its replication factor, then the draining node
//! is dropped from the replica list. Per node state moves
//! marked -> pending -> data_transferred -> done, and the record is deleted
//! once the node is done and gone from the live set.

use crate::common::log_failure;
use crate::coordinator::metadata::{PartitionMetaInfo, RemovalState};
use crate::coordinator::server::CoordinatorCore;
use std::collections::{BTreeSet, HashMap};
use std::sync::Arc;
use tokio::time::{interval_at, MissedTickBehavior};
use tokio_util::sync::CancellationToken;

impl CoordinatorCore {
    /// Removal loop for one leadership term.
    pub(crate) async fn handle_removing_nodes(self: Arc<Self>, token: CancellationToken) {
        let period = self.config.removal_check_interval();
        let mut ticker = interval_at(tokio::time::Instant::now() + period, period);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        tracing::info!("start handle the removing nodes.");

        loop {
            tokio::select! {
                _ = token.cancelled() => break,
                _ = ticker.tick() => {
                    self.removal_pass(&token).await;
                }
            }
        }
        tracing::info!("stop handle the removing nodes.");
    }

    /// One pass over every draining node. Returns the state changes applied.
    pub(crate) async fn removal_pass(
        &self,
        token: &CancellationToken,
    ) -> HashMap<String, Option<RemovalState>> {
        let mut progress = HashMap::new();
        let removing = self.membership.removing_nodes();
        if removing.is_empty() {
            return progress;
        }

        let all = match self.register.get_all_namespaces().await {
            Ok((all, _)) => all,
            Err(e) => {
                log_failure(format_args!("get namespaces failed while removing nodes"), &e);
                return progress;
            }
        };
        self.placement.refresh_load(&all);
        let mut partitions: Vec<PartitionMetaInfo> = all.into_values().flatten().collect();
        let (all_live, _) = self.membership.all_nodes_with_epoch();
        let candidates = self.membership.current_nodes(&BTreeSet::new());

        let mut node_ids: Vec<&String> = removing.keys().collect();
        node_ids.sort();
        for node_id in node_ids {
            let start = removing[node_id];
            let mut state = start;
            let mut any_pending = false;
            tracing::info!("handle the removing node {}, state: {}", node_id, state);

            for part in partitions
                .iter_mut()
                .filter(|p| p.replica_info.contains(node_id))
            {
                if token.is_cancelled() {
                    return progress;
                }
                let desc = part.desc();
                if part.alive_count(&all_live) <= part.replica {
                    any_pending = true;
                    if state < RemovalState::Pending {
                        state = RemovalState::Pending;
                    }
                    match self
                        .placement
                        .add_replica_and_wait_ready(token, part, &candidates)
                        .await
                    {
                        Ok(new_node) => tracing::info!(
                            "namespace {} data on node {} transferred to {}",
                            desc,
                            node_id,
                            new_node
                        ),
                        Err(e) => {
                            log_failure(
                                format_args!(
                                    "namespace {} data on node {} transfer failed, waiting next time",
                                    desc, node_id
                                ),
                                &e,
                            );
                            continue;
                        }
                    }
                }
                match self.placement.remove_replica(part, node_id).await {
                    Ok(()) => tracing::info!("node {} removed from namespace {}", node_id, desc),
                    Err(e) => log_failure(
                        format_args!("remove node {} from namespace {} failed", node_id, desc),
                        &e,
                    ),
                }
            }

            let next = if any_pending {
                Some(state)
            } else {
                match state {
                    RemovalState::Marked | RemovalState::Pending => Some(RemovalState::DataTransferred),
                    RemovalState::DataTransferred => Some(RemovalState::Done),
                    RemovalState::Done if all_live.contains_key(node_id) => Some(RemovalState::Done),
                    RemovalState::Done => {
                        tracing::info!("the node {} is removed finally since not alive in cluster", node_id);
                        None
                    }
                }
            };
            if next != Some(start) {
                progress.insert(node_id.clone(), next);
            }
        }

        if !progress.is_empty() {
            self.membership.apply_removal_progress(progress.clone());
            self.metrics
                .removing_nodes
                .set(self.membership.removing_nodes().len() as u64);
        }
        progress
    }
}
