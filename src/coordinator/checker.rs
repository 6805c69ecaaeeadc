//! Namespace health checker
//!
//! Scans partitions on a periodic tick and on demand, decides which ones need
//! a migration and how long they have been waiting for it, and evicts the
//! surplus replica of over-replicated partitions.
//!
//! At most one pass runs at a time; a trigger that finds a pass in progress
//! is skipped, not queued. A pass aborts as soon as the membership epoch it
//! started with is no longer current.

use crate::common::utils::{log_failure, partition_desc, FlagGuard};
use crate::coordinator::metadata::{NamespaceNameInfo, PartitionMetaInfo};
use crate::coordinator::server::CoordinatorCore;
use rand::Rng;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::time::{interval_at, MissedTickBehavior};
use tokio_util::sync::CancellationToken;

/// First time each unhealthy partition was seen, keyed by name and partition.
#[derive(Debug, Default)]
pub struct PendingMigrations {
    first_seen: HashMap<String, HashMap<i32, Instant>>,
}

impl PendingMigrations {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn first_seen(&self, name: &str, partition: i32) -> Option<Instant> {
        self.first_seen.get(name)?.get(&partition).copied()
    }

    pub fn record(&mut self, name: &str, partition: i32, at: Instant) {
        self.first_seen
            .entry(name.to_string())
            .or_default()
            .insert(partition, at);
    }

    pub fn clear(&mut self, name: &str, partition: i32) {
        if let Some(parts) = self.first_seen.get_mut(name) {
            parts.remove(&partition);
            if parts.is_empty() {
                self.first_seen.remove(name);
            }
        }
    }

    /// Push every recorded timer forward by `delay`.
    pub fn delay_all(&mut self, delay: Duration) {
        for at in self.first_seen.values_mut().flat_map(|p| p.values_mut()) {
            *at += delay;
        }
    }

    pub fn len(&self) -> usize {
        self.first_seen.values().map(HashMap::len).sum()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AbortReason {
    /// Membership changed while the pass was running
    StaleMembership,
    /// The leadership term (or the process) is shutting down
    Stopped,
    /// Namespace listing failed
    ListFailed,
}

/// What one check pass did.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CheckOutcome {
    /// Another pass was running
    Skipped,
    Aborted(AbortReason),
    /// One partition was migrated and the pass ended there
    Migrated { name: String, partition: i32 },
    Finished { healthy: bool },
}

impl CoordinatorCore {
    /// Check loop for one leadership term.
    pub(crate) async fn check_namespaces(self: Arc<Self>, token: CancellationToken) {
        let mut check_rx = tokio::select! {
            _ = token.cancelled() => return,
            rx = self.check_rx.lock() => rx,
        };
        let period = self.config.check_interval();
        let mut ticker = interval_at(tokio::time::Instant::now() + period, period);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        let mut pending = PendingMigrations::new();

        loop {
            tokio::select! {
                _ = token.cancelled() => break,
                _ = ticker.tick() => {
                    self.do_check_namespaces(&token, None, &mut pending).await;
                }
                req = check_rx.recv() => match req {
                    Some(target) => {
                        self.do_check_namespaces(&token, Some(target), &mut pending).await;
                    }
                    None => break,
                },
            }
        }
        tracing::info!("check namespaces quit.");
    }

    /// Run one check pass unless another one is already running.
    pub(crate) async fn do_check_namespaces(
        &self,
        token: &CancellationToken,
        target: Option<NamespaceNameInfo>,
        pending: &mut PendingMigrations,
    ) -> CheckOutcome {
        let Some(_checking) = FlagGuard::try_acquire(&self.doing_check) else {
            self.metrics.check_passes_skipped.inc();
            return CheckOutcome::Skipped;
        };
        tokio::select! {
            _ = token.cancelled() => return CheckOutcome::Aborted(AbortReason::Stopped),
            _ = tokio::time::sleep(self.config.check_settle_delay()) => {}
        }

        let started = Instant::now();
        let outcome = self.check_pass(token, target, pending).await;
        if outcome == CheckOutcome::Aborted(AbortReason::StaleMembership) {
            self.metrics.check_passes_stale.inc();
        }
        self.metrics.record_check_pass(started.elapsed());
        outcome
    }

    async fn list_partitions(&self, target: Option<NamespaceNameInfo>) -> Option<(Vec<PartitionMetaInfo>, bool)> {
        match target {
            Some(t) if !t.is_full_check() => {
                match self.register.get_namespace_partition(&t.name, t.partition).await {
                    Ok(part) => Some((vec![part], false)),
                    Err(e) => {
                        log_failure(
                            format_args!("get namespace {} info failed", partition_desc(&t.name, t.partition)),
                            &e,
                        );
                        None
                    }
                }
            }
            _ => match self.register.get_all_namespaces().await {
                Ok((all, _)) => {
                    self.placement.refresh_load(&all);
                    Some((all.into_values().flatten().collect(), true))
                }
                Err(e) => {
                    log_failure(format_args!("scan namespaces failed"), &e);
                    None
                }
            },
        }
    }

    async fn check_pass(
        &self,
        token: &CancellationToken,
        target: Option<NamespaceNameInfo>,
        pending: &mut PendingMigrations,
    ) -> CheckOutcome {
        let (current_nodes, epoch) = self.membership.all_nodes_with_epoch();
        let Some((partitions, full_check)) = self.list_partitions(target).await else {
            return CheckOutcome::Aborted(AbortReason::ListFailed);
        };
        tracing::info!(
            "do check namespaces ({}), current nodes: {}, epoch: {}",
            partitions.len(),
            current_nodes.len(),
            epoch
        );

        let mut check_ok = true;
        for part in partitions {
            if token.is_cancelled() {
                return CheckOutcome::Aborted(AbortReason::Stopped);
            }
            if epoch != self.membership.epoch() {
                tracing::info!(
                    "nodes changed while checking namespaces: {} - {}",
                    epoch,
                    self.membership.epoch()
                );
                return CheckOutcome::Aborted(AbortReason::StaleMembership);
            }

            let desc = part.desc();
            let mut need_migrate = false;
            if part.raft_nodes().len() < part.replica {
                tracing::info!(
                    "replicas is not enough for namespace {}, current: {:?}",
                    desc,
                    part.raft_nodes()
                );
                need_migrate = true;
            }
            let mut alive_count = 0;
            for replica in part.raft_nodes() {
                if current_nodes.contains_key(replica) {
                    alive_count += 1;
                } else {
                    tracing::warn!("namespace {} replica node {} is lost", desc, replica);
                    need_migrate = true;
                }
            }
            if need_migrate {
                check_ok = false;
                self.membership.set_unstable(true);
            }
            if epoch != self.membership.epoch() {
                self.membership.set_unstable(true);
                return CheckOutcome::Aborted(AbortReason::StaleMembership);
            }

            if need_migrate {
                let Some(first_seen) = pending.first_seen(&part.name, part.partition) else {
                    tracing::info!("namespace {} first seen unhealthy, waiting", desc);
                    pending.record(&part.name, part.partition, Instant::now());
                    continue;
                };
                if self.membership.is_upgrading() {
                    tracing::info!("wait checking namespaces since the cluster is upgrading");
                    continue;
                }

                let waited = Instant::now().saturating_duration_since(first_seen);
                let emergency =
                    alive_count <= part.replica / 2 && waited >= self.config.emergency_migrate_wait();
                if !emergency && waited < self.config.migrate_wait() {
                    tracing::info!("waiting migrate the namespace {} since {:?}", desc, waited);
                    continue;
                }

                let (alive_nodes, alive_epoch) = self.membership.current_nodes_with_epoch(&part.tags);
                if alive_epoch != epoch {
                    tracing::info!("nodes changed while checking {}, check again later", desc);
                    self.trigger_check_namespaces(
                        NamespaceNameInfo::new(part.name.clone(), part.partition),
                        self.jittered_retrigger_delay(),
                    );
                    continue;
                }

                tracing::info!("begin migrate the namespace: {} (emergency: {})", desc, emergency);
                if let Err(e) = self.handle_namespace_migrate(&part, &alive_nodes, alive_epoch).await {
                    log_failure(format_args!("migrate namespace {} failed", desc), &e);
                }
                pending.clear(&part.name, part.partition);
                pending.delay_all(self.config.migrate_spread_delay());
                self.membership.set_unstable(true);
                return CheckOutcome::Migrated {
                    name: part.name,
                    partition: part.partition,
                };
            }

            pending.clear(&part.name, part.partition);
            if alive_count > part.replica && !self.placement.is_balancing() {
                tracing::info!(
                    "namespace {} replicas {:?} is more than replicator: {} > {}",
                    desc,
                    part.raft_nodes(),
                    alive_count,
                    part.replica
                );
                let Some(victim) = self.placement.choose_eviction_target(&part, &current_nodes) else {
                    continue;
                };
                let mut part = part;
                match self.placement.remove_replica(&mut part, &victim).await {
                    Ok(()) => {
                        self.metrics.evictions.inc();
                        tracing::info!("node {} removed by plan from namespace {}", victim, desc);
                    }
                    Err(e) => log_failure(format_args!("remove {} from namespace {} failed", victim, desc), &e),
                }
            }
        }

        if !check_ok {
            self.membership.set_unstable(true);
        } else if full_check {
            self.membership.set_unstable(false);
        }
        CheckOutcome::Finished { healthy: check_ok }
    }

    fn jittered_retrigger_delay(&self) -> Duration {
        let base = self.config.retrigger_delay();
        let spread = (base.as_millis() as u64 / 2).max(1);
        base + Duration::from_millis(rand::thread_rng().gen_range(0..spread))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_pending_migrations_bookkeeping() {
        let mut pending = PendingMigrations::new();
        let now = Instant::now();
        pending.record("ns0", 0, now);
        pending.record("ns0", 1, now);
        pending.record("ns1", 0, now);
        assert_eq!(pending.len(), 3);

        pending.clear("ns0", 0);
        assert!(pending.first_seen("ns0", 0).is_none());
        pending.delay_all(Duration::from_secs(10));
        assert_eq!(pending.first_seen("ns0", 1), Some(now + Duration::from_secs(10)));
        assert_eq!(pending.first_seen("ns1", 0), Some(now + Duration::from_secs(10)));

        pending.clear("ns0", 1);
        pending.clear("ns1", 0);
        assert!(pending.is_empty());
        // clearing twice is harmless
        pending.clear("ns1", 0);
    }
}
