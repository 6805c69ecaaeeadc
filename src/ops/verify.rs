//! Verify placement integrity

use crate::common::Result;
use crate::coordinator::membership::ClusterMembership;
use crate::coordinator::register::Register;
use serde::Serialize;

/// Read-only placement report over every partition.
#[derive(Debug, Default, Clone, PartialEq, Eq, Serialize)]
pub struct VerifyReport {
    pub total_partitions: usize,
    pub healthy: usize,
    pub under_replicated: usize,
    pub over_replicated: usize,
    /// Replica entries pointing at nodes that are not live
    pub lost_replicas: usize,
    /// Partitions with a replica on a draining node
    pub on_removing_nodes: usize,
    pub membership_epoch: u64,
    /// Descriptors of every partition that is not healthy
    pub unhealthy: Vec<String>,
}

impl VerifyReport {
    pub fn is_healthy(&self) -> bool {
        self.healthy == self.total_partitions
    }
}

pub async fn verify_cluster(register: &dyn Register, membership: &ClusterMembership) -> Result<VerifyReport> {
    tracing::info!("Starting placement verification");

    let (all, _) = register.get_all_namespaces().await?;
    let (live, epoch) = membership.all_nodes_with_epoch();
    let removing = membership.removing_nodes();

    let mut report = VerifyReport {
        membership_epoch: epoch,
        ..Default::default()
    };
    for part in all.values().flatten() {
        report.total_partitions += 1;
        let alive = part.alive_count(&live);
        let lost = part.raft_nodes().len() - alive;
        report.lost_replicas += lost;
        if part.raft_nodes().iter().any(|n| removing.contains_key(n)) {
            report.on_removing_nodes += 1;
        }

        if alive < part.replica {
            report.under_replicated += 1;
        } else if part.raft_nodes().len() > part.replica {
            report.over_replicated += 1;
        }
        if lost == 0 && part.raft_nodes().len() == part.replica {
            report.healthy += 1;
        } else {
            report.unhealthy.push(part.desc());
        }
    }

    tracing::info!(
        "verification done: {} partitions, {} healthy, {} under replicated, {} over replicated",
        report.total_partitions,
        report.healthy,
        report.under_replicated,
        report.over_replicated
    );
    Ok(report)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::coordinator::metadata::{NodeInfo, PartitionMetaInfo};
    use crate::coordinator::register::MemoryRegister;

    #[tokio::test]
    async fn test_verify_report() {
        let register = MemoryRegister::new();
        register.create_partition(PartitionMetaInfo::new("ns0", 0, 3, &["A", "B", "C"]));
        register.create_partition(PartitionMetaInfo::new("ns0", 1, 3, &["A", "B", "D"]));
        register.create_partition(PartitionMetaInfo::new("ns0", 2, 2, &["A", "B", "C"]));
        register.create_partition(PartitionMetaInfo::new("ns1", 0, 3, &["A", "B"]));

        let membership = ClusterMembership::new();
        membership.apply_live_nodes(vec![
            NodeInfo::new("A", "a"),
            NodeInfo::new("B", "b"),
            NodeInfo::new("C", "c"),
        ]);
        membership.mark_removing("C").unwrap();

        let report = verify_cluster(&register, &membership).await.unwrap();
        assert_eq!(report.total_partitions, 4);
        assert_eq!(report.healthy, 1);
        // ns0-1 lost D, ns1-0 is short one seat
        assert_eq!(report.under_replicated, 2);
        assert_eq!(report.over_replicated, 1);
        assert_eq!(report.lost_replicas, 1);
        assert_eq!(report.on_removing_nodes, 2);
        assert_eq!(report.membership_epoch, 1);
        assert_eq!(report.unhealthy, vec!["ns0-1", "ns0-2", "ns1-0"]);
        assert!(!report.is_healthy());
    }

    #[tokio::test]
    async fn test_verify_fails_on_read_error() {
        let register = MemoryRegister::new();
        register.fail_reads(true);
        let membership = ClusterMembership::new();
        assert!(verify_cluster(&register, &membership).await.is_err());
    }
}
