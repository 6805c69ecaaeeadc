//! Replica readiness probe
//!
//! Asks a data node whether a freshly added replica has caught up with the
//! rest of its replica set.

use crate::common::{Error, Result};
use crate::coordinator::metadata::{NodeInfo, PartitionMetaInfo};
use async_trait::async_trait;
use parking_lot::Mutex;
use std::collections::HashMap;

#[async_trait]
pub trait ReplicaProbe: Send + Sync {
    async fn is_replica_ready(&self, node: &NodeInfo, partition: &PartitionMetaInfo) -> Result<bool>;
}

#[derive(Debug, Clone, Copy)]
enum Answer {
    Ready(bool),
    Unreachable,
    Rejected,
}

/// In-process probe: every replica is ready unless overridden per node.
#[derive(Default)]
pub struct MemoryProbe {
    overrides: Mutex<HashMap<String, Answer>>,
    calls: Mutex<usize>,
}

impl MemoryProbe {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set_ready(&self, node_id: &str, ready: bool) {
        self.overrides.lock().insert(node_id.to_string(), Answer::Ready(ready));
    }

    /// Answer with a register error, which callers keep polling through.
    pub fn set_unreachable(&self, node_id: &str) {
        self.overrides.lock().insert(node_id.to_string(), Answer::Unreachable);
    }

    /// Answer that the node does not host the replica at all.
    pub fn set_rejected(&self, node_id: &str) {
        self.overrides.lock().insert(node_id.to_string(), Answer::Rejected);
    }

    /// Number of probes answered so far.
    pub fn calls(&self) -> usize {
        *self.calls.lock()
    }
}

#[async_trait]
impl ReplicaProbe for MemoryProbe {
    async fn is_replica_ready(&self, node: &NodeInfo, partition: &PartitionMetaInfo) -> Result<bool> {
        *self.calls.lock() += 1;
        let answer = self.overrides.lock().get(&node.id).copied();
        match answer {
            None => Ok(true),
            Some(Answer::Ready(ready)) => Ok(ready),
            Some(Answer::Unreachable) => Err(Error::Register(format!("node {} unreachable", node.id))),
            Some(Answer::Rejected) => Err(Error::NamespaceNodeConflict(partition.desc())),
        }
    }
}
