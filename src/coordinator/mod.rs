//! Placement coordinator
//!
//! The coordinator is responsible for:
//! - Leadership (only the leader runs the control loops)
//! - Live data node tracking with a membership epoch
//! - Partition health checks and replica migration
//! - Draining nodes marked for removal
//! - Background replica rebalancing

mod checker;
pub mod membership;
pub mod metadata;
mod migration;
pub mod placement;
pub mod probe;
pub mod register;
mod removal;
pub mod server;

pub use checker::{AbortReason, CheckOutcome, PendingMigrations};
pub use membership::{ClusterMembership, MembershipChange, NodeMap};
pub use metadata::{NamespaceNameInfo, NodeInfo, PartitionMetaInfo, PartitionReplicaInfo, RemovalState};
pub use placement::{plan_balance_move, BalanceMove, DataPlacement};
pub use probe::{MemoryProbe, ReplicaProbe};
pub use register::{ClusterSeed, MemoryRegister, NamespaceMap, Register};
pub use server::Coordinator;
