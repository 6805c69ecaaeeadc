//! Configuration for the placement driver

use serde::{Deserialize, Serialize};
use std::path::Path;
use std::time::Duration;

/// Global configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    /// Node ID of this coordinator (unique identifier)
    #[serde(default = "default_node_id")]
    pub node_id: String,

    /// Cluster the register client is bound to at startup
    #[serde(default = "default_cluster_key")]
    pub cluster_key: String,

    /// Logging level
    #[serde(default = "default_log_level")]
    pub log_level: String,

    /// Placement tuning
    #[serde(default)]
    pub placement: PlacementConfig,
}

fn default_node_id() -> String {
    "pd-1".to_string()
}
fn default_cluster_key() -> String {
    "minikv".to_string()
}
fn default_log_level() -> String {
    "info".to_string()
}

impl Default for Config {
    fn default() -> Self {
        Self {
            node_id: default_node_id(),
            cluster_key: default_cluster_key(),
            log_level: default_log_level(),
            placement: PlacementConfig::default(),
        }
    }
}

impl Config {
    /// Load configuration from an optional TOML file, then from
    /// `MINIKV_PD__*` environment variables (environment wins).
    pub fn load(path: Option<&Path>) -> crate::Result<Self> {
        let mut builder = config::Config::builder();
        if let Some(path) = path {
            builder = builder.add_source(config::File::from(path).required(false));
        }
        let config: Config = builder
            .add_source(config::Environment::with_prefix("MINIKV_PD").separator("__"))
            .build()?
            .try_deserialize()?;
        if config.cluster_key.is_empty() {
            return Err(crate::Error::InvalidConfig("cluster_key must not be empty".into()));
        }
        config.placement.validate()?;
        Ok(config)
    }
}

/// Placement driver tuning. Wait thresholds are deployment policy.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PlacementConfig {
    /// Full namespace scan interval
    #[serde(default = "default_check_interval")]
    pub check_interval_ms: u64,

    /// Removal lifecycle tick
    #[serde(default = "default_removal_check_interval")]
    pub removal_check_interval_ms: u64,

    /// Rebalance loop tick
    #[serde(default = "default_balance_interval")]
    pub balance_interval_ms: u64,

    /// How long a partition stays unhealthy before a normal migration
    #[serde(default = "default_migrate_wait")]
    pub migrate_wait_ms: u64,

    /// How long a partition that lost half its replicas waits
    #[serde(default = "default_emergency_migrate_wait")]
    pub emergency_migrate_wait_ms: u64,

    /// Added to every other pending timer after a migration
    #[serde(default = "default_migrate_spread_delay")]
    pub migrate_spread_delay_ms: u64,

    /// Pause at the start of a check pass to absorb trigger bursts
    #[serde(default = "default_check_settle_delay")]
    pub check_settle_delay_ms: u64,

    /// Delay before the check triggered by a membership change
    #[serde(default = "default_join_check_delay")]
    pub join_check_delay_ms: u64,

    /// Delay before re-checking a single partition seen with a stale view
    #[serde(default = "default_retrigger_delay")]
    pub retrigger_delay_ms: u64,

    /// Depth of the on-demand check queue
    #[serde(default = "default_check_queue_depth")]
    pub check_queue_depth: usize,

    /// How long a check request waits for queue room before being dropped
    #[serde(default = "default_check_enqueue_timeout")]
    pub check_enqueue_timeout_ms: u64,

    /// Poll interval while waiting for a new replica to catch up
    #[serde(default = "default_ready_poll_interval")]
    pub ready_poll_interval_ms: u64,

    /// Upper bound on waiting for a new replica to catch up
    #[serde(default = "default_ready_wait_timeout")]
    pub ready_wait_timeout_ms: u64,

    /// Balance window start hour (local time, inclusive)
    #[serde(default = "default_balance_start_hour")]
    pub balance_start_hour: u32,

    /// Balance window end hour (local time, exclusive)
    #[serde(default = "default_balance_end_hour")]
    pub balance_end_hour: u32,

    /// Replica moves per rebalance round
    #[serde(default = "default_max_balance_moves")]
    pub max_balance_moves: usize,
}

fn default_check_interval() -> u64 {
    30_000
}
fn default_removal_check_interval() -> u64 {
    30_000
}
fn default_balance_interval() -> u64 {
    60_000
}
fn default_migrate_wait() -> u64 {
    180_000
}
fn default_emergency_migrate_wait() -> u64 {
    30_000
}
fn default_migrate_spread_delay() -> u64 {
    10_000
}
fn default_check_settle_delay() -> u64 {
    10
}
fn default_join_check_delay() -> u64 {
    10
}
fn default_retrigger_delay() -> u64 {
    1_000
}
fn default_check_queue_depth() -> usize {
    3
}
fn default_check_enqueue_timeout() -> u64 {
    1_000
}
fn default_ready_poll_interval() -> u64 {
    500
}
fn default_ready_wait_timeout() -> u64 {
    600_000
}
fn default_balance_start_hour() -> u32 {
    2
}
fn default_balance_end_hour() -> u32 {
    4
}
fn default_max_balance_moves() -> usize {
    1
}

impl Default for PlacementConfig {
    fn default() -> Self {
        Self {
            check_interval_ms: default_check_interval(),
            removal_check_interval_ms: default_removal_check_interval(),
            balance_interval_ms: default_balance_interval(),
            migrate_wait_ms: default_migrate_wait(),
            emergency_migrate_wait_ms: default_emergency_migrate_wait(),
            migrate_spread_delay_ms: default_migrate_spread_delay(),
            check_settle_delay_ms: default_check_settle_delay(),
            join_check_delay_ms: default_join_check_delay(),
            retrigger_delay_ms: default_retrigger_delay(),
            check_queue_depth: default_check_queue_depth(),
            check_enqueue_timeout_ms: default_check_enqueue_timeout(),
            ready_poll_interval_ms: default_ready_poll_interval(),
            ready_wait_timeout_ms: default_ready_wait_timeout(),
            balance_start_hour: default_balance_start_hour(),
            balance_end_hour: default_balance_end_hour(),
            max_balance_moves: default_max_balance_moves(),
        }
    }
}

impl PlacementConfig {
    /// Reject values the control loops cannot run with.
    pub fn validate(&self) -> crate::Result<()> {
        let intervals = [
            ("check_interval_ms", self.check_interval_ms),
            ("removal_check_interval_ms", self.removal_check_interval_ms),
            ("balance_interval_ms", self.balance_interval_ms),
            ("ready_poll_interval_ms", self.ready_poll_interval_ms),
        ];
        for (name, value) in intervals {
            if value == 0 {
                return Err(crate::Error::InvalidConfig(format!("{} must be > 0", name)));
            }
        }
        if self.check_queue_depth == 0 {
            return Err(crate::Error::InvalidConfig(
                "check_queue_depth must be > 0".into(),
            ));
        }
        if self.balance_start_hour > 23 || self.balance_end_hour > 23 {
            return Err(crate::Error::InvalidConfig(format!(
                "balance window hours out of range: {}-{}",
                self.balance_start_hour, self.balance_end_hour
            )));
        }
        Ok(())
    }

    pub fn check_interval(&self) -> Duration {
        Duration::from_millis(self.check_interval_ms)
    }

    pub fn removal_check_interval(&self) -> Duration {
        Duration::from_millis(self.removal_check_interval_ms)
    }

    pub fn balance_interval(&self) -> Duration {
        Duration::from_millis(self.balance_interval_ms)
    }

    pub fn migrate_wait(&self) -> Duration {
        Duration::from_millis(self.migrate_wait_ms)
    }

    pub fn emergency_migrate_wait(&self) -> Duration {
        Duration::from_millis(self.emergency_migrate_wait_ms)
    }

    pub fn migrate_spread_delay(&self) -> Duration {
        Duration::from_millis(self.migrate_spread_delay_ms)
    }

    pub fn check_settle_delay(&self) -> Duration {
        Duration::from_millis(self.check_settle_delay_ms)
    }

    pub fn join_check_delay(&self) -> Duration {
        Duration::from_millis(self.join_check_delay_ms)
    }

    pub fn retrigger_delay(&self) -> Duration {
        Duration::from_millis(self.retrigger_delay_ms)
    }

    pub fn check_enqueue_timeout(&self) -> Duration {
        Duration::from_millis(self.check_enqueue_timeout_ms)
    }

    pub fn ready_poll_interval(&self) -> Duration {
        Duration::from_millis(self.ready_poll_interval_ms)
    }

    pub fn ready_wait_timeout(&self) -> Duration {
        Duration::from_millis(self.ready_wait_timeout_ms)
    }
}
