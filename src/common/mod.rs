//! Common utilities and types shared across minikv-pd

pub mod config;
pub mod error;
pub mod metrics;
pub mod utils;

pub use config::{Config, PlacementConfig};
pub use error::{Error, ErrorKind, Result};
pub use metrics::PlacementMetrics;
pub use utils::{failure_level, log_failure, parse_duration, partition_desc, FlagGuard};
