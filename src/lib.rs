//! # minikv-pd
//!
//! Placement driver for a replicated key-value store:
//! - Leader election through a pluggable metadata register
//! - Live data node tracking with a membership epoch as staleness token
//! - Partition health checks with deferred, spread-out migrations
//! - Node drain lifecycle and background replica rebalancing
//!
//! ## Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────┐
//! │        Metadata register                │
//! │   - leader key, data node list          │
//! │   - partition replica lists (CAS)       │
//! └───────────┬─────────────────────────────┘
//!             │ watches / compare-and-swap
//!   ┌─────────┴──────────┬──────────────┐
//!   │                    │              │
//! ┌─▼──────────┐   ┌─────▼──────┐   ┌───▼────────┐
//! │ PD 1       │   │ PD 2       │   │ PD 3       │
//! │ (leader)   │   │ (follower) │   │ (follower) │
//! │ checker    │   │            │   │            │
//! │ removal    │   │            │   │            │
//! │ rebalance  │   │            │   │            │
//! └────────────┘   └────────────┘   └────────────┘
//! ```
//!
//! ## Usage
//!
//! ### Start a placement driver against a seeded in-memory register
//! ```bash
//! minikv-pd serve --id pd-1 --addr 0.0.0.0:5000 --seed ./demos/cluster.json
//! ```
//!
//! ### Report placement health
//! ```bash
//! minikv-pd verify --seed ./demos/cluster.json
//! ```

pub mod common;
pub mod coordinator;
pub mod ops;

// Re-export commonly used types
pub use common::{Config, Error, Result};
pub use coordinator::Coordinator;

/// Current version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

/// Build info
pub const BUILD_INFO: &str = concat!(env!("CARGO_PKG_VERSION"), " (", env!("CARGO_PKG_NAME"), ")");
