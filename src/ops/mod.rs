//! Operational commands

pub mod verify;

pub use verify::{verify_cluster, VerifyReport};
