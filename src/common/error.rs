//! Error types for minikv-pd

use thiserror::Error;

pub type Result<T> = std::result::Result<T, Error>;

/// Coarse classification used to decide how a failure propagates.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    /// Retried on the next timer tick, never surfaced as fatal.
    Transient,
    /// A single mutation was rejected; the plan is re-derived next pass.
    Conflict,
    /// The register call itself failed.
    Store,
    /// Startup cannot continue.
    Fatal,
}

#[derive(Error, Debug)]
pub enum Error {
    // === Leadership Errors ===
    #[error("Not leader: current leader is {0}")]
    NotLeader(String),

    // === Membership Errors ===
    #[error("Node not found: {0}")]
    NodeNotFound(String),

    #[error("No node is available for namespace {0}")]
    NodeUnavailable(String),

    #[error("Node {0} is marked as removing")]
    NodeRemoving(String),

    #[error("Already exists: {0}")]
    AlreadyExists(String),

    // === Placement Errors ===
    #[error("Replicas of {0} are already enough")]
    ReplicaEnough(String),

    #[error("Replica nodes of {0} are not enough")]
    ReplicaNotEnough(String),

    #[error("Replica node list of {0} is conflicted")]
    NamespaceNodeConflict(String),

    #[error("Node {node} does not carry the tags required by {partition}")]
    TagsMismatch { node: String, partition: String },

    #[error("Partition not found: {name}-{partition}")]
    PartitionNotFound { name: String, partition: i32 },

    // === Register Errors ===
    #[error("Version conflict on {name}-{partition}: expected {expected}, found {actual}")]
    VersionConflict {
        name: String,
        partition: i32,
        expected: u64,
        actual: u64,
    },

    #[error("Register error: {0}")]
    Register(String),

    #[error("Registration failed: {0}")]
    RegistrationFailed(String),

    // === Config Errors ===
    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),

    // === Generic ===
    #[error("Stopped")]
    Stopped,

    #[error("Operation timeout: {0}")]
    Timeout(String),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("{0}")]
    Other(String),
}

impl Error {
    /// Classify this error into the propagation taxonomy.
    pub fn kind(&self) -> ErrorKind {
        match self {
            Error::VersionConflict { .. }
            | Error::NamespaceNodeConflict(_)
            | Error::TagsMismatch { .. } => ErrorKind::Conflict,
            Error::Register(_) | Error::Io(_) => ErrorKind::Store,
            Error::RegistrationFailed(_) | Error::InvalidConfig(_) => ErrorKind::Fatal,
            _ => ErrorKind::Transient,
        }
    }

    /// Is this a retryable error?
    pub fn is_retryable(&self) -> bool {
        matches!(self.kind(), ErrorKind::Transient | ErrorKind::Store)
    }
}

// Implement From for common error types
impl From<&str> for Error {
    fn from(s: &str) -> Self {
        Error::Other(s.to_string())
    }
}

impl From<String> for Error {
    fn from(s: String) -> Self {
        Error::Other(s)
    }
}

impl From<anyhow::Error> for Error {
    fn from(e: anyhow::Error) -> Self {
        Error::Other(e.to_string())
    }
}

impl From<config::ConfigError> for Error {
    fn from(e: config::ConfigError) -> Self {
        Error::InvalidConfig(e.to_string())
    }
}

impl From<serde_json::Error> for Error {
    fn from(e: serde_json::Error) -> Self {
        Error::InvalidConfig(format!("seed file: {}", e))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_kinds() {
        let conflict = Error::VersionConflict {
            name: "ns0".into(),
            partition: 0,
            expected: 1,
            actual: 2,
        };
        assert_eq!(conflict.kind(), ErrorKind::Conflict);
        assert!(!conflict.is_retryable());

        assert_eq!(Error::Register("down".into()).kind(), ErrorKind::Store);
        assert!(Error::Register("down".into()).is_retryable());

        assert_eq!(Error::Stopped.kind(), ErrorKind::Transient);
        let mismatch = Error::TagsMismatch {
            node: "B".into(),
            partition: "ns1-0".into(),
        };
        assert_eq!(mismatch.kind(), ErrorKind::Conflict);
        assert!(!mismatch.is_retryable());
        assert_eq!(
            Error::RegistrationFailed("nope".into()).kind(),
            ErrorKind::Fatal
        );
    }

    #[test]
    fn test_error_display() {
        let err = Error::PartitionNotFound {
            name: "ns0".into(),
            partition: 3,
        };
        assert_eq!(err.to_string(), "Partition not found: ns0-3");
    }
}
