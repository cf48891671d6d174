//! Error types for Rill
//!
//! This module defines:
//! - `RillError`: Library error enum shared by every crate
//! - `Result`: alias over it

use std::net::SocketAddr;

/// Library error type.
///
/// Cloneable so that several waiters on one coalesced task can each observe
/// the same terminal failure.
#[derive(thiserror::Error, Debug, Clone, PartialEq, Eq)]
pub enum RillError {
    #[error("caused: {0}")]
    IllegalArgument(String),

    #[error("network error: {0}")]
    NetworkError(String),

    #[error("serialization error: {0}")]
    SerializationError(String),

    #[error("configuration error: {0}")]
    ConfigError(String),

    #[error("internal error: {0}")]
    InternalError(String),

    #[error("invalid key: {0}")]
    InvalidKey(String),

    #[error("task #{task} to {target} cancelled: {reason}")]
    Cancelled {
        target: SocketAddr,
        task: u32,
        reason: String,
    },

    #[error("timed out after {0}ms waiting for task")]
    Timeout(u64),

    #[error("remote task failed on {node}: {message}")]
    Remote { node: SocketAddr, message: String },

    #[error("cloud is locked, {0} was refused")]
    CloudLocked(String),

    #[error("build version mismatch with {0}")]
    VersionMismatch(String),

    #[error("node halted: {0}")]
    Halted(String),

    #[error("unknown type id {0}")]
    UnknownTypeId(u16),

    #[error("task type '{0}' is not registered")]
    UnregisteredTask(String),
}

impl RillError {
    /// Whether this error is the expected outcome of cancelling a task
    /// (target left, respawned, or the caller gave up).
    pub fn is_cancelled(&self) -> bool {
        matches!(self, RillError::Cancelled { .. })
    }
}

impl From<std::io::Error> for RillError {
    fn from(value: std::io::Error) -> Self {
        RillError::NetworkError(value.to_string())
    }
}

/// Result alias used throughout the workspace
pub type Result<T> = std::result::Result<T, RillError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_display() {
        let target: SocketAddr = "10.0.0.1:54321".parse().unwrap();
        let err = RillError::Cancelled {
            target,
            task: 7,
            reason: "target left the cloud".to_string(),
        };
        assert_eq!(
            err.to_string(),
            "task #7 to 10.0.0.1:54321 cancelled: target left the cloud"
        );
        assert!(err.is_cancelled());
        assert!(!RillError::Timeout(10).is_cancelled());
    }

    #[test]
    fn test_io_error_conversion() {
        let io = std::io::Error::new(std::io::ErrorKind::ConnectionRefused, "refused");
        let err: RillError = io.into();
        assert!(matches!(err, RillError::NetworkError(_)));
    }
}
