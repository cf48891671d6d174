//! Rill Common - Shared types and utilities
//!
//! This crate provides the foundational types used across all Rill components:
//! - Error types
//! - Utility functions
//! - Common constants

pub mod error;
pub mod utils;

// Re-exports for convenience
pub use error::{Result, RillError};
pub use utils::{local_ip, now_millis};

/// Default port a node binds for both datagrams and streams
pub const DEFAULT_NODE_PORT: u16 = 54321;

/// Default cluster name
pub const DEFAULT_CLUSTER_NAME: &str = "rill";

/// Maximum length of a key in bytes
pub const MAX_KEY_LEN: usize = 512;
