//! Rill API - wire-level models shared by every node
//!
//! - [`model`]: node identity tokens, heartbeat payloads, node states
//! - [`remote`]: packet header layout and control bytes
//! - [`codec`]: the serialization collaborator (payload codec and type tags)

pub mod codec;
pub mod model;
pub mod remote;
