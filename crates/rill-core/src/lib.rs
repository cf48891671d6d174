//! Rill Core - cluster coordination
//!
//! This crate provides:
//! - Transport (datagrams + framed streams, and an in-process network for tests)
//! - Heartbeat gossip and liveness tracking
//! - Membership consensus and cloud locking
//! - Reliable RPC with dedup and a three-phase handshake
//! - Home-routed key/value store with replica invalidation
//! - Atomic compare-and-swap transactions

pub mod handler;
pub mod model;
pub mod service;

pub use model::{ClusterConfig, Configuration};
pub use rill_api::model::NodeState;
pub use rill_api::remote::RebootReason;
pub use service::atomic::{Atomic, AtomicOutcome};
pub use service::cloud::Cloud;
pub use service::futures::{Futures, PendingHandle};
pub use service::key::Key;
pub use service::membership::ConsensusState;
pub use service::member_event::{CloudEvent, CloudEventListener, CloudEventType};
pub use service::persist::{FilePersist, MemoryPersist, Persist};
pub use service::rpc::{
    CallOptions, Priority, RemoteTask, RpcHandle, RpcPhase, TaskContext, TaskOutcome,
};
pub use service::runtime::{ClusterRuntime, HaltReason, RuntimeBuilder};
pub use service::transport::{Inbound, MemoryNetwork, NetTransport, Path, Transport};
pub use service::value::{Backend, CasResult, Expectation, Value};
