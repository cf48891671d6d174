//! Common test utilities for multi-node tests
//!
//! Nodes run in one process on a shared MemoryNetwork, with short heartbeat
//! and retry intervals so consensus forms in well under a second.

#![allow(dead_code)]

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use rill_core::{Atomic, ClusterConfig, ClusterRuntime, MemoryNetwork, RuntimeBuilder, Value};

/// Upper bound for anything a test waits on
pub const WAIT: Duration = Duration::from_secs(15);

pub fn addr(port: u16) -> SocketAddr {
    SocketAddr::from(([127, 0, 0, 1], port))
}

/// Config of a server node that expects every port in `peers` to join
pub fn node_config(port: u16, peers: &[u16]) -> ClusterConfig {
    ClusterConfig {
        cluster_name: "rill-test".to_string(),
        address: addr(port),
        flatfile: peers.iter().map(|p| addr(*p)).collect(),
        expected_size: peers.len(),
        heartbeat_interval: Duration::from_millis(50),
        heartbeat_timeout: Duration::from_secs(2),
        client_timeout: Duration::from_secs(5),
        retry_initial: Duration::from_millis(50),
        retry_max: Duration::from_millis(400),
        worker_threads: 16,
        high_priority_threads: 8,
        ..Default::default()
    }
}

/// Ephemeral client that talks to the servers in `servers`
pub fn client_config(port: u16, servers: &[u16], controlling: bool) -> ClusterConfig {
    ClusterConfig {
        client: true,
        controlling,
        expected_size: 0,
        ..node_config(port, servers)
    }
}

pub async fn start_with(
    net: &MemoryNetwork,
    config: ClusterConfig,
    customize: impl FnOnce(RuntimeBuilder) -> RuntimeBuilder,
) -> Arc<ClusterRuntime> {
    let (transport, inbound) = net.endpoint(config.address);
    customize(RuntimeBuilder::new(config).register_atomic::<Increment>())
        .start(transport, inbound)
        .await
        .expect("runtime starts")
}

pub async fn start_node(net: &MemoryNetwork, config: ClusterConfig) -> Arc<ClusterRuntime> {
    start_with(net, config, |b| b).await
}

/// Start one server per port, each listing all of them in its flatfile
pub async fn start_cluster(net: &MemoryNetwork, ports: &[u16]) -> Vec<Arc<ClusterRuntime>> {
    start_cluster_with(net, ports, |b| b).await
}

pub async fn start_cluster_with(
    net: &MemoryNetwork,
    ports: &[u16],
    customize: impl Fn(RuntimeBuilder) -> RuntimeBuilder,
) -> Vec<Arc<ClusterRuntime>> {
    let mut nodes = Vec::new();
    for port in ports {
        nodes.push(start_with(net, node_config(*port, ports), &customize).await);
    }
    nodes
}

/// Start a cluster and lock its membership on every node
pub async fn locked_cluster(net: &MemoryNetwork, ports: &[u16]) -> Vec<Arc<ClusterRuntime>> {
    locked_cluster_with(net, ports, |b| b).await
}

pub async fn locked_cluster_with(
    net: &MemoryNetwork,
    ports: &[u16],
    customize: impl Fn(RuntimeBuilder) -> RuntimeBuilder,
) -> Vec<Arc<ClusterRuntime>> {
    let nodes = start_cluster_with(net, ports, customize).await;
    for node in &nodes {
        let cloud = tokio::time::timeout(WAIT, node.lock_cloud("test setup"))
            .await
            .expect("cloud locks in time")
            .expect("cloud locks");
        assert_eq!(cloud.size(), ports.len());
    }
    nodes
}

/// Poll `check` until it holds or `WAIT` passes
pub async fn eventually(mut check: impl FnMut() -> bool) -> bool {
    let deadline = tokio::time::Instant::now() + WAIT;
    while tokio::time::Instant::now() < deadline {
        if check() {
            return true;
        }
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
    false
}

pub async fn shutdown_all(nodes: &[Arc<ClusterRuntime>]) {
    for node in nodes {
        node.shutdown().await;
    }
}

/// Adds one to a big-endian u64 counter
#[derive(Debug, Serialize, Deserialize)]
pub struct Increment;

impl Atomic for Increment {
    const TYPE_NAME: &'static str = "test.Increment";

    fn atomic(&self, old: Option<&Value>) -> Option<Value> {
        Some(counter_value(old.map(read_counter).unwrap_or(0) + 1))
    }
}

pub fn counter_value(n: u64) -> Value {
    Value::from_bytes(n.to_be_bytes().to_vec())
}

pub fn read_counter(value: &Value) -> u64 {
    value
        .payload()
        .and_then(|p| <[u8; 8]>::try_from(&p[..]).ok())
        .map(u64::from_be_bytes)
        .unwrap_or(0)
}
