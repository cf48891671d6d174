// Integration tests for membership consensus, locking and node lifecycle
// Nodes share one in-process network per test

mod common;

use std::time::Duration;

use rill_core::{ConsensusState, Key, MemoryNetwork, NodeState, RebootReason};

use common::*;

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_three_nodes_agree_on_one_cloud() {
    let net = MemoryNetwork::new();
    let ports = [7101, 7102, 7103];
    let nodes = locked_cluster(&net, &ports).await;

    let expected: Vec<_> = ports.iter().map(|p| addr(*p)).collect();
    for node in &nodes {
        let cloud = node.cloud();
        assert_eq!(cloud.addresses(), expected);
        assert_eq!(node.consensus_state(), ConsensusState::Locked);
        assert!(node.health_summary().is_healthy());
    }
    let leaders = nodes.iter().filter(|n| n.is_leader()).count();
    assert_eq!(leaders, 1);
    assert!(nodes[0].is_leader());

    shutdown_all(&nodes).await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_every_node_computes_the_same_home() {
    let net = MemoryNetwork::new();
    let nodes = locked_cluster(&net, &[7111, 7112, 7113]).await;

    for i in 0..50 {
        let key = Key::user(&format!("owner-{}", i)).unwrap();
        let homes: Vec<_> = nodes.iter().map(|n| key.home(&n.cloud())).collect();
        assert!(homes[0].is_some());
        assert!(homes.iter().all(|h| *h == homes[0]));
    }

    shutdown_all(&nodes).await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_late_joiner_is_refused_by_locked_cloud() {
    let net = MemoryNetwork::new();
    let ports = [7121, 7122, 7123];
    let nodes = locked_cluster(&net, &ports).await;

    let late = start_node(&net, node_config(7124, &[7121, 7122, 7123, 7124])).await;
    let reason = tokio::time::timeout(WAIT, late.wait_halted())
        .await
        .expect("late joiner is told to stop");
    assert_eq!(reason.kind, RebootReason::Locked);
    assert!(ports.iter().any(|p| reason.peer == Some(addr(*p))));
    assert_eq!(reason.exit_code(), 2);

    for node in &nodes {
        assert_eq!(node.cloud().size(), 3);
        assert!(node.is_running());
    }

    shutdown_all(&nodes).await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_mismatched_build_is_told_to_stop() {
    let net = MemoryNetwork::new();
    let nodes = locked_cluster(&net, &[7131, 7132]).await;

    let mut config = node_config(7133, &[7131, 7132, 7133]);
    config.build_version = "0.0.0-other".to_string();
    let odd = start_node(&net, config).await;

    let reason = tokio::time::timeout(WAIT, odd.wait_halted())
        .await
        .expect("mismatched node is told to stop");
    assert_eq!(reason.kind, RebootReason::Mismatch);
    assert_eq!(reason.exit_code(), 3);
    assert!(nodes.iter().all(|n| n.is_running()));

    shutdown_all(&nodes).await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_key_value_access_fails_after_shutdown() {
    let net = MemoryNetwork::new();
    let nodes = locked_cluster(&net, &[7141, 7142]).await;

    nodes[1].shutdown().await;
    assert!(!nodes[1].is_running());
    let key = Key::user("after-shutdown").unwrap();
    assert!(nodes[1].get(&key).await.is_err());
    assert_eq!(
        nodes[1].halted().map(|r| r.kind),
        Some(RebootReason::Shutdown)
    );

    nodes[0].shutdown().await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_silent_member_becomes_suspicious() {
    let net = MemoryNetwork::new();
    let ports = [7151, 7152];
    let mut nodes = Vec::new();
    for port in ports {
        let mut config = node_config(port, &ports);
        config.heartbeat_timeout = Duration::from_millis(200);
        nodes.push(start_node(&net, config).await);
    }
    for node in &nodes {
        node.lock_cloud("test setup").await.unwrap();
    }

    net.isolate(addr(7152));
    assert!(
        eventually(|| nodes[0].node_state(&addr(7152)) == Some(NodeState::Suspicious))
            .await
    );
    // Suspicion never shrinks a locked cloud
    assert_eq!(nodes[0].cloud().size(), 2);

    net.heal(addr(7152));
    assert!(eventually(|| nodes[0].node_state(&addr(7152)) == Some(NodeState::Up)).await);

    shutdown_all(&nodes).await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_silent_client_is_evicted() {
    let net = MemoryNetwork::new();
    let ports = [7161, 7162];
    let mut nodes = Vec::new();
    for port in ports {
        let mut config = node_config(port, &ports);
        config.client_timeout = Duration::from_millis(150);
        nodes.push(start_node(&net, config).await);
    }
    for node in &nodes {
        node.lock_cloud("test setup").await.unwrap();
    }

    let client = start_node(&net, client_config(7169, &ports, false)).await;
    assert!(
        eventually(|| {
            nodes
                .iter()
                .all(|n| n.node_state(&addr(7169)).is_some())
        })
        .await
    );

    client.shutdown().await;
    for node in &nodes {
        assert!(eventually(|| node.node_state(&addr(7169)) == Some(NodeState::Down)).await);
        assert!(node.is_running());
    }

    shutdown_all(&nodes).await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_losing_controlling_client_stops_the_cluster() {
    let net = MemoryNetwork::new();
    let ports = [7171, 7172];
    let mut nodes = Vec::new();
    for port in ports {
        let mut config = node_config(port, &ports);
        config.client_timeout = Duration::from_millis(150);
        nodes.push(start_node(&net, config).await);
    }
    for node in &nodes {
        node.lock_cloud("test setup").await.unwrap();
    }

    let mut config = client_config(7179, &ports, true);
    config.client_timeout = Duration::from_millis(150);
    let client = start_node(&net, config).await;
    assert!(
        eventually(|| {
            nodes
                .iter()
                .all(|n| n.node_state(&addr(7179)).is_some())
        })
        .await
    );
    tokio::time::sleep(Duration::from_millis(200)).await;

    client.shutdown().await;
    for node in &nodes {
        let reason = tokio::time::timeout(WAIT, node.wait_halted())
            .await
            .expect("cluster stops without its controlling client");
        assert_eq!(reason.kind, RebootReason::Shutdown);
        assert_eq!(reason.exit_code(), 0);
    }
}
