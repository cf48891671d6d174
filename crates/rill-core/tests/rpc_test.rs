// Integration tests for reliable RPC: dedup, large frames, failures,
// coalescing and cancellation

mod common;

use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

use serde::{Deserialize, Serialize};

use rill_common::{Result, RillError};
use rill_core::{
    CallOptions, MemoryNetwork, RemoteTask, RpcPhase, RuntimeBuilder, TaskContext, TaskOutcome,
};

use common::*;

static COUNTED: AtomicUsize = AtomicUsize::new(0);

#[derive(Debug, Serialize, Deserialize)]
struct Count;

impl RemoteTask for Count {
    const TYPE_NAME: &'static str = "test.Count";
    type Output = usize;

    async fn execute(self, _ctx: TaskContext) -> Result<TaskOutcome<usize>> {
        Ok(TaskOutcome::new(COUNTED.fetch_add(1, Ordering::SeqCst) + 1))
    }
}

#[derive(Debug, Serialize, Deserialize)]
struct Echo {
    data: Vec<u8>,
}

impl RemoteTask for Echo {
    const TYPE_NAME: &'static str = "test.Echo";
    type Output = Vec<u8>;

    async fn execute(self, _ctx: TaskContext) -> Result<TaskOutcome<Vec<u8>>> {
        Ok(TaskOutcome::new(self.data))
    }
}

#[derive(Debug, Serialize, Deserialize)]
struct Fail;

impl RemoteTask for Fail {
    const TYPE_NAME: &'static str = "test.Fail";
    type Output = ();

    async fn execute(self, _ctx: TaskContext) -> Result<TaskOutcome<()>> {
        Err(RillError::IllegalArgument("no such thing".to_string()))
    }
}

#[derive(Debug, Serialize, Deserialize)]
struct Sleep {
    millis: u64,
}

impl RemoteTask for Sleep {
    const TYPE_NAME: &'static str = "test.Sleep";
    type Output = u64;

    async fn execute(self, _ctx: TaskContext) -> Result<TaskOutcome<u64>> {
        tokio::time::sleep(Duration::from_millis(self.millis)).await;
        Ok(TaskOutcome::new(self.millis))
    }
}

fn with_tasks(builder: RuntimeBuilder) -> RuntimeBuilder {
    builder
        .register_task::<Count>()
        .register_task::<Echo>()
        .register_task::<Fail>()
        .register_task::<Sleep>()
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_duplicated_datagrams_execute_once() {
    let net = MemoryNetwork::new();
    let nodes = locked_cluster_with(&net, &[7301, 7302], with_tasks).await;
    // Resolve the tag first so only the task itself travels duplicated
    nodes[0].call(nodes[1].address(), Echo { data: vec![] }).await.unwrap().get().await.unwrap();

    net.set_duplicate_datagrams(true);
    let before = COUNTED.load(Ordering::SeqCst);
    let handle = nodes[0].call(nodes[1].address(), Count).await.unwrap();
    assert_eq!(handle.get_timeout(WAIT).await.unwrap(), before + 1);
    assert_eq!(handle.phase(), RpcPhase::Done);

    // Late duplicates must not run it again
    tokio::time::sleep(Duration::from_millis(300)).await;
    assert_eq!(COUNTED.load(Ordering::SeqCst), before + 1);
    net.set_duplicate_datagrams(false);

    shutdown_all(&nodes).await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_lossy_network_still_delivers() {
    let net = MemoryNetwork::new();
    let nodes = locked_cluster_with(&net, &[7311, 7312], with_tasks).await;

    net.set_drop_every(3);
    for i in 0..20u8 {
        let handle = nodes[0]
            .call(nodes[1].address(), Echo { data: vec![i; 16] })
            .await
            .unwrap();
        assert_eq!(handle.get_timeout(WAIT).await.unwrap(), vec![i; 16]);
    }
    net.set_drop_every(0);

    shutdown_all(&nodes).await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_large_payload_goes_over_stream() {
    let net = MemoryNetwork::new();
    let nodes = locked_cluster_with(&net, &[7321, 7322], with_tasks).await;

    let data: Vec<u8> = (0..64 * 1024).map(|i| (i % 251) as u8).collect();
    let handle = nodes[1]
        .call(nodes[0].address(), Echo { data: data.clone() })
        .await
        .unwrap();
    assert_eq!(handle.get_timeout(WAIT).await.unwrap(), data);

    shutdown_all(&nodes).await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_remote_failure_reaches_caller() {
    let net = MemoryNetwork::new();
    let nodes = locked_cluster_with(&net, &[7331, 7332], with_tasks).await;

    let target = nodes[1].address();
    let err = nodes[0]
        .call(target, Fail)
        .await
        .unwrap()
        .get_timeout(WAIT)
        .await
        .unwrap_err();
    match err {
        RillError::Remote { node, message } => {
            assert_eq!(node, target);
            assert!(message.contains("no such thing"));
        }
        other => panic!("expected a remote failure, got {:?}", other),
    }

    shutdown_all(&nodes).await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_identical_calls_share_one_task() {
    let net = MemoryNetwork::new();
    let nodes = locked_cluster_with(&net, &[7341, 7342], with_tasks).await;
    let target = nodes[1].address();

    let first = nodes[0]
        .call_with(target, Sleep { millis: 300 }, CallOptions::new().coalesce("nap"))
        .await
        .unwrap();
    let second = nodes[0]
        .call_with(target, Sleep { millis: 300 }, CallOptions::new().coalesce("nap"))
        .await
        .unwrap();
    assert_eq!(first.task_number(), second.task_number());
    assert_eq!(second.get_timeout(WAIT).await.unwrap(), 300);
    assert_eq!(first.get_timeout(WAIT).await.unwrap(), 300);

    let third = nodes[0]
        .call_with(target, Sleep { millis: 1 }, CallOptions::new().coalesce("nap"))
        .await
        .unwrap();
    assert_ne!(third.task_number(), first.task_number());
    third.get_timeout(WAIT).await.unwrap();

    shutdown_all(&nodes).await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_local_calls_skip_the_network() {
    let net = MemoryNetwork::new();
    let nodes = locked_cluster_with(&net, &[7351], with_tasks).await;

    let handle = nodes[0]
        .call(nodes[0].address(), Echo { data: b"self".to_vec() })
        .await
        .unwrap();
    assert_eq!(handle.get().await.unwrap(), b"self".to_vec());

    shutdown_all(&nodes).await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_respawned_target_cancels_outstanding_task() {
    let net = MemoryNetwork::new();
    let ports = [7361, 7362];
    let nodes = locked_cluster_with(&net, &ports, with_tasks).await;
    let target = nodes[1].address();

    let handle = nodes[0].call(target, Sleep { millis: 60_000 }).await.unwrap();
    tokio::time::sleep(Duration::from_millis(100)).await;
    assert!(!handle.phase().is_terminal());

    nodes[1].shutdown().await;
    tokio::time::sleep(Duration::from_millis(20)).await;
    let reborn = start_with(&net, node_config(7362, &ports), with_tasks).await;

    let err = handle.get_timeout(WAIT).await.unwrap_err();
    assert!(err.is_cancelled(), "unexpected error {:?}", err);

    reborn.shutdown().await;
    nodes[0].shutdown().await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_caller_cancel_finishes_handle() {
    let net = MemoryNetwork::new();
    let nodes = locked_cluster_with(&net, &[7371, 7372], with_tasks).await;

    let handle = nodes[0]
        .call(nodes[1].address(), Sleep { millis: 60_000 })
        .await
        .unwrap();
    assert!(handle.cancel());
    assert!(handle.get().await.unwrap_err().is_cancelled());
    assert!(!handle.cancel());

    shutdown_all(&nodes).await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_cancelled_task_that_never_arrived_is_retired() {
    let net = MemoryNetwork::new();
    let nodes = locked_cluster_with(&net, &[7381, 7382], with_tasks).await;
    let (caller, target) = (&nodes[0], nodes[1].address());
    caller.call(target, Echo { data: vec![] }).await.unwrap().get_timeout(WAIT).await.unwrap();

    // This task number never reaches the target
    net.isolate(target);
    let lost = caller.call(target, Echo { data: vec![0xff] }).await.unwrap();
    assert!(lost.cancel());
    net.heal(target);

    for i in 0..50u8 {
        let handle = caller.call(target, Echo { data: vec![i] }).await.unwrap();
        assert_eq!(handle.get_timeout(WAIT).await.unwrap(), vec![i]);
    }

    assert!(eventually(|| nodes[1].incoming_work() == 0).await);
    assert!(eventually(|| caller.outstanding_tasks() == 0).await);

    shutdown_all(&nodes).await;
}
