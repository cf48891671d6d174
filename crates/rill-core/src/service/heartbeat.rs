// Heartbeat and liveness
// Periodic self-status broadcast, suspicion tracking and the client watchdog

use std::collections::BTreeSet;
use std::net::SocketAddr;
use std::sync::Arc;
use std::sync::atomic::Ordering;

use serde::{Deserialize, Serialize};
use sysinfo::System;
use tracing::{debug, error, info, warn};

use rill_api::codec;
use rill_api::model::{NodeState, ResourceStats};
use rill_api::remote::{RebootReason, UdpType};
use rill_common::Result;

use crate::service::member_event::{CloudEvent, CloudEventType};
use crate::service::membership::HeartbeatVerdict;
use crate::service::node::Node;
use crate::service::rpc::{Priority, RemoteTask, TaskContext, TaskOutcome};
use crate::service::runtime::{ClusterRuntime, HaltReason};

/// Asks a member whether it has also lost a client
#[derive(Debug, Serialize, Deserialize)]
pub struct ClientAbsenceQuery {
    pub client: SocketAddr,
}

impl RemoteTask for ClientAbsenceQuery {
    const TYPE_NAME: &'static str = "rill.ClientAbsenceQuery";
    const PRIORITY: Priority = Priority::High;
    type Output = bool;

    async fn execute(self, ctx: TaskContext) -> Result<TaskOutcome<bool>> {
        let rt = ctx.runtime;
        let absent = rt
            .nodes
            .get(&self.client)
            .map(|n| n.is_removed() || n.silence() > rt.config.client_eviction_after())
            .unwrap_or(true);
        Ok(TaskOutcome::new(absent))
    }
}

impl ClusterRuntime {
    pub(crate) async fn run_heartbeat_loop(self: Arc<Self>) {
        let mut interval = tokio::time::interval(self.config.heartbeat_interval);
        interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
        let mut stop = self.stop_signal();

        loop {
            tokio::select! {
                _ = interval.tick() => self.heartbeat_round().await,
                _ = stop.changed() => break,
            }
        }
        debug!("Heartbeat loop stopped");
    }

    async fn heartbeat_round(self: &Arc<Self>) {
        let self_node = self.nodes.self_node();
        let stats = self.collect_stats();
        self_node.update_heartbeat(|hb| hb.stats = stats);
        // Keeps consensus moving even when the transport is down
        self_node.touch();

        match codec::encode(&self_node.heartbeat()) {
            Ok(payload) => {
                let frame = self.header(UdpType::Heartbeat).encode(&payload);
                for target in self.heartbeat_targets() {
                    self.send_datagram(target, frame.clone()).await;
                }
            }
            Err(e) => warn!(error = %e, "Failed to encode heartbeat"),
        }

        self.process_heartbeat(&self_node).await;
        self.check_liveness().await;
        self.check_clients().await;
    }

    fn heartbeat_targets(&self) -> BTreeSet<SocketAddr> {
        let mut targets = self.membership.gossip_targets();
        for node in self.nodes.all() {
            if node.addr() != self.address() && node.is_client() && !node.is_removed() {
                targets.insert(node.addr());
            }
        }
        targets
    }

    fn collect_stats(&self) -> ResourceStats {
        let mut system = self.system.lock();
        system.refresh_memory();
        ResourceStats {
            free_mem: system.available_memory(),
            total_mem: system.total_memory(),
            num_cpus: std::thread::available_parallelism()
                .map(|n| n.get())
                .unwrap_or(1) as u16,
            system_load: System::load_average().one as f32,
            outstanding_tasks: self.outstanding_tasks() as u32,
            incoming_work: self.incoming_work() as u32,
        }
    }

    /// Feed a heartbeat already stored on `node` into consensus and act on the verdict
    pub(crate) async fn process_heartbeat(self: &Arc<Self>, node: &Arc<Node>) {
        match self.membership.do_heartbeat(node) {
            HeartbeatVerdict::Ignored => {}
            HeartbeatVerdict::Mismatch { alone: true } => {
                error!(node = %node.addr(), "Attempting to join a node with a different build, halting");
                self.halt(HaltReason {
                    kind: RebootReason::Mismatch,
                    peer: Some(node.addr()),
                })
                .await;
            }
            HeartbeatVerdict::Mismatch { alone: false } => {
                warn!(node = %node.addr(), "Killing node because of a build mismatch");
                self.send_kill(node.addr(), RebootReason::Mismatch).await;
            }
            HeartbeatVerdict::Locked => {
                warn!(node = %node.addr(), "Killing node because the cloud is no longer accepting members");
                self.send_kill(node.addr(), RebootReason::Locked).await;
            }
            HeartbeatVerdict::Accepted { joined, formed } => {
                if joined {
                    node.set_state(NodeState::Up);
                    self.publish(CloudEventType::MemberJoined, Some(node.addr()))
                        .await;
                }
                if let Some(cloud) = formed {
                    for member in cloud.members() {
                        if !member.contact_lost.load(Ordering::SeqCst) {
                            member.set_state(NodeState::Up);
                        }
                    }
                    self.publish(CloudEventType::CloudFormed, None).await;
                }
            }
        }
    }

    async fn check_liveness(&self) {
        let suspect_after = self.config.suspect_after();
        let mut peers: Vec<Arc<Node>> = self.membership.proposed();
        for member in self.cloud().members() {
            if !peers.iter().any(|p| p.addr() == member.addr()) {
                peers.push(member.clone());
            }
        }

        for node in peers {
            if node.addr() == self.address() {
                continue;
            }
            let silence = node.silence();
            if silence > suspect_after {
                if !node.contact_lost.swap(true, Ordering::SeqCst) {
                    warn!(node = %node.addr(), silence_ms = silence.as_millis() as u64, "Lost contact with node");
                    node.set_state(NodeState::Suspicious);
                    self.publish(CloudEventType::ContactLost, Some(node.addr()))
                        .await;
                }
            } else if node.contact_lost.swap(false, Ordering::SeqCst) {
                info!(node = %node.addr(), "Regained contact with node");
                node.set_state(NodeState::Up);
                self.publish(CloudEventType::ContactRegained, Some(node.addr()))
                    .await;
            }
        }
    }

    async fn check_clients(self: &Arc<Self>) {
        let evict_after = self.config.client_eviction_after();
        for node in self.nodes.all() {
            if node.addr() == self.address()
                || !node.is_client()
                || node.is_removed()
                || node.silence() <= evict_after
            {
                continue;
            }
            if node.heartbeat().controlling && !self.config.client {
                if !node.absence_query.swap(true, Ordering::SeqCst) {
                    let rt = self.clone();
                    tokio::spawn(async move { rt.confirm_client_absence(node).await });
                }
            } else {
                self.remove_client(&node).await;
            }
        }
    }

    /// Drop a client and everything held on its behalf
    pub(crate) async fn remove_client(&self, node: &Arc<Node>) {
        if node.set_removed(true) {
            return;
        }
        node.set_state(NodeState::Down);
        let cancelled = node.cancel_outstanding("client removed");
        let held: Vec<_> = node.work.iter().map(|c| c.value().clone()).collect();
        for call in held {
            if let Some(hook) = call.mark_ack_acked() {
                hook();
            }
        }
        node.remove_task_tracking();
        warn!(
            client = %node.addr(),
            silence_ms = node.silence().as_millis() as u64,
            cancelled,
            "Removing client that stopped sending heartbeats"
        );
        self.publish(CloudEventType::ClientRemoved, Some(node.addr()))
            .await;
    }

    /// Stop the cluster only if every member agrees the controlling client is gone
    async fn confirm_client_absence(self: Arc<Self>, node: Arc<Node>) {
        let client = node.addr();
        let members: Vec<SocketAddr> = self
            .cloud()
            .addresses()
            .into_iter()
            .filter(|a| *a != self.address())
            .collect();
        info!(client = %client, members = members.len(), "Asking members about the controlling client");

        let timeout = self.config.client_timeout;
        let answers = futures::future::join_all(members.iter().map(|member| {
            let rt = self.clone();
            let member = *member;
            async move {
                match rt.call(member, ClientAbsenceQuery { client }).await {
                    Ok(handle) => handle.get_timeout(timeout).await,
                    Err(e) => Err(e),
                }
            }
        }))
        .await;

        let agreed = answers.iter().all(|a| matches!(a, Ok(true)));
        if agreed && node.silence() > self.config.client_eviction_after() {
            warn!(client = %client, "Controlling client is gone, stopping the cluster");
            self.remove_client(&node).await;
            self.shutdown_cluster().await;
        } else {
            debug!(client = %client, "Members disagree about the controlling client");
            node.absence_query.store(false, Ordering::SeqCst);
        }
    }

    pub(crate) async fn publish(&self, event_type: CloudEventType, node: Option<SocketAddr>) {
        let event = CloudEvent::new(event_type, node, self.cloud().size());
        self.events.publish(event).await;
    }
}
