// Cluster packet handlers: HeartbeatHandler, RebootedHandler
// Feed gossip into membership and act on kill signals

use std::sync::Arc;

use async_trait::async_trait;
use bytes::Bytes;
use tracing::{debug, info, warn};

use rill_api::codec;
use rill_api::model::HeartBeat;
use rill_api::remote::{PacketHeader, RebootReason, UdpType};

use crate::handler::PacketHandler;
use crate::service::node::Node;
use crate::service::runtime::{ClusterRuntime, HaltReason};

/// Stores a peer's heartbeat and runs it through consensus
pub struct HeartbeatHandler;

#[async_trait]
impl PacketHandler for HeartbeatHandler {
    async fn handle(
        &self,
        rt: &Arc<ClusterRuntime>,
        node: &Arc<Node>,
        _header: PacketHeader,
        payload: Bytes,
    ) {
        let heartbeat: HeartBeat = match codec::decode(&payload) {
            Ok(heartbeat) => heartbeat,
            Err(e) => {
                debug!(node = %node.addr(), error = %e, "Dropping undecodable heartbeat");
                return;
            }
        };
        node.set_heartbeat(heartbeat);
        rt.process_heartbeat(node).await;
    }

    fn can_handle(&self) -> UdpType {
        UdpType::Heartbeat
    }
}

/// Reacts to a peer restarting or telling this node to stop
pub struct RebootedHandler;

#[async_trait]
impl PacketHandler for RebootedHandler {
    async fn handle(
        &self,
        rt: &Arc<ClusterRuntime>,
        node: &Arc<Node>,
        _header: PacketHeader,
        payload: Bytes,
    ) {
        let reason = match payload.first().map(|b| RebootReason::try_from(*b)) {
            Some(Ok(reason)) => reason,
            _ => {
                debug!(node = %node.addr(), "Dropping kill signal without a reason");
                return;
            }
        };
        match reason {
            RebootReason::Reboot => {
                info!(node = %node.addr(), "Peer restarted, dropping its incoming work");
                node.rebooted();
            }
            other => {
                warn!(node = %node.addr(), reason = %other, "Received kill signal");
                rt.halt(HaltReason {
                    kind: other,
                    peer: Some(node.addr()),
                })
                .await;
            }
        }
    }

    fn can_handle(&self) -> UdpType {
        UdpType::Rebooted
    }
}
