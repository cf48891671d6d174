// RPC packet handlers: ExecHandler, AckHandler, AckAckHandler, NackHandler
// Route the reliable-RPC handshake packets into the runtime

use std::sync::Arc;

use async_trait::async_trait;
use bytes::Bytes;

use rill_api::remote::{PacketHeader, UdpType};

use crate::handler::PacketHandler;
use crate::service::node::Node;
use crate::service::runtime::ClusterRuntime;

/// Incoming request: full copy, reminder or release
pub struct ExecHandler;

#[async_trait]
impl PacketHandler for ExecHandler {
    async fn handle(
        &self,
        rt: &Arc<ClusterRuntime>,
        node: &Arc<Node>,
        header: PacketHeader,
        payload: Bytes,
    ) {
        // Dedup answers may block on a send; keep the dispatcher moving
        let rt = rt.clone();
        let node = node.clone();
        tokio::spawn(async move { rt.on_exec(node, header, payload).await });
    }

    fn can_handle(&self) -> UdpType {
        UdpType::Exec
    }
}

/// Reply to one of our tasks
pub struct AckHandler;

#[async_trait]
impl PacketHandler for AckHandler {
    async fn handle(
        &self,
        rt: &Arc<ClusterRuntime>,
        node: &Arc<Node>,
        header: PacketHeader,
        payload: Bytes,
    ) {
        let rt = rt.clone();
        let node = node.clone();
        tokio::spawn(async move { rt.on_ack(&node, header, payload).await });
    }

    fn can_handle(&self) -> UdpType {
        UdpType::Ack
    }
}

/// The sender has our reply; release what we held for it
pub struct AckAckHandler;

#[async_trait]
impl PacketHandler for AckAckHandler {
    async fn handle(
        &self,
        rt: &Arc<ClusterRuntime>,
        node: &Arc<Node>,
        header: PacketHeader,
        _payload: Bytes,
    ) {
        rt.on_ack_ack(node, header.task);
    }

    fn can_handle(&self) -> UdpType {
        UdpType::AckAck
    }
}

/// The receiver is still working on our task
pub struct NackHandler;

#[async_trait]
impl PacketHandler for NackHandler {
    async fn handle(
        &self,
        rt: &Arc<ClusterRuntime>,
        node: &Arc<Node>,
        header: PacketHeader,
        _payload: Bytes,
    ) {
        rt.on_nack(node, header.task);
    }

    fn can_handle(&self) -> UdpType {
        UdpType::Nack
    }
}
