//! Packet handler infrastructure
//!
//! This module provides the PacketHandler trait, the handler registry and
//! the handlers for every packet type the runtime understands.

pub mod cluster;
pub mod rpc;

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use bytes::Bytes;
use tracing::info;

use rill_api::remote::{PacketHeader, UdpType};

use crate::service::node::Node;
use crate::service::runtime::ClusterRuntime;

/// Handles one kind of inbound packet
#[async_trait]
pub trait PacketHandler: Send + Sync {
    async fn handle(
        &self,
        rt: &Arc<ClusterRuntime>,
        node: &Arc<Node>,
        header: PacketHeader,
        payload: Bytes,
    );

    fn can_handle(&self) -> UdpType;
}

/// Packet handlers by udp type
#[derive(Default)]
pub struct HandlerRegistry {
    handlers: HashMap<UdpType, Arc<dyn PacketHandler>>,
}

impl HandlerRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registry with the handlers for every packet type
    pub fn with_defaults() -> Self {
        let mut registry = Self::new();
        registry.register_handler(Arc::new(cluster::HeartbeatHandler));
        registry.register_handler(Arc::new(cluster::RebootedHandler));
        registry.register_handler(Arc::new(rpc::ExecHandler));
        registry.register_handler(Arc::new(rpc::AckHandler));
        registry.register_handler(Arc::new(rpc::AckAckHandler));
        registry.register_handler(Arc::new(rpc::NackHandler));
        registry
    }

    pub fn get_handler(&self, udp_type: UdpType) -> Option<Arc<dyn PacketHandler>> {
        self.handlers.get(&udp_type).cloned()
    }

    pub fn register_handler(&mut self, handler: Arc<dyn PacketHandler>) {
        let udp_type = handler.can_handle();
        info!(udp_type = %udp_type, "Registering packet handler");
        self.handlers.insert(udp_type, handler);
    }

    pub fn registered_types(&self) -> Vec<UdpType> {
        let mut types: Vec<UdpType> = self.handlers.keys().copied().collect();
        types.sort_by_key(|t| *t as u8);
        types
    }
}
