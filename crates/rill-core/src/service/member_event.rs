// Cloud event handling
// Provides event-driven notifications for membership and liveness changes

use std::net::SocketAddr;
use std::sync::Arc;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tokio::sync::{RwLock, broadcast};
use tracing::{debug, info, warn};

use rill_common::now_millis;

/// Type of cloud event
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum CloudEventType {
    /// A node entered the proposed membership
    MemberJoined,
    /// Every proposed member agreed on the same membership
    CloudFormed,
    /// Membership became immutable
    CloudLocked,
    /// A member went silent past the suspect threshold
    ContactLost,
    ContactRegained,
    ClientRemoved,
    /// A known address came back with a new boot token
    NodeRespawned,
    /// This node stopped
    Halted,
}

impl std::fmt::Display for CloudEventType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            CloudEventType::MemberJoined => write!(f, "MEMBER_JOINED"),
            CloudEventType::CloudFormed => write!(f, "CLOUD_FORMED"),
            CloudEventType::CloudLocked => write!(f, "CLOUD_LOCKED"),
            CloudEventType::ContactLost => write!(f, "CONTACT_LOST"),
            CloudEventType::ContactRegained => write!(f, "CONTACT_REGAINED"),
            CloudEventType::ClientRemoved => write!(f, "CLIENT_REMOVED"),
            CloudEventType::NodeRespawned => write!(f, "NODE_RESPAWNED"),
            CloudEventType::Halted => write!(f, "HALTED"),
        }
    }
}

/// Cloud event
#[derive(Clone, Debug)]
pub struct CloudEvent {
    pub event_type: CloudEventType,
    /// The affected node, if the event concerns one
    pub node: Option<SocketAddr>,
    /// Size of the published cloud when the event fired
    pub cloud_size: usize,
    pub timestamp: i64,
}

impl CloudEvent {
    pub fn new(event_type: CloudEventType, node: Option<SocketAddr>, cloud_size: usize) -> Self {
        Self {
            event_type,
            node,
            cloud_size,
            timestamp: now_millis(),
        }
    }
}

/// Trait for handling cloud events
#[async_trait]
pub trait CloudEventListener: Send + Sync {
    async fn on_cloud_event(&self, event: &CloudEvent);
}

/// Cloud event publisher
/// Broadcasts events to subscribers and registered listeners
pub struct CloudEventPublisher {
    broadcast_tx: broadcast::Sender<CloudEvent>,
    listeners: Arc<RwLock<Vec<Arc<dyn CloudEventListener>>>>,
    running: Arc<RwLock<bool>>,
}

impl CloudEventPublisher {
    pub fn new(queue_size: usize) -> Self {
        let (broadcast_tx, _) = broadcast::channel(queue_size.max(1));
        Self {
            broadcast_tx,
            listeners: Arc::new(RwLock::new(Vec::new())),
            running: Arc::new(RwLock::new(false)),
        }
    }

    pub async fn start(&self) {
        let mut running = self.running.write().await;
        if *running {
            return;
        }
        *running = true;
        info!("Starting cloud event publisher");
    }

    pub async fn stop(&self) {
        let mut running = self.running.write().await;
        *running = false;
        info!("Stopped cloud event publisher");
    }

    pub async fn register_listener(&self, listener: Arc<dyn CloudEventListener>) {
        let mut listeners = self.listeners.write().await;
        listeners.push(listener);
        debug!("Registered cloud event listener, total: {}", listeners.len());
    }

    pub async fn publish(&self, event: CloudEvent) {
        if !*self.running.read().await {
            return;
        }

        debug!(
            event_type = %event.event_type,
            node = ?event.node,
            cloud_size = event.cloud_size,
            "Publishing cloud event"
        );

        // No subscribers is fine
        let _ = self.broadcast_tx.send(event.clone());

        let listeners = self.listeners.read().await;
        for listener in listeners.iter() {
            listener.on_cloud_event(&event).await;
        }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<CloudEvent> {
        self.broadcast_tx.subscribe()
    }
}

/// Writes every event to the cluster log
pub struct LoggingCloudEventListener;

#[async_trait]
impl CloudEventListener for LoggingCloudEventListener {
    async fn on_cloud_event(&self, event: &CloudEvent) {
        let node = event
            .node
            .map(|n| n.to_string())
            .unwrap_or_else(|| "-".to_string());
        match event.event_type {
            CloudEventType::ContactLost | CloudEventType::Halted => {
                warn!("[CloudEvent] {} {} (cloud size {})", event.event_type, node, event.cloud_size);
            }
            _ => {
                info!("[CloudEvent] {} {} (cloud size {})", event.event_type, node, event.cloud_size);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicUsize, Ordering};

    use super::*;

    struct CountingListener(AtomicUsize);

    #[async_trait]
    impl CloudEventListener for CountingListener {
        async fn on_cloud_event(&self, _event: &CloudEvent) {
            self.0.fetch_add(1, Ordering::SeqCst);
        }
    }

    #[tokio::test]
    async fn test_publish_requires_start() {
        let publisher = CloudEventPublisher::new(16);
        let listener = Arc::new(CountingListener(AtomicUsize::new(0)));
        publisher.register_listener(listener.clone()).await;

        publisher
            .publish(CloudEvent::new(CloudEventType::CloudFormed, None, 1))
            .await;
        assert_eq!(listener.0.load(Ordering::SeqCst), 0);

        publisher.start().await;
        publisher
            .publish(CloudEvent::new(CloudEventType::CloudFormed, None, 1))
            .await;
        assert_eq!(listener.0.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_subscribe_receives_events() {
        let publisher = CloudEventPublisher::new(16);
        publisher.start().await;
        let mut rx = publisher.subscribe();
        let addr: SocketAddr = "127.0.0.1:1".parse().unwrap();

        publisher
            .publish(CloudEvent::new(CloudEventType::ContactLost, Some(addr), 3))
            .await;
        let event = rx.recv().await.unwrap();
        assert_eq!(event.event_type, CloudEventType::ContactLost);
        assert_eq!(event.node, Some(addr));
        assert_eq!(event.cloud_size, 3);
    }

    #[test]
    fn test_event_type_display() {
        assert_eq!(CloudEventType::CloudLocked.to_string(), "CLOUD_LOCKED");
        assert_eq!(CloudEventType::NodeRespawned.to_string(), "NODE_RESPAWNED");
    }
}
