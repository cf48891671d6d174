// Cluster runtime
// The process-scoped context every component hangs off, its builder and lifecycle

use std::net::SocketAddr;
use std::sync::Arc;

use dashmap::DashMap;
use md5::{Digest, Md5};
use parking_lot::Mutex;
use sysinfo::System;
use tokio::sync::{broadcast, mpsc, watch};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use rill_api::codec::TypeMap;
use rill_api::model::{BootToken, HeartBeat, NodeState, name_hash};
use rill_api::remote::{PacketHeader, RebootReason, UdpType};
use rill_common::{Result, RillError, now_millis};

use crate::handler::HandlerRegistry;
use crate::model::ClusterConfig;
use crate::service::atomic::{Atomic, AtomicTask};
use crate::service::cloud::Cloud;
use crate::service::heartbeat::ClientAbsenceQuery;
use crate::service::kv::{GetKey, InvalidateKey, KvStore, PutKey};
use crate::service::member_event::{
    CloudEvent, CloudEventListener, CloudEventPublisher, CloudEventType,
    LoggingCloudEventListener,
};
use crate::service::membership::{ConsensusState, Membership};
use crate::service::node::{Node, NodeRegistry, Observation};
use crate::service::persist::Persist;
use crate::service::rpc::{CoalesceKey, RemoteTask, RpcCore, TaskRegistry};
use crate::service::timeout::TimeoutQueue;
use crate::service::transport::{Inbound, Transport};
use crate::service::type_lookup::{TypeIdLookup, TypeNameLookup};
use crate::service::worker::WorkerPool;

/// Why a node stopped
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct HaltReason {
    pub kind: RebootReason,
    /// Node whose signal or heartbeat caused the halt, `None` when local
    pub peer: Option<SocketAddr>,
}

impl HaltReason {
    pub fn local(kind: RebootReason) -> Self {
        Self { kind, peer: None }
    }

    pub fn to_error(&self) -> RillError {
        let peer = self
            .peer
            .map(|p| p.to_string())
            .unwrap_or_else(|| "local node".to_string());
        match self.kind {
            RebootReason::Locked => RillError::CloudLocked(format!("join via {}", peer)),
            RebootReason::Mismatch => RillError::VersionMismatch(peer),
            _ => RillError::Halted(self.to_string()),
        }
    }

    /// Process exit code for a node stopped for this reason
    pub fn exit_code(&self) -> i32 {
        match self.kind {
            RebootReason::Shutdown => 0,
            RebootReason::Locked => 2,
            RebootReason::Mismatch => 3,
            RebootReason::Reboot | RebootReason::Error => 1,
        }
    }
}

impl std::fmt::Display for HaltReason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self.peer {
            Some(peer) => write!(f, "{} (signalled by {})", self.kind, peer),
            None => write!(f, "{}", self.kind),
        }
    }
}

/// Node counts by liveness state, as seen from this node
#[derive(Clone, Debug)]
pub struct ClusterHealthSummary {
    pub total: usize,
    pub up: usize,
    pub down: usize,
    pub suspicious: usize,
    pub starting: usize,
    pub consensus: ConsensusState,
    pub locked: bool,
    pub leader: Option<SocketAddr>,
}

impl ClusterHealthSummary {
    pub fn is_healthy(&self) -> bool {
        self.up > self.total / 2
    }
}

/// md5 over the crate version and the configured build label
pub fn build_hash(build_version: &str) -> String {
    let mut hasher = Md5::new();
    hasher.update(env!("CARGO_PKG_VERSION").as_bytes());
    hasher.update(b"/");
    hasher.update(build_version.as_bytes());
    const_hex::encode(hasher.finalize().as_slice())
}

/// Everything one cluster node owns; several can live in one process
pub struct ClusterRuntime {
    pub(crate) config: ClusterConfig,
    pub(crate) nodes: NodeRegistry,
    pub(crate) membership: Membership,
    pub(crate) transport: Arc<dyn Transport>,
    pub(crate) task_registry: TaskRegistry,
    pub(crate) types: TypeMap,
    pub(crate) inflight: DashMap<CoalesceKey, Arc<RpcCore>>,
    pub(crate) timeouts: TimeoutQueue,
    pub(crate) kv: Arc<KvStore>,
    pub(crate) workers: WorkerPool,
    pub(crate) events: CloudEventPublisher,
    pub(crate) handlers: HandlerRegistry,
    pub(crate) system: Mutex<System>,
    address: SocketAddr,
    token: BootToken,
    stop_tx: watch::Sender<bool>,
    halt_tx: watch::Sender<Option<HaltReason>>,
    background: Mutex<Vec<JoinHandle<()>>>,
}

impl std::fmt::Debug for ClusterRuntime {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ClusterRuntime")
            .field("address", &self.address)
            .field("token", &self.token)
            .field("cloud_size", &self.cloud().size())
            .field("locked", &self.membership.is_locked())
            .finish()
    }
}

impl ClusterRuntime {
    pub fn address(&self) -> SocketAddr {
        self.address
    }

    pub fn token(&self) -> BootToken {
        self.token
    }

    pub fn config(&self) -> &ClusterConfig {
        &self.config
    }

    pub(crate) fn header(&self, udp_type: UdpType) -> PacketHeader {
        PacketHeader::new(udp_type, self.address.port(), self.token)
    }

    /// The most recently agreed cloud
    pub fn cloud(&self) -> Arc<Cloud> {
        self.membership.cloud()
    }

    pub fn is_leader(&self) -> bool {
        self.cloud()
            .leader()
            .is_some_and(|n| n.addr() == self.address)
    }

    pub fn is_locked(&self) -> bool {
        self.membership.is_locked()
    }

    pub fn consensus_state(&self) -> ConsensusState {
        self.membership.state()
    }

    pub fn node_state(&self, addr: &SocketAddr) -> Option<NodeState> {
        self.nodes.get(addr).map(|n| n.state())
    }

    pub fn subscribe_events(&self) -> broadcast::Receiver<CloudEvent> {
        self.events.subscribe()
    }

    pub async fn register_listener(&self, listener: Arc<dyn CloudEventListener>) {
        self.events.register_listener(listener).await;
    }

    pub(crate) fn stop_signal(&self) -> watch::Receiver<bool> {
        let mut rx = self.stop_tx.subscribe();
        if *rx.borrow() {
            rx.mark_changed();
        }
        rx
    }

    pub fn halted(&self) -> Option<HaltReason> {
        *self.halt_tx.borrow()
    }

    pub fn is_running(&self) -> bool {
        self.halted().is_none()
    }

    pub(crate) fn ensure_running(&self) -> Result<()> {
        match self.halted() {
            Some(reason) => Err(reason.to_error()),
            None => Ok(()),
        }
    }

    /// Resolves once the node halts
    pub async fn wait_halted(&self) -> HaltReason {
        let mut rx = self.halt_tx.subscribe();
        loop {
            let current = *rx.borrow_and_update();
            if let Some(reason) = current {
                return reason;
            }
            if rx.changed().await.is_err() {
                return HaltReason::local(RebootReason::Error);
            }
        }
    }

    /// Freeze membership so data placement can no longer move
    pub async fn lock_cloud(&self, reason: &str) -> Result<Arc<Cloud>> {
        self.ensure_running()?;
        if self.membership.is_locked() {
            return Ok(self.cloud());
        }
        let (cloud, newly_locked) = tokio::select! {
            locked = self.membership.lock(reason) => locked,
            halted = self.wait_halted() => return Err(halted.to_error()),
        };
        if newly_locked {
            self.publish(CloudEventType::CloudLocked, None).await;
        }
        Ok(cloud)
    }

    pub fn health_summary(&self) -> ClusterHealthSummary {
        let cloud = self.cloud();
        let mut summary = ClusterHealthSummary {
            total: 0,
            up: 0,
            down: 0,
            suspicious: 0,
            starting: 0,
            consensus: self.membership.state(),
            locked: self.membership.is_locked(),
            leader: cloud.leader().map(|n| n.addr()),
        };
        for node in cloud.members() {
            summary.total += 1;
            match node.state() {
                NodeState::Up => summary.up += 1,
                NodeState::Down => summary.down += 1,
                NodeState::Suspicious => summary.suspicious += 1,
                NodeState::Starting => summary.starting += 1,
            }
        }
        summary
    }

    /// Tell `target` to stop (or to forget us, for `Reboot`)
    pub(crate) async fn send_kill(&self, target: SocketAddr, reason: RebootReason) {
        let frame = self.header(UdpType::Rebooted).encode(&[reason as u8]);
        self.send_datagram(target, frame).await;
    }

    /// Stop this node; the first reason wins
    pub async fn halt(&self, reason: HaltReason) {
        let first = self.halt_tx.send_if_modified(|current| {
            if current.is_none() {
                *current = Some(reason);
                true
            } else {
                false
            }
        });
        if !first {
            return;
        }
        match reason.kind {
            RebootReason::Shutdown => info!(reason = %reason, "Node stopping"),
            _ => error!(reason = %reason, "Node halting"),
        }
        self.publish(CloudEventType::Halted, reason.peer).await;
        self.stop_background().await;
    }

    async fn stop_background(&self) {
        self.stop_tx.send_replace(true);
        self.membership.wake_all();
        let mut cancelled = 0;
        for node in self.nodes.all() {
            cancelled += node.cancel_outstanding("node halted");
        }
        self.inflight.clear();
        self.workers.close();
        self.transport.close().await;
        self.events.stop().await;
        debug!(cancelled, "Background work stopped");
    }

    /// Orderly local stop
    pub async fn shutdown(&self) {
        self.halt(HaltReason::local(RebootReason::Shutdown)).await;
        let handles: Vec<JoinHandle<()>> = std::mem::take(&mut *self.background.lock());
        for handle in handles {
            if let Err(e) = handle.await
                && !e.is_cancelled()
            {
                warn!(error = %e, "Background loop ended abnormally");
            }
        }
    }

    /// Ask every member and client to stop, then stop this node
    pub async fn shutdown_cluster(&self) {
        let mut targets: Vec<SocketAddr> = self.cloud().addresses();
        for node in self.nodes.all() {
            if node.is_client() && !node.is_removed() {
                targets.push(node.addr());
            }
        }
        targets.sort();
        targets.dedup();
        info!(targets = targets.len(), "Shutting down the cluster");
        for target in targets.into_iter().filter(|t| *t != self.address) {
            self.send_kill(target, RebootReason::Shutdown).await;
        }
        self.halt(HaltReason::local(RebootReason::Shutdown)).await;
    }

    // ===================== Inbound dispatch =====================

    async fn run_dispatcher(self: Arc<Self>, mut inbound: mpsc::Receiver<Inbound>) {
        let mut stop = self.stop_signal();
        loop {
            let packet = tokio::select! {
                packet = inbound.recv() => match packet {
                    Some(packet) => packet,
                    None => break,
                },
                _ = stop.changed() => break,
            };
            self.dispatch(packet).await;
        }
        debug!("Dispatcher stopped");
    }

    async fn dispatch(self: &Arc<Self>, packet: Inbound) {
        let (header, payload) = match PacketHeader::decode(packet.bytes) {
            Ok(decoded) => decoded,
            Err(e) => {
                debug!(source = %packet.source, error = %e, "Dropping malformed packet");
                return;
            }
        };
        let sender = SocketAddr::new(packet.source.ip(), header.port);
        if sender == self.address {
            return;
        }

        let (node, observation) = self.nodes.observe(sender, header.token);
        if observation == Observation::Respawned {
            self.on_respawn(&node).await;
        }
        node.touch();
        if header.udp_type == UdpType::Heartbeat && node.is_removed() {
            node.set_removed(false);
            info!(node = %sender, "Removed client is heartbeating again");
        }

        match self.handlers.get_handler(header.udp_type) {
            Some(handler) => handler.handle(self, &node, header, payload).await,
            None => debug!(node = %sender, udp_type = %header.udp_type, "No handler for packet"),
        }
    }

    async fn on_respawn(&self, node: &Arc<Node>) {
        node.rebooted();
        let cancelled = node.cancel_outstanding("target respawned");
        node.reset_task_numbers();
        warn!(node = %node.addr(), token = %node.token(), cancelled, "Node respawned, dropped state of its previous run");
        self.publish(CloudEventType::NodeRespawned, Some(node.addr()))
            .await;
    }
}

/// Assembles and starts a [`ClusterRuntime`]
pub struct RuntimeBuilder {
    config: ClusterConfig,
    task_registry: TaskRegistry,
    persist: Option<Arc<dyn Persist>>,
    listeners: Vec<Arc<dyn CloudEventListener>>,
}

impl RuntimeBuilder {
    pub fn new(config: ClusterConfig) -> Self {
        let mut task_registry = TaskRegistry::new();
        task_registry.register::<TypeIdLookup>();
        task_registry.register::<TypeNameLookup>();
        task_registry.register::<GetKey>();
        task_registry.register::<PutKey>();
        task_registry.register::<InvalidateKey>();
        task_registry.register::<ClientAbsenceQuery>();
        Self {
            config,
            task_registry,
            persist: None,
            listeners: Vec::new(),
        }
    }

    /// Tags every node agrees on without asking the leader
    fn bootstrap_types() -> TypeMap {
        TypeMap::with_bootstrap(&[
            TypeIdLookup::TYPE_NAME,
            TypeNameLookup::TYPE_NAME,
            GetKey::TYPE_NAME,
            PutKey::TYPE_NAME,
            InvalidateKey::TYPE_NAME,
            ClientAbsenceQuery::TYPE_NAME,
        ])
    }

    pub fn register_task<T: RemoteTask>(mut self) -> Self {
        self.task_registry.register::<T>();
        self
    }

    pub fn register_atomic<A: Atomic>(self) -> Self {
        self.register_task::<AtomicTask<A>>()
    }

    pub fn persist(mut self, persist: Arc<dyn Persist>) -> Self {
        self.persist = Some(persist);
        self
    }

    pub fn listener(mut self, listener: Arc<dyn CloudEventListener>) -> Self {
        self.listeners.push(listener);
        self
    }

    /// Start the node on `transport`, consuming its inbound frames
    pub async fn start(
        self,
        transport: Arc<dyn Transport>,
        inbound: mpsc::Receiver<Inbound>,
    ) -> Result<Arc<ClusterRuntime>> {
        let mut config = self.config;
        let address = transport.local_addr();
        config.address = address;
        let token = BootToken::calculate(now_millis(), config.client);

        let nodes = NodeRegistry::new(address);
        let self_node = nodes.self_node();
        self_node.set_heartbeat(HeartBeat {
            cloud_name_hash: name_hash(&config.cluster_name),
            build_hash: build_hash(&config.build_version),
            client: config.client,
            controlling: config.controlling,
            ..Default::default()
        });
        self_node.update_token(token);
        self_node.set_state(NodeState::Up);
        let membership = Membership::new(
            self_node,
            config.client,
            config.expected_size,
            config.flatfile.iter().copied(),
        );

        let runtime = Arc::new(ClusterRuntime {
            nodes,
            membership,
            transport,
            task_registry: self.task_registry,
            types: Self::bootstrap_types(),
            inflight: DashMap::new(),
            timeouts: TimeoutQueue::new(),
            kv: Arc::new(KvStore::new(self.persist)),
            workers: WorkerPool::new(config.worker_threads, config.high_priority_threads),
            events: CloudEventPublisher::new(config.event_queue_size),
            handlers: HandlerRegistry::with_defaults(),
            system: Mutex::new(System::new()),
            address,
            token,
            stop_tx: watch::channel(false).0,
            halt_tx: watch::channel(None).0,
            background: Mutex::new(Vec::new()),
            config,
        });

        runtime.events.start().await;
        runtime
            .events
            .register_listener(Arc::new(LoggingCloudEventListener))
            .await;
        for listener in self.listeners {
            runtime.events.register_listener(listener).await;
        }

        {
            let mut background = runtime.background.lock();
            background.push(tokio::spawn(runtime.clone().run_dispatcher(inbound)));
            background.push(tokio::spawn(runtime.clone().run_heartbeat_loop()));
            background.push(tokio::spawn(runtime.clone().run_timeout_loop()));
        }

        info!(
            address = %address,
            token = %token,
            client = runtime.config.client,
            cluster = %runtime.config.cluster_name,
            flatfile = runtime.config.flatfile.len(),
            "Cluster runtime started"
        );
        // Peers drop whatever they kept for an earlier process on this address
        for peer in runtime.membership.flatfile() {
            runtime.send_kill(peer, RebootReason::Reboot).await;
        }
        Ok(runtime)
    }
}
