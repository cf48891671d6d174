// Node registry
// One entry per peer address, holding liveness, boot token and per-peer task tables

use std::net::{IpAddr, SocketAddr};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU16, AtomicU32, Ordering};
use std::time::Duration;

use dashmap::DashMap;
use parking_lot::{Mutex, RwLock};
use tokio::time::Instant;
use tracing::debug;

use rill_api::model::{BootToken, HeartBeat, NodeState};

use crate::service::rpc::{RpcCall, RpcCore};

/// Deterministic per-address hash; the membership hash sums these
pub fn node_hash(addr: &SocketAddr) -> i32 {
    let ip = match addr.ip() {
        IpAddr::V4(v4) => u32::from(v4),
        IpAddr::V6(v6) => v6
            .octets()
            .chunks(4)
            .fold(0u32, |acc, c| acc ^ u32::from_be_bytes([c[0], c[1], c[2], c[3]])),
    };
    (ip ^ ((addr.port() as u32) << 16) ^ addr.port() as u32) as i32
}

/// What the receiver already knows about an incoming task number
pub(crate) enum WorkEntry {
    /// At or below the rolled-up counter: finished and forgotten
    Completed,
    Call(Arc<RpcCall>),
}

pub struct Node {
    addr: SocketAddr,
    unique_idx: u16,
    hash: i32,
    token: AtomicU16,
    last_heard: Mutex<Instant>,
    heartbeat: RwLock<HeartBeat>,
    state: RwLock<NodeState>,
    pub(crate) contact_lost: AtomicBool,
    removed: AtomicBool,
    pub(crate) absence_query: AtomicBool,
    next_task: AtomicU32,
    /// Outgoing tasks to this node not yet acknowledged
    pub(crate) tasks: DashMap<u32, Arc<RpcCore>>,
    /// Incoming tasks from this node not yet ACKACKed
    pub(crate) work: DashMap<u32, Arc<RpcCall>>,
    removed_task_ids: AtomicU32,
}

impl Node {
    fn new(addr: SocketAddr, unique_idx: u16) -> Self {
        Self {
            addr,
            unique_idx,
            hash: node_hash(&addr),
            token: AtomicU16::new(BootToken::UNDEFINED.raw()),
            last_heard: Mutex::new(Instant::now()),
            heartbeat: RwLock::new(HeartBeat::default()),
            state: RwLock::new(NodeState::Starting),
            contact_lost: AtomicBool::new(false),
            removed: AtomicBool::new(false),
            absence_query: AtomicBool::new(false),
            next_task: AtomicU32::new(1),
            tasks: DashMap::new(),
            work: DashMap::new(),
            removed_task_ids: AtomicU32::new(0),
        }
    }

    pub fn addr(&self) -> SocketAddr {
        self.addr
    }

    pub fn unique_idx(&self) -> u16 {
        self.unique_idx
    }

    pub fn hash(&self) -> i32 {
        self.hash
    }

    pub fn token(&self) -> BootToken {
        BootToken::from_raw(self.token.load(Ordering::SeqCst))
    }

    /// Record the token seen on a packet; true when it reveals a respawn
    pub fn update_token(&self, token: BootToken) -> bool {
        if !token.is_defined() {
            return false;
        }
        loop {
            let old = self.token.load(Ordering::SeqCst);
            if old == token.raw() {
                return false;
            }
            if self
                .token
                .compare_exchange(old, token.raw(), Ordering::SeqCst, Ordering::SeqCst)
                .is_ok()
            {
                return BootToken::has_respawned(BootToken::from_raw(old), token);
            }
        }
    }

    pub fn touch(&self) {
        *self.last_heard.lock() = Instant::now();
    }

    /// Time since the last packet from this node
    pub fn silence(&self) -> Duration {
        self.last_heard.lock().elapsed()
    }

    pub fn heartbeat(&self) -> HeartBeat {
        self.heartbeat.read().clone()
    }

    pub fn set_heartbeat(&self, heartbeat: HeartBeat) {
        *self.heartbeat.write() = heartbeat;
    }

    pub(crate) fn update_heartbeat<R>(&self, f: impl FnOnce(&mut HeartBeat) -> R) -> R {
        f(&mut self.heartbeat.write())
    }

    pub fn state(&self) -> NodeState {
        *self.state.read()
    }

    pub fn set_state(&self, state: NodeState) {
        *self.state.write() = state;
    }

    pub fn is_client(&self) -> bool {
        self.token().is_client() || self.heartbeat.read().client
    }

    pub fn is_removed(&self) -> bool {
        self.removed.load(Ordering::SeqCst)
    }

    pub(crate) fn set_removed(&self, removed: bool) -> bool {
        self.removed.swap(removed, Ordering::SeqCst)
    }

    pub(crate) fn next_task_number(&self) -> u32 {
        self.next_task.fetch_add(1, Ordering::SeqCst)
    }

    pub(crate) fn outstanding_tasks(&self) -> usize {
        self.tasks.len()
    }

    pub(crate) fn incoming_work(&self) -> usize {
        self.work.len()
    }

    pub(crate) fn removed_task_ids(&self) -> u32 {
        self.removed_task_ids.load(Ordering::SeqCst)
    }

    pub(crate) fn has_task(&self, task: u32) -> Option<WorkEntry> {
        if task <= self.removed_task_ids() {
            return Some(WorkEntry::Completed);
        }
        self.work.get(&task).map(|c| WorkEntry::Call(c.clone()))
    }

    /// Insert `call` unless the task is already known; returns the winner
    pub(crate) fn record_task(&self, call: Arc<RpcCall>) -> (WorkEntry, bool) {
        let task = call.task();
        if task <= self.removed_task_ids() {
            return (WorkEntry::Completed, false);
        }
        let (entry, inserted) = match self.work.entry(task) {
            dashmap::Entry::Occupied(e) => (e.get().clone(), false),
            dashmap::Entry::Vacant(e) => {
                e.insert(call.clone());
                (call, true)
            }
        };
        // Lost a race with the roll-up
        if inserted && task <= self.removed_task_ids() {
            self.work.remove(&task);
            return (WorkEntry::Completed, false);
        }
        (WorkEntry::Call(entry), inserted)
    }

    /// Roll the removed counter over every contiguous ACKACKed task
    pub(crate) fn remove_task_tracking(&self) {
        loop {
            let done = self.removed_task_ids();
            let next = done + 1;
            let Some(call) = self.work.get(&next).map(|c| c.clone()) else {
                return;
            };
            if !call.is_ack_acked() {
                return;
            }
            if self
                .removed_task_ids
                .compare_exchange(done, next, Ordering::SeqCst, Ordering::SeqCst)
                .is_ok()
            {
                self.work.remove(&next);
            }
        }
    }

    /// Forget incoming work of a previous incarnation
    pub(crate) fn rebooted(&self) {
        let dropped = self.work.len();
        self.work.clear();
        self.removed_task_ids.store(0, Ordering::SeqCst);
        debug!(node = %self.addr, dropped, "Cleared incoming work");
    }

    /// Cancel every outgoing task; returns how many were cancelled
    pub(crate) fn cancel_outstanding(&self, reason: &str) -> usize {
        let ids: Vec<u32> = self.tasks.iter().map(|e| *e.key()).collect();
        let mut cancelled = 0;
        for id in ids {
            if let Some((_, core)) = self.tasks.remove(&id) {
                core.cancel(reason);
                cancelled += 1;
            }
        }
        cancelled
    }

    /// Restart task numbering towards a new incarnation of this address
    pub(crate) fn reset_task_numbers(&self) {
        self.next_task.store(1, Ordering::SeqCst);
    }
}

impl std::fmt::Debug for Node {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Node")
            .field("addr", &self.addr)
            .field("unique_idx", &self.unique_idx)
            .field("token", &self.token())
            .finish()
    }
}

/// How a packet's sender relates to what was known before
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Observation {
    New,
    Known,
    Respawned,
}

/// Address and index lookups for every node this process has heard of
pub struct NodeRegistry {
    self_addr: SocketAddr,
    by_addr: DashMap<SocketAddr, Arc<Node>>,
    by_idx: DashMap<u16, Arc<Node>>,
    next_idx: AtomicU16,
}

impl NodeRegistry {
    pub fn new(self_addr: SocketAddr) -> Self {
        let registry = Self {
            self_addr,
            by_addr: DashMap::new(),
            by_idx: DashMap::new(),
            next_idx: AtomicU16::new(0),
        };
        registry.intern(self_addr);
        registry
    }

    pub fn intern(&self, addr: SocketAddr) -> Arc<Node> {
        if let Some(node) = self.by_addr.get(&addr) {
            return node.clone();
        }
        self.by_addr
            .entry(addr)
            .or_insert_with(|| {
                let idx = self.next_idx.fetch_add(1, Ordering::SeqCst);
                let node = Arc::new(Node::new(addr, idx));
                self.by_idx.insert(idx, node.clone());
                node
            })
            .clone()
    }

    /// Intern `addr` and record the token it just presented
    pub fn observe(&self, addr: SocketAddr, token: BootToken) -> (Arc<Node>, Observation) {
        let known = self.by_addr.contains_key(&addr);
        let node = self.intern(addr);
        let respawned = node.update_token(token);
        let observation = if !known {
            Observation::New
        } else if respawned {
            Observation::Respawned
        } else {
            Observation::Known
        };
        (node, observation)
    }

    pub fn get(&self, addr: &SocketAddr) -> Option<Arc<Node>> {
        self.by_addr.get(addr).map(|n| n.clone())
    }

    pub fn by_index(&self, idx: u16) -> Option<Arc<Node>> {
        self.by_idx.get(&idx).map(|n| n.clone())
    }

    pub fn all(&self) -> Vec<Arc<Node>> {
        self.by_addr.iter().map(|n| n.value().clone()).collect()
    }

    pub fn self_node(&self) -> Arc<Node> {
        self.intern(self.self_addr)
    }

    pub fn len(&self) -> usize {
        self.by_addr.len()
    }

    pub fn is_empty(&self) -> bool {
        self.by_addr.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn addr(port: u16) -> SocketAddr {
        SocketAddr::from(([127, 0, 0, 1], port))
    }

    fn acked_call(task: u32) -> Arc<RpcCall> {
        let call = Arc::new(RpcCall::new(task));
        call.mark_ack_acked();
        call
    }

    #[test]
    fn test_node_hash_is_deterministic() {
        assert_eq!(node_hash(&addr(5000)), node_hash(&addr(5000)));
        assert_ne!(node_hash(&addr(5000)), node_hash(&addr(5001)));
        assert_ne!(
            node_hash(&addr(5000)),
            node_hash(&SocketAddr::from(([127, 0, 0, 2], 5000)))
        );
    }

    #[test]
    fn test_registry_interns_once() {
        let registry = NodeRegistry::new(addr(1));
        let a = registry.intern(addr(2));
        let b = registry.intern(addr(2));
        assert!(Arc::ptr_eq(&a, &b));
        assert_eq!(registry.self_node().unique_idx(), 0);
        assert_eq!(a.unique_idx(), 1);
        assert!(Arc::ptr_eq(&registry.by_index(1).unwrap(), &a));
        assert_eq!(registry.len(), 2);
    }

    #[test]
    fn test_observe_detects_respawn() {
        let registry = NodeRegistry::new(addr(1));
        let first = BootToken::calculate(1000, false);
        let second = BootToken::calculate(2000, false);

        let (_, obs) = registry.observe(addr(2), first);
        assert_eq!(obs, Observation::New);
        let (_, obs) = registry.observe(addr(2), first);
        assert_eq!(obs, Observation::Known);
        let (node, obs) = registry.observe(addr(2), second);
        assert_eq!(obs, Observation::Respawned);
        assert_eq!(node.token(), second);
        // Undefined tokens never count as a respawn
        let (_, obs) = registry.observe(addr(2), BootToken::UNDEFINED);
        assert_eq!(obs, Observation::Known);
    }

    #[test]
    fn test_task_numbers_start_at_one() {
        let registry = NodeRegistry::new(addr(1));
        let node = registry.intern(addr(2));
        assert_eq!(node.next_task_number(), 1);
        assert_eq!(node.next_task_number(), 2);
        node.reset_task_numbers();
        assert_eq!(node.next_task_number(), 1);
    }

    #[test]
    fn test_roll_up_of_contiguous_tasks() {
        let node = Node::new(addr(2), 1);
        for task in [1, 2, 4] {
            let (_, inserted) = node.record_task(acked_call(task));
            assert!(inserted);
        }
        let pending = Arc::new(RpcCall::new(3));
        node.record_task(pending.clone());

        node.remove_task_tracking();
        assert_eq!(node.removed_task_ids(), 2);
        assert!(matches!(node.has_task(1), Some(WorkEntry::Completed)));
        assert!(matches!(node.has_task(3), Some(WorkEntry::Call(_))));

        pending.mark_ack_acked();
        node.remove_task_tracking();
        assert_eq!(node.removed_task_ids(), 4);
        assert_eq!(node.incoming_work(), 0);

        // A late duplicate of a rolled-up task is recognised as completed
        let (entry, inserted) = node.record_task(Arc::new(RpcCall::new(2)));
        assert!(matches!(entry, WorkEntry::Completed));
        assert!(!inserted);
    }

    #[test]
    fn test_record_task_keeps_first() {
        let node = Node::new(addr(2), 1);
        let first = Arc::new(RpcCall::new(1));
        node.record_task(first.clone());
        let (entry, inserted) = node.record_task(Arc::new(RpcCall::new(1)));
        assert!(!inserted);
        match entry {
            WorkEntry::Call(call) => assert!(Arc::ptr_eq(&call, &first)),
            WorkEntry::Completed => panic!("expected the first call"),
        }
    }

    #[test]
    fn test_rebooted_clears_work() {
        let node = Node::new(addr(2), 1);
        node.record_task(acked_call(1));
        node.remove_task_tracking();
        node.record_task(Arc::new(RpcCall::new(2)));
        node.rebooted();
        assert_eq!(node.removed_task_ids(), 0);
        assert_eq!(node.incoming_work(), 0);
        assert!(node.has_task(1).is_none());
    }
}
