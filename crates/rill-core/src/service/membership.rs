// Membership consensus
// Builds the agreed node set from gossiped heartbeats and locks it once data placement matters

use std::collections::{BTreeMap, BTreeSet};
use std::net::SocketAddr;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use parking_lot::{Mutex, RwLock};
use tokio::sync::Notify;
use tracing::{debug, info, warn};

use crate::service::cloud::Cloud;
use crate::service::node::Node;

/// Where this node stands in agreeing on a cloud
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ConsensusState {
    Unknown,
    /// Membership changed and is being re-verified
    Proposing,
    /// Every proposed member reports the same hash and size
    CommonKnowledge,
    /// Membership is frozen for the rest of the process
    Locked,
}

impl ConsensusState {
    pub fn as_str(&self) -> &'static str {
        match self {
            ConsensusState::Unknown => "UNKNOWN",
            ConsensusState::Proposing => "PROPOSING",
            ConsensusState::CommonKnowledge => "COMMON_KNOWLEDGE",
            ConsensusState::Locked => "LOCKED",
        }
    }
}

impl std::fmt::Display for ConsensusState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// What processing one heartbeat led to
#[derive(Debug)]
pub(crate) enum HeartbeatVerdict {
    /// Foreign cluster or nothing new
    Ignored,
    /// Build hashes differ; `alone` when this node has no cloud to protect
    Mismatch { alone: bool },
    /// Unknown node knocking on a locked cloud
    Locked,
    Accepted {
        joined: bool,
        formed: Option<Arc<Cloud>>,
    },
}

struct PaxosState {
    proposed: BTreeMap<SocketAddr, Arc<Node>>,
    common_knowledge: bool,
    state: ConsensusState,
    flatfile: BTreeSet<SocketAddr>,
    epoch: u64,
}

pub struct Membership {
    self_node: Arc<Node>,
    is_client: bool,
    expected_size: usize,
    cluster_name_hash: i32,
    build_hash: String,
    inner: Mutex<PaxosState>,
    cloud: RwLock<Arc<Cloud>>,
    changed: Notify,
    locked: AtomicBool,
}

impl Membership {
    pub fn new(
        self_node: Arc<Node>,
        is_client: bool,
        expected_size: usize,
        flatfile: impl IntoIterator<Item = SocketAddr>,
    ) -> Self {
        let heartbeat = self_node.heartbeat();
        let mut proposed = BTreeMap::new();
        // Clients never propose themselves
        if !is_client {
            proposed.insert(self_node.addr(), self_node.clone());
            self_node.update_heartbeat(|hb| hb.cloud_hash = self_node.hash());
        }
        let flatfile = flatfile
            .into_iter()
            .filter(|a| *a != self_node.addr())
            .collect();
        Self {
            is_client,
            expected_size,
            cluster_name_hash: heartbeat.cloud_name_hash,
            build_hash: heartbeat.build_hash,
            inner: Mutex::new(PaxosState {
                proposed,
                common_knowledge: false,
                state: ConsensusState::Unknown,
                flatfile,
                epoch: 0,
            }),
            cloud: RwLock::new(Arc::new(Cloud::default())),
            changed: Notify::new(),
            locked: AtomicBool::new(false),
            self_node,
        }
    }

    pub fn cloud(&self) -> Arc<Cloud> {
        self.cloud.read().clone()
    }

    pub fn is_locked(&self) -> bool {
        self.locked.load(Ordering::SeqCst)
    }

    pub fn state(&self) -> ConsensusState {
        self.inner.lock().state
    }

    pub fn has_common_knowledge(&self) -> bool {
        self.inner.lock().common_knowledge
    }

    pub fn proposed(&self) -> Vec<Arc<Node>> {
        self.inner.lock().proposed.values().cloned().collect()
    }

    pub fn flatfile(&self) -> Vec<SocketAddr> {
        self.inner.lock().flatfile.iter().copied().collect()
    }

    /// Member of the cloud, a proposed node, or a flatfile candidate
    pub fn is_known(&self, addr: &SocketAddr) -> bool {
        if self.cloud().contains(addr) {
            return true;
        }
        let inner = self.inner.lock();
        inner.proposed.contains_key(addr) || inner.flatfile.contains(addr)
    }

    /// Every address heartbeats go to, except this node
    pub fn gossip_targets(&self) -> BTreeSet<SocketAddr> {
        let inner = self.inner.lock();
        inner
            .flatfile
            .iter()
            .copied()
            .chain(inner.proposed.keys().copied())
            .filter(|a| *a != self.self_node.addr())
            .collect()
    }

    /// Run one heartbeat (already stored on `node`) through the consensus rules
    pub(crate) fn do_heartbeat(&self, node: &Arc<Node>) -> HeartbeatVerdict {
        let heartbeat = node.heartbeat();
        if heartbeat.cloud_name_hash != self.cluster_name_hash {
            return HeartbeatVerdict::Ignored;
        }
        if heartbeat.build_hash != self.build_hash {
            let alone = self.cloud().size() <= 1;
            return HeartbeatVerdict::Mismatch { alone };
        }

        let mut inner = self.inner.lock();
        let mut joined = false;
        if !inner.proposed.contains_key(&node.addr()) && !heartbeat.client {
            if self.is_locked() {
                return HeartbeatVerdict::Locked;
            }
            if inner.common_knowledge {
                inner.common_knowledge = false;
                self.self_node
                    .update_heartbeat(|hb| hb.common_knowledge = false);
                debug!("Cloud voting in progress");
            }
            inner.proposed.insert(node.addr(), node.clone());
            inner.state = ConsensusState::Proposing;
            self.self_node.update_heartbeat(|hb| {
                hb.cloud_hash = hb.cloud_hash.wrapping_add(node.hash());
            });
            joined = true;
            info!(node = %node.addr(), proposed = inner.proposed.len(), "Node joined the proposed cloud");
        } else if inner.common_knowledge {
            return HeartbeatVerdict::Ignored;
        }

        let chash = self.self_node.heartbeat().cloud_hash;
        let members: Vec<Arc<Node>> = inner.proposed.values().cloned().collect();
        if members.is_empty() {
            // A client stalls until it hears from some cloud
            return HeartbeatVerdict::Accepted {
                joined,
                formed: None,
            };
        }
        if let Some(other) = members.iter().find(|n| n.heartbeat().cloud_hash != chash) {
            debug!(
                self_hash = chash,
                node = %other.addr(),
                node_hash = other.heartbeat().cloud_hash,
                "Heartbeat hashes differ"
            );
            return HeartbeatVerdict::Accepted {
                joined,
                formed: None,
            };
        }

        // Hashes agree, publish the larger cloud
        let cloud = self.set_next_cloud(&mut inner, members.clone(), chash);

        if !members
            .iter()
            .all(|n| n.heartbeat().cloud_size as usize == cloud.size())
        {
            return HeartbeatVerdict::Accepted {
                joined,
                formed: None,
            };
        }

        self.self_node
            .update_heartbeat(|hb| hb.common_knowledge = true);
        if let Some(missing) = members.iter().find(|n| !n.heartbeat().common_knowledge) {
            debug!(node = %missing.addr(), "Missing common knowledge");
            return HeartbeatVerdict::Accepted {
                joined,
                formed: None,
            };
        }

        inner.common_knowledge = true;
        if !self.is_locked() {
            inner.state = ConsensusState::CommonKnowledge;
        }
        self.changed.notify_waiters();
        info!(size = cloud.size(), cloud = %cloud, "Cloud formed");
        HeartbeatVerdict::Accepted {
            joined,
            formed: Some(cloud),
        }
    }

    fn set_next_cloud(&self, inner: &mut PaxosState, members: Vec<Arc<Node>>, hash: i32) -> Arc<Cloud> {
        let current = self.cloud();
        if current.hash() == hash && current.size() == members.len() {
            return current;
        }
        inner.epoch += 1;
        let cloud = Arc::new(Cloud::new(members, hash, inner.epoch));
        let size = cloud.size() as u16;
        self.self_node.update_heartbeat(|hb| hb.cloud_size = size);
        *self.cloud.write() = cloud.clone();
        metrics::gauge!("rill_cloud_size").set(cloud.size() as f64);
        cloud
    }

    /// Wait for common knowledge (and the expected size), then freeze
    /// membership. Returns the cloud and whether this call did the locking.
    pub async fn lock(&self, reason: &str) -> (Arc<Cloud>, bool) {
        if self.is_locked() {
            return (self.cloud(), false);
        }
        loop {
            let notified = self.changed.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();
            {
                let mut inner = self.inner.lock();
                if self.is_locked() {
                    return (self.cloud(), false);
                }
                let cloud = self.cloud();
                if inner.common_knowledge && cloud.size() >= self.expected_size.max(1) {
                    self.locked.store(true, Ordering::SeqCst);
                    inner.state = ConsensusState::Locked;
                    info!(reason = %reason, size = cloud.size(), "Locking cloud to new members");

                    let PaxosState {
                        flatfile, proposed, ..
                    } = &mut *inner;
                    flatfile.retain(|addr| {
                        let keep = proposed.contains_key(addr);
                        if !keep {
                            warn!(node = %addr, "Removing node from flatfile as it is not part of the cloud");
                        }
                        keep
                    });
                    return (cloud, true);
                }
            }
            notified.await;
        }
    }

    /// Wake lock waiters, e.g. when the node halts
    pub(crate) fn wake_all(&self) {
        self.changed.notify_waiters();
    }

    pub fn is_client(&self) -> bool {
        self.is_client
    }
}
