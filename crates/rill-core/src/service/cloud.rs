// Cloud snapshot
// An immutable, sorted membership array; replaced wholesale on every change

use std::net::SocketAddr;
use std::sync::Arc;

use crate::service::node::Node;

/// One agreed membership epoch
#[derive(Clone, Debug, Default)]
pub struct Cloud {
    members: Vec<Arc<Node>>,
    hash: i32,
    epoch: u64,
}

impl Cloud {
    /// Build a cloud from an unordered member set
    pub fn new(mut members: Vec<Arc<Node>>, hash: i32, epoch: u64) -> Self {
        members.sort_by_key(|n| n.addr());
        members.dedup_by_key(|n| n.addr());
        Self {
            members,
            hash,
            epoch,
        }
    }

    pub fn size(&self) -> usize {
        self.members.len()
    }

    pub fn is_empty(&self) -> bool {
        self.members.is_empty()
    }

    pub fn hash(&self) -> i32 {
        self.hash
    }

    pub fn epoch(&self) -> u64 {
        self.epoch
    }

    /// First member in canonical order
    pub fn leader(&self) -> Option<&Arc<Node>> {
        self.members.first()
    }

    /// Position of `addr` in the canonical order
    pub fn nidx(&self, addr: &SocketAddr) -> Option<usize> {
        self.members.binary_search_by_key(addr, |n| n.addr()).ok()
    }

    pub fn contains(&self, addr: &SocketAddr) -> bool {
        self.nidx(addr).is_some()
    }

    pub fn member_at(&self, idx: usize) -> Option<&Arc<Node>> {
        self.members.get(idx)
    }

    pub fn members(&self) -> &[Arc<Node>] {
        &self.members
    }

    pub fn addresses(&self) -> Vec<SocketAddr> {
        self.members.iter().map(|n| n.addr()).collect()
    }
}

impl std::fmt::Display for Cloud {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let addrs: Vec<String> = self.members.iter().map(|n| n.addr().to_string()).collect();
        write!(f, "{:#010x}[{}]", self.hash, addrs.join(", "))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::service::node::NodeRegistry;

    #[test]
    fn test_cloud_is_sorted_and_indexed() {
        let registry = NodeRegistry::new("127.0.0.1:9003".parse().unwrap());
        let members = vec![
            registry.self_node(),
            registry.intern("127.0.0.1:9001".parse().unwrap()),
            registry.intern("127.0.0.1:9002".parse().unwrap()),
        ];
        let cloud = Cloud::new(members, 42, 1);

        assert_eq!(cloud.size(), 3);
        assert_eq!(
            cloud.leader().unwrap().addr(),
            "127.0.0.1:9001".parse::<SocketAddr>().unwrap()
        );
        assert_eq!(cloud.nidx(&"127.0.0.1:9003".parse().unwrap()), Some(2));
        assert!(!cloud.contains(&"127.0.0.1:9004".parse().unwrap()));
        assert_eq!(cloud.to_string(), "0x0000002a[127.0.0.1:9001, 127.0.0.1:9002, 127.0.0.1:9003]");
    }

    #[test]
    fn test_empty_cloud() {
        let cloud = Cloud::default();
        assert!(cloud.is_empty());
        assert!(cloud.leader().is_none());
    }
}
