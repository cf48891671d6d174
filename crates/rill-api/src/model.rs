//! Node identity and heartbeat models

use std::fmt::{Display, Formatter};
use std::str::FromStr;

use serde::{Deserialize, Serialize};

/// Liveness state of a node as seen by the local node
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub enum NodeState {
    /// Seen but not yet part of an agreed cloud
    Starting,
    #[default]
    Up,
    /// Not heard from for longer than the suspect threshold
    Suspicious,
    /// Removed (evicted client) or halted
    Down,
}

impl NodeState {
    pub fn as_str(&self) -> &'static str {
        match self {
            NodeState::Starting => "STARTING",
            NodeState::Up => "UP",
            NodeState::Suspicious => "SUSPICIOUS",
            NodeState::Down => "DOWN",
        }
    }

    pub fn is_healthy(&self) -> bool {
        matches!(self, NodeState::Up)
    }
}

impl Display for NodeState {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

impl FromStr for NodeState {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "STARTING" => Ok(NodeState::Starting),
            "UP" => Ok(NodeState::Up),
            "SUSPICIOUS" => Ok(NodeState::Suspicious),
            "DOWN" => Ok(NodeState::Down),
            _ => Err(format!("Invalid node state: {}", s)),
        }
    }
}

/// Compact per-process boot token.
///
/// Low 15 bits come from the boot time, the high bit is the client flag.
/// Zero means "not known yet" and is never produced by [`BootToken::calculate`].
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct BootToken(u16);

impl BootToken {
    pub const UNDEFINED: BootToken = BootToken(0);

    const CLIENT_BIT: u16 = 0x8000;
    const TIME_MASK: u16 = 0x7FFF;

    pub fn calculate(boot_millis: i64, is_client: bool) -> Self {
        let mut low = (boot_millis as u64 & Self::TIME_MASK as u64) as u16;
        if low == 0 {
            low = 1;
        }
        if is_client {
            BootToken(low | Self::CLIENT_BIT)
        } else {
            BootToken(low)
        }
    }

    pub fn from_raw(raw: u16) -> Self {
        BootToken(raw)
    }

    pub fn raw(self) -> u16 {
        self.0
    }

    pub fn is_defined(self) -> bool {
        self.0 & Self::TIME_MASK != 0
    }

    pub fn is_client(self) -> bool {
        self.is_defined() && self.0 & Self::CLIENT_BIT != 0
    }

    /// Two defined tokens for the same address that differ mean the process
    /// behind that address restarted.
    pub fn has_respawned(old: BootToken, new: BootToken) -> bool {
        old.is_defined() && new.is_defined() && old != new
    }
}

impl Display for BootToken {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(f, "{:#06x}", self.0)
    }
}

/// Resource usage reported in every heartbeat
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct ResourceStats {
    pub free_mem: u64,
    pub total_mem: u64,
    pub num_cpus: u16,
    pub system_load: f32,
    /// Outgoing tasks not yet finished
    pub outstanding_tasks: u32,
    /// Incoming tasks still held until ACKACK
    pub incoming_work: u32,
}

/// One node's self-reported status, regenerated every heartbeat interval
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct HeartBeat {
    /// Wrapping sum of the hashes of every node the sender has proposed
    pub cloud_hash: i32,
    /// Size of the cloud the sender currently publishes
    pub cloud_size: u16,
    pub common_knowledge: bool,
    pub client: bool,
    /// Client whose disappearance stops the whole cluster
    pub controlling: bool,
    pub cloud_name_hash: i32,
    /// md5 of the build version; nodes with different hashes never mix
    pub build_hash: String,
    pub stats: ResourceStats,
}

/// Stable 31-polynomial string hash used for cluster names
pub fn name_hash(name: &str) -> i32 {
    name.bytes()
        .fold(0i32, |h, b| h.wrapping_mul(31).wrapping_add(b as i32))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_node_state_round_trip_str() {
        for state in [
            NodeState::Starting,
            NodeState::Up,
            NodeState::Suspicious,
            NodeState::Down,
        ] {
            assert_eq!(state.as_str().parse::<NodeState>().unwrap(), state);
        }
        assert!("NOPE".parse::<NodeState>().is_err());
        assert!(NodeState::Up.is_healthy());
        assert!(!NodeState::Suspicious.is_healthy());
    }

    #[test]
    fn test_boot_token_flags() {
        let server = BootToken::calculate(1_700_000_123_456, false);
        let client = BootToken::calculate(1_700_000_123_456, true);
        assert!(server.is_defined());
        assert!(!server.is_client());
        assert!(client.is_client());
        assert_ne!(server, client);
        assert!(!BootToken::UNDEFINED.is_defined());
    }

    #[test]
    fn test_boot_token_never_zero() {
        // low 15 bits of this timestamp are all zero
        let token = BootToken::calculate(0x8000 * 12345, false);
        assert!(token.is_defined());
    }

    #[test]
    fn test_has_respawned() {
        let a = BootToken::calculate(1000, false);
        let b = BootToken::calculate(2000, false);
        assert!(BootToken::has_respawned(a, b));
        assert!(!BootToken::has_respawned(a, a));
        assert!(!BootToken::has_respawned(BootToken::UNDEFINED, b));
        assert!(!BootToken::has_respawned(a, BootToken::UNDEFINED));
    }

    #[test]
    fn test_name_hash_is_stable() {
        assert_eq!(name_hash(""), 0);
        assert_eq!(name_hash("a"), 97);
        assert_eq!(name_hash("ab"), 97 * 31 + 98);
        assert_ne!(name_hash("rill"), name_hash("rill2"));
    }
}
