// Keys and home routing
// Global names for stored values and the deterministic mapping to their home node

use std::net::{Ipv4Addr, SocketAddr, SocketAddrV4};

use bytes::{BufMut, Bytes, BytesMut};
use serde::{Deserialize, Serialize};

use rill_common::{MAX_KEY_LEN, Result, RillError};

use crate::service::cloud::Cloud;

/// First byte of a system key that carries its own home address
pub const BUILT_IN_KEY: u8 = 2;

/// Bytes below this mark a system key
const USER_KEY_MIN: u8 = 32;

const HOMED_HEADER_LEN: usize = 7;

/// Opaque, immutable key bytes.
///
/// A first byte of 32 or above marks a user key; lower bytes are reserved for
/// system keys.
#[derive(Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(try_from = "Vec<u8>", into = "Vec<u8>")]
pub struct Key {
    bytes: Bytes,
}

impl Key {
    pub fn make(bytes: impl Into<Bytes>) -> Result<Self> {
        let bytes = bytes.into();
        if bytes.is_empty() {
            return Err(RillError::InvalidKey("empty key".to_string()));
        }
        if bytes.len() > MAX_KEY_LEN {
            return Err(RillError::InvalidKey(format!(
                "key of {} bytes exceeds {}",
                bytes.len(),
                MAX_KEY_LEN
            )));
        }
        Ok(Self { bytes })
    }

    /// A user-visible key named by `name`
    pub fn user(name: &str) -> Result<Self> {
        match name.as_bytes().first() {
            Some(b) if *b >= USER_KEY_MIN => Self::make(Bytes::copy_from_slice(name.as_bytes())),
            _ => Err(RillError::InvalidKey(format!(
                "'{}' is not a valid user key",
                name.escape_default()
            ))),
        }
    }

    /// A system key pinned to `home` while that node is a member
    pub fn system_homed(name: &str, home: SocketAddrV4) -> Result<Self> {
        let mut buf = BytesMut::with_capacity(HOMED_HEADER_LEN + name.len());
        buf.put_u8(BUILT_IN_KEY);
        buf.put_slice(&home.ip().octets());
        buf.put_u16(home.port());
        buf.put_slice(name.as_bytes());
        Self::make(buf.freeze())
    }

    pub fn bytes(&self) -> &Bytes {
        &self.bytes
    }

    pub fn len(&self) -> usize {
        self.bytes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.bytes.is_empty()
    }

    pub fn is_user_key(&self) -> bool {
        self.bytes[0] >= USER_KEY_MIN
    }

    /// Jenkins one-at-a-time hash of the key bytes
    pub fn hash(&self) -> i32 {
        let mut hash: i32 = 0;
        for b in self.bytes.iter() {
            hash = hash.wrapping_add(*b as i8 as i32);
            hash = hash.wrapping_add(hash << 10);
            hash ^= ((hash as u32) >> 6) as i32;
        }
        hash = hash.wrapping_add(hash << 3);
        hash ^= ((hash as u32) >> 11) as i32;
        hash.wrapping_add(hash << 15)
    }

    /// Explicit home encoded in a built-in system key
    pub fn pinned_home(&self) -> Option<SocketAddr> {
        if self.bytes[0] != BUILT_IN_KEY || self.bytes.len() < HOMED_HEADER_LEN {
            return None;
        }
        let b = &self.bytes;
        let ip = Ipv4Addr::new(b[1], b[2], b[3], b[4]);
        let port = u16::from_be_bytes([b[5], b[6]]);
        Some(SocketAddr::V4(SocketAddrV4::new(ip, port)))
    }

    /// Index of the home node within `cloud`, `None` for an empty cloud
    pub fn home_index(&self, cloud: &Cloud) -> Option<usize> {
        if cloud.is_empty() {
            return None;
        }
        if let Some(pinned) = self.pinned_home()
            && let Some(idx) = cloud.nidx(&pinned)
        {
            return Some(idx);
        }
        Some((self.hash() & 0x7FFF_FFFF) as usize % cloud.size())
    }

    pub fn home(&self, cloud: &Cloud) -> Option<SocketAddr> {
        self.home_index(cloud)
            .and_then(|idx| cloud.member_at(idx))
            .map(|n| n.addr())
    }
}

impl TryFrom<Vec<u8>> for Key {
    type Error = RillError;

    fn try_from(value: Vec<u8>) -> Result<Self> {
        Key::make(value)
    }
}

impl From<Key> for Vec<u8> {
    fn from(key: Key) -> Self {
        key.bytes.to_vec()
    }
}

impl std::fmt::Display for Key {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match std::str::from_utf8(&self.bytes) {
            Ok(s) if self.is_user_key() => write!(f, "{}", s),
            _ => write!(f, "0x{}", const_hex::encode(&self.bytes)),
        }
    }
}

impl std::fmt::Debug for Key {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "Key({})", self)
    }
}
