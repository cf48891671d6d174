//! Packet header codec
//!
//! Every datagram and every stream frame starts with the same fixed header:
//!
//! | Offset | Size | Field        |
//! |--------|------|--------------|
//! | 0      | 1    | udp type     |
//! | 1      | 2    | sender port  |
//! | 3      | 2    | boot token   |
//! | 5      | 4    | task number  |
//! | 9      | 1    | rpc flag     |
//!
//! All integers are big-endian. The payload follows the header.

use std::fmt::{Display, Formatter};

use bytes::{Buf, BufMut, Bytes, BytesMut};

use rill_common::{Result, RillError};

use crate::model::BootToken;

pub const HEADER_LEN: usize = 10;

/// Control byte selecting how a packet is dispatched
#[repr(u8)]
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum UdpType {
    Heartbeat = 1,
    Rebooted = 2,
    Exec = 3,
    Ack = 4,
    AckAck = 5,
    Nack = 6,
}

impl UdpType {
    pub fn as_str(&self) -> &'static str {
        match self {
            UdpType::Heartbeat => "heartbeat",
            UdpType::Rebooted => "rebooted",
            UdpType::Exec => "exec",
            UdpType::Ack => "ack",
            UdpType::AckAck => "ackack",
            UdpType::Nack => "nack",
        }
    }
}

impl Display for UdpType {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

impl TryFrom<u8> for UdpType {
    type Error = RillError;

    fn try_from(value: u8) -> Result<Self> {
        match value {
            1 => Ok(UdpType::Heartbeat),
            2 => Ok(UdpType::Rebooted),
            3 => Ok(UdpType::Exec),
            4 => Ok(UdpType::Ack),
            5 => Ok(UdpType::AckAck),
            6 => Ok(UdpType::Nack),
            other => Err(RillError::SerializationError(format!(
                "unknown udp type {}",
                other
            ))),
        }
    }
}

/// Which copy of a request or reply a packet carries
#[repr(u8)]
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash)]
pub enum RpcFlag {
    #[default]
    None = 0,
    /// Request with its full payload
    RequestFull = 1,
    /// Resend of a request whose full copy went by stream; no payload
    RequestReminder = 2,
    /// Reply with its full payload
    ReplyFull = 3,
    /// Answer to a duplicate request whose full reply went by stream; no payload
    ReplyViaStream = 4,
    /// The sender gave up on the task; the receiver retires its number
    /// without running it. No payload
    RequestRelease = 5,
}

impl TryFrom<u8> for RpcFlag {
    type Error = RillError;

    fn try_from(value: u8) -> Result<Self> {
        match value {
            0 => Ok(RpcFlag::None),
            1 => Ok(RpcFlag::RequestFull),
            2 => Ok(RpcFlag::RequestReminder),
            3 => Ok(RpcFlag::ReplyFull),
            4 => Ok(RpcFlag::ReplyViaStream),
            5 => Ok(RpcFlag::RequestRelease),
            other => Err(RillError::SerializationError(format!(
                "unknown rpc flag {}",
                other
            ))),
        }
    }
}

/// Reason carried by a `Rebooted` kill signal
#[repr(u8)]
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum RebootReason {
    /// The sender restarted; drop any state held for it
    Reboot = 0,
    /// Orderly stop of the whole cluster
    Shutdown = 1,
    /// The cloud is locked and refuses the receiver
    Locked = 2,
    /// The receiver runs a different build
    Mismatch = 3,
    Error = 4,
}

impl RebootReason {
    pub fn as_str(&self) -> &'static str {
        match self {
            RebootReason::Reboot => "reboot",
            RebootReason::Shutdown => "shutdown",
            RebootReason::Locked => "locked",
            RebootReason::Mismatch => "mismatch",
            RebootReason::Error => "error",
        }
    }
}

impl Display for RebootReason {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

impl TryFrom<u8> for RebootReason {
    type Error = RillError;

    fn try_from(value: u8) -> Result<Self> {
        match value {
            0 => Ok(RebootReason::Reboot),
            1 => Ok(RebootReason::Shutdown),
            2 => Ok(RebootReason::Locked),
            3 => Ok(RebootReason::Mismatch),
            4 => Ok(RebootReason::Error),
            other => Err(RillError::SerializationError(format!(
                "unknown reboot reason {}",
                other
            ))),
        }
    }
}

/// Fixed packet header
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct PacketHeader {
    pub udp_type: UdpType,
    /// Port the sender listens on; with the source IP it names the sender
    pub port: u16,
    pub token: BootToken,
    pub task: u32,
    pub flag: RpcFlag,
}

impl PacketHeader {
    pub fn new(udp_type: UdpType, port: u16, token: BootToken) -> Self {
        Self {
            udp_type,
            port,
            token,
            task: 0,
            flag: RpcFlag::None,
        }
    }

    pub fn with_task(mut self, task: u32, flag: RpcFlag) -> Self {
        self.task = task;
        self.flag = flag;
        self
    }

    /// Write the header followed by `payload` into a fresh buffer
    pub fn encode(&self, payload: &[u8]) -> Bytes {
        let mut buf = BytesMut::with_capacity(HEADER_LEN + payload.len());
        buf.put_u8(self.udp_type as u8);
        buf.put_u16(self.port);
        buf.put_u16(self.token.raw());
        buf.put_u32(self.task);
        buf.put_u8(self.flag as u8);
        buf.put_slice(payload);
        buf.freeze()
    }

    /// Split a received frame into its header and payload
    pub fn decode(mut frame: Bytes) -> Result<(PacketHeader, Bytes)> {
        if frame.len() < HEADER_LEN {
            return Err(RillError::SerializationError(format!(
                "short packet: {} bytes",
                frame.len()
            )));
        }
        let udp_type = UdpType::try_from(frame.get_u8())?;
        let port = frame.get_u16();
        let token = BootToken::from_raw(frame.get_u16());
        let task = frame.get_u32();
        let flag = RpcFlag::try_from(frame.get_u8())?;
        Ok((
            PacketHeader {
                udp_type,
                port,
                token,
                task,
                flag,
            },
            frame,
        ))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    #[test]
    fn test_header_layout() {
        let header = PacketHeader::new(UdpType::Exec, 0x1234, BootToken::from_raw(0x0042))
            .with_task(7, RpcFlag::RequestFull);
        let bytes = header.encode(b"xy");
        assert_eq!(
            &bytes[..],
            &[3, 0x12, 0x34, 0x00, 0x42, 0, 0, 0, 7, 1, b'x', b'y']
        );
    }

    #[test]
    fn test_decode_rejects_short_and_unknown() {
        assert!(PacketHeader::decode(Bytes::from_static(&[1, 2, 3])).is_err());
        let mut bad = vec![99u8];
        bad.extend_from_slice(&[0; HEADER_LEN - 1]);
        assert!(PacketHeader::decode(Bytes::from(bad)).is_err());
    }

    #[test]
    fn test_rpc_flag_codes() {
        for flag in [
            RpcFlag::None,
            RpcFlag::RequestFull,
            RpcFlag::RequestReminder,
            RpcFlag::ReplyFull,
            RpcFlag::ReplyViaStream,
            RpcFlag::RequestRelease,
        ] {
            assert_eq!(RpcFlag::try_from(flag as u8).unwrap(), flag);
        }
        assert!(RpcFlag::try_from(6).is_err());
    }

    #[test]
    fn test_reboot_reason_codes() {
        for reason in [
            RebootReason::Reboot,
            RebootReason::Shutdown,
            RebootReason::Locked,
            RebootReason::Mismatch,
            RebootReason::Error,
        ] {
            assert_eq!(RebootReason::try_from(reason as u8).unwrap(), reason);
        }
        assert!(RebootReason::try_from(42).is_err());
    }

    proptest! {
        #[test]
        fn prop_header_decodes_what_it_encodes(
            kind in 1u8..=6,
            port in any::<u16>(),
            token in any::<u16>(),
            task in any::<u32>(),
            flag in 0u8..=4,
            payload in proptest::collection::vec(any::<u8>(), 0..64),
        ) {
            let header = PacketHeader {
                udp_type: UdpType::try_from(kind).unwrap(),
                port,
                token: BootToken::from_raw(token),
                task,
                flag: RpcFlag::try_from(flag).unwrap(),
            };
            let (decoded, body) = PacketHeader::decode(header.encode(&payload)).unwrap();
            prop_assert_eq!(decoded, header);
            prop_assert_eq!(&body[..], &payload[..]);
        }
    }
}
