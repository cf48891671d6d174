//! Packet-level wire format

pub mod packet;

pub use packet::{HEADER_LEN, PacketHeader, RebootReason, RpcFlag, UdpType};
