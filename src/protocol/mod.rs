//! Wire protocol definitions
//!
//! Defines the fixed-size packet exchanged between mood devices and the
//! checksum that guards it.

mod crc;
mod packet;

pub use crc::crc16;
pub use packet::{
    EventKind, Packet, PacketError, Unverified, CHECKSUM_OFFSET, MAX_PAYLOAD_SIZE, PACKET_SIZE,
};
