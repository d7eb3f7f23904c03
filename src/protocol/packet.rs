//! Packet definitions for the moodlink protocol
//!
//! Packet format (33 bytes, fixed size, little-endian):
//! - is_broadcast: 1 byte
//! - event_kind: 1 byte
//! - sequence: 4 bytes
//! - send_time: 8 bytes (sender local clock, ms)
//! - checksum: 2 bytes (CRC-16 over the packet with this field zeroed)
//! - payload_len: 1 byte (bytes used in payload, including the terminator)
//! - payload: 16 bytes (null-terminated text, random non-zero padding)

use rand::Rng;
use thiserror::Error;

use super::crc::crc16;

/// Total packet size in bytes
pub const PACKET_SIZE: usize = 33;

/// Payload buffer size, terminator included
pub const MAX_PAYLOAD_SIZE: usize = 16;

/// Offset of the checksum field
pub const CHECKSUM_OFFSET: usize = 14;

const BROADCAST_OFFSET: usize = 0;
const KIND_OFFSET: usize = 1;
const SEQUENCE_OFFSET: usize = 2;
const SEND_TIME_OFFSET: usize = 6;
const PAYLOAD_LEN_OFFSET: usize = 16;
const PAYLOAD_OFFSET: usize = 17;

/// Application-level message type
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum EventKind {
    /// Client asks a server to bind
    JoinRequest = 0,
    /// Server accepts a client
    JoinResponse = 1,
    /// Server pushes a mood to its clients
    Update = 2,
    /// Server clock beacon
    Sync = 3,
    /// Anything this layer does not act on
    Ignore = 6,
}

impl From<u8> for EventKind {
    fn from(value: u8) -> Self {
        match value {
            0 => EventKind::JoinRequest,
            1 => EventKind::JoinResponse,
            2 => EventKind::Update,
            3 => EventKind::Sync,
            _ => EventKind::Ignore,
        }
    }
}

/// Errors produced while encoding or validating packets
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum PacketError {
    #[error("Packet too short: {len} bytes (need {PACKET_SIZE})")]
    TooShort { len: usize },

    #[error("Payload length {0} outside 1..={MAX_PAYLOAD_SIZE}")]
    PayloadLength(u8),

    #[error("Payload is not null-terminated")]
    NotTerminated,

    #[error("Checksum mismatch: expected {expected:#06x}, computed {computed:#06x}")]
    ChecksumMismatch { expected: u16, computed: u16 },

    #[error("Payload needs {len} bytes with terminator (max {MAX_PAYLOAD_SIZE})")]
    PayloadTooLong { len: usize },

    #[error("Payload contains a NUL byte")]
    InteriorNul,
}

/// A moodlink packet
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Packet {
    pub is_broadcast: bool,
    pub kind: EventKind,
    pub sequence: u32,
    pub send_time: i64,
    pub checksum: u16,
    pub payload_len: u8,
    pub payload: [u8; MAX_PAYLOAD_SIZE],
}

impl Packet {
    /// Build a packet carrying `text`, with padding and checksum filled in.
    ///
    /// Text that does not fit the payload buffer together with its
    /// terminator is rejected rather than truncated.
    pub fn new(
        kind: EventKind,
        sequence: u32,
        send_time: i64,
        text: &str,
        is_broadcast: bool,
    ) -> Result<Self, PacketError> {
        let text = text.as_bytes();
        if text.contains(&0) {
            return Err(PacketError::InteriorNul);
        }

        let used = text.len() + 1;
        if used > MAX_PAYLOAD_SIZE {
            return Err(PacketError::PayloadTooLong { len: used });
        }

        let mut payload = [0u8; MAX_PAYLOAD_SIZE];
        payload[..text.len()].copy_from_slice(text);

        // Padding must never be zero so encrypted frames carry no fixed plaintext
        let mut rng = rand::thread_rng();
        for byte in &mut payload[used..] {
            *byte = rng.gen_range(1..=u8::MAX);
        }

        let mut packet = Self {
            is_broadcast,
            kind,
            sequence,
            send_time,
            checksum: 0,
            payload_len: used as u8,
            payload,
        };
        packet.checksum = packet.compute_checksum();
        Ok(packet)
    }

    /// CRC-16 over the serialized packet with the checksum field zeroed
    pub fn compute_checksum(&self) -> u16 {
        let mut bytes = self.to_bytes();
        bytes[CHECKSUM_OFFSET..CHECKSUM_OFFSET + 2].fill(0);
        crc16(&bytes)
    }

    /// Serialize the packet to its wire form
    pub fn to_bytes(&self) -> [u8; PACKET_SIZE] {
        let mut buf = [0u8; PACKET_SIZE];
        buf[BROADCAST_OFFSET] = self.is_broadcast as u8;
        buf[KIND_OFFSET] = self.kind as u8;
        buf[SEQUENCE_OFFSET..SEND_TIME_OFFSET].copy_from_slice(&self.sequence.to_le_bytes());
        buf[SEND_TIME_OFFSET..CHECKSUM_OFFSET].copy_from_slice(&self.send_time.to_le_bytes());
        buf[CHECKSUM_OFFSET..PAYLOAD_LEN_OFFSET].copy_from_slice(&self.checksum.to_le_bytes());
        buf[PAYLOAD_LEN_OFFSET] = self.payload_len;
        buf[PAYLOAD_OFFSET..].copy_from_slice(&self.payload);
        buf
    }

    /// Validate received bytes and decode them.
    ///
    /// Bytes beyond `PACKET_SIZE` are ignored.
    pub fn validate(data: &[u8]) -> Result<Self, PacketError> {
        if data.len() < PACKET_SIZE {
            return Err(PacketError::TooShort { len: data.len() });
        }

        let payload_len = data[PAYLOAD_LEN_OFFSET];
        if payload_len == 0 || payload_len as usize > MAX_PAYLOAD_SIZE {
            return Err(PacketError::PayloadLength(payload_len));
        }

        if data[PAYLOAD_OFFSET + payload_len as usize - 1] != 0 {
            return Err(PacketError::NotTerminated);
        }

        let mut raw = [0u8; PACKET_SIZE];
        raw.copy_from_slice(&data[..PACKET_SIZE]);
        let expected = u16::from_le_bytes([raw[CHECKSUM_OFFSET], raw[CHECKSUM_OFFSET + 1]]);
        raw[CHECKSUM_OFFSET..CHECKSUM_OFFSET + 2].fill(0);
        let computed = crc16(&raw);
        if computed != expected {
            return Err(PacketError::ChecksumMismatch { expected, computed });
        }

        let mut payload = [0u8; MAX_PAYLOAD_SIZE];
        payload.copy_from_slice(&data[PAYLOAD_OFFSET..PACKET_SIZE]);

        Ok(Self {
            is_broadcast: data[BROADCAST_OFFSET] != 0,
            kind: EventKind::from(data[KIND_OFFSET]),
            sequence: u32::from_le_bytes([data[2], data[3], data[4], data[5]]),
            send_time: i64::from_le_bytes([
                data[6], data[7], data[8], data[9], data[10], data[11], data[12], data[13],
            ]),
            checksum: expected,
            payload_len,
            payload,
        })
    }

    /// Payload bytes in use, terminator included
    pub fn payload_bytes(&self) -> &[u8] {
        &self.payload[..self.payload_len as usize]
    }

    /// Payload text up to the first NUL, if it is valid UTF-8
    pub fn mood(&self) -> Option<&str> {
        let bytes = self.payload_bytes();
        let end = bytes.iter().position(|&b| b == 0).unwrap_or(bytes.len());
        std::str::from_utf8(&bytes[..end]).ok()
    }
}

/// Received bytes whose integrity has not been checked yet.
///
/// The event kind can be peeked for routing, but the packet itself is only
/// reachable through [`Unverified::validate`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Unverified {
    bytes: Vec<u8>,
}

impl Unverified {
    pub fn new(bytes: Vec<u8>) -> Self {
        Self { bytes }
    }

    /// Number of bytes actually received
    pub fn len(&self) -> usize {
        self.bytes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.bytes.is_empty()
    }

    /// Untrusted event kind read straight from the header
    pub fn peek_kind(&self) -> EventKind {
        self.bytes
            .get(KIND_OFFSET)
            .map(|&b| EventKind::from(b))
            .unwrap_or(EventKind::Ignore)
    }

    /// Check length, terminator and checksum, then decode
    pub fn validate(&self) -> Result<Packet, PacketError> {
        Packet::validate(&self.bytes)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn reseal(bytes: &mut [u8; PACKET_SIZE]) {
        bytes[CHECKSUM_OFFSET..CHECKSUM_OFFSET + 2].fill(0);
        let crc = crc16(bytes);
        bytes[CHECKSUM_OFFSET..CHECKSUM_OFFSET + 2].copy_from_slice(&crc.to_le_bytes());
    }

    #[test]
    fn test_packet_roundtrip() {
        let cases = [
            (EventKind::JoinRequest, "join_request"),
            (EventKind::Update, "happy"),
            (EventKind::Sync, ""),
            (EventKind::JoinResponse, "fifteen_chars__"),
        ];

        for (seq, (kind, text)) in cases.into_iter().enumerate() {
            let original = Packet::new(kind, seq as u32, 5000 + seq as i64, text, seq % 2 == 0)
                .expect("Failed to encode packet");
            let decoded = Packet::validate(&original.to_bytes()).expect("Failed to decode packet");

            assert_eq!(decoded.kind, original.kind);
            assert_eq!(decoded.sequence, original.sequence);
            assert_eq!(decoded.send_time, original.send_time);
            assert_eq!(decoded.is_broadcast, original.is_broadcast);
            assert_eq!(decoded.payload_len, original.payload_len);
            assert_eq!(decoded.payload_bytes(), original.payload_bytes());
            assert_eq!(decoded.mood(), Some(text));
        }
    }

    #[test]
    fn test_packet_size() {
        let packet = Packet::new(EventKind::Sync, 0, 0, "sync", true).unwrap();
        assert_eq!(packet.to_bytes().len(), PACKET_SIZE);
        assert_eq!(packet.payload_len, 5);
    }

    #[test]
    fn test_single_byte_flip_is_detected() {
        let packet = Packet::new(EventKind::Update, 7, 123_456, "relaxed", true).unwrap();
        let bytes = packet.to_bytes();

        for index in (0..PACKET_SIZE).filter(|i| !(CHECKSUM_OFFSET..CHECKSUM_OFFSET + 2).contains(i))
        {
            for mask in [0x01u8, 0x80, 0xFF] {
                let mut corrupted = bytes;
                corrupted[index] ^= mask;
                assert!(
                    Packet::validate(&corrupted).is_err(),
                    "flip of byte {} with mask {:#04x} went undetected",
                    index,
                    mask
                );
            }
        }
    }

    #[test]
    fn test_payload_len_out_of_range_rejected_with_valid_checksum() {
        let packet = Packet::new(EventKind::Update, 1, 1, "sad", false).unwrap();

        for bad_len in [0u8, 17, 200] {
            let mut bytes = packet.to_bytes();
            bytes[PAYLOAD_LEN_OFFSET] = bad_len;
            reseal(&mut bytes);
            assert_eq!(
                Packet::validate(&bytes),
                Err(PacketError::PayloadLength(bad_len))
            );
        }
    }

    #[test]
    fn test_missing_terminator_rejected() {
        let packet = Packet::new(EventKind::Update, 1, 1, "sad", false).unwrap();
        let mut bytes = packet.to_bytes();
        bytes[PAYLOAD_LEN_OFFSET] = 3;
        reseal(&mut bytes);
        assert_eq!(Packet::validate(&bytes), Err(PacketError::NotTerminated));
    }

    #[test]
    fn test_too_short_rejected() {
        let packet = Packet::new(EventKind::Sync, 0, 0, "sync", true).unwrap();
        let bytes = packet.to_bytes();
        assert_eq!(
            Packet::validate(&bytes[..PACKET_SIZE - 1]),
            Err(PacketError::TooShort {
                len: PACKET_SIZE - 1
            })
        );
    }

    #[test]
    fn test_trailing_bytes_ignored() {
        let packet = Packet::new(EventKind::Sync, 3, 9, "sync", true).unwrap();
        let mut bytes = packet.to_bytes().to_vec();
        bytes.extend_from_slice(&[0xAA, 0xBB]);
        assert_eq!(Packet::validate(&bytes), Ok(packet));
    }

    #[test]
    fn test_oversized_payload_rejected() {
        // 16 characters need 17 bytes with the terminator
        let result = Packet::new(EventKind::Update, 0, 0, "sixteen_chars___", true);
        assert_eq!(result, Err(PacketError::PayloadTooLong { len: 17 }));
    }

    #[test]
    fn test_interior_nul_rejected() {
        let result = Packet::new(EventKind::Update, 0, 0, "ha\0ppy", true);
        assert_eq!(result, Err(PacketError::InteriorNul));
    }

    #[test]
    fn test_padding_is_never_zero() {
        for _ in 0..32 {
            let packet = Packet::new(EventKind::Sync, 0, 0, "", true).unwrap();
            assert_eq!(packet.payload[0], 0);
            assert!(packet.payload[1..].iter().all(|&b| b != 0));
        }
    }

    #[test]
    fn test_event_kind_conversion() {
        assert_eq!(EventKind::from(0), EventKind::JoinRequest);
        assert_eq!(EventKind::from(1), EventKind::JoinResponse);
        assert_eq!(EventKind::from(2), EventKind::Update);
        assert_eq!(EventKind::from(3), EventKind::Sync);
        assert_eq!(EventKind::from(6), EventKind::Ignore);
        assert_eq!(EventKind::from(0xFF), EventKind::Ignore);
    }

    #[test]
    fn test_unverified_peek_and_validate() {
        let packet = Packet::new(EventKind::JoinResponse, 4, 10, "join_response", false).unwrap();
        let frame = Unverified::new(packet.to_bytes().to_vec());
        assert_eq!(frame.peek_kind(), EventKind::JoinResponse);
        assert_eq!(frame.len(), PACKET_SIZE);
        assert_eq!(frame.validate(), Ok(packet));

        let garbage = Unverified::new(vec![0, 3, 1]);
        assert_eq!(garbage.peek_kind(), EventKind::Sync);
        assert!(garbage.validate().is_err());

        assert_eq!(Unverified::new(vec![1]).peek_kind(), EventKind::Ignore);
    }
}
