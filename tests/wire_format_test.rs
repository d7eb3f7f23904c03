//! Wire format tests
//!
//! Pins the field offsets of the 33-byte packet and the checksum: CRC-16
//! with reflected polynomial 0x8408, initial value 0xFFFF and no final xor
//! (check value 0x6F91).

use moodlink::protocol::{
    crc16, EventKind, Packet, PacketError, Unverified, CHECKSUM_OFFSET, PACKET_SIZE,
};

/// Test: Known checksum value
/// Given the CRC-16 check input "123456789"
/// Then the reflected 0x8408 CRC with init 0xFFFF yields 0x6F91
#[test]
fn test_crc_check_value() {
    assert_eq!(crc16(b"123456789"), 0x6F91);
}

/// Test: Field offsets
#[test]
fn test_field_offsets() {
    let packet = Packet::new(EventKind::Sync, 0x0403_0201, 0x0C0B_0A09_0807_0605, "sync", true)
        .unwrap();
    let bytes = packet.to_bytes();

    assert_eq!(bytes.len(), PACKET_SIZE);
    assert_eq!(bytes[0], 1);
    assert_eq!(bytes[1], 3);
    assert_eq!(&bytes[2..6], &[1, 2, 3, 4]);
    assert_eq!(&bytes[6..14], &[5, 6, 7, 8, 9, 10, 11, 12]);
    assert_eq!(
        u16::from_le_bytes([bytes[CHECKSUM_OFFSET], bytes[CHECKSUM_OFFSET + 1]]),
        packet.checksum
    );
    assert_eq!(bytes[16], 5);
    assert_eq!(&bytes[17..22], b"sync\0");
    assert!(bytes[22..].iter().all(|&b| b != 0));
}

/// Test: Any single corrupted byte is detected
/// Given encoded packets of every kind
/// When any byte outside the checksum field is altered
/// Then validation fails
#[test]
fn test_single_byte_corruption_detected() {
    let packets = [
        Packet::new(EventKind::JoinRequest, 0, 0, "join_request", true).unwrap(),
        Packet::new(EventKind::JoinResponse, 7, 1_234, "join_response", false).unwrap(),
        Packet::new(EventKind::Update, u32::MAX, -1, "", true).unwrap(),
        Packet::new(EventKind::Sync, 42, i64::MAX, "sync", true).unwrap(),
    ];

    for packet in &packets {
        let bytes = packet.to_bytes();
        assert_eq!(Packet::validate(&bytes).as_ref(), Ok(packet));

        for index in (0..PACKET_SIZE).filter(|i| !(CHECKSUM_OFFSET..CHECKSUM_OFFSET + 2).contains(i)) {
            for mask in [0x01u8, 0x80, 0xFF] {
                let mut corrupted = bytes;
                corrupted[index] ^= mask;
                assert!(
                    Packet::validate(&corrupted).is_err(),
                    "flip {:#04x} at {} went unnoticed",
                    mask,
                    index
                );
            }
        }
    }
}

/// Test: Payload length out of range is rejected even with a valid checksum
#[test]
fn test_payload_length_range() {
    let packet = Packet::new(EventKind::Update, 1, 1, "happy", true).unwrap();

    for len in [0u8, 17, 200, 255] {
        let mut bytes = packet.to_bytes();
        bytes[16] = len;
        bytes[CHECKSUM_OFFSET..CHECKSUM_OFFSET + 2].fill(0);
        let crc = crc16(&bytes);
        bytes[CHECKSUM_OFFSET..CHECKSUM_OFFSET + 2].copy_from_slice(&crc.to_le_bytes());

        assert_eq!(
            Packet::validate(&bytes),
            Err(PacketError::PayloadLength(len))
        );
    }
}

/// Test: Unverified frames expose only the tag until validated
#[test]
fn test_unverified_tag_is_untrusted() {
    let mut bytes = Packet::new(EventKind::Sync, 1, 1, "sync", true)
        .unwrap()
        .to_bytes()
        .to_vec();
    bytes[1] = EventKind::Update as u8;

    let frame = Unverified::new(bytes);
    assert_eq!(frame.peek_kind(), EventKind::Update);
    assert!(frame.validate().is_err());
    assert_eq!(Unverified::new(vec![0]).peek_kind(), EventKind::Ignore);
}
