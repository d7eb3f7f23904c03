//! CRC-16 used for packet integrity
//!
//! Reflected CCITT polynomial (0x8408), seeded with 0xFFFF, no final xor.

/// Initial CRC register value
const CRC_INIT: u16 = 0xFFFF;

/// Reflected form of the CCITT polynomial 0x1021
const CRC_POLY: u16 = 0x8408;

/// Compute the CRC-16 of `data`
pub fn crc16(data: &[u8]) -> u16 {
    let mut crc = CRC_INIT;
    for &byte in data {
        crc ^= byte as u16;
        for _ in 0..8 {
            if crc & 1 != 0 {
                crc = (crc >> 1) ^ CRC_POLY;
            } else {
                crc >>= 1;
            }
        }
    }
    crc
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_empty_input_is_seed() {
        assert_eq!(crc16(&[]), 0xFFFF);
    }

    #[test]
    fn test_check_value() {
        // CRC-16/X-25 without its final xor: 0x906E ^ 0xFFFF
        assert_eq!(crc16(b"123456789"), 0x906E ^ 0xFFFF);
    }

    #[test]
    fn test_single_bit_changes_crc() {
        let a = crc16(b"sync\0");
        let b = crc16(b"sync\x01");
        assert_ne!(a, b);
    }
}
