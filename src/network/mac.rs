//! Link-layer addresses

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use super::error::RadioError;

/// Length of a link-layer address in bytes
pub const MAC_LEN: usize = 6;

/// A 6-byte link-layer address
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Default, Serialize, Deserialize)]
pub struct MacAddress(pub [u8; MAC_LEN]);

impl MacAddress {
    /// The address meaning "every listener on the channel"
    pub const BROADCAST: MacAddress = MacAddress([0xFF; MAC_LEN]);

    /// The all-zero address, used as "unknown"
    pub const ZERO: MacAddress = MacAddress([0; MAC_LEN]);

    pub fn new(bytes: [u8; MAC_LEN]) -> Self {
        Self(bytes)
    }

    pub fn is_broadcast(&self) -> bool {
        *self == Self::BROADCAST
    }

    pub fn is_zero(&self) -> bool {
        *self == Self::ZERO
    }

    /// Random locally administered unicast address
    pub fn random() -> Self {
        let mut bytes: [u8; MAC_LEN] = rand::random();
        bytes[0] = (bytes[0] | 0x02) & 0xFE;
        Self(bytes)
    }

    pub fn as_bytes(&self) -> &[u8; MAC_LEN] {
        &self.0
    }
}

impl fmt::Display for MacAddress {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let b = &self.0;
        write!(
            f,
            "{:02x}:{:02x}:{:02x}:{:02x}:{:02x}:{:02x}",
            b[0], b[1], b[2], b[3], b[4], b[5]
        )
    }
}

impl FromStr for MacAddress {
    type Err = RadioError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let mut bytes = [0u8; MAC_LEN];
        let mut parts = s.split([':', '-']);

        for byte in bytes.iter_mut() {
            let part = parts
                .next()
                .ok_or_else(|| RadioError::InvalidAddress(s.to_string()))?;
            if part.len() != 2 {
                return Err(RadioError::InvalidAddress(s.to_string()));
            }
            *byte = u8::from_str_radix(part, 16)
                .map_err(|_| RadioError::InvalidAddress(s.to_string()))?;
        }

        if parts.next().is_some() {
            return Err(RadioError::InvalidAddress(s.to_string()));
        }

        Ok(Self(bytes))
    }
}

impl From<[u8; MAC_LEN]> for MacAddress {
    fn from(bytes: [u8; MAC_LEN]) -> Self {
        Self(bytes)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_display_and_parse() {
        let mac = MacAddress::new([0x24, 0x6f, 0x28, 0x0a, 0xb1, 0xff]);
        let text = mac.to_string();
        assert_eq!(text, "24:6f:28:0a:b1:ff");
        assert_eq!(text.parse::<MacAddress>().unwrap(), mac);
        assert_eq!("24-6F-28-0A-B1-FF".parse::<MacAddress>().unwrap(), mac);
    }

    #[test]
    fn test_parse_rejects_malformed() {
        assert!("24:6f:28:0a:b1".parse::<MacAddress>().is_err());
        assert!("24:6f:28:0a:b1:ff:00".parse::<MacAddress>().is_err());
        assert!("24:6f:28:0a:b1:zz".parse::<MacAddress>().is_err());
        assert!("246f280ab1ff".parse::<MacAddress>().is_err());
    }

    #[test]
    fn test_special_addresses() {
        assert!(MacAddress::BROADCAST.is_broadcast());
        assert!(MacAddress::ZERO.is_zero());
        assert!(MacAddress::default().is_zero());

        let random = MacAddress::random();
        assert!(!random.is_broadcast());
        assert_eq!(random.0[0] & 0x01, 0, "random address must be unicast");
    }
}
