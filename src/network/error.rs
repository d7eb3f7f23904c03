//! Network error types

use thiserror::Error;

use crate::protocol::PacketError;

use super::mac::MacAddress;

/// Errors reported by a radio implementation
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum RadioError {
    #[error("Radio not started")]
    NotStarted,

    #[error("Radio link layer not initialized")]
    NotInitialized,

    #[error("Peer table full ({capacity} entries)")]
    PeerTableFull { capacity: usize },

    #[error("Peer {0} already registered")]
    PeerExists(MacAddress),

    #[error("Peer {0} not registered")]
    PeerNotFound(MacAddress),

    #[error("Invalid channel {0}")]
    InvalidChannel(u8),

    #[error("Frame of {0} bytes exceeds radio limit")]
    FrameTooLarge(usize),

    #[error("Association with {ssid} failed: {reason}")]
    AssociationFailed { ssid: String, reason: String },

    #[error("Invalid address: {0}")]
    InvalidAddress(String),

    #[error("Encryption error: {0}")]
    Encryption(String),

    #[error("IO error: {0}")]
    Io(String),
}

impl From<std::io::Error> for RadioError {
    fn from(e: std::io::Error) -> Self {
        RadioError::Io(e.to_string())
    }
}

/// Errors that can occur in the connect layer
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ConnectError {
    #[error("Network '{0}' not found")]
    NetworkNotFound(String),

    #[error("Network name is empty")]
    MissingSsid,

    #[error("Peer registration for {peer} failed: {source}")]
    PeerRegistration {
        peer: MacAddress,
        #[source]
        source: RadioError,
    },

    #[error("Connection closed")]
    Closed,

    #[error("Radio error: {0}")]
    Radio(#[from] RadioError),

    #[error("Packet error: {0}")]
    Packet(#[from] PacketError),
}

impl ConnectError {
    /// Whether this error kills the connection
    pub fn is_fatal(&self) -> bool {
        matches!(self, ConnectError::PeerRegistration { .. })
    }
}
