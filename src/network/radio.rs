//! Radio subsystem seam
//!
//! The connect layer drives a connectionless, broadcast-capable radio through
//! the [`Radio`] trait. The radio reports send completions and received
//! frames through [`RadioCallbacks`], invoked from the radio's own dispatch
//! thread. Callback implementations must not block for long.

use std::net::Ipv4Addr;
use std::sync::Arc;

use super::error::RadioError;
use super::mac::MacAddress;

/// Length of primary and local master keys
pub const KEY_LEN: usize = 16;

/// Largest frame a radio accepts
pub const MAX_FRAME_LEN: usize = 250;

/// Highest valid radio channel
pub const MAX_CHANNEL: u8 = 14;

/// A network seen during a scan
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AccessPoint {
    pub ssid: String,
    pub channel: u8,
    pub rssi: i8,
}

/// Peer table entry
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PeerInfo {
    pub address: MacAddress,
    pub channel: u8,
    pub encrypted: bool,
    /// Local master key, present only for encrypted peers
    pub key: Option<[u8; KEY_LEN]>,
}

impl PeerInfo {
    /// Unencrypted entry, used for the broadcast address
    pub fn open(address: MacAddress, channel: u8) -> Self {
        Self {
            address,
            channel,
            encrypted: false,
            key: None,
        }
    }

    /// Encrypted entry using `key` as local master key
    pub fn encrypted(address: MacAddress, channel: u8, key: [u8; KEY_LEN]) -> Self {
        Self {
            address,
            channel,
            encrypted: true,
            key: Some(key),
        }
    }
}

/// Outcome of a transmission as reported by the radio
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SendStatus {
    Success,
    Fail,
}

/// Entry points the radio calls from its dispatch context
pub trait RadioCallbacks: Send + Sync {
    /// A transmission to `peer` finished
    fn on_send(&self, peer: Option<MacAddress>, status: SendStatus);

    /// A frame from `source` arrived
    fn on_receive(&self, source: Option<MacAddress>, data: Option<&[u8]>);
}

/// Connectionless radio with a peer table
pub trait Radio: Send + Sync {
    /// Own link-layer address
    fn mac_address(&self) -> MacAddress;

    /// Power up the interface
    fn start(&self) -> Result<(), RadioError>;

    /// Blocking scan for visible networks
    fn scan(&self) -> Result<Vec<AccessPoint>, RadioError>;

    /// Lock the interface to `channel`
    fn set_channel(&self, channel: u8) -> Result<(), RadioError>;

    /// Currently selected channel, if any
    fn channel(&self) -> Option<u8>;

    /// Associate with an access point and wait for an address
    fn associate(&self, ssid: &str, password: &str, channel: u8) -> Result<Ipv4Addr, RadioError>;

    /// Bring up the peer-to-peer link layer and install the callbacks
    fn init(&self, callbacks: Arc<dyn RadioCallbacks>) -> Result<(), RadioError>;

    /// Configure the power-save duty cycle
    fn set_power_save(&self, wake_window_ms: u16, wake_interval_ms: u16) -> Result<(), RadioError>;

    /// Install the primary master key
    fn set_pmk(&self, pmk: &[u8; KEY_LEN]) -> Result<(), RadioError>;

    /// Add an entry to the peer table
    fn add_peer(&self, peer: PeerInfo) -> Result<(), RadioError>;

    fn peer_exists(&self, address: &MacAddress) -> bool;

    /// Snapshot of the peer table
    fn peers(&self) -> Vec<PeerInfo>;

    /// Queue a frame for transmission to a registered peer
    fn send(&self, dest: &MacAddress, data: &[u8]) -> Result<(), RadioError>;

    /// Tear down the link layer; callbacks are released and no longer invoked
    fn deinit(&self);
}
