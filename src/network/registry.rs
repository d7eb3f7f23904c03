//! Peer registry
//!
//! Bookkeeping of remote addresses in the radio's peer table. Every peer is
//! bound to the connection's channel and, except for the broadcast address,
//! encrypted with the shared local master key.

use std::sync::Arc;

use tracing::{debug, info};

use super::error::{ConnectError, RadioError};
use super::mac::MacAddress;
use super::radio::{PeerInfo, Radio, KEY_LEN};

/// Registers peers with the radio
#[derive(Clone)]
pub struct PeerRegistry {
    radio: Arc<dyn Radio>,
    channel: u8,
    key: [u8; KEY_LEN],
}

impl PeerRegistry {
    pub fn new(radio: Arc<dyn Radio>, channel: u8, key: [u8; KEY_LEN]) -> Self {
        Self {
            radio,
            channel,
            key,
        }
    }

    /// Add `address` to the peer table; registering a known peer is a no-op.
    ///
    /// An error here means the peer table is exhausted or unusable, and the
    /// caller treats it as fatal for the whole connection.
    pub fn register(&self, address: &MacAddress) -> Result<(), ConnectError> {
        if self.radio.peer_exists(address) {
            return Ok(());
        }

        let peer = if address.is_broadcast() {
            PeerInfo::open(*address, self.channel)
        } else {
            PeerInfo::encrypted(*address, self.channel, self.key)
        };

        match self.radio.add_peer(peer) {
            Ok(()) => {
                info!("Registered new peer {} on channel {}", address, self.channel);
                self.log_peers();
                Ok(())
            }
            Err(RadioError::PeerExists(_)) => Ok(()),
            Err(source) => Err(ConnectError::PeerRegistration {
                peer: *address,
                source,
            }),
        }
    }

    pub fn contains(&self, address: &MacAddress) -> bool {
        self.radio.peer_exists(address)
    }

    /// Registered peers, broadcast entry included
    pub fn peers(&self) -> Vec<PeerInfo> {
        self.radio.peers()
    }

    pub fn channel(&self) -> u8 {
        self.channel
    }

    fn log_peers(&self) {
        debug!("Connected peers:");
        for peer in self.radio.peers() {
            debug!("-- {}", peer.address);
        }
    }
}
