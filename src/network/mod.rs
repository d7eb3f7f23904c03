//! Network module for the mood link
//!
//! Handles the radio seam, callback bridging, peer bookkeeping, link
//! bootstrap, the connection context and the client/server roles.

mod bootstrap;
mod bridge;
mod client;
mod connection;
mod dispatch;
mod encryption;
mod error;
mod mac;
mod radio;
mod registry;
mod server;
mod sim;
mod transport;

pub use bootstrap::{bring_up, find_channel, Link};
pub use bridge::{BridgeStats, Event, RadioBridge, ReceivedFrame};
pub use client::{Client, ClientConfig, ClientState, UpdateHandler, JOIN_REQUEST};
pub use connection::{ConnectConfig, Connection, ConnectionStats, DEFAULT_LMK, DEFAULT_PMK};
pub use dispatch::{Dispatch, Dispatcher};
pub use encryption::{FrameCipher, SEAL_OVERHEAD};
pub use error::{ConnectError, RadioError};
pub use mac::{MacAddress, MAC_LEN};
pub use radio::{
    AccessPoint, PeerInfo, Radio, RadioCallbacks, SendStatus, KEY_LEN, MAX_CHANNEL, MAX_FRAME_LEN,
};
pub use registry::PeerRegistry;
pub use server::{Server, ServerConfig, ServerHandle, JOIN_RESPONSE, SYNC};
pub use sim::{SimRadio, SimulatedAir, Transmission, DEFAULT_PEER_CAPACITY};
pub use transport::{decode_frame, encode_frame, FrameHeader, UdpRadio, UdpRadioConfig, HEADER_LEN};
