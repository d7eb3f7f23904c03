//! moodlink - Peer discovery, messaging and clock sync for mood-light devices
//!
//! A server device answers join requests, broadcasts its clock and pushes
//! mood changes; client devices join it, follow its clock and render the
//! moods they are sent. Devices talk over a connectionless, broadcast-capable
//! radio using a fixed 33-byte packet.

pub mod clock;
pub mod config;
pub mod mood;
pub mod network;
pub mod protocol;
pub mod supervisor;

pub use clock::{Clock, ManualClock, MonotonicClock, SyncedClock};
pub use config::{ConfigError, DeviceConfig};
pub use network::{Client, ClientConfig, ConnectConfig, Connection, Server, ServerConfig};
pub use protocol::Packet;
pub use supervisor::{FailureBudget, Recovery};
