//! Connection context
//!
//! One [`Connection`] owns the radio binding of a device: the link brought up
//! by the bootstrap, the bridge feeding the bounded event queue, the peer
//! registry and the message counters. Roles hold it behind an `Arc` and read
//! events from the receiver returned by [`Connection::open`] on a thread of
//! their own.

use std::sync::atomic::{AtomicBool, AtomicU32, AtomicU64, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::Duration;

use crossbeam_channel::{bounded, Receiver};
use tokio::runtime::{Handle, RuntimeFlavor};
use tokio::sync::oneshot;
use tracing::{debug, info, trace};

use crate::clock::Clock;
use crate::protocol::{EventKind, Packet, PacketError};

use super::bootstrap::{self, Link};
use super::bridge::{Event, RadioBridge};
use super::error::{ConnectError, RadioError};
use super::mac::MacAddress;
use super::radio::{PeerInfo, Radio, KEY_LEN};
use super::registry::PeerRegistry;

/// Default primary master key
pub const DEFAULT_PMK: [u8; KEY_LEN] = *b"pmk1234567890123";

/// Default local master key
pub const DEFAULT_LMK: [u8; KEY_LEN] = *b"lmk1234567890123";

/// Connection configuration
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConnectConfig {
    /// Network whose channel the devices meet on
    pub ssid: String,
    /// Associate with the network when set
    pub password: Option<String>,
    /// Enable radio power save
    pub energy_saver: bool,
    /// Power-save listen window per cycle
    pub wake_window_ms: u16,
    /// Power-save cycle length
    pub wake_interval_ms: u16,
    /// Bounded event queue size
    pub queue_capacity: usize,
    /// Longest time a radio callback waits for queue space
    pub enqueue_timeout: Duration,
    /// Primary master key
    pub pmk: [u8; KEY_LEN],
    /// Local master key shared by all peers
    pub lmk: [u8; KEY_LEN],
}

impl Default for ConnectConfig {
    fn default() -> Self {
        Self {
            ssid: "moods".to_string(),
            password: None,
            energy_saver: true,
            wake_window_ms: 100,
            wake_interval_ms: 100,
            queue_capacity: 6,
            enqueue_timeout: Duration::from_millis(512),
            pmk: DEFAULT_PMK,
            lmk: DEFAULT_LMK,
        }
    }
}

/// Connection statistics
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ConnectionStats {
    /// Packets handed to the radio
    pub sent: u64,
    /// Receive events consumed by the role
    pub received: u64,
    /// Events the bridge queued
    pub enqueued: u64,
    /// Events the bridge dropped
    pub dropped: u64,
    /// Malformed radio callbacks
    pub rejected: u64,
}

/// The radio binding shared by a role's tasks
pub struct Connection {
    radio: Arc<dyn Radio>,
    clock: Arc<dyn Clock>,
    link: Link,
    config: ConnectConfig,
    bridge: Arc<RadioBridge>,
    sequence: AtomicU32,
    sent: AtomicU64,
    received: AtomicU64,
    closed: AtomicBool,
}

impl Connection {
    /// Bring the link up and bind the radio callbacks to a fresh queue.
    ///
    /// The receiver is the only consumer side of the queue. It disconnects
    /// once the connection is closed or torn down by a fatal error; check
    /// [`is_closed`](Self::is_closed) before handling each event.
    pub fn open(
        radio: Arc<dyn Radio>,
        clock: Arc<dyn Clock>,
        config: ConnectConfig,
    ) -> Result<(Self, Receiver<Event>), ConnectError> {
        let link = bootstrap::bring_up(radio.as_ref(), &config.ssid, config.password.as_deref())?;

        let (tx, rx) = bounded(config.queue_capacity.max(1));
        let registry = PeerRegistry::new(radio.clone(), link.channel, config.lmk);
        let bridge = Arc::new(RadioBridge::new(
            tx,
            registry.clone(),
            config.enqueue_timeout,
        ));

        radio.init(bridge.clone())?;

        let connection = Self {
            radio,
            clock,
            link,
            config,
            bridge,
            sequence: AtomicU32::new(0),
            sent: AtomicU64::new(0),
            received: AtomicU64::new(0),
            closed: AtomicBool::new(false),
        };

        // From here on a failure must release the radio binding again
        if let Err(e) = connection.configure(&registry) {
            connection.close();
            return Err(e);
        }

        info!(
            "Connection open on '{}' channel {} as {}",
            connection.link.ssid,
            connection.link.channel,
            connection.radio.mac_address()
        );
        Ok((connection, rx))
    }

    fn configure(&self, registry: &PeerRegistry) -> Result<(), ConnectError> {
        if self.config.energy_saver {
            self.radio
                .set_power_save(self.config.wake_window_ms, self.config.wake_interval_ms)?;
            debug!(
                "Power save on: window {} ms, interval {} ms",
                self.config.wake_window_ms, self.config.wake_interval_ms
            );
        }
        self.radio.set_pmk(&self.config.pmk)?;
        registry.register(&MacAddress::BROADCAST)
    }

    /// Build the next outgoing packet
    pub fn encode(&self, kind: EventKind, text: &str, broadcast: bool) -> Result<Packet, PacketError> {
        // Wraps silently
        let sequence = self.sequence.fetch_add(1, Ordering::Relaxed);
        Packet::new(kind, sequence, self.clock.now_ms(), text, broadcast)
    }

    /// Encode `text` and send it to `dest`, or to everyone when `dest` is `None`.
    ///
    /// Unknown unicast destinations are registered first.
    pub fn send(
        &self,
        kind: EventKind,
        text: &str,
        dest: Option<MacAddress>,
    ) -> Result<Packet, ConnectError> {
        if self.is_closed() {
            return Err(ConnectError::Closed);
        }

        let dest = dest.unwrap_or(MacAddress::BROADCAST);
        if !dest.is_broadcast() {
            self.bridge.registry().register(&dest)?;
        }

        let packet = self.encode(kind, text, dest.is_broadcast())?;
        self.radio.send(&dest, &packet.to_bytes())?;
        self.sent.fetch_add(1, Ordering::Relaxed);
        trace!(
            "Sent {:?} #{} to {} ({:?})",
            kind,
            packet.sequence,
            dest,
            packet.mood()
        );
        Ok(packet)
    }

    /// Count a receive event taken off the queue
    pub fn record_received(&self) {
        self.received.fetch_add(1, Ordering::Relaxed);
    }

    pub fn stats(&self) -> ConnectionStats {
        let bridge = self.bridge.stats();
        ConnectionStats {
            sent: self.sent.load(Ordering::Relaxed),
            received: self.received.load(Ordering::Relaxed),
            enqueued: bridge.enqueued,
            dropped: bridge.dropped,
            rejected: bridge.rejected,
        }
    }

    /// Registered peers, broadcast entry included
    pub fn peers(&self) -> Vec<PeerInfo> {
        self.bridge.registry().peers()
    }

    /// Error that tore the connection down, if any
    pub fn fatal_error(&self) -> Option<ConnectError> {
        self.bridge.fatal_error()
    }

    pub fn link(&self) -> &Link {
        &self.link
    }

    /// Own radio address
    pub fn local_address(&self) -> MacAddress {
        self.radio.mac_address()
    }

    /// Local clock reading in milliseconds
    pub fn now_ms(&self) -> i64 {
        self.clock.now_ms()
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst) || !self.bridge.is_attached()
    }

    /// Release the queue, then the radio. Events still queued are lost.
    pub fn close(&self) {
        if self.closed.swap(true, Ordering::SeqCst) {
            return;
        }
        self.bridge.detach();
        self.radio.deinit();
        info!("Connection closed");
    }

    /// [`close`](Self::close) from async code. Radio teardown may join
    /// threads, so it leaves the worker via `block_in_place` when it can.
    pub fn shutdown(&self) {
        match Handle::try_current() {
            Ok(handle) if handle.runtime_flavor() == RuntimeFlavor::MultiThread => {
                tokio::task::block_in_place(|| self.close())
            }
            _ => self.close(),
        }
    }
}

impl Drop for Connection {
    fn drop(&mut self) {
        self.close();
    }
}

/// Event handling of a role
pub(crate) trait Consumer: Send + Sync + 'static {
    fn connection(&self) -> &Connection;

    fn handle(&self, event: Event);
}

/// Run `consumer` over the queue on a thread named `name`.
///
/// The thread stops at the first event taken after the connection closed,
/// so events pending at teardown are dropped unhandled. It then closes the
/// connection and resolves the returned receiver with the fatal error.
pub(crate) fn spawn_consumer<C: Consumer>(
    name: &str,
    consumer: Arc<C>,
    rx: Receiver<Event>,
) -> Result<oneshot::Receiver<Option<ConnectError>>, ConnectError> {
    let (done_tx, done_rx) = oneshot::channel();
    let thread_name = name.to_string();

    thread::Builder::new()
        .name(thread_name.clone())
        .spawn(move || {
            for event in rx.iter() {
                if consumer.connection().is_closed() {
                    break;
                }
                consumer.handle(event);
            }

            let connection = consumer.connection();
            let fatal = connection.fatal_error();
            connection.close();
            debug!("{}: consumer stopped", thread_name);
            let _ = done_tx.send(fatal);
        })
        .map_err(RadioError::from)?;

    Ok(done_rx)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::ManualClock;
    use crate::network::sim::{SimRadio, SimulatedAir};

    fn open(air: &Arc<SimulatedAir>) -> (Connection, Receiver<Event>, Arc<SimRadio>) {
        let radio = air.radio(MacAddress::random());
        let (connection, rx) = Connection::open(
            radio.clone(),
            Arc::new(ManualClock::new(1_000)),
            ConnectConfig::default(),
        )
        .unwrap();
        (connection, rx, radio)
    }

    fn air() -> Arc<SimulatedAir> {
        let air = SimulatedAir::new();
        air.add_access_point("moods", 3, None);
        air
    }

    #[test]
    fn test_open_registers_broadcast_and_power_save() {
        let air = air();
        let (connection, _rx, radio) = open(&air);

        assert_eq!(connection.link().channel, 3);
        assert_eq!(radio.power_save(), Some((100, 100)));

        let peers = connection.peers();
        assert_eq!(peers.len(), 1);
        assert!(peers[0].address.is_broadcast());
        assert!(!peers[0].encrypted);
    }

    #[test]
    fn test_open_without_energy_saver() {
        let air = air();
        let radio = air.radio(MacAddress::random());
        let config = ConnectConfig {
            energy_saver: false,
            ..ConnectConfig::default()
        };
        let (_connection, _rx) =
            Connection::open(radio.clone(), Arc::new(ManualClock::new(0)), config).unwrap();
        assert_eq!(radio.power_save(), None);
    }

    #[test]
    fn test_open_fails_for_unknown_network() {
        let air = SimulatedAir::new();
        let radio = air.radio(MacAddress::random());
        let result = Connection::open(radio, Arc::new(ManualClock::new(0)), ConnectConfig::default());
        assert!(matches!(result, Err(ConnectError::NetworkNotFound(ssid)) if ssid == "moods"));
    }

    #[test]
    fn test_encode_stamps_sequence_and_time() {
        let air = air();
        let (connection, _rx, _radio) = open(&air);

        let first = connection.encode(EventKind::Sync, "sync", true).unwrap();
        let second = connection.encode(EventKind::Sync, "sync", true).unwrap();

        assert_eq!(first.sequence, 0);
        assert_eq!(second.sequence, 1);
        assert_eq!(first.send_time, 1_000);
        assert!(first.is_broadcast);
    }

    #[test]
    fn test_send_counts_and_reaches_peer() {
        let air = air();
        let (sender, _rx_a, _radio_a) = open(&air);
        let (_receiver, rx_b, _radio_b) = open(&air);

        sender.send(EventKind::Update, "happy", None).unwrap();
        assert_eq!(sender.stats().sent, 1);

        let event = rx_b.recv_timeout(Duration::from_secs(2)).unwrap();
        let Event::Receive(frame) = event else {
            panic!("expected a receive event");
        };
        assert_eq!(frame.peer, sender.local_address());
        assert_eq!(frame.frame.validate().unwrap().mood(), Some("happy"));
    }

    #[test]
    fn test_unicast_registers_destination() {
        let air = air();
        let (connection, _rx, _radio) = open(&air);
        let dest = MacAddress::random();

        connection.send(EventKind::JoinResponse, "join_response", Some(dest)).unwrap();

        let peer = connection
            .peers()
            .into_iter()
            .find(|p| p.address == dest)
            .unwrap();
        assert!(peer.encrypted);
    }

    #[test]
    fn test_send_rejects_long_payload() {
        let air = air();
        let (connection, _rx, _radio) = open(&air);

        let err = connection
            .send(EventKind::Update, "this mood name is too long", None)
            .unwrap_err();
        assert!(matches!(
            err,
            ConnectError::Packet(PacketError::PayloadTooLong { .. })
        ));
        assert_eq!(connection.stats().sent, 0);
    }

    #[test]
    fn test_close_is_idempotent_and_ends_queue() {
        let air = air();
        let (connection, rx, radio) = open(&air);

        connection.close();
        connection.close();

        assert!(connection.is_closed());
        assert!(!radio.is_initialized());
        assert!(rx.recv().is_err());
        assert_eq!(
            connection.send(EventKind::Sync, "sync", None).unwrap_err(),
            ConnectError::Closed
        );
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_shutdown_on_runtime_worker() {
        let air = air();
        let (connection, rx, radio) = open(&air);

        connection.shutdown();

        assert!(connection.is_closed());
        assert!(!radio.is_initialized());
        assert!(rx.recv().is_err());
    }

    #[tokio::test]
    async fn test_shutdown_on_current_thread_runtime() {
        let air = air();
        let (connection, _rx, radio) = open(&air);

        connection.shutdown();

        assert!(!radio.is_initialized());
    }
}
