//! Server role
//!
//! The server answers join requests, broadcasts its clock as a sync beacon
//! and pushes mood updates to every client. Its clock is authoritative.

use std::sync::Arc;
use std::time::Duration;

use parking_lot::RwLock;
use tokio::sync::oneshot;
use tokio::task::JoinHandle;
use tokio::time::{interval, MissedTickBehavior};
use tracing::{debug, error, info, trace, warn};

use crate::clock::{Clock, SyncedClock};
use crate::protocol::{EventKind, Packet};

use super::bridge::{Event, ReceivedFrame};
use super::connection::{spawn_consumer, ConnectConfig, Connection, ConnectionStats, Consumer};
use super::error::ConnectError;
use super::mac::MacAddress;
use super::radio::Radio;

/// Payload of join responses
pub const JOIN_RESPONSE: &str = "join_response";

/// Payload of sync beacons
pub const SYNC: &str = "sync";

/// Server configuration
#[derive(Debug, Clone)]
pub struct ServerConfig {
    pub connect: ConnectConfig,
    /// Sync beacon period
    pub sync_interval: Duration,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            connect: ConnectConfig::default(),
            sync_interval: Duration::from_secs(1),
        }
    }
}

struct ServerShared {
    connection: Connection,
    clock: SyncedClock,
    /// Clients in the order they first asked to join
    clients: RwLock<Vec<MacAddress>>,
}

impl Consumer for ServerShared {
    fn connection(&self) -> &Connection {
        &self.connection
    }

    fn handle(&self, event: Event) {
        match event {
            Event::SendComplete { peer, .. } => trace!("Send to {} complete", peer),
            Event::Receive(frame) => self.handle_frame(frame),
        }
    }
}

impl ServerShared {
    fn handle_frame(&self, frame: ReceivedFrame) {
        self.connection.record_received();

        let packet = match frame.frame.validate() {
            Ok(packet) => packet,
            Err(e) => {
                warn!("Dropping invalid {:?} packet from {}: {}", frame.kind, frame.peer, e);
                return;
            }
        };

        match packet.kind {
            EventKind::JoinRequest => self.accept(frame.peer),
            other => debug!("Ignoring {:?} from {}", other, frame.peer),
        }
    }

    fn accept(&self, client: MacAddress) {
        {
            let mut clients = self.clients.write();
            if !clients.contains(&client) {
                clients.push(client);
                info!("Client {} joined ({} total)", client, clients.len());
            }
        }

        match self
            .connection
            .send(EventKind::JoinResponse, JOIN_RESPONSE, Some(client))
        {
            Ok(packet) => debug!("Join response #{} sent to {}", packet.sequence, client),
            Err(e) => error!("Join response to {} failed: {}", client, e),
        }
    }

    fn broadcast_update(&self, mood: &str) -> Result<Packet, ConnectError> {
        let packet = self.connection.send(EventKind::Update, mood, None)?;
        info!("Broadcast mood '{}' to {} clients", mood, self.clients.read().len());
        Ok(packet)
    }
}

/// Cloneable handle for pushing mood updates from other tasks
#[derive(Clone)]
pub struct ServerHandle {
    shared: Arc<ServerShared>,
}

impl ServerHandle {
    /// Broadcast `mood` to all clients as an update
    pub fn broadcast_update(&self, mood: &str) -> Result<Packet, ConnectError> {
        self.shared.broadcast_update(mood)
    }

    pub fn clients(&self) -> Vec<MacAddress> {
        self.shared.clients.read().clone()
    }
}

/// A running server role
pub struct Server {
    shared: Arc<ServerShared>,
    sync_handle: Option<JoinHandle<()>>,
    consumer_done: Option<oneshot::Receiver<Option<ConnectError>>>,
}

impl Server {
    /// Open the connection and spawn the server tasks on the current runtime
    pub fn start(
        radio: Arc<dyn Radio>,
        clock: Arc<dyn Clock>,
        config: ServerConfig,
    ) -> Result<Self, ConnectError> {
        let (connection, rx) = Connection::open(radio, clock.clone(), config.connect.clone())?;
        let shared = Arc::new(ServerShared {
            connection,
            clock: SyncedClock::authority(clock),
            clients: RwLock::new(Vec::new()),
        });

        let consumer_done = spawn_consumer("moodlink-server-events", shared.clone(), rx)?;
        let sync_handle = tokio::spawn(sync_loop(shared.clone(), config.sync_interval));

        info!(
            "Server started as {} on channel {}",
            shared.connection.local_address(),
            shared.connection.link().channel
        );
        Ok(Self {
            shared,
            sync_handle: Some(sync_handle),
            consumer_done: Some(consumer_done),
        })
    }

    pub fn handle(&self) -> ServerHandle {
        ServerHandle {
            shared: self.shared.clone(),
        }
    }

    /// Broadcast `mood` to all clients as an update
    pub fn broadcast_update(&self, mood: &str) -> Result<Packet, ConnectError> {
        self.shared.broadcast_update(mood)
    }

    /// Addresses that asked to join
    pub fn clients(&self) -> Vec<MacAddress> {
        self.shared.clients.read().clone()
    }

    /// The server's own clock
    pub fn now(&self) -> i64 {
        self.shared.clock.now()
    }

    pub fn tick(&self) -> i64 {
        self.shared.clock.tick()
    }

    pub fn stats(&self) -> ConnectionStats {
        self.shared.connection.stats()
    }

    pub fn connection(&self) -> &Connection {
        &self.shared.connection
    }

    /// Wait until the event consumer exits; yields the fatal error, if any.
    ///
    /// Cancel safe, so it can be raced against other events.
    pub async fn closed(&mut self) -> Option<ConnectError> {
        if let Some(done) = self.consumer_done.as_mut() {
            let result = done.await;
            self.consumer_done = None;
            if let Some(handle) = self.sync_handle.take() {
                handle.abort();
            }
            if let Ok(fatal) = result {
                return fatal;
            }
        }
        self.shared.connection.fatal_error()
    }

    /// Tear the connection down and stop both tasks
    pub fn stop(&mut self) {
        self.shared.connection.shutdown();
        if let Some(handle) = self.sync_handle.take() {
            handle.abort();
        }
        self.consumer_done = None;
        info!("Server stopped");
    }
}

impl Drop for Server {
    fn drop(&mut self) {
        self.stop();
    }
}

async fn sync_loop(shared: Arc<ServerShared>, period: Duration) {
    let mut ticker = interval(period);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);

    loop {
        ticker.tick().await;
        match shared.connection.send(EventKind::Sync, SYNC, None) {
            Ok(packet) => trace!("Sync beacon #{} at {}", packet.sequence, packet.send_time),
            Err(ConnectError::Closed) => break,
            Err(e) => warn!("Sync beacon failed: {}", e),
        }
    }
    debug!("Sync loop finished");
}
