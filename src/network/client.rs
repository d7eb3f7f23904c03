//! Client role
//!
//! A client broadcasts join requests until a server answers, then follows
//! that server's sync beacons and mood updates. The join/liveness timer runs
//! as a tokio task, the event consumer on a thread of its own.

use std::sync::atomic::{AtomicI64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use parking_lot::RwLock;
use tokio::sync::oneshot;
use tokio::task::JoinHandle;
use tokio::time::{interval, MissedTickBehavior};
use tracing::{debug, info, trace, warn};

use crate::clock::{Clock, SyncedClock};
use crate::protocol::EventKind;

use super::bridge::{Event, ReceivedFrame};
use super::connection::{spawn_consumer, ConnectConfig, Connection, ConnectionStats, Consumer};
use super::error::ConnectError;
use super::mac::MacAddress;
use super::radio::Radio;

/// Payload of join requests
pub const JOIN_REQUEST: &str = "join_request";

/// Client configuration
#[derive(Debug, Clone)]
pub struct ClientConfig {
    pub connect: ConnectConfig,
    /// Join request period while no server is known
    pub join_interval: Duration,
    /// Period of the server liveness check
    pub liveness_interval: Duration,
    /// Silence after which the server counts as missing
    pub liveness_timeout: Duration,
    /// Forget a silent server and start joining again
    pub rejoin_on_silence: bool,
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            connect: ConnectConfig::default(),
            join_interval: Duration::from_secs(1),
            liveness_interval: Duration::from_secs(10),
            liveness_timeout: Duration::from_secs(10),
            rejoin_on_silence: false,
        }
    }
}

/// Join state of a client
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ClientState {
    /// No server known yet
    Unbound,
    /// A server answered a join request
    Bound,
}

/// Callback for mood updates pushed by the server
pub type UpdateHandler = Box<dyn Fn(&str) + Send + Sync + 'static>;

struct ClientShared {
    connection: Connection,
    clock: SyncedClock,
    server: RwLock<Option<MacAddress>>,
    /// Local time the server was last heard from
    last_heard: AtomicI64,
    update_handler: RwLock<Option<Arc<UpdateHandler>>>,
}

impl Consumer for ClientShared {
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

impl ClientShared {
    fn server(&self) -> Option<MacAddress> {
        *self.server.read()
    }

    fn handle_frame(&self, frame: ReceivedFrame) {
        self.connection.record_received();

        let packet = match frame.frame.validate() {
            Ok(packet) => packet,
            Err(e) => {
                warn!("Dropping invalid {:?} packet from {}: {}", frame.kind, frame.peer, e);
                return;
            }
        };

        if self.server() == Some(frame.peer) {
            self.last_heard
                .store(self.connection.now_ms(), Ordering::Relaxed);
        }

        match packet.kind {
            EventKind::JoinResponse => self.bind(frame.peer),
            EventKind::Sync => {
                self.clock.update_remote(packet.send_time);
                trace!(
                    "Sync from {}: remote time {}, offset {} ms",
                    frame.peer,
                    packet.send_time,
                    self.clock.offset()
                );
            }
            EventKind::Update => match packet.mood() {
                Some(mood) => {
                    info!("Mood update from {}: {}", frame.peer, mood);
                    let handler = self.update_handler.read().clone();
                    if let Some(handler) = handler {
                        handler(mood);
                    }
                }
                None => warn!("Update from {} is not valid text", frame.peer),
            },
            EventKind::JoinRequest | EventKind::Ignore => {
                debug!("Ignoring {:?} from {}", packet.kind, frame.peer)
            }
        }
    }

    fn bind(&self, server: MacAddress) {
        let previous = self.server.write().replace(server);
        self.last_heard
            .store(self.connection.now_ms(), Ordering::Relaxed);
        match previous {
            None => info!("Bound to server {}", server),
            Some(old) if old != server => info!("Server changed from {} to {}", old, server),
            Some(_) => trace!("Repeated join response from {}", server),
        }
    }

    fn check_liveness(&self, timeout: Duration, rejoin: bool) {
        let Some(server) = self.server() else {
            return;
        };
        let silent_ms = self.connection.now_ms() - self.last_heard.load(Ordering::Relaxed);
        if silent_ms <= timeout.as_millis() as i64 {
            trace!("Server {} alive", server);
            return;
        }

        warn!("Server {} silent for {} ms", server, silent_ms);
        if rejoin {
            *self.server.write() = None;
            info!("Dropped server {}, joining again", server);
        }
    }
}

/// A running client role
pub struct Client {
    shared: Arc<ClientShared>,
    join_handle: Option<JoinHandle<()>>,
    consumer_done: Option<oneshot::Receiver<Option<ConnectError>>>,
}

impl Client {
    /// Open the connection and spawn the client tasks on the current runtime
    pub fn start(
        radio: Arc<dyn Radio>,
        clock: Arc<dyn Clock>,
        config: ClientConfig,
    ) -> Result<Self, ConnectError> {
        let (connection, rx) = Connection::open(radio, clock.clone(), config.connect.clone())?;
        let shared = Arc::new(ClientShared {
            connection,
            clock: SyncedClock::follower(clock),
            server: RwLock::new(None),
            last_heard: AtomicI64::new(0),
            update_handler: RwLock::new(None),
        });

        let consumer_done = spawn_consumer("moodlink-client-events", shared.clone(), rx)?;
        let join_handle = tokio::spawn(join_loop(shared.clone(), config));

        info!(
            "Client started as {} on channel {}",
            shared.connection.local_address(),
            shared.connection.link().channel
        );
        Ok(Self {
            shared,
            join_handle: Some(join_handle),
            consumer_done: Some(consumer_done),
        })
    }

    pub fn state(&self) -> ClientState {
        match self.shared.server() {
            Some(_) => ClientState::Bound,
            None => ClientState::Unbound,
        }
    }

    /// Server address, all zeros while unbound
    pub fn server_address(&self) -> MacAddress {
        self.shared.server().unwrap_or(MacAddress::ZERO)
    }

    /// Time on the server's clock
    pub fn now(&self) -> i64 {
        self.shared.clock.now()
    }

    /// Frame delta of the synced clock
    pub fn tick(&self) -> i64 {
        self.shared.clock.tick()
    }

    pub fn is_synced(&self) -> bool {
        self.shared.clock.is_synced()
    }

    /// Set callback for mood updates
    pub fn set_update_handler<F>(&self, handler: F)
    where
        F: Fn(&str) + Send + Sync + 'static,
    {
        *self.shared.update_handler.write() = Some(Arc::new(Box::new(handler)));
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
            if let Some(handle) = self.join_handle.take() {
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
        if let Some(handle) = self.join_handle.take() {
            handle.abort();
        }
        self.consumer_done = None;
        info!("Client stopped");
    }
}

impl Drop for Client {
    fn drop(&mut self) {
        self.stop();
    }
}

async fn join_loop(shared: Arc<ClientShared>, config: ClientConfig) {
    let mut join = interval(config.join_interval);
    join.set_missed_tick_behavior(MissedTickBehavior::Skip);
    let mut liveness = interval(config.liveness_interval);
    liveness.set_missed_tick_behavior(MissedTickBehavior::Skip);

    loop {
        tokio::select! {
            _ = join.tick() => {
                if shared.server().is_some() {
                    continue;
                }
                match shared.connection.send(EventKind::JoinRequest, JOIN_REQUEST, None) {
                    Ok(packet) => debug!("Join request #{} sent", packet.sequence),
                    Err(ConnectError::Closed) => break,
                    Err(e) if e.is_fatal() => break,
                    Err(e) => warn!("Join request failed: {}", e),
                }
            }
            _ = liveness.tick() => {
                shared.check_liveness(config.liveness_timeout, config.rejoin_on_silence);
            }
        }
    }
    debug!("Join loop finished");
}
