//! Radio bridge
//!
//! Turns radio callbacks into events on the connection's bounded queue. The
//! callbacks run in the radio's dispatch context, so they never wait on the
//! queue for longer than the configured enqueue timeout; anything that does
//! not fit in time is dropped and logged.
//!
//! Received frames are tagged with the event kind peeked from the header and
//! handed over as [`Unverified`] bytes. Integrity checks happen on the
//! consumer side.

use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use crossbeam_channel::{SendTimeoutError, Sender};
use parking_lot::Mutex;
use tracing::{debug, error, trace, warn};

use crate::protocol::{EventKind, Unverified};

use super::error::ConnectError;
use super::mac::MacAddress;
use super::radio::{RadioCallbacks, SendStatus};
use super::registry::PeerRegistry;

/// A received frame waiting for its consumer
#[derive(Debug)]
pub struct ReceivedFrame {
    pub peer: MacAddress,
    /// Kind read from the header before any validation
    pub kind: EventKind,
    pub frame: Unverified,
}

/// Event passed from the radio callbacks to a role
#[derive(Debug)]
pub enum Event {
    SendComplete { peer: MacAddress, status: SendStatus },
    Receive(ReceivedFrame),
}

/// Bridge counters
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct BridgeStats {
    /// Events placed on the queue
    pub enqueued: u64,
    /// Events lost because the queue stayed full or was closed
    pub dropped: u64,
    /// Callbacks rejected for malformed arguments
    pub rejected: u64,
}

enum Rejected {
    Full,
    Closed,
}

/// Callback target installed into the radio
pub struct RadioBridge {
    queue: Mutex<Option<Sender<Event>>>,
    registry: PeerRegistry,
    enqueue_timeout: Duration,
    fatal: Mutex<Option<ConnectError>>,
    enqueued: AtomicU64,
    dropped: AtomicU64,
    rejected: AtomicU64,
}

impl RadioBridge {
    pub fn new(queue: Sender<Event>, registry: PeerRegistry, enqueue_timeout: Duration) -> Self {
        Self {
            queue: Mutex::new(Some(queue)),
            registry,
            enqueue_timeout,
            fatal: Mutex::new(None),
            enqueued: AtomicU64::new(0),
            dropped: AtomicU64::new(0),
            rejected: AtomicU64::new(0),
        }
    }

    /// Release the queue sender. Once detached the bridge only drops events.
    pub fn detach(&self) -> bool {
        self.queue.lock().take().is_some()
    }

    pub fn is_attached(&self) -> bool {
        self.queue.lock().is_some()
    }

    /// The error that tore the connection down, if any
    pub fn fatal_error(&self) -> Option<ConnectError> {
        self.fatal.lock().clone()
    }

    pub fn registry(&self) -> &PeerRegistry {
        &self.registry
    }

    pub fn stats(&self) -> BridgeStats {
        BridgeStats {
            enqueued: self.enqueued.load(Ordering::Relaxed),
            dropped: self.dropped.load(Ordering::Relaxed),
            rejected: self.rejected.load(Ordering::Relaxed),
        }
    }

    fn fail(&self, err: ConnectError) {
        error!("Fatal connect error, tearing down connection: {}", err);
        self.fatal.lock().get_or_insert(err);
        self.detach();
    }

    fn enqueue(&self, event: Event) -> Result<(), (Event, Rejected)> {
        // Clone the sender so detach() never waits on a full queue
        let Some(tx) = self.queue.lock().clone() else {
            return Err((event, Rejected::Closed));
        };

        match tx.send_timeout(event, self.enqueue_timeout) {
            Ok(()) => {
                self.enqueued.fetch_add(1, Ordering::Relaxed);
                Ok(())
            }
            Err(SendTimeoutError::Timeout(ev)) => Err((ev, Rejected::Full)),
            Err(SendTimeoutError::Disconnected(ev)) => Err((ev, Rejected::Closed)),
        }
    }

    fn record_drop(&self, what: &str, reason: Rejected) {
        self.dropped.fetch_add(1, Ordering::Relaxed);
        match reason {
            Rejected::Full => warn!("{} queue full, event dropped", what),
            Rejected::Closed => debug!("{} queue closed, event dropped", what),
        }
    }
}

impl RadioCallbacks for RadioBridge {
    fn on_send(&self, peer: Option<MacAddress>, status: SendStatus) {
        let Some(peer) = peer else {
            error!("Send callback argument error");
            self.rejected.fetch_add(1, Ordering::Relaxed);
            return;
        };

        if status != SendStatus::Success {
            error!("Send data to {} failed", peer);
            return;
        }

        if let Err((_, reason)) = self.enqueue(Event::SendComplete { peer, status }) {
            self.record_drop("Send", reason);
        }
    }

    fn on_receive(&self, source: Option<MacAddress>, data: Option<&[u8]>) {
        let (Some(source), Some(data)) = (source, data) else {
            error!("Receive callback argument error");
            self.rejected.fetch_add(1, Ordering::Relaxed);
            return;
        };
        if data.is_empty() {
            error!("Receive callback argument error: empty frame from {}", source);
            self.rejected.fetch_add(1, Ordering::Relaxed);
            return;
        }
        if !self.is_attached() {
            trace!("Bridge detached, ignoring frame from {}", source);
            return;
        }

        if let Err(e) = self.registry.register(&source) {
            self.fail(e);
            return;
        }

        // Sized to what arrived, not to a full packet
        let frame = Unverified::new(data.to_vec());
        let kind = frame.peek_kind();
        let event = Event::Receive(ReceivedFrame {
            peer: source,
            kind,
            frame,
        });

        if let Err((event, reason)) = self.enqueue(event) {
            drop(event);
            self.record_drop("Receive", reason);
        } else {
            trace!("Queued {:?} frame ({} bytes) from {}", kind, data.len(), source);
        }
    }
}
