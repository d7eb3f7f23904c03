//! Clocks and cross-device time alignment
//!
//! All times are in milliseconds. A [`SyncedClock`] maps the local monotonic
//! clock onto the server's clock using the last sync beacon; a device acting
//! as server is authoritative and reports its own clock.

use std::sync::atomic::{AtomicI64, Ordering};
use std::sync::Arc;
use std::time::Instant;

use parking_lot::RwLock;
use tracing::trace;

/// Local monotonic time source
pub trait Clock: Send + Sync {
    /// Milliseconds since an arbitrary fixed origin
    fn now_ms(&self) -> i64;
}

/// Process-relative monotonic clock
#[derive(Debug, Clone, Copy)]
pub struct MonotonicClock {
    origin: Instant,
}

impl MonotonicClock {
    pub fn new() -> Self {
        Self {
            origin: Instant::now(),
        }
    }
}

impl Default for MonotonicClock {
    fn default() -> Self {
        Self::new()
    }
}

impl Clock for MonotonicClock {
    fn now_ms(&self) -> i64 {
        self.origin.elapsed().as_millis() as i64
    }
}

/// Clock that only moves when told to
#[derive(Debug, Default)]
pub struct ManualClock {
    now: AtomicI64,
}

impl ManualClock {
    pub fn new(start_ms: i64) -> Self {
        Self {
            now: AtomicI64::new(start_ms),
        }
    }

    pub fn set(&self, now_ms: i64) {
        self.now.store(now_ms, Ordering::SeqCst);
    }

    pub fn advance(&self, delta_ms: i64) {
        self.now.fetch_add(delta_ms, Ordering::SeqCst);
    }
}

impl Clock for ManualClock {
    fn now_ms(&self) -> i64 {
        self.now.load(Ordering::SeqCst)
    }
}

#[derive(Debug, Default)]
struct SyncState {
    remote_time_at_last_sync: i64,
    local_time_at_sync: i64,
    last_tick: i64,
    synced: bool,
}

/// Local clock aligned to a remote clock
pub struct SyncedClock {
    local: Arc<dyn Clock>,
    authoritative: bool,
    state: RwLock<SyncState>,
}

impl SyncedClock {
    /// Clock that follows sync beacons
    pub fn follower(local: Arc<dyn Clock>) -> Self {
        Self::with_role(local, false)
    }

    /// Clock of the device that sends the beacons
    pub fn authority(local: Arc<dyn Clock>) -> Self {
        Self::with_role(local, true)
    }

    fn with_role(local: Arc<dyn Clock>, authoritative: bool) -> Self {
        let last_tick = local.now_ms();
        Self {
            local,
            authoritative,
            state: RwLock::new(SyncState {
                last_tick,
                ..SyncState::default()
            }),
        }
    }

    /// Take `remote_time` as the remote clock reading at this instant.
    /// A single beacon fully replaces the previous offset.
    pub fn update_remote(&self, remote_time: i64) {
        let local_now = self.local.now_ms();
        let mut state = self.state.write();
        state.remote_time_at_last_sync = remote_time;
        state.local_time_at_sync = local_now;
        state.synced = true;
        trace!("Clock synced: remote={} local={}", remote_time, local_now);
    }

    /// Current time on the remote clock, or the local clock when authoritative
    pub fn now(&self) -> i64 {
        let local_now = self.local.now_ms();
        if self.authoritative {
            return local_now;
        }
        let state = self.state.read();
        state.remote_time_at_last_sync + (local_now - state.local_time_at_sync)
    }

    /// Remote minus local clock as of the last sync
    pub fn offset(&self) -> i64 {
        let state = self.state.read();
        state.remote_time_at_last_sync - state.local_time_at_sync
    }

    /// Whether at least one beacon has been applied
    pub fn is_synced(&self) -> bool {
        self.authoritative || self.state.read().synced
    }

    /// Local milliseconds elapsed since the previous tick (frame delta)
    pub fn tick(&self) -> i64 {
        let local_now = self.local.now_ms();
        let mut state = self.state.write();
        let delta = local_now - state.last_tick;
        state.last_tick = local_now;
        delta
    }
}
