//! In-process radio medium
//!
//! [`SimulatedAir`] connects any number of [`SimRadio`]s. Frames reach every
//! radio that has its link layer up on the sender's channel; unicast frames
//! only reach their destination. Each radio keeps its own peer table and
//! dispatch thread, so callbacks run outside the async scheduler exactly as
//! they would with a hardware radio. Every transmission is logged in
//! plaintext for inspection.

use std::collections::HashMap;
use std::net::Ipv4Addr;
use std::sync::{Arc, Weak};

use parking_lot::Mutex;
use rand::Rng;
use tracing::{debug, info, trace};

use super::dispatch::{Dispatch, Dispatcher};
use super::encryption::FrameCipher;
use super::error::RadioError;
use super::mac::MacAddress;
use super::radio::{
    AccessPoint, PeerInfo, Radio, RadioCallbacks, SendStatus, KEY_LEN, MAX_CHANNEL, MAX_FRAME_LEN,
};

/// Default peer table capacity of a simulated radio
pub const DEFAULT_PEER_CAPACITY: usize = 20;

/// A frame as it went over the air
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Transmission {
    pub source: MacAddress,
    pub dest: MacAddress,
    pub channel: u8,
    pub encrypted: bool,
    /// Frame contents before encryption
    pub data: Vec<u8>,
}

#[derive(Debug, Clone)]
struct SimAccessPoint {
    ssid: String,
    channel: u8,
    password: Option<String>,
}

#[derive(Default)]
struct AirState {
    access_points: Vec<SimAccessPoint>,
    radios: HashMap<MacAddress, Weak<SimRadio>>,
    log: Vec<Transmission>,
    next_host: u8,
    loss: f64,
}

/// Shared medium for simulated radios
#[derive(Default)]
pub struct SimulatedAir {
    state: Mutex<AirState>,
}

impl SimulatedAir {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// Make a network visible to scans
    pub fn add_access_point(&self, ssid: &str, channel: u8, password: Option<&str>) {
        self.state.lock().access_points.push(SimAccessPoint {
            ssid: ssid.to_string(),
            channel,
            password: password.map(str::to_string),
        });
    }

    /// Probability (0.0 - 1.0) that a frame is lost per receiver
    pub fn set_loss(&self, loss: f64) {
        self.state.lock().loss = loss.clamp(0.0, 1.0);
    }

    /// Create a radio attached to this medium
    pub fn radio(self: &Arc<Self>, address: MacAddress) -> Arc<SimRadio> {
        self.radio_with_capacity(address, DEFAULT_PEER_CAPACITY)
    }

    /// Create a radio whose peer table holds at most `capacity` entries
    pub fn radio_with_capacity(self: &Arc<Self>, address: MacAddress, capacity: usize) -> Arc<SimRadio> {
        let radio = Arc::new(SimRadio {
            air: self.clone(),
            address,
            capacity,
            state: Mutex::new(SimState::default()),
        });
        self.state
            .lock()
            .radios
            .insert(address, Arc::downgrade(&radio));
        radio
    }

    /// Everything transmitted so far
    pub fn transmissions(&self) -> Vec<Transmission> {
        self.state.lock().log.clone()
    }

    fn scan(&self) -> Vec<AccessPoint> {
        self.state
            .lock()
            .access_points
            .iter()
            .map(|ap| AccessPoint {
                ssid: ap.ssid.clone(),
                channel: ap.channel,
                rssi: -40,
            })
            .collect()
    }

    fn associate(&self, ssid: &str, password: &str, channel: u8) -> Result<Ipv4Addr, RadioError> {
        let mut state = self.state.lock();
        let ap = state
            .access_points
            .iter()
            .find(|ap| ap.ssid == ssid && ap.channel == channel)
            .cloned()
            .ok_or_else(|| RadioError::AssociationFailed {
                ssid: ssid.to_string(),
                reason: "no such network on channel".to_string(),
            })?;

        if let Some(expected) = ap.password {
            if expected != password {
                return Err(RadioError::AssociationFailed {
                    ssid: ssid.to_string(),
                    reason: "authentication failed".to_string(),
                });
            }
        }

        state.next_host = state.next_host.wrapping_add(1).max(2);
        Ok(Ipv4Addr::new(192, 168, 4, state.next_host))
    }

    /// Put a frame on the air; true if a unicast destination heard it
    fn transmit(&self, tx: Transmission, body: &[u8]) -> bool {
        let receivers: Vec<Arc<SimRadio>> = {
            let mut state = self.state.lock();
            let loss = state.loss;
            let mut rng = rand::thread_rng();
            let receivers = state
                .radios
                .iter()
                .filter(|(addr, _)| **addr != tx.source)
                .filter(|(addr, _)| tx.dest.is_broadcast() || **addr == tx.dest)
                .filter_map(|(_, radio)| radio.upgrade())
                .filter(|_| loss <= 0.0 || !rng.gen_bool(loss))
                .collect();
            state.log.push(tx.clone());
            receivers
        };

        let mut heard = false;
        for radio in receivers {
            heard |= radio.deliver(tx.source, tx.channel, tx.encrypted, body);
        }
        heard
    }
}

#[derive(Default)]
struct SimState {
    started: bool,
    channel: Option<u8>,
    address: Option<Ipv4Addr>,
    dispatcher: Option<Arc<Dispatcher>>,
    cipher: Option<FrameCipher>,
    power_save: Option<(u16, u16)>,
    peers: Vec<PeerInfo>,
}

/// A radio attached to a [`SimulatedAir`]
pub struct SimRadio {
    air: Arc<SimulatedAir>,
    address: MacAddress,
    capacity: usize,
    state: Mutex<SimState>,
}

impl SimRadio {
    /// Power-save parameters currently applied
    pub fn power_save(&self) -> Option<(u16, u16)> {
        self.state.lock().power_save
    }

    /// Address obtained from the last association
    pub fn ip_address(&self) -> Option<Ipv4Addr> {
        self.state.lock().address
    }

    pub fn is_initialized(&self) -> bool {
        self.state.lock().dispatcher.is_some()
    }

    /// Receive path; returns whether the link layer heard the frame
    fn deliver(&self, source: MacAddress, channel: u8, encrypted: bool, body: &[u8]) -> bool {
        let (dispatcher, data) = {
            let state = self.state.lock();
            let Some(dispatcher) = state.dispatcher.clone() else {
                return false;
            };
            if state.channel != Some(channel) {
                return false;
            }

            let data = if encrypted {
                let key = state
                    .peers
                    .iter()
                    .find(|p| p.address == source)
                    .and_then(|p| p.key);
                match (key, state.cipher.as_ref()) {
                    (Some(lmk), Some(cipher)) => match cipher.open(&lmk, body) {
                        Ok(plain) => plain,
                        Err(e) => {
                            debug!("{}: dropping frame from {}: {}", self.address, source, e);
                            return true;
                        }
                    },
                    _ => {
                        debug!(
                            "{}: dropping encrypted frame from unknown peer {}",
                            self.address, source
                        );
                        return true;
                    }
                }
            } else {
                body.to_vec()
            };
            (dispatcher, data)
        };

        dispatcher.post(Dispatch::Received { source, data });
        true
    }
}

impl Radio for SimRadio {
    fn mac_address(&self) -> MacAddress {
        self.address
    }

    fn start(&self) -> Result<(), RadioError> {
        self.state.lock().started = true;
        Ok(())
    }

    fn scan(&self) -> Result<Vec<AccessPoint>, RadioError> {
        if !self.state.lock().started {
            return Err(RadioError::NotStarted);
        }
        Ok(self.air.scan())
    }

    fn set_channel(&self, channel: u8) -> Result<(), RadioError> {
        if channel == 0 || channel > MAX_CHANNEL {
            return Err(RadioError::InvalidChannel(channel));
        }
        let mut state = self.state.lock();
        if !state.started {
            return Err(RadioError::NotStarted);
        }
        state.channel = Some(channel);
        Ok(())
    }

    fn channel(&self) -> Option<u8> {
        self.state.lock().channel
    }

    fn associate(&self, ssid: &str, password: &str, channel: u8) -> Result<Ipv4Addr, RadioError> {
        if !self.state.lock().started {
            return Err(RadioError::NotStarted);
        }
        let ip = self.air.associate(ssid, password, channel)?;
        let mut state = self.state.lock();
        state.address = Some(ip);
        state.channel = Some(channel);
        info!("{}: associated with {} as {}", self.address, ssid, ip);
        Ok(ip)
    }

    fn init(&self, callbacks: Arc<dyn RadioCallbacks>) -> Result<(), RadioError> {
        let mut state = self.state.lock();
        if !state.started {
            return Err(RadioError::NotStarted);
        }
        if let Some(old) = state.dispatcher.take() {
            old.stop();
        }
        let dispatcher = Dispatcher::spawn(&format!("sim-radio-{}", self.address), callbacks)?;
        state.dispatcher = Some(Arc::new(dispatcher));
        Ok(())
    }

    fn set_power_save(&self, wake_window_ms: u16, wake_interval_ms: u16) -> Result<(), RadioError> {
        let mut state = self.state.lock();
        if state.dispatcher.is_none() {
            return Err(RadioError::NotInitialized);
        }
        state.power_save = Some((wake_window_ms, wake_interval_ms));
        Ok(())
    }

    fn set_pmk(&self, pmk: &[u8; KEY_LEN]) -> Result<(), RadioError> {
        self.state.lock().cipher = Some(FrameCipher::new(*pmk));
        Ok(())
    }

    fn add_peer(&self, peer: PeerInfo) -> Result<(), RadioError> {
        let mut state = self.state.lock();
        if state.dispatcher.is_none() {
            return Err(RadioError::NotInitialized);
        }
        if state.peers.iter().any(|p| p.address == peer.address) {
            return Err(RadioError::PeerExists(peer.address));
        }
        if state.peers.len() >= self.capacity {
            return Err(RadioError::PeerTableFull {
                capacity: self.capacity,
            });
        }
        state.peers.push(peer);
        Ok(())
    }

    fn peer_exists(&self, address: &MacAddress) -> bool {
        self.state.lock().peers.iter().any(|p| p.address == *address)
    }

    fn peers(&self) -> Vec<PeerInfo> {
        self.state.lock().peers.clone()
    }

    fn send(&self, dest: &MacAddress, data: &[u8]) -> Result<(), RadioError> {
        if data.len() > MAX_FRAME_LEN {
            return Err(RadioError::FrameTooLarge(data.len()));
        }

        let (dispatcher, channel, body, encrypted) = {
            let state = self.state.lock();
            let dispatcher = state
                .dispatcher
                .clone()
                .ok_or(RadioError::NotInitialized)?;
            let channel = state.channel.ok_or(RadioError::NotStarted)?;
            let peer = state
                .peers
                .iter()
                .find(|p| p.address == *dest)
                .ok_or(RadioError::PeerNotFound(*dest))?;

            match (peer.encrypted && !dest.is_broadcast(), peer.key) {
                (true, Some(lmk)) => {
                    let cipher = state.cipher.as_ref().ok_or_else(|| {
                        RadioError::Encryption("primary master key not set".to_string())
                    })?;
                    (dispatcher, channel, cipher.seal(&lmk, data)?, true)
                }
                _ => (dispatcher, channel, data.to_vec(), false),
            }
        };

        let tx = Transmission {
            source: self.address,
            dest: *dest,
            channel,
            encrypted,
            data: data.to_vec(),
        };
        let heard = self.air.transmit(tx, &body);
        trace!("{}: sent {} bytes to {} (heard={})", self.address, data.len(), dest, heard);

        let status = if dest.is_broadcast() || heard {
            SendStatus::Success
        } else {
            SendStatus::Fail
        };
        dispatcher.post(Dispatch::Sent {
            peer: *dest,
            status,
        });
        Ok(())
    }

    fn deinit(&self) {
        let mut state = self.state.lock();
        if let Some(dispatcher) = state.dispatcher.take() {
            dispatcher.stop();
        }
        state.peers.clear();
        state.power_save = None;
        debug!("{}: link layer deinitialized", self.address);
    }
}
