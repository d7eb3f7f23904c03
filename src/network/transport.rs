//! UDP radio
//!
//! Carries radio frames as UDP broadcasts on the local network. Each radio
//! channel maps to one port (`base_port + channel`), every datagram carries
//! the link-layer source and destination, and receivers keep what is
//! addressed to them or to everyone. The peer table, encryption and callback
//! dispatch behave like the simulated radio.

use std::net::{IpAddr, Ipv4Addr, SocketAddr, SocketAddrV4, UdpSocket};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::Duration;

use parking_lot::Mutex;
use socket2::{Domain, Protocol, Socket, Type};
use tracing::{debug, error, info, trace, warn};

use super::dispatch::{Dispatch, Dispatcher};
use super::encryption::FrameCipher;
use super::error::RadioError;
use super::mac::{MacAddress, MAC_LEN};
use super::radio::{
    AccessPoint, PeerInfo, Radio, RadioCallbacks, SendStatus, KEY_LEN, MAX_CHANNEL, MAX_FRAME_LEN,
};

/// Marks datagrams produced by this radio
const MAGIC: [u8; 2] = *b"ML";

/// Magic, source, destination, flags
pub const HEADER_LEN: usize = 2 + MAC_LEN + MAC_LEN + 1;

const FLAG_ENCRYPTED: u8 = 0x01;

/// Receive poll period, bounds how long deinit waits for the thread
const RECV_TIMEOUT: Duration = Duration::from_millis(100);

/// UDP radio settings
#[derive(Debug, Clone)]
pub struct UdpRadioConfig {
    /// Local interface to bind
    pub bind_ip: Ipv4Addr,
    /// Destination of every datagram
    pub broadcast_ip: Ipv4Addr,
    /// Port of channel 0
    pub base_port: u16,
    /// Networks reported by scans
    pub networks: Vec<AccessPoint>,
    /// Peer table capacity
    pub peer_capacity: usize,
}

impl Default for UdpRadioConfig {
    fn default() -> Self {
        Self {
            bind_ip: Ipv4Addr::UNSPECIFIED,
            broadcast_ip: Ipv4Addr::BROADCAST,
            base_port: 47_000,
            networks: Vec::new(),
            peer_capacity: 20,
        }
    }
}

/// Datagram header
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FrameHeader {
    pub source: MacAddress,
    pub dest: MacAddress,
    pub encrypted: bool,
}

/// Prefix `body` with the datagram header
pub fn encode_frame(header: &FrameHeader, body: &[u8]) -> Vec<u8> {
    let mut buf = Vec::with_capacity(HEADER_LEN + body.len());
    buf.extend_from_slice(&MAGIC);
    buf.extend_from_slice(header.source.as_bytes());
    buf.extend_from_slice(header.dest.as_bytes());
    buf.push(if header.encrypted { FLAG_ENCRYPTED } else { 0 });
    buf.extend_from_slice(body);
    buf
}

/// Split a datagram into header and body; `None` for foreign traffic
pub fn decode_frame(datagram: &[u8]) -> Option<(FrameHeader, &[u8])> {
    if datagram.len() < HEADER_LEN || datagram[..2] != MAGIC {
        return None;
    }
    let mut source = [0u8; MAC_LEN];
    let mut dest = [0u8; MAC_LEN];
    source.copy_from_slice(&datagram[2..2 + MAC_LEN]);
    dest.copy_from_slice(&datagram[2 + MAC_LEN..2 + 2 * MAC_LEN]);
    let flags = datagram[HEADER_LEN - 1];

    Some((
        FrameHeader {
            source: MacAddress(source),
            dest: MacAddress(dest),
            encrypted: flags & FLAG_ENCRYPTED != 0,
        },
        &datagram[HEADER_LEN..],
    ))
}

/// Bind a broadcast-capable UDP socket that other radios may share
fn bind_socket(ip: Ipv4Addr, port: u16) -> Result<UdpSocket, RadioError> {
    let addr = SocketAddr::V4(SocketAddrV4::new(ip, port));
    let socket = Socket::new(Domain::IPV4, Type::DGRAM, Some(Protocol::UDP))?;

    socket.set_reuse_address(true)?;
    #[cfg(unix)]
    socket.set_reuse_port(true)?;
    socket.set_broadcast(true)?;
    socket.set_read_timeout(Some(RECV_TIMEOUT))?;
    socket.bind(&addr.into())?;

    let socket: UdpSocket = socket.into();
    info!("UDP radio bound to {} (SO_REUSEADDR, SO_BROADCAST enabled)", addr);
    Ok(socket)
}

#[derive(Default)]
struct LinkState {
    started: bool,
    channel: Option<u8>,
    socket: Option<Arc<UdpSocket>>,
    dispatcher: Option<Arc<Dispatcher>>,
    receiver: Option<(Arc<AtomicBool>, JoinHandle<()>)>,
    cipher: Option<FrameCipher>,
    power_save: Option<(u16, u16)>,
    peers: Vec<PeerInfo>,
}

/// Peer table and keys read by the receive thread
#[derive(Default)]
struct Keys {
    cipher: Option<FrameCipher>,
    peers: Vec<PeerInfo>,
}

/// Radio over UDP broadcast
pub struct UdpRadio {
    address: MacAddress,
    config: UdpRadioConfig,
    state: Mutex<LinkState>,
    keys: Arc<Mutex<Keys>>,
}

impl UdpRadio {
    pub fn new(address: MacAddress, config: UdpRadioConfig) -> Self {
        Self {
            address,
            config,
            state: Mutex::new(LinkState::default()),
            keys: Arc::new(Mutex::new(Keys::default())),
        }
    }

    /// Local socket address, once a channel is set
    pub fn local_addr(&self) -> Option<SocketAddr> {
        let state = self.state.lock();
        state.socket.as_ref().and_then(|s| s.local_addr().ok())
    }

    pub fn power_save(&self) -> Option<(u16, u16)> {
        self.state.lock().power_save
    }

    fn port(&self, channel: u8) -> u16 {
        self.config.base_port.wrapping_add(channel as u16)
    }

    fn sync_keys(&self, state: &LinkState) {
        let mut keys = self.keys.lock();
        keys.cipher = state.cipher.clone();
        keys.peers = state.peers.clone();
    }

    fn stop_receiver(state: &mut LinkState) {
        if let Some((running, handle)) = state.receiver.take() {
            running.store(false, Ordering::SeqCst);
            if handle.join().is_err() {
                error!("UDP receive thread panicked");
            }
        }
    }
}

fn receive_loop(
    own: MacAddress,
    socket: Arc<UdpSocket>,
    dispatcher: Arc<Dispatcher>,
    keys: Arc<Mutex<Keys>>,
    running: Arc<AtomicBool>,
) {
    let mut buf = [0u8; HEADER_LEN + MAX_FRAME_LEN + 64];
    while running.load(Ordering::SeqCst) {
        let (len, from) = match socket.recv_from(&mut buf) {
            Ok(received) => received,
            Err(e)
                if matches!(
                    e.kind(),
                    std::io::ErrorKind::WouldBlock | std::io::ErrorKind::TimedOut
                ) =>
            {
                continue
            }
            Err(e) => {
                error!("UDP receive error: {}", e);
                continue;
            }
        };

        let Some((header, body)) = decode_frame(&buf[..len]) else {
            trace!("Ignoring foreign datagram from {}", from);
            continue;
        };
        if header.source == own || !(header.dest == own || header.dest.is_broadcast()) {
            continue;
        }

        let data = if header.encrypted {
            let keys = keys.lock();
            let key = keys
                .peers
                .iter()
                .find(|p| p.address == header.source)
                .and_then(|p| p.key);
            match (key, keys.cipher.as_ref()) {
                (Some(lmk), Some(cipher)) => match cipher.open(&lmk, body) {
                    Ok(plain) => plain,
                    Err(e) => {
                        debug!("Dropping frame from {}: {}", header.source, e);
                        continue;
                    }
                },
                _ => {
                    debug!("Dropping encrypted frame from unknown peer {}", header.source);
                    continue;
                }
            }
        } else {
            body.to_vec()
        };

        dispatcher.post(Dispatch::Received {
            source: header.source,
            data,
        });
    }
    debug!("UDP receive thread stopped");
}

impl Radio for UdpRadio {
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
        Ok(self.config.networks.clone())
    }

    fn set_channel(&self, channel: u8) -> Result<(), RadioError> {
        if channel == 0 || channel > MAX_CHANNEL {
            return Err(RadioError::InvalidChannel(channel));
        }
        let mut state = self.state.lock();
        if !state.started {
            return Err(RadioError::NotStarted);
        }
        if state.channel == Some(channel) && state.socket.is_some() {
            return Ok(());
        }
        if state.dispatcher.is_some() {
            warn!("Changing channel while the link layer is up");
        }
        state.socket = Some(Arc::new(bind_socket(self.config.bind_ip, self.port(channel))?));
        state.channel = Some(channel);
        Ok(())
    }

    fn channel(&self) -> Option<u8> {
        self.state.lock().channel
    }

    fn associate(&self, ssid: &str, _password: &str, channel: u8) -> Result<Ipv4Addr, RadioError> {
        if !self.config.networks.iter().any(|ap| ap.ssid == ssid) {
            return Err(RadioError::AssociationFailed {
                ssid: ssid.to_string(),
                reason: "network not configured".to_string(),
            });
        }
        self.set_channel(channel)?;

        match local_ip_address::local_ip() {
            Ok(IpAddr::V4(ip)) => Ok(ip),
            Ok(IpAddr::V6(ip)) => Err(RadioError::AssociationFailed {
                ssid: ssid.to_string(),
                reason: format!("no IPv4 address (found {})", ip),
            }),
            Err(e) => Err(RadioError::AssociationFailed {
                ssid: ssid.to_string(),
                reason: e.to_string(),
            }),
        }
    }

    fn init(&self, callbacks: Arc<dyn RadioCallbacks>) -> Result<(), RadioError> {
        let mut state = self.state.lock();
        if !state.started {
            return Err(RadioError::NotStarted);
        }
        let socket = state.socket.clone().ok_or(RadioError::NotStarted)?;

        Self::stop_receiver(&mut state);
        if let Some(old) = state.dispatcher.take() {
            old.stop();
        }

        let dispatcher = Arc::new(Dispatcher::spawn(
            &format!("udp-radio-{}", self.address),
            callbacks,
        )?);
        let running = Arc::new(AtomicBool::new(true));
        let handle = {
            let own = self.address;
            let dispatcher = dispatcher.clone();
            let keys = self.keys.clone();
            let running = running.clone();
            thread::Builder::new()
                .name(format!("udp-recv-{}", self.address))
                .spawn(move || receive_loop(own, socket, dispatcher, keys, running))?
        };

        state.dispatcher = Some(dispatcher);
        state.receiver = Some((running, handle));
        Ok(())
    }

    fn set_power_save(&self, wake_window_ms: u16, wake_interval_ms: u16) -> Result<(), RadioError> {
        let mut state = self.state.lock();
        if state.dispatcher.is_none() {
            return Err(RadioError::NotInitialized);
        }
        // Datagrams are buffered by the host, so this is bookkeeping only
        state.power_save = Some((wake_window_ms, wake_interval_ms));
        Ok(())
    }

    fn set_pmk(&self, pmk: &[u8; KEY_LEN]) -> Result<(), RadioError> {
        let mut state = self.state.lock();
        state.cipher = Some(FrameCipher::new(*pmk));
        self.sync_keys(&state);
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
        if state.peers.len() >= self.config.peer_capacity {
            return Err(RadioError::PeerTableFull {
                capacity: self.config.peer_capacity,
            });
        }
        state.peers.push(peer);
        self.sync_keys(&state);
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

        let (socket, dispatcher, port, datagram) = {
            let state = self.state.lock();
            let dispatcher = state
                .dispatcher
                .clone()
                .ok_or(RadioError::NotInitialized)?;
            let socket = state.socket.clone().ok_or(RadioError::NotStarted)?;
            let channel = state.channel.ok_or(RadioError::NotStarted)?;
            let peer = state
                .peers
                .iter()
                .find(|p| p.address == *dest)
                .ok_or(RadioError::PeerNotFound(*dest))?;

            let (body, encrypted) = match (peer.encrypted && !dest.is_broadcast(), peer.key) {
                (true, Some(lmk)) => {
                    let cipher = state.cipher.as_ref().ok_or_else(|| {
                        RadioError::Encryption("primary master key not set".to_string())
                    })?;
                    (cipher.seal(&lmk, data)?, true)
                }
                _ => (data.to_vec(), false),
            };
            let header = FrameHeader {
                source: self.address,
                dest: *dest,
                encrypted,
            };
            (socket, dispatcher, self.port(channel), encode_frame(&header, &body))
        };

        let target = SocketAddr::V4(SocketAddrV4::new(self.config.broadcast_ip, port));
        let status = match socket.send_to(&datagram, target) {
            Ok(_) => {
                trace!("Sent {} bytes to {} via {}", data.len(), dest, target);
                SendStatus::Success
            }
            Err(e) => {
                warn!("UDP send to {} failed: {}", target, e);
                SendStatus::Fail
            }
        };
        dispatcher.post(Dispatch::Sent {
            peer: *dest,
            status,
        });
        Ok(())
    }

    fn deinit(&self) {
        let mut state = self.state.lock();
        Self::stop_receiver(&mut state);
        if let Some(dispatcher) = state.dispatcher.take() {
            dispatcher.stop();
        }
        state.peers.clear();
        state.power_save = None;
        self.sync_keys(&state);
        debug!("{}: link layer deinitialized", self.address);
    }
}

impl Drop for UdpRadio {
    fn drop(&mut self) {
        self.deinit();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Instant;

    #[derive(Default)]
    struct Recorder {
        received: Mutex<Vec<(MacAddress, Vec<u8>)>>,
        sent: Mutex<Vec<(MacAddress, SendStatus)>>,
    }

    impl RadioCallbacks for Recorder {
        fn on_send(&self, peer: Option<MacAddress>, status: SendStatus) {
            if let Some(peer) = peer {
                self.sent.lock().push((peer, status));
            }
        }

        fn on_receive(&self, source: Option<MacAddress>, data: Option<&[u8]>) {
            if let (Some(source), Some(data)) = (source, data) {
                self.received.lock().push((source, data.to_vec()));
            }
        }
    }

    fn wait_until(mut condition: impl FnMut() -> bool) -> bool {
        let deadline = Instant::now() + Duration::from_secs(2);
        while Instant::now() < deadline {
            if condition() {
                return true;
            }
            thread::sleep(Duration::from_millis(5));
        }
        condition()
    }

    /// Radio on a free loopback port, channel 1
    fn loopback_radio(address: MacAddress) -> UdpRadio {
        let port = UdpSocket::bind("127.0.0.1:0")
            .unwrap()
            .local_addr()
            .unwrap()
            .port();
        let radio = UdpRadio::new(
            address,
            UdpRadioConfig {
                bind_ip: Ipv4Addr::LOCALHOST,
                broadcast_ip: Ipv4Addr::LOCALHOST,
                base_port: port - 1,
                networks: vec![AccessPoint {
                    ssid: "moods".to_string(),
                    channel: 1,
                    rssi: -50,
                }],
                peer_capacity: 4,
            },
        );
        radio.start().unwrap();
        radio.set_channel(1).unwrap();
        radio
    }

    #[test]
    fn test_frame_header_roundtrip() {
        let header = FrameHeader {
            source: MacAddress::random(),
            dest: MacAddress::BROADCAST,
            encrypted: true,
        };
        let datagram = encode_frame(&header, b"body");
        assert_eq!(datagram.len(), HEADER_LEN + 4);

        let (decoded, body) = decode_frame(&datagram).unwrap();
        assert_eq!(decoded, header);
        assert_eq!(body, b"body");
    }

    #[test]
    fn test_foreign_datagrams_are_ignored() {
        assert!(decode_frame(b"short").is_none());
        let mut datagram = encode_frame(
            &FrameHeader {
                source: MacAddress::random(),
                dest: MacAddress::BROADCAST,
                encrypted: false,
            },
            b"x",
        );
        datagram[0] = b'X';
        assert!(decode_frame(&datagram).is_none());
    }

    #[test]
    fn test_scan_reports_configured_networks() {
        let radio = loopback_radio(MacAddress::random());
        let networks = radio.scan().unwrap();
        assert_eq!(networks.len(), 1);
        assert_eq!(networks[0].ssid, "moods");
        assert!(radio.local_addr().is_some());
    }

    #[test]
    fn test_receives_frames_addressed_to_it() {
        let own = MacAddress::random();
        let radio = loopback_radio(own);
        let recorder = Arc::new(Recorder::default());
        radio.init(recorder.clone()).unwrap();

        let target = radio.local_addr().unwrap();
        let sender = UdpSocket::bind("127.0.0.1:0").unwrap();
        let stranger = MacAddress::random();

        let to_other = encode_frame(
            &FrameHeader {
                source: stranger,
                dest: MacAddress::random(),
                encrypted: false,
            },
            b"not for us",
        );
        let to_all = encode_frame(
            &FrameHeader {
                source: stranger,
                dest: MacAddress::BROADCAST,
                encrypted: false,
            },
            b"hello",
        );
        sender.send_to(&to_other, target).unwrap();
        sender.send_to(&to_all, target).unwrap();

        assert!(wait_until(|| !recorder.received.lock().is_empty()));
        thread::sleep(Duration::from_millis(50));
        let received = recorder.received.lock().clone();
        assert_eq!(received, vec![(stranger, b"hello".to_vec())]);

        radio.deinit();
    }

    #[test]
    fn test_send_reports_completion() {
        let radio = loopback_radio(MacAddress::random());
        let recorder = Arc::new(Recorder::default());
        radio.init(recorder.clone()).unwrap();
        radio
            .add_peer(PeerInfo::open(MacAddress::BROADCAST, 1))
            .unwrap();

        radio.send(&MacAddress::BROADCAST, b"sync").unwrap();
        assert!(wait_until(|| !recorder.sent.lock().is_empty()));
        assert_eq!(
            recorder.sent.lock()[0],
            (MacAddress::BROADCAST, SendStatus::Success)
        );
        // Own broadcasts never come back
        thread::sleep(Duration::from_millis(50));
        assert!(recorder.received.lock().is_empty());
    }

    #[test]
    fn test_send_requires_registered_peer() {
        let radio = loopback_radio(MacAddress::random());
        radio.init(Arc::new(Recorder::default())).unwrap();
        let dest = MacAddress::random();
        assert_eq!(radio.send(&dest, b"x"), Err(RadioError::PeerNotFound(dest)));
    }

    #[test]
    fn test_encrypted_unicast_needs_a_known_peer() {
        let pmk = *b"pmk1234567890123";
        let lmk = *b"lmk1234567890123";
        let own = MacAddress::random();
        let radio = loopback_radio(own);
        let recorder = Arc::new(Recorder::default());
        radio.init(recorder.clone()).unwrap();
        radio.set_pmk(&pmk).unwrap();

        let known = MacAddress::random();
        radio.add_peer(PeerInfo::encrypted(known, 1, lmk)).unwrap();

        let cipher = FrameCipher::new(pmk);
        let sealed = |source: MacAddress, key: &[u8; KEY_LEN], plain: &[u8]| {
            encode_frame(
                &FrameHeader {
                    source,
                    dest: own,
                    encrypted: true,
                },
                &cipher.seal(key, plain).unwrap(),
            )
        };

        let target = radio.local_addr().unwrap();
        let sender = UdpSocket::bind("127.0.0.1:0").unwrap();
        sender
            .send_to(&sealed(MacAddress::random(), &lmk, b"stranger"), target)
            .unwrap();
        sender
            .send_to(&sealed(known, b"other-lmk-123456", b"wrong key"), target)
            .unwrap();
        sender
            .send_to(&sealed(known, &lmk, b"join_response"), target)
            .unwrap();

        assert!(wait_until(|| !recorder.received.lock().is_empty()));
        thread::sleep(Duration::from_millis(50));
        let received = recorder.received.lock().clone();
        assert_eq!(received, vec![(known, b"join_response".to_vec())]);

        radio.deinit();
    }
}
