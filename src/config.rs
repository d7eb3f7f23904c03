//! Device configuration
//!
//! Settings are read from a TOML file. Every field has a default, so an
//! empty file (or no file at all) yields a working configuration.

use std::fs;
use std::net::Ipv4Addr;
use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::network::{
    AccessPoint, ClientConfig, ConnectConfig, MacAddress, ServerConfig, UdpRadioConfig, KEY_LEN,
    MAX_CHANNEL,
};

/// Errors loading or checking a configuration
#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("Failed to read config file {path:?}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("Failed to parse config file: {0}")]
    Parse(#[from] toml::de::Error),

    #[error("Invalid configuration: {0}")]
    Invalid(String),
}

/// UDP radio settings
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct UdpSettings {
    pub bind_ip: Ipv4Addr,
    pub broadcast_ip: Ipv4Addr,
    pub base_port: u16,
    /// Channel the configured network is visible on
    pub channel: u8,
    pub peer_capacity: usize,
}

impl Default for UdpSettings {
    fn default() -> Self {
        let radio = UdpRadioConfig::default();
        Self {
            bind_ip: radio.bind_ip,
            broadcast_ip: radio.broadcast_ip,
            base_port: radio.base_port,
            channel: 1,
            peer_capacity: radio.peer_capacity,
        }
    }
}

/// Everything a device needs to run either role
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct DeviceConfig {
    pub ssid: String,
    /// Associate with the network when set (server devices)
    pub password: Option<String>,
    /// Radio address; random when unset
    pub mac: Option<String>,
    pub energy_saver: bool,
    pub wake_window_ms: u16,
    pub wake_interval_ms: u16,
    pub queue_capacity: usize,
    pub enqueue_timeout_ms: u64,
    /// Primary master key, 16 ASCII characters
    pub pmk: String,
    /// Local master key, 16 ASCII characters
    pub lmk: String,
    pub join_interval_ms: u64,
    pub liveness_interval_ms: u64,
    pub liveness_timeout_ms: u64,
    pub rejoin_on_silence: bool,
    pub sync_interval_ms: u64,
    /// HTTP control port of the server
    pub http_port: u16,
    /// Initial mood
    pub mood: String,
    /// Consecutive fatal failures tolerated before giving up
    pub max_failures: u32,
    pub udp: UdpSettings,
}

impl Default for DeviceConfig {
    fn default() -> Self {
        let client = ClientConfig::default();
        let server = ServerConfig::default();
        let connect = client.connect;
        Self {
            ssid: connect.ssid,
            password: None,
            mac: None,
            energy_saver: connect.energy_saver,
            wake_window_ms: connect.wake_window_ms,
            wake_interval_ms: connect.wake_interval_ms,
            queue_capacity: connect.queue_capacity,
            enqueue_timeout_ms: connect.enqueue_timeout.as_millis() as u64,
            pmk: String::from_utf8_lossy(&connect.pmk).into_owned(),
            lmk: String::from_utf8_lossy(&connect.lmk).into_owned(),
            join_interval_ms: client.join_interval.as_millis() as u64,
            liveness_interval_ms: client.liveness_interval.as_millis() as u64,
            liveness_timeout_ms: client.liveness_timeout.as_millis() as u64,
            rejoin_on_silence: client.rejoin_on_silence,
            sync_interval_ms: server.sync_interval.as_millis() as u64,
            http_port: 8080,
            mood: "happy".to_string(),
            max_failures: 3,
            udp: UdpSettings::default(),
        }
    }
}

fn parse_key(name: &str, value: &str) -> Result<[u8; KEY_LEN], ConfigError> {
    value.as_bytes().try_into().map_err(|_| {
        ConfigError::Invalid(format!(
            "{} must be exactly {} bytes, got {}",
            name,
            KEY_LEN,
            value.len()
        ))
    })
}

impl DeviceConfig {
    /// Read and validate a configuration file
    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        let content = fs::read_to_string(path).map_err(|source| ConfigError::Io {
            path: path.to_path_buf(),
            source,
        })?;
        let config: DeviceConfig = toml::from_str(&content)?;
        config.validate()?;
        Ok(config)
    }

    /// Validate the configuration values
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.ssid.is_empty() {
            return Err(ConfigError::Invalid("ssid must not be empty".to_string()));
        }
        parse_key("pmk", &self.pmk)?;
        parse_key("lmk", &self.lmk)?;
        self.mac_address()?;

        if self.queue_capacity == 0 {
            return Err(ConfigError::Invalid(
                "queue_capacity must be at least 1".to_string(),
            ));
        }
        if self.udp.channel == 0 || self.udp.channel > MAX_CHANNEL {
            return Err(ConfigError::Invalid(format!(
                "udp.channel must be between 1 and {}, got {}",
                MAX_CHANNEL, self.udp.channel
            )));
        }
        for (name, value) in [
            ("join_interval_ms", self.join_interval_ms),
            ("liveness_interval_ms", self.liveness_interval_ms),
            ("sync_interval_ms", self.sync_interval_ms),
        ] {
            if value == 0 {
                return Err(ConfigError::Invalid(format!("{} must be positive", name)));
            }
        }
        if self.energy_saver && self.wake_window_ms > self.wake_interval_ms {
            return Err(ConfigError::Invalid(format!(
                "wake_window_ms ({}) exceeds wake_interval_ms ({})",
                self.wake_window_ms, self.wake_interval_ms
            )));
        }
        Ok(())
    }

    /// Configured radio address, if any
    pub fn mac_address(&self) -> Result<Option<MacAddress>, ConfigError> {
        self.mac
            .as_deref()
            .map(|s| {
                s.parse()
                    .map_err(|e| ConfigError::Invalid(format!("mac: {}", e)))
            })
            .transpose()
    }

    pub fn connect_config(&self) -> Result<ConnectConfig, ConfigError> {
        Ok(ConnectConfig {
            ssid: self.ssid.clone(),
            password: self.password.clone(),
            energy_saver: self.energy_saver,
            wake_window_ms: self.wake_window_ms,
            wake_interval_ms: self.wake_interval_ms,
            queue_capacity: self.queue_capacity,
            enqueue_timeout: Duration::from_millis(self.enqueue_timeout_ms),
            pmk: parse_key("pmk", &self.pmk)?,
            lmk: parse_key("lmk", &self.lmk)?,
        })
    }

    pub fn client_config(&self) -> Result<ClientConfig, ConfigError> {
        Ok(ClientConfig {
            connect: self.connect_config()?,
            join_interval: Duration::from_millis(self.join_interval_ms),
            liveness_interval: Duration::from_millis(self.liveness_interval_ms),
            liveness_timeout: Duration::from_millis(self.liveness_timeout_ms),
            rejoin_on_silence: self.rejoin_on_silence,
        })
    }

    pub fn server_config(&self) -> Result<ServerConfig, ConfigError> {
        Ok(ServerConfig {
            connect: self.connect_config()?,
            sync_interval: Duration::from_millis(self.sync_interval_ms),
        })
    }

    /// UDP radio settings with the configured network visible
    pub fn udp_config(&self) -> UdpRadioConfig {
        UdpRadioConfig {
            bind_ip: self.udp.bind_ip,
            broadcast_ip: self.udp.broadcast_ip,
            base_port: self.udp.base_port,
            networks: vec![AccessPoint {
                ssid: self.ssid.clone(),
                channel: self.udp.channel,
                rssi: -50,
            }],
            peer_capacity: self.udp.peer_capacity,
        }
    }
}
