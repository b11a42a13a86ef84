//! Relay configuration
//!
//! The persistent key-value store lives outside the engine. The engine reads
//! it through [`ConfigStore`], which hands out an owned [`RelayConfig`]
//! snapshot each time it is asked. Uplinks and the socket client call
//! `load()` at the start of every connection attempt, so edits take effect on
//! the next reconnect without touching a live session.
//!
//! Document layout (JSON, every field optional):
//!
//! ```text
//! {
//!   "keep_alive_ms": 10000,
//!   "ntrip_server":   { "active": true, "host": "caster", "port": 2101, ... },
//!   "ntrip_server_2": { ... },
//!   "socket_server":  { "active": true, "tcp_active": true, "tcp_port": 8880, ... },
//!   "socket_client":  { "active": false, "tcp": true, "host": "", "port": 8880, ... },
//!   "serial":         { "device": "/dev/ttyUSB0", "baud_rate": 115200, "data_bits": 8,
//!                       "stop_bits": 1, "parity": "none", "flow_control": "none", ... }
//! }
//! ```

use std::fs;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::ConfigError;

// ============================================================================
// Constants
// ============================================================================

/// Default NTRIP caster port
pub const DEFAULT_CASTER_PORT: u16 = 2101;

/// Default socket server TCP port
pub const DEFAULT_TCP_SERVER_PORT: u16 = 8880;

/// Default socket server UDP port
pub const DEFAULT_UDP_SERVER_PORT: u16 = 8881;

/// Default socket client remote port
pub const DEFAULT_CLIENT_PORT: u16 = 8880;

/// Default peer table capacity
pub const DEFAULT_MAX_CLIENTS: usize = 10;

/// Default silence threshold before an uplink stops reconnecting
pub const DEFAULT_KEEP_ALIVE_MS: u64 = 10_000;

/// Default idle lifetime of a UDP peer slot
pub const DEFAULT_UDP_PEER_TTL_SECS: u64 = 120;

/// Default serial read chunk
pub const DEFAULT_READ_CHUNK: usize = 512;

/// Default UART line settings (115200 8N1, no flow control)
pub const DEFAULT_BAUD_RATE: u32 = 115_200;
pub const DEFAULT_DATA_BITS: u8 = 8;
pub const DEFAULT_STOP_BITS: u8 = 1;

/// Default status indicator colour for uplinks (dark blue, RGBA)
pub const DEFAULT_UPLINK_COLOR: u32 = 0x0000_0055;

// ============================================================================
// Sections
// ============================================================================

/// One caster uplink (`ntrip_server` / `ntrip_server_2`)
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct UplinkConfig {
    pub active: bool,
    /// Status indicator colour (RGBA); 0 disables the indicator
    pub color: u32,
    pub host: String,
    pub port: u16,
    pub mountpoint: String,
    /// Carried for NTRIP v2 casters; the v1 SOURCE request does not use it
    pub username: String,
    pub password: String,
}

impl Default for UplinkConfig {
    fn default() -> Self {
        UplinkConfig {
            active: false,
            color: DEFAULT_UPLINK_COLOR,
            host: String::new(),
            port: DEFAULT_CASTER_PORT,
            mountpoint: String::new(),
            username: String::new(),
            password: String::new(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct SocketServerConfig {
    pub active: bool,
    pub tcp_active: bool,
    pub tcp_port: u16,
    pub udp_active: bool,
    pub udp_port: u16,
    /// Local address both listeners bind to; `::` also accepts IPv4 peers on
    /// dual-stack hosts
    pub bind_addr: String,
    /// Peer table capacity, shared by TCP and UDP peers
    pub max_clients: usize,
    /// Idle lifetime of a UDP peer; 0 keeps UDP peers until a send fails
    pub udp_peer_ttl_secs: u64,
}

impl Default for SocketServerConfig {
    fn default() -> Self {
        SocketServerConfig {
            active: false,
            tcp_active: false,
            tcp_port: DEFAULT_TCP_SERVER_PORT,
            udp_active: false,
            udp_port: DEFAULT_UDP_SERVER_PORT,
            bind_addr: "::".to_string(),
            max_clients: DEFAULT_MAX_CLIENTS,
            udp_peer_ttl_secs: DEFAULT_UDP_PEER_TTL_SECS,
        }
    }
}

impl SocketServerConfig {
    pub fn udp_peer_ttl(&self) -> Option<Duration> {
        match self.udp_peer_ttl_secs {
            0 => None,
            secs => Some(Duration::from_secs(secs)),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct SocketClientConfig {
    pub active: bool,
    /// true = TCP, false = UDP
    pub tcp: bool,
    pub host: String,
    pub port: u16,
    /// Sent once (followed by CRLF) after every successful connect; empty = none
    pub connect_message: String,
}

impl Default for SocketClientConfig {
    fn default() -> Self {
        SocketClientConfig {
            active: false,
            tcp: true,
            host: String::new(),
            port: DEFAULT_CLIENT_PORT,
            connect_message: String::new(),
        }
    }
}

impl SocketClientConfig {
    /// Reject settings the client cannot start with
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.host.trim().is_empty() {
            return Err(ConfigError::Invalid("socket client host not configured".into()));
        }
        if self.port == 0 {
            return Err(ConfigError::Invalid("socket client port invalid: 0".into()));
        }
        Ok(())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Parity {
    None,
    Odd,
    Even,
}

/// `hardware` is RTS/CTS, `software` is XON/XOFF
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum FlowControl {
    None,
    Software,
    Hardware,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct SerialConfig {
    /// Serial device path; None bridges stdin/stdout instead
    pub device: Option<PathBuf>,
    /// Bytes read from the device per dispatched chunk
    pub read_chunk: usize,
    pub baud_rate: u32,
    /// 5 to 8
    pub data_bits: u8,
    /// 1 or 2
    pub stop_bits: u8,
    pub parity: Parity,
    pub flow_control: FlowControl,
}

impl Default for SerialConfig {
    fn default() -> Self {
        SerialConfig {
            device: None,
            read_chunk: DEFAULT_READ_CHUNK,
            baud_rate: DEFAULT_BAUD_RATE,
            data_bits: DEFAULT_DATA_BITS,
            stop_bits: DEFAULT_STOP_BITS,
            parity: Parity::None,
            flow_control: FlowControl::None,
        }
    }
}

impl SerialConfig {
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.read_chunk == 0 {
            return Err(ConfigError::Invalid("serial.read_chunk must be positive".into()));
        }
        if self.baud_rate == 0 {
            return Err(ConfigError::Invalid("serial.baud_rate must be positive".into()));
        }
        if !(5..=8).contains(&self.data_bits) {
            return Err(ConfigError::Invalid(format!(
                "serial.data_bits invalid: {}",
                self.data_bits
            )));
        }
        if !matches!(self.stop_bits, 1 | 2) {
            return Err(ConfigError::Invalid(format!(
                "serial.stop_bits invalid: {}",
                self.stop_bits
            )));
        }
        Ok(())
    }
}

// ============================================================================
// Document
// ============================================================================

/// Complete configuration document
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct RelayConfig {
    /// Source silence (ms) after which uplinks stop reconnecting
    pub keep_alive_ms: u64,
    pub ntrip_server: UplinkConfig,
    pub ntrip_server_2: UplinkConfig,
    pub socket_server: SocketServerConfig,
    pub socket_client: SocketClientConfig,
    pub serial: SerialConfig,
}

impl Default for RelayConfig {
    fn default() -> Self {
        RelayConfig {
            keep_alive_ms: DEFAULT_KEEP_ALIVE_MS,
            ntrip_server: UplinkConfig::default(),
            ntrip_server_2: UplinkConfig::default(),
            socket_server: SocketServerConfig::default(),
            socket_client: SocketClientConfig::default(),
            serial: SerialConfig::default(),
        }
    }
}

impl RelayConfig {
    /// Parse a JSON document
    pub fn from_json(text: &str) -> Result<Self, ConfigError> {
        let config: RelayConfig = serde_json::from_str(text)?;
        config.validate()?;
        Ok(config)
    }

    pub fn to_json_pretty(&self) -> Result<String, ConfigError> {
        Ok(serde_json::to_string_pretty(self)?)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.keep_alive_ms == 0 {
            return Err(ConfigError::Invalid("keep_alive_ms must be positive".into()));
        }
        if self.socket_server.max_clients == 0 {
            return Err(ConfigError::Invalid("socket_server.max_clients must be positive".into()));
        }
        self.serial.validate()
    }

    pub fn keep_alive(&self) -> Duration {
        Duration::from_millis(self.keep_alive_ms)
    }
}

// ============================================================================
// Store
// ============================================================================

/// Read access to the external configuration store
pub trait ConfigStore: Send + Sync {
    /// Return an owned snapshot of the current configuration
    fn load(&self) -> Result<RelayConfig, ConfigError>;
}

/// JSON file re-read on every `load()`
pub struct FileConfigStore {
    path: PathBuf,
}

impl FileConfigStore {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        FileConfigStore { path: path.into() }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl ConfigStore for FileConfigStore {
    fn load(&self) -> Result<RelayConfig, ConfigError> {
        let text = fs::read_to_string(&self.path)?;
        RelayConfig::from_json(&text)
    }
}

/// In-process store, shared and editable at runtime
#[derive(Clone, Default)]
pub struct MemoryConfigStore {
    inner: Arc<Mutex<RelayConfig>>,
}

impl MemoryConfigStore {
    pub fn new(config: RelayConfig) -> Self {
        MemoryConfigStore {
            inner: Arc::new(Mutex::new(config)),
        }
    }

    /// Apply an edit; running components see it on their next attempt
    pub fn update<F: FnOnce(&mut RelayConfig)>(&self, edit: F) {
        let mut guard = match self.inner.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        };
        edit(&mut guard);
    }
}

impl ConfigStore for MemoryConfigStore {
    fn load(&self) -> Result<RelayConfig, ConfigError> {
        let guard = match self.inner.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        };
        Ok(guard.clone())
    }
}

// ============================================================================
// Tests
// ============================================================================
