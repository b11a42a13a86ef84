//! NTRIP Relay Engine
//!
//! Fans one serial stream of RTK correction bytes out to several network
//! destinations and routes whatever those destinations send back into the
//! serial link:
//! - Two NTRIP caster uplinks (SOURCE handshake, keep-alive gated reconnects)
//! - A local TCP/UDP socket server broadcasting to up to N peers
//! - An outbound TCP/UDP socket client
//!
//! The daemon owns the serial port; it publishes every chunk it reads into a
//! [`Dispatch`] and hands a [`SerialSink`] to the components for the return
//! path.

// ============================================================================
// Modules
// ============================================================================

pub mod backoff;
pub mod config;
pub mod dispatch;
pub mod error;
pub mod metrics;
pub mod net;
pub mod ntrip;
pub mod outbound;
pub mod relay;
pub mod services;
pub mod socket_client;
pub mod socket_server;
pub mod status;
pub mod uplink;

// ============================================================================
// Re-exports
// ============================================================================

pub use config::{ConfigStore, FileConfigStore, MemoryConfigStore, RelayConfig};
pub use dispatch::{Dispatch, Subscriber};
pub use error::{ConfigError, LinkError};
pub use relay::{Indicators, Relay};
pub use services::{Context, NetworkStatus, SerialSink, StatusIndicator};
pub use socket_client::SocketClient;
pub use socket_server::{PeerInfo, SocketServer, Transport};
pub use uplink::{Uplink, UplinkSlot, UplinkState};
