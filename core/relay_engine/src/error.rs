//! Error types for the relay engine
//!
//! None of these ever leave the component that produced them: every
//! per-connection failure is logged and routed back into backoff-then-retry.

use std::io;

use thiserror::Error;

/// Failure of one connection attempt or of an established link
#[derive(Debug, Error)]
pub enum LinkError {
    /// Host name did not resolve to any address
    #[error("could not resolve host {host}")]
    Resolve {
        host: String,
        #[source]
        source: Option<io::Error>,
    },
    /// TCP connect (or UDP connect) failed on every resolved address
    #[error("could not connect to {target}: {source}")]
    Connect {
        target: String,
        #[source]
        source: io::Error,
    },
    /// Caster answered with something other than an accepted status
    #[error("could not connect to mountpoint: {0}")]
    Handshake(String),
    #[error("write failed: {0}")]
    Write(#[source] io::Error),
    #[error("read failed: {0}")]
    Read(#[source] io::Error),
    /// Remote closed the stream gracefully
    #[error("peer closed the connection")]
    PeerClosed,
    /// Endpoint configuration could not be loaded for this attempt
    #[error("configuration unavailable: {0}")]
    Config(#[from] ConfigError),
    /// A working buffer could not be allocated
    #[error("failed to allocate {0} bytes")]
    Allocation(usize),
}

/// Configuration load/validation failure
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("config I/O error: {0}")]
    Io(#[from] io::Error),
    #[error("config parse error: {0}")]
    Parse(#[from] serde_json::Error),
    #[error("invalid configuration: {0}")]
    Invalid(String),
}
