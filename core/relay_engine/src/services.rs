//! Interfaces to collaborators that live outside the engine
//!
//! - [`SerialSink`]: the serial port's transmit side (peer replies and status
//!   sentences are written here)
//! - [`NetworkStatus`]: station/AP bring-up, consulted before connecting
//! - [`StatusIndicator`]: one status LED per component
//!
//! Each comes with a minimal in-process implementation used by the daemon
//! and by tests.

use std::io;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};

use crate::config::ConfigStore;

// ============================================================================
// Context
// ============================================================================

/// Collaborators every component is started with
#[derive(Clone)]
pub struct Context {
    /// Configuration store, read at the start of every connection attempt
    pub config: Arc<dyn ConfigStore>,
    /// Serial transmit side shared by all components
    pub sink: Arc<dyn SerialSink>,
    /// Network availability gate
    pub network: Arc<dyn NetworkStatus>,
}

impl Context {
    pub fn new(
        config: Arc<dyn ConfigStore>,
        sink: Arc<dyn SerialSink>,
        network: Arc<dyn NetworkStatus>,
    ) -> Self {
        Context {
            config,
            sink,
            network,
        }
    }
}

// ============================================================================
// Serial sink
// ============================================================================

/// Transmit side of the serial link. Shared by every component.
pub trait SerialSink: Send + Sync {
    fn write(&self, data: &[u8]) -> io::Result<()>;
}

/// Sink collecting everything in memory
#[derive(Clone, Default)]
pub struct MemorySink {
    buf: Arc<Mutex<Vec<u8>>>,
}

impl MemorySink {
    pub fn new() -> Self {
        Self::default()
    }

    /// Copy of everything written so far
    pub fn contents(&self) -> Vec<u8> {
        match self.buf.lock() {
            Ok(buf) => buf.clone(),
            Err(poisoned) => poisoned.into_inner().clone(),
        }
    }

    /// Everything written so far, lossily decoded
    pub fn text(&self) -> String {
        String::from_utf8_lossy(&self.contents()).into_owned()
    }
}

impl SerialSink for MemorySink {
    fn write(&self, data: &[u8]) -> io::Result<()> {
        match self.buf.lock() {
            Ok(mut buf) => buf.extend_from_slice(data),
            Err(poisoned) => poisoned.into_inner().extend_from_slice(data),
        }
        Ok(())
    }
}

/// Sink that writes into any `io::Write` behind a mutex
pub struct WriterSink<W: io::Write + Send> {
    inner: Mutex<W>,
}

impl<W: io::Write + Send> WriterSink<W> {
    pub fn new(writer: W) -> Self {
        WriterSink {
            inner: Mutex::new(writer),
        }
    }
}

impl<W: io::Write + Send> SerialSink for WriterSink<W> {
    fn write(&self, data: &[u8]) -> io::Result<()> {
        let mut writer = self
            .inner
            .lock()
            .map_err(|_| io::Error::new(io::ErrorKind::Other, "serial writer poisoned"))?;
        writer.write_all(data)?;
        writer.flush()
    }
}

// ============================================================================
// Network availability
// ============================================================================

/// Whether the station has an IP address
pub trait NetworkStatus: Send + Sync {
    fn is_up(&self) -> bool;
}

/// Host networking is managed by the OS; always up
#[derive(Debug, Clone, Copy, Default)]
pub struct AlwaysOnline;

impl NetworkStatus for AlwaysOnline {
    fn is_up(&self) -> bool {
        true
    }
}

/// Switchable network state (tests, or a supervisor feeding link events)
#[derive(Clone, Default)]
pub struct NetworkFlag {
    up: Arc<AtomicBool>,
}

impl NetworkFlag {
    pub fn new(up: bool) -> Self {
        NetworkFlag {
            up: Arc::new(AtomicBool::new(up)),
        }
    }

    pub fn set(&self, up: bool) {
        self.up.store(up, Ordering::SeqCst);
    }
}

impl NetworkStatus for NetworkFlag {
    fn is_up(&self) -> bool {
        self.up.load(Ordering::SeqCst)
    }
}

// ============================================================================
// Status indicator
// ============================================================================

/// One status LED
pub trait StatusIndicator: Send + Sync {
    fn set_active(&self, active: bool);
}

/// Indicator that only remembers its state
#[derive(Clone, Default)]
pub struct FlagIndicator {
    active: Arc<AtomicBool>,
}

impl FlagIndicator {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn is_active(&self) -> bool {
        self.active.load(Ordering::SeqCst)
    }
}

impl StatusIndicator for FlagIndicator {
    fn set_active(&self, active: bool) {
        self.active.store(active, Ordering::SeqCst);
    }
}
