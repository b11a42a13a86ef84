//! Outbound socket client
//!
//! Keeps one connection to a configured host over TCP or UDP and bridges it
//! with the serial link: source chunks go out, whatever the remote sends is
//! written to the serial sink. Reconnects with backoff whenever the remote
//! closes or a read/write fails.

use std::io::{self, Read, Write};
use std::net::{TcpStream, UdpSocket};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::mpsc::{self, Receiver, RecvTimeoutError, SyncSender, TrySendError};
use std::sync::{Arc, Condvar, Mutex, MutexGuard};
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

use crate::backoff::{Backoff, CLIENT_MAX_DELAY, CLIENT_MIN_DELAY};
use crate::config::SocketClientConfig;
use crate::dispatch::Subscriber;
use crate::error::{ConfigError, LinkError};
use crate::metrics::StreamStats;
use crate::net;
use crate::ntrip::NEWLINE;
use crate::services::{Context, StatusIndicator};

// ============================================================================
// Constants
// ============================================================================

/// Remote read timeout per loop iteration
const READ_TIMEOUT: Duration = Duration::from_millis(50);

/// Time spent draining queued source chunks per loop iteration
const DRAIN_WINDOW: Duration = Duration::from_millis(10);

/// Send/connect timeout
const SOCKET_TIMEOUT: Duration = Duration::from_secs(10);

/// Source chunks buffered between dispatch and the client
pub const QUEUE_DEPTH: usize = 64;

const BUFFER_SIZE: usize = 512;

const NETWORK_POLL: Duration = Duration::from_secs(1);

#[derive(Debug, Clone)]
pub struct SocketClientOptions {
    pub min_delay: Duration,
    pub max_delay: Duration,
    pub connect_timeout: Duration,
    pub read_timeout: Duration,
    pub drain_window: Duration,
    pub queue_depth: usize,
}

impl Default for SocketClientOptions {
    fn default() -> Self {
        SocketClientOptions {
            min_delay: CLIENT_MIN_DELAY,
            max_delay: CLIENT_MAX_DELAY,
            connect_timeout: SOCKET_TIMEOUT,
            read_timeout: READ_TIMEOUT,
            drain_window: DRAIN_WINDOW,
            queue_depth: QUEUE_DEPTH,
        }
    }
}

// ============================================================================
// Remote
// ============================================================================

/// Established connection to the remote host
enum Remote {
    Tcp(TcpStream),
    Udp(UdpSocket),
}

impl Remote {
    fn connect(config: &SocketClientConfig, options: &SocketClientOptions) -> Result<Self, LinkError> {
        let remote = if config.tcp {
            let stream = net::connect_tcp(&config.host, config.port, options.connect_timeout)?;
            stream
                .set_write_timeout(Some(SOCKET_TIMEOUT))
                .map_err(LinkError::Write)?;
            stream
                .set_read_timeout(Some(options.read_timeout))
                .map_err(LinkError::Read)?;
            Remote::Tcp(stream)
        } else {
            let socket = net::connect_udp(&config.host, config.port)?;
            socket
                .set_write_timeout(Some(SOCKET_TIMEOUT))
                .map_err(LinkError::Write)?;
            socket
                .set_read_timeout(Some(options.read_timeout))
                .map_err(LinkError::Read)?;
            Remote::Udp(socket)
        };
        Ok(remote)
    }

    /// Wait up to the read timeout. `Ok(None)` means nothing arrived.
    fn recv(&mut self, buf: &mut [u8]) -> Result<Option<usize>, LinkError> {
        let result = match self {
            Remote::Tcp(stream) => match stream.read(buf) {
                Ok(0) => return Err(LinkError::PeerClosed),
                other => other,
            },
            Remote::Udp(socket) => socket.recv(buf),
        };
        match result {
            Ok(n) => Ok(Some(n)),
            Err(e) if is_timeout(&e) => Ok(None),
            Err(e) => Err(LinkError::Read(e)),
        }
    }

    fn send(&mut self, data: &[u8]) -> Result<(), LinkError> {
        match self {
            Remote::Tcp(stream) => stream.write_all(data).map_err(LinkError::Write),
            Remote::Udp(socket) => socket.send(data).map(|_| ()).map_err(LinkError::Write),
        }
    }
}

fn is_timeout(e: &io::Error) -> bool {
    matches!(
        e.kind(),
        io::ErrorKind::WouldBlock | io::ErrorKind::TimedOut | io::ErrorKind::Interrupted
    )
}

// ============================================================================
// Client
// ============================================================================

pub struct SocketClient {
    ctx: Context,
    indicator: Option<Arc<dyn StatusIndicator>>,
    options: SocketClientOptions,
    queue: SyncSender<Vec<u8>>,
    rx: Mutex<Option<Receiver<Vec<u8>>>>,
    running: Mutex<bool>,
    stop_signal: Condvar,
    connected: AtomicBool,
    stats: StreamStats,
    thread: Mutex<Option<JoinHandle<()>>>,
}

impl SocketClient {
    /// Create a client. Fails when the configured remote is unusable.
    pub fn new(
        ctx: Context,
        indicator: Option<Arc<dyn StatusIndicator>>,
        options: SocketClientOptions,
    ) -> Result<Arc<Self>, ConfigError> {
        ctx.config.load()?.socket_client.validate()?;

        let (queue, rx) = mpsc::sync_channel(options.queue_depth);
        Ok(Arc::new(SocketClient {
            ctx,
            indicator,
            options,
            queue,
            rx: Mutex::new(Some(rx)),
            running: Mutex::new(true),
            stop_signal: Condvar::new(),
            connected: AtomicBool::new(false),
            stats: StreamStats::new("socket_client"),
            thread: Mutex::new(None),
        }))
    }

    pub fn start(self: &Arc<Self>) -> io::Result<()> {
        let rx = match lock(&self.rx).take() {
            Some(rx) => rx,
            None => return Err(io::Error::new(io::ErrorKind::Other, "socket client already started")),
        };
        let client = Arc::clone(self);
        let handle = thread::Builder::new()
            .name("socket_client_task".to_string())
            .spawn(move || client.run(rx))?;
        *lock(&self.thread) = Some(handle);
        Ok(())
    }

    pub fn stop(&self) {
        *lock(&self.running) = false;
        self.stop_signal.notify_all();
    }

    pub fn join(&self) {
        let handle = lock(&self.thread).take();
        if let Some(handle) = handle {
            if handle.join().is_err() {
                log::error!("Socket client thread panicked");
            }
        }
    }

    pub fn is_connected(&self) -> bool {
        self.connected.load(Ordering::SeqCst)
    }

    pub fn stats(&self) -> &StreamStats {
        &self.stats
    }

    fn run(&self, rx: Receiver<Vec<u8>>) {
        let mut buf = vec![0u8; BUFFER_SIZE];
        let mut backoff = Backoff::new(self.options.min_delay, self.options.max_delay);

        log::info!("Socket client started");

        while self.sleep(backoff.next_delay()) && self.wait_for_network() {
            let config = match self.ctx.config.load() {
                Ok(config) => config.socket_client,
                Err(e) => {
                    log::error!("Socket client: {}", LinkError::from(e));
                    continue;
                }
            };
            let scheme = if config.tcp { "tcp" } else { "udp" };

            let mut remote = match Remote::connect(&config, &self.options) {
                Ok(remote) => remote,
                Err(e) => {
                    log::warn!("Socket client: {}", e);
                    continue;
                }
            };

            log::info!("Socket client connected to {}://{}:{}", scheme, config.host, config.port);
            backoff.reset();

            if let Err(e) = self.session(&mut remote, &config, &rx, &mut buf) {
                log::warn!("Socket client {}://{}:{}: {}", scheme, config.host, config.port, e);
            }

            self.connected.store(false, Ordering::SeqCst);
            self.stats.record_disconnect();
            self.set_indicator(false);
            log::info!("Socket client disconnected from {}://{}:{}", scheme, config.host, config.port);
        }

        log::info!("Socket client stopped");
    }

    fn session(
        &self,
        remote: &mut Remote,
        config: &SocketClientConfig,
        rx: &Receiver<Vec<u8>>,
        buf: &mut [u8],
    ) -> Result<(), LinkError> {
        // Chunks queued before the connection existed are stale
        while rx.try_recv().is_ok() {}

        self.stats.record_connect();
        self.connected.store(true, Ordering::SeqCst);
        self.set_indicator(true);

        if !config.connect_message.is_empty() {
            let greeting = format!("{}{}", config.connect_message, NEWLINE);
            remote.send(greeting.as_bytes())?;
            self.stats.add_sent(greeting.len());
        }

        while self.is_running() {
            if let Some(n) = remote.recv(buf)? {
                if let Err(e) = self.ctx.sink.write(&buf[..n]) {
                    log::warn!("Failed to write socket client data to serial: {}", e);
                }
                self.stats.add_received(n);
            }

            let deadline = Instant::now() + self.options.drain_window;
            loop {
                let remaining = deadline.saturating_duration_since(Instant::now());
                match rx.recv_timeout(remaining) {
                    Ok(chunk) => {
                        remote.send(&chunk)?;
                        self.stats.add_sent(chunk.len());
                    }
                    Err(RecvTimeoutError::Timeout) => break,
                    Err(RecvTimeoutError::Disconnected) => return Ok(()),
                }
            }
        }
        Ok(())
    }

    fn wait_for_network(&self) -> bool {
        while !self.ctx.network.is_up() {
            if !self.sleep(NETWORK_POLL) {
                return false;
            }
        }
        self.is_running()
    }

    /// Interruptible sleep. Returns false on shutdown.
    fn sleep(&self, duration: Duration) -> bool {
        if duration.is_zero() {
            return self.is_running();
        }
        let (running, _) = self
            .stop_signal
            .wait_timeout_while(lock(&self.running), duration, |running| *running)
            .unwrap_or_else(|e| e.into_inner());
        *running
    }

    fn is_running(&self) -> bool {
        *lock(&self.running)
    }

    fn set_indicator(&self, active: bool) {
        if let Some(indicator) = &self.indicator {
            indicator.set_active(active);
        }
    }
}

impl Subscriber for SocketClient {
    fn on_data(&self, chunk: &[u8]) {
        if !self.is_connected() {
            return;
        }
        if let Err(TrySendError::Full(_)) = self.queue.try_send(chunk.to_vec()) {
            log::debug!("Socket client queue full, dropping {} bytes", chunk.len());
        }
    }
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|e| e.into_inner())
}

// ============================================================================
// Tests
// ============================================================================
