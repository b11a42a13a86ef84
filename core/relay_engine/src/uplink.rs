//! NTRIP caster uplink
//!
//! One [`Uplink`] uploads the serial correction stream to one caster. The
//! relay runs two of them ([`UplinkSlot::Primary`] tagged `SRV`,
//! [`UplinkSlot::Secondary`] tagged `SRV2`) with identical logic and separate
//! configuration, sockets, locks and statistics.
//!
//! # Lifecycle
//!
//! ```text
//!   Idle ──► WaitingForData ──► Connecting ──► Handshaking ──► Streaming
//!                 ▲                  │               │              │
//!                 │                  ▼               ▼              ▼
//!                 └──── backoff ◄─ Error ◄───────────┘        Disconnecting
//!                          ▲                                        │
//!                          └────────────────────────────────────────┘
//! ```
//!
//! Two threads touch the connection: the worker (connect, handshake,
//! teardown) and the dispatch path (writes). Both go through one mutex owned
//! by the uplink. While streaming, the worker parks on a condition variable
//! and is woken when the dispatch path loses the caster or on shutdown; the
//! wait is predicate-based, so a wake issued before the worker parks is not
//! lost.
//!
//! A separate liveness thread clears `data_ready` when the serial source has
//! been silent for the keep-alive threshold. Without `data_ready` the worker
//! does not reconnect; it parks in `WaitingForData` until data returns.

use std::io::{Read, Write};
use std::net::TcpStream;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Condvar, Mutex, MutexGuard};
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

use crate::backoff::{Backoff, UPLINK_MAX_DELAY, UPLINK_MIN_DELAY};
use crate::config::{RelayConfig, UplinkConfig};
use crate::dispatch::Subscriber;
use crate::error::{ConfigError, LinkError};
use crate::metrics::StreamStats;
use crate::net;
use crate::ntrip::{self, HandshakeResult};
use crate::outbound::{OutboundBuffer, DEFAULT_OUTBOUND_LIMIT};
use crate::services::{Context, StatusIndicator};
use crate::status::{self, UplinkEvent};

// ============================================================================
// Constants
// ============================================================================

/// Working buffer for the handshake exchange
const BUFFER_SIZE: usize = 512;

/// TCP connect timeout
const CONNECT_TIMEOUT: Duration = Duration::from_secs(10);

/// How long to wait for the caster's response
const RESPONSE_TIMEOUT: Duration = Duration::from_secs(10);

/// Poll interval while the network is down
const NETWORK_POLL: Duration = Duration::from_secs(1);

// ============================================================================
// Identity
// ============================================================================

/// Which of the two uplinks this is
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum UplinkSlot {
    Primary,
    Secondary,
}

impl UplinkSlot {
    /// Tag used in serial status sentences. External tooling parses it.
    pub fn tag(&self) -> &'static str {
        match self {
            UplinkSlot::Primary => "SRV",
            UplinkSlot::Secondary => "SRV2",
        }
    }

    /// Name used for statistics and thread names
    pub fn name(&self) -> &'static str {
        match self {
            UplinkSlot::Primary => "ntrip_server",
            UplinkSlot::Secondary => "ntrip_server_2",
        }
    }

    /// This uplink's section of the configuration
    pub fn config<'a>(&self, config: &'a RelayConfig) -> &'a UplinkConfig {
        match self {
            UplinkSlot::Primary => &config.ntrip_server,
            UplinkSlot::Secondary => &config.ntrip_server_2,
        }
    }
}

/// Caster endpoint for one connection attempt. Owned; never changes mid-session.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UplinkEndpoint {
    pub host: String,
    pub port: u16,
    pub mountpoint: String,
    pub username: String,
    pub password: String,
}

impl UplinkEndpoint {
    pub fn from_config(config: &UplinkConfig) -> Result<Self, ConfigError> {
        if config.host.trim().is_empty() {
            return Err(ConfigError::Invalid("caster host not configured".into()));
        }
        if config.mountpoint.trim().is_empty() {
            return Err(ConfigError::Invalid("mountpoint not configured".into()));
        }
        Ok(UplinkEndpoint {
            host: config.host.clone(),
            port: config.port,
            mountpoint: config.mountpoint.clone(),
            username: config.username.clone(),
            password: config.password.clone(),
        })
    }

    fn event_fields(&self) -> (&str, u16, &str) {
        (&self.host, self.port, &self.mountpoint)
    }
}

// ============================================================================
// State
// ============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UplinkState {
    Idle,
    WaitingForData,
    Connecting,
    Handshaking,
    Streaming,
    Disconnecting,
    /// Last attempt failed; backing off before the next one
    Error,
    /// Worker has exited
    Stopped,
}

/// Gates for forwarding and reconnecting
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct LivenessFlags {
    /// Source produced bytes within the keep-alive window
    pub data_ready: bool,
    /// Handshake succeeded; chunks may be forwarded
    pub caster_ready: bool,
    /// At least one chunk forwarded since `caster_ready` was last set
    pub ever_sent: bool,
}

/// Tunables, mostly for tests; defaults follow the firmware
#[derive(Debug, Clone)]
pub struct UplinkOptions {
    pub keep_alive: Duration,
    pub min_delay: Duration,
    pub max_delay: Duration,
    pub connect_timeout: Duration,
    pub response_timeout: Duration,
    pub outbound_limit: usize,
}

impl Default for UplinkOptions {
    fn default() -> Self {
        UplinkOptions {
            keep_alive: Duration::from_millis(crate::config::DEFAULT_KEEP_ALIVE_MS),
            min_delay: UPLINK_MIN_DELAY,
            max_delay: UPLINK_MAX_DELAY,
            connect_timeout: CONNECT_TIMEOUT,
            response_timeout: RESPONSE_TIMEOUT,
            outbound_limit: DEFAULT_OUTBOUND_LIMIT,
        }
    }
}

impl UplinkOptions {
    pub fn from_config(config: &RelayConfig) -> Self {
        UplinkOptions {
            keep_alive: config.keep_alive(),
            ..Default::default()
        }
    }
}

/// Everything guarded by the uplink's lock
struct Link {
    state: UplinkState,
    flags: LivenessFlags,
    /// The one socket this uplink may own
    stream: Option<TcpStream>,
    outbound: OutboundBuffer,
    last_data: Option<Instant>,
    /// Liveness thread counts silence only while armed
    liveness_armed: bool,
    running: bool,
}

// ============================================================================
// Uplink
// ============================================================================

pub struct Uplink {
    slot: UplinkSlot,
    ctx: Context,
    indicator: Option<Arc<dyn StatusIndicator>>,
    options: UplinkOptions,
    link: Mutex<Link>,
    /// Worker wake signal: data arrived, caster lost, or shutdown
    wake: Condvar,
    /// Liveness thread wake signal: armed or shutdown
    liveness: Condvar,
    stats: StreamStats,
    /// Connection attempts started (entered `Connecting`)
    attempts: AtomicU64,
    threads: Mutex<Vec<JoinHandle<()>>>,
}

impl Uplink {
    pub fn new(
        slot: UplinkSlot,
        ctx: Context,
        indicator: Option<Arc<dyn StatusIndicator>>,
        options: UplinkOptions,
    ) -> Arc<Self> {
        Arc::new(Uplink {
            slot,
            ctx,
            indicator,
            link: Mutex::new(Link {
                state: UplinkState::Idle,
                flags: LivenessFlags::default(),
                stream: None,
                outbound: OutboundBuffer::new(options.outbound_limit),
                last_data: None,
                liveness_armed: false,
                running: true,
            }),
            options,
            wake: Condvar::new(),
            liveness: Condvar::new(),
            stats: StreamStats::new(slot.name()),
            attempts: AtomicU64::new(0),
            threads: Mutex::new(Vec::new()),
        })
    }

    /// Spawn the worker and liveness threads
    pub fn start(self: &Arc<Self>) -> std::io::Result<()> {
        let worker = {
            let uplink = Arc::clone(self);
            thread::Builder::new()
                .name(format!("{}_task", self.slot.name()))
                .spawn(move || uplink.run())?
        };
        let liveness = {
            let uplink = Arc::clone(self);
            thread::Builder::new()
                .name(format!("{}_sleep_task", self.slot.name()))
                .spawn(move || uplink.run_liveness())?
        };

        let mut threads = lock(&self.threads);
        threads.push(worker);
        threads.push(liveness);
        Ok(())
    }

    /// Request shutdown. Closes the socket and wakes both threads.
    pub fn stop(&self) {
        let mut link = lock(&self.link);
        link.running = false;
        link.flags.caster_ready = false;
        link.stream = None;
        link.outbound.clear();
        drop(link);
        self.wake.notify_all();
        self.liveness.notify_all();
    }

    /// Wait for both threads to exit (call after `stop`)
    pub fn join(&self) {
        let threads: Vec<_> = lock(&self.threads).drain(..).collect();
        for handle in threads {
            if handle.join().is_err() {
                log::error!("[{}] Uplink thread panicked", self.slot.tag());
            }
        }
    }

    pub fn slot(&self) -> UplinkSlot {
        self.slot
    }

    pub fn state(&self) -> UplinkState {
        lock(&self.link).state
    }

    pub fn flags(&self) -> LivenessFlags {
        lock(&self.link).flags
    }

    pub fn stats(&self) -> &StreamStats {
        &self.stats
    }

    pub fn attempts(&self) -> u64 {
        self.attempts.load(Ordering::Relaxed)
    }

    // ------------------------------------------------------------------------
    // Worker
    // ------------------------------------------------------------------------

    fn run(&self) {
        let tag = self.slot.tag();

        let mut buffer = Vec::new();
        if buffer.try_reserve_exact(BUFFER_SIZE).is_err() {
            log::error!("[{}] {}", tag, LinkError::Allocation(BUFFER_SIZE));
            self.set_state(UplinkState::Stopped);
            return;
        }
        buffer.resize(BUFFER_SIZE, 0);

        let mut backoff = Backoff::new(self.options.min_delay, self.options.max_delay);

        log::info!("[{}] Uplink worker started", tag);

        while self.is_running() {
            if !self.sleep(backoff.next_delay()) {
                break;
            }
            if !self.wait_for_data() {
                break;
            }
            self.arm_liveness(true);
            if !self.wait_for_network() {
                break;
            }

            if let Err(e) = self.session(&mut buffer, &mut backoff) {
                log::error!("[{}] {}", tag, e);
                self.teardown();
            }
        }

        self.arm_liveness(false);
        self.set_state(UplinkState::Stopped);
        log::info!("[{}] Uplink worker stopped", tag);
    }

    /// One connection attempt, and the streaming session if it succeeds
    fn session(&self, buffer: &mut [u8], backoff: &mut Backoff) -> Result<(), LinkError> {
        let tag = self.slot.tag();
        let config = self.ctx.config.load()?;
        let endpoint = UplinkEndpoint::from_config(self.slot.config(&config))?;
        let (host, port, mountpoint) = endpoint.event_fields();

        self.attempts.fetch_add(1, Ordering::Relaxed);
        self.set_state(UplinkState::Connecting);
        log::info!("[{}] Connecting to {}:{}/{}", tag, host, port, mountpoint);
        self.announce(UplinkEvent::Connecting { host, port, mountpoint });

        let mut stream = net::connect_tcp(host, port, self.options.connect_timeout)?;

        self.set_state(UplinkState::Handshaking);
        stream
            .set_read_timeout(Some(self.options.response_timeout))
            .map_err(LinkError::Read)?;
        stream
            .set_write_timeout(Some(self.options.response_timeout))
            .map_err(LinkError::Write)?;

        let request = ntrip::source_request(&endpoint.password, &endpoint.mountpoint);
        stream.write_all(request.as_bytes()).map_err(LinkError::Write)?;

        let len = stream.read(buffer).map_err(LinkError::Read)?;
        if len == 0 {
            return Err(LinkError::PeerClosed);
        }
        match ntrip::check_response(&buffer[..len]) {
            HandshakeResult::Accepted => {}
            HandshakeResult::Rejected(status) => return Err(LinkError::Handshake(status)),
            HandshakeResult::Malformed => {
                return Err(LinkError::Handshake("HTTP response malformed".to_string()))
            }
        }

        stream.set_nonblocking(true).map_err(LinkError::Write)?;

        log::info!("[{}] Successfully connected to {}:{}/{}", tag, host, port, mountpoint);
        self.announce(UplinkEvent::Connected { host, port, mountpoint });
        backoff.reset();
        self.set_indicator(true);
        self.stats.record_connect();

        // Hand the socket to the forwarding path and park until it is lost
        let still_running = {
            let mut link = lock(&self.link);
            link.outbound.clear();
            link.stream = Some(stream);
            link.flags.caster_ready = true;
            link.state = UplinkState::Streaming;

            let link = self
                .wake
                .wait_while(link, |l| l.running && l.flags.caster_ready)
                .unwrap_or_else(|e| e.into_inner());
            link.running
        };

        {
            let mut link = lock(&self.link);
            link.state = UplinkState::Disconnecting;
            link.flags.caster_ready = false;
            link.flags.ever_sent = false;
            link.stream = None;
            link.outbound.clear();
        }
        self.stats.record_disconnect();
        self.set_indicator(false);

        if still_running {
            log::warn!("[{}] Disconnected from {}:{}/{}", tag, host, port, mountpoint);
        } else {
            log::info!("[{}] Closing connection to {}:{}/{} on shutdown", tag, host, port, mountpoint);
        }
        self.announce(UplinkEvent::Disconnected { host, port, mountpoint });
        Ok(())
    }

    /// Failed attempt: no socket survives it
    fn teardown(&self) {
        let mut link = lock(&self.link);
        link.flags.caster_ready = false;
        link.stream = None;
        link.outbound.clear();
        if link.running {
            link.state = UplinkState::Error;
        }
    }

    /// Park until the source produces data. Returns false on shutdown.
    fn wait_for_data(&self) -> bool {
        {
            let mut link = lock(&self.link);
            if link.flags.data_ready || !link.running {
                return link.running;
            }
            link.state = UplinkState::WaitingForData;
            link.liveness_armed = false;
        }

        log::info!("[{}] Waiting for serial input to connect to caster", self.slot.tag());
        self.announce(UplinkEvent::Waiting);

        let link = self
            .wake
            .wait_while(lock(&self.link), |l| l.running && !l.flags.data_ready)
            .unwrap_or_else(|e| e.into_inner());
        link.running
    }

    /// Poll the network gate. Returns false on shutdown.
    fn wait_for_network(&self) -> bool {
        let mut logged = false;
        while !self.ctx.network.is_up() {
            if !logged {
                log::info!("[{}] Waiting for network", self.slot.tag());
                logged = true;
            }
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
        let (link, _) = self
            .wake
            .wait_timeout_while(lock(&self.link), duration, |l| l.running)
            .unwrap_or_else(|e| e.into_inner());
        link.running
    }

    // ------------------------------------------------------------------------
    // Liveness
    // ------------------------------------------------------------------------

    fn arm_liveness(&self, armed: bool) {
        lock(&self.link).liveness_armed = armed;
        self.liveness.notify_all();
    }

    fn run_liveness(&self) {
        let keep_alive = self.options.keep_alive;
        let tick = (keep_alive / 10).max(Duration::from_millis(1));

        let mut link = lock(&self.link);
        while link.running {
            if !link.liveness_armed {
                link = self
                    .liveness
                    .wait_while(link, |l| l.running && !l.liveness_armed)
                    .unwrap_or_else(|e| e.into_inner());
                continue;
            }

            let (guard, _) = self
                .liveness
                .wait_timeout(link, tick)
                .unwrap_or_else(|e| e.into_inner());
            link = guard;

            if !link.running || !link.liveness_armed || !link.flags.data_ready {
                continue;
            }
            let silent = link.last_data.map_or(true, |t| t.elapsed() >= keep_alive);
            if silent {
                link.flags.data_ready = false;
                log::warn!(
                    "[{}] No data received by serial in {} ms, will not reconnect to caster if disconnected",
                    self.slot.tag(),
                    keep_alive.as_millis()
                );
            }
        }
    }

    // ------------------------------------------------------------------------
    // Helpers
    // ------------------------------------------------------------------------

    fn is_running(&self) -> bool {
        lock(&self.link).running
    }

    fn set_state(&self, state: UplinkState) {
        lock(&self.link).state = state;
    }

    fn set_indicator(&self, active: bool) {
        if let Some(indicator) = &self.indicator {
            indicator.set_active(active);
        }
    }

    fn announce(&self, event: UplinkEvent<'_>) {
        status::announce(self.ctx.sink.as_ref(), &event.body(self.slot.tag()));
    }
}

// ============================================================================
// Forwarding path
// ============================================================================

impl Subscriber for Uplink {
    fn on_data(&self, chunk: &[u8]) {
        let mut link = lock(&self.link);

        if !link.flags.data_ready {
            link.flags.data_ready = true;
            if link.flags.ever_sent {
                log::info!(
                    "[{}] Data received by serial, will now reconnect to caster if disconnected",
                    self.slot.tag()
                );
            }
            self.wake.notify_all();
        }
        link.last_data = Some(Instant::now());

        if !link.flags.caster_ready {
            return;
        }
        link.flags.ever_sent = true;

        let result = {
            let Link { stream, outbound, .. } = &mut *link;
            match stream.as_mut() {
                Some(stream) => outbound.send(stream, chunk),
                None => return,
            }
        };

        match result {
            Ok(sent) => self.stats.add_sent(sent),
            Err(e) => {
                log::warn!("[{}] {}", self.slot.tag(), LinkError::Write(e));
                link.stream = None;
                link.outbound.clear();
                link.flags.caster_ready = false;
                drop(link);
                self.wake.notify_all();
            }
        }
    }
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|e| e.into_inner())
}

// ============================================================================
// Tests
// ============================================================================
