//! Local TCP/UDP socket server
//!
//! Listens on up to two ports (TCP and UDP, independently enabled), keeps a
//! fixed-capacity table of peers across both, broadcasts every source chunk
//! to all of them and forwards whatever peers send back to the serial sink.
//!
//! A single `mio` loop owns the sockets. Source chunks arrive from the
//! dispatch path through a bounded queue; the dispatch side only enqueues and
//! wakes the loop, so a slow peer can never stall the serial reader.

mod peers;

pub use peers::{PeerInfo, PeerLink, PeerSlot, PeerTable, Transport};

use std::io::{self, Read};
use std::net::{IpAddr, SocketAddr};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::mpsc::{self, Receiver, SyncSender, TrySendError};
use std::sync::{Arc, Mutex, MutexGuard};
use std::thread::{self, JoinHandle};
use std::time::Duration;

use mio::net::{TcpListener, UdpSocket};
use mio::{Events, Interest, Poll, Registry, Token, Waker};

use crate::config::SocketServerConfig;
use crate::dispatch::Subscriber;
use crate::metrics::StreamStats;
use crate::outbound::DEFAULT_OUTBOUND_LIMIT;
use crate::services::{Context, SerialSink};

// ============================================================================
// Constants
// ============================================================================

const TCP_LISTENER_TOKEN: Token = Token(0);
const UDP_SOCKET_TOKEN: Token = Token(1);
const WAKER_TOKEN: Token = Token(2);

/// Peer slot `i` is registered as `Token(PEER_TOKEN_BASE + i)`
const PEER_TOKEN_BASE: usize = 16;

/// Bounded wait of the event loop
const POLL_TIMEOUT: Duration = Duration::from_secs(1);

/// Source chunks buffered between dispatch and the loop
pub const QUEUE_DEPTH: usize = 64;

/// Largest datagram / stream read handled in one go
const RECV_BUFFER_SIZE: usize = 2048;

// ============================================================================
// Options
// ============================================================================

#[derive(Debug, Clone)]
pub struct SocketServerOptions {
    /// TCP listen address, None = TCP disabled
    pub tcp_addr: Option<SocketAddr>,
    /// UDP bind address, None = UDP disabled
    pub udp_addr: Option<SocketAddr>,
    pub max_clients: usize,
    /// None keeps UDP peers until a send to them fails
    pub udp_peer_ttl: Option<Duration>,
    pub outbound_limit: usize,
    pub queue_depth: usize,
}

impl SocketServerOptions {
    pub fn from_config(config: &SocketServerConfig) -> io::Result<Self> {
        let ip: IpAddr = config
            .bind_addr
            .parse()
            .map_err(|e| io::Error::new(io::ErrorKind::InvalidInput, e))?;

        Ok(SocketServerOptions {
            tcp_addr: config.tcp_active.then(|| SocketAddr::new(ip, config.tcp_port)),
            udp_addr: config.udp_active.then(|| SocketAddr::new(ip, config.udp_port)),
            max_clients: config.max_clients,
            udp_peer_ttl: config.udp_peer_ttl(),
            outbound_limit: DEFAULT_OUTBOUND_LIMIT,
            queue_depth: QUEUE_DEPTH,
        })
    }
}

// ============================================================================
// Server Handle
// ============================================================================

/// State shared between the loop thread and the handle
struct Shared {
    peers: Mutex<PeerTable>,
    running: AtomicBool,
    stats: StreamStats,
    /// Chunks dropped because the queue was full
    dropped_chunks: AtomicU64,
}

pub struct SocketServer {
    shared: Arc<Shared>,
    queue: SyncSender<Vec<u8>>,
    waker: Arc<Waker>,
    tcp_addr: Option<SocketAddr>,
    udp_addr: Option<SocketAddr>,
    thread: Mutex<Option<JoinHandle<()>>>,
}

impl SocketServer {
    /// Bind the enabled listeners and spawn the event loop
    pub fn start(ctx: &Context, options: SocketServerOptions) -> io::Result<Arc<Self>> {
        if options.tcp_addr.is_none() && options.udp_addr.is_none() {
            return Err(io::Error::new(
                io::ErrorKind::InvalidInput,
                "neither TCP nor UDP is enabled",
            ));
        }

        let poll = Poll::new()?;

        let tcp = match options.tcp_addr {
            Some(addr) => {
                let mut listener = TcpListener::bind(addr)?;
                poll.registry()
                    .register(&mut listener, TCP_LISTENER_TOKEN, Interest::READABLE)?;
                log::info!("Socket server listening on tcp://{}", listener.local_addr()?);
                Some(listener)
            }
            None => None,
        };

        let udp = match options.udp_addr {
            Some(addr) => {
                let mut socket = UdpSocket::bind(addr)?;
                poll.registry()
                    .register(&mut socket, UDP_SOCKET_TOKEN, Interest::READABLE)?;
                log::info!("Socket server listening on udp://{}", socket.local_addr()?);
                Some(socket)
            }
            None => None,
        };

        let tcp_addr = tcp.as_ref().map(|l| l.local_addr()).transpose()?;
        let udp_addr = udp.as_ref().map(|s| s.local_addr()).transpose()?;

        let waker = Arc::new(Waker::new(poll.registry(), WAKER_TOKEN)?);
        let (queue, rx) = mpsc::sync_channel(options.queue_depth);

        let shared = Arc::new(Shared {
            peers: Mutex::new(PeerTable::new(options.max_clients)),
            running: AtomicBool::new(true),
            stats: StreamStats::new("socket_server"),
            dropped_chunks: AtomicU64::new(0),
        });

        let mut event_loop = EventLoop {
            poll,
            tcp,
            udp,
            rx,
            shared: Arc::clone(&shared),
            sink: Arc::clone(&ctx.sink),
            udp_peer_ttl: options.udp_peer_ttl,
            outbound_limit: options.outbound_limit,
            buf: vec![0u8; RECV_BUFFER_SIZE],
        };

        let handle = thread::Builder::new()
            .name("socket_server_task".to_string())
            .spawn(move || event_loop.run())?;

        Ok(Arc::new(SocketServer {
            shared,
            queue,
            waker,
            tcp_addr,
            udp_addr,
            thread: Mutex::new(Some(handle)),
        }))
    }

    /// Bound TCP address (useful when started on port 0)
    pub fn tcp_addr(&self) -> Option<SocketAddr> {
        self.tcp_addr
    }

    pub fn udp_addr(&self) -> Option<SocketAddr> {
        self.udp_addr
    }

    pub fn peer_count(&self) -> usize {
        lock(&self.shared.peers).len()
    }

    pub fn peers(&self) -> Vec<PeerInfo> {
        lock(&self.shared.peers).snapshot()
    }

    pub fn stats(&self) -> &StreamStats {
        &self.shared.stats
    }

    pub fn dropped_chunks(&self) -> u64 {
        self.shared.dropped_chunks.load(Ordering::Relaxed)
    }

    pub fn stop(&self) {
        self.shared.running.store(false, Ordering::SeqCst);
        if let Err(e) = self.waker.wake() {
            log::debug!("Failed to wake socket server: {}", e);
        }
    }

    pub fn join(&self) {
        let handle = lock(&self.thread).take();
        if let Some(handle) = handle {
            if handle.join().is_err() {
                log::error!("Socket server thread panicked");
            }
        }
    }
}

impl Subscriber for SocketServer {
    fn on_data(&self, chunk: &[u8]) {
        match self.queue.try_send(chunk.to_vec()) {
            Ok(()) => {}
            Err(TrySendError::Full(_)) => {
                self.shared.dropped_chunks.fetch_add(1, Ordering::Relaxed);
                log::debug!("Socket server queue full, dropping {} bytes", chunk.len());
                return;
            }
            Err(TrySendError::Disconnected(_)) => return,
        }
        if let Err(e) = self.waker.wake() {
            log::debug!("Failed to wake socket server: {}", e);
        }
    }
}

// ============================================================================
// Event Loop
// ============================================================================

struct EventLoop {
    poll: Poll,
    tcp: Option<TcpListener>,
    udp: Option<UdpSocket>,
    rx: Receiver<Vec<u8>>,
    shared: Arc<Shared>,
    sink: Arc<dyn SerialSink>,
    udp_peer_ttl: Option<Duration>,
    outbound_limit: usize,
    buf: Vec<u8>,
}

impl EventLoop {
    fn run(&mut self) {
        let mut events = Events::with_capacity(128);

        while self.shared.running.load(Ordering::SeqCst) {
            if let Err(e) = self.poll.poll(&mut events, Some(POLL_TIMEOUT)) {
                if e.kind() == io::ErrorKind::Interrupted {
                    continue;
                }
                log::error!("Socket server poll failed: {}", e);
                break;
            }

            for event in events.iter() {
                match event.token() {
                    TCP_LISTENER_TOKEN => self.accept_tcp(),
                    UDP_SOCKET_TOKEN => self.receive_udp(),
                    WAKER_TOKEN => {}
                    Token(t) if t >= PEER_TOKEN_BASE => {
                        let index = t - PEER_TOKEN_BASE;
                        if event.is_readable() || event.is_read_closed() {
                            self.read_peer(index);
                        }
                        if event.is_writable() {
                            self.flush_peer(index);
                        }
                    }
                    _ => {}
                }
            }

            if let Some(ttl) = self.udp_peer_ttl {
                let expired = lock(&self.shared.peers).expire_udp(ttl);
                if expired > 0 {
                    log::info!("Expiring {} idle UDP peer(s)", expired);
                }
            }

            while let Ok(chunk) = self.rx.try_recv() {
                self.broadcast(&chunk);
            }

            self.sweep();
        }

        self.close_all();
        log::info!("Socket server stopped");
    }

    /// Accept until the listener would block
    fn accept_tcp(&mut self) {
        let listener = match &self.tcp {
            Some(listener) => listener,
            None => return,
        };

        loop {
            let (stream, addr) = match listener.accept() {
                Ok(v) => v,
                Err(e) if e.kind() == io::ErrorKind::WouldBlock => break,
                Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
                Err(e) => {
                    log::warn!("TCP accept failed: {}", e);
                    break;
                }
            };

            let mut peers = lock(&self.shared.peers);
            let index = match peers.claim(PeerSlot::tcp(stream, addr, self.outbound_limit)) {
                Some(index) => index,
                None => {
                    // The slot (and its stream) was dropped by claim: connection closed
                    log::warn!("Peer limit reached, rejecting tcp://{}", addr);
                    continue;
                }
            };

            let registered = match peers.get_mut(index).map(|slot| &mut slot.link) {
                Some(PeerLink::Tcp { stream, .. }) => self.poll.registry().register(
                    stream,
                    peer_token(index),
                    Interest::READABLE,
                ),
                _ => Ok(()),
            };
            if let Err(e) = registered {
                log::warn!("Failed to register tcp://{}: {}", addr, e);
                peers.release(index);
                continue;
            }

            self.shared.stats.record_connect();
            log::info!("Peer tcp://{} connected (slot {})", addr, index);
        }
    }

    /// Drain datagrams. A datagram is forwarded to the serial sink only when
    /// its sender holds a slot; with the table full, unknown senders are dropped.
    fn receive_udp(&mut self) {
        let socket = match &self.udp {
            Some(socket) => socket,
            None => return,
        };

        loop {
            let (len, from) = match socket.recv_from(&mut self.buf) {
                Ok(v) => v,
                Err(e) if e.kind() == io::ErrorKind::WouldBlock => break,
                Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
                Err(e) => {
                    log::warn!("UDP receive failed: {}", e);
                    break;
                }
            };

            {
                let mut peers = lock(&self.shared.peers);
                let index = match peers.find_udp(&from) {
                    Some(index) => index,
                    None => match peers.claim(PeerSlot::udp(from)) {
                        Some(index) => {
                            self.shared.stats.record_connect();
                            log::info!("Peer udp://{} connected (slot {})", from, index);
                            index
                        }
                        None => {
                            log::debug!("Peer limit reached, dropping datagram from udp://{}", from);
                            continue;
                        }
                    },
                };
                if let Some(slot) = peers.get_mut(index) {
                    slot.bytes_received += len as u64;
                    slot.last_activity = std::time::Instant::now();
                }
            }

            forward(self.sink.as_ref(), &self.buf[..len]);
            self.shared.stats.add_received(len);
        }
    }

    /// Drain a readable TCP peer into the serial sink. The bytes are
    /// collected under the table lock and written after it is released.
    fn read_peer(&mut self, index: usize) {
        let mut received = Vec::new();
        {
            let mut peers = lock(&self.shared.peers);
            let slot = match peers.get_mut(index) {
                Some(slot) => slot,
                None => return,
            };
            let stream = match &mut slot.link {
                PeerLink::Tcp { stream, .. } => stream,
                PeerLink::Udp => return,
            };

            loop {
                match stream.read(&mut self.buf) {
                    Ok(0) => {
                        slot.closing = true;
                        break;
                    }
                    Ok(n) => {
                        received.extend_from_slice(&self.buf[..n]);
                        slot.bytes_received += n as u64;
                        slot.last_activity = std::time::Instant::now();
                    }
                    Err(e) if e.kind() == io::ErrorKind::WouldBlock => break,
                    Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
                    Err(e) => {
                        log::debug!("Read from tcp://{} failed: {}", slot.addr, e);
                        slot.closing = true;
                        break;
                    }
                }
            }
        }

        if !received.is_empty() {
            forward(self.sink.as_ref(), &received);
            self.shared.stats.add_received(received.len());
        }
    }

    /// Writable TCP peer: push out its backlog
    fn flush_peer(&mut self, index: usize) {
        let mut peers = lock(&self.shared.peers);
        let slot = match peers.get_mut(index) {
            Some(slot) => slot,
            None => return,
        };
        let addr = slot.addr;
        if let PeerLink::Tcp { stream, outbound } = &mut slot.link {
            match outbound.flush(stream) {
                Ok(n) => {
                    slot.bytes_sent += n as u64;
                    self.shared.stats.add_sent(n);
                    if outbound.is_empty() {
                        reregister(self.poll.registry(), stream, index, false);
                    }
                }
                Err(e) => {
                    log::debug!("Write to tcp://{} failed: {}", addr, e);
                    slot.closing = true;
                }
            }
        }
    }

    /// Send one chunk to every peer. A failure only marks that peer.
    fn broadcast(&mut self, chunk: &[u8]) {
        let mut peers = lock(&self.shared.peers);
        let registry = self.poll.registry();

        for (index, slot) in peers.iter_mut() {
            if slot.closing {
                continue;
            }
            let addr = slot.addr;

            let result = match &mut slot.link {
                PeerLink::Tcp { stream, outbound } => {
                    let had_backlog = !outbound.is_empty();
                    let result = outbound.send(stream, chunk);
                    if result.is_ok() && !had_backlog && !outbound.is_empty() {
                        reregister(registry, stream, index, true);
                    }
                    result
                }
                PeerLink::Udp => match &self.udp {
                    Some(socket) => match socket.send_to(chunk, addr) {
                        Err(e) if e.kind() == io::ErrorKind::WouldBlock => Ok(0),
                        other => other,
                    },
                    None => Ok(0),
                },
            };

            match result {
                Ok(n) => {
                    slot.bytes_sent += n as u64;
                    self.shared.stats.add_sent(n);
                }
                Err(e) => {
                    log::warn!("Send to peer {} failed: {}", addr, e);
                    slot.closing = true;
                }
            }
        }
    }

    /// Close and clear every slot marked during this pass
    fn sweep(&mut self) {
        let released = lock(&self.shared.peers).sweep();
        for (index, slot) in released {
            self.close(index, slot);
        }
    }

    fn close_all(&mut self) {
        let released: Vec<(usize, PeerSlot)> = {
            let mut peers = lock(&self.shared.peers);
            let indices: Vec<usize> = peers.iter().map(|(index, _)| index).collect();
            indices
                .into_iter()
                .filter_map(|index| peers.release(index).map(|slot| (index, slot)))
                .collect()
        };
        for (index, slot) in released {
            self.close(index, slot);
        }
    }

    fn close(&self, index: usize, mut slot: PeerSlot) {
        let scheme = match slot.transport() {
            Transport::Tcp => "tcp",
            Transport::Udp => "udp",
        };
        if let PeerLink::Tcp { stream, .. } = &mut slot.link {
            if let Err(e) = self.poll.registry().deregister(stream) {
                log::debug!("Failed to deregister slot {}: {}", index, e);
            }
        }
        self.shared.stats.record_disconnect();
        log::info!("Peer {}://{} disconnected (slot {})", scheme, slot.addr, index);
    }
}

fn peer_token(index: usize) -> Token {
    Token(PEER_TOKEN_BASE + index)
}

/// Switch a TCP peer's interest between read-only and read+write
fn reregister(registry: &Registry, stream: &mut mio::net::TcpStream, index: usize, writable: bool) {
    let interest = if writable {
        Interest::READABLE | Interest::WRITABLE
    } else {
        Interest::READABLE
    };
    if let Err(e) = registry.reregister(stream, peer_token(index), interest) {
        log::debug!("Failed to reregister slot {}: {}", index, e);
    }
}

fn forward(sink: &dyn SerialSink, data: &[u8]) {
    if let Err(e) = sink.write(data) {
        log::warn!("Failed to write peer data to serial: {}", e);
    }
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|e| e.into_inner())
}

// ============================================================================
// Tests
// ============================================================================
