//! Integration tests for the socket server
//!
//! Peers are plain std sockets on loopback; the server binds port 0.

mod support;

use std::io::{ErrorKind, Read, Write};
use std::net::{SocketAddr, TcpStream, UdpSocket};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{mpsc, Arc};
use std::thread;
use std::time::Duration;

use relay_engine::config::MemoryConfigStore;
use relay_engine::services::AlwaysOnline;
use relay_engine::socket_server::{SocketServer, SocketServerOptions};
use relay_engine::{Context, RelayConfig, SerialSink, Subscriber, Transport};

use support::{context, wait_until, TIMEOUT};

fn options(tcp: bool, udp: bool, max_clients: usize) -> SocketServerOptions {
    let loopback: SocketAddr = "127.0.0.1:0".parse().unwrap();
    SocketServerOptions {
        tcp_addr: if tcp { Some(loopback) } else { None },
        udp_addr: if udp { Some(loopback) } else { None },
        max_clients,
        udp_peer_ttl: None,
        outbound_limit: 64 * 1024,
        queue_depth: 64,
    }
}

fn udp_peer() -> UdpSocket {
    let socket = UdpSocket::bind("127.0.0.1:0").unwrap();
    socket.set_read_timeout(Some(Duration::from_millis(500))).unwrap();
    socket
}

fn stop(server: &Arc<SocketServer>) {
    server.stop();
    server.join();
}

#[test]
fn test_tcp_peer_cap_and_broadcast() {
    let (ctx, _, _) = context(RelayConfig::default());
    let server = SocketServer::start(&ctx, options(true, false, 10)).unwrap();
    let addr = server.tcp_addr().unwrap();

    let mut peers: Vec<TcpStream> = (0..10).map(|_| TcpStream::connect(addr).unwrap()).collect();
    assert!(wait_until(TIMEOUT, || server.peer_count() == 10));

    // The 11th is accepted by the kernel and then closed
    let mut extra = TcpStream::connect(addr).unwrap();
    extra.set_read_timeout(Some(Duration::from_secs(2))).unwrap();
    let mut buf = [0u8; 8];
    match extra.read(&mut buf) {
        Ok(0) => {}
        Ok(n) => panic!("rejected peer received {} bytes", n),
        Err(e) => assert_eq!(e.kind(), ErrorKind::ConnectionReset),
    }
    assert_eq!(server.peer_count(), 10);

    let chunk = [0xD3u8; 64];
    server.on_data(&chunk);

    for peer in peers.iter_mut() {
        peer.set_read_timeout(Some(TIMEOUT)).unwrap();
        let mut got = [0u8; 64];
        peer.read_exact(&mut got).unwrap();
        assert_eq!(got, chunk);
    }
    assert!(wait_until(TIMEOUT, || server.peers().iter().all(|p| p.bytes_sent == 64)));
    assert_eq!(server.stats().snapshot().bytes_sent, 640);
    assert!(server.peers().iter().all(|p| p.transport == Transport::Tcp));

    stop(&server);
}

#[test]
fn test_udp_cap_and_address_attribution() {
    let (ctx, sink, _) = context(RelayConfig::default());
    let server = SocketServer::start(&ctx, options(false, true, 2)).unwrap();
    let addr = server.udp_addr().unwrap();

    let a = udp_peer();
    let b = udp_peer();
    let c = udp_peer();

    a.send_to(b"aa", addr).unwrap();
    a.send_to(b"aa", addr).unwrap();
    assert!(wait_until(TIMEOUT, || {
        let peers = server.peers();
        peers.len() == 1 && peers[0].bytes_received == 4
    }));
    assert_eq!(server.peers()[0].addr, a.local_addr().unwrap());

    b.send_to(b"bb", addr).unwrap();
    assert!(wait_until(TIMEOUT, || server.peer_count() == 2));

    // Table full: the third address gets no slot and its datagram is dropped
    c.send_to(b"cc", addr).unwrap();
    b.send_to(b"b2", addr).unwrap();
    assert!(wait_until(TIMEOUT, || sink.text().contains("b2")));
    assert!(!sink.text().contains("cc"));
    assert_eq!(server.peer_count(), 2);
    assert_eq!(server.stats().snapshot().bytes_received, 8);

    server.on_data(b"corr");
    let mut buf = [0u8; 16];
    for peer in [&a, &b] {
        let (n, from) = peer.recv_from(&mut buf).unwrap();
        assert_eq!(&buf[..n], b"corr");
        assert_eq!(from, addr);
    }
    assert!(c.recv_from(&mut buf).is_err());

    stop(&server);
}

#[test]
fn test_tcp_peer_data_reaches_serial() {
    let (ctx, sink, _) = context(RelayConfig::default());
    let server = SocketServer::start(&ctx, options(true, false, 10)).unwrap();

    let mut peer = TcpStream::connect(server.tcp_addr().unwrap()).unwrap();
    peer.write_all(b"$GPGGA,123519,4807.038,N\r\n").unwrap();

    assert!(wait_until(TIMEOUT, || sink.text() == "$GPGGA,123519,4807.038,N\r\n"));
    assert!(wait_until(TIMEOUT, || server
        .peers()
        .first()
        .map_or(false, |p| p.bytes_received == 26)));

    stop(&server);
}

/// Serial sink whose writes block until released
#[derive(Default)]
struct StalledSink {
    entered: AtomicBool,
    released: AtomicBool,
}

impl SerialSink for StalledSink {
    fn write(&self, _data: &[u8]) -> std::io::Result<()> {
        self.entered.store(true, Ordering::SeqCst);
        while !self.released.load(Ordering::SeqCst) {
            thread::sleep(Duration::from_millis(5));
        }
        Ok(())
    }
}

#[test]
fn test_slow_serial_write_does_not_block_peer_queries() {
    let sink = Arc::new(StalledSink::default());
    let ctx = Context::new(
        Arc::new(MemoryConfigStore::new(RelayConfig::default())),
        sink.clone(),
        Arc::new(AlwaysOnline),
    );
    let server = SocketServer::start(&ctx, options(true, false, 10)).unwrap();

    let mut peer = TcpStream::connect(server.tcp_addr().unwrap()).unwrap();
    peer.write_all(b"$GPGGA\r\n").unwrap();
    assert!(wait_until(TIMEOUT, || sink.entered.load(Ordering::SeqCst)));

    // The loop thread is inside the sink write; the table must stay readable
    let (tx, rx) = mpsc::channel();
    let query = Arc::clone(&server);
    thread::spawn(move || {
        let _ = tx.send((query.peer_count(), query.peers().len()));
    });
    let answered = rx.recv_timeout(Duration::from_secs(1));
    sink.released.store(true, Ordering::SeqCst);
    assert_eq!(answered.ok(), Some((1, 1)));

    stop(&server);
}

#[test]
fn test_closed_peer_frees_its_slot() {
    let (ctx, _, _) = context(RelayConfig::default());
    let server = SocketServer::start(&ctx, options(true, false, 1)).unwrap();
    let addr = server.tcp_addr().unwrap();

    let first = TcpStream::connect(addr).unwrap();
    assert!(wait_until(TIMEOUT, || server.peer_count() == 1));
    drop(first);
    assert!(wait_until(TIMEOUT, || server.peer_count() == 0));

    let _second = TcpStream::connect(addr).unwrap();
    assert!(wait_until(TIMEOUT, || server.peer_count() == 1));
    assert_eq!(server.stats().snapshot().connections_total, 2);

    stop(&server);
}

#[test]
fn test_idle_udp_peer_expires() {
    let (ctx, _, _) = context(RelayConfig::default());
    let mut opts = options(false, true, 2);
    opts.udp_peer_ttl = Some(Duration::from_millis(200));
    let server = SocketServer::start(&ctx, opts).unwrap();

    let peer = udp_peer();
    peer.send_to(b"x", server.udp_addr().unwrap()).unwrap();
    assert!(wait_until(TIMEOUT, || server.peer_count() == 1));

    // The loop wakes at least once a second, so expiry happens without traffic
    assert!(wait_until(TIMEOUT, || server.peer_count() == 0));

    stop(&server);
}

#[test]
fn test_failed_peer_does_not_affect_others() {
    let (ctx, _, _) = context(RelayConfig::default());
    let server = SocketServer::start(&ctx, options(true, false, 10)).unwrap();
    let addr = server.tcp_addr().unwrap();

    let mut healthy = TcpStream::connect(addr).unwrap();
    let broken = TcpStream::connect(addr).unwrap();
    assert!(wait_until(TIMEOUT, || server.peer_count() == 2));

    drop(broken);
    healthy.set_read_timeout(Some(TIMEOUT)).unwrap();
    for i in 0..20u8 {
        server.on_data(&[i; 32]);
        let mut got = [0u8; 32];
        healthy.read_exact(&mut got).unwrap();
        assert_eq!(got, [i; 32]);
    }
    assert!(wait_until(TIMEOUT, || server.peer_count() == 1));

    stop(&server);
}
