//! Shared helpers for the integration tests

#![allow(dead_code)]

use std::io::{Read, Write};
use std::net::{Shutdown, TcpListener, TcpStream};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::thread;
use std::time::{Duration, Instant};

use relay_engine::config::MemoryConfigStore;
use relay_engine::services::{AlwaysOnline, MemorySink};
use relay_engine::{Context, RelayConfig};

pub const TIMEOUT: Duration = Duration::from_secs(5);

pub const CASTER_OK: &str = "ICY 200 OK\r\n\r\n";

/// Context over an in-memory store and sink
pub fn context(config: RelayConfig) -> (Context, MemorySink, MemoryConfigStore) {
    let store = MemoryConfigStore::new(config);
    let sink = MemorySink::new();
    let ctx = Context::new(
        Arc::new(store.clone()),
        Arc::new(sink.clone()),
        Arc::new(AlwaysOnline),
    );
    (ctx, sink, store)
}

/// Poll `condition` every 10 ms until it holds or `timeout` passes
pub fn wait_until<F: FnMut() -> bool>(timeout: Duration, mut condition: F) -> bool {
    let deadline = Instant::now() + timeout;
    loop {
        if condition() {
            return true;
        }
        if Instant::now() >= deadline {
            return false;
        }
        thread::sleep(Duration::from_millis(10));
    }
}

/// Accept one connection, giving up after `timeout`
pub fn accept_timeout(listener: &TcpListener, timeout: Duration) -> Option<TcpStream> {
    listener.set_nonblocking(true).unwrap();
    let deadline = Instant::now() + timeout;
    while Instant::now() < deadline {
        match listener.accept() {
            Ok((stream, _)) => {
                stream.set_nonblocking(false).unwrap();
                return Some(stream);
            }
            Err(_) => thread::sleep(Duration::from_millis(10)),
        }
    }
    None
}

// ============================================================================
// Mock caster
// ============================================================================

#[derive(Default)]
struct CasterState {
    connections: AtomicUsize,
    requests: Mutex<Vec<String>>,
    received: Mutex<Vec<u8>>,
    streams: Mutex<Vec<TcpStream>>,
}

/// NTRIP caster on a loopback port answering every SOURCE request with a
/// fixed response
pub struct MockCaster {
    port: u16,
    state: Arc<CasterState>,
}

impl MockCaster {
    pub fn start(response: &'static str) -> Self {
        Self::spawn(response, false)
    }

    /// Caster that hangs up right after sending `response`
    pub fn start_closing(response: &'static str) -> Self {
        Self::spawn(response, true)
    }

    fn spawn(response: &'static str, hang_up: bool) -> Self {
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let port = listener.local_addr().unwrap().port();
        let state = Arc::new(CasterState::default());

        let accept_state = Arc::clone(&state);
        thread::spawn(move || {
            for stream in listener.incoming() {
                let stream = match stream {
                    Ok(stream) => stream,
                    Err(_) => break,
                };
                let state = Arc::clone(&accept_state);
                thread::spawn(move || serve(stream, state, response, hang_up));
            }
        });

        MockCaster { port, state }
    }

    pub fn port(&self) -> u16 {
        self.port
    }

    pub fn connections(&self) -> usize {
        self.state.connections.load(Ordering::SeqCst)
    }

    pub fn requests(&self) -> Vec<String> {
        self.state.requests.lock().unwrap().clone()
    }

    pub fn received(&self) -> Vec<u8> {
        self.state.received.lock().unwrap().clone()
    }

    /// Close every accepted source connection
    pub fn disconnect_all(&self) {
        for stream in self.state.streams.lock().unwrap().drain(..) {
            let _ = stream.shutdown(Shutdown::Both);
        }
    }
}

fn serve(mut stream: TcpStream, state: Arc<CasterState>, response: &'static str, hang_up: bool) {
    state.connections.fetch_add(1, Ordering::SeqCst);

    let mut request = Vec::new();
    let mut buf = [0u8; 1024];
    while !request.windows(4).any(|w| w == b"\r\n\r\n") {
        match stream.read(&mut buf) {
            Ok(0) | Err(_) => return,
            Ok(n) => request.extend_from_slice(&buf[..n]),
        }
    }
    state
        .requests
        .lock()
        .unwrap()
        .push(String::from_utf8_lossy(&request).into_owned());

    if stream.write_all(response.as_bytes()).is_err() || !response.contains(" 200 OK") {
        return;
    }
    if hang_up {
        let _ = stream.shutdown(Shutdown::Both);
        return;
    }
    if let Ok(clone) = stream.try_clone() {
        state.streams.lock().unwrap().push(clone);
    }

    loop {
        match stream.read(&mut buf) {
            Ok(0) | Err(_) => return,
            Ok(n) => state.received.lock().unwrap().extend_from_slice(&buf[..n]),
        }
    }
}
