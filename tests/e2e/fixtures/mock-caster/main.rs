//! Minimal NTRIP caster for E2E testing
//!
//! Accepts SOURCE connections, answers `ICY 200 OK` when the password
//! matches (`--password`, default `secret`) and reports how many correction
//! bytes each source uploads. Used to exercise the relay's uplinks by hand.

use std::env;
use std::io::{Read, Write};
use std::net::{TcpListener, TcpStream};
use std::thread;

fn main() {
    let args: Vec<String> = env::args().collect();

    let port: u16 = arg(&args, "--port")
        .map(|p| p.parse().expect("Invalid port number"))
        .unwrap_or(2101);
    let password = arg(&args, "--password").unwrap_or_else(|| "secret".to_string());

    let addr = format!("0.0.0.0:{}", port);
    let listener = TcpListener::bind(&addr).expect("Failed to bind listener");

    println!("Mock caster listening on {}", addr);

    for stream in listener.incoming() {
        match stream {
            Ok(stream) => {
                let password = password.clone();
                thread::spawn(move || handle(stream, &password));
            }
            Err(e) => eprintln!("Accept error: {}", e),
        }
    }
}

fn handle(mut stream: TcpStream, password: &str) {
    let peer = stream
        .peer_addr()
        .map(|a| a.to_string())
        .unwrap_or_else(|_| "?".to_string());

    let mut request = Vec::new();
    let mut buf = [0u8; 4096];
    while !request.windows(4).any(|w| w == b"\r\n\r\n") {
        match stream.read(&mut buf) {
            Ok(0) | Err(_) => return,
            Ok(n) => request.extend_from_slice(&buf[..n]),
        }
    }

    let request = String::from_utf8_lossy(&request);
    let first = request.lines().next().unwrap_or("");
    let mut parts = first.split_whitespace();
    let accepted = parts.next() == Some("SOURCE") && parts.next() == Some(password);
    let mountpoint = parts.next().unwrap_or("/").to_string();

    if !accepted {
        println!("{} rejected: {}", peer, first);
        let _ = stream.write_all(b"ERROR - Bad Password\r\n");
        return;
    }
    if stream.write_all(b"ICY 200 OK\r\n\r\n").is_err() {
        return;
    }
    println!("{} streaming to {}", peer, mountpoint);

    let mut total = 0usize;
    loop {
        match stream.read(&mut buf) {
            Ok(0) | Err(_) => break,
            Ok(n) => {
                total += n;
                println!("{} {} bytes (total {})", mountpoint, n, total);
            }
        }
    }
    println!("{} disconnected after {} bytes", peer, total);
}

fn arg(args: &[String], flag: &str) -> Option<String> {
    args.iter()
        .position(|a| a == flag)
        .and_then(|i| args.get(i + 1))
        .cloned()
}
