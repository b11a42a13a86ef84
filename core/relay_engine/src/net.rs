//! Name resolution and outbound connects shared by uplinks and the socket client

use std::io;
use std::net::{SocketAddr, TcpStream, ToSocketAddrs, UdpSocket};
use std::time::Duration;

use crate::error::LinkError;

/// Resolve `host:port`. An empty result is a resolve failure.
pub fn resolve(host: &str, port: u16) -> Result<Vec<SocketAddr>, LinkError> {
    let addrs: Vec<SocketAddr> = (host, port)
        .to_socket_addrs()
        .map_err(|e| LinkError::Resolve {
            host: host.to_string(),
            source: Some(e),
        })?
        .collect();

    if addrs.is_empty() {
        return Err(LinkError::Resolve {
            host: host.to_string(),
            source: None,
        });
    }
    Ok(addrs)
}

/// Open a TCP connection, trying every resolved address in turn
pub fn connect_tcp(host: &str, port: u16, timeout: Duration) -> Result<TcpStream, LinkError> {
    let addrs = resolve(host, port)?;
    let mut last_err = io::Error::new(io::ErrorKind::AddrNotAvailable, "no address tried");

    for addr in addrs {
        match TcpStream::connect_timeout(&addr, timeout) {
            Ok(stream) => {
                let _ = stream.set_nodelay(true);
                return Ok(stream);
            }
            Err(e) => {
                log::debug!("Connect to {} failed: {}", addr, e);
                last_err = e;
            }
        }
    }

    Err(LinkError::Connect {
        target: format!("{}:{}", host, port),
        source: last_err,
    })
}

/// Bind an ephemeral UDP socket of the right family and connect it to the
/// first resolved address
pub fn connect_udp(host: &str, port: u16) -> Result<UdpSocket, LinkError> {
    let addrs = resolve(host, port)?;
    let target = format!("{}:{}", host, port);
    let addr = addrs[0];

    let local: SocketAddr = if addr.is_ipv4() {
        SocketAddr::from(([0, 0, 0, 0], 0))
    } else {
        SocketAddr::from(([0u16; 8], 0))
    };

    let socket = UdpSocket::bind(local).map_err(|source| LinkError::Connect {
        target: target.clone(),
        source,
    })?;
    socket
        .connect(addr)
        .map_err(|source| LinkError::Connect { target, source })?;
    Ok(socket)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::net::TcpListener;

    #[test]
    fn test_resolve_literal_address() {
        let addrs = resolve("127.0.0.1", 2101).unwrap();
        assert_eq!(addrs, vec!["127.0.0.1:2101".parse::<SocketAddr>().unwrap()]);
    }

    #[test]
    fn test_resolve_failure() {
        let err = resolve("host.invalid.", 2101).unwrap_err();
        assert!(matches!(err, LinkError::Resolve { .. }));
    }

    #[test]
    fn test_connect_refused() {
        // Bind then drop to obtain a port nobody listens on
        let port = TcpListener::bind("127.0.0.1:0").unwrap().local_addr().unwrap().port();
        let err = connect_tcp("127.0.0.1", port, Duration::from_secs(1)).unwrap_err();
        assert!(matches!(err, LinkError::Connect { .. }));
    }

    #[test]
    fn test_connect_tcp_success() {
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let port = listener.local_addr().unwrap().port();
        let stream = connect_tcp("127.0.0.1", port, Duration::from_secs(1)).unwrap();
        assert_eq!(stream.peer_addr().unwrap().port(), port);
    }

    #[test]
    fn test_connect_udp() {
        let server = UdpSocket::bind("127.0.0.1:0").unwrap();
        let port = server.local_addr().unwrap().port();
        let socket = connect_udp("127.0.0.1", port).unwrap();
        assert_eq!(socket.peer_addr().unwrap().port(), port);
    }
}
