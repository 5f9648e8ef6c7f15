//! Server connection setup
//!
//! Resolves the server, opens the stream socket and applies the options
//! the pipeline relies on: no-delay, a small send buffer so queuing
//! latency stays visible to the send deadline, and a 1 s kernel send
//! timeout underneath the application's own wall-clock deadline.

use std::net::{SocketAddr, TcpStream, ToSocketAddrs};
use std::time::Duration;

use socket2::{Domain, Protocol, Socket, Type};
use tracing::{debug, info};

use crate::config::StreamConfig;
use crate::error::NetworkError;

/// Kernel-level timeout for a single send call.
pub(crate) const SOCKET_SEND_TIMEOUT: Duration = Duration::from_secs(1);

/// Connect is issued non-blocking; this errno means it is underway.
const EINPROGRESS: i32 = 115;

/// Resolve `host:port` to the first usable address.
pub(crate) fn resolve(server: &str) -> Result<SocketAddr, NetworkError> {
    server
        .to_socket_addrs()
        .map_err(|_| NetworkError::ResolveFailed(server.to_string()))?
        .next()
        .ok_or_else(|| NetworkError::ResolveFailed(server.to_string()))
}

/// Open and configure the uplink socket.
pub(crate) fn connect(addr: SocketAddr, config: &StreamConfig) -> Result<TcpStream, NetworkError> {
    let socket = Socket::new(Domain::for_address(addr), Type::STREAM, Some(Protocol::TCP))
        .map_err(NetworkError::SocketConfig)?;
    socket.set_nodelay(true).map_err(NetworkError::SocketConfig)?;
    socket
        .set_send_buffer_size(config.tcp_buffer_size_bytes)
        .map_err(NetworkError::SocketConfig)?;
    socket
        .set_nonblocking(true)
        .map_err(NetworkError::SocketConfig)?;

    debug!(%addr, "connecting");
    match socket.connect(&addr.into()) {
        Ok(()) => {}
        Err(e)
            if e.raw_os_error() == Some(EINPROGRESS)
                || e.kind() == std::io::ErrorKind::WouldBlock => {}
        Err(e) => return Err(NetworkError::ConnectionFailed(e)),
    }

    // Steady state is blocking with kernel timeouts; the monitor's short
    // read timeout is what paces its polling.
    socket
        .set_nonblocking(false)
        .map_err(NetworkError::SocketConfig)?;
    let stream: TcpStream = socket.into();
    stream
        .set_write_timeout(Some(SOCKET_SEND_TIMEOUT))
        .map_err(NetworkError::SocketConfig)?;

    info!(%addr, "uplink socket configured");
    Ok(stream)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn resolve_loopback() {
        let addr = resolve("127.0.0.1:9000").unwrap();
        assert_eq!(addr.port(), 9000);
        assert!(addr.ip().is_loopback());
    }

    #[test]
    fn resolve_failure_names_the_server() {
        match resolve("definitely-not-a-host.invalid:1") {
            Err(NetworkError::ResolveFailed(server)) => {
                assert!(server.contains("definitely-not-a-host"));
            }
            other => panic!("unexpected: {other:?}"),
        }
    }

    #[test]
    fn connect_applies_options() {
        let listener = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
        let addr = listener.local_addr().unwrap();
        let config = StreamConfig::default();

        let stream = connect(addr, &config).unwrap();
        let (_peer, _) = listener.accept().unwrap();

        assert!(stream.nodelay().unwrap());
        assert_eq!(stream.write_timeout().unwrap(), Some(SOCKET_SEND_TIMEOUT));
    }
}
