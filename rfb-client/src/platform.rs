//! Platform-specific collaborators the driver leans on: a reachability probe used to
//! classify connection failures, and TCP keepalive tuning applied once a session is
//! established. Both are thin wrappers over `tokio`/`socket2`; neither touches
//! protocol bytes.

use std::time::Duration;
use tokio::net::TcpStream;
use tokio::time::timeout;

/// Probes whether `host:port` accepts a TCP connection within `timeout_duration`.
///
/// Used by the connection driver's establish phase to distinguish "host is
/// unreachable" from "host is up but the RFB server on it is not" when
/// classifying a failed connection attempt. Does not attempt any RFB
/// handshake; the probe connection is dropped immediately on success.
pub async fn ping(host: &str, port: u16, timeout_duration: Duration) -> bool {
    let addr = format!("{host}:{port}");
    matches!(timeout(timeout_duration, TcpStream::connect(addr)).await, Ok(Ok(_)))
}

/// Applies TCP keepalive tuning to an already-connected stream.
///
/// Must be called before the stream is split into read/write halves, since
/// `socket2::SockRef` borrows the stream rather than owning a separate handle.
pub fn configure_socket_keepalive(
    stream: &TcpStream,
    idle: Duration,
    interval: Duration,
    retries: u32,
) -> std::io::Result<()> {
    let keepalive = socket2::TcpKeepalive::new()
        .with_time(idle)
        .with_interval(interval)
        .with_retries(retries);
    socket2::SockRef::from(stream).set_tcp_keepalive(&keepalive)
}
