//! TCP socket tuning shared by accepted and dialed connections.
//!
//! Session liveness is owned by the heartbeat handler; the OS keepalive set up
//! here only reaps sockets whose peer vanished without a FIN.

use std::net::SocketAddr;
use std::time::Duration;

use socket2::{Domain, Protocol, SockRef, Socket, TcpKeepalive, Type};
use tokio::net::{TcpListener, TcpStream};

/// Socket options applied to every session transport.
#[derive(Debug, Clone)]
pub struct SocketConfig {
    /// Disable Nagle's algorithm. Default: true.
    pub tcp_nodelay: bool,
    /// Enable TCP keepalive. Default: true.
    pub keepalive_enabled: bool,
    /// Idle time before the first keepalive probe. Default: 60s.
    pub keepalive_idle: Duration,
    /// Interval between keepalive probes. Default: 10s.
    pub keepalive_interval: Duration,
    /// Probes before the OS declares the connection dead. Default: 3.
    pub keepalive_retries: u32,
    /// Enable `SO_REUSEADDR` on listeners. Default: true except on Windows.
    pub reuse_addr: bool,
    /// Listen backlog. Default: 128.
    pub backlog: i32,
}

impl Default for SocketConfig {
    fn default() -> Self {
        Self {
            tcp_nodelay: true,
            keepalive_enabled: true,
            keepalive_idle: Duration::from_secs(60),
            keepalive_interval: Duration::from_secs(10),
            keepalive_retries: 3,
            reuse_addr: !cfg!(target_os = "windows"),
            backlog: 128,
        }
    }
}

/// Apply `config` to a connected stream.
pub fn tune_stream(stream: &TcpStream, config: &SocketConfig) -> std::io::Result<()> {
    stream.set_nodelay(config.tcp_nodelay)?;
    if !config.keepalive_enabled {
        return Ok(());
    }

    let keepalive = TcpKeepalive::new()
        .with_time(config.keepalive_idle)
        .with_interval(config.keepalive_interval);
    // macOS has no per-socket retry count.
    #[cfg(any(target_os = "linux", target_os = "windows"))]
    let keepalive = keepalive.with_retries(config.keepalive_retries);

    SockRef::from(stream).set_tcp_keepalive(&keepalive)
}

/// Bind a listener on `addr`.
///
/// IPv6 addresses are bound dual-stack. Must be called from within a tokio
/// runtime.
pub fn bind_listener(addr: SocketAddr, config: &SocketConfig) -> std::io::Result<TcpListener> {
    let domain = if addr.is_ipv6() { Domain::IPV6 } else { Domain::IPV4 };
    let socket = Socket::new(domain, Type::STREAM, Some(Protocol::TCP))?;

    socket.set_reuse_address(config.reuse_addr)?;
    if addr.is_ipv6() {
        socket.set_only_v6(false)?;
    }
    socket.set_nonblocking(true)?;
    socket.bind(&addr.into())?;
    socket.listen(config.backlog)?;

    TcpListener::from_std(socket.into())
}
