//! Socket options for accepted and outbound TCP streams.

use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::time::Duration;

use socket2::{Domain, Protocol, SockRef, Socket, TcpKeepalive, Type};
use tokio::net::{TcpListener, TcpStream};

/// TCP options applied to every game connection.
#[derive(Debug, Clone)]
pub struct SocketConfig {
    /// Disable Nagle's algorithm. Default: true.
    pub tcp_nodelay: bool,
    /// Enable TCP keepalive probes. Default: true.
    pub keepalive_enabled: bool,
    /// Idle time before the first keepalive probe. Default: 60 s.
    pub keepalive_idle: Duration,
    /// Interval between keepalive probes. Default: 10 s.
    pub keepalive_interval: Duration,
    /// Probes before the stream is declared dead (Linux and Windows only).
    /// Default: 3.
    pub keepalive_retries: u32,
    /// `SO_REUSEADDR` on listeners. Default: true except on Windows.
    pub reuse_addr: bool,
    /// Pending-accept backlog of listeners. Default: 128.
    pub listen_backlog: i32,
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
            listen_backlog: 128,
        }
    }
}

/// Apply `config` to a connected stream.
pub fn configure_stream(stream: &TcpStream, config: &SocketConfig) -> std::io::Result<()> {
    stream.set_nodelay(config.tcp_nodelay)?;
    if !config.keepalive_enabled {
        return Ok(());
    }

    let keepalive = TcpKeepalive::new()
        .with_time(config.keepalive_idle)
        .with_interval(config.keepalive_interval);
    #[cfg(any(target_os = "linux", target_os = "windows"))]
    let keepalive = keepalive.with_retries(config.keepalive_retries);

    SockRef::from(stream).set_tcp_keepalive(&keepalive)
}

/// Bind a listener on `addr`. IPv6 listeners accept IPv4 clients too.
///
/// Must be called from inside a tokio runtime.
pub fn bind_listener(addr: SocketAddr, config: &SocketConfig) -> std::io::Result<TcpListener> {
    let domain = if addr.is_ipv6() {
        Domain::IPV6
    } else {
        Domain::IPV4
    };
    let socket = Socket::new(domain, Type::STREAM, Some(Protocol::TCP))?;
    if config.reuse_addr {
        socket.set_reuse_address(true)?;
    }
    if addr.is_ipv6() {
        socket.set_only_v6(false)?;
    }
    socket.set_nonblocking(true)?;
    socket.bind(&addr.into())?;
    socket.listen(config.listen_backlog)?;

    TcpListener::from_std(socket.into())
}

/// `0.0.0.0:port`.
pub fn ipv4_bind_address(port: u16) -> SocketAddr {
    SocketAddr::new(IpAddr::V4(Ipv4Addr::UNSPECIFIED), port)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn loopback() -> SocketAddr {
        SocketAddr::from(([127, 0, 0, 1], 0))
    }

    #[tokio::test]
    async fn test_configured_stream_has_nodelay_and_keepalive() {
        let config = SocketConfig::default();
        let listener = bind_listener(loopback(), &config).unwrap();
        let client = TcpStream::connect(listener.local_addr().unwrap())
            .await
            .unwrap();

        configure_stream(&client, &config).unwrap();
        assert!(client.nodelay().unwrap());
        assert!(SockRef::from(&client).keepalive().unwrap());
    }

    #[tokio::test]
    async fn test_nodelay_can_be_disabled() {
        let listener = bind_listener(loopback(), &SocketConfig::default()).unwrap();
        let client = TcpStream::connect(listener.local_addr().unwrap())
            .await
            .unwrap();

        let config = SocketConfig {
            tcp_nodelay: false,
            keepalive_enabled: false,
            ..Default::default()
        };
        configure_stream(&client, &config).unwrap();
        assert!(!client.nodelay().unwrap());
    }

    #[tokio::test]
    async fn test_listener_accepts_several_clients() {
        let listener = bind_listener(loopback(), &SocketConfig::default()).unwrap();
        let addr = listener.local_addr().unwrap();

        let _a = TcpStream::connect(addr).await.unwrap();
        let _b = TcpStream::connect(addr).await.unwrap();
        assert!(listener.accept().await.is_ok());
        assert!(listener.accept().await.is_ok());
    }

    #[test]
    fn test_ipv4_bind_address() {
        let addr = ipv4_bind_address(7777);
        assert!(addr.is_ipv4());
        assert!(addr.ip().is_unspecified());
        assert_eq!(addr.port(), 7777);
    }
}
