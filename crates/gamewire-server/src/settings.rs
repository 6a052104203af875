//! Conversion from the persisted [`Config`] into runtime network settings.

use std::net::{AddrParseError, IpAddr, SocketAddr};
use std::time::Duration;

use gamewire_config::{Config, ConnectionSettings, ReconnectSettings};
use gamewire_net::{
    AcceptorConfig, CompressionConfig, ConnectionConfig, FrameConfig, ReconnectConfig,
    SocketConfig,
};

/// Listener and per-connection settings of the acceptor.
pub fn acceptor_config(config: &Config) -> Result<AcceptorConfig, AddrParseError> {
    let ip: IpAddr = config.server.bind_address.parse()?;
    Ok(AcceptorConfig {
        bind_addr: SocketAddr::new(ip, config.server.port),
        max_connections: config.server.max_connections,
        socket: SocketConfig::default(),
        frame: frame_config(&config.connection),
        connection: connection_config(&config.connection),
    })
}

pub fn connection_config(settings: &ConnectionSettings) -> ConnectionConfig {
    ConnectionConfig {
        heartbeat_enabled: settings.heartbeat_enabled,
        heartbeat_interval: Duration::from_millis(settings.heartbeat_interval_ms.max(1)),
        heartbeat_gauge_max: settings.heartbeat_gauge_max,
        heartbeat_disconnect: settings.heartbeat_disconnect,
        max_resend_count: settings.max_resend_count,
        use_async_send: settings.async_send,
        use_encryption: settings.encryption,
        use_relay_to_message: settings.relay_to_message,
        header_touchable: false,
    }
}

pub fn frame_config(settings: &ConnectionSettings) -> FrameConfig {
    FrameConfig {
        max_payload_size: settings.max_payload_size,
        compression: CompressionConfig {
            threshold: settings.compression_threshold,
            enabled: true,
        },
    }
}

pub fn reconnect_config(settings: &ReconnectSettings) -> ReconnectConfig {
    ReconnectConfig {
        initial_delay: Duration::from_millis(settings.initial_delay_ms),
        backoff_multiplier: settings.backoff_multiplier,
        max_delay: Duration::from_millis(settings.max_delay_ms),
        max_attempts: settings.max_attempts,
        jitter: settings.jitter.clamp(0.0, 1.0),
    }
}

/// Split `host:port`. The host may be a name, an IPv4 address, or a
/// bracketed IPv6 address.
pub fn parse_upstream(upstream: &str) -> Option<(String, u16)> {
    let (host, port) = upstream.rsplit_once(':')?;
    let host = host.trim_start_matches('[').trim_end_matches(']');
    if host.is_empty() {
        return None;
    }
    Some((host.to_string(), port.parse().ok()?))
}
