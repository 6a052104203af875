//! Command-line argument parsing for the gamewire server.

use std::path::PathBuf;

use clap::Parser;

use crate::Config;

/// gamewire server command-line arguments.
///
/// CLI values override settings loaded from `config.ron`.
#[derive(Parser, Debug, Default)]
#[command(name = "gamewire-server", about = "gamewire game server")]
pub struct CliArgs {
    /// Address to bind the listener to.
    #[arg(long)]
    pub bind: Option<String>,

    /// Listener port.
    #[arg(long)]
    pub port: Option<u16>,

    /// Maximum concurrent connections.
    #[arg(long)]
    pub max_connections: Option<usize>,

    /// Backend server to link to, as `host:port`.
    #[arg(long)]
    pub upstream: Option<String>,

    /// Heartbeat interval in milliseconds.
    #[arg(long)]
    pub heartbeat_ms: Option<u64>,

    /// Log level (error, warn, info, debug, trace).
    #[arg(long)]
    pub log_level: Option<String>,

    /// Path to config directory (overrides default location).
    #[arg(long)]
    pub config: Option<PathBuf>,
}

impl Config {
    /// Apply CLI overrides to a loaded config.
    pub fn apply_cli_overrides(&mut self, args: &CliArgs) {
        if let Some(ref bind) = args.bind {
            self.server.bind_address = bind.clone();
        }
        if let Some(port) = args.port {
            self.server.port = port;
        }
        if let Some(max) = args.max_connections {
            self.server.max_connections = max;
        }
        if let Some(ref upstream) = args.upstream {
            self.server.upstream = Some(upstream.clone());
        }
        if let Some(ms) = args.heartbeat_ms {
            self.connection.heartbeat_interval_ms = ms;
        }
        if let Some(ref level) = args.log_level {
            self.debug.log_level = level.clone();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_cli_override() {
        let mut config = Config::default();
        let args = CliArgs {
            bind: Some("127.0.0.1".to_string()),
            heartbeat_ms: Some(500),
            ..Default::default()
        };
        config.apply_cli_overrides(&args);
        assert_eq!(config.server.bind_address, "127.0.0.1");
        assert_eq!(config.connection.heartbeat_interval_ms, 500);
        // Non-overridden fields retain defaults
        assert_eq!(config.server.port, 7777);
        assert_eq!(config.debug.log_level, "info");
    }

    #[test]
    fn test_cli_no_override() {
        let original = Config::default();
        let mut config = Config::default();
        config.apply_cli_overrides(&CliArgs::default());
        assert_eq!(config, original);
    }

    #[test]
    fn test_cli_parses_flags() {
        let args = CliArgs::parse_from([
            "gamewire-server",
            "--port",
            "9000",
            "--log-level",
            "debug",
            "--config",
            "/tmp/gw",
        ]);
        assert_eq!(args.port, Some(9000));
        assert_eq!(args.log_level.as_deref(), Some("debug"));
        assert_eq!(args.config, Some(PathBuf::from("/tmp/gw")));
        assert_eq!(args.bind, None);
    }
}
