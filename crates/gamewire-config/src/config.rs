//! Configuration structs with sensible defaults and RON persistence.

use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

use crate::error::ConfigError;

const APP_NAME: &str = "gamewire";

/// Top-level server configuration.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct Config {
    /// Listener settings.
    pub server: ServerSettings,
    /// Per-connection behavior.
    pub connection: ConnectionSettings,
    /// Outbound reconnection backoff.
    pub reconnect: ReconnectSettings,
    /// Suspended-handler bookkeeping.
    pub registry: RegistrySettings,
    /// Debug/development settings.
    pub debug: DebugConfig,
}

/// Listener configuration.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct ServerSettings {
    /// Address to bind the listener to.
    pub bind_address: String,
    /// Listener port.
    pub port: u16,
    /// Maximum concurrent connections.
    pub max_connections: usize,
    /// Backend server to keep an outbound link to, as `host:port`.
    pub upstream: Option<String>,
}

/// Connection configuration.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct ConnectionSettings {
    /// Run heartbeat supervision.
    pub heartbeat_enabled: bool,
    /// Heartbeat interval in milliseconds.
    pub heartbeat_interval_ms: u64,
    /// Intervals without a heartbeat before the connection times out.
    pub heartbeat_gauge_max: i32,
    /// Disconnect on heartbeat timeout instead of only logging it.
    pub heartbeat_disconnect: bool,
    /// Offline-send attempts before a packet is dropped.
    pub max_resend_count: u16,
    /// One spawned write per packet instead of a draining writer task.
    pub async_send: bool,
    /// Run outbound packets through the packet codec.
    pub encryption: bool,
    /// Unwrap relay packets before dispatch.
    pub relay_to_message: bool,
    /// Minimum frame body size in bytes before LZ4 compression applies.
    pub compression_threshold: usize,
    /// Maximum frame length in bytes.
    pub max_payload_size: u32,
}

/// Reconnection configuration.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct ReconnectSettings {
    /// Delay before the first attempt in milliseconds.
    pub initial_delay_ms: u64,
    /// Multiplier applied after each failed attempt.
    pub backoff_multiplier: f64,
    /// Upper bound of the delay in milliseconds.
    pub max_delay_ms: u64,
    /// Attempts before giving up.
    pub max_attempts: u32,
    /// Jitter factor (0.0 - 1.0).
    pub jitter: f64,
}

/// Correlation registry configuration.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct RegistrySettings {
    /// Clean up handlers suspended longer than this. `None` keeps them until
    /// a follow-up arrives.
    pub suspended_ttl_secs: Option<u64>,
    /// How often the expiry sweep runs, in seconds.
    pub sweep_interval_secs: u64,
}

/// Debug/development configuration.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct DebugConfig {
    /// Log level override (e.g., "debug", "info", "warn").
    pub log_level: String,
    /// Also write JSON logs to the log directory.
    pub file_logging: bool,
}

// --- Default implementations ---

impl Default for ServerSettings {
    fn default() -> Self {
        Self {
            bind_address: "0.0.0.0".to_string(),
            port: 7777,
            max_connections: 256,
            upstream: None,
        }
    }
}

impl Default for ConnectionSettings {
    fn default() -> Self {
        Self {
            heartbeat_enabled: true,
            heartbeat_interval_ms: 10_000,
            heartbeat_gauge_max: 3,
            heartbeat_disconnect: true,
            max_resend_count: 5,
            async_send: true,
            encryption: true,
            relay_to_message: true,
            compression_threshold: 512,
            max_payload_size: 1_048_576,
        }
    }
}

impl Default for ReconnectSettings {
    fn default() -> Self {
        Self {
            initial_delay_ms: 1_000,
            backoff_multiplier: 2.0,
            max_delay_ms: 30_000,
            max_attempts: 20,
            jitter: 0.25,
        }
    }
}

impl Default for RegistrySettings {
    fn default() -> Self {
        Self {
            suspended_ttl_secs: None,
            sweep_interval_secs: 30,
        }
    }
}

impl Default for DebugConfig {
    fn default() -> Self {
        Self {
            log_level: "info".to_string(),
            file_logging: false,
        }
    }
}

/// Platform config directory for gamewire, e.g. `~/.config/gamewire` on Linux.
pub fn default_config_dir() -> Option<PathBuf> {
    dirs::config_dir().map(|d| d.join(APP_NAME))
}

// --- Load / Save / Reload ---

impl Config {
    /// Load config from the given directory, or create a default config file.
    pub fn load_or_create(config_dir: &Path) -> Result<Self, ConfigError> {
        let config_path = config_dir.join("config.ron");

        if config_path.exists() {
            let contents = std::fs::read_to_string(&config_path).map_err(ConfigError::ReadError)?;
            let config: Config = ron::from_str(&contents).map_err(ConfigError::ParseError)?;
            log::info!("Loaded config from {}", config_path.display());
            Ok(config)
        } else {
            let config = Config::default();
            config.save(config_dir)?;
            log::info!("Created default config at {}", config_path.display());
            Ok(config)
        }
    }

    /// Save config to the given directory as `config.ron`.
    pub fn save(&self, config_dir: &Path) -> Result<(), ConfigError> {
        std::fs::create_dir_all(config_dir).map_err(ConfigError::WriteError)?;

        let config_path = config_dir.join("config.ron");
        let pretty = ron::ser::PrettyConfig::new()
            .depth_limit(3)
            .separate_tuple_members(true)
            .enumerate_arrays(false);

        let serialized =
            ron::ser::to_string_pretty(self, pretty).map_err(ConfigError::SerializeError)?;

        std::fs::write(&config_path, serialized).map_err(ConfigError::WriteError)?;
        Ok(())
    }

    /// Hot-reload: returns `Some(new_config)` if the file changed, `None` otherwise.
    pub fn reload(&self, config_dir: &Path) -> Result<Option<Self>, ConfigError> {
        let config_path = config_dir.join("config.ron");
        let contents = std::fs::read_to_string(&config_path).map_err(ConfigError::ReadError)?;
        let new_config: Config = ron::from_str(&contents).map_err(ConfigError::ParseError)?;

        if &new_config != self {
            log::info!("Config reloaded with changes");
            Ok(Some(new_config))
        } else {
            Ok(None)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config_serializes() {
        let config = Config::default();
        let ron_str =
            ron::ser::to_string_pretty(&config, ron::ser::PrettyConfig::new().depth_limit(3))
                .unwrap();
        assert!(ron_str.contains("port: 7777"));
        assert!(ron_str.contains("heartbeat_gauge_max: 3"));
        assert!(ron_str.contains("max_resend_count: 5"));
    }

    #[test]
    fn test_missing_section_uses_default() {
        let ron_str = "(server: (port: 9000))";
        let config: Config = ron::from_str(ron_str).unwrap();
        assert_eq!(config.server.port, 9000);
        assert_eq!(config.server.max_connections, 256);
        assert_eq!(config.connection, ConnectionSettings::default());
    }

    #[test]
    fn test_extra_field_ignored() {
        let ron_str = "(future_setting: true)";
        let result: Result<Config, _> = ron::from_str(ron_str);
        assert!(result.is_ok());
    }

    #[test]
    fn test_registry_ttl_is_off_by_default() {
        let config = Config::default();
        assert_eq!(config.registry.suspended_ttl_secs, None);

        let config: Config = ron::from_str("(registry: (suspended_ttl_secs: Some(120)))").unwrap();
        assert_eq!(config.registry.suspended_ttl_secs, Some(120));
    }

    #[test]
    fn test_save_and_load() {
        let dir = tempfile::tempdir().unwrap();
        let mut config = Config::default();
        config.server.port = 9100;
        config.connection.heartbeat_interval_ms = 2_500;
        config.reconnect.max_attempts = 3;

        config.save(dir.path()).unwrap();
        let loaded = Config::load_or_create(dir.path()).unwrap();
        assert_eq!(config, loaded);
    }

    #[test]
    fn test_load_or_create_writes_default_file() {
        let dir = tempfile::tempdir().unwrap();
        let config_dir = dir.path().join("nested");

        let config = Config::load_or_create(&config_dir).unwrap();
        assert_eq!(config, Config::default());
        assert!(config_dir.join("config.ron").exists());
    }

    #[test]
    fn test_reload_detects_changes() {
        let dir = tempfile::tempdir().unwrap();
        let config = Config::default();
        config.save(dir.path()).unwrap();

        let mut modified = config.clone();
        modified.connection.max_resend_count = 9;
        modified.save(dir.path()).unwrap();

        let result = config.reload(dir.path()).unwrap();
        assert_eq!(result.unwrap().connection.max_resend_count, 9);
    }

    #[test]
    fn test_reload_no_changes() {
        let dir = tempfile::tempdir().unwrap();
        let config = Config::default();
        config.save(dir.path()).unwrap();

        let result = config.reload(dir.path()).unwrap();
        assert!(result.is_none());
    }

    #[test]
    fn test_invalid_ron_produces_error() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("config.ron"), "{{not valid}}").unwrap();
        let result = Config::load_or_create(dir.path());
        assert!(matches!(result, Err(ConfigError::ParseError(_))));
    }

    #[test]
    fn test_default_config_dir_ends_with_app_name() {
        if let Some(dir) = default_config_dir() {
            assert!(dir.ends_with(APP_NAME));
        }
    }
}
