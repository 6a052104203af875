//! Configuration for the gamewire server.
//!
//! Runtime settings persist to disk as RON files. Supports CLI overrides via
//! clap, hot-reload detection, and forward/backward compatible serialization.

mod cli;
mod config;
mod error;

pub use cli::CliArgs;
pub use config::{
    Config, ConnectionSettings, DebugConfig, ReconnectSettings, RegistrySettings, ServerSettings,
    default_config_dir,
};
pub use error::ConfigError;
