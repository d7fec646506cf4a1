//! Configuration module for the pizza-reactor server.
//!
//! Supports both command-line arguments and TOML configuration file.
//! CLI arguments take precedence over config file values.

use clap::Parser;
use serde::Deserialize;
use std::path::PathBuf;
use std::time::Duration;
use thiserror::Error;

/// Command-line arguments for the server
#[derive(Parser, Debug, Default)]
#[command(name = "pizza-reactor")]
#[command(author = "pizza-reactor authors")]
#[command(version = "0.1.0")]
#[command(about = "A single-threaded reactor server for pizza orders", long_about = None)]
pub struct CliArgs {
    /// Path to TOML configuration file
    #[arg(short, long)]
    pub config: Option<PathBuf>,

    /// Address to bind to (e.g., 127.0.0.1:12345)
    #[arg(short = 'l', long)]
    pub listen: Option<String>,

    /// Maximum number of open connections
    #[arg(long)]
    pub max_connections: Option<usize>,

    /// Bytes moved per read or write call
    #[arg(long)]
    pub buffer_size: Option<usize>,

    /// Maximum bytes buffered for an unterminated request
    #[arg(long)]
    pub max_request_len: Option<usize>,

    /// Upper bound on a single readiness wait, in milliseconds
    #[arg(long)]
    pub poll_timeout_ms: Option<u64>,

    /// Log level (trace, debug, info, warn, error)
    #[arg(long)]
    pub log_level: Option<String>,
}

/// TOML configuration file structure
#[derive(Debug, Deserialize, Default)]
pub struct TomlConfig {
    #[serde(default)]
    pub server: ServerConfig,
    #[serde(default)]
    pub connection: ConnectionConfig,
    #[serde(default)]
    pub logging: LoggingConfig,
}

/// Server-related configuration
#[derive(Debug, Deserialize)]
pub struct ServerConfig {
    /// Address to bind to
    #[serde(default = "default_listen")]
    pub listen: String,
    /// Maximum number of open connections
    #[serde(default = "default_max_connections")]
    pub max_connections: usize,
    /// Ready descriptors reported per wait
    #[serde(default = "default_event_capacity")]
    pub event_capacity: usize,
    /// Upper bound on a single readiness wait
    #[serde(default = "default_poll_timeout_ms")]
    pub poll_timeout_ms: u64,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            listen: default_listen(),
            max_connections: default_max_connections(),
            event_capacity: default_event_capacity(),
            poll_timeout_ms: default_poll_timeout_ms(),
        }
    }
}

/// Per-connection configuration
#[derive(Debug, Deserialize)]
pub struct ConnectionConfig {
    /// Bytes moved per read or write call
    #[serde(default = "default_buffer_size")]
    pub buffer_size: usize,
    /// Maximum bytes buffered for an unterminated request
    #[serde(default = "default_max_request_len")]
    pub max_request_len: usize,
}

impl Default for ConnectionConfig {
    fn default() -> Self {
        Self {
            buffer_size: default_buffer_size(),
            max_request_len: default_max_request_len(),
        }
    }
}

/// Logging configuration
#[derive(Debug, Deserialize)]
pub struct LoggingConfig {
    /// Log level
    #[serde(default = "default_log_level")]
    pub level: String,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
        }
    }
}

fn default_listen() -> String {
    "127.0.0.1:12345".to_string()
}

fn default_max_connections() -> usize {
    1024
}

fn default_event_capacity() -> usize {
    256
}

fn default_poll_timeout_ms() -> u64 {
    200
}

fn default_buffer_size() -> usize {
    1024
}

fn default_max_request_len() -> usize {
    4096
}

fn default_log_level() -> String {
    "info".to_string()
}

/// Final resolved configuration
#[derive(Debug, Clone)]
pub struct Config {
    pub listen: String,
    pub max_connections: usize,
    pub event_capacity: usize,
    pub poll_timeout: Duration,
    pub buffer_size: usize,
    pub max_request_len: usize,
    pub log_level: String,
}

impl Default for Config {
    fn default() -> Self {
        Config::merge(CliArgs::default(), TomlConfig::default())
    }
}

impl Config {
    /// Load configuration from CLI args and optional TOML file.
    /// CLI arguments take precedence over TOML file values.
    pub fn load() -> Result<Self, ConfigError> {
        Self::from_cli(CliArgs::parse())
    }

    /// Resolve already-parsed CLI args against the config file they name.
    pub fn from_cli(cli: CliArgs) -> Result<Self, ConfigError> {
        let toml_config = if let Some(ref config_path) = cli.config {
            let contents = std::fs::read_to_string(config_path)
                .map_err(|e| ConfigError::FileRead(config_path.clone(), e))?;
            toml::from_str(&contents)
                .map_err(|e| ConfigError::TomlParse(config_path.clone(), e))?
        } else {
            TomlConfig::default()
        };

        Self::merge(cli, toml_config).validate()
    }

    fn merge(cli: CliArgs, file: TomlConfig) -> Self {
        Config {
            listen: cli.listen.unwrap_or(file.server.listen),
            max_connections: cli
                .max_connections
                .unwrap_or(file.server.max_connections),
            event_capacity: file.server.event_capacity,
            poll_timeout: Duration::from_millis(
                cli.poll_timeout_ms.unwrap_or(file.server.poll_timeout_ms),
            ),
            buffer_size: cli.buffer_size.unwrap_or(file.connection.buffer_size),
            max_request_len: cli
                .max_request_len
                .unwrap_or(file.connection.max_request_len),
            log_level: cli.log_level.unwrap_or(file.logging.level),
        }
    }

    fn validate(self) -> Result<Self, ConfigError> {
        let limits = [
            ("max_connections", self.max_connections),
            ("event_capacity", self.event_capacity),
            ("buffer_size", self.buffer_size),
            ("max_request_len", self.max_request_len),
        ];
        if let Some((name, _)) = limits.iter().find(|(_, value)| *value == 0) {
            return Err(ConfigError::Invalid(format!("{name} must be greater than 0")));
        }
        if self.poll_timeout.is_zero() {
            return Err(ConfigError::Invalid(
                "poll_timeout_ms must be greater than 0".to_string(),
            ));
        }
        Ok(self)
    }
}

/// Configuration loading errors
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("Failed to read config file '{path}': {1}", path = .0.display())]
    FileRead(PathBuf, #[source] std::io::Error),
    #[error("Failed to parse config file '{path}': {1}", path = .0.display())]
    TomlParse(PathBuf, #[source] toml::de::Error),
    #[error("Invalid configuration: {0}")]
    Invalid(String),
}
