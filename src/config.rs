//! Configuration module for the chat relay.
//!
//! Supports both command-line arguments and TOML configuration file.
//! CLI arguments take precedence over config file values.

use clap::Parser;
use serde::Deserialize;
use std::path::PathBuf;

/// Command-line arguments for the relay server
#[derive(Parser, Debug)]
#[command(name = "chat-relay")]
#[command(version = "0.1.0")]
#[command(about = "A multi-client TCP chat relay", long_about = None)]
pub struct CliArgs {
    /// Path to TOML configuration file
    #[arg(short, long)]
    pub config: Option<PathBuf>,

    /// Address to bind to (e.g., 0.0.0.0:13232)
    #[arg(short = 'l', long)]
    pub listen: Option<String>,

    /// Minimum active clients required to keep the chat alive
    #[arg(long)]
    pub min_clients: Option<usize>,

    /// Number of worker threads to start with (the pool grows on demand)
    #[arg(short = 'w', long)]
    pub initial_workers: Option<usize>,

    /// Accept-poll timeout in seconds
    #[arg(long)]
    pub accept_timeout: Option<u64>,

    /// Per-session readiness-poll timeout in seconds
    #[arg(long)]
    pub poll_timeout: Option<u64>,

    /// Receive buffer size in bytes
    #[arg(long)]
    pub buffer_size: Option<usize>,

    /// Log level (trace, debug, info, warn, error)
    #[arg(long, default_value = "info")]
    pub log_level: String,
}

/// TOML configuration file structure
#[derive(Debug, Deserialize, Default)]
pub struct TomlConfig {
    #[serde(default)]
    pub server: ServerConfig,
    #[serde(default)]
    pub session: SessionConfig,
    #[serde(default)]
    pub logging: LoggingConfig,
}

/// Server-related configuration
#[derive(Debug, Deserialize)]
pub struct ServerConfig {
    /// Address to bind to
    #[serde(default = "default_listen")]
    pub listen: String,
    /// Minimum active clients required to keep the chat alive
    #[serde(default = "default_min_clients")]
    pub min_clients: usize,
    /// Number of worker threads to start with
    #[serde(default = "default_initial_workers")]
    pub initial_workers: usize,
    /// Accept-poll timeout in seconds
    #[serde(default = "default_timeout_secs")]
    pub accept_timeout_secs: u64,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            listen: default_listen(),
            min_clients: default_min_clients(),
            initial_workers: default_initial_workers(),
            accept_timeout_secs: default_timeout_secs(),
        }
    }
}

/// Per-session configuration
#[derive(Debug, Deserialize)]
pub struct SessionConfig {
    /// Readiness-poll timeout in seconds; bounds how quickly a session
    /// observes cancellation
    #[serde(default = "default_timeout_secs")]
    pub poll_timeout_secs: u64,
    /// Receive buffer size in bytes
    #[serde(default = "default_buffer_size")]
    pub buffer_size: usize,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            poll_timeout_secs: default_timeout_secs(),
            buffer_size: default_buffer_size(),
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
    "0.0.0.0:13232".to_string()
}

fn default_min_clients() -> usize {
    2
}

fn default_initial_workers() -> usize {
    2
}

fn default_timeout_secs() -> u64 {
    5
}

fn default_buffer_size() -> usize {
    1024
}

fn default_log_level() -> String {
    "info".to_string()
}

/// Final resolved configuration
#[derive(Debug, Clone)]
pub struct Config {
    pub listen: String,
    pub min_clients: usize,
    pub initial_workers: usize,
    pub accept_timeout_secs: u64,
    pub poll_timeout_secs: u64,
    pub buffer_size: usize,
    pub log_level: String,
}

impl Config {
    /// Load configuration from CLI args and optional TOML file.
    /// CLI arguments take precedence over TOML file values.
    pub fn load() -> Result<Self, ConfigError> {
        Self::from_cli(CliArgs::parse())
    }

    fn from_cli(cli: CliArgs) -> Result<Self, ConfigError> {
        // Load TOML config if specified
        let toml_config = if let Some(ref config_path) = cli.config {
            let contents = std::fs::read_to_string(config_path)
                .map_err(|e| ConfigError::FileRead(config_path.clone(), e))?;
            toml::from_str(&contents)
                .map_err(|e| ConfigError::TomlParse(config_path.clone(), e))?
        } else {
            TomlConfig::default()
        };

        // Merge CLI args with TOML config (CLI takes precedence)
        Ok(Config {
            listen: cli.listen.unwrap_or(toml_config.server.listen),
            min_clients: cli.min_clients.unwrap_or(toml_config.server.min_clients),
            initial_workers: cli
                .initial_workers
                .unwrap_or(toml_config.server.initial_workers),
            accept_timeout_secs: cli
                .accept_timeout
                .unwrap_or(toml_config.server.accept_timeout_secs),
            poll_timeout_secs: cli
                .poll_timeout
                .unwrap_or(toml_config.session.poll_timeout_secs),
            buffer_size: cli.buffer_size.unwrap_or(toml_config.session.buffer_size),
            log_level: if cli.log_level != "info" {
                cli.log_level
            } else {
                toml_config.logging.level
            },
        })
    }
}

/// Configuration loading errors
#[derive(Debug)]
pub enum ConfigError {
    FileRead(PathBuf, std::io::Error),
    TomlParse(PathBuf, toml::de::Error),
}

impl std::fmt::Display for ConfigError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ConfigError::FileRead(path, e) => {
                write!(f, "Failed to read config file '{}': {}", path.display(), e)
            }
            ConfigError::TomlParse(path, e) => {
                write!(f, "Failed to parse config file '{}': {}", path.display(), e)
            }
        }
    }
}

impl std::error::Error for ConfigError {}
