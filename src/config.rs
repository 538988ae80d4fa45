//! Configuration module for ips-proxy.
//!
//! Supports both command-line arguments and TOML configuration file.
//! CLI arguments take precedence over config file values.

use clap::Parser;
use serde::Deserialize;
use std::net::{SocketAddr, ToSocketAddrs};
use std::path::PathBuf;
use std::time::Duration;
use thiserror::Error;

/// Command-line arguments for the proxy
#[derive(Parser, Debug)]
#[command(name = "ips-proxy")]
#[command(author = "ips-proxy authors")]
#[command(version = "0.1.0")]
#[command(
    about = "Multiplexes many TCP clients onto the single connection of a Mercury iPS",
    long_about = None
)]
pub struct CliArgs {
    /// Path to TOML configuration file
    #[arg(short, long)]
    pub config: Option<PathBuf>,

    /// Host to listen on (empty string accepts on all interfaces)
    #[arg(short = 'H', long)]
    pub host: Option<String>,

    /// Port to listen on
    #[arg(short, long)]
    pub port: Option<u16>,

    /// Address of the instrument (e.g., 192.168.137.222:7020)
    #[arg(short, long)]
    pub device: Option<String>,

    /// Pause between sending a request to the device and reading its reply
    #[arg(long)]
    pub settle_delay_ms: Option<u64>,

    /// Maximum bytes read from a client or the device in one turn
    #[arg(long)]
    pub buffer_size: Option<usize>,

    /// Listen backlog
    #[arg(long)]
    pub backlog: Option<i32>,

    /// Echo requests back instead of talking to the device
    #[arg(long)]
    pub echo: bool,

    /// Log level (trace, debug, info, warn, error)
    #[arg(long)]
    pub log_level: Option<String>,
}

/// TOML configuration file structure
#[derive(Debug, Deserialize, Default)]
pub struct TomlConfig {
    #[serde(default)]
    pub listener: ListenerConfig,
    #[serde(default)]
    pub device: DeviceConfig,
    #[serde(default)]
    pub logging: LoggingConfig,
}

/// Inbound side configuration
#[derive(Debug, Deserialize)]
pub struct ListenerConfig {
    #[serde(default)]
    pub host: String,
    #[serde(default = "default_port")]
    pub port: u16,
    #[serde(default = "default_backlog")]
    pub backlog: i32,
}

impl Default for ListenerConfig {
    fn default() -> Self {
        Self {
            host: String::new(),
            port: default_port(),
            backlog: default_backlog(),
        }
    }
}

/// Instrument side configuration
#[derive(Debug, Deserialize)]
pub struct DeviceConfig {
    /// Address of the instrument
    #[serde(default = "default_device")]
    pub address: String,
    /// Milliseconds to wait for the hardware to compute a reply
    #[serde(default = "default_settle_delay_ms")]
    pub settle_delay_ms: u64,
    /// Bytes read per turn on either side
    #[serde(default = "default_buffer_size")]
    pub buffer_size: usize,
    /// Reflect requests instead of opening the device link
    #[serde(default)]
    pub echo: bool,
}

impl Default for DeviceConfig {
    fn default() -> Self {
        Self {
            address: default_device(),
            settle_delay_ms: default_settle_delay_ms(),
            buffer_size: default_buffer_size(),
            echo: false,
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

fn default_port() -> u16 {
    7020
}

fn default_backlog() -> i32 {
    5
}

fn default_device() -> String {
    "192.168.137.222:7020".to_string()
}

fn default_settle_delay_ms() -> u64 {
    5
}

fn default_buffer_size() -> usize {
    4096
}

fn default_log_level() -> String {
    "info".to_string()
}

/// Final resolved configuration
#[derive(Debug, Clone)]
pub struct Config {
    pub host: String,
    pub port: u16,
    pub backlog: i32,
    pub device: String,
    pub settle_delay: Duration,
    pub buffer_size: usize,
    pub echo: bool,
    pub log_level: String,
}

impl Default for Config {
    fn default() -> Self {
        Self::merge(CliArgs::default_empty(), TomlConfig::default())
    }
}

impl Config {
    /// Load configuration from CLI args and optional TOML file.
    /// CLI arguments take precedence over TOML file values.
    pub fn load() -> Result<Self, ConfigError> {
        Self::from_args(CliArgs::parse())
    }

    /// Resolve configuration from already parsed arguments.
    pub fn from_args(cli: CliArgs) -> Result<Self, ConfigError> {
        let toml_config = if let Some(ref config_path) = cli.config {
            let contents = std::fs::read_to_string(config_path)
                .map_err(|source| ConfigError::FileRead {
                    path: config_path.clone(),
                    source,
                })?;
            toml::from_str(&contents).map_err(|source| ConfigError::TomlParse {
                path: config_path.clone(),
                source,
            })?
        } else {
            TomlConfig::default()
        };

        let config = Self::merge(cli, toml_config);
        config.validate()?;
        Ok(config)
    }

    fn merge(cli: CliArgs, toml_config: TomlConfig) -> Self {
        Config {
            host: cli.host.unwrap_or(toml_config.listener.host),
            port: cli.port.unwrap_or(toml_config.listener.port),
            backlog: cli.backlog.unwrap_or(toml_config.listener.backlog),
            device: cli.device.unwrap_or(toml_config.device.address),
            settle_delay: Duration::from_millis(
                cli.settle_delay_ms
                    .unwrap_or(toml_config.device.settle_delay_ms),
            ),
            buffer_size: cli
                .buffer_size
                .unwrap_or(toml_config.device.buffer_size),
            echo: cli.echo || toml_config.device.echo,
            log_level: cli.log_level.unwrap_or(toml_config.logging.level),
        }
    }

    fn validate(&self) -> Result<(), ConfigError> {
        if self.buffer_size == 0 {
            return Err(ConfigError::BufferSize);
        }
        Ok(())
    }

    /// Address the listener binds to. An empty host means all interfaces.
    pub fn listen_addr(&self) -> Result<SocketAddr, ConfigError> {
        let host = if self.host.is_empty() {
            "0.0.0.0"
        } else {
            self.host.as_str()
        };
        resolve((host, self.port), || format!("{}:{}", host, self.port))
    }

    /// Address of the instrument.
    pub fn device_addr(&self) -> Result<SocketAddr, ConfigError> {
        resolve(self.device.as_str(), || self.device.clone())
    }
}

fn resolve<A: ToSocketAddrs>(
    addr: A,
    describe: impl Fn() -> String,
) -> Result<SocketAddr, ConfigError> {
    addr.to_socket_addrs()
        .map_err(|e| ConfigError::InvalidAddress(describe(), e.to_string()))?
        .next()
        .ok_or_else(|| ConfigError::InvalidAddress(describe(), "no address found".to_string()))
}

impl CliArgs {
    fn default_empty() -> Self {
        CliArgs {
            config: None,
            host: None,
            port: None,
            device: None,
            settle_delay_ms: None,
            buffer_size: None,
            backlog: None,
            echo: false,
            log_level: None,
        }
    }
}

/// Configuration loading errors
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("Failed to read config file '{}': {source}", path.display())]
    FileRead {
        path: PathBuf,
        source: std::io::Error,
    },
    #[error("Failed to parse config file '{}': {source}", path.display())]
    TomlParse {
        path: PathBuf,
        source: toml::de::Error,
    },
    #[error("Invalid address '{0}': {1}")]
    InvalidAddress(String, String),
    #[error("buffer_size must be greater than zero")]
    BufferSize,
}
