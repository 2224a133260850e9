//! Configuration module for the edge connector.
//!
//! Supports both command-line arguments and TOML configuration file.
//! CLI arguments take precedence over config file values.

use crate::transport::{LoopMode, TransportConfig, DEFAULT_PORT};
use clap::{Parser, Subcommand};
use serde::Deserialize;
use std::path::PathBuf;
use std::time::Duration;
use thiserror::Error;

/// Command-line arguments for the edge connector
#[derive(Parser, Debug)]
#[command(name = "edge-connector")]
#[command(author = "edge-connector authors")]
#[command(version = "0.1.0")]
#[command(about = "A minimal edge-facing TCP connector", long_about = None)]
pub struct CliArgs {
    /// Path to TOML configuration file
    #[arg(short, long, global = true)]
    pub config: Option<PathBuf>,

    /// Log level (trace, debug, info, warn, error)
    #[arg(long, global = true, default_value = "info")]
    pub log_level: String,

    #[command(subcommand)]
    pub command: Option<Command>,
}

#[derive(Subcommand, Debug, Clone)]
pub enum Command {
    /// Accept clients and answer one request per connection (default)
    Serve {
        /// Address to bind to
        #[arg(short = 'H', long)]
        host: Option<String>,

        /// Port to listen on
        #[arg(short, long)]
        port: Option<u16>,

        /// Close the listener after the first client
        #[arg(long)]
        single_shot: bool,
    },
    /// Connect, send one request, print the reply and close
    Request {
        /// Server address
        #[arg(short = 'H', long)]
        host: Option<String>,

        /// Server port
        #[arg(short, long)]
        port: Option<u16>,

        /// Topic to request
        #[arg(short, long, default_value = "random-data")]
        topic: String,
    },
}

/// TOML configuration file structure
#[derive(Debug, Deserialize, Default)]
pub struct TomlConfig {
    #[serde(default)]
    pub server: ServerConfig,
    #[serde(default)]
    pub transport: TransportSection,
    #[serde(default)]
    pub logging: LoggingConfig,
}

/// Server-related configuration
#[derive(Debug, Deserialize)]
pub struct ServerConfig {
    #[serde(default = "default_host")]
    pub host: String,
    #[serde(default = "default_port")]
    pub port: u16,
    #[serde(default)]
    pub loop_mode: LoopMode,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            host: default_host(),
            port: default_port(),
            loop_mode: LoopMode::default(),
        }
    }
}

/// Socket and timeout tuning. Unset values fall back to `TransportConfig::default()`.
#[derive(Debug, Deserialize, Default)]
pub struct TransportSection {
    pub buffer_size: Option<usize>,
    pub backlog: Option<i32>,
    pub max_events: Option<usize>,
    pub read_timeout_ms: Option<u64>,
    pub write_timeout_ms: Option<u64>,
    pub accept_timeout_ms: Option<u64>,
    pub connect_timeout_ms: Option<u64>,
}

impl TransportSection {
    fn resolve(&self) -> TransportConfig {
        let defaults = TransportConfig::default();
        let ms = |value: Option<u64>, fallback: Duration| {
            value.map(Duration::from_millis).unwrap_or(fallback)
        };

        TransportConfig {
            buffer_size: self.buffer_size.unwrap_or(defaults.buffer_size),
            backlog: self.backlog.unwrap_or(defaults.backlog),
            max_events: self.max_events.unwrap_or(defaults.max_events),
            read_timeout: ms(self.read_timeout_ms, defaults.read_timeout),
            write_timeout: ms(self.write_timeout_ms, defaults.write_timeout),
            accept_timeout: ms(self.accept_timeout_ms, defaults.accept_timeout),
            connect_timeout: ms(self.connect_timeout_ms, defaults.connect_timeout),
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

fn default_host() -> String {
    "127.0.0.1".to_string()
}

fn default_port() -> u16 {
    DEFAULT_PORT
}

fn default_log_level() -> String {
    "info".to_string()
}

/// What the process was asked to do.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Mode {
    Serve,
    Request { topic: String },
}

/// Final resolved configuration
#[derive(Debug, Clone)]
pub struct Config {
    pub mode: Mode,
    pub host: String,
    pub port: u16,
    pub loop_mode: LoopMode,
    pub transport: TransportConfig,
    pub log_level: String,
}

impl Config {
    /// Load configuration from CLI args and optional TOML file.
    /// CLI arguments take precedence over TOML file values.
    pub fn load() -> Result<Self, ConfigError> {
        let cli = CliArgs::parse();

        // Load TOML config if specified
        let toml_config = if let Some(ref config_path) = cli.config {
            let contents = std::fs::read_to_string(config_path)
                .map_err(|e| ConfigError::FileRead(config_path.clone(), e))?;
            toml::from_str(&contents)
                .map_err(|e| ConfigError::TomlParse(config_path.clone(), e))?
        } else {
            TomlConfig::default()
        };

        Ok(Self::merge(cli, toml_config))
    }

    /// Merge CLI args with TOML config (CLI takes precedence)
    pub fn merge(cli: CliArgs, toml_config: TomlConfig) -> Self {
        let command = cli.command.unwrap_or(Command::Serve {
            host: None,
            port: None,
            single_shot: false,
        });

        let (mode, host, port, loop_mode) = match command {
            Command::Serve {
                host,
                port,
                single_shot,
            } => {
                let loop_mode = if single_shot {
                    LoopMode::SingleShot
                } else {
                    toml_config.server.loop_mode
                };
                (Mode::Serve, host, port, loop_mode)
            }
            Command::Request { host, port, topic } => (
                Mode::Request { topic },
                host,
                port,
                toml_config.server.loop_mode,
            ),
        };

        Config {
            mode,
            host: host.unwrap_or(toml_config.server.host),
            port: port.unwrap_or(toml_config.server.port),
            loop_mode,
            transport: toml_config.transport.resolve(),
            log_level: if cli.log_level != "info" {
                cli.log_level
            } else {
                toml_config.logging.level
            },
        }
    }
}

/// Configuration loading errors
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("Failed to read config file '{path}': {1}", path = .0.display())]
    FileRead(PathBuf, #[source] std::io::Error),
    #[error("Failed to parse config file '{path}': {1}", path = .0.display())]
    TomlParse(PathBuf, #[source] toml::de::Error),
}
