//! Configuration module for the logsock server.
//!
//! Supports both command-line arguments and TOML configuration file.
//! CLI arguments take precedence over config file values.

use clap::Parser;
use serde::Deserialize;
use std::path::PathBuf;
use std::time::Duration;

/// Command-line arguments for the log server
#[derive(Parser, Debug)]
#[command(name = "logsock")]
#[command(author = "logsock authors")]
#[command(version = "0.1.0")]
#[command(about = "A line-protocol server appending packets to a shared log", long_about = None)]
pub struct CliArgs {
    /// Run detached from the controlling terminal
    #[arg(short = 'd', long)]
    pub daemon: bool,

    /// Path to TOML configuration file
    #[arg(short, long)]
    pub config: Option<PathBuf>,

    /// Address to bind to (e.g., 0.0.0.0:9000)
    #[arg(short = 'l', long)]
    pub listen: Option<String>,

    /// Path of the shared log file
    #[arg(long)]
    pub data_file: Option<PathBuf>,

    /// Seconds between timestamp records (0 = disabled)
    #[arg(long)]
    pub heartbeat_interval: Option<u64>,

    /// Log level (trace, debug, info, warn, error)
    #[arg(long, default_value = "info")]
    pub log_level: String,

    /// Write operational logs to this file instead of stderr
    #[arg(long)]
    pub log_file: Option<PathBuf>,
}

/// TOML configuration file structure
#[derive(Debug, Deserialize, Default)]
pub struct TomlConfig {
    #[serde(default)]
    pub server: ServerConfig,
    #[serde(default)]
    pub log: LogConfig,
    #[serde(default)]
    pub heartbeat: HeartbeatConfig,
    #[serde(default)]
    pub logging: LoggingConfig,
}

/// Server-related configuration
#[derive(Debug, Deserialize)]
pub struct ServerConfig {
    /// Address to bind to
    #[serde(default = "default_listen")]
    pub listen: String,
    /// Detach from the terminal after binding
    #[serde(default)]
    pub daemon: bool,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            listen: default_listen(),
            daemon: false,
        }
    }
}

/// Shared log configuration
#[derive(Debug, Deserialize)]
pub struct LogConfig {
    /// Path of the append-only data file
    #[serde(default = "default_data_file")]
    pub path: PathBuf,
    /// Initial receive buffer size per connection
    #[serde(default = "default_chunk_size")]
    pub chunk_size: usize,
}

impl Default for LogConfig {
    fn default() -> Self {
        Self {
            path: default_data_file(),
            chunk_size: default_chunk_size(),
        }
    }
}

/// Heartbeat configuration
#[derive(Debug, Deserialize)]
pub struct HeartbeatConfig {
    /// Interval between timestamp records in seconds
    #[serde(default = "default_heartbeat_interval")]
    pub interval_secs: u64,
}

impl Default for HeartbeatConfig {
    fn default() -> Self {
        Self {
            interval_secs: default_heartbeat_interval(),
        }
    }
}

/// Logging configuration
#[derive(Debug, Deserialize)]
pub struct LoggingConfig {
    /// Log level
    #[serde(default = "default_log_level")]
    pub level: String,
    /// Optional log file
    pub file: Option<PathBuf>,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
            file: None,
        }
    }
}

fn default_listen() -> String {
    "0.0.0.0:9000".to_string()
}

fn default_data_file() -> PathBuf {
    PathBuf::from("/var/tmp/aesdsocketdata")
}

fn default_chunk_size() -> usize {
    1024
}

fn default_heartbeat_interval() -> u64 {
    10
}

fn default_log_level() -> String {
    "info".to_string()
}

/// Final resolved configuration.
///
/// Paths produced by [`Config::load`] are absolute, so they stay valid after
/// a daemon changes its working directory.
#[derive(Debug, Clone)]
pub struct Config {
    pub listen: String,
    pub daemon: bool,
    pub data_file: PathBuf,
    pub chunk_size: usize,
    /// `Duration::ZERO` disables the heartbeat.
    pub heartbeat_interval: Duration,
    pub log_level: String,
    pub log_file: Option<PathBuf>,
}

impl Config {
    /// Load configuration from CLI args and optional TOML file.
    /// CLI arguments take precedence over TOML file values.
    pub fn load() -> Result<Self, ConfigError> {
        Self::from_cli(CliArgs::parse())
    }

    /// Resolve parsed CLI arguments against the TOML file they point at.
    pub fn from_cli(cli: CliArgs) -> Result<Self, ConfigError> {
        let toml_config = if let Some(ref config_path) = cli.config {
            let contents = std::fs::read_to_string(config_path)
                .map_err(|e| ConfigError::FileRead(config_path.clone(), e))?;
            toml::from_str(&contents)
                .map_err(|e| ConfigError::TomlParse(config_path.clone(), e))?
        } else {
            TomlConfig::default()
        };

        Self::merge(cli, toml_config)
    }

    fn merge(cli: CliArgs, toml_config: TomlConfig) -> Result<Self, ConfigError> {
        let chunk_size = toml_config.log.chunk_size;
        if chunk_size == 0 {
            return Err(ConfigError::Invalid("log.chunk_size must be non-zero"));
        }

        let log_file = cli
            .log_file
            .or(toml_config.logging.file)
            .map(absolute)
            .transpose()?;

        Ok(Config {
            listen: cli.listen.unwrap_or(toml_config.server.listen),
            daemon: cli.daemon || toml_config.server.daemon,
            data_file: absolute(cli.data_file.unwrap_or(toml_config.log.path))?,
            chunk_size,
            heartbeat_interval: Duration::from_secs(
                cli.heartbeat_interval
                    .unwrap_or(toml_config.heartbeat.interval_secs),
            ),
            log_level: if cli.log_level != "info" {
                cli.log_level
            } else {
                toml_config.logging.level
            },
            log_file,
        })
    }
}

/// Resolve a relative path against the startup directory.
fn absolute(path: PathBuf) -> Result<PathBuf, ConfigError> {
    if path.is_absolute() {
        return Ok(path);
    }
    let cwd = std::env::current_dir().map_err(ConfigError::WorkingDir)?;
    Ok(cwd.join(path))
}

impl Default for Config {
    fn default() -> Self {
        Config {
            listen: default_listen(),
            daemon: false,
            data_file: default_data_file(),
            chunk_size: default_chunk_size(),
            heartbeat_interval: Duration::from_secs(default_heartbeat_interval()),
            log_level: default_log_level(),
            log_file: None,
        }
    }
}

/// Configuration loading errors
#[derive(Debug)]
pub enum ConfigError {
    FileRead(PathBuf, std::io::Error),
    TomlParse(PathBuf, toml::de::Error),
    Invalid(&'static str),
    WorkingDir(std::io::Error),
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
            ConfigError::Invalid(msg) => write!(f, "Invalid configuration: {msg}"),
            ConfigError::WorkingDir(e) => {
                write!(f, "Failed to resolve working directory: {e}")
            }
        }
    }
}

impl std::error::Error for ConfigError {}
