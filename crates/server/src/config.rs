//! Configuration management for the FsGate server.
//!
//! This module provides TOML-based configuration file loading and saving.
//! The default configuration path is `~/.config/fsgate/config.toml`.

use std::fs;
use std::net::SocketAddr;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use protocol::Delimiter;
use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Configuration validation errors.
#[derive(Debug, Error, PartialEq)]
pub enum ConfigError {
    #[error("bind_addr must be a socket address like 127.0.0.1:55555, got {0}")]
    InvalidBindAddr(String),

    #[error("max_connections must be between 1 and 10000, got {0}")]
    InvalidMaxConnections(usize),

    #[error("view_max_lines must be between 1 and 100000, got {0}")]
    InvalidViewMaxLines(usize),

    #[error("max_transfer_size must be greater than 0, got {0}")]
    InvalidMaxTransferSize(u64),

    #[error("max_line_length must be between 64 and 67108864 bytes, got {0}")]
    InvalidMaxLineLength(usize),

    #[error("root_dir must not be empty")]
    EmptyRootDir,

    #[error("log_level must be one of: trace, debug, info, warn, error; got {0}")]
    InvalidLogLevel(String),
}

/// Valid log level values for tracing configuration.
const VALID_LOG_LEVELS: &[&str] = &["trace", "debug", "info", "warn", "error"];

/// Default listening port.
pub const DEFAULT_PORT: u16 = 55555;

/// Main configuration structure for the FsGate server.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Default)]
#[serde(default)]
pub struct Config {
    /// Listener and logging configuration.
    pub server: ServerConfig,

    /// Credential store configuration.
    pub auth: AuthConfig,

    /// File operation limits.
    pub file: FileConfig,

    /// Wire protocol settings.
    pub protocol: ProtocolConfig,
}

/// Listener and logging configuration.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct ServerConfig {
    /// Address the listener binds to.
    pub bind_addr: String,

    /// Directory every session is confined to.
    pub root_dir: PathBuf,

    /// Logging level (trace, debug, info, warn, error).
    pub log_level: String,

    /// Optional log file; logs rotate daily when set.
    pub log_file: Option<PathBuf>,

    /// Maximum number of concurrently served connections.
    pub max_connections: usize,
}

/// Credential store configuration.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct AuthConfig {
    /// Path to the SQLite user database.
    pub database: PathBuf,

    /// Allow one username to hold several authenticated sessions at once.
    pub allow_concurrent_logins: bool,
}

/// File operation limits.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct FileConfig {
    /// Number of lines VIEW returns before truncating a file.
    pub view_max_lines: usize,

    /// Largest file DOWNLOAD/UPLOAD will move, in bytes (default: 16MB).
    pub max_transfer_size: u64,

    /// Serialize copy/move/rename/upload per resolved path.
    pub serialize_mutations: bool,
}

/// Wire protocol settings.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct ProtocolConfig {
    /// Argument delimiter convention.
    pub delimiter: Delimiter,

    /// Longest accepted request line in bytes.
    pub max_line_length: usize,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            bind_addr: format!("127.0.0.1:{}", DEFAULT_PORT),
            root_dir: default_data_dir().join("server_files"),
            log_level: "info".to_string(),
            log_file: None,
            max_connections: 100,
        }
    }
}

impl Default for AuthConfig {
    fn default() -> Self {
        Self {
            database: default_data_dir().join("users.db"),
            allow_concurrent_logins: false,
        }
    }
}

impl Default for FileConfig {
    fn default() -> Self {
        Self {
            view_max_lines: 100,
            max_transfer_size: 16 * 1024 * 1024, // 16MB
            serialize_mutations: false,
        }
    }
}

impl Default for ProtocolConfig {
    fn default() -> Self {
        Self {
            delimiter: Delimiter::Whitespace,
            // Base64 UPLOAD payloads travel on a single line.
            max_line_length: 32 * 1024 * 1024,
        }
    }
}

/// Returns the default configuration file path.
pub fn default_config_path() -> PathBuf {
    dirs::config_dir()
        .unwrap_or_else(|| PathBuf::from("."))
        .join("fsgate")
        .join("config.toml")
}

/// Returns the default data directory path.
fn default_data_dir() -> PathBuf {
    dirs::data_local_dir()
        .unwrap_or_else(|| PathBuf::from("."))
        .join("fsgate")
}

impl Config {
    /// Apply environment variable overrides to the configuration.
    ///
    /// Environment variables take precedence over config file values.
    /// Supported variables:
    /// - FSGATE_BIND_ADDR: Override listener address
    /// - FSGATE_ROOT_DIR: Override server root directory
    /// - FSGATE_LOG_LEVEL: Override log level (trace, debug, info, warn, error)
    pub fn apply_env_overrides(&mut self) {
        if let Ok(addr) = std::env::var("FSGATE_BIND_ADDR") {
            if !addr.is_empty() {
                tracing::info!("Overriding bind_addr from environment: {}", addr);
                self.server.bind_addr = addr;
            }
        }

        if let Ok(root) = std::env::var("FSGATE_ROOT_DIR") {
            if !root.is_empty() {
                tracing::info!("Overriding root_dir from environment: {}", root);
                self.server.root_dir = PathBuf::from(root);
            }
        }

        if let Ok(level) = std::env::var("FSGATE_LOG_LEVEL") {
            if !level.is_empty() {
                tracing::info!("Overriding log_level from environment: {}", level);
                self.server.log_level = level;
            }
        }
    }

    /// Validate the configuration values.
    ///
    /// Returns an error if any configuration value is outside the valid range.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.server.bind_addr.parse::<SocketAddr>().is_err() {
            return Err(ConfigError::InvalidBindAddr(self.server.bind_addr.clone()));
        }

        if self.server.root_dir.as_os_str().is_empty() {
            return Err(ConfigError::EmptyRootDir);
        }

        if self.server.max_connections < 1 || self.server.max_connections > 10_000 {
            return Err(ConfigError::InvalidMaxConnections(
                self.server.max_connections,
            ));
        }

        if self.file.view_max_lines < 1 || self.file.view_max_lines > 100_000 {
            return Err(ConfigError::InvalidViewMaxLines(self.file.view_max_lines));
        }

        if self.file.max_transfer_size == 0 {
            return Err(ConfigError::InvalidMaxTransferSize(
                self.file.max_transfer_size,
            ));
        }

        if self.protocol.max_line_length < 64 || self.protocol.max_line_length > 64 * 1024 * 1024
        {
            return Err(ConfigError::InvalidMaxLineLength(
                self.protocol.max_line_length,
            ));
        }

        let level = self.server.log_level.to_lowercase();
        if !VALID_LOG_LEVELS.contains(&level.as_str()) {
            return Err(ConfigError::InvalidLogLevel(self.server.log_level.clone()));
        }

        Ok(())
    }

    /// Load configuration from a file.
    ///
    /// If the file does not exist, returns the default configuration.
    /// If the file exists but is invalid TOML, returns an error with
    /// a helpful message.
    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref();

        if !path.exists() {
            tracing::debug!("Config file not found at {:?}, using defaults", path);
            return Ok(Self::default());
        }

        let contents = fs::read_to_string(path)
            .with_context(|| format!("Failed to read config file: {}", path.display()))?;

        Self::from_toml(&contents)
            .with_context(|| format!("Failed to parse config file: {}", path.display()))
    }

    /// Load configuration from the default path.
    pub fn load_default() -> Result<Self> {
        Self::load(default_config_path())
    }

    /// Parse configuration from a TOML string.
    pub fn from_toml(toml_str: &str) -> Result<Self> {
        toml::from_str(toml_str)
            .map_err(|e| anyhow::anyhow!("Invalid TOML configuration: {}", format_toml_error(&e)))
    }

    /// Save configuration to a file.
    ///
    /// Creates parent directories if they don't exist.
    pub fn save<P: AsRef<Path>>(&self, path: P) -> Result<()> {
        let path = path.as_ref();

        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent).with_context(|| {
                format!("Failed to create config directory: {}", parent.display())
            })?;
        }

        let contents = self.to_toml()?;
        fs::write(path, contents)
            .with_context(|| format!("Failed to write config file: {}", path.display()))?;

        tracing::debug!("Configuration saved to {:?}", path);
        Ok(())
    }

    /// Serialize configuration to a TOML string.
    pub fn to_toml(&self) -> Result<String> {
        toml::to_string_pretty(self).context("Failed to serialize configuration to TOML")
    }
}

/// Format a TOML deserialization error for user-friendly display.
fn format_toml_error(error: &toml::de::Error) -> String {
    let mut msg = error.message().to_string();

    if let Some(span) = error.span() {
        msg.push_str(&format!(" (at position {}..{})", span.start, span.end));
    }

    msg
}
