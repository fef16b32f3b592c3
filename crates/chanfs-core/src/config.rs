//! Configuration system for chanfs
//!
//! Supports TOML configuration files with sensible defaults.
//! Configuration is loaded from an explicit path or from:
//! - macOS: ~/Library/Application Support/chanfs/config.toml
//! - Linux: ~/.config/chanfs/config.toml
//! - Windows: %APPDATA%/chanfs/config.toml

use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::path::{Path, PathBuf};
use std::time::Duration;

use directories::ProjectDirs;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::{debug, info, warn};

use crate::{DEFAULT_BUFFER_SIZE, DEFAULT_CHANNEL, DEFAULT_PORT};

/// Main configuration structure
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    /// Listener settings
    pub server: ServerConfig,
    /// Storage tree settings
    pub storage: StorageConfig,
}

/// Listener configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ServerConfig {
    /// Bind address
    pub bind: IpAddr,
    /// TCP port
    pub port: u16,
    /// Maximum concurrent connections
    pub max_connections: usize,
    /// Deadline for each network read/write (no deadline if unset)
    pub io_timeout_secs: Option<u64>,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            bind: IpAddr::V4(Ipv4Addr::UNSPECIFIED),
            port: DEFAULT_PORT,
            max_connections: 64,
            io_timeout_secs: None,
        }
    }
}

impl ServerConfig {
    pub fn bind_addr(&self) -> SocketAddr {
        SocketAddr::new(self.bind, self.port)
    }

    pub fn io_timeout(&self) -> Option<Duration> {
        self.io_timeout_secs.map(Duration::from_secs)
    }
}

/// Storage tree configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct StorageConfig {
    /// Physical directory holding one subdirectory per channel
    pub root: PathBuf,
    /// Channel used when a request names none
    pub default_channel: String,
    /// Known channels
    pub channels: Vec<String>,
    /// Chunk buffer size in bytes
    pub buffer_size: usize,
    /// Reject uploads that declare a size of zero
    pub reject_empty_uploads: bool,
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            root: PathBuf::from("fs"),
            default_channel: DEFAULT_CHANNEL.into(),
            channels: vec![DEFAULT_CHANNEL.into()],
            buffer_size: DEFAULT_BUFFER_SIZE,
            reject_empty_uploads: true,
        }
    }
}

impl Config {
    /// Load configuration from the default path
    pub fn load() -> Self {
        match Self::default_path() {
            Some(path) => Self::load_from(&path).unwrap_or_else(|e| {
                warn!("Failed to load config from {:?}: {}, using defaults", path, e);
                Self::default()
            }),
            None => {
                debug!("No config directory found, using defaults");
                Self::default()
            }
        }
    }

    /// Load configuration from a specific path
    pub fn load_from(path: &Path) -> Result<Self, ConfigError> {
        if !path.exists() {
            debug!("Config file {:?} not found, using defaults", path);
            return Ok(Self::default());
        }

        let content =
            std::fs::read_to_string(path).map_err(|e| ConfigError::Io(e.to_string()))?;

        let config: Config =
            toml::from_str(&content).map_err(|e| ConfigError::Parse(e.to_string()))?;
        config.validate()?;

        info!("Loaded config from {:?}", path);
        Ok(config)
    }

    /// Save configuration to a specific path
    pub fn save_to(&self, path: &Path) -> Result<(), ConfigError> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent).map_err(|e| ConfigError::Io(e.to_string()))?;
        }

        let content =
            toml::to_string_pretty(self).map_err(|e| ConfigError::Serialize(e.to_string()))?;

        std::fs::write(path, content).map_err(|e| ConfigError::Io(e.to_string()))?;

        info!("Saved config to {:?}", path);
        Ok(())
    }

    /// Get the default config file path
    pub fn default_path() -> Option<PathBuf> {
        ProjectDirs::from("com", "chanfs", "chanfs")
            .map(|dirs| dirs.config_dir().join("config.toml"))
    }

    /// Check values that would otherwise fail at first use
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.storage.buffer_size == 0 {
            return Err(ConfigError::Invalid("storage.buffer_size must be > 0".into()));
        }
        if self.server.max_connections == 0 {
            return Err(ConfigError::Invalid(
                "server.max_connections must be > 0".into(),
            ));
        }
        for channel in &self.storage.channels {
            crate::path::validate_token(channel).map_err(|e| {
                ConfigError::Invalid(format!("invalid channel name {:?}: {}", channel, e))
            })?;
            if channel.is_empty() {
                return Err(ConfigError::Invalid("empty channel name".into()));
            }
        }
        if !self.storage.channels.contains(&self.storage.default_channel) {
            return Err(ConfigError::Invalid(format!(
                "default channel {:?} is not in storage.channels",
                self.storage.default_channel
            )));
        }
        Ok(())
    }

    /// Generate a sample configuration file content
    pub fn sample() -> String {
        let config = Self::default();
        toml::to_string_pretty(&config).unwrap_or_default()
    }
}

/// Configuration errors
#[derive(Debug, Clone, Error)]
pub enum ConfigError {
    #[error("I/O error: {0}")]
    Io(String),
    #[error("Parse error: {0}")]
    Parse(String),
    #[error("Serialization error: {0}")]
    Serialize(String),
    #[error("Invalid configuration: {0}")]
    Invalid(String),
}
