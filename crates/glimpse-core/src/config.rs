//! Configuration system for Glimpse
//!
//! Supports TOML configuration files with sensible defaults.
//! Configuration is loaded from:
//! - macOS: ~/Library/Application Support/com.glimpse.glimpse/config.toml
//! - Linux: ~/.config/glimpse/config.toml
//! - Windows: %APPDATA%/glimpse/glimpse/config/config.toml

use std::net::{IpAddr, Ipv4Addr};
use std::path::{Path, PathBuf};
use std::time::Duration;

use directories::ProjectDirs;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::{debug, info, warn};

use crate::code::DEFAULT_SHARE_BASE_URL;

/// Main configuration structure
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct GlimpseConfig {
    /// Store server settings
    pub signal: SignalConfig,
    /// Session registry settings
    pub session: SessionConfig,
    /// Signaling relay settings
    pub relay: RelayConfig,
    /// Viewer-side behaviour
    pub viewer: ViewerConfig,
    /// Client settings
    pub client: ClientConfig,
}

/// Store server configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SignalConfig {
    /// Store server port
    pub port: u16,
    /// Bind address
    pub bind: IpAddr,
    /// Database path (None = in-memory)
    pub db_path: Option<PathBuf>,
    /// Interval between relay queue cleanups on the server, in seconds
    pub queue_cleanup_interval_secs: u64,
}

impl Default for SignalConfig {
    fn default() -> Self {
        Self {
            port: 8080,
            bind: IpAddr::V4(Ipv4Addr::UNSPECIFIED),
            db_path: None,
            queue_cleanup_interval_secs: 60,
        }
    }
}

/// Session registry configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SessionConfig {
    /// Session lifetime in seconds
    pub expiry_secs: u64,
    /// Expiry sweep interval in seconds
    pub sweep_interval_secs: u64,
    /// Attempts at finding an unused code before accepting a collision
    pub id_attempts: u32,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            expiry_secs: 24 * 60 * 60,
            sweep_interval_secs: crate::SWEEP_INTERVAL_SECS,
            id_attempts: 8,
        }
    }
}

impl SessionConfig {
    pub fn expiry_ms(&self) -> i64 {
        (self.expiry_secs as i64).saturating_mul(1000)
    }

    pub fn sweep_interval(&self) -> Duration {
        Duration::from_secs(self.sweep_interval_secs.max(1))
    }
}

/// Signaling relay configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RelayConfig {
    /// Poll interval in milliseconds
    pub poll_interval_ms: u64,
    /// Message lifetime in milliseconds
    pub message_expiry_ms: i64,
}

impl Default for RelayConfig {
    fn default() -> Self {
        Self {
            poll_interval_ms: crate::POLL_INTERVAL_MS,
            message_expiry_ms: crate::MESSAGE_EXPIRY_MS,
        }
    }
}

impl RelayConfig {
    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms.max(1))
    }
}

/// Viewer-side configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ViewerConfig {
    /// Delay before leaving after the host disappears, in milliseconds
    pub auto_leave_grace_ms: u64,
}

impl Default for ViewerConfig {
    fn default() -> Self {
        Self {
            auto_leave_grace_ms: crate::AUTO_LEAVE_GRACE_MS,
        }
    }
}

impl ViewerConfig {
    pub fn auto_leave_grace(&self) -> Duration {
        Duration::from_millis(self.auto_leave_grace_ms)
    }
}

/// Client configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ClientConfig {
    /// Store server URL
    pub store_url: String,
    /// Base URL for share links
    pub share_base_url: String,
    /// Store request timeout in seconds
    pub request_timeout_secs: u64,
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            store_url: "ws://localhost:8080".into(),
            share_base_url: DEFAULT_SHARE_BASE_URL.into(),
            request_timeout_secs: 10,
        }
    }
}

impl ClientConfig {
    pub fn request_timeout(&self) -> Duration {
        Duration::from_secs(self.request_timeout_secs.max(1))
    }
}

impl GlimpseConfig {
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

        let content = std::fs::read_to_string(path).map_err(|e| ConfigError::Io(e.to_string()))?;

        let config: GlimpseConfig =
            toml::from_str(&content).map_err(|e| ConfigError::Parse(e.to_string()))?;

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
        ProjectDirs::from("com", "glimpse", "glimpse")
            .map(|dirs| dirs.config_dir().join("config.toml"))
    }

    /// Generate a sample configuration file content
    pub fn sample() -> String {
        toml::to_string_pretty(&Self::default()).unwrap_or_default()
    }
}

/// Configuration errors
#[derive(Error, Debug, Clone)]
pub enum ConfigError {
    #[error("I/O error: {0}")]
    Io(String),

    #[error("Parse error: {0}")]
    Parse(String),

    #[error("Serialization error: {0}")]
    Serialize(String),
}
