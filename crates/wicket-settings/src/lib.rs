//! Layered TOML configuration for the wicket proxy.
//!
//! Provides structured configuration types for all wicket components,
//! loading from:
//! - Global config: `~/.config/wicket/wicket.toml`
//! - Project config: `<workspace>/.wicket/wicket.toml`
//!
//! Project values take precedence for scalar fields.
//!
//! # Example
//!
//! ```no_run
//! use wicket_settings::ConfigLoader;
//!
//! let config = ConfigLoader::load(std::path::Path::new("."));
//! println!("{:?}", config.listener.bind_addr);
//! ```

mod loader;

pub use loader::ConfigLoader;

use serde::{Deserialize, Serialize};
use std::path::Path;
use std::time::Duration;
use thiserror::Error;

/// Errors from settings operations.
#[derive(Error, Debug)]
pub enum SettingsError {
    /// TOML deserialization failed.
    #[error("Failed to parse config: {0}")]
    ParseError(#[from] toml::de::Error),

    /// TOML serialization failed.
    #[error("Failed to serialize config: {0}")]
    SerializeError(#[from] toml::ser::Error),

    /// A configuration value is out of its accepted range.
    #[error("Invalid config value: {0}")]
    Invalid(String),

    /// I/O error reading or writing a config file.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

/// TOML `[listener]` section: the accepting socket and per-connection knobs.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ListenerSettings {
    /// Address the proxy listens on (e.g. `"127.0.0.1:3128"`).
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub bind_addr: Option<String>,

    /// Maximum concurrent connections.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max_connections: Option<usize>,

    /// Size of the per-direction relay buffer in bytes. Must be positive.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub io_chunk_size: Option<usize>,

    /// Connections with no data read for this long are dropped.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub idle_connection_timeout_secs: Option<u64>,

    /// Timeout for dialing the target host.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub connect_timeout_secs: Option<u64>,
}

/// TOML `[limits]` section: per-connection traffic shaping.
///
/// A rate of 0 disables shaping for that direction.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct LimitSettings {
    /// Read-rate cap for data flowing client -> target, bytes per second.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub from_user_bytes_per_sec: Option<u64>,

    /// Read-rate cap for data flowing target -> client, bytes per second.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub from_target_bytes_per_sec: Option<u64>,
}

/// TOML `[dns]` section.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct DnsSettings {
    /// How often the resolver evicts expired cache entries.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cache_cleanup_period_secs: Option<u64>,
}

/// Top-level wicket configuration, corresponding to `wicket.toml`.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct WicketConfig {
    /// Listener configuration.
    #[serde(default)]
    pub listener: ListenerSettings,

    /// Traffic shaping configuration.
    #[serde(default)]
    pub limits: LimitSettings,

    /// DNS resolver configuration.
    #[serde(default)]
    pub dns: DnsSettings,
}

impl WicketConfig {
    /// Parse a `WicketConfig` from a TOML string.
    ///
    /// # Errors
    /// Returns `SettingsError::ParseError` if the TOML is malformed or
    /// contains unrecognised keys for this schema.
    pub fn parse(toml: &str) -> Result<Self, SettingsError> {
        toml::from_str(toml).map_err(SettingsError::ParseError)
    }

    /// Load a `WicketConfig` from a file on disk.
    ///
    /// # Errors
    /// Returns `SettingsError::Io` on read failure, or
    /// `SettingsError::ParseError` if the file content is not valid TOML.
    pub fn load(path: &Path) -> Result<Self, SettingsError> {
        let contents = std::fs::read_to_string(path)?;
        Self::parse(&contents)
    }

    /// Serialize this config to a TOML string.
    ///
    /// # Errors
    /// Returns `SettingsError::SerializeError` if serialization fails.
    pub fn to_toml(&self) -> Result<String, SettingsError> {
        toml::to_string_pretty(self).map_err(SettingsError::SerializeError)
    }

    /// Save this config to a file, creating parent directories as needed.
    ///
    /// # Errors
    /// Returns `SettingsError::Io` on write failure, or
    /// `SettingsError::SerializeError` if serialization fails.
    pub fn save(&self, path: &Path) -> Result<(), SettingsError> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let contents = self.to_toml()?;
        std::fs::write(path, contents)?;
        Ok(())
    }

    /// Merge `other` (project-level) on top of `self` (global-level).
    ///
    /// Every field in this schema is a scalar: `other` wins when
    /// explicitly set (`Some`).
    #[must_use]
    pub fn merge(mut self, other: WicketConfig) -> WicketConfig {
        if other.listener.bind_addr.is_some() {
            self.listener.bind_addr = other.listener.bind_addr;
        }
        if other.listener.max_connections.is_some() {
            self.listener.max_connections = other.listener.max_connections;
        }
        if other.listener.io_chunk_size.is_some() {
            self.listener.io_chunk_size = other.listener.io_chunk_size;
        }
        if other.listener.idle_connection_timeout_secs.is_some() {
            self.listener.idle_connection_timeout_secs =
                other.listener.idle_connection_timeout_secs;
        }
        if other.listener.connect_timeout_secs.is_some() {
            self.listener.connect_timeout_secs = other.listener.connect_timeout_secs;
        }
        if other.limits.from_user_bytes_per_sec.is_some() {
            self.limits.from_user_bytes_per_sec = other.limits.from_user_bytes_per_sec;
        }
        if other.limits.from_target_bytes_per_sec.is_some() {
            self.limits.from_target_bytes_per_sec = other.limits.from_target_bytes_per_sec;
        }
        if other.dns.cache_cleanup_period_secs.is_some() {
            self.dns.cache_cleanup_period_secs = other.dns.cache_cleanup_period_secs;
        }
        self
    }

    /// Check value ranges that serde cannot express.
    ///
    /// # Errors
    /// Returns `SettingsError::Invalid` when `io_chunk_size` or a timeout is
    /// set to zero.
    pub fn validate(&self) -> Result<(), SettingsError> {
        if self.listener.io_chunk_size == Some(0) {
            return Err(SettingsError::Invalid(
                "listener.io_chunk_size must be positive".to_string(),
            ));
        }
        if self.listener.idle_connection_timeout_secs == Some(0) {
            return Err(SettingsError::Invalid(
                "listener.idle_connection_timeout_secs must be positive".to_string(),
            ));
        }
        if self.listener.connect_timeout_secs == Some(0) {
            return Err(SettingsError::Invalid(
                "listener.connect_timeout_secs must be positive".to_string(),
            ));
        }
        if self.dns.cache_cleanup_period_secs == Some(0) {
            return Err(SettingsError::Invalid(
                "dns.cache_cleanup_period_secs must be positive".to_string(),
            ));
        }
        Ok(())
    }
}

impl ListenerSettings {
    /// Default relay buffer size: 32 KiB per direction.
    pub const DEFAULT_IO_CHUNK_SIZE: usize = 32 * 1024;

    /// Default idle timeout: 5 minutes.
    pub const DEFAULT_IDLE_TIMEOUT: Duration = Duration::from_secs(300);

    /// Default target dial timeout: 30 seconds.
    pub const DEFAULT_CONNECT_TIMEOUT: Duration = Duration::from_secs(30);

    /// Default concurrent connection cap.
    pub const DEFAULT_MAX_CONNECTIONS: usize = 1000;

    /// Effective chunk size after applying the default.
    pub fn effective_io_chunk_size(&self) -> usize {
        self.io_chunk_size.unwrap_or(Self::DEFAULT_IO_CHUNK_SIZE)
    }

    /// Effective idle timeout after applying the default.
    pub fn effective_idle_timeout(&self) -> Duration {
        self.idle_connection_timeout_secs
            .map(Duration::from_secs)
            .unwrap_or(Self::DEFAULT_IDLE_TIMEOUT)
    }

    /// Effective dial timeout after applying the default.
    pub fn effective_connect_timeout(&self) -> Duration {
        self.connect_timeout_secs
            .map(Duration::from_secs)
            .unwrap_or(Self::DEFAULT_CONNECT_TIMEOUT)
    }

    /// Effective connection cap after applying the default.
    pub fn effective_max_connections(&self) -> usize {
        self.max_connections.unwrap_or(Self::DEFAULT_MAX_CONNECTIONS)
    }
}

impl DnsSettings {
    /// Default cache eviction cadence: 30 seconds.
    pub const DEFAULT_CACHE_CLEANUP_PERIOD: Duration = Duration::from_secs(30);

    /// Effective cleanup period after applying the default.
    pub fn effective_cache_cleanup_period(&self) -> Duration {
        self.cache_cleanup_period_secs
            .map(Duration::from_secs)
            .unwrap_or(Self::DEFAULT_CACHE_CLEANUP_PERIOD)
    }
}
