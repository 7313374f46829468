//! Configuration module for the SMA-X client
//!
//! [`SmaxConfig`] gathers every tunable of the pipeline, the lazy cache and
//! the session. It can be built in code, or loaded from a TOML or JSON file.
//!
//! # Config Location
//!
//! The default config file lives in the platform-appropriate config directory:
//! - **Linux**: `~/.config/smax-client/config.toml`
//! - **macOS**: `~/Library/Application Support/smax-client/config.toml`
//! - **Windows**: `%APPDATA%\smax-client\config.toml`
//!
//! # Example
//!
//! ```ignore
//! use smax_client::config::{SmaxConfig, RefreshMode};
//!
//! let mut config = SmaxConfig::load_or_default();
//! config.refresh_mode = RefreshMode::Lazy;
//! config.save(SmaxConfig::default_path().unwrap())?;
//! ```

pub mod settings;

pub use settings::*;

use crate::error::{Result, SmaxError};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Application identifier for config directories
pub const APP_ID: &str = "smax-client";

/// Default config filename
pub const CONFIG_FILE: &str = "config.toml";

/// Default limit on outstanding (queued + in flight) pipelined requests
pub const DEFAULT_MAX_QUEUED: usize = 1024;

/// Default maximum number of commands sent in one round trip
pub const DEFAULT_MAX_BATCH_LEN: usize = 256;

/// Default time a blocked enqueue or pipelined read may wait (ms)
pub const DEFAULT_PIPE_READ_TIMEOUT_MS: u64 = 3000;

// ==================== Config Directory ====================

/// Get the configuration directory path
pub fn config_dir() -> Option<PathBuf> {
    dirs_next::config_dir().map(|p| p.join(APP_ID))
}

/// Ensure the configuration directory exists
pub fn ensure_config_dir() -> Result<PathBuf> {
    let dir = config_dir().ok_or_else(|| {
        SmaxError::Config("Could not determine config directory".to_string())
    })?;

    if !dir.exists() {
        std::fs::create_dir_all(&dir).map_err(|e| {
            SmaxError::Config(format!("Failed to create config directory: {}", e))
        })?;
    }

    Ok(dir)
}

/// On-disk encodings understood by [`SmaxConfig::load`] and [`SmaxConfig::save`]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConfigFormat {
    Toml,
    Json,
}

impl ConfigFormat {
    /// Pick a format from the file extension, defaulting to TOML
    pub fn from_path(path: &Path) -> Self {
        match path.extension().and_then(|e| e.to_str()) {
            Some(ext) if ext.eq_ignore_ascii_case("json") => ConfigFormat::Json,
            _ => ConfigFormat::Toml,
        }
    }
}

// ==================== Client Config ====================

/// Client configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SmaxConfig {
    /// Route `queue_*` operations through the background pipeline.
    /// When disabled they become blocking round trips.
    pub pipeline_enabled: bool,

    /// Maximum number of outstanding pipelined requests
    pub max_queued: usize,

    /// Maximum number of commands per round trip
    pub max_batch_len: usize,

    /// What a default enqueue does when the queue is full
    pub queue_full_policy: QueueFullPolicy,

    /// Keep unsent requests across a disconnect and send them after reconnect
    pub restore_queue_on_reconnect: bool,

    /// How the lazy cache reacts to update notifications
    pub refresh_mode: RefreshMode,

    /// Time a blocked enqueue, pipelined read or blocking pull may wait (ms)
    pub pipe_read_timeout_millis: u64,

    /// Hold shares issued while disconnected and send them on reconnect
    pub resilient_shares: bool,
}

impl Default for SmaxConfig {
    fn default() -> Self {
        Self {
            pipeline_enabled: true,
            max_queued: DEFAULT_MAX_QUEUED,
            max_batch_len: DEFAULT_MAX_BATCH_LEN,
            queue_full_policy: QueueFullPolicy::default(),
            restore_queue_on_reconnect: true,
            refresh_mode: RefreshMode::default(),
            pipe_read_timeout_millis: DEFAULT_PIPE_READ_TIMEOUT_MS,
            resilient_shares: false,
        }
    }
}

impl SmaxConfig {
    /// Path of the default config file
    pub fn default_path() -> Option<PathBuf> {
        config_dir().map(|p| p.join(CONFIG_FILE))
    }

    /// Pipelined read timeout as a `Duration`
    pub fn pipe_read_timeout(&self) -> Duration {
        Duration::from_millis(self.pipe_read_timeout_millis)
    }

    /// Check limits for values the pipeline cannot work with
    pub fn validate(&self) -> Result<()> {
        if self.max_queued == 0 {
            return Err(SmaxError::Config("max_queued must be at least 1".to_string()));
        }
        if self.max_batch_len == 0 {
            return Err(SmaxError::Config(
                "max_batch_len must be at least 1".to_string(),
            ));
        }
        if self.pipe_read_timeout_millis == 0 {
            return Err(SmaxError::Config(
                "pipe_read_timeout_millis must be at least 1".to_string(),
            ));
        }
        Ok(())
    }

    /// Parse a config from text in the given format
    pub fn from_str_as(content: &str, format: ConfigFormat) -> Result<Self> {
        let config: Self = match format {
            ConfigFormat::Toml => toml::from_str(content)
                .map_err(|e| SmaxError::Config(format!("Failed to parse config: {}", e)))?,
            ConfigFormat::Json => serde_json::from_str(content)
                .map_err(|e| SmaxError::Config(format!("Failed to parse config: {}", e)))?,
        };
        config.validate()?;
        Ok(config)
    }

    /// Serialize the config in the given format
    pub fn to_string_as(&self, format: ConfigFormat) -> Result<String> {
        match format {
            ConfigFormat::Toml => toml::to_string_pretty(self)
                .map_err(|e| SmaxError::Config(format!("Failed to serialize config: {}", e))),
            ConfigFormat::Json => serde_json::to_string_pretty(self)
                .map_err(|e| SmaxError::Config(format!("Failed to serialize config: {}", e))),
        }
    }

    /// Load a config file; the format follows the file extension
    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let content = std::fs::read_to_string(path)
            .map_err(|e| SmaxError::Config(format!("Failed to read config: {}", e)))?;

        Self::from_str_as(&content, ConfigFormat::from_path(path))
    }

    /// Load the default config file, returning defaults on any error
    pub fn load_or_default() -> Self {
        let Some(path) = Self::default_path() else {
            return Self::default();
        };
        if !path.exists() {
            return Self::default();
        }
        Self::load(&path).unwrap_or_else(|e| {
            tracing::warn!("Failed to load config, using defaults: {}", e);
            Self::default()
        })
    }

    /// Save the config; the format follows the file extension
    pub fn save(&self, path: impl AsRef<Path>) -> Result<()> {
        let path = path.as_ref();
        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() && !parent.exists() {
                std::fs::create_dir_all(parent).map_err(|e| {
                    SmaxError::Config(format!("Failed to create config directory: {}", e))
                })?;
            }
        }

        let content = self.to_string_as(ConfigFormat::from_path(path))?;
        std::fs::write(path, content)
            .map_err(|e| SmaxError::Config(format!("Failed to write config: {}", e)))
    }
}

impl std::fmt::Display for SmaxConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "pipeline={} max_queued={} max_batch={} on_full={} restore_queue={} refresh={} timeout={}ms resilient={}",
            self.pipeline_enabled,
            self.max_queued,
            self.max_batch_len,
            self.queue_full_policy,
            self.restore_queue_on_reconnect,
            self.refresh_mode,
            self.pipe_read_timeout_millis,
            self.resilient_shares
        )
    }
}
