//! Configuration module for telemon
//!
//! This module handles engine configuration including:
//! - Buffer limits and archive clipping
//! - Scheduler intervals (retry, deferred resolution, timer tick)
//! - Logging filter and optional log directory
//! - Location of the point definition file
//!
//! Point definition records themselves live in [`points`].
//!
//! # App Data Location
//!
//! The default configuration file is stored in the platform-appropriate location:
//! - **Linux**: `~/.local/share/io.telemon.engine/`
//! - **macOS**: `~/Library/Application Support/io.telemon.engine/`
//! - **Windows**: `%APPDATA%\io.telemon.engine\`
//!
//! # Example
//!
//! ```ignore
//! use telemon::config::EngineConfig;
//!
//! let config = EngineConfig::load("telemon.toml")?;
//! assert_eq!(config.scheduler.retry_interval_ms, 1000);
//! config.save("copy.toml")?;
//! ```

pub mod points;

use crate::error::{EngineError, Result};
use crate::types::Period;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

/// Application identifier for data directories
pub const APP_ID: &str = "io.telemon.engine";

/// Default configuration filename inside the app data directory
pub const CONFIG_FILE: &str = "telemon.toml";

/// Retry interval after a collection produced no valid data
pub const DEFAULT_RETRY_INTERVAL_MS: u64 = 1000;

/// Poll interval of deferred cross-point subscription
pub const DEFAULT_RESOLUTION_INTERVAL_MS: u64 = 500;

/// Tick of the shared timer facility in the daemon
pub const DEFAULT_TIMER_RESOLUTION_MS: u64 = 50;

/// Nested fan-out depth before a fire is dropped
pub const DEFAULT_MAX_FIRE_DEPTH: usize = 32;

/// Samples kept per point in the buffer
pub const DEFAULT_BUFFER_MAX_COUNT: usize = 1000;

/// Age limit of buffered samples, relative to the newest
pub const DEFAULT_BUFFER_MAX_AGE_SECS: u64 = 3600;

/// Records returned by one archive extract before clipping
pub const DEFAULT_ARCHIVE_MAX_RECORDS: usize = 50_000;

/// Default tracing filter when `RUST_LOG` is unset
pub const DEFAULT_LOG_FILTER: &str = "info,telemon=debug";

// ==================== App Data Directory ====================

/// Get the application data directory path
pub fn app_data_dir() -> Option<PathBuf> {
    dirs_next::data_dir().map(|p| p.join(APP_ID))
}

/// Ensure the app data directory exists
pub fn ensure_app_data_dir() -> Result<PathBuf> {
    let dir = app_data_dir().ok_or_else(|| {
        EngineError::Config("Could not determine app data directory".to_string())
    })?;

    if !dir.exists() {
        std::fs::create_dir_all(&dir).map_err(|e| {
            EngineError::Config(format!("Failed to create app data directory: {}", e))
        })?;
    }

    Ok(dir)
}

/// Path of the default configuration file
pub fn default_config_path() -> Option<PathBuf> {
    app_data_dir().map(|p| p.join(CONFIG_FILE))
}

// ==================== Engine Config ====================

/// Top-level engine configuration
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct EngineConfig {
    pub buffer: BufferConfig,
    pub scheduler: SchedulerConfig,
    pub archive: ArchiveConfig,
    pub logging: LoggingConfig,
    pub points: PointsConfig,
}

impl EngineConfig {
    /// Load a configuration file. `.json` files are parsed as JSON, anything else as TOML.
    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let content = std::fs::read_to_string(path).map_err(|e| {
            EngineError::Config(format!("Failed to read config {:?}: {}", path, e))
        })?;

        let is_json = path
            .extension()
            .and_then(|e| e.to_str())
            .is_some_and(|e| e.eq_ignore_ascii_case("json"));

        if is_json {
            serde_json::from_str(&content).map_err(|e| {
                EngineError::Config(format!("Failed to parse config {:?}: {}", path, e))
            })
        } else {
            toml::from_str(&content).map_err(|e| {
                EngineError::Config(format!("Failed to parse config {:?}: {}", path, e))
            })
        }
    }

    /// Load a configuration file, returning defaults on any error
    pub fn load_or_default(path: impl AsRef<Path>) -> Self {
        Self::load(path).unwrap_or_else(|e| {
            tracing::warn!("Failed to load config, using defaults: {}", e);
            Self::default()
        })
    }

    /// Save as TOML
    pub fn save(&self, path: impl AsRef<Path>) -> Result<()> {
        let path = path.as_ref();
        let content = toml::to_string_pretty(self)
            .map_err(|e| EngineError::Serialization(format!("Failed to serialize config: {}", e)))?;

        std::fs::write(path, content).map_err(|e| {
            EngineError::Config(format!("Failed to write config {:?}: {}", path, e))
        })
    }
}

/// Point buffer limits
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct BufferConfig {
    pub max_count: usize,
    pub max_age_secs: u64,
}

impl BufferConfig {
    pub fn max_age(&self) -> Period {
        Period::seconds(self.max_age_secs.min(i64::MAX as u64) as i64)
    }
}

impl Default for BufferConfig {
    fn default() -> Self {
        Self {
            max_count: DEFAULT_BUFFER_MAX_COUNT,
            max_age_secs: DEFAULT_BUFFER_MAX_AGE_SECS,
        }
    }
}

/// Intervals used by collection scheduling and deferred work
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SchedulerConfig {
    /// Fallback interval after a null result, capped by the point period
    pub retry_interval_ms: u64,
    /// Poll interval for resolving cross-point listener targets
    pub resolution_interval_ms: u64,
    /// Tick of the daemon's timer driver
    pub timer_resolution_ms: u64,
    /// Depth limit for nested fan-out
    pub max_fire_depth: usize,
    /// A collection that has not reported back after this long is abandoned
    pub collect_timeout_ms: u64,
}

impl SchedulerConfig {
    pub fn retry_interval(&self) -> Period {
        millis(self.retry_interval_ms)
    }

    pub fn resolution_interval(&self) -> Period {
        millis(self.resolution_interval_ms)
    }

    pub fn timer_resolution(&self) -> std::time::Duration {
        std::time::Duration::from_millis(self.timer_resolution_ms.max(1))
    }

    pub fn collect_timeout(&self) -> Period {
        millis(self.collect_timeout_ms)
    }
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            retry_interval_ms: DEFAULT_RETRY_INTERVAL_MS,
            resolution_interval_ms: DEFAULT_RESOLUTION_INTERVAL_MS,
            timer_resolution_ms: DEFAULT_TIMER_RESOLUTION_MS,
            max_fire_depth: DEFAULT_MAX_FIRE_DEPTH,
            collect_timeout_ms: default_collect_timeout_ms(),
        }
    }
}

fn default_collect_timeout_ms() -> u64 {
    DEFAULT_RETRY_INTERVAL_MS * 10
}

fn millis(ms: u64) -> Period {
    Period::milliseconds(ms.min(i64::MAX as u64) as i64)
}

/// Archive settings
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ArchiveConfig {
    pub max_records: usize,
}

impl Default for ArchiveConfig {
    fn default() -> Self {
        Self {
            max_records: DEFAULT_ARCHIVE_MAX_RECORDS,
        }
    }
}

/// Logging settings
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct LoggingConfig {
    /// `EnvFilter` directive used when `RUST_LOG` is unset
    pub filter: String,
    /// When set, logs are also written to a daily-rolling file here
    #[serde(skip_serializing_if = "Option::is_none")]
    pub directory: Option<PathBuf>,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            filter: DEFAULT_LOG_FILTER.to_string(),
            directory: None,
        }
    }
}

/// Where point definitions come from
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct PointsConfig {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub definitions: Option<PathBuf>,
}
