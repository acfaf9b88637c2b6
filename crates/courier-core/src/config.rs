//! Configuration system for Courier.
//!
//! Resolution order: environment variables → config file → defaults.
//!
//! Config file location:
//!   1. $COURIER_CONFIG (explicit override)
//!   2. $XDG_CONFIG_HOME/courier/config.toml
//!   3. ~/.config/courier/config.toml

use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::time::Duration;

/// Top-level configuration.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct CourierConfig {
    pub pool: PoolConfig,
    pub fast_failure: FastFailureConfig,
    pub correlation: CorrelationConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct PoolConfig {
    /// Parallelism ceiling. Must be positive.
    pub worker_count: usize,
    /// Backlog ceiling. Must be positive.
    pub queue_capacity: usize,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct FastFailureConfig {
    /// Answer queued requests that waited too long with SYSTEM_BUSY.
    pub enabled: bool,
    pub max_queue_wait_ms: u64,
    pub sweep_interval_ms: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct CorrelationConfig {
    /// Timeout for outbound calls that don't pass their own.
    pub default_timeout_ms: u64,
    pub sweep_interval_ms: u64,
}

// ── Defaults ──────────────────────────────────────────────────────────────────

impl Default for PoolConfig {
    fn default() -> Self {
        Self {
            worker_count: std::thread::available_parallelism()
                .map(|n| n.get())
                .unwrap_or(4),
            queue_capacity: 10_000,
        }
    }
}

impl Default for FastFailureConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            max_queue_wait_ms: 200,
            sweep_interval_ms: 10,
        }
    }
}

impl Default for CorrelationConfig {
    fn default() -> Self {
        Self {
            default_timeout_ms: 3_000,
            sweep_interval_ms: 1_000,
        }
    }
}

impl FastFailureConfig {
    pub fn max_queue_wait(&self) -> Duration {
        Duration::from_millis(self.max_queue_wait_ms)
    }

    pub fn sweep_interval(&self) -> Duration {
        Duration::from_millis(self.sweep_interval_ms)
    }
}

impl CorrelationConfig {
    pub fn default_timeout(&self) -> Duration {
        Duration::from_millis(self.default_timeout_ms)
    }

    pub fn sweep_interval(&self) -> Duration {
        Duration::from_millis(self.sweep_interval_ms)
    }
}

// ── Path helpers ──────────────────────────────────────────────────────────────

fn config_dir() -> PathBuf {
    std::env::var("XDG_CONFIG_HOME")
        .map(PathBuf::from)
        .unwrap_or_else(|_| home_dir().join(".config"))
        .join("courier")
}

fn home_dir() -> PathBuf {
    std::env::var("HOME")
        .map(PathBuf::from)
        .unwrap_or_else(|_| PathBuf::from("/tmp"))
}

// ── Errors ────────────────────────────────────────────────────────────────────

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("failed to read {0}: {1}")]
    ReadFailed(PathBuf, std::io::Error),
    #[error("failed to parse {0}: {1}")]
    ParseFailed(PathBuf, toml::de::Error),
    #[error("failed to write {0}: {1}")]
    WriteFailed(PathBuf, std::io::Error),
    #[error("failed to serialize: {0}")]
    SerializeFailed(toml::ser::Error),
    #[error("invalid config: {0} must be positive")]
    NotPositive(&'static str),
}

// ── Loading ───────────────────────────────────────────────────────────────────

impl CourierConfig {
    /// Load config: env vars → file → defaults. The result is validated.
    pub fn load() -> Result<Self, ConfigError> {
        let path = Self::file_path();
        let mut config = if path.exists() {
            let text = std::fs::read_to_string(&path)
                .map_err(|e| ConfigError::ReadFailed(path.clone(), e))?;
            Self::from_toml(&path, &text)?
        } else {
            CourierConfig::default()
        };
        config.apply_env_overrides();
        config.validate()?;
        Ok(config)
    }

    fn from_toml(path: &std::path::Path, text: &str) -> Result<Self, ConfigError> {
        toml::from_str(text).map_err(|e| ConfigError::ParseFailed(path.to_path_buf(), e))
    }

    /// Config file path.
    pub fn file_path() -> PathBuf {
        std::env::var("COURIER_CONFIG")
            .map(PathBuf::from)
            .unwrap_or_else(|_| config_dir().join("config.toml"))
    }

    /// Write default config if none exists. Returns the path.
    pub fn write_default_if_missing() -> Result<PathBuf, ConfigError> {
        let path = Self::file_path();
        if !path.exists() {
            if let Some(parent) = path.parent() {
                std::fs::create_dir_all(parent)
                    .map_err(|e| ConfigError::WriteFailed(path.clone(), e))?;
            }
            let text = toml::to_string_pretty(&CourierConfig::default())
                .map_err(ConfigError::SerializeFailed)?;
            std::fs::write(&path, text).map_err(|e| ConfigError::WriteFailed(path.clone(), e))?;
        }
        Ok(path)
    }

    /// Every count and interval must be positive.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.pool.worker_count == 0 {
            return Err(ConfigError::NotPositive("pool.worker_count"));
        }
        if self.pool.queue_capacity == 0 {
            return Err(ConfigError::NotPositive("pool.queue_capacity"));
        }
        if self.fast_failure.enabled && self.fast_failure.sweep_interval_ms == 0 {
            return Err(ConfigError::NotPositive("fast_failure.sweep_interval_ms"));
        }
        if self.correlation.sweep_interval_ms == 0 {
            return Err(ConfigError::NotPositive("correlation.sweep_interval_ms"));
        }
        Ok(())
    }

    /// Apply COURIER_* env var overrides.
    fn apply_env_overrides(&mut self) {
        self.apply_overrides(|key| std::env::var(key).ok());
    }

    fn apply_overrides(&mut self, lookup: impl Fn(&str) -> Option<String>) {
        if let Some(Ok(n)) = lookup("COURIER_POOL__WORKER_COUNT").map(|v| v.parse()) {
            self.pool.worker_count = n;
        }
        if let Some(Ok(n)) = lookup("COURIER_POOL__QUEUE_CAPACITY").map(|v| v.parse()) {
            self.pool.queue_capacity = n;
        }
        if let Some(v) = lookup("COURIER_FAST_FAILURE__ENABLED") {
            self.fast_failure.enabled = v == "true" || v == "1";
        }
        if let Some(Ok(ms)) = lookup("COURIER_FAST_FAILURE__MAX_QUEUE_WAIT_MS").map(|v| v.parse()) {
            self.fast_failure.max_queue_wait_ms = ms;
        }
    }
}
