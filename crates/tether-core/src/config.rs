//! Configuration system for Tether.
//!
//! Resolution order: environment variables → config file → defaults.
//!
//! Config file location:
//!   1. $TETHER_CONFIG (explicit override)
//!   2. $XDG_CONFIG_HOME/tether/config.toml
//!   3. ~/.config/tether/config.toml

use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::throughput::DEFAULT_INTERVAL;

/// Floor applied when `min_sessions` is configured as 0.
pub const DEFAULT_MIN_SESSIONS: u64 = 1;
/// Ceiling applied when `max_speed` is configured as 0.
pub const DEFAULT_MAX_SPEED: u64 = 15;

/// Top-level configuration.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct TetherConfig {
    pub pool: PoolConfig,
    pub session: SessionConfig,
    pub dial: DialConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct PoolConfig {
    /// Sessions the pool keeps open even when idle. 0 = default (1).
    pub min_sessions: u64,
    /// Units/second on the least-busy session above which the pool grows.
    /// 0 = default (15).
    pub max_speed: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SessionConfig {
    /// Outbound queue capacity. 0 = synchronous send through the codec.
    pub send_queue_size: usize,
    /// Throughput sampling interval. 0 = default (10).
    pub throughput_interval_secs: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct DialConfig {
    pub connect_timeout_ms: u64,
}

// ── Defaults ──────────────────────────────────────────────────────────────────

impl Default for PoolConfig {
    fn default() -> Self {
        Self {
            min_sessions: DEFAULT_MIN_SESSIONS,
            max_speed: DEFAULT_MAX_SPEED,
        }
    }
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            send_queue_size: 0,
            throughput_interval_secs: DEFAULT_INTERVAL.as_secs(),
        }
    }
}

impl Default for DialConfig {
    fn default() -> Self {
        Self {
            connect_timeout_ms: 5_000,
        }
    }
}

// ── Derived settings ──────────────────────────────────────────────────────────

impl PoolConfig {
    /// `(min_sessions, max_speed)` with zeroes replaced by their defaults.
    pub fn normalized(&self) -> (u64, u64) {
        let min = if self.min_sessions == 0 { DEFAULT_MIN_SESSIONS } else { self.min_sessions };
        let max = if self.max_speed == 0 { DEFAULT_MAX_SPEED } else { self.max_speed };
        (min, max)
    }
}

impl SessionConfig {
    pub fn throughput_interval(&self) -> Duration {
        match self.throughput_interval_secs {
            0 => DEFAULT_INTERVAL,
            secs => Duration::from_secs(secs),
        }
    }
}

impl DialConfig {
    pub fn connect_timeout(&self) -> Duration {
        Duration::from_millis(self.connect_timeout_ms)
    }
}

// ── Path helpers ──────────────────────────────────────────────────────────────

fn config_dir() -> PathBuf {
    std::env::var("XDG_CONFIG_HOME")
        .map(PathBuf::from)
        .unwrap_or_else(|_| dirs_or_home().join(".config"))
        .join("tether")
}

fn dirs_or_home() -> PathBuf {
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
}

// ── Loading ───────────────────────────────────────────────────────────────────

impl TetherConfig {
    /// Load config: env vars → file → defaults.
    pub fn load() -> Result<Self, ConfigError> {
        let mut config = Self::load_file(&Self::file_path())?;
        config.apply_env_overrides();
        Ok(config)
    }

    /// Read one config file, falling back to defaults if it does not exist.
    /// No env overrides are applied.
    pub fn load_file(path: &Path) -> Result<Self, ConfigError> {
        if !path.exists() {
            return Ok(TetherConfig::default());
        }
        let text = std::fs::read_to_string(path)
            .map_err(|e| ConfigError::ReadFailed(path.to_path_buf(), e))?;
        toml::from_str(&text).map_err(|e| ConfigError::ParseFailed(path.to_path_buf(), e))
    }

    /// Config file path.
    pub fn file_path() -> PathBuf {
        std::env::var("TETHER_CONFIG")
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
            let text = toml::to_string_pretty(&TetherConfig::default())
                .map_err(ConfigError::SerializeFailed)?;
            std::fs::write(&path, text).map_err(|e| ConfigError::WriteFailed(path.clone(), e))?;
        }
        Ok(path)
    }

    /// Apply TETHER_* env var overrides.
    fn apply_env_overrides(&mut self) {
        self.apply_overrides(|key| std::env::var(key).ok());
    }

    fn apply_overrides(&mut self, lookup: impl Fn(&str) -> Option<String>) {
        fn parsed<T: std::str::FromStr>(v: Option<String>) -> Option<T> {
            v.and_then(|v| v.trim().parse().ok())
        }

        if let Some(v) = parsed(lookup("TETHER_POOL__MIN_SESSIONS")) {
            self.pool.min_sessions = v;
        }
        if let Some(v) = parsed(lookup("TETHER_POOL__MAX_SPEED")) {
            self.pool.max_speed = v;
        }
        if let Some(v) = parsed(lookup("TETHER_SESSION__SEND_QUEUE_SIZE")) {
            self.session.send_queue_size = v;
        }
        if let Some(v) = parsed(lookup("TETHER_SESSION__THROUGHPUT_INTERVAL_SECS")) {
            self.session.throughput_interval_secs = v;
        }
        if let Some(v) = parsed(lookup("TETHER_DIAL__CONNECT_TIMEOUT_MS")) {
            self.dial.connect_timeout_ms = v;
        }
    }
}
