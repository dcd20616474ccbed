//! Runtime configuration
//!
//! Defaults suit a single client session; every field can be overridden from
//! the environment (a `.env` file is honoured).

use crate::sync::conflict::ConflictStrategy;
use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::time::Duration;

const MIN_AUTO_SYNC_SECS: u64 = 1;
const MAX_AUTO_SYNC_SECS: u64 = 86_400;

/// Sync, retry and cache settings
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SyncConfig {
    /// Backend base URL (no trailing slash needed)
    pub api_base_url: String,

    /// Per-request HTTP timeout
    pub request_timeout_secs: u64,

    /// Retries after the first attempt before an operation is FAILED
    pub max_retries: u32,

    /// Backoff: `min(base * 2^retry, max)`
    pub base_delay_ms: u64,
    pub max_delay_ms: u64,

    /// Auto-sync timer period
    pub auto_sync_interval_secs: u64,

    /// Aggregate size budget for the memory cache tier
    pub cache_max_bytes: u64,

    /// TTL used when neither the caller nor the key policy sets one
    pub cache_default_ttl_secs: u64,

    pub conflict_strategy: ConflictStrategy,

    /// SQLite file backing the durable store
    pub db_path: PathBuf,
}

impl Default for SyncConfig {
    fn default() -> Self {
        Self {
            api_base_url: "http://localhost:8000".to_string(),
            request_timeout_secs: 15,
            max_retries: 3,
            base_delay_ms: 1_000,
            max_delay_ms: 60_000,
            auto_sync_interval_secs: 30,
            cache_max_bytes: 5 * 1024 * 1024,
            cache_default_ttl_secs: 300,
            conflict_strategy: ConflictStrategy::ServerWins,
            db_path: default_db_path(),
        }
    }
}

impl SyncConfig {
    /// Load `.env`, apply `QUIZSYNC_*` overrides and validate
    pub fn from_env() -> Result<Self, ConfigError> {
        dotenvy::dotenv().ok();
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Build a config from an arbitrary variable source
    pub fn from_lookup<F>(lookup: F) -> Result<Self, ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let mut config = Self::default();

        if let Some(url) = lookup("QUIZSYNC_API_URL") {
            config.api_base_url = url;
        }
        if let Some(v) = lookup("QUIZSYNC_REQUEST_TIMEOUT_SECS") {
            config.request_timeout_secs = parse_var("QUIZSYNC_REQUEST_TIMEOUT_SECS", &v)?;
        }
        if let Some(v) = lookup("QUIZSYNC_MAX_RETRIES") {
            config.max_retries = parse_var("QUIZSYNC_MAX_RETRIES", &v)?;
        }
        if let Some(v) = lookup("QUIZSYNC_BASE_DELAY_MS") {
            config.base_delay_ms = parse_var("QUIZSYNC_BASE_DELAY_MS", &v)?;
        }
        if let Some(v) = lookup("QUIZSYNC_MAX_DELAY_MS") {
            config.max_delay_ms = parse_var("QUIZSYNC_MAX_DELAY_MS", &v)?;
        }
        if let Some(v) = lookup("QUIZSYNC_AUTO_SYNC_SECS") {
            config.auto_sync_interval_secs = parse_var("QUIZSYNC_AUTO_SYNC_SECS", &v)?;
        }
        if let Some(v) = lookup("QUIZSYNC_CACHE_MAX_BYTES") {
            config.cache_max_bytes = parse_var("QUIZSYNC_CACHE_MAX_BYTES", &v)?;
        }
        if let Some(v) = lookup("QUIZSYNC_CACHE_TTL_SECS") {
            config.cache_default_ttl_secs = parse_var("QUIZSYNC_CACHE_TTL_SECS", &v)?;
        }
        if let Some(v) = lookup("QUIZSYNC_CONFLICT_STRATEGY") {
            config.conflict_strategy = ConflictStrategy::from_str(&v)
                .map_err(|e| ConfigError::InvalidValue("QUIZSYNC_CONFLICT_STRATEGY".to_string(), e))?;
        }
        if let Some(path) = lookup("QUIZSYNC_DB_PATH") {
            config.db_path = PathBuf::from(path);
        }

        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.api_base_url.trim().is_empty() {
            return Err(ConfigError::Invalid("api_base_url must not be empty".to_string()));
        }
        if self.request_timeout_secs == 0 {
            return Err(ConfigError::Invalid("request_timeout_secs must be positive".to_string()));
        }
        if self.base_delay_ms > self.max_delay_ms {
            return Err(ConfigError::Invalid(format!(
                "base_delay_ms ({}) exceeds max_delay_ms ({})",
                self.base_delay_ms, self.max_delay_ms
            )));
        }
        if !(MIN_AUTO_SYNC_SECS..=MAX_AUTO_SYNC_SECS).contains(&self.auto_sync_interval_secs) {
            return Err(ConfigError::Invalid(format!(
                "auto_sync_interval_secs must be {}-{}, got {}",
                MIN_AUTO_SYNC_SECS, MAX_AUTO_SYNC_SECS, self.auto_sync_interval_secs
            )));
        }
        if self.cache_max_bytes == 0 {
            return Err(ConfigError::Invalid("cache_max_bytes must be positive".to_string()));
        }
        Ok(())
    }

    pub fn request_timeout(&self) -> Duration {
        Duration::from_secs(self.request_timeout_secs)
    }

    pub fn base_delay(&self) -> Duration {
        Duration::from_millis(self.base_delay_ms)
    }

    pub fn max_delay(&self) -> Duration {
        Duration::from_millis(self.max_delay_ms)
    }

    pub fn auto_sync_interval(&self) -> Duration {
        Duration::from_secs(self.auto_sync_interval_secs)
    }

    pub fn cache_default_ttl(&self) -> Duration {
        Duration::from_secs(self.cache_default_ttl_secs)
    }
}

fn parse_var<T: std::str::FromStr>(name: &str, raw: &str) -> Result<T, ConfigError> {
    raw.trim()
        .parse()
        .map_err(|_| ConfigError::InvalidValue(name.to_string(), raw.to_string()))
}

fn default_db_path() -> PathBuf {
    directories::ProjectDirs::from("app", "fsrs-quiz", "quizsync")
        .map(|dirs| dirs.data_dir().join("quizsync.db"))
        .unwrap_or_else(|| PathBuf::from("quizsync.db"))
}

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("Invalid configuration: {0}")]
    Invalid(String),

    #[error("Invalid value for {0}: {1}")]
    InvalidValue(String, String),
}
