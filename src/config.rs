//! Stream client configuration.
//!
//! Stored as JSON under the `stream_config` settings key; every field has a
//! serde default so older or partial documents still load. Environment
//! variables (`AGENTSTREAM_*`) override stored values at load time.

use std::time::Duration;

use chrono::Utc;
use serde::{Deserialize, Serialize};

use crate::bus::{DEFAULT_CHUNK_SIZE, DEFAULT_DEBOUNCE};
use crate::connection::{
    BackoffPolicy, DEFAULT_JITTER, DEFAULT_MAX_RECONNECT_ATTEMPTS, RECONNECT_BASE_DELAY_MS,
    RECONNECT_MAX_DELAY_MS,
};
use crate::db::{queries, Database, DbError};
use crate::store::{PersistLimits, StoreCapacity};

pub const STREAM_CONFIG_SETTING_KEY: &str = "stream_config";

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("invalid stream configuration: {0}")]
    Invalid(String),
    #[error("failed to parse stream configuration: {0}")]
    Parse(#[from] serde_json::Error),
    #[error(transparent)]
    Db(#[from] DbError),
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StreamConfig {
    #[serde(default = "default_base_url")]
    pub base_url: String,
    /// Used when a request does not name a model.
    #[serde(default)]
    pub default_model: Option<String>,
    #[serde(default = "default_max_reconnect_attempts")]
    pub max_reconnect_attempts: u32,
    #[serde(default = "default_reconnect_base_delay_ms")]
    pub reconnect_base_delay_ms: u64,
    #[serde(default = "default_reconnect_max_delay_ms")]
    pub reconnect_max_delay_ms: u64,
    #[serde(default = "default_reconnect_jitter")]
    pub reconnect_jitter: f64,
    #[serde(default = "default_heartbeat_interval_ms")]
    pub heartbeat_interval_ms: u64,
    #[serde(default = "default_heartbeat_timeout_ms")]
    pub heartbeat_timeout_ms: u64,
    #[serde(default = "default_connect_timeout_ms")]
    pub connect_timeout_ms: u64,
    #[serde(default = "default_debounce_ms")]
    pub debounce_ms: u64,
    #[serde(default = "default_flush_chunk_size")]
    pub flush_chunk_size: usize,
    #[serde(default)]
    pub capacity: StoreCapacity,
    #[serde(default)]
    pub persistence: PersistLimits,
}

impl Default for StreamConfig {
    fn default() -> Self {
        Self {
            base_url: default_base_url(),
            default_model: None,
            max_reconnect_attempts: default_max_reconnect_attempts(),
            reconnect_base_delay_ms: default_reconnect_base_delay_ms(),
            reconnect_max_delay_ms: default_reconnect_max_delay_ms(),
            reconnect_jitter: default_reconnect_jitter(),
            heartbeat_interval_ms: default_heartbeat_interval_ms(),
            heartbeat_timeout_ms: default_heartbeat_timeout_ms(),
            connect_timeout_ms: default_connect_timeout_ms(),
            debounce_ms: default_debounce_ms(),
            flush_chunk_size: default_flush_chunk_size(),
            capacity: StoreCapacity::default(),
            persistence: PersistLimits::default(),
        }
    }
}

impl StreamConfig {
    pub fn new(base_url: impl Into<String>) -> Self {
        Self {
            base_url: base_url.into(),
            ..Self::default()
        }
    }

    pub fn backoff(&self) -> BackoffPolicy {
        BackoffPolicy {
            base_delay: Duration::from_millis(self.reconnect_base_delay_ms),
            max_delay: Duration::from_millis(self.reconnect_max_delay_ms),
            max_attempts: self.max_reconnect_attempts,
            jitter: self.reconnect_jitter,
        }
    }

    pub fn heartbeat_interval(&self) -> Duration {
        Duration::from_millis(self.heartbeat_interval_ms)
    }

    pub fn heartbeat_timeout(&self) -> Duration {
        Duration::from_millis(self.heartbeat_timeout_ms)
    }

    pub fn connect_timeout(&self) -> Duration {
        Duration::from_millis(self.connect_timeout_ms)
    }

    pub fn debounce(&self) -> Duration {
        Duration::from_millis(self.debounce_ms)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        let base = self.base_url.trim();
        if !(base.starts_with("http://") || base.starts_with("https://")) {
            return Err(ConfigError::Invalid(format!(
                "base_url must be an http(s) URL, got '{base}'"
            )));
        }
        if self.heartbeat_interval_ms == 0 {
            return Err(ConfigError::Invalid(
                "heartbeat_interval_ms must be greater than 0".to_string(),
            ));
        }
        if self.heartbeat_timeout_ms < self.heartbeat_interval_ms {
            return Err(ConfigError::Invalid(
                "heartbeat_timeout_ms must not be shorter than heartbeat_interval_ms".to_string(),
            ));
        }
        if self.reconnect_max_delay_ms < self.reconnect_base_delay_ms {
            return Err(ConfigError::Invalid(
                "reconnect_max_delay_ms must not be shorter than reconnect_base_delay_ms".to_string(),
            ));
        }
        if !(0.0..=1.0).contains(&self.reconnect_jitter) {
            return Err(ConfigError::Invalid(
                "reconnect_jitter must be within 0.0..=1.0".to_string(),
            ));
        }
        if self.flush_chunk_size == 0 {
            return Err(ConfigError::Invalid(
                "flush_chunk_size must be greater than 0".to_string(),
            ));
        }
        Ok(())
    }

    pub fn apply_env_overrides(&mut self) {
        self.apply_overrides_from(|key| std::env::var(key).ok());
    }

    /// Apply `AGENTSTREAM_*` overrides from an arbitrary lookup. Unparseable
    /// values are ignored with a warning.
    pub fn apply_overrides_from<F>(&mut self, lookup: F)
    where
        F: Fn(&str) -> Option<String>,
    {
        let lookup = |key: &str| lookup(key).filter(|value| !value.trim().is_empty());

        if let Some(url) = lookup("AGENTSTREAM_BASE_URL") {
            self.base_url = url.trim().to_string();
        }
        if let Some(model) = lookup("AGENTSTREAM_MODEL") {
            self.default_model = Some(model.trim().to_string());
        }
        override_parsed(&lookup, "AGENTSTREAM_MAX_RECONNECT_ATTEMPTS", &mut self.max_reconnect_attempts);
        override_parsed(&lookup, "AGENTSTREAM_RECONNECT_BASE_DELAY_MS", &mut self.reconnect_base_delay_ms);
        override_parsed(&lookup, "AGENTSTREAM_RECONNECT_MAX_DELAY_MS", &mut self.reconnect_max_delay_ms);
        override_parsed(&lookup, "AGENTSTREAM_HEARTBEAT_INTERVAL_MS", &mut self.heartbeat_interval_ms);
        override_parsed(&lookup, "AGENTSTREAM_HEARTBEAT_TIMEOUT_MS", &mut self.heartbeat_timeout_ms);
        override_parsed(&lookup, "AGENTSTREAM_CONNECT_TIMEOUT_MS", &mut self.connect_timeout_ms);
    }
}

fn override_parsed<T, F>(lookup: &F, key: &str, target: &mut T)
where
    T: std::str::FromStr,
    F: Fn(&str) -> Option<String>,
{
    if let Some(raw) = lookup(key) {
        match raw.trim().parse::<T>() {
            Ok(value) => *target = value,
            Err(_) => tracing::warn!("ignoring {key}={raw}: not a valid number"),
        }
    }
}

/// Load the stored configuration (or defaults), then apply env overrides.
pub fn load_stream_config(db: &Database) -> Result<StreamConfig, ConfigError> {
    let mut config = match queries::get_setting(db, STREAM_CONFIG_SETTING_KEY)? {
        Some(raw) => serde_json::from_str::<StreamConfig>(&raw)?,
        None => StreamConfig::default(),
    };
    config.apply_env_overrides();
    config.validate()?;
    Ok(config)
}

pub fn save_stream_config(db: &Database, config: &StreamConfig) -> Result<(), ConfigError> {
    config.validate()?;
    let value = serde_json::to_string(config)?;
    queries::upsert_setting(
        db,
        STREAM_CONFIG_SETTING_KEY,
        &value,
        &Utc::now().to_rfc3339(),
    )?;
    Ok(())
}

fn default_base_url() -> String {
    "http://localhost:8000/api/v1/stream".to_string()
}

fn default_max_reconnect_attempts() -> u32 {
    DEFAULT_MAX_RECONNECT_ATTEMPTS
}

fn default_reconnect_base_delay_ms() -> u64 {
    RECONNECT_BASE_DELAY_MS
}

fn default_reconnect_max_delay_ms() -> u64 {
    RECONNECT_MAX_DELAY_MS
}

fn default_reconnect_jitter() -> f64 {
    DEFAULT_JITTER
}

fn default_heartbeat_interval_ms() -> u64 {
    30_000
}

fn default_heartbeat_timeout_ms() -> u64 {
    120_000
}

fn default_connect_timeout_ms() -> u64 {
    10_000
}

fn default_debounce_ms() -> u64 {
    DEFAULT_DEBOUNCE.as_millis() as u64
}

fn default_flush_chunk_size() -> usize {
    DEFAULT_CHUNK_SIZE
}
