//! Engine and database configuration.
//!
//! Values come from the process environment (`CATALOGSYNC_*`, `DATABASE_URL`),
//! with `.env` support. Unset variables fall back to the defaults below; set
//! but unparsable ones are an error rather than silently ignored.

use std::time::Duration;

use thiserror::Error;

use crate::retry::{BackoffStrategy, RetryPolicy};

/// Rows processed between checkpoints (pause/cancel checks, counter saves).
pub const DEFAULT_BATCH_SIZE: usize = 50;

/// Per storage call.
pub const DEFAULT_OP_TIMEOUT_MS: u64 = 5_000;

pub const DEFAULT_MAX_RETRIES: u32 = 3;

pub const DEFAULT_RETRY_BASE_DELAY_MS: u64 = 500;

pub const DEFAULT_RETRY_MAX_DELAY_MS: u64 = 30_000;

/// How often a paused run re-checks whether it was resumed or cancelled.
pub const DEFAULT_PAUSE_POLL_MS: u64 = 250;

pub const DEFAULT_SYNC_BATCH_LIMIT: usize = 100;

pub const DEFAULT_SYNC_POLL_MS: u64 = 5_000;

pub const DEFAULT_DATABASE_URL: &str = "postgres://localhost/catalogsync";

pub const DEFAULT_DATABASE_MAX_CONNECTIONS: u32 = 10;

pub const DEFAULT_DATABASE_ACQUIRE_TIMEOUT_MS: u64 = 5_000;

#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum ConfigError {
    #[error("{key}: cannot parse '{value}': {reason}")]
    Invalid {
        key: String,
        value: String,
        reason: String,
    },
    #[error("{key}: {reason}")]
    OutOfRange { key: String, reason: String },
}

#[derive(Debug, Clone, PartialEq)]
pub struct EngineConfig {
    pub batch_size: usize,
    pub op_timeout: Duration,
    pub max_retries: u32,
    pub retry_base_delay: Duration,
    pub retry_max_delay: Duration,
    pub retry_strategy: BackoffStrategy,
    pub pause_poll_interval: Duration,
    pub sync_batch_limit: usize,
    pub sync_poll_interval: Duration,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            batch_size: DEFAULT_BATCH_SIZE,
            op_timeout: Duration::from_millis(DEFAULT_OP_TIMEOUT_MS),
            max_retries: DEFAULT_MAX_RETRIES,
            retry_base_delay: Duration::from_millis(DEFAULT_RETRY_BASE_DELAY_MS),
            retry_max_delay: Duration::from_millis(DEFAULT_RETRY_MAX_DELAY_MS),
            retry_strategy: BackoffStrategy::Exponential,
            pause_poll_interval: Duration::from_millis(DEFAULT_PAUSE_POLL_MS),
            sync_batch_limit: DEFAULT_SYNC_BATCH_LIMIT,
            sync_poll_interval: Duration::from_millis(DEFAULT_SYNC_POLL_MS),
        }
    }
}

impl EngineConfig {
    pub fn from_env() -> Result<Self, ConfigError> {
        dotenvy::dotenv().ok();
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Build from an arbitrary key lookup (the environment, a map in tests).
    pub fn from_lookup<F>(lookup: F) -> Result<Self, ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let defaults = Self::default();
        let config = Self {
            batch_size: read(&lookup, "CATALOGSYNC_BATCH_SIZE", defaults.batch_size)?,
            op_timeout: read_millis(&lookup, "CATALOGSYNC_OP_TIMEOUT_MS", defaults.op_timeout)?,
            max_retries: read(&lookup, "CATALOGSYNC_MAX_RETRIES", defaults.max_retries)?,
            retry_base_delay: read_millis(&lookup, "CATALOGSYNC_RETRY_BASE_DELAY_MS", defaults.retry_base_delay)?,
            retry_max_delay: read_millis(&lookup, "CATALOGSYNC_RETRY_MAX_DELAY_MS", defaults.retry_max_delay)?,
            retry_strategy: read(&lookup, "CATALOGSYNC_RETRY_STRATEGY", defaults.retry_strategy)?,
            pause_poll_interval: read_millis(&lookup, "CATALOGSYNC_PAUSE_POLL_MS", defaults.pause_poll_interval)?,
            sync_batch_limit: read(&lookup, "CATALOGSYNC_SYNC_BATCH_LIMIT", defaults.sync_batch_limit)?,
            sync_poll_interval: read_millis(&lookup, "CATALOGSYNC_SYNC_POLL_MS", defaults.sync_poll_interval)?,
        };
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.batch_size == 0 {
            return Err(out_of_range("CATALOGSYNC_BATCH_SIZE", "must be greater than 0"));
        }
        if self.op_timeout.is_zero() {
            return Err(out_of_range("CATALOGSYNC_OP_TIMEOUT_MS", "must be greater than 0"));
        }
        if self.retry_base_delay > self.retry_max_delay {
            return Err(out_of_range(
                "CATALOGSYNC_RETRY_BASE_DELAY_MS",
                "cannot exceed CATALOGSYNC_RETRY_MAX_DELAY_MS",
            ));
        }
        if self.pause_poll_interval.is_zero() {
            return Err(out_of_range("CATALOGSYNC_PAUSE_POLL_MS", "must be greater than 0"));
        }
        Ok(())
    }

    pub fn retry_policy(&self) -> RetryPolicy {
        RetryPolicy {
            max_retries: self.max_retries,
            base_delay: self.retry_base_delay,
            max_delay: self.retry_max_delay,
            strategy: self.retry_strategy,
            ..RetryPolicy::default()
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DatabaseConfig {
    pub url: String,
    pub max_connections: u32,
    pub acquire_timeout: Duration,
}

impl Default for DatabaseConfig {
    fn default() -> Self {
        Self {
            url: DEFAULT_DATABASE_URL.to_string(),
            max_connections: DEFAULT_DATABASE_MAX_CONNECTIONS,
            acquire_timeout: Duration::from_millis(DEFAULT_DATABASE_ACQUIRE_TIMEOUT_MS),
        }
    }
}

impl DatabaseConfig {
    pub fn from_env() -> Result<Self, ConfigError> {
        dotenvy::dotenv().ok();
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    pub fn from_lookup<F>(lookup: F) -> Result<Self, ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let defaults = Self::default();
        let config = Self {
            url: lookup("DATABASE_URL")
                .filter(|url| !url.trim().is_empty())
                .unwrap_or(defaults.url),
            max_connections: read(&lookup, "CATALOGSYNC_DB_MAX_CONNECTIONS", defaults.max_connections)?,
            acquire_timeout: read_millis(&lookup, "CATALOGSYNC_DB_ACQUIRE_TIMEOUT_MS", defaults.acquire_timeout)?,
        };
        if config.max_connections == 0 {
            return Err(out_of_range("CATALOGSYNC_DB_MAX_CONNECTIONS", "must be greater than 0"));
        }
        Ok(config)
    }
}

fn read<F, T>(lookup: &F, key: &str, default: T) -> Result<T, ConfigError>
where
    F: Fn(&str) -> Option<String>,
    T: core::str::FromStr,
    T::Err: core::fmt::Display,
{
    match lookup(key) {
        None => Ok(default),
        Some(raw) if raw.trim().is_empty() => Ok(default),
        Some(raw) => raw.trim().parse().map_err(|e: T::Err| ConfigError::Invalid {
            key: key.to_string(),
            value: raw.clone(),
            reason: e.to_string(),
        }),
    }
}

fn read_millis<F>(lookup: &F, key: &str, default: Duration) -> Result<Duration, ConfigError>
where
    F: Fn(&str) -> Option<String>,
{
    let millis = read(lookup, key, default.as_millis() as u64)?;
    Ok(Duration::from_millis(millis))
}

fn out_of_range(key: &str, reason: &str) -> ConfigError {
    ConfigError::OutOfRange {
        key: key.to_string(),
        reason: reason.to_string(),
    }
}
