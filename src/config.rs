//! Runtime configuration from environment variables
//!
//! Loaded once at startup (after `dotenv`) with defaults for every key.

use crate::resolver::MAX_RETRIES;
use std::env;
use std::fmt;
use std::str::FromStr;
use std::time::Duration;
use thiserror::Error;

pub const DEFAULT_FEED_URL: &str = "https://api.hypixel.net/v2/skyblock/auctions_ended";
pub const DEFAULT_LOOKUP_URL: &str = "https://sessionserver.mojang.com/session/minecraft/profile";

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("unknown STATE_BACKEND '{0}' (expected sqlite, json, or memory)")]
    UnknownBackend(String),
}

/// Which [`StateStore`](crate::store::StateStore) implementation to use
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StoreBackend {
    Sqlite,
    Json,
    Memory,
}

impl FromStr for StoreBackend {
    type Err = ConfigError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "sqlite" => Ok(StoreBackend::Sqlite),
            "json" | "file" => Ok(StoreBackend::Json),
            "memory" => Ok(StoreBackend::Memory),
            other => Err(ConfigError::UnknownBackend(other.to_string())),
        }
    }
}

impl fmt::Display for StoreBackend {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            StoreBackend::Sqlite => "sqlite",
            StoreBackend::Json => "json",
            StoreBackend::Memory => "memory",
        };
        f.write_str(name)
    }
}

#[derive(Debug, Clone)]
pub struct Config {
    /// Ended-auctions endpoint polled every tick
    pub feed_url: String,

    /// Profile endpoint; the actor id is appended as a path segment
    pub lookup_url: String,

    pub backend: StoreBackend,

    /// Database or JSON file path (ignored by the memory backend)
    pub state_path: String,

    pub tick_interval: Duration,

    pub resolve_interval: Duration,

    /// Per-request timeout for feed and lookup calls
    pub request_timeout: Duration,

    pub max_name_retries: u32,

    pub status_log_interval: Duration,
}

impl Config {
    /// Load configuration from environment variables
    ///
    /// Environment variables:
    /// - `AUCTIONS_FEED_URL` (default: Hypixel `auctions_ended`)
    /// - `NAME_LOOKUP_URL` (default: Mojang session profile)
    /// - `STATE_BACKEND` (default: sqlite)
    /// - `STATE_PATH` (default: auctionflow.db)
    /// - `TICK_INTERVAL_SECS` (default: 60)
    /// - `RESOLVE_INTERVAL_MS` (default: 1000)
    /// - `REQUEST_TIMEOUT_SECS` (default: 10)
    /// - `MAX_NAME_RETRIES` (default: 5)
    /// - `STATUS_LOG_INTERVAL_SECS` (default: 300)
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_vars(|key| env::var(key).ok())
    }

    pub fn from_vars<F>(get: F) -> Result<Self, ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let backend = match get("STATE_BACKEND") {
            Some(raw) => raw.parse()?,
            None => StoreBackend::Sqlite,
        };

        Ok(Self {
            feed_url: get("AUCTIONS_FEED_URL").unwrap_or_else(|| DEFAULT_FEED_URL.to_string()),
            lookup_url: get("NAME_LOOKUP_URL").unwrap_or_else(|| DEFAULT_LOOKUP_URL.to_string()),
            backend,
            state_path: get("STATE_PATH").unwrap_or_else(|| "auctionflow.db".to_string()),
            tick_interval: Duration::from_secs(parse_nonzero_or(&get, "TICK_INTERVAL_SECS", 60)),
            resolve_interval: Duration::from_millis(parse_nonzero_or(
                &get,
                "RESOLVE_INTERVAL_MS",
                1_000,
            )),
            request_timeout: Duration::from_secs(parse_nonzero_or(&get, "REQUEST_TIMEOUT_SECS", 10)),
            max_name_retries: parse_or(&get, "MAX_NAME_RETRIES", MAX_RETRIES),
            status_log_interval: Duration::from_secs(parse_nonzero_or(
                &get,
                "STATUS_LOG_INTERVAL_SECS",
                300,
            )),
        })
    }
}

fn parse_or<F, T>(get: &F, key: &str, default: T) -> T
where
    F: Fn(&str) -> Option<String>,
    T: FromStr + fmt::Display,
{
    match get(key) {
        Some(raw) => raw.trim().parse().unwrap_or_else(|_| {
            log::warn!("⚠️  Invalid {}={:?}, using default {}", key, raw, default);
            default
        }),
        None => default,
    }
}

/// Like [`parse_or`], but zero also falls back: the timers and request
/// timeouts built from these values need a non-zero period.
fn parse_nonzero_or<F>(get: &F, key: &str, default: u64) -> u64
where
    F: Fn(&str) -> Option<String>,
{
    match parse_or(get, key, default) {
        0 => {
            log::warn!("⚠️  {}=0 is not allowed, using default {}", key, default);
            default
        }
        value => value,
    }
}
