//! Runtime configuration from environment variables (`.env` is loaded first)

use anyhow::{Context, Result};
use engine::api::binance::DEFAULT_BASE_URL;
use engine::FetchConfig;
use std::str::FromStr;
use std::time::Duration;

const DEFAULT_DB_PATH: &str = "data/backtests.db";

#[derive(Debug, Clone)]
pub struct AppConfig {
    pub db_path: String,
    pub binance_base_url: String,
    pub http_timeout: Duration,
    pub fetch: FetchConfig,
}

impl AppConfig {
    pub fn from_env() -> Result<Self> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Build from any key lookup, so tests don't have to touch the process env
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self> {
        let defaults = FetchConfig::default();

        let chunk_delay_ms: u64 = parse_or(
            &lookup,
            "BACKTEST_CHUNK_DELAY_MS",
            defaults.inter_chunk_delay.as_millis() as u64,
        )?;
        let max_attempts: u32 = parse_or(&lookup, "BACKTEST_CHUNK_ATTEMPTS", defaults.max_attempts)?;
        let retry_delay_ms: u64 = parse_or(
            &lookup,
            "BACKTEST_RETRY_DELAY_MS",
            defaults.retry_delay.as_millis() as u64,
        )?;
        let chunk_timeout_secs: u64 = parse_or(
            &lookup,
            "BACKTEST_CHUNK_TIMEOUT_SECS",
            defaults.chunk_timeout.as_secs(),
        )?;

        if max_attempts == 0 {
            anyhow::bail!("BACKTEST_CHUNK_ATTEMPTS must be at least 1");
        }

        Ok(Self {
            db_path: lookup("SIGNAL_BACKTEST_DB_PATH").unwrap_or_else(|| DEFAULT_DB_PATH.to_string()),
            binance_base_url: lookup("BINANCE_BASE_URL")
                .unwrap_or_else(|| DEFAULT_BASE_URL.to_string()),
            // A whole chunk may span several paginated requests
            http_timeout: Duration::from_secs(chunk_timeout_secs),
            fetch: FetchConfig {
                inter_chunk_delay: Duration::from_millis(chunk_delay_ms),
                max_attempts,
                retry_delay: Duration::from_millis(retry_delay_ms),
                chunk_timeout: Duration::from_secs(chunk_timeout_secs),
            },
        })
    }
}

fn parse_or<T>(lookup: &impl Fn(&str) -> Option<String>, key: &str, default: T) -> Result<T>
where
    T: FromStr,
    T::Err: std::error::Error + Send + Sync + 'static,
{
    match lookup(key) {
        Some(raw) => raw
            .trim()
            .parse()
            .with_context(|| format!("Invalid value for {}: '{}'", key, raw)),
        None => Ok(default),
    }
}
