//! Configuration module for uamon.
//!
//! Loads configuration from environment variables with sensible defaults.

use std::env;
use std::str::FromStr;
use std::time::Duration;

/// Server-side sampling configuration.
#[derive(Debug, Clone)]
pub struct SamplingConfig {
    /// Sampling intervals are rounded up to a multiple of this (default: 25ms, <= 0 disables)
    pub bucket_size_ms: f64,
    /// Debounce delay before newly added items are sampled (default: 5ms)
    pub immediate_sample_delay: Duration,
    /// Fastest sampling interval the server grants (default: 25ms)
    pub min_sampling_interval_ms: f64,
    /// Slowest sampling interval the server grants (default: 1h)
    pub max_sampling_interval_ms: f64,
    /// Largest queue size the server grants (default: 10000)
    pub max_queue_size: u32,
}

impl Default for SamplingConfig {
    fn default() -> Self {
        Self {
            bucket_size_ms: 25.0,
            immediate_sample_delay: Duration::from_millis(5),
            min_sampling_interval_ms: 25.0,
            max_sampling_interval_ms: 3_600_000.0,
            max_queue_size: 10_000,
        }
    }
}

/// Client-side reconciliation configuration.
#[derive(Debug, Clone)]
pub struct ClientConfig {
    /// Upper bound on items per service call, 0 for no limit (default: 1000)
    pub max_items_per_call: usize,
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            max_items_per_call: 1000,
        }
    }
}

/// Top-level configuration loaded from environment variables.
#[derive(Debug, Clone)]
pub struct EngineConfig {
    pub sampling: SamplingConfig,
    pub client: ClientConfig,
    /// Path to the SQLite node database; in-memory store when unset
    pub db_path: Option<String>,
    /// How long the demo runs before shutting down (default: 10s)
    pub run_time: Duration,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            sampling: SamplingConfig::default(),
            client: ClientConfig::default(),
            db_path: None,
            run_time: Duration::from_secs(10),
        }
    }
}

impl EngineConfig {
    /// Load configuration from environment variables.
    ///
    /// Environment variables:
    /// - `UAMON_BUCKET_SIZE_MS`: sampling interval bucket (default: 25)
    /// - `UAMON_IMMEDIATE_DELAY_MS`: immediate sampling debounce (default: 5)
    /// - `UAMON_MIN_SAMPLING_MS`: minimum sampling interval (default: 25)
    /// - `UAMON_MAX_SAMPLING_MS`: maximum sampling interval (default: 3600000)
    /// - `UAMON_MAX_QUEUE_SIZE`: maximum queue size (default: 10000)
    /// - `UAMON_MAX_ITEMS_PER_CALL`: client chunk size (default: 1000)
    /// - `UAMON_DB_PATH`: SQLite database file (default: in-memory store)
    /// - `UAMON_RUN_SECONDS`: demo run time (default: 10)
    pub fn load() -> Self {
        let mut cfg = Self::default();

        if let Some(v) = env_parse("UAMON_BUCKET_SIZE_MS") {
            cfg.sampling.bucket_size_ms = v;
        }
        if let Some(v) = env_parse("UAMON_IMMEDIATE_DELAY_MS") {
            cfg.sampling.immediate_sample_delay = Duration::from_millis(v);
        }
        if let Some(v) = env_parse("UAMON_MIN_SAMPLING_MS") {
            cfg.sampling.min_sampling_interval_ms = v;
        }
        if let Some(v) = env_parse("UAMON_MAX_SAMPLING_MS") {
            cfg.sampling.max_sampling_interval_ms = v;
        }
        if let Some(v) = env_parse("UAMON_MAX_QUEUE_SIZE") {
            cfg.sampling.max_queue_size = v;
        }
        if let Some(v) = env_parse("UAMON_MAX_ITEMS_PER_CALL") {
            cfg.client.max_items_per_call = v;
        }
        if let Ok(db_path) = env::var("UAMON_DB_PATH") {
            cfg.db_path = Some(db_path);
        }
        if let Some(v) = env_parse("UAMON_RUN_SECONDS") {
            cfg.run_time = Duration::from_secs(v);
        }

        cfg
    }
}

fn env_parse<T: FromStr>(key: &str) -> Option<T> {
    let raw = env::var(key).ok()?;
    match raw.parse() {
        Ok(v) => Some(v),
        Err(_) => {
            tracing::warn!("Config: Ignoring unparsable {}={}", key, raw);
            None
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config() {
        let cfg = EngineConfig::default();
        assert_eq!(cfg.sampling.bucket_size_ms, 25.0);
        assert_eq!(cfg.sampling.immediate_sample_delay, Duration::from_millis(5));
        assert_eq!(cfg.client.max_items_per_call, 1000);
        assert!(cfg.db_path.is_none());
    }

    #[test]
    fn test_env_parse() {
        env::set_var("UAMON_TEST_PARSE_OK", "42");
        env::set_var("UAMON_TEST_PARSE_BAD", "forty-two");
        assert_eq!(env_parse::<u32>("UAMON_TEST_PARSE_OK"), Some(42));
        assert_eq!(env_parse::<u32>("UAMON_TEST_PARSE_BAD"), None);
        assert_eq!(env_parse::<u32>("UAMON_TEST_PARSE_MISSING"), None);
    }
}
