//! Client configuration. Everything tunable ships with a default that
//! matches production, so `Config::default()` is a working setup and a
//! config file only needs the fields it wants to change.

use std::path::PathBuf;
use std::time::Duration;

use data::CacheConfig;
use feed::stream::StreamConfig;
use feed::{Granularity, Period, Symbol};
use serde::{Deserialize, Serialize};

fn default_symbol() -> Symbol {
    Symbol::new("BTC-USD")
}

fn default_granularity() -> Granularity {
    Granularity::M15
}

fn default_period() -> Period {
    Period::Week
}

fn default_http_base_url() -> String {
    "https://api.candlestream.io".to_string()
}

fn default_stream_domain() -> String {
    "stream.candlestream.io".to_string()
}

fn default_stream_url() -> String {
    "wss://stream.candlestream.io/ws".to_string()
}

fn default_fetch_timeout_ms() -> u64 {
    15_000
}

fn default_retry_cooldown_ms() -> u64 {
    30_000
}

fn default_idle_prefetch_ms() -> u64 {
    3_000
}

fn default_prefetch_spacing_ms() -> u64 {
    500
}

fn default_resubscribe_delay_ms() -> u64 {
    200
}

fn default_reposition_candles() -> usize {
    60
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct Config {
    /// Symbol shown when the client starts, before any explicit switch.
    #[serde(default = "default_symbol")]
    pub symbol: Symbol,
    #[serde(default = "default_granularity")]
    pub granularity: Granularity,
    #[serde(default = "default_period")]
    pub period: Period,
    #[serde(default = "default_http_base_url")]
    pub http_base_url: String,
    #[serde(default = "default_stream_domain")]
    pub stream_domain: String,
    #[serde(default = "default_stream_url")]
    pub stream_url: String,
    /// Overrides the platform data directory when set. Usage statistics and
    /// the durable cache records live under it.
    #[serde(default)]
    pub data_dir: Option<PathBuf>,
    #[serde(default = "default_fetch_timeout_ms")]
    pub fetch_timeout_ms: u64,
    /// A historical range fetched this recently is not fetched again by
    /// background work.
    #[serde(default = "default_retry_cooldown_ms")]
    pub retry_cooldown_ms: u64,
    /// Quiet time after the last user input before prefetching starts.
    #[serde(default = "default_idle_prefetch_ms")]
    pub idle_prefetch_ms: u64,
    /// Spacing between consecutive prefetch requests while draining.
    #[serde(default = "default_prefetch_spacing_ms")]
    pub prefetch_spacing_ms: u64,
    /// Delay before the stream re-subscribes after a timeframe reload.
    #[serde(default = "default_resubscribe_delay_ms")]
    pub resubscribe_delay_ms: u64,
    /// How many recent candles the post-reload reposition notice covers.
    #[serde(default = "default_reposition_candles")]
    pub reposition_candles: usize,
    #[serde(default)]
    pub stream: StreamTuning,
    #[serde(default)]
    pub cache: CacheTuning,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            symbol: default_symbol(),
            granularity: default_granularity(),
            period: default_period(),
            http_base_url: default_http_base_url(),
            stream_domain: default_stream_domain(),
            stream_url: default_stream_url(),
            data_dir: None,
            fetch_timeout_ms: default_fetch_timeout_ms(),
            retry_cooldown_ms: default_retry_cooldown_ms(),
            idle_prefetch_ms: default_idle_prefetch_ms(),
            prefetch_spacing_ms: default_prefetch_spacing_ms(),
            resubscribe_delay_ms: default_resubscribe_delay_ms(),
            reposition_candles: default_reposition_candles(),
            stream: StreamTuning::default(),
            cache: CacheTuning::default(),
        }
    }
}

impl Config {
    pub fn fetch_timeout(&self) -> Duration {
        Duration::from_millis(self.fetch_timeout_ms)
    }

    pub fn retry_cooldown(&self) -> Duration {
        Duration::from_millis(self.retry_cooldown_ms)
    }

    pub fn idle_prefetch_delay(&self) -> Duration {
        Duration::from_millis(self.idle_prefetch_ms)
    }

    pub fn prefetch_spacing(&self) -> Duration {
        Duration::from_millis(self.prefetch_spacing_ms)
    }

    pub fn resubscribe_delay(&self) -> Duration {
        Duration::from_millis(self.resubscribe_delay_ms)
    }

    /// Base directory for everything the client writes to disk.
    pub fn data_dir(&self) -> PathBuf {
        self.data_dir
            .clone()
            .unwrap_or_else(|| data::data_path(None))
    }

    pub fn stats_path(&self) -> PathBuf {
        self.data_dir().join("usage-stats.json")
    }

    pub fn cache_dir(&self) -> PathBuf {
        self.data_dir().join("cache")
    }

    pub fn stream_config(&self) -> StreamConfig {
        self.stream.to_stream_config()
    }

    pub fn cache_config(&self) -> CacheConfig {
        self.cache.to_cache_config(self.cache_dir())
    }
}

fn default_batch_max_count() -> usize {
    50
}

fn default_batch_max_wait_ms() -> u64 {
    100
}

fn default_unsubscribe_grace_ms() -> u64 {
    100
}

fn default_backoff_base_ms() -> u64 {
    1_000
}

fn default_backoff_cap_multiplier() -> u32 {
    10
}

fn default_read_timeout_ms() -> u64 {
    45_000
}

/// Websocket client knobs, mirrored onto [`StreamConfig`].
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct StreamTuning {
    #[serde(default = "default_batch_max_count")]
    pub batch_max_count: usize,
    #[serde(default = "default_batch_max_wait_ms")]
    pub batch_max_wait_ms: u64,
    #[serde(default = "default_unsubscribe_grace_ms")]
    pub unsubscribe_grace_ms: u64,
    #[serde(default = "default_backoff_base_ms")]
    pub backoff_base_ms: u64,
    #[serde(default = "default_backoff_cap_multiplier")]
    pub backoff_cap_multiplier: u32,
    #[serde(default = "default_read_timeout_ms")]
    pub read_timeout_ms: u64,
}

impl Default for StreamTuning {
    fn default() -> Self {
        Self {
            batch_max_count: default_batch_max_count(),
            batch_max_wait_ms: default_batch_max_wait_ms(),
            unsubscribe_grace_ms: default_unsubscribe_grace_ms(),
            backoff_base_ms: default_backoff_base_ms(),
            backoff_cap_multiplier: default_backoff_cap_multiplier(),
            read_timeout_ms: default_read_timeout_ms(),
        }
    }
}

impl StreamTuning {
    fn to_stream_config(&self) -> StreamConfig {
        StreamConfig {
            batch_max_count: self.batch_max_count,
            batch_max_wait: Duration::from_millis(self.batch_max_wait_ms),
            unsubscribe_grace: Duration::from_millis(self.unsubscribe_grace_ms),
            backoff_base: Duration::from_millis(self.backoff_base_ms),
            backoff_cap_multiplier: self.backoff_cap_multiplier,
            read_timeout: Duration::from_millis(self.read_timeout_ms),
        }
    }
}

fn default_hot_budget_bytes() -> usize {
    64 * 1024 * 1024
}

fn default_evict_fraction() -> f64 {
    0.25
}

fn default_durable_max_records() -> usize {
    5
}

fn default_freshness_window_ms() -> u64 {
    5 * 60 * 1_000
}

/// Cache tier knobs, mirrored onto [`CacheConfig`].
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct CacheTuning {
    #[serde(default = "default_hot_budget_bytes")]
    pub hot_budget_bytes: usize,
    #[serde(default = "default_evict_fraction")]
    pub evict_fraction: f64,
    #[serde(default = "default_durable_max_records")]
    pub durable_max_records: usize,
    #[serde(default = "default_freshness_window_ms")]
    pub freshness_window_ms: u64,
}

impl Default for CacheTuning {
    fn default() -> Self {
        Self {
            hot_budget_bytes: default_hot_budget_bytes(),
            evict_fraction: default_evict_fraction(),
            durable_max_records: default_durable_max_records(),
            freshness_window_ms: default_freshness_window_ms(),
        }
    }
}

impl CacheTuning {
    fn to_cache_config(&self, durable_dir: PathBuf) -> CacheConfig {
        CacheConfig {
            hot_budget_bytes: self.hot_budget_bytes,
            evict_fraction: self.evict_fraction,
            durable_max_records: self.durable_max_records,
            freshness_window: Duration::from_millis(self.freshness_window_ms),
            durable_dir,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn empty_document_yields_working_defaults() {
        let config: Config = serde_json::from_str("{}").unwrap();
        assert_eq!(config.symbol, default_symbol());
        assert_eq!(config.stream.batch_max_count, 50);
        assert_eq!(config.cache.durable_max_records, 5);
        // the default timeframe must be internally coherent
        assert!(config.period.supports(config.granularity));
    }

    #[test]
    fn partial_document_keeps_the_rest() {
        let config: Config = serde_json::from_str(
            r#"{"symbol": "ETH-USD", "cache": {"freshness_window_ms": 1000}}"#,
        )
        .unwrap();
        assert_eq!(config.symbol.as_str(), "ETH-USD");
        assert_eq!(config.cache.freshness_window_ms, 1_000);
        assert_eq!(config.cache.evict_fraction, default_evict_fraction());
        assert_eq!(config.granularity, default_granularity());
    }

    #[test]
    fn durations_come_out_in_milliseconds() {
        let config = Config::default();
        assert_eq!(config.fetch_timeout(), Duration::from_secs(15));
        assert_eq!(config.prefetch_spacing(), Duration::from_millis(500));
        assert_eq!(
            config.stream_config().unsubscribe_grace,
            Duration::from_millis(100)
        );
        assert_eq!(
            config.cache_config().freshness_window,
            Duration::from_secs(300)
        );
    }

    #[test]
    fn data_dir_override_is_respected() {
        let mut config = Config::default();
        config.data_dir = Some(PathBuf::from("/tmp/candles"));
        assert_eq!(config.stats_path(), PathBuf::from("/tmp/candles/usage-stats.json"));
        assert_eq!(config.cache_dir(), PathBuf::from("/tmp/candles/cache"));
    }
}
