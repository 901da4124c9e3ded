use quotebar_schema::{Granularity, InstrumentKey};
use serde::{Deserialize, Serialize};
use std::path::Path;
use std::time::Duration;

use crate::error::MetadataError;

pub const DEFAULT_PROVIDER_URL: &str = "wss://data.tradingview.com/socket.io/websocket";
pub const DEFAULT_ORIGIN: &str = "https://www.tradingview.com";

/// Env var overriding `provider.auth_token`
pub const AUTH_TOKEN_ENV: &str = "QUOTEBAR_AUTH_TOKEN";
/// Env var overriding `cache.redis_url`
pub const REDIS_URL_ENV: &str = "QUOTEBAR_REDIS_URL";
/// Env var overriding `sink.database_url`
pub const DATABASE_URL_ENV: &str = "QUOTEBAR_DATABASE_URL";
/// Comma-separated `EXCHANGE:SYMBOL` list replacing `symbols`
pub const SYMBOLS_ENV: &str = "QUOTEBAR_SYMBOLS";

pub const DEFAULT_QUOTE_FIELDS: &[&str] = &[
    "lp",
    "volume",
    "bid",
    "ask",
    "ch",
    "chp",
    "open_price",
    "high_price",
    "low_price",
    "prev_close_price",
    "lp_time",
];

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProviderConfig {
    #[serde(default = "default_url")]
    pub url: String,
    #[serde(default = "default_origin")]
    pub origin: String,
    /// Sent as `set_auth_token` during the handshake when present
    #[serde(default)]
    pub auth_token: Option<String>,
    #[serde(default = "default_quote_fields")]
    pub quote_fields: Vec<String>,
}

fn default_url() -> String {
    DEFAULT_PROVIDER_URL.to_string()
}

fn default_origin() -> String {
    DEFAULT_ORIGIN.to_string()
}

fn default_quote_fields() -> Vec<String> {
    DEFAULT_QUOTE_FIELDS.iter().map(|s| s.to_string()).collect()
}

impl Default for ProviderConfig {
    fn default() -> Self {
        Self {
            url: default_url(),
            origin: default_origin(),
            auth_token: None,
            quote_fields: default_quote_fields(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ConnectionConfig {
    /// Silence longer than this is a dead connection
    #[serde(default = "default_heartbeat_timeout_secs")]
    pub heartbeat_timeout_secs: u64,
    /// Time in `running` after which the failure counter resets
    #[serde(default = "default_stability_window_secs")]
    pub stability_window_secs: u64,
    #[serde(default = "default_backoff_base_secs")]
    pub backoff_base_secs: u64,
    #[serde(default = "default_backoff_max_secs")]
    pub backoff_max_secs: u64,
    /// Decoded payloads buffered between the client and the dispatcher
    #[serde(default = "default_payload_buffer")]
    pub payload_buffer: usize,
}

fn default_heartbeat_timeout_secs() -> u64 {
    45
}

fn default_stability_window_secs() -> u64 {
    30
}

fn default_backoff_base_secs() -> u64 {
    1
}

fn default_backoff_max_secs() -> u64 {
    60
}

fn default_payload_buffer() -> usize {
    1000
}

impl Default for ConnectionConfig {
    fn default() -> Self {
        Self {
            heartbeat_timeout_secs: default_heartbeat_timeout_secs(),
            stability_window_secs: default_stability_window_secs(),
            backoff_base_secs: default_backoff_base_secs(),
            backoff_max_secs: default_backoff_max_secs(),
            payload_buffer: default_payload_buffer(),
        }
    }
}

impl ConnectionConfig {
    pub fn heartbeat_timeout(&self) -> Duration {
        Duration::from_secs(self.heartbeat_timeout_secs)
    }

    pub fn stability_window(&self) -> Duration {
        Duration::from_secs(self.stability_window_secs)
    }

    pub fn backoff_base(&self) -> Duration {
        Duration::from_secs(self.backoff_base_secs)
    }

    pub fn backoff_max(&self) -> Duration {
        Duration::from_secs(self.backoff_max_secs)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AggregationConfig {
    #[serde(default = "default_granularities")]
    pub granularities: Vec<Granularity>,
    /// Write the in-progress bar to the cache after every tick
    #[serde(default = "default_true")]
    pub cache_current_bars: bool,
}

fn default_granularities() -> Vec<Granularity> {
    Granularity::all().to_vec()
}

fn default_true() -> bool {
    true
}

impl Default for AggregationConfig {
    fn default() -> Self {
        Self {
            granularities: default_granularities(),
            cache_current_bars: true,
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CacheBackend {
    #[default]
    Memory,
    Redis,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CacheConfig {
    #[serde(default)]
    pub backend: CacheBackend,
    #[serde(default)]
    pub redis_url: Option<String>,
    #[serde(default = "default_quote_ttl_secs")]
    pub quote_ttl_secs: u64,
    #[serde(default = "default_bar_ttl_secs")]
    pub bar_ttl_secs: u64,
}

fn default_quote_ttl_secs() -> u64 {
    60
}

fn default_bar_ttl_secs() -> u64 {
    300
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            backend: CacheBackend::Memory,
            redis_url: None,
            quote_ttl_secs: default_quote_ttl_secs(),
            bar_ttl_secs: default_bar_ttl_secs(),
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SinkBackend {
    #[default]
    Memory,
    Postgres,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct SinkConfig {
    #[serde(default)]
    pub backend: SinkBackend,
    #[serde(default)]
    pub database_url: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WorkersConfig {
    /// Concurrent blocking calls allowed into synchronous collaborators
    #[serde(default = "default_blocking_pool_size")]
    pub blocking_pool_size: usize,
}

fn default_blocking_pool_size() -> usize {
    4
}

impl Default for WorkersConfig {
    fn default() -> Self {
        Self {
            blocking_pool_size: default_blocking_pool_size(),
        }
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct StreamConfig {
    #[serde(default)]
    pub provider: ProviderConfig,
    #[serde(default)]
    pub connection: ConnectionConfig,
    #[serde(default)]
    pub aggregation: AggregationConfig,
    #[serde(default)]
    pub cache: CacheConfig,
    #[serde(default)]
    pub sink: SinkConfig,
    /// Instruments subscribed at start, as `EXCHANGE:SYMBOL`
    #[serde(default)]
    pub symbols: Vec<String>,
    #[serde(default)]
    pub workers: WorkersConfig,
}

impl StreamConfig {
    /// Load from YAML, then apply env overrides and validate.
    pub fn load(path: &Path) -> Result<Self, MetadataError> {
        let content = std::fs::read_to_string(path)?;
        let mut config: StreamConfig = serde_yaml::from_str(&content)?;
        config.apply_overrides(|key| std::env::var(key).ok());
        config.validate()?;
        Ok(config)
    }

    /// Defaults with env overrides applied.
    pub fn from_env() -> Result<Self, MetadataError> {
        let mut config = StreamConfig::default();
        config.apply_overrides(|key| std::env::var(key).ok());
        config.validate()?;
        Ok(config)
    }

    /// Apply overrides from any key lookup; empty values are ignored.
    pub fn apply_overrides<F>(&mut self, lookup: F)
    where
        F: Fn(&str) -> Option<String>,
    {
        let lookup = |key: &str| lookup(key).filter(|v| !v.trim().is_empty());

        if let Some(token) = lookup(AUTH_TOKEN_ENV) {
            self.provider.auth_token = Some(token);
        }
        if let Some(url) = lookup(REDIS_URL_ENV) {
            self.cache.redis_url = Some(url);
        }
        if let Some(url) = lookup(DATABASE_URL_ENV) {
            self.sink.database_url = Some(url);
        }
        if let Some(symbols) = lookup(SYMBOLS_ENV) {
            self.symbols = symbols
                .split(',')
                .map(|s| s.trim().to_string())
                .filter(|s| !s.is_empty())
                .collect();
        }
    }

    pub fn validate(&self) -> Result<(), MetadataError> {
        if self.provider.url.is_empty() {
            return Err(MetadataError::Validation("provider.url is empty".into()));
        }
        if self.aggregation.granularities.is_empty() {
            return Err(MetadataError::Validation(
                "aggregation.granularities must name at least one granularity".into(),
            ));
        }
        let c = &self.connection;
        if c.heartbeat_timeout_secs == 0 || c.stability_window_secs == 0 {
            return Err(MetadataError::Validation(
                "connection timeouts must be non-zero".into(),
            ));
        }
        if c.backoff_base_secs == 0 || c.backoff_max_secs < c.backoff_base_secs {
            return Err(MetadataError::Validation(format!(
                "invalid backoff range {}s..{}s",
                c.backoff_base_secs, c.backoff_max_secs
            )));
        }
        if c.payload_buffer == 0 {
            return Err(MetadataError::Validation(
                "connection.payload_buffer must be non-zero".into(),
            ));
        }
        if self.workers.blocking_pool_size == 0 {
            return Err(MetadataError::Validation(
                "workers.blocking_pool_size must be non-zero".into(),
            ));
        }
        if self.cache.backend == CacheBackend::Redis && self.cache.redis_url.is_none() {
            return Err(MetadataError::MissingSetting {
                backend: "redis",
                setting: "cache.redis_url",
            });
        }
        if self.sink.backend == SinkBackend::Postgres && self.sink.database_url.is_none() {
            return Err(MetadataError::MissingSetting {
                backend: "postgres",
                setting: "sink.database_url",
            });
        }
        self.instruments()?;
        Ok(())
    }

    /// Parsed `symbols`, in configured order.
    pub fn instruments(&self) -> Result<Vec<InstrumentKey>, MetadataError> {
        self.symbols
            .iter()
            .map(|s| {
                s.parse::<InstrumentKey>()
                    .map_err(|e| MetadataError::InvalidSymbol {
                        symbol: s.clone(),
                        reason: e.to_string(),
                    })
            })
            .collect()
    }
}
