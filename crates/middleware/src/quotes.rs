//! Typed view over a [`Cache`] for latest quotes and in-progress bars.
//!
//! Keys:
//! - `quote:latest:{EXCHANGE}:{SYMBOL}`
//! - `bar:current:{EXCHANGE}:{SYMBOL}:{granularity}`

use bytes::Bytes;
use quotebar_schema::{BarSnapshot, Granularity, InstrumentKey, Quote};
use std::sync::Arc;
use std::time::Duration;

use crate::cache::Cache;
use crate::error::CacheError;

pub const DEFAULT_QUOTE_TTL: Duration = Duration::from_secs(60);
pub const DEFAULT_BAR_TTL: Duration = Duration::from_secs(300);

pub fn latest_quote_key(instrument: &InstrumentKey) -> String {
    format!("quote:latest:{}:{}", instrument.exchange(), instrument.symbol())
}

pub fn current_bar_key(instrument: &InstrumentKey, granularity: Granularity) -> String {
    format!(
        "bar:current:{}:{}:{}",
        instrument.exchange(),
        instrument.symbol(),
        granularity
    )
}

#[derive(Clone)]
pub struct QuoteCache {
    cache: Arc<dyn Cache>,
    quote_ttl: Duration,
    bar_ttl: Duration,
}

impl QuoteCache {
    pub fn new(cache: Arc<dyn Cache>) -> Self {
        Self::with_ttls(cache, DEFAULT_QUOTE_TTL, DEFAULT_BAR_TTL)
    }

    pub fn with_ttls(cache: Arc<dyn Cache>, quote_ttl: Duration, bar_ttl: Duration) -> Self {
        Self { cache, quote_ttl, bar_ttl }
    }

    pub async fn set_latest(&self, quote: &Quote) -> Result<(), CacheError> {
        let value = serde_json::to_vec(quote)?;
        self.cache
            .set(&latest_quote_key(&quote.instrument), Bytes::from(value), Some(self.quote_ttl))
            .await
    }

    pub async fn get_latest(&self, instrument: &InstrumentKey) -> Result<Option<Quote>, CacheError> {
        match self.cache.get(&latest_quote_key(instrument)).await? {
            Some(raw) => Ok(Some(serde_json::from_slice(&raw)?)),
            None => Ok(None),
        }
    }

    pub async fn clear_latest(&self, instrument: &InstrumentKey) -> Result<(), CacheError> {
        self.cache.delete(&latest_quote_key(instrument)).await
    }

    pub async fn set_current_bar(&self, snapshot: &BarSnapshot) -> Result<(), CacheError> {
        let value = serde_json::to_vec(snapshot)?;
        let key = current_bar_key(&snapshot.instrument, snapshot.granularity);
        self.cache.set(&key, Bytes::from(value), Some(self.bar_ttl)).await
    }

    pub async fn get_current_bar(
        &self,
        instrument: &InstrumentKey,
        granularity: Granularity,
    ) -> Result<Option<BarSnapshot>, CacheError> {
        match self.cache.get(&current_bar_key(instrument, granularity)).await? {
            Some(raw) => Ok(Some(serde_json::from_slice(&raw)?)),
            None => Ok(None),
        }
    }
}
