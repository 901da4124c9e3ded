use async_trait::async_trait;
use chrono::{DateTime, Utc};
use quotebar_schema::{BarKey, Granularity, InstrumentKey, Ohlcv};
use std::collections::BTreeMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use tokio::sync::RwLock;

use crate::error::SinkError;
use crate::sink::BarSink;

/// Bar store keyed on the upsert identity.
#[derive(Clone, Default)]
pub struct InMemoryBarStore {
    bars: Arc<RwLock<BTreeMap<BarKey, Ohlcv>>>,
    writes: Arc<AtomicU64>,
}

impl InMemoryBarStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn get(&self, key: &BarKey) -> Option<Ohlcv> {
        self.bars.read().await.get(key).copied()
    }

    /// Distinct stored bars
    pub async fn len(&self) -> usize {
        self.bars.read().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.bars.read().await.is_empty()
    }

    /// Upsert calls received, including overwrites
    pub fn writes(&self) -> u64 {
        self.writes.load(Ordering::SeqCst)
    }

    /// Stored bars for one series, oldest first
    pub async fn series(
        &self,
        instrument: &InstrumentKey,
        granularity: Granularity,
    ) -> Vec<(DateTime<Utc>, Ohlcv)> {
        self.bars
            .read()
            .await
            .iter()
            .filter(|(k, _)| &k.instrument == instrument && k.granularity == granularity)
            .map(|(k, v)| (k.bucket_start, *v))
            .collect()
    }
}

#[async_trait]
impl BarSink for InMemoryBarStore {
    async fn upsert_bar(
        &self,
        instrument: &InstrumentKey,
        granularity: Granularity,
        bucket_start: DateTime<Utc>,
        ohlcv: &Ohlcv,
    ) -> Result<(), SinkError> {
        let key = BarKey {
            instrument: instrument.clone(),
            granularity,
            bucket_start,
        };
        self.bars.write().await.insert(key, *ohlcv);
        self.writes.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }
}
