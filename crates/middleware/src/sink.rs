use async_trait::async_trait;
use chrono::{DateTime, Utc};
use quotebar_schema::{Granularity, InstrumentKey, Ohlcv};

use crate::error::SinkError;

/// Persistence sink for finished bars.
///
/// Implementations must be idempotent on
/// (instrument, granularity, bucket_start): writing the same key twice
/// overwrites, never duplicates. Bars may be re-emitted after a retry or
/// a shutdown flush.
#[async_trait]
pub trait BarSink: Send + Sync {
    async fn upsert_bar(
        &self,
        instrument: &InstrumentKey,
        granularity: Granularity,
        bucket_start: DateTime<Utc>,
        ohlcv: &Ohlcv,
    ) -> Result<(), SinkError>;
}
