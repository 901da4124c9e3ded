//! Bar flusher: drains completed bars into the persistence sink.
//!
//! The engine emits into an unbounded channel so emission under its lock
//! never waits on I/O. This task is the only writer to the sink. Failed
//! upserts are logged and counted; the sink's idempotent upsert makes a
//! later re-emission of the same key safe.

use quotebar_middleware::BarSink;
use quotebar_schema::CompletedBar;
use std::sync::Arc;
use tokio::sync::mpsc;
use tracing::{debug, error, info};

use crate::metrics;

#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct FlushStats {
    pub written: u64,
    pub failed: u64,
}

/// Runs until every sender is gone and the queue is empty.
pub async fn run_flusher(
    mut bars: mpsc::UnboundedReceiver<CompletedBar>,
    sink: Arc<dyn BarSink>,
) -> FlushStats {
    let mut stats = FlushStats::default();

    while let Some(bar) = bars.recv().await {
        let granularity = bar.granularity.as_str();
        metrics::inc_bar_emitted(granularity, bar.reason.as_str());

        match sink
            .upsert_bar(&bar.instrument, bar.granularity, bar.bucket_start, &bar.ohlcv)
            .await
        {
            Ok(()) => {
                stats.written += 1;
                debug!(
                    instrument = %bar.instrument,
                    granularity,
                    bucket_start = %bar.bucket_start,
                    reason = %bar.reason,
                    ticks = bar.tick_count,
                    "Bar persisted"
                );
            }
            Err(e) => {
                stats.failed += 1;
                metrics::inc_sink_failure();
                error!(
                    instrument = %bar.instrument,
                    granularity,
                    bucket_start = %bar.bucket_start,
                    error = %e,
                    "Bar upsert failed"
                );
            }
        }
    }

    info!(written = stats.written, failed = stats.failed, "Bar flusher drained");
    stats
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use chrono::{DateTime, TimeZone, Utc};
    use quotebar_middleware::{InMemoryBarStore, SinkError};
    use quotebar_schema::{EmitReason, Granularity, InstrumentKey, Ohlcv};

    struct RejectingSink;

    #[async_trait]
    impl BarSink for RejectingSink {
        async fn upsert_bar(
            &self,
            _instrument: &InstrumentKey,
            _granularity: Granularity,
            _bucket_start: DateTime<Utc>,
            _ohlcv: &Ohlcv,
        ) -> Result<(), SinkError> {
            Err(SinkError::WriteFailed("read-only".into()))
        }
    }

    fn bar(minute: u32, reason: EmitReason) -> CompletedBar {
        CompletedBar {
            instrument: InstrumentKey::new("NASDAQ", "AAPL").unwrap(),
            granularity: Granularity::Minute1,
            bucket_start: Utc.with_ymd_and_hms(2024, 1, 2, 15, minute, 0).unwrap(),
            ohlcv: Ohlcv { open: 1.0, high: 2.0, low: 0.5, close: 1.5, volume: 3.0 },
            tick_count: 3,
            reason,
        }
    }

    #[tokio::test]
    async fn test_drains_everything_then_stops() {
        let store = InMemoryBarStore::new();
        let (tx, rx) = mpsc::unbounded_channel();
        tx.send(bar(0, EmitReason::Rollover)).unwrap();
        tx.send(bar(1, EmitReason::Rollover)).unwrap();
        // Same key again, from a shutdown flush
        tx.send(bar(1, EmitReason::Flush)).unwrap();
        drop(tx);

        let stats = run_flusher(rx, Arc::new(store.clone())).await;
        assert_eq!(stats, FlushStats { written: 3, failed: 0 });
        assert_eq!(store.len().await, 2);
        assert_eq!(store.writes(), 3);
    }

    #[tokio::test]
    async fn test_sink_failures_are_counted_not_fatal() {
        let (tx, rx) = mpsc::unbounded_channel();
        tx.send(bar(0, EmitReason::Rollover)).unwrap();
        tx.send(bar(1, EmitReason::Flush)).unwrap();
        drop(tx);

        let stats = run_flusher(rx, Arc::new(RejectingSink)).await;
        assert_eq!(stats, FlushStats { written: 0, failed: 2 });
    }
}
