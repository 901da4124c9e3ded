//! Bounded pool for blocking collaborator calls
//!
//! Synchronous clients (historical backfill) run on tokio's blocking
//! threads, at most `size` at a time, so they never occupy the threads
//! that drive the provider connection and tick dispatch.

use chrono::{DateTime, Utc};
use quotebar_schema::{Granularity, InstrumentKey, Ohlcv};
use std::sync::Arc;
use tokio::sync::Semaphore;
use tracing::debug;

use crate::error::ConnectorError;

/// Provider cap on bars per historical request
pub const MAX_HISTORY_BARS: usize = 5000;

#[derive(Debug, Clone, PartialEq)]
pub struct HistoricalBar {
    pub bucket_start: DateTime<Utc>,
    pub ohlcv: Ohlcv,
}

/// Blocking backfill client. Never called from the streaming path.
pub trait HistoricalSource: Send + Sync {
    fn fetch_bars(
        &self,
        instrument: &InstrumentKey,
        granularity: Granularity,
        max_count: usize,
    ) -> Result<Vec<HistoricalBar>, String>;
}

#[derive(Clone)]
pub struct BlockingPool {
    permits: Arc<Semaphore>,
    size: usize,
}

impl BlockingPool {
    pub fn new(size: usize) -> Self {
        let size = size.max(1);
        Self {
            permits: Arc::new(Semaphore::new(size)),
            size,
        }
    }

    pub fn size(&self) -> usize {
        self.size
    }

    /// Run `f` on a blocking thread once a permit is free.
    pub async fn run<F, T>(&self, f: F) -> Result<T, ConnectorError>
    where
        F: FnOnce() -> T + Send + 'static,
        T: Send + 'static,
    {
        let permit = Arc::clone(&self.permits)
            .acquire_owned()
            .await
            .map_err(|e| ConnectorError::Worker(e.to_string()))?;

        tokio::task::spawn_blocking(move || {
            let _permit = permit;
            f()
        })
        .await
        .map_err(|e| ConnectorError::Worker(e.to_string()))
    }
}

/// Fetch history through `pool`, capping the request at
/// [`MAX_HISTORY_BARS`].
pub async fn fetch_history(
    pool: &BlockingPool,
    source: Arc<dyn HistoricalSource>,
    instrument: InstrumentKey,
    granularity: Granularity,
    max_count: usize,
) -> Result<Vec<HistoricalBar>, ConnectorError> {
    let capped = max_count.min(MAX_HISTORY_BARS);
    debug!(instrument = %instrument, granularity = %granularity, requested = max_count, capped, "Fetching history");

    pool.run(move || source.fetch_bars(&instrument, granularity, capped))
        .await?
        .map_err(ConnectorError::History)
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;

    struct RecordingSource {
        last_max: AtomicUsize,
    }

    impl HistoricalSource for RecordingSource {
        fn fetch_bars(
            &self,
            _instrument: &InstrumentKey,
            granularity: Granularity,
            max_count: usize,
        ) -> Result<Vec<HistoricalBar>, String> {
            self.last_max.store(max_count, Ordering::SeqCst);
            let start = Utc.with_ymd_and_hms(2024, 1, 1, 0, 0, 0).unwrap();
            Ok(vec![HistoricalBar {
                bucket_start: granularity.bucket_start(start),
                ohlcv: Ohlcv { open: 1.0, high: 1.0, low: 1.0, close: 1.0, volume: 0.0 },
            }])
        }
    }

    struct FailingSource;

    impl HistoricalSource for FailingSource {
        fn fetch_bars(&self, _: &InstrumentKey, _: Granularity, _: usize) -> Result<Vec<HistoricalBar>, String> {
            Err("rate limited".to_string())
        }
    }

    #[tokio::test]
    async fn test_request_is_capped() {
        let pool = BlockingPool::new(4);
        let source = Arc::new(RecordingSource { last_max: AtomicUsize::new(0) });
        let key = InstrumentKey::new("NASDAQ", "AAPL").unwrap();

        let bars = fetch_history(&pool, source.clone(), key.clone(), Granularity::Day1, 20_000)
            .await
            .unwrap();
        assert_eq!(bars.len(), 1);
        assert_eq!(source.last_max.load(Ordering::SeqCst), MAX_HISTORY_BARS);

        fetch_history(&pool, source.clone(), key, Granularity::Day1, 300).await.unwrap();
        assert_eq!(source.last_max.load(Ordering::SeqCst), 300);
    }

    #[tokio::test]
    async fn test_source_error_is_reported() {
        let pool = BlockingPool::new(1);
        let key = InstrumentKey::new("NASDAQ", "AAPL").unwrap();
        let result = fetch_history(&pool, Arc::new(FailingSource), key, Granularity::Hour1, 10).await;
        assert!(matches!(result, Err(ConnectorError::History(_))));
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_pool_bounds_concurrency() {
        let pool = BlockingPool::new(4);
        let active = Arc::new(AtomicUsize::new(0));
        let peak = Arc::new(AtomicUsize::new(0));

        let jobs: Vec<_> = (0..16)
            .map(|_| {
                let pool = pool.clone();
                let active = active.clone();
                let peak = peak.clone();
                tokio::spawn(async move {
                    pool.run(move || {
                        let now = active.fetch_add(1, Ordering::SeqCst) + 1;
                        peak.fetch_max(now, Ordering::SeqCst);
                        std::thread::sleep(Duration::from_millis(20));
                        active.fetch_sub(1, Ordering::SeqCst);
                    })
                    .await
                })
            })
            .collect();

        for job in jobs {
            job.await.unwrap().unwrap();
        }
        assert!(peak.load(Ordering::SeqCst) <= 4);
        assert!(peak.load(Ordering::SeqCst) >= 1);
    }
}
