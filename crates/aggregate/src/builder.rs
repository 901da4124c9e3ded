//! In-progress bar state.

use chrono::{DateTime, Utc};
use quotebar_schema::{BarSnapshot, CompletedBar, EmitReason, Granularity, InstrumentKey, Ohlcv};

/// Accumulates ticks for one bucket of one (instrument, granularity).
#[derive(Debug, Clone)]
pub struct BarBuilder {
    bucket_start: DateTime<Utc>,
    bucket_end: DateTime<Utc>,
    open: f64,
    high: f64,
    low: f64,
    close: f64,
    volume: f64,
    tick_count: u64,
}

impl BarBuilder {
    /// Empty builder for the bucket starting at `bucket_start`.
    pub fn new(granularity: Granularity, bucket_start: DateTime<Utc>) -> Self {
        Self {
            bucket_start,
            bucket_end: granularity.next_bucket_start(bucket_start),
            open: 0.0,
            high: 0.0,
            low: 0.0,
            close: 0.0,
            volume: 0.0,
            tick_count: 0,
        }
    }

    pub fn bucket_start(&self) -> DateTime<Utc> {
        self.bucket_start
    }

    pub fn tick_count(&self) -> u64 {
        self.tick_count
    }

    pub fn is_empty(&self) -> bool {
        self.tick_count == 0
    }

    /// Folds one tick into the bar. The first tick sets the open.
    pub fn apply(&mut self, price: f64, volume: Option<f64>) {
        if self.tick_count == 0 {
            self.open = price;
            self.high = price;
            self.low = price;
        } else {
            self.high = self.high.max(price);
            self.low = self.low.min(price);
        }
        self.close = price;
        if let Some(v) = volume {
            self.volume += v;
        }
        self.tick_count += 1;
    }

    fn ohlcv(&self) -> Ohlcv {
        Ohlcv {
            open: self.open,
            high: self.high,
            low: self.low,
            close: self.close,
            volume: self.volume,
        }
    }

    /// Finished bar, or `None` when no tick ever landed here.
    pub fn finish(
        &self,
        instrument: &InstrumentKey,
        granularity: Granularity,
        reason: EmitReason,
    ) -> Option<CompletedBar> {
        if self.is_empty() {
            return None;
        }
        Some(CompletedBar {
            instrument: instrument.clone(),
            granularity,
            bucket_start: self.bucket_start,
            ohlcv: self.ohlcv(),
            tick_count: self.tick_count,
            reason,
        })
    }

    pub fn snapshot(&self, instrument: &InstrumentKey, granularity: Granularity) -> BarSnapshot {
        BarSnapshot {
            instrument: instrument.clone(),
            granularity,
            bucket_start: self.bucket_start,
            bucket_end: self.bucket_end,
            ohlcv: self.ohlcv(),
            tick_count: self.tick_count,
        }
    }
}
