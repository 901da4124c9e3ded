//! Bar shapes: the OHLCV payload, finished bars and in-progress snapshots.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;

use crate::granularity::Granularity;
use crate::instrument::InstrumentKey;

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Ohlcv {
    pub open: f64,
    pub high: f64,
    pub low: f64,
    pub close: f64,
    pub volume: f64,
}

/// Why a bar left the engine.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EmitReason {
    /// A tick landed in a later (or earlier) bucket.
    Rollover,
    /// Forced emission, normally at shutdown.
    Flush,
    /// The instrument was unsubscribed with a bar in progress.
    Unsubscribe,
}

impl EmitReason {
    pub const fn as_str(&self) -> &'static str {
        match self {
            Self::Rollover => "rollover",
            Self::Flush => "flush",
            Self::Unsubscribe => "unsubscribe",
        }
    }
}

impl fmt::Display for EmitReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Upsert identity of a bar.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct BarKey {
    pub instrument: InstrumentKey,
    pub granularity: Granularity,
    pub bucket_start: DateTime<Utc>,
}

/// Immutable snapshot of a builder taken at rollover, flush or unsubscribe.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CompletedBar {
    pub instrument: InstrumentKey,
    pub granularity: Granularity,
    pub bucket_start: DateTime<Utc>,
    pub ohlcv: Ohlcv,
    pub tick_count: u64,
    pub reason: EmitReason,
}

impl CompletedBar {
    pub fn key(&self) -> BarKey {
        BarKey {
            instrument: self.instrument.clone(),
            granularity: self.granularity,
            bucket_start: self.bucket_start,
        }
    }
}

/// Read-only view of an in-progress bar.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BarSnapshot {
    pub instrument: InstrumentKey,
    pub granularity: Granularity,
    pub bucket_start: DateTime<Utc>,
    pub bucket_end: DateTime<Utc>,
    pub ohlcv: Ohlcv,
    pub tick_count: u64,
}
