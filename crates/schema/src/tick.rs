//! Stream-level price updates.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::instrument::InstrumentKey;

/// Single price/volume update, consumed by aggregation. Never persisted.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Tick {
    pub instrument: InstrumentKey,
    pub price: f64,
    pub volume: Option<f64>,
    pub timestamp: DateTime<Utc>,
}

impl Tick {
    pub fn new(
        instrument: InstrumentKey,
        price: f64,
        volume: Option<f64>,
        timestamp: DateTime<Utc>,
    ) -> Self {
        Self {
            instrument,
            price,
            volume,
            timestamp,
        }
    }
}

/// Full quote snapshot as cached for "latest quote" reads.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Quote {
    pub instrument: InstrumentKey,
    pub timestamp: DateTime<Utc>,
    pub last_price: f64,
    pub bid: Option<f64>,
    pub ask: Option<f64>,
    pub volume: Option<f64>,
    pub change: Option<f64>,
    pub change_percent: Option<f64>,
    pub open_price: Option<f64>,
    pub high_price: Option<f64>,
    pub low_price: Option<f64>,
    pub prev_close: Option<f64>,
}

impl Quote {
    /// The aggregation view of this quote.
    pub fn to_tick(&self) -> Tick {
        Tick {
            instrument: self.instrument.clone(),
            price: self.last_price,
            volume: self.volume,
            timestamp: self.timestamp,
        }
    }
}
