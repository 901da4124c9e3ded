//! quotebar-schema: market data types
//!
//! Instrument identity, ticks and quotes coming off the stream, the
//! supported bar granularities with their bucket alignment rules, and
//! the bar shapes produced by aggregation.

pub mod bar;
pub mod error;
pub mod granularity;
pub mod instrument;
pub mod tick;

pub use bar::{BarKey, BarSnapshot, CompletedBar, EmitReason, Ohlcv};
pub use error::SchemaError;
pub use granularity::Granularity;
pub use instrument::InstrumentKey;
pub use tick::{Quote, Tick};
