//! quotebar-aggregate: tick to OHLCV bar aggregation
//!
//! One [`BarEngine`] owns a builder per (instrument, granularity). Ticks
//! are applied under a single lock; bars that roll over, get flushed or
//! are dropped by an unsubscribe leave through a [`BarEmitter`].

pub mod builder;
pub mod engine;

pub use builder::BarBuilder;
pub use engine::{BarEmitter, BarEngine, TickOutcome};
