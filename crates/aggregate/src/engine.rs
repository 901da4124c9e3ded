//! Multi-granularity bar aggregation engine.
//!
//! All builder mutation (create, update, finalize, clear) happens under
//! one mutex per engine. `add_tick` and `flush_all` never suspend, so a
//! blocking lock is fine on the async runtime: each critical section is
//! bounded by the number of configured granularities.

use std::collections::HashMap;
use std::sync::{Mutex, MutexGuard, PoisonError};

use quotebar_schema::{BarSnapshot, CompletedBar, EmitReason, Granularity, InstrumentKey, Tick};
use tokio::sync::mpsc;
use tracing::{debug, info, trace, warn};

use crate::builder::BarBuilder;

/// Receives bars as they leave the engine.
///
/// Called with the engine lock held, so implementations must not block.
pub trait BarEmitter: Send {
    fn emit(&mut self, bar: CompletedBar);
}

impl BarEmitter for mpsc::UnboundedSender<CompletedBar> {
    fn emit(&mut self, bar: CompletedBar) {
        if let Err(e) = self.send(bar) {
            let bar = e.0;
            warn!(
                instrument = %bar.instrument,
                granularity = %bar.granularity,
                bucket_start = %bar.bucket_start,
                "Bar receiver gone, dropping emitted bar"
            );
        }
    }
}

/// Result of applying one tick.
#[derive(Debug, Clone)]
pub struct TickOutcome {
    /// Bars finalized by this tick crossing a bucket boundary.
    pub rolled: usize,
    /// Current builders for the tick's instrument, one per granularity.
    pub current: Vec<BarSnapshot>,
}

struct EngineState {
    builders: HashMap<InstrumentKey, HashMap<Granularity, BarBuilder>>,
    emitter: Option<Box<dyn BarEmitter>>,
    emitted_total: u64,
}

impl EngineState {
    fn emit(&mut self, bar: CompletedBar) {
        debug!(
            instrument = %bar.instrument,
            granularity = %bar.granularity,
            bucket_start = %bar.bucket_start,
            tick_count = bar.tick_count,
            reason = %bar.reason,
            "Bar emitted"
        );
        self.emitted_total += 1;
        match self.emitter.as_mut() {
            Some(emitter) => emitter.emit(bar),
            None => warn!(
                instrument = %bar.instrument,
                granularity = %bar.granularity,
                "Emitter closed, bar not delivered"
            ),
        }
    }
}

/// Owns one [`BarBuilder`] per (instrument, granularity).
pub struct BarEngine {
    granularities: Vec<Granularity>,
    state: Mutex<EngineState>,
}

impl BarEngine {
    pub fn new(granularities: Vec<Granularity>, emitter: Box<dyn BarEmitter>) -> Self {
        let mut granularities = granularities;
        granularities.sort();
        granularities.dedup();

        Self {
            granularities,
            state: Mutex::new(EngineState {
                builders: HashMap::new(),
                emitter: Some(emitter),
                emitted_total: 0,
            }),
        }
    }

    /// Engine emitting into an unbounded channel, plus the receiving end.
    pub fn with_channel(
        granularities: Vec<Granularity>,
    ) -> (Self, mpsc::UnboundedReceiver<CompletedBar>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (Self::new(granularities, Box::new(tx)), rx)
    }

    pub fn granularities(&self) -> &[Granularity] {
        &self.granularities
    }

    // A panic mid-update leaves at most one builder with a partially
    // applied tick; the map itself stays consistent.
    fn lock(&self) -> MutexGuard<'_, EngineState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Applies `tick` to every configured granularity.
    ///
    /// A builder whose bucket differs from the tick's bucket is finalized
    /// (if it saw any tick) and replaced before the tick is applied, so
    /// the boundary-crossing tick opens the new bar. Late ticks are not
    /// special-cased: they roll the builder back to their own bucket.
    pub fn add_tick(&self, tick: &Tick) -> TickOutcome {
        let mut state = self.lock();
        let mut rolled = Vec::new();
        let mut current = Vec::with_capacity(self.granularities.len());

        {
            let per_instrument = state.builders.entry(tick.instrument.clone()).or_default();

            for &granularity in &self.granularities {
                let bucket_start = granularity.bucket_start(tick.timestamp);

                let builder = per_instrument
                    .entry(granularity)
                    .or_insert_with(|| BarBuilder::new(granularity, bucket_start));

                if builder.bucket_start() != bucket_start {
                    if let Some(bar) =
                        builder.finish(&tick.instrument, granularity, EmitReason::Rollover)
                    {
                        rolled.push(bar);
                    }
                    *builder = BarBuilder::new(granularity, bucket_start);
                }

                builder.apply(tick.price, tick.volume);
                current.push(builder.snapshot(&tick.instrument, granularity));
            }
        }

        let rolled_count = rolled.len();
        for bar in rolled {
            state.emit(bar);
        }

        trace!(
            instrument = %tick.instrument,
            price = tick.price,
            rolled = rolled_count,
            "Tick applied"
        );

        TickOutcome {
            rolled: rolled_count,
            current,
        }
    }

    /// Snapshot of the in-progress bar, if one exists.
    pub fn get_current_bar(
        &self,
        instrument: &InstrumentKey,
        granularity: Granularity,
    ) -> Option<BarSnapshot> {
        let state = self.lock();
        state
            .builders
            .get(instrument)
            .and_then(|per| per.get(&granularity))
            .filter(|b| !b.is_empty())
            .map(|b| b.snapshot(instrument, granularity))
    }

    /// Emits every non-empty builder and clears all builders.
    ///
    /// Returns the number of bars emitted. A second call with no ticks in
    /// between emits nothing.
    pub fn flush_all(&self) -> usize {
        let mut state = self.lock();
        let builders = std::mem::take(&mut state.builders);

        let mut emitted = 0;
        for (instrument, per_instrument) in builders {
            for (granularity, builder) in per_instrument {
                if let Some(bar) = builder.finish(&instrument, granularity, EmitReason::Flush) {
                    state.emit(bar);
                    emitted += 1;
                }
            }
        }

        info!(emitted, "Flushed in-progress bars");
        emitted
    }

    /// Drops every builder for `instrument`, emitting the non-empty ones.
    pub fn remove_instrument(&self, instrument: &InstrumentKey) -> usize {
        let mut state = self.lock();
        let Some(per_instrument) = state.builders.remove(instrument) else {
            return 0;
        };

        let mut emitted = 0;
        for (granularity, builder) in per_instrument {
            if let Some(bar) = builder.finish(instrument, granularity, EmitReason::Unsubscribe) {
                state.emit(bar);
                emitted += 1;
            }
        }

        debug!(instrument = %instrument, emitted, "Removed instrument builders");
        emitted
    }

    /// Drops the emitter. Bars emitted afterwards are logged and lost,
    /// so call this only after the final [`BarEngine::flush_all`].
    pub fn close_emitter(&self) {
        let mut state = self.lock();
        state.emitter = None;
    }

    pub fn active_instruments(&self) -> Vec<InstrumentKey> {
        let state = self.lock();
        let mut keys: Vec<_> = state.builders.keys().cloned().collect();
        keys.sort();
        keys
    }

    /// Total bars emitted since construction.
    pub fn emitted_total(&self) -> u64 {
        self.lock().emitted_total
    }
}
