//! Tick dispatcher
//!
//! Classifies decoded payloads and fans each tick out to the latest-quote
//! cache and the bar engine. The two writes are independent: a cache
//! failure is logged and counted, and the tick still reaches the engine.
//! Ticks for instruments no longer in the registry go nowhere.

use chrono::Utc;
use quotebar_aggregate::BarEngine;
use quotebar_middleware::QuoteCache;
use quotebar_schema::Quote;
use std::sync::Arc;
use tokio::sync::mpsc;
use tracing::{debug, error, info, trace, warn};

use crate::client::{SessionPayload, SubscriptionGate};
use crate::messages::ProviderMessage;
use crate::metrics;

/// What a payload turned out to be.
#[derive(Debug, Clone, PartialEq)]
pub enum Dispatched {
    Tick(Quote),
    Heartbeat,
    SessionControl,
    Dropped(&'static str),
}

pub struct TickDispatcher {
    engine: Arc<BarEngine>,
    quotes: QuoteCache,
    cache_current_bars: bool,
    subscriptions: SubscriptionGate,
}

impl TickDispatcher {
    pub fn new(
        engine: Arc<BarEngine>,
        quotes: QuoteCache,
        cache_current_bars: bool,
        subscriptions: SubscriptionGate,
    ) -> Self {
        Self {
            engine,
            quotes,
            cache_current_bars,
            subscriptions,
        }
    }

    /// Consume payloads until the channel closes. One payload at a time,
    /// in arrival order.
    pub async fn run(self, mut payloads: mpsc::Receiver<SessionPayload>) {
        let mut ticks: u64 = 0;
        while let Some(inbound) = payloads.recv().await {
            if let Dispatched::Tick(_) = self.dispatch(&inbound.session, &inbound.payload).await {
                ticks += 1;
            }
        }
        info!(ticks, "Tick dispatcher stopped");
    }

    /// Handle one payload delivered on quote session `session`. Quote
    /// updates addressed to any other session are dropped.
    pub async fn dispatch(&self, session: &str, payload: &str) -> Dispatched {
        let outcome = match self.classify(session, payload) {
            Dispatched::Tick(quote) => self.apply(quote).await,
            other => other,
        };
        if let Dispatched::Dropped(reason) = &outcome {
            metrics::inc_dropped(reason);
        }
        outcome
    }

    fn classify(&self, live_session: &str, payload: &str) -> Dispatched {
        let message = match ProviderMessage::parse(payload) {
            Ok(m) => m,
            Err(e) => {
                warn!(error = %e, payload = %truncate(payload), "Dropping unparseable payload");
                return Dispatched::Dropped("malformed");
            }
        };

        match message {
            ProviderMessage::Heartbeat(_) => Dispatched::Heartbeat,
            ProviderMessage::Hello { session_id } => {
                debug!(server_session = %session_id, "Provider hello");
                Dispatched::SessionControl
            }
            ProviderMessage::QuoteCompleted { symbol, .. } => {
                debug!(symbol = ?symbol, "Quote snapshot completed");
                Dispatched::SessionControl
            }
            ProviderMessage::Error { method, params } => {
                error!(method = %method, params = ?params, "Provider reported an error");
                Dispatched::SessionControl
            }
            ProviderMessage::Other { method } => {
                debug!(method = %method, "Ignoring provider message");
                Dispatched::Dropped("unhandled_method")
            }
            ProviderMessage::QuoteData { session, data } => {
                if session != live_session {
                    debug!(session = %session, live = %live_session, "Dropping quote for stale session");
                    return Dispatched::Dropped("stale_session");
                }
                match data.to_quote(Utc::now()) {
                    Some(quote) => Dispatched::Tick(quote),
                    None => {
                        trace!(symbol = %data.n, "Partial quote update without last price");
                        Dispatched::Dropped("no_last_price")
                    }
                }
            }
        }
    }

    async fn apply(&self, quote: Quote) -> Dispatched {
        let tick = quote.to_tick();
        let Some(outcome) = self
            .subscriptions
            .if_subscribed(&quote.instrument, || self.engine.add_tick(&tick))
        else {
            debug!(instrument = %quote.instrument, "Dropping tick for unsubscribed instrument");
            return Dispatched::Dropped("unsubscribed");
        };
        metrics::inc_tick(quote.instrument.exchange());

        if let Err(e) = self.quotes.set_latest(&quote).await {
            warn!(instrument = %quote.instrument, error = %e, "Latest quote cache write failed");
            metrics::inc_cache_failure("latest_quote");
        }

        if self.cache_current_bars {
            for snapshot in &outcome.current {
                if let Err(e) = self.quotes.set_current_bar(snapshot).await {
                    warn!(
                        instrument = %snapshot.instrument,
                        granularity = %snapshot.granularity,
                        error = %e,
                        "Current bar cache write failed"
                    );
                    metrics::inc_cache_failure("current_bar");
                }
            }
        }

        trace!(
            instrument = %quote.instrument,
            price = quote.last_price,
            rolled = outcome.rolled,
            "Tick dispatched"
        );
        Dispatched::Tick(quote)
    }
}

fn truncate(s: &str) -> String {
    s.chars().take(128).collect()
}
