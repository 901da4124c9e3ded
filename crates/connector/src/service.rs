//! Quote stream service
//!
//! Wires one [`ProtocolClient`], one [`BarEngine`], the quote cache, the
//! tick dispatcher and the bar flusher into the process-facing surface.
//! Construct one per process and share it by reference.

use quotebar_aggregate::BarEngine;
use quotebar_metadata::StreamConfig;
use quotebar_middleware::{BarSink, Cache, QuoteCache};
use quotebar_schema::{BarSnapshot, CompletedBar, Granularity, InstrumentKey, Quote};
use serde::Serialize;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tracing::{error, info, warn};

use crate::client::{ClientSettings, ConnectionState, ProtocolClient};
use crate::dispatcher::TickDispatcher;
use crate::error::ConnectorError;
use crate::flusher::{run_flusher, FlushStats};
use crate::metrics;
use crate::pool::{self, BlockingPool, HistoricalBar, HistoricalSource};
use crate::traits::Dialer;

/// Point-in-time view for `/status`.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ServiceStatus {
    pub connection_state: ConnectionState,
    /// `EXCHANGE:SYMBOL`, in subscription order
    pub subscribed_instruments: Vec<String>,
}

struct Tasks {
    dispatcher: JoinHandle<()>,
    flusher: JoinHandle<FlushStats>,
}

pub struct QuoteStreamService {
    config: StreamConfig,
    client: ProtocolClient,
    engine: Arc<BarEngine>,
    quotes: QuoteCache,
    sink: Arc<dyn BarSink>,
    pool: BlockingPool,
    history: Option<Arc<dyn HistoricalSource>>,
    bars: Mutex<Option<mpsc::UnboundedReceiver<CompletedBar>>>,
    tasks: Mutex<Option<Tasks>>,
    stopped: AtomicBool,
}

fn lock<T>(m: &Mutex<T>) -> MutexGuard<'_, T> {
    m.lock().unwrap_or_else(PoisonError::into_inner)
}

impl QuoteStreamService {
    pub fn new(
        config: StreamConfig,
        dialer: Arc<dyn Dialer>,
        cache: Arc<dyn Cache>,
        sink: Arc<dyn BarSink>,
    ) -> Result<Self, ConnectorError> {
        config.validate()?;

        let client = ProtocolClient::new(dialer, ClientSettings::from_config(&config));
        let (engine, bars) = BarEngine::with_channel(config.aggregation.granularities.clone());
        let quotes = QuoteCache::with_ttls(
            cache,
            Duration::from_secs(config.cache.quote_ttl_secs),
            Duration::from_secs(config.cache.bar_ttl_secs),
        );
        let pool = BlockingPool::new(config.workers.blocking_pool_size);

        Ok(Self {
            config,
            client,
            engine: Arc::new(engine),
            quotes,
            sink,
            pool,
            history: None,
            bars: Mutex::new(Some(bars)),
            tasks: Mutex::new(None),
            stopped: AtomicBool::new(false),
        })
    }

    /// Attach the blocking backfill collaborator used by
    /// [`QuoteStreamService::fetch_history`].
    pub fn with_history(mut self, source: Arc<dyn HistoricalSource>) -> Self {
        self.history = Some(source);
        self
    }

    /// Spawn the dispatcher and flusher, subscribe the configured symbols
    /// and start connecting. Returns before the connection is up.
    pub async fn start(&self) -> Result<(), ConnectorError> {
        if self.stopped.load(Ordering::SeqCst) {
            return Err(ConnectorError::Closed);
        }
        let instruments = self.config.instruments()?;
        let bars = lock(&self.bars)
            .take()
            .ok_or(ConnectorError::AlreadyStarted)?;

        let (payload_tx, payload_rx) = mpsc::channel(self.config.connection.payload_buffer);
        let dispatcher = TickDispatcher::new(
            Arc::clone(&self.engine),
            self.quotes.clone(),
            self.config.aggregation.cache_current_bars,
            self.client.subscription_gate(),
        );

        let dispatcher = tokio::spawn(dispatcher.run(payload_rx));
        let flusher = tokio::spawn(run_flusher(bars, Arc::clone(&self.sink)));
        *lock(&self.tasks) = Some(Tasks { dispatcher, flusher });

        for instrument in instruments {
            self.client.subscribe(instrument);
        }
        self.client.connect(payload_tx).await?;

        info!(
            url = %self.config.provider.url,
            instruments = self.client.subscriptions().len(),
            granularities = ?self.engine.granularities(),
            "Quote stream started"
        );
        Ok(())
    }

    /// Close the connection, drain queued payloads, flush every
    /// in-progress bar and wait for the sink to receive them. Calls after
    /// the first return immediately.
    pub async fn stop(&self) {
        if self.stopped.swap(true, Ordering::SeqCst) {
            return;
        }
        info!("Stopping quote stream");

        // Ends the session task, which drops the payload sender
        self.client.disconnect().await;

        let tasks = lock(&self.tasks).take();
        let flusher = match tasks {
            Some(Tasks { dispatcher, flusher }) => {
                if let Err(e) = dispatcher.await {
                    error!(error = %e, "Tick dispatcher ended abnormally");
                }
                Some(flusher)
            }
            None => None,
        };

        let flushed = self.engine.flush_all();
        self.engine.close_emitter();

        let stats = match flusher {
            Some(flusher) => match flusher.await {
                Ok(stats) => stats,
                Err(e) => {
                    error!(error = %e, "Bar flusher ended abnormally");
                    FlushStats::default()
                }
            },
            None => FlushStats::default(),
        };

        info!(
            flushed,
            written = stats.written,
            failed = stats.failed,
            emitted_total = self.engine.emitted_total(),
            "Quote stream stopped"
        );
    }

    /// Returns false if already subscribed.
    pub fn subscribe(&self, instrument: InstrumentKey) -> bool {
        let added = self.client.subscribe(instrument.clone());
        if added {
            info!(instrument = %instrument, "Subscribed");
        }
        added
    }

    /// Remove the subscription, emit its in-progress bars and clear its
    /// latest quote. Returns false if it was not subscribed.
    pub async fn unsubscribe(&self, instrument: &InstrumentKey) -> bool {
        // Registry first: from here on the dispatcher drops this
        // instrument's ticks, so the builders removed below stay gone.
        if !self.client.unsubscribe(instrument) {
            return false;
        }

        let emitted = self.engine.remove_instrument(instrument);
        if let Err(e) = self.quotes.clear_latest(instrument).await {
            warn!(instrument = %instrument, error = %e, "Failed to clear latest quote");
            metrics::inc_cache_failure("clear_latest");
        }

        info!(instrument = %instrument, emitted, "Unsubscribed");
        true
    }

    pub fn status(&self) -> ServiceStatus {
        ServiceStatus {
            connection_state: self.client.state(),
            subscribed_instruments: self
                .client
                .subscriptions()
                .iter()
                .map(InstrumentKey::wire_name)
                .collect(),
        }
    }

    pub fn connection_state(&self) -> ConnectionState {
        self.client.state()
    }

    pub fn state_watch(&self) -> watch::Receiver<ConnectionState> {
        self.client.state_watch()
    }

    /// Latest quote from the cache, `None` if absent or expired.
    pub async fn latest_quote(
        &self,
        instrument: &InstrumentKey,
    ) -> Result<Option<Quote>, ConnectorError> {
        Ok(self.quotes.get_latest(instrument).await?)
    }

    /// In-progress bar straight from the engine.
    pub fn current_bar(&self, instrument: &InstrumentKey, granularity: Granularity) -> Option<BarSnapshot> {
        self.engine.get_current_bar(instrument, granularity)
    }

    /// Backfill through the attached historical source on the blocking
    /// pool. Not used by the streaming path.
    pub async fn fetch_history(
        &self,
        instrument: InstrumentKey,
        granularity: Granularity,
        max_count: usize,
    ) -> Result<Vec<HistoricalBar>, ConnectorError> {
        let source = self
            .history
            .clone()
            .ok_or_else(|| ConnectorError::History("no historical source attached".to_string()))?;
        pool::fetch_history(&self.pool, source, instrument, granularity, max_count).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::codec::encode;
    use crate::test_helpers::{sent_message, ScriptedDialer, ServerHandle};
    use chrono::{TimeZone, Utc};
    use quotebar_middleware::{InMemoryBarStore, InMemoryCache};
    use quotebar_schema::{BarKey, Ohlcv};

    fn qsd(session: &str, symbol: &str, lp: f64, lp_time: i64) -> String {
        format!(
            r#"{{"m":"qsd","p":["{session}",{{"n":"{symbol}","s":"ok","v":{{"lp":{lp},"volume":2,"lp_time":{lp_time}}}}}]}}"#
        )
    }

    fn aapl() -> InstrumentKey {
        InstrumentKey::new("NASDAQ", "AAPL").unwrap()
    }

    fn service(store: &InMemoryBarStore) -> (QuoteStreamService, mpsc::UnboundedReceiver<ServerHandle>) {
        let (dialer, servers) = ScriptedDialer::new();
        let mut config = StreamConfig::default();
        config.symbols = vec!["NASDAQ:AAPL".to_string()];
        config.aggregation.granularities = vec![Granularity::Minute1];
        let service = QuoteStreamService::new(
            config,
            Arc::new(dialer),
            Arc::new(InMemoryCache::new()),
            Arc::new(store.clone()),
        )
        .unwrap();
        (service, servers)
    }

    /// Reads the handshake and returns the quote session id.
    async fn accept(server: &mut ServerHandle) -> String {
        let (method, session) = sent_message(&server.next_sent().await.unwrap());
        assert_eq!(method, "quote_create_session");
        let (method, _) = sent_message(&server.next_sent().await.unwrap());
        assert_eq!(method, "quote_set_fields");
        let (method, symbol) = sent_message(&server.next_sent().await.unwrap());
        assert_eq!((method.as_str(), symbol.as_str()), ("quote_add_symbols", "NASDAQ:AAPL"));
        session
    }

    /// Polls until the in-progress 1m bar is the one starting at `start`.
    async fn wait_for_bar(service: &QuoteStreamService, start: chrono::DateTime<Utc>) {
        for _ in 0..200 {
            if service
                .current_bar(&aapl(), Granularity::Minute1)
                .is_some_and(|b| b.bucket_start == start)
            {
                return;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        panic!("engine never opened the bar at {}", start);
    }

    fn minute(m: u32) -> chrono::DateTime<Utc> {
        Utc.with_ymd_and_hms(2024, 1, 2, 15, m, 0).unwrap()
    }

    #[tokio::test]
    async fn test_ticks_to_bars_and_flush_on_stop() {
        let store = InMemoryBarStore::new();
        let (service, mut servers) = service(&store);
        service.start().await.unwrap();

        let mut server = servers.recv().await.unwrap();
        let session = accept(&mut server).await;
        let mut state = service.state_watch();
        state.wait_for(|s| *s == ConnectionState::Running).await.unwrap();

        let t0 = minute(0).timestamp();
        server.push_payload(&qsd(&session, "NASDAQ:AAPL", 100.0, t0));
        server.push_payload(&qsd(&session, "NASDAQ:AAPL", 105.0, t0 + 30));
        // Next minute: rolls the first bar over
        server.push_payload(&qsd(&session, "NASDAQ:AAPL", 101.0, t0 + 61));
        wait_for_bar(&service, minute(1)).await;

        let quote = service.latest_quote(&aapl()).await.unwrap().unwrap();
        assert_eq!(quote.last_price, 101.0);

        let status = service.status();
        assert_eq!(status.connection_state, ConnectionState::Running);
        assert_eq!(status.subscribed_instruments, vec!["NASDAQ:AAPL".to_string()]);

        service.stop().await;
        assert_eq!(service.connection_state(), ConnectionState::Closed);

        let first = store
            .get(&BarKey { instrument: aapl(), granularity: Granularity::Minute1, bucket_start: minute(0) })
            .await
            .unwrap();
        assert_eq!(first, Ohlcv { open: 100.0, high: 105.0, low: 100.0, close: 105.0, volume: 4.0 });

        let second = store
            .get(&BarKey { instrument: aapl(), granularity: Granularity::Minute1, bucket_start: minute(1) })
            .await
            .unwrap();
        assert_eq!(second.close, 101.0);
        assert_eq!(store.len().await, 2);
        assert!(service.current_bar(&aapl(), Granularity::Minute1).is_none());
    }

    #[tokio::test]
    async fn test_unsubscribe_emits_bar_and_clears_quote() {
        let store = InMemoryBarStore::new();
        let (service, mut servers) = service(&store);
        service.start().await.unwrap();

        let mut server = servers.recv().await.unwrap();
        let session = accept(&mut server).await;
        let mut state = service.state_watch();
        state.wait_for(|s| *s == ConnectionState::Running).await.unwrap();

        server.push_payload(&qsd(&session, "NASDAQ:AAPL", 50.0, minute(5).timestamp()));
        wait_for_bar(&service, minute(5)).await;

        assert!(service.unsubscribe(&aapl()).await);
        assert!(!service.unsubscribe(&aapl()).await);

        let (method, symbol) = sent_message(&server.next_sent().await.unwrap());
        assert_eq!((method.as_str(), symbol.as_str()), ("quote_remove_symbols", "NASDAQ:AAPL"));
        assert!(service.latest_quote(&aapl()).await.unwrap().is_none());
        assert!(service.current_bar(&aapl(), Granularity::Minute1).is_none());
        assert!(service.status().subscribed_instruments.is_empty());

        service.stop().await;
        assert_eq!(store.len().await, 1);
        assert_eq!(store.writes(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_received_ticks_survive_reconnect() {
        let store = InMemoryBarStore::new();
        let (service, mut servers) = service(&store);
        service.start().await.unwrap();

        let mut first = servers.recv().await.unwrap();
        let session = accept(&mut first).await;
        let mut state = service.state_watch();
        state.wait_for(|s| *s == ConnectionState::Running).await.unwrap();

        let t0 = minute(7).timestamp();
        let chunk: String = [(20.0, 0), (22.0, 10), (21.0, 20)]
            .iter()
            .map(|(price, secs)| encode(&qsd(&session, "NASDAQ:AAPL", *price, t0 + secs)))
            .collect();
        first.push(&chunk);
        first.fail("connection reset by peer");

        let mut second = servers.recv().await.unwrap();
        let next_session = accept(&mut second).await;
        assert_ne!(next_session, session);
        state.wait_for(|s| *s == ConnectionState::Running).await.unwrap();

        service.stop().await;

        let bar = store
            .get(&BarKey { instrument: aapl(), granularity: Granularity::Minute1, bucket_start: minute(7) })
            .await
            .expect("ticks received before the reset were lost");
        assert_eq!(bar, Ohlcv { open: 20.0, high: 22.0, low: 20.0, close: 21.0, volume: 6.0 });
        assert_eq!(store.len().await, 1);
    }

    #[tokio::test]
    async fn test_lifecycle_guards() {
        let store = InMemoryBarStore::new();
        let (service, _servers) = service(&store);

        service.start().await.unwrap();
        assert!(matches!(service.start().await, Err(ConnectorError::AlreadyStarted)));

        service.stop().await;
        service.stop().await;
        assert!(matches!(service.start().await, Err(ConnectorError::Closed)));
        assert!(store.is_empty().await);
    }

    #[tokio::test]
    async fn test_history_requires_source() {
        let store = InMemoryBarStore::new();
        let (service, _servers) = service(&store);
        let result = service.fetch_history(aapl(), Granularity::Day1, 10).await;
        assert!(matches!(result, Err(ConnectorError::History(_))));
    }

    #[test]
    fn test_invalid_config_is_rejected() {
        let (dialer, _servers) = ScriptedDialer::new();
        let mut config = StreamConfig::default();
        config.symbols = vec!["no-colon".to_string()];
        let result = QuoteStreamService::new(
            config,
            Arc::new(dialer),
            Arc::new(InMemoryCache::new()),
            Arc::new(InMemoryBarStore::new()),
        );
        assert!(matches!(result, Err(ConnectorError::Config(_))));
    }
}
