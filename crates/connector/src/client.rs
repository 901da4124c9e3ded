//! Protocol client
//!
//! Owns one logical provider session. A spawned task drives the
//! connection through
//! `disconnected → connecting → connected → resubscribing → running`,
//! echoes heartbeats, forwards every other decoded payload in arrival
//! order tagged with the quote session it arrived on, and on any
//! transport failure backs off and reconnects.
//!
//! Subscription changes always update the registry. They are sent live
//! only once the current connection has taken its resubscription
//! snapshot; earlier changes ride along with that snapshot instead.

use quotebar_metadata::StreamConfig;
use quotebar_schema::InstrumentKey;
use serde::Serialize;
use std::fmt;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tokio::time::{sleep, Instant};
use tracing::{debug, error, info, trace, warn};

use crate::backoff::Backoff;
use crate::codec::{encode, FrameDecoder};
use crate::error::ConnectorError;
use crate::messages::{self, is_heartbeat};
use crate::metrics;
use crate::registry::SubscriptionRegistry;
use crate::traits::{Dialer, WireConnection};

const CLOSE_TIMEOUT: Duration = Duration::from_secs(5);

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ConnectionState {
    Disconnected,
    Connecting,
    Connected,
    Resubscribing,
    Running,
    BackingOff,
    Closed,
}

impl ConnectionState {
    pub const fn as_str(&self) -> &'static str {
        match self {
            Self::Disconnected => "disconnected",
            Self::Connecting => "connecting",
            Self::Connected => "connected",
            Self::Resubscribing => "resubscribing",
            Self::Running => "running",
            Self::BackingOff => "backing_off",
            Self::Closed => "closed",
        }
    }

    const fn code(&self) -> i64 {
        match self {
            Self::Disconnected => 0,
            Self::Connecting => 1,
            Self::Connected => 2,
            Self::Resubscribing => 3,
            Self::Running => 4,
            Self::BackingOff => 5,
            Self::Closed => 6,
        }
    }

    /// The resubscription snapshot for this connection has been taken.
    const fn sends_live(&self) -> bool {
        matches!(self, Self::Resubscribing | Self::Running)
    }
}

impl fmt::Display for ConnectionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone)]
pub struct ClientSettings {
    pub auth_token: Option<String>,
    pub quote_fields: Vec<String>,
    /// Inbound silence longer than this fails the connection
    pub heartbeat_timeout: Duration,
    /// Sustained `running` time that resets the backoff
    pub stability_window: Duration,
    pub backoff: Backoff,
}

impl Default for ClientSettings {
    fn default() -> Self {
        Self::from_config(&StreamConfig::default())
    }
}

impl ClientSettings {
    pub fn from_config(config: &StreamConfig) -> Self {
        let conn = &config.connection;
        Self {
            auth_token: config.provider.auth_token.clone(),
            quote_fields: config.provider.quote_fields.clone(),
            heartbeat_timeout: conn.heartbeat_timeout(),
            stability_window: conn.stability_window(),
            backoff: Backoff::new(conn.backoff_base(), conn.backoff_max()),
        }
    }
}

#[derive(Debug)]
enum Command {
    Subscribe(InstrumentKey),
    Unsubscribe(InstrumentKey),
}

struct Shared {
    state: ConnectionState,
    registry: SubscriptionRegistry,
}

struct Inner {
    dialer: Arc<dyn Dialer>,
    settings: ClientSettings,
    shared: Mutex<Shared>,
    state_tx: watch::Sender<ConnectionState>,
    commands_tx: mpsc::UnboundedSender<Command>,
}

/// One decoded non-heartbeat payload and the quote session of the
/// connection that delivered it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SessionPayload {
    pub session: Arc<str>,
    pub payload: String,
}

/// Registry view handed to the tick path.
#[derive(Clone)]
pub struct SubscriptionGate {
    inner: Arc<Inner>,
}

impl SubscriptionGate {
    /// Run `f` only while `instrument` is subscribed. The registry lock is
    /// held for the duration, so `f` never overlaps an unsubscribe.
    pub fn if_subscribed<T>(&self, instrument: &InstrumentKey, f: impl FnOnce() -> T) -> Option<T> {
        let shared = self.inner.lock();
        shared.registry.contains(instrument).then(f)
    }
}

pub struct ProtocolClient {
    inner: Arc<Inner>,
    commands_rx: Mutex<Option<mpsc::UnboundedReceiver<Command>>>,
    shutdown_tx: watch::Sender<bool>,
    task: Mutex<Option<JoinHandle<()>>>,
}

fn lock<T>(m: &Mutex<T>) -> MutexGuard<'_, T> {
    m.lock().unwrap_or_else(PoisonError::into_inner)
}

impl ProtocolClient {
    pub fn new(dialer: Arc<dyn Dialer>, settings: ClientSettings) -> Self {
        let (commands_tx, commands_rx) = mpsc::unbounded_channel();
        let (state_tx, _) = watch::channel(ConnectionState::Disconnected);
        let (shutdown_tx, _) = watch::channel(false);

        Self {
            inner: Arc::new(Inner {
                dialer,
                settings,
                shared: Mutex::new(Shared {
                    state: ConnectionState::Disconnected,
                    registry: SubscriptionRegistry::new(),
                }),
                state_tx,
                commands_tx,
            }),
            commands_rx: Mutex::new(Some(commands_rx)),
            shutdown_tx,
            task: Mutex::new(None),
        }
    }

    /// Start the session task. Decoded non-heartbeat payloads go to
    /// `payloads` in wire order. Returns once the task is spawned; the
    /// connection itself is established (and re-established) in the
    /// background.
    pub async fn connect(&self, payloads: mpsc::Sender<SessionPayload>) -> Result<(), ConnectorError> {
        if self.state() == ConnectionState::Closed {
            return Err(ConnectorError::Closed);
        }
        let commands = lock(&self.commands_rx)
            .take()
            .ok_or(ConnectorError::AlreadyStarted)?;

        let shutdown = self.shutdown_tx.subscribe();
        let inner = Arc::clone(&self.inner);
        let handle = tokio::spawn(async move {
            inner.run(commands, payloads, shutdown).await;
        });
        *lock(&self.task) = Some(handle);
        Ok(())
    }

    /// Stop the session and move to `closed`. Interrupts a pending backoff
    /// sleep. Safe to call more than once.
    pub async fn disconnect(&self) {
        self.shutdown_tx.send_replace(true);
        lock(&self.commands_rx).take();

        let handle = lock(&self.task).take();
        if let Some(handle) = handle {
            if let Err(e) = handle.await {
                error!(error = %e, "Session task ended abnormally");
            }
        }

        let mut shared = self.inner.lock();
        if shared.state != ConnectionState::Closed {
            self.inner.transition(&mut shared, ConnectionState::Closed);
            info!("Protocol client closed");
        }
    }

    /// Add to the registry. Returns false if already subscribed.
    pub fn subscribe(&self, instrument: InstrumentKey) -> bool {
        let mut shared = self.inner.lock();
        if !shared.registry.insert(instrument.clone()) {
            return false;
        }
        metrics::set_subscribed(shared.registry.len());

        // Enqueued under the lock: the session task drains the queue and
        // snapshots the registry under the same lock.
        if shared.state.sends_live() {
            if self.inner.commands_tx.send(Command::Subscribe(instrument.clone())).is_err() {
                debug!(instrument = %instrument, "Session task gone, subscription kept in registry");
            }
        } else {
            debug!(instrument = %instrument, state = %shared.state, "Subscription deferred to next resubscription");
        }
        true
    }

    /// Remove from the registry. Returns false if not subscribed.
    pub fn unsubscribe(&self, instrument: &InstrumentKey) -> bool {
        let mut shared = self.inner.lock();
        if !shared.registry.remove(instrument) {
            return false;
        }
        metrics::set_subscribed(shared.registry.len());

        if shared.state.sends_live() {
            if self.inner.commands_tx.send(Command::Unsubscribe(instrument.clone())).is_err() {
                debug!(instrument = %instrument, "Session task gone, removal kept in registry");
            }
        }
        true
    }

    pub fn state(&self) -> ConnectionState {
        self.inner.lock().state
    }

    /// True only in `running`.
    pub fn is_connected(&self) -> bool {
        self.state() == ConnectionState::Running
    }

    /// Registry contents in subscription order.
    pub fn subscriptions(&self) -> Vec<InstrumentKey> {
        self.inner.lock().registry.snapshot()
    }

    pub fn is_subscribed(&self, instrument: &InstrumentKey) -> bool {
        self.inner.lock().registry.contains(instrument)
    }

    pub fn state_watch(&self) -> watch::Receiver<ConnectionState> {
        self.inner.state_tx.subscribe()
    }

    pub fn subscription_gate(&self) -> SubscriptionGate {
        SubscriptionGate {
            inner: Arc::clone(&self.inner),
        }
    }
}

impl Inner {
    fn lock(&self) -> MutexGuard<'_, Shared> {
        lock(&self.shared)
    }

    fn transition(&self, shared: &mut Shared, next: ConnectionState) {
        if shared.state == next || shared.state == ConnectionState::Closed {
            return;
        }
        debug!(from = %shared.state, to = %next, "Connection state change");
        shared.state = next;
        self.state_tx.send_replace(next);
        metrics::set_connection_state(next.code());
    }

    fn set_state(&self, next: ConnectionState) {
        let mut shared = self.lock();
        self.transition(&mut shared, next);
    }

    async fn run(
        &self,
        mut commands: mpsc::UnboundedReceiver<Command>,
        payloads: mpsc::Sender<SessionPayload>,
        mut shutdown: watch::Receiver<bool>,
    ) {
        let mut failures: u32 = 0;

        loop {
            if *shutdown.borrow() {
                break;
            }

            self.set_state(ConnectionState::Connecting);
            match self.session(&mut commands, &payloads, &mut shutdown, &mut failures).await {
                Ok(()) => break,
                Err(ConnectorError::Closed) => {
                    debug!("Shutdown interrupted a pending write");
                    break;
                }
                Err(e) => warn!(error = %e, failures, "Provider connection failed"),
            }

            if *shutdown.borrow() {
                break;
            }

            let delay = self.settings.backoff.delay(failures);
            failures = failures.saturating_add(1);
            self.set_state(ConnectionState::BackingOff);
            info!(delay_secs = delay.as_secs_f64(), failures, "Backing off before reconnect");

            tokio::select! {
                _ = sleep(delay) => metrics::inc_reconnect(),
                changed = shutdown.changed() => {
                    if changed.is_err() {
                        break;
                    }
                }
            }
        }

        self.set_state(ConnectionState::Disconnected);
        debug!("Session task finished");
    }

    /// One connection lifetime. `Ok` means stop for good (shutdown or the
    /// payload consumer went away); `Err` means reconnect.
    async fn session(
        &self,
        commands: &mut mpsc::UnboundedReceiver<Command>,
        payloads: &mpsc::Sender<SessionPayload>,
        shutdown: &mut watch::Receiver<bool>,
        failures: &mut u32,
    ) -> Result<(), ConnectorError> {
        let mut conn = tokio::select! {
            dialed = self.dialer.dial() => {
                dialed.map_err(|e| ConnectorError::ConnectionFailed(e.to_string()))?
            }
            _ = shutdown.changed() => return Ok(()),
        };
        self.set_state(ConnectionState::Connected);

        let result = self
            .drive(conn.as_mut(), commands, payloads, shutdown, failures)
            .await;

        match tokio::time::timeout(CLOSE_TIMEOUT, conn.close()).await {
            Ok(Ok(())) => {}
            Ok(Err(e)) => debug!(error = %e, "Error closing connection"),
            Err(_) => debug!("Timed out closing connection"),
        }
        result
    }

    async fn drive(
        &self,
        conn: &mut dyn WireConnection,
        commands: &mut mpsc::UnboundedReceiver<Command>,
        payloads: &mpsc::Sender<SessionPayload>,
        shutdown: &mut watch::Receiver<bool>,
        failures: &mut u32,
    ) -> Result<(), ConnectorError> {
        let session = messages::generate_session_id();
        let tag: Arc<str> = Arc::from(session.as_str());
        self.handshake(conn, &session, shutdown)
            .await
            .map_err(|e| match e {
                ConnectorError::Closed => e,
                other => ConnectorError::HandshakeFailed(other.to_string()),
            })?;

        let snapshot = {
            let mut shared = self.lock();
            // Queued changes are already reflected in the registry
            while commands.try_recv().is_ok() {}
            self.transition(&mut shared, ConnectionState::Resubscribing);
            shared.registry.snapshot()
        };
        for instrument in &snapshot {
            self.send(conn, &messages::quote_add_symbols(&session, instrument)?, shutdown)
                .await?;
        }
        self.set_state(ConnectionState::Running);
        info!(session = %session, instruments = snapshot.len(), "Quote session running");

        let heartbeat_timeout = self.settings.heartbeat_timeout;
        let heartbeat_deadline = sleep(heartbeat_timeout);
        tokio::pin!(heartbeat_deadline);
        let stability = sleep(self.settings.stability_window);
        tokio::pin!(stability);
        let mut stable = false;
        let mut decoder = FrameDecoder::new();

        loop {
            tokio::select! {
                biased;

                _ = shutdown.changed() => {
                    info!("Shutdown requested, closing quote session");
                    return Ok(());
                }
                _ = &mut heartbeat_deadline => {
                    return Err(ConnectorError::HeartbeatTimeout(heartbeat_timeout));
                }
                Some(command) = commands.recv() => {
                    let payload = match &command {
                        Command::Subscribe(k) => messages::quote_add_symbols(&session, k)?,
                        Command::Unsubscribe(k) => messages::quote_remove_symbols(&session, k)?,
                    };
                    self.send(conn, &payload, shutdown).await?;
                    debug!(command = ?command, "Sent subscription change");
                }
                _ = &mut stability, if !stable => {
                    stable = true;
                    if *failures > 0 {
                        info!(previous_failures = *failures, "Connection stable, backoff reset");
                    }
                    *failures = 0;
                }
                received = conn.recv_text() => {
                    let Some(text) = received? else {
                        return Err(ConnectorError::Disconnected("closed by provider".to_string()));
                    };

                    for payload in decoder.decode(&text)? {
                        if is_heartbeat(&payload) {
                            trace!(heartbeat = %payload, "Echoing heartbeat");
                            self.send(conn, &payload, shutdown).await?;
                            metrics::inc_heartbeat();
                            continue;
                        }
                        let inbound = SessionPayload {
                            session: Arc::clone(&tag),
                            payload,
                        };
                        if payloads.send(inbound).await.is_err() {
                            info!("Payload consumer dropped, ending quote session");
                            return Ok(());
                        }
                    }
                    heartbeat_deadline.as_mut().reset(Instant::now() + heartbeat_timeout);
                }
            }
        }
    }

    async fn handshake(
        &self,
        conn: &mut dyn WireConnection,
        session: &str,
        shutdown: &mut watch::Receiver<bool>,
    ) -> Result<(), ConnectorError> {
        if let Some(token) = &self.settings.auth_token {
            self.send(conn, &messages::set_auth_token(token)?, shutdown).await?;
        }
        self.send(conn, &messages::quote_create_session(session)?, shutdown)
            .await?;
        self.send(
            conn,
            &messages::quote_set_fields(session, &self.settings.quote_fields)?,
            shutdown,
        )
        .await?;
        debug!(session = %session, "Handshake sent");
        Ok(())
    }

    /// Frame and write one payload. A provider that stops reading fails
    /// the connection after `heartbeat_timeout`; shutdown abandons the
    /// write with [`ConnectorError::Closed`].
    async fn send(
        &self,
        conn: &mut dyn WireConnection,
        payload: &str,
        shutdown: &mut watch::Receiver<bool>,
    ) -> Result<(), ConnectorError> {
        let limit = self.settings.heartbeat_timeout;
        tokio::select! {
            sent = tokio::time::timeout(limit, conn.send_text(encode(payload))) => match sent {
                Ok(result) => Ok(result?),
                Err(_) => Err(ConnectorError::SendTimeout(limit)),
            },
            _ = shutdown.changed() => Err(ConnectorError::Closed),
        }
    }
}
