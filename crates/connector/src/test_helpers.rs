//! Scripted provider connections for driving the protocol client without
//! a network.
//!
//! Each successful dial hands the test a [`ServerHandle`]: it sees every
//! frame the client sent and can push frames, inject transport errors,
//! stop reading or hang up.

use async_trait::async_trait;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use tokio::sync::mpsc;
use tokio::time::Instant;

use crate::codec;
use crate::error::WebSocketError;
use crate::traits::{Dialer, WireConnection};

pub struct ScriptedDialer {
    accepted: mpsc::UnboundedSender<ServerHandle>,
    refuse_remaining: AtomicUsize,
    dial_times: Mutex<Vec<Instant>>,
}

impl ScriptedDialer {
    pub fn new() -> (Self, mpsc::UnboundedReceiver<ServerHandle>) {
        Self::refusing(0)
    }

    /// The first `n` dials fail with a connection error.
    pub fn refusing(n: usize) -> (Self, mpsc::UnboundedReceiver<ServerHandle>) {
        let (accepted, rx) = mpsc::unbounded_channel();
        let dialer = Self {
            accepted,
            refuse_remaining: AtomicUsize::new(n),
            dial_times: Mutex::new(Vec::new()),
        };
        (dialer, rx)
    }

    /// Refuse the next `n` dials.
    pub fn refuse_next(&self, n: usize) {
        self.refuse_remaining.store(n, Ordering::SeqCst);
    }

    /// When each dial (successful or not) happened.
    pub fn dial_times(&self) -> Vec<Instant> {
        self.dial_times
            .lock()
            .map(|t| t.clone())
            .unwrap_or_default()
    }
}

#[async_trait]
impl Dialer for ScriptedDialer {
    async fn dial(&self) -> Result<Box<dyn WireConnection>, WebSocketError> {
        if let Ok(mut times) = self.dial_times.lock() {
            times.push(Instant::now());
        }

        let refused = self
            .refuse_remaining
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok();
        if refused {
            return Err(WebSocketError::Connection("connection refused".to_string()));
        }

        let (sent_tx, sent_rx) = mpsc::unbounded_channel();
        let (inbound_tx, inbound_rx) = mpsc::unbounded_channel();
        let stalled = Arc::new(AtomicBool::new(false));
        // A test that dropped the receiver just gets an unobserved connection
        let _ = self.accepted.send(ServerHandle {
            sent: sent_rx,
            inbound: Some(inbound_tx),
            stalled: Arc::clone(&stalled),
        });

        Ok(Box::new(ScriptedConnection {
            sent: sent_tx,
            inbound: inbound_rx,
            stalled,
        }))
    }
}

struct ScriptedConnection {
    sent: mpsc::UnboundedSender<String>,
    inbound: mpsc::UnboundedReceiver<Result<String, String>>,
    stalled: Arc<AtomicBool>,
}

#[async_trait]
impl WireConnection for ScriptedConnection {
    async fn send_text(&mut self, text: String) -> Result<(), WebSocketError> {
        if self.stalled.load(Ordering::SeqCst) {
            // Full socket buffer: the write never completes
            std::future::pending::<()>().await;
        }
        self.sent
            .send(text)
            .map_err(|_| WebSocketError::ConnectionClosed)
    }

    async fn recv_text(&mut self) -> Result<Option<String>, WebSocketError> {
        match self.inbound.recv().await {
            Some(Ok(text)) => Ok(Some(text)),
            Some(Err(reason)) => Err(WebSocketError::Connection(reason)),
            None => Ok(None),
        }
    }

    async fn close(&mut self) -> Result<(), WebSocketError> {
        Ok(())
    }
}

/// Provider side of one scripted connection.
pub struct ServerHandle {
    sent: mpsc::UnboundedReceiver<String>,
    inbound: Option<mpsc::UnboundedSender<Result<String, String>>>,
    stalled: Arc<AtomicBool>,
}

impl ServerHandle {
    /// Deliver a raw chunk (already framed).
    pub fn push(&self, chunk: &str) {
        if let Some(tx) = &self.inbound {
            let _ = tx.send(Ok(chunk.to_string()));
        }
    }

    /// Frame `payload` and deliver it.
    pub fn push_payload(&self, payload: &str) {
        self.push(&codec::encode(payload));
    }

    /// Make the client's next read fail.
    pub fn fail(&self, reason: &str) {
        if let Some(tx) = &self.inbound {
            let _ = tx.send(Err(reason.to_string()));
        }
    }

    /// Stop reading: every later client write hangs.
    pub fn stop_reading(&self) {
        self.stalled.store(true, Ordering::SeqCst);
    }

    /// Close from the provider side.
    pub fn hang_up(&mut self) {
        self.inbound = None;
    }

    /// Next raw frame sent by the client.
    pub async fn next_sent(&mut self) -> Option<String> {
        self.sent.recv().await
    }

    /// Every frame sent so far, as `(method, last param)`.
    pub fn drain_sent(&mut self) -> Vec<(String, String)> {
        let mut out = Vec::new();
        while let Ok(frame) = self.sent.try_recv() {
            out.push(sent_message(&frame));
        }
        out
    }
}

/// `(method, last param)` of a framed client command. Heartbeat echoes
/// come back as `("~h~", seq)`.
pub fn sent_message(frame: &str) -> (String, String) {
    let payload = codec::decode(frame)
        .ok()
        .and_then(|mut p| p.pop())
        .unwrap_or_default();

    if let Some(seq) = payload.strip_prefix("~h~") {
        return ("~h~".to_string(), seq.to_string());
    }

    let value: serde_json::Value = serde_json::from_str(&payload).unwrap_or_default();
    let method = value["m"].as_str().unwrap_or_default().to_string();
    let last = value["p"]
        .as_array()
        .and_then(|p| p.last())
        .and_then(|v| v.as_str())
        .unwrap_or_default()
        .to_string();
    (method, last)
}
