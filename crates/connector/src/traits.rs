use async_trait::async_trait;

use crate::error::WebSocketError;

/// One open text-message connection to the provider.
///
/// `recv_text` must be cancel-safe: the client polls it inside `select!`.
#[async_trait]
pub trait WireConnection: Send {
    async fn send_text(&mut self, text: String) -> Result<(), WebSocketError>;

    /// Next text message, `None` once the peer has closed
    async fn recv_text(&mut self) -> Result<Option<String>, WebSocketError>;

    async fn close(&mut self) -> Result<(), WebSocketError>;
}

/// Opens provider connections. One call per (re)connect attempt.
#[async_trait]
pub trait Dialer: Send + Sync {
    async fn dial(&self) -> Result<Box<dyn WireConnection>, WebSocketError>;
}
