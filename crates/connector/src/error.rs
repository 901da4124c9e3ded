use std::time::Duration;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum ConnectorError {
    #[error("connection failed: {0}")]
    ConnectionFailed(String),
    #[error("handshake failed: {0}")]
    HandshakeFailed(String),
    #[error("disconnected: {0}")]
    Disconnected(String),
    #[error("no inbound traffic for {0:?}")]
    HeartbeatTimeout(Duration),
    #[error("provider stopped reading, write stalled for {0:?}")]
    SendTimeout(Duration),
    #[error("frame decode failed: {0}")]
    Decode(#[from] CodecError),
    #[error("transport error: {0}")]
    Transport(#[from] WebSocketError),
    #[error("client already started")]
    AlreadyStarted,
    #[error("client is closed")]
    Closed,
    #[error("worker pool: {0}")]
    Worker(String),
    #[error("history fetch failed: {0}")]
    History(String),
    #[error("configuration error: {0}")]
    Config(#[from] quotebar_metadata::MetadataError),
    #[error("cache error: {0}")]
    Cache(#[from] quotebar_middleware::CacheError),
}

/// Wire framing violations. Each one invalidates the connection.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum CodecError {
    #[error("expected frame marker, found {0:?}")]
    MissingMarker(String),
    #[error("invalid length marker {0:?}")]
    InvalidLength(String),
    #[error("declared length {declared} does not end on a frame boundary")]
    LengthMismatch { declared: usize },
    #[error("frame of {0} bytes exceeds limit")]
    FrameTooLarge(usize),
    #[error("truncated frame: {0} bytes pending")]
    Truncated(usize),
}

#[derive(Error, Debug)]
pub enum WebSocketError {
    #[error("connection error: {0}")]
    Connection(String),
    #[error("websocket error: {0}")]
    WebSocket(#[from] tokio_tungstenite::tungstenite::Error),
    #[error("json error: {0}")]
    Json(#[from] serde_json::Error),
    #[error("connection closed")]
    ConnectionClosed,
}
