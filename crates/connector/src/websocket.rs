//! Provider WebSocket transport

use async_trait::async_trait;
use futures_util::{SinkExt, StreamExt};
use std::time::Duration;
use tokio::net::TcpStream;
use tokio_tungstenite::tungstenite::client::IntoClientRequest;
use tokio_tungstenite::tungstenite::http::HeaderValue;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::{connect_async, MaybeTlsStream, WebSocketStream};
use tracing::{debug, info, trace};
use url::Url;

use crate::error::WebSocketError;
use crate::traits::{Dialer, WireConnection};

const CONNECT_TIMEOUT_SECS: u64 = 30;

/// Dials the provider with an `Origin` header; the provider refuses
/// upgrades without one.
#[derive(Debug, Clone)]
pub struct WebSocketDialer {
    url: String,
    origin: String,
}

impl WebSocketDialer {
    pub fn new(url: impl Into<String>, origin: impl Into<String>) -> Self {
        Self {
            url: url.into(),
            origin: origin.into(),
        }
    }

    pub fn url(&self) -> &str {
        &self.url
    }
}

#[async_trait]
impl Dialer for WebSocketDialer {
    async fn dial(&self) -> Result<Box<dyn WireConnection>, WebSocketError> {
        let url = Url::parse(&self.url).map_err(|e| WebSocketError::Connection(e.to_string()))?;

        let mut request = url.as_str().into_client_request()?;
        let origin = HeaderValue::from_str(&self.origin)
            .map_err(|e| WebSocketError::Connection(format!("invalid origin: {}", e)))?;
        request.headers_mut().insert("Origin", origin);

        info!(url = %self.url, "Connecting to provider WebSocket");

        let (ws, response) = tokio::time::timeout(
            Duration::from_secs(CONNECT_TIMEOUT_SECS),
            connect_async(request),
        )
        .await
        .map_err(|_| {
            WebSocketError::Connection(format!(
                "connect timed out after {} seconds",
                CONNECT_TIMEOUT_SECS
            ))
        })??;

        info!(status = ?response.status(), "Provider WebSocket connected");
        Ok(Box::new(WebSocketConnection { ws }))
    }
}

pub struct WebSocketConnection {
    ws: WebSocketStream<MaybeTlsStream<TcpStream>>,
}

#[async_trait]
impl WireConnection for WebSocketConnection {
    async fn send_text(&mut self, text: String) -> Result<(), WebSocketError> {
        trace!(len = text.len(), "Sending frame");
        self.ws.send(Message::Text(text)).await?;
        Ok(())
    }

    async fn recv_text(&mut self) -> Result<Option<String>, WebSocketError> {
        loop {
            match self.ws.next().await {
                Some(Ok(Message::Text(text))) => return Ok(Some(text)),
                Some(Ok(Message::Binary(data))) => {
                    return String::from_utf8(data)
                        .map(Some)
                        .map_err(|e| WebSocketError::Connection(format!("non-utf8 binary frame: {}", e)));
                }
                // Pongs are queued by tungstenite and go out with the next write
                Some(Ok(Message::Ping(_))) | Some(Ok(Message::Pong(_))) => continue,
                Some(Ok(Message::Close(frame))) => {
                    info!(frame = ?frame, "Provider WebSocket closed");
                    return Ok(None);
                }
                Some(Ok(Message::Frame(_))) => continue,
                Some(Err(e)) => return Err(e.into()),
                None => return Ok(None),
            }
        }
    }

    async fn close(&mut self) -> Result<(), WebSocketError> {
        debug!("Closing provider WebSocket");
        self.ws.close(None).await?;
        Ok(())
    }
}
