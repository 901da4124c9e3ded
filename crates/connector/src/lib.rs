//! quotebar-connector: streaming quote runtime
//!
//! Frames and parses the provider's WebSocket protocol, keeps one quote
//! session alive across reconnects, and turns the resulting ticks into
//! cached quotes and persisted OHLCV bars.

pub mod backoff;
pub mod client;
pub mod codec;
pub mod dispatcher;
pub mod error;
pub mod flusher;
pub mod messages;
pub mod metrics;
pub mod pool;
pub mod registry;
pub mod server;
pub mod service;
pub mod test_helpers;
pub mod traits;
pub mod websocket;

pub use backoff::Backoff;
pub use client::{ClientSettings, ConnectionState, ProtocolClient, SessionPayload, SubscriptionGate};
pub use codec::FrameDecoder;
pub use dispatcher::{Dispatched, TickDispatcher};
pub use error::{CodecError, ConnectorError, WebSocketError};
pub use pool::{BlockingPool, HistoricalBar, HistoricalSource, MAX_HISTORY_BARS};
pub use registry::SubscriptionRegistry;
pub use server::{create_router, run_server, ServerState};
pub use service::{QuoteStreamService, ServiceStatus};
pub use traits::{Dialer, WireConnection};
pub use websocket::WebSocketDialer;
