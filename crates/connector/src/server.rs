use axum::{
    extract::State,
    http::{header, StatusCode},
    response::IntoResponse,
    routing::get,
    Json, Router,
};
use serde::Serialize;
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::net::TcpListener;
use tracing::error;

use crate::client::ConnectionState;
use crate::metrics::encode_metrics;
use crate::service::{QuoteStreamService, ServiceStatus};

/// Health check response
#[derive(Serialize)]
pub struct HealthResponse {
    pub status: String,
    pub connection_state: ConnectionState,
}

/// Shared state for the HTTP endpoints
#[derive(Clone)]
pub struct ServerState {
    pub service: Arc<QuoteStreamService>,
}

impl ServerState {
    pub fn new(service: Arc<QuoteStreamService>) -> Self {
        Self { service }
    }
}

/// Health endpoint - always returns 200 if server is running
async fn health(State(state): State<ServerState>) -> Json<HealthResponse> {
    Json(HealthResponse {
        status: "ok".to_string(),
        connection_state: state.service.connection_state(),
    })
}

/// Ready endpoint - returns 200 only while the quote session is running
async fn ready(State(state): State<ServerState>) -> (StatusCode, Json<HealthResponse>) {
    let connection_state = state.service.connection_state();
    let running = connection_state == ConnectionState::Running;
    let status_code = if running {
        StatusCode::OK
    } else {
        StatusCode::SERVICE_UNAVAILABLE
    };

    (
        status_code,
        Json(HealthResponse {
            status: if running { "ready" } else { "not_ready" }.to_string(),
            connection_state,
        }),
    )
}

async fn status(State(state): State<ServerState>) -> Json<ServiceStatus> {
    Json(state.service.status())
}

/// Prometheus text exposition
async fn metrics() -> impl IntoResponse {
    match encode_metrics() {
        Ok(body) => (
            StatusCode::OK,
            [(header::CONTENT_TYPE, "text/plain; version=0.0.4")],
            body,
        ),
        Err(e) => {
            error!(error = %e, "Failed to encode metrics");
            (
                StatusCode::INTERNAL_SERVER_ERROR,
                [(header::CONTENT_TYPE, "text/plain")],
                e.to_string(),
            )
        }
    }
}

/// Create the health server router
pub fn create_router(state: ServerState) -> Router {
    Router::new()
        .route("/health", get(health))
        .route("/ready", get(ready))
        .route("/status", get(status))
        .route("/metrics", get(metrics))
        .with_state(state)
}

/// Run the health server until `shutdown` resolves
pub async fn run_server<F>(addr: SocketAddr, state: ServerState, shutdown: F) -> std::io::Result<()>
where
    F: std::future::Future<Output = ()> + Send + 'static,
{
    let app = create_router(state);
    let listener = TcpListener::bind(addr).await?;
    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown)
        .await
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_helpers::{ScriptedDialer, ServerHandle};
    use axum::body::Body;
    use axum::http::Request;
    use quotebar_metadata::StreamConfig;
    use quotebar_middleware::{InMemoryBarStore, InMemoryCache};
    use tokio::sync::mpsc;
    use tower::ServiceExt;

    fn create_test_state() -> (ServerState, mpsc::UnboundedReceiver<ServerHandle>) {
        let (dialer, servers) = ScriptedDialer::new();
        let mut config = StreamConfig::default();
        config.symbols = vec!["NASDAQ:AAPL".to_string(), "BINANCE:BTCUSDT".to_string()];
        let service = QuoteStreamService::new(
            config,
            Arc::new(dialer),
            Arc::new(InMemoryCache::new()),
            Arc::new(InMemoryBarStore::new()),
        )
        .unwrap();
        (ServerState::new(Arc::new(service)), servers)
    }

    async fn body_json(response: axum::response::Response) -> serde_json::Value {
        let bytes = axum::body::to_bytes(response.into_body(), usize::MAX).await.unwrap();
        serde_json::from_slice(&bytes).unwrap()
    }

    #[tokio::test]
    async fn test_health_returns_ok() {
        let (state, _servers) = create_test_state();
        let app = create_router(state);

        let response = app
            .oneshot(Request::builder().uri("/health").body(Body::empty()).unwrap())
            .await
            .unwrap();

        assert_eq!(response.status(), StatusCode::OK);
        let body = body_json(response).await;
        assert_eq!(body["connection_state"], "disconnected");
    }

    #[tokio::test]
    async fn test_ready_when_running() {
        let (state, _servers) = create_test_state();
        let service = Arc::clone(&state.service);
        service.start().await.unwrap();
        service
            .state_watch()
            .wait_for(|s| *s == ConnectionState::Running)
            .await
            .unwrap();

        let response = create_router(state)
            .oneshot(Request::builder().uri("/ready").body(Body::empty()).unwrap())
            .await
            .unwrap();

        assert_eq!(response.status(), StatusCode::OK);
        service.stop().await;
    }

    #[tokio::test]
    async fn test_ready_when_not_running() {
        let (state, _servers) = create_test_state();
        let app = create_router(state);

        let response = app
            .oneshot(Request::builder().uri("/ready").body(Body::empty()).unwrap())
            .await
            .unwrap();

        assert_eq!(response.status(), StatusCode::SERVICE_UNAVAILABLE);
    }

    #[tokio::test]
    async fn test_status_lists_subscriptions_in_order() {
        let (state, _servers) = create_test_state();
        let service = Arc::clone(&state.service);
        service.start().await.unwrap();

        let response = create_router(state)
            .oneshot(Request::builder().uri("/status").body(Body::empty()).unwrap())
            .await
            .unwrap();

        assert_eq!(response.status(), StatusCode::OK);
        let body = body_json(response).await;
        assert_eq!(
            body["subscribed_instruments"],
            serde_json::json!(["NASDAQ:AAPL", "BINANCE:BTCUSDT"])
        );
        service.stop().await;
    }

    #[tokio::test]
    async fn test_metrics_endpoint() {
        crate::metrics::inc_heartbeat();
        let (state, _servers) = create_test_state();
        let app = create_router(state);

        let response = app
            .oneshot(Request::builder().uri("/metrics").body(Body::empty()).unwrap())
            .await
            .unwrap();

        assert_eq!(response.status(), StatusCode::OK);
        let bytes = axum::body::to_bytes(response.into_body(), usize::MAX).await.unwrap();
        let text = String::from_utf8(bytes.to_vec()).unwrap();
        assert!(text.contains("quotebar_heartbeats_echoed_total"));
    }
}
