//! quotebar-connector: streaming quote binary
//!
//! Holds one provider quote session, caches the latest quote per
//! instrument and persists OHLCV bars at every configured granularity.

use anyhow::Context;
use clap::Parser;
use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;
use tokio::sync::watch;
use tracing::{error, info};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use quotebar_connector_lib::{run_server, QuoteStreamService, ServerState, WebSocketDialer};
use quotebar_metadata::{CacheBackend, SinkBackend, StreamConfig};
use quotebar_middleware::{BarSink, Cache, InMemoryBarStore, InMemoryCache};

#[derive(Parser, Debug)]
#[command(name = "quotebar-connector")]
#[command(about = "Real-time quote stream to OHLCV bars")]
struct Args {
    /// Path to the stream configuration file (defaults plus env overrides when omitted)
    #[arg(short, long, env = "QUOTEBAR_CONFIG")]
    config: Option<PathBuf>,

    /// Health server bind address
    #[arg(long, default_value = "0.0.0.0:8080")]
    health_addr: String,

    /// Extra instrument to subscribe at start, as EXCHANGE:SYMBOL (repeatable)
    #[arg(long = "symbol")]
    symbols: Vec<String>,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::registry()
        .with(tracing_subscriber::fmt::layer())
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .init();

    let args = Args::parse();

    let mut config = match &args.config {
        Some(path) => StreamConfig::load(path)
            .with_context(|| format!("loading {}", path.display()))?,
        None => StreamConfig::from_env()?,
    };
    for symbol in &args.symbols {
        if !config.symbols.contains(symbol) {
            config.symbols.push(symbol.clone());
        }
    }
    config.validate()?;
    info!(
        url = %config.provider.url,
        symbols = config.symbols.len(),
        cache = ?config.cache.backend,
        sink = ?config.sink.backend,
        "Loaded stream configuration"
    );

    let health_addr: SocketAddr = args
        .health_addr
        .parse()
        .with_context(|| format!("invalid health address {}", args.health_addr))?;

    let cache = build_cache(&config).await?;
    let sink = build_sink(&config).await?;
    let dialer = Arc::new(WebSocketDialer::new(
        config.provider.url.clone(),
        config.provider.origin.clone(),
    ));
    let service = Arc::new(QuoteStreamService::new(config, dialer, cache, sink)?);

    // Setup shutdown signal
    let (shutdown_tx, mut shutdown_rx) = watch::channel(false);
    tokio::spawn(async move {
        tokio::signal::ctrl_c().await.ok();
        info!("Received shutdown signal");
        shutdown_tx.send(true).ok();
    });

    let mut server_shutdown = shutdown_rx.clone();
    let server_state = ServerState::new(Arc::clone(&service));
    let server = tokio::spawn(async move {
        let signal = async move {
            server_shutdown.wait_for(|stop| *stop).await.ok();
        };
        if let Err(e) = run_server(health_addr, server_state, signal).await {
            error!(error = %e, "Health server failed");
        }
    });
    info!(addr = %health_addr, "Health server started");

    service.start().await?;

    shutdown_rx.wait_for(|stop| *stop).await.ok();
    service.stop().await;

    if let Err(e) = server.await {
        error!(error = %e, "Health server task panicked");
    }
    info!("Shutdown complete");
    Ok(())
}

async fn build_cache(config: &StreamConfig) -> anyhow::Result<Arc<dyn Cache>> {
    match config.cache.backend {
        CacheBackend::Memory => Ok(Arc::new(InMemoryCache::new())),
        CacheBackend::Redis => redis_cache(config).await,
    }
}

#[cfg(feature = "redis")]
async fn redis_cache(config: &StreamConfig) -> anyhow::Result<Arc<dyn Cache>> {
    let url = config
        .cache
        .redis_url
        .as_deref()
        .context("cache.redis_url is not set")?;
    Ok(Arc::new(quotebar_middleware::RedisCache::connect(url).await?))
}

#[cfg(not(feature = "redis"))]
async fn redis_cache(_config: &StreamConfig) -> anyhow::Result<Arc<dyn Cache>> {
    anyhow::bail!("cache.backend is redis but this binary was built without the `redis` feature")
}

async fn build_sink(config: &StreamConfig) -> anyhow::Result<Arc<dyn BarSink>> {
    match config.sink.backend {
        SinkBackend::Memory => Ok(Arc::new(InMemoryBarStore::new())),
        SinkBackend::Postgres => postgres_sink(config).await,
    }
}

#[cfg(feature = "postgres")]
async fn postgres_sink(config: &StreamConfig) -> anyhow::Result<Arc<dyn BarSink>> {
    let url = config
        .sink
        .database_url
        .as_deref()
        .context("sink.database_url is not set")?;
    Ok(Arc::new(quotebar_middleware::PostgresBarStore::connect(url).await?))
}

#[cfg(not(feature = "postgres"))]
async fn postgres_sink(_config: &StreamConfig) -> anyhow::Result<Arc<dyn BarSink>> {
    anyhow::bail!("sink.backend is postgres but this binary was built without the `postgres` feature")
}
