//! quotebar-middleware: collaborator seams
//!
//! Trait-based abstractions for the key-value cache and the bar
//! persistence sink, with in-memory implementations for tests and
//! feature-gated Redis / Postgres backends.

pub mod cache;
pub mod error;
pub mod memory;
pub mod quotes;
pub mod sink;

#[cfg(feature = "postgres")]
pub mod postgres;
#[cfg(feature = "redis")]
pub mod redis;

pub use cache::Cache;
pub use error::{CacheError, SinkError};
pub use memory::{InMemoryBarStore, InMemoryCache};
pub use quotes::QuoteCache;
pub use sink::BarSink;

#[cfg(feature = "postgres")]
pub use postgres::PostgresBarStore;
#[cfg(feature = "redis")]
pub use redis::RedisCache;
