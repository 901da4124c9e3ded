//! quotebar-metadata: runtime configuration for the quote stream

pub mod config;
pub mod error;

pub use config::{
    AggregationConfig, CacheBackend, CacheConfig, ConnectionConfig, ProviderConfig, SinkBackend,
    SinkConfig, StreamConfig, WorkersConfig,
};
pub use error::MetadataError;
