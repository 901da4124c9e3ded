//! In-memory implementations for testing and single-process runs
pub mod cache;
pub mod sink;

pub use cache::InMemoryCache;
pub use sink::InMemoryBarStore;
