//! docfetch - a resilient remote-document fetch layer
//!
//! This library provides:
//! - A generic layered cache: bounded LRU memory tier plus an optional persistent tier
//! - Stale-while-revalidate document caching with conditional (ETag / Last-Modified) refreshes
//! - Per-service circuit breakers
//! - A fetch orchestrator that coalesces concurrent requests and falls back between two wire
//!   formats of the same resource
//!
//! # Example
//!
//! ```ignore
//! use docfetch::{FetchOptions, JsonParser, OrchestratorBuilder, TextParser};
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let orchestrator =
//!         OrchestratorBuilder::new(JsonParser::<serde_json::Value>::default(), TextParser)
//!             .build()?;
//!
//!     // Tries the JSON representation first, then the XML one.
//!     let feed = orchestrator
//!         .fetch_feed("https://example.org/catalog", FetchOptions::default())
//!         .await?;
//!     println!("got a {:?} document", feed.format());
//!     Ok(())
//! }
//! ```

mod breaker;
mod builder;
mod config;
mod document;
mod entry;
mod error;
mod format;
mod layered;
mod memory_tier;
mod observability;
mod orchestrator;
mod persistence;
mod store;
pub mod stores;
mod transport;
mod utils;

// Re-export public API
pub use breaker::{
    BreakerMetrics, CircuitBreaker, CircuitBreakerConfig, CircuitBreakerRegistry, CircuitState,
};
pub use builder::OrchestratorBuilder;
pub use config::{ENV_PREFIX, FetchLayerConfig};
pub use document::{
    ConditionalHeaders, DocumentCache, DocumentCacheEntry, FetchOutcome, Freshness,
    FreshnessPolicy, Revalidated,
};
pub use entry::{CacheEntry, StoredBytes};
pub use error::{CacheError, CircuitOpenError, ConfigError, ErrorKind, FetchError};
pub use format::{DocumentParser, Feed, JsonParser, TextParser, WireFormat};
pub use layered::{CachePolicy, LayeredCache, LayeredCacheConfig, MemoryPressure, NOMINAL_COST};
pub use observability::{EventSink, FetchEvent, NoopSink};
pub use orchestrator::{FeedResult, FetchOptions, FetchOrchestrator, service_key};
pub use store::PersistentStore;
pub use stores::{
    FileStore, FileStoreConfig, HashMapStore, HashMapStoreConfig, RedisStore, RedisStoreConfig,
};
pub use transport::{
    Credentials, Method, ReqwestTransport, Transport, TransportRequest, TransportResponse,
};
