//! Observability hooks for the fetch layer.
//!
//! Components log through `tracing` directly and additionally emit [`FetchEvent`]s to a
//! user-provided [`EventSink`], for counters and dashboards. Sinks are never load-bearing:
//! dropping every event must not change behaviour.
//!
//! # Example
//!
//! ```ignore
//! use std::sync::{Arc, Mutex};
//! use async_trait::async_trait;
//! use docfetch::{EventSink, FetchEvent};
//!
//! struct BufferedSink {
//!     buffer: Mutex<Vec<FetchEvent>>,
//! }
//!
//! #[async_trait]
//! impl EventSink for BufferedSink {
//!     fn emit(&self, event: FetchEvent) {
//!         self.buffer.lock().unwrap().push(event);
//!     }
//!
//!     async fn flush(&self) -> Result<(), Box<dyn std::error::Error + Send + Sync>> {
//!         Ok(())
//!     }
//! }
//! ```

use async_trait::async_trait;

use crate::breaker::CircuitState;

/// Events emitted by the caches, the breakers and the orchestrator.
#[derive(Debug, Clone, PartialEq)]
pub enum FetchEvent {
    /// A layered cache lookup found nothing usable in any tier.
    CacheMiss {
        /// Name of the cache (its persistence namespace).
        cache: String,
        /// Hashed key.
        key: String,
    },
    /// Entries were evicted from a memory tier to admit a new one.
    Evicted {
        cache: String,
        count: usize,
    },
    /// A persistent tier operation failed and was absorbed.
    PersistenceFailed {
        cache: String,
        operation: &'static str,
        message: String,
    },
    /// A circuit breaker changed state.
    BreakerTransition {
        service: String,
        from: CircuitState,
        to: CircuitState,
    },
    /// A background stale-while-revalidate refresh stored a new document.
    RefreshCompleted {
        address: String,
    },
    /// A background refresh failed; the stale entry was kept.
    RefreshFailed {
        address: String,
        error: String,
    },
    /// The primary format failed and the orchestrator moved on to the fallback format.
    FormatFallback {
        address: String,
        error: String,
    },
}

/// Trait for receiving fetch layer events.
#[async_trait]
pub trait EventSink: Send + Sync {
    /// Emit a single event.
    ///
    /// This is called synchronously in the hot path, sometimes while a component holds its
    /// internal lock. Implementations should be fast and must not call back into the emitter.
    fn emit(&self, event: FetchEvent);

    /// Flush any buffered events.
    async fn flush(&self) -> Result<(), Box<dyn std::error::Error + Send + Sync>>;
}

/// Sink that discards everything.
#[derive(Debug, Clone, Copy, Default)]
pub struct NoopSink;

#[async_trait]
impl EventSink for NoopSink {
    fn emit(&self, _event: FetchEvent) {}

    async fn flush(&self) -> Result<(), Box<dyn std::error::Error + Send + Sync>> {
        Ok(())
    }
}
