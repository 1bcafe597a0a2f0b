//! Builder API for assembling a [`FetchOrchestrator`].
//!
//! The builder wires the transport, both format parsers, the two document caches (sharing one
//! optional persistent store), the breaker registry and the event sink from a single
//! [`FetchLayerConfig`].

use std::sync::Arc;

use crate::breaker::CircuitBreakerRegistry;
use crate::config::FetchLayerConfig;
use crate::document::DocumentCache;
use crate::error::ConfigError;
use crate::format::DocumentParser;
use crate::layered::LayeredCache;
use crate::observability::{EventSink, NoopSink};
use crate::orchestrator::{FetchOptions, FetchOrchestrator};
use crate::store::PersistentStore;
use crate::stores::{FileStore, FileStoreConfig};
use crate::transport::{Credentials, ReqwestTransport, Transport};

/// Builder for [`FetchOrchestrator`].
///
/// # Example
///
/// ```ignore
/// use docfetch::{FetchLayerConfig, JsonParser, OrchestratorBuilder, TextParser};
///
/// let config = FetchLayerConfig::from_env()?;
/// let orchestrator = OrchestratorBuilder::new(JsonParser::<Catalog>::default(), TextParser)
///     .config(config)
///     .build()?;
///
/// let feed = orchestrator.fetch("https://example.org/catalog").await?;
/// ```
pub struct OrchestratorBuilder<P, S>
where
    P: DocumentParser,
    S: DocumentParser,
{
    primary: P,
    secondary: S,
    config: FetchLayerConfig,
    transport: Option<Arc<dyn Transport>>,
    store: Option<Arc<dyn PersistentStore>>,
    credentials: Option<Credentials>,
    sink: Arc<dyn EventSink>,
}

impl<P, S> OrchestratorBuilder<P, S>
where
    P: DocumentParser,
    S: DocumentParser,
{
    pub fn new(primary: P, secondary: S) -> Self {
        OrchestratorBuilder {
            primary,
            secondary,
            config: FetchLayerConfig::default(),
            transport: None,
            store: None,
            credentials: None,
            sink: Arc::new(NoopSink),
        }
    }

    pub fn config(mut self, config: FetchLayerConfig) -> Self {
        self.config = config;
        self
    }

    /// Use a custom transport instead of a `reqwest` client built from the config.
    pub fn transport(mut self, transport: Arc<dyn Transport>) -> Self {
        self.transport = Some(transport);
        self
    }

    /// Persist documents in `store`. Takes precedence over `persist` / `persistence_dir`.
    pub fn store(mut self, store: Arc<dyn PersistentStore>) -> Self {
        self.store = Some(store);
        self
    }

    pub fn credentials(mut self, credentials: Credentials) -> Self {
        self.credentials = Some(credentials);
        self
    }

    pub fn sink(mut self, sink: Arc<dyn EventSink>) -> Self {
        self.sink = sink;
        self
    }

    /// Build the orchestrator.
    ///
    /// With persistence enabled this must run inside a tokio runtime.
    pub fn build(self) -> Result<FetchOrchestrator<P, S>, ConfigError> {
        let config = self.config;
        config.validate()?;
        let freshness = config.freshness()?;

        let transport: Arc<dyn Transport> = match self.transport {
            Some(transport) => transport,
            None => Arc::new(ReqwestTransport::new(config.request_timeout())?),
        };

        let store: Option<Arc<dyn PersistentStore>> = match self.store {
            Some(store) => Some(store),
            None if config.persist => {
                let root = config
                    .persistence_dir
                    .clone()
                    .ok_or(ConfigError::MissingPersistenceDir)?;
                Some(Arc::new(FileStore::new(FileStoreConfig { root })))
            }
            None => None,
        };

        let primary_cache = DocumentCache::new(
            LayeredCache::with_parts(
                format!("documents-{}", P::NAME),
                config.cache(),
                store.clone(),
                Arc::clone(&self.sink),
            ),
            freshness,
        )
        .with_sink(Arc::clone(&self.sink));
        let secondary_cache = DocumentCache::new(
            LayeredCache::with_parts(
                format!("documents-{}", S::NAME),
                config.cache(),
                store,
                Arc::clone(&self.sink),
            ),
            freshness,
        )
        .with_sink(Arc::clone(&self.sink));

        let breakers = Arc::new(CircuitBreakerRegistry::with_sink(
            config.breaker(),
            Arc::clone(&self.sink),
        ));

        let defaults = FetchOptions {
            prefer_primary: config.prefer_primary,
            ..FetchOptions::default()
        };

        tracing::debug!(
            "Built fetch orchestrator for {} / {} (persistent: {})",
            P::NAME,
            S::NAME,
            primary_cache.layered().is_persistent()
        );

        Ok(FetchOrchestrator::from_parts(
            transport,
            self.primary,
            self.secondary,
            primary_cache,
            secondary_cache,
            breakers,
            self.credentials,
            defaults,
            self.sink,
        ))
    }
}
