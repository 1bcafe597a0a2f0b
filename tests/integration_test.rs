//! Integration tests for the fetch orchestrator against a scripted transport.

use async_trait::async_trait;
use docfetch::{
    CircuitState, Credentials, EventSink, Feed, FetchError, FetchEvent, FetchLayerConfig,
    FetchOptions, FetchOrchestrator, HashMapStore, HashMapStoreConfig, JsonParser, Method,
    OrchestratorBuilder, TextParser, Transport, TransportRequest, TransportResponse,
};
use reqwest::header::{ACCEPT, AUTHORIZATION, CONTENT_TYPE, ETAG, IF_NONE_MATCH};
use serde::{Deserialize, Serialize};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

const ADDRESS: &str = "https://example.org/catalog";

// ============================================================================
// Test Types
// ============================================================================

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
struct Catalog {
    title: String,
}

type Orchestrator = FetchOrchestrator<JsonParser<Catalog>, TextParser>;

type Responder =
    dyn Fn(&TransportRequest, usize) -> Result<TransportResponse, FetchError> + Send + Sync;

/// Transport that records every request and answers through a closure.
///
/// The closure also receives how many requests came before this one.
struct ScriptedTransport {
    responder: Box<Responder>,
    delay: Duration,
    requests: Mutex<Vec<TransportRequest>>,
}

impl ScriptedTransport {
    fn new(
        responder: impl Fn(&TransportRequest, usize) -> Result<TransportResponse, FetchError>
        + Send
        + Sync
        + 'static,
    ) -> Self {
        ScriptedTransport {
            responder: Box::new(responder),
            delay: Duration::ZERO,
            requests: Mutex::new(Vec::new()),
        }
    }

    fn with_delay(mut self, delay: Duration) -> Self {
        self.delay = delay;
        self
    }

    fn requests(&self) -> Vec<TransportRequest> {
        self.requests.lock().unwrap().clone()
    }

    fn count(&self) -> usize {
        self.requests.lock().unwrap().len()
    }
}

#[async_trait]
impl Transport for ScriptedTransport {
    async fn send(&self, request: TransportRequest) -> Result<TransportResponse, FetchError> {
        let seen = {
            let mut requests = self.requests.lock().unwrap();
            requests.push(request.clone());
            requests.len() - 1
        };
        if !self.delay.is_zero() {
            tokio::time::sleep(self.delay).await;
        }
        (self.responder)(&request, seen)
    }
}

#[derive(Default)]
struct CollectingSink {
    events: Mutex<Vec<FetchEvent>>,
}

#[async_trait]
impl EventSink for CollectingSink {
    fn emit(&self, event: FetchEvent) {
        self.events.lock().unwrap().push(event);
    }

    async fn flush(&self) -> Result<(), Box<dyn std::error::Error + Send + Sync>> {
        Ok(())
    }
}

// ============================================================================
// Helper Functions
// ============================================================================

fn wants_json(request: &TransportRequest) -> bool {
    request.header(ACCEPT).is_some_and(|a| a.contains("json"))
}

fn json_catalog(title: &str) -> TransportResponse {
    TransportResponse::new(200, format!(r#"{{"title":"{}"}}"#, title))
        .with_header(CONTENT_TYPE, "application/opds+json")
}

fn atom_feed() -> TransportResponse {
    TransportResponse::new(200, "<feed/>").with_header(CONTENT_TYPE, "application/atom+xml")
}

/// Serves the JSON representation to JSON requests and the Atom one otherwise.
fn both_formats(request: &TransportRequest, _: usize) -> Result<TransportResponse, FetchError> {
    if wants_json(request) {
        Ok(json_catalog("Library"))
    } else {
        Ok(atom_feed())
    }
}

fn orchestrator(transport: Arc<ScriptedTransport>, config: FetchLayerConfig) -> Orchestrator {
    OrchestratorBuilder::new(JsonParser::default(), TextParser)
        .transport(transport)
        .config(config)
        .build()
        .unwrap()
}

fn catalog(title: &str) -> Feed<Catalog, String> {
    Feed::Primary(Catalog {
        title: title.to_string(),
    })
}

fn secondary_only() -> FetchOptions {
    FetchOptions {
        prefer_primary: false,
        ..FetchOptions::default()
    }
}

// ============================================================================
// Coalescing
// ============================================================================

#[tokio::test]
async fn test_concurrent_callers_share_one_transport_call() {
    let transport =
        Arc::new(ScriptedTransport::new(both_formats).with_delay(Duration::from_millis(50)));
    let orchestrator = orchestrator(transport.clone(), FetchLayerConfig::default());

    let results = futures::future::join_all(
        (0..10).map(|_| orchestrator.fetch_feed(ADDRESS, FetchOptions::default())),
    )
    .await;

    assert_eq!(transport.count(), 1);
    for result in results {
        assert_eq!(result.unwrap(), catalog("Library"));
    }
    assert_eq!(orchestrator.in_flight_count(), 0);
}

#[tokio::test]
async fn test_concurrent_callers_share_the_same_error() {
    let transport = Arc::new(
        ScriptedTransport::new(|request, _| Err(FetchError::transport(request.url.as_str(), "down")))
            .with_delay(Duration::from_millis(30)),
    );
    let orchestrator = orchestrator(transport.clone(), FetchLayerConfig::default());

    let results = futures::future::join_all(
        (0..5).map(|_| orchestrator.fetch_feed(ADDRESS, FetchOptions::default())),
    )
    .await;

    // One primary attempt and one fallback attempt, shared by every caller.
    assert_eq!(transport.count(), 2);
    for result in results {
        assert_eq!(result, Err(FetchError::transport(ADDRESS, "down")));
    }

    // A failed fetch does not block the next one.
    let _ = orchestrator.fetch_feed(ADDRESS, FetchOptions::default()).await;
    assert_eq!(transport.count(), 4);
}

#[tokio::test]
async fn test_fetch_survives_until_last_caller_leaves() {
    let transport =
        Arc::new(ScriptedTransport::new(both_formats).with_delay(Duration::from_millis(50)));
    let orchestrator = orchestrator(transport.clone(), FetchLayerConfig::default());

    let first = {
        let orchestrator = orchestrator.clone();
        tokio::spawn(async move { orchestrator.fetch_feed(ADDRESS, FetchOptions::default()).await })
    };
    let second = {
        let orchestrator = orchestrator.clone();
        tokio::spawn(async move { orchestrator.fetch_feed(ADDRESS, FetchOptions::default()).await })
    };
    tokio::time::sleep(Duration::from_millis(10)).await;

    first.abort();

    assert_eq!(second.await.unwrap(), Ok(catalog("Library")));
    assert_eq!(transport.count(), 1);
}

// ============================================================================
// Format fallback
// ============================================================================

#[tokio::test]
async fn test_primary_parse_failure_falls_back_to_secondary() {
    // Every request gets markup, which the JSON parser rejects.
    let transport = Arc::new(ScriptedTransport::new(|_, _| Ok(atom_feed())));
    let sink = Arc::new(CollectingSink::default());
    let orchestrator: Orchestrator = OrchestratorBuilder::new(JsonParser::default(), TextParser)
        .transport(transport.clone())
        .sink(sink.clone())
        .build()
        .unwrap();

    let feed = orchestrator
        .fetch_feed(ADDRESS, FetchOptions::default())
        .await
        .unwrap();

    assert_eq!(feed, Feed::Secondary("<feed/>".to_string()));
    let requests = transport.requests();
    assert_eq!(requests.len(), 2);
    assert!(wants_json(&requests[0]));
    assert!(!wants_json(&requests[1]));

    let events = sink.events.lock().unwrap().clone();
    assert!(events.iter().any(|e| matches!(e, FetchEvent::FormatFallback { .. })));

    // The service answered, so the parse error is not held against its breaker.
    let metrics = orchestrator.breakers().all_metrics();
    assert_eq!(metrics["json-example.org"].failure_count, 0);
}

#[tokio::test]
async fn test_secondary_only_skips_primary() {
    let transport = Arc::new(ScriptedTransport::new(both_formats));
    let orchestrator = orchestrator(transport.clone(), FetchLayerConfig::default());

    let feed = orchestrator
        .fetch_feed(ADDRESS, secondary_only())
        .await
        .unwrap();

    assert_eq!(feed.format(), docfetch::WireFormat::Secondary);
    assert_eq!(transport.count(), 1);
}

#[tokio::test]
async fn test_secondary_error_is_returned_when_both_fail() {
    let transport = Arc::new(ScriptedTransport::new(|request, _| {
        if wants_json(request) {
            Ok(TransportResponse::new(200, "not json"))
        } else {
            Ok(TransportResponse::new(404, ""))
        }
    }));
    let orchestrator = orchestrator(transport.clone(), FetchLayerConfig::default());

    let err = orchestrator
        .fetch_feed(ADDRESS, FetchOptions::default())
        .await
        .unwrap_err();

    assert_eq!(
        err,
        FetchError::Status {
            url: ADDRESS.to_string(),
            status: 404
        }
    );
    assert_eq!(err.user_message("catalog"), "could not load catalog (unavailable)");
}

// ============================================================================
// Caching
// ============================================================================

#[tokio::test]
async fn test_cached_result_is_reused_until_invalidated() {
    let transport = Arc::new(ScriptedTransport::new(both_formats));
    let orchestrator = orchestrator(transport.clone(), FetchLayerConfig::default());

    orchestrator.fetch(ADDRESS).await.unwrap();
    orchestrator.fetch(ADDRESS).await.unwrap();
    assert_eq!(transport.count(), 1);

    orchestrator.invalidate_cache(ADDRESS);
    orchestrator.fetch(ADDRESS).await.unwrap();
    assert_eq!(transport.count(), 2);
}

#[tokio::test]
async fn test_conditional_fetch_revives_expired_entry() {
    let transport = Arc::new(ScriptedTransport::new(|request, _| {
        if request.header(IF_NONE_MATCH) == Some("\"abc\"") {
            Ok(TransportResponse::new(304, ""))
        } else {
            Ok(json_catalog("Library").with_header(ETAG, "\"abc\""))
        }
    }));
    let config = FetchLayerConfig {
        stale_after_ms: 20,
        expire_after_ms: 40,
        ..FetchLayerConfig::default()
    };
    let orchestrator = orchestrator(transport.clone(), config);

    orchestrator.fetch(ADDRESS).await.unwrap();
    tokio::time::sleep(Duration::from_millis(60)).await;
    let before = std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .unwrap()
        .as_millis() as i64;

    let feed = orchestrator.fetch(ADDRESS).await.unwrap();

    assert_eq!(feed, catalog("Library"));
    let requests = transport.requests();
    assert_eq!(requests.len(), 2);
    assert_eq!(requests[1].header(IF_NONE_MATCH), Some("\"abc\""));

    let entry = orchestrator.primary_cache().get(ADDRESS).await.unwrap();
    assert!(entry.fetched_at >= before);
    assert_eq!(entry.etag.as_deref(), Some("\"abc\""));
}

#[tokio::test]
async fn test_stale_entry_is_served_while_refreshing() {
    let transport = Arc::new(ScriptedTransport::new(|_, seen| {
        Ok(json_catalog(if seen == 0 { "Old" } else { "New" }))
    }));
    let config = FetchLayerConfig {
        stale_after_ms: 20,
        expire_after_ms: 60_000,
        ..FetchLayerConfig::default()
    };
    let orchestrator = orchestrator(transport.clone(), config);

    assert_eq!(orchestrator.fetch(ADDRESS).await.unwrap(), catalog("Old"));
    tokio::time::sleep(Duration::from_millis(30)).await;

    assert_eq!(orchestrator.fetch(ADDRESS).await.unwrap(), catalog("Old"));
    tokio::time::sleep(Duration::from_millis(30)).await;

    assert_eq!(orchestrator.fetch(ADDRESS).await.unwrap(), catalog("New"));
}

#[tokio::test]
async fn test_invalidation_wins_over_running_refresh() {
    let transport = Arc::new(
        ScriptedTransport::new(|_, seen| Ok(json_catalog(&format!("v{}", seen + 1))))
            .with_delay(Duration::from_millis(50)),
    );
    let config = FetchLayerConfig {
        stale_after_ms: 20,
        expire_after_ms: 60_000,
        ..FetchLayerConfig::default()
    };
    let orchestrator = orchestrator(transport.clone(), config);

    assert_eq!(orchestrator.fetch(ADDRESS).await.unwrap(), catalog("v1"));
    tokio::time::sleep(Duration::from_millis(30)).await;

    // Stale: served at once while the refresh is still on the wire.
    assert_eq!(orchestrator.fetch(ADDRESS).await.unwrap(), catalog("v1"));
    orchestrator.invalidate_cache(ADDRESS);
    tokio::time::sleep(Duration::from_millis(120)).await;
    assert_eq!(transport.count(), 2);

    let feed = orchestrator.fetch(ADDRESS).await.unwrap();

    assert_eq!(transport.count(), 3);
    assert_eq!(feed, catalog("v3"));
}

#[tokio::test]
async fn test_force_refresh_bypasses_fresh_cache() {
    let transport = Arc::new(ScriptedTransport::new(|_, seen| {
        Ok(json_catalog(if seen == 0 { "Old" } else { "New" }).with_header(ETAG, "\"v\""))
    }));
    let orchestrator = orchestrator(transport.clone(), FetchLayerConfig::default());
    orchestrator.fetch(ADDRESS).await.unwrap();

    let forced = orchestrator
        .fetch_feed(
            ADDRESS,
            FetchOptions {
                force_refresh: true,
                ..FetchOptions::default()
            },
        )
        .await
        .unwrap();

    assert_eq!(forced, catalog("New"));
    assert!(transport.requests()[1].header(IF_NONE_MATCH).is_none());
    assert_eq!(orchestrator.fetch(ADDRESS).await.unwrap(), catalog("New"));
    assert_eq!(transport.count(), 2);
}

#[tokio::test]
async fn test_persisted_documents_outlive_the_orchestrator() {
    let store = Arc::new(HashMapStore::new(HashMapStoreConfig::default()));
    let transport = Arc::new(ScriptedTransport::new(both_formats));

    let first: Orchestrator = OrchestratorBuilder::new(JsonParser::default(), TextParser)
        .transport(transport.clone())
        .store(store.clone())
        .build()
        .unwrap();
    first.fetch(ADDRESS).await.unwrap();
    first.primary_cache().layered().flush().await;
    drop(first);

    let second: Orchestrator = OrchestratorBuilder::new(JsonParser::default(), TextParser)
        .transport(transport.clone())
        .store(store)
        .build()
        .unwrap();

    assert_eq!(second.fetch(ADDRESS).await.unwrap(), catalog("Library"));
    assert_eq!(transport.count(), 1);
}

// ============================================================================
// Circuit breaking
// ============================================================================

#[tokio::test]
async fn test_open_breaker_fails_fast() {
    let transport = Arc::new(ScriptedTransport::new(|_, _| {
        Ok(TransportResponse::new(503, ""))
    }));
    let config = FetchLayerConfig {
        failure_threshold: 2,
        ..FetchLayerConfig::default()
    };
    let orchestrator = orchestrator(transport.clone(), config);

    for _ in 0..2 {
        let err = orchestrator
            .fetch_feed(ADDRESS, secondary_only())
            .await
            .unwrap_err();
        assert!(matches!(err, FetchError::Status { status: 503, .. }));
    }
    assert_eq!(
        orchestrator.breakers().breaker("xml-example.org").state(),
        CircuitState::Open
    );

    let err = orchestrator
        .fetch_feed(ADDRESS, secondary_only())
        .await
        .unwrap_err();

    assert_eq!(
        err,
        FetchError::ServiceUnavailable {
            service: "xml-example.org".to_string()
        }
    );
    assert_eq!(transport.count(), 2);

    orchestrator.breakers().reset_all();
    let _ = orchestrator.fetch_feed(ADDRESS, secondary_only()).await;
    assert_eq!(transport.count(), 3);
}

// ============================================================================
// Cancellation
// ============================================================================

#[tokio::test]
async fn test_cancel_request_fails_waiters_and_keeps_cache() {
    let transport =
        Arc::new(ScriptedTransport::new(both_formats).with_delay(Duration::from_millis(200)));
    let orchestrator = orchestrator(transport.clone(), FetchLayerConfig::default());

    let pending = {
        let orchestrator = orchestrator.clone();
        tokio::spawn(async move { orchestrator.fetch(ADDRESS).await })
    };
    tokio::time::sleep(Duration::from_millis(20)).await;
    assert_eq!(orchestrator.in_flight_count(), 1);

    orchestrator.cancel_request(ADDRESS);

    assert_eq!(pending.await.unwrap(), Err(FetchError::Cancelled));
    assert_eq!(orchestrator.in_flight_count(), 0);
    assert!(orchestrator.primary_cache().get(ADDRESS).await.is_none());
}

#[tokio::test]
async fn test_cancel_all() {
    let transport =
        Arc::new(ScriptedTransport::new(both_formats).with_delay(Duration::from_millis(200)));
    let orchestrator = orchestrator(transport.clone(), FetchLayerConfig::default());

    let handles: Vec<_> = ["https://example.org/a", "https://example.org/b"]
        .into_iter()
        .map(|address| {
            let orchestrator = orchestrator.clone();
            tokio::spawn(async move { orchestrator.fetch(address).await })
        })
        .collect();
    tokio::time::sleep(Duration::from_millis(20)).await;

    orchestrator.cancel_all();

    for handle in handles {
        assert_eq!(handle.await.unwrap(), Err(FetchError::Cancelled));
    }
}

// ============================================================================
// Auto-detection and authentication
// ============================================================================

#[tokio::test]
async fn test_auto_detect_routes_by_content_type() {
    let transport = Arc::new(ScriptedTransport::new(|request, _| match request.method {
        Method::Head => Ok(TransportResponse::new(200, "")
            .with_header(CONTENT_TYPE, "application/atom+xml;profile=opds-catalog")),
        Method::Get => both_formats(request, 0),
    }));
    let orchestrator = orchestrator(transport.clone(), FetchLayerConfig::default());

    let feed = orchestrator
        .fetch_feed_auto_detect(ADDRESS, FetchOptions::default())
        .await
        .unwrap();

    assert_eq!(feed, Feed::Secondary("<feed/>".to_string()));
    let requests = transport.requests();
    assert_eq!(requests.len(), 2);
    assert_eq!(requests[0].method, Method::Head);
    assert!(!wants_json(&requests[1]));
}

#[tokio::test]
async fn test_auto_detect_falls_back_when_probe_fails() {
    let transport = Arc::new(ScriptedTransport::new(|request, _| match request.method {
        Method::Head => Err(FetchError::transport(request.url.as_str(), "HEAD not allowed")),
        Method::Get => both_formats(request, 0),
    }));
    let orchestrator = orchestrator(transport.clone(), FetchLayerConfig::default());

    let feed = orchestrator
        .fetch_feed_auto_detect(ADDRESS, FetchOptions::default())
        .await
        .unwrap();

    assert_eq!(feed, catalog("Library"));
}

#[tokio::test]
async fn test_credentials_only_attached_with_use_auth() {
    let transport = Arc::new(ScriptedTransport::new(both_formats));
    let orchestrator = orchestrator(transport.clone(), FetchLayerConfig::default());
    orchestrator.set_credentials(Some(Credentials::Bearer("token".into())));

    orchestrator
        .fetch_feed("https://example.org/public", FetchOptions::default())
        .await
        .unwrap();
    orchestrator
        .fetch_feed(
            "https://example.org/loans",
            FetchOptions {
                use_auth: true,
                ..FetchOptions::default()
            },
        )
        .await
        .unwrap();

    let requests = transport.requests();
    assert!(requests[0].header(AUTHORIZATION).is_none());
    assert_eq!(requests[1].header(AUTHORIZATION), Some("Bearer token"));
}

#[tokio::test]
async fn test_invalid_address_is_rejected_without_network() {
    let transport = Arc::new(ScriptedTransport::new(both_formats));
    let orchestrator = orchestrator(transport.clone(), FetchLayerConfig::default());

    let err = orchestrator.fetch("not a url").await.unwrap_err();

    assert!(matches!(err, FetchError::InvalidUrl { .. }));
    assert_eq!(transport.count(), 0);
}

#[tokio::test]
async fn test_clear_all_caches_forces_refetch() {
    let calls = Arc::new(AtomicUsize::new(0));
    let counter = calls.clone();
    let transport = Arc::new(ScriptedTransport::new(move |request, _| {
        counter.fetch_add(1, Ordering::SeqCst);
        both_formats(request, 0)
    }));
    let orchestrator = orchestrator(transport, FetchLayerConfig::default());

    orchestrator.fetch(ADDRESS).await.unwrap();
    orchestrator.clear_all_caches();
    orchestrator.fetch(ADDRESS).await.unwrap();

    assert_eq!(calls.load(Ordering::SeqCst), 2);
}
