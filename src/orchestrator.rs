//! Fetch orchestration: request coalescing, format fallback and breaker-guarded transport.
//!
//! A fetch for an address runs at most once at a time. Concurrent callers for the same address
//! share one [`Shared`] future; the in-flight table only keeps a weak handle to it, so the
//! physical fetch is dropped as soon as the last waiting caller goes away.

use futures::future::{AbortHandle, Abortable, Aborted, BoxFuture, FutureExt, Shared, WeakShared};
use parking_lot::{Mutex, RwLock};
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Weak};
use url::Url;

use crate::breaker::CircuitBreakerRegistry;
use crate::document::{ConditionalHeaders, DocumentCache, FetchOutcome};
use crate::error::FetchError;
use crate::format::{DocumentParser, Feed, WireFormat};
use crate::observability::{EventSink, FetchEvent};
use crate::transport::{Credentials, Transport, TransportRequest};

/// Per-call switches for [`FetchOrchestrator::fetch_feed`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FetchOptions {
    /// Try the primary format first and fall back to the secondary one. When `false`, only the
    /// secondary format is requested.
    pub prefer_primary: bool,
    /// Attach the configured credentials.
    pub use_auth: bool,
    /// Skip the cache read and overwrite the cached entry with whatever the network returns.
    pub force_refresh: bool,
}

impl Default for FetchOptions {
    fn default() -> Self {
        FetchOptions {
            prefer_primary: true,
            use_auth: false,
            force_refresh: false,
        }
    }
}

/// Order in which formats are attempted.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Plan {
    PrimaryThenSecondary,
    PrimaryOnly,
    SecondaryOnly,
}

impl Plan {
    fn for_options(options: FetchOptions) -> Self {
        if options.prefer_primary {
            Plan::PrimaryThenSecondary
        } else {
            Plan::SecondaryOnly
        }
    }
}

/// Outcome of a feed fetch.
pub type FeedResult<A, B> = Result<Feed<A, B>, FetchError>;
type SharedFetch<A, B> = Shared<BoxFuture<'static, FeedResult<A, B>>>;

struct InFlight<A, B> {
    id: u64,
    fetch: WeakShared<BoxFuture<'static, FeedResult<A, B>>>,
    abort: AbortHandle,
}

/// Circuit breaker key for a format and a remote host.
///
/// A non-default port is part of the key, so services sharing a host get separate breakers.
pub fn service_key(format: &str, url: &Url) -> String {
    let host = url.host_str().unwrap_or("unknown");
    match url.port() {
        Some(port) => format!("{}-{}:{}", format, host, port),
        None => format!("{}-{}", format, host),
    }
}

/// Everything a single transport call needs, detached from the orchestrator.
#[derive(Clone)]
struct RequestContext {
    transport: Arc<dyn Transport>,
    breakers: Arc<CircuitBreakerRegistry>,
    url: Url,
    credentials: Option<Credentials>,
}

/// Fetch one document through the breaker for its format and host.
///
/// Statuses other than 2xx and 304 count as breaker failures. Parse errors do not, the service
/// answered.
async fn fetch_document<T: DocumentParser>(
    ctx: RequestContext,
    parser: Arc<T>,
    headers: ConditionalHeaders,
) -> Result<FetchOutcome<T::Document>, FetchError> {
    let service = service_key(T::NAME, &ctx.url);
    let mut request = TransportRequest::get(ctx.url.clone())
        .accept(parser.accept())
        .conditional(&headers);
    if let Some(credentials) = &ctx.credentials {
        request = request.authorization(credentials);
    }

    let response = ctx
        .breakers
        .execute(&service, || async {
            let response = ctx.transport.send(request).await?;
            if response.is_success() || response.is_not_modified() {
                Ok(response)
            } else {
                Err(FetchError::Status {
                    url: ctx.url.to_string(),
                    status: response.status,
                })
            }
        })
        .await?;

    if response.is_not_modified() {
        return Ok(FetchOutcome::NotModified);
    }

    let document = parser.parse(&response.body)?;
    Ok(FetchOutcome::Modified {
        document,
        etag: response.etag(),
        last_modified: response.last_modified(),
    })
}

struct Inner<P, S>
where
    P: DocumentParser,
    S: DocumentParser,
{
    transport: Arc<dyn Transport>,
    primary: Arc<P>,
    secondary: Arc<S>,
    primary_cache: DocumentCache<P::Document>,
    secondary_cache: DocumentCache<S::Document>,
    breakers: Arc<CircuitBreakerRegistry>,
    credentials: RwLock<Option<Credentials>>,
    in_flight: Mutex<HashMap<String, InFlight<P::Document, S::Document>>>,
    next_id: AtomicU64,
    defaults: FetchOptions,
    sink: Arc<dyn EventSink>,
}

/// Removes a finished, failed or abandoned fetch from the in-flight table.
struct Deregister<P, S>
where
    P: DocumentParser,
    S: DocumentParser,
{
    inner: Weak<Inner<P, S>>,
    address: String,
    id: u64,
}

impl<P, S> Drop for Deregister<P, S>
where
    P: DocumentParser,
    S: DocumentParser,
{
    fn drop(&mut self) {
        let Some(inner) = self.inner.upgrade() else {
            return;
        };
        let mut in_flight = inner.in_flight.lock();
        if in_flight.get(&self.address).is_some_and(|f| f.id == self.id) {
            in_flight.remove(&self.address);
        }
    }
}

/// Fetches documents available in two formats, with caching, coalescing and circuit breaking.
///
/// Build one with [`OrchestratorBuilder`](crate::OrchestratorBuilder).
pub struct FetchOrchestrator<P, S>
where
    P: DocumentParser,
    S: DocumentParser,
{
    inner: Arc<Inner<P, S>>,
}

impl<P, S> Clone for FetchOrchestrator<P, S>
where
    P: DocumentParser,
    S: DocumentParser,
{
    fn clone(&self) -> Self {
        FetchOrchestrator {
            inner: Arc::clone(&self.inner),
        }
    }
}

impl<P, S> FetchOrchestrator<P, S>
where
    P: DocumentParser,
    S: DocumentParser,
{
    #[allow(clippy::too_many_arguments)]
    pub(crate) fn from_parts(
        transport: Arc<dyn Transport>,
        primary: P,
        secondary: S,
        primary_cache: DocumentCache<P::Document>,
        secondary_cache: DocumentCache<S::Document>,
        breakers: Arc<CircuitBreakerRegistry>,
        credentials: Option<Credentials>,
        defaults: FetchOptions,
        sink: Arc<dyn EventSink>,
    ) -> Self {
        FetchOrchestrator {
            inner: Arc::new(Inner {
                transport,
                primary: Arc::new(primary),
                secondary: Arc::new(secondary),
                primary_cache,
                secondary_cache,
                breakers,
                credentials: RwLock::new(credentials),
                in_flight: Mutex::new(HashMap::new()),
                next_id: AtomicU64::new(0),
                defaults,
                sink,
            }),
        }
    }

    /// Options used by [`fetch`](Self::fetch).
    pub fn default_options(&self) -> FetchOptions {
        self.inner.defaults
    }

    /// [`fetch_feed`](Self::fetch_feed) with the configured default options.
    pub async fn fetch(&self, address: &str) -> FeedResult<P::Document, S::Document> {
        self.fetch_feed(address, self.inner.defaults).await
    }

    /// Fetch a resource, joining an identical in-flight request if there is one.
    ///
    /// With `prefer_primary` the primary format is tried first; any failure there, transport or
    /// parse, moves on to the secondary format, whose error is the one returned.
    pub async fn fetch_feed(
        &self,
        address: &str,
        options: FetchOptions,
    ) -> FeedResult<P::Document, S::Document> {
        let url = parse_address(address)?;
        self.coalesced(url, options, false).await
    }

    /// Like [`fetch_feed`](Self::fetch_feed), but first probes the resource with a `HEAD`
    /// request and goes straight to the matching format. If the probe fails or is inconclusive
    /// the normal `options` path is taken.
    pub async fn fetch_feed_auto_detect(
        &self,
        address: &str,
        options: FetchOptions,
    ) -> FeedResult<P::Document, S::Document> {
        let url = parse_address(address)?;
        self.coalesced(url, options, true).await
    }

    fn coalesced(
        &self,
        url: Url,
        options: FetchOptions,
        detect: bool,
    ) -> SharedFetch<P::Document, S::Document> {
        let address = url.to_string();
        let mut in_flight = self.inner.in_flight.lock();

        if let Some(existing) = in_flight.get(&address).and_then(|f| f.fetch.upgrade()) {
            tracing::debug!("Joining in-flight request for {}", address);
            return existing;
        }

        let id = self.inner.next_id.fetch_add(1, Ordering::Relaxed);
        let (abort, registration) = AbortHandle::new_pair();
        let run = Abortable::new(self.clone().run(url, options, detect), registration);
        let deregister = Deregister {
            inner: Arc::downgrade(&self.inner),
            address: address.clone(),
            id,
        };

        let fetch = async move {
            let _deregister = deregister;
            match run.await {
                Ok(result) => result,
                Err(Aborted) => Err(FetchError::Cancelled),
            }
        }
        .boxed()
        .shared();

        if let Some(weak) = fetch.downgrade() {
            in_flight.insert(
                address,
                InFlight {
                    id,
                    fetch: weak,
                    abort,
                },
            );
        }
        fetch
    }

    async fn run(
        self,
        url: Url,
        options: FetchOptions,
        detect: bool,
    ) -> FeedResult<P::Document, S::Document> {
        let plan = if detect {
            match self.probe(&url, options).await {
                Some(WireFormat::Primary) => Plan::PrimaryOnly,
                Some(WireFormat::Secondary) => Plan::SecondaryOnly,
                None => Plan::for_options(options),
            }
        } else {
            Plan::for_options(options)
        };

        match plan {
            Plan::PrimaryOnly => self.fetch_primary(&url, options).await.map(Feed::Primary),
            Plan::SecondaryOnly => self
                .fetch_secondary(&url, options)
                .await
                .map(Feed::Secondary),
            Plan::PrimaryThenSecondary => match self.fetch_primary(&url, options).await {
                Ok(document) => Ok(Feed::Primary(document)),
                Err(e) => {
                    tracing::warn!(
                        "{} fetch failed for {}, falling back to {}: {}",
                        P::NAME,
                        url,
                        S::NAME,
                        e
                    );
                    self.inner.sink.emit(FetchEvent::FormatFallback {
                        address: url.to_string(),
                        error: e.to_string(),
                    });
                    self.fetch_secondary(&url, options)
                        .await
                        .map(Feed::Secondary)
                }
            },
        }
    }

    /// Find out the format from a `HEAD` response. Not guarded by a breaker.
    async fn probe(&self, url: &Url, options: FetchOptions) -> Option<WireFormat> {
        let mut request = TransportRequest::head(url.clone());
        if let Some(credentials) = self.credentials_for(options) {
            request = request.authorization(&credentials);
        }

        match self.inner.transport.send(request).await {
            Ok(response) if response.is_success() => {
                let detected = response
                    .content_type()
                    .and_then(WireFormat::from_content_type)
                    .or_else(|| WireFormat::sniff(&response.body));
                tracing::debug!("Probe of {} detected {:?}", url, detected);
                detected
            }
            Ok(response) => {
                tracing::warn!(
                    "Probe of {} returned {}, using default format order",
                    url,
                    response.status
                );
                None
            }
            Err(e) => {
                tracing::warn!("Probe of {} failed, using default format order: {}", url, e);
                None
            }
        }
    }

    fn credentials_for(&self, options: FetchOptions) -> Option<Credentials> {
        if options.use_auth {
            self.inner.credentials.read().clone()
        } else {
            None
        }
    }

    fn context(&self, url: &Url, options: FetchOptions) -> RequestContext {
        RequestContext {
            transport: Arc::clone(&self.inner.transport),
            breakers: Arc::clone(&self.inner.breakers),
            url: url.clone(),
            credentials: self.credentials_for(options),
        }
    }

    async fn fetch_primary(
        &self,
        url: &Url,
        options: FetchOptions,
    ) -> Result<P::Document, FetchError> {
        let ctx = self.context(url, options);
        let parser = Arc::clone(&self.inner.primary);
        fetch_cached(&self.inner.primary_cache, ctx, parser, options.force_refresh).await
    }

    async fn fetch_secondary(
        &self,
        url: &Url,
        options: FetchOptions,
    ) -> Result<S::Document, FetchError> {
        let ctx = self.context(url, options);
        let parser = Arc::clone(&self.inner.secondary);
        fetch_cached(&self.inner.secondary_cache, ctx, parser, options.force_refresh).await
    }

    /// Drop both formats' cached copies of an address.
    pub fn invalidate_cache(&self, address: &str) {
        let key = parse_address(address)
            .map(|url| url.to_string())
            .unwrap_or_else(|_| address.to_string());
        self.inner.primary_cache.remove(&key);
        self.inner.secondary_cache.remove(&key);
        tracing::debug!("Invalidated cached documents for {}", key);
    }

    pub fn clear_all_caches(&self) {
        self.inner.primary_cache.clear();
        self.inner.secondary_cache.clear();
        tracing::info!("Cleared all document caches");
    }

    /// Cancel the in-flight request for an address. Every waiter gets [`FetchError::Cancelled`].
    /// Cached data is untouched.
    pub fn cancel_request(&self, address: &str) {
        let key = parse_address(address)
            .map(|url| url.to_string())
            .unwrap_or_else(|_| address.to_string());
        if let Some(in_flight) = self.inner.in_flight.lock().remove(&key) {
            in_flight.abort.abort();
            tracing::debug!("Cancelled in-flight request for {}", key);
        }
    }

    pub fn cancel_all(&self) {
        let drained: Vec<_> = self.inner.in_flight.lock().drain().collect();
        for (_, in_flight) in &drained {
            in_flight.abort.abort();
        }
        tracing::debug!("Cancelled {} in-flight requests", drained.len());
    }

    /// Number of addresses with a fetch in flight.
    pub fn in_flight_count(&self) -> usize {
        // Entries leave the table when their fetch is dropped, so no upgrade is needed here.
        // Upgrading under the lock could make this the last handle and deadlock on drop.
        self.inner.in_flight.lock().len()
    }

    /// Credentials attached to requests made with `use_auth`. `None` removes them.
    pub fn set_credentials(&self, credentials: Option<Credentials>) {
        *self.inner.credentials.write() = credentials;
    }

    /// The circuit breakers, for inspection and operational resets.
    pub fn breakers(&self) -> &CircuitBreakerRegistry {
        &self.inner.breakers
    }

    pub fn primary_cache(&self) -> &DocumentCache<P::Document> {
        &self.inner.primary_cache
    }

    pub fn secondary_cache(&self) -> &DocumentCache<S::Document> {
        &self.inner.secondary_cache
    }
}

async fn fetch_cached<T: DocumentParser>(
    cache: &DocumentCache<T::Document>,
    ctx: RequestContext,
    parser: Arc<T>,
    force_refresh: bool,
) -> Result<T::Document, FetchError> {
    let address = ctx.url.to_string();

    if force_refresh {
        return cache
            .fetch_fresh(&address, move |headers| fetch_document(ctx, parser, headers))
            .await;
    }

    let revalidated = cache
        .get_with_revalidation(&address, move |headers| {
            fetch_document(ctx, parser, headers)
        })
        .await?;
    if revalidated.is_stale {
        tracing::debug!("Serving stale {} document for {}", T::NAME, address);
    }
    Ok(revalidated.document)
}

fn parse_address(address: &str) -> Result<Url, FetchError> {
    Url::parse(address).map_err(|e| FetchError::InvalidUrl {
        url: address.to_string(),
        message: e.to_string(),
    })
}
