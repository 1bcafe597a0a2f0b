//! Stale-while-revalidate document cache.
//!
//! Entries are stored in a [`LayeredCache`] without a hard TTL. Freshness is derived from the
//! entry's `fetched_at` at read time:
//!
//! - fresh: younger than `stale_after`, served as is
//! - stale: served immediately while a background refresh runs
//! - expired: older than `expire_after`, never served
//!
//! Entries also keep the `ETag` / `Last-Modified` validators of the response they came from, so
//! refreshes can be conditional.

use parking_lot::Mutex;
use serde::{Deserialize, Serialize, de::DeserializeOwned};
use std::collections::{HashMap, HashSet};
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use crate::error::{ConfigError, FetchError};
use crate::layered::LayeredCache;
use crate::observability::{EventSink, FetchEvent, NoopSink};
use crate::utils::{duration_ms, now_ms};

/// A cached document plus the metadata needed to revalidate it.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DocumentCacheEntry<D> {
    pub document: D,
    /// Unix timestamp in milliseconds of the last successful fetch or revalidation.
    pub fetched_at: i64,
    pub etag: Option<String>,
    pub last_modified: Option<String>,
}

impl<D> DocumentCacheEntry<D> {
    /// Entry fetched now.
    pub fn new(document: D, etag: Option<String>, last_modified: Option<String>) -> Self {
        DocumentCacheEntry {
            document,
            fetched_at: now_ms(),
            etag,
            last_modified,
        }
    }

    pub fn age_ms(&self, now_ms: i64) -> i64 {
        now_ms.saturating_sub(self.fetched_at)
    }

    pub fn is_stale(&self, stale_after: Duration, now_ms: i64) -> bool {
        self.age_ms(now_ms) > duration_ms(stale_after)
    }

    pub fn is_expired(&self, expire_after: Duration, now_ms: i64) -> bool {
        self.age_ms(now_ms) > duration_ms(expire_after)
    }
}

/// Classification of an entry's age.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Freshness {
    Fresh,
    Stale,
    Expired,
}

/// The two ages that split fresh, stale and expired entries.
///
/// Always satisfies `stale_after < expire_after`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FreshnessPolicy {
    stale_after: Duration,
    expire_after: Duration,
}

impl FreshnessPolicy {
    pub fn new(stale_after: Duration, expire_after: Duration) -> Result<Self, ConfigError> {
        if stale_after >= expire_after {
            return Err(ConfigError::InvalidFreshness {
                stale_after,
                expire_after,
            });
        }
        Ok(FreshnessPolicy {
            stale_after,
            expire_after,
        })
    }

    /// Stale after 5 minutes, expired after 1 hour.
    pub fn conservative() -> Self {
        FreshnessPolicy {
            stale_after: Duration::from_secs(5 * 60),
            expire_after: Duration::from_secs(60 * 60),
        }
    }

    /// Stale after 1 minute, expired after 10 minutes.
    pub fn aggressive() -> Self {
        FreshnessPolicy {
            stale_after: Duration::from_secs(60),
            expire_after: Duration::from_secs(10 * 60),
        }
    }

    pub fn stale_after(&self) -> Duration {
        self.stale_after
    }

    pub fn expire_after(&self) -> Duration {
        self.expire_after
    }

    pub fn classify<D>(&self, entry: &DocumentCacheEntry<D>, now_ms: i64) -> Freshness {
        if entry.is_expired(self.expire_after, now_ms) {
            Freshness::Expired
        } else if entry.is_stale(self.stale_after, now_ms) {
            Freshness::Stale
        } else {
            Freshness::Fresh
        }
    }
}

impl Default for FreshnessPolicy {
    fn default() -> Self {
        Self::conservative()
    }
}

/// Validators to attach to a conditional request.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ConditionalHeaders {
    /// Value for `If-None-Match`.
    pub if_none_match: Option<String>,
    /// Value for `If-Modified-Since`.
    pub if_modified_since: Option<String>,
}

impl ConditionalHeaders {
    pub fn from_entry<D>(entry: &DocumentCacheEntry<D>) -> Self {
        ConditionalHeaders {
            if_none_match: entry.etag.clone(),
            if_modified_since: entry.last_modified.clone(),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.if_none_match.is_none() && self.if_modified_since.is_none()
    }
}

/// What a fetcher got back from the remote.
#[derive(Debug, Clone, PartialEq)]
pub enum FetchOutcome<D> {
    Modified {
        document: D,
        etag: Option<String>,
        last_modified: Option<String>,
    },
    /// The remote confirmed the cached copy is still current.
    NotModified,
}

/// Result of [`DocumentCache::get_with_revalidation`].
#[derive(Debug, Clone, PartialEq)]
pub struct Revalidated<D> {
    pub document: D,
    /// The document is past `stale_after`.
    pub is_stale: bool,
    /// This call started a background refresh.
    pub did_trigger_refresh: bool,
}

/// Removes an address from the refresh set when the refresh task ends, however it ends.
struct RefreshGuard {
    refreshing: Arc<Mutex<HashSet<String>>>,
    address: String,
}

impl Drop for RefreshGuard {
    fn drop(&mut self) {
        self.refreshing.lock().remove(&self.address);
    }
}

/// Invalidation counters. `remove` bumps an address, `clear` bumps everything.
#[derive(Debug, Default)]
struct Epochs {
    cleared: u64,
    removed: HashMap<String, u64>,
}

/// Invalidation state of one address at the moment a fetch started.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct Epoch {
    cleared: u64,
    removed: u64,
}

impl Epochs {
    fn current(&self, address: &str) -> Epoch {
        Epoch {
            cleared: self.cleared,
            removed: self.removed.get(address).copied().unwrap_or(0),
        }
    }
}

/// Document cache keyed by resource address.
pub struct DocumentCache<D> {
    cache: LayeredCache<String, DocumentCacheEntry<D>>,
    policy: FreshnessPolicy,
    /// Addresses with a background refresh in flight.
    refreshing: Arc<Mutex<HashSet<String>>>,
    /// Fetch results are only stored if their address was not invalidated meanwhile.
    epochs: Arc<Mutex<Epochs>>,
    sink: Arc<dyn EventSink>,
}

impl<D> Clone for DocumentCache<D> {
    fn clone(&self) -> Self {
        DocumentCache {
            cache: self.cache.clone(),
            policy: self.policy,
            refreshing: Arc::clone(&self.refreshing),
            epochs: Arc::clone(&self.epochs),
            sink: Arc::clone(&self.sink),
        }
    }
}

impl<D> DocumentCache<D>
where
    D: Serialize + DeserializeOwned + Clone + Send + Sync + 'static,
{
    pub fn new(cache: LayeredCache<String, DocumentCacheEntry<D>>, policy: FreshnessPolicy) -> Self {
        DocumentCache {
            cache,
            policy,
            refreshing: Arc::new(Mutex::new(HashSet::new())),
            epochs: Arc::new(Mutex::new(Epochs::default())),
            sink: Arc::new(NoopSink),
        }
    }

    pub fn with_sink(mut self, sink: Arc<dyn EventSink>) -> Self {
        self.sink = sink;
        self
    }

    pub fn policy(&self) -> FreshnessPolicy {
        self.policy
    }

    /// The underlying layered cache.
    pub fn layered(&self) -> &LayeredCache<String, DocumentCacheEntry<D>> {
        &self.cache
    }

    /// Return the entry unless it has expired; expired entries are removed.
    pub async fn get(&self, address: &str) -> Option<DocumentCacheEntry<D>> {
        let key = address.to_string();
        let entry = self.cache.get(&key).await?;
        if entry.is_expired(self.policy.expire_after, now_ms()) {
            tracing::debug!("Dropping expired document for {}", address);
            self.cache.remove(&key);
            return None;
        }
        Some(entry)
    }

    /// Store an entry. Expiry is computed from `fetched_at` on read, not enforced by the cache.
    pub fn set(&self, address: &str, entry: DocumentCacheEntry<D>) {
        self.cache.set(address.to_string(), entry, None);
    }

    /// Remove the entry. A fetch for the address that is already running will not store its
    /// result.
    pub fn remove(&self, address: &str) {
        let mut epochs = self.epochs.lock();
        *epochs.removed.entry(address.to_string()).or_default() += 1;
        self.cache.remove(&address.to_string());
    }

    /// Remove every entry. Fetches already running will not store their results.
    pub fn clear(&self) {
        let mut epochs = self.epochs.lock();
        epochs.cleared += 1;
        epochs.removed.clear();
        self.cache.clear();
    }

    /// Mark the cached document as just revalidated and return it.
    pub async fn touch(&self, address: &str) -> Option<D> {
        let epoch = self.epoch(address);
        self.touch_since(address, epoch).await
    }

    async fn touch_since(&self, address: &str, epoch: Epoch) -> Option<D> {
        let mut entry = self.cache.get(&address.to_string()).await?;
        entry.fetched_at = now_ms();
        let document = entry.document.clone();
        self.set_since(address, entry, epoch);
        Some(document)
    }

    fn epoch(&self, address: &str) -> Epoch {
        self.epochs.lock().current(address)
    }

    /// Store `entry` unless the address was invalidated after `epoch` was taken.
    fn set_since(&self, address: &str, entry: DocumentCacheEntry<D>, epoch: Epoch) -> bool {
        let epochs = self.epochs.lock();
        if epochs.current(address) != epoch {
            tracing::debug!("{} was invalidated during the fetch, not storing", address);
            return false;
        }
        self.set(address, entry);
        true
    }

    /// Validators of the cached entry, expired or not.
    pub async fn conditional_headers(&self, address: &str) -> ConditionalHeaders {
        self.cache
            .get(&address.to_string())
            .await
            .map(|entry| ConditionalHeaders::from_entry(&entry))
            .unwrap_or_default()
    }

    /// Serve from cache when possible, refreshing stale entries in the background.
    ///
    /// - no usable entry: `fetcher` runs now and its error is returned unchanged
    /// - fresh entry: returned, `fetcher` is not called
    /// - stale entry: returned at once; `fetcher` runs in a detached task unless a refresh for
    ///   the address is already running
    ///
    /// `fetcher` receives the validators of whatever entry is being revalidated. An expired
    /// entry is never returned as such, but a `NotModified` reply revives it.
    pub async fn get_with_revalidation<F, Fut>(
        &self,
        address: &str,
        fetcher: F,
    ) -> Result<Revalidated<D>, FetchError>
    where
        F: FnOnce(ConditionalHeaders) -> Fut + Send + 'static,
        Fut: Future<Output = Result<FetchOutcome<D>, FetchError>> + Send + 'static,
    {
        let epoch = self.epoch(address);
        let cached = self.cache.get(&address.to_string()).await;
        let Some(entry) = cached else {
            return self.fetch_now(address, None, epoch, fetcher).await;
        };

        match self.policy.classify(&entry, now_ms()) {
            Freshness::Fresh => Ok(Revalidated {
                document: entry.document,
                is_stale: false,
                did_trigger_refresh: false,
            }),
            Freshness::Stale => {
                let document = entry.document.clone();
                let did_trigger_refresh = self.spawn_refresh(address, entry, epoch, fetcher);
                Ok(Revalidated {
                    document,
                    is_stale: true,
                    did_trigger_refresh,
                })
            }
            Freshness::Expired => self.fetch_now(address, Some(entry), epoch, fetcher).await,
        }
    }

    /// Bypass the cache read, fetch unconditionally and overwrite the entry on success.
    pub async fn fetch_fresh<F, Fut>(&self, address: &str, fetcher: F) -> Result<D, FetchError>
    where
        F: FnOnce(ConditionalHeaders) -> Fut,
        Fut: Future<Output = Result<FetchOutcome<D>, FetchError>>,
    {
        let epoch = self.epoch(address);
        self.fetch_now(address, None, epoch, fetcher)
            .await
            .map(|revalidated| revalidated.document)
    }

    async fn fetch_now<F, Fut>(
        &self,
        address: &str,
        existing: Option<DocumentCacheEntry<D>>,
        epoch: Epoch,
        fetcher: F,
    ) -> Result<Revalidated<D>, FetchError>
    where
        F: FnOnce(ConditionalHeaders) -> Fut,
        Fut: Future<Output = Result<FetchOutcome<D>, FetchError>>,
    {
        let headers = existing
            .as_ref()
            .map(ConditionalHeaders::from_entry)
            .unwrap_or_default();

        let document = match fetcher(headers).await {
            Ok(FetchOutcome::Modified {
                document,
                etag,
                last_modified,
            }) => {
                self.set_since(
                    address,
                    DocumentCacheEntry::new(document.clone(), etag, last_modified),
                    epoch,
                );
                document
            }
            Ok(FetchOutcome::NotModified) => {
                let Some(mut entry) = existing else {
                    return Err(FetchError::NotModifiedWithoutCache {
                        url: address.to_string(),
                    });
                };
                tracing::debug!("{} not modified, reviving cached document", address);
                entry.fetched_at = now_ms();
                let document = entry.document.clone();
                self.set_since(address, entry, epoch);
                document
            }
            Err(e) => {
                if existing.is_some() {
                    self.remove(address);
                }
                return Err(e);
            }
        };

        Ok(Revalidated {
            document,
            is_stale: false,
            did_trigger_refresh: false,
        })
    }

    /// Start a background refresh unless one is already running for the address.
    fn spawn_refresh<F, Fut>(
        &self,
        address: &str,
        entry: DocumentCacheEntry<D>,
        epoch: Epoch,
        fetcher: F,
    ) -> bool
    where
        F: FnOnce(ConditionalHeaders) -> Fut + Send + 'static,
        Fut: Future<Output = Result<FetchOutcome<D>, FetchError>> + Send + 'static,
    {
        if !self.refreshing.lock().insert(address.to_string()) {
            tracing::debug!("Refresh already running for {}", address);
            return false;
        }

        let guard = RefreshGuard {
            refreshing: Arc::clone(&self.refreshing),
            address: address.to_string(),
        };
        let cache = self.clone();
        let headers = ConditionalHeaders::from_entry(&entry);

        tokio::spawn(async move {
            let address = guard.address.clone();
            match fetcher(headers).await {
                Ok(FetchOutcome::Modified {
                    document,
                    etag,
                    last_modified,
                }) => {
                    let entry = DocumentCacheEntry::new(document, etag, last_modified);
                    if cache.set_since(&address, entry, epoch) {
                        tracing::debug!("Background refresh stored new document for {}", address);
                    }
                    cache.sink.emit(FetchEvent::RefreshCompleted { address });
                }
                Ok(FetchOutcome::NotModified) => {
                    cache.touch_since(&address, epoch).await;
                    tracing::debug!("Background refresh: {} not modified", address);
                    cache.sink.emit(FetchEvent::RefreshCompleted { address });
                }
                Err(e) => {
                    tracing::warn!(
                        "Background refresh for {} failed, keeping stale copy: {}",
                        address,
                        e
                    );
                    cache.sink.emit(FetchEvent::RefreshFailed {
                        address,
                        error: e.to_string(),
                    });
                }
            }
            drop(guard);
        });

        true
    }
}
