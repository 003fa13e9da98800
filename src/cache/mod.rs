//! Memoization of remote metadata responses.
//!
//! Every metadata query the engine makes (`search`, `list-versions`) goes
//! through this layer. Entries are keyed by source, operation, and the
//! normalized query parameters, carry their insertion time, and expire after
//! the owning source's TTL. Three policies from the configuration apply:
//!
//! - **stale-if-error**: when a refresh fails and a stale entry exists, the
//!   stale value may be served as a degraded fallback (logged at `warn`);
//! - **size cap**: an optional bound on entry count, evicting the oldest
//!   entries first;
//! - **manual invalidation**: prefix-based, so a caller can force-refresh
//!   one source or one operation without dropping the whole cache.
//!
//! The map is safe for concurrent readers; writers never corrupt a
//! concurrent read (each entry is an immutable `Arc`'d snapshot).
//!
//! Time is injected through [`TimeSource`] so expiry is testable without
//! sleeping.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use dashmap::DashMap;

use crate::core::AddaxError;
use crate::source::{AddonIdentity, AddonVersion};

/// Monotonic clock abstraction, milliseconds since an arbitrary origin.
pub trait TimeSource: Send + Sync {
    /// Current monotonic time in milliseconds.
    fn now_millis(&self) -> u64;
}

/// Wall-clock [`TimeSource`] backed by [`Instant`].
#[derive(Debug)]
pub struct SystemTimeSource {
    origin: Instant,
}

impl Default for SystemTimeSource {
    fn default() -> Self {
        Self { origin: Instant::now() }
    }
}

impl TimeSource for SystemTimeSource {
    fn now_millis(&self) -> u64 {
        self.origin.elapsed().as_millis() as u64
    }
}

/// Manually advanced [`TimeSource`] for tests.
#[derive(Debug, Default)]
pub struct ManualTimeSource {
    millis: AtomicU64,
}

impl ManualTimeSource {
    /// Moves the clock forward.
    pub fn advance(&self, by: Duration) {
        self.millis.fetch_add(by.as_millis() as u64, Ordering::SeqCst);
    }
}

impl TimeSource for ManualTimeSource {
    fn now_millis(&self) -> u64 {
        self.millis.load(Ordering::SeqCst)
    }
}

/// Cache key: source id, operation, normalized query parameters.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct CacheKey {
    /// Source the query targets.
    pub source: String,
    /// Operation discriminator (`"search"`, `"versions"`).
    pub operation: &'static str,
    /// Normalized query parameters.
    pub query: String,
}

impl CacheKey {
    /// Key for a catalogue search.
    pub fn search(source: &str, query: &str) -> Self {
        Self { source: source.to_string(), operation: "search", query: query.to_string() }
    }

    /// Key for a version listing.
    pub fn versions(identity: &AddonIdentity) -> Self {
        Self {
            source: identity.source.clone(),
            operation: "versions",
            query: identity.slug.clone(),
        }
    }

    fn matches_prefix(&self, source: &str, operation: Option<&str>) -> bool {
        self.source == source && operation.is_none_or(|op| self.operation == op)
    }
}

/// A memoized metadata response.
#[derive(Debug, Clone, PartialEq)]
pub enum CachedPayload {
    /// Result of a `search` call.
    Identities(Vec<AddonIdentity>),
    /// Result of a `list-versions` call.
    Versions(Vec<AddonVersion>),
}

#[derive(Clone)]
struct Entry {
    payload: Arc<CachedPayload>,
    inserted_at: u64,
}

/// Concurrent TTL cache over source metadata.
pub struct MetadataCache {
    entries: DashMap<CacheKey, Entry>,
    clock: Arc<dyn TimeSource>,
    capacity: Option<usize>,
    serve_stale_on_error: bool,
}

impl MetadataCache {
    /// Cache with the system clock.
    pub fn new(capacity: Option<usize>, serve_stale_on_error: bool) -> Self {
        Self::with_clock(capacity, serve_stale_on_error, Arc::new(SystemTimeSource::default()))
    }

    /// Cache with an injected clock (tests).
    pub fn with_clock(
        capacity: Option<usize>,
        serve_stale_on_error: bool,
        clock: Arc<dyn TimeSource>,
    ) -> Self {
        Self { entries: DashMap::new(), clock, capacity, serve_stale_on_error }
    }

    fn fresh_hit(&self, key: &CacheKey, ttl: Duration) -> Option<Arc<CachedPayload>> {
        let entry = self.entries.get(key)?;
        let age = self.clock.now_millis().saturating_sub(entry.inserted_at);
        if age <= ttl.as_millis() as u64 {
            Some(Arc::clone(&entry.payload))
        } else {
            None
        }
    }

    fn stale_hit(&self, key: &CacheKey) -> Option<Arc<CachedPayload>> {
        self.entries.get(key).map(|entry| Arc::clone(&entry.payload))
    }

    fn insert(&self, key: CacheKey, payload: CachedPayload) -> Arc<CachedPayload> {
        let payload = Arc::new(payload);
        self.entries.insert(
            key,
            Entry { payload: Arc::clone(&payload), inserted_at: self.clock.now_millis() },
        );
        self.enforce_capacity();
        payload
    }

    fn enforce_capacity(&self) {
        let Some(capacity) = self.capacity else { return };
        while self.entries.len() > capacity {
            let oldest = self
                .entries
                .iter()
                .min_by_key(|entry| entry.value().inserted_at)
                .map(|entry| entry.key().clone());
            match oldest {
                Some(key) => {
                    self.entries.remove(&key);
                }
                None => break,
            }
        }
    }

    /// Serves a fresh hit, or delegates to `fetch` and stores the result.
    ///
    /// Within `ttl` of a prior store the underlying source is never
    /// invoked. On fetch failure with a stale-but-present entry, the stale
    /// value is served when the policy flag allows it.
    pub async fn get_or_fetch<F, Fut>(
        &self,
        key: CacheKey,
        ttl: Duration,
        fetch: F,
    ) -> Result<Arc<CachedPayload>, AddaxError>
    where
        F: FnOnce() -> Fut,
        Fut: std::future::Future<Output = Result<CachedPayload, AddaxError>>,
    {
        if let Some(hit) = self.fresh_hit(&key, ttl) {
            tracing::debug!(?key, "cache hit");
            return Ok(hit);
        }

        match fetch().await {
            Ok(payload) => Ok(self.insert(key, payload)),
            Err(err) if self.serve_stale_on_error => match self.stale_hit(&key) {
                Some(stale) => {
                    tracing::warn!(?key, %err, "serving stale cache entry after fetch failure");
                    Ok(stale)
                }
                None => Err(err),
            },
            Err(err) => Err(err),
        }
    }

    /// Drops every entry for `source`, optionally restricted to one
    /// operation. Supports forced refresh.
    pub fn invalidate(&self, source: &str, operation: Option<&str>) {
        self.entries.retain(|key, _| !key.matches_prefix(source, operation));
    }

    /// Number of live entries (fresh and stale).
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// True when the cache holds no entries.
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

impl std::fmt::Debug for MetadataCache {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MetadataCache")
            .field("entries", &self.entries.len())
            .field("capacity", &self.capacity)
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn identity(slug: &str) -> AddonIdentity {
        AddonIdentity { source: "a".into(), slug: slug.into(), name: slug.into() }
    }

    fn cache_with_manual_clock() -> (MetadataCache, Arc<ManualTimeSource>) {
        let clock = Arc::new(ManualTimeSource::default());
        let cache = MetadataCache::with_clock(None, true, Arc::clone(&clock) as _);
        (cache, clock)
    }

    #[tokio::test]
    async fn fresh_hit_skips_the_fetch() {
        let (cache, _clock) = cache_with_manual_clock();
        let key = CacheKey::search("a", "dbm");
        let ttl = Duration::from_secs(300);

        let mut fetches = 0u32;
        for _ in 0..3 {
            cache
                .get_or_fetch(key.clone(), ttl, || {
                    fetches += 1;
                    async { Ok(CachedPayload::Identities(vec![identity("dbm")])) }
                })
                .await
                .unwrap();
        }
        assert_eq!(fetches, 1);
    }

    #[tokio::test]
    async fn expired_entry_refetches() {
        let (cache, clock) = cache_with_manual_clock();
        let key = CacheKey::search("a", "dbm");
        let ttl = Duration::from_secs(300);

        let mut fetches = 0u32;
        for _ in 0..2 {
            cache
                .get_or_fetch(key.clone(), ttl, || {
                    fetches += 1;
                    async { Ok(CachedPayload::Identities(Vec::new())) }
                })
                .await
                .unwrap();
            clock.advance(Duration::from_secs(301));
        }
        assert_eq!(fetches, 2);
    }

    #[tokio::test]
    async fn stale_entry_serves_on_fetch_failure() {
        let (cache, clock) = cache_with_manual_clock();
        let key = CacheKey::search("a", "dbm");
        let ttl = Duration::from_secs(10);

        cache
            .get_or_fetch(key.clone(), ttl, || async {
                Ok(CachedPayload::Identities(vec![identity("dbm")]))
            })
            .await
            .unwrap();
        clock.advance(Duration::from_secs(60));

        let served = cache
            .get_or_fetch(key, ttl, || async {
                Err(AddaxError::SourceUnavailable { source_id: "a".into(), reason: "down".into() })
            })
            .await
            .unwrap();
        assert_eq!(*served, CachedPayload::Identities(vec![identity("dbm")]));
    }

    #[tokio::test]
    async fn stale_fallback_disabled_propagates_the_error() {
        let clock = Arc::new(ManualTimeSource::default());
        let cache = MetadataCache::with_clock(None, false, Arc::clone(&clock) as _);
        let key = CacheKey::search("a", "dbm");
        let ttl = Duration::from_secs(10);

        cache
            .get_or_fetch(key.clone(), ttl, || async {
                Ok(CachedPayload::Identities(Vec::new()))
            })
            .await
            .unwrap();
        clock.advance(Duration::from_secs(60));

        let result = cache
            .get_or_fetch(key, ttl, || async {
                Err(AddaxError::SourceUnavailable { source_id: "a".into(), reason: "down".into() })
            })
            .await;
        assert!(result.is_err());
    }

    #[tokio::test]
    async fn capacity_evicts_oldest_first() {
        let clock = Arc::new(ManualTimeSource::default());
        let cache = MetadataCache::with_clock(Some(2), true, Arc::clone(&clock) as _);
        let ttl = Duration::from_secs(300);

        for slug in ["one", "two", "three"] {
            cache
                .get_or_fetch(CacheKey::search("a", slug), ttl, || async {
                    Ok(CachedPayload::Identities(Vec::new()))
                })
                .await
                .unwrap();
            clock.advance(Duration::from_secs(1));
        }

        assert_eq!(cache.len(), 2);
        // "one" was oldest; a lookup for it must fetch again.
        let mut fetched = false;
        cache
            .get_or_fetch(CacheKey::search("a", "one"), ttl, || {
                fetched = true;
                async { Ok(CachedPayload::Identities(Vec::new())) }
            })
            .await
            .unwrap();
        assert!(fetched);
    }

    #[tokio::test]
    async fn invalidate_is_prefix_scoped() {
        let (cache, _clock) = cache_with_manual_clock();
        let ttl = Duration::from_secs(300);
        for (source, slug) in [("a", "x"), ("a", "y"), ("b", "x")] {
            cache
                .get_or_fetch(CacheKey::search(source, slug), ttl, || async {
                    Ok(CachedPayload::Identities(Vec::new()))
                })
                .await
                .unwrap();
        }
        cache.invalidate("a", Some("search"));
        assert_eq!(cache.len(), 1);
        cache.invalidate("b", None);
        assert!(cache.is_empty());
    }
}
