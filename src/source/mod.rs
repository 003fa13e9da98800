//! Source providers and the registry that fans queries out across them.
//!
//! A *source* is one remote catalogue of add-ons (CurseForge-like, a
//! community index, a bare HTTP mirror). Each is abstracted behind the
//! [`SourceProvider`] capability trait: `search`, `list_versions`, `fetch`.
//! Transport mechanics (HTTP negotiation, auth, pagination) live entirely in
//! the provider implementation; the registry never sees them.
//!
//! Providers are the parse-and-validate boundary: they return the
//! strongly-typed [`AddonIdentity`] / [`AddonVersion`] records or a
//! structured [`AddaxError::ParseFailure`]; untyped payloads never cross
//! this interface.
//!
//! The [`SourceRegistry`] owns one bounded connection pool per source (a
//! rate-limited catalogue cannot starve the others) and applies bounded
//! retry with exponential backoff before a source is dropped from a query's
//! results. Failures are reported per source, never aggregated into one
//! opaque error.

use std::collections::BTreeMap;
use std::sync::Arc;

use async_trait::async_trait;
use bytes::Bytes;
use chrono::{DateTime, Utc};
use futures::future::join_all;
use futures::stream::BoxStream;
use serde::{Deserialize, Serialize};
use tokio::sync::Semaphore;

use crate::config::SourceConfig;
use crate::core::AddaxError;
use crate::utils::{retry_with_backoff, CancelToken};

/// Canonical reference to an add-on within one source's namespace.
///
/// Not globally unique: the same real-world add-on may have one identity per
/// source that carries it.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct AddonIdentity {
    /// Registry id of the source this identity belongs to.
    pub source: String,
    /// Stable slug within the source's namespace.
    pub slug: String,
    /// Human-readable display name.
    pub name: String,
}

/// Inclusive interface-number range a version supports.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Compatibility {
    /// Lowest supported interface number; unbounded when `None`.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub min_interface: Option<u32>,
    /// Highest supported interface number; unbounded when `None`.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max_interface: Option<u32>,
}

impl Compatibility {
    /// A range accepting every interface number.
    pub const ANY: Self = Self { min_interface: None, max_interface: None };

    /// True when `interface` falls inside the range.
    pub fn accepts(&self, interface: u32) -> bool {
        self.min_interface.is_none_or(|min| interface >= min)
            && self.max_interface.is_none_or(|max| interface <= max)
    }
}

/// One installable release of an add-on.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AddonVersion {
    /// The identity this version belongs to.
    pub identity: AddonIdentity,
    /// Version label as published by the source.
    pub version: String,
    /// Publication timestamp; the default planning policy picks the newest.
    pub published: DateTime<Utc>,
    /// Opaque download locator, interpreted by the owning provider.
    pub download_url: String,
    /// Interface range this release supports.
    #[serde(default)]
    pub compatibility: Compatibility,
    /// `sha256:` checksum of the archive, when the source publishes one.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub checksum: Option<String>,
}

/// Static description a provider reports about itself.
#[derive(Debug, Clone)]
pub struct SourceInfo {
    /// Registry id; also the `source` field of identities it returns.
    pub id: String,
    /// Manifest directive key that carries this source's add-on key
    /// (e.g. `X-Curse-Project-ID`), when the ecosystem embeds one.
    pub hint_key: Option<String>,
}

/// Chunked archive payload returned by [`SourceProvider::fetch`].
pub struct Download {
    /// The archive bytes.
    pub stream: BoxStream<'static, std::io::Result<Bytes>>,
    /// `sha256:` checksum to verify against, when the source declares one.
    pub checksum: Option<String>,
}

impl std::fmt::Debug for Download {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Download").field("checksum", &self.checksum).finish_non_exhaustive()
    }
}

/// Capability interface implemented once per remote source.
///
/// Every call may fail independently; the registry isolates failures per
/// source. Implementations must be cheap to call concurrently; the
/// registry enforces the configured connection bound around each call.
#[async_trait]
pub trait SourceProvider: Send + Sync {
    /// Identity and hint metadata for this source.
    fn info(&self) -> SourceInfo;

    /// Searches the catalogue with a free-form name hint.
    async fn search(&self, hint: &str) -> Result<Vec<AddonIdentity>, AddaxError>;

    /// Lists the published versions of an identity, any order.
    async fn list_versions(
        &self,
        identity: &AddonIdentity,
    ) -> Result<Vec<AddonVersion>, AddaxError>;

    /// Opens the archive byte stream for a version.
    async fn fetch(&self, version: &AddonVersion) -> Result<Download, AddaxError>;
}

struct RegisteredSource {
    provider: Arc<dyn SourceProvider>,
    config: SourceConfig,
    pool: Arc<Semaphore>,
}

/// The set of registered sources, queried uniformly.
pub struct SourceRegistry {
    sources: BTreeMap<String, RegisteredSource>,
    retry_attempts: u32,
    retry_base: std::time::Duration,
}

impl SourceRegistry {
    /// An empty registry with the given retry policy.
    pub fn new(retry_attempts: u32, retry_base: std::time::Duration) -> Self {
        Self { sources: BTreeMap::new(), retry_attempts, retry_base }
    }

    /// Registers a provider under its own reported id.
    ///
    /// Re-registering an id replaces the previous provider.
    pub fn register(&mut self, provider: Arc<dyn SourceProvider>, config: SourceConfig) {
        let id = provider.info().id;
        let pool = Arc::new(Semaphore::new(config.max_connections.max(1)));
        tracing::debug!(source = %id, priority = config.priority, "registered source");
        self.sources.insert(id, RegisteredSource { provider, config, pool });
    }

    /// Ids of all registered sources, in deterministic order.
    pub fn source_ids(&self) -> Vec<String> {
        self.sources.keys().cloned().collect()
    }

    /// Tie-break rank of a source; unknown sources sink to the bottom.
    pub fn priority_of(&self, source: &str) -> u32 {
        self.sources.get(source).map_or(u32::MAX, |s| s.config.priority)
    }

    /// Cache TTL configured for a source.
    pub fn cache_ttl_of(&self, source: &str) -> std::time::Duration {
        self.sources.get(source).map_or(
            std::time::Duration::from_secs(crate::config::DEFAULT_CACHE_TTL_SECS),
            |s| s.config.cache_ttl(),
        )
    }

    /// Map from manifest hint key to the source id claiming it.
    pub fn hint_keys(&self) -> BTreeMap<String, String> {
        self.sources
            .values()
            .filter_map(|s| {
                let info = s.provider.info();
                info.hint_key.map(|key| (key, info.id))
            })
            .collect()
    }

    async fn with_source<T, F, Fut>(
        &self,
        source: &str,
        cancel: &CancelToken,
        op: F,
    ) -> Result<T, AddaxError>
    where
        F: Fn(Arc<dyn SourceProvider>) -> Fut,
        Fut: std::future::Future<Output = Result<T, AddaxError>>,
    {
        let registered =
            self.sources.get(source).ok_or_else(|| AddaxError::SourceUnavailable {
                source_id: source.to_string(),
                reason: "source is not registered".to_string(),
            })?;
        let _permit = registered.pool.clone().acquire_owned().await.map_err(|_| {
            AddaxError::SourceUnavailable {
                source_id: source.to_string(),
                reason: "connection pool closed".to_string(),
            }
        })?;
        retry_with_backoff(self.retry_attempts, self.retry_base, cancel, || {
            op(Arc::clone(&registered.provider))
        })
        .await
    }

    /// Searches one source, with retry and the source's connection bound.
    pub async fn search(
        &self,
        source: &str,
        hint: &str,
        cancel: &CancelToken,
    ) -> Result<Vec<AddonIdentity>, AddaxError> {
        let hint = hint.to_string();
        self.with_source(source, cancel, move |provider| {
            let hint = hint.clone();
            async move { provider.search(&hint).await }
        })
        .await
    }

    /// Fans a search out to every registered source concurrently.
    ///
    /// One source's failure never blocks the others: the result holds one
    /// entry per source, failures reported per source id.
    pub async fn search_all(
        &self,
        hint: &str,
        cancel: &CancelToken,
    ) -> Vec<(String, Result<Vec<AddonIdentity>, AddaxError>)> {
        let queries = self.sources.keys().map(|id| {
            let id = id.clone();
            async move {
                let result = self.search(&id, hint, cancel).await;
                if let Err(err) = &result {
                    tracing::warn!(source = %id, %err, "source dropped from query");
                }
                (id, result)
            }
        });
        join_all(queries).await
    }

    /// Lists versions of an identity through its owning source.
    pub async fn list_versions(
        &self,
        identity: &AddonIdentity,
        cancel: &CancelToken,
    ) -> Result<Vec<AddonVersion>, AddaxError> {
        let source = identity.source.clone();
        let identity = identity.clone();
        self.with_source(&source, cancel, move |provider| {
            let identity = identity.clone();
            async move { provider.list_versions(&identity).await }
        })
        .await
    }

    /// Opens the download stream for a version through its owning source.
    ///
    /// Retry applies to establishing the stream; consuming it is the
    /// caller's concern.
    pub async fn fetch(
        &self,
        version: &AddonVersion,
        cancel: &CancelToken,
    ) -> Result<Download, AddaxError> {
        let source = version.identity.source.clone();
        let version = version.clone();
        self.with_source(&source, cancel, move |provider| {
            let version = version.clone();
            async move { provider.fetch(&version).await }
        })
        .await
    }
}

impl std::fmt::Debug for SourceRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SourceRegistry")
            .field("sources", &self.source_ids())
            .finish_non_exhaustive()
    }
}
