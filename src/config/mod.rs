//! Engine configuration.
//!
//! Everything the engine needs to know about its environment lives here and
//! is threaded through explicitly via [`ManagerContext`]; there are no
//! ambient singletons. The whole structure deserializes from TOML so a host
//! application can keep it in a profile file.
//!
//! [`ManagerContext`]: crate::context::ManagerContext

use std::path::PathBuf;
use std::time::Duration;

use serde::{Deserialize, Serialize};

/// Default time-to-live for cached source metadata.
pub const DEFAULT_CACHE_TTL_SECS: u64 = 300;

/// Default number of concurrent connections per source.
pub const DEFAULT_SOURCE_CONNECTIONS: usize = 4;

/// Default bound on concurrently matched folder groups in a session.
pub const DEFAULT_MATCH_CONCURRENCY: usize = 8;

/// Per-source tuning: priority, cache lifetime, connection pool size.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SourceConfig {
    /// Rank used to break score ties between sources; lower wins.
    pub priority: u32,

    /// Seconds a cached response from this source stays fresh.
    #[serde(default = "default_ttl_secs")]
    pub cache_ttl_secs: u64,

    /// Maximum in-flight requests against this source.
    ///
    /// Sized per source so one rate-limited catalogue cannot starve the
    /// others.
    #[serde(default = "default_connections")]
    pub max_connections: usize,
}

fn default_ttl_secs() -> u64 {
    DEFAULT_CACHE_TTL_SECS
}

fn default_connections() -> usize {
    DEFAULT_SOURCE_CONNECTIONS
}

impl SourceConfig {
    /// Config with the given priority and default TTL/pool settings.
    pub fn with_priority(priority: u32) -> Self {
        Self {
            priority,
            cache_ttl_secs: DEFAULT_CACHE_TTL_SECS,
            max_connections: DEFAULT_SOURCE_CONNECTIONS,
        }
    }

    /// The TTL as a [`Duration`].
    pub fn cache_ttl(&self) -> Duration {
        Duration::from_secs(self.cache_ttl_secs)
    }
}

impl Default for SourceConfig {
    fn default() -> Self {
        Self::with_priority(u32::MAX)
    }
}

/// Top-level engine configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ManagerConfig {
    /// Directory the managed add-on folders live in.
    pub addon_dir: PathBuf,

    /// Path of the durable state store document.
    pub state_path: PathBuf,

    /// Interface number of the running application/game version.
    ///
    /// Versions whose compatibility range excludes this number are never
    /// installed.
    pub interface: u32,

    /// How many folder groups a session matches concurrently.
    #[serde(default = "default_match_concurrency")]
    pub match_concurrency: usize,

    /// Serve a stale cache entry when the backing source errors.
    ///
    /// Degraded-mode fallback; a stale hit served this way is logged at
    /// `warn` level.
    #[serde(default = "default_true")]
    pub serve_stale_on_error: bool,

    /// Network retry attempts before a source is dropped from a query.
    #[serde(default = "default_retry_attempts")]
    pub retry_attempts: u32,

    /// Base delay for exponential retry backoff, in milliseconds.
    #[serde(default = "default_retry_base_ms")]
    pub retry_base_ms: u64,

    /// Bound on cached metadata entries; oldest entries are evicted first.
    ///
    /// `None` disables the size cap and leaves expiry purely time-based.
    #[serde(default)]
    pub cache_capacity: Option<usize>,
}

fn default_match_concurrency() -> usize {
    DEFAULT_MATCH_CONCURRENCY
}

fn default_true() -> bool {
    true
}

fn default_retry_attempts() -> u32 {
    3
}

fn default_retry_base_ms() -> u64 {
    250
}

impl ManagerConfig {
    /// Config rooted at `addon_dir` with the state store beside it.
    pub fn new(addon_dir: impl Into<PathBuf>, interface: u32) -> Self {
        let addon_dir = addon_dir.into();
        let state_path = addon_dir.join(".addax").join("addons.lock");
        Self {
            addon_dir,
            state_path,
            interface,
            match_concurrency: DEFAULT_MATCH_CONCURRENCY,
            serve_stale_on_error: true,
            retry_attempts: 3,
            retry_base_ms: 250,
            cache_capacity: None,
        }
    }

    /// Base backoff delay as a [`Duration`].
    pub fn retry_base_delay(&self) -> Duration {
        Duration::from_millis(self.retry_base_ms)
    }
}
