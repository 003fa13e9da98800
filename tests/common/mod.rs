//! Shared fixtures for addax integration tests.
//!
//! Provides a temp-dir test environment, a programmable in-memory source
//! provider, and a zip archive builder, so tests can exercise the full
//! reconcile → plan → install flow without touching the network.

#![allow(dead_code)]

use std::collections::BTreeMap;
use std::io::{Cursor, Write};
use std::path::Path;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use bytes::Bytes;
use chrono::{TimeZone, Utc};
use zip::write::SimpleFileOptions;

use addax::cache::{ManualTimeSource, MetadataCache};
use addax::config::{ManagerConfig, SourceConfig};
use addax::context::ManagerContext;
use addax::core::AddaxError;
use addax::source::{
    AddonIdentity, AddonVersion, Compatibility, Download, SourceInfo, SourceProvider,
    SourceRegistry,
};
use addax::state::StateStore;
use addax::utils::checksum_bytes;

/// Builds an in-memory zip archive from `(path, contents)` entries.
pub fn build_zip(entries: &[(&str, &str)]) -> Vec<u8> {
    let mut writer = zip::ZipWriter::new(Cursor::new(Vec::new()));
    for (name, contents) in entries {
        writer.start_file(*name, SimpleFileOptions::default()).unwrap();
        writer.write_all(contents.as_bytes()).unwrap();
    }
    writer.finish().unwrap().into_inner()
}

/// A conventional single-folder add-on archive.
pub fn addon_zip(folder: &str, version: &str) -> Vec<u8> {
    build_zip(&[
        (
            &format!("{folder}/{folder}.toc"),
            &format!("## Title: {folder}\n## Version: {version}\n"),
        ),
        (&format!("{folder}/core.lua"), "-- code\n"),
    ])
}

#[derive(Default)]
struct MockState {
    identities: Vec<AddonIdentity>,
    hint_results: BTreeMap<String, Vec<AddonIdentity>>,
    versions: BTreeMap<String, Vec<AddonVersion>>,
    archives: BTreeMap<String, Vec<u8>>,
}

/// Programmable in-memory source provider.
///
/// `search` answers hint-key lookups from the configured hint table and
/// every other query with the full identity list; client-side scoring is
/// what the tests exercise. Catalogue contents can be mutated after
/// registration (version retraction, new releases) through the same
/// `Arc<MockSource>` handle the registry holds.
pub struct MockSource {
    id: String,
    hint_key: Option<String>,
    state: Mutex<MockState>,
    search_calls: AtomicU32,
    fail_next_searches: AtomicU32,
}

impl MockSource {
    pub fn new(id: &str) -> Arc<Self> {
        Arc::new(Self {
            id: id.to_string(),
            hint_key: None,
            state: Mutex::new(MockState::default()),
            search_calls: AtomicU32::new(0),
            fail_next_searches: AtomicU32::new(0),
        })
    }

    pub fn with_hint_key(id: &str, hint_key: &str) -> Arc<Self> {
        Arc::new(Self {
            id: id.to_string(),
            hint_key: Some(hint_key.to_string()),
            state: Mutex::new(MockState::default()),
            search_calls: AtomicU32::new(0),
            fail_next_searches: AtomicU32::new(0),
        })
    }

    pub fn identity(&self, slug: &str, name: &str) -> AddonIdentity {
        let identity =
            AddonIdentity { source: self.id.clone(), slug: slug.to_string(), name: name.to_string() };
        self.state.lock().unwrap().identities.push(identity.clone());
        identity
    }

    /// Maps a hint-key value (e.g. a project id) to catalogue entries.
    pub fn hint(&self, key: &str, identities: &[AddonIdentity]) {
        self.state.lock().unwrap().hint_results.insert(key.to_string(), identities.to_vec());
    }

    /// Publishes a version whose archive is a conventional add-on zip for
    /// `folder`, with a correct checksum.
    pub fn publish(
        &self,
        identity: &AddonIdentity,
        label: &str,
        day: u32,
        folder: &str,
    ) -> AddonVersion {
        self.publish_archive(identity, label, day, addon_zip(folder, label), true)
    }

    /// Publishes a version with an explicit archive; `checksum_ok` false
    /// declares a deliberately wrong checksum.
    pub fn publish_archive(
        &self,
        identity: &AddonIdentity,
        label: &str,
        day: u32,
        archive: Vec<u8>,
        checksum_ok: bool,
    ) -> AddonVersion {
        let url = format!("mock://{}/{}/{label}", self.id, identity.slug);
        let checksum = if checksum_ok {
            checksum_bytes(&archive)
        } else {
            "sha256:0000000000000000000000000000000000000000000000000000000000000000".to_string()
        };
        let version = AddonVersion {
            identity: identity.clone(),
            version: label.to_string(),
            published: Utc.with_ymd_and_hms(2024, 1, day, 0, 0, 0).unwrap(),
            download_url: url.clone(),
            compatibility: Compatibility::ANY,
            checksum: Some(checksum),
        };
        let mut state = self.state.lock().unwrap();
        state.archives.insert(url, archive);
        state.versions.entry(identity.slug.clone()).or_default().push(version.clone());
        version
    }

    /// Removes a published version, as a source retracting a release does.
    pub fn retract(&self, slug: &str, label: &str) {
        let mut state = self.state.lock().unwrap();
        if let Some(versions) = state.versions.get_mut(slug) {
            versions.retain(|v| v.version != label);
        }
    }

    /// Number of `search` calls that reached this provider.
    pub fn search_calls(&self) -> u32 {
        self.search_calls.load(Ordering::SeqCst)
    }

    /// Makes the next `n` searches fail with `SourceUnavailable`.
    pub fn fail_next_searches(&self, n: u32) {
        self.fail_next_searches.store(n, Ordering::SeqCst);
    }
}

#[async_trait]
impl SourceProvider for MockSource {
    fn info(&self) -> SourceInfo {
        SourceInfo { id: self.id.clone(), hint_key: self.hint_key.clone() }
    }

    async fn search(&self, hint: &str) -> Result<Vec<AddonIdentity>, AddaxError> {
        self.search_calls.fetch_add(1, Ordering::SeqCst);
        if self.fail_next_searches.load(Ordering::SeqCst) > 0 {
            self.fail_next_searches.fetch_sub(1, Ordering::SeqCst);
            return Err(AddaxError::SourceUnavailable {
                source_id: self.id.clone(),
                reason: "simulated outage".to_string(),
            });
        }
        let state = self.state.lock().unwrap();
        if let Some(hits) = state.hint_results.get(hint) {
            return Ok(hits.clone());
        }
        Ok(state.identities.clone())
    }

    async fn list_versions(
        &self,
        identity: &AddonIdentity,
    ) -> Result<Vec<AddonVersion>, AddaxError> {
        let state = self.state.lock().unwrap();
        Ok(state.versions.get(&identity.slug).cloned().unwrap_or_default())
    }

    async fn fetch(&self, version: &AddonVersion) -> Result<Download, AddaxError> {
        let archive = {
            let state = self.state.lock().unwrap();
            state.archives.get(&version.download_url).cloned()
        };
        let Some(archive) = archive else {
            return Err(AddaxError::SourceUnavailable {
                source_id: self.id.clone(),
                reason: format!("no archive at {}", version.download_url),
            });
        };
        let chunks: Vec<Result<Bytes, std::io::Error>> = archive
            .chunks(1024)
            .map(|chunk| Ok(Bytes::copy_from_slice(chunk)))
            .collect();
        Ok(Download {
            stream: Box::pin(futures::stream::iter(chunks)),
            checksum: version.checksum.clone(),
        })
    }
}

/// Temp-dir test environment: an add-on directory, a config pointing at
/// it, and helpers to build contexts around mock sources.
pub struct TestEnv {
    pub tmp: tempfile::TempDir,
    pub config: ManagerConfig,
}

impl TestEnv {
    pub fn new() -> Self {
        let tmp = tempfile::tempdir().unwrap();
        let addon_dir = tmp.path().join("AddOns");
        std::fs::create_dir_all(&addon_dir).unwrap();
        let mut config = ManagerConfig::new(addon_dir, 100207);
        config.retry_base_ms = 1;
        Self { tmp, config }
    }

    pub fn addon_dir(&self) -> &Path {
        &self.config.addon_dir
    }

    /// Writes an on-disk add-on folder with a manifest.
    pub fn write_addon(&self, name: &str, toc: &str) {
        let dir = self.addon_dir().join(name);
        std::fs::create_dir_all(&dir).unwrap();
        std::fs::write(dir.join(format!("{name}.toc")), toc).unwrap();
        std::fs::write(dir.join("core.lua"), "-- code\n").unwrap();
    }

    /// Builds a context over the given `(provider, priority)` pairs.
    pub fn context(&self, sources: &[(Arc<MockSource>, u32)]) -> ManagerContext {
        self.context_with_clock(sources, Arc::new(ManualTimeSource::default())).0
    }

    /// As [`context`](Self::context), also returning the manual cache
    /// clock for TTL tests.
    pub fn context_with_clock(
        &self,
        sources: &[(Arc<MockSource>, u32)],
        clock: Arc<ManualTimeSource>,
    ) -> (ManagerContext, Arc<ManualTimeSource>) {
        let mut registry =
            SourceRegistry::new(self.config.retry_attempts, self.config.retry_base_delay());
        for (provider, priority) in sources {
            registry
                .register(Arc::clone(provider) as Arc<dyn SourceProvider>, SourceConfig::with_priority(*priority));
        }
        let cache = Arc::new(MetadataCache::with_clock(
            self.config.cache_capacity,
            self.config.serve_stale_on_error,
            Arc::clone(&clock) as _,
        ));
        let store = Arc::new(StateStore::open(&self.config.state_path).unwrap());
        let ctx = ManagerContext::from_parts(
            self.config.clone(),
            Arc::new(registry),
            cache,
            store,
        );
        (ctx, clock)
    }
}

/// Folder-name set literal.
pub fn folders(names: &[&str]) -> std::collections::BTreeSet<String> {
    names.iter().map(|s| s.to_string()).collect()
}
