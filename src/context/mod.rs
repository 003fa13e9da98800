//! The explicit context object wiring the engine together.
//!
//! There are no ambient singletons anywhere in the crate: configuration,
//! source registry, metadata cache, state store, and the derived services
//! (matcher, planner, installer) are all owned by one [`ManagerContext`]
//! and threaded through session construction. A context is scoped however
//! the host wants: one per reconciliation run or one per process lifetime.

use std::sync::Arc;

use anyhow::Result;

use crate::cache::MetadataCache;
use crate::config::ManagerConfig;
use crate::core::AddaxError;
use crate::installer::Installer;
use crate::matcher::Matcher;
use crate::planner::{Planner, VersionPolicy};
use crate::source::SourceRegistry;
use crate::state::StateStore;

/// Shared services for one reconciliation/install scope.
pub struct ManagerContext {
    /// Engine configuration.
    pub config: ManagerConfig,
    /// The registered sources.
    pub registry: Arc<SourceRegistry>,
    /// Metadata cache wrapping registry queries.
    pub cache: Arc<MetadataCache>,
    /// The durable state store.
    pub store: Arc<StateStore>,
    /// Candidate matcher.
    pub matcher: Matcher,
    /// Version planner.
    pub planner: Planner,
    /// Installation pipeline.
    pub installer: Installer,
}

impl ManagerContext {
    /// Builds a context from configuration and a populated registry.
    ///
    /// Opens (or creates) the state store at the configured path.
    pub fn new(config: ManagerConfig, registry: SourceRegistry) -> Result<Self> {
        let registry = Arc::new(registry);
        let cache = Arc::new(MetadataCache::new(
            config.cache_capacity,
            config.serve_stale_on_error,
        ));
        let store = Arc::new(StateStore::open(&config.state_path)?);
        Ok(Self::from_parts(config, registry, cache, store))
    }

    /// Builds a context from pre-constructed parts (tests inject a manual
    /// cache clock this way).
    pub fn from_parts(
        config: ManagerConfig,
        registry: Arc<SourceRegistry>,
        cache: Arc<MetadataCache>,
        store: Arc<StateStore>,
    ) -> Self {
        let matcher = Matcher::new(Arc::clone(&registry), Arc::clone(&cache));
        let planner =
            Planner::new(Arc::clone(&registry), Arc::clone(&cache), config.interface);
        let installer = Installer::new(
            Arc::clone(&registry),
            Arc::clone(&store),
            config.addon_dir.clone(),
        );
        Self { config, registry, cache, store, matcher, planner, installer }
    }
}

/// Result of an update attempt on one installed add-on.
#[derive(Debug)]
pub enum UpdateOutcome {
    /// A newer compatible version was installed.
    Updated(crate::core::Updated),
    /// The installation is already current (or pinned to the installed
    /// version) and intact.
    UpToDate(crate::state::InstalledAddon),
}

impl ManagerContext {
    /// Updates the installed add-on owning `folders`.
    ///
    /// Pinned installations re-validate their recorded version label and
    /// fail with [`AddaxError::VersionUnavailable`] if it was retracted,
    /// leaving the existing record untouched. Unpinned installations follow
    /// the newest-compatible policy; a version-equal, intact installation
    /// is reported up to date without touching disk.
    pub async fn update(
        &self,
        folders: &std::collections::BTreeSet<String>,
        options: &crate::installer::InstallOptions,
    ) -> Result<UpdateOutcome, AddaxError> {
        let current = self
            .store
            .get(folders)
            .await
            .ok_or_else(|| AddaxError::NotInstalled { folders: folders.clone() })?;

        let policy = if current.pinned {
            VersionPolicy::Pinned(current.version.clone())
        } else {
            VersionPolicy::Latest
        };
        let candidate =
            self.planner.plan(&current.identity(), &policy, &[], &options.cancel).await?;

        if !self.installer.needs_update(&current, &candidate) {
            return Ok(UpdateOutcome::UpToDate(current));
        }
        let updated = self.installer.update(current, &candidate, options).await?;
        Ok(UpdateOutcome::Updated(updated))
    }

    /// Removes the installed add-on owning `folders`.
    pub async fn remove(
        &self,
        folders: &std::collections::BTreeSet<String>,
        keep_folders: bool,
    ) -> Result<crate::core::Removed, AddaxError> {
        self.installer.remove(folders, keep_folders).await
    }

    /// Pins or unpins the installed add-on owning `folders`.
    pub async fn set_pinned(
        &self,
        folders: &std::collections::BTreeSet<String>,
        pinned: bool,
    ) -> Result<crate::state::InstalledAddon, AddaxError> {
        self.store.set_pinned(folders, pinned).await
    }
}

impl std::fmt::Debug for ManagerContext {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ManagerContext")
            .field("addon_dir", &self.config.addon_dir)
            .field("sources", &self.registry.source_ids())
            .finish_non_exhaustive()
    }
}
