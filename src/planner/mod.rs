//! Turning a chosen identity into a concrete installable version.
//!
//! The planner fetches an identity's version list (cache-backed) and applies
//! a selection policy. It never silently picks an incompatible version: when
//! nothing satisfies the interface constraint the attempt fails with
//! [`AddaxError::NoCompatibleVersion`], and a pinned label that has been
//! retracted from its source fails with [`AddaxError::VersionUnavailable`]
//! while leaving the existing installation untouched.

use std::sync::Arc;

use crate::cache::{CacheKey, CachedPayload, MetadataCache};
use crate::core::AddaxError;
use crate::source::{AddonIdentity, AddonVersion, SourceRegistry};
use crate::utils::CancelToken;

/// How the planner picks among compatible versions.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub enum VersionPolicy {
    /// Newest by publish timestamp among compatible versions.
    #[default]
    Latest,
    /// A previously recorded label, re-validated for continued
    /// availability.
    Pinned(String),
}

/// Resolves versions for committed selections.
pub struct Planner {
    registry: Arc<SourceRegistry>,
    cache: Arc<MetadataCache>,
    interface: u32,
}

impl Planner {
    /// Planner constrained to the given application interface number.
    pub fn new(registry: Arc<SourceRegistry>, cache: Arc<MetadataCache>, interface: u32) -> Self {
        Self { registry, cache, interface }
    }

    async fn versions_of(
        &self,
        identity: &AddonIdentity,
        cancel: &CancelToken,
    ) -> Result<Vec<AddonVersion>, AddaxError> {
        let key = CacheKey::versions(identity);
        let ttl = self.registry.cache_ttl_of(&identity.source);
        let payload = self
            .cache
            .get_or_fetch(key, ttl, || async {
                let versions = self.registry.list_versions(identity, cancel).await?;
                Ok(CachedPayload::Versions(versions))
            })
            .await?;
        match payload.as_ref() {
            CachedPayload::Versions(versions) => Ok(versions.clone()),
            CachedPayload::Identities(_) => Ok(Vec::new()),
        }
    }

    /// Plans the version to install for `identity` under `policy`.
    ///
    /// `excluded` labels are skipped; this is the checksum-mismatch fallback:
    /// after a failed verification the caller replans with the bad label
    /// excluded and gets the next compatible version.
    pub async fn plan(
        &self,
        identity: &AddonIdentity,
        policy: &VersionPolicy,
        excluded: &[String],
        cancel: &CancelToken,
    ) -> Result<AddonVersion, AddaxError> {
        cancel.check()?;
        let versions = self.versions_of(identity, cancel).await?;

        match policy {
            VersionPolicy::Pinned(label) => versions
                .into_iter()
                .find(|v| &v.version == label)
                .ok_or_else(|| AddaxError::VersionUnavailable {
                    source_id: identity.source.clone(),
                    slug: identity.slug.clone(),
                    version: label.clone(),
                }),
            VersionPolicy::Latest => {
                let mut compatible: Vec<_> = versions
                    .into_iter()
                    .filter(|v| v.compatibility.accepts(self.interface))
                    .filter(|v| !excluded.contains(&v.version))
                    .collect();
                // Newest first; label as a deterministic tie-break.
                compatible.sort_by(|a, b| {
                    b.published.cmp(&a.published).then_with(|| b.version.cmp(&a.version))
                });
                compatible.into_iter().next().ok_or_else(|| {
                    AddaxError::NoCompatibleVersion {
                        source_id: identity.source.clone(),
                        slug: identity.slug.clone(),
                        interface: self.interface,
                    }
                })
            }
        }
    }
}
