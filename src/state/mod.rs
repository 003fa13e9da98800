//! The durable local state store: which folder groups belong to which
//! installed add-ons.
//!
//! The store is a versioned TOML document (an `addons.lock` in the spirit of
//! a package manager lockfile) holding one [`InstalledAddon`] record per
//! managed folder group, plus an in-memory index for lookups. The document
//! format is forward-compatible: unknown fields are ignored on load and the
//! `version` field gates future migrations.
//!
//! # Concurrency
//!
//! The store is the only mutable shared resource in the engine. All writes
//! go through a single writer lock; `put` re-checks folder overlap inside
//! the lock, so two installs targeting overlapping folder groups can never
//! both succeed; the second fails with a conflict instead of silently
//! overwriting (folder membership is partitioned across at most one record).
//! Reads are serialized through the same lock; they are cheap map lookups.
//!
//! Persistence is atomic (temp file + rename), matching the on-disk swap
//! discipline of the installer.

use std::collections::BTreeSet;
use std::path::PathBuf;

use anyhow::Context;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::sync::Mutex;

use crate::core::AddaxError;
use crate::source::{AddonIdentity, AddonVersion};
use crate::utils::atomic_write;

/// Current on-disk document version.
pub const STATE_VERSION: u32 = 1;

/// Durable record tying a folder group to an installed add-on version.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct InstalledAddon {
    /// Folder names the installation owns. Sorted, unique.
    pub folders: BTreeSet<String>,

    /// Source the add-on was installed from.
    pub source: String,

    /// Slug within the source's namespace.
    pub slug: String,

    /// Display name at install time.
    pub name: String,

    /// Installed version label.
    pub version: String,

    /// Publication timestamp of the installed version.
    pub published: DateTime<Utc>,

    /// Locator the archive was fetched from.
    pub source_url: String,

    /// When the installation happened.
    pub installed_at: DateTime<Utc>,

    /// Pinned installations are exempt from the default "latest" policy.
    #[serde(default)]
    pub pinned: bool,
}

impl InstalledAddon {
    /// Builds a record from a resolved version and the folders it owns.
    pub fn from_version(version: &AddonVersion, folders: BTreeSet<String>) -> Self {
        Self {
            folders,
            source: version.identity.source.clone(),
            slug: version.identity.slug.clone(),
            name: version.identity.name.clone(),
            version: version.version.clone(),
            published: version.published,
            source_url: version.download_url.clone(),
            installed_at: Utc::now(),
            pinned: false,
        }
    }

    /// The record's identity as the sources know it.
    pub fn identity(&self) -> AddonIdentity {
        AddonIdentity {
            source: self.source.clone(),
            slug: self.slug.clone(),
            name: self.name.clone(),
        }
    }

    /// `source:slug` label used in conflict errors.
    pub fn describe(&self) -> String {
        format!("{}:{}", self.source, self.slug)
    }
}

#[derive(Debug, Default, Serialize, Deserialize)]
struct StateDocument {
    version: u32,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    addons: Vec<InstalledAddon>,
}

/// The local state store. See the module docs for locking semantics.
#[derive(Debug)]
pub struct StateStore {
    path: PathBuf,
    inner: Mutex<Vec<InstalledAddon>>,
}

impl StateStore {
    /// Opens the store at `path`, loading an existing document when present.
    pub fn open(path: impl Into<PathBuf>) -> anyhow::Result<Self> {
        let path = path.into();
        let addons = match std::fs::read_to_string(&path) {
            Ok(text) => {
                let doc: StateDocument = toml::from_str(&text)
                    .with_context(|| format!("malformed state store at {}", path.display()))?;
                if doc.version > STATE_VERSION {
                    anyhow::bail!(
                        "state store at {} has version {} (newer than supported {})",
                        path.display(),
                        doc.version,
                        STATE_VERSION
                    );
                }
                doc.addons
            }
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => Vec::new(),
            Err(err) => {
                return Err(err).with_context(|| {
                    format!("failed to read state store at {}", path.display())
                });
            }
        };
        Ok(Self { path, inner: Mutex::new(addons) })
    }

    fn persist(path: &std::path::Path, addons: &[InstalledAddon]) -> Result<(), AddaxError> {
        let mut sorted = addons.to_vec();
        sorted.sort_by(|a, b| a.folders.cmp(&b.folders));
        let doc = StateDocument { version: STATE_VERSION, addons: sorted };
        let text = toml::to_string_pretty(&doc).map_err(|err| {
            AddaxError::StateStoreWriteFailure { detail: err.to_string() }
        })?;
        atomic_write(path, text.as_bytes())
            .map_err(|err| AddaxError::StateStoreWriteFailure { detail: err.to_string() })
    }

    /// Looks up the record owning exactly this folder set.
    pub async fn get(&self, folders: &BTreeSet<String>) -> Option<InstalledAddon> {
        let inner = self.inner.lock().await;
        inner.iter().find(|a| &a.folders == folders).cloned()
    }

    /// Every folder name currently owned by some record.
    pub async fn owned_folders(&self) -> BTreeSet<String> {
        let inner = self.inner.lock().await;
        inner.iter().flat_map(|a| a.folders.iter().cloned()).collect()
    }

    /// Records whose folder sets intersect `folders`.
    pub async fn overlapping(&self, folders: &BTreeSet<String>) -> Vec<InstalledAddon> {
        let inner = self.inner.lock().await;
        inner.iter().filter(|a| !a.folders.is_disjoint(folders)).cloned().collect()
    }

    /// All records, ordered by folder set.
    pub async fn list_all(&self) -> Vec<InstalledAddon> {
        let mut addons = self.inner.lock().await.clone();
        addons.sort_by(|a, b| a.folders.cmp(&b.folders));
        addons
    }

    /// Inserts a record transactionally.
    ///
    /// Fails with [`AddaxError::FolderConflict`] when any of the record's
    /// folders is already owned by a *different* record; a record owning
    /// exactly the same folders (or a subset being replaced via
    /// `replacing`) is displaced instead. The check and the write happen
    /// under one lock acquisition, then the document is persisted before
    /// the lock is released.
    pub async fn put(
        &self,
        addon: InstalledAddon,
        replacing: Option<&BTreeSet<String>>,
    ) -> Result<(), AddaxError> {
        let mut inner = self.inner.lock().await;
        let conflicts: Vec<_> = inner
            .iter()
            .filter(|existing| {
                if let Some(replaced) = replacing {
                    if &existing.folders == replaced {
                        return false;
                    }
                }
                !existing.folders.is_disjoint(&addon.folders)
            })
            .cloned()
            .collect();
        if let Some(holder) = conflicts.first() {
            return Err(AddaxError::FolderConflict {
                folders: holder
                    .folders
                    .intersection(&addon.folders)
                    .cloned()
                    .collect(),
                holder: holder.describe(),
            });
        }

        let mut next: Vec<_> = inner
            .iter()
            .filter(|existing| {
                replacing.is_none_or(|replaced| &existing.folders != replaced)
            })
            .cloned()
            .collect();
        next.push(addon);
        Self::persist(&self.path, &next)?;
        *inner = next;
        Ok(())
    }

    /// Removes the record owning exactly this folder set.
    pub async fn remove(
        &self,
        folders: &BTreeSet<String>,
    ) -> Result<InstalledAddon, AddaxError> {
        let mut inner = self.inner.lock().await;
        let index = inner.iter().position(|a| &a.folders == folders).ok_or_else(|| {
            AddaxError::NotInstalled { folders: folders.clone() }
        })?;
        let mut next = inner.clone();
        let removed = next.remove(index);
        Self::persist(&self.path, &next)?;
        *inner = next;
        Ok(removed)
    }

    /// Flips the pin flag on the record owning this folder set.
    pub async fn set_pinned(
        &self,
        folders: &BTreeSet<String>,
        pinned: bool,
    ) -> Result<InstalledAddon, AddaxError> {
        let mut inner = self.inner.lock().await;
        let index = inner.iter().position(|a| &a.folders == folders).ok_or_else(|| {
            AddaxError::NotInstalled { folders: folders.clone() }
        })?;
        let mut next = inner.clone();
        next[index].pinned = pinned;
        Self::persist(&self.path, &next)?;
        let updated = next[index].clone();
        *inner = next;
        Ok(updated)
    }
}
