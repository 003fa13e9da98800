//! The installation pipeline: download, verify, extract, swap, record.
//!
//! Each install runs the state machine
//! `PLANNED → DOWNLOADING → VERIFYING → STAGED → SWAPPED → COMMITTED`,
//! falling to `FAILED` from any non-terminal state with cleanup of partial
//! artifacts. The defining property is atomicity at two levels:
//!
//! - **per folder**: staged folders move into place with `rename`, never an
//!   incremental copy;
//! - **per group**: either every folder of a group swaps in or none does.
//!   A failed rename mid-group rolls the already-swapped folders back, and
//!   a replaced installation's old folders are restored.
//!
//! The swap and the state-store write form one logical transaction,
//! serialized with every other mutation through a single lock (a concurrent
//! install targeting overlapping folders fails its conflict check instead
//! of overwriting). When the swap succeeds but the record write fails, the
//! pipeline surfaces [`AddaxError::StateStoreWriteFailure`] and leaves the
//! new folders in place: the next scan reports them as unreconciled and
//! they re-enter reconciliation for re-adoption.
//!
//! Checksum verification runs when the source declares a checksum, and is
//! skipped otherwise. Verification failure fails only that version; the
//! planner's excluded-label replan provides the fallback.

pub mod archive;

use std::collections::BTreeSet;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use futures::StreamExt;
use tokio::io::AsyncWriteExt;
use tokio::sync::{mpsc, Mutex};

use crate::core::{AddaxError, Installed, Removed, Updated};
use crate::source::{AddonVersion, SourceRegistry};
use crate::state::{InstalledAddon, StateStore};
use crate::utils::{checksum_file, CancelToken};

/// Pipeline states, reported through the progress channel.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InstallPhase {
    /// Version resolved, work not yet started.
    Planned,
    /// Streaming the archive to a temporary file.
    Downloading,
    /// Verifying the archive checksum.
    Verifying,
    /// Extracted into the staging directory.
    Staged,
    /// Folders swapped into the live directory.
    Swapped,
    /// Record written; the install is durable.
    Committed,
    /// The install failed; partial artifacts were cleaned up.
    Failed,
}

/// One progress signal from a running install.
#[derive(Debug, Clone)]
pub struct ProgressEvent {
    /// `source:slug` of the add-on being installed.
    pub addon: String,
    /// The phase just entered.
    pub phase: InstallPhase,
}

/// Progress signal channel handed to long-running commits.
pub type ProgressSender = mpsc::UnboundedSender<ProgressEvent>;

/// Options threaded through a pipeline run.
#[derive(Debug, Clone, Default)]
pub struct InstallOptions {
    /// Cooperative cancellation handle.
    pub cancel: CancelToken,
    /// Optional progress signal channel.
    pub progress: Option<ProgressSender>,
    /// Displace unowned on-disk folders instead of failing.
    ///
    /// Set for reconciliation (adoption) installs, where the target folders
    /// are exactly the unreconciled ones being adopted. Folders owned by a
    /// different installed add-on still conflict.
    pub replace_unreconciled: bool,
}

impl InstallOptions {
    fn emit(&self, version: &AddonVersion, phase: InstallPhase) {
        tracing::debug!(
            addon = %format!("{}:{}", version.identity.source, version.identity.slug),
            ?phase,
            "install phase"
        );
        if let Some(sender) = &self.progress {
            let _ = sender.send(ProgressEvent {
                addon: format!("{}:{}", version.identity.source, version.identity.slug),
                phase,
            });
        }
    }
}

/// Drives installs, updates, and removals against one add-on directory.
pub struct Installer {
    registry: Arc<SourceRegistry>,
    store: Arc<StateStore>,
    addon_dir: PathBuf,
    work_dir: PathBuf,
    // Serializes conflict-check + swap + record across concurrent installs.
    mutation: Mutex<()>,
}

impl Installer {
    /// Installer writing into `addon_dir`, recording into `store`.
    ///
    /// Scratch space (downloads, staging, rollback holds) lives under
    /// `addon_dir/.addax` so folder renames stay on one filesystem.
    pub fn new(registry: Arc<SourceRegistry>, store: Arc<StateStore>, addon_dir: PathBuf) -> Self {
        let work_dir = addon_dir.join(".addax").join("work");
        Self { registry, store, addon_dir, work_dir, mutation: Mutex::new(()) }
    }

    /// Installs a fresh add-on version.
    pub async fn install(
        &self,
        version: &AddonVersion,
        options: &InstallOptions,
    ) -> Result<Installed, AddaxError> {
        let addon = self.run_pipeline(version, None, options).await?;
        Ok(Installed { addon })
    }

    /// Replaces an existing installation with a new version.
    ///
    /// The old folders are held aside during the swap and restored on
    /// failure; on success they are deleted with the rest of the scratch
    /// space.
    pub async fn update(
        &self,
        current: InstalledAddon,
        version: &AddonVersion,
        options: &InstallOptions,
    ) -> Result<Updated, AddaxError> {
        let addon = self.run_pipeline(version, Some(&current), options).await?;
        Ok(Updated { previous: current, addon })
    }

    /// Removes an installed add-on: its folders (unless kept) and record.
    pub async fn remove(
        &self,
        folders: &BTreeSet<String>,
        keep_folders: bool,
    ) -> Result<Removed, AddaxError> {
        let _guard = self.mutation.lock().await;
        let previous = self.store.remove(folders).await?;
        if !keep_folders {
            for name in &previous.folders {
                let path = self.addon_dir.join(name);
                match std::fs::remove_dir_all(&path) {
                    Ok(()) => {}
                    Err(err) if err.kind() == std::io::ErrorKind::NotFound => {}
                    Err(err) => return Err(err.into()),
                }
            }
        }
        tracing::info!(addon = %previous.describe(), "removed");
        Ok(Removed { previous })
    }

    /// True when every folder of the record is still present on disk.
    pub fn integrity_ok(&self, addon: &InstalledAddon) -> bool {
        addon.folders.iter().all(|name| self.addon_dir.join(name).is_dir())
    }

    /// Whether an update from `current` to `candidate` should run at all.
    ///
    /// A version-equal, integrity-intact installation is up to date and is
    /// not reinstalled.
    pub fn needs_update(&self, current: &InstalledAddon, candidate: &AddonVersion) -> bool {
        current.version != candidate.version || !self.integrity_ok(current)
    }

    async fn run_pipeline(
        &self,
        version: &AddonVersion,
        replacing: Option<&InstalledAddon>,
        options: &InstallOptions,
    ) -> Result<InstalledAddon, AddaxError> {
        options.emit(version, InstallPhase::Planned);
        let result = self.try_pipeline(version, replacing, options).await;
        if result.is_err() {
            options.emit(version, InstallPhase::Failed);
        }
        result
    }

    async fn try_pipeline(
        &self,
        version: &AddonVersion,
        replacing: Option<&InstalledAddon>,
        options: &InstallOptions,
    ) -> Result<InstalledAddon, AddaxError> {
        std::fs::create_dir_all(&self.work_dir)?;
        options.cancel.check()?;

        // DOWNLOADING
        options.emit(version, InstallPhase::Downloading);
        let (archive_path, declared_checksum) = self.download(version, options).await?;

        // VERIFYING runs only when a checksum is declared.
        let expected = version.checksum.clone().or(declared_checksum);
        if let Some(expected) = expected {
            options.emit(version, InstallPhase::Verifying);
            options.cancel.check()?;
            let path = archive_path.path().to_path_buf();
            let actual = tokio::task::spawn_blocking(move || checksum_file(&path))
                .await
                .map_err(|err| AddaxError::Other(err.into()))??;
            if actual != expected {
                return Err(AddaxError::ChecksumMismatch {
                    slug: version.identity.slug.clone(),
                    version: version.version.clone(),
                    expected,
                    actual,
                });
            }
        }

        // STAGED
        options.cancel.check()?;
        let staging = tempfile::tempdir_in(&self.work_dir)?;
        let folders = {
            let archive = archive_path.path().to_path_buf();
            let staging_dir = staging.path().to_path_buf();
            tokio::task::spawn_blocking(move || {
                archive::extract_archive(&archive, &staging_dir)
            })
            .await
            .map_err(|err| AddaxError::Other(err.into()))??
        };
        options.emit(version, InstallPhase::Staged);

        // Conflict check, swap, and record form one logical transaction.
        let _guard = self.mutation.lock().await;
        options.cancel.check()?;

        self.check_conflicts(&folders, replacing, options.replace_unreconciled).await?;

        // Everything moved aside before the swap: the replaced install's
        // folders, plus (for adoption installs) unowned on-disk folders
        // about to be overwritten.
        let mut to_hold: BTreeSet<String> =
            replacing.map(|r| r.folders.clone()).unwrap_or_default();
        if options.replace_unreconciled {
            to_hold.extend(folders.iter().cloned());
        }

        let hold = tempfile::tempdir_in(&self.work_dir)?;
        let displaced = self.put_aside(&to_hold, hold.path())?;
        if let Err(err) = self.swap_in(&folders, staging.path()) {
            self.restore(&displaced);
            return Err(err);
        }
        options.emit(version, InstallPhase::Swapped);

        let record = InstalledAddon::from_version(version, folders);
        let put_result =
            self.store.put(record.clone(), replacing.map(|r| &r.folders)).await;
        match put_result {
            Ok(()) => {}
            Err(AddaxError::FolderConflict { folders, holder }) => {
                // Raced by a direct store write; undo the swap entirely.
                self.unswap(&record.folders);
                self.restore(&displaced);
                return Err(AddaxError::FolderConflict { folders, holder });
            }
            Err(err) => {
                // The swap is already live. Leaving the folders on disk is
                // deliberate: the next scan re-adopts them as unreconciled.
                tracing::error!(%err, "state store write failed after swap");
                return Err(AddaxError::StateStoreWriteFailure { detail: err.to_string() });
            }
        }

        options.emit(version, InstallPhase::Committed);
        tracing::info!(
            addon = %record.describe(),
            version = %record.version,
            "installed"
        );
        Ok(record)
    }

    /// Streams the archive to a temp file; partial files are discarded on
    /// failure or cancellation via the temp handle's drop.
    async fn download(
        &self,
        version: &AddonVersion,
        options: &InstallOptions,
    ) -> Result<(tempfile::NamedTempFile, Option<String>), AddaxError> {
        let download = self.registry.fetch(version, &options.cancel).await?;
        let temp = tempfile::NamedTempFile::new_in(&self.work_dir)?;
        let mut file = tokio::fs::File::create(temp.path()).await?;
        let mut stream = download.stream;
        while let Some(chunk) = stream.next().await {
            options.cancel.check()?;
            let chunk = chunk?;
            file.write_all(&chunk).await?;
        }
        file.flush().await?;
        Ok((temp, download.checksum))
    }

    async fn check_conflicts(
        &self,
        folders: &BTreeSet<String>,
        replacing: Option<&InstalledAddon>,
        replace_unreconciled: bool,
    ) -> Result<(), AddaxError> {
        // Another record owning any target folder is a hard conflict.
        let overlapping = self.store.overlapping(folders).await;
        if let Some(holder) = overlapping
            .iter()
            .find(|a| replacing.is_none_or(|r| a.folders != r.folders))
        {
            return Err(AddaxError::FolderConflict {
                folders: holder.folders.intersection(folders).cloned().collect(),
                holder: holder.describe(),
            });
        }

        // Unowned folders already on disk are someone else's data too.
        let replaced_names: BTreeSet<&String> =
            replacing.map(|r| r.folders.iter().collect()).unwrap_or_default();
        let owned = self.store.owned_folders().await;
        let unreconciled: BTreeSet<String> = folders
            .iter()
            .filter(|name| !owned.contains(*name) && !replaced_names.contains(name))
            .filter(|name| self.addon_dir.join(name.as_str()).exists())
            .cloned()
            .collect();
        if !unreconciled.is_empty() && !replace_unreconciled {
            return Err(AddaxError::UnreconciledConflict { folders: unreconciled });
        }
        Ok(())
    }

    /// Moves the named live folders into the hold directory.
    fn put_aside(
        &self,
        names: &BTreeSet<String>,
        hold: &Path,
    ) -> Result<Vec<(PathBuf, PathBuf)>, AddaxError> {
        let mut displaced = Vec::new();
        for name in names {
            let live = self.addon_dir.join(name);
            if !live.exists() {
                continue;
            }
            let held = hold.join(name);
            if let Err(err) = std::fs::rename(&live, &held) {
                self.restore(&displaced);
                return Err(err.into());
            }
            displaced.push((live, held));
        }
        Ok(displaced)
    }

    /// Renames every staged folder into the live directory; on failure the
    /// already-placed folders are removed before returning.
    fn swap_in(&self, folders: &BTreeSet<String>, staging: &Path) -> Result<(), AddaxError> {
        let mut placed = Vec::new();
        for name in folders {
            let from = staging.join(name);
            let to = self.addon_dir.join(name);
            if let Err(err) = std::fs::rename(&from, &to) {
                for done in &placed {
                    let _ = std::fs::remove_dir_all(done);
                }
                return Err(err.into());
            }
            placed.push(to);
        }
        Ok(())
    }

    fn unswap(&self, folders: &BTreeSet<String>) {
        for name in folders {
            let _ = std::fs::remove_dir_all(self.addon_dir.join(name));
        }
    }

    fn restore(&self, displaced: &[(PathBuf, PathBuf)]) {
        for (live, held) in displaced {
            let _ = std::fs::rename(held, live);
        }
    }
}

impl std::fmt::Debug for Installer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Installer")
            .field("addon_dir", &self.addon_dir)
            .finish_non_exhaustive()
    }
}
