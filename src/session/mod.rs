//! The reconciliation session: the re-enterable workflow that turns
//! unreconciled folders into installed add-ons.
//!
//! Per folder group the session runs the state machine
//! `UNMATCHED → CANDIDATES_LISTED → SELECTED → COMMITTED`, with
//! `CANDIDATES_LISTED → SKIPPED → COMMITTED` as the alternate terminal
//! path. Starting a session scans the add-on directory, excludes groups the
//! state store already owns (unless explicitly requested), and matches the
//! rest in parallel under the configured concurrency bound.
//!
//! Candidate lists are computed once and never mutated afterwards: a
//! commit and a concurrent rescan operate on independent snapshots, and
//! re-running a session against the same disk and catalogue snapshot
//! reproduces identical candidate orderings. The only caller-mutable state
//! is the per-group [`Selection`].
//!
//! Committing hands every non-Skip selection to the planner and the
//! installation pipeline. Failures are isolated per group: one group's
//! error is reported alongside its siblings' successes in a single result
//! batch.

use std::collections::{BTreeMap, BTreeSet};

use anyhow::Result;
use futures::stream::{self, StreamExt};

use crate::context::ManagerContext;
use crate::core::{AddaxError, CommitOutcome};
use crate::installer::{InstallOptions, ProgressSender};
use crate::matcher::MatchCandidate;
use crate::planner::VersionPolicy;
use crate::scanner::{self, FolderGroup};
use crate::source::AddonIdentity;
use crate::utils::CancelToken;

/// Bound on checksum-mismatch fallback replans per group.
const MAX_PLAN_ATTEMPTS: u32 = 3;

/// Per-group position in the session state machine.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum GroupState {
    /// Scanned, not yet matched.
    Unmatched,
    /// Candidates computed and frozen.
    CandidatesListed,
    /// A candidate was chosen (by default or by the caller).
    Selected,
    /// Explicitly skipped.
    Skipped,
    /// Terminal: commit ran for this group.
    Committed,
}

/// The caller's decision for one folder group.
#[derive(Debug, Clone, PartialEq)]
pub enum Selection {
    /// Install this identity.
    Candidate(AddonIdentity),
    /// Leave the group untouched.
    Skip,
}

/// One folder group's slot in the session.
#[derive(Debug)]
pub struct GroupEntry {
    /// The scanned group snapshot.
    pub group: FolderGroup,
    /// Ranked candidates, frozen at match time.
    pub candidates: Vec<MatchCandidate>,
    /// Current selection; defaults to the top candidate, else Skip.
    pub selection: Selection,
    /// State-machine position.
    pub state: GroupState,
}

/// Options for a session commit.
#[derive(Debug, Clone, Default)]
pub struct CommitOptions {
    /// Cooperative cancellation; groups not yet processed when
    /// cancellation lands are reported as failed with
    /// [`AddaxError::Cancelled`].
    pub cancel: CancelToken,
    /// Optional progress channel, forwarded to each install.
    pub progress: Option<ProgressSender>,
}

/// Result slot for one group in a commit batch.
#[derive(Debug)]
pub struct GroupResult {
    /// The group's identity (its folder names).
    pub folders: BTreeSet<String>,
    /// What happened to it.
    pub outcome: CommitOutcome,
}

/// A reconciliation workflow over one scan snapshot.
#[derive(Debug)]
pub struct ReconciliationSession {
    entries: BTreeMap<BTreeSet<String>, GroupEntry>,
}

impl ReconciliationSession {
    /// Scans the configured add-on directory and matches every group not
    /// already present in the state store.
    pub async fn start(ctx: &ManagerContext, cancel: &CancelToken) -> Result<Self> {
        Self::start_with(ctx, cancel, false).await
    }

    /// As [`start`](Self::start), optionally re-reconciling groups the
    /// state store already owns.
    pub async fn start_with(
        ctx: &ManagerContext,
        cancel: &CancelToken,
        include_installed: bool,
    ) -> Result<Self> {
        let owned = ctx.store.owned_folders().await;
        let groups: Vec<FolderGroup> = scanner::scan(&ctx.config.addon_dir)?
            .filter(|group| {
                include_installed || group.names().iter().all(|name| !owned.contains(name))
            })
            .collect();
        tracing::info!(groups = groups.len(), "reconciliation scan complete");

        let matched: Vec<(FolderGroup, Vec<MatchCandidate>)> = stream::iter(groups)
            .map(|group| async move {
                let candidates = ctx.matcher.match_group(&group, cancel).await;
                (group, candidates)
            })
            .buffer_unordered(ctx.config.match_concurrency.max(1))
            .collect()
            .await;

        let mut entries = BTreeMap::new();
        for (group, candidates) in matched {
            let selection = match candidates.first() {
                Some(top) => Selection::Candidate(top.identity.clone()),
                None => Selection::Skip,
            };
            let state = match selection {
                Selection::Candidate(_) => GroupState::Selected,
                Selection::Skip => GroupState::CandidatesListed,
            };
            entries.insert(group.names(), GroupEntry { group, candidates, selection, state });
        }
        Ok(Self { entries })
    }

    /// The match set: every group with its frozen candidate list.
    pub fn entries(&self) -> impl Iterator<Item = (&BTreeSet<String>, &GroupEntry)> {
        self.entries.iter()
    }

    /// Looks up one group's entry by its folder names.
    pub fn entry(&self, folders: &BTreeSet<String>) -> Option<&GroupEntry> {
        self.entries.get(folders)
    }

    /// Number of groups in the session.
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// True when the scan produced no unreconciled groups.
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Overrides the selection for a group.
    ///
    /// A candidate selection must name one of the group's ranked
    /// candidates; arbitrary identities are rejected. Committed groups can
    /// no longer change.
    pub fn set_selection(
        &mut self,
        folders: &BTreeSet<String>,
        selection: Selection,
    ) -> Result<(), AddaxError> {
        let entry = self.entries.get_mut(folders).ok_or_else(|| {
            AddaxError::Other(anyhow::anyhow!("folder group {folders:?} is not in this session"))
        })?;
        if entry.state == GroupState::Committed {
            return Err(AddaxError::Other(anyhow::anyhow!(
                "folder group {folders:?} is already committed"
            )));
        }
        if let Selection::Candidate(identity) = &selection {
            let ranked = entry.candidates.iter().any(|c| &c.identity == identity);
            if !ranked {
                return Err(AddaxError::Other(anyhow::anyhow!(
                    "identity {}:{} is not a ranked candidate for {folders:?}",
                    identity.source,
                    identity.slug
                )));
            }
        }
        entry.state = match selection {
            Selection::Candidate(_) => GroupState::Selected,
            Selection::Skip => GroupState::Skipped,
        };
        entry.selection = selection;
        Ok(())
    }

    /// Commits every pending selection.
    ///
    /// Skip selections are dropped with no state change. Each non-Skip
    /// selection is planned and installed; a group's failure is recorded in
    /// its result slot and its siblings continue. The returned batch holds
    /// one result per group, in folder-name order.
    pub async fn commit(&mut self, ctx: &ManagerContext, options: &CommitOptions) -> Vec<GroupResult> {
        let mut results = Vec::with_capacity(self.entries.len());
        for (folders, entry) in self.entries.iter_mut() {
            if entry.state == GroupState::Committed {
                continue;
            }
            let outcome = match &entry.selection {
                Selection::Skip => CommitOutcome::Skipped,
                Selection::Candidate(identity) => {
                    if options.cancel.is_cancelled() {
                        CommitOutcome::Failed(AddaxError::Cancelled)
                    } else {
                        match commit_group(ctx, identity, options).await {
                            Ok(installed) => CommitOutcome::Installed(installed),
                            Err(err) => {
                                tracing::warn!(group = ?folders, %err, "group commit failed");
                                CommitOutcome::Failed(err)
                            }
                        }
                    }
                }
            };
            // Failed groups stay re-enterable; the rest are terminal.
            if !matches!(outcome, CommitOutcome::Failed(_)) {
                entry.state = GroupState::Committed;
            }
            results.push(GroupResult { folders: folders.clone(), outcome });
        }
        results
    }
}

/// Plans and installs one selection, with checksum-mismatch fallback to
/// the next compatible version.
async fn commit_group(
    ctx: &ManagerContext,
    identity: &AddonIdentity,
    options: &CommitOptions,
) -> Result<crate::core::Installed, AddaxError> {
    let install_options = InstallOptions {
        cancel: options.cancel.clone(),
        progress: options.progress.clone(),
        replace_unreconciled: true,
    };
    let mut excluded = Vec::new();
    for _ in 0..MAX_PLAN_ATTEMPTS {
        let version =
            ctx.planner.plan(identity, &VersionPolicy::Latest, &excluded, &options.cancel).await?;
        match ctx.installer.install(&version, &install_options).await {
            Ok(installed) => return Ok(installed),
            Err(AddaxError::ChecksumMismatch { .. }) => {
                tracing::warn!(
                    addon = %format!("{}:{}", identity.source, identity.slug),
                    version = %version.version,
                    "checksum mismatch, trying next compatible version"
                );
                excluded.push(version.version.clone());
            }
            Err(err) => return Err(err),
        }
    }
    Err(AddaxError::NoCompatibleVersion {
        source_id: identity.source.clone(),
        slug: identity.slug.clone(),
        interface: ctx.config.interface,
    })
}
