//! The addax error taxonomy.
//!
//! One enum covers every failure mode the engine can surface. The variants
//! mirror how failures propagate: per-source failures during a query are
//! isolated (other sources still contribute results), per-group failures
//! during a commit are isolated (other groups still install), and fatal
//! variants always name the folder group, source, or version they concern.

use std::collections::BTreeSet;

use thiserror::Error;

/// All failure modes of the reconciliation and install engine.
#[derive(Debug, Error)]
pub enum AddaxError {
    /// A source could not be reached or answered with a server-side error.
    ///
    /// Raised only after bounded retries with backoff have been exhausted.
    /// During fan-out queries this drops the source from that query's
    /// results instead of failing the query.
    #[error("source '{source_id}' unavailable: {reason}")]
    SourceUnavailable {
        /// Registry id of the failing source.
        source_id: String,
        /// Transport-level detail, already formatted for display.
        reason: String,
    },

    /// A source returned a payload that did not validate into typed records.
    ///
    /// Untyped data never crosses the provider boundary; this is the
    /// structured failure produced instead.
    #[error("source '{source_id}' returned an unparseable payload: {detail}")]
    ParseFailure {
        /// Registry id of the source whose payload failed validation.
        source_id: String,
        /// What failed to validate.
        detail: String,
    },

    /// No listed version satisfies the compatibility constraint.
    ///
    /// Fatal for that install attempt; the folder group is left unresolved.
    #[error("no compatible version of {source_id}:{slug} for interface {interface}")]
    NoCompatibleVersion {
        /// Source the identity belongs to.
        source_id: String,
        /// Slug of the add-on that could not be planned.
        slug: String,
        /// The interface constraint that nothing satisfied.
        interface: u32,
    },

    /// A pinned version label is no longer available from its source.
    #[error("version '{version}' of {source_id}:{slug} is no longer available")]
    VersionUnavailable {
        /// Source the identity belongs to.
        source_id: String,
        /// Slug of the pinned add-on.
        slug: String,
        /// The retracted version label.
        version: String,
    },

    /// A downloaded archive did not hash to the checksum its source declared.
    ///
    /// Fails that specific version only; the planner may fall back to the
    /// next compatible version.
    #[error("checksum mismatch for {slug} {version}: expected {expected}, got {actual}")]
    ChecksumMismatch {
        /// Slug of the add-on whose archive failed verification.
        slug: String,
        /// Version label that was downloaded.
        version: String,
        /// Checksum declared by the source.
        expected: String,
        /// Checksum computed from the downloaded bytes.
        actual: String,
    },

    /// Extracted folders collide with a different installed add-on.
    ///
    /// Nothing is mutated: the staged folders are discarded.
    #[error("folders {folders:?} conflict with installed add-on {holder}")]
    FolderConflict {
        /// The colliding folder names.
        folders: BTreeSet<String>,
        /// `source:slug` of the add-on already owning the folders.
        holder: String,
    },

    /// Extracted folders collide with unreconciled folders on disk.
    #[error("folders {folders:?} conflict with unreconciled folders on disk")]
    UnreconciledConflict {
        /// The colliding folder names.
        folders: BTreeSet<String>,
    },

    /// The on-disk swap succeeded but the state store write did not.
    ///
    /// The swapped folders are intentionally left in place: the next scan
    /// reports them as unreconciled so they can be re-adopted, rather than
    /// declaring the installation corrupt.
    #[error("state store write failed after swap ({detail}); folders will be re-adopted on next scan")]
    StateStoreWriteFailure {
        /// Underlying persistence error, formatted.
        detail: String,
    },

    /// The operation was cancelled through its [`CancelToken`].
    ///
    /// Partial downloads are discarded; a swap in progress completes or is
    /// rolled back before this is raised.
    ///
    /// [`CancelToken`]: crate::utils::CancelToken
    #[error("operation cancelled")]
    Cancelled,

    /// The add-on is not recorded in the state store.
    #[error("add-on for folders {folders:?} is not installed")]
    NotInstalled {
        /// Folder names the caller asked about.
        folders: BTreeSet<String>,
    },

    /// A filesystem operation failed.
    #[error("i/o error: {0}")]
    Io(#[from] std::io::Error),

    /// A downloaded archive could not be opened or extracted.
    #[error("archive error: {0}")]
    Archive(#[from] zip::result::ZipError),

    /// Catch-all for orchestration failures wrapped with context.
    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

impl AddaxError {
    /// True for failures that may succeed on retry with no state change.
    pub fn is_transient(&self) -> bool {
        matches!(self, Self::SourceUnavailable { .. } | Self::Io(_))
    }
}
