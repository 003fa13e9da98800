//! Core types shared across the addax engine.
//!
//! This module provides the foundation the rest of the crate builds on:
//!
//! - [`AddaxError`], the strongly-typed error taxonomy for everything that
//!   can fail while reconciling, resolving, or installing add-ons. Variants
//!   carry enough context (folder group, source id, version label) to be
//!   user-actionable without inspecting internals.
//! - Operation outcome types ([`Installed`], [`Updated`], [`Removed`],
//!   [`CommitOutcome`]), the per-group result vocabulary surfaced to the
//!   presentation boundary. A session commit reports one outcome per folder
//!   group; one group's failure never aborts its siblings.
//!
//! # Error handling pattern
//!
//! Fallible leaf operations return `Result<T, AddaxError>`. Orchestration
//! code that mixes I/O, parsing, and engine errors uses `anyhow::Result`
//! with `.context(...)`, converting back to [`AddaxError`] at the boundary
//! where a typed outcome is reported to the caller.

pub mod error;

pub use error::AddaxError;

use crate::state::InstalledAddon;

/// A folder group was installed for the first time.
#[derive(Debug, Clone)]
pub struct Installed {
    /// The durable record written to the state store.
    pub addon: InstalledAddon,
}

/// An existing installation was replaced with a newer version.
#[derive(Debug, Clone)]
pub struct Updated {
    /// The record that was replaced.
    pub previous: InstalledAddon,
    /// The record now in effect.
    pub addon: InstalledAddon,
}

/// An installation was removed from disk and the state store.
#[derive(Debug, Clone)]
pub struct Removed {
    /// The record that was deleted.
    pub previous: InstalledAddon,
}

/// Result of committing one folder group within a reconciliation session.
#[derive(Debug)]
pub enum CommitOutcome {
    /// The group's selection was installed.
    Installed(Installed),
    /// The group was explicitly skipped; nothing was touched.
    Skipped,
    /// The group's install failed; siblings are unaffected.
    Failed(AddaxError),
}

impl CommitOutcome {
    /// True when the outcome mutated the state store.
    pub fn is_installed(&self) -> bool {
        matches!(self, Self::Installed(_))
    }
}
