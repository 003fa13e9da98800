//! addax, a reconciliation-driven add-on manager core.
//!
//! addax manages third-party add-ons for an end-user application by
//! reconciling folders already present on disk with catalogue entries
//! served by several independent, mutually incompatible remote sources,
//! then resolving, installing, and updating the chosen add-ons.
//!
//! # Architecture Overview
//!
//! Data flows through the engine in one direction:
//!
//! ```text
//! Folder Scanner ──► Reconciliation Session ──► Fuzzy Matcher
//!                                                   │ (queries Source
//!                                                   ▼  Registry via Cache)
//!                          user selection ──► Version Planner
//!                                                   │
//!                                                   ▼
//!                                         Installation Pipeline ──► State Store
//! ```
//!
//! - [`scanner`] enumerates installed folder groups and their embedded
//!   metadata; a pure, restartable read of disk state.
//! - [`source`] abstracts each remote catalogue behind a capability trait
//!   (`search` / `list_versions` / `fetch`) and fans queries out with
//!   per-source failure isolation.
//! - [`cache`] memoizes metadata responses with per-source TTLs, a
//!   stale-if-error fallback, and prefix invalidation.
//! - [`matcher`] scores candidate identities for each folder group
//!   (manifest hints first, normalized token similarity second) with a
//!   deterministic ranking order.
//! - [`session`] is the re-enterable workflow: scan, match in parallel,
//!   accept selection overrides, commit with per-group isolation.
//! - [`planner`] turns a chosen identity into a concrete installable
//!   version (newest compatible, or a re-validated pin).
//! - [`installer`] downloads, verifies, extracts, and atomically swaps
//!   folder sets, writing the state store in the same logical transaction.
//! - [`state`] is the durable folder-group → installed-add-on mapping, a
//!   versioned TOML lockfile with single-writer transactions.
//!
//! All shared services hang off an explicit [`context::ManagerContext`];
//! the crate has no global state. The presentation layer (CLI/GUI) and
//! concrete source transports are external collaborators.
//!
//! # Example
//!
//! ```rust,no_run
//! use std::sync::Arc;
//! use addax::config::{ManagerConfig, SourceConfig};
//! use addax::context::ManagerContext;
//! use addax::session::{CommitOptions, ReconciliationSession};
//! use addax::source::SourceRegistry;
//! use addax::utils::CancelToken;
//!
//! # async fn example(provider: Arc<dyn addax::source::SourceProvider>) -> anyhow::Result<()> {
//! let config = ManagerConfig::new("/games/wow/Interface/AddOns", 100207);
//! let mut registry = SourceRegistry::new(config.retry_attempts, config.retry_base_delay());
//! registry.register(provider, SourceConfig::with_priority(0));
//!
//! let ctx = ManagerContext::new(config, registry)?;
//! let cancel = CancelToken::new();
//!
//! let mut session = ReconciliationSession::start(&ctx, &cancel).await?;
//! for (folders, entry) in session.entries() {
//!     println!("{folders:?}: {} candidate(s)", entry.candidates.len());
//! }
//! let results = session.commit(&ctx, &CommitOptions::default()).await;
//! for result in results {
//!     println!("{:?}: {:?}", result.folders, result.outcome);
//! }
//! # Ok(())
//! # }
//! ```

// Core functionality
pub mod cache;
pub mod config;
pub mod context;
pub mod core;
pub mod matcher;
pub mod planner;
pub mod session;
pub mod source;

// Disk and persistence
pub mod installer;
pub mod scanner;
pub mod state;

// Supporting modules
pub mod utils;
