//! Cross-cutting utilities: cancellation, retries, atomic writes, checksums.

use std::future::Future;
use std::path::Path;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use sha2::{Digest, Sha256};

use crate::core::AddaxError;

/// Cooperative cancellation handle.
///
/// Cloned freely and checked at suspension points (network calls, disk I/O,
/// checksum computation). Cancellation is a request, not preemption: code
/// holding a token finishes or rolls back its current atomic step before
/// honouring it.
#[derive(Debug, Clone, Default)]
pub struct CancelToken {
    flag: Arc<AtomicBool>,
}

impl CancelToken {
    /// Creates a token in the not-cancelled state.
    pub fn new() -> Self {
        Self::default()
    }

    /// Requests cancellation. Idempotent.
    pub fn cancel(&self) {
        self.flag.store(true, Ordering::SeqCst);
    }

    /// True once [`cancel`](Self::cancel) has been called on any clone.
    pub fn is_cancelled(&self) -> bool {
        self.flag.load(Ordering::SeqCst)
    }

    /// Returns `Err(AddaxError::Cancelled)` once cancellation was requested.
    pub fn check(&self) -> Result<(), AddaxError> {
        if self.is_cancelled() {
            Err(AddaxError::Cancelled)
        } else {
            Ok(())
        }
    }
}

/// Retries `op` with exponential backoff on transient failures.
///
/// Runs at most `attempts` times, sleeping `base_delay * 2^n` between tries.
/// Non-transient errors (per [`AddaxError::is_transient`]) and cancellation
/// surface immediately.
pub async fn retry_with_backoff<T, F, Fut>(
    attempts: u32,
    base_delay: Duration,
    cancel: &CancelToken,
    mut op: F,
) -> Result<T, AddaxError>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T, AddaxError>>,
{
    let mut delay = base_delay;
    let mut last_err = None;
    for attempt in 0..attempts {
        cancel.check()?;
        match op().await {
            Ok(value) => return Ok(value),
            Err(err) if err.is_transient() && attempt + 1 < attempts => {
                tracing::debug!(attempt, %err, "transient failure, backing off");
                tokio::time::sleep(delay).await;
                delay = delay.saturating_mul(2);
                last_err = Some(err);
            }
            Err(err) => return Err(err),
        }
    }
    Err(last_err.unwrap_or(AddaxError::Cancelled))
}

/// Writes `contents` to `path` atomically.
///
/// The bytes land in a temp file in the same directory, fsynced, then
/// renamed over the target so readers never observe a torn write.
pub fn atomic_write(path: &Path, contents: &[u8]) -> Result<()> {
    let dir = path
        .parent()
        .with_context(|| format!("no parent directory for {}", path.display()))?;
    std::fs::create_dir_all(dir)
        .with_context(|| format!("failed to create {}", dir.display()))?;
    let mut tmp = tempfile::NamedTempFile::new_in(dir)
        .with_context(|| format!("failed to create temp file in {}", dir.display()))?;
    std::io::Write::write_all(&mut tmp, contents)
        .with_context(|| format!("failed to write temp file for {}", path.display()))?;
    tmp.as_file().sync_all().ok();
    tmp.persist(path)
        .with_context(|| format!("failed to replace {}", path.display()))?;
    Ok(())
}

/// Computes the `sha256:<hex>` checksum of a byte slice.
pub fn checksum_bytes(bytes: &[u8]) -> String {
    let mut hasher = Sha256::new();
    hasher.update(bytes);
    format!("sha256:{:x}", hasher.finalize())
}

/// Computes the `sha256:<hex>` checksum of a file's contents.
pub fn checksum_file(path: &Path) -> Result<String> {
    let mut hasher = Sha256::new();
    let mut file = std::fs::File::open(path)
        .with_context(|| format!("failed to open {}", path.display()))?;
    std::io::copy(&mut file, &mut hasher)
        .with_context(|| format!("failed to read {}", path.display()))?;
    Ok(format!("sha256:{:x}", hasher.finalize()))
}
