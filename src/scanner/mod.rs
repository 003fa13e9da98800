//! Disk scanning: enumerating installed add-on folder groups.
//!
//! The scanner is a pure read of current disk state with no side effects, safe
//! to re-run at any time. It walks the first level of the add-on directory,
//! parses each folder's embedded `.toc` manifest, groups folders that belong
//! to one logical add-on, and yields [`FolderGroup`] snapshots lazily.
//!
//! Grouping uses two signals, both taken from what is actually on disk:
//!
//! 1. a folder whose manifest declares another scanned folder as a required
//!    dependency is grouped with it, and
//! 2. folders whose names share the same leading token before a `-`/`_`
//!    separator (`DBM-Core`, `DBM-StatusBarTimers`) are grouped together.
//!
//! Folders without parseable metadata still produce a group with an empty
//! version and no hints; they stay eligible for name-based matching.

pub mod toc;

use std::collections::BTreeSet;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use sha2::{Digest, Sha256};
use walkdir::WalkDir;

pub use toc::TocMeta;

/// Immutable snapshot of one on-disk add-on folder, taken at scan time.
#[derive(Debug, Clone)]
pub struct Folder {
    /// Directory name, the unit of identity for conflict checks.
    pub name: String,
    /// Absolute path of the folder.
    pub path: PathBuf,
    /// Self-reported version string; empty when the manifest lacks one.
    pub version: String,
    /// Declared interface number, when present.
    pub interface: Option<u32>,
    /// Parsed manifest directives, kept for provider hint lookups.
    pub toc: TocMeta,
    /// `sha256:` fingerprint over relative paths and file sizes.
    pub fingerprint: String,
}

/// The set of folders that together constitute one logical add-on.
///
/// Identity is the set of folder names; ordering within the group is
/// deterministic (primary first, then lexical).
#[derive(Debug, Clone)]
pub struct FolderGroup {
    folders: Vec<Folder>,
}

impl FolderGroup {
    fn new(mut folders: Vec<Folder>) -> Self {
        folders.sort_by(|a, b| a.name.cmp(&b.name));
        Self { folders }
    }

    /// The group's folders, primary first.
    pub fn folders(&self) -> &[Folder] {
        &self.folders
    }

    /// The primary folder: the lexically first member.
    pub fn primary(&self) -> &Folder {
        &self.folders[0]
    }

    /// The identity of the group: its set of folder names.
    pub fn names(&self) -> BTreeSet<String> {
        self.folders.iter().map(|f| f.name.clone()).collect()
    }

    /// Self-reported version of the group, taken from the first member
    /// that declares one.
    pub fn version(&self) -> &str {
        self.folders
            .iter()
            .map(|f| f.version.as_str())
            .find(|v| !v.is_empty())
            .unwrap_or("")
    }
}

/// Leading token of a folder name, used for prefix grouping.
///
/// `DBM-Core` → `dbm`; names without a separator return `None` so
/// single-word folders never merge on prefix alone.
fn leading_token(name: &str) -> Option<String> {
    let (head, _) = name.split_once(['-', '_'])?;
    if head.len() < 2 {
        return None;
    }
    Some(head.to_ascii_lowercase())
}

fn fingerprint_folder(path: &Path) -> String {
    let mut entries: Vec<(String, u64)> = WalkDir::new(path)
        .into_iter()
        .filter_map(|entry| entry.ok())
        .filter(|entry| entry.file_type().is_file())
        .filter_map(|entry| {
            let rel = entry.path().strip_prefix(path).ok()?.to_string_lossy().into_owned();
            let size = entry.metadata().ok()?.len();
            Some((rel, size))
        })
        .collect();
    entries.sort();

    let mut hasher = Sha256::new();
    for (rel, size) in entries {
        hasher.update(rel.as_bytes());
        hasher.update(size.to_le_bytes());
    }
    format!("sha256:{:x}", hasher.finalize())
}

/// Scans `root` and returns a lazy, restartable sequence of folder groups.
///
/// Folder enumeration and grouping happen up front (they need the whole
/// directory listing); per-folder fingerprinting is deferred until each
/// group is actually yielded.
pub fn scan(root: &Path) -> Result<ScanIter> {
    let mut raw: Vec<(String, PathBuf, TocMeta)> = Vec::new();
    let read_dir = std::fs::read_dir(root)
        .with_context(|| format!("failed to read add-on directory {}", root.display()))?;
    for entry in read_dir {
        let entry = entry?;
        let path = entry.path();
        let file_type = entry.file_type()?;
        if !file_type.is_dir() || file_type.is_symlink() {
            continue;
        }
        let Some(name) = path.file_name().and_then(|n| n.to_str()).map(str::to_string) else {
            continue;
        };
        if name.starts_with('.') {
            continue;
        }
        let meta = TocMeta::from_folder(&path);
        raw.push((name, path, meta));
    }
    raw.sort_by(|a, b| a.0.cmp(&b.0));

    // Union-find over folder indices: dependency edges first, then shared
    // leading tokens.
    let mut parent: Vec<usize> = (0..raw.len()).collect();
    fn find(parent: &mut Vec<usize>, i: usize) -> usize {
        if parent[i] != i {
            let root = find(parent, parent[i]);
            parent[i] = root;
        }
        parent[i]
    }
    fn union(parent: &mut Vec<usize>, a: usize, b: usize) {
        let (ra, rb) = (find(parent, a), find(parent, b));
        if ra != rb {
            let (lo, hi) = if ra < rb { (ra, rb) } else { (rb, ra) };
            parent[hi] = lo;
        }
    }

    for i in 0..raw.len() {
        for dep in raw[i].2.required_deps() {
            if let Some(j) = raw.iter().position(|(n, _, _)| n.eq_ignore_ascii_case(&dep)) {
                union(&mut parent, i, j);
            }
        }
    }
    for i in 0..raw.len() {
        if let Some(token) = leading_token(&raw[i].0) {
            for j in (i + 1)..raw.len() {
                if leading_token(&raw[j].0).as_deref() == Some(token.as_str()) {
                    union(&mut parent, i, j);
                }
            }
        }
    }

    let mut buckets: std::collections::BTreeMap<usize, Vec<(String, PathBuf, TocMeta)>> =
        Default::default();
    for i in (0..raw.len()).rev() {
        let root_idx = find(&mut parent, i);
        buckets.entry(root_idx).or_default().push(raw[i].clone());
    }

    let groups = buckets.into_values().collect::<Vec<_>>();
    Ok(ScanIter { groups: groups.into_iter() })
}

/// Lazy iterator over scanned folder groups.
pub struct ScanIter {
    groups: std::vec::IntoIter<Vec<(String, PathBuf, TocMeta)>>,
}

impl Iterator for ScanIter {
    type Item = FolderGroup;

    fn next(&mut self) -> Option<Self::Item> {
        let members = self.groups.next()?;
        let folders = members
            .into_iter()
            .map(|(name, path, toc)| {
                let fingerprint = fingerprint_folder(&path);
                Folder {
                    name,
                    version: toc.version().to_string(),
                    interface: toc.interface(),
                    fingerprint,
                    toc,
                    path,
                }
            })
            .collect();
        Some(FolderGroup::new(folders))
    }
}
