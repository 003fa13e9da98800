//! Reader for the `.toc` manifest add-ons embed in their folders.
//!
//! The format is line-oriented: directives look like `## Key: Value`, other
//! lines list the add-on's code files and are ignored here. Readers are
//! tolerant: a missing or malformed manifest yields an empty
//! [`TocMeta`], never an error, because folders without metadata must stay
//! eligible for name-based matching.

use std::collections::BTreeMap;
use std::path::Path;

/// Parsed directives of one manifest file.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct TocMeta {
    entries: BTreeMap<String, String>,
}

impl TocMeta {
    /// Parses manifest text. Unrecognized lines are skipped.
    pub fn parse(text: &str) -> Self {
        let mut entries = BTreeMap::new();
        for line in text.lines() {
            let Some(directive) = line.strip_prefix("##") else {
                continue;
            };
            if let Some((key, value)) = directive.split_once(':') {
                let key = key.trim();
                let value = value.trim();
                if !key.is_empty() && !value.is_empty() {
                    entries.insert(key.to_string(), value.to_string());
                }
            }
        }
        Self { entries }
    }

    /// Loads and parses the manifest for the folder at `path`.
    ///
    /// Looks for `<folder-name>.toc` first, then falls back to the
    /// lexically first `.toc` file present. Returns an empty meta when no
    /// manifest is readable.
    pub fn from_folder(path: &Path) -> Self {
        let name = path.file_name().and_then(|n| n.to_str()).unwrap_or("");
        let preferred = path.join(format!("{name}.toc"));
        if let Ok(text) = std::fs::read_to_string(&preferred) {
            return Self::parse(&text);
        }

        let mut toc_files: Vec<_> = std::fs::read_dir(path)
            .into_iter()
            .flatten()
            .flatten()
            .map(|entry| entry.path())
            .filter(|p| p.extension().is_some_and(|ext| ext.eq_ignore_ascii_case("toc")))
            .collect();
        toc_files.sort();
        for candidate in toc_files {
            if let Ok(text) = std::fs::read_to_string(&candidate) {
                return Self::parse(&text);
            }
        }
        Self::default()
    }

    /// Returns the first present value among `keys`.
    pub fn first_of(&self, keys: &[&str]) -> Option<&str> {
        keys.iter().find_map(|k| self.entries.get(*k).map(String::as_str))
    }

    /// The add-on's self-reported version, following the packager fallbacks
    /// the ecosystem uses.
    pub fn version(&self) -> &str {
        self.first_of(&["Version", "X-Packaged-Version", "X-Curse-Packaged-Version"])
            .unwrap_or("")
    }

    /// The declared interface number, if parseable.
    pub fn interface(&self) -> Option<u32> {
        self.first_of(&["Interface"])?
            .split(',')
            .next()?
            .trim()
            .parse()
            .ok()
    }

    /// Folder names this add-on declares as hard dependencies.
    pub fn required_deps(&self) -> Vec<String> {
        self.first_of(&["RequiredDeps", "Dependencies"])
            .map(|value| {
                value
                    .split(',')
                    .map(|dep| dep.trim().to_string())
                    .filter(|dep| !dep.is_empty())
                    .collect()
            })
            .unwrap_or_default()
    }

    /// Raw directive lookup for provider-specific hint keys
    /// (e.g. `X-Curse-Project-ID`).
    pub fn get(&self, key: &str) -> Option<&str> {
        self.entries.get(key).map(String::as_str)
    }

    /// True when no directives were parsed.
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}
