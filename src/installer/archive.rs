//! Archive extraction for the installation pipeline.
//!
//! Add-on archives contain one or more top-level folders which together
//! form the installed folder group. Extraction is blocking work; the
//! pipeline runs it on the blocking pool.

use std::collections::BTreeSet;
use std::fs::File;
use std::io;
use std::path::{Component, Path};

use crate::core::AddaxError;

/// Extracts `archive` into `staging` and returns the top-level folder
/// names found in it.
///
/// Entries are validated before extraction: absolute paths and parent-dir
/// components are rejected, and files at the archive root (outside any
/// folder) are rejected because the install unit is a folder set.
pub fn extract_archive(archive: &Path, staging: &Path) -> Result<BTreeSet<String>, AddaxError> {
    let file = File::open(archive)?;
    let mut zip = zip::ZipArchive::new(file)?;

    let mut top_level = BTreeSet::new();
    for index in 0..zip.len() {
        let entry = zip.by_index(index)?;
        let Some(path) = entry.enclosed_name() else {
            return Err(AddaxError::Other(anyhow::anyhow!(
                "archive entry '{}' has an unsafe path",
                entry.name()
            )));
        };
        let mut components = path.components();
        match components.next() {
            Some(Component::Normal(first)) => {
                if components.next().is_none() && !entry.is_dir() {
                    return Err(AddaxError::Other(anyhow::anyhow!(
                        "archive entry '{}' sits outside any add-on folder",
                        entry.name()
                    )));
                }
                top_level.insert(first.to_string_lossy().into_owned());
            }
            _ => {
                return Err(AddaxError::Other(anyhow::anyhow!(
                    "archive entry '{}' has an unsafe path",
                    entry.name()
                )));
            }
        }
    }
    if top_level.is_empty() {
        return Err(AddaxError::Other(anyhow::anyhow!("archive contains no folders")));
    }

    for index in 0..zip.len() {
        let mut entry = zip.by_index(index)?;
        let Some(rel) = entry.enclosed_name() else { continue };
        let dest = staging.join(rel);
        if entry.is_dir() {
            std::fs::create_dir_all(&dest)?;
        } else {
            if let Some(parent) = dest.parent() {
                std::fs::create_dir_all(parent)?;
            }
            let mut out = File::create(&dest)?;
            io::copy(&mut entry, &mut out)?;
        }
    }

    Ok(top_level)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;
    use zip::write::SimpleFileOptions;

    fn build_archive(entries: &[(&str, &str)]) -> tempfile::NamedTempFile {
        let file = tempfile::NamedTempFile::new().unwrap();
        let mut writer = zip::ZipWriter::new(file.reopen().unwrap());
        for (name, contents) in entries {
            writer.start_file(*name, SimpleFileOptions::default()).unwrap();
            writer.write_all(contents.as_bytes()).unwrap();
        }
        writer.finish().unwrap();
        file
    }

    #[test]
    fn extracts_and_reports_top_level_folders() {
        let archive = build_archive(&[
            ("DBM-Core/DBM-Core.toc", "## Version: 10\n"),
            ("DBM-Core/core.lua", "-- code"),
            ("DBM-StatusBarTimers/DBM-StatusBarTimers.toc", "## Version: 10\n"),
        ]);
        let staging = tempfile::tempdir().unwrap();

        let folders = extract_archive(archive.path(), staging.path()).unwrap();
        assert_eq!(
            folders,
            ["DBM-Core", "DBM-StatusBarTimers"].iter().map(|s| s.to_string()).collect()
        );
        assert!(staging.path().join("DBM-Core/core.lua").is_file());
    }

    #[test]
    fn rejects_root_level_files() {
        let archive = build_archive(&[("README.txt", "loose file")]);
        let staging = tempfile::tempdir().unwrap();
        assert!(extract_archive(archive.path(), staging.path()).is_err());
    }

    #[test]
    fn rejects_traversal_paths() {
        let archive = build_archive(&[("../evil/evil.lua", "x")]);
        let staging = tempfile::tempdir().unwrap();
        assert!(extract_archive(archive.path(), staging.path()).is_err());
    }
}
