//! Local installation scan

use std::fs;
use std::path::{Component, Path};

use walkdir::WalkDir;

use super::types::{version_stamp, LocalRecord};
use crate::digest::Digester;
use crate::error::Result;

/// Suffix of launcher binaries kept aside before an update
pub const BACKUP_SUFFIX: &str = ".old";

fn should_skip(relative: &Path, staging_dir: &str) -> bool {
    let mut components = relative.components();
    if let Some(Component::Normal(first)) = components.next() {
        if first.to_string_lossy() == staging_dir {
            return true;
        }
    }

    relative
        .file_name()
        .map(|n| {
            let name = n.to_string_lossy();
            name.ends_with(BACKUP_SUFFIX) || name.starts_with(".plugsync")
        })
        .unwrap_or(false)
}

/// Catalog filename for a path relative to the installation root
pub fn catalog_name(relative: &Path) -> String {
    relative
        .components()
        .map(|c| c.as_os_str().to_string_lossy())
        .collect::<Vec<_>>()
        .join("/")
}

/// Walk the installation root and record every file with its digest.
///
/// The staging tree and launcher backups are not part of the installation.
pub fn scan_local(
    root: &Path,
    staging_dir: &str,
    digester: &dyn Digester,
) -> Result<Vec<LocalRecord>> {
    let mut records = Vec::new();
    if !root.exists() {
        return Ok(records);
    }

    for entry in WalkDir::new(root)
        .sort_by_file_name()
        .into_iter()
        .filter_map(|e| e.ok())
        .filter(|e| e.path().is_file())
    {
        let path = entry.path();
        let Ok(relative) = path.strip_prefix(root) else {
            continue;
        };
        if should_skip(relative, staging_dir) {
            continue;
        }

        let filename = catalog_name(relative);
        let digest = digester.digest(&filename, path)?;
        let timestamp = version_stamp(fs::metadata(path)?.modified()?);
        records.push(LocalRecord {
            filename,
            digest,
            timestamp,
        });
    }

    Ok(records)
}
