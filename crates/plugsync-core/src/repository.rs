//! Repository and installation layout
//!
//! Repository (relative to the configured base):
//! - `db.xml.gz`: live catalog database
//! - `db.xml.gz.lock`: catalog database of a publish in progress
//! - `db.bak`: previous live catalog
//! - `current.txt`: plain-text manifest for external tooling
//! - `current.txt.lock`: manifest of a publish in progress
//! - `<filename>-<timestamp>`: one file per published version
//!
//! Installation:
//! - `<root>/<filename>`: live files (launchers are written here directly)
//! - `<root>/<staging>/<filename>`: downloads applied on next restart

use std::fs;
use std::io;
use std::path::{Path, PathBuf};
use std::time::UNIX_EPOCH;

use crate::catalog::scan::BACKUP_SUFFIX;
use crate::catalog::{Action, PluginCatalog};
use crate::error::Result;

pub const DATABASE: &str = "db.xml.gz";
pub const DATABASE_LOCK: &str = "db.xml.gz.lock";
pub const DATABASE_BACKUP: &str = "db.bak";
pub const MANIFEST: &str = "current.txt";
pub const MANIFEST_LOCK: &str = "current.txt.lock";

/// Default staging directory below the installation root
pub const DEFAULT_STAGING_DIR: &str = "update";

/// Paths inside the repository
#[derive(Debug, Clone)]
pub struct RepositoryLayout {
    base: PathBuf,
}

impl RepositoryLayout {
    pub fn new(base: impl Into<PathBuf>) -> Self {
        Self { base: base.into() }
    }

    pub fn base(&self) -> &Path {
        &self.base
    }

    pub fn database_path(&self) -> PathBuf {
        self.base.join(DATABASE)
    }

    pub fn lock_path(&self) -> PathBuf {
        self.base.join(DATABASE_LOCK)
    }

    pub fn backup_path(&self) -> PathBuf {
        self.base.join(DATABASE_BACKUP)
    }

    pub fn manifest_path(&self) -> PathBuf {
        self.base.join(MANIFEST)
    }

    pub fn manifest_lock_path(&self) -> PathBuf {
        self.base.join(MANIFEST_LOCK)
    }

    /// Location of one published version of a file
    pub fn file_path(&self, filename: &str, timestamp: u64) -> PathBuf {
        self.base.join(remote_name(filename, timestamp))
    }

    /// Last-modified time of the live catalog database, if there is one
    pub fn database_modified(&self) -> Result<Option<i64>> {
        modified_millis(&self.database_path())
    }
}

/// Per-version name of a file in the repository
pub fn remote_name(filename: &str, timestamp: u64) -> String {
    format!("{}-{}", filename, timestamp)
}

/// Paths inside the local installation
#[derive(Debug, Clone)]
pub struct InstallLayout {
    root: PathBuf,
    staging_dir: String,
}

impl InstallLayout {
    pub fn new(root: impl Into<PathBuf>, staging_dir: impl Into<String>) -> Self {
        Self {
            root: root.into(),
            staging_dir: staging_dir.into(),
        }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn staging_dir(&self) -> &str {
        &self.staging_dir
    }

    pub fn live_path(&self, filename: &str) -> PathBuf {
        self.root.join(filename)
    }

    pub fn staged_path(&self, filename: &str) -> PathBuf {
        self.root.join(&self.staging_dir).join(filename)
    }

    /// Where the previous launcher binary is kept during an update
    pub fn launcher_backup_path(&self, filename: &str) -> PathBuf {
        self.root.join(format!("{}{}", filename, BACKUP_SUFFIX))
    }
}

/// Modification time in milliseconds since the epoch, `None` if the file is absent
pub fn modified_millis(path: &Path) -> Result<Option<i64>> {
    let metadata = match fs::metadata(path) {
        Ok(m) => m,
        Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(None),
        Err(e) => return Err(e.into()),
    };
    let modified = metadata.modified()?;
    let millis = match modified.duration_since(UNIX_EPOCH) {
        Ok(d) => d.as_millis() as i64,
        Err(e) => -(e.duration().as_millis() as i64),
    };
    Ok(Some(millis))
}

/// Render `current.txt`: one `<filename> <timestamp> <digest>` line per
/// file the repository advertises after the publish.
pub fn render_manifest(catalog: &PluginCatalog) -> String {
    let mut out = String::new();
    for entry in catalog.iter() {
        let (timestamp, digest) = match (entry.remote(), entry.local()) {
            // Uploads replace the advertised version with the local one
            (_, Some(local)) if entry.pending_action() == Action::Upload => {
                (local.timestamp, local.digest.as_str())
            }
            (Some(remote), _) => (remote.timestamp, remote.digest.as_str()),
            (None, _) => continue,
        };
        out.push_str(&format!("{} {} {}\n", entry.filename(), timestamp, digest));
    }
    out
}
