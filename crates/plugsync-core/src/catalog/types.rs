//! Catalog type definitions
//!
//! Status is never stored; it is derived from which versions of a file are
//! known locally and remotely.

use chrono::{DateTime, Datelike, Timelike, Utc};
use serde::{Deserialize, Serialize};
use std::time::SystemTime;

use crate::error::{Result, SyncError};

/// Synchronization status of a catalog entry
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum Status {
    /// Advertised by the repository, absent locally
    NotInstalled,
    /// Present locally, not listed by the repository
    Orphaned,
    /// Local and remote digests agree
    UpToDate,
    /// Local and remote digests differ
    Updateable,
}

impl Status {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::NotInstalled => "not installed",
            Self::Orphaned => "orphaned",
            Self::UpToDate => "up-to-date",
            Self::Updateable => "updateable",
        }
    }

    /// Whether a local copy exists
    pub fn is_installed(&self) -> bool {
        match self {
            Self::NotInstalled => false,
            Self::Orphaned | Self::UpToDate | Self::Updateable => true,
        }
    }
}

impl std::fmt::Display for Status {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// Pending user intent for an entry
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Action {
    #[default]
    None,
    Install,
    Update,
    Remove,
    Upload,
}

impl Action {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::None => "none",
            Self::Install => "install",
            Self::Update => "update",
            Self::Remove => "remove",
            Self::Upload => "upload",
        }
    }

    /// Whether a download run acts on this
    pub fn is_download(&self) -> bool {
        match self {
            Self::Install | Self::Update | Self::Remove => true,
            Self::None | Self::Upload => false,
        }
    }
}

impl std::fmt::Display for Action {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// Version of a file as found on the local filesystem
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LocalVersion {
    pub digest: String,
    pub timestamp: u64,
}

/// Version of a file as advertised by the repository
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RemoteVersion {
    pub digest: String,
    pub timestamp: u64,
    pub size: u64,
}

/// One file listed by the parsed repository database
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RemoteRecord {
    pub filename: String,
    pub digest: String,
    pub timestamp: u64,
    pub size: u64,
    #[serde(default)]
    pub label: Option<String>,
    /// Home repository of the file
    #[serde(default)]
    pub site: Option<String>,
    /// Publisher maintaining the file
    #[serde(default)]
    pub owner: Option<String>,
}

/// One file found by the local filesystem scan
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LocalRecord {
    pub filename: String,
    pub digest: String,
    pub timestamp: u64,
}

/// One distributable file, keyed by filename
#[derive(Debug, Clone, Serialize)]
pub struct PluginEntry {
    filename: String,
    pub label: Option<String>,
    local: Option<LocalVersion>,
    remote: Option<RemoteVersion>,
    action: Action,
    pub is_launcher: bool,
    pub origin_site: Option<String>,
    pub owner: Option<String>,
}

impl PluginEntry {
    /// Create an entry. At least one of `local` and `remote` must be known.
    pub fn new(
        filename: impl Into<String>,
        local: Option<LocalVersion>,
        remote: Option<RemoteVersion>,
    ) -> Result<Self> {
        let filename = filename.into();
        if local.is_none() && remote.is_none() {
            return Err(SyncError::InvalidEntry { filename });
        }
        Ok(Self {
            filename,
            label: None,
            local,
            remote,
            action: Action::None,
            is_launcher: false,
            origin_site: None,
            owner: None,
        })
    }

    pub fn filename(&self) -> &str {
        &self.filename
    }

    pub fn local(&self) -> Option<&LocalVersion> {
        self.local.as_ref()
    }

    pub fn remote(&self) -> Option<&RemoteVersion> {
        self.remote.as_ref()
    }

    pub fn local_digest(&self) -> Option<&str> {
        self.local.as_ref().map(|v| v.digest.as_str())
    }

    pub fn remote_digest(&self) -> Option<&str> {
        self.remote.as_ref().map(|v| v.digest.as_str())
    }

    pub fn pending_action(&self) -> Action {
        self.action
    }

    pub fn status(&self) -> Status {
        match (self.local_digest(), self.remote_digest()) {
            (None, Some(_)) => Status::NotInstalled,
            (Some(_), None) => Status::Orphaned,
            (Some(local), Some(remote)) if local == remote => Status::UpToDate,
            (Some(_), Some(_)) => Status::Updateable,
            // `new` rejects entries without any version and nothing clears both
            (None, None) => unreachable!("catalog entry {} has no version", self.filename),
        }
    }

    /// Matches `query` (already lowercased) against filename and label
    pub fn matches(&self, query: &str) -> bool {
        self.filename.to_lowercase().contains(query)
            || self
                .label
                .as_deref()
                .is_some_and(|label| label.to_lowercase().contains(query))
    }

    pub(crate) fn set_action(&mut self, action: Action) {
        self.action = action;
    }

    pub(crate) fn set_local(&mut self, version: LocalVersion) {
        self.local = Some(version);
    }
}

/// Render a point in time as a `yyyyMMddHHmmss` version stamp (UTC)
pub fn version_stamp(time: SystemTime) -> u64 {
    let dt: DateTime<Utc> = time.into();
    dt.year() as u64 * 10_000_000_000
        + dt.month() as u64 * 100_000_000
        + dt.day() as u64 * 1_000_000
        + dt.hour() as u64 * 10_000
        + dt.minute() as u64 * 100
        + dt.second() as u64
}
