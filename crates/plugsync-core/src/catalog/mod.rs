//! Plugin catalog
//!
//! The session's view of every file known locally or remotely, together with
//! the action the user has queued for it.
//!
//! - `types`: entry, status and action definitions
//! - `scan`: local filesystem scan

pub mod scan;
pub mod types;

use std::collections::BTreeMap;
use std::sync::Arc;

use parking_lot::{RwLock, RwLockReadGuard, RwLockWriteGuard};
use tracing::debug;

use crate::error::{Result, SyncError};

pub use scan::scan_local;
pub use types::{
    version_stamp, Action, LocalRecord, LocalVersion, PluginEntry, RemoteRecord, RemoteVersion,
    Status,
};

/// Structural filter over the catalog
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum View {
    #[default]
    All,
    Installed,
    Uninstalled,
    UpToDate,
    Updateable,
    Official,
    ThirdParty,
}

impl View {
    pub const ALL: [View; 7] = [
        View::All,
        View::Installed,
        View::Uninstalled,
        View::UpToDate,
        View::Updateable,
        View::Official,
        View::ThirdParty,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::All => "all",
            Self::Installed => "installed",
            Self::Uninstalled => "uninstalled",
            Self::UpToDate => "up-to-date",
            Self::Updateable => "updateable",
            Self::Official => "official",
            Self::ThirdParty => "third-party",
        }
    }
}

/// Session settings that shape how entries are classified
#[derive(Debug, Clone, Default)]
pub struct CatalogOptions {
    /// Site id whose files count as official
    pub official_site: Option<String>,
    /// Filenames installed directly into the live installation
    pub launchers: Vec<String>,
    /// The acting publisher, if any
    pub publisher: Option<String>,
}

/// Counts of queued actions
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct ActionSummary {
    pub total: usize,
    pub install: usize,
    pub update: usize,
    pub remove: usize,
    pub upload: usize,
}

/// Ordered collection of entries, unique by filename
#[derive(Debug, Clone, Default)]
pub struct PluginCatalog {
    entries: BTreeMap<String, PluginEntry>,
    options: CatalogOptions,
}

impl PluginCatalog {
    pub fn new(options: CatalogOptions) -> Self {
        Self {
            entries: BTreeMap::new(),
            options,
        }
    }

    /// Build the session catalog from the repository listing and the local scan
    pub fn merge(
        remote: impl IntoIterator<Item = RemoteRecord>,
        local: impl IntoIterator<Item = LocalRecord>,
        options: CatalogOptions,
    ) -> Self {
        let mut remote_by_name: BTreeMap<String, RemoteRecord> = remote
            .into_iter()
            .map(|r| (r.filename.clone(), r))
            .collect();
        let mut catalog = Self::new(options);

        for record in local {
            let remote = remote_by_name.remove(&record.filename);
            let local = LocalVersion {
                digest: record.digest,
                timestamp: record.timestamp,
            };
            catalog.insert_merged(record.filename, Some(local), remote);
        }
        for (filename, record) in remote_by_name {
            catalog.insert_merged(filename, None, Some(record));
        }

        debug!(entries = catalog.len(), "catalog merged");
        catalog
    }

    fn insert_merged(
        &mut self,
        filename: String,
        local: Option<LocalVersion>,
        remote: Option<RemoteRecord>,
    ) {
        let (version, label, site, owner) = match remote {
            Some(r) => (
                Some(RemoteVersion {
                    digest: r.digest,
                    timestamp: r.timestamp,
                    size: r.size,
                }),
                r.label,
                r.site,
                r.owner,
            ),
            None => (None, None, None, None),
        };

        // At least one side is always present here
        if let Ok(mut entry) = PluginEntry::new(filename, local, version) {
            entry.label = label;
            entry.origin_site = site;
            entry.owner = owner;
            self.insert(entry);
        }
    }

    /// Insert or replace an entry. Launcher classification follows the options.
    pub fn insert(&mut self, mut entry: PluginEntry) {
        if self.options.launchers.iter().any(|l| l == entry.filename()) {
            entry.is_launcher = true;
        }
        self.entries.insert(entry.filename().to_string(), entry);
    }

    pub fn options(&self) -> &CatalogOptions {
        &self.options
    }

    pub fn set_publisher(&mut self, publisher: Option<String>) {
        self.options.publisher = publisher;
    }

    pub fn get(&self, filename: &str) -> Option<&PluginEntry> {
        self.entries.get(filename)
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = &PluginEntry> {
        self.entries.values()
    }

    pub fn is_official(&self, entry: &PluginEntry) -> bool {
        match (&self.options.official_site, &entry.origin_site) {
            (Some(official), Some(site)) => official == site,
            _ => false,
        }
    }

    /// Whether the acting publisher may upload this entry
    fn may_upload(&self, entry: &PluginEntry) -> bool {
        let Some(publisher) = self.options.publisher.as_deref() else {
            return false;
        };
        match (entry.owner.as_deref(), entry.status()) {
            (Some(owner), status) => owner == publisher && status.is_installed(),
            // An unowned local-only file is being introduced by this publisher
            (None, Status::Orphaned) => true,
            (None, _) => false,
        }
    }

    /// Validate `action` against the entry's current status
    pub fn check_action(&self, entry: &PluginEntry, action: Action) -> Result<()> {
        let status = entry.status();
        let legal = match action {
            Action::None => true,
            Action::Install => status == Status::NotInstalled,
            Action::Update => status == Status::Updateable,
            Action::Remove => status.is_installed(),
            Action::Upload => self.may_upload(entry),
        };

        if legal {
            Ok(())
        } else {
            Err(SyncError::InvalidAction {
                filename: entry.filename().to_string(),
                action,
                status,
            })
        }
    }

    /// Queue an action for an entry
    pub fn set_action(&mut self, filename: &str, action: Action) -> Result<()> {
        let entry = self
            .entries
            .get(filename)
            .ok_or_else(|| SyncError::EntryNotFound {
                filename: filename.to_string(),
            })?;
        self.check_action(entry, action)?;

        if let Some(entry) = self.entries.get_mut(filename) {
            entry.set_action(action);
        }
        Ok(())
    }

    /// Record a verified install and clear the queued action
    pub fn mark_installed(&mut self, filename: &str, digest: &str, timestamp: u64) -> Result<()> {
        let entry = self
            .entries
            .get_mut(filename)
            .ok_or_else(|| SyncError::EntryNotFound {
                filename: filename.to_string(),
            })?;
        entry.set_local(LocalVersion {
            digest: digest.to_string(),
            timestamp,
        });
        entry.set_action(Action::None);
        Ok(())
    }

    pub(crate) fn clear_action(&mut self, filename: &str) {
        if let Some(entry) = self.entries.get_mut(filename) {
            entry.set_action(Action::None);
        }
    }

    pub fn view(&self, view: View) -> Vec<&PluginEntry> {
        self.iter()
            .filter(|entry| match view {
                View::All => true,
                View::Installed => entry.local().is_some(),
                View::Uninstalled => entry.local().is_none(),
                View::UpToDate => entry.status() == Status::UpToDate,
                View::Updateable => entry.status() == Status::Updateable,
                View::Official => self.is_official(entry),
                View::ThirdParty => !self.is_official(entry),
            })
            .collect()
    }

    /// Structural view narrowed by a case-insensitive text query
    pub fn search(&self, view: View, query: &str) -> Vec<&PluginEntry> {
        let query = query.trim().to_lowercase();
        let entries = self.view(view);
        if query.is_empty() {
            return entries;
        }
        entries.into_iter().filter(|e| e.matches(&query)).collect()
    }

    pub fn with_action(&self, action: Action) -> Vec<&PluginEntry> {
        self.iter()
            .filter(|e| e.pending_action() == action)
            .collect()
    }

    pub fn to_remove(&self) -> Vec<&PluginEntry> {
        self.with_action(Action::Remove)
    }

    pub fn to_install_or_update(&self) -> Vec<&PluginEntry> {
        self.iter()
            .filter(|e| matches!(e.pending_action(), Action::Install | Action::Update))
            .collect()
    }

    pub fn to_upload(&self) -> Vec<&PluginEntry> {
        self.with_action(Action::Upload)
    }

    /// Any queued action other than upload
    pub fn has_pending_changes(&self) -> bool {
        self.iter()
            .any(|e| e.pending_action().is_download())
    }

    pub fn has_pending_uploads(&self) -> bool {
        self.iter().any(|e| e.pending_action() == Action::Upload)
    }

    pub fn summary(&self) -> ActionSummary {
        let mut summary = ActionSummary {
            total: self.len(),
            ..Default::default()
        };
        for entry in self.iter() {
            match entry.pending_action() {
                Action::None => {}
                Action::Install => summary.install += 1,
                Action::Update => summary.update += 1,
                Action::Remove => summary.remove += 1,
                Action::Upload => summary.upload += 1,
            }
        }
        summary
    }
}

/// Catalog shared between coordinators and readers.
///
/// Writers hold the write guard for the whole of a single entry update, so
/// readers never see a half-applied install.
#[derive(Debug, Clone, Default)]
pub struct SharedCatalog(Arc<RwLock<PluginCatalog>>);

impl SharedCatalog {
    pub fn new(catalog: PluginCatalog) -> Self {
        Self(Arc::new(RwLock::new(catalog)))
    }

    pub fn read(&self) -> RwLockReadGuard<'_, PluginCatalog> {
        self.0.read()
    }

    pub fn write(&self) -> RwLockWriteGuard<'_, PluginCatalog> {
        self.0.write()
    }

    /// Owned copy for long-running readers
    pub fn snapshot(&self) -> PluginCatalog {
        self.0.read().clone()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn remote(filename: &str, digest: &str, site: &str, owner: Option<&str>) -> RemoteRecord {
        RemoteRecord {
            filename: filename.to_string(),
            digest: digest.to_string(),
            timestamp: 20240301120000,
            size: 100,
            label: None,
            site: Some(site.to_string()),
            owner: owner.map(str::to_string),
        }
    }

    fn local(filename: &str, digest: &str) -> LocalRecord {
        LocalRecord {
            filename: filename.to_string(),
            digest: digest.to_string(),
            timestamp: 20240101000000,
        }
    }

    fn create_test_catalog() -> PluginCatalog {
        let remote_records = vec![
            remote("plugins/A.jar", "aaa", "main", Some("alice")),
            remote("plugins/B.jar", "bbb", "main", None),
            remote("plugins/C.jar", "ccc-new", "contrib", Some("bob")),
        ];
        let local_records = vec![
            local("plugins/A.jar", "aaa"),
            local("plugins/C.jar", "ccc-old"),
            local("plugins/Mine.jar", "mmm"),
        ];
        PluginCatalog::merge(
            remote_records,
            local_records,
            CatalogOptions {
                official_site: Some("main".to_string()),
                launchers: vec!["fiji-linux64".to_string()],
                publisher: Some("alice".to_string()),
            },
        )
    }

    fn names(entries: Vec<&PluginEntry>) -> Vec<&str> {
        entries.iter().map(|e| e.filename()).collect()
    }

    #[test]
    fn test_merge_statuses() {
        let catalog = create_test_catalog();
        assert_eq!(catalog.len(), 4);
        assert_eq!(catalog.get("plugins/A.jar").unwrap().status(), Status::UpToDate);
        assert_eq!(catalog.get("plugins/B.jar").unwrap().status(), Status::NotInstalled);
        assert_eq!(catalog.get("plugins/C.jar").unwrap().status(), Status::Updateable);
        assert_eq!(catalog.get("plugins/Mine.jar").unwrap().status(), Status::Orphaned);
    }

    #[test]
    fn test_merge_flags_launchers() {
        let mut catalog = create_test_catalog();
        catalog.insert(
            PluginEntry::new(
                "fiji-linux64",
                Some(LocalVersion {
                    digest: "l".to_string(),
                    timestamp: 1,
                }),
                None,
            )
            .unwrap(),
        );
        assert!(catalog.get("fiji-linux64").unwrap().is_launcher);
        assert!(!catalog.get("plugins/A.jar").unwrap().is_launcher);
    }

    #[test]
    fn test_views() {
        let catalog = create_test_catalog();
        assert_eq!(catalog.view(View::All).len(), 4);
        assert_eq!(
            names(catalog.view(View::Installed)),
            vec!["plugins/A.jar", "plugins/C.jar", "plugins/Mine.jar"]
        );
        assert_eq!(names(catalog.view(View::Uninstalled)), vec!["plugins/B.jar"]);
        assert_eq!(names(catalog.view(View::UpToDate)), vec!["plugins/A.jar"]);
        assert_eq!(names(catalog.view(View::Updateable)), vec!["plugins/C.jar"]);
        assert_eq!(
            names(catalog.view(View::Official)),
            vec!["plugins/A.jar", "plugins/B.jar"]
        );
        assert_eq!(
            names(catalog.view(View::ThirdParty)),
            vec!["plugins/C.jar", "plugins/Mine.jar"]
        );
    }

    #[test]
    fn test_search_composes_with_view() {
        let catalog = create_test_catalog();
        assert_eq!(names(catalog.search(View::All, "  B.JAR ")), vec!["plugins/B.jar"]);
        assert!(catalog.search(View::Installed, "b.jar").is_empty());
        assert_eq!(catalog.search(View::Official, "").len(), 2);
    }

    #[test]
    fn test_illegal_actions_are_rejected() {
        let mut catalog = create_test_catalog();

        let err = catalog.set_action("plugins/B.jar", Action::Remove).unwrap_err();
        assert!(matches!(
            err,
            SyncError::InvalidAction {
                action: Action::Remove,
                status: Status::NotInstalled,
                ..
            }
        ));
        assert!(err.is_recoverable());

        assert!(catalog.set_action("plugins/A.jar", Action::Install).is_err());
        assert!(catalog.set_action("plugins/A.jar", Action::Update).is_err());
        // bob owns C.jar, alice is publishing
        assert!(catalog.set_action("plugins/C.jar", Action::Upload).is_err());
        assert!(catalog.set_action("plugins/B.jar", Action::Upload).is_err());

        // Rejection leaves the entry untouched
        assert_eq!(
            catalog.get("plugins/B.jar").unwrap().pending_action(),
            Action::None
        );
    }

    #[test]
    fn test_legal_actions() {
        let mut catalog = create_test_catalog();
        catalog.set_action("plugins/B.jar", Action::Install).unwrap();
        catalog.set_action("plugins/C.jar", Action::Update).unwrap();
        catalog.set_action("plugins/A.jar", Action::Upload).unwrap();
        catalog.set_action("plugins/Mine.jar", Action::Remove).unwrap();
        assert_eq!(
            catalog.get("plugins/B.jar").unwrap().pending_action(),
            Action::Install
        );
    }

    #[test]
    fn test_upload_requires_publisher() {
        let mut catalog = create_test_catalog();
        catalog.set_publisher(None);
        assert!(catalog.set_action("plugins/A.jar", Action::Upload).is_err());
        assert!(catalog.set_action("plugins/Mine.jar", Action::Upload).is_err());
    }

    #[test]
    fn test_unknown_entry() {
        let mut catalog = create_test_catalog();
        let err = catalog.set_action("nope.jar", Action::Install).unwrap_err();
        assert!(matches!(err, SyncError::EntryNotFound { .. }));
    }

    #[test]
    fn test_pending_predicates_and_summary() {
        let mut catalog = create_test_catalog();
        assert!(!catalog.has_pending_changes());
        assert!(!catalog.has_pending_uploads());

        catalog.set_action("plugins/A.jar", Action::Upload).unwrap();
        assert!(!catalog.has_pending_changes());
        assert!(catalog.has_pending_uploads());

        catalog.set_action("plugins/B.jar", Action::Install).unwrap();
        assert!(catalog.has_pending_changes());

        let summary = catalog.summary();
        assert_eq!(
            summary,
            ActionSummary {
                total: 4,
                install: 1,
                update: 0,
                remove: 0,
                upload: 1,
            }
        );
        assert_eq!(names(catalog.to_install_or_update()), vec!["plugins/B.jar"]);
        assert_eq!(names(catalog.to_upload()), vec!["plugins/A.jar"]);
    }

    #[test]
    fn test_mark_installed() {
        let mut catalog = create_test_catalog();
        catalog.set_action("plugins/B.jar", Action::Install).unwrap();
        catalog
            .mark_installed("plugins/B.jar", "bbb", 20240301120000)
            .unwrap();

        let entry = catalog.get("plugins/B.jar").unwrap();
        assert_eq!(entry.status(), Status::UpToDate);
        assert_eq!(entry.local_digest(), Some("bbb"));
        assert_eq!(entry.pending_action(), Action::None);
    }

    #[test]
    fn test_shared_catalog_snapshot_is_detached() {
        let shared = SharedCatalog::new(create_test_catalog());
        let snapshot = shared.snapshot();
        shared
            .write()
            .set_action("plugins/B.jar", Action::Install)
            .unwrap();
        assert_eq!(
            snapshot.get("plugins/B.jar").unwrap().pending_action(),
            Action::None
        );
        assert!(shared.read().has_pending_changes());
    }
}
