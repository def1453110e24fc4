use std::fs::{self, File};
use std::path::Path;
use std::sync::mpsc::{self, Receiver};
use std::sync::{Arc, Mutex};
use std::time::{Duration, SystemTime};

use plugsync_core::repository::{InstallLayout, RepositoryLayout};
use plugsync_core::{
    render_manifest, scan_local, upload_batch, Action, CancelToken, CatalogOptions,
    Downloader, FsTransferEngine, PluginCatalog, Publisher, RemoteRecord, Sha256Digester,
    SharedCatalog, Status, SyncError, TransferEngine, TransferEvent, TransferTask,
};
use tempfile::TempDir;

fn publisher_options(name: &str) -> CatalogOptions {
    CatalogOptions {
        publisher: Some(name.to_string()),
        ..Default::default()
    }
}

fn write(path: &Path, content: &[u8]) {
    fs::create_dir_all(path.parent().unwrap()).unwrap();
    fs::write(path, content).unwrap();
}

fn age(path: &Path) {
    let past = SystemTime::now() - Duration::from_secs(3600);
    File::options()
        .write(true)
        .open(path)
        .unwrap()
        .set_modified(past)
        .unwrap();
}

/// Queue every local file for upload and publish it together with `database`
fn publish_all(
    temp: &TempDir,
    install: &InstallLayout,
    repository: &RepositoryLayout,
    database: &[u8],
    snapshot: Option<i64>,
) -> plugsync_core::Result<PluginCatalog> {
    let local = scan_local(install.root(), install.staging_dir(), &Sha256Digester).unwrap();
    let mut catalog = PluginCatalog::merge(Vec::new(), local, publisher_options("alice"));
    let names: Vec<String> = catalog.iter().map(|e| e.filename().to_string()).collect();
    for name in names {
        catalog.set_action(&name, Action::Upload).unwrap();
    }

    let database_path = temp.path().join("staging-db");
    let manifest_path = temp.path().join("staging-current.txt");
    fs::write(&database_path, database).unwrap();
    fs::write(&manifest_path, render_manifest(&catalog)).unwrap();

    let files = upload_batch(&database_path, &manifest_path, &catalog, install).unwrap();
    let publisher = Publisher::new(Arc::new(FsTransferEngine), repository.clone());
    publisher.publish(snapshot, &files, &CancelToken::new(), None)?;
    Ok(catalog)
}

/// Repository listing as the catalog parser would report it after a publish
fn listing(catalog: &PluginCatalog, install: &InstallLayout) -> Vec<RemoteRecord> {
    catalog
        .iter()
        .map(|entry| {
            let local = entry.local().unwrap();
            RemoteRecord {
                filename: entry.filename().to_string(),
                digest: local.digest.clone(),
                timestamp: local.timestamp,
                size: fs::metadata(install.live_path(entry.filename())).unwrap().len(),
                label: None,
                site: None,
                owner: Some("alice".to_string()),
            }
        })
        .collect()
}

#[test]
fn published_files_install_cleanly_and_only_once() {
    let temp = TempDir::new().unwrap();
    let repository = RepositoryLayout::new(temp.path().join("site"));
    let alice = InstallLayout::new(temp.path().join("alice"), "update");
    write(&alice.live_path("plugins/A.jar"), b"alpha");
    write(&alice.live_path("jars/lib.jar"), b"library");

    let published = publish_all(&temp, &alice, &repository, b"db-v1", None).unwrap();
    assert_eq!(fs::read(repository.database_path()).unwrap(), b"db-v1");
    assert!(fs::read_to_string(repository.manifest_path())
        .unwrap()
        .contains("plugins/A.jar "));

    let bob = InstallLayout::new(temp.path().join("bob"), "update");
    let mut catalog = PluginCatalog::merge(
        listing(&published, &alice),
        scan_local(bob.root(), bob.staging_dir(), &Sha256Digester).unwrap(),
        CatalogOptions::default(),
    );
    catalog.set_action("plugins/A.jar", Action::Install).unwrap();
    catalog.set_action("jars/lib.jar", Action::Install).unwrap();
    let catalog = SharedCatalog::new(catalog);

    let downloader = Downloader::new(Arc::new(FsTransferEngine), repository, bob.clone());
    let report = downloader.run(&catalog, &CancelToken::new(), None).unwrap();
    assert_eq!(report.installed.len(), 2);
    assert_eq!(fs::read(bob.staged_path("plugins/A.jar")).unwrap(), b"alpha");
    assert_eq!(fs::read(bob.staged_path("jars/lib.jar")).unwrap(), b"library");
    assert_eq!(
        catalog.read().get("plugins/A.jar").unwrap().status(),
        Status::UpToDate
    );

    let again = downloader.run(&catalog, &CancelToken::new(), None).unwrap();
    assert!(again.installed.is_empty());
    assert!(again.marked_for_removal.is_empty());
}

#[test]
fn second_publisher_with_stale_snapshot_conflicts() {
    let temp = TempDir::new().unwrap();
    let repository = RepositoryLayout::new(temp.path().join("site"));
    write(&repository.database_path(), b"db-v0");
    age(&repository.database_path());
    let snapshot = repository.database_modified().unwrap();

    let first = InstallLayout::new(temp.path().join("first"), "update");
    write(&first.live_path("plugins/One.jar"), b"one");
    let second = InstallLayout::new(temp.path().join("second"), "update");
    write(&second.live_path("plugins/Two.jar"), b"two");

    publish_all(&temp, &first, &repository, b"db-first", snapshot).unwrap();
    let err = publish_all(&temp, &second, &repository, b"db-second", snapshot).unwrap_err();

    assert!(matches!(err, SyncError::Conflict { .. }));
    assert_eq!(err.exit_code(), 7);
    assert_eq!(fs::read(repository.database_path()).unwrap(), b"db-first");
    assert_eq!(fs::read(repository.backup_path()).unwrap(), b"db-v0");
    assert!(!repository.lock_path().exists());
}

/// Delegates to the filesystem engine and records the live database once
/// every upload has landed, just before the publisher commits.
struct ObservingEngine {
    live: std::path::PathBuf,
    seen: Arc<Mutex<Option<Vec<u8>>>>,
}

impl TransferEngine for ObservingEngine {
    fn start(&self, tasks: Vec<TransferTask>, cancel: CancelToken) -> Receiver<TransferEvent> {
        let events: Vec<_> = FsTransferEngine.start(tasks, cancel).into_iter().collect();
        *self.seen.lock().unwrap() = Some(fs::read(&self.live).unwrap());

        let (tx, rx) = mpsc::channel();
        for event in events {
            tx.send(event).unwrap();
        }
        rx
    }
}

#[test]
fn live_database_is_untouched_until_commit() {
    let temp = TempDir::new().unwrap();
    let repository = RepositoryLayout::new(temp.path().join("site"));
    write(&repository.database_path(), b"db-v0");
    let snapshot = repository.database_modified().unwrap();

    let install = InstallLayout::new(temp.path().join("app"), "update");
    write(&install.live_path("plugins/A.jar"), b"alpha");
    let local = scan_local(install.root(), install.staging_dir(), &Sha256Digester).unwrap();
    let mut catalog = PluginCatalog::merge(Vec::new(), local, publisher_options("alice"));
    catalog.set_action("plugins/A.jar", Action::Upload).unwrap();

    let database = temp.path().join("new-db");
    let manifest = temp.path().join("current.txt");
    fs::write(&database, b"db-v1").unwrap();
    fs::write(&manifest, render_manifest(&catalog)).unwrap();
    let files = upload_batch(&database, &manifest, &catalog, &install).unwrap();

    let seen = Arc::new(Mutex::new(None));
    let engine = ObservingEngine {
        live: repository.database_path(),
        seen: Arc::clone(&seen),
    };
    let publisher = Publisher::new(Arc::new(engine), repository.clone());
    let report = publisher
        .publish(snapshot, &files, &CancelToken::new(), None)
        .unwrap();

    assert_eq!(seen.lock().unwrap().as_deref(), Some(&b"db-v0"[..]));
    assert!(report.backup_created);
    assert_eq!(fs::read(repository.database_path()).unwrap(), b"db-v1");
}

#[test]
fn cancelled_publish_leaves_repository_as_it_was() {
    let temp = TempDir::new().unwrap();
    let repository = RepositoryLayout::new(temp.path().join("site"));
    write(&repository.database_path(), b"db-v0");
    let snapshot = repository.database_modified().unwrap();

    let install = InstallLayout::new(temp.path().join("app"), "update");
    write(&install.live_path("plugins/A.jar"), b"alpha");
    let local = scan_local(install.root(), install.staging_dir(), &Sha256Digester).unwrap();
    let mut catalog = PluginCatalog::merge(Vec::new(), local, publisher_options("alice"));
    catalog.set_action("plugins/A.jar", Action::Upload).unwrap();

    let database = temp.path().join("new-db");
    let manifest = temp.path().join("current.txt");
    fs::write(&database, b"db-v1").unwrap();
    fs::write(&manifest, render_manifest(&catalog)).unwrap();
    let files = upload_batch(&database, &manifest, &catalog, &install).unwrap();

    let cancel = CancelToken::new();
    cancel.cancel();
    let publisher = Publisher::new(Arc::new(FsTransferEngine), repository.clone());
    let err = publisher.publish(snapshot, &files, &cancel, None).unwrap_err();

    assert!(matches!(err, SyncError::Cancelled));
    assert_eq!(fs::read(repository.database_path()).unwrap(), b"db-v0");
    assert!(!repository.lock_path().exists());
    assert!(!repository.backup_path().exists());
    assert!(!repository.manifest_lock_path().exists());
}
