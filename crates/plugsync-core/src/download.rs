//! Download coordinator
//!
//! Turns the queued install/update/remove actions of a catalog into verified
//! files on disk.
//!
//! - Removals are only marked: the file in the staging tree gets a fresh
//!   modification time and the application deletes it on its next start.
//! - Regular files are downloaded into the staging tree.
//! - Launcher binaries are written to the live installation, after the
//!   current binary has been moved aside as `<name>.old`.
//!
//! Each file is checked for size and digest as soon as the engine reports it
//! complete. A file that fails the check is deleted (a launcher gets its
//! `.old` binary back). The first failure cancels the rest of the run; files
//! committed before it stay installed.

use std::fs::{self, OpenOptions};
use std::io;
use std::path::Path;
use std::sync::mpsc::Receiver;
use std::sync::Arc;
use std::time::SystemTime;

use tracing::{debug, info, warn};

use crate::catalog::{PluginEntry, SharedCatalog};
use crate::digest::{verify_digest, verify_size, Digester, Sha256Digester};
use crate::error::{Result, SyncError};
use crate::repository::{InstallLayout, RepositoryLayout};
use crate::transfer::{CancelToken, TransferEngine, TransferEvent, TransferTask};
use crate::worker::{Progress, ProgressCallback, RunEvent, Worker};

/// Outcome of a successful download run
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct DownloadReport {
    /// Files verified and recorded as installed
    pub installed: Vec<String>,
    /// Files marked for removal on next start
    pub marked_for_removal: Vec<String>,
}

/// The download algorithm, independent of any threading
pub struct Downloader {
    engine: Arc<dyn TransferEngine>,
    digester: Arc<dyn Digester>,
    repository: RepositoryLayout,
    install: InstallLayout,
}

impl Downloader {
    pub fn new(
        engine: Arc<dyn TransferEngine>,
        repository: RepositoryLayout,
        install: InstallLayout,
    ) -> Self {
        Self {
            engine,
            digester: Arc::new(Sha256Digester),
            repository,
            install,
        }
    }

    pub fn with_digester(mut self, digester: Arc<dyn Digester>) -> Self {
        self.digester = digester;
        self
    }

    /// Apply every queued install, update and removal in `catalog`
    pub fn run(
        &self,
        catalog: &SharedCatalog,
        cancel: &CancelToken,
        on_progress: ProgressCallback<'_>,
    ) -> Result<DownloadReport> {
        let (removals, installs): (Vec<String>, Vec<PluginEntry>) = {
            let catalog = catalog.read();
            (
                catalog
                    .to_remove()
                    .iter()
                    .map(|e| e.filename().to_string())
                    .collect(),
                catalog.to_install_or_update().into_iter().cloned().collect(),
            )
        };
        info!(
            removals = removals.len(),
            downloads = installs.len(),
            "download run started"
        );

        let mut report = DownloadReport::default();

        for filename in removals {
            let path = self.install.staged_path(&filename);
            mark_for_removal(&path)
                .map_err(|source| SyncError::DeferredRemoval { path, source })?;
            catalog.write().clear_action(&filename);
            debug!("marked {} for removal", filename);
            report.marked_for_removal.push(filename);
        }

        let tasks = self.build_tasks(&installs)?;
        if tasks.is_empty() {
            return Ok(report);
        }

        let events = self.engine.start(tasks.clone(), cancel.clone());
        let outcome = self.consume(catalog, &tasks, events, cancel, on_progress, &mut report);
        if let Err(e) = &outcome {
            warn!("download run aborted: {e}");
            cancel.cancel();
        }
        outcome?;

        info!(installed = report.installed.len(), "download run finished");
        Ok(report)
    }

    fn build_tasks(&self, entries: &[PluginEntry]) -> Result<Vec<TransferTask>> {
        let mut tasks = Vec::with_capacity(entries.len());

        for entry in entries {
            let filename = entry.filename();
            let remote = entry.remote().ok_or_else(|| SyncError::InvalidAction {
                filename: filename.to_string(),
                action: entry.pending_action(),
                status: entry.status(),
            })?;

            let destination = if entry.is_launcher {
                let live = self.install.live_path(filename);
                if live.exists() {
                    let backup = self.install.launcher_backup_path(filename);
                    if backup.exists() {
                        fs::remove_file(&backup)?;
                    }
                    fs::rename(&live, &backup)?;
                }
                live
            } else {
                self.install.staged_path(filename)
            };

            tasks.push(TransferTask {
                entry: filename.to_string(),
                source: self
                    .repository
                    .file_path(filename, remote.timestamp)
                    .to_string_lossy()
                    .to_string(),
                destination,
                expected_size: remote.size,
                expected_digest: Some(remote.digest.clone()),
                permissions: None,
            });
        }

        Ok(tasks)
    }

    fn consume(
        &self,
        catalog: &SharedCatalog,
        tasks: &[TransferTask],
        events: Receiver<TransferEvent>,
        cancel: &CancelToken,
        on_progress: ProgressCallback<'_>,
        report: &mut DownloadReport,
    ) -> Result<()> {
        for event in events {
            if let Some(message) = event.error {
                return Err(SyncError::Transfer { message });
            }
            let Some(task) = tasks.get(event.task) else {
                return Err(SyncError::Transfer {
                    message: format!("engine reported unknown task {}", event.task),
                });
            };

            if let Some(f) = on_progress {
                f(&Progress {
                    item: task.entry.clone(),
                    item_bytes: event.task_bytes,
                    item_total: event.task_total,
                    done_bytes: event.done_bytes,
                    total_bytes: event.total_bytes,
                });
            }

            if event.task_complete {
                self.commit(catalog, task)?;
                report.installed.push(task.entry.clone());
            }
        }

        if report.installed.len() == tasks.len() {
            return Ok(());
        }
        if cancel.is_cancelled() {
            return Err(SyncError::Cancelled);
        }
        Err(SyncError::Transfer {
            message: format!(
                "transfer ended after {} of {} files",
                report.installed.len(),
                tasks.len()
            ),
        })
    }

    /// Verify a completed download and record it in the catalog
    fn commit(&self, catalog: &SharedCatalog, task: &TransferTask) -> Result<()> {
        let filename = task.entry.as_str();
        debug!("verifying {}", filename);

        let digest = match self.verify(task) {
            Ok(digest) => digest,
            Err(e) => {
                self.discard(catalog, task);
                return Err(e);
            }
        };

        let is_launcher = {
            let mut catalog = catalog.write();
            let entry = catalog
                .get(filename)
                .ok_or_else(|| SyncError::EntryNotFound {
                    filename: filename.to_string(),
                })?;
            let timestamp = entry.remote().map(|r| r.timestamp).unwrap_or_default();
            let is_launcher = entry.is_launcher;
            catalog.mark_installed(filename, &digest, timestamp)?;
            is_launcher
        };

        if is_launcher {
            make_executable(&task.destination)?;
        }
        Ok(())
    }

    fn verify(&self, task: &TransferTask) -> Result<String> {
        verify_size(&task.entry, &task.destination, task.expected_size)?;
        let expected = task.expected_digest.as_deref().unwrap_or_default();
        verify_digest(
            self.digester.as_ref(),
            &task.entry,
            &task.destination,
            expected,
        )
    }

    /// Drop a download that failed verification, putting a replaced launcher back
    fn discard(&self, catalog: &SharedCatalog, task: &TransferTask) {
        if let Err(e) = fs::remove_file(&task.destination) {
            if e.kind() != io::ErrorKind::NotFound {
                warn!("could not delete {}: {e}", task.destination.display());
            }
        }

        let is_launcher = catalog
            .read()
            .get(&task.entry)
            .is_some_and(|e| e.is_launcher);
        if !is_launcher {
            return;
        }
        let backup = self.install.launcher_backup_path(&task.entry);
        if backup.exists() {
            match fs::rename(&backup, &task.destination) {
                Ok(()) => debug!("restored {}", task.destination.display()),
                Err(e) => warn!("could not restore {}: {e}", task.destination.display()),
            }
        }
    }
}

/// Touch the staged copy of a file so the next start removes it
fn mark_for_removal(path: &Path) -> io::Result<()> {
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent)?;
    }
    let file = OpenOptions::new().create(true).append(true).open(path)?;
    file.set_modified(SystemTime::now())
}

#[cfg(unix)]
fn make_executable(path: &Path) -> Result<()> {
    use std::os::unix::fs::PermissionsExt;

    fs::set_permissions(path, fs::Permissions::from_mode(0o755)).map_err(|source| {
        SyncError::Permission {
            path: path.to_path_buf(),
            source,
        }
    })
}

#[cfg(not(unix))]
fn make_executable(_path: &Path) -> Result<()> {
    Ok(())
}

/// Runs [`Downloader`] on a dedicated background thread
pub struct DownloadCoordinator {
    downloader: Arc<Downloader>,
    worker: Worker,
}

impl DownloadCoordinator {
    pub fn new(downloader: Downloader) -> Self {
        Self {
            downloader: Arc::new(downloader),
            worker: Worker::new("plugsync-download"),
        }
    }

    /// Start a run over `catalog`; a run already in progress is stopped first
    pub fn start(&self, catalog: SharedCatalog) -> Result<Receiver<RunEvent<DownloadReport>>> {
        let downloader = Arc::clone(&self.downloader);
        self.worker
            .start(move |cancel, on_progress| downloader.run(&catalog, cancel, on_progress))
    }

    pub fn stop(&self) {
        self.worker.stop();
    }

    pub fn is_running(&self) -> bool {
        self.worker.is_running()
    }
}
