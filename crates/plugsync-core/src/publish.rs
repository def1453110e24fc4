//! Publish coordinator
//!
//! Commits a batch of files to the repository without disturbing concurrent
//! publishers. A publish proceeds in five steps, and any failure aborts it:
//!
//! 1. Sum up the batch size for progress reporting
//! 2. Write the new catalog database as `db.xml.gz.lock` and mark it
//!    read-only; an existing lock means someone else is publishing
//! 3. Compare the live `db.xml.gz` timestamp with the one seen when this
//!    session started; a difference means another publish completed
//! 4. Upload the remaining files; the manifest goes to `current.txt.lock`
//! 5. Move `db.xml.gz` to `db.bak` and the lock file to `db.xml.gz`, then
//!    the staged manifest to `current.txt`
//!
//! Only the renames of step 5 change what readers of the repository see.

use std::fs::{self, File, OpenOptions};
use std::io::{self, Read, Write};
use std::path::{Path, PathBuf};
use std::sync::mpsc::Receiver;
use std::sync::Arc;

use tracing::{debug, error, info, warn};

use crate::catalog::{PluginCatalog, PluginEntry};
use crate::digest::verify_size;
use crate::error::{Result, SyncError};
use crate::repository::{remote_name, InstallLayout, RepositoryLayout, DATABASE, MANIFEST};
use crate::transfer::{CancelToken, TransferEngine, TransferTask};
use crate::worker::{Progress, ProgressCallback, RunEvent, Worker};

const BUFFER_SIZE: usize = 64 * 1024;

/// A local file to be placed in the repository
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UploadFile {
    /// Destination relative to the repository base
    pub filename: String,
    pub source: PathBuf,
    pub size: u64,
    pub permissions: Option<u32>,
}

impl UploadFile {
    pub fn new(filename: impl Into<String>, source: impl Into<PathBuf>) -> Result<Self> {
        let source = source.into();
        let size = fs::metadata(&source)?.len();
        Ok(Self {
            filename: filename.into(),
            source,
            size,
            permissions: None,
        })
    }

    /// Upload of the local copy of `entry` under its per-version name
    pub fn for_entry(entry: &PluginEntry, install: &InstallLayout) -> Result<Self> {
        let local = entry.local().ok_or_else(|| SyncError::InvalidAction {
            filename: entry.filename().to_string(),
            action: entry.pending_action(),
            status: entry.status(),
        })?;
        let mut file = Self::new(
            remote_name(entry.filename(), local.timestamp),
            install.live_path(entry.filename()),
        )?;
        if entry.is_launcher {
            file.permissions = Some(0o755);
        }
        Ok(file)
    }
}

/// Assemble a publish batch: the catalog database, the manifest, then every
/// entry queued for upload.
pub fn upload_batch(
    database: &Path,
    manifest: &Path,
    catalog: &PluginCatalog,
    install: &InstallLayout,
) -> Result<Vec<UploadFile>> {
    let mut files = vec![
        UploadFile::new(DATABASE, database)?,
        UploadFile::new(MANIFEST, manifest)?,
    ];
    for entry in catalog.to_upload() {
        files.push(UploadFile::for_entry(entry, install)?);
    }
    Ok(files)
}

/// Outcome of a successful publish
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct PublishReport {
    /// Files written, the catalog database included
    pub uploaded: usize,
    pub bytes: u64,
    /// Whether a previous live database was kept as `db.bak`
    pub backup_created: bool,
}

/// The publish protocol, independent of any threading
pub struct Publisher {
    engine: Arc<dyn TransferEngine>,
    repository: RepositoryLayout,
}

impl Publisher {
    pub fn new(engine: Arc<dyn TransferEngine>, repository: RepositoryLayout) -> Self {
        Self { engine, repository }
    }

    pub fn repository(&self) -> &RepositoryLayout {
        &self.repository
    }

    /// Publish `files`, whose first element is the new catalog database.
    ///
    /// `snapshot` is the live database's modification time (milliseconds)
    /// when this session read the catalog, `None` if there was none.
    pub fn publish(
        &self,
        snapshot: Option<i64>,
        files: &[UploadFile],
        cancel: &CancelToken,
        on_progress: ProgressCallback<'_>,
    ) -> Result<PublishReport> {
        let (database, rest) = files.split_first().ok_or(SyncError::EmptyBatch)?;
        let total: u64 = files.iter().map(|f| f.size).sum();
        info!(files = files.len(), bytes = total, "publish started");

        let lock = self.repository.lock_path();
        self.write_lock(database, &lock, total, on_progress)?;

        let live = self.repository.database_modified()?;
        if live != snapshot {
            warn!("catalog changed since {:?} (now {:?})", snapshot, live);
            release_lock(&lock);
            return Err(SyncError::Conflict {
                path: self.repository.database_path(),
                expected: snapshot,
                actual: live,
            });
        }

        let uploaded = self
            .upload(rest, database.size, total, cancel, on_progress)
            .and_then(|()| {
                if cancel.is_cancelled() {
                    Err(SyncError::Cancelled)
                } else {
                    Ok(())
                }
            });
        if let Err(e) = uploaded {
            warn!("publish aborted: {e}");
            cancel.cancel();
            release_lock(&lock);
            remove_quietly(&self.repository.manifest_lock_path());
            return Err(e);
        }

        let staged_manifest = rest.iter().any(|f| f.filename == MANIFEST);
        let backup_created = self.commit(&lock, staged_manifest)?;
        info!("publish committed");
        Ok(PublishReport {
            uploaded: files.len(),
            bytes: total,
            backup_created,
        })
    }

    fn write_lock(
        &self,
        database: &UploadFile,
        lock: &Path,
        total: u64,
        on_progress: ProgressCallback<'_>,
    ) -> Result<()> {
        if lock.exists() {
            return Err(SyncError::LockContention {
                path: lock.to_path_buf(),
                reason: "lock file already exists".to_string(),
            });
        }
        fs::create_dir_all(self.repository.base())?;
        let mut input = File::open(&database.source)?;

        let mut output = OpenOptions::new()
            .write(true)
            .create_new(true)
            .open(lock)
            .map_err(|e| match e.kind() {
                io::ErrorKind::AlreadyExists => SyncError::LockContention {
                    path: lock.to_path_buf(),
                    reason: e.to_string(),
                },
                _ => SyncError::Io(e),
            })?;

        let written = copy_with_progress(
            &mut input,
            &mut output,
            &database.filename,
            database.size,
            total,
            on_progress,
        );
        drop(output);
        if let Err(e) = written {
            release_lock(lock);
            return Err(e.into());
        }

        set_readonly(lock, true).map_err(|e| {
            release_lock(lock);
            SyncError::LockContention {
                path: lock.to_path_buf(),
                reason: format!("could not mark read-only: {e}"),
            }
        })?;
        debug!("lock written: {}", lock.display());
        Ok(())
    }

    fn upload(
        &self,
        files: &[UploadFile],
        offset: u64,
        total: u64,
        cancel: &CancelToken,
        on_progress: ProgressCallback<'_>,
    ) -> Result<()> {
        if files.is_empty() {
            return Ok(());
        }

        let mut tasks = Vec::with_capacity(files.len());
        for file in files {
            let destination = if file.filename == MANIFEST {
                self.repository.manifest_lock_path()
            } else {
                self.repository.base().join(&file.filename)
            };
            if let Some(parent) = destination.parent() {
                fs::create_dir_all(parent)?;
            }
            tasks.push(TransferTask {
                entry: file.filename.clone(),
                source: file.source.to_string_lossy().to_string(),
                destination,
                expected_size: file.size,
                expected_digest: None,
                permissions: file.permissions,
            });
        }

        let mut completed = 0;
        for event in self.engine.start(tasks.clone(), cancel.clone()) {
            if let Some(message) = event.error {
                return Err(SyncError::Transfer { message });
            }
            let Some(task) = tasks.get(event.task) else {
                continue;
            };
            if let Some(f) = on_progress {
                f(&Progress {
                    item: task.entry.clone(),
                    item_bytes: event.task_bytes,
                    item_total: event.task_total,
                    done_bytes: offset + event.done_bytes,
                    total_bytes: total,
                });
            }
            if event.task_complete {
                verify_size(&task.entry, &task.destination, task.expected_size)?;
                completed += 1;
            }
        }

        if cancel.is_cancelled() {
            return Err(SyncError::Cancelled);
        }
        if completed < tasks.len() {
            return Err(SyncError::Transfer {
                message: format!("upload ended after {} of {} files", completed, tasks.len()),
            });
        }
        Ok(())
    }

    /// Swap the lock file in as the live database, then publish the staged
    /// manifest. Returns whether a backup was made.
    fn commit(&self, lock: &Path, staged_manifest: bool) -> Result<bool> {
        let live = self.repository.database_path();
        let staged = self.repository.manifest_lock_path();

        let backup_created = match swap_into_place(lock, &live, &self.repository.backup_path()) {
            Ok(created) => created,
            Err(failure) => {
                if failure.live_intact {
                    release_lock(lock);
                } else {
                    // The old catalog is stuck in the backup; keep the new one
                    error!(
                        "could not restore {}; new catalog kept at {}",
                        live.display(),
                        lock.display()
                    );
                }
                remove_quietly(&staged);
                return Err(failure.source.into());
            }
        };

        if staged_manifest {
            let manifest = self.repository.manifest_path();
            if let Err(e) = fs::rename(&staged, &manifest) {
                warn!("catalog committed but {} not updated: {e}", manifest.display());
            }
        }
        Ok(backup_created)
    }
}

/// A failed [`swap_into_place`]
#[derive(Debug)]
struct SwapFailure {
    source: io::Error,
    /// Whether the previous live file (if any) is still at its live path
    live_intact: bool,
}

/// Replace `live` with `new`, keeping the previous `live` as `backup`.
///
/// If `new` cannot be moved in, the previous file is moved back. Returns
/// whether a backup was made.
fn swap_into_place(
    new: &Path,
    live: &Path,
    backup: &Path,
) -> std::result::Result<bool, SwapFailure> {
    let intact = |source| SwapFailure {
        source,
        live_intact: true,
    };

    let had_live = live.exists();
    if had_live {
        if backup.exists() {
            set_readonly(backup, false).map_err(intact)?;
            fs::remove_file(backup).map_err(intact)?;
        }
        fs::rename(live, backup).map_err(intact)?;
    }

    if let Err(source) = fs::rename(new, live) {
        let live_intact = !had_live || fs::rename(backup, live).is_ok();
        return Err(SwapFailure {
            source,
            live_intact,
        });
    }
    Ok(had_live)
}

fn copy_with_progress(
    input: &mut impl Read,
    output: &mut impl Write,
    item: &str,
    item_total: u64,
    total: u64,
    on_progress: ProgressCallback<'_>,
) -> io::Result<u64> {
    let mut buffer = vec![0u8; BUFFER_SIZE];
    let mut written = 0u64;
    loop {
        let read = input.read(&mut buffer)?;
        if read == 0 {
            break;
        }
        output.write_all(&buffer[..read])?;
        written += read as u64;
        if let Some(f) = on_progress {
            f(&Progress {
                item: item.to_string(),
                item_bytes: written,
                item_total,
                done_bytes: written,
                total_bytes: total,
            });
        }
    }
    output.flush()?;
    Ok(written)
}

fn set_readonly(path: &Path, readonly: bool) -> io::Result<()> {
    let mut permissions = fs::metadata(path)?.permissions();
    #[allow(clippy::permissions_set_readonly_false)]
    permissions.set_readonly(readonly);
    fs::set_permissions(path, permissions)
}

/// Best-effort removal of our own lock file
fn release_lock(lock: &Path) {
    let _ = set_readonly(lock, false);
    remove_quietly(lock);
}

fn remove_quietly(path: &Path) {
    if let Err(e) = fs::remove_file(path) {
        if e.kind() != io::ErrorKind::NotFound {
            warn!("could not remove {}: {e}", path.display());
        }
    }
}

/// Runs [`Publisher`] on a dedicated background thread
pub struct PublishCoordinator {
    publisher: Arc<Publisher>,
    worker: Worker,
}

impl PublishCoordinator {
    pub fn new(publisher: Publisher) -> Self {
        Self {
            publisher: Arc::new(publisher),
            worker: Worker::new("plugsync-publish"),
        }
    }

    /// Start publishing `files`; a publish already in progress is stopped first
    pub fn publish(
        &self,
        snapshot: Option<i64>,
        files: Vec<UploadFile>,
    ) -> Result<Receiver<RunEvent<PublishReport>>> {
        let publisher = Arc::clone(&self.publisher);
        self.worker.start(move |cancel, on_progress| {
            publisher.publish(snapshot, &files, cancel, on_progress)
        })
    }

    pub fn stop(&self) {
        self.worker.stop();
    }

    pub fn is_running(&self) -> bool {
        self.worker.is_running()
    }
}
