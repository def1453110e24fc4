//! Transfer engine contract
//!
//! An engine moves an ordered list of files and reports progress over a
//! channel. It never inspects file contents; verification is the caller's job
//! once a task reports completion.

use std::fs::{self, File};
use std::io::{Read, Write};
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::mpsc::{self, Receiver, Sender};
use std::sync::Arc;
use std::thread;

use tracing::{debug, warn};

const BUFFER_SIZE: usize = 64 * 1024;

/// One file to move
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TransferTask {
    /// Catalog filename of the owning entry
    pub entry: String,
    /// URL or path the engine reads from
    pub source: String,
    pub destination: PathBuf,
    pub expected_size: u64,
    pub expected_digest: Option<String>,
    /// Unix mode bits to apply once written
    pub permissions: Option<u32>,
}

/// Progress tick emitted by an engine
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct TransferEvent {
    /// Index of the current task in the submitted list
    pub task: usize,
    pub task_bytes: u64,
    pub task_total: u64,
    pub done_bytes: u64,
    pub total_bytes: u64,
    pub task_complete: bool,
    /// Terminal failure; no events follow
    pub error: Option<String>,
}

/// Cooperative cancellation flag shared between a run and its engine
#[derive(Debug, Clone, Default)]
pub struct CancelToken(Arc<AtomicBool>);

impl CancelToken {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn cancel(&self) {
        self.0.store(true, Ordering::SeqCst);
    }

    pub fn is_cancelled(&self) -> bool {
        self.0.load(Ordering::SeqCst)
    }
}

pub trait TransferEngine: Send + Sync {
    /// Begin executing `tasks` in order.
    ///
    /// Events arrive on the returned channel; it closes when the run ends.
    /// Dropping the receiver or cancelling `cancel` halts the run.
    fn start(&self, tasks: Vec<TransferTask>, cancel: CancelToken) -> Receiver<TransferEvent>;
}

/// Engine for repositories reachable through the filesystem
#[derive(Debug, Clone, Copy, Default)]
pub struct FsTransferEngine;

impl TransferEngine for FsTransferEngine {
    fn start(&self, tasks: Vec<TransferTask>, cancel: CancelToken) -> Receiver<TransferEvent> {
        let (tx, rx) = mpsc::channel();
        thread::spawn(move || {
            if let Err(message) = copy_all(&tasks, &cancel, &tx) {
                warn!("transfer failed: {message}");
                let _ = tx.send(TransferEvent {
                    error: Some(message),
                    ..Default::default()
                });
            }
        });
        rx
    }
}

fn copy_all(
    tasks: &[TransferTask],
    cancel: &CancelToken,
    tx: &Sender<TransferEvent>,
) -> std::result::Result<(), String> {
    let total_bytes: u64 = tasks.iter().map(|t| t.expected_size).sum();
    let mut done_bytes = 0;
    let mut buffer = vec![0u8; BUFFER_SIZE];

    for (index, task) in tasks.iter().enumerate() {
        if cancel.is_cancelled() {
            debug!("transfer cancelled before {}", task.entry);
            return Ok(());
        }

        let describe = |e: std::io::Error| format!("{}: {}", task.entry, e);

        if let Some(parent) = task.destination.parent() {
            fs::create_dir_all(parent).map_err(describe)?;
        }
        let mut input = File::open(&task.source).map_err(describe)?;
        let mut output = File::create(&task.destination).map_err(describe)?;

        let mut event = TransferEvent {
            task: index,
            task_total: task.expected_size,
            total_bytes,
            done_bytes,
            ..Default::default()
        };

        loop {
            if cancel.is_cancelled() {
                debug!("transfer cancelled during {}", task.entry);
                return Ok(());
            }
            let read = input.read(&mut buffer).map_err(describe)?;
            if read == 0 {
                break;
            }
            output.write_all(&buffer[..read]).map_err(describe)?;
            event.task_bytes += read as u64;
            event.done_bytes += read as u64;
            if tx.send(event.clone()).is_err() {
                return Ok(());
            }
        }
        output.flush().map_err(describe)?;
        drop(output);

        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;
            if let Some(mode) = task.permissions {
                fs::set_permissions(&task.destination, fs::Permissions::from_mode(mode))
                    .map_err(describe)?;
            }
        }

        done_bytes = event.done_bytes;
        event.task_complete = true;
        if tx.send(event).is_err() {
            return Ok(());
        }
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn task(temp: &TempDir, name: &str, content: &[u8]) -> TransferTask {
        let source = temp.path().join("repo").join(name);
        fs::create_dir_all(source.parent().unwrap()).unwrap();
        fs::write(&source, content).unwrap();
        TransferTask {
            entry: name.to_string(),
            source: source.to_string_lossy().to_string(),
            destination: temp.path().join("install").join(name),
            expected_size: content.len() as u64,
            expected_digest: None,
            permissions: None,
        }
    }

    #[test]
    fn test_fs_engine_copies_and_reports() {
        let temp = TempDir::new().unwrap();
        let tasks = vec![
            task(&temp, "plugins/A.jar", b"aaaa"),
            task(&temp, "B.jar", &vec![7u8; BUFFER_SIZE + 10]),
        ];
        let destinations: Vec<_> = tasks.iter().map(|t| t.destination.clone()).collect();

        let events: Vec<_> = FsTransferEngine
            .start(tasks, CancelToken::new())
            .into_iter()
            .collect();

        let completed: Vec<_> = events.iter().filter(|e| e.task_complete).collect();
        assert_eq!(completed.len(), 2);
        assert_eq!(completed[1].done_bytes, 4 + BUFFER_SIZE as u64 + 10);
        assert_eq!(completed[1].total_bytes, completed[1].done_bytes);
        assert!(events.iter().all(|e| e.error.is_none()));

        assert_eq!(fs::read(&destinations[0]).unwrap(), b"aaaa");
        assert_eq!(fs::read(&destinations[1]).unwrap().len(), BUFFER_SIZE + 10);
    }

    #[test]
    fn test_fs_engine_reports_missing_source() {
        let temp = TempDir::new().unwrap();
        let mut broken = task(&temp, "A.jar", b"a");
        broken.source = temp.path().join("missing").to_string_lossy().to_string();

        let events: Vec<_> = FsTransferEngine
            .start(vec![broken], CancelToken::new())
            .into_iter()
            .collect();
        assert_eq!(events.len(), 1);
        assert!(events[0].error.as_deref().unwrap().contains("A.jar"));
    }

    #[test]
    fn test_fs_engine_honours_cancel() {
        let temp = TempDir::new().unwrap();
        let tasks = vec![task(&temp, "A.jar", b"a")];
        let destination = tasks[0].destination.clone();
        let cancel = CancelToken::new();
        cancel.cancel();

        let events: Vec<_> = FsTransferEngine.start(tasks, cancel).into_iter().collect();
        assert!(events.is_empty());
        assert!(!destination.exists());
    }
}
