//! Background execution for coordinator runs
//!
//! A [`Worker`] owns at most one run at a time. Starting a new run cancels
//! the previous one; nothing is queued.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::mpsc::{self, Receiver};
use std::sync::Arc;
use std::thread;

use parking_lot::Mutex;
use tracing::debug;

use crate::error::Result;
use crate::transfer::CancelToken;

/// Byte progress of a run
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Progress {
    /// File currently being transferred
    pub item: String,
    pub item_bytes: u64,
    pub item_total: u64,
    pub done_bytes: u64,
    pub total_bytes: u64,
}

/// Callback type for progress reporting
pub type ProgressCallback<'a> = Option<&'a dyn Fn(&Progress)>;

/// Notification delivered to whoever started a run
#[derive(Debug)]
pub enum RunEvent<T> {
    Progress(Progress),
    Finished(Result<T>),
}

struct ActiveRun {
    cancel: CancelToken,
    finished: Arc<AtomicBool>,
}

#[derive(Default)]
pub struct Worker {
    name: String,
    active: Mutex<Option<ActiveRun>>,
}

impl Worker {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            active: Mutex::new(None),
        }
    }

    /// Run `job` on a fresh background thread, cancelling any current run first.
    pub fn start<T, F>(&self, job: F) -> Result<Receiver<RunEvent<T>>>
    where
        T: Send + 'static,
        F: FnOnce(&CancelToken, ProgressCallback<'_>) -> Result<T> + Send + 'static,
    {
        let mut active = self.active.lock();
        if let Some(previous) = active.take() {
            debug!("{}: cancelling previous run", self.name);
            previous.cancel.cancel();
        }

        let (tx, rx) = mpsc::channel();
        let cancel = CancelToken::new();
        let finished = Arc::new(AtomicBool::new(false));

        let run_cancel = cancel.clone();
        let run_finished = Arc::clone(&finished);
        thread::Builder::new()
            .name(self.name.clone())
            .spawn(move || {
                let progress_tx = tx.clone();
                let report = move |p: &Progress| {
                    let _ = progress_tx.send(RunEvent::Progress(p.clone()));
                };
                let outcome = job(&run_cancel, Some(&report));
                run_finished.store(true, Ordering::SeqCst);
                let _ = tx.send(RunEvent::Finished(outcome));
            })?;

        *active = Some(ActiveRun { cancel, finished });
        Ok(rx)
    }

    /// Cancel the active run, if any
    pub fn stop(&self) {
        if let Some(run) = self.active.lock().take() {
            debug!("{}: stop requested", self.name);
            run.cancel.cancel();
        }
    }

    pub fn is_running(&self) -> bool {
        self.active
            .lock()
            .as_ref()
            .is_some_and(|run| !run.finished.load(Ordering::SeqCst))
    }
}

impl Drop for Worker {
    fn drop(&mut self) {
        self.stop();
    }
}

/// Block until the run finishes, forwarding progress to `on_progress`
pub fn wait<T>(events: Receiver<RunEvent<T>>, on_progress: ProgressCallback<'_>) -> Option<Result<T>> {
    for event in events {
        match event {
            RunEvent::Progress(p) => {
                if let Some(f) = on_progress {
                    f(&p);
                }
            }
            RunEvent::Finished(outcome) => return Some(outcome),
        }
    }
    None
}
