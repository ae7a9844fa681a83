//! Disposable per-request environments and their teardown
//!
//! An [`Environment`] owns one temporary directory tree (virtual environment
//! plus work directory) and the process groups spawned inside it. Releasing it
//! kills those groups and deletes the tree. Release is idempotent and also runs
//! from `Drop`, so an environment cannot outlive its request even when the
//! owning future is aborted.

use parking_lot::Mutex;
use std::path::{Path, PathBuf};
use tempfile::TempDir;

use crate::types::ExecutionId;

/// Exclusively-owned, single-use execution environment
#[derive(Debug)]
pub struct Environment {
    id: ExecutionId,
    root: PathBuf,
    dir: Option<TempDir>,
    process_groups: Mutex<Vec<u32>>,
    released: bool,
}

impl Environment {
    pub(crate) fn new(id: ExecutionId, dir: TempDir) -> Self {
        Self {
            id,
            root: dir.path().to_path_buf(),
            dir: Some(dir),
            process_groups: Mutex::new(Vec::new()),
            released: false,
        }
    }

    pub fn id(&self) -> ExecutionId {
        self.id
    }

    /// Root of the directory tree
    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn venv_dir(&self) -> PathBuf {
        self.root.join("venv")
    }

    /// Working directory for the guest process
    pub fn work_dir(&self) -> PathBuf {
        self.root.join("work")
    }

    /// The environment's own interpreter
    pub fn interpreter(&self) -> PathBuf {
        if cfg!(windows) {
            self.venv_dir().join("Scripts").join("python.exe")
        } else {
            self.venv_dir().join("bin").join("python")
        }
    }

    /// Directory holding the environment's executables
    pub fn bin_dir(&self) -> PathBuf {
        if cfg!(windows) {
            self.venv_dir().join("Scripts")
        } else {
            self.venv_dir().join("bin")
        }
    }

    /// Register a process group to be killed on release.
    pub fn track_process_group(&self, pgid: u32) {
        self.process_groups.lock().push(pgid);
    }

    /// Forget a process group once its leader has been reaped.
    pub fn untrack_process_group(&self, pgid: u32) {
        self.process_groups
            .lock()
            .retain(|tracked| *tracked != pgid);
    }

    pub fn tracked_process_groups(&self) -> Vec<u32> {
        self.process_groups.lock().clone()
    }

    pub fn is_released(&self) -> bool {
        self.released
    }

    /// Kill tracked processes and delete the tree.
    ///
    /// Safe to call more than once; only the first call does anything. Never
    /// panics: failures are logged.
    pub fn release(&mut self) {
        if self.released {
            return;
        }
        self.released = true;

        let groups: Vec<u32> = self.process_groups.lock().drain(..).collect();
        for pgid in groups {
            tracing::debug!(execution_id = %self.id, "Killing leftover process group {}", pgid);
            kill_process_group(pgid);
        }

        if let Some(dir) = self.dir.take() {
            match dir.close() {
                Ok(()) => tracing::debug!(
                    execution_id = %self.id,
                    "Removed environment {}",
                    self.root.display()
                ),
                Err(e) => tracing::warn!(
                    execution_id = %self.id,
                    "Failed to remove environment {}: {}",
                    self.root.display(),
                    e
                ),
            }
        }
    }
}

impl Drop for Environment {
    fn drop(&mut self) {
        if !self.released {
            tracing::debug!(
                execution_id = %self.id,
                "Environment dropped without explicit release"
            );
        }
        self.release();
    }
}

/// Send `SIGKILL` to every process in group `pgid`.
#[cfg(unix)]
pub fn kill_process_group(pgid: u32) {
    let Ok(pgid) = libc::pid_t::try_from(pgid) else {
        return;
    };
    if pgid <= 1 {
        return;
    }
    // SAFETY: killpg has no memory-safety preconditions; ESRCH for an
    // already-empty group is expected and ignored.
    unsafe {
        libc::killpg(pgid, libc::SIGKILL);
    }
}

#[cfg(not(unix))]
pub fn kill_process_group(_pgid: u32) {}
