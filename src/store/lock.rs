//! Per-path locks with a bounded wait.
//!
//! In-process callers serialize through a registry of held canonical
//! paths. When a lock directory is configured, each handle also takes an
//! advisory `fs2` lock on `<lock_dir>/<sha256(path)>.lock` so separate
//! processes serialize too. Distinct paths never contend.

use fs2::FileExt;
use std::collections::HashSet;
use std::fs::{self, File, OpenOptions};
use std::path::{Path, PathBuf};
use std::sync::{Condvar, Mutex, PoisonError};
use std::thread;
use std::time::{Duration, Instant};
use tracing::debug;

use crate::error::{ErrorKind, IngestError, Result};
use crate::security::sha256_hex;

/// Sleep between non-blocking attempts on the cross-process lock file.
const POLL_INTERVAL: Duration = Duration::from_millis(10);

#[derive(Debug, Default)]
pub struct PathLocks {
    held: Mutex<HashSet<PathBuf>>,
    released: Condvar,
    lock_dir: Option<PathBuf>,
}

/// RAII guard for one path. Releases both lock layers on drop.
#[derive(Debug)]
pub struct LockHandle<'a> {
    locks: &'a PathLocks,
    path: PathBuf,
    file: Option<File>,
}

impl LockHandle<'_> {
    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl Drop for LockHandle<'_> {
    fn drop(&mut self) {
        if let Some(file) = self.file.take() {
            let _ = FileExt::unlock(&file);
        }
        self.locks.release(&self.path);
    }
}

impl PathLocks {
    /// In-process locking only.
    pub fn new() -> Self {
        Self::default()
    }

    /// In-process locking plus advisory lock files under `lock_dir`.
    pub fn with_lock_dir(lock_dir: impl Into<PathBuf>) -> Self {
        Self {
            lock_dir: Some(lock_dir.into()),
            ..Self::default()
        }
    }

    /// Acquire `path`, waiting at most `timeout`.
    pub fn acquire(&self, path: &Path, timeout: Duration) -> Result<LockHandle<'_>> {
        let deadline = Instant::now() + timeout;

        let mut held = self.held.lock().unwrap_or_else(PoisonError::into_inner);
        while held.contains(path) {
            let remaining = deadline.saturating_duration_since(Instant::now());
            if remaining.is_zero() {
                return Err(busy(path, timeout));
            }
            held = self
                .released
                .wait_timeout(held, remaining)
                .unwrap_or_else(PoisonError::into_inner)
                .0;
        }
        held.insert(path.to_path_buf());
        drop(held);

        let mut handle = LockHandle {
            locks: self,
            path: path.to_path_buf(),
            file: None,
        };
        if let Some(dir) = &self.lock_dir {
            handle.file = Some(lock_file(dir, path, deadline, timeout)?);
        }
        debug!("Acquired lock for {}", path.display());
        Ok(handle)
    }

    pub fn is_locked(&self, path: &Path) -> bool {
        self.held
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .contains(path)
    }

    fn release(&self, path: &Path) {
        self.held
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(path);
        self.released.notify_all();
    }
}

fn lock_file(dir: &Path, path: &Path, deadline: Instant, timeout: Duration) -> Result<File> {
    fs::create_dir_all(dir).map_err(|e| IngestError::storage("creating lock directory", &e))?;
    let name = format!("{}.lock", sha256_hex(path.to_string_lossy().as_bytes()));
    let file = OpenOptions::new()
        .create(true)
        .truncate(false)
        .write(true)
        .open(dir.join(name))
        .map_err(|e| IngestError::storage("opening lock file", &e))?;

    loop {
        if try_lock(&file).map_err(|e| IngestError::storage("locking", &e))? {
            return Ok(file);
        }
        let remaining = deadline.saturating_duration_since(Instant::now());
        if remaining.is_zero() {
            return Err(busy(path, timeout));
        }
        thread::sleep(POLL_INTERVAL.min(remaining));
    }
}

/// `Ok(false)` when another process holds the lock.
fn try_lock(file: &File) -> std::io::Result<bool> {
    match FileExt::try_lock_exclusive(file) {
        Ok(()) => Ok(true),
        Err(ref e) if e.kind() == std::io::ErrorKind::WouldBlock => Ok(false),
        // EAGAIN(11) / EWOULDBLOCK(35 on macOS)
        #[cfg(unix)]
        Err(ref e) if e.raw_os_error() == Some(35) || e.raw_os_error() == Some(11) => Ok(false),
        Err(e) => Err(e),
    }
}

fn busy(path: &Path, timeout: Duration) -> IngestError {
    IngestError::new(
        ErrorKind::Busy,
        format!(
            "lock on {} not acquired within {} ms",
            path.display(),
            timeout.as_millis()
        ),
    )
}
