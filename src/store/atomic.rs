//! Atomic, lock-protected persistence.
//!
//! Writes go to a `tempfile` sibling in the target directory, are synced,
//! then renamed over the target, so a reader sees the old file or the new
//! one and nothing in between. Every operation takes a [`CanonicalPath`]
//! produced by the path validator, and re-checks containment against the
//! real filesystem before touching it so a symlinked directory inside the
//! base cannot redirect a write elsewhere.

use std::fs;
use std::io::{self, Write};
use std::path::{Path, PathBuf};
use std::time::Duration;
use tracing::{debug, warn};

use super::lock::{LockHandle, PathLocks};
use crate::config::StoreConfig;
use crate::error::{ErrorKind, IngestError, Result};
use crate::security::CanonicalPath;

#[derive(Debug)]
pub struct AtomicStore {
    locks: PathLocks,
    timeout: Duration,
}

impl AtomicStore {
    /// In-process locking only.
    pub fn new(timeout: Duration) -> Self {
        Self {
            locks: PathLocks::new(),
            timeout,
        }
    }

    /// Build from `[store]`, using `lock_dir` when cross-process locks are on.
    pub fn from_config(config: &StoreConfig, lock_dir: &Path) -> Self {
        let locks = if config.cross_process_locks {
            PathLocks::with_lock_dir(lock_dir)
        } else {
            PathLocks::new()
        };
        Self {
            locks,
            timeout: config.lock_timeout(),
        }
    }

    pub fn timeout(&self) -> Duration {
        self.timeout
    }

    /// Lock `target` for a read-modify-write cycle. The key is resolved
    /// through symlinks, so two spellings of one file share a lock.
    pub fn lock(&self, target: &CanonicalPath) -> Result<LockHandle<'_>> {
        self.locks.acquire(&lock_key(target.full()), self.timeout)
    }

    pub fn atomic_write(&self, target: &CanonicalPath, bytes: &[u8]) -> Result<()> {
        let handle = self.lock(target)?;
        self.write_locked(&handle, target, bytes)
    }

    /// Write while already holding the lock for `target`.
    pub fn write_locked(
        &self,
        handle: &LockHandle<'_>,
        target: &CanonicalPath,
        bytes: &[u8],
    ) -> Result<()> {
        ensure_held(handle, target)?;
        let full = target.full();
        let parent = full
            .parent()
            .ok_or_else(|| IngestError::path_traversal("target has no parent directory"))?;

        fs::create_dir_all(target.base())
            .map_err(|e| IngestError::storage("creating base directory", &e))?;
        check_containment(target)?;
        fs::create_dir_all(parent)
            .map_err(|e| IngestError::storage("creating parent directory", &e))?;

        let mut tmp = tempfile::Builder::new()
            .prefix(".elementgate-")
            .suffix(".tmp")
            .tempfile_in(parent)
            .map_err(|e| IngestError::storage("creating temporary file", &e))?;
        tmp.write_all(bytes)
            .and_then(|()| tmp.as_file().sync_all())
            .map_err(|e| IngestError::storage("writing temporary file", &e))?;
        tmp.persist(full)
            .map_err(|e| IngestError::storage("replacing target", &e.error))?;

        sync_dir(parent);
        debug!("Wrote {} bytes to {}", bytes.len(), full.display());
        Ok(())
    }

    pub fn atomic_read(&self, target: &CanonicalPath) -> Result<Vec<u8>> {
        let handle = self.lock(target)?;
        self.read_locked(&handle, target)
    }

    pub fn read_locked(&self, handle: &LockHandle<'_>, target: &CanonicalPath) -> Result<Vec<u8>> {
        ensure_held(handle, target)?;
        check_containment(target)?;
        fs::read(target.full()).map_err(|e| IngestError::storage("reading target", &e))
    }

    /// Delete `target`. Returns `false` if it did not exist.
    pub fn remove(&self, target: &CanonicalPath) -> Result<bool> {
        let _handle = self.lock(target)?;
        check_containment(target)?;
        match fs::remove_file(target.full()) {
            Ok(()) => {
                sync_dir(target.full().parent().unwrap_or(target.base()));
                Ok(true)
            }
            Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(false),
            Err(e) => Err(IngestError::storage("removing target", &e)),
        }
    }

    /// Whether `target` exists as a regular file. Does not lock.
    pub fn exists(&self, target: &CanonicalPath) -> bool {
        check_containment(target).is_ok()
            && fs::symlink_metadata(target.full()).is_ok_and(|m| m.is_file())
    }
}

fn ensure_held(handle: &LockHandle<'_>, target: &CanonicalPath) -> Result<()> {
    if handle.path() == lock_key(target.full()) {
        Ok(())
    } else {
        Err(IngestError::new(
            ErrorKind::StorageFailure,
            "lock handle does not cover the target path",
        ))
    }
}

/// Resolve the deepest existing ancestor of `full` and re-append the rest.
/// Falls back to the lexical path when nothing resolves.
fn lock_key(full: &Path) -> PathBuf {
    for ancestor in full.ancestors() {
        let Ok(resolved) = fs::canonicalize(ancestor) else {
            continue;
        };
        return match full.strip_prefix(ancestor) {
            Ok(rest) if rest.as_os_str().is_empty() => resolved,
            Ok(rest) => resolved.join(rest),
            Err(_) => full.to_path_buf(),
        };
    }
    full.to_path_buf()
}

/// The deepest existing ancestor of the target must resolve inside the
/// resolved base, and the target itself must not be a symlink.
fn check_containment(target: &CanonicalPath) -> Result<()> {
    let base = match fs::canonicalize(target.base()) {
        Ok(base) => base,
        // Nothing exists yet, so nothing can point outside.
        Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(()),
        Err(e) => return Err(IngestError::storage("resolving base directory", &e)),
    };

    let full = target.full();
    if fs::symlink_metadata(full).is_ok_and(|m| m.file_type().is_symlink()) {
        return Err(IngestError::path_traversal("target is a symbolic link"));
    }

    let existing: PathBuf = match full.ancestors().skip(1).find(|p| p.exists()) {
        Some(ancestor) => fs::canonicalize(ancestor)
            .map_err(|e| IngestError::storage("resolving parent directory", &e))?,
        None => return Ok(()),
    };
    if !existing.starts_with(&base) {
        warn!("Rejected write through a link escaping the base directory");
        return Err(IngestError::path_traversal(
            "resolved directory lies outside the base directory",
        ));
    }
    Ok(())
}

#[cfg(unix)]
fn sync_dir(dir: &Path) {
    if let Err(e) = fs::File::open(dir).and_then(|d| d.sync_all()) {
        debug!("Directory sync failed for {}: {}", dir.display(), e);
    }
}

#[cfg(not(unix))]
fn sync_dir(_dir: &Path) {}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::security::validate_relative_path;
    use std::sync::{Arc, Barrier};
    use std::thread;

    const WAIT: Duration = Duration::from_secs(5);

    fn target(base: &Path, rel: &str) -> CanonicalPath {
        validate_relative_path(rel, base).unwrap()
    }

    #[test]
    fn write_then_read() {
        let tmp = tempfile::tempdir().unwrap();
        let store = AtomicStore::new(WAIT);
        let doc = target(tmp.path(), "personas/writer.md");

        assert!(!store.exists(&doc));
        store.atomic_write(&doc, b"first").unwrap();
        store.atomic_write(&doc, b"second").unwrap();
        assert_eq!(store.atomic_read(&doc).unwrap(), b"second");
        assert!(store.exists(&doc));
    }

    #[test]
    fn remove_reports_presence() {
        let tmp = tempfile::tempdir().unwrap();
        let store = AtomicStore::new(WAIT);
        let doc = target(tmp.path(), "skills/x.md");

        assert!(!store.remove(&doc).unwrap());
        store.atomic_write(&doc, b"x").unwrap();
        assert!(store.remove(&doc).unwrap());
        assert!(!doc.full().exists());
    }

    #[test]
    fn reading_missing_file_is_storage_failure() {
        let tmp = tempfile::tempdir().unwrap();
        let store = AtomicStore::new(WAIT);
        let err = store
            .atomic_read(&target(tmp.path(), "skills/none.md"))
            .unwrap_err();
        assert_eq!(err.kind(), &ErrorKind::StorageFailure);
    }

    #[test]
    fn failed_replace_leaves_no_temp_file() {
        let tmp = tempfile::tempdir().unwrap();
        let store = AtomicStore::new(WAIT);
        let doc = target(tmp.path(), "skills/dir.md");
        fs::create_dir_all(doc.full()).unwrap();
        fs::write(doc.full().join("inner"), b"keep").unwrap();

        let err = store.atomic_write(&doc, b"payload").unwrap_err();
        assert_eq!(err.kind(), &ErrorKind::StorageFailure);

        let leftovers: Vec<_> = fs::read_dir(doc.full().parent().unwrap())
            .unwrap()
            .filter_map(|e| e.ok())
            .filter(|e| e.file_name().to_string_lossy().ends_with(".tmp"))
            .collect();
        assert!(leftovers.is_empty());
        assert_eq!(fs::read(doc.full().join("inner")).unwrap(), b"keep");
    }

    #[cfg(unix)]
    #[test]
    fn symlinked_directory_cannot_escape_base() {
        let base = tempfile::tempdir().unwrap();
        let outside = tempfile::tempdir().unwrap();
        std::os::unix::fs::symlink(outside.path(), base.path().join("personas")).unwrap();

        let store = AtomicStore::new(WAIT);
        let err = store
            .atomic_write(&target(base.path(), "personas/evil.md"), b"x")
            .unwrap_err();
        assert_eq!(err.kind(), &ErrorKind::PathTraversal);
        assert_eq!(fs::read_dir(outside.path()).unwrap().count(), 0);
    }

    #[cfg(unix)]
    #[test]
    fn symlinked_target_rejected() {
        let base = tempfile::tempdir().unwrap();
        let outside = tempfile::tempdir().unwrap();
        let secret = outside.path().join("secret");
        fs::write(&secret, b"secret").unwrap();
        fs::create_dir(base.path().join("skills")).unwrap();
        std::os::unix::fs::symlink(&secret, base.path().join("skills/link.md")).unwrap();

        let store = AtomicStore::new(WAIT);
        let doc = target(base.path(), "skills/link.md");
        assert_eq!(
            store.atomic_read(&doc).unwrap_err().kind(),
            &ErrorKind::PathTraversal
        );
        assert!(!store.exists(&doc));
        assert_eq!(fs::read(&secret).unwrap(), b"secret");
    }

    #[test]
    fn concurrent_writers_leave_one_whole_payload() {
        let tmp = tempfile::tempdir().unwrap();
        let store = Arc::new(AtomicStore::new(Duration::from_secs(30)));
        let doc = target(tmp.path(), "templates/shared.md");
        let writers = 8;
        let barrier = Arc::new(Barrier::new(writers + 1));

        let payloads: Vec<Vec<u8>> = (0..writers)
            .map(|i| vec![b'a' + i as u8; 64 * 1024])
            .collect();

        let mut handles: Vec<_> = payloads
            .iter()
            .cloned()
            .map(|payload| {
                let store = Arc::clone(&store);
                let doc = doc.clone();
                let barrier = Arc::clone(&barrier);
                thread::spawn(move || {
                    barrier.wait();
                    for _ in 0..5 {
                        store.atomic_write(&doc, &payload).unwrap();
                    }
                })
            })
            .collect();

        let reader = {
            let store = Arc::clone(&store);
            let doc = doc.clone();
            let barrier = Arc::clone(&barrier);
            thread::spawn(move || {
                barrier.wait();
                for _ in 0..20 {
                    if let Ok(bytes) = store.atomic_read(&doc) {
                        assert_eq!(bytes.len(), 64 * 1024);
                        assert!(bytes.iter().all(|b| *b == bytes[0]), "torn read");
                    }
                }
            })
        };
        handles.push(reader);

        for h in handles {
            h.join().unwrap();
        }

        let last = fs::read(doc.full()).unwrap();
        assert!(payloads.contains(&last));
    }

    #[test]
    fn held_lock_on_one_path_does_not_block_another() {
        let tmp = tempfile::tempdir().unwrap();
        let store = AtomicStore::new(Duration::from_millis(50));
        let a = target(tmp.path(), "skills/a.md");
        let b = target(tmp.path(), "skills/b.md");

        let _held = store.lock(&a).unwrap();
        store.atomic_write(&b, b"b").unwrap();
        assert_eq!(store.atomic_read(&b).unwrap(), b"b");

        let err = store.atomic_write(&a, b"a").unwrap_err();
        assert_eq!(err.kind(), &ErrorKind::Busy);
        assert!(!a.full().exists());
    }

    #[cfg(unix)]
    #[test]
    fn aliased_directory_shares_the_lock() {
        let base = tempfile::tempdir().unwrap();
        fs::create_dir(base.path().join("skills")).unwrap();
        std::os::unix::fs::symlink(base.path().join("skills"), base.path().join("alias"))
            .unwrap();

        let store = AtomicStore::new(Duration::from_millis(50));
        let direct = target(base.path(), "skills/a.md");
        let aliased = target(base.path(), "alias/a.md");

        let held = store.lock(&direct).unwrap();
        let err = store.atomic_write(&aliased, b"x").unwrap_err();
        assert_eq!(err.kind(), &ErrorKind::Busy);
        assert!(!direct.full().exists());

        // the handle for one spelling covers the other
        store.write_locked(&held, &aliased, b"y").unwrap();
        drop(held);
        assert_eq!(store.atomic_read(&direct).unwrap(), b"y");
    }

    #[test]
    fn lock_key_resolves_existing_prefix_only() {
        let tmp = tempfile::tempdir().unwrap();
        let real = fs::canonicalize(tmp.path()).unwrap();
        let key = lock_key(&tmp.path().join("not/yet/here.md"));
        assert_eq!(key, real.join("not/yet/here.md"));
    }

    #[test]
    fn cross_process_lock_files_from_config() {
        let tmp = tempfile::tempdir().unwrap();
        let lock_dir = tmp.path().join("locks");
        let store = AtomicStore::from_config(&StoreConfig::default(), &lock_dir);
        let doc = target(&tmp.path().join("portfolio"), "skills/a.md");

        store.atomic_write(&doc, b"x").unwrap();
        assert_eq!(fs::read_dir(&lock_dir).unwrap().count(), 1);
    }

    #[test]
    fn mismatched_handle_is_refused() {
        let tmp = tempfile::tempdir().unwrap();
        let store = AtomicStore::new(WAIT);
        let a = target(tmp.path(), "skills/a.md");
        let b = target(tmp.path(), "skills/b.md");

        let handle = store.lock(&a).unwrap();
        let err = store.write_locked(&handle, &b, b"x").unwrap_err();
        assert_eq!(err.kind(), &ErrorKind::StorageFailure);
        assert!(!b.full().exists());
    }
}
