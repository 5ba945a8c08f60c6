//! Atomic store: per-path locking plus temp-file-and-rename persistence.

mod atomic;
mod lock;

pub use atomic::AtomicStore;
pub use lock::{LockHandle, PathLocks};
