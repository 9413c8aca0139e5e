//! Advisory locking for store mutations
//!
//! Every mutation takes an in-process mutex first and then a non-blocking
//! exclusive `flock` on a lock file. flock is per open file description, so
//! the mutex keeps threads of one process from contending with each other
//! while the file lock excludes other processes. A held lock surfaces as
//! `LockContention` instead of blocking.

use crate::error::{KilnError, KilnResult};
use nix::errno::Errno;
use nix::fcntl::{Flock, FlockArg};
use std::fs::{File, OpenOptions};
use std::path::Path;
use std::sync::{Mutex, MutexGuard};

/// Holds an exclusive flock until dropped
struct FileLock {
    _lock: Flock<File>,
}

impl FileLock {
    fn try_acquire(path: &Path) -> KilnResult<Self> {
        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(false)
            .open(path)
            .map_err(|e| KilnError::io(format!("opening lock file {}", path.display()), e))?;

        match Flock::lock(file, FlockArg::LockExclusiveNonblock) {
            Ok(lock) => Ok(Self { _lock: lock }),
            Err((_, Errno::EWOULDBLOCK)) => Err(KilnError::LockContention {
                path: path.to_path_buf(),
            }),
            Err((_, errno)) => Err(KilnError::io(format!("locking {}", path.display()), errno.into())),
        }
    }
}

fn lock_mutex<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

/// Run `f` with the mutex and the lock file held
pub(crate) fn edit<S, T>(
    lockfile: &Path,
    mutex: &Mutex<S>,
    f: impl FnOnce(&mut S) -> KilnResult<T>,
) -> KilnResult<T> {
    let mut guard = lock_mutex(mutex);
    let _lock = FileLock::try_acquire(lockfile)?;
    f(&mut guard)
}

/// Touch shared state under the in-process mutex only
pub(crate) fn with<S, T>(mutex: &Mutex<S>, f: impl FnOnce(&mut S) -> T) -> T {
    let mut guard = lock_mutex(mutex);
    f(&mut guard)
}
