use crate::{PersistenceError, Result};
use nix::errno::Errno;
use nix::fcntl::{Flock, FlockArg};
use std::fs::{File, OpenOptions};
use std::path::{Path, PathBuf};
use tracing::trace;

/// Exclusive advisory lock on the store's lock file.
///
/// Held for the duration of a single read-modify-write of a collection and
/// released on drop. `flock` locks belong to the open file description, so two
/// handles in the same process exclude each other just like two processes do.
pub struct StoreLock {
    _guard: Flock<File>,
    path: PathBuf,
}

impl StoreLock {
    /// Block until the lock is held
    pub fn acquire(path: &Path) -> Result<Self> {
        let mut file = open_lock_file(path)?;
        loop {
            match Flock::lock(file, FlockArg::LockExclusive) {
                Ok(guard) => {
                    trace!("Acquired store lock {:?}", path);
                    return Ok(StoreLock {
                        _guard: guard,
                        path: path.to_path_buf(),
                    });
                }
                // Interrupted by a signal before the lock was granted
                Err((f, Errno::EINTR)) => file = f,
                Err((_, errno)) => return Err(lock_error(path, errno)),
            }
        }
    }

    /// Take the lock only if nobody else holds it
    pub fn try_acquire(path: &Path) -> Result<Option<Self>> {
        let file = open_lock_file(path)?;
        match Flock::lock(file, FlockArg::LockExclusiveNonblock) {
            Ok(guard) => Ok(Some(StoreLock {
                _guard: guard,
                path: path.to_path_buf(),
            })),
            Err((_, Errno::EWOULDBLOCK)) => Ok(None),
            Err((_, errno)) => Err(lock_error(path, errno)),
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

fn open_lock_file(path: &Path) -> Result<File> {
    let file = OpenOptions::new()
        .create(true)
        .truncate(false)
        .read(true)
        .write(true)
        .open(path)?;
    Ok(file)
}

fn lock_error(path: &Path, errno: Errno) -> PersistenceError {
    PersistenceError::LockError {
        path: path.to_path_buf(),
        reason: errno.desc().to_string(),
    }
}
