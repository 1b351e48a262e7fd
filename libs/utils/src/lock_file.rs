//! Advisory lock that keeps two lifecycle commands from mutating the host at
//! the same time.
//!
//! The lock is an exclusive, non-blocking `flock(2)` on a well-known file.
//! It is released when the returned guard is dropped or the process exits.
//! The file itself is left behind; only the lock matters.
use std::fs::{self, File, OpenOptions};
use std::path::{Path, PathBuf};

use nix::errno::Errno;
use nix::fcntl::{Flock, FlockArg};

#[derive(Debug, thiserror::Error)]
pub enum LockError {
    #[error("another nodeadm process holds {0}; concurrent invocations are not supported")]
    Held(PathBuf),
    #[error("opening lock file {path}: {source}")]
    Open {
        path: PathBuf,
        source: std::io::Error,
    },
    #[error("locking {path}: {errno}")]
    Lock { path: PathBuf, errno: Errno },
}

pub struct LockFileGuard {
    _lock: Flock<File>,
    path: PathBuf,
}

impl LockFileGuard {
    pub fn path(&self) -> &Path {
        &self.path
    }
}

pub fn create_exclusive(path: &Path) -> Result<LockFileGuard, LockError> {
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent).map_err(|source| LockError::Open {
            path: path.to_owned(),
            source,
        })?;
    }
    let file = OpenOptions::new()
        .create(true)
        .truncate(false)
        .write(true)
        .open(path)
        .map_err(|source| LockError::Open {
            path: path.to_owned(),
            source,
        })?;

    match Flock::lock(file, FlockArg::LockExclusiveNonblock) {
        Ok(lock) => Ok(LockFileGuard {
            _lock: lock,
            path: path.to_owned(),
        }),
        Err((_, Errno::EWOULDBLOCK)) => Err(LockError::Held(path.to_owned())),
        Err((_, errno)) => Err(LockError::Lock {
            path: path.to_owned(),
            errno,
        }),
    }
}
