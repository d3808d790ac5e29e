//! Advisory cross-process lock on a file path.
//!
//! Locking `ledger.csv` atomically creates `ledger.csv.lock` holding a token
//! that identifies the owner. Other processes poll until the lock file is
//! gone or their wait runs out. Works on network filesystems that honour
//! exclusive create.

use std::fs::{self, OpenOptions};
use std::io::{self, Write};
use std::path::{Path, PathBuf};
use std::thread;
use std::time::{Duration, Instant};

use thiserror::Error;
use tracing::{debug, warn};
use uuid::Uuid;

#[derive(Debug, Error)]
pub enum LockError {
    #[error("timed out after {waited:?} waiting for lock {path}")]
    Timeout { path: PathBuf, waited: Duration },

    #[error("IO error: {0}")]
    Io(#[from] io::Error),
}

/// Token unique to this process and call, safe to use in file names.
pub fn unique_token() -> String {
    format!("{}.{}", std::process::id(), Uuid::new_v4().simple())
}

/// Path of the lock file guarding `target`.
pub fn lock_path(target: &Path) -> PathBuf {
    let mut path = target.as_os_str().to_owned();
    path.push(".lock");
    PathBuf::from(path)
}

/// Held lock; released when dropped.
#[derive(Debug)]
pub struct LockGuard {
    path: PathBuf,
    token: String,
}

impl LockGuard {
    /// Waits up to `timeout` for the lock on `target`, checking every `poll`.
    ///
    /// # Errors
    ///
    /// Returns [`LockError::Timeout`] when another owner still holds the lock
    /// after `timeout`
    pub fn acquire(target: &Path, timeout: Duration, poll: Duration) -> Result<Self, LockError> {
        let path = lock_path(target);
        let token = unique_token();
        let started = Instant::now();
        loop {
            match OpenOptions::new().write(true).create_new(true).open(&path) {
                Ok(mut file) => {
                    file.write_all(token.as_bytes())?;
                    debug!(lock = %path.display(), "lock acquired");
                    return Ok(Self { path, token });
                }
                Err(error) if error.kind() == io::ErrorKind::AlreadyExists => {
                    let waited = started.elapsed();
                    if waited >= timeout {
                        return Err(LockError::Timeout { path, waited });
                    }
                    thread::sleep(poll.min(timeout - waited));
                }
                Err(error) => return Err(error.into()),
            }
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl Drop for LockGuard {
    fn drop(&mut self) {
        // Only remove the file while it still carries our token.
        let ours = fs::read_to_string(&self.path).is_ok_and(|held| held == self.token);
        if ours {
            if let Err(error) = fs::remove_file(&self.path) {
                warn!(lock = %self.path.display(), %error, "cannot release lock");
            }
        }
    }
}
