//! Advisory lock marker kept in a point's private directory.

use crate::error::LockError;
use std::io::ErrorKind;
use std::path::{Path, PathBuf};
use std::time::Duration;
use tokio::time::Instant;
use tracing::{debug, warn};

const LOCK_FILE: &str = "lock";
const MIN_BACKOFF: Duration = Duration::from_millis(10);
const MAX_BACKOFF: Duration = Duration::from_millis(250);

/// Exclusive marker file inside a collect point's private directory.
///
/// Acquisition relies on `create_new`, so two processes can never both
/// believe they hold it. Contention is not queued: callers give up after the
/// timeout and report the pair as failed.
#[derive(Debug)]
pub struct Lock {
    path: PathBuf,
    held: bool,
}

impl Lock {
    pub fn new(private_dir: &Path) -> Self {
        Self {
            path: private_dir.join(LOCK_FILE),
            held: false,
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn is_held(&self) -> bool {
        self.held
    }

    /// Polls until the marker is created or `timeout` elapses.
    pub async fn acquire(&mut self, timeout: Duration) -> bool {
        if self.held {
            return true;
        }
        if let Some(parent) = self.path.parent() {
            if let Err(e) = tokio::fs::create_dir_all(parent).await {
                warn!("Cannot create lock directory {}: {}", parent.display(), e);
                return false;
            }
        }

        let deadline = Instant::now() + timeout;
        let mut backoff = MIN_BACKOFF;
        loop {
            let attempt = tokio::fs::OpenOptions::new()
                .write(true)
                .create_new(true)
                .open(&self.path)
                .await;
            match attempt {
                Ok(_) => {
                    debug!("Acquired lock {}", self.path.display());
                    self.held = true;
                    return true;
                }
                Err(e) if e.kind() == ErrorKind::AlreadyExists => {
                    let now = Instant::now();
                    if now >= deadline {
                        warn!("Timed out waiting for lock {}", self.path.display());
                        return false;
                    }
                    tokio::time::sleep(backoff.min(deadline - now)).await;
                    backoff = (backoff * 2).min(MAX_BACKOFF);
                }
                Err(e) => {
                    warn!("Cannot create lock {}: {}", self.path.display(), e);
                    return false;
                }
            }
        }
    }

    pub fn release(&mut self) -> Result<(), LockError> {
        if !self.held {
            return Err(LockError::NotHeld(self.path.clone()));
        }
        self.held = false;
        std::fs::remove_file(&self.path).map_err(|source| LockError::Io {
            path: self.path.clone(),
            source,
        })?;
        debug!("Released lock {}", self.path.display());
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_second_acquire_times_out() {
        let dir = tempfile::tempdir().unwrap();
        let mut first = Lock::new(dir.path());
        let mut second = Lock::new(dir.path());

        assert!(first.acquire(Duration::from_millis(50)).await);
        assert!(!second.acquire(Duration::from_millis(50)).await);

        first.release().unwrap();
        assert!(second.acquire(Duration::from_millis(50)).await);
        second.release().unwrap();
        assert!(!dir.path().join(LOCK_FILE).exists());
    }

    #[tokio::test]
    async fn test_release_without_hold_fails() {
        let dir = tempfile::tempdir().unwrap();
        let mut lock = Lock::new(dir.path());
        assert!(matches!(lock.release(), Err(LockError::NotHeld(_))));

        assert!(lock.acquire(Duration::ZERO).await);
        lock.release().unwrap();
        assert!(lock.release().is_err());
    }

    #[tokio::test]
    async fn test_creates_missing_directory() {
        let dir = tempfile::tempdir().unwrap();
        let mut lock = Lock::new(&dir.path().join("private").join("meta"));
        assert!(lock.acquire(Duration::from_millis(10)).await);
        assert!(lock.path().exists());
        lock.release().unwrap();
    }
}
