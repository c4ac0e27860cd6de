//! Advisory file locking for cache entries.
//!
//! Each cache entry owns a `lock` file; whoever holds the OS-level
//! exclusive lock on it owns the entry's critical section. Acquisition is a
//! try-lock loop: on contention we sleep for a uniformly random 5-10 s
//! (jitter keeps simultaneous invocations from retrying in lockstep) and
//! try again, until the configured timeout is spent. Every sleep is raced
//! against the ambient cancellation token.
//!
//! The lock is whole-file and advisory. It serializes cooperating
//! appdeploy processes on one host; it does not protect against anything
//! that ignores it.

use anyhow::{Context, Result};
use fs4::fs_std::FileExt;
use rand::Rng;
use std::fs::{File, OpenOptions};
use std::path::{Path, PathBuf};
use std::time::Duration;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

use crate::constants::{LOCK_RETRY_MAX, LOCK_RETRY_MIN};
use crate::core::DeployError;

/// An acquired exclusive lock on a cache entry.
///
/// Release it with [`CacheLock::release`]; dropping it also releases the
/// lock (and best-effort removes the lock file), so the critical section
/// ends on every exit path, panics included.
#[derive(Debug)]
pub struct CacheLock {
    file: Option<File>,
    path: PathBuf,
}

impl CacheLock {
    /// Acquire an exclusive lock on `path`, creating the file if needed.
    ///
    /// Blocks (cooperatively) up to `timeout`. Fails with
    /// [`DeployError::LockTimeout`] when the timeout is spent,
    /// [`DeployError::Cancelled`] when `cancel` fires during a retry sleep,
    /// and [`DeployError::IoError`] on filesystem trouble.
    pub async fn acquire(
        path: &Path,
        timeout: Duration,
        cancel: &CancellationToken,
    ) -> Result<Self> {
        let deadline = Instant::now() + timeout;
        loop {
            if let Some(file) = try_lock(path)
                .with_context(|| format!("failed to lock {}", path.display()))?
            {
                return Ok(Self {
                    file: Some(file),
                    path: path.to_path_buf(),
                });
            }

            let now = Instant::now();
            if now >= deadline {
                return Err(DeployError::LockTimeout {
                    path: path.display().to_string(),
                }
                .into());
            }

            let jitter = Duration::from_secs_f64(
                rand::rng().random_range(LOCK_RETRY_MIN.as_secs_f64()..=LOCK_RETRY_MAX.as_secs_f64()),
            );
            let nap = jitter.min(deadline - now);
            tracing::debug!(
                "Lock {} is busy, retrying in {:.1}s",
                path.display(),
                nap.as_secs_f64()
            );
            tokio::select! {
                () = cancel.cancelled() => return Err(DeployError::Cancelled.into()),
                () = tokio::time::sleep(nap) => {}
            }
        }
    }

    /// Release the lock and remove the lock file.
    pub fn release(mut self) -> Result<()> {
        let file = self.file.take().expect("release called twice");
        file.unlock()
            .map_err(DeployError::IoError)
            .with_context(|| format!("failed to unlock {}", self.path.display()))?;
        match std::fs::remove_file(&self.path) {
            Ok(()) => Ok(()),
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(err) => Err(DeployError::IoError(err))
                .with_context(|| format!("failed to remove lock file {}", self.path.display())),
        }
    }
}

impl Drop for CacheLock {
    fn drop(&mut self) {
        if let Some(file) = self.file.take() {
            if let Err(err) = file.unlock() {
                tracing::warn!("Failed to unlock {}: {}", self.path.display(), err);
            }
            if let Err(err) = std::fs::remove_file(&self.path) {
                if err.kind() != std::io::ErrorKind::NotFound {
                    tracing::warn!(
                        "Failed to remove lock file {}: {}",
                        self.path.display(),
                        err
                    );
                }
            }
        }
    }
}

/// One non-blocking attempt. `Ok(None)` means somebody else holds the lock.
fn try_lock(path: &Path) -> std::io::Result<Option<File>> {
    let file = OpenOptions::new().create(true).write(true).open(path)?;
    if file.try_lock_exclusive()? {
        Ok(Some(file))
    } else {
        Ok(None)
    }
}
