//! Content-addressed cache of unpacked deployment tarballs.
//!
//! The cache root is shared by every appdeploy invocation on the host. Each
//! tarball gets one entry directory named after the lowercase hex SHA-256 of
//! its compressed bytes:
//!
//! ```text
//! <root>/<hex-digest>/
//!     lock                  # advisory lock, owns the entry's critical section
//!     metadata.json         # created / touched timestamps
//!     tmp_<uuid>.tar.gz     # transient: download staging (during a fetch)
//!     tmp_<uuid>/           # transient: unpack staging (during a fetch)
//!     data/                 # the unpacked tarball - present iff populated
//!     del_<pid>_<rand>_<name>/  # transient: entry being deleted by trim
//! ```
//!
//! The filesystem IS the state: entries hold nothing in memory between
//! invocations, so crash recovery is trivial - at worst a `tmp_*` directory
//! and a stale lock file are left behind, and both are reclaimed by the
//! next invocation.
//!
//! `data/` only ever appears via an atomic rename of a fully verified
//! staging directory, so observers either see the complete artifact or
//! nothing. Metadata is updated inside the critical section but not
//! atomically with the rename; a crash between the two leaves `data/` with
//! stale metadata, which the next acquisition repairs.
//!
//! Trimming deliberately skips the entry lock (trimmed entries are stale by
//! selection) and narrows the race window by renaming an entry to a
//! `del_`-prefixed name before deleting it recursively. A populator racing
//! a trimmer simply repopulates.

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use crate::constants::{CACHE_LOCK_TIMEOUT, DEL_PREFIX, TMP_PREFIX};
use crate::core::DeployError;
use crate::source::TarballSource;
use crate::tarball;

pub mod lock;
pub mod metadata;

pub use lock::CacheLock;
pub use metadata::EntryMetadata;

/// Name of the populated artifact directory inside an entry.
pub const DATA_DIR: &str = "data";

/// Name of the per-entry lock file.
pub const LOCK_FILE: &str = "lock";

/// Injectable time source.
///
/// The cache never reads the host clock directly; tests substitute a
/// settable clock to step time deterministically.
pub type Clock = Arc<dyn Fn() -> DateTime<Utc> + Send + Sync>;

/// Cache of unpacked tarballs, keyed by content digest.
///
/// Value-oriented: cloning is cheap and instances share no mutable state.
/// All coordination happens through the filesystem.
#[derive(Clone)]
pub struct Cache {
    root: PathBuf,
    clock: Clock,
}

impl Cache {
    /// Cache rooted at `root`, using the system clock.
    pub fn new(root: PathBuf) -> Self {
        Self::with_clock(root, Arc::new(Utc::now))
    }

    /// Cache rooted at `root` with an explicit time source.
    pub fn with_clock(root: PathBuf, clock: Clock) -> Self {
        Self { root, clock }
    }

    /// The cache root directory.
    #[must_use]
    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Fetch-or-reuse the unpacked tarball and run `callback` on it.
    ///
    /// The callback receives the path of the populated `data/` directory
    /// and runs inside the entry's critical section: for a given digest, at
    /// most one invocation across all processes sharing this root is
    /// between lock acquisition and release at any instant. The callback
    /// may modify files in place; modifications persist in the cache.
    ///
    /// Populating is all-or-nothing. The tarball is fetched and unpacked
    /// into transient paths and only renamed to `data/` after the digest
    /// verified, so a failure (including digest mismatch) leaves the entry
    /// unpopulated and the next invocation retries.
    ///
    /// # Errors
    ///
    /// - [`DeployError::LockTimeout`] when the entry lock stays busy for 15
    ///   minutes
    /// - [`DeployError::Cancelled`] when `cancel` fires while waiting
    /// - whatever the extractor or the callback fails with
    pub async fn with_tarball<T, F, Fut>(
        &self,
        cancel: &CancellationToken,
        source: Arc<dyn TarballSource>,
        callback: F,
    ) -> Result<T>
    where
        F: FnOnce(PathBuf) -> Fut,
        Fut: Future<Output = Result<T>>,
    {
        let entry_dir = self.root.join(source.digest().to_hex());
        create_private_dir_all(&entry_dir)
            .map_err(DeployError::IoError)
            .with_context(|| format!("failed to create cache entry {}", entry_dir.display()))?;

        let lock = CacheLock::acquire(&entry_dir.join(LOCK_FILE), CACHE_LOCK_TIMEOUT, cancel).await?;

        // Inside the critical section from here on. The lock guard releases
        // on drop, covering every early return below.
        let result = self.populate_and_run(cancel, &source, &entry_dir, callback).await;

        if let Err(err) = lock.release() {
            tracing::warn!("Failed to release cache entry lock: {err:#}");
        }
        result
    }

    async fn populate_and_run<T, F, Fut>(
        &self,
        cancel: &CancellationToken,
        source: &Arc<dyn TarballSource>,
        entry_dir: &Path,
        callback: F,
    ) -> Result<T>
    where
        F: FnOnce(PathBuf) -> Fut,
        Fut: Future<Output = Result<T>>,
    {
        metadata::modify(entry_dir, |meta| meta.touch((self.clock)()))?;

        let data_dir = entry_dir.join(DATA_DIR);
        if !data_dir.is_dir() {
            self.populate(cancel, source, entry_dir, &data_dir).await?;
        } else {
            tracing::debug!("Tarball is already in the cache at {}", data_dir.display());
        }

        callback(data_dir).await
    }

    /// Fetch, verify, and unpack the source into `data/`.
    ///
    /// Runs with the entry lock held and `data/` absent.
    async fn populate(
        &self,
        cancel: &CancellationToken,
        source: &Arc<dyn TarballSource>,
        entry_dir: &Path,
        data_dir: &Path,
    ) -> Result<()> {
        if cancel.is_cancelled() {
            return Err(DeployError::Cancelled.into());
        }

        let token = Uuid::new_v4().simple().to_string();
        let temp_archive = entry_dir.join(format!("{TMP_PREFIX}{token}.tar.gz"));
        let staging = entry_dir.join(format!("{TMP_PREFIX}{token}"));
        create_private_dir_all(&staging)
            .map_err(DeployError::IoError)
            .with_context(|| format!("failed to create staging dir {}", staging.display()))?;

        tracing::info!("Fetching and unpacking {}...", source.describe());
        let unpack = {
            let source = Arc::clone(source);
            let temp_archive = temp_archive.clone();
            let staging = staging.clone();
            tokio::task::spawn_blocking(move || {
                tarball::fetch_and_untar(source.as_ref(), &temp_archive, &staging)
            })
            .await
            .context("tarball unpacking task died")?
        };

        if let Err(err) = unpack {
            remove_dir_best_effort(&staging);
            remove_file_best_effort(&temp_archive);
            return Err(err);
        }
        remove_file_best_effort(&temp_archive);

        // The linearization point: data/ becomes visible only as a complete,
        // verified tree.
        if let Err(err) = std::fs::rename(&staging, data_dir) {
            remove_dir_best_effort(&staging);
            return Err(DeployError::IoError(err)).with_context(|| {
                format!("failed to rename {} to {}", staging.display(), data_dir.display())
            });
        }
        Ok(())
    }

    /// Retain the `keep` most recently touched entries and remove the rest.
    ///
    /// Runs without taking entry locks ("steamroll"): trimmed entries are by
    /// selection the ones nobody touched recently, and a populator racing a
    /// trim simply repopulates. Each doomed entry is first renamed to a
    /// `del_`-prefixed name, so it stops being a cache hit the instant the
    /// rename lands, then deleted recursively.
    ///
    /// Directories with missing, corrupt, or zero metadata are skipped with
    /// a warning - transient directories and foreign files are not ours to
    /// delete.
    pub async fn trim(&self, keep: usize) -> Result<()> {
        let mut ranked = self.scan().await?;
        if ranked.len() <= keep {
            return Ok(());
        }
        ranked.sort_by_key(|(_, touched)| *touched);

        let doomed = ranked.len() - keep;
        let mut failed = 0usize;
        for (name, _) in ranked.into_iter().take(doomed) {
            tracing::info!("Removing stale cache entry {name}...");
            if let Err(err) = remove_entry(&self.root, &name) {
                tracing::warn!("Failed to remove cache entry {name}: {err:#}");
                failed += 1;
            }
        }
        if failed > 0 {
            return Err(DeployError::Other {
                message: format!("failed to remove {failed} cache entries"),
            }
            .into());
        }
        Ok(())
    }

    /// Readable entries of the cache root: `(directory name, touched)`.
    ///
    /// Skips non-directories and directories without a usable `touched`
    /// timestamp.
    pub async fn scan(&self) -> Result<Vec<(String, DateTime<Utc>)>> {
        let mut out = Vec::new();
        let mut entries = match tokio::fs::read_dir(&self.root).await {
            Ok(entries) => entries,
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => return Ok(out),
            Err(err) => {
                return Err(DeployError::IoError(err)).with_context(|| {
                    format!("failed to read cache root {}", self.root.display())
                });
            }
        };
        while let Some(entry) = entries
            .next_entry()
            .await
            .context("failed to scan cache root")?
        {
            let path = entry.path();
            if !path.is_dir() {
                continue;
            }
            let name = entry.file_name().to_string_lossy().into_owned();
            match metadata::read(&path) {
                Ok(meta) => match meta.touched {
                    Some(touched) => out.push((name, touched)),
                    None => {
                        tracing::warn!("Skipping cache dir {name} with no usable metadata");
                    }
                },
                Err(err) => {
                    tracing::warn!("Skipping cache dir {name}: {err}");
                }
            }
        }
        Ok(out)
    }
}

/// Create a directory (with parents) readable by the owner only.
fn create_private_dir_all(path: &Path) -> std::io::Result<()> {
    let mut builder = std::fs::DirBuilder::new();
    builder.recursive(true);
    #[cfg(unix)]
    {
        use std::os::unix::fs::DirBuilderExt;
        builder.mode(0o700);
    }
    builder.create(path)
}

/// Remove one cache entry, rename-first.
///
/// Entries already carrying the `del_` prefix (leftovers of an interrupted
/// trim) are deleted in place.
fn remove_entry(root: &Path, name: &str) -> Result<()> {
    let path = root.join(name);
    if name.starts_with(DEL_PREFIX) {
        return std::fs::remove_dir_all(&path)
            .map_err(DeployError::IoError)
            .with_context(|| format!("failed to delete {}", path.display()));
    }

    let token = &Uuid::new_v4().simple().to_string()[..16];
    let doomed = root.join(format!("{DEL_PREFIX}{}_{token}_{name}", std::process::id()));
    std::fs::rename(&path, &doomed)
        .map_err(DeployError::IoError)
        .with_context(|| format!("failed to rename {} for deletion", path.display()))?;
    std::fs::remove_dir_all(&doomed)
        .map_err(DeployError::IoError)
        .with_context(|| format!("failed to delete {}", doomed.display()))
}

/// Best-effort transient cleanup: not-found is the expected case once the
/// file was consumed, anything else is worth a warning.
fn remove_file_best_effort(path: &Path) {
    if let Err(err) = std::fs::remove_file(path) {
        if err.kind() != std::io::ErrorKind::NotFound {
            tracing::warn!("Failed to remove temp file {}: {}", path.display(), err);
        }
    }
}

fn remove_dir_best_effort(path: &Path) {
    if let Err(err) = std::fs::remove_dir_all(path) {
        if err.kind() != std::io::ErrorKind::NotFound {
            tracing::warn!("Failed to remove staging dir {}: {}", path.display(), err);
        }
    }
}
