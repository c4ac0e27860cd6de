//! Per-entry cache metadata.
//!
//! Every cache entry carries a small JSON record with two timestamps:
//! `created` is set once when the entry is first populated, `touched` is
//! refreshed on every successful acquisition. Trimming uses `touched` to
//! rank entries by staleness.
//!
//! The reader is deliberately forgiving: a missing file yields the zero
//! record, and a corrupt file yields the zero record with a warning. Only
//! real I/O failures propagate. This keeps the cache usable after crashes
//! and makes foreign directories in the cache root harmless.

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::io;
use std::path::Path;

/// Name of the metadata file inside a cache entry directory.
pub const METADATA_FILE: &str = "metadata.json";

/// Timestamps tracked per cache entry, RFC-3339 on disk.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct EntryMetadata {
    /// When the entry was first created. Never overwritten once set.
    #[serde(default)]
    pub created: Option<DateTime<Utc>>,

    /// When the entry was last successfully acquired.
    #[serde(default)]
    pub touched: Option<DateTime<Utc>>,
}

impl EntryMetadata {
    /// Mutator applied on every successful acquisition: stamp `created`
    /// on first use, always refresh `touched`.
    pub fn touch(&mut self, now: DateTime<Utc>) {
        if self.created.is_none() {
            self.created = Some(now);
        }
        self.touched = Some(now);
    }
}

/// Read the metadata record of a cache entry.
///
/// Missing file → zero record. Corrupt file → zero record plus a warning.
/// Any other I/O error propagates.
pub fn read(entry_dir: &Path) -> io::Result<EntryMetadata> {
    let path = entry_dir.join(METADATA_FILE);
    let data = match std::fs::read(&path) {
        Ok(data) => data,
        Err(err) if err.kind() == io::ErrorKind::NotFound => return Ok(EntryMetadata::default()),
        Err(err) => return Err(err),
    };
    match serde_json::from_slice(&data) {
        Ok(meta) => Ok(meta),
        Err(err) => {
            tracing::warn!("Ignoring corrupt cache metadata {}: {}", path.display(), err);
            Ok(EntryMetadata::default())
        }
    }
}

/// Read-mutate-write the metadata record of a cache entry.
///
/// The file is rewritten with mode `0600` and a stable, human-readable
/// layout.
pub fn modify(entry_dir: &Path, mutator: impl FnOnce(&mut EntryMetadata)) -> Result<()> {
    let mut meta = read(entry_dir)
        .with_context(|| format!("failed to read cache metadata in {}", entry_dir.display()))?;
    mutator(&mut meta);

    let path = entry_dir.join(METADATA_FILE);
    let data = serde_json::to_vec_pretty(&meta).context("failed to serialize cache metadata")?;
    write_private(&path, &data)
        .with_context(|| format!("failed to write cache metadata {}", path.display()))?;
    Ok(())
}

#[cfg(unix)]
fn write_private(path: &Path, data: &[u8]) -> io::Result<()> {
    use std::io::Write;
    use std::os::unix::fs::OpenOptionsExt;
    let mut file = std::fs::OpenOptions::new()
        .write(true)
        .create(true)
        .truncate(true)
        .mode(0o600)
        .open(path)?;
    file.write_all(data)
}

#[cfg(not(unix))]
fn write_private(path: &Path, data: &[u8]) -> io::Result<()> {
    std::fs::write(path, data)
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn at(secs: i64) -> DateTime<Utc> {
        Utc.timestamp_opt(secs, 0).unwrap()
    }

    #[test]
    fn missing_file_reads_as_zero_record() {
        let dir = tempfile::tempdir().unwrap();
        assert_eq!(read(dir.path()).unwrap(), EntryMetadata::default());
    }

    #[test]
    fn corrupt_file_reads_as_zero_record() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join(METADATA_FILE), b"not json at all").unwrap();
        assert_eq!(read(dir.path()).unwrap(), EntryMetadata::default());
    }

    #[test]
    fn touch_round_trips_through_disk() {
        let dir = tempfile::tempdir().unwrap();

        modify(dir.path(), |meta| meta.touch(at(1_000))).unwrap();
        let first = read(dir.path()).unwrap();
        assert_eq!(first.created, Some(at(1_000)));
        assert_eq!(first.touched, Some(at(1_000)));

        modify(dir.path(), |meta| meta.touch(at(1_060))).unwrap();
        let second = read(dir.path()).unwrap();
        assert_eq!(second.created, Some(at(1_000)), "created is set only once");
        assert_eq!(second.touched, Some(at(1_060)));
    }

    #[test]
    fn timestamps_are_rfc3339_on_disk() {
        let dir = tempfile::tempdir().unwrap();
        modify(dir.path(), |meta| meta.touch(at(1_600_000_000))).unwrap();
        let raw = std::fs::read_to_string(dir.path().join(METADATA_FILE)).unwrap();
        assert!(raw.contains("2020-09-13T12:26:40Z"), "got: {raw}");
    }

    #[cfg(unix)]
    #[test]
    fn metadata_file_is_private() {
        use std::os::unix::fs::PermissionsExt;
        let dir = tempfile::tempdir().unwrap();
        modify(dir.path(), |meta| meta.touch(at(1))).unwrap();
        let mode = std::fs::metadata(dir.path().join(METADATA_FILE))
            .unwrap()
            .permissions()
            .mode();
        assert_eq!(mode & 0o777, 0o600);
    }
}
