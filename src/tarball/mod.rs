//! Streaming fetch, verify, and unpack of deployment tarballs.
//!
//! [`fetch_and_untar`] pulls bytes from a [`TarballSource`], tees them
//! through SHA-256, gunzips and untars them into a destination directory,
//! and finally checks the computed digest against the digest the source was
//! pinned to. The digest covers the *compressed* bytes exactly as delivered.
//!
//! Entry policy is deliberately strict: only regular files and directories
//! are accepted, entry names must stay inside the destination after
//! cleaning, and of the archived mode bits only the owner-execute bit
//! survives (files become `0600`/`0700`, directories `0700`). Everything
//! else about the entry - ownership, timestamps, extended attributes - is
//! discarded.
//!
//! On failure the destination is left as-is; the cache deletes the staging
//! directory it handed in.

use anyhow::{Context, Result};
use flate2::read::GzDecoder;
use sha2::{Digest as _, Sha256};
use std::io::{self, Read};
use std::path::{Component, Path, PathBuf};
use tar::{Archive, EntryType};

use crate::core::DeployError;
use crate::source::{ContentDigest, TarballSource};

/// Reader adapter that feeds every byte it passes through into SHA-256.
struct HashingReader<R> {
    inner: R,
    hasher: Sha256,
}

impl<R: Read> HashingReader<R> {
    fn new(inner: R) -> Self {
        Self {
            inner,
            hasher: Sha256::new(),
        }
    }

    fn finalize(self) -> ContentDigest {
        ContentDigest::from_bytes(self.hasher.finalize().into())
    }
}

impl<R: Read> Read for HashingReader<R> {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        let n = self.inner.read(buf)?;
        self.hasher.update(&buf[..n]);
        Ok(n)
    }
}

/// Fetch the source, unpack it into `dest`, and verify its digest.
///
/// `temp_archive` is a scratch path the source may use as a download
/// staging file; the caller owns its cleanup. `dest` must already exist.
///
/// This does synchronous I/O throughout and is meant to run on a blocking
/// thread (the cache wraps it in `spawn_blocking`).
///
/// # Errors
///
/// - [`DeployError::UnsupportedEntry`] for entry types other than regular
///   files and directories
/// - [`DeployError::UnsafeEntry`] for entry names escaping `dest`
/// - [`DeployError::IntegrityError`] when the computed digest differs from
///   the source's declared digest
/// - [`DeployError::IoError`] for stream and filesystem failures
pub fn fetch_and_untar(
    source: &dyn TarballSource,
    temp_archive: &Path,
    dest: &Path,
) -> Result<()> {
    let stream = source
        .open(temp_archive)
        .with_context(|| format!("failed to open tarball source {}", source.describe()))?;
    let mut hashing = HashingReader::new(stream);

    {
        let gz = GzDecoder::new(&mut hashing);
        let mut archive = Archive::new(gz);
        for entry in archive.entries().context("failed to read tarball")? {
            let entry = entry.context("failed to read tarball entry")?;
            unpack_entry(entry, dest)?;
        }
    }

    // The gzip decoder stops at the end of the compressed stream, but the
    // tarball may carry trailing bytes (padding, concatenated members). The
    // declared digest covers the whole payload, so drain what's left.
    io::copy(&mut hashing, &mut io::sink()).context("failed to drain tarball stream")?;

    let actual = hashing.finalize();
    if actual != *source.digest() {
        return Err(DeployError::IntegrityError {
            expected: source.digest().to_hex(),
            actual: actual.to_hex(),
        }
        .into());
    }
    Ok(())
}

/// Apply the per-entry policy to a single archive entry.
fn unpack_entry<R: Read>(mut entry: tar::Entry<'_, R>, dest: &Path) -> Result<()> {
    let raw_name = String::from_utf8_lossy(&entry.path_bytes()).into_owned();
    let entry_type = entry.header().entry_type();

    let rel = clean_entry_name(&raw_name)?;
    let target = dest.join(&rel);

    match entry_type {
        EntryType::Directory => {
            make_dir(&target)
                .map_err(DeployError::IoError)
                .with_context(|| format!("failed to create directory {}", target.display()))?;
        }
        EntryType::Regular => {
            // Directory entries normally precede their files, but nothing in
            // the tar format guarantees it.
            if let Some(parent) = target.parent() {
                make_dir_all(parent)
                    .map_err(DeployError::IoError)
                    .with_context(|| format!("failed to create directory {}", parent.display()))?;
            }
            let executable = entry.header().mode().map(|m| m & 0o100 != 0).unwrap_or(false);
            write_file(&mut entry, &target, executable)
                .map_err(DeployError::IoError)
                .with_context(|| format!("failed to extract {}", target.display()))?;
        }
        other => {
            return Err(DeployError::UnsupportedEntry {
                name: raw_name,
                entry_type: entry_type_name(other).to_string(),
            }
            .into());
        }
    }
    Ok(())
}

/// Normalize an entry name to a safe relative path.
///
/// `.` components and root prefixes are dropped, `..` components pop. A name
/// that would climb out of the destination is rejected.
fn clean_entry_name(raw: &str) -> Result<PathBuf, DeployError> {
    let mut cleaned = PathBuf::new();
    for component in Path::new(raw).components() {
        match component {
            Component::Normal(part) => cleaned.push(part),
            Component::CurDir | Component::RootDir | Component::Prefix(_) => {}
            Component::ParentDir => {
                if !cleaned.pop() {
                    return Err(DeployError::UnsafeEntry {
                        name: raw.to_string(),
                    });
                }
            }
        }
    }
    Ok(cleaned)
}

fn make_dir(path: &Path) -> io::Result<()> {
    match std::fs::create_dir(path) {
        Ok(()) => set_dir_mode(path),
        Err(err) if err.kind() == io::ErrorKind::AlreadyExists && path.is_dir() => Ok(()),
        Err(err) => Err(err),
    }
}

fn make_dir_all(path: &Path) -> io::Result<()> {
    if path.is_dir() {
        return Ok(());
    }
    if let Some(parent) = path.parent() {
        make_dir_all(parent)?;
    }
    make_dir(path)
}

#[cfg(unix)]
fn set_dir_mode(path: &Path) -> io::Result<()> {
    use std::os::unix::fs::PermissionsExt;
    std::fs::set_permissions(path, std::fs::Permissions::from_mode(0o700))
}

#[cfg(not(unix))]
fn set_dir_mode(_path: &Path) -> io::Result<()> {
    Ok(())
}

/// Write one regular file, whole, with the normalized mode.
fn write_file(reader: &mut impl Read, target: &Path, executable: bool) -> io::Result<()> {
    let mut options = std::fs::OpenOptions::new();
    options.write(true).create(true).truncate(true);
    #[cfg(unix)]
    {
        use std::os::unix::fs::OpenOptionsExt;
        options.mode(if executable { 0o700 } else { 0o600 });
    }
    #[cfg(not(unix))]
    let _ = executable;

    let mut file = options.open(target)?;
    io::copy(reader, &mut file)?;
    file.sync_all()
}

fn entry_type_name(entry_type: EntryType) -> &'static str {
    match entry_type {
        EntryType::Symlink => "symlink",
        EntryType::Link => "hardlink",
        EntryType::Char => "char device",
        EntryType::Block => "block device",
        EntryType::Fifo => "fifo",
        EntryType::XGlobalHeader | EntryType::XHeader => "extended header",
        _ => "special",
    }
}
