//! Source resolution for deployment tarballs.
//!
//! A tarball reference is either a `gs://` URI (fetched by shelling out to
//! `gsutil`, the way the rest of the tool shells out to `gcloud`) or a local
//! filesystem path. [`resolve`] normalizes a reference plus an optional hex
//! digest into a [`TarballSource`] handle the cache can fetch from.
//!
//! Digest rules:
//! - remote references require an explicit digest (computing it up front
//!   would cost a full download);
//! - local references may omit the digest, in which case the file is
//!   streamed through SHA-256 here;
//! - a supplied digest must decode to exactly 32 bytes.
//!
//! The resolver never verifies remote content. Verification happens in the
//! extractor, over the bytes actually fetched.

use anyhow::{Context, Result};
use sha2::{Digest as _, Sha256};
use std::fmt;
use std::fs::File;
use std::io::Read;
use std::path::{Path, PathBuf};
use std::process::Command;
use std::sync::Arc;

use crate::core::DeployError;

/// URI scheme prefix that marks a reference as remote.
pub const REMOTE_SCHEME: &str = "gs://";

/// A 32-byte SHA-256 content digest.
///
/// Hexadecimal in user input and in cache entry names, raw bytes internally.
#[derive(Clone, Copy, PartialEq, Eq, Hash)]
pub struct ContentDigest([u8; 32]);

impl ContentDigest {
    /// Parse a digest from its lowercase or uppercase hex form.
    pub fn from_hex(hex_digest: &str) -> Result<Self, DeployError> {
        let bytes = hex::decode(hex_digest).map_err(|_| DeployError::BadInput {
            message: format!("digest {hex_digest:?} is not a hex string"),
        })?;
        let raw: [u8; 32] = bytes.try_into().map_err(|_| DeployError::BadInput {
            message: format!("digest {hex_digest:?} has wrong length, want 32 bytes"),
        })?;
        Ok(Self(raw))
    }

    /// Wrap raw digest bytes.
    #[must_use]
    pub const fn from_bytes(raw: [u8; 32]) -> Self {
        Self(raw)
    }

    /// Lowercase hex form, as used for cache entry directory names.
    #[must_use]
    pub fn to_hex(&self) -> String {
        hex::encode(self.0)
    }

    /// Stream a reader through SHA-256 to completion.
    pub fn compute(reader: &mut impl Read) -> std::io::Result<Self> {
        let mut hasher = Sha256::new();
        std::io::copy(reader, &mut hasher)?;
        Ok(Self(hasher.finalize().into()))
    }
}

impl fmt::Display for ContentDigest {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.to_hex())
    }
}

impl fmt::Debug for ContentDigest {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "ContentDigest({})", self.to_hex())
    }
}

/// Classification of a tarball reference.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum SourceKind {
    /// `gs://` object-store URI, fetched via gsutil
    Remote,
    /// Local filesystem path
    Local,
}

/// A fetch-capable handle to a deployment tarball.
///
/// The cache treats sources as opaque: it asks for the digest (to key the
/// cache entry) and opens a byte stream when the entry needs populating.
/// `open` runs on a blocking thread; implementations are free to do
/// synchronous I/O and to shell out.
pub trait TarballSource: Send + Sync + fmt::Debug {
    /// Remote or local.
    fn kind(&self) -> SourceKind;

    /// The declared (or locally computed) digest of the compressed tarball.
    fn digest(&self) -> &ContentDigest;

    /// Open the tarball as a byte stream.
    ///
    /// `temp` is a scratch path inside the cache entry that the source may
    /// use as a staging file; remote sources download there first and then
    /// stream from disk. The caller deletes `temp` afterwards.
    fn open(&self, temp: &Path) -> Result<Box<dyn Read + Send>>;

    /// Human-readable form of the reference, for logging.
    fn describe(&self) -> String;
}

/// Resolve a tarball reference and optional hex digest into a source handle.
///
/// `digest_hex` may be empty. See the module docs for the digest rules.
pub fn resolve(reference: &str, digest_hex: &str) -> Result<Arc<dyn TarballSource>> {
    if reference.starts_with(REMOTE_SCHEME) {
        if digest_hex.is_empty() {
            return Err(DeployError::BadInput {
                message: format!("a digest is required for remote tarball {reference}"),
            }
            .into());
        }
        let digest = ContentDigest::from_hex(digest_hex)?;
        return Ok(Arc::new(RemoteSource {
            uri: reference.to_string(),
            digest,
        }));
    }

    let path = PathBuf::from(reference);
    let digest = if digest_hex.is_empty() {
        let mut file = File::open(&path)
            .map_err(DeployError::IoError)
            .with_context(|| format!("failed to open tarball {}", path.display()))?;
        ContentDigest::compute(&mut file)
            .map_err(DeployError::IoError)
            .with_context(|| format!("failed to hash tarball {}", path.display()))?
    } else {
        ContentDigest::from_hex(digest_hex)?
    };
    Ok(Arc::new(LocalSource { path, digest }))
}

/// Tarball living in a `gs://` bucket.
#[derive(Debug)]
struct RemoteSource {
    uri: String,
    digest: ContentDigest,
}

impl TarballSource for RemoteSource {
    fn kind(&self) -> SourceKind {
        SourceKind::Remote
    }

    fn digest(&self) -> &ContentDigest {
        &self.digest
    }

    fn open(&self, temp: &Path) -> Result<Box<dyn Read + Send>> {
        let gsutil = which::which("gsutil").map_err(|_| DeployError::ToolNotFound {
            tool: "gsutil".to_string(),
        })?;

        tracing::info!("Fetching {}...", self.uri);
        let output = Command::new(&gsutil)
            .arg("cp")
            .arg(&self.uri)
            .arg(temp)
            .output()
            .map_err(DeployError::IoError)
            .context("failed to launch gsutil")?;
        if !output.status.success() {
            return Err(DeployError::ToolFailed {
                tool: "gsutil".to_string(),
                operation: format!("cp {}", self.uri),
                stderr: String::from_utf8_lossy(&output.stderr).into_owned(),
            }
            .into());
        }

        let file = File::open(temp)
            .map_err(DeployError::IoError)
            .with_context(|| format!("failed to open downloaded tarball {}", temp.display()))?;
        Ok(Box::new(file))
    }

    fn describe(&self) -> String {
        self.uri.clone()
    }
}

/// Tarball on the local filesystem.
#[derive(Debug)]
struct LocalSource {
    path: PathBuf,
    digest: ContentDigest,
}

impl TarballSource for LocalSource {
    fn kind(&self) -> SourceKind {
        SourceKind::Local
    }

    fn digest(&self) -> &ContentDigest {
        &self.digest
    }

    fn open(&self, _temp: &Path) -> Result<Box<dyn Read + Send>> {
        let file = File::open(&self.path)
            .map_err(DeployError::IoError)
            .with_context(|| format!("failed to open tarball {}", self.path.display()))?;
        Ok(Box::new(file))
    }

    fn describe(&self) -> String {
        self.path.display().to_string()
    }
}
