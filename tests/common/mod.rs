//! Shared helpers for integration tests.

use flate2::Compression;
use flate2::write::GzEncoder;
use sha2::{Digest, Sha256};
use std::io::Write;
use std::path::{Path, PathBuf};

/// Build a gzipped tarball from `(name, contents)` pairs. Entries whose
/// name ends with `/` become directories.
pub fn build_tarball(entries: &[(&str, &str)]) -> Vec<u8> {
    let mut builder = tar::Builder::new(Vec::new());
    for (name, contents) in entries {
        let mut header = tar::Header::new_gnu();
        // Write names straight into the header instead of going through
        // `append_data`, which refuses to emit `..` components; the
        // extractor-under-test must still receive such names verbatim.
        let (entry_name, data): (&str, &[u8]) = if let Some(dir_name) = name.strip_suffix('/') {
            header.set_entry_type(tar::EntryType::Directory);
            header.set_mode(0o755);
            header.set_size(0);
            (dir_name, &b""[..])
        } else {
            header.set_entry_type(tar::EntryType::Regular);
            header.set_mode(0o644);
            header.set_size(contents.len() as u64);
            (name, contents.as_bytes())
        };
        let name_bytes = entry_name.as_bytes();
        header.as_old_mut().name[..name_bytes.len()].copy_from_slice(name_bytes);
        header.set_cksum();
        builder.append(&header, data).unwrap();
    }
    let mut encoder = GzEncoder::new(Vec::new(), Compression::default());
    encoder.write_all(&builder.into_inner().unwrap()).unwrap();
    encoder.finish().unwrap()
}

/// Write a tarball into `dir` and return its path and hex digest.
pub fn write_tarball(dir: &Path, name: &str, entries: &[(&str, &str)]) -> (PathBuf, String) {
    let bytes = build_tarball(entries);
    let digest = hex::encode(Sha256::digest(&bytes));
    let path = dir.join(name);
    std::fs::write(&path, bytes).unwrap();
    (path, digest)
}
