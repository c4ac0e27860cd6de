//! End-to-end behavior of the tarball cache against real local tarballs.

use appdeploy::cache::{Cache, Clock, DATA_DIR, metadata};
use appdeploy::core::DeployError;
use appdeploy::source;
use chrono::{TimeZone, Utc};
use std::sync::Arc;
use std::sync::atomic::{AtomicI64, Ordering};
use tokio_util::sync::CancellationToken;

use crate::common::write_tarball;

fn test_clock(start: i64) -> (Arc<AtomicI64>, Clock) {
    let now = Arc::new(AtomicI64::new(start));
    let handle = Arc::clone(&now);
    let clock: Clock =
        Arc::new(move || Utc.timestamp_opt(handle.load(Ordering::SeqCst), 0).unwrap());
    (now, clock)
}

#[tokio::test]
async fn populates_then_reuses_a_local_tarball() {
    let work = tempfile::tempdir().unwrap();
    let (tarball, digest) = write_tarball(work.path(), "t.tar.gz", &[("dir/", ""), ("dir/file", "hi")]);

    let (now, clock) = test_clock(10_000);
    let cache = Cache::with_clock(work.path().join("cache"), clock);
    let cancel = CancellationToken::new();

    // First call fetches and unpacks.
    let src = source::resolve(tarball.to_str().unwrap(), "").unwrap();
    assert_eq!(src.digest().to_hex(), digest);
    let seen = cache
        .with_tarball(&cancel, src, |data| async move {
            Ok(std::fs::read_to_string(data.join("dir/file"))?)
        })
        .await
        .unwrap();
    assert_eq!(seen, "hi");

    let entry_dir = work.path().join("cache").join(&digest);
    let meta = metadata::read(&entry_dir).unwrap();
    assert_eq!(meta.created, Some(Utc.timestamp_opt(10_000, 0).unwrap()));
    assert_eq!(meta.touched, Some(Utc.timestamp_opt(10_000, 0).unwrap()));

    // Second call 60s later reuses the entry even if the tarball file is
    // gone from disk.
    std::fs::remove_file(&tarball).unwrap();
    now.store(10_060, Ordering::SeqCst);
    let src = source::resolve("gs://unreachable/t.tar.gz", &digest).unwrap();
    let seen = cache
        .with_tarball(&cancel, src, |data| async move {
            Ok(std::fs::read_to_string(data.join("dir/file"))?)
        })
        .await
        .unwrap();
    assert_eq!(seen, "hi");

    let meta = metadata::read(&entry_dir).unwrap();
    assert_eq!(meta.created, Some(Utc.timestamp_opt(10_000, 0).unwrap()));
    assert_eq!(meta.touched, Some(Utc.timestamp_opt(10_060, 0).unwrap()));
}

#[tokio::test]
async fn wrong_digest_never_populates() {
    let work = tempfile::tempdir().unwrap();
    let (tarball, _) = write_tarball(work.path(), "t.tar.gz", &[("file", "content")]);

    let cache = Cache::new(work.path().join("cache"));
    let cancel = CancellationToken::new();

    let declared = "00".repeat(32);
    let src = source::resolve(tarball.to_str().unwrap(), &declared).unwrap();
    let err = cache
        .with_tarball(&cancel, src, |_| async move {
            Err::<(), _>(anyhow::anyhow!("callback must not run"))
        })
        .await
        .unwrap_err();

    match err.downcast_ref::<DeployError>() {
        Some(DeployError::IntegrityError { expected, .. }) => assert_eq!(*expected, declared),
        other => panic!("expected IntegrityError, got {other:?}"),
    }
    assert!(format!("{err:#}").contains("hash mismatch"));
    assert!(!work.path().join("cache").join(&declared).join(DATA_DIR).exists());
}

#[tokio::test]
async fn trim_keeps_the_newest_entries() {
    let work = tempfile::tempdir().unwrap();
    let (now, clock) = test_clock(50_000);
    let cache = Cache::with_clock(work.path().join("cache"), clock);
    let cancel = CancellationToken::new();

    let mut digests = Vec::new();
    for (i, at) in [50_000i64, 50_060, 50_120].into_iter().enumerate() {
        now.store(at, Ordering::SeqCst);
        let name = format!("t{i}.tar.gz");
        let (tarball, digest) =
            write_tarball(work.path(), &name, &[("file", &format!("payload {i}"))]);
        digests.push(digest);
        let src = source::resolve(tarball.to_str().unwrap(), "").unwrap();
        cache
            .with_tarball(&cancel, src, |_| async move { Ok(()) })
            .await
            .unwrap();
    }

    cache.trim(1).await.unwrap();

    let root = work.path().join("cache");
    assert!(!root.join(&digests[0]).exists());
    assert!(!root.join(&digests[1]).exists());
    assert!(root.join(&digests[2]).join(DATA_DIR).is_dir());

    // No del_* leftovers either.
    let stray: Vec<_> = std::fs::read_dir(&root)
        .unwrap()
        .filter_map(|e| e.ok())
        .filter(|e| e.file_name().to_string_lossy().starts_with("del_"))
        .collect();
    assert!(stray.is_empty());
}

#[tokio::test]
async fn unsafe_tarballs_are_rejected() {
    let work = tempfile::tempdir().unwrap();
    let (tarball, _) = write_tarball(
        work.path(),
        "evil.tar.gz",
        &[("../outside", "boo")],
    );

    let cache = Cache::new(work.path().join("cache"));
    let cancel = CancellationToken::new();
    let src = source::resolve(tarball.to_str().unwrap(), "").unwrap();

    let err = cache
        .with_tarball(&cancel, src, |_| async move { Ok(()) })
        .await
        .unwrap_err();
    assert!(matches!(
        err.downcast_ref::<DeployError>(),
        Some(DeployError::UnsafeEntry { .. })
    ));
    assert!(!work.path().join("outside").exists());
}
