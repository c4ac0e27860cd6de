//! Binary-level tests of the appdeploy CLI.
//!
//! Deployments run with `--force --dry-run` so no gcloud is needed: the
//! version-exists check is skipped and the final deploy invocation is only
//! logged.

use assert_cmd::Command;
use predicates::prelude::*;

use crate::common::write_tarball;

fn appdeploy() -> Command {
    Command::cargo_bin("appdeploy").unwrap()
}

#[test]
fn help_lists_subcommands() {
    appdeploy()
        .arg("--help")
        .assert()
        .success()
        .stdout(predicate::str::contains("module"))
        .stdout(predicate::str::contains("cleanup"))
        .stdout(predicate::str::contains("cache"));
}

#[test]
fn remote_tarball_requires_digest() {
    let work = tempfile::tempdir().unwrap();
    appdeploy()
        .args([
            "--cache-dir",
            work.path().to_str().unwrap(),
            "module",
            "--app-id",
            "my-app",
            "--tarball",
            "gs://bucket/t.tar.gz",
            "--module-name",
            "default",
            "--module-yaml",
            "app.yaml",
            "--module-version",
            "v1",
            "--force",
            "--dry-run",
        ])
        .assert()
        .failure()
        .stderr(predicate::str::contains("digest is required"));
}

#[test]
fn malformed_digest_is_rejected() {
    let work = tempfile::tempdir().unwrap();
    appdeploy()
        .args([
            "--cache-dir",
            work.path().to_str().unwrap(),
            "module",
            "--app-id",
            "my-app",
            "--tarball",
            "gs://bucket/t.tar.gz",
            "--tarball-sha256",
            "abcd",
            "--module-name",
            "default",
            "--module-yaml",
            "app.yaml",
            "--module-version",
            "v1",
            "--force",
            "--dry-run",
        ])
        .assert()
        .failure()
        .stderr(predicate::str::contains("wrong length"));
}

#[test]
fn dry_run_deploy_renders_the_yaml_into_the_cache() {
    let work = tempfile::tempdir().unwrap();
    let cache_dir = work.path().join("cache");
    let (tarball, digest) = write_tarball(
        work.path(),
        "t.tar.gz",
        &[(
            "app.yaml",
            "service: default\nruntime: python312\nluci_gae_vars:\n  my-app:\n    HOST: prod.example.com\nenv_variables:\n  HOST: ${HOST}\n",
        )],
    );

    appdeploy()
        .args([
            "--cache-dir",
            cache_dir.to_str().unwrap(),
            "module",
            "--app-id",
            "my-app",
            "--tarball",
            tarball.to_str().unwrap(),
            "--module-name",
            "default",
            "--module-yaml",
            "app.yaml",
            "--module-version",
            "v1",
            "--var",
            "HOST=staging.example.com",
            "--force",
            "--dry-run",
        ])
        .assert()
        .success();

    // The rendered YAML sits next to the original inside the cache entry,
    // with the override applied and the vars section gone.
    let rendered = cache_dir.join(&digest).join("data").join(".appdeploy_app.yaml");
    let text = std::fs::read_to_string(&rendered).unwrap();
    assert!(text.contains("HOST: staging.example.com"), "got: {text}");
    assert!(!text.contains("luci_gae_vars"));
    assert!(text.contains("service: default"));
}

#[test]
fn module_name_mismatch_fails() {
    let work = tempfile::tempdir().unwrap();
    let (tarball, _) = write_tarball(
        work.path(),
        "t.tar.gz",
        &[("app.yaml", "service: backend\n")],
    );

    appdeploy()
        .args([
            "--cache-dir",
            work.path().join("cache").to_str().unwrap(),
            "module",
            "--app-id",
            "my-app",
            "--tarball",
            tarball.to_str().unwrap(),
            "--module-name",
            "frontend",
            "--module-yaml",
            "app.yaml",
            "--module-version",
            "v1",
            "--force",
            "--dry-run",
        ])
        .assert()
        .failure()
        .stderr(predicate::str::contains("doesn't match"));
}

#[test]
fn unused_vars_are_warned_about() {
    let work = tempfile::tempdir().unwrap();
    let (tarball, _) = write_tarball(
        work.path(),
        "t.tar.gz",
        &[("app.yaml", "service: default\n")],
    );

    appdeploy()
        .args([
            "--cache-dir",
            work.path().join("cache").to_str().unwrap(),
            "module",
            "--app-id",
            "my-app",
            "--tarball",
            tarball.to_str().unwrap(),
            "--module-name",
            "default",
            "--module-yaml",
            "app.yaml",
            "--module-version",
            "v1",
            "--var",
            "NEVER_USED=1",
            "--force",
            "--dry-run",
        ])
        .assert()
        .success()
        .stderr(predicate::str::contains("NEVER_USED"));
}

#[test]
fn cache_trim_and_info() {
    let work = tempfile::tempdir().unwrap();
    let cache_dir = work.path().join("cache");

    // Two deployments of distinct tarballs populate two entries.
    for i in 0..2 {
        let (tarball, _) = write_tarball(
            work.path(),
            &format!("t{i}.tar.gz"),
            &[("app.yaml", &format!("service: default\n# build {i}\n"))],
        );
        appdeploy()
            .args([
                "--cache-dir",
                cache_dir.to_str().unwrap(),
                "module",
                "--app-id",
                "my-app",
                "--tarball",
                tarball.to_str().unwrap(),
                "--module-name",
                "default",
                "--module-yaml",
                "app.yaml",
                "--module-version",
                "v1",
                "--force",
                "--dry-run",
            ])
            .assert()
            .success();
    }

    appdeploy()
        .args(["--cache-dir", cache_dir.to_str().unwrap(), "cache", "info"])
        .assert()
        .success()
        .stdout(predicate::str::contains("last used"));

    appdeploy()
        .args([
            "--cache-dir",
            cache_dir.to_str().unwrap(),
            "cache",
            "trim",
            "--keep",
            "1",
        ])
        .assert()
        .success();

    let entries = std::fs::read_dir(&cache_dir)
        .unwrap()
        .filter_map(|e| e.ok())
        .filter(|e| e.path().is_dir())
        .count();
    assert_eq!(entries, 1);
}
