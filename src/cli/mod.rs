//! Command-line interface for appdeploy.
//!
//! Each subcommand lives in its own module with its own argument struct and
//! execution logic:
//!
//! - `module` - deploy a single service (aka module) version from a tarball
//! - `cleanup` - delete stale deployed versions of a service
//! - `cache` - inspect and trim the shared tarball cache
//!
//! Global flags control verbosity and the cache location. The cache root
//! comes from `--cache-dir`, the `APPDEPLOY_CACHE_DIR` environment
//! variable, or the platform cache directory, in that order.
//!
//! A Ctrl-C handler feeds a [`CancellationToken`] that the cache lock
//! retries and long waits observe, so an interrupted deployment exits
//! promptly without leaving a populated-looking half-entry behind.

mod cache;
mod cleanup;
mod module;

use anyhow::Result;
use clap::{Parser, Subcommand};
use std::path::PathBuf;
use tokio_util::sync::CancellationToken;
use tracing_subscriber::EnvFilter;

/// Main CLI application structure for appdeploy.
#[derive(Parser)]
#[command(
    name = "appdeploy",
    about = "Deploys App Engine services from content-addressed source tarballs",
    version,
    long_about = "appdeploy fetches a versioned source tarball (from Google Storage or a \
                  local path), keeps an unpacked copy in a shared on-disk cache, renders \
                  the module YAML by substituting site-specific variables, and calls \
                  gcloud to deploy one service version."
)]
pub struct Cli {
    #[command(subcommand)]
    command: Commands,

    /// Enable debug output
    #[arg(short, long, global = true)]
    verbose: bool,

    /// Suppress all output except errors
    #[arg(short, long, global = true)]
    quiet: bool,

    /// Directory with the tarball cache
    ///
    /// Defaults to `APPDEPLOY_CACHE_DIR` or the platform cache directory.
    #[arg(long, global = true, env = "APPDEPLOY_CACHE_DIR")]
    cache_dir: Option<PathBuf>,
}

/// Available subcommands.
#[derive(Subcommand)]
enum Commands {
    /// Deploy a single service (aka module) version from a tarball.
    ///
    /// Fetches and unpacks the tarball (or reuses the cached copy), renders
    /// the module YAML by injecting `--var` values into its `${...}`
    /// placeholders, and runs `gcloud app deploy`. Does nothing if the
    /// requested version already exists, unless `--force` is given.
    Module(module::ModuleCommand),

    /// Delete old deployed versions of a service.
    Cleanup(cleanup::CleanupCommand),

    /// Inspect and trim the shared tarball cache.
    Cache(cache::CacheCommand),
}

impl Cli {
    /// Execute the parsed command.
    pub async fn execute(self) -> Result<()> {
        self.init_logging();

        // Ctrl-C flips the token; lock waits and retry sleeps notice.
        let cancel = CancellationToken::new();
        let signal_cancel = cancel.clone();
        tokio::spawn(async move {
            if tokio::signal::ctrl_c().await.is_ok() {
                tracing::warn!("Interrupted, shutting down...");
                signal_cancel.cancel();
            }
        });

        let cache_root = self.cache_root()?;
        match self.command {
            Commands::Module(cmd) => cmd.execute(&cancel, cache_root).await,
            Commands::Cleanup(cmd) => cmd.execute().await,
            Commands::Cache(cmd) => cmd.execute(cache_root).await,
        }
    }

    fn init_logging(&self) {
        let filter = if self.verbose {
            EnvFilter::new("debug")
        } else if self.quiet {
            EnvFilter::new("error")
        } else if std::env::var("RUST_LOG").is_ok() {
            EnvFilter::from_default_env()
        } else {
            EnvFilter::new("info")
        };
        let _ = tracing_subscriber::fmt()
            .with_env_filter(filter)
            .with_writer(std::io::stderr)
            .with_target(false)
            .without_time()
            .try_init();
    }

    /// Resolve the cache root: flag/env first, platform default otherwise.
    fn cache_root(&self) -> Result<PathBuf> {
        if let Some(dir) = &self.cache_dir {
            return Ok(dir.clone());
        }
        let base = dirs::cache_dir()
            .ok_or_else(|| anyhow::anyhow!("cannot determine the platform cache directory"))?;
        Ok(base.join("appdeploy"))
    }
}

/// Parse a `KEY=VALUE` pair from a `--var` flag.
fn parse_key_val(raw: &str) -> Result<(String, String), String> {
    match raw.split_once('=') {
        Some((key, value)) if !key.is_empty() => Ok((key.to_string(), value.to_string())),
        _ => Err(format!("expected KEY=VALUE, got {raw:?}")),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_module_command() {
        let digest = "ab".repeat(32);
        let cli = Cli::try_parse_from([
            "appdeploy",
            "module",
            "--app-id",
            "my-app",
            "--tarball",
            "gs://bucket/t.tar.gz",
            "--tarball-sha256",
            digest.as_str(),
            "--module-name",
            "default",
            "--module-yaml",
            "app.yaml",
            "--module-version",
            "v123",
            "--var",
            "FOO=bar",
            "--var",
            "N=1",
        ])
        .unwrap();
        assert!(matches!(cli.command, Commands::Module(_)));
    }

    #[test]
    fn parses_cache_trim() {
        let cli = Cli::try_parse_from([
            "appdeploy",
            "--cache-dir",
            "/tmp/cache",
            "cache",
            "trim",
            "--keep",
            "3",
        ])
        .unwrap();
        assert_eq!(cli.cache_dir, Some(PathBuf::from("/tmp/cache")));
        assert!(matches!(cli.command, Commands::Cache(_)));
    }

    #[test]
    fn key_val_parsing() {
        assert_eq!(
            parse_key_val("A=b=c").unwrap(),
            ("A".to_string(), "b=c".to_string())
        );
        assert!(parse_key_val("no-equals").is_err());
        assert!(parse_key_val("=empty-key").is_err());
    }
}
