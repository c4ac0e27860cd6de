//! appdeploy - deploys App Engine services from content-addressed tarballs.
//!
//! The deployment pipeline for one service version:
//! 1. a source tarball reference (`gs://` URI or local path) is resolved
//!    into a digest-pinned handle ([`source`]);
//! 2. the tarball is fetched, verified against its SHA-256, and unpacked
//!    into a shared on-disk cache keyed by that digest ([`cache`],
//!    [`tarball`]) - concurrent invocations on the same host coordinate
//!    through per-entry advisory file locks;
//! 3. the module YAML inside the unpacked tree is rendered: deprecated
//!    keys are stripped and `${...}` placeholders are substituted from
//!    `--var` flags and the YAML's `luci_gae_vars` section ([`descriptor`]);
//! 4. `gcloud app deploy` is invoked on the rendered YAML ([`gcloud`]).
//!
//! The cache is self-maintaining: entries record when they were last used
//! and the oldest ones are trimmed after each deployment.
//!
//! # Core Modules
//!
//! - [`cache`] - content-addressed tarball cache with locking and trimming
//! - [`source`] - tarball reference resolution and digests
//! - [`tarball`] - streaming fetch-verify-untar pipeline
//! - [`descriptor`] - module YAML processing and variable substitution
//!
//! # Supporting Modules
//!
//! - [`cli`] - clap-based command-line interface
//! - [`gcloud`] - thin adapter shelling out to the gcloud CLI
//! - [`core`] - error types and user-facing error display
//! - [`constants`] - timeouts and cache tuning knobs

// Core functionality
pub mod cache;
pub mod descriptor;
pub mod source;
pub mod tarball;

// CLI shell and external tools
pub mod cli;
pub mod gcloud;

// Supporting modules
pub mod constants;
pub mod core;
