//! Deploy a single service (aka module) version from a tarball.
//!
//! The flow for one deployment:
//!
//! 1. unless `--force` is given, ask gcloud whether the requested version
//!    already exists - if it does, there is nothing to do;
//! 2. resolve the tarball reference into a source handle;
//! 3. inside the cache's critical section, read the module YAML from the
//!    unpacked tarball, render it (strip deprecated keys, substitute
//!    `${...}` placeholders from `--var` flags and the YAML's own
//!    `luci_gae_vars` section), save the rendered copy next to the
//!    original, and run `gcloud app deploy` from the module's directory;
//! 4. trim the cache down to its keep-count.
//!
//! The rendered YAML is left in the cache entry afterwards to aid
//! debugging; it is harmless.

use anyhow::{Context, Result};
use clap::Args;
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use tokio_util::sync::CancellationToken;

use crate::cache::Cache;
use crate::constants::DEFAULT_CACHE_KEEP;
use crate::core::DeployError;
use crate::descriptor::ModuleDescriptor;
use crate::gcloud;
use crate::source;

/// Prefix of the rendered YAML written next to the original.
const RENDERED_PREFIX: &str = ".appdeploy_";

/// Command to deploy one service version.
#[derive(Args)]
pub struct ModuleCommand {
    /// App (aka project) ID to deploy to
    #[arg(short = 'A', long)]
    app_id: String,

    /// Tarball with the service code: a gs:// URI or a local path
    #[arg(long)]
    tarball: String,

    /// SHA-256 hex digest of the tarball
    ///
    /// Required for gs:// tarballs; optional for local files.
    #[arg(long, default_value = "")]
    tarball_sha256: String,

    /// Name of the module to deploy (must match what's in the YAML)
    #[arg(long)]
    module_name: String,

    /// Path within the tarball to the module YAML to deploy
    #[arg(long)]
    module_yaml: PathBuf,

    /// Version name for the deployed code
    #[arg(long)]
    module_version: String,

    /// A KEY=VALUE pair defining a variable used when rendering the
    /// module's YAML. May be repeated.
    #[arg(long = "var", value_parser = super::parse_key_val)]
    vars: Vec<(String, String)>,

    /// Deploy even if this version already exists
    #[arg(long)]
    force: bool,

    /// Log what would be done without deploying
    #[arg(long)]
    dry_run: bool,
}

impl ModuleCommand {
    /// Execute the module deployment.
    pub async fn execute(self, cancel: &CancellationToken, cache_root: PathBuf) -> Result<()> {
        tracing::info!("App ID:  {}", self.app_id);
        tracing::info!("Tarball: {}", self.tarball);
        tracing::info!("Cache:   {}", cache_root.display());
        tracing::info!("Module:  {}", self.module_name);
        tracing::info!("YAML:    {}", self.module_yaml.display());
        tracing::info!("Version: {}", self.module_version);

        if !self.force {
            tracing::info!("Checking if such version already exists...");
            let deployed = gcloud::list_versions(&self.app_id, Some(&self.module_name))
                .await
                .context("failed to check whether such version already exists")?;
            let exists = deployed
                .get(&self.module_name)
                .is_some_and(|versions| versions.iter().any(|v| v.id == self.module_version));
            if exists {
                tracing::info!(
                    "Version {:?} of {:?} already exists, skipping the deployment!",
                    self.module_version,
                    self.module_name
                );
                return Ok(());
            }
            tracing::info!("No such version, will deploy it.");
        }

        let source = source::resolve(&self.tarball, &self.tarball_sha256)?;
        let overrides: BTreeMap<String, String> = self.vars.iter().cloned().collect();

        let cache = Cache::new(cache_root);
        let app_id = self.app_id.clone();
        let module_name = self.module_name.clone();
        let module_yaml = self.module_yaml.clone();
        let module_version = self.module_version.clone();
        let dry_run = self.dry_run;

        cache
            .with_tarball(cancel, source, |root| async move {
                deploy_from_unpacked(
                    &root,
                    &app_id,
                    &module_name,
                    &module_yaml,
                    &module_version,
                    &overrides,
                    dry_run,
                )
                .await
            })
            .await?;

        if let Err(err) = cache.trim(DEFAULT_CACHE_KEEP).await {
            tracing::warn!("Failed to trim the tarball cache: {err:#}");
        }
        Ok(())
    }
}

/// The part of the deployment that runs against the unpacked tarball,
/// inside the cache's critical section.
async fn deploy_from_unpacked(
    root: &Path,
    app_id: &str,
    module_name: &str,
    module_yaml: &Path,
    module_version: &str,
    overrides: &BTreeMap<String, String>,
    dry_run: bool,
) -> Result<()> {
    let yaml_path = root.join(module_yaml);
    tracing::info!("Loading {}...", yaml_path.display());
    let mut descriptor =
        ModuleDescriptor::read_yaml(&yaml_path).context("failed to read module YAML")?;
    if descriptor.name != module_name {
        return Err(DeployError::BadInput {
            message: format!(
                "module name in the yaml {:?} doesn't match --module-name flag {:?}",
                descriptor.name, module_name
            ),
        }
        .into());
    }

    let consumed = descriptor
        .process(app_id, overrides)
        .context("failed to process module's config")?;

    let blob = descriptor
        .dump_yaml()
        .context("failed to serialize processed module config")?;
    tracing::info!("Processed module YAML:\n\n{blob}");

    // Loudly warn about supplied but unused variables.
    for key in overrides.keys() {
        if !consumed.contains(key) {
            tracing::warn!("Variable {key:?} was passed via --var flag but not referenced in the YAML");
        }
    }

    // The rendered YAML must live in the same directory as the original so
    // that gcloud resolves all relative paths in it correctly.
    let module_dir = module_yaml.parent().unwrap_or(Path::new(""));
    let yaml_base = module_yaml
        .file_name()
        .ok_or_else(|| DeployError::BadInput {
            message: format!("--module-yaml {} has no file name", module_yaml.display()),
        })?
        .to_string_lossy();
    let rendered_name = format!("{RENDERED_PREFIX}{yaml_base}");
    write_rendered(&root.join(module_dir).join(&rendered_name), blob.as_bytes())
        .context("failed to save processed module config")?;

    gcloud::deploy(
        app_id,
        module_version,
        &rendered_name,
        &root.join(module_dir),
        std::iter::empty(),
        dry_run,
    )
    .await
}

#[cfg(unix)]
fn write_rendered(path: &Path, data: &[u8]) -> std::io::Result<()> {
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
fn write_rendered(path: &Path, data: &[u8]) -> std::io::Result<()> {
    std::fs::write(path, data)
}
