//! Thin adapter around the `gcloud` CLI.
//!
//! appdeploy never talks to the platform API directly; like the rest of the
//! Cloud SDK tooling it shells out to `gcloud` and leaves authentication,
//! retries, and API versioning to it. This module wraps the three
//! invocations the tool needs - version listing, version deletion, and
//! `app deploy` - behind a small command builder.
//!
//! All functions honor dry-run: the command line is logged instead of run.

use anyhow::{Context, Result};
use serde::Deserialize;
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::process::Stdio;
use tokio::process::Command;
use tokio::time::timeout;

use crate::constants::GCLOUD_LIST_TIMEOUT;
use crate::core::DeployError;

/// One deployed version of a service.
#[derive(Clone, Debug, PartialEq)]
pub struct Version {
    /// Version name (the `-module-version` value it was deployed with)
    pub id: String,
    /// Fraction of traffic currently routed to this version
    pub traffic_split: f64,
    /// Deployment time as reported by gcloud, sortable ISO-ish text
    pub last_deployed: Option<String>,
}

/// Builder for one `gcloud` invocation.
struct GcloudCommand {
    args: Vec<String>,
    current_dir: Option<PathBuf>,
    envs: Vec<(String, String)>,
    capture_output: bool,
}

impl GcloudCommand {
    fn new(args: impl IntoIterator<Item = impl Into<String>>) -> Self {
        Self {
            args: args.into_iter().map(Into::into).collect(),
            current_dir: None,
            envs: Vec::new(),
            capture_output: true,
        }
    }

    fn current_dir(mut self, dir: &Path) -> Self {
        self.current_dir = Some(dir.to_path_buf());
        self
    }

    fn envs(mut self, envs: impl IntoIterator<Item = (String, String)>) -> Self {
        self.envs.extend(envs);
        self
    }

    /// Let the child own the terminal (deploys print progress).
    fn inherit_stdio(mut self) -> Self {
        self.capture_output = false;
        self
    }

    fn describe(&self) -> String {
        format!("gcloud {}", self.args.join(" "))
    }

    /// Run the command, failing on a non-zero exit status. Returns captured
    /// stdout (empty when stdio is inherited).
    async fn run(self, operation: &str) -> Result<Vec<u8>> {
        let gcloud = which::which("gcloud").map_err(|_| DeployError::ToolNotFound {
            tool: "gcloud".to_string(),
        })?;

        tracing::debug!("Running {}", self.describe());
        let mut command = Command::new(&gcloud);
        command.args(&self.args);
        if let Some(dir) = &self.current_dir {
            command.current_dir(dir);
        }
        for (key, value) in &self.envs {
            command.env(key, value);
        }

        if self.capture_output {
            command.stdout(Stdio::piped()).stderr(Stdio::piped());
            let output = command
                .output()
                .await
                .map_err(DeployError::IoError)
                .with_context(|| format!("failed to launch {}", self.describe()))?;
            if !output.status.success() {
                return Err(DeployError::ToolFailed {
                    tool: "gcloud".to_string(),
                    operation: operation.to_string(),
                    stderr: String::from_utf8_lossy(&output.stderr).into_owned(),
                }
                .into());
            }
            Ok(output.stdout)
        } else {
            let status = command
                .status()
                .await
                .map_err(DeployError::IoError)
                .with_context(|| format!("failed to launch {}", self.describe()))?;
            if !status.success() {
                return Err(DeployError::ToolFailed {
                    tool: "gcloud".to_string(),
                    operation: operation.to_string(),
                    stderr: String::new(),
                }
                .into());
            }
            Ok(Vec::new())
        }
    }
}

/// `gcloud app versions list` output row; only the fields we read.
#[derive(Deserialize)]
struct RawVersion {
    service: String,
    id: String,
    #[serde(default)]
    traffic_split: Option<f64>,
    #[serde(default)]
    last_deployed_time: Option<RawDeployTime>,
}

#[derive(Deserialize)]
struct RawDeployTime {
    #[serde(default)]
    datetime: Option<String>,
}

/// List deployed versions of `app_id`, grouped by service name.
///
/// `service` narrows the listing to one service when given.
pub async fn list_versions(
    app_id: &str,
    service: Option<&str>,
) -> Result<BTreeMap<String, Vec<Version>>> {
    let mut args = vec![
        "app".to_string(),
        "versions".to_string(),
        "list".to_string(),
        "--project".to_string(),
        app_id.to_string(),
        "--format".to_string(),
        "json".to_string(),
    ];
    if let Some(service) = service {
        args.push("--service".to_string());
        args.push(service.to_string());
    }

    let stdout = timeout(GCLOUD_LIST_TIMEOUT, GcloudCommand::new(args).run("versions list"))
        .await
        .map_err(|_| DeployError::Other {
            message: "gcloud versions list timed out".to_string(),
        })??;

    let raw: Vec<RawVersion> =
        serde_json::from_slice(&stdout).context("failed to parse gcloud versions list output")?;

    let mut out: BTreeMap<String, Vec<Version>> = BTreeMap::new();
    for version in raw {
        out.entry(version.service).or_default().push(Version {
            id: version.id,
            traffic_split: version.traffic_split.unwrap_or(0.0),
            last_deployed: version.last_deployed_time.and_then(|t| t.datetime),
        });
    }
    Ok(out)
}

/// Delete the given versions of one service.
pub async fn delete_versions(
    app_id: &str,
    service: &str,
    versions: &[String],
    dry_run: bool,
) -> Result<()> {
    if versions.is_empty() {
        return Ok(());
    }
    let mut args = vec![
        "app".to_string(),
        "versions".to_string(),
        "delete".to_string(),
        "--project".to_string(),
        app_id.to_string(),
        "--service".to_string(),
        service.to_string(),
        "--quiet".to_string(),
    ];
    args.extend(versions.iter().cloned());

    let command = GcloudCommand::new(args);
    if dry_run {
        tracing::info!("(dry run) would run: {}", command.describe());
        return Ok(());
    }
    command.inherit_stdio().run("versions delete").await?;
    Ok(())
}

/// Deploy one module YAML as `version` of `app_id`.
///
/// Runs from `module_dir` so relative paths inside the YAML resolve, with
/// `extra_env` layered over the inherited environment. Interactive prompts
/// are disabled and traffic is neither promoted nor stopped - flipping
/// traffic is a separate, human-driven step.
pub async fn deploy(
    app_id: &str,
    version: &str,
    yaml_name: &str,
    module_dir: &Path,
    extra_env: impl IntoIterator<Item = (String, String)>,
    dry_run: bool,
) -> Result<()> {
    let command = GcloudCommand::new([
        "app",
        "deploy",
        "--project",
        app_id,
        "--quiet",
        "--no-promote",
        "--no-stop-previous-version",
        "--version",
        version,
        yaml_name,
    ])
    .current_dir(module_dir)
    .envs(extra_env);

    if dry_run {
        tracing::info!(
            "(dry run) would run in {}: {}",
            module_dir.display(),
            command.describe()
        );
        return Ok(());
    }
    command.inherit_stdio().run("app deploy").await?;
    Ok(())
}
