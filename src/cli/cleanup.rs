//! Delete old deployed versions of a service.
//!
//! Deployments accumulate versions (each `appdeploy module` run creates
//! one), and App Engine caps how many may exist. This command keeps the
//! most recently deployed versions of a service and deletes the rest,
//! skipping any version that still receives traffic.

use anyhow::{Context, Result};
use clap::Args;

use crate::gcloud;

/// Command to delete stale versions of a service.
#[derive(Args)]
pub struct CleanupCommand {
    /// App (aka project) ID to clean up
    #[arg(short = 'A', long)]
    app_id: String,

    /// Name of the service whose versions to clean up
    #[arg(long)]
    service: String,

    /// How many of the most recent versions to keep
    #[arg(long, default_value_t = 5)]
    keep: usize,

    /// Log what would be deleted without deleting
    #[arg(long)]
    dry_run: bool,
}

impl CleanupCommand {
    /// Execute the cleanup.
    pub async fn execute(self) -> Result<()> {
        let deployed = gcloud::list_versions(&self.app_id, Some(&self.service))
            .await
            .context("failed to list deployed versions")?;
        let Some(versions) = deployed.get(&self.service) else {
            tracing::info!("Service {:?} has no versions, nothing to do", self.service);
            return Ok(());
        };

        // Versions with traffic are never deleted, no matter how old.
        let mut deletable: Vec<_> = versions
            .iter()
            .filter(|v| v.traffic_split == 0.0)
            .cloned()
            .collect();
        let serving = versions.len() - deletable.len();

        // gcloud reports deployment times in a lexically sortable form;
        // versions without one sort first and go away with the oldest.
        deletable.sort_by(|a, b| a.last_deployed.cmp(&b.last_deployed));

        if deletable.len() <= self.keep {
            tracing::info!(
                "Service {:?} has {} deletable versions (+{serving} serving), keeping all",
                self.service,
                deletable.len()
            );
            return Ok(());
        }

        let doomed: Vec<String> = deletable[..deletable.len() - self.keep]
            .iter()
            .map(|v| v.id.clone())
            .collect();
        for id in &doomed {
            tracing::info!("Deleting version {:?} of {:?}...", id, self.service);
        }
        gcloud::delete_versions(&self.app_id, &self.service, &doomed, self.dry_run)
            .await
            .context("failed to delete versions")
    }
}
