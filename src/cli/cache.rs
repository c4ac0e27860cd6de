//! Inspect and trim the shared tarball cache.

use anyhow::Result;
use clap::{Args, Subcommand};
use std::path::PathBuf;

use crate::cache::Cache;
use crate::constants::DEFAULT_CACHE_KEEP;

/// Command group for cache maintenance.
#[derive(Args)]
pub struct CacheCommand {
    #[command(subcommand)]
    command: CacheSubcommand,
}

#[derive(Subcommand)]
enum CacheSubcommand {
    /// Remove all but the most recently used cache entries
    Trim {
        /// How many entries to keep
        #[arg(long, default_value_t = DEFAULT_CACHE_KEEP)]
        keep: usize,
    },

    /// Show cached tarballs and when they were last used
    Info,
}

impl CacheCommand {
    /// Execute the cache subcommand.
    pub async fn execute(self, cache_root: PathBuf) -> Result<()> {
        let cache = Cache::new(cache_root);
        match self.command {
            CacheSubcommand::Trim { keep } => {
                cache.trim(keep).await?;
                tracing::info!("Cache trimmed to at most {keep} entries");
                Ok(())
            }
            CacheSubcommand::Info => {
                let mut entries = cache.scan().await?;
                if entries.is_empty() {
                    println!("Cache at {} is empty", cache.root().display());
                    return Ok(());
                }
                entries.sort_by_key(|(_, touched)| std::cmp::Reverse(*touched));
                println!("Cache at {}:", cache.root().display());
                for (name, touched) in entries {
                    println!("  {name}  last used {touched}");
                }
                Ok(())
            }
        }
    }
}
