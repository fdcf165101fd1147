//! Staging cleanup.
//!
//! A staged tarball has done its job once enough peers report the
//! package stored. The sweep checks the local registry for each
//! `<uuid>.tar` in staging and removes the tar and its outbound
//! symlinks when the stored count reaches the replication target.

use crate::config::NodeConfig;
use crate::error::Result;
use crate::registry::models::{ListParams, ReplicationStatus};
use crate::registry::Registry;
use std::sync::Arc;
use tracing::{error, info};
use uuid::Uuid;

#[derive(Debug, Default, PartialEq, Eq)]
pub struct CleanupReport {
    pub removed: usize,
    pub retained: usize,
    pub ignored: usize,
    pub failed: usize,
}

pub struct StagingCleanup {
    config: Arc<NodeConfig>,
    local: Arc<dyn Registry>,
}

impl StagingCleanup {
    pub fn new(config: Arc<NodeConfig>, local: Arc<dyn Registry>) -> Self {
        Self { config, local }
    }

    /// One pass over the staging directory. Query failures are surfaced
    /// per file; the sweep continues.
    pub async fn run(&self) -> Result<CleanupReport> {
        let mut report = CleanupReport::default();
        for entry in std::fs::read_dir(&self.config.staging_dir)? {
            let entry = entry?;
            let name = entry.file_name().to_string_lossy().into_owned();
            let Some(uuid) = name
                .strip_suffix(".tar")
                .and_then(|stem| Uuid::parse_str(stem).ok())
            else {
                report.ignored += 1;
                continue;
            };
            match self.sweep_one(uuid).await {
                Ok(true) => report.removed += 1,
                Ok(false) => report.retained += 1,
                Err(e) => {
                    report.failed += 1;
                    error!("cleanup of {}.tar failed: {}", uuid, e);
                }
            }
        }
        info!(
            "cleanup pass: {} removed, {} retained, {} ignored, {} failed",
            report.removed, report.retained, report.ignored, report.failed
        );
        Ok(report)
    }

    async fn sweep_one(&self, uuid: Uuid) -> Result<bool> {
        let transfers = self
            .local
            .list_replications(&ListParams {
                uuid: Some(uuid),
                from_node: Some(self.config.local_node.clone()),
                ..Default::default()
            })
            .await?;
        let stored = transfers
            .results
            .iter()
            .filter(|t| t.status == ReplicationStatus::Stored)
            .count();
        if stored < self.config.replicate_to_num_nodes {
            return Ok(false);
        }

        let tar = self
            .config
            .staging_dir
            .join(format!("{}.tar", uuid));
        remove_tolerant(&tar)?;
        for transfer in &transfers.results {
            let link = self
                .config
                .outbound_dir(&transfer.to_node)
                .join(format!("{}.tar", uuid));
            remove_tolerant(&link)?;
        }
        info!("{}.tar replicated {} times, removed from staging", uuid, stored);
        Ok(true)
    }
}

fn remove_tolerant(path: &std::path::Path) -> Result<()> {
    match std::fs::remove_file(path) {
        Ok(()) => Ok(()),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
        Err(e) => Err(e.into()),
    }
}
