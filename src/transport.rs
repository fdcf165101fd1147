//! Payload transport: the external file-copy tool.
//!
//! Replication links are opaque strings handed to an rsync-like
//! program. The trait exists so tests and same-host setups can copy
//! without shelling out.

use crate::error::{CourierError, Result};
use async_trait::async_trait;
use std::path::Path;
use tokio::process::Command;
use tracing::debug;

#[async_trait]
pub trait FileCopier: Send + Sync {
    /// Copies `link` to `dest`, returning the tool's combined output
    /// for diagnostics.
    async fn copy(&self, link: &str, dest: &Path) -> Result<String>;
}

/// Invokes the external `rsync` program.
pub struct RsyncCopier {
    use_ssh: bool,
}

impl RsyncCopier {
    pub fn new(use_ssh: bool) -> Self {
        Self { use_ssh }
    }
}

#[async_trait]
impl FileCopier for RsyncCopier {
    async fn copy(&self, link: &str, dest: &Path) -> Result<String> {
        let mut command = Command::new("rsync");
        command.arg("-av").arg("--copy-dirlinks");
        if self.use_ssh {
            command.arg("-e").arg("ssh");
        }
        command.arg(link).arg(dest);
        debug!("running {:?}", command.as_std());

        let output = command.output().await.map_err(|e| {
            CourierError::Transport(format!("cannot launch rsync: {}", e))
        })?;
        let mut combined = String::from_utf8_lossy(&output.stdout).into_owned();
        combined.push_str(&String::from_utf8_lossy(&output.stderr));
        if output.status.success() {
            Ok(combined)
        } else {
            Err(CourierError::Transport(format!(
                "rsync {} -> {} exited with {}: {}",
                link,
                dest.display(),
                output.status,
                combined.trim()
            )))
        }
    }
}

/// Plain filesystem copy for links that are local paths. Used by tests
/// and single-host deployments.
pub struct LocalCopier;

#[async_trait]
impl FileCopier for LocalCopier {
    async fn copy(&self, link: &str, dest: &Path) -> Result<String> {
        let bytes = tokio::fs::copy(link, dest).await.map_err(|e| {
            CourierError::Transport(format!("copy {} -> {}: {}", link, dest.display(), e))
        })?;
        Ok(format!("copied {} bytes", bytes))
    }
}
