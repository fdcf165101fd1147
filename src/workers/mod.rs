//! Pipeline stages.
//!
//! Locally-ingested packages flow Package -> Store -> Record. Packages
//! replicated from a peer flow Copy -> Validate -> Record (copy
//! receipt) -> Store -> Record (stored receipt). Terminal failures land
//! in the trouble sink.

pub mod copier;
pub mod packager;
pub mod recorder;
pub mod storer;
pub mod trouble;
pub mod validator;

pub use copier::CopyStage;
pub use packager::{AssembledPackage, DirectoryAssembler, PackageAssembler, PackageStage};
pub use recorder::RecordStage;
pub use storer::StoreStage;
pub use trouble::TroubleStage;
pub use validator::ValidateStage;

use crate::config::NodeConfig;
use crate::events::EventStore;
use crate::items::{MemberDirectory, WorkItemStore};
use crate::pipeline::DirQueue;
use crate::registry::{Registry, RemoteClientPool};
use crate::staging::StagingArea;
use crate::storage::ObjectStore;
use crate::transport::FileCopier;
use std::sync::Arc;

/// Everything a stage needs, shared across the process.
pub struct PipelineContext {
    pub config: Arc<NodeConfig>,
    pub queue: Arc<DirQueue>,
    pub staging: Arc<StagingArea>,
    pub local: Arc<dyn Registry>,
    pub remotes: Arc<RemoteClientPool>,
    pub copier: Arc<dyn FileCopier>,
    pub store: Arc<dyn ObjectStore>,
    pub events: Arc<dyn EventStore>,
    pub items: Arc<dyn WorkItemStore>,
    pub members: Arc<dyn MemberDirectory>,
}

impl PipelineContext {
    /// Wires the production collaborators from configuration. Binaries
    /// call this once and hand the context to their stage.
    pub fn from_config(config: Arc<NodeConfig>) -> crate::error::Result<Arc<Self>> {
        use crate::config::DEFAULT_TOKEN_FORMAT;
        use crate::events::FsEventStore;
        use crate::items::{FsWorkItemStore, StaticMemberDirectory};
        use crate::registry::{RegistryClient, RegistryConfig};
        use crate::storage::FsObjectStore;
        use crate::transport::RsyncCopier;
        use std::time::Duration;

        let local: Arc<dyn Registry> = Arc::new(RegistryClient::new(RegistryConfig {
            base_url: config.rest_client.local_service_url.clone(),
            api_version: config.rest_client.local_api_root.clone(),
            auth_token: config.rest_client.local_auth_token.clone(),
            namespace: config.local_node.clone(),
            token_format: DEFAULT_TOKEN_FORMAT.to_string(),
            accept_invalid_certs: config.accept_invalid_ssl_certs,
        })?);
        let remotes = Arc::new(RemoteClientPool::new(
            Arc::clone(&local),
            Arc::clone(&config),
        ));
        Ok(Arc::new(Self {
            queue: DirQueue::new(
                &config.queue_dir,
                Duration::from_secs(config.queue_visibility_secs),
            )?,
            staging: Arc::new(StagingArea::new(
                &config.staging_dir,
                config.staging_capacity_bytes,
            )?),
            local,
            remotes,
            copier: Arc::new(RsyncCopier::new(config.use_ssh_with_rsync)),
            store: Arc::new(FsObjectStore::new(
                &config.object_store_root,
                &config.object_store_bucket,
            )?),
            events: Arc::new(FsEventStore::new(&config.event_store_path)?),
            items: Arc::new(FsWorkItemStore::new(&config.work_item_dir)?),
            members: Arc::new(StaticMemberDirectory::new(config.members.clone())),
            config,
        }))
    }
}

/// Runs one stage's worker pool until SIGINT.
pub async fn run_stage_worker(
    ctx: &Arc<PipelineContext>,
    stage: Arc<dyn crate::pipeline::Stage>,
    topic: &str,
) -> crate::error::Result<()> {
    use crate::pipeline::{StageRunner, TOPIC_TROUBLE};
    use std::time::Duration;

    let runner = StageRunner::new(
        Arc::clone(&ctx.queue),
        stage,
        topic,
        TOPIC_TROUBLE,
        ctx.config.workers,
        ctx.config.max_attempts,
        Duration::from_secs(ctx.config.retry_delay_secs),
        Duration::from_secs(ctx.config.disk_wait_delay_secs),
    );
    let (shutdown_tx, shutdown_rx) = tokio::sync::watch::channel(false);
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            tracing::info!("shutdown requested");
            let _ = shutdown_tx.send(true);
        }
    });
    runner.run(shutdown_rx).await;
    Ok(())
}
