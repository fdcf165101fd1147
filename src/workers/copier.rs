//! Copy stage: fetches a peer's tarball into staging.

use super::PipelineContext;
use crate::error::{CourierError, Result};
use crate::pipeline::{Message, ResultEnvelope, Stage, StageOutcome, StageTag, TOPIC_VALIDATE};
use crate::staging::copy_estimate;
use async_trait::async_trait;
use std::sync::Arc;
use tokio::sync::Semaphore;

pub struct CopyStage {
    ctx: Arc<PipelineContext>,
    /// Bounds concurrent transfers; sized from `network_connections`.
    network: Arc<Semaphore>,
}

impl CopyStage {
    pub fn new(ctx: Arc<PipelineContext>) -> Self {
        let permits = ctx.config.network_connections.max(1);
        Self {
            ctx,
            network: Arc::new(Semaphore::new(permits)),
        }
    }
}

#[async_trait]
impl Stage for CopyStage {
    fn name(&self) -> &'static str {
        "copy"
    }

    async fn process(
        &self,
        envelope: &mut ResultEnvelope,
        message: &Message,
    ) -> Result<StageOutcome> {
        let transfer = envelope
            .transfer
            .clone()
            .ok_or_else(|| CourierError::Logic("copy stage needs a transfer".into()))?;

        // The transfer may have terminated at the origin since it was
        // enqueued; re-query before reserving disk or moving bytes.
        let origin = self.ctx.remotes.client_for(&transfer.from_node).await?;
        let current = origin.get_replication(transfer.replication_id).await?;
        if current.status.is_terminal() {
            envelope.copy_result.skipped = true;
            envelope.copy_result.note =
                format!("transfer already {} at {}", current.status, transfer.from_node);
            envelope.retain = false;
            return Ok(StageOutcome::Skip(envelope.copy_result.note.clone()));
        }
        envelope.transfer = Some(current.clone());

        if envelope.bag.is_none() {
            envelope.bag = Some(origin.get_bag(current.uuid).await?);
        }
        let declared_size = envelope.bag.as_ref().map(|b| b.size).unwrap_or(0);
        let _reservation = self.ctx.staging.reserve(copy_estimate(declared_size))?;

        let dest = self.ctx.staging.tar_path(current.uuid);
        let _permit = self
            .network
            .acquire()
            .await
            .map_err(|e| CourierError::Logic(format!("network pool closed: {}", e)))?;
        message.touch();
        let output = self.ctx.copier.copy(&current.link, &dest).await?;
        message.touch();
        envelope.copy_result.transport_output = Some(output);

        let digests = {
            let dest = dest.clone();
            tokio::task::spawn_blocking(move || crate::bag::digest_file(&dest))
                .await
                .map_err(|e| CourierError::Logic(format!("digest task: {}", e)))??
        };
        envelope.copy_result.local_path = Some(dest.clone());
        envelope.copy_result.md5 = Some(digests.md5.clone());
        envelope.copy_result.sha256 = Some(digests.sha256);
        envelope.copy_result.size = Some(digests.size);
        envelope.local_path = Some(dest);
        envelope.md5 = Some(digests.md5);
        envelope.size = Some(digests.size);

        envelope.stage = StageTag::Validate;
        Ok(StageOutcome::Advance(TOPIC_VALIDATE))
    }
}
