//! Store stage: moves a validated tarball into long-term storage.

use super::PipelineContext;
use crate::error::{CourierError, Result};
use crate::pipeline::{Message, ResultEnvelope, Stage, StageOutcome, StageTag, TOPIC_RECORD};
use async_trait::async_trait;
use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine;
use chrono::Utc;
use std::sync::Arc;
use tracing::{info, warn};

const TAR_CONTENT_TYPE: &str = "application/x-tar";

pub struct StoreStage {
    ctx: Arc<PipelineContext>,
}

impl StoreStage {
    pub fn new(ctx: Arc<PipelineContext>) -> Self {
        Self { ctx }
    }
}

#[async_trait]
impl Stage for StoreStage {
    fn name(&self) -> &'static str {
        "store"
    }

    async fn process(
        &self,
        envelope: &mut ResultEnvelope,
        message: &Message,
    ) -> Result<StageOutcome> {
        // Skip the upload when the origin has already terminated the
        // transfer.
        if let Some(ref transfer) = envelope.transfer {
            let origin = self.ctx.remotes.client_for(&transfer.from_node).await?;
            let current = origin.get_replication(transfer.replication_id).await?;
            if current.status.is_terminal() {
                envelope.retain = false;
                return Ok(StageOutcome::Skip(format!(
                    "transfer already {} at {}",
                    current.status, transfer.from_node
                )));
            }
        }

        let tar = envelope
            .tar_file_path()
            .ok_or_else(|| CourierError::Logic("store stage needs a tarball".into()))?;

        // One combined read covers both digests when an earlier stage
        // did not leave them on the envelope.
        let md5 = match envelope.md5.clone() {
            Some(md5) => md5,
            None => {
                let tar = tar.clone();
                let digests =
                    tokio::task::spawn_blocking(move || crate::bag::digest_file(&tar))
                        .await
                        .map_err(|e| CourierError::Logic(format!("digest task: {}", e)))??;
                envelope.md5 = Some(digests.md5.clone());
                envelope.size = Some(digests.size);
                if let Some(ref mut bag) = envelope.bag {
                    bag.fixities
                        .entry("sha256".to_string())
                        .or_insert(digests.sha256);
                }
                digests.md5
            }
        };
        let md5_raw = hex::decode(&md5)
            .map_err(|e| CourierError::Logic(format!("bad md5 on envelope: {}", e)))?;
        let content_md5 = BASE64.encode(md5_raw);

        let depositor = envelope
            .bag
            .as_ref()
            .map(|b| b.local_id.clone())
            .unwrap_or_default();
        let mut tags = Vec::new();
        if !depositor.is_empty() {
            tags.push(("depositor".to_string(), depositor));
        }

        let key = format!("{}.tar", envelope.uuid);
        message.touch();
        let url = self
            .ctx
            .store
            .put(&key, &tar, TAR_CONTENT_TYPE, &content_md5, &tags)
            .await?;
        message.touch();
        envelope.store_result.url = Some(url.clone());
        envelope.store_result.stored_at = Some(Utc::now());
        info!(uuid = %envelope.uuid, "stored at {}", url);

        // A locally-deposited package becomes visible to the network
        // here. The recorder's create tolerates this duplicate.
        if envelope.is_local_origin() {
            let bag = envelope
                .bag
                .clone()
                .ok_or_else(|| CourierError::Logic("local package without bag record".into()))?;
            match self.ctx.local.create_bag(&bag).await {
                Ok(_) => {}
                Err(CourierError::Conflict(_)) => {
                    info!(uuid = %envelope.uuid, "bag record already present");
                }
                Err(e) => return Err(e),
            }
        } else {
            // Replicated tarballs are not needed in staging once the
            // object store has them; locally-deposited ones stay for
            // peers to fetch until cleanup confirms replication.
            if let Err(e) = std::fs::remove_file(&tar) {
                if e.kind() != std::io::ErrorKind::NotFound {
                    warn!(uuid = %envelope.uuid, "cannot remove staged tar: {}", e);
                }
            }
        }

        envelope.stage = StageTag::Record;
        Ok(StageOutcome::Advance(TOPIC_RECORD))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::pipeline::TOPIC_STORE;
    use crate::registry::models::ReplicationStatus;
    use crate::registry::{MemRegistry, Registry};
    use crate::workers::copier::tests::{sample_bag, sample_transfer, test_context};
    use uuid::Uuid;

    #[tokio::test]
    async fn test_stores_local_package_and_creates_record() {
        let dir = tempfile::tempdir().unwrap();
        let (ctx, _local) = test_context(dir.path(), "local");
        let uuid = Uuid::new_v4();

        let tar = ctx.staging.tar_path(uuid);
        std::fs::write(&tar, b"local package tar").unwrap();

        let mut envelope = ResultEnvelope::for_local(uuid, "item-1");
        envelope.package_result.tar_path = Some(tar.clone());
        envelope.bag = Some(sample_bag(uuid, "local", 17));
        ctx.queue.enqueue(TOPIC_STORE, &envelope).unwrap();
        let message = ctx.queue.dequeue(TOPIC_STORE).unwrap().unwrap();

        let stage = StoreStage::new(Arc::clone(&ctx));
        let outcome = stage.process(&mut envelope, &message).await.unwrap();
        assert!(matches!(outcome, StageOutcome::Advance(TOPIC_RECORD)));

        let url = envelope.store_result.url.clone().unwrap();
        assert!(url.ends_with(&format!("{}.tar", uuid)));
        // Visible in the local registry now.
        assert!(ctx.local.get_bag(uuid).await.is_ok());
        // Local tars stay for outbound replication.
        assert!(tar.is_file());
        // Redelivery tolerates the existing record.
        let again = stage.process(&mut envelope, &message).await.unwrap();
        assert!(matches!(again, StageOutcome::Advance(TOPIC_RECORD)));
        message.finish().unwrap();
    }

    #[tokio::test]
    async fn test_stores_replicated_package_and_removes_tar() {
        let dir = tempfile::tempdir().unwrap();
        let (ctx, _local) = test_context(dir.path(), "local");
        let uuid = Uuid::new_v4();

        let tar = ctx.staging.tar_path(uuid);
        std::fs::write(&tar, b"replicated tar").unwrap();

        let transfer = sample_transfer(uuid, "peer-one", "local", "unused");
        let origin = Arc::new(MemRegistry::new("peer-one"));
        origin.create_replication(&transfer).await.unwrap();
        ctx.remotes.seed("peer-one", origin);

        let mut envelope = ResultEnvelope::for_transfer(transfer);
        envelope.copy_result.local_path = Some(tar.clone());
        envelope.bag = Some(sample_bag(uuid, "peer-one", 14));
        ctx.queue.enqueue(TOPIC_STORE, &envelope).unwrap();
        let message = ctx.queue.dequeue(TOPIC_STORE).unwrap().unwrap();

        let stage = StoreStage::new(Arc::clone(&ctx));
        let outcome = stage.process(&mut envelope, &message).await.unwrap();
        assert!(matches!(outcome, StageOutcome::Advance(TOPIC_RECORD)));
        assert!(envelope.store_result.stored_at.is_some());
        // No local bag record for replicated packages.
        assert!(ctx.local.get_bag(uuid).await.is_err());
        // Staged tar removed once the object store has it.
        assert!(!tar.exists());
        message.finish().unwrap();
    }

    #[tokio::test]
    async fn test_cancelled_transfer_skips_upload() {
        let dir = tempfile::tempdir().unwrap();
        let (ctx, _local) = test_context(dir.path(), "local");
        let uuid = Uuid::new_v4();

        let tar = ctx.staging.tar_path(uuid);
        std::fs::write(&tar, b"replicated tar").unwrap();

        let mut transfer = sample_transfer(uuid, "peer-one", "local", "unused");
        transfer.status = ReplicationStatus::Cancelled;
        let origin = Arc::new(MemRegistry::new("peer-one"));
        origin.create_replication(&transfer).await.unwrap();
        ctx.remotes.seed("peer-one", origin);

        let mut envelope = ResultEnvelope::for_transfer(transfer);
        envelope.copy_result.local_path = Some(tar);
        ctx.queue.enqueue(TOPIC_STORE, &envelope).unwrap();
        let message = ctx.queue.dequeue(TOPIC_STORE).unwrap().unwrap();

        let stage = StoreStage::new(Arc::clone(&ctx));
        let outcome = stage.process(&mut envelope, &message).await.unwrap();
        assert!(matches!(outcome, StageOutcome::Skip(_)));
        assert!(envelope.store_result.url.is_none());
        message.finish().unwrap();
    }
}
