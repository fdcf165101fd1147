//! Validate stage: structural and fixity checks on a staged tarball.

use super::PipelineContext;
use crate::bag::Validator;
use crate::error::{CourierError, Result};
use crate::pipeline::{
    Message, ResultEnvelope, Stage, StageOutcome, StageTag, TOPIC_RECORD, TOPIC_STORE,
};
use crate::registry::models::ReplicationStatus;
use async_trait::async_trait;
use chrono::Utc;
use std::sync::Arc;
use tracing::warn;

pub struct ValidateStage {
    ctx: Arc<PipelineContext>,
}

impl ValidateStage {
    pub fn new(ctx: Arc<PipelineContext>) -> Self {
        Self { ctx }
    }

    /// An invalid replicated bag still owes the origin a receipt saying
    /// so, which lets the origin cancel the transfer.
    async fn send_failure_receipt(&self, envelope: &ResultEnvelope) {
        let Some(ref transfer) = envelope.transfer else {
            return;
        };
        let mut update = transfer.clone();
        update.status = ReplicationStatus::Received;
        update.bag_valid = Some(false);
        update.fixity_value = envelope.validate_result.receipt.clone();
        match self.ctx.remotes.client_for(&transfer.from_node).await {
            Ok(origin) => {
                if let Err(e) = origin.update_replication(&update).await {
                    warn!(
                        uuid = %envelope.uuid,
                        "cannot send bag-invalid receipt to {}: {}",
                        transfer.from_node,
                        e
                    );
                }
            }
            Err(e) => warn!(
                uuid = %envelope.uuid,
                "no client for origin {}: {}",
                transfer.from_node,
                e
            ),
        }
    }
}

#[async_trait]
impl Stage for ValidateStage {
    fn name(&self) -> &'static str {
        "validate"
    }

    async fn process(
        &self,
        envelope: &mut ResultEnvelope,
        message: &Message,
    ) -> Result<StageOutcome> {
        let tar = envelope
            .tar_file_path()
            .ok_or_else(|| CourierError::Logic("validate stage needs a tarball".into()))?;
        let nonce = envelope
            .transfer
            .as_ref()
            .and_then(|t| t.fixity_nonce.clone());

        let validator = match Validator::new(Some(tar), None, nonce) {
            Ok(validator) => validator,
            Err(e) => {
                // Fails fast on a malformed package name; a peer still
                // gets told the bag is unusable.
                envelope.validate_result.valid = Some(false);
                self.send_failure_receipt(envelope).await;
                return Err(e);
            }
        };

        let touch = message.touch_handle();
        let outcome = tokio::task::spawn_blocking(move || {
            validator
                .with_touch(Box::new(move || touch.touch()))
                .with_cleanup(true)
                .run()
        })
        .await
        .map_err(|e| CourierError::Logic(format!("validator task: {}", e)))?;

        envelope.validate_result.valid = Some(outcome.valid());
        envelope.validate_result.receipt = outcome.receipt.clone();
        envelope.validate_result.warnings = outcome.warnings.clone();
        envelope.tagmanifest_sha256 = outcome.receipt.clone();

        if outcome.valid() {
            envelope.stage = if envelope.transfer.is_some() {
                StageTag::Record
            } else {
                StageTag::Store
            };
            let next = if envelope.transfer.is_some() {
                TOPIC_RECORD
            } else {
                TOPIC_STORE
            };
            Ok(StageOutcome::Advance(next))
        } else {
            if envelope.transfer.is_some() {
                self.send_failure_receipt(envelope).await;
                envelope.record_result.copy_receipt_at = Some(Utc::now());
            }
            Err(CourierError::Validation(outcome.error_message()))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bag::validator::tests::{build_bag, tar_bag};
    use crate::pipeline::TOPIC_VALIDATE;
    use crate::registry::{MemRegistry, Registry};
    use crate::workers::copier::tests::{sample_transfer, test_context};
    use std::sync::Arc;
    use uuid::Uuid;

    #[tokio::test]
    async fn test_valid_replicated_bag_advances_to_record() {
        let dir = tempfile::tempdir().unwrap();
        let (ctx, _local) = test_context(dir.path(), "local");
        let uuid = Uuid::new_v4();

        build_bag(&ctx.staging.root().to_path_buf(), uuid);
        let tar = tar_bag(&ctx.staging.root().to_path_buf(), uuid);
        std::fs::remove_dir_all(ctx.staging.root().join(uuid.to_string())).unwrap();

        let transfer = sample_transfer(uuid, "peer-one", "local", "unused");
        let origin = Arc::new(MemRegistry::new("peer-one"));
        origin.create_replication(&transfer).await.unwrap();
        ctx.remotes.seed("peer-one", origin);

        let mut envelope = ResultEnvelope::for_transfer(transfer);
        envelope.copy_result.local_path = Some(tar.clone());
        ctx.queue.enqueue(TOPIC_VALIDATE, &envelope).unwrap();
        let message = ctx.queue.dequeue(TOPIC_VALIDATE).unwrap().unwrap();

        let stage = ValidateStage::new(Arc::clone(&ctx));
        let outcome = stage.process(&mut envelope, &message).await.unwrap();
        assert!(matches!(outcome, StageOutcome::Advance(TOPIC_RECORD)));
        assert_eq!(envelope.validate_result.valid, Some(true));
        let receipt = envelope.validate_result.receipt.clone().unwrap();
        assert!(receipt.starts_with(&hex::encode("McNunce")));
        // Extracted tree cleaned, tar kept for the storer.
        assert!(!ctx.staging.root().join(uuid.to_string()).exists());
        assert!(tar.is_file());
        message.finish().unwrap();
    }

    #[tokio::test]
    async fn test_invalid_bag_sends_failure_receipt() {
        let dir = tempfile::tempdir().unwrap();
        let (ctx, _local) = test_context(dir.path(), "local");
        let uuid = Uuid::new_v4();

        let bag_dir = build_bag(&ctx.staging.root().to_path_buf(), uuid);
        std::fs::write(bag_dir.join("data/file-one.txt"), "tampered").unwrap();
        let tar = tar_bag(&ctx.staging.root().to_path_buf(), uuid);
        std::fs::remove_dir_all(&bag_dir).unwrap();

        let transfer = sample_transfer(uuid, "peer-one", "local", "unused");
        let origin = Arc::new(MemRegistry::new("peer-one"));
        origin.create_replication(&transfer).await.unwrap();
        ctx.remotes.seed("peer-one", Arc::clone(&origin) as Arc<dyn Registry>);

        let mut envelope = ResultEnvelope::for_transfer(transfer.clone());
        envelope.copy_result.local_path = Some(tar);
        ctx.queue.enqueue(TOPIC_VALIDATE, &envelope).unwrap();
        let message = ctx.queue.dequeue(TOPIC_VALIDATE).unwrap().unwrap();

        let stage = ValidateStage::new(Arc::clone(&ctx));
        let err = stage.process(&mut envelope, &message).await.unwrap_err();
        assert!(matches!(err, CourierError::Validation(_)));
        assert_eq!(envelope.validate_result.valid, Some(false));

        // Origin heard that the bag failed validation.
        let at_origin = origin
            .get_replication(transfer.replication_id)
            .await
            .unwrap();
        assert_eq!(at_origin.status, ReplicationStatus::Received);
        assert_eq!(at_origin.bag_valid, Some(false));
        message.finish().unwrap();
    }
}
