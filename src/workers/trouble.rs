//! Trouble sink: terminal failures, serialized for operator review.

use super::PipelineContext;
use crate::error::Result;
use crate::items::WorkItemStatus;
use crate::pipeline::{Message, ResultEnvelope, Stage, StageOutcome, StageTag};
use async_trait::async_trait;
use chrono::Utc;
use std::sync::Arc;
use tracing::{error, warn};

pub struct TroubleStage {
    ctx: Arc<PipelineContext>,
}

impl TroubleStage {
    pub fn new(ctx: Arc<PipelineContext>) -> Self {
        Self { ctx }
    }
}

#[async_trait]
impl Stage for TroubleStage {
    fn name(&self) -> &'static str {
        "trouble"
    }

    async fn process(
        &self,
        envelope: &mut ResultEnvelope,
        _message: &Message,
    ) -> Result<StageOutcome> {
        let dir = &self.ctx.config.trouble_dir;
        std::fs::create_dir_all(dir)?;
        // Timestamp suffix keeps repeated failures of one package
        // distinct.
        let name = format!("{}-{}.json", envelope.uuid, Utc::now().timestamp());
        let path = dir.join(name);
        std::fs::write(&path, serde_json::to_vec_pretty(envelope)?)?;
        error!(
            uuid = %envelope.uuid,
            "terminal failure dumped to {}: {}",
            path.display(),
            envelope.error_message
        );

        if let Some(ref item_id) = envelope.work_item_id {
            if let Err(e) = self
                .ctx
                .items
                .mark(
                    item_id,
                    StageTag::Trouble,
                    WorkItemStatus::Failed,
                    &envelope.error_message,
                )
                .await
            {
                warn!("cannot flag work item {}: {}", item_id, e);
            }
        }
        Ok(StageOutcome::Done)
    }
}
