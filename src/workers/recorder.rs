//! Record stage.
//!
//! Two disjoint jobs, picked by envelope shape. A locally-deposited
//! package gets its registry record, provenance events, replication
//! targets and work-item closeout. A package replicated from a peer
//! gets its receipts sent back to the origin: `received` after
//! validation (forwarding to the storer only when the origin accepts
//! the fixity value), `stored` after the upload.

use super::PipelineContext;
use crate::error::{CourierError, Result};
use crate::events::{ProvenanceEvent, EVENT_IDENTIFIER_ASSIGNMENT, EVENT_INGEST};
use crate::items::WorkItemStatus;
use crate::pipeline::{Message, ResultEnvelope, Stage, StageOutcome, StageTag, TOPIC_STORE};
use crate::registry::models::{ListParams, ReplicationStatus, ReplicationTransfer};
use async_trait::async_trait;
use chrono::Utc;
use std::sync::Arc;
use tracing::{info, warn};
use uuid::Uuid;

pub struct RecordStage {
    ctx: Arc<PipelineContext>,
}

impl RecordStage {
    pub fn new(ctx: Arc<PipelineContext>) -> Self {
        Self { ctx }
    }

    async fn record_local(&self, envelope: &mut ResultEnvelope) -> Result<StageOutcome> {
        let work_item_id = envelope
            .work_item_id
            .clone()
            .ok_or_else(|| CourierError::Logic("local record without work item".into()))?;
        let mut bag = envelope
            .bag
            .clone()
            .ok_or_else(|| CourierError::Logic("local record without bag".into()))?;

        // The registry requires an owning member on every package.
        if bag.member.is_none() {
            bag.member = Some(self.ctx.members.member_for(&bag.local_id).await?);
        }

        // The registry does not stamp timestamps; the ingest node does.
        let now = Utc::now();
        bag.created_at = now;
        bag.updated_at = now;
        match self.ctx.local.create_bag(&bag).await {
            Ok(_) => {}
            Err(CourierError::Conflict(_)) => {
                // The storer already made the package visible; make sure
                // the resolved member lands on the record.
                info!(uuid = %bag.uuid, "bag record already present");
                self.ctx.local.update_bag(&bag).await?;
            }
            Err(e) => return Err(e),
        }
        envelope.bag = Some(bag.clone());
        envelope.record_result.bag_recorded_at = Some(now);

        self.emit_events(envelope, &bag.local_id).await?;
        self.create_outbound_transfers(envelope).await?;

        self.ctx
            .items
            .mark(
                &work_item_id,
                StageTag::Record,
                WorkItemStatus::Success,
                "package recorded and queued for replication",
            )
            .await?;
        envelope.stage = StageTag::Record;
        Ok(StageOutcome::Done)
    }

    async fn emit_events(&self, envelope: &mut ResultEnvelope, local_id: &str) -> Result<()> {
        if !envelope.record_result.event_ids.is_empty() {
            return Ok(());
        }
        let agent = &self.ctx.config.local_node;

        let mut ingest = ProvenanceEvent::new(EVENT_INGEST, local_id, agent);
        ingest.detail = "package ingested into the preservation network".to_string();
        ingest.outcome_detail = envelope.uuid.to_string();
        self.ctx.events.save(&ingest).await?;

        let mut assignment = ProvenanceEvent::new(EVENT_IDENTIFIER_ASSIGNMENT, local_id, agent);
        assignment.detail = "long-term storage URL assigned".to_string();
        assignment.outcome_detail = envelope
            .store_result
            .url
            .clone()
            .unwrap_or_default();
        self.ctx.events.save(&assignment).await?;

        envelope.record_result.event_ids = vec![ingest.identifier, assignment.identifier];
        Ok(())
    }

    /// Symlinks the staged tar into each chosen target's outbound drop
    /// directory and creates the matching transfer records. Redelivery
    /// is tolerated: targets that already have a transfer are skipped.
    async fn create_outbound_transfers(&self, envelope: &mut ResultEnvelope) -> Result<()> {
        let config = &self.ctx.config;
        let own = self.ctx.local.get_node(&config.local_node).await?;
        let tar = envelope
            .tar_file_path()
            .ok_or_else(|| CourierError::Logic("local record without staged tar".into()))?;

        let existing = self
            .ctx
            .local
            .list_replications(&ListParams {
                uuid: Some(envelope.uuid),
                from_node: Some(config.local_node.clone()),
                ..Default::default()
            })
            .await?;
        let already: Vec<String> = existing.results.iter().map(|t| t.to_node.clone()).collect();

        let targets: Vec<String> = own
            .replicate_to
            .iter()
            .filter(|ns| !already.contains(ns))
            .take(config.replicate_to_num_nodes.saturating_sub(already.len()))
            .cloned()
            .collect();
        if already.is_empty() && targets.len() < config.replicate_to_num_nodes {
            warn!(
                uuid = %envelope.uuid,
                "only {} replication targets available, want {}",
                targets.len(),
                config.replicate_to_num_nodes
            );
        }

        for to_node in targets {
            let outbound = config.outbound_dir(&to_node);
            std::fs::create_dir_all(&outbound)?;
            let link_path = outbound.join(format!("{}.tar", envelope.uuid));
            match std::os::unix::fs::symlink(&tar, &link_path) {
                Ok(()) => {}
                Err(e) if e.kind() == std::io::ErrorKind::AlreadyExists => {}
                Err(e) => return Err(e.into()),
            }

            let now = Utc::now();
            let transfer = ReplicationTransfer {
                replication_id: Uuid::new_v4(),
                from_node: config.local_node.clone(),
                to_node: to_node.clone(),
                uuid: envelope.uuid,
                fixity_algorithm: "sha256".to_string(),
                fixity_nonce: None,
                fixity_value: None,
                fixity_accept: None,
                bag_valid: None,
                status: ReplicationStatus::Requested,
                protocol: "rsync".to_string(),
                link: format!("{}:outbound/{}.tar", config.local_node, envelope.uuid),
                created_at: now,
                updated_at: now,
            };
            let created = self.ctx.local.create_replication(&transfer).await?;
            envelope
                .record_result
                .transfer_ids
                .push(created.replication_id);
            info!(
                uuid = %envelope.uuid,
                "replication to {} requested",
                to_node
            );
        }
        Ok(())
    }

    async fn record_replicated(
        &self,
        envelope: &mut ResultEnvelope,
        transfer: ReplicationTransfer,
    ) -> Result<StageOutcome> {
        let origin = self.ctx.remotes.client_for(&transfer.from_node).await?;

        let copied_and_validated = envelope.validate_result.valid == Some(true);
        if copied_and_validated && envelope.record_result.copy_receipt_at.is_none() {
            let mut update = transfer.clone();
            update.status = ReplicationStatus::Received;
            update.bag_valid = envelope.validate_result.valid;
            update.fixity_value = envelope.validate_result.receipt.clone();
            let response = origin.update_replication(&update).await?;
            envelope.transfer = Some(response.clone());
            envelope.record_result.copy_receipt_at = Some(Utc::now());

            if response.fixity_accept == Some(false) {
                self.discard_staged_tar(envelope);
                let value = update.fixity_value.unwrap_or_default();
                envelope.fail(format!(
                    "origin {} rejected fixity value {}",
                    transfer.from_node, value
                ));
                return Ok(StageOutcome::Abandon(envelope.error_message.clone()));
            }
            if response.status == ReplicationStatus::Cancelled {
                self.discard_staged_tar(envelope);
                envelope.fail(format!("origin {} cancelled the transfer", transfer.from_node));
                return Ok(StageOutcome::Abandon(envelope.error_message.clone()));
            }
            envelope.stage = StageTag::Store;
            return Ok(StageOutcome::Advance(TOPIC_STORE));
        }

        if envelope.store_result.url.is_some() && envelope.record_result.store_receipt_at.is_none()
        {
            let mut update = envelope.transfer.clone().unwrap_or(transfer.clone());
            update.status = ReplicationStatus::Stored;
            let response = origin.update_replication(&update).await?;
            envelope.transfer = Some(response);
            envelope.record_result.store_receipt_at = Some(Utc::now());
            info!(
                uuid = %envelope.uuid,
                "storage receipt sent to {}",
                transfer.from_node
            );
            return Ok(StageOutcome::Done);
        }

        // Neither receipt applies: the envelope reached this stage in
        // an impossible state. Terminal, for operator review.
        Err(CourierError::Logic(format!(
            "replication envelope for {} has neither receipt to send \
             (valid={:?}, stored={:?}, copy_receipt_at={:?}, store_receipt_at={:?})",
            envelope.uuid,
            envelope.validate_result.valid,
            envelope.store_result.url,
            envelope.record_result.copy_receipt_at,
            envelope.record_result.store_receipt_at,
        )))
    }

    fn discard_staged_tar(&self, envelope: &ResultEnvelope) {
        if envelope.retain {
            return;
        }
        if let Some(tar) = envelope.tar_file_path() {
            if let Err(e) = std::fs::remove_file(&tar) {
                if e.kind() != std::io::ErrorKind::NotFound {
                    warn!(uuid = %envelope.uuid, "cannot remove staged tar: {}", e);
                }
            }
        }
    }
}

#[async_trait]
impl Stage for RecordStage {
    fn name(&self) -> &'static str {
        "record"
    }

    async fn process(
        &self,
        envelope: &mut ResultEnvelope,
        _message: &Message,
    ) -> Result<StageOutcome> {
        match envelope.transfer.clone() {
            Some(transfer) => self.record_replicated(envelope, transfer).await,
            None if envelope.work_item_id.is_some() => self.record_local(envelope).await,
            None => Err(CourierError::Logic(
                "record stage got an envelope with neither work item nor transfer".into(),
            )),
        }
    }
}
