//! The per-package work item threaded through the pipeline.
//!
//! An envelope is owned by exactly one stage worker at a time; it moves
//! between stages as the JSON body of a queue message, accumulating one
//! sub-result per phase. An empty `error_message` means success.

use crate::registry::models::{Bag, ReplicationTransfer};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use uuid::Uuid;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum StageTag {
    Package,
    Copy,
    Validate,
    Store,
    Record,
    Trouble,
}

/// Result of local package assembly.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct PackageResult {
    pub tar_path: Option<PathBuf>,
    pub md5: Option<String>,
    pub sha256: Option<String>,
    pub size: Option<u64>,
    #[serde(default)]
    pub note: String,
}

/// Result of fetching a peer's tarball into staging.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct CopyResult {
    pub local_path: Option<PathBuf>,
    pub md5: Option<String>,
    pub sha256: Option<String>,
    pub size: Option<u64>,
    /// Combined stdout/stderr of the copy tool, kept for diagnostics.
    pub transport_output: Option<String>,
    /// Set when a pre-work re-query showed the transfer already
    /// terminated at the origin.
    #[serde(default)]
    pub skipped: bool,
    #[serde(default)]
    pub note: String,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ValidateResult {
    pub valid: Option<bool>,
    /// Nonce-signed tagmanifest digest.
    pub receipt: Option<String>,
    #[serde(default)]
    pub warnings: Vec<String>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct StoreResult {
    /// Long-term object URL.
    pub url: Option<String>,
    pub stored_at: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct RecordResult {
    pub bag_recorded_at: Option<DateTime<Utc>>,
    /// When the `received` receipt went to the origin peer. At most one
    /// is ever sent; redelivery checks this stamp.
    pub copy_receipt_at: Option<DateTime<Utc>>,
    /// When the `stored` receipt went to the origin peer.
    pub store_receipt_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub event_ids: Vec<Uuid>,
    #[serde(default)]
    pub transfer_ids: Vec<Uuid>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ResultEnvelope {
    /// The package under work.
    pub uuid: Uuid,
    pub stage: StageTag,
    pub bag: Option<Bag>,
    /// The inbound transfer, for packages replicated from a peer.
    pub transfer: Option<ReplicationTransfer>,
    /// The depositor-facing work item, for locally-originated packages.
    pub work_item_id: Option<String>,
    /// Keep staged files on failure for operator inspection.
    #[serde(default)]
    pub retain: bool,
    pub local_path: Option<PathBuf>,
    pub md5: Option<String>,
    pub tagmanifest_sha256: Option<String>,
    pub size: Option<u64>,
    #[serde(default)]
    pub package_result: PackageResult,
    #[serde(default)]
    pub copy_result: CopyResult,
    #[serde(default)]
    pub validate_result: ValidateResult,
    #[serde(default)]
    pub store_result: StoreResult,
    #[serde(default)]
    pub record_result: RecordResult,
    /// Empty means success.
    #[serde(default)]
    pub error_message: String,
}

impl ResultEnvelope {
    fn empty(uuid: Uuid, stage: StageTag) -> Self {
        Self {
            uuid,
            stage,
            bag: None,
            transfer: None,
            work_item_id: None,
            retain: true,
            local_path: None,
            md5: None,
            tagmanifest_sha256: None,
            size: None,
            package_result: PackageResult::default(),
            copy_result: CopyResult::default(),
            validate_result: ValidateResult::default(),
            store_result: StoreResult::default(),
            record_result: RecordResult::default(),
            error_message: String::new(),
        }
    }

    /// Envelope for a package entering the pipeline from a local deposit.
    pub fn for_local(uuid: Uuid, work_item_id: &str) -> Self {
        let mut envelope = Self::empty(uuid, StageTag::Package);
        envelope.work_item_id = Some(work_item_id.to_string());
        envelope
    }

    /// Envelope for a package offered by a peer.
    pub fn for_transfer(transfer: ReplicationTransfer) -> Self {
        let mut envelope = Self::empty(transfer.uuid, StageTag::Copy);
        envelope.transfer = Some(transfer);
        envelope
    }

    /// The package's current tarball, preferring the assembly result and
    /// falling back to the copy result.
    pub fn tar_file_path(&self) -> Option<PathBuf> {
        self.package_result
            .tar_path
            .clone()
            .or_else(|| self.copy_result.local_path.clone())
            .or_else(|| self.local_path.clone())
    }

    pub fn ok(&self) -> bool {
        self.error_message.is_empty()
    }

    pub fn fail(&mut self, message: impl Into<String>) {
        self.error_message = message.into();
    }

    /// A package deposited here, as opposed to replicated from a peer.
    pub fn is_local_origin(&self) -> bool {
        self.work_item_id.is_some() && self.transfer.is_none()
    }
}
