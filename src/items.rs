//! Depositor-facing work items.
//!
//! Every locally-deposited package has a work item the depositor can
//! check; stages advance its stage/status pair, and the trouble sink
//! flags it failed. The member directory resolves a depositor
//! identifier to the owning member, for package records that arrive
//! without one.

use crate::error::{CourierError, Result};
use crate::pipeline::StageTag;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use uuid::Uuid;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum WorkItemStatus {
    Pending,
    Started,
    Success,
    Failed,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WorkItem {
    pub id: String,
    /// The depositor's identifier, e.g. "example.edu/my-bag".
    pub local_id: String,
    pub uuid: Option<Uuid>,
    pub stage: StageTag,
    pub status: WorkItemStatus,
    #[serde(default)]
    pub note: String,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl WorkItem {
    pub fn new(id: &str, local_id: &str) -> Self {
        let now = Utc::now();
        Self {
            id: id.to_string(),
            local_id: local_id.to_string(),
            uuid: None,
            stage: StageTag::Package,
            status: WorkItemStatus::Pending,
            note: String::new(),
            created_at: now,
            updated_at: now,
        }
    }
}

#[async_trait]
pub trait WorkItemStore: Send + Sync {
    async fn get(&self, id: &str) -> Result<WorkItem>;
    async fn save(&self, item: &WorkItem) -> Result<()>;

    /// Loads, stamps and saves in one step.
    async fn mark(
        &self,
        id: &str,
        stage: StageTag,
        status: WorkItemStatus,
        note: &str,
    ) -> Result<()> {
        let mut item = self.get(id).await?;
        item.stage = stage;
        item.status = status;
        item.note = note.to_string();
        item.updated_at = Utc::now();
        self.save(&item).await
    }
}

/// One JSON file per work item.
pub struct FsWorkItemStore {
    dir: PathBuf,
}

impl FsWorkItemStore {
    pub fn new(dir: &Path) -> Result<Self> {
        std::fs::create_dir_all(dir)?;
        Ok(Self {
            dir: dir.to_path_buf(),
        })
    }

    fn item_path(&self, id: &str) -> PathBuf {
        self.dir.join(format!("{}.json", id))
    }
}

#[async_trait]
impl WorkItemStore for FsWorkItemStore {
    async fn get(&self, id: &str) -> Result<WorkItem> {
        let raw = match std::fs::read(self.item_path(id)) {
            Ok(raw) => raw,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                return Err(CourierError::NotFound(format!("work item {}", id)))
            }
            Err(e) => return Err(e.into()),
        };
        Ok(serde_json::from_slice(&raw)?)
    }

    async fn save(&self, item: &WorkItem) -> Result<()> {
        let tmp = self.dir.join(format!("{}.tmp", item.id));
        std::fs::write(&tmp, serde_json::to_vec_pretty(item)?)?;
        std::fs::rename(&tmp, self.item_path(&item.id))?;
        Ok(())
    }
}

/// Depositor-identifier -> member lookup.
#[async_trait]
pub trait MemberDirectory: Send + Sync {
    async fn member_for(&self, local_id: &str) -> Result<Uuid>;
}

/// Static directory built from configuration or seeded by tests. Keys
/// are matched against the institution part of the local identifier
/// (everything before the first '/') and against the full identifier.
pub struct StaticMemberDirectory {
    members: HashMap<String, Uuid>,
}

impl StaticMemberDirectory {
    pub fn new(members: HashMap<String, Uuid>) -> Self {
        Self { members }
    }
}

#[async_trait]
impl MemberDirectory for StaticMemberDirectory {
    async fn member_for(&self, local_id: &str) -> Result<Uuid> {
        if let Some(member) = self.members.get(local_id) {
            return Ok(*member);
        }
        let institution = local_id.split('/').next().unwrap_or(local_id);
        self.members.get(institution).copied().ok_or_else(|| {
            CourierError::NotFound(format!("no member for depositor {}", local_id))
        })
    }
}
