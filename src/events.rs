//! Provenance events emitted to the external event store.

use crate::error::{CourierError, Result};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::io::Write;
use std::path::{Path, PathBuf};
use uuid::Uuid;

pub const EVENT_INGEST: &str = "ingest";
pub const EVENT_IDENTIFIER_ASSIGNMENT: &str = "identifier_assignment";

pub const OUTCOME_SUCCESS: &str = "Success";
pub const OUTCOME_FAILURE: &str = "Failure";

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProvenanceEvent {
    pub identifier: Uuid,
    pub event_type: String,
    pub date_time: DateTime<Utc>,
    pub detail: String,
    pub outcome: String,
    pub outcome_detail: String,
    /// The package this event describes.
    pub object_identifier: String,
    pub agent: String,
}

impl ProvenanceEvent {
    pub fn new(event_type: &str, object_identifier: &str, agent: &str) -> Self {
        Self {
            identifier: Uuid::new_v4(),
            event_type: event_type.to_string(),
            date_time: Utc::now(),
            detail: String::new(),
            outcome: OUTCOME_SUCCESS.to_string(),
            outcome_detail: String::new(),
            object_identifier: object_identifier.to_string(),
            agent: agent.to_string(),
        }
    }
}

#[async_trait]
pub trait EventStore: Send + Sync {
    async fn save(&self, event: &ProvenanceEvent) -> Result<()>;
}

/// Append-only JSONL event log.
pub struct FsEventStore {
    path: PathBuf,
    write_lock: Mutex<()>,
}

impl FsEventStore {
    pub fn new(path: &Path) -> Result<Self> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        Ok(Self {
            path: path.to_path_buf(),
            write_lock: Mutex::new(()),
        })
    }

    /// Reads the full log back. Operational tooling and tests only.
    pub fn read_all(&self) -> Result<Vec<ProvenanceEvent>> {
        let content = match std::fs::read_to_string(&self.path) {
            Ok(content) => content,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => return Err(e.into()),
        };
        content
            .lines()
            .filter(|line| !line.trim().is_empty())
            .map(|line| {
                serde_json::from_str(line)
                    .map_err(|e| CourierError::Serialization(format!("event log: {}", e)))
            })
            .collect()
    }
}

#[async_trait]
impl EventStore for FsEventStore {
    async fn save(&self, event: &ProvenanceEvent) -> Result<()> {
        let line = serde_json::to_string(event)?;
        let _guard = self.write_lock.lock();
        let mut file = std::fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(&self.path)?;
        writeln!(file, "{}", line)?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_events_append_and_read_back() {
        let dir = tempfile::tempdir().unwrap();
        let store = FsEventStore::new(&dir.path().join("events.jsonl")).unwrap();
        assert!(store.read_all().unwrap().is_empty());

        let mut ingest = ProvenanceEvent::new(EVENT_INGEST, "example.edu/my-bag", "courier");
        ingest.outcome_detail = "3fa94c2d-0fb7-4f5e-9be1-1f5e0a2a3c11".to_string();
        store.save(&ingest).await.unwrap();

        let assignment =
            ProvenanceEvent::new(EVENT_IDENTIFIER_ASSIGNMENT, "example.edu/my-bag", "courier");
        store.save(&assignment).await.unwrap();

        let events = store.read_all().unwrap();
        assert_eq!(events.len(), 2);
        assert_eq!(events[0].event_type, EVENT_INGEST);
        assert_eq!(events[0].outcome, OUTCOME_SUCCESS);
        assert_eq!(events[1].event_type, EVENT_IDENTIFIER_ASSIGNMENT);
    }
}
