//! Wire types for the preservation-network record service.
//!
//! These mirror the JSON bodies exchanged with the local registry and with
//! peer registries. Identity fields are immutable after creation; the
//! structs carry everything so that upserts during peer synchronization can
//! round-trip records bit-exactly.

use chrono::{DateTime, SecondsFormat, TimeZone, Utc};
use serde::{Deserialize, Deserializer, Serialize};
use std::collections::BTreeMap;
use std::fmt;
use uuid::Uuid;

/// Substituted for a null/never-set pull date so that `after=<sentinel>`
/// queries degrade to "fetch everything". Predates the network's
/// operational start.
pub fn sentinel_pull_date() -> DateTime<Utc> {
    Utc.with_ymd_and_hms(2000, 1, 1, 0, 0, 0).unwrap()
}

fn null_to_sentinel<'de, D>(deserializer: D) -> Result<DateTime<Utc>, D::Error>
where
    D: Deserializer<'de>,
{
    let opt: Option<DateTime<Utc>> = Option::deserialize(deserializer)?;
    Ok(opt.unwrap_or_else(sentinel_pull_date))
}

/// Renders a timestamp the way registry list endpoints expect `after`.
pub fn rfc3339_nanos(ts: DateTime<Utc>) -> String {
    ts.to_rfc3339_opts(SecondsFormat::Nanos, true)
}

/// A participating node's descriptor.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Node {
    /// Globally unique short name.
    pub namespace: String,
    pub name: String,
    pub api_root: String,
    /// Ordered replication targets; the recorder takes the first N.
    #[serde(default)]
    pub replicate_to: Vec<String>,
    #[serde(default = "sentinel_pull_date", deserialize_with = "null_to_sentinel")]
    pub last_pull_date: DateTime<Utc>,
}

/// Preserved-package classes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum BagType {
    Data,
    Rights,
    Interpretive,
}

impl fmt::Display for BagType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            BagType::Data => write!(f, "data"),
            BagType::Rights => write!(f, "rights"),
            BagType::Interpretive => write!(f, "interpretive"),
        }
    }
}

/// A preserved package's registry record.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Bag {
    pub uuid: Uuid,
    /// The depositor's own identifier for this package.
    pub local_id: String,
    pub size: u64,
    pub first_version_uuid: Uuid,
    pub version: u32,
    /// Namespace where the package entered the network. Immutable.
    pub ingest_node: String,
    /// Authoritative owner; its copy of this record wins conflicts.
    pub admin_node: String,
    pub bag_type: BagType,
    #[serde(default)]
    pub rights: Vec<Uuid>,
    #[serde(default)]
    pub interpretive: Vec<Uuid>,
    /// Grows monotonically as peers confirm storage.
    #[serde(default)]
    pub replicating_nodes: Vec<String>,
    /// Algorithm -> hex digest. "sha256" is required.
    #[serde(default)]
    pub fixities: BTreeMap<String, String>,
    /// Depositing member. Required at creation; resolved from `local_id`
    /// when the assembly layer did not supply it.
    pub member: Option<Uuid>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Bag {
    pub fn sha256(&self) -> Option<&str> {
        self.fixities.get("sha256").map(String::as_str)
    }
}

/// Replication-transfer lifecycle. The forward path is monotonic;
/// `cancelled` is terminal from any state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ReplicationStatus {
    Requested,
    Received,
    Stored,
    Cancelled,
}

impl ReplicationStatus {
    pub fn is_terminal(self) -> bool {
        matches!(self, ReplicationStatus::Stored | ReplicationStatus::Cancelled)
    }

    pub fn can_transition_to(self, next: ReplicationStatus) -> bool {
        use ReplicationStatus::*;
        match (self, next) {
            (Requested, Received) | (Received, Stored) => true,
            (Requested, Cancelled) | (Received, Cancelled) => true,
            (a, b) if a == b => true,
            _ => false,
        }
    }
}

impl fmt::Display for ReplicationStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ReplicationStatus::Requested => write!(f, "requested"),
            ReplicationStatus::Received => write!(f, "received"),
            ReplicationStatus::Stored => write!(f, "stored"),
            ReplicationStatus::Cancelled => write!(f, "cancelled"),
        }
    }
}

/// A request from one node to another to copy and store a package.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ReplicationTransfer {
    pub replication_id: Uuid,
    pub from_node: String,
    pub to_node: String,
    /// The package under transfer.
    pub uuid: Uuid,
    pub fixity_algorithm: String,
    /// Origin-supplied salt for the tag-manifest receipt.
    #[serde(default)]
    pub fixity_nonce: Option<String>,
    /// Replicator-computed receipt digest.
    #[serde(default)]
    pub fixity_value: Option<String>,
    /// Origin's judgment of the receipt.
    #[serde(default)]
    pub fixity_accept: Option<bool>,
    /// Replicator's judgment of the package.
    #[serde(default)]
    pub bag_valid: Option<bool>,
    pub status: ReplicationStatus,
    pub protocol: String,
    /// Opaque transport source, e.g. an rsync path.
    pub link: String,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

/// Restore-transfer lifecycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RestoreStatus {
    Requested,
    Prepared,
    Finished,
    Rejected,
}

impl fmt::Display for RestoreStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            RestoreStatus::Requested => write!(f, "requested"),
            RestoreStatus::Prepared => write!(f, "prepared"),
            RestoreStatus::Finished => write!(f, "finished"),
            RestoreStatus::Rejected => write!(f, "rejected"),
        }
    }
}

/// A request to pull a package back from a holder.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RestoreTransfer {
    pub restore_id: Uuid,
    pub from_node: String,
    pub to_node: String,
    pub uuid: Uuid,
    pub status: RestoreStatus,
    pub protocol: String,
    pub link: String,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

/// Uniform paginated list shape returned by every collection endpoint.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ListResponse<T> {
    pub count: u64,
    pub next: Option<String>,
    pub previous: Option<String>,
    pub results: Vec<T>,
}

/// Query filters accepted by list endpoints. Unset fields are omitted
/// from the query string.
#[derive(Debug, Clone, Default)]
pub struct ListParams {
    pub after: Option<DateTime<Utc>>,
    pub admin_node: Option<String>,
    pub from_node: Option<String>,
    pub to_node: Option<String>,
    pub uuid: Option<Uuid>,
    pub status: Option<String>,
    pub bag_valid: Option<bool>,
    pub fixity_accept: Option<bool>,
    pub page: Option<u32>,
    pub page_size: Option<u32>,
}

impl ListParams {
    pub fn to_query(&self) -> Vec<(String, String)> {
        let mut pairs = Vec::new();
        if let Some(after) = self.after {
            pairs.push(("after".to_string(), rfc3339_nanos(after)));
        }
        if let Some(ref v) = self.admin_node {
            pairs.push(("admin_node".to_string(), v.clone()));
        }
        if let Some(ref v) = self.from_node {
            pairs.push(("from_node".to_string(), v.clone()));
        }
        if let Some(ref v) = self.to_node {
            pairs.push(("to_node".to_string(), v.clone()));
        }
        if let Some(uuid) = self.uuid {
            pairs.push(("uuid".to_string(), uuid.to_string()));
        }
        if let Some(ref v) = self.status {
            pairs.push(("status".to_string(), v.clone()));
        }
        if let Some(v) = self.bag_valid {
            pairs.push(("bag_valid".to_string(), v.to_string()));
        }
        if let Some(v) = self.fixity_accept {
            pairs.push(("fixity_accept".to_string(), v.to_string()));
        }
        if let Some(v) = self.page {
            pairs.push(("page".to_string(), v.to_string()));
        }
        if let Some(v) = self.page_size {
            pairs.push(("page_size".to_string(), v.to_string()));
        }
        pairs
    }
}
