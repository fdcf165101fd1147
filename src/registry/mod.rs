//! Access to preservation-network record services.
//!
//! [`Registry`] is the seam every pipeline component talks through: the
//! HTTP-backed [`client::RegistryClient`] implements it for real record
//! services, [`mem::MemRegistry`] implements it in-process for tests and
//! local development, and [`remote::RemoteClientPool`] hands out per-peer
//! preconfigured instances.

pub mod client;
pub mod mem;
pub mod models;
pub mod remote;

use crate::error::Result;
use async_trait::async_trait;
use uuid::Uuid;

pub use client::{RegistryClient, RegistryConfig};
pub use mem::MemRegistry;
pub use models::{
    Bag, BagType, ListParams, ListResponse, Node, ReplicationStatus, ReplicationTransfer,
    RestoreStatus, RestoreTransfer,
};
pub use remote::RemoteClientPool;

/// Typed CRUD over one record service instance.
#[async_trait]
pub trait Registry: Send + Sync {
    /// Namespace of the node this client talks to.
    fn namespace(&self) -> &str;

    async fn get_node(&self, namespace: &str) -> Result<Node>;
    async fn list_nodes(&self, params: &ListParams) -> Result<ListResponse<Node>>;
    async fn update_node(&self, node: &Node) -> Result<Node>;

    async fn get_bag(&self, uuid: Uuid) -> Result<Bag>;
    async fn list_bags(&self, params: &ListParams) -> Result<ListResponse<Bag>>;
    async fn create_bag(&self, bag: &Bag) -> Result<Bag>;
    async fn update_bag(&self, bag: &Bag) -> Result<Bag>;

    async fn get_replication(&self, id: Uuid) -> Result<ReplicationTransfer>;
    async fn list_replications(
        &self,
        params: &ListParams,
    ) -> Result<ListResponse<ReplicationTransfer>>;
    async fn create_replication(
        &self,
        transfer: &ReplicationTransfer,
    ) -> Result<ReplicationTransfer>;
    async fn update_replication(
        &self,
        transfer: &ReplicationTransfer,
    ) -> Result<ReplicationTransfer>;

    async fn get_restore(&self, id: Uuid) -> Result<RestoreTransfer>;
    async fn list_restores(&self, params: &ListParams) -> Result<ListResponse<RestoreTransfer>>;
    async fn create_restore(&self, transfer: &RestoreTransfer) -> Result<RestoreTransfer>;
    async fn update_restore(&self, transfer: &RestoreTransfer) -> Result<RestoreTransfer>;
}
