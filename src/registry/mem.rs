//! In-process registry used by tests and local development.
//!
//! Semantics match a real record service: create rejects duplicates,
//! update rejects unknown identifiers, list honors the same filters and
//! pagination contract as the HTTP client.

use super::models::{
    Bag, ListParams, ListResponse, Node, ReplicationTransfer, RestoreTransfer,
};
use super::Registry;
use crate::error::{CourierError, Result};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use dashmap::DashMap;
use uuid::Uuid;

const DEFAULT_PAGE_SIZE: u32 = 100;

pub struct MemRegistry {
    namespace: String,
    nodes: DashMap<String, Node>,
    bags: DashMap<Uuid, Bag>,
    replications: DashMap<Uuid, ReplicationTransfer>,
    restores: DashMap<Uuid, RestoreTransfer>,
}

impl MemRegistry {
    pub fn new(namespace: &str) -> Self {
        Self {
            namespace: namespace.to_string(),
            nodes: DashMap::new(),
            bags: DashMap::new(),
            replications: DashMap::new(),
            restores: DashMap::new(),
        }
    }

    /// Seeds a node descriptor directly, bypassing update semantics.
    pub fn put_node(&self, node: Node) {
        self.nodes.insert(node.namespace.clone(), node);
    }

    pub fn bag_count(&self) -> usize {
        self.bags.len()
    }

    pub fn replication_count(&self) -> usize {
        self.replications.len()
    }
}

fn paginate<T: Clone>(mut items: Vec<(DateTime<Utc>, T)>, params: &ListParams) -> ListResponse<T> {
    items.sort_by_key(|(updated, _)| *updated);
    let count = items.len() as u64;
    let page_size = params.page_size.unwrap_or(DEFAULT_PAGE_SIZE) as usize;
    let page = params.page.unwrap_or(1).max(1) as usize;
    let start = (page - 1) * page_size;
    let results: Vec<T> = items
        .into_iter()
        .skip(start)
        .take(page_size)
        .map(|(_, item)| item)
        .collect();
    let has_more = (start + results.len()) < count as usize;
    ListResponse {
        count,
        next: has_more.then(|| format!("page={}", page + 1)),
        previous: (page > 1).then(|| format!("page={}", page - 1)),
        results,
    }
}

#[async_trait]
impl Registry for MemRegistry {
    fn namespace(&self) -> &str {
        &self.namespace
    }

    async fn get_node(&self, namespace: &str) -> Result<Node> {
        self.nodes
            .get(namespace)
            .map(|n| n.clone())
            .ok_or_else(|| CourierError::NotFound(format!("node {}", namespace)))
    }

    async fn list_nodes(&self, params: &ListParams) -> Result<ListResponse<Node>> {
        let items: Vec<(DateTime<Utc>, Node)> = self
            .nodes
            .iter()
            .map(|n| (n.last_pull_date, n.clone()))
            .collect();
        Ok(paginate(items, params))
    }

    async fn update_node(&self, node: &Node) -> Result<Node> {
        if !self.nodes.contains_key(&node.namespace) {
            return Err(CourierError::NotFound(format!("node {}", node.namespace)));
        }
        self.nodes.insert(node.namespace.clone(), node.clone());
        Ok(node.clone())
    }

    async fn get_bag(&self, uuid: Uuid) -> Result<Bag> {
        self.bags
            .get(&uuid)
            .map(|b| b.clone())
            .ok_or_else(|| CourierError::NotFound(format!("bag {}", uuid)))
    }

    async fn list_bags(&self, params: &ListParams) -> Result<ListResponse<Bag>> {
        let items: Vec<(DateTime<Utc>, Bag)> = self
            .bags
            .iter()
            .filter(|b| {
                params
                    .admin_node
                    .as_ref()
                    .is_none_or(|n| &b.admin_node == n)
                    && params.after.is_none_or(|after| b.updated_at > after)
                    && params.uuid.is_none_or(|u| b.uuid == u)
            })
            .map(|b| (b.updated_at, b.clone()))
            .collect();
        Ok(paginate(items, params))
    }

    async fn create_bag(&self, bag: &Bag) -> Result<Bag> {
        if self.bags.contains_key(&bag.uuid) {
            return Err(CourierError::Conflict(format!("bag {}", bag.uuid)));
        }
        self.bags.insert(bag.uuid, bag.clone());
        Ok(bag.clone())
    }

    async fn update_bag(&self, bag: &Bag) -> Result<Bag> {
        if !self.bags.contains_key(&bag.uuid) {
            return Err(CourierError::NotFound(format!("bag {}", bag.uuid)));
        }
        self.bags.insert(bag.uuid, bag.clone());
        Ok(bag.clone())
    }

    async fn get_replication(&self, id: Uuid) -> Result<ReplicationTransfer> {
        self.replications
            .get(&id)
            .map(|t| t.clone())
            .ok_or_else(|| CourierError::NotFound(format!("replication {}", id)))
    }

    async fn list_replications(
        &self,
        params: &ListParams,
    ) -> Result<ListResponse<ReplicationTransfer>> {
        let items: Vec<(DateTime<Utc>, ReplicationTransfer)> = self
            .replications
            .iter()
            .filter(|t| {
                params.from_node.as_ref().is_none_or(|n| &t.from_node == n)
                    && params.to_node.as_ref().is_none_or(|n| &t.to_node == n)
                    && params.uuid.is_none_or(|u| t.uuid == u)
                    && params
                        .status
                        .as_ref()
                        .is_none_or(|s| &t.status.to_string() == s)
                    && params.after.is_none_or(|after| t.updated_at > after)
                    && params.bag_valid.is_none_or(|v| t.bag_valid == Some(v))
                    && params
                        .fixity_accept
                        .is_none_or(|v| t.fixity_accept == Some(v))
            })
            .map(|t| (t.updated_at, t.clone()))
            .collect();
        Ok(paginate(items, params))
    }

    async fn create_replication(
        &self,
        transfer: &ReplicationTransfer,
    ) -> Result<ReplicationTransfer> {
        if self.replications.contains_key(&transfer.replication_id) {
            return Err(CourierError::Conflict(format!(
                "replication {}",
                transfer.replication_id
            )));
        }
        self.replications
            .insert(transfer.replication_id, transfer.clone());
        Ok(transfer.clone())
    }

    async fn update_replication(
        &self,
        transfer: &ReplicationTransfer,
    ) -> Result<ReplicationTransfer> {
        if !self.replications.contains_key(&transfer.replication_id) {
            return Err(CourierError::NotFound(format!(
                "replication {}",
                transfer.replication_id
            )));
        }
        self.replications
            .insert(transfer.replication_id, transfer.clone());
        Ok(transfer.clone())
    }

    async fn get_restore(&self, id: Uuid) -> Result<RestoreTransfer> {
        self.restores
            .get(&id)
            .map(|t| t.clone())
            .ok_or_else(|| CourierError::NotFound(format!("restore {}", id)))
    }

    async fn list_restores(&self, params: &ListParams) -> Result<ListResponse<RestoreTransfer>> {
        let items: Vec<(DateTime<Utc>, RestoreTransfer)> = self
            .restores
            .iter()
            .filter(|t| {
                params.from_node.as_ref().is_none_or(|n| &t.from_node == n)
                    && params.to_node.as_ref().is_none_or(|n| &t.to_node == n)
                    && params.uuid.is_none_or(|u| t.uuid == u)
                    && params.after.is_none_or(|after| t.updated_at > after)
            })
            .map(|t| (t.updated_at, t.clone()))
            .collect();
        Ok(paginate(items, params))
    }

    async fn create_restore(&self, transfer: &RestoreTransfer) -> Result<RestoreTransfer> {
        if self.restores.contains_key(&transfer.restore_id) {
            return Err(CourierError::Conflict(format!(
                "restore {}",
                transfer.restore_id
            )));
        }
        self.restores.insert(transfer.restore_id, transfer.clone());
        Ok(transfer.clone())
    }

    async fn update_restore(&self, transfer: &RestoreTransfer) -> Result<RestoreTransfer> {
        if !self.restores.contains_key(&transfer.restore_id) {
            return Err(CourierError::NotFound(format!(
                "restore {}",
                transfer.restore_id
            )));
        }
        self.restores.insert(transfer.restore_id, transfer.clone());
        Ok(transfer.clone())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::registry::models::{BagType, ReplicationStatus};
    use chrono::TimeZone;
    use std::collections::BTreeMap;

    fn sample_bag(admin: &str, updated: DateTime<Utc>) -> Bag {
        let uuid = Uuid::new_v4();
        Bag {
            uuid,
            local_id: "example.edu/sample".into(),
            size: 686,
            first_version_uuid: uuid,
            version: 1,
            ingest_node: admin.into(),
            admin_node: admin.into(),
            bag_type: BagType::Data,
            rights: vec![],
            interpretive: vec![],
            replicating_nodes: vec![],
            fixities: BTreeMap::from([("sha256".to_string(), "00".repeat(32))]),
            member: Some(Uuid::new_v4()),
            created_at: updated,
            updated_at: updated,
        }
    }

    #[tokio::test]
    async fn test_create_rejects_duplicate() {
        let registry = MemRegistry::new("local");
        let bag = sample_bag("local", Utc::now());
        registry.create_bag(&bag).await.unwrap();
        assert!(matches!(
            registry.create_bag(&bag).await,
            Err(CourierError::Conflict(_))
        ));
    }

    #[tokio::test]
    async fn test_list_bags_after_filter() {
        let registry = MemRegistry::new("local");
        let t0 = Utc.with_ymd_and_hms(2018, 1, 1, 0, 0, 0).unwrap();
        let t1 = Utc.with_ymd_and_hms(2018, 6, 1, 0, 0, 0).unwrap();
        registry.create_bag(&sample_bag("peer", t0)).await.unwrap();
        registry.create_bag(&sample_bag("peer", t1)).await.unwrap();

        let all = registry
            .list_bags(&ListParams {
                admin_node: Some("peer".into()),
                ..Default::default()
            })
            .await
            .unwrap();
        assert_eq!(all.count, 2);

        let recent = registry
            .list_bags(&ListParams {
                admin_node: Some("peer".into()),
                after: Some(t0),
                ..Default::default()
            })
            .await
            .unwrap();
        assert_eq!(recent.count, 1);
        assert_eq!(recent.results[0].updated_at, t1);
    }

    #[tokio::test]
    async fn test_pagination_next_marker() {
        let registry = MemRegistry::new("local");
        for i in 0..5 {
            let t = Utc.with_ymd_and_hms(2018, 1, 1 + i, 0, 0, 0).unwrap();
            registry.create_bag(&sample_bag("peer", t)).await.unwrap();
        }
        let page1 = registry
            .list_bags(&ListParams {
                page: Some(1),
                page_size: Some(2),
                ..Default::default()
            })
            .await
            .unwrap();
        assert_eq!(page1.count, 5);
        assert_eq!(page1.results.len(), 2);
        assert!(page1.next.is_some());
        assert!(page1.previous.is_none());

        let page3 = registry
            .list_bags(&ListParams {
                page: Some(3),
                page_size: Some(2),
                ..Default::default()
            })
            .await
            .unwrap();
        assert_eq!(page3.results.len(), 1);
        assert!(page3.next.is_none());
    }

    #[tokio::test]
    async fn test_replication_status_filter_uses_wire_names() {
        let registry = MemRegistry::new("local");
        let bag = sample_bag("local", Utc::now());
        let transfer = ReplicationTransfer {
            replication_id: Uuid::new_v4(),
            from_node: "local".into(),
            to_node: "peer".into(),
            uuid: bag.uuid,
            fixity_algorithm: "sha256".into(),
            fixity_nonce: None,
            fixity_value: None,
            fixity_accept: None,
            bag_valid: None,
            status: ReplicationStatus::Stored,
            protocol: "rsync".into(),
            link: "local:outbound/x.tar".into(),
            created_at: Utc::now(),
            updated_at: Utc::now(),
        };
        registry.create_replication(&transfer).await.unwrap();
        let stored = registry
            .list_replications(&ListParams {
                status: Some("stored".into()),
                uuid: Some(bag.uuid),
                ..Default::default()
            })
            .await
            .unwrap();
        assert_eq!(stored.count, 1);
    }
}
