//! Peer registry synchronization.
//!
//! Pulls each peer's authoritative records (bags it administers,
//! transfers it originated) into the local registry incrementally,
//! using the peer node record's last-pull date as the watermark. The
//! watermark only advances after every entity kind drained cleanly, so
//! a partial failure replays the same window next time. Upserts make
//! the replay harmless. One writer per peer.

use crate::error::{CourierError, Result};
use crate::registry::models::{ListParams, Node};
use crate::registry::{Registry, RemoteClientPool};
use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use std::collections::HashSet;
use std::sync::Arc;
use tracing::{error, info};

#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct SyncCounts {
    pub bags: usize,
    pub replications: usize,
    pub restores: usize,
}

#[derive(Debug, Default)]
pub struct SyncReport {
    pub peers_synced: usize,
    pub peers_failed: usize,
    pub counts: SyncCounts,
}

pub struct RegistrySynchronizer {
    local: Arc<dyn Registry>,
    remotes: Arc<RemoteClientPool>,
    local_node: String,
    in_flight: Mutex<HashSet<String>>,
}

impl RegistrySynchronizer {
    pub fn new(local: Arc<dyn Registry>, remotes: Arc<RemoteClientPool>, local_node: &str) -> Self {
        Self {
            local,
            remotes,
            local_node: local_node.to_string(),
            in_flight: Mutex::new(HashSet::new()),
        }
    }

    /// Syncs every peer known to the local registry. One peer's failure
    /// does not stop the others.
    pub async fn sync_all(&self) -> Result<SyncReport> {
        let mut report = SyncReport::default();
        let mut page = Some(1u32);
        let mut peers: Vec<Node> = Vec::new();
        while let Some(current) = page {
            let response = self
                .local
                .list_nodes(&ListParams {
                    page: Some(current),
                    ..Default::default()
                })
                .await?;
            peers.extend(response.results);
            page = response.next.map(|_| current + 1);
        }

        for peer in peers {
            if peer.namespace == self.local_node {
                continue;
            }
            match self.sync_peer(&peer.namespace).await {
                Ok(counts) => {
                    report.peers_synced += 1;
                    report.counts.bags += counts.bags;
                    report.counts.replications += counts.replications;
                    report.counts.restores += counts.restores;
                }
                Err(e) => {
                    report.peers_failed += 1;
                    error!("sync of {} failed: {}", peer.namespace, e);
                }
            }
        }
        Ok(report)
    }

    /// Pulls one peer. Fails without advancing the watermark when any
    /// entity kind fails to drain.
    pub async fn sync_peer(&self, namespace: &str) -> Result<SyncCounts> {
        {
            let mut in_flight = self.in_flight.lock();
            if !in_flight.insert(namespace.to_string()) {
                return Err(CourierError::Conflict(format!(
                    "sync of {} already running",
                    namespace
                )));
            }
        }
        let result = self.sync_peer_inner(namespace).await;
        self.in_flight.lock().remove(namespace);
        result
    }

    async fn sync_peer_inner(&self, namespace: &str) -> Result<SyncCounts> {
        let peer_node = self.local.get_node(namespace).await?;
        let after = peer_node.last_pull_date;
        let started_at = Utc::now();
        let client = self.remotes.client_for(namespace).await?;

        let mut counts = SyncCounts::default();
        counts.bags = self.pull_bags(&client, namespace, after).await?;
        counts.replications = self.pull_replications(&client, namespace, after).await?;
        counts.restores = self.pull_restores(&client, namespace, after).await?;

        // All three kinds drained; move the watermark to when this pull
        // began so nothing written during it is skipped next time.
        let mut node = self.local.get_node(namespace).await?;
        node.last_pull_date = started_at;
        self.local.update_node(&node).await?;
        info!(
            "synced {}: {} bags, {} replications, {} restores",
            namespace, counts.bags, counts.replications, counts.restores
        );
        Ok(counts)
    }

    async fn pull_bags(
        &self,
        client: &Arc<dyn Registry>,
        namespace: &str,
        after: DateTime<Utc>,
    ) -> Result<usize> {
        let mut pulled = 0;
        let mut page = Some(1u32);
        while let Some(current) = page {
            let response = client
                .list_bags(&ListParams {
                    after: Some(after),
                    admin_node: Some(namespace.to_string()),
                    page: Some(current),
                    ..Default::default()
                })
                .await?;
            for bag in &response.results {
                match self.local.get_bag(bag.uuid).await {
                    Ok(_) => {
                        self.local.update_bag(bag).await?;
                    }
                    Err(CourierError::NotFound(_)) => {
                        match self.local.create_bag(bag).await {
                            Ok(_) => {}
                            Err(CourierError::Conflict(_)) => {
                                self.local.update_bag(bag).await?;
                            }
                            Err(e) => return Err(e),
                        }
                    }
                    Err(e) => return Err(e),
                }
                pulled += 1;
            }
            page = response.next.map(|_| current + 1);
        }
        Ok(pulled)
    }

    async fn pull_replications(
        &self,
        client: &Arc<dyn Registry>,
        namespace: &str,
        after: DateTime<Utc>,
    ) -> Result<usize> {
        let mut pulled = 0;
        let mut page = Some(1u32);
        while let Some(current) = page {
            let response = client
                .list_replications(&ListParams {
                    after: Some(after),
                    from_node: Some(namespace.to_string()),
                    page: Some(current),
                    ..Default::default()
                })
                .await?;
            for transfer in &response.results {
                match self.local.get_replication(transfer.replication_id).await {
                    Ok(_) => {
                        self.local.update_replication(transfer).await?;
                    }
                    Err(CourierError::NotFound(_)) => {
                        match self.local.create_replication(transfer).await {
                            Ok(_) => {}
                            Err(CourierError::Conflict(_)) => {
                                self.local.update_replication(transfer).await?;
                            }
                            Err(e) => return Err(e),
                        }
                    }
                    Err(e) => return Err(e),
                }
                pulled += 1;
            }
            page = response.next.map(|_| current + 1);
        }
        Ok(pulled)
    }

    async fn pull_restores(
        &self,
        client: &Arc<dyn Registry>,
        namespace: &str,
        after: DateTime<Utc>,
    ) -> Result<usize> {
        let mut pulled = 0;
        let mut page = Some(1u32);
        while let Some(current) = page {
            let response = client
                .list_restores(&ListParams {
                    after: Some(after),
                    from_node: Some(namespace.to_string()),
                    page: Some(current),
                    ..Default::default()
                })
                .await?;
            for transfer in &response.results {
                match self.local.get_restore(transfer.restore_id).await {
                    Ok(_) => {
                        self.local.update_restore(transfer).await?;
                    }
                    Err(CourierError::NotFound(_)) => match self.local.create_restore(transfer).await
                    {
                        Ok(_) => {}
                        Err(CourierError::Conflict(_)) => {
                            self.local.update_restore(transfer).await?;
                        }
                        Err(e) => return Err(e),
                    },
                    Err(e) => return Err(e),
                }
                pulled += 1;
            }
            page = response.next.map(|_| current + 1);
        }
        Ok(pulled)
    }
}
