//! Per-peer registry clients.
//!
//! The pool resolves a peer's API root from the local registry's node
//! record (static config wins when present), pairs it with the peer's
//! configured token and header format, and caches the built client.
//! Seeded entries let tests stand in any [`Registry`] implementation.

use super::client::{RegistryClient, RegistryConfig};
use super::Registry;
use crate::config::NodeConfig;
use crate::error::{CourierError, Result};
use dashmap::DashMap;
use std::sync::Arc;

pub struct RemoteClientPool {
    local: Arc<dyn Registry>,
    config: Arc<NodeConfig>,
    clients: DashMap<String, Arc<dyn Registry>>,
}

impl RemoteClientPool {
    pub fn new(local: Arc<dyn Registry>, config: Arc<NodeConfig>) -> Self {
        Self {
            local,
            config,
            clients: DashMap::new(),
        }
    }

    /// Pre-populates the pool, bypassing construction. Used by tests and
    /// by processes that already hold a client for a peer.
    pub fn seed(&self, namespace: &str, client: Arc<dyn Registry>) {
        self.clients.insert(namespace.to_string(), client);
    }

    /// Client for the local node's own registry.
    pub fn local(&self) -> Arc<dyn Registry> {
        Arc::clone(&self.local)
    }

    /// Returns a client preconfigured for the peer, building and caching
    /// one on first use.
    pub async fn client_for(&self, namespace: &str) -> Result<Arc<dyn Registry>> {
        if let Some(existing) = self.clients.get(namespace) {
            return Ok(Arc::clone(&existing));
        }

        let base_url = match self.config.url_for(namespace) {
            Some(url) => url.to_string(),
            None => self.local.get_node(namespace).await?.api_root,
        };
        let token = self.config.token_for(namespace).ok_or_else(|| {
            CourierError::Config(format!("no auth token configured for peer {}", namespace))
        })?;

        let client: Arc<dyn Registry> = Arc::new(RegistryClient::new(RegistryConfig {
            base_url,
            api_version: self.config.rest_client.local_api_root.clone(),
            auth_token: token.to_string(),
            namespace: namespace.to_string(),
            token_format: self.config.token_format_for(namespace).to_string(),
            accept_invalid_certs: self.config.accept_invalid_ssl_certs,
        })?);
        self.clients
            .insert(namespace.to_string(), Arc::clone(&client));
        Ok(client)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::registry::mem::MemRegistry;
    use crate::registry::models::{sentinel_pull_date, Node};

    fn test_config() -> NodeConfig {
        let json = r#"{
            "test": {
                "local_node": "local",
                "rest_client": {
                    "local_service_url": "http://localhost:8000",
                    "local_api_root": "api-v1",
                    "local_auth_token": "secret"
                },
                "remote_node_tokens": {"peer-one": "tok1"},
                "remote_node_urls": {"peer-two": "https://override.example.org"},
                "dpn_home": "/tmp/dpn",
                "staging_dir": "/tmp/dpn/staging",
                "trouble_dir": "/tmp/dpn/trouble",
                "queue_dir": "/tmp/dpn/queue",
                "object_store_root": "/tmp/dpn/store",
                "event_store_path": "/tmp/dpn/events.jsonl",
                "work_item_dir": "/tmp/dpn/items"
            }
        }"#;
        let mut environments: std::collections::HashMap<String, NodeConfig> =
            serde_json::from_str(json).unwrap();
        environments.remove("test").unwrap()
    }

    #[tokio::test]
    async fn test_resolves_api_root_from_registry() {
        let local = Arc::new(MemRegistry::new("local"));
        local.put_node(Node {
            namespace: "peer-one".into(),
            name: "Peer One".into(),
            api_root: "https://peer-one.example.org".into(),
            replicate_to: vec![],
            last_pull_date: sentinel_pull_date(),
        });
        let pool = RemoteClientPool::new(local, Arc::new(test_config()));
        let client = pool.client_for("peer-one").await.unwrap();
        assert_eq!(client.namespace(), "peer-one");
        // Cached: a second call does not rebuild.
        let again = pool.client_for("peer-one").await.unwrap();
        assert!(Arc::ptr_eq(&client, &again));
    }

    #[tokio::test]
    async fn test_missing_token_is_config_error() {
        let local = Arc::new(MemRegistry::new("local"));
        local.put_node(Node {
            namespace: "peer-two".into(),
            name: "Peer Two".into(),
            api_root: "https://peer-two.example.org".into(),
            replicate_to: vec![],
            last_pull_date: sentinel_pull_date(),
        });
        let pool = RemoteClientPool::new(local, Arc::new(test_config()));
        assert!(matches!(
            pool.client_for("peer-two").await,
            Err(CourierError::Config(_))
        ));
    }

    #[tokio::test]
    async fn test_seeded_client_wins() {
        let local = Arc::new(MemRegistry::new("local"));
        let pool = RemoteClientPool::new(local, Arc::new(test_config()));
        let fake: Arc<dyn Registry> = Arc::new(MemRegistry::new("peer-nine"));
        pool.seed("peer-nine", Arc::clone(&fake));
        let client = pool.client_for("peer-nine").await.unwrap();
        assert_eq!(client.namespace(), "peer-nine");
    }
}
