//! HTTP client for one record service instance.
//!
//! One instance talks to exactly one node's registry, local or remote.
//! Connections are pooled and keep-alive; every request carries an
//! `Authorization` header rendered from the peer's configured token
//! format. Instances are cheap to share once built.

use super::models::{
    Bag, ListParams, ListResponse, Node, ReplicationTransfer, RestoreTransfer,
};
use super::Registry;
use crate::error::{CourierError, Result};
use async_trait::async_trait;
use reqwest::{Method, StatusCode};
use serde::de::DeserializeOwned;
use serde::Serialize;
use std::time::Duration;
use uuid::Uuid;

/// Response bodies quoted in errors are capped at this many bytes.
const ERROR_BODY_CAP: usize = 1024;

const CONNECT_TIMEOUT: Duration = Duration::from_secs(10);
const REQUEST_TIMEOUT: Duration = Duration::from_secs(60);
const MAX_IDLE_PER_HOST: usize = 8;

/// Construction parameters for a [`RegistryClient`].
#[derive(Debug, Clone)]
pub struct RegistryConfig {
    pub base_url: String,
    pub api_version: String,
    pub auth_token: String,
    /// Namespace of the node the service belongs to.
    pub namespace: String,
    /// printf-style format with one `%s` for the token.
    pub token_format: String,
    /// Testing only.
    pub accept_invalid_certs: bool,
}

pub struct RegistryClient {
    config: RegistryConfig,
    http: reqwest::Client,
}

impl RegistryClient {
    pub fn new(config: RegistryConfig) -> Result<Self> {
        let http = reqwest::Client::builder()
            .cookie_store(true)
            .pool_max_idle_per_host(MAX_IDLE_PER_HOST)
            .connect_timeout(CONNECT_TIMEOUT)
            .timeout(REQUEST_TIMEOUT)
            .danger_accept_invalid_certs(config.accept_invalid_certs)
            .build()
            .map_err(|e| CourierError::Config(format!("http client: {}", e)))?;
        Ok(Self { config, http })
    }

    /// Composes `<base>/<version>/<relative>` plus an optional query string.
    fn url(&self, relative: &str, query: &[(String, String)]) -> String {
        let base = self.config.base_url.trim_end_matches('/');
        let mut url = format!("{}/{}/{}", base, self.config.api_version, relative);
        if !query.is_empty() {
            let qs: Vec<String> = query
                .iter()
                .map(|(k, v)| format!("{}={}", k, urlencode(v)))
                .collect();
            url.push('?');
            url.push_str(&qs.join("&"));
        }
        url
    }

    fn auth_header(&self) -> String {
        self.config
            .token_format
            .replacen("%s", &self.config.auth_token, 1)
    }

    async fn request<B, T>(
        &self,
        method: Method,
        url: String,
        body: Option<&B>,
        expect: StatusCode,
    ) -> Result<T>
    where
        B: Serialize + ?Sized,
        T: DeserializeOwned,
    {
        let mut req = self
            .http
            .request(method, &url)
            .header("Authorization", self.auth_header())
            .header("Accept", "application/json");
        if let Some(body) = body {
            req = req.json(body);
        }
        let resp = req
            .send()
            .await
            .map_err(|e| CourierError::Transport(format!("{}: {}", url, e)))?;

        let status = resp.status();
        if status == StatusCode::NOT_FOUND {
            return Err(CourierError::NotFound(url));
        }
        if status == StatusCode::CONFLICT {
            return Err(CourierError::Conflict(url));
        }
        if status != expect {
            let body = resp.text().await.unwrap_or_default();
            return Err(CourierError::Registry {
                url,
                status: status.as_u16(),
                body: truncate(&body, ERROR_BODY_CAP),
            });
        }
        // Parse failures are a distinct error class from transport failures.
        let text = resp
            .text()
            .await
            .map_err(|e| CourierError::Transport(format!("{}: {}", url, e)))?;
        serde_json::from_str(&text)
            .map_err(|e| CourierError::Serialization(format!("{}: {}", url, e)))
    }

    async fn get<T: DeserializeOwned>(&self, relative: &str) -> Result<T> {
        self.request::<(), T>(Method::GET, self.url(relative, &[]), None, StatusCode::OK)
            .await
    }

    async fn list<T: DeserializeOwned>(
        &self,
        collection: &str,
        params: &ListParams,
    ) -> Result<ListResponse<T>> {
        let url = self.url(&format!("{}/", collection), &params.to_query());
        self.request::<(), ListResponse<T>>(Method::GET, url, None, StatusCode::OK)
            .await
    }

    async fn create<B: Serialize, T: DeserializeOwned>(
        &self,
        collection: &str,
        body: &B,
    ) -> Result<T> {
        let url = self.url(&format!("{}/", collection), &[]);
        self.request(Method::POST, url, Some(body), StatusCode::CREATED)
            .await
    }

    async fn update<B: Serialize, T: DeserializeOwned>(
        &self,
        relative: &str,
        body: &B,
    ) -> Result<T> {
        let url = self.url(relative, &[]);
        self.request(Method::PUT, url, Some(body), StatusCode::OK)
            .await
    }
}

#[async_trait]
impl Registry for RegistryClient {
    fn namespace(&self) -> &str {
        &self.config.namespace
    }

    async fn get_node(&self, namespace: &str) -> Result<Node> {
        self.get(&format!("node/{}/", namespace)).await
    }

    async fn list_nodes(&self, params: &ListParams) -> Result<ListResponse<Node>> {
        self.list("node", params).await
    }

    async fn update_node(&self, node: &Node) -> Result<Node> {
        self.update(&format!("node/{}/", node.namespace), node).await
    }

    async fn get_bag(&self, uuid: Uuid) -> Result<Bag> {
        self.get(&format!("bag/{}/", uuid)).await
    }

    async fn list_bags(&self, params: &ListParams) -> Result<ListResponse<Bag>> {
        self.list("bag", params).await
    }

    async fn create_bag(&self, bag: &Bag) -> Result<Bag> {
        self.create("bag", bag).await
    }

    async fn update_bag(&self, bag: &Bag) -> Result<Bag> {
        self.update(&format!("bag/{}/", bag.uuid), bag).await
    }

    async fn get_replication(&self, id: Uuid) -> Result<ReplicationTransfer> {
        self.get(&format!("replicate/{}/", id)).await
    }

    async fn list_replications(
        &self,
        params: &ListParams,
    ) -> Result<ListResponse<ReplicationTransfer>> {
        self.list("replicate", params).await
    }

    async fn create_replication(
        &self,
        transfer: &ReplicationTransfer,
    ) -> Result<ReplicationTransfer> {
        self.create("replicate", transfer).await
    }

    async fn update_replication(
        &self,
        transfer: &ReplicationTransfer,
    ) -> Result<ReplicationTransfer> {
        self.update(&format!("replicate/{}/", transfer.replication_id), transfer)
            .await
    }

    async fn get_restore(&self, id: Uuid) -> Result<RestoreTransfer> {
        self.get(&format!("restore/{}/", id)).await
    }

    async fn list_restores(&self, params: &ListParams) -> Result<ListResponse<RestoreTransfer>> {
        self.list("restore", params).await
    }

    async fn create_restore(&self, transfer: &RestoreTransfer) -> Result<RestoreTransfer> {
        self.create("restore", transfer).await
    }

    async fn update_restore(&self, transfer: &RestoreTransfer) -> Result<RestoreTransfer> {
        self.update(&format!("restore/{}/", transfer.restore_id), transfer)
            .await
    }
}

fn truncate(s: &str, cap: usize) -> String {
    if s.len() <= cap {
        s.to_string()
    } else {
        let mut end = cap;
        while !s.is_char_boundary(end) {
            end -= 1;
        }
        format!("{}…", &s[..end])
    }
}

fn urlencode(value: &str) -> String {
    let mut out = String::with_capacity(value.len());
    for byte in value.bytes() {
        match byte {
            b'A'..=b'Z' | b'a'..=b'z' | b'0'..=b'9' | b'-' | b'_' | b'.' | b'~' => {
                out.push(byte as char)
            }
            b' ' => out.push_str("%20"),
            other => out.push_str(&format!("%{:02X}", other)),
        }
    }
    out
}
