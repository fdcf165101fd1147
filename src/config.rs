//! Process-wide configuration.
//!
//! The config file is a JSON object mapping environment name ("dev",
//! "demo", "production", ...) to a [`NodeConfig`]. Binaries select a
//! section with `-config=<env>`. Auth tokens left blank in the file are
//! read from the environment at load time.

use crate::error::{CourierError, Result};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Arc;

/// Tag values stamped into bags assembled on this node.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct DefaultMetadata {
    #[serde(default)]
    pub bagit_version: String,
    #[serde(default)]
    pub bagit_encoding: String,
    #[serde(default)]
    pub ingest_node_name: String,
    #[serde(default)]
    pub ingest_node_address: String,
    #[serde(default)]
    pub ingest_node_contact_name: String,
    #[serde(default)]
    pub ingest_node_contact_email: String,
}

/// Connection settings for the local record service.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct RestClientConfig {
    pub local_service_url: String,
    pub local_api_root: String,
    /// Blank means "read from COURIER_LOCAL_TOKEN".
    #[serde(default)]
    pub local_auth_token: String,
}

fn default_replicate_to() -> usize {
    2
}

fn default_workers() -> usize {
    4
}

fn default_network_connections() -> usize {
    8
}

fn default_max_attempts() -> u32 {
    5
}

fn default_retry_delay_secs() -> u64 {
    300
}

fn default_disk_wait_delay_secs() -> u64 {
    3600
}

fn default_staging_capacity() -> u64 {
    // 500 GB
    500 * 1024 * 1024 * 1024
}

fn default_queue_visibility_secs() -> u64 {
    600
}

fn default_deposit_dir() -> PathBuf {
    PathBuf::from("./deposits")
}

fn default_log_level() -> String {
    "info".to_string()
}

fn default_true() -> bool {
    true
}

/// One node's complete configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NodeConfig {
    /// This node's namespace in the preservation network.
    pub local_node: String,

    // Logging
    #[serde(default)]
    pub log_directory: String,
    #[serde(default = "default_log_level")]
    pub log_level: String,
    #[serde(default = "default_true")]
    pub log_to_stderr: bool,

    // Replication policy
    #[serde(default = "default_replicate_to")]
    pub replicate_to_num_nodes: usize,

    /// Testing only. Never enable against production peers.
    #[serde(default)]
    pub accept_invalid_ssl_certs: bool,
    #[serde(default)]
    pub use_ssh_with_rsync: bool,

    #[serde(default)]
    pub default_metadata: DefaultMetadata,
    pub rest_client: RestClientConfig,

    /// Peer namespace -> auth token. Environment variables
    /// COURIER_TOKEN_<NAMESPACE> override entries here.
    #[serde(default)]
    pub remote_node_tokens: HashMap<String, String>,
    /// Peer namespace -> API root, overriding the URL in the peer's
    /// registry record.
    #[serde(default)]
    pub remote_node_urls: HashMap<String, String>,
    /// Peer namespace -> Authorization format string. Default "token %s";
    /// some peers want "Token token=%s".
    #[serde(default)]
    pub auth_token_header_formats: HashMap<String, String>,

    // Filesystem layout
    pub dpn_home: PathBuf,
    /// Where the deposit layer leaves assembled bag trees.
    #[serde(default = "default_deposit_dir")]
    pub deposit_dir: PathBuf,
    pub staging_dir: PathBuf,
    pub trouble_dir: PathBuf,
    pub queue_dir: PathBuf,
    pub object_store_root: PathBuf,
    #[serde(default)]
    pub object_store_bucket: String,
    pub event_store_path: PathBuf,
    pub work_item_dir: PathBuf,

    #[serde(default = "default_staging_capacity")]
    pub staging_capacity_bytes: u64,
    #[serde(default = "default_queue_visibility_secs")]
    pub queue_visibility_secs: u64,

    /// Depositor institution -> member identifier, for package records
    /// that arrive without one.
    #[serde(default)]
    pub members: HashMap<String, uuid::Uuid>,

    // Worker sizing
    #[serde(default = "default_workers")]
    pub workers: usize,
    #[serde(default = "default_network_connections")]
    pub network_connections: usize,

    // Retry policy
    #[serde(default = "default_max_attempts")]
    pub max_attempts: u32,
    #[serde(default = "default_retry_delay_secs")]
    pub retry_delay_secs: u64,
    #[serde(default = "default_disk_wait_delay_secs")]
    pub disk_wait_delay_secs: u64,
}

pub const DEFAULT_TOKEN_FORMAT: &str = "token %s";

impl NodeConfig {
    /// Loads the named environment section from a JSON config file.
    pub fn load(path: &Path, environment: &str) -> Result<Self> {
        let raw = fs::read_to_string(path).map_err(|e| {
            CourierError::Config(format!("cannot read {}: {}", path.display(), e))
        })?;
        let mut environments: HashMap<String, NodeConfig> = serde_json::from_str(&raw)
            .map_err(|e| {
                CourierError::Config(format!("cannot parse {}: {}", path.display(), e))
            })?;
        let mut config = environments.remove(environment).ok_or_else(|| {
            CourierError::Config(format!(
                "no environment '{}' in {}",
                environment,
                path.display()
            ))
        })?;
        config.apply_env_overrides();
        config.validate()?;
        Ok(config)
    }

    fn apply_env_overrides(&mut self) {
        if self.rest_client.local_auth_token.is_empty() {
            if let Ok(token) = std::env::var("COURIER_LOCAL_TOKEN") {
                self.rest_client.local_auth_token = token;
            }
        }
        let namespaces: Vec<String> = self.remote_node_tokens.keys().cloned().collect();
        for ns in namespaces {
            let var = format!("COURIER_TOKEN_{}", ns.to_uppercase().replace('-', "_"));
            if let Ok(token) = std::env::var(&var) {
                self.remote_node_tokens.insert(ns, token);
            }
        }
    }

    fn validate(&self) -> Result<()> {
        if self.local_node.is_empty() {
            return Err(CourierError::Config("local_node must be set".into()));
        }
        if self.rest_client.local_service_url.is_empty() {
            return Err(CourierError::Config(
                "rest_client.local_service_url must be set".into(),
            ));
        }
        if self.replicate_to_num_nodes == 0 {
            return Err(CourierError::Config(
                "replicate_to_num_nodes must be at least 1".into(),
            ));
        }
        Ok(())
    }

    /// Auth token for a peer, if configured.
    pub fn token_for(&self, namespace: &str) -> Option<&str> {
        self.remote_node_tokens
            .get(namespace)
            .map(String::as_str)
            .filter(|t| !t.is_empty())
    }

    /// Authorization format string for a peer.
    pub fn token_format_for(&self, namespace: &str) -> &str {
        self.auth_token_header_formats
            .get(namespace)
            .map(String::as_str)
            .unwrap_or(DEFAULT_TOKEN_FORMAT)
    }

    /// Static URL override for a peer, if configured.
    pub fn url_for(&self, namespace: &str) -> Option<&str> {
        self.remote_node_urls
            .get(namespace)
            .map(String::as_str)
            .filter(|u| !u.is_empty())
    }

    /// Outbound drop directory for replication toward `to_node`.
    pub fn outbound_dir(&self, to_node: &str) -> PathBuf {
        self.dpn_home
            .join(format!("dpn.{}", to_node))
            .join("outbound")
    }
}

/// Loads config for a binary from `-config=<env>` and optional
/// `-file=<path>` (default `config.json`) arguments.
pub fn load_from_args<I: Iterator<Item = String>>(args: I) -> Result<NodeConfig> {
    let mut environment: Option<String> = None;
    let mut file = "config.json".to_string();
    for arg in args {
        if let Some(env) = arg.strip_prefix("-config=") {
            environment = Some(env.to_string());
        } else if let Some(path) = arg.strip_prefix("-file=") {
            file = path.to_string();
        }
    }
    let environment = environment
        .ok_or_else(|| CourierError::Config("usage: -config=<environment> [-file=<path>]".into()))?;
    NodeConfig::load(Path::new(&file), &environment)
}

/// Initializes tracing for a binary from the loaded config.
pub fn init_logging(config: &NodeConfig) -> Result<()> {
    let level = match config.log_level.to_lowercase().as_str() {
        "trace" => tracing::Level::TRACE,
        "debug" => tracing::Level::DEBUG,
        "info" => tracing::Level::INFO,
        "warn" | "warning" => tracing::Level::WARN,
        "error" => tracing::Level::ERROR,
        other => {
            return Err(CourierError::Config(format!(
                "unknown log level '{}'",
                other
            )))
        }
    };

    if config.log_to_stderr || config.log_directory.is_empty() {
        tracing_subscriber::fmt()
            .with_target(false)
            .with_thread_ids(true)
            .with_max_level(level)
            .with_writer(std::io::stderr)
            .init();
    } else {
        fs::create_dir_all(&config.log_directory)?;
        let file = fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(Path::new(&config.log_directory).join("courier.log"))?;
        tracing_subscriber::fmt()
            .with_target(false)
            .with_thread_ids(true)
            .with_ansi(false)
            .with_max_level(level)
            .with_writer(Arc::new(file))
            .init();
    }
    Ok(())
}
