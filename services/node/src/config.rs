use anyhow::{Context, Result};
use ember_common::ids::NodeId;
use ember_connect::ConnectSettings;
use serde::Deserialize;
use std::fs;
use std::net::SocketAddr;
use std::path::PathBuf;
use std::time::Duration;

// Node service configuration sourced from environment variables.
#[derive(Debug, Clone)]
pub struct NodeConfig {
    // Name of the node this process acts as.
    pub node_id: NodeId,
    // Every node of the cluster, this one included.
    pub cluster_nodes: Vec<NodeId>,
    // Metrics HTTP listener bind address.
    pub metrics_bind: SocketAddr,
    // Period between connected-client samples.
    pub idle_check_interval_ms: u64,
    // Upper bound on a forwarded connect.
    pub rpc_timeout_ms: u64,
    // Pause before retrying a tenant that is still initializing.
    pub initializing_backoff_ms: u64,
    // Grace period for each child when a manager stops.
    pub child_shutdown_grace_ms: u64,
    // Optional YAML file seeding the dev tenant store.
    pub tenants_file: Option<PathBuf>,
}

const DEFAULT_NODE_ID: &str = "node-1";
const DEFAULT_METRICS_BIND: &str = "0.0.0.0:8080";
const DEFAULT_IDLE_CHECK_INTERVAL_MS: u64 = 50_000;
const DEFAULT_RPC_TIMEOUT_MS: u64 = 30_000;
const DEFAULT_INITIALIZING_BACKOFF_MS: u64 = 100;
const DEFAULT_CHILD_SHUTDOWN_GRACE_MS: u64 = 500;

#[derive(Debug, Deserialize)]
struct NodeConfigOverride {
    node_id: Option<String>,
    cluster_nodes: Option<Vec<String>>,
    metrics_bind: Option<String>,
    idle_check_interval_ms: Option<u64>,
    rpc_timeout_ms: Option<u64>,
    initializing_backoff_ms: Option<u64>,
    child_shutdown_grace_ms: Option<u64>,
    tenants_file: Option<PathBuf>,
}

fn env_millis(key: &str, default: u64) -> u64 {
    std::env::var(key)
        .ok()
        .and_then(|value| value.parse::<u64>().ok())
        .filter(|value| *value > 0)
        .unwrap_or(default)
}

fn parse_nodes<'a>(names: impl IntoIterator<Item = &'a str>) -> Result<Vec<NodeId>> {
    names
        .into_iter()
        .map(str::trim)
        .filter(|name| !name.is_empty())
        .map(|name| NodeId::new(name).with_context(|| format!("parse cluster node {name:?}")))
        .collect()
}

impl NodeConfig {
    pub fn from_env() -> Result<Self> {
        let node_id: NodeId = std::env::var("EMBER_NODE_ID")
            .unwrap_or_else(|_| DEFAULT_NODE_ID.to_string())
            .parse()
            .with_context(|| "parse EMBER_NODE_ID")?;
        let cluster_nodes = match std::env::var("EMBER_CLUSTER_NODES") {
            Ok(value) => parse_nodes(value.split(',')).with_context(|| "parse EMBER_CLUSTER_NODES")?,
            Err(_) => Vec::new(),
        };
        let metrics_bind: SocketAddr = std::env::var("EMBER_METRICS_BIND")
            .unwrap_or_else(|_| DEFAULT_METRICS_BIND.to_string())
            .parse()
            .with_context(|| "parse EMBER_METRICS_BIND")?;
        let tenants_file = std::env::var("EMBER_TENANTS_FILE")
            .ok()
            .filter(|value| !value.trim().is_empty())
            .map(PathBuf::from);
        let mut config = Self {
            node_id,
            cluster_nodes,
            metrics_bind,
            idle_check_interval_ms: env_millis(
                "EMBER_IDLE_CHECK_INTERVAL_MS",
                DEFAULT_IDLE_CHECK_INTERVAL_MS,
            ),
            rpc_timeout_ms: env_millis("EMBER_RPC_TIMEOUT_MS", DEFAULT_RPC_TIMEOUT_MS),
            initializing_backoff_ms: env_millis(
                "EMBER_INITIALIZING_BACKOFF_MS",
                DEFAULT_INITIALIZING_BACKOFF_MS,
            ),
            child_shutdown_grace_ms: env_millis(
                "EMBER_CHILD_SHUTDOWN_GRACE_MS",
                DEFAULT_CHILD_SHUTDOWN_GRACE_MS,
            ),
            tenants_file,
        };
        config.normalize_cluster();
        Ok(config)
    }

    pub fn from_env_or_yaml() -> Result<Self> {
        let mut config = Self::from_env()?;
        if let Ok(path) = std::env::var("EMBER_NODE_CONFIG") {
            // YAML overrides allow ops-friendly config files.
            let contents = fs::read_to_string(&path)
                .with_context(|| format!("read EMBER_NODE_CONFIG: {path}"))?;
            let override_cfg: NodeConfigOverride =
                serde_yaml::from_str(&contents).with_context(|| "parse node config yaml")?;
            if let Some(value) = override_cfg.node_id {
                config.node_id = value.parse().with_context(|| "parse node_id")?;
            }
            if let Some(value) = override_cfg.cluster_nodes {
                config.cluster_nodes = parse_nodes(value.iter().map(String::as_str))?;
            }
            if let Some(value) = override_cfg.metrics_bind {
                config.metrics_bind = value.parse().with_context(|| "parse metrics_bind")?;
            }
            if let Some(value) = override_cfg.idle_check_interval_ms
                && value > 0
            {
                config.idle_check_interval_ms = value;
            }
            if let Some(value) = override_cfg.rpc_timeout_ms
                && value > 0
            {
                config.rpc_timeout_ms = value;
            }
            if let Some(value) = override_cfg.initializing_backoff_ms
                && value > 0
            {
                config.initializing_backoff_ms = value;
            }
            if let Some(value) = override_cfg.child_shutdown_grace_ms
                && value > 0
            {
                config.child_shutdown_grace_ms = value;
            }
            if let Some(value) = override_cfg.tenants_file {
                config.tenants_file = Some(value);
            }
            config.normalize_cluster();
        }
        Ok(config)
    }

    pub fn connect_settings(&self) -> ConnectSettings {
        ConnectSettings {
            idle_check_interval: Duration::from_millis(self.idle_check_interval_ms),
            rpc_timeout: Duration::from_millis(self.rpc_timeout_ms),
            initializing_backoff: Duration::from_millis(self.initializing_backoff_ms),
            child_shutdown_grace: Duration::from_millis(self.child_shutdown_grace_ms),
        }
    }

    // The local node is always a cluster member; duplicates are dropped.
    fn normalize_cluster(&mut self) {
        if !self.cluster_nodes.contains(&self.node_id) {
            self.cluster_nodes.push(self.node_id.clone());
        }
        self.cluster_nodes.sort();
        self.cluster_nodes.dedup();
    }
}
