// Node service main entry point.
mod observability;

use anyhow::{Context, Result};
use ember_connect::assign::RendezvousAssigner;
use ember_connect::memory::MemoryBackend;
use ember_connect::operations::OperationsBus;
use ember_connect::{ConnectOptions, LocalCluster, Node, TenantRegistry};
use node::{config, seed};
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

const SHUTDOWN_TIMEOUT: Duration = Duration::from_secs(5);

#[tokio::main]
async fn main() -> Result<()> {
    run_with_shutdown(async {
        let _ = tokio::signal::ctrl_c().await;
    })
    .await
}

async fn run_with_shutdown<F>(shutdown: F) -> Result<()>
where
    F: Future<Output = ()> + Send + 'static,
{
    let metrics_handle = observability::init_observability()?;
    let config = config::NodeConfig::from_env_or_yaml()?;

    // Dev cluster: every configured node runs in this process over shared
    // in-memory collaborators.
    let backend = MemoryBackend::new();
    let seeded = match &config.tenants_file {
        Some(path) => seed::load_tenants(path)?,
        None => Vec::new(),
    };
    for tenant in &seeded {
        backend.tenants.insert(tenant.clone());
    }
    tracing::info!(tenants = seeded.len(), "tenant store seeded");

    // Expose Prometheus metrics on the configured bind address.
    let metrics_bind = config.metrics_bind;
    let metrics_task = tokio::spawn(async move {
        if let Err(err) = observability::serve_metrics(metrics_handle, metrics_bind).await {
            tracing::warn!(error = %err, "metrics listener exited");
        }
    });

    let registry = TenantRegistry::new();
    let cluster = Arc::new(LocalCluster::new());
    let operations = OperationsBus::new();
    let assigner = Arc::new(RendezvousAssigner::new(config.cluster_nodes.clone()));
    let settings = config.connect_settings();
    let nodes: Vec<Arc<Node>> = config
        .cluster_nodes
        .iter()
        .map(|node_id| {
            let node = Arc::new(
                Node::new(
                    node_id.clone(),
                    settings,
                    registry.clone(),
                    backend.collaborators(assigner.clone()),
                    cluster.clone(),
                )
                .with_operations(operations.clone()),
            );
            cluster.join(&node);
            node
        })
        .collect();
    let local = cluster
        .node(&config.node_id)
        .context("local node missing from cluster")?;
    tracing::info!(node = %local.id(), cluster = nodes.len(), "ember node started");

    // Warm a connection for every seeded tenant through the router.
    for tenant in seeded {
        let local = Arc::clone(&local);
        tokio::spawn(async move {
            match local
                .lookup_or_start_connection(&tenant.tenant_id, ConnectOptions::default())
                .await
            {
                Ok(conn) => tracing::info!(
                    tenant_id = %tenant.tenant_id,
                    node = %conn.node(),
                    connection_id = %conn.id(),
                    "tenant connection ready"
                ),
                Err(err) => tracing::warn!(
                    tenant_id = %tenant.tenant_id,
                    error = %err,
                    "tenant connection failed"
                ),
            }
        });
    }

    // Block until SIGINT so the process stays alive.
    shutdown.await;
    for node in &nodes {
        node.shutdown_all(SHUTDOWN_TIMEOUT).await;
    }
    metrics_task.abort();
    tracing::info!("ember node stopped");
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use serial_test::serial;
    use std::io::Write;

    struct EnvGuard {
        key: &'static str,
        prev: Option<String>,
    }

    impl EnvGuard {
        fn set(key: &'static str, value: &str) -> Self {
            let prev = std::env::var(key).ok();
            unsafe {
                std::env::set_var(key, value);
            }
            Self { key, prev }
        }

        fn unset(key: &'static str) -> Self {
            let prev = std::env::var(key).ok();
            unsafe {
                std::env::remove_var(key);
            }
            Self { key, prev }
        }
    }

    impl Drop for EnvGuard {
        fn drop(&mut self) {
            match &self.prev {
                Some(value) => unsafe {
                    std::env::set_var(self.key, value);
                },
                None => unsafe {
                    std::env::remove_var(self.key);
                },
            }
        }
    }

    #[tokio::test]
    #[serial]
    async fn run_with_shutdown_without_tenants() -> Result<()> {
        let _g1 = EnvGuard::set("EMBER_METRICS_BIND", "127.0.0.1:0");
        let _g2 = EnvGuard::unset("EMBER_TENANTS_FILE");
        let _g3 = EnvGuard::unset("EMBER_NODE_CONFIG");
        let _g4 = EnvGuard::unset("EMBER_CLUSTER_NODES");
        run_with_shutdown(async {}).await?;
        Ok(())
    }

    #[tokio::test]
    #[serial]
    async fn run_with_shutdown_warms_seeded_tenants() -> Result<()> {
        let mut file = tempfile::NamedTempFile::new()?;
        writeln!(file, "tenants:\n  - tenant_id: acme\n  - tenant_id: globex")?;
        let path = file.path().to_string_lossy().to_string();
        let _g1 = EnvGuard::set("EMBER_METRICS_BIND", "127.0.0.1:0");
        let _g2 = EnvGuard::set("EMBER_TENANTS_FILE", &path);
        let _g3 = EnvGuard::unset("EMBER_NODE_CONFIG");
        let _g4 = EnvGuard::set("EMBER_NODE_ID", "node-1");
        let _g5 = EnvGuard::set("EMBER_CLUSTER_NODES", "node-1,node-2");
        run_with_shutdown(async {
            tokio::time::sleep(Duration::from_millis(100)).await;
        })
        .await?;
        Ok(())
    }

    #[tokio::test]
    #[serial]
    async fn run_with_shutdown_rejects_missing_tenants_file() {
        let _g1 = EnvGuard::set("EMBER_METRICS_BIND", "127.0.0.1:0");
        let _g2 = EnvGuard::set("EMBER_TENANTS_FILE", "/nonexistent/tenants.yaml");
        let _g3 = EnvGuard::unset("EMBER_NODE_CONFIG");
        let err = run_with_shutdown(async {})
            .await
            .expect_err("missing tenants file");
        assert!(err.to_string().contains("tenants file"));
    }
}
