// A cluster node: local manager bookkeeping plus the public entry points.
use crate::cluster::NodeClient;
use crate::config::{ConnectOptions, ConnectSettings};
use crate::counters::TenantCounters;
use crate::error::ConnectError;
use crate::handle::{ConnectionHandle, ManagerHandle};
use crate::interfaces::Collaborators;
use crate::manager::{self, Start};
use crate::operations::OperationsBus;
use crate::registry::{self, TenantRegistry};
use ember_common::ids::NodeId;
use parking_lot::Mutex;
use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;
use std::time::Duration;

/// State shared between a node and the managers it spawned.
pub(crate) struct NodeContext {
    pub(crate) node_id: NodeId,
    pub(crate) settings: ConnectSettings,
    pub(crate) registry: TenantRegistry,
    pub(crate) deps: Collaborators,
    pub(crate) operations: OperationsBus,
    pub(crate) counters: TenantCounters,
    managers: Mutex<HashMap<String, ManagerHandle>>,
}

impl NodeContext {
    pub(crate) fn track_manager(&self, handle: &ManagerHandle) {
        let mut managers = self.managers.lock();
        managers.insert(handle.tenant_id().to_string(), handle.clone());
        metrics::gauge!("ember_tenant_managers").set(managers.len() as f64);
    }

    pub(crate) fn forget_manager(&self, handle: &ManagerHandle) {
        let mut managers = self.managers.lock();
        if managers
            .get(handle.tenant_id())
            .is_some_and(|current| current == handle)
        {
            managers.remove(handle.tenant_id());
        }
        metrics::gauge!("ember_tenant_managers").set(managers.len() as f64);
    }
}

pub struct Node {
    pub(crate) ctx: Arc<NodeContext>,
    pub(crate) cluster: Arc<dyn NodeClient>,
}

impl fmt::Debug for Node {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Node")
            .field("node_id", &self.ctx.node_id)
            .field("managers", &self.ctx.managers.lock().len())
            .finish_non_exhaustive()
    }
}

impl Node {
    pub fn new(
        node_id: NodeId,
        settings: ConnectSettings,
        registry: TenantRegistry,
        deps: Collaborators,
        cluster: Arc<dyn NodeClient>,
    ) -> Self {
        Self {
            ctx: Arc::new(NodeContext {
                node_id,
                settings,
                registry,
                deps,
                operations: OperationsBus::new(),
                counters: TenantCounters::new(),
                managers: Mutex::new(HashMap::new()),
            }),
            cluster,
        }
    }

    /// Shares an operations bus with other nodes of the same process, so a
    /// suspend published anywhere reaches the owning manager.
    pub fn with_operations(mut self, operations: OperationsBus) -> Self {
        if let Some(ctx) = Arc::get_mut(&mut self.ctx) {
            ctx.operations = operations;
        }
        self
    }

    pub fn id(&self) -> &NodeId {
        &self.ctx.node_id
    }

    pub fn settings(&self) -> &ConnectSettings {
        &self.ctx.settings
    }

    pub fn registry(&self) -> &TenantRegistry {
        &self.ctx.registry
    }

    pub fn operations(&self) -> &OperationsBus {
        &self.ctx.operations
    }

    pub fn counters(&self) -> &TenantCounters {
        &self.ctx.counters
    }

    /// Non-blocking registry probe.
    ///
    /// - `Ok(handle)`: an owner exists and its connection is installed.
    /// - `ConnectionInitializing`: an owner exists but is still connecting.
    /// - `Initializing`: no owner has been started.
    /// - `Unavailable`: the registry itself failed.
    pub fn get_status(&self, tenant_id: &str) -> Result<ConnectionHandle, ConnectError> {
        registry::status(&self.ctx.registry, tenant_id)
    }

    pub fn whereis(&self, tenant_id: &str) -> Option<ManagerHandle> {
        registry::whereis(&self.ctx.registry, tenant_id)
    }

    /// Asks the tenant's owner, wherever it runs, to stop. No-op without one.
    pub fn shutdown(&self, tenant_id: &str) {
        if let Some(owner) = self.whereis(tenant_id) {
            tracing::debug!(tenant_id = %tenant_id, owner = %owner.node(), "shutdown requested");
            owner.shutdown();
        }
    }

    /// Starts (or joins) a manager for the tenant on this node. This is what
    /// the authoritative node runs when a peer forwards a connect.
    pub async fn connect(
        &self,
        tenant_id: &str,
        options: ConnectOptions,
    ) -> Result<ConnectionHandle, ConnectError> {
        let wait = options.rpc_timeout_or(&self.ctx.settings);
        match manager::start(&self.ctx, tenant_id, &options)? {
            Start::Spawned { handle, connected } => match connected.await {
                Ok(result) => result,
                Err(_) => {
                    tracing::warn!(
                        tenant_id = %tenant_id,
                        manager_id = %handle.id(),
                        "connection manager exited before replying"
                    );
                    Err(ConnectError::Crashed(
                        "connection manager exited before replying".to_string(),
                    ))
                }
            },
            Start::Existing(owner) => owner.wait_connected(wait).await,
        }
    }

    pub fn local_managers(&self) -> Vec<ManagerHandle> {
        self.ctx.managers.lock().values().cloned().collect()
    }

    /// Stops every manager running on this node and waits up to `limit`
    /// for them to finish.
    pub async fn shutdown_all(&self, limit: Duration) {
        let managers = self.local_managers();
        for manager in &managers {
            manager.shutdown();
        }
        let deadline = tokio::time::Instant::now() + limit;
        while !self.ctx.managers.lock().is_empty() {
            if tokio::time::Instant::now() >= deadline {
                tracing::warn!(
                    node = %self.ctx.node_id,
                    remaining = self.ctx.managers.lock().len(),
                    "managers still running at shutdown deadline"
                );
                return;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        tracing::info!(node = %self.ctx.node_id, stopped = managers.len(), "node managers stopped");
    }
}
