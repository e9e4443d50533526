#![allow(dead_code)]

use ember_common::Tenant;
use ember_common::ids::NodeId;
use ember_connect::assign::RendezvousAssigner;
use ember_connect::interfaces::NodeAssigner;
use ember_connect::memory::MemoryBackend;
use ember_connect::operations::OperationsBus;
use ember_connect::{
    ConnectSettings, LocalCluster, ManagerHandle, ManagerStatus, Node, NodeClient, TenantRegistry,
};
use std::sync::Arc;
use std::time::Duration;

pub const WAIT: Duration = Duration::from_secs(3);

pub fn settings() -> ConnectSettings {
    ConnectSettings {
        idle_check_interval: Duration::from_secs(60),
        rpc_timeout: Duration::from_secs(2),
        initializing_backoff: Duration::from_millis(10),
        child_shutdown_grace: Duration::from_millis(100),
    }
}

pub fn node_id(name: &str) -> NodeId {
    NodeId::new(name).expect("node id")
}

/// In-process cluster sharing one registry, operations bus and backend.
pub struct Harness {
    pub backend: MemoryBackend,
    pub registry: TenantRegistry,
    pub cluster: Arc<LocalCluster>,
    pub operations: OperationsBus,
    pub assigner: Arc<dyn NodeAssigner>,
    nodes: Vec<Arc<Node>>,
}

impl Harness {
    pub fn new(names: &[&str]) -> Self {
        let ids = names.iter().map(|name| node_id(name)).collect();
        Self::with_assigner(names, Arc::new(RendezvousAssigner::new(ids)))
    }

    pub fn with_assigner(names: &[&str], assigner: Arc<dyn NodeAssigner>) -> Self {
        Self::build(names, assigner, None)
    }

    /// Nodes forward through `client` instead of the local cluster.
    pub fn with_client(
        names: &[&str],
        assigner: Arc<dyn NodeAssigner>,
        client: Arc<dyn NodeClient>,
    ) -> Self {
        Self::build(names, assigner, Some(client))
    }

    fn build(
        names: &[&str],
        assigner: Arc<dyn NodeAssigner>,
        client: Option<Arc<dyn NodeClient>>,
    ) -> Self {
        let backend = MemoryBackend::new();
        let registry = TenantRegistry::new();
        let cluster = Arc::new(LocalCluster::new());
        let operations = OperationsBus::new();
        let nodes = names
            .iter()
            .map(|name| {
                let transport: Arc<dyn NodeClient> = match &client {
                    Some(client) => Arc::clone(client),
                    None => cluster.clone(),
                };
                let node = Arc::new(
                    Node::new(
                        node_id(name),
                        settings(),
                        registry.clone(),
                        backend.collaborators(Arc::clone(&assigner)),
                        transport,
                    )
                    .with_operations(operations.clone()),
                );
                cluster.join(&node);
                node
            })
            .collect();
        Self {
            backend,
            registry,
            cluster,
            operations,
            assigner,
            nodes,
        }
    }

    pub fn node(&self, name: &str) -> &Arc<Node> {
        self.nodes
            .iter()
            .find(|node| node.id().as_str() == name)
            .expect("node in harness")
    }

    pub fn nodes(&self) -> &[Arc<Node>] {
        &self.nodes
    }

    pub fn add_tenant(&self, tenant_id: &str) -> Tenant {
        let tenant = Tenant::new(tenant_id);
        self.backend.tenants.insert(tenant.clone());
        tenant
    }

    pub fn owner_of(&self, tenant_id: &str) -> NodeId {
        self.assigner
            .node_for_tenant(&Tenant::new(tenant_id))
            .expect("assignment")
    }

    pub fn managers_for(&self, tenant_id: &str) -> usize {
        self.nodes
            .iter()
            .flat_map(|node| node.local_managers())
            .filter(|manager| manager.tenant_id() == tenant_id)
            .count()
    }

    pub async fn wait_gone(&self, tenant_id: &str) -> bool {
        let registry = self.registry.clone();
        let tenant_id = tenant_id.to_string();
        eventually(WAIT, move || {
            registry.lookup(&tenant_id).ok().flatten().is_none()
        })
        .await
    }
}

pub async fn eventually(limit: Duration, check: impl Fn() -> bool) -> bool {
    let deadline = tokio::time::Instant::now() + limit;
    loop {
        if check() {
            return true;
        }
        if tokio::time::Instant::now() >= deadline {
            return false;
        }
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
}

pub async fn wait_ready(handle: &ManagerHandle) -> bool {
    eventually(WAIT, || matches!(handle.status(), ManagerStatus::Ready(_))).await
}

pub async fn wait_terminated(handle: &ManagerHandle) -> Option<ManagerStatus> {
    let done = eventually(WAIT, || {
        matches!(handle.status(), ManagerStatus::Terminated(_))
    })
    .await;
    done.then(|| handle.status())
}

/// Polls the registry until some node has claimed the tenant.
pub async fn wait_owner(harness: &Harness, tenant_id: &str) -> Option<ManagerHandle> {
    let deadline = tokio::time::Instant::now() + WAIT;
    loop {
        if let Ok(Some(entry)) = harness.registry.lookup(tenant_id) {
            return Some(entry.owner);
        }
        if tokio::time::Instant::now() >= deadline {
            return None;
        }
        tokio::time::sleep(Duration::from_millis(1)).await;
    }
}
