// Remote-call seam between nodes, plus the in-process implementation.
use crate::config::ConnectOptions;
use crate::error::{ConnectError, RpcError};
use crate::handle::ConnectionHandle;
use crate::node::Node;
use async_trait::async_trait;
use ember_common::ids::NodeId;
use parking_lot::RwLock;
use std::collections::HashMap;
use std::sync::{Arc, Weak};

/// Transport used to ask another node to run `connect` for a tenant.
///
/// Implementations report transport problems as [`RpcError`]; the router
/// bounds every call with its own timeout.
#[async_trait]
pub trait NodeClient: Send + Sync {
    async fn connect(
        &self,
        node: &NodeId,
        tenant_id: &str,
        options: ConnectOptions,
    ) -> Result<ConnectionHandle, ConnectError>;
}

/// Nodes sharing one process. Holds weak references so a dropped node
/// reads as down.
#[derive(Debug, Default)]
pub struct LocalCluster {
    nodes: RwLock<HashMap<NodeId, Weak<Node>>>,
}

impl LocalCluster {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn join(&self, node: &Arc<Node>) {
        tracing::debug!(node = %node.id(), "node joined local cluster");
        self.nodes
            .write()
            .insert(node.id().clone(), Arc::downgrade(node));
    }

    pub fn leave(&self, node: &NodeId) -> bool {
        self.nodes.write().remove(node).is_some()
    }

    pub fn node(&self, node: &NodeId) -> Option<Arc<Node>> {
        self.nodes.read().get(node).and_then(Weak::upgrade)
    }

    pub fn node_ids(&self) -> Vec<NodeId> {
        let mut ids: Vec<_> = self.nodes.read().keys().cloned().collect();
        ids.sort();
        ids
    }
}

#[async_trait]
impl NodeClient for LocalCluster {
    async fn connect(
        &self,
        node: &NodeId,
        tenant_id: &str,
        options: ConnectOptions,
    ) -> Result<ConnectionHandle, ConnectError> {
        let Some(target) = self.node(node) else {
            return Err(ConnectError::Rpc(RpcError::NodeDown(node.clone())));
        };
        target.connect(tenant_id, options).await
    }
}
