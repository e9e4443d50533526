// Deterministic tenant-to-node placement.
use crate::error::CollaboratorError;
use crate::interfaces::{CollaboratorResult, NodeAssigner};
use ember_common::Tenant;
use ember_common::ids::NodeId;
use sha2::{Digest, Sha256};

/// Highest-random-weight placement over a fixed node list. Every node with
/// the same list picks the same owner, and removing a node only moves the
/// tenants that node owned.
///
/// ```
/// use ember_common::{Tenant, ids::NodeId};
/// use ember_connect::assign::RendezvousAssigner;
/// use ember_connect::interfaces::NodeAssigner;
///
/// let nodes = vec![NodeId::new("a").unwrap(), NodeId::new("b").unwrap()];
/// let assigner = RendezvousAssigner::new(nodes.clone());
/// let tenant = Tenant::new("acme");
/// let owner = assigner.node_for_tenant(&tenant).unwrap();
/// assert!(nodes.contains(&owner));
/// ```
#[derive(Debug, Clone)]
pub struct RendezvousAssigner {
    nodes: Vec<NodeId>,
}

impl RendezvousAssigner {
    pub fn new(nodes: Vec<NodeId>) -> Self {
        let mut nodes = nodes;
        nodes.sort();
        nodes.dedup();
        Self { nodes }
    }

    pub fn nodes(&self) -> &[NodeId] {
        &self.nodes
    }

    fn weight(node: &NodeId, tenant_id: &str) -> u64 {
        let mut hasher = Sha256::new();
        hasher.update(node.as_str().as_bytes());
        hasher.update([0u8]);
        hasher.update(tenant_id.as_bytes());
        let digest = hasher.finalize();
        let mut prefix = [0u8; 8];
        prefix.copy_from_slice(&digest[..8]);
        u64::from_be_bytes(prefix)
    }
}

impl NodeAssigner for RendezvousAssigner {
    fn node_for_tenant(&self, tenant: &Tenant) -> CollaboratorResult<NodeId> {
        self.nodes
            .iter()
            .max_by_key(|node| (Self::weight(node, &tenant.tenant_id), (*node).clone()))
            .cloned()
            .ok_or_else(|| CollaboratorError::new("no nodes available for placement"))
    }
}
