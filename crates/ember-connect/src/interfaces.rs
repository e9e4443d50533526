//! Seams to the collaborators this crate drives but does not implement.
//!
//! # Purpose
//! Tenant configuration, node placement, the tenant database, migrations,
//! the replication forwarder, the change listener and the connected-client
//! counter are all owned elsewhere. Each is reached through one trait here so
//! production backends and the in-memory doubles in [`crate::memory`] plug in
//! the same way.
use crate::child::ChildHandle;
use crate::error::{CollaboratorError, ReplicationFailure};
use crate::handle::ManagerHandle;
use async_trait::async_trait;
use ember_common::Tenant;
use ember_common::ids::{ConnectionId, NodeId};
use std::fmt;
use std::sync::Arc;

pub type CollaboratorResult<T> = Result<T, CollaboratorError>;

#[async_trait]
pub trait TenantStore: Send + Sync {
    /// Authoritative read, used by the pipeline on every attempt.
    async fn get_tenant(&self, tenant_id: &str) -> CollaboratorResult<Option<Tenant>>;
    /// Read that may serve a briefly stale snapshot; used on the routing
    /// fast path.
    async fn get_tenant_cached(&self, tenant_id: &str) -> CollaboratorResult<Option<Tenant>>;
}

pub trait NodeAssigner: Send + Sync {
    fn node_for_tenant(&self, tenant: &Tenant) -> CollaboratorResult<NodeId>;
}

#[async_trait]
pub trait DatabaseConnection: Send + Sync + fmt::Debug {
    fn id(&self) -> ConnectionId;
    /// Connections this service already holds against the tenant database,
    /// not counting this one.
    async fn active_connections(&self) -> CollaboratorResult<u32>;
    async fn close(&self);
    /// Resolves once the connection is gone, for whatever reason.
    async fn closed(&self);
}

#[async_trait]
pub trait DatabaseConnector: Send + Sync {
    async fn connect(&self, tenant: &Tenant) -> CollaboratorResult<Arc<dyn DatabaseConnection>>;
}

#[async_trait]
pub trait Migrator: Send + Sync {
    async fn run_migrations(&self, tenant: &Tenant) -> CollaboratorResult<()>;
    async fn create_partitions(&self, conn: &dyn DatabaseConnection) -> CollaboratorResult<()>;
}

#[async_trait]
pub trait ReplicationStarter: Send + Sync {
    async fn start(
        &self,
        tenant: &Tenant,
        owner: &ManagerHandle,
    ) -> Result<ChildHandle, ReplicationFailure>;
}

#[async_trait]
pub trait ListenerStarter: Send + Sync {
    async fn start(&self, tenant: &Tenant, owner: &ManagerHandle) -> CollaboratorResult<ChildHandle>;
}

pub trait ClientCounter: Send + Sync {
    fn count_for_tenant(&self, tenant_id: &str) -> usize;
}

/// Everything a node needs from the outside world.
#[derive(Clone)]
pub struct Collaborators {
    pub tenants: Arc<dyn TenantStore>,
    pub assigner: Arc<dyn NodeAssigner>,
    pub connector: Arc<dyn DatabaseConnector>,
    pub migrator: Arc<dyn Migrator>,
    pub replication: Arc<dyn ReplicationStarter>,
    pub listener: Arc<dyn ListenerStarter>,
    pub clients: Arc<dyn ClientCounter>,
}

impl fmt::Debug for Collaborators {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Collaborators").finish_non_exhaustive()
    }
}
