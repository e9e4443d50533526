//! In-memory collaborators for the dev node and tests.
//!
//! Each type implements one collaborator trait and exposes knobs to inject
//! failures (failed connects, panicking migrations, replication refusing a
//! slot) and to observe what the core did with it.
use crate::child::ChildHandle;
use crate::error::{CollaboratorError, ReplicationFailure};
use crate::handle::ManagerHandle;
use crate::interfaces::{
    ClientCounter, CollaboratorResult, Collaborators, DatabaseConnection, DatabaseConnector,
    ListenerStarter, Migrator, NodeAssigner, ReplicationStarter, TenantStore,
};
use async_trait::async_trait;
use ember_common::Tenant;
use ember_common::ids::{ConnectionId, NodeId};
use parking_lot::{Mutex, RwLock};
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU32, AtomicUsize, Ordering};
use std::sync::{Arc, Weak};
use std::time::Duration;
use tokio::sync::watch;
use tokio_util::sync::CancellationToken;

/// Tenant store with a primary map and a cache mirror. `set_suspended`
/// writes through; `set_suspended_stale` updates only the primary so the
/// cached path lags like a real cache would.
#[derive(Debug, Default)]
pub struct MemoryTenantStore {
    tenants: RwLock<HashMap<String, Tenant>>,
    cache: RwLock<HashMap<String, Tenant>>,
    failing: AtomicBool,
    lookups: AtomicUsize,
}

impl MemoryTenantStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&self, tenant: Tenant) {
        self.cache
            .write()
            .insert(tenant.tenant_id.clone(), tenant.clone());
        self.tenants.write().insert(tenant.tenant_id.clone(), tenant);
    }

    pub fn remove(&self, tenant_id: &str) -> Option<Tenant> {
        self.cache.write().remove(tenant_id);
        self.tenants.write().remove(tenant_id)
    }

    pub fn set_suspended(&self, tenant_id: &str, suspended: bool) -> bool {
        if let Some(tenant) = self.cache.write().get_mut(tenant_id) {
            tenant.suspended = suspended;
        }
        self.set_suspended_stale(tenant_id, suspended)
    }

    pub fn set_suspended_stale(&self, tenant_id: &str, suspended: bool) -> bool {
        match self.tenants.write().get_mut(tenant_id) {
            Some(tenant) => {
                tenant.suspended = suspended;
                true
            }
            None => false,
        }
    }

    /// Makes every lookup fail until cleared.
    pub fn fail_lookups(&self, failing: bool) {
        self.failing.store(failing, Ordering::SeqCst);
    }

    /// Number of uncached lookups served.
    pub fn lookups(&self) -> usize {
        self.lookups.load(Ordering::SeqCst)
    }

    pub fn len(&self) -> usize {
        self.tenants.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn check(&self) -> CollaboratorResult<()> {
        if self.failing.load(Ordering::SeqCst) {
            return Err(CollaboratorError::new("tenant store unavailable"));
        }
        Ok(())
    }
}

#[async_trait]
impl TenantStore for MemoryTenantStore {
    async fn get_tenant(&self, tenant_id: &str) -> CollaboratorResult<Option<Tenant>> {
        self.check()?;
        self.lookups.fetch_add(1, Ordering::SeqCst);
        Ok(self.tenants.read().get(tenant_id).cloned())
    }

    async fn get_tenant_cached(&self, tenant_id: &str) -> CollaboratorResult<Option<Tenant>> {
        self.check()?;
        Ok(self.cache.read().get(tenant_id).cloned())
    }
}

/// Assigns every tenant to one node.
#[derive(Debug, Clone)]
pub struct StaticAssigner(pub NodeId);

impl NodeAssigner for StaticAssigner {
    fn node_for_tenant(&self, _tenant: &Tenant) -> CollaboratorResult<NodeId> {
        Ok(self.0.clone())
    }
}

#[derive(Debug, Default)]
struct DatabaseState {
    open: Mutex<HashMap<ConnectionId, Arc<MemoryConnection>>>,
    external: AtomicU32,
    connect_error: Mutex<Option<String>>,
    connect_delay: Mutex<Option<Duration>>,
    connects: AtomicUsize,
}

/// Fake database server shared by all tenants.
#[derive(Debug, Default)]
pub struct MemoryDatabase {
    state: Arc<DatabaseState>,
}

impl MemoryDatabase {
    pub fn new() -> Self {
        Self::default()
    }

    /// Connections held by something other than this core, counted by
    /// every tenant's admission check.
    pub fn set_external_connections(&self, count: u32) {
        self.state.external.store(count, Ordering::SeqCst);
    }

    pub fn fail_connects(&self, error: Option<&str>) {
        *self.state.connect_error.lock() = error.map(str::to_string);
    }

    pub fn set_connect_delay(&self, delay: Option<Duration>) {
        *self.state.connect_delay.lock() = delay;
    }

    /// Total successful connects so far.
    pub fn connects(&self) -> usize {
        self.state.connects.load(Ordering::SeqCst)
    }

    pub fn open_connections(&self, tenant_id: &str) -> usize {
        self.state
            .open
            .lock()
            .values()
            .filter(|conn| conn.tenant_id == tenant_id)
            .count()
    }

    pub fn connection(&self, tenant_id: &str) -> Option<Arc<MemoryConnection>> {
        self.state
            .open
            .lock()
            .values()
            .find(|conn| conn.tenant_id == tenant_id)
            .cloned()
    }

    /// Drops the tenant's open connections server-side.
    pub fn kill(&self, tenant_id: &str) -> usize {
        let victims: Vec<_> = self
            .state
            .open
            .lock()
            .values()
            .filter(|conn| conn.tenant_id == tenant_id)
            .cloned()
            .collect();
        for conn in &victims {
            conn.terminate();
        }
        victims.len()
    }
}

#[async_trait]
impl DatabaseConnector for MemoryDatabase {
    async fn connect(&self, tenant: &Tenant) -> CollaboratorResult<Arc<dyn DatabaseConnection>> {
        let delay = *self.state.connect_delay.lock();
        if let Some(delay) = delay {
            tokio::time::sleep(delay).await;
        }
        if let Some(message) = self.state.connect_error.lock().clone() {
            return Err(CollaboratorError::new(message));
        }
        let (closed, _) = watch::channel(false);
        let conn = Arc::new(MemoryConnection {
            id: ConnectionId::new(),
            tenant_id: tenant.tenant_id.clone(),
            state: Arc::downgrade(&self.state),
            closed,
        });
        self.state.open.lock().insert(conn.id, Arc::clone(&conn));
        self.state.connects.fetch_add(1, Ordering::SeqCst);
        Ok(conn)
    }
}

#[derive(Debug)]
pub struct MemoryConnection {
    id: ConnectionId,
    tenant_id: String,
    state: Weak<DatabaseState>,
    closed: watch::Sender<bool>,
}

impl MemoryConnection {
    pub fn tenant_id(&self) -> &str {
        &self.tenant_id
    }

    pub fn is_closed(&self) -> bool {
        *self.closed.borrow()
    }

    fn terminate(&self) {
        if let Some(state) = self.state.upgrade() {
            state.open.lock().remove(&self.id);
        }
        self.closed.send_replace(true);
    }
}

#[async_trait]
impl DatabaseConnection for MemoryConnection {
    fn id(&self) -> ConnectionId {
        self.id
    }

    async fn active_connections(&self) -> CollaboratorResult<u32> {
        let Some(state) = self.state.upgrade() else {
            return Err(CollaboratorError::new("database is gone"));
        };
        let others = state
            .open
            .lock()
            .values()
            .filter(|conn| conn.tenant_id == self.tenant_id && conn.id != self.id)
            .count();
        let others = u32::try_from(others).unwrap_or(u32::MAX);
        Ok(state.external.load(Ordering::SeqCst).saturating_add(others))
    }

    async fn close(&self) {
        self.terminate();
    }

    async fn closed(&self) {
        let mut closed = self.closed.subscribe();
        let _ = closed.wait_for(|closed| *closed).await;
    }
}

#[derive(Debug, Default)]
pub struct MemoryMigrator {
    migration_error: Mutex<Option<String>>,
    partition_error: Mutex<Option<String>>,
    panic_on_migrate: AtomicBool,
    runs: AtomicUsize,
}

impl MemoryMigrator {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn fail_migrations(&self, error: Option<&str>) {
        *self.migration_error.lock() = error.map(str::to_string);
    }

    pub fn fail_partitions(&self, error: Option<&str>) {
        *self.partition_error.lock() = error.map(str::to_string);
    }

    pub fn panic_on_migrate(&self, panic: bool) {
        self.panic_on_migrate.store(panic, Ordering::SeqCst);
    }

    pub fn runs(&self) -> usize {
        self.runs.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl Migrator for MemoryMigrator {
    async fn run_migrations(&self, tenant: &Tenant) -> CollaboratorResult<()> {
        self.runs.fetch_add(1, Ordering::SeqCst);
        if self.panic_on_migrate.load(Ordering::SeqCst) {
            panic!("migration for {} raised", tenant.tenant_id);
        }
        match self.migration_error.lock().clone() {
            Some(message) => Err(CollaboratorError::new(message)),
            None => Ok(()),
        }
    }

    async fn create_partitions(&self, _conn: &dyn DatabaseConnection) -> CollaboratorResult<()> {
        match self.partition_error.lock().clone() {
            Some(message) => Err(CollaboratorError::new(message)),
            None => Ok(()),
        }
    }
}

/// Child tasks that idle until cancelled or killed through the test knob.
#[derive(Debug, Default)]
struct ChildTasks {
    kills: Mutex<HashMap<String, CancellationToken>>,
    started: AtomicUsize,
}

impl ChildTasks {
    fn spawn(&self, tenant_id: &str, kind: &'static str) -> ChildHandle {
        let kill = CancellationToken::new();
        self.kills.lock().insert(tenant_id.to_string(), kill.clone());
        self.started.fetch_add(1, Ordering::SeqCst);
        let tenant_id = tenant_id.to_string();
        ChildHandle::spawn(move |cancel| async move {
            tokio::select! {
                _ = cancel.cancelled() => {}
                _ = kill.cancelled() => {
                    tracing::debug!(tenant_id = %tenant_id, child = kind, "child task killed");
                }
            }
        })
    }

    fn kill(&self, tenant_id: &str) -> bool {
        match self.kills.lock().remove(tenant_id) {
            Some(kill) => {
                kill.cancel();
                true
            }
            None => false,
        }
    }
}

#[derive(Debug, Default)]
pub struct TaskReplicationStarter {
    tasks: ChildTasks,
    failure: Mutex<Option<ReplicationFailure>>,
}

impl TaskReplicationStarter {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn fail_with(&self, failure: Option<ReplicationFailure>) {
        *self.failure.lock() = failure;
    }

    pub fn started(&self) -> usize {
        self.tasks.started.load(Ordering::SeqCst)
    }

    /// Ends the tenant's latest replication task as if it crashed.
    pub fn kill(&self, tenant_id: &str) -> bool {
        self.tasks.kill(tenant_id)
    }
}

#[async_trait]
impl ReplicationStarter for TaskReplicationStarter {
    async fn start(
        &self,
        tenant: &Tenant,
        _owner: &ManagerHandle,
    ) -> Result<ChildHandle, ReplicationFailure> {
        if let Some(failure) = self.failure.lock().clone() {
            return Err(failure);
        }
        Ok(self.tasks.spawn(&tenant.tenant_id, "replication"))
    }
}

#[derive(Debug, Default)]
pub struct TaskListenerStarter {
    tasks: ChildTasks,
    failure: Mutex<Option<String>>,
}

impl TaskListenerStarter {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn fail_with(&self, error: Option<&str>) {
        *self.failure.lock() = error.map(str::to_string);
    }

    pub fn started(&self) -> usize {
        self.tasks.started.load(Ordering::SeqCst)
    }

    pub fn kill(&self, tenant_id: &str) -> bool {
        self.tasks.kill(tenant_id)
    }
}

#[async_trait]
impl ListenerStarter for TaskListenerStarter {
    async fn start(&self, tenant: &Tenant, _owner: &ManagerHandle) -> CollaboratorResult<ChildHandle> {
        if let Some(message) = self.failure.lock().clone() {
            return Err(CollaboratorError::new(message));
        }
        Ok(self.tasks.spawn(&tenant.tenant_id, "listener"))
    }
}

#[derive(Debug, Default)]
pub struct MemoryClientCounter {
    counts: Mutex<HashMap<String, usize>>,
}

impl MemoryClientCounter {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set(&self, tenant_id: &str, count: usize) {
        self.counts.lock().insert(tenant_id.to_string(), count);
    }
}

impl ClientCounter for MemoryClientCounter {
    fn count_for_tenant(&self, tenant_id: &str) -> usize {
        self.counts.lock().get(tenant_id).copied().unwrap_or(0)
    }
}

/// One shared set of in-memory collaborators. Nodes built from the same
/// backend see the same tenants, database and clients.
#[derive(Debug, Clone, Default)]
pub struct MemoryBackend {
    pub tenants: Arc<MemoryTenantStore>,
    pub database: Arc<MemoryDatabase>,
    pub migrator: Arc<MemoryMigrator>,
    pub replication: Arc<TaskReplicationStarter>,
    pub listener: Arc<TaskListenerStarter>,
    pub clients: Arc<MemoryClientCounter>,
}

impl MemoryBackend {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn collaborators(&self, assigner: Arc<dyn NodeAssigner>) -> Collaborators {
        Collaborators {
            tenants: self.tenants.clone(),
            assigner,
            connector: self.database.clone(),
            migrator: self.migrator.clone(),
            replication: self.replication.clone(),
            listener: self.listener.clone(),
            clients: self.clients.clone(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn active_connections_exclude_self() {
        let db = MemoryDatabase::new();
        db.set_external_connections(3);
        let tenant = Tenant::new("t1");
        let first = db.connect(&tenant).await.expect("connect");
        assert_eq!(first.active_connections().await.expect("count"), 3);
        let second = db.connect(&tenant).await.expect("connect");
        assert_eq!(first.active_connections().await.expect("count"), 4);
        second.close().await;
        assert_eq!(first.active_connections().await.expect("count"), 3);
        assert_eq!(db.open_connections("t1"), 1);
    }

    #[tokio::test]
    async fn kill_resolves_closed() {
        let db = MemoryDatabase::new();
        let conn = db.connect(&Tenant::new("t1")).await.expect("connect");
        let waiter = tokio::spawn({
            let conn = Arc::clone(&conn);
            async move { conn.closed().await }
        });
        assert_eq!(db.kill("t1"), 1);
        tokio::time::timeout(Duration::from_secs(1), waiter)
            .await
            .expect("closed in time")
            .expect("join");
        assert_eq!(db.open_connections("t1"), 0);
    }

    #[tokio::test]
    async fn stale_cache_keeps_old_suspension() {
        let store = MemoryTenantStore::new();
        store.insert(Tenant::new("t1"));
        assert!(store.set_suspended_stale("t1", true));
        let cached = store.get_tenant_cached("t1").await.expect("ok").expect("tenant");
        let fresh = store.get_tenant("t1").await.expect("ok").expect("tenant");
        assert!(!cached.suspended);
        assert!(fresh.suspended);
        assert!(!store.set_suspended("missing", true));
    }

    #[tokio::test]
    async fn failing_store_reports_error() {
        let store = MemoryTenantStore::new();
        store.fail_lookups(true);
        assert!(store.get_tenant("t1").await.is_err());
        store.fail_lookups(false);
        assert_eq!(store.get_tenant("t1").await.expect("ok"), None);
    }
}
