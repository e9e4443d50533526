// Tenant registry entries on top of the generic cluster claim table.
use crate::error::ConnectError;
use crate::handle::{ConnectionHandle, ManagerHandle};
use ember_registry::{ClusterRegistry, RegistryError};

pub type TenantRegistry = ClusterRegistry<RegistryEntry>;

/// Registry value for one tenant: the owning manager and, once the pipeline
/// has connected, the connection handle.
#[derive(Debug, Clone)]
pub struct RegistryEntry {
    pub owner: ManagerHandle,
    // `None` while the owner is still initializing.
    pub conn: Option<ConnectionHandle>,
}

impl RegistryEntry {
    pub(crate) fn initializing(owner: ManagerHandle) -> Self {
        Self { owner, conn: None }
    }
}

/// Non-blocking probe of a tenant's registry state.
pub(crate) fn status(
    registry: &TenantRegistry,
    tenant_id: &str,
) -> Result<ConnectionHandle, ConnectError> {
    match registry.lookup(tenant_id) {
        Ok(Some(RegistryEntry {
            conn: Some(conn), ..
        })) => Ok(conn),
        Ok(Some(RegistryEntry { conn: None, .. })) => Err(ConnectError::ConnectionInitializing),
        Ok(None) => Err(ConnectError::Initializing),
        Err(RegistryError::Unavailable) | Err(RegistryError::NotOwner(_)) => {
            Err(ConnectError::Unavailable)
        }
    }
}

pub(crate) fn whereis(registry: &TenantRegistry, tenant_id: &str) -> Option<ManagerHandle> {
    registry
        .lookup(tenant_id)
        .ok()
        .flatten()
        .map(|entry| entry.owner)
        .filter(ManagerHandle::is_alive)
}
