// Routes connection requests to whichever node owns, or should own, a tenant.
use crate::config::ConnectOptions;
use crate::error::{ConnectError, RpcError};
use crate::handle::ConnectionHandle;
use crate::node::Node;

impl Node {
    /// Returns the tenant's live connection, starting a manager on the
    /// authoritative node when none is registered.
    pub async fn lookup_or_start_connection(
        &self,
        tenant_id: &str,
        options: ConnectOptions,
    ) -> Result<ConnectionHandle, ConnectError> {
        match self.get_status(tenant_id) {
            Ok(conn) => Ok(conn),
            Err(ConnectError::Initializing) => self.call_authoritative_node(tenant_id, options).await,
            Err(ConnectError::ConnectionInitializing) => {
                // Another request is mid-pipeline; give it one backoff.
                tokio::time::sleep(self.ctx.settings.initializing_backoff).await;
                self.call_authoritative_node(tenant_id, options).await
            }
            Err(err) => {
                tracing::warn!(tenant_id = %tenant_id, error = %err, "tenant registry lookup failed");
                Err(err)
            }
        }
    }

    async fn call_authoritative_node(
        &self,
        tenant_id: &str,
        options: ConnectOptions,
    ) -> Result<ConnectionHandle, ConnectError> {
        let tenant = self
            .ctx
            .deps
            .tenants
            .get_tenant_cached(tenant_id)
            .await
            .map_err(|err| ConnectError::TenantLookup(err.to_string()))?
            .ok_or(ConnectError::TenantNotFound)?;
        if tenant.suspended {
            return Err(ConnectError::TenantSuspended);
        }

        let target = self
            .ctx
            .deps
            .assigner
            .node_for_tenant(&tenant)
            .map_err(|err| ConnectError::NodeAssignment(err.to_string()))?;
        let timeout = options.rpc_timeout_or(&self.ctx.settings);
        let result = if target == self.ctx.node_id {
            tokio::time::timeout(timeout, self.connect(tenant_id, options)).await
        } else {
            tracing::debug!(
                tenant_id = %tenant_id,
                node = %target,
                timeout_ms = timeout.as_millis() as u64,
                "forwarding connect to authoritative node"
            );
            tokio::time::timeout(timeout, self.cluster.connect(&target, tenant_id, options)).await
        };
        match result {
            Ok(result) => result,
            Err(_) => {
                tracing::warn!(tenant_id = %tenant_id, node = %target, "connect timed out");
                Err(ConnectError::Rpc(RpcError::Timeout {
                    node: target,
                    after: timeout,
                }))
            }
        }
    }
}
