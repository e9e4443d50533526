// Error taxonomy for connection attempts and routing.
use ember_common::ids::NodeId;
use std::fmt;
use std::time::Duration;

/// Failure reported by an external collaborator (tenant store, database,
/// migration runner, listener). Carries only a message; collaborators own
/// their own error types and flatten them at the seam.
#[derive(thiserror::Error, Debug, Clone, PartialEq, Eq)]
#[error("{0}")]
pub struct CollaboratorError(String);

impl CollaboratorError {
    pub fn new(message: impl fmt::Display) -> Self {
        Self(message.to_string())
    }

    pub fn message(&self) -> &str {
        &self.0
    }
}

#[derive(thiserror::Error, Debug, Clone, PartialEq, Eq)]
pub enum ReplicationFailure {
    #[error("max_wal_senders reached")]
    MaxWalSendersReached,
    #[error("{0}")]
    Other(String),
}

#[derive(thiserror::Error, Debug, Clone, PartialEq, Eq)]
pub enum RpcError {
    #[error("node {node} did not answer within {after:?}")]
    Timeout { node: NodeId, after: Duration },
    #[error("node {0} is not reachable")]
    NodeDown(NodeId),
    #[error("transport: {0}")]
    Transport(String),
}

#[derive(thiserror::Error, Debug, Clone, PartialEq, Eq)]
pub enum ConnectError {
    #[error("tenant not found")]
    TenantNotFound,
    #[error("tenant suspended")]
    TenantSuspended,
    #[error("tenant database has too many connections")]
    TooManyConnections,
    #[error("tenant database connection is initializing")]
    ConnectionInitializing,
    #[error("tenant connection is not started")]
    Initializing,
    #[error("tenant database unavailable")]
    Unavailable,
    #[error("rpc error: {0}")]
    Rpc(#[from] RpcError),
    #[error("tenant lookup failed: {0}")]
    TenantLookup(String),
    #[error("node assignment failed: {0}")]
    NodeAssignment(String),
    #[error("database connection failed: {0}")]
    Database(String),
    #[error("migrations failed: {0}")]
    MigrationFailed(String),
    #[error("replication start failed: {0}")]
    ReplicationStartFailed(ReplicationFailure),
    #[error("listener start failed: {0}")]
    ListenerStartFailed(String),
    #[error("connection manager crashed: {0}")]
    Crashed(String),
}

impl ConnectError {
    /// Stable label for metrics and structured logs.
    pub fn label(&self) -> &'static str {
        match self {
            ConnectError::TenantNotFound => "tenant_not_found",
            ConnectError::TenantSuspended => "tenant_suspended",
            ConnectError::TooManyConnections => "too_many_connections",
            ConnectError::ConnectionInitializing => "connection_initializing",
            ConnectError::Initializing => "initializing",
            ConnectError::Unavailable => "unavailable",
            ConnectError::Rpc(_) => "rpc_error",
            ConnectError::TenantLookup(_) => "tenant_lookup_failed",
            ConnectError::NodeAssignment(_) => "node_assignment_failed",
            ConnectError::Database(_) => "database_error",
            ConnectError::MigrationFailed(_) => "migration_failed",
            ConnectError::ReplicationStartFailed(ReplicationFailure::MaxWalSendersReached) => {
                "max_wal_senders_reached"
            }
            ConnectError::ReplicationStartFailed(_) => "replication_start_failed",
            ConnectError::ListenerStartFailed(_) => "listener_start_failed",
            ConnectError::Crashed(_) => "crashed",
        }
    }

    /// Whether a caller may retry after a backoff. Permanent rejections
    /// (unknown or suspended tenant) must not be retried immediately.
    pub fn is_retryable(&self) -> bool {
        !matches!(
            self,
            ConnectError::TenantNotFound | ConnectError::TenantSuspended
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn max_wal_senders_has_its_own_label() {
        let generic = ConnectError::ReplicationStartFailed(ReplicationFailure::Other("boom".into()));
        let wal = ConnectError::ReplicationStartFailed(ReplicationFailure::MaxWalSendersReached);
        assert_eq!(generic.label(), "replication_start_failed");
        assert_eq!(wal.label(), "max_wal_senders_reached");
        assert!(wal.to_string().contains("max_wal_senders"));
    }

    #[test]
    fn permanent_errors_are_not_retryable() {
        assert!(!ConnectError::TenantNotFound.is_retryable());
        assert!(!ConnectError::TenantSuspended.is_retryable());
        assert!(ConnectError::TooManyConnections.is_retryable());
        assert!(ConnectError::ConnectionInitializing.is_retryable());
    }

    #[test]
    fn rpc_error_display_includes_node() {
        let node = NodeId::new("node-b").expect("node");
        let err = ConnectError::from(RpcError::Timeout {
            node,
            after: Duration::from_millis(30),
        });
        assert_eq!(err.label(), "rpc_error");
        assert!(err.to_string().contains("node-b"));
    }
}
