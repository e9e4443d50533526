//! Handles callers hold onto: the tenant's connection descriptor and the
//! owning manager's process handle.
use crate::error::ConnectError;
use ember_common::ids::{ConnectionId, ManagerId, NodeId};
use std::fmt;
use std::time::Duration;
use tokio::sync::{mpsc, watch};

/// Opaque descriptor of a live tenant database connection. The connection
/// itself stays inside its manager; callers only ever see this handle.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct ConnectionHandle {
    id: ConnectionId,
    tenant_id: String,
    node: NodeId,
}

impl ConnectionHandle {
    pub fn new(id: ConnectionId, tenant_id: impl Into<String>, node: NodeId) -> Self {
        Self {
            id,
            tenant_id: tenant_id.into(),
            node,
        }
    }

    pub fn id(&self) -> ConnectionId {
        self.id
    }

    pub fn tenant_id(&self) -> &str {
        &self.tenant_id
    }

    pub fn node(&self) -> &NodeId {
        &self.node
    }
}

/// Why a manager stopped.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StopReason {
    Idle,
    Shutdown,
    Suspended,
    ConnectionDown,
    ChildExited(&'static str),
    Failed(ConnectError),
}

impl StopReason {
    pub fn label(&self) -> &'static str {
        match self {
            StopReason::Idle => "idle",
            StopReason::Shutdown => "shutdown",
            StopReason::Suspended => "suspended",
            StopReason::ConnectionDown => "connection_down",
            StopReason::ChildExited(_) => "child_exited",
            StopReason::Failed(err) => err.label(),
        }
    }
}

impl fmt::Display for StopReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            StopReason::ChildExited(child) => write!(f, "child exited: {child}"),
            StopReason::Failed(err) => write!(f, "failed: {err}"),
            other => f.write_str(other.label()),
        }
    }
}

/// Lifecycle phase published by every manager.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ManagerStatus {
    Initializing,
    // Pipeline finished and the handle is in the registry; continuations pending.
    Connected(ConnectionHandle),
    Ready(ConnectionHandle),
    Terminating,
    Terminated(StopReason),
}

impl ManagerStatus {
    pub fn connection(&self) -> Option<&ConnectionHandle> {
        match self {
            ManagerStatus::Connected(conn) | ManagerStatus::Ready(conn) => Some(conn),
            _ => None,
        }
    }
}

#[derive(Debug)]
pub(crate) enum Command {
    Shutdown,
}

/// Process handle of a tenant's connection manager.
#[derive(Clone)]
pub struct ManagerHandle {
    id: ManagerId,
    tenant_id: String,
    node: NodeId,
    commands: mpsc::UnboundedSender<Command>,
    status: watch::Receiver<ManagerStatus>,
}

impl fmt::Debug for ManagerHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ManagerHandle")
            .field("id", &self.id)
            .field("tenant_id", &self.tenant_id)
            .field("node", &self.node)
            .finish()
    }
}

impl PartialEq for ManagerHandle {
    fn eq(&self, other: &Self) -> bool {
        self.id == other.id
    }
}

impl Eq for ManagerHandle {}

impl ManagerHandle {
    pub(crate) fn new(
        tenant_id: impl Into<String>,
        node: NodeId,
        commands: mpsc::UnboundedSender<Command>,
        status: watch::Receiver<ManagerStatus>,
    ) -> Self {
        Self {
            id: ManagerId::new(),
            tenant_id: tenant_id.into(),
            node,
            commands,
            status,
        }
    }

    pub fn id(&self) -> ManagerId {
        self.id
    }

    pub fn tenant_id(&self) -> &str {
        &self.tenant_id
    }

    pub fn node(&self) -> &NodeId {
        &self.node
    }

    pub fn status(&self) -> ManagerStatus {
        self.status.borrow().clone()
    }

    pub fn is_alive(&self) -> bool {
        !self.commands.is_closed()
    }

    /// Asks the manager to stop. Never blocks; a stopped manager ignores it.
    pub fn shutdown(&self) {
        let _ = self.commands.send(Command::Shutdown);
    }

    /// Waits until the manager has published its connection handle.
    ///
    /// Returns the manager's failure reason if it terminates first, and
    /// `ConnectionInitializing` if `limit` elapses while it is still starting.
    pub async fn wait_connected(&self, limit: Duration) -> Result<ConnectionHandle, ConnectError> {
        let mut status = self.status.clone();
        let wait = async move {
            loop {
                let settled = match &*status.borrow_and_update() {
                    ManagerStatus::Initializing => None,
                    ManagerStatus::Connected(conn) | ManagerStatus::Ready(conn) => {
                        Some(Ok(conn.clone()))
                    }
                    ManagerStatus::Terminating => Some(Err(ConnectError::Unavailable)),
                    ManagerStatus::Terminated(StopReason::Failed(err)) => Some(Err(err.clone())),
                    ManagerStatus::Terminated(_) => Some(Err(ConnectError::Unavailable)),
                };
                if let Some(result) = settled {
                    return result;
                }
                if status.changed().await.is_err() {
                    // Sender dropped without a terminal status: the task is gone.
                    return match &*status.borrow() {
                        ManagerStatus::Terminated(StopReason::Failed(err)) => Err(err.clone()),
                        _ => Err(ConnectError::Unavailable),
                    };
                }
            }
        };
        tokio::time::timeout(limit, wait)
            .await
            .unwrap_or(Err(ConnectError::ConnectionInitializing))
    }
}
