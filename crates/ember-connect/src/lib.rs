//! Tenant connection lifecycle for a multi-tenant realtime service.
//!
//! For each tenant this crate keeps at most one live database connection
//! owner across the cluster. A [`Node`] is the entry point: it probes the
//! shared [`TenantRegistry`], starts a per-tenant connection manager when it
//! is the authoritative node, or forwards the request to the node that is
//! (through a [`NodeClient`]).
//!
//! ```no_run
//! use ember_common::{Tenant, ids::NodeId};
//! use ember_connect::memory::{MemoryBackend, StaticAssigner};
//! use ember_connect::{ConnectOptions, ConnectSettings, LocalCluster, Node, TenantRegistry};
//! use std::sync::Arc;
//!
//! # async fn demo() -> Result<(), Box<dyn std::error::Error>> {
//! let backend = MemoryBackend::new();
//! backend.tenants.insert(Tenant::new("acme"));
//! let node_id = NodeId::new("node-1")?;
//! let cluster = Arc::new(LocalCluster::new());
//! let node = Arc::new(Node::new(
//!     node_id.clone(),
//!     ConnectSettings::default(),
//!     TenantRegistry::new(),
//!     backend.collaborators(Arc::new(StaticAssigner(node_id))),
//!     cluster.clone(),
//! ));
//! cluster.join(&node);
//! let conn = node
//!     .lookup_or_start_connection("acme", ConnectOptions::default())
//!     .await?;
//! assert_eq!(conn.tenant_id(), "acme");
//! # Ok(())
//! # }
//! ```
pub mod assign;
pub mod child;
pub mod cluster;
pub mod config;
pub mod counters;
pub mod error;
pub mod handle;
pub mod idle;
pub mod interfaces;
mod manager;
pub mod memory;
mod node;
pub mod operations;
pub mod pipeline;
pub mod registry;
mod router;

pub use cluster::{LocalCluster, NodeClient};
pub use config::{ConnectOptions, ConnectSettings};
pub use error::{ConnectError, ReplicationFailure, RpcError};
pub use handle::{ConnectionHandle, ManagerHandle, ManagerStatus, StopReason};
pub use node::Node;
pub use registry::{RegistryEntry, TenantRegistry};
