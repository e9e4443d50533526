//! Ordered connection pipeline run once per connection attempt.
//!
//! # Stages
//! 1. `FetchTenant`: fresh tenant snapshot, `TenantNotFound` if absent.
//! 2. `CheckConnection`: rejects suspended tenants, opens the database
//!    connection and enforces the tenant's connection ceiling.
//! 3. `StartCounters`: per-tenant usage counters.
//! 4. `RegisterProcess`: installs the connection handle in the registry
//!    entry this manager already claimed.
//!
//! A failing (or panicking) stage stops the run. Whatever the earlier stages
//! acquired is released before the error is returned, so a failed attempt
//! never leaves a usable connection behind.
use crate::error::ConnectError;
use crate::handle::ConnectionHandle;
use crate::counters::TenantUsage;
use crate::interfaces::DatabaseConnection;
use crate::node::NodeContext;
use crate::registry::RegistryEntry;
use ember_common::Tenant;
use ember_registry::Registration;
use futures::FutureExt;
use std::any::Any;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Stage {
    FetchTenant,
    CheckConnection,
    StartCounters,
    RegisterProcess,
}

pub const STAGES: [Stage; 4] = [
    Stage::FetchTenant,
    Stage::CheckConnection,
    Stage::StartCounters,
    Stage::RegisterProcess,
];

impl Stage {
    pub fn name(&self) -> &'static str {
        match self {
            Stage::FetchTenant => "fetch_tenant",
            Stage::CheckConnection => "check_connection",
            Stage::StartCounters => "start_counters",
            Stage::RegisterProcess => "register_process",
        }
    }
}

/// Output of a successful run.
pub(crate) struct Connected {
    pub(crate) tenant: Tenant,
    pub(crate) conn: Arc<dyn DatabaseConnection>,
    pub(crate) handle: ConnectionHandle,
    pub(crate) usage: Arc<TenantUsage>,
}

/// State threaded through the stages; each stage adds to it.
struct Accumulator {
    tenant_id: String,
    tenant: Option<Tenant>,
    conn: Option<Arc<dyn DatabaseConnection>>,
    handle: Option<ConnectionHandle>,
    usage: Option<Arc<TenantUsage>>,
}

impl Accumulator {
    fn new(tenant_id: &str) -> Self {
        Self {
            tenant_id: tenant_id.to_string(),
            tenant: None,
            conn: None,
            handle: None,
            usage: None,
        }
    }

    fn tenant(&self) -> Result<&Tenant, ConnectError> {
        self.tenant
            .as_ref()
            .ok_or_else(|| missing("tenant"))
    }

    fn finish(self) -> Result<Connected, ConnectError> {
        Ok(Connected {
            tenant: self.tenant.ok_or_else(|| missing("tenant"))?,
            conn: self.conn.ok_or_else(|| missing("connection"))?,
            handle: self.handle.ok_or_else(|| missing("connection handle"))?,
            usage: self.usage.ok_or_else(|| missing("counters"))?,
        })
    }

    async fn abandon(&mut self, ctx: &NodeContext) {
        if let Some(conn) = self.conn.take() {
            let grace = ctx.settings.child_shutdown_grace;
            if tokio::time::timeout(grace, conn.close()).await.is_err() {
                tracing::warn!(tenant_id = %self.tenant_id, "database connection did not close in time");
            }
        }
        if self.usage.take().is_some() {
            ctx.counters.clear(&self.tenant_id);
        }
    }
}

fn missing(what: &str) -> ConnectError {
    ConnectError::Crashed(format!("pipeline finished without {what}"))
}

pub(crate) fn panic_message(panic: &(dyn Any + Send)) -> String {
    if let Some(message) = panic.downcast_ref::<&str>() {
        (*message).to_string()
    } else if let Some(message) = panic.downcast_ref::<String>() {
        message.clone()
    } else {
        "panic".to_string()
    }
}

pub(crate) async fn run(
    ctx: &NodeContext,
    registration: &Registration<RegistryEntry>,
    tenant_id: &str,
) -> Result<Connected, ConnectError> {
    let mut acc = Accumulator::new(tenant_id);
    for stage in STAGES {
        let outcome = AssertUnwindSafe(run_stage(stage, ctx, registration, &mut acc))
            .catch_unwind()
            .await
            .unwrap_or_else(|panic| Err(ConnectError::Crashed(panic_message(panic.as_ref()))));
        if let Err(err) = outcome {
            tracing::warn!(
                tenant_id = %tenant_id,
                stage = stage.name(),
                error = %err,
                "connect pipeline stage failed"
            );
            acc.abandon(ctx).await;
            return Err(err);
        }
        tracing::debug!(tenant_id = %tenant_id, stage = stage.name(), "connect pipeline stage done");
    }
    acc.finish()
}

async fn run_stage(
    stage: Stage,
    ctx: &NodeContext,
    registration: &Registration<RegistryEntry>,
    acc: &mut Accumulator,
) -> Result<(), ConnectError> {
    match stage {
        Stage::FetchTenant => {
            let tenant = ctx
                .deps
                .tenants
                .get_tenant(&acc.tenant_id)
                .await
                .map_err(|err| ConnectError::TenantLookup(err.to_string()))?
                .ok_or(ConnectError::TenantNotFound)?;
            acc.tenant = Some(tenant);
        }
        Stage::CheckConnection => {
            let tenant = acc.tenant()?.clone();
            if tenant.suspended {
                return Err(ConnectError::TenantSuspended);
            }
            let conn = ctx
                .deps
                .connector
                .connect(&tenant)
                .await
                .map_err(|err| ConnectError::Database(err.to_string()))?;
            // Owned by the accumulator from here so a rejection below closes it.
            acc.conn = Some(Arc::clone(&conn));
            let active = conn
                .active_connections()
                .await
                .map_err(|err| ConnectError::Database(err.to_string()))?;
            let required = tenant.limits.pool_size.max(1);
            if active.saturating_add(required) > tenant.limits.max_connections {
                tracing::warn!(
                    tenant_id = %acc.tenant_id,
                    active,
                    required,
                    max = tenant.limits.max_connections,
                    "tenant database connection ceiling reached"
                );
                return Err(ConnectError::TooManyConnections);
            }
            acc.handle = Some(ConnectionHandle::new(
                conn.id(),
                acc.tenant_id.clone(),
                ctx.node_id.clone(),
            ));
        }
        Stage::StartCounters => {
            acc.usage = Some(ctx.counters.start(&acc.tenant_id));
        }
        Stage::RegisterProcess => {
            let handle = acc
                .handle
                .clone()
                .ok_or_else(|| missing("connection handle"))?;
            registration
                .update(|entry| entry.conn = Some(handle))
                .map_err(|err| {
                    tracing::warn!(tenant_id = %acc.tenant_id, error = %err, "registry update failed");
                    ConnectError::Unavailable
                })?;
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn stages_run_in_declared_order() {
        let names: Vec<_> = STAGES.iter().map(Stage::name).collect();
        assert_eq!(
            names,
            vec![
                "fetch_tenant",
                "check_connection",
                "start_counters",
                "register_process"
            ]
        );
    }

    #[test]
    fn panic_message_reads_common_payloads() {
        let boxed: Box<dyn Any + Send> = Box::new("static");
        assert_eq!(panic_message(boxed.as_ref()), "static");
        let boxed: Box<dyn Any + Send> = Box::new(String::from("owned"));
        assert_eq!(panic_message(boxed.as_ref()), "owned");
        let boxed: Box<dyn Any + Send> = Box::new(7u8);
        assert_eq!(panic_message(boxed.as_ref()), "panic");
    }

    #[test]
    fn finish_reports_missing_pieces() {
        let acc = Accumulator::new("t1");
        let err = acc.finish().err().expect("incomplete");
        assert!(matches!(err, ConnectError::Crashed(message) if message.contains("tenant")));
    }
}
