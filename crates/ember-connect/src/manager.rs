//! Per-tenant connection manager.
//!
//! One tokio task per tenant owns the database connection, the replication
//! and listener children, and the idle window. All of its state is mutated
//! from that task only; the outside world talks to it through a
//! [`ManagerHandle`] (commands in, status out).
//!
//! Lifecycle:
//! 1. Claim the tenant's registry key with an empty connection slot.
//! 2. Run the pipeline; on success publish `Connected` and reply to the
//!    starter.
//! 3. Run migrations and partitions, then start replication and the
//!    listener; subscribe to the tenant's operations topic and publish
//!    `Ready`.
//! 4. Serve until idle, shutdown, suspension, connection death or a child
//!    exit, then clean up and release the registry entry.
use crate::child::ChildHandle;
use crate::config::ConnectOptions;
use crate::error::{ConnectError, ReplicationFailure};
use crate::handle::{Command, ConnectionHandle, ManagerHandle, ManagerStatus, StopReason};
use crate::idle::IdleWindow;
use crate::node::NodeContext;
use crate::operations::TenantOperation;
use crate::pipeline::{self, Connected};
use crate::registry::RegistryEntry;
use ember_registry::{Claim, Registration};
use futures::FutureExt;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::broadcast::error::RecvError;
use tokio::sync::{broadcast, mpsc, oneshot, watch};
use tokio::time::Instant;

pub(crate) type ConnectReply = oneshot::Receiver<Result<ConnectionHandle, ConnectError>>;

/// Outcome of a start attempt on this node.
pub(crate) enum Start {
    /// This node won the claim; `connected` resolves once the pipeline ends.
    Spawned {
        handle: ManagerHandle,
        connected: ConnectReply,
    },
    /// Another manager already owns the tenant.
    Existing(ManagerHandle),
}

pub(crate) fn start(
    ctx: &Arc<NodeContext>,
    tenant_id: &str,
    options: &ConnectOptions,
) -> Result<Start, ConnectError> {
    let (commands_tx, commands_rx) = mpsc::unbounded_channel();
    let (status_tx, status_rx) = watch::channel(ManagerStatus::Initializing);
    let handle = ManagerHandle::new(tenant_id, ctx.node_id.clone(), commands_tx, status_rx);

    let registration = match ctx
        .registry
        .register_if_absent(tenant_id, RegistryEntry::initializing(handle.clone()))
    {
        Ok(Claim::Registered(registration)) => registration,
        Ok(Claim::AlreadyRegistered(entry)) => {
            tracing::debug!(
                tenant_id = %tenant_id,
                owner = %entry.owner.node(),
                "tenant already has a connection manager"
            );
            return Ok(Start::Existing(entry.owner));
        }
        Err(err) => {
            tracing::warn!(tenant_id = %tenant_id, error = %err, "registry claim failed");
            return Err(ConnectError::Unavailable);
        }
    };

    let (reply_tx, reply_rx) = oneshot::channel();
    let manager = ConnectionManager {
        ctx: Arc::clone(ctx),
        handle: handle.clone(),
        registration: Some(registration),
        status: status_tx,
        commands: commands_rx,
        tenant_id: tenant_id.to_string(),
        check_interval: options.idle_check_interval_or(&ctx.settings),
        idle: IdleWindow::new(),
        session: None,
        replication: None,
        listener: None,
    };
    ctx.track_manager(&handle);
    let task_ctx = Arc::clone(ctx);
    let task_handle = handle.clone();
    tokio::spawn(async move {
        if let Err(panic) = AssertUnwindSafe(manager.run(reply_tx)).catch_unwind().await {
            tracing::error!(
                tenant_id = %task_handle.tenant_id(),
                panic = %pipeline::panic_message(panic.as_ref()),
                "connection manager panicked"
            );
        }
        task_ctx.forget_manager(&task_handle);
    });

    Ok(Start::Spawned {
        handle,
        connected: reply_rx,
    })
}

struct ConnectionManager {
    ctx: Arc<NodeContext>,
    handle: ManagerHandle,
    registration: Option<Registration<RegistryEntry>>,
    status: watch::Sender<ManagerStatus>,
    commands: mpsc::UnboundedReceiver<Command>,
    tenant_id: String,
    check_interval: Duration,
    idle: IdleWindow,
    session: Option<Connected>,
    replication: Option<ChildHandle>,
    listener: Option<ChildHandle>,
}

impl ConnectionManager {
    async fn run(mut self, reply: oneshot::Sender<Result<ConnectionHandle, ConnectError>>) {
        let started = std::time::Instant::now();
        let outcome = match self.registration.as_ref() {
            Some(registration) => pipeline::run(&self.ctx, registration, &self.tenant_id).await,
            None => Err(ConnectError::Unavailable),
        };
        metrics::histogram!("ember_connect_pipeline_ms")
            .record(started.elapsed().as_secs_f64() * 1000.0);

        let connected = match outcome {
            Ok(connected) => connected,
            Err(err) => {
                metrics::counter!("ember_connect_attempts_total", "result" => err.label())
                    .increment(1);
                self.terminate(StopReason::Failed(err.clone())).await;
                let _ = reply.send(Err(err));
                return;
            }
        };
        metrics::counter!("ember_connect_attempts_total", "result" => "ok").increment(1);

        let conn = connected.handle.clone();
        self.session = Some(connected);
        tracing::info!(
            tenant_id = %self.tenant_id,
            connection_id = %conn.id(),
            "tenant database connected"
        );
        self.status.send_replace(ManagerStatus::Connected(conn.clone()));
        let _ = reply.send(Ok(conn.clone()));

        if let Err(err) = self.start_children().await {
            self.terminate(StopReason::Failed(err)).await;
            return;
        }

        let operations = self.ctx.operations.subscribe(&self.tenant_id);
        self.status.send_replace(ManagerStatus::Ready(conn));
        tracing::debug!(
            tenant_id = %self.tenant_id,
            interval_ms = self.check_interval.as_millis() as u64,
            "connection manager ready"
        );
        let reason = self.serve(operations).await;
        self.terminate(reason).await;
    }

    async fn start_children(&mut self) -> Result<(), ConnectError> {
        let Some(session) = self.session.as_ref() else {
            return Err(ConnectError::Crashed("no session".to_string()));
        };
        let tenant = session.tenant.clone();
        let conn = Arc::clone(&session.conn);
        let deps = self.ctx.deps.clone();

        let migrations = AssertUnwindSafe(async {
            deps.migrator.run_migrations(&tenant).await?;
            deps.migrator.create_partitions(conn.as_ref()).await
        })
        .catch_unwind()
        .await;
        let migrations = match migrations {
            Ok(result) => result.map_err(|err| err.to_string()),
            Err(panic) => Err(pipeline::panic_message(panic.as_ref())),
        };
        if let Err(detail) = migrations {
            tracing::error!(tenant_id = %self.tenant_id, error = %detail, "tenant migrations failed");
            return Err(ConnectError::MigrationFailed(detail));
        }

        match deps.replication.start(&tenant, &self.handle).await {
            Ok(child) => self.replication = Some(child),
            Err(ReplicationFailure::MaxWalSendersReached) => {
                tracing::error!(
                    tenant_id = %self.tenant_id,
                    "replication start failed: max_wal_senders reached"
                );
                return Err(ConnectError::ReplicationStartFailed(
                    ReplicationFailure::MaxWalSendersReached,
                ));
            }
            Err(err) => {
                tracing::error!(tenant_id = %self.tenant_id, error = %err, "replication start failed");
                return Err(ConnectError::ReplicationStartFailed(err));
            }
        }

        match deps.listener.start(&tenant, &self.handle).await {
            Ok(child) => self.listener = Some(child),
            Err(err) => {
                tracing::error!(tenant_id = %self.tenant_id, error = %err, "listener start failed");
                return Err(ConnectError::ListenerStartFailed(err.to_string()));
            }
        }
        Ok(())
    }

    async fn serve(&mut self, operations: broadcast::Receiver<TenantOperation>) -> StopReason {
        let Some(conn) = self.session.as_ref().map(|session| Arc::clone(&session.conn)) else {
            return StopReason::Failed(ConnectError::Crashed("no session".to_string()));
        };
        let mut operations = Some(operations);
        let mut next_check = Instant::now() + self.check_interval;
        loop {
            tokio::select! {
                command = self.commands.recv() => match command {
                    Some(Command::Shutdown) | None => return StopReason::Shutdown,
                },
                _ = conn.closed() => {
                    tracing::warn!(tenant_id = %self.tenant_id, "tenant database connection went down");
                    return StopReason::ConnectionDown;
                }
                operation = next_operation(&mut operations) => match operation {
                    Ok(TenantOperation::Suspend) => return StopReason::Suspended,
                    Ok(TenantOperation::Disconnect) => return StopReason::Shutdown,
                    Ok(TenantOperation::Unsuspend) => {
                        tracing::debug!(tenant_id = %self.tenant_id, "unsuspend ignored by running manager");
                    }
                    Err(RecvError::Lagged(skipped)) => {
                        tracing::warn!(tenant_id = %self.tenant_id, skipped, "operations topic lagged");
                    }
                    Err(RecvError::Closed) => operations = None,
                },
                _ = child_exited(&mut self.replication) => {
                    tracing::warn!(tenant_id = %self.tenant_id, "replication child exited");
                    return StopReason::ChildExited("replication");
                }
                _ = child_exited(&mut self.listener) => {
                    tracing::warn!(tenant_id = %self.tenant_id, "listener child exited");
                    return StopReason::ChildExited("listener");
                }
                _ = tokio::time::sleep_until(next_check) => {
                    let connected = self.ctx.deps.clients.count_for_tenant(&self.tenant_id);
                    metrics::gauge!("ember_tenant_connected_clients", "tenant" => self.tenant_id.clone())
                        .set(connected as f64);
                    if self.idle.record(connected) {
                        tracing::info!(tenant_id = %self.tenant_id, "tenant idle, shutting down connection");
                        return StopReason::Idle;
                    }
                    next_check = Instant::now() + self.check_interval;
                }
            }
        }
    }

    async fn terminate(&mut self, reason: StopReason) {
        self.status.send_replace(ManagerStatus::Terminating);
        match &reason {
            StopReason::Failed(_) | StopReason::ConnectionDown | StopReason::ChildExited(_) => {
                tracing::warn!(tenant_id = %self.tenant_id, reason = %reason, "connection manager stopping");
            }
            _ => {
                tracing::info!(tenant_id = %self.tenant_id, reason = %reason, "connection manager stopping");
            }
        }

        let grace = self.ctx.settings.child_shutdown_grace;
        let children = [
            ("listener", self.listener.take()),
            ("replication", self.replication.take()),
        ];
        for (name, child) in children {
            if let Some(child) = child
                && let Err(err) = child.stop(grace).await
            {
                tracing::warn!(tenant_id = %self.tenant_id, child = name, error = %err, "child did not stop cleanly");
            }
        }

        if let Some(session) = self.session.take() {
            let usage = session.usage.snapshot();
            tracing::info!(
                tenant_id = %self.tenant_id,
                uptime_ms = session.usage.started_at().elapsed().as_millis() as u64,
                events = usage.events,
                joins = usage.joins,
                db_events = usage.db_events,
                presence_events = usage.presence_events,
                "tenant usage at stop"
            );
            if tokio::time::timeout(grace, session.conn.close()).await.is_err() {
                tracing::warn!(tenant_id = %self.tenant_id, "database connection did not close in time");
            }
        }

        self.ctx.counters.clear(&self.tenant_id);
        self.ctx.operations.release(&self.tenant_id);
        metrics::gauge!("ember_tenant_connected_clients", "tenant" => self.tenant_id.clone()).set(0.0);
        metrics::counter!("ember_tenant_manager_stops_total", "reason" => reason.label())
            .increment(1);

        // Entry goes away before anyone can observe `Terminated`.
        self.registration.take();
        self.status.send_replace(ManagerStatus::Terminated(reason));
    }
}

async fn next_operation(
    operations: &mut Option<broadcast::Receiver<TenantOperation>>,
) -> Result<TenantOperation, RecvError> {
    match operations {
        Some(rx) => rx.recv().await,
        None => std::future::pending().await,
    }
}

async fn child_exited(child: &mut Option<ChildHandle>) {
    match child {
        Some(child) => child.exited().await,
        None => std::future::pending().await,
    }
}
