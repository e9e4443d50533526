mod common;

use async_trait::async_trait;
use common::{Harness, WAIT, eventually, node_id, wait_owner};
use ember_common::ids::NodeId;
use ember_connect::memory::StaticAssigner;
use ember_connect::{
    ConnectError, ConnectOptions, ConnectionHandle, NodeClient, RpcError,
};
use std::sync::Arc;
use std::time::Duration;

/// Transport whose calls never complete.
struct HangingClient;

#[async_trait]
impl NodeClient for HangingClient {
    async fn connect(
        &self,
        _node: &NodeId,
        _tenant_id: &str,
        _options: ConnectOptions,
    ) -> Result<ConnectionHandle, ConnectError> {
        std::future::pending().await
    }
}

#[tokio::test]
async fn request_is_forwarded_to_authoritative_node() {
    let harness = Harness::with_assigner(
        &["node-a", "node-b"],
        Arc::new(StaticAssigner(node_id("node-b"))),
    );
    harness.add_tenant("t1");

    let conn = harness
        .node("node-a")
        .lookup_or_start_connection("t1", ConnectOptions::default())
        .await
        .expect("forwarded connect");
    assert_eq!(conn.node().as_str(), "node-b");
    assert!(harness.node("node-a").local_managers().is_empty());
    assert_eq!(harness.node("node-b").local_managers().len(), 1);

    // Every node sees the same registry entry.
    assert_eq!(harness.node("node-a").get_status("t1"), Ok(conn.clone()));
    let owner = harness.node("node-a").whereis("t1").expect("owner");
    assert_eq!(owner.node().as_str(), "node-b");

    // Shutdown from a non-owner still reaches the owner.
    harness.node("node-a").shutdown("t1");
    assert!(harness.wait_gone("t1").await);
}

#[tokio::test]
async fn hung_remote_call_times_out_with_rpc_error() {
    let harness = Harness::with_client(
        &["node-a"],
        Arc::new(StaticAssigner(node_id("node-b"))),
        Arc::new(HangingClient),
    );
    harness.add_tenant("t1");
    let options = ConnectOptions::default().with_rpc_timeout(Duration::from_millis(50));

    let result = tokio::time::timeout(
        WAIT,
        harness
            .node("node-a")
            .lookup_or_start_connection("t1", options),
    )
    .await
    .expect("caller must not hang");
    let err = result.expect_err("timeout");
    assert_eq!(
        err,
        ConnectError::Rpc(RpcError::Timeout {
            node: node_id("node-b"),
            after: Duration::from_millis(50),
        })
    );
    assert!(err.is_retryable());
    assert!(harness.registry.is_empty());
}

#[tokio::test]
async fn unknown_node_is_reported_down() {
    let harness = Harness::with_assigner(
        &["node-a"],
        Arc::new(StaticAssigner(node_id("node-z"))),
    );
    harness.add_tenant("t1");
    let err = harness
        .node("node-a")
        .lookup_or_start_connection("t1", ConnectOptions::default())
        .await
        .expect_err("node down");
    assert_eq!(err, ConnectError::Rpc(RpcError::NodeDown(node_id("node-z"))));
}

#[tokio::test]
async fn cached_suspension_fails_fast() {
    let harness = Harness::with_assigner(
        &["node-a", "node-b"],
        Arc::new(StaticAssigner(node_id("node-b"))),
    );
    harness.add_tenant("t1");
    harness.backend.tenants.set_suspended("t1", true);

    let err = harness
        .node("node-a")
        .lookup_or_start_connection("t1", ConnectOptions::default())
        .await
        .expect_err("suspended");
    assert_eq!(err, ConnectError::TenantSuspended);
    assert_eq!(harness.backend.tenants.lookups(), 0);
    assert_eq!(harness.backend.database.connects(), 0);
    assert!(harness.node("node-b").local_managers().is_empty());
}

#[tokio::test]
async fn tenant_store_failure_is_returned_to_caller() {
    let harness = Harness::new(&["node-a"]);
    harness.add_tenant("t1");
    harness.backend.tenants.fail_lookups(true);
    let err = harness
        .node("node-a")
        .lookup_or_start_connection("t1", ConnectOptions::default())
        .await
        .expect_err("store down");
    assert!(matches!(err, ConnectError::TenantLookup(_)));
}

#[tokio::test]
async fn unavailable_registry_is_surfaced_without_retry() {
    let harness = Harness::new(&["node-a"]);
    harness.add_tenant("t1");
    harness.registry.set_available(false);
    let node = harness.node("node-a");

    assert_eq!(node.get_status("t1"), Err(ConnectError::Unavailable));
    let err = node
        .lookup_or_start_connection("t1", ConnectOptions::default())
        .await
        .expect_err("unavailable");
    assert_eq!(err, ConnectError::Unavailable);
    assert!(node.whereis("t1").is_none());
    assert_eq!(harness.backend.database.connects(), 0);

    harness.registry.set_available(true);
    node.lookup_or_start_connection("t1", ConnectOptions::default())
        .await
        .expect("registry back");
}

#[tokio::test]
async fn initializing_owner_is_joined_after_backoff() {
    let harness = Harness::with_assigner(
        &["node-a", "node-b"],
        Arc::new(StaticAssigner(node_id("node-a"))),
    );
    harness.add_tenant("t1");
    harness
        .backend
        .database
        .set_connect_delay(Some(Duration::from_millis(150)));

    let first = {
        let node = Arc::clone(harness.node("node-a"));
        tokio::spawn(async move {
            node.lookup_or_start_connection("t1", ConnectOptions::default())
                .await
        })
    };
    wait_owner(&harness, "t1").await.expect("claimed");
    let node_b = harness.node("node-b");
    assert_eq!(
        node_b.get_status("t1"),
        Err(ConnectError::ConnectionInitializing)
    );

    let second = node_b
        .lookup_or_start_connection("t1", ConnectOptions::default())
        .await
        .expect("joined");
    let first = first.await.expect("join").expect("first");
    assert_eq!(first, second);
    assert_eq!(harness.backend.database.connects(), 1);
}

#[tokio::test]
async fn registered_connection_skips_tenant_lookup() {
    let harness = Harness::new(&["node-a", "node-b"]);
    harness.add_tenant("t1");
    let conn = harness
        .node("node-a")
        .lookup_or_start_connection("t1", ConnectOptions::default())
        .await
        .expect("connect");

    harness.backend.tenants.fail_lookups(true);
    for node in harness.nodes() {
        let again = node
            .lookup_or_start_connection("t1", ConnectOptions::default())
            .await
            .expect("registered");
        assert_eq!(again, conn);
    }
}

#[tokio::test]
async fn each_tenant_has_one_owner_on_its_assigned_node() {
    let harness = Harness::new(&["node-a", "node-b", "node-c"]);
    let tenants: Vec<String> = (0..12).map(|i| format!("tenant-{i}")).collect();
    for tenant in &tenants {
        harness.add_tenant(tenant);
    }

    let mut calls = Vec::new();
    for tenant in &tenants {
        for node in harness.nodes() {
            let node = Arc::clone(node);
            let tenant = tenant.clone();
            calls.push(tokio::spawn(async move {
                node.lookup_or_start_connection(&tenant, ConnectOptions::default())
                    .await
            }));
        }
    }
    for call in calls {
        call.await.expect("join").expect("connect");
    }

    for tenant in &tenants {
        assert_eq!(harness.managers_for(tenant), 1, "{tenant}");
        let owner = harness.node("node-a").whereis(tenant).expect("owner");
        assert_eq!(owner.node(), &harness.owner_of(tenant));
    }
    assert_eq!(harness.registry.len(), tenants.len());

    for node in harness.nodes() {
        node.shutdown_all(WAIT).await;
    }
    assert!(eventually(WAIT, || harness.registry.is_empty()).await);
}
