//! Node registry and subscription index tests
//!
//! Validates the registry lifecycle against a live database:
//! 1. start/stop drive the ACTIVE set reported by list_active_nodes
//! 2. deregistration removes the node and its subscriptions atomically
//! 3. subscribe is idempotent; unsubscribe is idempotent
//! 4. heartbeats advance while a node is started
//!
//! Requires PostgreSQL with pgmq; run with:
//! `cargo test -p event-broker --test registry_test -- --ignored`

mod common;

use std::time::Duration;

use chrono::{DateTime, Utc};
use event_broker::{Broker, NodeConfig, NodeState};
use serde_json::json;
use serial_test::serial;

use common::{get_test_pool, reset_namespace, subscription_count, test_config, wait_until};

#[tokio::test]
#[serial]
#[ignore] // Run explicitly with: cargo test --test registry_test -- --ignored
async fn test_lifecycle_drives_active_set() {
    let pool = get_test_pool().await;
    let namespace = "tlife";
    reset_namespace(&pool, namespace).await;

    let broker = Broker::connect(test_config(namespace))
        .await
        .expect("Failed to connect broker");

    let node = broker
        .register_node(
            NodeConfig::new("lifecycle-node")
                .with_display_name("Lifecycle")
                .with_metadata(json!({"team": "platform"})),
        )
        .await
        .expect("Failed to register node");
    assert_eq!(node.state(), NodeState::Registered);

    // Registered but not started: not active.
    let active = broker.list_active_nodes().await.expect("list failed");
    assert!(active.is_empty());

    node.start().await.expect("Failed to start node");
    assert_eq!(node.state(), NodeState::Active);

    let active = broker.list_active_nodes().await.expect("list failed");
    assert_eq!(active.len(), 1);
    assert_eq!(active[0].node_id, "lifecycle-node");
    assert_eq!(active[0].worker_id, broker.worker_id());
    assert_eq!(active[0].metadata, json!({"team": "platform"}));

    node.stop().await;
    assert_eq!(node.state(), NodeState::Stopped);

    let active = broker.list_active_nodes().await.expect("list failed");
    assert!(active.is_empty());

    broker.close().await;
}

#[tokio::test]
#[serial]
#[ignore]
async fn test_deregister_removes_node_and_subscriptions() {
    let pool = get_test_pool().await;
    let namespace = "tdereg";
    reset_namespace(&pool, namespace).await;

    let broker = Broker::connect(test_config(namespace))
        .await
        .expect("Failed to connect broker");
    let node = broker
        .register_node(NodeConfig::new("doomed-node"))
        .await
        .expect("Failed to register node");

    node.on_event_fn("a", |_ctx, _payload| async { Ok(()) })
        .await
        .expect("Failed to subscribe to a");
    node.on_event_fn("b", |_ctx, _payload| async { Ok(()) })
        .await
        .expect("Failed to subscribe to b");
    node.start().await.expect("Failed to start node");

    assert_eq!(subscription_count(&pool, namespace, Some("doomed-node")).await, 2);

    broker
        .deregister_node("doomed-node")
        .await
        .expect("Failed to deregister");

    assert_eq!(subscription_count(&pool, namespace, Some("doomed-node")).await, 0);
    let active = broker.list_active_nodes().await.expect("list failed");
    assert!(active.iter().all(|n| n.node_id != "doomed-node"));

    let row_count: i64 = sqlx::query_scalar(
        "SELECT count(*) FROM broker_nodes WHERE namespace = $1 AND node_id = $2",
    )
    .bind(namespace)
    .bind("doomed-node")
    .fetch_one(&pool)
    .await
    .expect("Failed to count nodes");
    assert_eq!(row_count, 0);

    broker.close().await;
}

#[tokio::test]
#[serial]
#[ignore]
async fn test_subscribe_and_unsubscribe_are_idempotent() {
    let pool = get_test_pool().await;
    let namespace = "tidem";
    reset_namespace(&pool, namespace).await;

    let broker = Broker::connect(test_config(namespace))
        .await
        .expect("Failed to connect broker");
    let node = broker
        .register_node(NodeConfig::new("idem-node"))
        .await
        .expect("Failed to register node");

    // Two handlers for the same event type: still exactly one
    // subscription row.
    let first = node
        .on_event_fn("x", |_ctx, _payload| async { Ok(()) })
        .await
        .expect("Failed to subscribe");
    let second = node
        .on_event_fn("x", |_ctx, _payload| async { Ok(()) })
        .await
        .expect("Failed to subscribe again");

    assert_eq!(subscription_count(&pool, namespace, Some("idem-node")).await, 1);

    // The row survives while any handler remains.
    node.off_event("x", first).await.expect("off_event failed");
    assert_eq!(subscription_count(&pool, namespace, Some("idem-node")).await, 1);

    // Removing the last handler removes the row.
    node.off_event("x", second).await.expect("off_event failed");
    assert_eq!(subscription_count(&pool, namespace, Some("idem-node")).await, 0);

    // Unsubscribing again is a no-op.
    node.off_event("x", second).await.expect("off_event must be idempotent");
    assert_eq!(subscription_count(&pool, namespace, Some("idem-node")).await, 0);

    broker.close().await;
}

#[tokio::test]
#[serial]
#[ignore]
async fn test_heartbeat_advances_for_started_node() {
    let pool = get_test_pool().await;
    let namespace = "tbeat";
    reset_namespace(&pool, namespace).await;

    let broker = Broker::connect(test_config(namespace))
        .await
        .expect("Failed to connect broker");
    let node = broker
        .register_node(NodeConfig::new("beating-node"))
        .await
        .expect("Failed to register node");
    node.start().await.expect("Failed to start node");

    let initial: DateTime<Utc> = sqlx::query_scalar(
        "SELECT last_heartbeat_at FROM broker_nodes WHERE namespace = $1 AND node_id = $2",
    )
    .bind(namespace)
    .bind("beating-node")
    .fetch_one(&pool)
    .await
    .expect("Failed to read heartbeat");

    // Heartbeat interval is 1s in the test config.
    let advanced = wait_until(Duration::from_secs(10), || {
        let pool = pool.clone();
        async move {
            let current: DateTime<Utc> = sqlx::query_scalar(
                "SELECT last_heartbeat_at FROM broker_nodes WHERE namespace = $1 AND node_id = $2",
            )
            .bind(namespace)
            .bind("beating-node")
            .fetch_one(&pool)
            .await
            .expect("Failed to read heartbeat");
            current > initial
        }
    })
    .await;
    assert!(advanced, "heartbeat must advance while the node runs");

    broker.close().await;
}
