//! Retry and DLQ behavior tests
//!
//! Validates the consumer-side failure path:
//! 1. A handler that always fails exhausts its attempts and the message
//!    moves to the namespace DLQ with a populated DeadLetter record
//! 2. The failed message is no longer visible in the worker queue
//! 3. Handler failures are retried via the visibility timeout, not inline
//!
//! Requires PostgreSQL with pgmq; run with:
//! `cargo test -p event-broker --test consumer_dlq_test -- --ignored`

mod common;

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use event_broker::{dlq_queue, worker_queue, Broker, DeadLetter, EmitOptions, NodeConfig};
use serde_json::json;
use serial_test::serial;

use common::{get_test_pool, queue_depth, queue_messages, reset_namespace, test_config, wait_until};

#[tokio::test]
#[serial]
#[ignore] // Run explicitly with: cargo test --test consumer_dlq_test -- --ignored
async fn test_failing_handler_exhausts_attempts_and_lands_in_dlq() {
    let pool = get_test_pool().await;
    let namespace = "tdlq";
    reset_namespace(&pool, namespace).await;

    let mut config = test_config(namespace);
    config.max_attempts = 2;

    let broker = Broker::connect(config)
        .await
        .expect("Failed to connect broker");
    let node = broker
        .register_node(NodeConfig::new("failing-node"))
        .await
        .expect("Failed to register node");

    let attempts = Arc::new(AtomicUsize::new(0));
    let count = attempts.clone();
    node.on_event_fn("boom", move |_ctx, _payload| {
        let count = count.clone();
        async move {
            count.fetch_add(1, Ordering::SeqCst);
            Err("handler exploded".into())
        }
    })
    .await
    .expect("Failed to subscribe");
    node.start().await.expect("Failed to start node");

    node.emit("boom", json!({"fuse": "lit"}), EmitOptions::default())
        .await
        .expect("Failed to emit");

    // Two failed deliveries (redelivery_count 0 and 1), then the third
    // read crosses max_attempts and moves the message to the DLQ.
    let dlq = dlq_queue(namespace);
    let dead_lettered = wait_until(Duration::from_secs(20), || {
        let pool = pool.clone();
        let dlq = dlq.clone();
        async move { queue_depth(&pool, &dlq).await >= 1 }
    })
    .await;
    assert!(dead_lettered, "message never reached the DLQ");

    assert_eq!(
        attempts.load(Ordering::SeqCst),
        2,
        "handler runs once per allowed attempt"
    );

    let records: Vec<DeadLetter> = queue_messages(&pool, &dlq)
        .await
        .into_iter()
        .map(|value| serde_json::from_value(value).expect("DLQ entry must parse as DeadLetter"))
        .collect();

    // Duplicate DLQ entries are permitted; all of them must describe the
    // same origin message.
    let first = &records[0];
    assert!(records.iter().all(|r| r.message_id == first.message_id));
    assert_eq!(first.origin_queue, worker_queue(namespace, broker.worker_id()));
    assert!(first.attempt_count >= 2);
    assert!(!first.last_error.is_empty());
    assert_eq!(first.envelope["event_type"], "boom");
    assert_eq!(first.envelope["payload"], json!({"fuse": "lit"}));

    // The original message is gone from the worker queue.
    let origin_empty = wait_until(Duration::from_secs(5), || {
        let pool = pool.clone();
        let queue = first.origin_queue.clone();
        async move { queue_depth(&pool, &queue).await == 0 }
    })
    .await;
    assert!(origin_empty, "failed message must leave the worker queue");

    broker.close().await;
}

#[tokio::test]
#[serial]
#[ignore]
async fn test_transient_failure_recovers_before_dlq() {
    let pool = get_test_pool().await;
    let namespace = "tflaky";
    reset_namespace(&pool, namespace).await;

    let mut config = test_config(namespace);
    config.max_attempts = 5;

    let broker = Broker::connect(config)
        .await
        .expect("Failed to connect broker");
    let node = broker
        .register_node(NodeConfig::new("flaky-node"))
        .await
        .expect("Failed to register node");

    // Fails on the first delivery, succeeds on the redelivery.
    let attempts = Arc::new(AtomicUsize::new(0));
    let count = attempts.clone();
    node.on_event_fn("flaky", move |ctx, _payload| {
        let count = count.clone();
        async move {
            count.fetch_add(1, Ordering::SeqCst);
            if ctx.redelivery_count == 0 {
                Err("first attempt fails".into())
            } else {
                Ok(())
            }
        }
    })
    .await
    .expect("Failed to subscribe");
    node.start().await.expect("Failed to start node");

    node.emit("flaky", json!({}), EmitOptions::default())
        .await
        .expect("Failed to emit");

    let recovered = wait_until(Duration::from_secs(15), || {
        let attempts = attempts.clone();
        async move { attempts.load(Ordering::SeqCst) >= 2 }
    })
    .await;
    assert!(recovered, "message must redeliver after the failed attempt");

    // Success on the retry means the DLQ stays empty and the worker
    // queue drains.
    tokio::time::sleep(Duration::from_secs(1)).await;
    assert_eq!(queue_depth(&pool, &dlq_queue(namespace)).await, 0);

    let queue = worker_queue(namespace, broker.worker_id());
    let drained = wait_until(Duration::from_secs(5), || {
        let pool = pool.clone();
        let queue = queue.clone();
        async move { queue_depth(&pool, &queue).await == 0 }
    })
    .await;
    assert!(drained, "acked message must leave the worker queue");
    assert_eq!(attempts.load(Ordering::SeqCst), 2);

    broker.close().await;
}
