//! Scheduler bridge tests
//!
//! Requires PostgreSQL with BOTH pgmq and pg_cron installed (pg_cron must
//! be in shared_preload_libraries). Run with:
//! `cargo test -p event-broker --test scheduler_test -- --ignored`

mod common;

use event_broker::{Broker, NodeConfig, ScheduledTask};
use serde_json::json;
use serial_test::serial;

use common::{get_test_pool, reset_namespace, test_config};

#[tokio::test]
#[serial]
#[ignore] // Run explicitly with: cargo test --test scheduler_test -- --ignored
async fn test_schedule_and_unschedule_roundtrip() {
    let pool = get_test_pool().await;
    let namespace = "tsched";
    reset_namespace(&pool, namespace).await;

    let broker = Broker::connect(test_config(namespace))
        .await
        .expect("Failed to connect broker");
    let node = broker
        .register_node(NodeConfig::new("cron-node"))
        .await
        .expect("Failed to register node");

    node.schedule_task(ScheduledTask::new(
        "nightly-report",
        "0 3 * * *",
        "report.due",
        json!({"kind": "nightly"}),
    ))
    .await
    .expect("Failed to schedule task");

    let (cron_expression, event_type, producer, enabled): (String, String, Option<String>, bool) =
        sqlx::query_as(
            r#"
            SELECT cron_expression, event_type, producer_node_id, enabled
            FROM broker_schedules WHERE namespace = $1 AND name = $2
            "#,
        )
        .bind(namespace)
        .bind("nightly-report")
        .fetch_one(&pool)
        .await
        .expect("Schedule row must exist");
    assert_eq!(cron_expression, "0 3 * * *");
    assert_eq!(event_type, "report.due");
    assert_eq!(producer.as_deref(), Some("cron-node"));
    assert!(enabled);

    let job_command: String = sqlx::query_scalar(
        "SELECT command FROM cron.job WHERE jobname = $1",
    )
    .bind(format!("event_broker_{namespace}_nightly-report"))
    .fetch_one(&pool)
    .await
    .expect("Cron job must exist");
    assert!(job_command.contains(&format!("ingress_{namespace}")));
    assert!(job_command.contains("report.due"));

    node.unschedule_task("nightly-report")
        .await
        .expect("Failed to unschedule");

    let rows: i64 = sqlx::query_scalar(
        "SELECT count(*) FROM broker_schedules WHERE namespace = $1 AND name = $2",
    )
    .bind(namespace)
    .bind("nightly-report")
    .fetch_one(&pool)
    .await
    .expect("Failed to count schedule rows");
    assert_eq!(rows, 0);

    let jobs: i64 = sqlx::query_scalar("SELECT count(*) FROM cron.job WHERE jobname = $1")
        .bind(format!("event_broker_{namespace}_nightly-report"))
        .fetch_one(&pool)
        .await
        .expect("Failed to count cron jobs");
    assert_eq!(jobs, 0);

    // Unscheduling again is a no-op, not an error.
    node.unschedule_task("nightly-report")
        .await
        .expect("unschedule must be idempotent");

    broker.close().await;
}

#[tokio::test]
#[serial]
#[ignore]
async fn test_invalid_cron_expression_is_rejected_up_front() {
    let pool = get_test_pool().await;
    let namespace = "tbadcron";
    reset_namespace(&pool, namespace).await;

    let broker = Broker::connect(test_config(namespace))
        .await
        .expect("Failed to connect broker");
    let node = broker
        .register_node(NodeConfig::new("cron-node"))
        .await
        .expect("Failed to register node");

    let result = node
        .schedule_task(ScheduledTask::new(
            "broken",
            "every now and then",
            "report.due",
            json!({}),
        ))
        .await;
    assert!(result.is_err(), "malformed cron must be rejected");

    // Nothing was persisted.
    let rows: i64 = sqlx::query_scalar(
        "SELECT count(*) FROM broker_schedules WHERE namespace = $1",
    )
    .bind(namespace)
    .fetch_one(&pool)
    .await
    .expect("Failed to count schedule rows");
    assert_eq!(rows, 0);

    broker.close().await;
}
