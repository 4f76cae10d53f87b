//! Subscription repository.
//!
//! Maps (namespace, event_type) to the set of workers the router must copy
//! an envelope into. Rows are unique per (namespace, event_type, node_id);
//! lookups go through the `(namespace, event_type)` index.

use sqlx::PgPool;

use crate::error::BrokerResult;

/// Record a subscription. Idempotent: repeating the call leaves exactly one
/// row, rebound to the node's current worker.
pub async fn subscribe(
    pool: &PgPool,
    namespace: &str,
    event_type: &str,
    node_id: &str,
    worker_id: &str,
) -> BrokerResult<()> {
    sqlx::query(
        r#"
        INSERT INTO broker_subscriptions (namespace, event_type, node_id, worker_id)
        VALUES ($1, $2, $3, $4)
        ON CONFLICT (namespace, event_type, node_id)
            DO UPDATE SET worker_id = EXCLUDED.worker_id
        "#,
    )
    .bind(namespace)
    .bind(event_type)
    .bind(node_id)
    .bind(worker_id)
    .execute(pool)
    .await?;

    Ok(())
}

/// Remove a subscription. Idempotent.
pub async fn unsubscribe(
    pool: &PgPool,
    namespace: &str,
    event_type: &str,
    node_id: &str,
) -> BrokerResult<()> {
    sqlx::query(
        r#"
        DELETE FROM broker_subscriptions
        WHERE namespace = $1 AND event_type = $2 AND node_id = $3
        "#,
    )
    .bind(namespace)
    .bind(event_type)
    .bind(node_id)
    .execute(pool)
    .await?;

    Ok(())
}

/// Distinct workers subscribed to an event type.
pub async fn lookup_destinations(
    pool: &PgPool,
    namespace: &str,
    event_type: &str,
) -> BrokerResult<Vec<String>> {
    let workers = sqlx::query_scalar::<_, String>(
        r#"
        SELECT DISTINCT worker_id FROM broker_subscriptions
        WHERE namespace = $1 AND event_type = $2
        "#,
    )
    .bind(namespace)
    .bind(event_type)
    .fetch_all(pool)
    .await?;

    Ok(workers)
}

/// Distinct workers hosting at least one ACTIVE node; the broadcast
/// destination set.
pub async fn lookup_all_workers(pool: &PgPool, namespace: &str) -> BrokerResult<Vec<String>> {
    let workers = sqlx::query_scalar::<_, String>(
        r#"
        SELECT DISTINCT worker_id FROM broker_nodes
        WHERE namespace = $1 AND state = 'ACTIVE'
        "#,
    )
    .bind(namespace)
    .fetch_all(pool)
    .await?;

    Ok(workers)
}

/// Drop every subscription bound to a worker. The reaper calls this when it
/// retires the worker's queue.
pub async fn delete_for_worker(
    pool: &PgPool,
    namespace: &str,
    worker_id: &str,
) -> BrokerResult<u64> {
    let result = sqlx::query(
        "DELETE FROM broker_subscriptions WHERE namespace = $1 AND worker_id = $2",
    )
    .bind(namespace)
    .bind(worker_id)
    .execute(pool)
    .await?;

    Ok(result.rows_affected())
}
