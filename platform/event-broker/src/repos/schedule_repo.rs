//! Scheduled-task repository.

use sqlx::PgPool;

use crate::error::BrokerResult;

/// A row from `broker_schedules`.
#[derive(Debug, Clone, sqlx::FromRow)]
pub struct ScheduleRecord {
    pub namespace: String,
    pub name: String,
    pub cron_expression: String,
    pub event_type: String,
    pub payload: serde_json::Value,
    pub producer_node_id: Option<String>,
    pub enabled: bool,
}

/// Upsert a schedule keyed on (namespace, name).
pub async fn upsert(
    pool: &PgPool,
    namespace: &str,
    name: &str,
    cron_expression: &str,
    event_type: &str,
    payload: &serde_json::Value,
    producer_node_id: Option<&str>,
) -> BrokerResult<()> {
    sqlx::query(
        r#"
        INSERT INTO broker_schedules
            (namespace, name, cron_expression, event_type, payload, producer_node_id, enabled)
        VALUES ($1, $2, $3, $4, $5, $6, TRUE)
        ON CONFLICT (namespace, name) DO UPDATE SET
            cron_expression  = EXCLUDED.cron_expression,
            event_type       = EXCLUDED.event_type,
            payload          = EXCLUDED.payload,
            producer_node_id = EXCLUDED.producer_node_id,
            enabled          = TRUE
        "#,
    )
    .bind(namespace)
    .bind(name)
    .bind(cron_expression)
    .bind(event_type)
    .bind(payload)
    .bind(producer_node_id)
    .execute(pool)
    .await?;

    Ok(())
}

/// Delete a schedule row. Returns whether a row existed.
pub async fn delete(pool: &PgPool, namespace: &str, name: &str) -> BrokerResult<bool> {
    let result = sqlx::query("DELETE FROM broker_schedules WHERE namespace = $1 AND name = $2")
        .bind(namespace)
        .bind(name)
        .execute(pool)
        .await?;

    Ok(result.rows_affected() > 0)
}

/// List all schedules in a namespace.
pub async fn list(pool: &PgPool, namespace: &str) -> BrokerResult<Vec<ScheduleRecord>> {
    let records = sqlx::query_as::<_, ScheduleRecord>(
        "SELECT * FROM broker_schedules WHERE namespace = $1 ORDER BY name",
    )
    .bind(namespace)
    .fetch_all(pool)
    .await?;

    Ok(records)
}
