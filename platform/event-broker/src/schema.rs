//! Schema bootstrap.
//!
//! Idempotent creation of the registry tables, their indexes, and the
//! per-namespace ingress and dead-letter queues. Runs on every
//! `Broker::connect`; concurrent bootstraps from multiple processes are
//! safe because every statement is `IF NOT EXISTS` or a pgmq no-op.

use tracing::warn;

use crate::db::Db;
use crate::error::BrokerResult;
use crate::queue::{dlq_queue, ingress_queue, QueueAdapter};

const CREATE_NODES: &str = r#"
CREATE TABLE IF NOT EXISTS broker_nodes (
    namespace          TEXT        NOT NULL,
    node_id            TEXT        NOT NULL,
    worker_id          TEXT        NOT NULL,
    application        TEXT,
    display_name       TEXT,
    description        TEXT,
    metadata           JSONB       NOT NULL DEFAULT '{}'::jsonb,
    state              TEXT        NOT NULL DEFAULT 'REGISTERED',
    registered_at      TIMESTAMPTZ NOT NULL DEFAULT now(),
    last_heartbeat_at  TIMESTAMPTZ NOT NULL DEFAULT now(),
    PRIMARY KEY (namespace, node_id)
)
"#;

const CREATE_SUBSCRIPTIONS: &str = r#"
CREATE TABLE IF NOT EXISTS broker_subscriptions (
    namespace   TEXT NOT NULL,
    event_type  TEXT NOT NULL,
    node_id     TEXT NOT NULL,
    worker_id   TEXT NOT NULL,
    UNIQUE (namespace, event_type, node_id)
)
"#;

const CREATE_SUBSCRIPTION_INDEX: &str = r#"
CREATE INDEX IF NOT EXISTS idx_broker_subscriptions_lookup
    ON broker_subscriptions (namespace, event_type)
"#;

const CREATE_SCHEDULES: &str = r#"
CREATE TABLE IF NOT EXISTS broker_schedules (
    namespace         TEXT    NOT NULL,
    name              TEXT    NOT NULL,
    cron_expression   TEXT    NOT NULL,
    event_type        TEXT    NOT NULL,
    payload           JSONB   NOT NULL DEFAULT '{}'::jsonb,
    producer_node_id  TEXT,
    enabled           BOOLEAN NOT NULL DEFAULT TRUE,
    PRIMARY KEY (namespace, name)
)
"#;

/// Bootstrap registry tables and the namespace's ingress and DLQ queues.
pub async fn bootstrap(db: &Db, queue: &QueueAdapter, namespace: &str) -> BrokerResult<()> {
    ensure_pgmq(db).await;

    for statement in [
        CREATE_NODES,
        CREATE_SUBSCRIPTIONS,
        CREATE_SUBSCRIPTION_INDEX,
        CREATE_SCHEDULES,
    ] {
        sqlx::query(statement).execute(db.pool()).await?;
    }

    queue.create_queue(&ingress_queue(namespace)).await?;
    queue.create_queue(&dlq_queue(namespace)).await?;

    Ok(())
}

/// Try to install pgmq. Most managed databases pre-install it and the
/// connecting role lacks CREATE EXTENSION, so failure here is only a
/// warning; the queue creation right after surfaces a hard error if the
/// extension is truly absent.
async fn ensure_pgmq(db: &Db) {
    if let Err(e) = sqlx::query("CREATE EXTENSION IF NOT EXISTS pgmq CASCADE")
        .execute(db.pool())
        .await
    {
        warn!(error = %e, "Could not create pgmq extension, assuming it is pre-installed");
    }
}
