//! Lease reaper.
//!
//! Exactly one process per namespace performs each scan, elected with a
//! transaction-scoped advisory lock on a namespace key; losers skip the
//! scan and try again next interval. The winner transitions ACTIVE nodes
//! whose heartbeat is older than the lease TTL to LOST. A LOST worker's
//! queue keeps draining; once every node of a worker has been LOST for the
//! grace window the queue is dropped and its subscription rows are pruned.

use std::sync::Arc;

use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use crate::config::BrokerConfig;
use crate::db::Db;
use crate::error::BrokerResult;
use crate::queue::{worker_queue, QueueAdapter};
use crate::repos::subscription_repo;

pub(crate) async fn run_reaper(
    db: Db,
    queue: QueueAdapter,
    config: Arc<BrokerConfig>,
    cancel: CancellationToken,
) {
    let namespace = config.namespace.clone();
    info!(namespace = %namespace, "Starting reaper task");

    loop {
        tokio::select! {
            _ = cancel.cancelled() => break,
            _ = tokio::time::sleep(config.heartbeat_interval()) => {}
        }

        if let Err(e) = scan(&db, &queue, &config).await {
            warn!(
                namespace = %namespace,
                error = %e,
                "Reaper scan failed, will retry next interval"
            );
        }
    }

    info!(namespace = %namespace, "Reaper task stopped");
}

async fn scan(db: &Db, queue: &QueueAdapter, config: &BrokerConfig) -> BrokerResult<()> {
    let namespace = &config.namespace;
    let mut tx = db.begin().await?;

    // Per-scan election: whoever gets the advisory lock scans, everyone
    // else backs off until the next interval.
    let elected = sqlx::query_scalar::<_, bool>(
        "SELECT pg_try_advisory_xact_lock(hashtext($1)::bigint)",
    )
    .bind(format!("event_broker_reaper_{namespace}"))
    .fetch_one(&mut *tx)
    .await?;
    if !elected {
        return Ok(());
    }

    let lost = sqlx::query_as::<_, (String, String)>(
        r#"
        UPDATE broker_nodes
        SET state = 'LOST'
        WHERE namespace = $1
          AND state = 'ACTIVE'
          AND last_heartbeat_at < now() - make_interval(secs => $2)
        RETURNING node_id, worker_id
        "#,
    )
    .bind(namespace)
    .bind(config.lease_ttl_seconds as f64)
    .fetch_all(&mut *tx)
    .await?;

    // Workers whose every node has been LOST past the grace window; their
    // queues have nobody left to drain them.
    let orphaned_workers = sqlx::query_scalar::<_, String>(
        r#"
        SELECT DISTINCT n.worker_id
        FROM broker_nodes n
        WHERE n.namespace = $1
          AND n.state = 'LOST'
          AND n.last_heartbeat_at < now() - make_interval(secs => $2)
          AND NOT EXISTS (
              SELECT 1 FROM broker_nodes o
              WHERE o.namespace = n.namespace
                AND o.worker_id = n.worker_id
                AND o.state <> 'LOST'
          )
        "#,
    )
    .bind(namespace)
    .bind((config.lease_ttl_seconds + config.queue_drop_grace_seconds) as f64)
    .fetch_all(&mut *tx)
    .await?;

    tx.commit().await?;

    for (node_id, worker_id) in &lost {
        warn!(
            namespace = %namespace,
            node_id = %node_id,
            worker_id = %worker_id,
            lease_ttl_secs = config.lease_ttl_seconds,
            "Node missed its lease, marked LOST"
        );
    }

    for worker_id in &orphaned_workers {
        let queue_name = worker_queue(namespace, worker_id);
        match queue.drop_queue(&queue_name).await {
            Ok(true) => {
                info!(
                    namespace = %namespace,
                    worker_id = %worker_id,
                    queue = %queue_name,
                    "Dropped orphaned worker queue"
                );
            }
            Ok(false) => {}
            Err(e) => {
                warn!(
                    namespace = %namespace,
                    queue = %queue_name,
                    error = %e,
                    "Failed to drop orphaned worker queue"
                );
                continue;
            }
        }

        match subscription_repo::delete_for_worker(db.pool(), namespace, worker_id).await {
            Ok(removed) if removed > 0 => {
                info!(
                    namespace = %namespace,
                    worker_id = %worker_id,
                    subscriptions = removed,
                    "Pruned subscriptions of reaped worker"
                );
            }
            Ok(_) => {}
            Err(e) => {
                warn!(
                    namespace = %namespace,
                    worker_id = %worker_id,
                    error = %e,
                    "Failed to prune subscriptions of reaped worker"
                );
            }
        }
    }

    Ok(())
}
