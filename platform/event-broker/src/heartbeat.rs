//! Worker heartbeat task.
//!
//! Periodically refreshes `last_heartbeat_at` for every active local node
//! so the reaper knows the worker is alive. On cancellation it performs a
//! final flush before exiting, so a graceful shutdown leaves fresh
//! timestamps behind.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::RwLock;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::db::Db;
use crate::node::NodeInner;
use crate::repos::node_repo;

pub(crate) async fn run_heartbeat(
    db: Db,
    namespace: String,
    nodes: Arc<RwLock<HashMap<String, Arc<NodeInner>>>>,
    interval: Duration,
    cancel: CancellationToken,
) {
    info!(namespace = %namespace, interval_secs = interval.as_secs(), "Starting heartbeat task");

    loop {
        tokio::select! {
            _ = cancel.cancelled() => {
                flush(&db, &namespace, &nodes).await;
                break;
            }
            _ = tokio::time::sleep(interval) => {
                flush(&db, &namespace, &nodes).await;
            }
        }
    }

    info!(namespace = %namespace, "Heartbeat task stopped");
}

pub(crate) async fn flush(
    db: &Db,
    namespace: &str,
    nodes: &Arc<RwLock<HashMap<String, Arc<NodeInner>>>>,
) {
    let node_ids: Vec<String> = {
        let nodes = nodes.read().await;
        nodes
            .values()
            .filter(|node| node.is_active())
            .map(|node| node.node_id.clone())
            .collect()
    };

    if node_ids.is_empty() {
        return;
    }

    match node_repo::heartbeat(db.pool(), namespace, &node_ids).await {
        Ok(updated) => {
            debug!(namespace = %namespace, nodes = updated, "Heartbeat flushed");
        }
        Err(e) => {
            warn!(
                namespace = %namespace,
                error = %e,
                "Heartbeat flush failed, will retry next interval"
            );
        }
    }
}
