//! Node registry repository.
//!
//! Register, heartbeat, and deregister nodes, plus the reaper's lease
//! queries. A node is a logical application component; the worker id ties
//! it to the OS process (and worker queue) currently hosting it.

use chrono::{DateTime, Utc};
use sqlx::PgPool;

use crate::db::Db;
use crate::error::BrokerResult;

/// Lifecycle state of a registered node.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NodeState {
    Registered,
    Active,
    Stopped,
    Lost,
}

impl NodeState {
    pub fn as_str(&self) -> &'static str {
        match self {
            NodeState::Registered => "REGISTERED",
            NodeState::Active => "ACTIVE",
            NodeState::Stopped => "STOPPED",
            NodeState::Lost => "LOST",
        }
    }

    pub fn from_str(s: &str) -> Option<Self> {
        match s {
            "REGISTERED" => Some(NodeState::Registered),
            "ACTIVE" => Some(NodeState::Active),
            "STOPPED" => Some(NodeState::Stopped),
            "LOST" => Some(NodeState::Lost),
            _ => None,
        }
    }
}

impl std::fmt::Display for NodeState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A row from `broker_nodes`.
#[derive(Debug, Clone, sqlx::FromRow)]
pub struct NodeRecord {
    pub namespace: String,
    pub node_id: String,
    pub worker_id: String,
    pub application: Option<String>,
    pub display_name: Option<String>,
    pub description: Option<String>,
    pub metadata: serde_json::Value,
    pub state: String,
    pub registered_at: DateTime<Utc>,
    pub last_heartbeat_at: DateTime<Utc>,
}

impl NodeRecord {
    pub fn node_state(&self) -> Option<NodeState> {
        NodeState::from_str(&self.state)
    }
}

/// Upsert a node keyed on (namespace, node_id).
///
/// Re-registration rebinds the node to the current worker and resets it to
/// REGISTERED; display fields and metadata are informational only and never
/// affect routing.
pub async fn upsert(
    pool: &PgPool,
    namespace: &str,
    node_id: &str,
    worker_id: &str,
    application: Option<&str>,
    display_name: Option<&str>,
    description: Option<&str>,
    metadata: &serde_json::Value,
) -> BrokerResult<NodeRecord> {
    let record = sqlx::query_as::<_, NodeRecord>(
        r#"
        INSERT INTO broker_nodes
            (namespace, node_id, worker_id, application, display_name, description, metadata)
        VALUES ($1, $2, $3, $4, $5, $6, $7)
        ON CONFLICT (namespace, node_id) DO UPDATE SET
            worker_id         = EXCLUDED.worker_id,
            application       = EXCLUDED.application,
            display_name      = EXCLUDED.display_name,
            description       = EXCLUDED.description,
            metadata          = EXCLUDED.metadata,
            state             = 'REGISTERED',
            last_heartbeat_at = now()
        RETURNING *
        "#,
    )
    .bind(namespace)
    .bind(node_id)
    .bind(worker_id)
    .bind(application)
    .bind(display_name)
    .bind(description)
    .bind(metadata)
    .fetch_one(pool)
    .await?;

    Ok(record)
}

/// Set a node's lifecycle state, touching the heartbeat.
pub async fn set_state(
    pool: &PgPool,
    namespace: &str,
    node_id: &str,
    state: NodeState,
) -> BrokerResult<()> {
    sqlx::query(
        r#"
        UPDATE broker_nodes
        SET state = $3, last_heartbeat_at = now()
        WHERE namespace = $1 AND node_id = $2
        "#,
    )
    .bind(namespace)
    .bind(node_id)
    .bind(state.as_str())
    .execute(pool)
    .await?;

    Ok(())
}

/// Update `last_heartbeat_at` for a set of nodes.
pub async fn heartbeat(pool: &PgPool, namespace: &str, node_ids: &[String]) -> BrokerResult<u64> {
    if node_ids.is_empty() {
        return Ok(0);
    }
    let result = sqlx::query(
        r#"
        UPDATE broker_nodes
        SET last_heartbeat_at = now()
        WHERE namespace = $1 AND node_id = ANY($2)
        "#,
    )
    .bind(namespace)
    .bind(node_ids)
    .execute(pool)
    .await?;

    Ok(result.rows_affected())
}

/// Delete a node and its subscriptions in one transaction.
///
/// The worker queue is untouched: the worker may still host other nodes.
pub async fn deregister(db: &Db, namespace: &str, node_id: &str) -> BrokerResult<()> {
    let mut tx = db.begin().await?;

    sqlx::query("DELETE FROM broker_subscriptions WHERE namespace = $1 AND node_id = $2")
        .bind(namespace)
        .bind(node_id)
        .execute(&mut *tx)
        .await?;

    sqlx::query("DELETE FROM broker_nodes WHERE namespace = $1 AND node_id = $2")
        .bind(namespace)
        .bind(node_id)
        .execute(&mut *tx)
        .await?;

    tx.commit().await?;
    Ok(())
}

/// List nodes currently in the ACTIVE state.
pub async fn list_active(pool: &PgPool, namespace: &str) -> BrokerResult<Vec<NodeRecord>> {
    let records = sqlx::query_as::<_, NodeRecord>(
        r#"
        SELECT * FROM broker_nodes
        WHERE namespace = $1 AND state = 'ACTIVE'
        ORDER BY node_id
        "#,
    )
    .bind(namespace)
    .fetch_all(pool)
    .await?;

    Ok(records)
}

