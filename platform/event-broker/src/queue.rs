//! Queue adapter over the pgmq extension.
//!
//! All queue traffic goes through here: create/drop, send, visibility-timeout
//! reads, delete (ack), and archive. Operations are idempotent on the
//! "already exists / already deleted" axis: deleting a message another
//! process acked is reported as `false`, never as an error.
//!
//! pgmq restricts queue names to `[a-zA-Z0-9_]`, so the logical names
//! `ingress.<ns>` / `worker.<ns>.<workerId>` / `dlq.<ns>` map to physical
//! names with `_` separators (and `-` in namespaces folded to `_`).

use chrono::{DateTime, Utc};

use crate::db::Db;
use crate::envelope::EventEnvelope;
use crate::error::{BrokerError, BrokerResult};

/// Physical name of the per-namespace ingress queue.
pub fn ingress_queue(namespace: &str) -> String {
    format!("ingress_{}", sanitize(namespace))
}

/// Physical name of a per-worker queue.
pub fn worker_queue(namespace: &str, worker_id: &str) -> String {
    format!("worker_{}_{}", sanitize(namespace), sanitize(worker_id))
}

/// Physical name of the per-namespace dead-letter queue.
pub fn dlq_queue(namespace: &str) -> String {
    format!("dlq_{}", sanitize(namespace))
}

fn sanitize(part: &str) -> String {
    part.replace('-', "_")
}

/// A message leased from a queue.
///
/// `message_id` and `redelivery_count` are authoritative from the queue
/// extension; producers never set them. `redelivery_count` is zero on the
/// first delivery and monotonically non-decreasing per message.
#[derive(Debug, Clone, sqlx::FromRow)]
pub struct LeasedMessage {
    pub message_id: i64,
    pub redelivery_count: i32,
    /// When the current lease expires and the message becomes visible again.
    pub visible_at: DateTime<Utc>,
    /// Raw envelope JSON exactly as stored; forwarded verbatim on fan-out.
    pub envelope: serde_json::Value,
}

impl LeasedMessage {
    /// Parse the envelope into its typed form. Unknown fields are kept.
    pub fn parse_envelope(&self) -> Result<EventEnvelope, serde_json::Error> {
        serde_json::from_value(self.envelope.clone())
    }
}

/// Adapter for the six queue operations the broker needs.
#[derive(Clone, Debug)]
pub struct QueueAdapter {
    db: Db,
}

impl QueueAdapter {
    pub fn new(db: Db) -> Self {
        Self { db }
    }

    /// Create a queue. pgmq's create is a no-op if the queue exists.
    pub async fn create_queue(&self, queue: &str) -> BrokerResult<()> {
        sqlx::query("SELECT pgmq.create($1)")
            .bind(queue)
            .execute(self.db.pool())
            .await
            .map_err(|e| queue_op_error("create", queue, e))?;
        Ok(())
    }

    /// Drop a queue if it exists. Dropping an absent queue is a no-op;
    /// returns whether a queue was actually dropped.
    pub async fn drop_queue(&self, queue: &str) -> BrokerResult<bool> {
        let dropped = sqlx::query_scalar::<_, bool>(
            "SELECT pgmq.drop_queue(queue_name) FROM pgmq.meta WHERE queue_name = $1",
        )
        .bind(queue)
        .fetch_all(self.db.pool())
        .await
        .map_err(|e| queue_op_error("drop", queue, e))?;
        Ok(!dropped.is_empty())
    }

    /// Send one envelope, returning the queue-assigned message id.
    pub async fn send(&self, queue: &str, envelope: &EventEnvelope) -> BrokerResult<i64> {
        let value = serde_json::to_value(envelope)?;
        self.send_value(queue, &value).await
    }

    /// Send a raw envelope JSON value.
    ///
    /// The router forwards leased envelopes through this path so unknown
    /// fields survive fan-out byte-for-byte.
    pub async fn send_value(&self, queue: &str, envelope: &serde_json::Value) -> BrokerResult<i64> {
        let message_id = sqlx::query_scalar::<_, i64>("SELECT pgmq.send($1, $2)")
            .bind(queue)
            .bind(envelope)
            .fetch_one(self.db.pool())
            .await
            .map_err(|e| queue_op_error("send", queue, e))?;
        Ok(message_id)
    }

    /// Send a batch of raw envelopes, returning their message ids in order.
    pub async fn send_batch(
        &self,
        queue: &str,
        envelopes: &[serde_json::Value],
    ) -> BrokerResult<Vec<i64>> {
        if envelopes.is_empty() {
            return Ok(Vec::new());
        }
        let ids = sqlx::query_scalar::<_, i64>("SELECT pgmq.send_batch($1, $2::jsonb[])")
            .bind(queue)
            .bind(envelopes)
            .fetch_all(self.db.pool())
            .await
            .map_err(|e| queue_op_error("send_batch", queue, e))?;
        Ok(ids)
    }

    /// Lease up to `qty` messages, hiding them for `visibility_timeout_secs`.
    ///
    /// Concurrent readers never lease the same message; mutual exclusion is
    /// the extension's visibility-timeout semantics.
    pub async fn read(
        &self,
        queue: &str,
        visibility_timeout_secs: i32,
        qty: i32,
    ) -> BrokerResult<Vec<LeasedMessage>> {
        let rows = sqlx::query_as::<_, LeasedMessage>(
            r#"
            SELECT msg_id       AS message_id,
                   read_ct - 1  AS redelivery_count,
                   vt           AS visible_at,
                   message      AS envelope
            FROM pgmq.read($1, $2, $3)
            "#,
        )
        .bind(queue)
        .bind(visibility_timeout_secs)
        .bind(qty)
        .fetch_all(self.db.pool())
        .await
        .map_err(|e| queue_op_error("read", queue, e))?;
        Ok(rows)
    }

    /// Acknowledge (delete) a leased message.
    ///
    /// Returns `false` when the message was already gone, which callers
    /// treat as success: another process acked it between read and delete.
    pub async fn delete(&self, queue: &str, message_id: i64) -> BrokerResult<bool> {
        let deleted = sqlx::query_scalar::<_, bool>("SELECT pgmq.delete($1, $2)")
            .bind(queue)
            .bind(message_id)
            .fetch_one(self.db.pool())
            .await
            .map_err(|e| queue_op_error("delete", queue, e))?;
        Ok(deleted)
    }

    /// Move a message to the queue's archive table.
    pub async fn archive(&self, queue: &str, message_id: i64) -> BrokerResult<bool> {
        let archived = sqlx::query_scalar::<_, bool>("SELECT pgmq.archive($1, $2)")
            .bind(queue)
            .bind(message_id)
            .fetch_one(self.db.pool())
            .await
            .map_err(|e| queue_op_error("archive", queue, e))?;
        Ok(archived)
    }

    /// Whether an error means the target queue's table is missing, e.g. a
    /// worker queue the reaper already dropped.
    pub fn is_missing_queue_error(error: &BrokerError) -> bool {
        let source = match error {
            BrokerError::Queue { source, .. } => source,
            BrokerError::Database(source) => source,
            _ => return false,
        };
        // 42P01 = undefined_table
        matches!(source, sqlx::Error::Database(db_err)
            if db_err.code().as_deref() == Some("42P01"))
    }
}

fn queue_op_error(operation: &'static str, queue: &str, source: sqlx::Error) -> BrokerError {
    BrokerError::Queue {
        operation,
        queue: queue.to_string(),
        source,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_queue_name_mapping() {
        assert_eq!(ingress_queue("default"), "ingress_default");
        assert_eq!(dlq_queue("default"), "dlq_default");
        assert_eq!(worker_queue("default", "a1b2c3"), "worker_default_a1b2c3");
    }

    #[test]
    fn test_queue_names_fold_hyphens() {
        assert_eq!(ingress_queue("tenant-42"), "ingress_tenant_42");
        assert_eq!(worker_queue("tenant-42", "w-1"), "worker_tenant_42_w_1");
        assert_eq!(dlq_queue("tenant-42"), "dlq_tenant_42");
    }
}
