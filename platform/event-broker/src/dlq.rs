//! Dead-letter handling.
//!
//! An envelope that exhausts its delivery attempts (or is structurally
//! unusable) is wrapped in a [`DeadLetter`] record and sent to the
//! namespace's DLQ. The move is best-effort and non-transactional:
//! a crash between the DLQ send and the origin delete produces a duplicate
//! DLQ entry, which consumers detect via the embedded message id.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::queue::{dlq_queue, QueueAdapter};

/// Record stored on the dead-letter queue.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DeadLetter {
    /// Physical queue the message failed in
    pub origin_queue: String,
    /// Origin-queue message id; duplicate DLQ entries share it
    pub message_id: i64,
    /// The envelope exactly as it sat in the origin queue
    pub envelope: serde_json::Value,
    /// Last failure observed
    pub last_error: String,
    pub failed_at: DateTime<Utc>,
    /// Deliveries consumed before the move
    pub attempt_count: i32,
}

impl DeadLetter {
    pub fn new(
        origin_queue: impl Into<String>,
        message_id: i64,
        envelope: serde_json::Value,
        last_error: impl Into<String>,
        attempt_count: i32,
    ) -> Self {
        Self {
            origin_queue: origin_queue.into(),
            message_id,
            envelope,
            last_error: last_error.into(),
            failed_at: Utc::now(),
            attempt_count,
        }
    }
}

/// Move a message to the namespace DLQ and ack it in its origin queue.
///
/// Returns `true` when the origin message was deleted. Every failure path
/// logs; none of them propagates, since the callers are background loops
/// and the visibility timeout will retry the move on the next delivery.
pub(crate) async fn move_to_dlq(
    queue: &QueueAdapter,
    namespace: &str,
    origin_queue: &str,
    message_id: i64,
    envelope: serde_json::Value,
    error: &str,
    attempt_count: i32,
) -> bool {
    let record = DeadLetter::new(origin_queue, message_id, envelope, error, attempt_count);
    let dlq = dlq_queue(namespace);

    let value = match serde_json::to_value(&record) {
        Ok(v) => v,
        Err(serialize_err) => {
            tracing::error!(
                message_id = message_id,
                origin_queue = %origin_queue,
                error = %error,
                serialize_error = %serialize_err,
                "Failed to serialize dead letter - message will redeliver"
            );
            return false;
        }
    };

    if let Err(send_err) = queue.send_value(&dlq, &value).await {
        tracing::error!(
            message_id = message_id,
            origin_queue = %origin_queue,
            dlq = %dlq,
            error = %error,
            dlq_error = %send_err,
            "Failed to write to DLQ - message will redeliver"
        );
        return false;
    }

    match queue.delete(origin_queue, message_id).await {
        Ok(_) => {
            tracing::error!(
                message_id = message_id,
                origin_queue = %origin_queue,
                dlq = %dlq,
                attempt_count = attempt_count,
                error = %error,
                "Message moved to DLQ after retries exhausted"
            );
            true
        }
        Err(delete_err) => {
            tracing::error!(
                message_id = message_id,
                origin_queue = %origin_queue,
                dlq = %dlq,
                error = %error,
                delete_error = %delete_err,
                "Wrote DLQ entry but failed to ack origin - duplicate DLQ entry likely"
            );
            false
        }
    }
}
