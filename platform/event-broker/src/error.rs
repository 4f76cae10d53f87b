//! Error types for broker operations.

/// Errors surfaced by the broker facade and its components.
///
/// Background loops (router, consumer, reaper, heartbeat) never propagate
/// these; they log and keep running. Facade operations (`connect`, `emit`,
/// `register_node`, `schedule_task`) return them to the caller unmodified.
#[derive(Debug, thiserror::Error)]
pub enum BrokerError {
    /// Invalid configuration: bad DSN, malformed namespace, bad cron
    /// expression. Fatal at startup, never retried.
    #[error("configuration error: {0}")]
    Configuration(String),

    /// Database failure outside the queue adapter. Transient: retried
    /// with bounded backoff where a loop owns the operation.
    #[error("database error: {0}")]
    Database(#[from] sqlx::Error),

    /// Queue operation failure that is not an already-deleted race
    /// (those are swallowed by the adapter as `Ok(false)`). Treated like
    /// any other transient database failure.
    #[error("queue operation {operation} on {queue} failed: {source}")]
    Queue {
        operation: &'static str,
        queue: String,
        #[source]
        source: sqlx::Error,
    },

    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// An envelope that is structurally unusable (missing namespace or
    /// event type). Such messages go straight to the DLQ; retrying
    /// cannot fix them.
    #[error("envelope invariant violated: {0}")]
    InvariantViolation(String),

    #[error("schedule error: {0}")]
    Schedule(String),
}

/// Result type for broker operations
pub type BrokerResult<T> = Result<T, BrokerError>;

impl BrokerError {
    /// Whether retrying with backoff can plausibly succeed. The retry
    /// helper short-circuits on anything else.
    pub fn is_transient(&self) -> bool {
        matches!(
            self,
            BrokerError::Database(_) | BrokerError::Queue { .. }
        )
    }
}
