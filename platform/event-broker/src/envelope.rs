//! # Event Envelope
//!
//! The serialized event record carried by every queue in the system.
//!
//! ## Envelope Fields
//!
//! - `namespace`: tenancy scope the event belongs to
//! - `event_type`: routing key consulted by the subscription index
//! - `payload`: opaque event data; the broker never parses it
//! - `emitted_at`: UTC timestamp assigned by the producer
//! - `producer_node_id`: node that emitted the event
//! - `broadcast`: route to every active worker instead of subscribers
//! - `causation_id`: links this event to the command/event that caused it
//!
//! The queue's `message_id` and `redelivery_count` are *not* envelope
//! fields; the queue adapter populates them on read.
//!
//! Unknown fields found on the wire are preserved verbatim across fan-out,
//! so envelopes written by newer producers survive older routers.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::error::{BrokerError, BrokerResult};

/// Event envelope as written to and read from queues.
///
/// # Examples
///
/// ```rust
/// use event_broker::EventEnvelope;
/// use serde_json::json;
///
/// let envelope = EventEnvelope::new(
///     "billing",
///     "invoice-service",
///     "invoice.issued",
///     json!({"invoice_id": "inv_42"}),
/// )
/// .with_causation_id(Some("cmd-123".to_string()));
/// ```
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EventEnvelope {
    /// Tenancy scope for routing
    pub namespace: String,

    /// Routing key, e.g. "invoice.issued"
    pub event_type: String,

    /// Opaque event data
    pub payload: serde_json::Value,

    /// UTC timestamp assigned when the envelope was built
    pub emitted_at: DateTime<Utc>,

    /// Node that emitted the event
    pub producer_node_id: String,

    /// Route to every active worker regardless of subscriptions
    #[serde(default)]
    pub broadcast: bool,

    /// Links this event to the command/event that caused it
    #[serde(skip_serializing_if = "Option::is_none")]
    pub causation_id: Option<String>,

    /// Fields this version does not know about, preserved on re-serialize
    #[serde(flatten)]
    pub extra: serde_json::Map<String, serde_json::Value>,
}

impl EventEnvelope {
    /// Create a new envelope with `emitted_at` set to now.
    pub fn new(
        namespace: impl Into<String>,
        producer_node_id: impl Into<String>,
        event_type: impl Into<String>,
        payload: serde_json::Value,
    ) -> Self {
        Self {
            namespace: namespace.into(),
            event_type: event_type.into(),
            payload,
            emitted_at: Utc::now(),
            producer_node_id: producer_node_id.into(),
            broadcast: false,
            causation_id: None,
            extra: serde_json::Map::new(),
        }
    }

    /// Mark the envelope for broadcast routing.
    pub fn with_broadcast(mut self, broadcast: bool) -> Self {
        self.broadcast = broadcast;
        self
    }

    /// Set the causation ID.
    pub fn with_causation_id(mut self, causation_id: Option<String>) -> Self {
        self.causation_id = causation_id;
        self
    }
}

/// Validate the fields routing depends on.
///
/// The router and consumer call this before touching an envelope; an
/// [`BrokerError::InvariantViolation`] here means the message is
/// structurally unusable and goes straight to the DLQ rather than being
/// retried.
///
/// # Validation Rules
///
/// - `namespace`: present, non-empty string
/// - `event_type`: present, non-empty string
pub fn validate_envelope_fields(envelope: &serde_json::Value) -> BrokerResult<()> {
    let namespace = envelope
        .get("namespace")
        .and_then(|v| v.as_str())
        .ok_or_else(|| {
            BrokerError::InvariantViolation("missing or invalid namespace".to_string())
        })?;
    if namespace.is_empty() {
        return Err(BrokerError::InvariantViolation(
            "namespace cannot be empty".to_string(),
        ));
    }

    let event_type = envelope
        .get("event_type")
        .and_then(|v| v.as_str())
        .ok_or_else(|| {
            BrokerError::InvariantViolation("missing or invalid event_type".to_string())
        })?;
    if event_type.is_empty() {
        return Err(BrokerError::InvariantViolation(
            "event_type cannot be empty".to_string(),
        ));
    }

    Ok(())
}
