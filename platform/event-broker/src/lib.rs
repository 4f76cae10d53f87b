//! # Event Broker
//!
//! A Postgres-backed event broker and worker runtime. Applications
//! register named **nodes** inside a **namespace**; nodes emit typed
//! events and subscribe to event types. Events travel through durable
//! database queues (the pgmq extension) with at-least-once delivery,
//! retry on failure, a dead-letter path, and optional cron-scheduled
//! emission (the pg_cron extension).
//!
//! ## How an event travels
//!
//! `node.emit` puts an envelope on the namespace **ingress queue**. A
//! **router** leases it, looks up the subscribed workers (or every active
//! worker for a broadcast), copies the envelope into each **worker
//! queue**, and acks ingress. Each worker's **consumer loop** leases from
//! its queue, invokes the local handlers for the event type, and acks on
//! success; failing messages redeliver via the visibility timeout until
//! they exhaust their attempts and land on the namespace **DLQ**.
//!
//! ## Usage
//!
//! ```rust,no_run
//! use event_broker::{Broker, BrokerConfig, EmitOptions, NodeConfig};
//! use serde_json::json;
//!
//! # async fn example() -> Result<(), event_broker::BrokerError> {
//! let config = BrokerConfig::new("postgres://localhost/app").with_namespace("billing");
//! let broker = Broker::connect(config).await?;
//!
//! let node = broker.register_node(NodeConfig::new("invoice-service")).await?;
//! node.on_event_fn("payment.succeeded", |ctx, payload| async move {
//!     println!("payment {} for {:?} (delivery #{})", ctx.message_id, payload, ctx.redelivery_count);
//!     Ok(())
//! })
//! .await?;
//! node.start().await?;
//!
//! node.emit("invoice.issued", json!({"invoice_id": "inv_42"}), EmitOptions::default())
//!     .await?;
//!
//! broker.close().await;
//! # Ok(())
//! # }
//! ```
//!
//! ## Delivery contract
//!
//! At-least-once, per-queue FIFO when no redelivery occurs. Handlers must
//! be idempotent: a router crash mid-fan-out or a handler overrunning its
//! timeout re-delivers the message. Exactly-once delivery and
//! cross-namespace routing are explicitly not offered.

mod broker;
mod config;
mod consumer;
mod db;
mod dlq;
mod envelope;
mod error;
mod handler;
mod heartbeat;
mod node;
mod queue;
mod reaper;
mod repos;
mod retry;
mod router;
mod runtime;
mod schema;
mod scheduler;
mod subscription_index;

pub use broker::Broker;
pub use config::{validate_namespace, BrokerConfig};
pub use db::Db;
pub use dlq::DeadLetter;
pub use envelope::{validate_envelope_fields, EventEnvelope};
pub use error::{BrokerError, BrokerResult};
pub use handler::{EventContext, EventHandler, HandlerError, HandlerId};
pub use node::{EmitOptions, Node, NodeConfig};
pub use queue::{dlq_queue, ingress_queue, worker_queue, LeasedMessage, QueueAdapter};
pub use repos::node_repo::{NodeRecord, NodeState};
pub use repos::schedule_repo::ScheduleRecord;
pub use retry::{with_transient_retry, RetryConfig};
pub use scheduler::{validate_cron_expression, ScheduledTask, SCHEDULER_NODE_ID};
pub use subscription_index::SubscriptionIndex;
