//! Per-worker consumer loop.
//!
//! One loop serves every node hosted in this worker process. It leases
//! batches from the worker queue, dispatches each envelope to the local
//! nodes that handle its event type, and acks on success. A failing
//! handler leaves the message leased so the visibility timeout re-delivers
//! it; once the redelivery count reaches `max_attempts` the message moves
//! to the namespace DLQ instead.

use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::{Arc, Mutex};

use futures::StreamExt;
use tokio::sync::RwLock;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn, Instrument};

use crate::config::BrokerConfig;
use crate::dlq;
use crate::envelope::validate_envelope_fields;
use crate::error::BrokerError;
use crate::handler::EventContext;
use crate::node::NodeInner;
use crate::queue::{LeasedMessage, QueueAdapter};

/// Acked message ids remembered per worker queue. Re-leases of an
/// already-processed message (an ack that raced the visibility timeout)
/// are silently acked instead of re-invoking handlers.
pub(crate) struct SeenCache {
    capacity: usize,
    set: HashSet<i64>,
    order: VecDeque<i64>,
}

impl SeenCache {
    pub fn new(capacity: usize) -> Self {
        Self {
            capacity,
            set: HashSet::with_capacity(capacity),
            order: VecDeque::with_capacity(capacity),
        }
    }

    pub fn contains(&self, message_id: i64) -> bool {
        self.set.contains(&message_id)
    }

    pub fn insert(&mut self, message_id: i64) {
        if !self.set.insert(message_id) {
            return;
        }
        self.order.push_back(message_id);
        while self.order.len() > self.capacity {
            if let Some(evicted) = self.order.pop_front() {
                self.set.remove(&evicted);
            }
        }
    }
}

/// How many processed message ids each worker remembers.
const SEEN_CACHE_CAPACITY: usize = 1024;

pub(crate) struct WorkerConsumer {
    queue: QueueAdapter,
    config: Arc<BrokerConfig>,
    namespace: String,
    worker_queue_name: String,
    nodes: Arc<RwLock<HashMap<String, Arc<NodeInner>>>>,
    seen: Mutex<SeenCache>,
}

impl WorkerConsumer {
    pub fn new(
        queue: QueueAdapter,
        config: Arc<BrokerConfig>,
        worker_queue_name: String,
        nodes: Arc<RwLock<HashMap<String, Arc<NodeInner>>>>,
    ) -> Self {
        let namespace = config.namespace.clone();
        Self {
            queue,
            config,
            namespace,
            worker_queue_name,
            nodes,
            seen: Mutex::new(SeenCache::new(SEEN_CACHE_CAPACITY)),
        }
    }

    /// Run the consumer loop until cancelled. Cancellation is observed
    /// between batches: the current batch always runs to completion, so
    /// in-flight handlers are never torn down mid-message here (the
    /// runtime enforces the stop grace period at join time).
    pub async fn run(self: Arc<Self>, cancel: CancellationToken) {
        info!(
            namespace = %self.namespace,
            queue = %self.worker_queue_name,
            "Starting worker consumer loop"
        );

        let vt = self.config.visibility_timeout_seconds as i32;
        let batch = self.config.batch_size;
        let concurrency = self.config.effective_handler_concurrency();

        loop {
            if cancel.is_cancelled() {
                break;
            }

            let leased = tokio::select! {
                _ = cancel.cancelled() => break,
                result = self.queue.read(&self.worker_queue_name, vt, batch) => result,
            };

            match leased {
                Ok(messages) if messages.is_empty() => {
                    tokio::select! {
                        _ = cancel.cancelled() => break,
                        _ = tokio::time::sleep(self.config.idle_sleep()) => {}
                    }
                }
                Ok(messages) => {
                    futures::stream::iter(messages)
                        .for_each_concurrent(concurrency, |message| {
                            let consumer = self.clone();
                            async move { consumer.process(message).await }
                        })
                        .await;
                }
                Err(e) => {
                    error!(
                        queue = %self.worker_queue_name,
                        error = %e,
                        "Consumer read failed, backing off"
                    );
                    tokio::select! {
                        _ = cancel.cancelled() => break,
                        _ = tokio::time::sleep(self.config.error_backoff()) => {}
                    }
                }
            }
        }

        info!(queue = %self.worker_queue_name, "Worker consumer loop stopped");
    }

    async fn process(&self, message: LeasedMessage) {
        let already_processed = self
            .seen
            .lock()
            .expect("seen cache poisoned")
            .contains(message.message_id);
        if already_processed {
            debug!(
                message_id = message.message_id,
                "Duplicate delivery of processed message, acking"
            );
            self.ack(message.message_id).await;
            return;
        }

        if message.redelivery_count >= self.config.max_attempts {
            dlq::move_to_dlq(
                &self.queue,
                &self.namespace,
                &self.worker_queue_name,
                message.message_id,
                message.envelope.clone(),
                "handler attempts exhausted",
                message.redelivery_count,
            )
            .await;
            return;
        }

        if let Err(violation) = validate_envelope_fields(&message.envelope) {
            warn!(
                message_id = message.message_id,
                error = %violation,
                "Unusable envelope in worker queue, moving to DLQ"
            );
            dlq::move_to_dlq(
                &self.queue,
                &self.namespace,
                &self.worker_queue_name,
                message.message_id,
                message.envelope.clone(),
                &violation.to_string(),
                message.redelivery_count,
            )
            .await;
            return;
        }

        let envelope = match message.parse_envelope() {
            Ok(envelope) => envelope,
            Err(parse_err) => {
                let violation = BrokerError::InvariantViolation(format!(
                    "malformed envelope: {parse_err}"
                ));
                warn!(
                    message_id = message.message_id,
                    error = %violation,
                    "Malformed envelope in worker queue, moving to DLQ"
                );
                dlq::move_to_dlq(
                    &self.queue,
                    &self.namespace,
                    &self.worker_queue_name,
                    message.message_id,
                    message.envelope.clone(),
                    &violation.to_string(),
                    message.redelivery_count,
                )
                .await;
                return;
            }
        };

        let ctx = EventContext {
            message_id: message.message_id,
            redelivery_count: message.redelivery_count,
            emitted_at: envelope.emitted_at,
            producer_node_id: envelope.producer_node_id.clone(),
            namespace: envelope.namespace.clone(),
            event_type: envelope.event_type.clone(),
        };

        let targets: Vec<Arc<NodeInner>> = {
            let nodes = self.nodes.read().await;
            nodes
                .values()
                .filter(|node| node.is_active() && node.handlers.has(&ctx.event_type))
                .cloned()
                .collect()
        };

        if targets.is_empty() {
            // Routed here for a node that has since stopped or never
            // registered a handler; nothing to do but ack.
            debug!(
                message_id = message.message_id,
                event_type = %ctx.event_type,
                "No local handler for event, acking"
            );
            self.ack(message.message_id).await;
            return;
        }

        let span = tracing::info_span!(
            "dispatch_event",
            message_id = message.message_id,
            event_type = %ctx.event_type,
            redelivery_count = message.redelivery_count,
            producer_node_id = %ctx.producer_node_id,
        );

        let timeout = self.config.handler_timeout();
        let payload = envelope.payload;

        async {
            let mut failure: Option<String> = None;
            for node in &targets {
                if let Err(e) = node.dispatch(&ctx, &payload, timeout).await {
                    warn!(
                        node_id = %node.node_id,
                        message_id = ctx.message_id,
                        event_type = %ctx.event_type,
                        redelivery_count = ctx.redelivery_count,
                        error = %e,
                        "Handler failed, message will redeliver"
                    );
                    failure = Some(e.to_string());
                }
            }

            match failure {
                None => {
                    self.ack(ctx.message_id).await;
                    self.seen
                        .lock()
                        .expect("seen cache poisoned")
                        .insert(ctx.message_id);
                }
                Some(_) => {
                    // Leave the lease to expire; the visibility timeout
                    // re-delivers and the attempt counter climbs toward
                    // the DLQ threshold.
                }
            }
        }
        .instrument(span)
        .await;
    }

    async fn ack(&self, message_id: i64) {
        if let Err(e) = self.queue.delete(&self.worker_queue_name, message_id).await {
            warn!(
                queue = %self.worker_queue_name,
                message_id = message_id,
                error = %e,
                "Failed to ack message, it may redeliver"
            );
        }
    }
}
