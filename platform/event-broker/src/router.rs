//! Router: fans ingress envelopes out to worker queues.
//!
//! One or more router instances per namespace lease envelopes from the
//! ingress queue, resolve the destination set through the subscription
//! index, copy the envelope into each worker queue, and only then ack the
//! ingress message. Horizontal scale-out is safe: ingress leasing is
//! mutually exclusive per message.
//!
//! Fan-out is send-first/delete-last. Queue sends auto-commit, so a crash
//! after some sends re-delivers the ingress message and repeats the whole
//! fan-out; consumers absorb the duplicates by message id.

use std::sync::Arc;

use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::config::BrokerConfig;
use crate::dlq;
use crate::envelope::validate_envelope_fields;
use crate::error::BrokerResult;
use crate::queue::{ingress_queue, worker_queue, LeasedMessage, QueueAdapter};
use crate::retry::{with_transient_retry, RetryConfig};
use crate::subscription_index::SubscriptionIndex;

pub(crate) struct Router {
    queue: QueueAdapter,
    index: Arc<SubscriptionIndex>,
    config: Arc<BrokerConfig>,
    namespace: String,
    ingress: String,
}

impl Router {
    pub fn new(
        queue: QueueAdapter,
        index: Arc<SubscriptionIndex>,
        config: Arc<BrokerConfig>,
    ) -> Self {
        let namespace = config.namespace.clone();
        let ingress = ingress_queue(&namespace);
        Self {
            queue,
            index,
            config,
            namespace,
            ingress,
        }
    }

    /// Run the routing loop until cancelled. Never returns an error:
    /// failures are logged and absorbed with backoff.
    pub async fn run(self, cancel: CancellationToken) {
        info!(namespace = %self.namespace, ingress = %self.ingress, "Starting router loop");

        let vt = self.config.visibility_timeout_seconds as i32;
        let batch = self.config.batch_size;

        loop {
            if cancel.is_cancelled() {
                break;
            }

            let leased = tokio::select! {
                _ = cancel.cancelled() => break,
                result = self.queue.read(&self.ingress, vt, batch) => result,
            };

            match leased {
                Ok(messages) if messages.is_empty() => {
                    tokio::select! {
                        _ = cancel.cancelled() => break,
                        _ = tokio::time::sleep(self.config.idle_sleep()) => {}
                    }
                }
                Ok(messages) => {
                    for message in messages {
                        self.route_one(message).await;
                    }
                }
                Err(e) => {
                    error!(
                        namespace = %self.namespace,
                        error = %e,
                        "Router read failed, backing off"
                    );
                    tokio::select! {
                        _ = cancel.cancelled() => break,
                        _ = tokio::time::sleep(self.config.error_backoff()) => {}
                    }
                }
            }
        }

        info!(namespace = %self.namespace, "Router loop stopped");
    }

    /// Route one leased envelope. Failures leave the message leased; the
    /// visibility timeout re-delivers it to this or another router.
    async fn route_one(&self, message: LeasedMessage) {
        if let Err(violation) = validate_envelope_fields(&message.envelope) {
            warn!(
                message_id = message.message_id,
                error = %violation,
                "Unroutable envelope, moving to DLQ"
            );
            dlq::move_to_dlq(
                &self.queue,
                &self.namespace,
                &self.ingress,
                message.message_id,
                message.envelope.clone(),
                &violation.to_string(),
                message.redelivery_count,
            )
            .await;
            return;
        }

        let event_type = message.envelope["event_type"]
            .as_str()
            .unwrap_or_default()
            .to_string();
        let broadcast = message.envelope["broadcast"].as_bool().unwrap_or(false);

        let result = with_transient_retry(
            || self.fan_out(&message, &event_type, broadcast),
            &RetryConfig::default(),
            "router_fan_out",
        )
        .await;

        match result {
            Ok(destinations) => {
                debug!(
                    message_id = message.message_id,
                    event_type = %event_type,
                    broadcast = broadcast,
                    destinations = destinations,
                    "Envelope routed"
                );
            }
            Err(e) => {
                error!(
                    message_id = message.message_id,
                    event_type = %event_type,
                    error = %e,
                    "Fan-out failed, message will redeliver"
                );
            }
        }
    }

    /// Copy the envelope into every destination queue, then ack ingress.
    ///
    /// An empty destination set means nobody subscribed (or, for
    /// broadcast, no worker is active); the envelope counts as delivered
    /// and is acked immediately.
    async fn fan_out(
        &self,
        message: &LeasedMessage,
        event_type: &str,
        broadcast: bool,
    ) -> BrokerResult<usize> {
        let workers = if broadcast {
            self.index.all_workers().await?
        } else {
            self.index.destinations(event_type).await?
        };

        let mut delivered = 0;
        for worker in workers.iter() {
            let destination = worker_queue(&self.namespace, worker);
            match self.queue.send_value(&destination, &message.envelope).await {
                Ok(_) => delivered += 1,
                Err(e) if QueueAdapter::is_missing_queue_error(&e) => {
                    // Worker queue already reaped; the subscription rows
                    // just haven't caught up.
                    warn!(
                        message_id = message.message_id,
                        destination = %destination,
                        "Destination queue is gone, skipping"
                    );
                }
                Err(e) => return Err(e),
            }
        }

        self.queue.delete(&self.ingress, message.message_id).await?;
        Ok(delivered)
    }
}
