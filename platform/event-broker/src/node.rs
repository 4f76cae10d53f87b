//! Node handle: the application-facing side of the broker.
//!
//! A `Node` is a logical application component registered in a namespace.
//! It emits events, registers handlers for event types it consumes, and
//! owns its lifecycle (`start`/`stop`). Nodes hold a capability record
//! (queue adapter, subscription index, scheduler bridge, worker runtime)
//! rather than a back-pointer to the facade, so the router and consumer
//! never depend on application types.

use std::sync::{Arc, RwLock};
use std::time::Duration;

use serde_json::Value;
use tracing::info;

use crate::error::{BrokerError, BrokerResult};
use crate::envelope::EventEnvelope;
use crate::handler::{
    EventContext, EventHandler, FnHandler, HandlerError, HandlerId, HandlerRegistry,
};
use crate::queue::{ingress_queue, QueueAdapter};
use crate::repos::node_repo::NodeState;
use crate::retry::{with_transient_retry, RetryConfig};
use crate::runtime::WorkerRuntime;
use crate::scheduler::{ScheduledTask, SchedulerBridge};
use crate::subscription_index::SubscriptionIndex;

/// Configuration for registering a node.
#[derive(Debug, Clone)]
pub struct NodeConfig {
    pub node_id: String,
    /// Informational only; never affects routing.
    pub display_name: Option<String>,
    /// Informational only; never affects routing.
    pub description: Option<String>,
    /// Informational JSON map recorded with the node.
    pub metadata: Value,
    /// Serialize handler invocations across concurrently leased messages.
    pub serial: bool,
}

impl NodeConfig {
    pub fn new(node_id: impl Into<String>) -> Self {
        Self {
            node_id: node_id.into(),
            display_name: None,
            description: None,
            metadata: Value::Object(serde_json::Map::new()),
            serial: false,
        }
    }

    pub fn with_display_name(mut self, display_name: impl Into<String>) -> Self {
        self.display_name = Some(display_name.into());
        self
    }

    pub fn with_description(mut self, description: impl Into<String>) -> Self {
        self.description = Some(description.into());
        self
    }

    pub fn with_metadata(mut self, metadata: Value) -> Self {
        self.metadata = metadata;
        self
    }

    pub fn serial(mut self, serial: bool) -> Self {
        self.serial = serial;
        self
    }
}

/// Options for a single emit.
#[derive(Debug, Clone, Copy, Default)]
pub struct EmitOptions {
    /// Route to every active worker in the namespace instead of the
    /// subscriber set.
    pub broadcast: bool,
}

impl EmitOptions {
    pub fn broadcast() -> Self {
        Self { broadcast: true }
    }
}

pub(crate) struct NodeInner {
    pub node_id: String,
    pub namespace: String,
    pub worker_id: String,
    pub serial: bool,
    pub handlers: HandlerRegistry,
    state: RwLock<NodeState>,
    serial_gate: tokio::sync::Mutex<()>,
    queue: QueueAdapter,
    index: Arc<SubscriptionIndex>,
    scheduler: SchedulerBridge,
    runtime: Arc<WorkerRuntime>,
    ingress: String,
}

impl NodeInner {
    pub fn new(
        node_id: String,
        namespace: String,
        serial: bool,
        queue: QueueAdapter,
        index: Arc<SubscriptionIndex>,
        scheduler: SchedulerBridge,
        runtime: Arc<WorkerRuntime>,
    ) -> Self {
        let worker_id = runtime.worker_id().to_string();
        let ingress = ingress_queue(&namespace);
        Self {
            node_id,
            namespace,
            worker_id,
            serial,
            handlers: HandlerRegistry::new(),
            state: RwLock::new(NodeState::Registered),
            serial_gate: tokio::sync::Mutex::new(()),
            queue,
            index,
            scheduler,
            runtime,
            ingress,
        }
    }

    pub fn is_active(&self) -> bool {
        *self.state.read().expect("node state poisoned") == NodeState::Active
    }

    pub fn local_state(&self) -> NodeState {
        *self.state.read().expect("node state poisoned")
    }

    pub fn set_local_state(&self, state: NodeState) {
        *self.state.write().expect("node state poisoned") = state;
    }

    /// Invoke every handler registered for the event, sequentially. A
    /// `serial` node additionally serializes dispatch across concurrently
    /// leased messages.
    pub async fn dispatch(
        &self,
        ctx: &EventContext,
        payload: &Value,
        timeout: Duration,
    ) -> Result<(), HandlerError> {
        let Some(entries) = self.handlers.handlers_for(&ctx.event_type) else {
            return Ok(());
        };

        let _serial_guard = if self.serial {
            Some(self.serial_gate.lock().await)
        } else {
            None
        };

        for entry in entries.iter() {
            match tokio::time::timeout(timeout, entry.handler.handle(ctx.clone(), payload.clone()))
                .await
            {
                Ok(Ok(())) => {}
                Ok(Err(e)) => return Err(e),
                Err(_) => {
                    return Err(format!(
                        "handler timed out after {}s",
                        timeout.as_secs()
                    )
                    .into())
                }
            }
        }
        Ok(())
    }
}

/// Handle to a registered node. Cheap to clone; all clones refer to the
/// same node.
#[derive(Clone)]
pub struct Node {
    inner: Arc<NodeInner>,
}

impl Node {
    pub(crate) fn from_inner(inner: Arc<NodeInner>) -> Self {
        Self { inner }
    }

    pub fn node_id(&self) -> &str {
        &self.inner.node_id
    }

    pub fn namespace(&self) -> &str {
        &self.inner.namespace
    }

    pub fn worker_id(&self) -> &str {
        &self.inner.worker_id
    }

    /// Emit an event into the namespace ingress queue.
    ///
    /// Returns the ingress message id. Transient database failures are
    /// retried with bounded backoff; the final error propagates.
    pub async fn emit(
        &self,
        event_type: &str,
        payload: Value,
        options: EmitOptions,
    ) -> BrokerResult<i64> {
        if event_type.is_empty() {
            return Err(BrokerError::Configuration(
                "event_type cannot be empty".to_string(),
            ));
        }

        let envelope = EventEnvelope::new(
            &self.inner.namespace,
            &self.inner.node_id,
            event_type,
            payload,
        )
        .with_broadcast(options.broadcast);

        let inner = &self.inner;
        let message_id = with_transient_retry(
            || inner.queue.send(&inner.ingress, &envelope),
            &RetryConfig::default(),
            "node_emit",
        )
        .await?;

        Ok(message_id)
    }

    /// Register a handler for an event type.
    ///
    /// Persists the subscription (so routers fan matching events into this
    /// worker's queue) and installs the in-memory handler. Returns a token
    /// for [`Node::off_event`].
    pub async fn on_event<H>(&self, event_type: &str, handler: H) -> BrokerResult<HandlerId>
    where
        H: EventHandler + 'static,
    {
        if event_type.is_empty() {
            return Err(BrokerError::Configuration(
                "event_type cannot be empty".to_string(),
            ));
        }

        let (id, _first) = self.inner.handlers.register(event_type, Arc::new(handler));

        if let Err(e) = self
            .inner
            .index
            .subscribe(event_type, &self.inner.node_id, &self.inner.worker_id)
            .await
        {
            // Roll back the in-memory registration so the handler table
            // and the subscription rows stay in step.
            self.inner.handlers.remove(event_type, id);
            return Err(e);
        }

        Ok(id)
    }

    /// Register an async closure as a handler.
    pub async fn on_event_fn<F, Fut>(&self, event_type: &str, f: F) -> BrokerResult<HandlerId>
    where
        F: Fn(EventContext, Value) -> Fut + Send + Sync + 'static,
        Fut: std::future::Future<Output = Result<(), HandlerError>> + Send + 'static,
    {
        self.on_event(event_type, FnHandler(f)).await
    }

    /// Remove a previously registered handler. When the last handler for
    /// the event type goes, the persistent subscription goes with it.
    pub async fn off_event(&self, event_type: &str, id: HandlerId) -> BrokerResult<()> {
        let last = self.inner.handlers.remove(event_type, id);
        if last {
            self.inner
                .index
                .unsubscribe(event_type, &self.inner.node_id)
                .await?;
        }
        Ok(())
    }

    /// Schedule a recurring emission. The producer defaults to this node.
    pub async fn schedule_task(&self, mut task: ScheduledTask) -> BrokerResult<()> {
        if task.producer_node_id.is_none() {
            task.producer_node_id = Some(self.inner.node_id.clone());
        }
        self.inner.scheduler.schedule(&task).await
    }

    /// Remove a scheduled emission by name. Idempotent.
    pub async fn unschedule_task(&self, name: &str) -> BrokerResult<()> {
        self.inner.scheduler.unschedule(name).await?;
        Ok(())
    }

    /// Start consuming: marks the node ACTIVE (first heartbeat), creates
    /// the worker queue on first use, and ensures the worker's consumer
    /// and heartbeat tasks are running.
    pub async fn start(&self) -> BrokerResult<()> {
        self.inner.runtime.activate(self.inner.clone()).await?;
        info!(
            namespace = %self.inner.namespace,
            node_id = %self.inner.node_id,
            worker_id = %self.inner.worker_id,
            "Node started"
        );
        Ok(())
    }

    /// Stop consuming. Best-effort and never fails: the consumer loop
    /// finishes its current batch, in-flight handlers get the grace
    /// period, and unacked messages redeliver to a future consumer.
    pub async fn stop(&self) {
        self.inner.runtime.deactivate(&self.inner.node_id).await;
        info!(
            namespace = %self.inner.namespace,
            node_id = %self.inner.node_id,
            "Node stopped"
        );
    }

    /// Local lifecycle state of this handle.
    pub fn state(&self) -> NodeState {
        self.inner.local_state()
    }
}
