//! Worker runtime: the per-process side of the broker.
//!
//! Owns the worker queue, the set of locally hosted nodes, and the two
//! long-running tasks that serve them (consumer loop and heartbeat).
//! Tasks start lazily with the first `node.start()` and stop when the
//! last local node stops or the broker closes.

use std::collections::HashMap;
use std::sync::Arc;

use tokio::sync::{Mutex, RwLock};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::warn;

use crate::config::BrokerConfig;
use crate::consumer::WorkerConsumer;
use crate::db::Db;
use crate::error::BrokerResult;
use crate::heartbeat;
use crate::node::NodeInner;
use crate::queue::{worker_queue, QueueAdapter};
use crate::repos::node_repo::{self, NodeState};

#[derive(Default)]
struct TaskState {
    cancel: Option<CancellationToken>,
    consumer: Option<JoinHandle<()>>,
    heartbeat: Option<JoinHandle<()>>,
}

pub(crate) struct WorkerRuntime {
    db: Db,
    queue: QueueAdapter,
    config: Arc<BrokerConfig>,
    namespace: String,
    worker_id: String,
    worker_queue_name: String,
    nodes: Arc<RwLock<HashMap<String, Arc<NodeInner>>>>,
    tasks: Mutex<TaskState>,
}

impl WorkerRuntime {
    pub fn new(
        db: Db,
        queue: QueueAdapter,
        config: Arc<BrokerConfig>,
        worker_id: String,
    ) -> Self {
        let namespace = config.namespace.clone();
        let worker_queue_name = worker_queue(&namespace, &worker_id);
        Self {
            db,
            queue,
            config,
            namespace,
            worker_id,
            worker_queue_name,
            nodes: Arc::new(RwLock::new(HashMap::new())),
            tasks: Mutex::new(TaskState::default()),
        }
    }

    pub fn worker_id(&self) -> &str {
        &self.worker_id
    }

    pub fn worker_queue_name(&self) -> &str {
        &self.worker_queue_name
    }

    /// Activate a node: create the worker queue on first use, mark the
    /// node ACTIVE (which doubles as its first heartbeat), add it to the
    /// local dispatch set, and make sure the worker tasks are running.
    pub async fn activate(&self, node: Arc<NodeInner>) -> BrokerResult<()> {
        self.queue.create_queue(&self.worker_queue_name).await?;
        node_repo::set_state(
            self.db.pool(),
            &self.namespace,
            &node.node_id,
            NodeState::Active,
        )
        .await?;
        node.set_local_state(NodeState::Active);

        self.nodes
            .write()
            .await
            .insert(node.node_id.clone(), node);
        self.ensure_tasks().await;
        Ok(())
    }

    /// Gracefully stop a node. Best-effort: registry errors are logged,
    /// never surfaced. When the last local node stops, the worker tasks
    /// stop too (after finishing the current batch).
    pub async fn deactivate(&self, node_id: &str) {
        let removed = self.nodes.write().await.remove(node_id);

        if let Some(node) = removed {
            node.set_local_state(NodeState::Stopped);
            if let Err(e) = node_repo::set_state(
                self.db.pool(),
                &self.namespace,
                node_id,
                NodeState::Stopped,
            )
            .await
            {
                warn!(
                    node_id = %node_id,
                    error = %e,
                    "Failed to record STOPPED state"
                );
            }
        }

        if self.nodes.read().await.is_empty() {
            self.stop_tasks().await;
        }
    }

    /// Stop everything this worker runs: flush heartbeats, mark every
    /// local node STOPPED, and wind down the tasks.
    pub async fn shutdown(&self) {
        heartbeat::flush(&self.db, &self.namespace, &self.nodes).await;

        let drained: Vec<Arc<NodeInner>> = {
            let mut nodes = self.nodes.write().await;
            nodes.drain().map(|(_, node)| node).collect()
        };

        for node in &drained {
            node.set_local_state(NodeState::Stopped);
            if let Err(e) = node_repo::set_state(
                self.db.pool(),
                &self.namespace,
                &node.node_id,
                NodeState::Stopped,
            )
            .await
            {
                warn!(
                    node_id = %node.node_id,
                    error = %e,
                    "Failed to record STOPPED state during shutdown"
                );
            }
        }

        self.stop_tasks().await;
    }

    async fn ensure_tasks(&self) {
        let mut tasks = self.tasks.lock().await;
        if tasks.cancel.is_some() {
            return;
        }

        let cancel = CancellationToken::new();
        let consumer = Arc::new(WorkerConsumer::new(
            self.queue.clone(),
            self.config.clone(),
            self.worker_queue_name.clone(),
            self.nodes.clone(),
        ));
        tasks.consumer = Some(tokio::spawn(consumer.run(cancel.clone())));
        tasks.heartbeat = Some(tokio::spawn(heartbeat::run_heartbeat(
            self.db.clone(),
            self.namespace.clone(),
            self.nodes.clone(),
            self.config.heartbeat_interval(),
            cancel.clone(),
        )));
        tasks.cancel = Some(cancel);
    }

    /// Signal the tasks to stop and wait out the grace period. Handlers
    /// still running when it expires are abandoned; their messages
    /// redeliver once the visibility timeout lapses.
    async fn stop_tasks(&self) {
        let (cancel, consumer, heartbeat_task) = {
            let mut tasks = self.tasks.lock().await;
            (
                tasks.cancel.take(),
                tasks.consumer.take(),
                tasks.heartbeat.take(),
            )
        };

        let Some(cancel) = cancel else {
            return;
        };
        cancel.cancel();

        for handle in [consumer, heartbeat_task].into_iter().flatten() {
            let abort = handle.abort_handle();
            if tokio::time::timeout(self.config.stop_grace(), handle)
                .await
                .is_err()
            {
                warn!(
                    worker_id = %self.worker_id,
                    grace_secs = self.config.stop_grace_seconds,
                    "Worker task did not stop within grace period, abandoning in-flight handlers"
                );
                abort.abort();
            }
        }
    }
}
