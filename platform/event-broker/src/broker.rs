//! Public facade.
//!
//! `Broker::connect` bootstraps the namespace (schema, ingress and DLQ
//! queues) and starts the background loops this process contributes: a
//! router (unless disabled) and the reaper election. Nodes are registered
//! through the broker and then live their own lifecycle; `close` composes
//! a graceful stop over everything local.

use std::sync::Arc;
use std::time::Duration;

use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};
use uuid::Uuid;

use crate::config::BrokerConfig;
use crate::db::Db;
use crate::error::{BrokerError, BrokerResult};
use crate::node::{Node, NodeConfig, NodeInner};
use crate::queue::QueueAdapter;
use crate::reaper::run_reaper;
use crate::repos::node_repo::{self, NodeRecord};
use crate::repos::schedule_repo::{self, ScheduleRecord};
use crate::router::Router;
use crate::runtime::WorkerRuntime;
use crate::schema;
use crate::scheduler::SchedulerBridge;
use crate::subscription_index::SubscriptionIndex;

/// A connected broker instance: one worker process in a namespace.
pub struct Broker {
    config: Arc<BrokerConfig>,
    db: Db,
    queue: QueueAdapter,
    index: Arc<SubscriptionIndex>,
    scheduler: SchedulerBridge,
    runtime: Arc<WorkerRuntime>,
    cancel: CancellationToken,
    router: Option<JoinHandle<()>>,
    reaper: Option<JoinHandle<()>>,
}

impl Broker {
    /// Validate the configuration, open the pool, bootstrap the schema
    /// and the namespace queues, and start this process's background
    /// loops.
    pub async fn connect(config: BrokerConfig) -> BrokerResult<Self> {
        config.validate()?;
        let config = Arc::new(config);

        let db = Db::connect(&config).await?;
        let queue = QueueAdapter::new(db.clone());
        schema::bootstrap(&db, &queue, &config.namespace).await?;

        let worker_id = generate_worker_id();
        let index = Arc::new(SubscriptionIndex::new(
            db.clone(),
            config.namespace.clone(),
            config.subscription_cache_ttl(),
        ));
        let scheduler = SchedulerBridge::new(db.clone(), config.namespace.clone());
        let runtime = Arc::new(WorkerRuntime::new(
            db.clone(),
            queue.clone(),
            config.clone(),
            worker_id,
        ));

        let cancel = CancellationToken::new();

        let router = if config.run_router {
            let router = Router::new(queue.clone(), index.clone(), config.clone());
            Some(tokio::spawn(router.run(cancel.child_token())))
        } else {
            None
        };

        let reaper = Some(tokio::spawn(run_reaper(
            db.clone(),
            queue.clone(),
            config.clone(),
            cancel.child_token(),
        )));

        info!(
            namespace = %config.namespace,
            worker_id = %runtime.worker_id(),
            run_router = config.run_router,
            "Broker connected"
        );

        Ok(Self {
            config,
            db,
            queue,
            index,
            scheduler,
            runtime,
            cancel,
            router,
            reaper,
        })
    }

    pub fn namespace(&self) -> &str {
        &self.config.namespace
    }

    /// Worker id of this process; every node registered here binds to it.
    pub fn worker_id(&self) -> &str {
        self.runtime.worker_id()
    }

    /// The queue adapter, shared with embedding hosts that need to
    /// inspect queues (e.g. DLQ tooling).
    pub fn queue_adapter(&self) -> &QueueAdapter {
        &self.queue
    }

    pub fn db(&self) -> &Db {
        &self.db
    }

    /// Register (or re-register) a node in this worker.
    pub async fn register_node(&self, node_config: NodeConfig) -> BrokerResult<Node> {
        if node_config.node_id.is_empty() {
            return Err(BrokerError::Configuration(
                "node_id cannot be empty".to_string(),
            ));
        }
        if !node_config.metadata.is_object() {
            return Err(BrokerError::Configuration(
                "node metadata must be a JSON object".to_string(),
            ));
        }

        node_repo::upsert(
            self.db.pool(),
            &self.config.namespace,
            &node_config.node_id,
            self.runtime.worker_id(),
            self.config.application.as_deref(),
            node_config.display_name.as_deref(),
            node_config.description.as_deref(),
            &node_config.metadata,
        )
        .await?;

        let inner = Arc::new(NodeInner::new(
            node_config.node_id.clone(),
            self.config.namespace.clone(),
            node_config.serial,
            self.queue.clone(),
            self.index.clone(),
            self.scheduler.clone(),
            self.runtime.clone(),
        ));

        info!(
            namespace = %self.config.namespace,
            node_id = %node_config.node_id,
            worker_id = %self.runtime.worker_id(),
            "Node registered"
        );

        Ok(Node::from_inner(inner))
    }

    /// Remove a node and its subscriptions atomically. The worker queue
    /// stays; this worker may host other nodes.
    pub async fn deregister_node(&self, node_id: &str) -> BrokerResult<()> {
        self.runtime.deactivate(node_id).await;
        node_repo::deregister(&self.db, &self.config.namespace, node_id).await?;
        self.index.invalidate().await;

        info!(
            namespace = %self.config.namespace,
            node_id = %node_id,
            "Node deregistered"
        );
        Ok(())
    }

    /// Nodes currently ACTIVE anywhere in the namespace.
    pub async fn list_active_nodes(&self) -> BrokerResult<Vec<NodeRecord>> {
        node_repo::list_active(self.db.pool(), &self.config.namespace).await
    }

    /// All scheduled tasks registered in the namespace.
    pub async fn list_schedules(&self) -> BrokerResult<Vec<ScheduleRecord>> {
        schedule_repo::list(self.db.pool(), &self.config.namespace).await
    }

    /// Stop all local loops, flush heartbeats, and close the pool.
    /// Best-effort: never fails, logs what it could not finish.
    pub async fn close(mut self) {
        info!(namespace = %self.config.namespace, "Closing broker");

        self.runtime.shutdown().await;
        self.cancel.cancel();

        for handle in [self.router.take(), self.reaper.take()]
            .into_iter()
            .flatten()
        {
            let abort = handle.abort_handle();
            if tokio::time::timeout(Duration::from_secs(5), handle)
                .await
                .is_err()
            {
                warn!(
                    namespace = %self.config.namespace,
                    "Background loop did not stop in time, aborting"
                );
                abort.abort();
            }
        }

        self.db.close().await;
        info!(namespace = %self.config.namespace, "Broker closed");
    }
}

/// Process-wide worker id: short, queue-name safe, unique enough for a
/// fleet of workers.
fn generate_worker_id() -> String {
    let id = Uuid::new_v4().simple().to_string();
    id[..12].to_string()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_generate_worker_id_is_queue_name_safe() {
        let id = generate_worker_id();
        assert_eq!(id.len(), 12);
        assert!(id.chars().all(|c| c.is_ascii_hexdigit()));
    }

    #[test]
    fn test_generate_worker_id_is_unique() {
        assert_ne!(generate_worker_id(), generate_worker_id());
    }
}
