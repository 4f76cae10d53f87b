//! Cached subscription index consulted by the router.
//!
//! Destination lookups hit the database at most once per TTL window per
//! event type; local subscribe/unsubscribe invalidates immediately so a
//! process observes its own changes without waiting out the TTL. The cache
//! is per-process, guarded single-writer/multi-reader.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};

use tokio::sync::RwLock;

use crate::db::Db;
use crate::error::BrokerResult;
use crate::repos::subscription_repo;

struct CacheEntry {
    workers: Arc<Vec<String>>,
    fetched_at: Instant,
}

impl CacheEntry {
    fn fresh(&self, ttl: Duration) -> bool {
        self.fetched_at.elapsed() < ttl
    }
}

/// Router-facing view of the subscription rows, with a short-TTL cache.
pub struct SubscriptionIndex {
    db: Db,
    namespace: String,
    ttl: Duration,
    by_event: RwLock<HashMap<String, CacheEntry>>,
    all_workers: RwLock<Option<CacheEntry>>,
}

impl SubscriptionIndex {
    pub fn new(db: Db, namespace: impl Into<String>, ttl: Duration) -> Self {
        Self {
            db,
            namespace: namespace.into(),
            ttl,
            by_event: RwLock::new(HashMap::new()),
            all_workers: RwLock::new(None),
        }
    }

    /// Record a subscription and invalidate the local cache.
    pub async fn subscribe(
        &self,
        event_type: &str,
        node_id: &str,
        worker_id: &str,
    ) -> BrokerResult<()> {
        subscription_repo::subscribe(self.db.pool(), &self.namespace, event_type, node_id, worker_id)
            .await?;
        self.invalidate().await;
        Ok(())
    }

    /// Remove a subscription and invalidate the local cache.
    pub async fn unsubscribe(&self, event_type: &str, node_id: &str) -> BrokerResult<()> {
        subscription_repo::unsubscribe(self.db.pool(), &self.namespace, event_type, node_id).await?;
        self.invalidate().await;
        Ok(())
    }

    /// Distinct worker ids subscribed to `event_type`.
    pub async fn destinations(&self, event_type: &str) -> BrokerResult<Arc<Vec<String>>> {
        {
            let cache = self.by_event.read().await;
            if let Some(entry) = cache.get(event_type) {
                if entry.fresh(self.ttl) {
                    return Ok(entry.workers.clone());
                }
            }
        }

        let workers = Arc::new(
            subscription_repo::lookup_destinations(self.db.pool(), &self.namespace, event_type)
                .await?,
        );

        let mut cache = self.by_event.write().await;
        cache.insert(
            event_type.to_string(),
            CacheEntry {
                workers: workers.clone(),
                fetched_at: Instant::now(),
            },
        );
        Ok(workers)
    }

    /// Distinct worker ids hosting an ACTIVE node; the broadcast set.
    pub async fn all_workers(&self) -> BrokerResult<Arc<Vec<String>>> {
        {
            let cache = self.all_workers.read().await;
            if let Some(entry) = cache.as_ref() {
                if entry.fresh(self.ttl) {
                    return Ok(entry.workers.clone());
                }
            }
        }

        let workers = Arc::new(
            subscription_repo::lookup_all_workers(self.db.pool(), &self.namespace).await?,
        );

        let mut cache = self.all_workers.write().await;
        *cache = Some(CacheEntry {
            workers: workers.clone(),
            fetched_at: Instant::now(),
        });
        Ok(workers)
    }

    /// Drop every cached entry.
    pub async fn invalidate(&self) {
        self.by_event.write().await.clear();
        *self.all_workers.write().await = None;
    }

    pub fn namespace(&self) -> &str {
        &self.namespace
    }
}
