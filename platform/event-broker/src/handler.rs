//! Handler registration and dispatch context.
//!
//! Each node owns a `HandlerRegistry`: a map from event-type string to an
//! immutable list of handler descriptors, mutated by swapping the list.
//! The consumer loop reads the map lock-free of the writers' critical
//! section (readers clone the `Arc` list and drop the lock before
//! invoking anything).

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, RwLock};

use async_trait::async_trait;
use chrono::{DateTime, Utc};

/// Error type user handlers return; any failure triggers
/// retry-via-visibility-timeout and eventually the DLQ.
pub type HandlerError = Box<dyn std::error::Error + Send + Sync>;

/// Delivery metadata passed to every handler invocation alongside the
/// payload.
#[derive(Debug, Clone)]
pub struct EventContext {
    /// Queue-assigned id, stable across redeliveries of the same message
    pub message_id: i64,
    /// Zero on first delivery
    pub redelivery_count: i32,
    pub emitted_at: DateTime<Utc>,
    pub producer_node_id: String,
    pub namespace: String,
    pub event_type: String,
}

/// An event handler bound to a node.
///
/// Handlers must be idempotent: delivery is at-least-once, and a handler
/// that overruns its timeout will see the same message again.
#[async_trait]
pub trait EventHandler: Send + Sync {
    async fn handle(&self, ctx: EventContext, payload: serde_json::Value)
        -> Result<(), HandlerError>;
}

/// Adapter turning an async closure into an [`EventHandler`].
pub(crate) struct FnHandler<F>(pub F);

#[async_trait]
impl<F, Fut> EventHandler for FnHandler<F>
where
    F: Fn(EventContext, serde_json::Value) -> Fut + Send + Sync,
    Fut: std::future::Future<Output = Result<(), HandlerError>> + Send + 'static,
{
    async fn handle(
        &self,
        ctx: EventContext,
        payload: serde_json::Value,
    ) -> Result<(), HandlerError> {
        (self.0)(ctx, payload).await
    }
}

/// Token identifying one registered handler, returned by `on_event` and
/// consumed by `off_event`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct HandlerId(u64);

#[derive(Clone)]
pub(crate) struct HandlerEntry {
    pub id: HandlerId,
    pub handler: Arc<dyn EventHandler>,
}

/// Per-node handler table. Reads take the list as an `Arc`; writes rebuild
/// the list and swap it in.
pub(crate) struct HandlerRegistry {
    routes: RwLock<HashMap<String, Arc<Vec<HandlerEntry>>>>,
    next_id: AtomicU64,
}

impl HandlerRegistry {
    pub fn new() -> Self {
        Self {
            routes: RwLock::new(HashMap::new()),
            next_id: AtomicU64::new(1),
        }
    }

    /// Register a handler. Returns its id and whether it is the first
    /// handler for this event type (the caller then persists the
    /// subscription).
    pub fn register(&self, event_type: &str, handler: Arc<dyn EventHandler>) -> (HandlerId, bool) {
        let id = HandlerId(self.next_id.fetch_add(1, Ordering::Relaxed));
        let mut routes = self.routes.write().expect("handler registry poisoned");
        let entry = HandlerEntry { id, handler };
        match routes.get_mut(event_type) {
            Some(list) => {
                let mut next = list.as_ref().clone();
                next.push(entry);
                *list = Arc::new(next);
                (id, false)
            }
            None => {
                routes.insert(event_type.to_string(), Arc::new(vec![entry]));
                (id, true)
            }
        }
    }

    /// Remove a handler by id. Returns whether the event type has no
    /// handlers left (the caller then removes the persistent subscription).
    pub fn remove(&self, event_type: &str, id: HandlerId) -> bool {
        let mut routes = self.routes.write().expect("handler registry poisoned");
        let Some(list) = routes.get_mut(event_type) else {
            return false;
        };
        let next: Vec<HandlerEntry> = list.iter().filter(|e| e.id != id).cloned().collect();
        if next.is_empty() {
            routes.remove(event_type);
            true
        } else {
            *list = Arc::new(next);
            false
        }
    }

    /// Snapshot of the handlers for an event type.
    pub fn handlers_for(&self, event_type: &str) -> Option<Arc<Vec<HandlerEntry>>> {
        self.routes
            .read()
            .expect("handler registry poisoned")
            .get(event_type)
            .cloned()
    }

    pub fn has(&self, event_type: &str) -> bool {
        self.routes
            .read()
            .expect("handler registry poisoned")
            .contains_key(event_type)
    }

    /// Event types with at least one handler.
    pub fn event_types(&self) -> Vec<String> {
        self.routes
            .read()
            .expect("handler registry poisoned")
            .keys()
            .cloned()
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;

    struct CountingHandler(Arc<AtomicUsize>);

    #[async_trait]
    impl EventHandler for CountingHandler {
        async fn handle(
            &self,
            _ctx: EventContext,
            _payload: serde_json::Value,
        ) -> Result<(), HandlerError> {
            self.0.fetch_add(1, Ordering::SeqCst);
            Ok(())
        }
    }

    fn context() -> EventContext {
        EventContext {
            message_id: 1,
            redelivery_count: 0,
            emitted_at: Utc::now(),
            producer_node_id: "producer".to_string(),
            namespace: "t1".to_string(),
            event_type: "x".to_string(),
        }
    }

    #[test]
    fn test_register_reports_first_for_type() {
        let registry = HandlerRegistry::new();
        let counter = Arc::new(AtomicUsize::new(0));

        let (_, first) = registry.register("x", Arc::new(CountingHandler(counter.clone())));
        assert!(first);
        let (_, first) = registry.register("x", Arc::new(CountingHandler(counter)));
        assert!(!first);
        assert_eq!(registry.handlers_for("x").unwrap().len(), 2);
    }

    #[test]
    fn test_remove_reports_last_for_type() {
        let registry = HandlerRegistry::new();
        let counter = Arc::new(AtomicUsize::new(0));

        let (a, _) = registry.register("x", Arc::new(CountingHandler(counter.clone())));
        let (b, _) = registry.register("x", Arc::new(CountingHandler(counter)));

        assert!(!registry.remove("x", a));
        assert!(registry.remove("x", b));
        assert!(!registry.has("x"));
        // Removing again is a no-op
        assert!(!registry.remove("x", b));
    }

    #[tokio::test]
    async fn test_snapshot_survives_mutation() {
        let registry = HandlerRegistry::new();
        let counter = Arc::new(AtomicUsize::new(0));
        let (id, _) = registry.register("x", Arc::new(CountingHandler(counter.clone())));

        // A reader holding a snapshot is unaffected by a concurrent remove.
        let snapshot = registry.handlers_for("x").unwrap();
        registry.remove("x", id);
        assert!(!registry.has("x"));

        for entry in snapshot.iter() {
            entry
                .handler
                .handle(context(), serde_json::json!({}))
                .await
                .unwrap();
        }
        assert_eq!(counter.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_event_types() {
        let registry = HandlerRegistry::new();
        let counter = Arc::new(AtomicUsize::new(0));
        registry.register("x", Arc::new(CountingHandler(counter.clone())));
        registry.register("y", Arc::new(CountingHandler(counter)));

        let mut types = registry.event_types();
        types.sort();
        assert_eq!(types, vec!["x".to_string(), "y".to_string()]);
    }
}
