//! Broker configuration parsed from the caller or the environment.

use std::env;
use std::time::Duration;

use crate::error::{BrokerError, BrokerResult};

/// Longest namespace accepted; namespaces scope every queue and registry row.
const MAX_NAMESPACE_LEN: usize = 64;

/// Configuration for a broker instance.
///
/// All knobs carry the documented defaults; only `connection_string` is
/// required. Construct with [`BrokerConfig::new`] or [`BrokerConfig::from_env`]
/// and override fields as needed before passing to `Broker::connect`.
#[derive(Debug, Clone)]
pub struct BrokerConfig {
    /// Database DSN (required).
    pub connection_string: String,
    /// Tenancy scope for queues, nodes, and subscriptions.
    pub namespace: String,
    /// Informational tag recorded with registered nodes.
    pub application: Option<String>,
    /// Seconds a leased message stays hidden from other readers.
    pub visibility_timeout_seconds: u32,
    /// Messages leased per read.
    pub batch_size: i32,
    /// Deliveries after which a failing message moves to the DLQ.
    pub max_attempts: i32,
    /// Seconds without a heartbeat before a node is considered lost.
    pub lease_ttl_seconds: u64,
    /// Interval between heartbeat writes for active local nodes.
    pub heartbeat_interval_seconds: u64,
    /// Sleep between polls when a queue read returns nothing.
    pub idle_sleep_ms: u64,
    /// Sleep after an unexpected loop error.
    pub error_backoff_ms: u64,
    /// Connection pool size.
    pub pool_size: u32,
    /// Concurrent message dispatches per worker; `None` means `batch_size`.
    pub handler_concurrency: Option<usize>,
    /// Per-handler timeout; `None` means `visibility_timeout_seconds - 5`.
    pub handler_timeout_seconds: Option<u64>,
    /// TTL for the router's subscription-index cache.
    pub subscription_cache_ttl_ms: u64,
    /// Grace period for in-flight handlers after `stop()`.
    pub stop_grace_seconds: u64,
    /// Grace window before the reaper drops an orphaned worker queue.
    pub queue_drop_grace_seconds: u64,
    /// Whether this process runs a router loop for the namespace.
    pub run_router: bool,
}

impl BrokerConfig {
    /// Create a configuration with the documented defaults.
    pub fn new(connection_string: impl Into<String>) -> Self {
        Self {
            connection_string: connection_string.into(),
            namespace: "default".to_string(),
            application: None,
            visibility_timeout_seconds: 30,
            batch_size: 10,
            max_attempts: 5,
            lease_ttl_seconds: 60,
            heartbeat_interval_seconds: 15,
            idle_sleep_ms: 1000,
            error_backoff_ms: 2000,
            pool_size: 10,
            handler_concurrency: None,
            handler_timeout_seconds: None,
            subscription_cache_ttl_ms: 1000,
            stop_grace_seconds: 30,
            queue_drop_grace_seconds: 300,
            run_router: true,
        }
    }

    /// Build a configuration from `CORE_DATABASE_URL` and `CORE_NAMESPACE`.
    ///
    /// The remaining `CORE_*` variables are consumed by worker entry-point
    /// programs, not by the core library.
    pub fn from_env() -> BrokerResult<Self> {
        let connection_string = env::var("CORE_DATABASE_URL")
            .map_err(|_| BrokerError::Configuration("CORE_DATABASE_URL must be set".to_string()))?;

        let mut config = Self::new(connection_string);
        if let Ok(namespace) = env::var("CORE_NAMESPACE") {
            config.namespace = namespace;
        }
        Ok(config)
    }

    /// Set the namespace, builder-style.
    pub fn with_namespace(mut self, namespace: impl Into<String>) -> Self {
        self.namespace = namespace.into();
        self
    }

    /// Set the application tag, builder-style.
    pub fn with_application(mut self, application: impl Into<String>) -> Self {
        self.application = Some(application.into());
        self
    }

    /// Validate the configuration. Called by `Broker::connect`.
    pub fn validate(&self) -> BrokerResult<()> {
        if self.connection_string.is_empty() {
            return Err(BrokerError::Configuration(
                "connection string cannot be empty".to_string(),
            ));
        }
        validate_namespace(&self.namespace)?;
        if self.batch_size <= 0 {
            return Err(BrokerError::Configuration(
                "batch_size must be positive".to_string(),
            ));
        }
        if self.max_attempts <= 0 {
            return Err(BrokerError::Configuration(
                "max_attempts must be positive".to_string(),
            ));
        }
        if self.pool_size == 0 {
            return Err(BrokerError::Configuration(
                "pool_size must be positive".to_string(),
            ));
        }
        if self.visibility_timeout_seconds == 0 {
            return Err(BrokerError::Configuration(
                "visibility_timeout_seconds must be positive".to_string(),
            ));
        }
        Ok(())
    }

    /// Effective per-message dispatch concurrency.
    pub fn effective_handler_concurrency(&self) -> usize {
        self.handler_concurrency
            .unwrap_or_else(|| self.batch_size.max(1) as usize)
    }

    /// Effective handler timeout: configured value, or the visibility
    /// timeout minus five seconds (at least one second).
    pub fn handler_timeout(&self) -> Duration {
        let secs = self
            .handler_timeout_seconds
            .unwrap_or_else(|| u64::from(self.visibility_timeout_seconds).saturating_sub(5).max(1));
        Duration::from_secs(secs)
    }

    pub fn idle_sleep(&self) -> Duration {
        Duration::from_millis(self.idle_sleep_ms)
    }

    pub fn error_backoff(&self) -> Duration {
        Duration::from_millis(self.error_backoff_ms)
    }

    pub fn heartbeat_interval(&self) -> Duration {
        Duration::from_secs(self.heartbeat_interval_seconds)
    }

    pub fn stop_grace(&self) -> Duration {
        Duration::from_secs(self.stop_grace_seconds)
    }

    pub fn subscription_cache_ttl(&self) -> Duration {
        Duration::from_millis(self.subscription_cache_ttl_ms)
    }
}

/// Validate a namespace: 1-64 characters from `[a-z0-9_-]`.
pub fn validate_namespace(namespace: &str) -> BrokerResult<()> {
    if namespace.is_empty() {
        return Err(BrokerError::Configuration(
            "namespace cannot be empty".to_string(),
        ));
    }
    if namespace.len() > MAX_NAMESPACE_LEN {
        return Err(BrokerError::Configuration(format!(
            "namespace exceeds {} characters: {}",
            MAX_NAMESPACE_LEN, namespace
        )));
    }
    if let Some(bad) = namespace
        .chars()
        .find(|c| !matches!(c, 'a'..='z' | '0'..='9' | '_' | '-'))
    {
        return Err(BrokerError::Configuration(format!(
            "namespace contains invalid character {:?}: {}",
            bad, namespace
        )));
    }
    Ok(())
}
