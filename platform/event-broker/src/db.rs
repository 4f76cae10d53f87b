//! Database gateway.
//!
//! `Db` wraps the connection pool and is the only component that talks to
//! PostgreSQL. The queue adapter and the registry repositories all borrow
//! it; nothing else holds a pool handle.

use sqlx::postgres::{PgPool, PgPoolOptions};
use sqlx::{Postgres, Transaction};
use std::time::Duration;

use crate::config::BrokerConfig;
use crate::error::{BrokerError, BrokerResult};

/// Thin wrapper over the PostgreSQL connection pool.
#[derive(Clone)]
pub struct Db {
    pool: PgPool,
}

impl Db {
    /// Open a pool sized by `pool_size` against the configured DSN.
    pub async fn connect(config: &BrokerConfig) -> BrokerResult<Self> {
        let pool = PgPoolOptions::new()
            .max_connections(config.pool_size)
            .acquire_timeout(Duration::from_secs(3))
            .connect(&config.connection_string)
            .await
            .map_err(|e| match e {
                sqlx::Error::Configuration(err) => {
                    BrokerError::Configuration(format!("invalid connection string: {err}"))
                }
                other => BrokerError::Database(other),
            })?;
        Ok(Self { pool })
    }

    /// Wrap an existing pool (tests and embedding hosts).
    pub fn from_pool(pool: PgPool) -> Self {
        Self { pool }
    }

    pub fn pool(&self) -> &PgPool {
        &self.pool
    }

    /// Begin a transaction. The returned transaction pins one connection,
    /// preserving connection affinity until commit or drop.
    pub async fn begin(&self) -> BrokerResult<Transaction<'static, Postgres>> {
        Ok(self.pool.begin().await?)
    }

    pub async fn close(&self) {
        self.pool.close().await;
    }
}

impl std::fmt::Debug for Db {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "Db")
    }
}
