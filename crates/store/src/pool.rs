//! Lazily created PostgreSQL connection pool
//!
//! The pool is created on first use, bootstraps the schema exactly once per
//! pool lifetime, and can be closed and transparently re-created afterwards.
//! Connections and transactions handed out by the pool are returned (or rolled
//! back) when dropped, on every exit path including cancellation.

use sqlx::pool::PoolConnection;
use sqlx::postgres::{PgPool, PgPoolOptions};
use sqlx::{Executor, Postgres, Transaction};
use tokio::sync::RwLock;
use tracing::{error, info, instrument};

use crate::config::DatabaseConfig;
use crate::error::{db_error, StoreError};

/// Schema bootstrap script, safe to apply against an existing schema
pub const SCHEMA: &str = include_str!("../schema/postgresql.sql");

/// Size-bounded pool of connections to the backing PostgreSQL server
///
/// # Example
///
/// ```ignore
/// use lineage_store::{ConnectionPool, DatabaseConfig};
///
/// let pool = ConnectionPool::new(DatabaseConfig::from_env())?;
/// let mut conn = pool.acquire().await?;
/// sqlx::query("SELECT 1").execute(&mut *conn).await?;
/// ```
pub struct ConnectionPool {
    config: DatabaseConfig,
    state: RwLock<Option<PgPool>>,
}

impl ConnectionPool {
    /// Create a pool manager; no connection is opened until first use
    pub fn new(config: DatabaseConfig) -> Result<Self, StoreError> {
        config.validate()?;
        Ok(Self {
            config,
            state: RwLock::new(None),
        })
    }

    /// Connection parameters of this pool
    pub fn config(&self) -> &DatabaseConfig {
        &self.config
    }

    /// Whether the underlying pool currently exists
    pub async fn is_open(&self) -> bool {
        self.state.read().await.is_some()
    }

    /// Get the underlying pool, creating it (and bootstrapping the schema) on first use
    pub async fn pool(&self) -> Result<PgPool, StoreError> {
        if let Some(pool) = self.state.read().await.as_ref() {
            return Ok(pool.clone());
        }

        let mut state = self.state.write().await;
        // Another caller may have created it while we waited for the lock
        if let Some(pool) = state.as_ref() {
            return Ok(pool.clone());
        }

        let pool = self.create().await?;
        *state = Some(pool.clone());
        Ok(pool)
    }

    /// Acquire a pooled connection; it is returned to the pool when dropped
    pub async fn acquire(&self) -> Result<PoolConnection<Postgres>, StoreError> {
        let pool = self.pool().await?;
        pool.acquire().await.map_err(db_error("acquire connection"))
    }

    /// Begin a transaction; it is rolled back if dropped without commit
    pub async fn begin(&self) -> Result<Transaction<'static, Postgres>, StoreError> {
        let pool = self.pool().await?;
        pool.begin().await.map_err(db_error("begin transaction"))
    }

    /// Drain and close every pooled connection
    ///
    /// The next operation re-creates the pool.
    #[instrument(skip(self))]
    pub async fn close(&self) {
        let pool = self.state.write().await.take();
        if let Some(pool) = pool {
            pool.close().await;
            info!(dbname = %self.config.dbname, "closed connection pool");
        }
    }

    #[instrument(skip(self), fields(dbname = %self.config.dbname, host = %self.config.hostname))]
    async fn create(&self) -> Result<PgPool, StoreError> {
        let pool = PgPoolOptions::new()
            .max_connections(self.config.max_connections)
            .acquire_timeout(self.config.timeout())
            .connect_with(self.config.connect_options())
            .await
            .map_err(|e| {
                error!("Failed to create connection pool: {}", e);
                StoreError::Connection(e.to_string())
            })?;

        if let Err(e) = apply_schema(&pool).await {
            pool.close().await;
            return Err(e);
        }

        info!(
            max_connections = self.config.max_connections,
            "created connection pool"
        );
        Ok(pool)
    }
}

const SCHEMA_LOCK_KEY: i64 = 0x6c696e65616765;

async fn apply_schema(pool: &PgPool) -> Result<(), StoreError> {
    let mut tx = pool
        .begin()
        .await
        .map_err(db_error("begin schema transaction"))?;

    // Serializes bootstrap across processes; released at commit
    sqlx::query("SELECT pg_advisory_xact_lock($1)")
        .bind(SCHEMA_LOCK_KEY)
        .execute(&mut *tx)
        .await
        .map_err(db_error("lock schema"))?;

    (&mut *tx)
        .execute(sqlx::raw_sql(SCHEMA))
        .await
        .map_err(db_error("apply schema"))?;

    tx.commit().await.map_err(db_error("commit schema"))?;
    Ok(())
}
