use std::sync::Arc;
use std::time::Duration;

use sqlx::postgres::{PgConnectOptions, PgPool, PgPoolOptions};

use stride_core::config::DatabaseConfig;
use stride_core::error::{Result, StrideError};

/// Database connection wrapper providing connection pooling.
#[derive(Clone)]
pub struct Database {
    pool: Arc<PgPool>,
    config: DatabaseConfig,
}

impl Database {
    /// Create a new database connection from configuration.
    pub async fn from_config(config: &DatabaseConfig) -> Result<Self> {
        let pool = Self::create_pool(config)
            .await
            .map_err(|e| StrideError::Database(format!("Failed to connect: {}", e)))?;

        Ok(Self {
            pool: Arc::new(pool),
            config: config.clone(),
        })
    }

    /// Wrap an existing pool.
    pub fn from_pool(pool: PgPool, config: DatabaseConfig) -> Self {
        Self {
            pool: Arc::new(pool),
            config,
        }
    }

    async fn create_pool(config: &DatabaseConfig) -> sqlx::Result<PgPool> {
        let options: PgConnectOptions = config.url.parse()?;
        let options = options
            .options([(
                "statement_timeout",
                format!("{}s", config.statement_timeout_secs),
            )]);

        PgPoolOptions::new()
            .max_connections(config.pool_size)
            .acquire_timeout(Duration::from_secs(config.pool_timeout_secs))
            .connect_with(options)
            .await
    }

    /// Get the connection pool.
    pub fn pool(&self) -> &PgPool {
        &self.pool
    }

    pub fn config(&self) -> &DatabaseConfig {
        &self.config
    }

    /// Check database connectivity.
    pub async fn health_check(&self) -> Result<()> {
        sqlx::query("SELECT 1")
            .execute(self.pool.as_ref())
            .await
            .map_err(|e| StrideError::Database(format!("Health check failed: {}", e)))?;
        Ok(())
    }

    /// Close all connections gracefully.
    pub async fn close(&self) {
        self.pool.close().await;
    }
}
