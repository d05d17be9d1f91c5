//! Migration runner with cluster-safe locking.
//!
//! Ensures only one instance runs migrations at a time using a PostgreSQL advisory lock.

use std::collections::HashSet;
use std::path::Path;

use chrono::{DateTime, Utc};
use sqlx::PgPool;
use stride_core::error::{Result, StrideError};
use tracing::{debug, info, warn};

/// Advisory lock id for migrations, "STRIDE" in hex.
const MIGRATION_LOCK_ID: i64 = 0x535452494445;

/// A single migration.
#[derive(Debug, Clone)]
pub struct Migration {
    /// Unique name, e.g. "0000_stride_internal" or "0001_orders".
    pub name: String,
    /// SQL to execute.
    pub sql: String,
}

impl Migration {
    pub fn new(name: impl Into<String>, sql: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            sql: sql.into(),
        }
    }
}

/// Whether a known migration has been applied.
#[derive(Debug, Clone)]
pub struct MigrationStatus {
    pub name: String,
    pub applied_at: Option<DateTime<Utc>>,
}

impl MigrationStatus {
    pub fn is_applied(&self) -> bool {
        self.applied_at.is_some()
    }
}

/// Applies built-in and extra migrations.
pub struct MigrationRunner {
    pool: PgPool,
}

impl MigrationRunner {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    /// Run all pending migrations while holding the advisory lock.
    ///
    /// Returns the names of the migrations applied by this call.
    pub async fn run(&self, extra: Vec<Migration>) -> Result<Vec<String>> {
        self.acquire_lock().await?;

        let result = self.run_pending(extra).await;

        if let Err(e) = self.release_lock().await {
            warn!("Failed to release migration lock: {}", e);
        }

        result
    }

    /// Applied state of every known migration, built-in ones first.
    pub async fn status(&self, extra: Vec<Migration>) -> Result<Vec<MigrationStatus>> {
        self.ensure_migrations_table().await?;

        let rows: Vec<(String, DateTime<Utc>)> =
            sqlx::query_as("SELECT name, applied_at FROM stride_migrations")
                .fetch_all(&self.pool)
                .await
                .map_err(|e| {
                    StrideError::Database(format!("Failed to read migration status: {}", e))
                })?;

        Ok(all_migrations(extra)
            .into_iter()
            .map(|m| MigrationStatus {
                applied_at: rows
                    .iter()
                    .find(|(name, _)| name == &m.name)
                    .map(|(_, at)| *at),
                name: m.name,
            })
            .collect())
    }

    async fn run_pending(&self, extra: Vec<Migration>) -> Result<Vec<String>> {
        self.ensure_migrations_table().await?;

        let applied = self.get_applied_migrations().await?;
        debug!("Already applied migrations: {:?}", applied);

        let mut newly_applied = Vec::new();
        for migration in all_migrations(extra) {
            if !applied.contains(&migration.name) {
                self.apply_migration(&migration).await?;
                newly_applied.push(migration.name);
            }
        }

        Ok(newly_applied)
    }

    async fn acquire_lock(&self) -> Result<()> {
        debug!("Acquiring migration lock...");
        sqlx::query("SELECT pg_advisory_lock($1)")
            .bind(MIGRATION_LOCK_ID)
            .execute(&self.pool)
            .await
            .map_err(|e| {
                StrideError::Database(format!("Failed to acquire migration lock: {}", e))
            })?;
        debug!("Migration lock acquired");
        Ok(())
    }

    async fn release_lock(&self) -> Result<()> {
        sqlx::query("SELECT pg_advisory_unlock($1)")
            .bind(MIGRATION_LOCK_ID)
            .execute(&self.pool)
            .await
            .map_err(|e| {
                StrideError::Database(format!("Failed to release migration lock: {}", e))
            })?;
        debug!("Migration lock released");
        Ok(())
    }

    async fn ensure_migrations_table(&self) -> Result<()> {
        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS stride_migrations (
                id SERIAL PRIMARY KEY,
                name VARCHAR(255) UNIQUE NOT NULL,
                applied_at TIMESTAMPTZ NOT NULL DEFAULT NOW()
            )
            "#,
        )
        .execute(&self.pool)
        .await
        .map_err(|e| StrideError::Database(format!("Failed to create migrations table: {}", e)))?;
        Ok(())
    }

    async fn get_applied_migrations(&self) -> Result<HashSet<String>> {
        let rows: Vec<(String,)> = sqlx::query_as("SELECT name FROM stride_migrations")
            .fetch_all(&self.pool)
            .await
            .map_err(|e| {
                StrideError::Database(format!("Failed to get applied migrations: {}", e))
            })?;

        Ok(rows.into_iter().map(|(name,)| name).collect())
    }

    async fn apply_migration(&self, migration: &Migration) -> Result<()> {
        info!("Applying migration: {}", migration.name);

        let mut tx = self.pool.begin().await.map_err(|e| {
            StrideError::Database(format!("Failed to begin migration transaction: {}", e))
        })?;

        sqlx::raw_sql(&migration.sql)
            .execute(&mut *tx)
            .await
            .map_err(|e| {
                StrideError::Database(format!(
                    "Failed to apply migration '{}': {}",
                    migration.name, e
                ))
            })?;

        sqlx::query("INSERT INTO stride_migrations (name) VALUES ($1)")
            .bind(&migration.name)
            .execute(&mut *tx)
            .await
            .map_err(|e| {
                StrideError::Database(format!(
                    "Failed to record migration '{}': {}",
                    migration.name, e
                ))
            })?;

        tx.commit().await.map_err(|e| {
            StrideError::Database(format!(
                "Failed to commit migration '{}': {}",
                migration.name, e
            ))
        })?;

        info!("Migration applied: {}", migration.name);
        Ok(())
    }
}

/// Built-in migrations followed by `extra`.
fn all_migrations(extra: Vec<Migration>) -> Vec<Migration> {
    let mut migrations = super::builtin::get_builtin_migrations();
    migrations.extend(extra);
    migrations
}

/// Load extra migrations from a directory.
///
/// Files are named like `0001_orders.sql` and applied in name order after
/// the built-in schema.
pub fn load_migrations_from_dir(dir: &Path) -> Result<Vec<Migration>> {
    if !dir.exists() {
        debug!("Migrations directory does not exist: {:?}", dir);
        return Ok(Vec::new());
    }

    let mut migrations = Vec::new();

    for entry in std::fs::read_dir(dir)? {
        let path = entry?.path();

        if path.extension().map(|e| e == "sql").unwrap_or(false) {
            let name = path
                .file_stem()
                .and_then(|s| s.to_str())
                .ok_or_else(|| StrideError::Config("Invalid migration filename".into()))?
                .to_string();

            let sql = std::fs::read_to_string(&path)?;
            migrations.push(Migration::new(name, sql));
        }
    }

    migrations.sort_by(|a, b| a.name.cmp(&b.name));

    debug!("Loaded {} extra migrations", migrations.len());
    Ok(migrations)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;
    use tempfile::TempDir;

    #[test]
    fn test_load_migrations_from_empty_dir() {
        let dir = TempDir::new().unwrap();
        let migrations = load_migrations_from_dir(dir.path()).unwrap();
        assert!(migrations.is_empty());
    }

    #[test]
    fn test_load_migrations_from_nonexistent_dir() {
        let migrations = load_migrations_from_dir(Path::new("/nonexistent/path")).unwrap();
        assert!(migrations.is_empty());
    }

    #[test]
    fn test_load_migrations_sorted_and_filtered() {
        let dir = TempDir::new().unwrap();

        fs::write(dir.path().join("0002_second.sql"), "SELECT 2;").unwrap();
        fs::write(dir.path().join("0001_first.sql"), "SELECT 1;").unwrap();
        fs::write(dir.path().join("readme.txt"), "Not a migration").unwrap();
        fs::write(dir.path().join("backup.sql.bak"), "Backup").unwrap();

        let migrations = load_migrations_from_dir(dir.path()).unwrap();
        assert_eq!(migrations.len(), 2);
        assert_eq!(migrations[0].name, "0001_first");
        assert_eq!(migrations[1].name, "0002_second");
    }

    #[test]
    fn test_builtin_migrations_run_first() {
        let all = all_migrations(vec![Migration::new("0001_orders", "SELECT 1")]);
        assert_eq!(all[0].name, "0000_stride_internal");
        assert_eq!(all.last().unwrap().name, "0001_orders");
    }

    #[test]
    fn test_migration_status() {
        let pending = MigrationStatus {
            name: "0000_stride_internal".into(),
            applied_at: None,
        };
        assert!(!pending.is_applied());
    }
}
