use std::time::Duration;

use chrono::{DateTime, Utc};
use futures_util::future::BoxFuture;
use sqlx::{PgPool, Row};

use stride_core::error::{Result, StrideError};
use stride_core::store::{
    expires_at, stale_before, CheckpointSummary, JobType, ScheduledJob, TransactionStore,
};
use stride_core::workflow::{CheckpointKey, TransactionCheckpoint, TransactionState};

/// Checkpoint and delayed job storage in PostgreSQL.
///
/// Checkpoints live in `stride_checkpoints` as JSONB with their version in a
/// separate column for compare-and-swap. Jobs live in `stride_jobs` keyed by
/// their deterministic id and are claimed with `FOR UPDATE SKIP LOCKED`;
/// a claim only stamps `claimed_at`, the row is deleted once dispatch succeeds.
#[derive(Clone)]
pub struct PgTransactionStore {
    pool: PgPool,
}

impl PgTransactionStore {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    async fn get_checkpoint(&self, key: CheckpointKey) -> Result<Option<TransactionCheckpoint>> {
        let row: Option<(serde_json::Value,)> = sqlx::query_as(
            r#"
            SELECT checkpoint FROM stride_checkpoints
            WHERE workflow_id = $1 AND transaction_id = $2
              AND (expires_at IS NULL OR expires_at > NOW())
            "#,
        )
        .bind(&key.workflow_id)
        .bind(&key.transaction_id)
        .fetch_optional(&self.pool)
        .await
        .map_err(|e| StrideError::Database(e.to_string()))?;

        row.map(|(value,)| {
            serde_json::from_value(value).map_err(|e| {
                StrideError::Deserialization(format!("Invalid checkpoint {}: {}", key, e))
            })
        })
        .transpose()
    }

    async fn save_checkpoint(
        &self,
        checkpoint: TransactionCheckpoint,
        ttl: Option<Duration>,
    ) -> Result<()> {
        let key = checkpoint.key();
        let version = checkpoint.version() as i64;
        let state = checkpoint.state().as_str();
        let body = serde_json::to_value(&checkpoint)?;

        // The first version is inserted, later ones only replace their predecessor.
        // An expired row that was not purged yet counts as absent.
        let query = if version == 1 {
            r#"
            INSERT INTO stride_checkpoints (
                workflow_id, transaction_id, state, version, checkpoint, expires_at
            ) VALUES ($1, $2, $3, $4, $5, $6)
            ON CONFLICT (workflow_id, transaction_id) DO UPDATE SET
                state = EXCLUDED.state,
                version = EXCLUDED.version,
                checkpoint = EXCLUDED.checkpoint,
                expires_at = EXCLUDED.expires_at,
                created_at = NOW(),
                updated_at = NOW()
            WHERE stride_checkpoints.expires_at IS NOT NULL
              AND stride_checkpoints.expires_at <= NOW()
            "#
        } else {
            r#"
            UPDATE stride_checkpoints SET
                state = $3,
                version = $4,
                checkpoint = $5,
                expires_at = $6,
                updated_at = NOW()
            WHERE workflow_id = $1 AND transaction_id = $2 AND version = $4 - 1
              AND (expires_at IS NULL OR expires_at > NOW())
            "#
        };

        let result = sqlx::query(query)
            .bind(&key.workflow_id)
            .bind(&key.transaction_id)
            .bind(state)
            .bind(version)
            .bind(&body)
            .bind(expires_at(ttl))
            .execute(&self.pool)
            .await
            .map_err(|e| StrideError::Database(e.to_string()))?;

        if result.rows_affected() == 1 {
            return Ok(());
        }

        let found: Option<(i64,)> = sqlx::query_as(
            r#"
            SELECT version FROM stride_checkpoints
            WHERE workflow_id = $1 AND transaction_id = $2
              AND (expires_at IS NULL OR expires_at > NOW())
            "#,
        )
        .bind(&key.workflow_id)
        .bind(&key.transaction_id)
        .fetch_optional(&self.pool)
        .await
        .map_err(|e| StrideError::Database(e.to_string()))?;

        Err(StrideError::Conflict {
            key: key.to_string(),
            expected: checkpoint.version().saturating_sub(1),
            found: found.map(|(v,)| v as u64).unwrap_or(0),
        })
    }

    async fn list_checkpoints(&self) -> Result<Vec<CheckpointSummary>> {
        let rows = sqlx::query(
            r#"
            SELECT workflow_id, transaction_id, state, version, updated_at, expires_at
            FROM stride_checkpoints
            ORDER BY updated_at DESC
            "#,
        )
        .fetch_all(&self.pool)
        .await
        .map_err(|e| StrideError::Database(e.to_string()))?;

        rows.iter()
            .map(|row| {
                let state: String = row.get("state");
                let version: i64 = row.get("version");
                Ok(CheckpointSummary {
                    key: CheckpointKey::new(
                        row.get::<String, _>("workflow_id"),
                        row.get::<String, _>("transaction_id"),
                    ),
                    state: state
                        .parse::<TransactionState>()
                        .map_err(StrideError::Deserialization)?,
                    version: version as u64,
                    updated_at: row.get("updated_at"),
                    expires_at: row.get("expires_at"),
                })
            })
            .collect()
    }

    async fn insert_job(&self, job: ScheduledJob) -> Result<bool> {
        let result = sqlx::query(
            r#"
            INSERT INTO stride_jobs (
                id, job_type, workflow_id, transaction_id, step_id, attempt, run_at
            ) VALUES ($1, $2, $3, $4, $5, $6, $7)
            ON CONFLICT (id) DO NOTHING
            "#,
        )
        .bind(&job.id)
        .bind(job.job_type.as_str())
        .bind(&job.workflow_id)
        .bind(&job.transaction_id)
        .bind(&job.step_id)
        .bind(job.attempt as i32)
        .bind(job.run_at)
        .execute(&self.pool)
        .await
        .map_err(|e| StrideError::Database(e.to_string()))?;

        Ok(result.rows_affected() == 1)
    }

    async fn remove_job(&self, job_id: String) -> Result<()> {
        sqlx::query("DELETE FROM stride_jobs WHERE id = $1")
            .bind(&job_id)
            .execute(&self.pool)
            .await
            .map_err(|e| StrideError::Database(e.to_string()))?;
        Ok(())
    }

    async fn claim_jobs(
        &self,
        now: DateTime<Utc>,
        limit: u32,
        lease: Duration,
    ) -> Result<Vec<ScheduledJob>> {
        let rows = sqlx::query(
            r#"
            WITH claimable AS (
                SELECT id FROM stride_jobs
                WHERE run_at <= $1
                  AND (claimed_at IS NULL OR claimed_at <= $3)
                ORDER BY run_at ASC, id ASC
                LIMIT $2
                FOR UPDATE SKIP LOCKED
            )
            UPDATE stride_jobs SET claimed_at = $1
            WHERE id IN (SELECT id FROM claimable)
            RETURNING id, job_type, workflow_id, transaction_id, step_id, attempt, run_at,
                claimed_at
            "#,
        )
        .bind(now)
        .bind(limit as i64)
        .bind(stale_before(now, lease))
        .fetch_all(&self.pool)
        .await
        .map_err(|e| StrideError::Database(e.to_string()))?;

        let mut jobs = rows
            .iter()
            .map(|row| {
                let job_type: String = row.get("job_type");
                let attempt: i32 = row.get("attempt");
                Ok(ScheduledJob {
                    id: row.get("id"),
                    job_type: job_type
                        .parse::<JobType>()
                        .map_err(StrideError::Deserialization)?,
                    workflow_id: row.get("workflow_id"),
                    transaction_id: row.get("transaction_id"),
                    step_id: row.get("step_id"),
                    attempt: attempt.max(0) as u32,
                    run_at: row.get("run_at"),
                    claimed_at: row.get("claimed_at"),
                })
            })
            .collect::<Result<Vec<_>>>()?;

        // RETURNING does not preserve the subquery order
        jobs.sort_by(|a, b| a.run_at.cmp(&b.run_at).then_with(|| a.id.cmp(&b.id)));
        Ok(jobs)
    }

    async fn unclaim_job(&self, job_id: String, run_at: DateTime<Utc>) -> Result<()> {
        sqlx::query("UPDATE stride_jobs SET claimed_at = NULL, run_at = $2 WHERE id = $1")
            .bind(&job_id)
            .bind(run_at)
            .execute(&self.pool)
            .await
            .map_err(|e| StrideError::Database(e.to_string()))?;
        Ok(())
    }

    async fn purge(&self, now: DateTime<Utc>) -> Result<u64> {
        let result = sqlx::query(
            "DELETE FROM stride_checkpoints WHERE expires_at IS NOT NULL AND expires_at <= $1",
        )
        .bind(now)
        .execute(&self.pool)
        .await
        .map_err(|e| StrideError::Database(e.to_string()))?;

        Ok(result.rows_affected())
    }
}

impl TransactionStore for PgTransactionStore {
    fn get(&self, key: CheckpointKey) -> BoxFuture<'_, Result<Option<TransactionCheckpoint>>> {
        Box::pin(self.get_checkpoint(key))
    }

    fn save(
        &self,
        checkpoint: TransactionCheckpoint,
        ttl: Option<Duration>,
    ) -> BoxFuture<'_, Result<()>> {
        Box::pin(self.save_checkpoint(checkpoint, ttl))
    }

    fn list(&self) -> BoxFuture<'_, Result<Vec<CheckpointSummary>>> {
        Box::pin(self.list_checkpoints())
    }

    fn schedule_job(&self, job: ScheduledJob) -> BoxFuture<'_, Result<bool>> {
        Box::pin(self.insert_job(job))
    }

    fn clear_job(&self, job_id: String) -> BoxFuture<'_, Result<()>> {
        Box::pin(self.remove_job(job_id))
    }

    fn claim_due_jobs(
        &self,
        now: DateTime<Utc>,
        limit: u32,
        lease: Duration,
    ) -> BoxFuture<'_, Result<Vec<ScheduledJob>>> {
        Box::pin(self.claim_jobs(now, limit, lease))
    }

    fn release_job(&self, job_id: String, run_at: DateTime<Utc>) -> BoxFuture<'_, Result<()>> {
        Box::pin(self.unclaim_job(job_id, run_at))
    }

    fn purge_expired(&self, now: DateTime<Utc>) -> BoxFuture<'_, Result<u64>> {
        Box::pin(self.purge(now))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_store_is_object_safe() {
        let pool = PgPool::connect_lazy("postgres://localhost/test").unwrap();
        let store: std::sync::Arc<dyn TransactionStore> =
            std::sync::Arc::new(PgTransactionStore::new(pool));
        let _ = store;
    }
}
