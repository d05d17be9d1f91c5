//! Persistence and delayed job scheduling port.
//!
//! The orchestrator only talks to storage through [`TransactionStore`].
//! Checkpoints are saved with compare-and-swap on their version stamp, and
//! delayed jobs carry deterministic ids so scheduling the same job twice
//! leaves a single pending entry.
//!
//! A claimed job stays stored until it is completed. If its dispatch fails
//! it is released with a later due time, and if the claiming instance dies
//! the claim goes stale after the lease and another poller picks it up.

use std::fmt;
use std::str::FromStr;
use std::time::Duration;

use chrono::{DateTime, Utc};
use futures::future::BoxFuture;
use serde::{Deserialize, Serialize};

use crate::error::Result;
use crate::workflow::{CheckpointKey, TransactionCheckpoint, TransactionState};

/// Kind of delayed job.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JobType {
    Retry,
    StepTimeout,
    TransactionTimeout,
}

impl JobType {
    /// Convert to string for job ids and storage.
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Retry => "retry",
            Self::StepTimeout => "step_timeout",
            Self::TransactionTimeout => "transaction_timeout",
        }
    }
}

impl FromStr for JobType {
    type Err = String;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s {
            "retry" => Ok(Self::Retry),
            "step_timeout" => Ok(Self::StepTimeout),
            "transaction_timeout" => Ok(Self::TransactionTimeout),
            other => Err(format!("unknown job type '{}'", other)),
        }
    }
}

impl fmt::Display for JobType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Deterministic id of a delayed job.
///
/// Transaction-level jobs leave the step segment empty.
pub fn job_id(
    job_type: JobType,
    key: &CheckpointKey,
    step_id: Option<&str>,
    attempt: u32,
) -> String {
    format!(
        "{}:{}:{}:{}:{}",
        job_type.as_str(),
        key.workflow_id,
        key.transaction_id,
        step_id.unwrap_or(""),
        attempt
    )
}

/// A delayed job waiting for its due time.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ScheduledJob {
    pub id: String,
    pub job_type: JobType,
    pub workflow_id: String,
    pub transaction_id: String,
    pub step_id: Option<String>,
    pub attempt: u32,
    pub run_at: DateTime<Utc>,
    /// When a poller last claimed the job. Unset while the job is waiting.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub claimed_at: Option<DateTime<Utc>>,
}

impl ScheduledJob {
    pub fn new(
        job_type: JobType,
        key: &CheckpointKey,
        step_id: Option<&str>,
        attempt: u32,
        run_at: DateTime<Utc>,
    ) -> Self {
        Self {
            id: job_id(job_type, key, step_id, attempt),
            job_type,
            workflow_id: key.workflow_id.clone(),
            transaction_id: key.transaction_id.clone(),
            step_id: step_id.map(str::to_string),
            attempt,
            run_at,
            claimed_at: None,
        }
    }

    /// Key of the transaction the job belongs to.
    pub fn key(&self) -> CheckpointKey {
        CheckpointKey::new(&self.workflow_id, &self.transaction_id)
    }

    pub fn is_due(&self, now: DateTime<Utc>) -> bool {
        self.run_at <= now
    }

    /// Due and either unclaimed or claimed longer than `lease` ago.
    pub fn is_claimable(&self, now: DateTime<Utc>, lease: Duration) -> bool {
        self.is_due(now)
            && self
                .claimed_at
                .map_or(true, |at| at <= stale_before(now, lease))
    }
}

/// Claims made at or before this instant have outlived `lease`.
pub fn stale_before(now: DateTime<Utc>, lease: Duration) -> DateTime<Utc> {
    chrono::Duration::from_std(lease)
        .ok()
        .and_then(|lease| now.checked_sub_signed(lease))
        .unwrap_or(DateTime::<Utc>::MIN_UTC)
}

/// Listing entry for a stored checkpoint.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CheckpointSummary {
    pub key: CheckpointKey,
    pub state: TransactionState,
    pub version: u64,
    pub updated_at: DateTime<Utc>,
    pub expires_at: Option<DateTime<Utc>>,
}

impl CheckpointSummary {
    pub fn of(checkpoint: &TransactionCheckpoint, expires_at: Option<DateTime<Utc>>) -> Self {
        Self {
            key: checkpoint.key(),
            state: checkpoint.state(),
            version: checkpoint.version(),
            updated_at: checkpoint.flow.updated_at,
            expires_at,
        }
    }
}

/// Expiry time for a checkpoint saved now with `ttl`.
pub fn expires_at(ttl: Option<Duration>) -> Option<DateTime<Utc>> {
    ttl.and_then(|ttl| chrono::Duration::from_std(ttl).ok())
        .and_then(|ttl| Utc::now().checked_add_signed(ttl))
}

/// Durable storage of checkpoints and delayed jobs.
pub trait TransactionStore: Send + Sync + 'static {
    /// Load the latest checkpoint. Expired checkpoints are not returned.
    fn get(&self, key: CheckpointKey) -> BoxFuture<'_, Result<Option<TransactionCheckpoint>>>;

    /// Save a checkpoint.
    ///
    /// The stored version must be exactly one less than the checkpoint's
    /// version (or absent when the version is 1), otherwise the save fails
    /// with [`crate::StrideError::Conflict`]. A `ttl` marks the checkpoint
    /// for purging once it elapses.
    fn save(
        &self,
        checkpoint: TransactionCheckpoint,
        ttl: Option<Duration>,
    ) -> BoxFuture<'_, Result<()>>;

    /// List stored checkpoints, most recently updated first.
    fn list(&self) -> BoxFuture<'_, Result<Vec<CheckpointSummary>>>;

    /// Schedule a delayed job. Returns false if a job with the same id is already pending.
    fn schedule_job(&self, job: ScheduledJob) -> BoxFuture<'_, Result<bool>>;

    /// Remove a pending job. Removing an unknown job is not an error.
    fn clear_job(&self, job_id: String) -> BoxFuture<'_, Result<()>>;

    /// Claim up to `limit` jobs due at `now`, earliest first.
    ///
    /// Claimed jobs are not handed out again until `lease` has passed, so
    /// a job whose claimer crashed is eventually picked up by another poller.
    fn claim_due_jobs(
        &self,
        now: DateTime<Utc>,
        limit: u32,
        lease: Duration,
    ) -> BoxFuture<'_, Result<Vec<ScheduledJob>>>;

    /// Drop the claim on a job and make it due again at `run_at`.
    /// Releasing a job that no longer exists is not an error.
    fn release_job(&self, job_id: String, run_at: DateTime<Utc>) -> BoxFuture<'_, Result<()>>;

    /// Remove a job after its dispatch succeeded.
    fn complete_job(&self, job_id: String) -> BoxFuture<'_, Result<()>> {
        self.clear_job(job_id)
    }

    /// Delete checkpoints whose retention elapsed. Returns how many were removed.
    fn purge_expired(&self, now: DateTime<Utc>) -> BoxFuture<'_, Result<u64>>;

    fn schedule_retry(
        &self,
        key: &CheckpointKey,
        step_id: &str,
        attempt: u32,
        run_at: DateTime<Utc>,
    ) -> BoxFuture<'_, Result<bool>> {
        self.schedule_job(ScheduledJob::new(
            JobType::Retry,
            key,
            Some(step_id),
            attempt,
            run_at,
        ))
    }

    fn clear_retry(
        &self,
        key: &CheckpointKey,
        step_id: &str,
        attempt: u32,
    ) -> BoxFuture<'_, Result<()>> {
        self.clear_job(job_id(JobType::Retry, key, Some(step_id), attempt))
    }

    fn schedule_step_timeout(
        &self,
        key: &CheckpointKey,
        step_id: &str,
        attempt: u32,
        run_at: DateTime<Utc>,
    ) -> BoxFuture<'_, Result<bool>> {
        self.schedule_job(ScheduledJob::new(
            JobType::StepTimeout,
            key,
            Some(step_id),
            attempt,
            run_at,
        ))
    }

    fn clear_step_timeout(
        &self,
        key: &CheckpointKey,
        step_id: &str,
        attempt: u32,
    ) -> BoxFuture<'_, Result<()>> {
        self.clear_job(job_id(JobType::StepTimeout, key, Some(step_id), attempt))
    }

    fn schedule_transaction_timeout(
        &self,
        key: &CheckpointKey,
        run_at: DateTime<Utc>,
    ) -> BoxFuture<'_, Result<bool>> {
        self.schedule_job(ScheduledJob::new(
            JobType::TransactionTimeout,
            key,
            None,
            0,
            run_at,
        ))
    }

    fn clear_transaction_timeout(&self, key: &CheckpointKey) -> BoxFuture<'_, Result<()>> {
        self.clear_job(job_id(JobType::TransactionTimeout, key, None, 0))
    }
}
