use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use futures_util::future::BoxFuture;
use tokio::sync::RwLock;

use stride_core::error::{Result, StrideError};
use stride_core::store::{expires_at, CheckpointSummary, ScheduledJob, TransactionStore};
use stride_core::workflow::{CheckpointKey, TransactionCheckpoint};

struct StoredCheckpoint {
    checkpoint: TransactionCheckpoint,
    expires_at: Option<DateTime<Utc>>,
}

impl StoredCheckpoint {
    fn is_expired(&self, now: DateTime<Utc>) -> bool {
        self.expires_at.map_or(false, |at| at <= now)
    }
}

/// Process-local store for tests and single-instance deployments.
///
/// Clones share the same underlying maps, so several services built on
/// clones of one store behave like instances sharing a database.
#[derive(Clone, Default)]
pub struct MemoryTransactionStore {
    checkpoints: Arc<RwLock<HashMap<CheckpointKey, StoredCheckpoint>>>,
    jobs: Arc<RwLock<HashMap<String, ScheduledJob>>>,
}

impl MemoryTransactionStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Pending jobs, earliest first.
    pub async fn pending_jobs(&self) -> Vec<ScheduledJob> {
        let mut jobs: Vec<ScheduledJob> = self.jobs.read().await.values().cloned().collect();
        jobs.sort_by(|a, b| a.run_at.cmp(&b.run_at).then_with(|| a.id.cmp(&b.id)));
        jobs
    }

    async fn get_checkpoint(&self, key: CheckpointKey) -> Result<Option<TransactionCheckpoint>> {
        let checkpoints = self.checkpoints.read().await;
        Ok(checkpoints
            .get(&key)
            .filter(|stored| !stored.is_expired(Utc::now()))
            .map(|stored| stored.checkpoint.clone()))
    }

    async fn save_checkpoint(
        &self,
        checkpoint: TransactionCheckpoint,
        ttl: Option<Duration>,
    ) -> Result<()> {
        let key = checkpoint.key();
        let expected = checkpoint.version().saturating_sub(1);

        let mut checkpoints = self.checkpoints.write().await;
        let found = checkpoints
            .get(&key)
            .filter(|stored| !stored.is_expired(Utc::now()))
            .map(|stored| stored.checkpoint.version())
            .unwrap_or(0);

        if found != expected {
            return Err(StrideError::Conflict {
                key: key.to_string(),
                expected,
                found,
            });
        }

        checkpoints.insert(
            key,
            StoredCheckpoint {
                checkpoint,
                expires_at: expires_at(ttl),
            },
        );
        Ok(())
    }

    async fn list_checkpoints(&self) -> Result<Vec<CheckpointSummary>> {
        let checkpoints = self.checkpoints.read().await;
        let mut summaries: Vec<CheckpointSummary> = checkpoints
            .values()
            .map(|stored| CheckpointSummary::of(&stored.checkpoint, stored.expires_at))
            .collect();
        summaries.sort_by(|a, b| b.updated_at.cmp(&a.updated_at));
        Ok(summaries)
    }

    async fn insert_job(&self, job: ScheduledJob) -> Result<bool> {
        let mut jobs = self.jobs.write().await;
        if jobs.contains_key(&job.id) {
            return Ok(false);
        }
        jobs.insert(job.id.clone(), job);
        Ok(true)
    }

    async fn remove_job(&self, job_id: String) -> Result<()> {
        self.jobs.write().await.remove(&job_id);
        Ok(())
    }

    async fn claim_jobs(
        &self,
        now: DateTime<Utc>,
        limit: u32,
        lease: Duration,
    ) -> Result<Vec<ScheduledJob>> {
        let mut jobs = self.jobs.write().await;

        let mut due: Vec<&mut ScheduledJob> = jobs
            .values_mut()
            .filter(|j| j.is_claimable(now, lease))
            .collect();
        due.sort_by(|a, b| a.run_at.cmp(&b.run_at).then_with(|| a.id.cmp(&b.id)));
        due.truncate(limit as usize);

        Ok(due
            .into_iter()
            .map(|job| {
                job.claimed_at = Some(now);
                job.clone()
            })
            .collect())
    }

    async fn unclaim_job(&self, job_id: String, run_at: DateTime<Utc>) -> Result<()> {
        if let Some(job) = self.jobs.write().await.get_mut(&job_id) {
            job.claimed_at = None;
            job.run_at = run_at;
        }
        Ok(())
    }

    async fn purge(&self, now: DateTime<Utc>) -> Result<u64> {
        let mut checkpoints = self.checkpoints.write().await;
        let before = checkpoints.len();
        checkpoints.retain(|_, stored| !stored.is_expired(now));
        Ok((before - checkpoints.len()) as u64)
    }
}

impl TransactionStore for MemoryTransactionStore {
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
    use stride_core::store::JobType;
    use stride_core::workflow::{DistributedTransaction, StepDefinition, WorkflowDefinition};

    fn checkpoint(version: u64) -> TransactionCheckpoint {
        let mut def = WorkflowDefinition::new("checkout");
        def.steps = vec![StepDefinition::new("reserve")];
        let mut tx = DistributedTransaction::new(&def, "tx-1", serde_json::Value::Null);
        tx.version = version;
        TransactionCheckpoint::from(&tx)
    }

    #[tokio::test]
    async fn test_save_and_get() {
        let store = MemoryTransactionStore::new();
        let key = CheckpointKey::new("checkout", "tx-1");

        assert!(store.get(key.clone()).await.unwrap().is_none());
        store.save(checkpoint(1), None).await.unwrap();

        let loaded = store.get(key).await.unwrap().unwrap();
        assert_eq!(loaded.version(), 1);
    }

    #[tokio::test]
    async fn test_save_is_compare_and_swap() {
        let store = MemoryTransactionStore::new();
        store.save(checkpoint(1), None).await.unwrap();
        store.save(checkpoint(2), None).await.unwrap();

        let stale = store.save(checkpoint(2), None).await;
        match stale {
            Err(StrideError::Conflict { expected, found, .. }) => {
                assert_eq!(expected, 1);
                assert_eq!(found, 2);
            }
            other => panic!("expected conflict, got {:?}", other),
        }

        let fresh = MemoryTransactionStore::new();
        assert!(fresh.save(checkpoint(3), None).await.is_err());
    }

    #[tokio::test]
    async fn test_expired_checkpoints_hidden_and_purged() {
        let store = MemoryTransactionStore::new();
        store
            .save(checkpoint(1), Some(Duration::from_secs(0)))
            .await
            .unwrap();

        let key = CheckpointKey::new("checkout", "tx-1");
        assert!(store.get(key).await.unwrap().is_none());
        assert_eq!(store.list().await.unwrap().len(), 1);

        assert_eq!(store.purge_expired(Utc::now()).await.unwrap(), 1);
        assert!(store.list().await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_duplicate_jobs_collapse() {
        let store = MemoryTransactionStore::new();
        let key = CheckpointKey::new("checkout", "tx-1");
        let at = Utc::now();

        assert!(store.schedule_retry(&key, "charge", 2, at).await.unwrap());
        assert!(!store.schedule_retry(&key, "charge", 2, at).await.unwrap());
        assert!(store.schedule_retry(&key, "charge", 3, at).await.unwrap());
        assert_eq!(store.pending_jobs().await.len(), 2);

        store.clear_retry(&key, "charge", 3).await.unwrap();
        assert_eq!(store.pending_jobs().await.len(), 1);
    }

    #[tokio::test]
    async fn test_claim_due_jobs() {
        let store = MemoryTransactionStore::new();
        let key = CheckpointKey::new("checkout", "tx-1");
        let now = Utc::now();
        let lease = Duration::from_secs(60);

        store
            .schedule_step_timeout(&key, "charge", 1, now - chrono::Duration::seconds(5))
            .await
            .unwrap();
        store
            .schedule_transaction_timeout(&key, now - chrono::Duration::seconds(10))
            .await
            .unwrap();
        store
            .schedule_retry(&key, "ship", 2, now + chrono::Duration::seconds(60))
            .await
            .unwrap();

        let due = store.claim_due_jobs(now, 10, lease).await.unwrap();
        assert_eq!(due.len(), 2);
        assert_eq!(due[0].job_type, JobType::TransactionTimeout);
        assert_eq!(due[1].job_type, JobType::StepTimeout);
        assert_eq!(due[0].claimed_at, Some(now));

        // Claimed jobs stay stored but are not handed out twice.
        assert!(store.claim_due_jobs(now, 10, lease).await.unwrap().is_empty());
        assert_eq!(store.pending_jobs().await.len(), 3);

        store.complete_job(due[0].id.clone()).await.unwrap();
        assert_eq!(store.pending_jobs().await.len(), 2);
    }

    #[tokio::test]
    async fn test_released_and_stale_claims_are_reclaimed() {
        let store = MemoryTransactionStore::new();
        let key = CheckpointKey::new("checkout", "tx-1");
        let now = Utc::now();
        let lease = Duration::from_secs(60);

        store.schedule_retry(&key, "charge", 2, now).await.unwrap();
        store.schedule_retry(&key, "ship", 2, now).await.unwrap();

        let claimed = store.claim_due_jobs(now, 10, lease).await.unwrap();
        assert_eq!(claimed.len(), 2);

        let released_at = now + chrono::Duration::seconds(1);
        store
            .release_job(claimed[0].id.clone(), released_at)
            .await
            .unwrap();
        assert!(store.claim_due_jobs(now, 10, lease).await.unwrap().is_empty());

        let again = store.claim_due_jobs(released_at, 10, lease).await.unwrap();
        assert_eq!(again.len(), 1);
        assert_eq!(again[0].id, claimed[0].id);

        // The other claim was never completed or released.
        let stale = now + chrono::Duration::milliseconds(60_500);
        let reclaimed = store.claim_due_jobs(stale, 10, lease).await.unwrap();
        assert_eq!(reclaimed.len(), 1);
        assert_eq!(reclaimed[0].id, claimed[1].id);

        store
            .release_job("retry:gone:tx::0".into(), now)
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn test_expired_checkpoint_does_not_block_a_new_run() {
        let store = MemoryTransactionStore::new();
        store.save(checkpoint(1), None).await.unwrap();
        store
            .save(checkpoint(2), Some(Duration::from_secs(0)))
            .await
            .unwrap();

        store.save(checkpoint(1), None).await.unwrap();
        let key = CheckpointKey::new("checkout", "tx-1");
        assert_eq!(store.get(key).await.unwrap().unwrap().version(), 1);
    }
}
