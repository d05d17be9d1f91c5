use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use futures_util::future::BoxFuture;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

use stride_core::config::SchedulerConfig;
use stride_core::store::{ScheduledJob, TransactionStore};
use stride_core::Result;

/// Executes a due delayed job.
pub trait JobDispatcher: Send + Sync + 'static {
    fn dispatch(&self, job: ScheduledJob) -> BoxFuture<'_, Result<()>>;
}

/// Poller for delayed jobs.
///
/// Claims due retries and timeouts from the store and hands them to the
/// dispatcher. A claim holds for the configured lease, so several instances
/// can poll the same store without running a job twice. A job is removed
/// only after its dispatch succeeded; a failed dispatch releases it to run
/// again after the release delay. Expired checkpoints are purged on a
/// slower cadence.
pub struct JobScheduler {
    store: Arc<dyn TransactionStore>,
    dispatcher: Arc<dyn JobDispatcher>,
    config: SchedulerConfig,
}

impl JobScheduler {
    pub fn new(
        store: Arc<dyn TransactionStore>,
        dispatcher: Arc<dyn JobDispatcher>,
        config: SchedulerConfig,
    ) -> Self {
        Self {
            store,
            dispatcher,
            config,
        }
    }

    /// Run the scheduler until shutdown.
    pub async fn run(&self, shutdown: CancellationToken) {
        let poll_interval = Duration::from_millis(self.config.poll_interval_ms.max(1));
        let purge_interval = Duration::from_secs(self.config.purge_interval_secs.max(1));
        let mut interval = tokio::time::interval(poll_interval);
        let mut last_purge = Instant::now();

        tracing::info!(
            poll_interval = ?poll_interval,
            batch_size = self.config.batch_size,
            "Job scheduler started"
        );

        loop {
            tokio::select! {
                _ = interval.tick() => {
                    if let Err(e) = self.process_due_jobs().await {
                        tracing::error!(error = %e, "Failed to process due jobs");
                    }

                    if last_purge.elapsed() >= purge_interval {
                        last_purge = Instant::now();
                        if let Err(e) = self.purge_expired().await {
                            tracing::error!(error = %e, "Failed to purge expired checkpoints");
                        }
                    }
                }
                _ = shutdown.cancelled() => {
                    tracing::info!("Job scheduler shutting down");
                    break;
                }
            }
        }
    }

    /// Claim and dispatch the jobs due now. Returns how many were claimed.
    pub async fn process_due_jobs(&self) -> Result<usize> {
        let jobs = self
            .store
            .claim_due_jobs(Utc::now(), self.config.batch_size.max(1), self.config.lease())
            .await?;

        let count = jobs.len();
        if count > 0 {
            tracing::debug!(count, "Processing due jobs");
        }

        for job in jobs {
            let id = job.id.clone();
            match self.dispatcher.dispatch(job).await {
                Ok(()) => {
                    if let Err(e) = self.store.complete_job(id.clone()).await {
                        tracing::warn!(job_id = %id, error = %e, "Failed to complete job");
                    }
                }
                Err(e) => {
                    tracing::error!(job_id = %id, error = %e, "Failed to run job");
                    let delay = chrono::Duration::from_std(self.config.release_delay())
                        .unwrap_or_else(|_| chrono::Duration::zero());
                    let now = Utc::now();
                    let run_at = now.checked_add_signed(delay).unwrap_or(now);
                    if let Err(e) = self.store.release_job(id.clone(), run_at).await {
                        tracing::warn!(
                            job_id = %id,
                            error = %e,
                            "Failed to release job, it runs again once its lease expires"
                        );
                    }
                }
            }
        }

        Ok(count)
    }

    /// Remove checkpoints whose retention has elapsed.
    pub async fn purge_expired(&self) -> Result<u64> {
        let purged = self.store.purge_expired(Utc::now()).await?;
        if purged > 0 {
            tracing::info!(purged, "Purged expired checkpoints");
        }
        Ok(purged)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::MemoryTransactionStore;
    use stride_core::store::JobType;
    use stride_core::workflow::CheckpointKey;
    use stride_core::StrideError;
    use tokio::sync::Mutex;

    /// Records dispatched jobs. Attempt 99 always fails, attempt 98 fails once.
    #[derive(Default)]
    struct Recorder {
        jobs: Mutex<Vec<ScheduledJob>>,
    }

    impl JobDispatcher for Recorder {
        fn dispatch(&self, job: ScheduledJob) -> BoxFuture<'_, Result<()>> {
            Box::pin(async move {
                let mut jobs = self.jobs.lock().await;
                let seen = jobs.iter().filter(|j| j.id == job.id).count();
                let fail = job.attempt == 99 || (job.attempt == 98 && seen == 0);
                jobs.push(job);
                if fail {
                    return Err(StrideError::Database("connection reset".into()));
                }
                Ok(())
            })
        }
    }

    fn scheduler(store: &MemoryTransactionStore, recorder: Arc<Recorder>) -> JobScheduler {
        JobScheduler::new(
            Arc::new(store.clone()),
            recorder,
            SchedulerConfig::default(),
        )
    }

    #[tokio::test]
    async fn test_due_jobs_are_dispatched_once() {
        let store = MemoryTransactionStore::new();
        let key = CheckpointKey::new("checkout", "tx-1");
        let past = Utc::now() - chrono::Duration::seconds(5);
        let future = Utc::now() + chrono::Duration::hours(1);

        store.schedule_retry(&key, "charge", 2, past).await.unwrap();
        store.schedule_transaction_timeout(&key, future).await.unwrap();

        let recorder = Arc::new(Recorder::default());
        let scheduler = scheduler(&store, recorder.clone());

        assert_eq!(scheduler.process_due_jobs().await.unwrap(), 1);
        assert_eq!(scheduler.process_due_jobs().await.unwrap(), 0);

        let jobs = recorder.jobs.lock().await;
        assert_eq!(jobs.len(), 1);
        assert_eq!(jobs[0].job_type, JobType::Retry);
        assert_eq!(jobs[0].step_id.as_deref(), Some("charge"));
        assert_eq!(store.pending_jobs().await.len(), 1);
    }

    #[tokio::test]
    async fn test_dispatch_errors_do_not_stop_the_batch() {
        let store = MemoryTransactionStore::new();
        let key = CheckpointKey::new("checkout", "tx-1");
        let past = Utc::now() - chrono::Duration::seconds(5);

        store.schedule_retry(&key, "a", 99, past).await.unwrap();
        store.schedule_retry(&key, "b", 2, past).await.unwrap();

        let recorder = Arc::new(Recorder::default());
        let scheduler = scheduler(&store, recorder.clone());

        assert_eq!(scheduler.process_due_jobs().await.unwrap(), 2);
        assert_eq!(recorder.jobs.lock().await.len(), 2);

        // The failed job is kept and released for a later poll.
        let pending = store.pending_jobs().await;
        assert_eq!(pending.len(), 1);
        assert_eq!(pending[0].step_id.as_deref(), Some("a"));
        assert!(pending[0].claimed_at.is_none());
        assert!(pending[0].run_at > Utc::now());
    }

    #[tokio::test]
    async fn test_failed_dispatch_is_retried() {
        let store = MemoryTransactionStore::new();
        let key = CheckpointKey::new("checkout", "tx-1");
        let past = Utc::now() - chrono::Duration::seconds(5);
        store.schedule_retry(&key, "charge", 98, past).await.unwrap();

        let recorder = Arc::new(Recorder::default());
        let config = SchedulerConfig {
            release_delay_ms: 0,
            ..Default::default()
        };
        let scheduler = JobScheduler::new(Arc::new(store.clone()), recorder.clone(), config);

        assert_eq!(scheduler.process_due_jobs().await.unwrap(), 1);
        assert_eq!(store.pending_jobs().await.len(), 1);

        assert_eq!(scheduler.process_due_jobs().await.unwrap(), 1);
        assert!(store.pending_jobs().await.is_empty());
        assert_eq!(recorder.jobs.lock().await.len(), 2);
    }

    #[tokio::test]
    async fn test_claimed_job_is_not_dispatched_twice() {
        let store = MemoryTransactionStore::new();
        let key = CheckpointKey::new("checkout", "tx-1");
        let past = Utc::now() - chrono::Duration::seconds(5);
        store.schedule_retry(&key, "charge", 2, past).await.unwrap();

        // Another poller holds the claim.
        let claimed = store
            .claim_due_jobs(Utc::now(), 10, Duration::from_secs(60))
            .await
            .unwrap();
        assert_eq!(claimed.len(), 1);

        let recorder = Arc::new(Recorder::default());
        let scheduler = scheduler(&store, recorder.clone());
        assert_eq!(scheduler.process_due_jobs().await.unwrap(), 0);
        assert!(recorder.jobs.lock().await.is_empty());
    }

    #[tokio::test]
    async fn test_run_stops_on_shutdown() {
        let store = MemoryTransactionStore::new();
        let scheduler = scheduler(&store, Arc::new(Recorder::default()));
        let shutdown = CancellationToken::new();
        shutdown.cancel();

        tokio::time::timeout(Duration::from_secs(1), scheduler.run(shutdown))
            .await
            .unwrap();
    }
}
