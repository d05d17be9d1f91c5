use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use futures_util::stream::{self, StreamExt};
use tokio::sync::RwLock;
use tokio_util::sync::CancellationToken;

use stride_core::config::OrchestratorConfig;
use stride_core::error::{Result, StrideError};
use stride_core::store::TransactionStore;
use stride_core::workflow::{
    CheckpointKey, DistributedTransaction, EventKind, IdempotencyKey, PayloadMetadata,
    StepAction, StepError, StepHandler, StepOutcome, StepPayload, StepState,
    TransactionCheckpoint, Workflow,
};

use super::emitter::{EventEmitter, Outbox};

/// Cancellation tokens of the passes currently advancing transactions in this process.
#[derive(Clone, Default)]
pub struct ActivePasses {
    tokens: Arc<RwLock<HashMap<CheckpointKey, CancellationToken>>>,
}

impl ActivePasses {
    pub fn new() -> Self {
        Self::default()
    }

    async fn register(&self, key: &CheckpointKey) -> CancellationToken {
        let token = CancellationToken::new();
        self.tokens.write().await.insert(key.clone(), token.clone());
        token
    }

    async fn release(&self, key: &CheckpointKey) {
        self.tokens.write().await.remove(key);
    }

    /// Ask the active pass of a transaction to stop at its next wave boundary.
    /// Returns false when no pass is running.
    pub async fn cancel(&self, key: &CheckpointKey) -> bool {
        match self.tokens.read().await.get(key) {
            Some(token) => {
                token.cancel();
                true
            }
            None => false,
        }
    }

    pub async fn is_active(&self, key: &CheckpointKey) -> bool {
        self.tokens.read().await.contains_key(key)
    }
}

/// Result of delivering an async step callback.
#[derive(Debug, Clone)]
pub struct CallbackOutcome {
    /// False when the step was not waiting for a callback and nothing changed.
    pub applied: bool,
    pub transaction: DistributedTransaction,
}

/// Drives the transactions of one workflow.
///
/// Each call loads nothing implicitly except where noted; callers hand in a
/// transaction rehydrated from its checkpoint and get back the state after
/// the pass settled. Events describing a transition are held in an
/// [`Outbox`] and announced only once the checkpoint recording it is saved.
pub struct TransactionOrchestrator {
    workflow: Arc<Workflow>,
    store: Arc<dyn TransactionStore>,
    emitter: EventEmitter,
    passes: ActivePasses,
    config: OrchestratorConfig,
}

impl TransactionOrchestrator {
    pub fn new(
        workflow: Arc<Workflow>,
        store: Arc<dyn TransactionStore>,
        emitter: EventEmitter,
        passes: ActivePasses,
        config: OrchestratorConfig,
    ) -> Self {
        Self {
            workflow,
            store,
            emitter,
            passes,
            config,
        }
    }

    pub fn workflow(&self) -> &Arc<Workflow> {
        &self.workflow
    }

    fn key(&self, transaction_id: &str) -> CheckpointKey {
        CheckpointKey::new(self.workflow.id(), transaction_id)
    }

    fn retention(&self) -> Duration {
        self.workflow
            .definition()
            .retention()
            .unwrap_or_else(|| self.config.retention())
    }

    /// Create a transaction, persist it and run it as far as it goes.
    pub async fn begin_transaction(
        &self,
        transaction_id: &str,
        input: serde_json::Value,
    ) -> Result<DistributedTransaction> {
        let mut tx =
            DistributedTransaction::new(self.workflow.definition(), transaction_id, input);
        let key = self.key(transaction_id);

        tracing::info!(
            workflow_id = %key.workflow_id,
            transaction_id = %key.transaction_id,
            "Beginning transaction"
        );

        let mut outbox = Outbox::new();
        outbox.push(&tx, EventKind::Begin);
        self.persist(&mut tx, &mut outbox).await?;

        if let Some(timeout) = self.workflow.definition().timeout() {
            self.store
                .schedule_transaction_timeout(&key, deadline(timeout))
                .await?;
        }

        self.drive(tx).await
    }

    /// Continue a transaction from its current state.
    pub async fn resume(&self, tx: DistributedTransaction) -> Result<DistributedTransaction> {
        if tx.is_terminal() {
            return Ok(tx);
        }

        tracing::debug!(
            workflow_id = %tx.workflow_id,
            transaction_id = %tx.transaction_id,
            "Resuming transaction"
        );
        self.emitter.emit(&tx, EventKind::Resume);
        self.drive(tx).await
    }

    /// Latest persisted state, without advancing it.
    pub async fn retrieve_existing_transaction(
        &self,
        transaction_id: &str,
    ) -> Result<Option<DistributedTransaction>> {
        Ok(self
            .store
            .get(self.key(transaction_id))
            .await?
            .map(DistributedTransaction::from))
    }

    async fn load(&self, transaction_id: &str) -> Result<DistributedTransaction> {
        self.retrieve_existing_transaction(transaction_id)
            .await?
            .ok_or_else(|| {
                StrideError::NotFound(format!(
                    "Transaction '{}' of workflow '{}'",
                    transaction_id,
                    self.workflow.id()
                ))
            })
    }

    /// Complete a dormant step with the response of its external work.
    pub async fn register_step_success(
        &self,
        key: &IdempotencyKey,
        response: serde_json::Value,
    ) -> Result<CallbackOutcome> {
        self.register_callback(key, Ok(response)).await
    }

    /// Fail a dormant step. Transient errors follow the step's retry policy.
    pub async fn register_step_failure(
        &self,
        key: &IdempotencyKey,
        error: StepError,
    ) -> Result<CallbackOutcome> {
        self.register_callback(key, Err(error)).await
    }

    async fn register_callback(
        &self,
        key: &IdempotencyKey,
        outcome: std::result::Result<serde_json::Value, StepError>,
    ) -> Result<CallbackOutcome> {
        if key.workflow_id != self.workflow.id() {
            return Err(StrideError::InvalidArgument(format!(
                "Key {} does not belong to workflow '{}'",
                key,
                self.workflow.id()
            )));
        }

        let mut tx = self.load(&key.transaction_id).await?;
        let step = tx.step(&key.step_id).ok_or_else(|| {
            StrideError::NotFound(format!(
                "Step '{}' of transaction '{}'",
                key.step_id, key.transaction_id
            ))
        })?;

        if key.action != StepAction::Invoke
            || step.phase != StepAction::Invoke
            || step.state != StepState::Dormant
        {
            tracing::debug!(
                key = %key,
                state = step.state.as_str(),
                "Ignoring callback for step not awaiting one"
            );
            return Ok(CallbackOutcome {
                applied: false,
                transaction: tx,
            });
        }

        let attempt = step.attempts;
        if step.definition.timeout_secs.is_some() {
            self.clear_step_timeout(&self.key(&key.transaction_id), &key.step_id, attempt)
                .await;
        }

        let mut outbox = Outbox::new();
        match outcome {
            Ok(response) => {
                tx.complete_step(&key.step_id, response.clone());
                tracing::info!(key = %key, "Async step completed");
                outbox.push(
                    &tx,
                    EventKind::StepSuccess {
                        step: key.step_id.clone(),
                        response,
                    },
                );
            }
            Err(error) => {
                self.apply_failure(&mut tx, &key.step_id, error, &mut outbox)
                    .await?
            }
        }

        self.persist(&mut tx, &mut outbox).await?;
        let transaction = self.drive(tx).await?;

        Ok(CallbackOutcome {
            applied: true,
            transaction,
        })
    }

    /// Roll a transaction back: pending and dormant steps are skipped and
    /// completed ones compensated. Terminal transactions are returned unchanged.
    pub async fn cancel_transaction(
        &self,
        mut tx: DistributedTransaction,
    ) -> Result<DistributedTransaction> {
        if tx.is_terminal() {
            return Ok(tx);
        }

        tracing::info!(
            workflow_id = %tx.workflow_id,
            transaction_id = %tx.transaction_id,
            "Cancelling transaction"
        );
        tx.cancelled = true;
        self.drive(tx).await
    }

    /// Signal the pass currently advancing `transaction_id`, if any.
    pub async fn request_cancel(&self, transaction_id: &str) -> bool {
        self.passes.cancel(&self.key(transaction_id)).await
    }

    /// Run a step whose delayed retry is due.
    pub async fn handle_retry(
        &self,
        transaction_id: &str,
        step_id: &str,
        attempt: u32,
    ) -> Result<Option<DistributedTransaction>> {
        let Some(mut tx) = self.retrieve_existing_transaction(transaction_id).await? else {
            tracing::debug!(transaction_id, step_id, "Retry for unknown transaction");
            return Ok(None);
        };

        let due = tx
            .step(step_id)
            .map_or(false, |s| s.awaits_retry() && s.attempts + 1 == attempt);
        if !due || tx.is_terminal() {
            tracing::debug!(transaction_id, step_id, attempt, "Stale retry job");
            return Ok(Some(tx));
        }

        if let Some(step) = tx.step_mut(step_id) {
            step.next_retry_at = None;
        }
        self.emitter.emit(&tx, EventKind::Resume);
        self.drive(tx).await.map(Some)
    }

    /// Fail a step that did not finish within its timeout.
    pub async fn handle_step_timeout(
        &self,
        transaction_id: &str,
        step_id: &str,
        attempt: u32,
    ) -> Result<Option<DistributedTransaction>> {
        let Some(mut tx) = self.retrieve_existing_transaction(transaction_id).await? else {
            return Ok(None);
        };

        let expired = tx.step(step_id).map_or(false, |s| {
            s.phase == StepAction::Invoke
                && s.attempts == attempt
                && matches!(s.state, StepState::Invoking | StepState::Dormant)
        });
        if !expired {
            tracing::debug!(transaction_id, step_id, attempt, "Stale step timeout job");
            return Ok(Some(tx));
        }

        tracing::warn!(
            workflow_id = %tx.workflow_id,
            transaction_id,
            step_id,
            attempt,
            "Step timed out"
        );
        let mut outbox = Outbox::new();
        outbox.push(
            &tx,
            EventKind::Timeout {
                step: Some(step_id.to_string()),
            },
        );

        let error = StepError::timeout(format!("step '{}' timed out", step_id));
        tx.record_error(step_id, StepAction::Invoke, error.clone());
        if let Some(step) = tx.step_mut(step_id) {
            step.fail(error.clone());
        }
        outbox.push(
            &tx,
            EventKind::StepFailure {
                step: step_id.to_string(),
                error: error.message,
                will_retry: false,
            },
        );

        self.persist(&mut tx, &mut outbox).await?;
        self.drive(tx).await.map(Some)
    }

    /// Roll back a transaction that outlived the workflow timeout.
    pub async fn handle_transaction_timeout(
        &self,
        transaction_id: &str,
    ) -> Result<Option<DistributedTransaction>> {
        let Some(mut tx) = self.retrieve_existing_transaction(transaction_id).await? else {
            return Ok(None);
        };

        if tx.is_terminal() || tx.timed_out {
            return Ok(Some(tx));
        }

        tracing::warn!(
            workflow_id = %tx.workflow_id,
            transaction_id,
            "Transaction timed out"
        );
        tx.timed_out = true;
        let mut outbox = Outbox::new();
        outbox.push(&tx, EventKind::Timeout { step: None });
        self.persist(&mut tx, &mut outbox).await?;
        self.drive(tx).await.map(Some)
    }

    async fn drive(&self, tx: DistributedTransaction) -> Result<DistributedTransaction> {
        let key = self.key(&tx.transaction_id);
        let token = self.passes.register(&key).await;
        let result = self.advance(tx, &token).await;
        self.passes.release(&key).await;
        result
    }

    /// Run waves until nothing can progress, then announce a terminal state.
    async fn advance(
        &self,
        mut tx: DistributedTransaction,
        cancel: &CancellationToken,
    ) -> Result<DistributedTransaction> {
        let mut outbox = Outbox::new();
        let recovered = tx.recover_interrupted();
        if !recovered.is_empty() {
            tracing::warn!(
                workflow_id = %tx.workflow_id,
                transaction_id = %tx.transaction_id,
                steps = ?recovered,
                "Re-running steps interrupted by an earlier pass"
            );
            self.persist(&mut tx, &mut outbox).await?;
        }

        loop {
            let mut dirty = false;
            if cancel.is_cancelled() && !tx.cancelled {
                tracing::info!(
                    workflow_id = %tx.workflow_id,
                    transaction_id = %tx.transaction_id,
                    "Cancellation observed"
                );
                tx.cancelled = true;
                dirty = true;
            }

            if tx.is_rolling_back() {
                let before: Vec<StepState> = tx.steps.iter().map(|s| s.state).collect();
                let queued = tx.start_rollback();
                if !queued.is_empty() {
                    tracing::info!(
                        workflow_id = %tx.workflow_id,
                        transaction_id = %tx.transaction_id,
                        steps = ?queued,
                        "Compensating completed steps"
                    );
                    outbox.push(&tx, EventKind::CompensateBegin);
                }
                if dirty || !outbox.is_empty() || tx.steps.iter().map(|s| s.state).ne(before) {
                    self.persist(&mut tx, &mut outbox).await?;
                }

                match tx.next_compensation() {
                    Some(step_id) => {
                        self.compensate_step(&mut tx, &step_id, &mut outbox).await?;
                        continue;
                    }
                    None => break,
                }
            }

            let ready = tx.ready_steps(Utc::now());
            if ready.is_empty() {
                break;
            }
            self.run_wave(&mut tx, ready, &mut outbox).await?;
        }

        if !outbox.is_empty() {
            self.persist(&mut tx, &mut outbox).await?;
        }
        if tx.is_terminal() {
            self.finish(&tx).await;
        }
        Ok(tx)
    }

    /// Invoke a set of ready steps concurrently, then apply their outcomes in
    /// completion order once the whole wave has settled.
    async fn run_wave(
        &self,
        tx: &mut DistributedTransaction,
        ready: Vec<String>,
        outbox: &mut Outbox,
    ) -> Result<()> {
        let key = self.key(&tx.transaction_id);
        let mut calls = Vec::with_capacity(ready.len());

        for step_id in ready {
            let Some(step) = tx.step_mut(&step_id) else {
                continue;
            };
            step.begin_invoke();
            let attempt = step.attempts;
            let timeout = step.definition.timeout_duration();

            tracing::debug!(
                workflow_id = %key.workflow_id,
                transaction_id = %key.transaction_id,
                step_id = %step_id,
                attempt,
                "Invoking step"
            );
            outbox.push(
                tx,
                EventKind::StepBegin {
                    step: step_id.clone(),
                    attempt,
                },
            );

            if let Some(timeout) = timeout {
                self.store
                    .schedule_step_timeout(&key, &step_id, attempt, deadline(timeout))
                    .await?;
            }

            let payload = self.payload(tx, &step_id, StepAction::Invoke, attempt);
            calls.push((step_id, payload, timeout));
        }

        self.persist(tx, outbox).await?;

        let outcomes: Vec<_> = stream::iter(calls.into_iter().map(|(step_id, payload, timeout)| {
            let handler = self.workflow.handler(&step_id);
            async move {
                let outcome = match handler {
                    Some(handler) => invoke_with_timeout(handler, payload, timeout).await,
                    None => Err(missing_handler(&step_id)),
                };
                (step_id, outcome)
            }
        }))
        .buffer_unordered(self.config.max_concurrent_steps.max(1))
        .collect()
        .await;

        for (step_id, outcome) in outcomes {
            self.apply_invoke_outcome(tx, &step_id, outcome, outbox)
                .await?;
        }

        Ok(())
    }

    async fn apply_invoke_outcome(
        &self,
        tx: &mut DistributedTransaction,
        step_id: &str,
        outcome: std::result::Result<StepOutcome, StepError>,
        outbox: &mut Outbox,
    ) -> Result<()> {
        let key = self.key(&tx.transaction_id);
        let Some(step) = tx.step(step_id) else {
            return Ok(());
        };
        let attempt = step.attempts;
        let is_async = step.definition.is_async;
        let has_timeout = step.definition.timeout_secs.is_some();

        match outcome {
            Ok(StepOutcome::Completed(response)) if !is_async => {
                if has_timeout {
                    self.clear_step_timeout(&key, step_id, attempt).await;
                }
                tx.complete_step(step_id, response.clone());
                tracing::debug!(
                    workflow_id = %key.workflow_id,
                    transaction_id = %key.transaction_id,
                    step_id,
                    attempt,
                    "Step completed"
                );
                outbox.push(
                    tx,
                    EventKind::StepSuccess {
                        step: step_id.to_string(),
                        response,
                    },
                );
            }
            Ok(outcome) => {
                let response = match outcome {
                    StepOutcome::Completed(response) => Some(response),
                    StepOutcome::Pending => None,
                };
                if let Some(step) = tx.step_mut(step_id) {
                    step.park(response);
                }
                tracing::debug!(
                    workflow_id = %key.workflow_id,
                    transaction_id = %key.transaction_id,
                    step_id,
                    "Step awaiting callback"
                );
                outbox.push(
                    tx,
                    EventKind::StepAwaiting {
                        step: step_id.to_string(),
                    },
                );
            }
            Err(error) => {
                if has_timeout {
                    self.clear_step_timeout(&key, step_id, attempt).await;
                }
                self.apply_failure(tx, step_id, error, outbox).await?;
            }
        }

        self.persist(tx, outbox).await
    }

    /// Record a failed invoke and either schedule a retry or fail the step.
    async fn apply_failure(
        &self,
        tx: &mut DistributedTransaction,
        step_id: &str,
        error: StepError,
        outbox: &mut Outbox,
    ) -> Result<()> {
        let key = self.key(&tx.transaction_id);
        tx.record_error(step_id, StepAction::Invoke, error.clone());

        let Some(step) = tx.step_mut(step_id) else {
            return Ok(());
        };
        let attempt = step.attempts;
        let will_retry = error.is_retryable() && step.can_retry();

        if will_retry {
            let interval = step.definition.retry_interval();
            if interval.is_zero() {
                step.schedule_retry(error.clone(), None);
            } else {
                let run_at = deadline(interval);
                step.schedule_retry(error.clone(), Some(run_at));
                self.store
                    .schedule_retry(&key, step_id, attempt + 1, run_at)
                    .await?;
            }
            tracing::warn!(
                workflow_id = %key.workflow_id,
                transaction_id = %key.transaction_id,
                step_id,
                attempt,
                retry_in = ?interval,
                error = %error,
                "Step failed, retrying"
            );
        } else {
            step.fail(error.clone());
            tracing::error!(
                workflow_id = %key.workflow_id,
                transaction_id = %key.transaction_id,
                step_id,
                attempt,
                error = %error,
                "Step failed"
            );
        }

        outbox.push(
            tx,
            EventKind::StepFailure {
                step: step_id.to_string(),
                error: error.message,
                will_retry,
            },
        );
        Ok(())
    }

    async fn compensate_step(
        &self,
        tx: &mut DistributedTransaction,
        step_id: &str,
        outbox: &mut Outbox,
    ) -> Result<()> {
        let key = self.key(&tx.transaction_id);
        let Some(step) = tx.step_mut(step_id) else {
            return Ok(());
        };
        step.begin_compensate();
        let attempt = step.attempts;
        let timeout = step.definition.timeout_duration();
        self.persist(tx, outbox).await?;

        tracing::debug!(
            workflow_id = %key.workflow_id,
            transaction_id = %key.transaction_id,
            step_id,
            "Compensating step"
        );

        let payload = self.payload(tx, step_id, StepAction::Compensate, attempt);
        let outcome = match self.workflow.handler(step_id) {
            Some(handler) => compensate_with_timeout(handler, payload, timeout).await,
            None => Err(missing_handler(step_id)),
        };

        match outcome {
            Ok(response) => {
                tx.revert_step(step_id, response.clone());
                outbox.push(
                    tx,
                    EventKind::CompensateStepSuccess {
                        step: step_id.to_string(),
                        response,
                    },
                );
            }
            Err(error) => {
                tx.record_error(step_id, StepAction::Compensate, error.clone());
                if let Some(step) = tx.step_mut(step_id) {
                    step.fail(error.clone());
                }
                tracing::error!(
                    workflow_id = %key.workflow_id,
                    transaction_id = %key.transaction_id,
                    step_id,
                    error = %error,
                    "Compensation failed, manual intervention required"
                );
                outbox.push(
                    tx,
                    EventKind::CompensateStepFailure {
                        step: step_id.to_string(),
                        error: error.message,
                    },
                );
            }
        }

        self.persist(tx, outbox).await
    }

    async fn finish(&self, tx: &DistributedTransaction) {
        let key = self.key(&tx.transaction_id);
        if self.workflow.definition().timeout_secs.is_some() {
            if let Err(e) = self.store.clear_transaction_timeout(&key).await {
                tracing::warn!(key = %key, error = %e, "Failed to clear transaction timeout");
            }
        }

        let state = tx.state();
        tracing::info!(
            workflow_id = %key.workflow_id,
            transaction_id = %key.transaction_id,
            state = state.as_str(),
            errors = tx.errors.len(),
            "Transaction finished"
        );
        self.emitter.emit(
            tx,
            EventKind::Finish {
                state,
                result: tx.result(),
                errors: tx.errors.clone(),
            },
        );
    }

    async fn clear_step_timeout(&self, key: &CheckpointKey, step_id: &str, attempt: u32) {
        if let Err(e) = self.store.clear_step_timeout(key, step_id, attempt).await {
            tracing::warn!(key = %key, step_id, error = %e, "Failed to clear step timeout");
        }
    }

    fn payload(
        &self,
        tx: &DistributedTransaction,
        step_id: &str,
        action: StepAction,
        attempt: u32,
    ) -> StepPayload {
        StepPayload {
            metadata: PayloadMetadata {
                workflow_id: tx.workflow_id.clone(),
                transaction_id: tx.transaction_id.clone(),
                step_id: step_id.to_string(),
                action,
                attempt,
                idempotency_key: tx.idempotency_key(step_id, action),
            },
            input: tx.input.clone(),
            context: tx.context.clone(),
        }
    }

    /// Bump the version and save, then announce the held events. Terminal
    /// states are saved with the retention TTL.
    async fn persist(&self, tx: &mut DistributedTransaction, outbox: &mut Outbox) -> Result<()> {
        tx.version += 1;
        tx.updated_at = Utc::now();
        let ttl = tx.is_terminal().then(|| self.retention());

        if let Err(e) = self.store.save(TransactionCheckpoint::from(&*tx), ttl).await {
            tx.version -= 1;
            tracing::error!(
                workflow_id = %tx.workflow_id,
                transaction_id = %tx.transaction_id,
                error = %e,
                "Failed to persist checkpoint"
            );
            outbox.discard();
            return Err(e);
        }
        self.emitter.flush(outbox);
        Ok(())
    }
}

fn missing_handler(step_id: &str) -> StepError {
    StepError::permanent(format!("no handler registered for step '{}'", step_id))
}

fn deadline(after: Duration) -> DateTime<Utc> {
    chrono::Duration::from_std(after)
        .ok()
        .and_then(|after| Utc::now().checked_add_signed(after))
        .unwrap_or(DateTime::<Utc>::MAX_UTC)
}

async fn invoke_with_timeout(
    handler: Arc<dyn StepHandler>,
    payload: StepPayload,
    timeout: Option<Duration>,
) -> std::result::Result<StepOutcome, StepError> {
    let call = handler.invoke(payload);
    match timeout {
        Some(limit) => tokio::time::timeout(limit, call)
            .await
            .unwrap_or_else(|_| Err(StepError::timeout(format!("timed out after {:?}", limit)))),
        None => call.await,
    }
}

async fn compensate_with_timeout(
    handler: Arc<dyn StepHandler>,
    payload: StepPayload,
    timeout: Option<Duration>,
) -> std::result::Result<serde_json::Value, StepError> {
    let call = handler.compensate(payload);
    match timeout {
        Some(limit) => tokio::time::timeout(limit, call).await.unwrap_or_else(|_| {
            Err(StepError::timeout(format!(
                "compensation timed out after {:?}",
                limit
            )))
        }),
        None => call.await,
    }
}
