//! Caller-facing orchestration service.
//!
//! The service owns the workflow registry, the store and the bus. It
//! serializes work on each transaction within the process, fans lifecycle
//! events out to local subscribers and to the bus, and re-delivers events
//! broadcast by other instances to its own subscribers.

use std::collections::{HashMap, HashSet};
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Weak};

use futures_util::future::BoxFuture;
use serde::Serialize;
use tokio::sync::broadcast::error::RecvError;
use tokio::sync::{broadcast, mpsc, Mutex};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use stride_core::bus::{BusMessage, EventBus};
use stride_core::config::{BusConfig, OrchestratorConfig};
use stride_core::error::{Result, StrideError};
use stride_core::store::{JobType, ScheduledJob, TransactionStore};
use stride_core::workflow::{
    new_transaction_id, validate_transaction_id, CheckpointKey, DistributedTransaction,
    IdempotencyKey, LifecycleEvent, StepError, TransactionState, Workflow,
};

use crate::orchestrator::{
    ActivePasses, CallbackOutcome, EventEmitter, JobDispatcher, TransactionOrchestrator,
    WorkflowRegistry,
};

/// Workflow to run: a registered id or an ad hoc definition.
#[derive(Clone)]
pub enum WorkflowRef {
    Registered(String),
    Inline(Arc<Workflow>),
}

impl From<&str> for WorkflowRef {
    fn from(id: &str) -> Self {
        Self::Registered(id.to_string())
    }
}

impl From<String> for WorkflowRef {
    fn from(id: String) -> Self {
        Self::Registered(id)
    }
}

impl From<Workflow> for WorkflowRef {
    fn from(workflow: Workflow) -> Self {
        Self::Inline(Arc::new(workflow))
    }
}

impl From<Arc<Workflow>> for WorkflowRef {
    fn from(workflow: Arc<Workflow>) -> Self {
        Self::Inline(workflow)
    }
}

/// Options of [`OrchestratorService::run`].
#[derive(Debug, Clone, Default)]
pub struct RunOptions {
    pub input: serde_json::Value,
    /// Existing transaction to resume, or the id of the new one. Random when absent.
    pub transaction_id: Option<String>,
    /// Return [`StrideError::TransactionFailed`] when the run ends failed or reverted.
    pub throw_on_error: bool,
}

impl RunOptions {
    pub fn new(input: serde_json::Value) -> Self {
        Self {
            input,
            ..Default::default()
        }
    }

    pub fn transaction_id(mut self, id: impl Into<String>) -> Self {
        self.transaction_id = Some(id.into());
        self
    }

    pub fn throw_on_error(mut self) -> Self {
        self.throw_on_error = true;
        self
    }
}

/// Options of the step callbacks.
#[derive(Debug, Clone, Copy, Default)]
pub struct CallbackOptions {
    pub throw_on_error: bool,
}

/// Summary of where a transaction stands.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Acknowledgement {
    pub workflow_id: String,
    pub transaction_id: String,
    pub state: TransactionState,
    pub has_finished: bool,
    pub has_failed: bool,
}

impl Acknowledgement {
    pub fn of(tx: &DistributedTransaction) -> Self {
        let state = tx.state();
        Self {
            workflow_id: tx.workflow_id.clone(),
            transaction_id: tx.transaction_id.clone(),
            state,
            has_finished: state.is_terminal(),
            has_failed: matches!(state, TransactionState::Failed | TransactionState::Reverted),
        }
    }
}

/// Result of a run once its synchronous part settled.
#[derive(Debug, Clone)]
pub struct RunResult {
    pub acknowledgement: Acknowledgement,
    pub transaction: DistributedTransaction,
}

impl RunResult {
    fn new(transaction: DistributedTransaction) -> Self {
        Self {
            acknowledgement: Acknowledgement::of(&transaction),
            transaction,
        }
    }
}

/// Handle of a lifecycle subscription.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct SubscriberId(u64);

type EventHandler = Arc<dyn Fn(&LifecycleEvent) + Send + Sync>;

struct Subscriber {
    workflow_id: String,
    transaction_id: Option<String>,
    handler: EventHandler,
}

impl Subscriber {
    fn matches(&self, event: &LifecycleEvent) -> bool {
        self.workflow_id == event.workflow_id
            && self
                .transaction_id
                .as_ref()
                .map_or(true, |id| *id == event.transaction_id)
    }
}

struct Inner {
    instance_id: String,
    registry: Arc<WorkflowRegistry>,
    inline: std::sync::RwLock<HashMap<String, Arc<Workflow>>>,
    store: Arc<dyn TransactionStore>,
    bus: Arc<dyn EventBus>,
    orchestrator_config: OrchestratorConfig,
    bus_config: BusConfig,
    passes: ActivePasses,
    locks: Mutex<HashMap<CheckpointKey, Arc<Mutex<()>>>>,
    subscribers: std::sync::RwLock<HashMap<SubscriberId, Subscriber>>,
    next_subscriber: AtomicU64,
    topics: Mutex<HashSet<String>>,
    emitter: EventEmitter,
    events: std::sync::Mutex<Option<mpsc::UnboundedReceiver<LifecycleEvent>>>,
    shutdown: CancellationToken,
    tasks: std::sync::Mutex<Vec<JoinHandle<()>>>,
}

impl Inner {
    /// Hand an event to every matching local subscriber.
    fn deliver(&self, event: &LifecycleEvent) {
        let handlers: Vec<EventHandler> = self
            .subscribers
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .values()
            .filter(|s| s.matches(event))
            .map(|s| s.handler.clone())
            .collect();

        for handler in handlers {
            handler(event);
        }
    }

    fn track(&self, task: JoinHandle<()>) {
        self.tasks
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .push(task);
    }
}

/// Builder for [`OrchestratorService`].
pub struct ServiceBuilder {
    store: Arc<dyn TransactionStore>,
    bus: Arc<dyn EventBus>,
    registry: Arc<WorkflowRegistry>,
    instance_id: Option<String>,
    orchestrator_config: OrchestratorConfig,
    bus_config: BusConfig,
}

impl ServiceBuilder {
    pub fn registry(mut self, registry: Arc<WorkflowRegistry>) -> Self {
        self.registry = registry;
        self
    }

    /// Name of this instance on the bus. Random when unset.
    pub fn instance_id(mut self, id: impl Into<String>) -> Self {
        self.instance_id = Some(id.into());
        self
    }

    pub fn orchestrator_config(mut self, config: OrchestratorConfig) -> Self {
        self.orchestrator_config = config;
        self
    }

    pub fn bus_config(mut self, config: BusConfig) -> Self {
        self.bus_config = config;
        self
    }

    pub fn build(self) -> OrchestratorService {
        let (emitter, events) = EventEmitter::channel();
        let instance_id = self
            .instance_id
            .unwrap_or_else(|| format!("stride-{}", new_transaction_id()));

        OrchestratorService {
            inner: Arc::new(Inner {
                instance_id,
                registry: self.registry,
                inline: std::sync::RwLock::new(HashMap::new()),
                store: self.store,
                bus: self.bus,
                orchestrator_config: self.orchestrator_config,
                bus_config: self.bus_config,
                passes: ActivePasses::new(),
                locks: Mutex::new(HashMap::new()),
                subscribers: std::sync::RwLock::new(HashMap::new()),
                next_subscriber: AtomicU64::new(1),
                topics: Mutex::new(HashSet::new()),
                emitter,
                events: std::sync::Mutex::new(Some(events)),
                shutdown: CancellationToken::new(),
                tasks: std::sync::Mutex::new(Vec::new()),
            }),
        }
    }
}

/// Runs workflows and coordinates with other instances through the store and bus.
///
/// Cheap to clone; clones share all state.
#[derive(Clone)]
pub struct OrchestratorService {
    inner: Arc<Inner>,
}

impl fmt::Debug for OrchestratorService {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("OrchestratorService")
            .field("instance_id", &self.inner.instance_id)
            .field("workflows", &self.inner.registry.list())
            .finish()
    }
}

impl OrchestratorService {
    pub fn builder(store: Arc<dyn TransactionStore>, bus: Arc<dyn EventBus>) -> ServiceBuilder {
        ServiceBuilder {
            store,
            bus,
            registry: Arc::new(WorkflowRegistry::new()),
            instance_id: None,
            orchestrator_config: OrchestratorConfig::default(),
            bus_config: BusConfig::default(),
        }
    }

    pub fn instance_id(&self) -> &str {
        &self.inner.instance_id
    }

    pub fn registry(&self) -> &Arc<WorkflowRegistry> {
        &self.inner.registry
    }

    pub fn store(&self) -> &Arc<dyn TransactionStore> {
        &self.inner.store
    }

    /// Start the event fan-out. Called implicitly by every operation; safe to repeat.
    pub fn start(&self) {
        let receiver = self
            .inner
            .events
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .take();

        if let Some(receiver) = receiver {
            tracing::debug!(instance_id = %self.inner.instance_id, "Starting event fan-out");
            let task = tokio::spawn(fan_out(
                Arc::downgrade(&self.inner),
                receiver,
                self.inner.shutdown.clone(),
            ));
            self.inner.track(task);
        }
    }

    /// Start or resume a transaction and run it until nothing can progress.
    pub async fn run(
        &self,
        workflow: impl Into<WorkflowRef>,
        options: RunOptions,
    ) -> Result<RunResult> {
        self.start();

        let workflow = match workflow.into() {
            WorkflowRef::Registered(id) => self.resolve(&id)?,
            WorkflowRef::Inline(workflow) => {
                self.inner
                    .inline
                    .write()
                    .unwrap_or_else(|e| e.into_inner())
                    .insert(workflow.id().to_string(), workflow.clone());
                workflow
            }
        };

        let transaction_id = match options.transaction_id {
            Some(id) => {
                validate_transaction_id(&id)?;
                id
            }
            None => new_transaction_id(),
        };

        let orchestrator = self.orchestrator(workflow);
        let key = CheckpointKey::new(orchestrator.workflow().id(), &transaction_id);
        let lock = self.transaction_lock(&key).await;
        let _guard = lock.lock().await;

        let tx = match orchestrator
            .retrieve_existing_transaction(&transaction_id)
            .await?
        {
            Some(tx) => orchestrator.resume(tx).await?,
            None => {
                orchestrator
                    .begin_transaction(&transaction_id, options.input)
                    .await?
            }
        };

        if options.throw_on_error {
            ensure_succeeded(&tx)?;
        }
        Ok(RunResult::new(tx))
    }

    /// Latest persisted state of a transaction.
    pub async fn get_running_transaction(
        &self,
        workflow_id: &str,
        transaction_id: &str,
    ) -> Result<Option<DistributedTransaction>> {
        let workflow = self.resolve(workflow_id)?;
        self.orchestrator(workflow)
            .retrieve_existing_transaction(transaction_id)
            .await
    }

    /// Report the success of an async step identified by its idempotency key.
    pub async fn set_step_success(
        &self,
        key: &str,
        response: serde_json::Value,
        options: CallbackOptions,
    ) -> Result<CallbackOutcome> {
        let key: IdempotencyKey = key.parse()?;
        let orchestrator = self.callback_target(&key)?;
        let lock = self.transaction_lock(&checkpoint_key(&key)).await;
        let _guard = lock.lock().await;

        let outcome = orchestrator.register_step_success(&key, response).await?;
        if options.throw_on_error {
            ensure_succeeded(&outcome.transaction)?;
        }
        Ok(outcome)
    }

    /// Report the failure of an async step identified by its idempotency key.
    pub async fn set_step_failure(
        &self,
        key: &str,
        error: StepError,
        options: CallbackOptions,
    ) -> Result<CallbackOutcome> {
        let key: IdempotencyKey = key.parse()?;
        let orchestrator = self.callback_target(&key)?;
        let lock = self.transaction_lock(&checkpoint_key(&key)).await;
        let _guard = lock.lock().await;

        let outcome = orchestrator.register_step_failure(&key, error).await?;
        if options.throw_on_error {
            ensure_succeeded(&outcome.transaction)?;
        }
        Ok(outcome)
    }

    /// Roll a transaction back.
    ///
    /// A pass running in this process is asked to stop at its next wave
    /// boundary and performs the rollback itself; otherwise the rollback
    /// runs here.
    pub async fn cancel(
        &self,
        workflow_id: &str,
        transaction_id: &str,
    ) -> Result<DistributedTransaction> {
        self.start();
        let orchestrator = self.orchestrator(self.resolve(workflow_id)?);

        if orchestrator.request_cancel(transaction_id).await {
            tracing::debug!(workflow_id, transaction_id, "Cancellation requested from running pass");
        }

        let lock = self
            .transaction_lock(&CheckpointKey::new(workflow_id, transaction_id))
            .await;
        let _guard = lock.lock().await;

        let tx = orchestrator
            .retrieve_existing_transaction(transaction_id)
            .await?
            .ok_or_else(|| {
                StrideError::NotFound(format!(
                    "Transaction '{}' of workflow '{}'",
                    transaction_id, workflow_id
                ))
            })?;
        orchestrator.cancel_transaction(tx).await
    }

    /// Receive lifecycle events of a workflow, optionally of one transaction only.
    ///
    /// Events of transactions run by other instances arrive through the bus.
    pub async fn subscribe<F>(
        &self,
        workflow_id: &str,
        transaction_id: Option<&str>,
        handler: F,
    ) -> Result<SubscriberId>
    where
        F: Fn(&LifecycleEvent) + Send + Sync + 'static,
    {
        self.start();
        self.ensure_topic(workflow_id).await?;

        let id = SubscriberId(self.inner.next_subscriber.fetch_add(1, Ordering::Relaxed));
        self.inner
            .subscribers
            .write()
            .unwrap_or_else(|e| e.into_inner())
            .insert(
                id,
                Subscriber {
                    workflow_id: workflow_id.to_string(),
                    transaction_id: transaction_id.map(str::to_string),
                    handler: Arc::new(handler),
                },
            );
        Ok(id)
    }

    /// Remove a subscription. Returns whether it existed.
    pub fn unsubscribe(&self, id: SubscriberId) -> bool {
        self.inner
            .subscribers
            .write()
            .unwrap_or_else(|e| e.into_inner())
            .remove(&id)
            .is_some()
    }

    /// Run a due delayed job.
    pub async fn handle_job(&self, job: ScheduledJob) -> Result<()> {
        self.start();

        let Ok(workflow) = self.resolve(&job.workflow_id) else {
            tracing::warn!(
                job_id = %job.id,
                workflow_id = %job.workflow_id,
                "Dropping job of unknown workflow"
            );
            return Ok(());
        };

        let orchestrator = self.orchestrator(workflow);
        let lock = self.transaction_lock(&job.key()).await;
        let _guard = lock.lock().await;

        tracing::debug!(job_id = %job.id, job_type = %job.job_type, "Running job");

        let step_id = job.step_id.as_deref().unwrap_or_default();
        match job.job_type {
            JobType::Retry => {
                orchestrator
                    .handle_retry(&job.transaction_id, step_id, job.attempt)
                    .await?;
            }
            JobType::StepTimeout => {
                orchestrator
                    .handle_step_timeout(&job.transaction_id, step_id, job.attempt)
                    .await?;
            }
            JobType::TransactionTimeout => {
                orchestrator
                    .handle_transaction_timeout(&job.transaction_id)
                    .await?;
            }
        }
        Ok(())
    }

    /// Stop background tasks and wait for them.
    pub async fn shutdown(&self) {
        self.inner.shutdown.cancel();
        let tasks: Vec<JoinHandle<()>> = self
            .inner
            .tasks
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .drain(..)
            .collect();

        for task in tasks {
            let _ = task.await;
        }
        tracing::info!(instance_id = %self.inner.instance_id, "Orchestrator service stopped");
    }

    fn resolve(&self, workflow_id: &str) -> Result<Arc<Workflow>> {
        self.inner
            .registry
            .get(workflow_id)
            .or_else(|| {
                self.inner
                    .inline
                    .read()
                    .unwrap_or_else(|e| e.into_inner())
                    .get(workflow_id)
                    .cloned()
            })
            .ok_or_else(|| StrideError::WorkflowNotFound(workflow_id.to_string()))
    }

    fn callback_target(&self, key: &IdempotencyKey) -> Result<TransactionOrchestrator> {
        self.start();
        Ok(self.orchestrator(self.resolve(&key.workflow_id)?))
    }

    fn orchestrator(&self, workflow: Arc<Workflow>) -> TransactionOrchestrator {
        TransactionOrchestrator::new(
            workflow,
            self.inner.store.clone(),
            self.inner.emitter.clone(),
            self.inner.passes.clone(),
            self.inner.orchestrator_config.clone(),
        )
    }

    /// Lock serializing passes over one transaction in this process.
    async fn transaction_lock(&self, key: &CheckpointKey) -> Arc<Mutex<()>> {
        let mut locks = self.inner.locks.lock().await;
        locks.retain(|_, lock| Arc::strong_count(lock) > 1);
        locks.entry(key.clone()).or_default().clone()
    }

    async fn ensure_topic(&self, workflow_id: &str) -> Result<()> {
        let topic = self.inner.bus_config.topic(workflow_id);
        let mut topics = self.inner.topics.lock().await;
        if topics.contains(&topic) {
            return Ok(());
        }

        let receiver = self.inner.bus.subscribe(topic.clone()).await?;
        tracing::debug!(topic = %topic, "Subscribed to lifecycle broadcasts");

        let task = tokio::spawn(relay(
            Arc::downgrade(&self.inner),
            receiver,
            self.inner.shutdown.clone(),
        ));
        self.inner.track(task);
        topics.insert(topic);
        Ok(())
    }
}

impl JobDispatcher for OrchestratorService {
    fn dispatch(&self, job: ScheduledJob) -> BoxFuture<'_, Result<()>> {
        Box::pin(self.handle_job(job))
    }
}

fn checkpoint_key(key: &IdempotencyKey) -> CheckpointKey {
    CheckpointKey::new(&key.workflow_id, &key.transaction_id)
}

fn ensure_succeeded(tx: &DistributedTransaction) -> Result<()> {
    let state = tx.state();
    if !matches!(state, TransactionState::Failed | TransactionState::Reverted) {
        return Ok(());
    }

    let message = match tx.errors.last() {
        Some(error) => format!("step '{}' failed: {}", error.action, error.error.message),
        None if tx.timed_out => "transaction timed out".to_string(),
        None => "transaction was cancelled".to_string(),
    };
    Err(StrideError::TransactionFailed {
        workflow_id: tx.workflow_id.clone(),
        transaction_id: tx.transaction_id.clone(),
        state: state.as_str().to_string(),
        message,
    })
}

/// Deliver locally emitted events, then broadcast them to other instances.
async fn fan_out(
    inner: Weak<Inner>,
    mut events: mpsc::UnboundedReceiver<LifecycleEvent>,
    shutdown: CancellationToken,
) {
    loop {
        let event = tokio::select! {
            biased;
            event = events.recv() => match event {
                Some(event) => event,
                None => break,
            },
            _ = shutdown.cancelled() => break,
        };

        let Some(inner) = inner.upgrade() else {
            break;
        };

        inner.deliver(&event);

        let topic = inner.bus_config.topic(&event.workflow_id);
        let message = BusMessage::new(&inner.instance_id, event);
        if let Err(e) = inner.bus.publish(topic, message).await {
            tracing::warn!(error = %e, "Failed to broadcast lifecycle event");
        }
    }
    tracing::debug!("Event fan-out stopped");
}

/// Re-deliver broadcasts of other instances to local subscribers.
async fn relay(
    inner: Weak<Inner>,
    mut receiver: broadcast::Receiver<BusMessage>,
    shutdown: CancellationToken,
) {
    loop {
        let message = tokio::select! {
            biased;
            _ = shutdown.cancelled() => break,
            message = receiver.recv() => message,
        };

        match message {
            Ok(message) => {
                let Some(inner) = inner.upgrade() else {
                    break;
                };
                if message.origin != inner.instance_id {
                    inner.deliver(&message.event);
                }
            }
            Err(RecvError::Lagged(skipped)) => {
                tracing::warn!(skipped, "Lifecycle broadcasts dropped, subscriber lagging");
            }
            Err(RecvError::Closed) => break,
        }
    }
}
