use std::fmt;
use std::sync::Arc;

use futures::future::BoxFuture;
use serde::{Deserialize, Serialize};

use super::key::IdempotencyKey;
use super::step::StepAction;
use super::transaction::TransactionContext;

/// Classification of a step failure.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StepErrorKind {
    /// Retried up to the step's retry budget.
    Transient,
    /// Escalates to failure at once.
    Permanent,
    /// The step or transaction ran out of time.
    Timeout,
}

/// Failure reported by a step handler or raised by the orchestrator on its behalf.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, thiserror::Error)]
#[serde(rename_all = "camelCase")]
#[error("{kind:?}: {message}")]
pub struct StepError {
    pub kind: StepErrorKind,
    pub message: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub details: Option<serde_json::Value>,
}

impl StepError {
    pub fn new(kind: StepErrorKind, message: impl Into<String>) -> Self {
        Self {
            kind,
            message: message.into(),
            details: None,
        }
    }

    /// A failure worth retrying.
    pub fn transient(message: impl Into<String>) -> Self {
        Self::new(StepErrorKind::Transient, message)
    }

    /// A failure that retrying cannot fix.
    pub fn permanent(message: impl Into<String>) -> Self {
        Self::new(StepErrorKind::Permanent, message)
    }

    /// A deadline was missed.
    pub fn timeout(message: impl Into<String>) -> Self {
        Self::new(StepErrorKind::Timeout, message)
    }

    /// Attach structured details.
    pub fn with_details(mut self, details: serde_json::Value) -> Self {
        self.details = Some(details);
        self
    }

    /// Whether the retry policy applies.
    pub fn is_retryable(&self) -> bool {
        self.kind == StepErrorKind::Transient
    }
}

/// Addressing information handed to every handler call.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PayloadMetadata {
    pub workflow_id: String,
    pub transaction_id: String,
    pub step_id: String,
    pub action: StepAction,
    /// Invoke attempt number, starting at 1.
    pub attempt: u32,
    /// Key under which an async step reports back.
    pub idempotency_key: IdempotencyKey,
}

/// Everything a handler sees for one call.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StepPayload {
    pub metadata: PayloadMetadata,
    /// Transaction input.
    pub input: serde_json::Value,
    /// Responses of steps that have completed so far.
    pub context: TransactionContext,
}

impl StepPayload {
    /// Invoke response of another step, if it completed.
    pub fn response_of(&self, step_id: &str) -> Option<&serde_json::Value> {
        self.context.invoke.get(step_id)
    }

    /// Idempotency key of this call.
    pub fn idempotency_key(&self) -> &IdempotencyKey {
        &self.metadata.idempotency_key
    }
}

/// Result of a successful invoke.
#[derive(Debug, Clone, PartialEq)]
pub enum StepOutcome {
    /// The step finished with a response.
    Completed(serde_json::Value),
    /// The step dispatched work and waits for an external callback.
    Pending,
}

/// Business logic behind one step.
pub trait StepHandler: Send + Sync + 'static {
    /// Perform the step.
    fn invoke(&self, payload: StepPayload) -> BoxFuture<'_, Result<StepOutcome, StepError>>;

    /// Undo the step. The default does nothing and succeeds.
    fn compensate(&self, _payload: StepPayload) -> BoxFuture<'_, Result<serde_json::Value, StepError>> {
        Box::pin(async { Ok(serde_json::Value::Null) })
    }
}

type InvokeFn =
    dyn Fn(StepPayload) -> BoxFuture<'static, Result<StepOutcome, StepError>> + Send + Sync;
type CompensateFn =
    dyn Fn(StepPayload) -> BoxFuture<'static, Result<serde_json::Value, StepError>> + Send + Sync;

/// Step handler built from closures.
///
/// ```ignore
/// let charge = FnStep::new(|payload| async move {
///     Ok(StepOutcome::Completed(json!({"charged": payload.input["amount"]})))
/// })
/// .with_compensate(|_| async { Ok(json!("refunded")) });
/// ```
#[derive(Clone)]
pub struct FnStep {
    invoke: Arc<InvokeFn>,
    compensate: Option<Arc<CompensateFn>>,
}

impl FnStep {
    pub fn new<F, Fut>(invoke: F) -> Self
    where
        F: Fn(StepPayload) -> Fut + Send + Sync + 'static,
        Fut: std::future::Future<Output = Result<StepOutcome, StepError>> + Send + 'static,
    {
        Self {
            invoke: Arc::new(move |payload| Box::pin(invoke(payload))),
            compensate: None,
        }
    }

    pub fn with_compensate<F, Fut>(mut self, compensate: F) -> Self
    where
        F: Fn(StepPayload) -> Fut + Send + Sync + 'static,
        Fut: std::future::Future<Output = Result<serde_json::Value, StepError>> + Send + 'static,
    {
        self.compensate = Some(Arc::new(move |payload| Box::pin(compensate(payload))));
        self
    }
}

impl fmt::Debug for FnStep {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("FnStep")
            .field("compensate", &self.compensate.is_some())
            .finish()
    }
}

impl StepHandler for FnStep {
    fn invoke(&self, payload: StepPayload) -> BoxFuture<'_, Result<StepOutcome, StepError>> {
        (self.invoke)(payload)
    }

    fn compensate(&self, payload: StepPayload) -> BoxFuture<'_, Result<serde_json::Value, StepError>> {
        match &self.compensate {
            Some(compensate) => compensate(payload),
            None => Box::pin(async { Ok(serde_json::Value::Null) }),
        }
    }
}
