use std::collections::BTreeMap;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use super::definition::WorkflowDefinition;
use super::handler::StepError;
use super::key::IdempotencyKey;
use super::step::{StepAction, StepState, TransactionStep};
use crate::error::{Result, StrideError};

/// Random transaction id for runs started without one.
pub fn new_transaction_id() -> String {
    Uuid::new_v4().to_string()
}

/// Transaction ids become segments of idempotency keys and job ids.
pub fn validate_transaction_id(id: &str) -> Result<()> {
    if id.is_empty() || id.contains(':') {
        return Err(StrideError::InvalidArgument(format!(
            "transaction id '{}' must be non-empty and free of ':'",
            id
        )));
    }
    Ok(())
}

/// Aggregate state of a transaction, derived from its steps.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TransactionState {
    /// No step has been attempted yet.
    NotStarted,
    /// Steps are running or ready to run.
    Invoking,
    /// Progress waits on a callback or a delayed retry.
    Waiting,
    /// Rolling back.
    Compensating,
    /// Every step completed.
    Done,
    /// Rolled back cleanly.
    Reverted,
    /// A compensation failed; an operator is needed.
    Failed,
}

impl TransactionState {
    /// Convert to string for storage.
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::NotStarted => "not_started",
            Self::Invoking => "invoking",
            Self::Waiting => "waiting",
            Self::Compensating => "compensating",
            Self::Done => "done",
            Self::Reverted => "reverted",
            Self::Failed => "failed",
        }
    }

    /// Check if the transaction can no longer progress.
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Done | Self::Reverted | Self::Failed)
    }
}

impl FromStr for TransactionState {
    type Err = String;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        Ok(match s {
            "not_started" => Self::NotStarted,
            "invoking" => Self::Invoking,
            "waiting" => Self::Waiting,
            "compensating" => Self::Compensating,
            "done" => Self::Done,
            "reverted" => Self::Reverted,
            "failed" => Self::Failed,
            other => return Err(format!("unknown transaction state '{}'", other)),
        })
    }
}

/// Step responses collected so far, keyed by step id.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct TransactionContext {
    #[serde(default)]
    pub invoke: BTreeMap<String, serde_json::Value>,
    #[serde(default)]
    pub compensate: BTreeMap<String, serde_json::Value>,
}

/// One failed attempt, in the order it happened.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TransactionError {
    /// Step id.
    pub action: String,
    /// Which handler failed.
    pub handler_type: StepAction,
    pub error: StepError,
    pub attempt: u32,
    pub occurred_at: DateTime<Utc>,
}

/// All step records of one workflow run.
#[derive(Debug, Clone, PartialEq)]
pub struct DistributedTransaction {
    pub workflow_id: String,
    pub transaction_id: String,
    pub input: serde_json::Value,
    pub context: TransactionContext,
    /// Step records in declaration order.
    pub steps: Vec<TransactionStep>,
    pub errors: Vec<TransactionError>,
    /// Number of times this transaction has been saved.
    pub version: u64,
    /// Last completion sequence number handed out.
    pub completion_counter: u64,
    /// Set once a cancellation has been applied.
    pub cancelled: bool,
    /// Set once the transaction deadline passed.
    pub timed_out: bool,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl DistributedTransaction {
    /// Create a fresh transaction for a definition.
    pub fn new(
        definition: &WorkflowDefinition,
        transaction_id: impl Into<String>,
        input: serde_json::Value,
    ) -> Self {
        let now = Utc::now();
        Self {
            workflow_id: definition.id.clone(),
            transaction_id: transaction_id.into(),
            input,
            context: TransactionContext::default(),
            steps: definition
                .steps
                .iter()
                .cloned()
                .map(TransactionStep::new)
                .collect(),
            errors: Vec::new(),
            version: 0,
            completion_counter: 0,
            cancelled: false,
            timed_out: false,
            created_at: now,
            updated_at: now,
        }
    }

    /// Look up a step record.
    pub fn step(&self, id: &str) -> Option<&TransactionStep> {
        self.steps.iter().find(|s| s.id == id)
    }

    /// Look up a step record mutably.
    pub fn step_mut(&mut self, id: &str) -> Option<&mut TransactionStep> {
        self.steps.iter_mut().find(|s| s.id == id)
    }

    /// Key addressing one action of one step.
    pub fn idempotency_key(&self, step_id: &str, action: StepAction) -> IdempotencyKey {
        IdempotencyKey::new(&self.workflow_id, &self.transaction_id, step_id, action)
    }

    /// Aggregate state.
    pub fn state(&self) -> TransactionState {
        let any = |f: &dyn Fn(&TransactionStep) -> bool| self.steps.iter().any(f);

        if self.is_rolling_back() {
            if any(&|s| {
                s.is_compensating()
                    && matches!(s.state, StepState::NotStarted | StepState::Compensating)
            }) || any(&|s| s.state == StepState::Invoking)
            {
                return TransactionState::Compensating;
            }
            if any(&|s| s.is_compensating() && s.state == StepState::Failed) {
                return TransactionState::Failed;
            }
            return TransactionState::Reverted;
        }

        if self.steps.iter().all(|s| s.state == StepState::Done) {
            return TransactionState::Done;
        }
        if self.steps.iter().all(|s| s.awaits_invoke() && s.attempts == 0) {
            return TransactionState::NotStarted;
        }
        if any(&|s| s.state == StepState::Invoking) {
            return TransactionState::Invoking;
        }
        if !self.ready_steps(Utc::now()).is_empty() {
            return TransactionState::Invoking;
        }
        TransactionState::Waiting
    }

    /// Whether the transaction has switched to its rollback path.
    pub fn is_rolling_back(&self) -> bool {
        self.cancelled
            || self.timed_out
            || self.steps.iter().any(|s| {
                s.is_compensating()
                    || s.state == StepState::Skipped
                    || (s.phase == StepAction::Invoke && s.state == StepState::Failed)
            })
    }

    /// Steps that may be invoked now.
    ///
    /// A step is ready when it awaits invocation, its retry time (if any)
    /// has passed, and all of its dependencies are done.
    pub fn ready_steps(&self, now: DateTime<Utc>) -> Vec<String> {
        if self.is_rolling_back() {
            return Vec::new();
        }

        self.steps
            .iter()
            .filter(|s| s.awaits_invoke())
            .filter(|s| s.next_retry_at.map_or(true, |at| at <= now))
            .filter(|s| {
                s.definition.depends_on.iter().all(|dep| {
                    self.step(dep)
                        .map_or(false, |d| d.phase == StepAction::Invoke && d.state == StepState::Done)
                })
            })
            .map(|s| s.id.clone())
            .collect()
    }

    /// Switch to the rollback path.
    ///
    /// Pending and dormant steps become skipped, done steps are queued for
    /// compensation unless they opted out. Returns the ids of the steps
    /// queued for compensation by this call. Safe to call repeatedly.
    pub fn start_rollback(&mut self) -> Vec<String> {
        let mut queued = Vec::new();
        for step in self.steps.iter_mut() {
            if step.phase != StepAction::Invoke {
                continue;
            }
            match step.state {
                StepState::NotStarted | StepState::Dormant => step.skip(),
                StepState::Done if !step.definition.no_compensation => {
                    step.request_compensation();
                    queued.push(step.id.clone());
                }
                _ => {}
            }
        }
        queued
    }

    /// The next step to compensate: the most recently completed one still waiting.
    ///
    /// Returns `None` while a compensation is in flight.
    pub fn next_compensation(&self) -> Option<String> {
        if self
            .steps
            .iter()
            .any(|s| s.is_compensating() && s.state == StepState::Compensating)
        {
            return None;
        }

        self.steps
            .iter()
            .filter(|s| s.awaits_compensation())
            .max_by_key(|s| s.completion_seq.unwrap_or(0))
            .map(|s| s.id.clone())
    }

    /// Reset steps left mid-flight by an interrupted pass so they run again.
    pub fn recover_interrupted(&mut self) -> Vec<String> {
        let mut recovered = Vec::new();
        for step in self.steps.iter_mut() {
            match (step.phase, step.state) {
                (StepAction::Invoke, StepState::Invoking) => {
                    step.state = StepState::NotStarted;
                    recovered.push(step.id.clone());
                }
                (StepAction::Compensate, StepState::Compensating) => {
                    step.state = StepState::NotStarted;
                    recovered.push(step.id.clone());
                }
                _ => {}
            }
        }
        recovered
    }

    /// Record a successful invoke.
    pub fn complete_step(&mut self, step_id: &str, response: serde_json::Value) -> bool {
        let seq = self.completion_counter + 1;
        match self.step_mut(step_id) {
            Some(step) => {
                step.succeed(response.clone(), seq);
                self.completion_counter = seq;
                self.context.invoke.insert(step_id.to_string(), response);
                true
            }
            None => false,
        }
    }

    /// Record a successful compensation.
    pub fn revert_step(&mut self, step_id: &str, response: serde_json::Value) -> bool {
        match self.step_mut(step_id) {
            Some(step) => {
                step.revert(response.clone());
                self.context.compensate.insert(step_id.to_string(), response);
                true
            }
            None => false,
        }
    }

    /// Append a failed attempt to the error list.
    pub fn record_error(&mut self, step_id: &str, handler_type: StepAction, error: StepError) {
        let attempt = self.step(step_id).map(|s| s.attempts).unwrap_or(0);
        self.errors.push(TransactionError {
            action: step_id.to_string(),
            handler_type,
            error,
            attempt,
            occurred_at: Utc::now(),
        });
    }

    /// Final result: the invoke responses once every step is done.
    pub fn result(&self) -> Option<serde_json::Value> {
        if self.state() != TransactionState::Done {
            return None;
        }
        serde_json::to_value(&self.context.invoke).ok()
    }

    /// Whether the transaction can no longer progress.
    pub fn is_terminal(&self) -> bool {
        self.state().is_terminal()
    }
}
