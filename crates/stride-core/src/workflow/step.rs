use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use super::definition::StepDefinition;
use super::handler::StepError;

/// Which of a step's two actions a record or key refers to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum StepAction {
    Invoke,
    Compensate,
}

impl StepAction {
    /// Convert to string for keys and storage.
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Invoke => "invoke",
            Self::Compensate => "compensate",
        }
    }
}

impl FromStr for StepAction {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "invoke" => Ok(Self::Invoke),
            "compensate" => Ok(Self::Compensate),
            other => Err(format!("unknown step action '{}'", other)),
        }
    }
}

/// Execution state of one step.
///
/// The same state set is used for both phases: a step in the compensate
/// phase that is `NotStarted` is waiting to be compensated, and `Failed`
/// means its compensation failed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StepState {
    NotStarted,
    Invoking,
    Dormant,
    Done,
    Failed,
    Compensating,
    Reverted,
    Skipped,
}

impl StepState {
    /// Convert to string for storage.
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::NotStarted => "not_started",
            Self::Invoking => "invoking",
            Self::Dormant => "dormant",
            Self::Done => "done",
            Self::Failed => "failed",
            Self::Compensating => "compensating",
            Self::Reverted => "reverted",
            Self::Skipped => "skipped",
        }
    }
}

impl FromStr for StepState {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Ok(match s {
            "not_started" => Self::NotStarted,
            "invoking" => Self::Invoking,
            "dormant" => Self::Dormant,
            "done" => Self::Done,
            "failed" => Self::Failed,
            "compensating" => Self::Compensating,
            "reverted" => Self::Reverted,
            "skipped" => Self::Skipped,
            other => return Err(format!("unknown step state '{}'", other)),
        })
    }
}

/// Mutable execution record of one step within one transaction.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TransactionStep {
    /// Step id.
    pub id: String,
    /// Snapshot of the definition the step was created from.
    pub definition: StepDefinition,
    /// Current state.
    pub state: StepState,
    /// Phase the state refers to.
    pub phase: StepAction,
    /// Invoke attempts made so far.
    pub attempts: u32,
    /// Last error seen by either action.
    pub last_error: Option<StepError>,
    /// Response of the successful invoke.
    pub invoke_response: Option<serde_json::Value>,
    /// Response of the successful compensation.
    pub compensate_response: Option<serde_json::Value>,
    /// Position in the transaction's completion order.
    pub completion_seq: Option<u64>,
    /// Set while a delayed retry is pending.
    pub next_retry_at: Option<DateTime<Utc>>,
    pub started_at: Option<DateTime<Utc>>,
    pub completed_at: Option<DateTime<Utc>>,
    pub compensated_at: Option<DateTime<Utc>>,
}

impl TransactionStep {
    /// Create a fresh record.
    pub fn new(definition: StepDefinition) -> Self {
        Self {
            id: definition.id.clone(),
            definition,
            state: StepState::NotStarted,
            phase: StepAction::Invoke,
            attempts: 0,
            last_error: None,
            invoke_response: None,
            compensate_response: None,
            completion_seq: None,
            next_retry_at: None,
            started_at: None,
            completed_at: None,
            compensated_at: None,
        }
    }

    /// Whether the step is in the compensate phase.
    pub fn is_compensating(&self) -> bool {
        self.phase == StepAction::Compensate
    }

    /// Whether the step waits for its first or next invoke attempt.
    pub fn awaits_invoke(&self) -> bool {
        self.phase == StepAction::Invoke && self.state == StepState::NotStarted
    }

    /// Whether a delayed retry is pending.
    pub fn awaits_retry(&self) -> bool {
        self.awaits_invoke() && self.next_retry_at.is_some()
    }

    /// Whether the step waits to be compensated.
    pub fn awaits_compensation(&self) -> bool {
        self.phase == StepAction::Compensate && self.state == StepState::NotStarted
    }

    /// Whether a failed attempt may still be retried.
    pub fn can_retry(&self) -> bool {
        self.attempts <= self.definition.max_retries
    }

    /// Start an invoke attempt.
    pub fn begin_invoke(&mut self) {
        self.state = StepState::Invoking;
        self.attempts += 1;
        self.next_retry_at = None;
        self.started_at = Some(Utc::now());
    }

    /// Park the step until an external callback.
    pub fn park(&mut self, response: Option<serde_json::Value>) {
        self.state = StepState::Dormant;
        if response.is_some() {
            self.invoke_response = response;
        }
    }

    /// Record a successful invoke.
    pub fn succeed(&mut self, response: serde_json::Value, seq: u64) {
        self.state = StepState::Done;
        self.invoke_response = Some(response);
        self.completion_seq = Some(seq);
        self.completed_at = Some(Utc::now());
    }

    /// Return the step to `NotStarted` for another attempt.
    pub fn schedule_retry(&mut self, error: StepError, at: Option<DateTime<Utc>>) {
        self.state = StepState::NotStarted;
        self.last_error = Some(error);
        self.next_retry_at = at;
    }

    /// Record a failure of the current phase.
    pub fn fail(&mut self, error: StepError) {
        self.state = StepState::Failed;
        self.last_error = Some(error);
        self.completed_at = Some(Utc::now());
    }

    /// Mark the step as never going to run.
    pub fn skip(&mut self) {
        self.state = StepState::Skipped;
        self.next_retry_at = None;
    }

    /// Queue the step for compensation.
    pub fn request_compensation(&mut self) {
        self.phase = StepAction::Compensate;
        self.state = StepState::NotStarted;
    }

    /// Start compensating.
    pub fn begin_compensate(&mut self) {
        self.state = StepState::Compensating;
    }

    /// Record a successful compensation.
    pub fn revert(&mut self, response: serde_json::Value) {
        self.state = StepState::Reverted;
        self.compensate_response = Some(response);
        self.compensated_at = Some(Utc::now());
    }
}
