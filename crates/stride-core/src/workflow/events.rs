use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use super::transaction::{TransactionError, TransactionState};

/// What happened to a transaction.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "eventType", rename_all = "camelCase", rename_all_fields = "camelCase")]
pub enum EventKind {
    /// A new transaction started.
    Begin,
    /// An existing transaction was picked up again.
    Resume,
    StepBegin {
        step: String,
        attempt: u32,
    },
    StepSuccess {
        step: String,
        response: serde_json::Value,
    },
    StepFailure {
        step: String,
        error: String,
        /// Whether another attempt will follow.
        will_retry: bool,
    },
    /// A step parked until its callback arrives.
    StepAwaiting {
        step: String,
    },
    /// The transaction switched to compensation.
    CompensateBegin,
    CompensateStepSuccess {
        step: String,
        response: serde_json::Value,
    },
    CompensateStepFailure {
        step: String,
        error: String,
    },
    /// The transaction reached a terminal state.
    Finish {
        state: TransactionState,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        result: Option<serde_json::Value>,
        #[serde(default)]
        errors: Vec<TransactionError>,
    },
    /// A step or transaction deadline fired.
    Timeout {
        #[serde(default, skip_serializing_if = "Option::is_none")]
        step: Option<String>,
    },
}

impl EventKind {
    /// Wire name of the event.
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Begin => "begin",
            Self::Resume => "resume",
            Self::StepBegin { .. } => "stepBegin",
            Self::StepSuccess { .. } => "stepSuccess",
            Self::StepFailure { .. } => "stepFailure",
            Self::StepAwaiting { .. } => "stepAwaiting",
            Self::CompensateBegin => "compensateBegin",
            Self::CompensateStepSuccess { .. } => "compensateStepSuccess",
            Self::CompensateStepFailure { .. } => "compensateStepFailure",
            Self::Finish { .. } => "finish",
            Self::Timeout { .. } => "timeout",
        }
    }

    /// Step the event refers to, if any.
    pub fn step(&self) -> Option<&str> {
        match self {
            Self::StepBegin { step, .. }
            | Self::StepSuccess { step, .. }
            | Self::StepFailure { step, .. }
            | Self::StepAwaiting { step }
            | Self::CompensateStepSuccess { step, .. }
            | Self::CompensateStepFailure { step, .. } => Some(step),
            Self::Timeout { step } => step.as_deref(),
            Self::Begin | Self::Resume | Self::CompensateBegin | Self::Finish { .. } => None,
        }
    }
}

/// A lifecycle notification for one transaction.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct LifecycleEvent {
    pub workflow_id: String,
    pub transaction_id: String,
    #[serde(flatten)]
    pub kind: EventKind,
    pub emitted_at: DateTime<Utc>,
}

impl LifecycleEvent {
    pub fn new(
        workflow_id: impl Into<String>,
        transaction_id: impl Into<String>,
        kind: EventKind,
    ) -> Self {
        Self {
            workflow_id: workflow_id.into(),
            transaction_id: transaction_id.into(),
            kind,
            emitted_at: Utc::now(),
        }
    }

    /// Wire name of the event.
    pub fn event_type(&self) -> &'static str {
        self.kind.as_str()
    }

    pub fn is_finish(&self) -> bool {
        matches!(self.kind, EventKind::Finish { .. })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_event_wire_shape() {
        let event = LifecycleEvent::new(
            "checkout",
            "tx-1",
            EventKind::StepSuccess {
                step: "charge".into(),
                response: serde_json::json!({"id": 9}),
            },
        );

        let value = serde_json::to_value(&event).unwrap();
        assert_eq!(value["eventType"], "stepSuccess");
        assert_eq!(value["workflowId"], "checkout");
        assert_eq!(value["transactionId"], "tx-1");
        assert_eq!(value["step"], "charge");
        assert_eq!(value["response"]["id"], 9);
        assert!(value.get("emittedAt").is_some());
    }

    #[test]
    fn test_event_round_trip() {
        let event = LifecycleEvent::new(
            "checkout",
            "tx-1",
            EventKind::Finish {
                state: TransactionState::Reverted,
                result: None,
                errors: Vec::new(),
            },
        );

        let json = serde_json::to_string(&event).unwrap();
        let parsed: LifecycleEvent = serde_json::from_str(&json).unwrap();
        assert_eq!(parsed, event);
        assert!(parsed.is_finish());
        assert_eq!(parsed.event_type(), "finish");
    }

    #[test]
    fn test_event_step_accessor() {
        let failure = EventKind::StepFailure {
            step: "charge".into(),
            error: "declined".into(),
            will_retry: false,
        };
        assert_eq!(failure.step(), Some("charge"));
        assert_eq!(EventKind::Timeout { step: None }.step(), None);
        assert_eq!(EventKind::Begin.step(), None);

        let value = serde_json::to_value(&failure).unwrap();
        assert_eq!(value["willRetry"], false);
    }
}
