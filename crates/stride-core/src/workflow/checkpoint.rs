use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use super::step::TransactionStep;
use super::transaction::{
    DistributedTransaction, TransactionContext, TransactionError, TransactionState,
};

/// Storage key of a checkpoint.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CheckpointKey {
    pub workflow_id: String,
    pub transaction_id: String,
}

impl CheckpointKey {
    pub fn new(workflow_id: impl Into<String>, transaction_id: impl Into<String>) -> Self {
        Self {
            workflow_id: workflow_id.into(),
            transaction_id: transaction_id.into(),
        }
    }
}

impl fmt::Display for CheckpointKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.workflow_id, self.transaction_id)
    }
}

/// Execution flow part of a checkpoint.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TransactionFlow {
    pub model_id: String,
    pub transaction_id: String,
    pub state: TransactionState,
    pub steps: Vec<TransactionStep>,
    pub version: u64,
    #[serde(default)]
    pub completion_counter: u64,
    #[serde(default)]
    pub cancelled: bool,
    #[serde(default)]
    pub timed_out: bool,
    #[serde(default)]
    pub input: serde_json::Value,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

/// Serialized snapshot of a transaction, the source of truth shared by all instances.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TransactionCheckpoint {
    pub flow: TransactionFlow,
    #[serde(default)]
    pub context: TransactionContext,
    #[serde(default)]
    pub errors: Vec<TransactionError>,
}

impl TransactionCheckpoint {
    /// Key this checkpoint is stored under.
    pub fn key(&self) -> CheckpointKey {
        CheckpointKey::new(&self.flow.model_id, &self.flow.transaction_id)
    }

    /// State recorded at save time.
    pub fn state(&self) -> TransactionState {
        self.flow.state
    }

    pub fn version(&self) -> u64 {
        self.flow.version
    }
}

impl From<&DistributedTransaction> for TransactionCheckpoint {
    fn from(tx: &DistributedTransaction) -> Self {
        Self {
            flow: TransactionFlow {
                model_id: tx.workflow_id.clone(),
                transaction_id: tx.transaction_id.clone(),
                state: tx.state(),
                steps: tx.steps.clone(),
                version: tx.version,
                completion_counter: tx.completion_counter,
                cancelled: tx.cancelled,
                timed_out: tx.timed_out,
                input: tx.input.clone(),
                created_at: tx.created_at,
                updated_at: tx.updated_at,
            },
            context: tx.context.clone(),
            errors: tx.errors.clone(),
        }
    }
}

impl From<TransactionCheckpoint> for DistributedTransaction {
    fn from(checkpoint: TransactionCheckpoint) -> Self {
        let flow = checkpoint.flow;
        Self {
            workflow_id: flow.model_id,
            transaction_id: flow.transaction_id,
            input: flow.input,
            context: checkpoint.context,
            steps: flow.steps,
            errors: checkpoint.errors,
            version: flow.version,
            completion_counter: flow.completion_counter,
            cancelled: flow.cancelled,
            timed_out: flow.timed_out,
            created_at: flow.created_at,
            updated_at: flow.updated_at,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::workflow::definition::{StepDefinition, WorkflowDefinition};
    use crate::workflow::handler::StepError;
    use crate::workflow::step::StepAction;

    fn transaction() -> DistributedTransaction {
        let mut def = WorkflowDefinition::new("checkout");
        def.steps = vec![
            StepDefinition::new("reserve"),
            StepDefinition::new("charge").depends_on(["reserve"]).asynchronous(),
            StepDefinition::new("ship").depends_on(["charge"]),
        ];
        DistributedTransaction::new(&def, "tx-1", serde_json::json!({"order": 7}))
    }

    #[test]
    fn test_checkpoint_key() {
        let key = CheckpointKey::new("checkout", "tx-1");
        assert_eq!(key.to_string(), "checkout:tx-1");
    }

    #[test]
    fn test_checkpoint_round_trip_keeps_decisions() {
        let mut tx = transaction();
        tx.step_mut("reserve").unwrap().begin_invoke();
        tx.complete_step("reserve", serde_json::json!({"sku": "A"}));
        let charge = tx.step_mut("charge").unwrap();
        charge.begin_invoke();
        charge.park(None);
        tx.record_error("charge", StepAction::Invoke, StepError::transient("slow"));
        tx.version = 3;

        let checkpoint = TransactionCheckpoint::from(&tx);
        let json = serde_json::to_string(&checkpoint).unwrap();
        let restored: DistributedTransaction =
            serde_json::from_str::<TransactionCheckpoint>(&json).unwrap().into();

        assert_eq!(restored, tx);
        assert_eq!(restored.state(), tx.state());
        assert_eq!(restored.ready_steps(Utc::now()), tx.ready_steps(Utc::now()));
        assert_eq!(restored.next_compensation(), tx.next_compensation());
    }

    #[test]
    fn test_checkpoint_wire_shape() {
        let checkpoint = TransactionCheckpoint::from(&transaction());
        let value = serde_json::to_value(&checkpoint).unwrap();

        assert_eq!(value["flow"]["modelId"], "checkout");
        assert_eq!(value["flow"]["transactionId"], "tx-1");
        assert_eq!(value["flow"]["state"], "not_started");
        assert_eq!(value["flow"]["steps"][1]["definition"]["async"], true);
        assert!(value["context"]["invoke"].as_object().unwrap().is_empty());
        assert!(value["errors"].as_array().unwrap().is_empty());
        assert_eq!(checkpoint.key(), CheckpointKey::new("checkout", "tx-1"));
    }
}
