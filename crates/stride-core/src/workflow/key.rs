use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use super::step::StepAction;
use crate::error::StrideError;

/// Addresses exactly one step action of one transaction.
///
/// String form: `{workflowId}:{transactionId}:{stepId}:{invoke|compensate}`.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct IdempotencyKey {
    pub workflow_id: String,
    pub transaction_id: String,
    pub step_id: String,
    pub action: StepAction,
}

impl IdempotencyKey {
    /// Create a key from its parts.
    pub fn new(
        workflow_id: impl Into<String>,
        transaction_id: impl Into<String>,
        step_id: impl Into<String>,
        action: StepAction,
    ) -> Self {
        Self {
            workflow_id: workflow_id.into(),
            transaction_id: transaction_id.into(),
            step_id: step_id.into(),
            action,
        }
    }

    /// Key of a step's invoke action.
    pub fn invoke(
        workflow_id: impl Into<String>,
        transaction_id: impl Into<String>,
        step_id: impl Into<String>,
    ) -> Self {
        Self::new(workflow_id, transaction_id, step_id, StepAction::Invoke)
    }

    /// Key of a step's compensate action.
    pub fn compensate(
        workflow_id: impl Into<String>,
        transaction_id: impl Into<String>,
        step_id: impl Into<String>,
    ) -> Self {
        Self::new(workflow_id, transaction_id, step_id, StepAction::Compensate)
    }
}

impl fmt::Display for IdempotencyKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{}:{}:{}:{}",
            self.workflow_id,
            self.transaction_id,
            self.step_id,
            self.action.as_str()
        )
    }
}

impl FromStr for IdempotencyKey {
    type Err = StrideError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let parts: Vec<&str> = s.split(':').collect();
        if parts.len() != 4 || parts.iter().any(|p| p.is_empty()) {
            return Err(StrideError::InvalidIdempotencyKey(s.to_string()));
        }

        let action = parts[3]
            .parse::<StepAction>()
            .map_err(|_| StrideError::InvalidIdempotencyKey(s.to_string()))?;

        Ok(Self::new(parts[0], parts[1], parts[2], action))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_key_format() {
        let key = IdempotencyKey::invoke("checkout", "tx-1", "charge");
        assert_eq!(key.to_string(), "checkout:tx-1:charge:invoke");

        let key = IdempotencyKey::compensate("checkout", "tx-1", "charge");
        assert_eq!(key.to_string(), "checkout:tx-1:charge:compensate");
    }

    #[test]
    fn test_key_parse() {
        let key: IdempotencyKey = "checkout:tx-1:charge:invoke".parse().unwrap();
        assert_eq!(key.workflow_id, "checkout");
        assert_eq!(key.transaction_id, "tx-1");
        assert_eq!(key.step_id, "charge");
        assert_eq!(key.action, StepAction::Invoke);
    }

    #[test]
    fn test_key_parse_rejects_malformed() {
        for raw in [
            "",
            "checkout:tx-1:charge",
            "checkout:tx-1:charge:refund",
            "checkout::charge:invoke",
            "a:b:c:d:invoke",
        ] {
            let result = raw.parse::<IdempotencyKey>();
            assert!(
                matches!(result, Err(StrideError::InvalidIdempotencyKey(_))),
                "expected rejection for {raw:?}"
            );
        }
    }
}
