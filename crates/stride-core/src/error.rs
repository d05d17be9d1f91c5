use thiserror::Error;

/// Core error type for Stride operations.
///
/// Step handlers never produce this type; their failures are recorded as
/// [`crate::workflow::StepError`] values on the transaction.
#[derive(Error, Debug)]
pub enum StrideError {
    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Database error: {0}")]
    Database(String),

    #[error("Serialization error: {0}")]
    Serialization(String),

    #[error("Deserialization error: {0}")]
    Deserialization(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("SQL error: {0}")]
    Sql(#[from] sqlx::Error),

    #[error("Invalid argument: {0}")]
    InvalidArgument(String),

    #[error("Not found: {0}")]
    NotFound(String),

    #[error("Validation error: {0}")]
    Validation(String),

    #[error("Timeout: {0}")]
    Timeout(String),

    #[error("Internal error: {0}")]
    Internal(String),

    #[error("Invalid state: {0}")]
    InvalidState(String),

    #[error("Workflow '{0}' is not registered")]
    WorkflowNotFound(String),

    #[error("Workflow '{workflow_id}' has no handler for step '{step_id}'")]
    HandlerMissing { workflow_id: String, step_id: String },

    #[error("Invalid step graph: {0}")]
    InvalidGraph(String),

    #[error("Invalid idempotency key: {0}")]
    InvalidIdempotencyKey(String),

    #[error("Checkpoint conflict for {key}: expected version {expected}, found {found}")]
    Conflict {
        key: String,
        expected: u64,
        found: u64,
    },

    #[error("Transaction {transaction_id} of '{workflow_id}' ended {state}: {message}")]
    TransactionFailed {
        workflow_id: String,
        transaction_id: String,
        state: String,
        message: String,
    },

    #[error("Event bus error: {0}")]
    Bus(String),
}

impl From<serde_json::Error> for StrideError {
    fn from(e: serde_json::Error) -> Self {
        StrideError::Serialization(e.to_string())
    }
}

/// Result type alias using StrideError.
pub type Result<T> = std::result::Result<T, StrideError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_display() {
        let err = StrideError::HandlerMissing {
            workflow_id: "checkout".into(),
            step_id: "charge".into(),
        };
        assert_eq!(
            err.to_string(),
            "Workflow 'checkout' has no handler for step 'charge'"
        );

        let err = StrideError::Conflict {
            key: "checkout:tx-1".into(),
            expected: 3,
            found: 4,
        };
        assert!(err.to_string().contains("expected version 3"));
    }

    #[test]
    fn test_from_serde_error() {
        let parse: std::result::Result<serde_json::Value, _> = serde_json::from_str("{oops");
        let err: StrideError = parse.unwrap_err().into();
        assert!(matches!(err, StrideError::Serialization(_)));
    }
}
