//! Test assertion macros and helpers.
//!
//! Provides assertion macros for the states transactions and steps pass through.

use crate::error::StrideError;
use crate::workflow::{EventKind, LifecycleEvent};

/// Assert that a result is Ok.
///
/// # Example
///
/// ```ignore
/// let result = service.cancel("checkout", "tx-1").await;
/// assert_ok!(result);
/// assert_ok!(result, "cancel should succeed");
/// ```
#[macro_export]
macro_rules! assert_ok {
    ($expr:expr) => {
        match &$expr {
            Ok(_) => (),
            Err(e) => panic!("assertion failed: expected Ok, got Err({:?})", e),
        }
    };
    ($expr:expr, $($arg:tt)+) => {
        match &$expr {
            Ok(_) => (),
            Err(e) => panic!("assertion failed: {}: expected Ok, got Err({:?})", format_args!($($arg)+), e),
        }
    };
}

/// Assert that a result is Err.
#[macro_export]
macro_rules! assert_err {
    ($expr:expr) => {
        match &$expr {
            Err(_) => (),
            Ok(v) => panic!("assertion failed: expected Err, got Ok({:?})", v),
        }
    };
    ($expr:expr, $($arg:tt)+) => {
        match &$expr {
            Err(_) => (),
            Ok(v) => panic!("assertion failed: {}: expected Err, got Ok({:?})", format_args!($($arg)+), v),
        }
    };
}

/// Assert that an error matches a specific variant.
///
/// # Example
///
/// ```ignore
/// let result = service.run("unknown".into(), RunOptions::default()).await;
/// assert_err_variant!(result, StrideError::WorkflowNotFound(_));
/// ```
#[macro_export]
macro_rules! assert_err_variant {
    ($expr:expr, $variant:pat) => {
        match &$expr {
            Err($variant) => (),
            Err(e) => panic!(
                "assertion failed: expected {}, got {:?}",
                stringify!($variant),
                e
            ),
            Ok(v) => panic!(
                "assertion failed: expected Err({}), got Ok({:?})",
                stringify!($variant),
                v
            ),
        }
    };
}

/// Assert the state of one step of a transaction.
///
/// # Example
///
/// ```ignore
/// assert_step_state!(tx, "charge", StepState::Reverted);
/// ```
#[macro_export]
macro_rules! assert_step_state {
    ($tx:expr, $step:expr, $state:expr) => {
        match (&$tx, $step) {
            (tx, step_id) => match tx.step(step_id) {
                Some(step) => assert_eq!(
                    step.state, $state,
                    "step '{}' of transaction '{}'",
                    step_id, tx.transaction_id
                ),
                None => panic!(
                    "assertion failed: transaction '{}' has no step '{}'",
                    tx.transaction_id, step_id
                ),
            },
        }
    };
}

/// Assert the derived state of a transaction.
///
/// # Example
///
/// ```ignore
/// assert_transaction_state!(tx, TransactionState::Done);
/// ```
#[macro_export]
macro_rules! assert_transaction_state {
    ($tx:expr, $state:expr) => {
        match &$tx {
            tx => assert_eq!(
                tx.state(),
                $state,
                "transaction '{}' of '{}'",
                tx.transaction_id,
                tx.workflow_id
            ),
        }
    };
}

/// Check if an error message contains a substring.
pub fn error_contains(error: &StrideError, substring: &str) -> bool {
    error.to_string().contains(substring)
}

/// Wire names of a sequence of events, for comparing against an expected trace.
pub fn event_types(events: &[LifecycleEvent]) -> Vec<&'static str> {
    events.iter().map(|e| e.event_type()).collect()
}

/// Events of one kind that refer to `step`.
pub fn events_for_step<'a>(
    events: &'a [LifecycleEvent],
    event_type: &str,
    step: &str,
) -> Vec<&'a LifecycleEvent> {
    events
        .iter()
        .filter(|e| e.event_type() == event_type && e.kind.step() == Some(step))
        .collect()
}

/// The finish event, if one was emitted.
pub fn finish_event(events: &[LifecycleEvent]) -> Option<&LifecycleEvent> {
    events
        .iter()
        .find(|e| matches!(e.kind, EventKind::Finish { .. }))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::workflow::{
        DistributedTransaction, StepDefinition, StepState, TransactionState, WorkflowDefinition,
    };

    fn transaction() -> DistributedTransaction {
        let mut def = WorkflowDefinition::new("checkout");
        def.steps = vec![StepDefinition::new("reserve")];
        DistributedTransaction::new(&def, "tx-1", serde_json::Value::Null)
    }

    #[test]
    fn test_assert_ok_macro() {
        let result: Result<i32, String> = Ok(42);
        assert_ok!(result);
    }

    #[test]
    #[should_panic(expected = "expected Ok")]
    fn test_assert_ok_macro_fails() {
        let result: Result<i32, String> = Err("error".to_string());
        assert_ok!(result);
    }

    #[test]
    fn test_assert_err_variant_macro() {
        let result: Result<(), StrideError> = Err(StrideError::WorkflowNotFound("x".into()));
        assert_err!(result);
        assert_err_variant!(result, StrideError::WorkflowNotFound(_));
    }

    #[test]
    fn test_state_macros() {
        let tx = transaction();
        assert_step_state!(tx, "reserve", StepState::NotStarted);
        assert_transaction_state!(tx, TransactionState::NotStarted);
    }

    #[test]
    fn test_state_macros_evaluate_once() {
        let mut calls = 0;
        let mut load = || {
            calls += 1;
            Some(transaction())
        };

        assert_transaction_state!(load().unwrap(), TransactionState::NotStarted);
        assert_step_state!(load().unwrap(), "reserve", StepState::NotStarted);
        assert_eq!(calls, 2);
    }

    #[test]
    #[should_panic(expected = "has no step")]
    fn test_assert_step_state_unknown_step() {
        let tx = transaction();
        assert_step_state!(tx, "ghost", StepState::Done);
    }

    #[test]
    fn test_event_helpers() {
        let events = vec![
            LifecycleEvent::new("checkout", "tx-1", EventKind::Begin),
            LifecycleEvent::new(
                "checkout",
                "tx-1",
                EventKind::StepBegin {
                    step: "reserve".into(),
                    attempt: 1,
                },
            ),
            LifecycleEvent::new(
                "checkout",
                "tx-1",
                EventKind::Finish {
                    state: TransactionState::Done,
                    result: None,
                    errors: Vec::new(),
                },
            ),
        ];

        assert_eq!(event_types(&events), vec!["begin", "stepBegin", "finish"]);
        assert_eq!(events_for_step(&events, "stepBegin", "reserve").len(), 1);
        assert!(finish_event(&events).is_some());
        assert!(error_contains(
            &StrideError::WorkflowNotFound("checkout".into()),
            "checkout"
        ));
    }
}
