//! Scripted step handler that records every call.
//!
//! Several mocks can share one [`CallJournal`] so tests can assert the
//! global order of invocations and compensations across steps.

use std::collections::VecDeque;
use std::sync::{Arc, RwLock};
use std::time::Duration;

use futures::future::BoxFuture;

use crate::workflow::{StepAction, StepError, StepHandler, StepOutcome, StepPayload};

/// One recorded handler call.
#[derive(Debug, Clone, PartialEq)]
pub struct CallRecord {
    pub step_id: String,
    pub action: StepAction,
    pub attempt: u32,
    pub input: serde_json::Value,
}

/// Ordered log of handler calls.
#[derive(Debug, Clone, Default)]
pub struct CallJournal {
    calls: Arc<RwLock<Vec<CallRecord>>>,
}

impl CallJournal {
    pub fn new() -> Self {
        Self::default()
    }

    fn record(&self, payload: &StepPayload) {
        let record = CallRecord {
            step_id: payload.metadata.step_id.clone(),
            action: payload.metadata.action,
            attempt: payload.metadata.attempt,
            input: payload.input.clone(),
        };
        if let Ok(mut calls) = self.calls.write() {
            calls.push(record);
        }
    }

    /// All calls in order.
    pub fn calls(&self) -> Vec<CallRecord> {
        self.calls.read().map(|c| c.clone()).unwrap_or_default()
    }

    /// Step ids of calls of one action, in order.
    pub fn sequence(&self, action: StepAction) -> Vec<String> {
        self.calls()
            .into_iter()
            .filter(|c| c.action == action)
            .map(|c| c.step_id)
            .collect()
    }

    /// Number of calls of one action for one step.
    pub fn count(&self, step_id: &str, action: StepAction) -> usize {
        self.calls()
            .iter()
            .filter(|c| c.step_id == step_id && c.action == action)
            .count()
    }

    /// Assert that a step was never invoked.
    pub fn assert_not_invoked(&self, step_id: &str) {
        let count = self.count(step_id, StepAction::Invoke);
        assert_eq!(
            count, 0,
            "Expected step '{}' NOT to be invoked, but it was invoked {} time(s)",
            step_id, count
        );
    }

    /// Assert that a step was compensated exactly once.
    pub fn assert_compensated_once(&self, step_id: &str) {
        let count = self.count(step_id, StepAction::Compensate);
        assert_eq!(
            count, 1,
            "Expected step '{}' to be compensated once, got {}",
            step_id, count
        );
    }
}

/// What a mocked invoke does.
#[derive(Debug, Clone)]
pub enum MockBehavior {
    Complete(serde_json::Value),
    Pending,
    Fail(StepError),
}

struct Inner {
    journal: CallJournal,
    script: RwLock<VecDeque<MockBehavior>>,
    fallback: MockBehavior,
    compensation: Result<serde_json::Value, StepError>,
    delay: Option<Duration>,
}

/// Step handler driven by a script of behaviors.
///
/// # Example
///
/// ```ignore
/// let journal = CallJournal::new();
/// let charge = MockStep::completing(json!({"charged": true}))
///     .then(MockBehavior::Fail(StepError::transient("busy")))
///     .with_journal(journal.clone());
/// ```
#[derive(Clone)]
pub struct MockStep {
    inner: Arc<Inner>,
}

impl MockStep {
    fn with_fallback(fallback: MockBehavior) -> Self {
        Self {
            inner: Arc::new(Inner {
                journal: CallJournal::new(),
                script: RwLock::new(VecDeque::new()),
                fallback,
                compensation: Ok(serde_json::Value::Null),
                delay: None,
            }),
        }
    }

    /// Always completes with `response`.
    pub fn completing(response: serde_json::Value) -> Self {
        Self::with_fallback(MockBehavior::Complete(response))
    }

    /// Always parks the step.
    pub fn pending() -> Self {
        Self::with_fallback(MockBehavior::Pending)
    }

    /// Always fails with `error`.
    pub fn failing(error: StepError) -> Self {
        Self::with_fallback(MockBehavior::Fail(error))
    }

    fn map_inner(self, f: impl FnOnce(&mut Inner)) -> Self {
        let mut inner = match Arc::try_unwrap(self.inner) {
            Ok(inner) => inner,
            Err(shared) => Inner {
                journal: shared.journal.clone(),
                script: RwLock::new(shared.script.read().map(|s| s.clone()).unwrap_or_default()),
                fallback: shared.fallback.clone(),
                compensation: shared.compensation.clone(),
                delay: shared.delay,
            },
        };
        f(&mut inner);
        Self {
            inner: Arc::new(inner),
        }
    }

    /// Queue a behavior used before the fallback. Queued behaviors run in order.
    pub fn then(self, behavior: MockBehavior) -> Self {
        self.map_inner(|inner| {
            if let Ok(mut script) = inner.script.write() {
                script.push_back(behavior);
            }
        })
    }

    /// Fail the first `times` invokes with `error`, then fall back.
    pub fn failing_first(self, times: usize, error: StepError) -> Self {
        (0..times).fold(self, |mock, _| mock.then(MockBehavior::Fail(error.clone())))
    }

    /// Result returned by compensate.
    pub fn compensating_with(self, result: Result<serde_json::Value, StepError>) -> Self {
        self.map_inner(|inner| inner.compensation = result)
    }

    /// Sleep before each invoke.
    pub fn with_delay(self, delay: Duration) -> Self {
        self.map_inner(|inner| inner.delay = Some(delay))
    }

    /// Record calls in a shared journal.
    pub fn with_journal(self, journal: CallJournal) -> Self {
        self.map_inner(|inner| inner.journal = journal)
    }

    pub fn journal(&self) -> &CallJournal {
        &self.inner.journal
    }

    fn next_behavior(&self) -> MockBehavior {
        self.inner
            .script
            .write()
            .ok()
            .and_then(|mut script| script.pop_front())
            .unwrap_or_else(|| self.inner.fallback.clone())
    }
}

impl StepHandler for MockStep {
    fn invoke(&self, payload: StepPayload) -> BoxFuture<'_, Result<StepOutcome, StepError>> {
        Box::pin(async move {
            self.inner.journal.record(&payload);
            if let Some(delay) = self.inner.delay {
                tokio::time::sleep(delay).await;
            }
            match self.next_behavior() {
                MockBehavior::Complete(value) => Ok(StepOutcome::Completed(value)),
                MockBehavior::Pending => Ok(StepOutcome::Pending),
                MockBehavior::Fail(error) => Err(error),
            }
        })
    }

    fn compensate(
        &self,
        payload: StepPayload,
    ) -> BoxFuture<'_, Result<serde_json::Value, StepError>> {
        Box::pin(async move {
            self.inner.journal.record(&payload);
            self.inner.compensation.clone()
        })
    }
}
