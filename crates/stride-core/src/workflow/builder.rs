use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use super::definition::{StepDefinition, WorkflowDefinition};
use super::handler::StepHandler;
use crate::error::{Result, StrideError};

/// A validated workflow definition bound to its step handlers.
#[derive(Clone)]
pub struct Workflow {
    definition: WorkflowDefinition,
    handlers: HashMap<String, Arc<dyn StepHandler>>,
}

impl Workflow {
    /// Start building a workflow.
    pub fn builder(id: impl Into<String>) -> WorkflowBuilder {
        WorkflowBuilder::new(id)
    }

    pub fn id(&self) -> &str {
        &self.definition.id
    }

    pub fn definition(&self) -> &WorkflowDefinition {
        &self.definition
    }

    /// Handler of a step.
    pub fn handler(&self, step_id: &str) -> Option<Arc<dyn StepHandler>> {
        self.handlers.get(step_id).cloned()
    }
}

impl fmt::Debug for Workflow {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Workflow")
            .field("definition", &self.definition)
            .field("handlers", &self.handlers.keys().collect::<Vec<_>>())
            .finish()
    }
}

/// Builder binding step definitions to handlers.
pub struct WorkflowBuilder {
    definition: WorkflowDefinition,
    handlers: HashMap<String, Arc<dyn StepHandler>>,
}

impl WorkflowBuilder {
    pub fn new(id: impl Into<String>) -> Self {
        Self {
            definition: WorkflowDefinition::new(id),
            handlers: HashMap::new(),
        }
    }

    /// Start from a declarative definition; handlers are attached with [`Self::handler`].
    pub fn from_definition(definition: WorkflowDefinition) -> Self {
        Self {
            definition,
            handlers: HashMap::new(),
        }
    }

    /// Add a step together with its handler.
    pub fn step<H: StepHandler>(mut self, definition: StepDefinition, handler: H) -> Self {
        self.handlers
            .insert(definition.id.clone(), Arc::new(handler));
        self.definition.steps.push(definition);
        self
    }

    /// Attach a handler to an already declared step.
    pub fn handler<H: StepHandler>(mut self, step_id: impl Into<String>, handler: H) -> Self {
        self.handlers.insert(step_id.into(), Arc::new(handler));
        self
    }

    /// Attach a shared handler.
    pub fn shared_handler(
        mut self,
        step_id: impl Into<String>,
        handler: Arc<dyn StepHandler>,
    ) -> Self {
        self.handlers.insert(step_id.into(), handler);
        self
    }

    /// Set the whole-transaction timeout.
    pub fn timeout(mut self, duration: Duration) -> Self {
        self.definition.timeout_secs = Some(duration.as_secs().max(1));
        self
    }

    /// Set how long terminal transactions are kept.
    pub fn retention(mut self, duration: Duration) -> Self {
        self.definition.retention_secs = Some(duration.as_secs());
        self
    }

    /// Validate the graph and check every step has a handler.
    pub fn build(self) -> Result<Workflow> {
        self.definition.validate()?;

        for step in &self.definition.steps {
            if !self.handlers.contains_key(&step.id) {
                return Err(StrideError::HandlerMissing {
                    workflow_id: self.definition.id.clone(),
                    step_id: step.id.clone(),
                });
            }
        }

        if let Some(extra) = self
            .handlers
            .keys()
            .find(|id| self.definition.step(id).is_none())
        {
            return Err(StrideError::InvalidGraph(format!(
                "handler registered for unknown step '{}'",
                extra
            )));
        }

        Ok(Workflow {
            definition: self.definition,
            handlers: self.handlers,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::workflow::handler::{FnStep, StepOutcome};

    fn noop() -> FnStep {
        FnStep::new(|_| async { Ok(StepOutcome::Completed(serde_json::Value::Null)) })
    }

    #[test]
    fn test_build_workflow() {
        let workflow = Workflow::builder("checkout")
            .step(StepDefinition::new("reserve"), noop())
            .step(StepDefinition::new("charge").depends_on(["reserve"]), noop())
            .timeout(Duration::from_secs(300))
            .retention(Duration::from_secs(60))
            .build()
            .unwrap();

        assert_eq!(workflow.id(), "checkout");
        assert_eq!(workflow.definition().steps.len(), 2);
        assert_eq!(workflow.definition().timeout(), Some(Duration::from_secs(300)));
        assert!(workflow.handler("charge").is_some());
        assert!(workflow.handler("ship").is_none());
    }

    #[test]
    fn test_missing_handler_rejected() {
        let mut def = WorkflowDefinition::new("checkout");
        def.steps = vec![
            StepDefinition::new("reserve"),
            StepDefinition::new("charge").depends_on(["reserve"]),
        ];

        let result = WorkflowBuilder::from_definition(def)
            .handler("reserve", noop())
            .build();

        match result {
            Err(StrideError::HandlerMissing { workflow_id, step_id }) => {
                assert_eq!(workflow_id, "checkout");
                assert_eq!(step_id, "charge");
            }
            other => panic!("expected HandlerMissing, got {:?}", other),
        }
    }

    #[test]
    fn test_unknown_handler_rejected() {
        let result = Workflow::builder("checkout")
            .step(StepDefinition::new("reserve"), noop())
            .handler("ghost", noop())
            .build();
        assert!(matches!(result, Err(StrideError::InvalidGraph(_))));
    }

    #[test]
    fn test_invalid_graph_rejected() {
        let result = Workflow::builder("checkout")
            .step(StepDefinition::new("charge").depends_on(["reserve"]), noop())
            .build();
        assert!(matches!(result, Err(StrideError::InvalidGraph(_))));
    }
}
