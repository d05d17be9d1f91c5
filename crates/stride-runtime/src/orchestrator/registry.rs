use std::collections::HashMap;
use std::sync::{Arc, RwLock};

use stride_core::error::{Result, StrideError};
use stride_core::workflow::Workflow;

/// Registry of all workflows a service can run.
///
/// Registration is allowed while a service is running; transactions already
/// in flight keep using the workflow they were started with until they are
/// next loaded.
#[derive(Default)]
pub struct WorkflowRegistry {
    workflows: RwLock<HashMap<String, Arc<Workflow>>>,
}

impl WorkflowRegistry {
    /// Create a new empty registry.
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a workflow, replacing any previous one with the same id.
    pub fn register(&self, workflow: Workflow) -> Arc<Workflow> {
        let workflow = Arc::new(workflow);
        let previous = self
            .write()
            .insert(workflow.id().to_string(), workflow.clone());

        if previous.is_some() {
            tracing::debug!(workflow_id = %workflow.id(), "Replaced registered workflow");
        }
        workflow
    }

    /// Register a workflow that must not exist yet.
    pub fn try_register(&self, workflow: Workflow) -> Result<Arc<Workflow>> {
        if self.contains(workflow.id()) {
            return Err(StrideError::Validation(format!(
                "Workflow '{}' is already registered",
                workflow.id()
            )));
        }
        Ok(self.register(workflow))
    }

    /// Remove a workflow. Returns whether it was registered.
    pub fn unregister(&self, id: &str) -> bool {
        self.write().remove(id).is_some()
    }

    /// Get a workflow by id.
    pub fn get(&self, id: &str) -> Option<Arc<Workflow>> {
        self.read().get(id).cloned()
    }

    pub fn contains(&self, id: &str) -> bool {
        self.read().contains_key(id)
    }

    /// All registered workflow ids, sorted.
    pub fn list(&self) -> Vec<String> {
        let mut ids: Vec<String> = self.read().keys().cloned().collect();
        ids.sort();
        ids
    }

    pub fn len(&self) -> usize {
        self.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.read().is_empty()
    }

    /// Remove every workflow.
    pub fn clear(&self) {
        self.write().clear();
    }

    fn read(&self) -> std::sync::RwLockReadGuard<'_, HashMap<String, Arc<Workflow>>> {
        self.workflows.read().unwrap_or_else(|e| e.into_inner())
    }

    fn write(&self) -> std::sync::RwLockWriteGuard<'_, HashMap<String, Arc<Workflow>>> {
        self.workflows.write().unwrap_or_else(|e| e.into_inner())
    }
}
