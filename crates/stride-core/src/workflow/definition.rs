use std::collections::{BTreeSet, HashMap, HashSet, VecDeque};
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::{Result, StrideError};

/// Immutable policy and dependency edges of one step.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StepDefinition {
    /// Step id, also the action name used in idempotency keys.
    pub id: String,
    /// Steps that must be DONE before this one may start.
    #[serde(default)]
    pub depends_on: BTreeSet<String>,
    /// Whether the step parks as DORMANT until an external callback.
    #[serde(default, rename = "async")]
    pub is_async: bool,
    /// Whether the step is skipped during compensation.
    #[serde(default)]
    pub no_compensation: bool,
    /// Retries after the first attempt for transient failures.
    #[serde(default)]
    pub max_retries: u32,
    /// Delay before a retry. Zero retries within the same pass.
    #[serde(default)]
    pub retry_interval_secs: u64,
    /// Step timeout. Unset means no timeout.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub timeout_secs: Option<u64>,
}

impl StepDefinition {
    /// Create a step with no dependencies and default policy.
    pub fn new(id: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            depends_on: BTreeSet::new(),
            is_async: false,
            no_compensation: false,
            max_retries: 0,
            retry_interval_secs: 0,
            timeout_secs: None,
        }
    }

    /// Add dependencies.
    pub fn depends_on<I, S>(mut self, steps: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.depends_on.extend(steps.into_iter().map(Into::into));
        self
    }

    /// Mark the step as asynchronous.
    pub fn asynchronous(mut self) -> Self {
        self.is_async = true;
        self
    }

    /// Exclude the step from compensation.
    pub fn no_compensation(mut self) -> Self {
        self.no_compensation = true;
        self
    }

    /// Configure retry behavior.
    pub fn retry(mut self, max_retries: u32, interval: Duration) -> Self {
        self.max_retries = max_retries;
        self.retry_interval_secs = interval.as_secs();
        self
    }

    /// Set the step timeout.
    pub fn timeout(mut self, duration: Duration) -> Self {
        self.timeout_secs = Some(duration.as_secs().max(1));
        self
    }

    /// Retry interval as a duration.
    pub fn retry_interval(&self) -> Duration {
        Duration::from_secs(self.retry_interval_secs)
    }

    /// Timeout as a duration.
    pub fn timeout_duration(&self) -> Option<Duration> {
        self.timeout_secs.map(Duration::from_secs)
    }
}

/// Declarative description of a workflow: its steps and global policy.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct WorkflowDefinition {
    /// Workflow id.
    pub id: String,
    /// Steps in declaration order.
    pub steps: Vec<StepDefinition>,
    /// Whole-transaction timeout.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub timeout_secs: Option<u64>,
    /// Retention of terminal transactions, overriding the orchestrator default.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub retention_secs: Option<u64>,
}

impl WorkflowDefinition {
    /// Create an empty definition.
    pub fn new(id: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            steps: Vec::new(),
            timeout_secs: None,
            retention_secs: None,
        }
    }

    /// Look up a step definition.
    pub fn step(&self, id: &str) -> Option<&StepDefinition> {
        self.steps.iter().find(|s| s.id == id)
    }

    /// Steps that directly depend on `id`.
    pub fn dependents(&self, id: &str) -> Vec<&str> {
        self.steps
            .iter()
            .filter(|s| s.depends_on.contains(id))
            .map(|s| s.id.as_str())
            .collect()
    }

    /// Check that the steps form a well-formed DAG.
    pub fn validate(&self) -> Result<()> {
        if self.id.is_empty() || self.id.contains(':') {
            return Err(StrideError::InvalidGraph(format!(
                "workflow id '{}' must be non-empty and free of ':'",
                self.id
            )));
        }
        if self.steps.is_empty() {
            return Err(StrideError::InvalidGraph(format!(
                "workflow '{}' has no steps",
                self.id
            )));
        }

        let mut seen = HashSet::new();
        for step in &self.steps {
            if step.id.is_empty() || step.id.contains(':') {
                return Err(StrideError::InvalidGraph(format!(
                    "step id '{}' must be non-empty and free of ':'",
                    step.id
                )));
            }
            if !seen.insert(step.id.as_str()) {
                return Err(StrideError::InvalidGraph(format!(
                    "duplicate step '{}'",
                    step.id
                )));
            }
        }

        for step in &self.steps {
            for dep in &step.depends_on {
                if dep == &step.id {
                    return Err(StrideError::InvalidGraph(format!(
                        "step '{}' depends on itself",
                        step.id
                    )));
                }
                if !seen.contains(dep.as_str()) {
                    return Err(StrideError::InvalidGraph(format!(
                        "step '{}' depends on unknown step '{}'",
                        step.id, dep
                    )));
                }
            }
        }

        self.topological_order().map(|_| ())
    }

    /// Steps in dependency order, ties broken by declaration order.
    pub fn topological_order(&self) -> Result<Vec<&str>> {
        let position: HashMap<&str, usize> = self
            .steps
            .iter()
            .enumerate()
            .map(|(i, s)| (s.id.as_str(), i))
            .collect();

        let mut remaining: Vec<usize> = self.steps.iter().map(|s| s.depends_on.len()).collect();
        let mut queue: VecDeque<usize> = remaining
            .iter()
            .enumerate()
            .filter(|(_, deps)| **deps == 0)
            .map(|(i, _)| i)
            .collect();

        let mut order = Vec::with_capacity(self.steps.len());
        while let Some(index) = queue.pop_front() {
            let id = self.steps[index].id.as_str();
            order.push(id);

            let mut unlocked: Vec<usize> = Vec::new();
            for dependent in self.dependents(id) {
                if let Some(&pos) = position.get(dependent) {
                    remaining[pos] -= 1;
                    if remaining[pos] == 0 {
                        unlocked.push(pos);
                    }
                }
            }
            unlocked.sort_unstable();
            queue.extend(unlocked);
        }

        if order.len() != self.steps.len() {
            return Err(StrideError::InvalidGraph(format!(
                "workflow '{}' contains a dependency cycle",
                self.id
            )));
        }

        Ok(order)
    }

    /// Transaction timeout as a duration.
    pub fn timeout(&self) -> Option<Duration> {
        self.timeout_secs.map(Duration::from_secs)
    }

    /// Retention as a duration.
    pub fn retention(&self) -> Option<Duration> {
        self.retention_secs.map(Duration::from_secs)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn linear() -> WorkflowDefinition {
        let mut def = WorkflowDefinition::new("linear");
        def.steps = vec![
            StepDefinition::new("a"),
            StepDefinition::new("b").depends_on(["a"]),
            StepDefinition::new("c").depends_on(["b"]),
        ];
        def
    }

    #[test]
    fn test_step_definition_builder() {
        let step = StepDefinition::new("charge")
            .depends_on(["reserve"])
            .asynchronous()
            .no_compensation()
            .retry(3, Duration::from_secs(5))
            .timeout(Duration::from_secs(30));

        assert!(step.depends_on.contains("reserve"));
        assert!(step.is_async);
        assert!(step.no_compensation);
        assert_eq!(step.max_retries, 3);
        assert_eq!(step.retry_interval(), Duration::from_secs(5));
        assert_eq!(step.timeout_duration(), Some(Duration::from_secs(30)));
    }

    #[test]
    fn test_step_definition_serde_names() {
        let step = StepDefinition::new("ship").asynchronous();
        let value = serde_json::to_value(&step).unwrap();
        assert_eq!(value["async"], true);
        assert_eq!(value["noCompensation"], false);

        let parsed: StepDefinition =
            serde_json::from_value(serde_json::json!({"id": "ship", "dependsOn": ["pack"]}))
                .unwrap();
        assert!(parsed.depends_on.contains("pack"));
        assert_eq!(parsed.max_retries, 0);
    }

    #[test]
    fn test_topological_order() {
        let mut def = WorkflowDefinition::new("diamond");
        def.steps = vec![
            StepDefinition::new("join").depends_on(["left", "right"]),
            StepDefinition::new("right").depends_on(["root"]),
            StepDefinition::new("left").depends_on(["root"]),
            StepDefinition::new("root"),
        ];

        let order = def.topological_order().unwrap();
        assert_eq!(order, vec!["root", "right", "left", "join"]);
        assert!(def.validate().is_ok());
    }

    #[test]
    fn test_validate_linear() {
        assert!(linear().validate().is_ok());
        assert_eq!(linear().dependents("a"), vec!["b"]);
    }

    #[test]
    fn test_validate_rejects_cycle() {
        let mut def = WorkflowDefinition::new("cycle");
        def.steps = vec![
            StepDefinition::new("a").depends_on(["b"]),
            StepDefinition::new("b").depends_on(["a"]),
        ];
        let err = def.validate().unwrap_err();
        assert!(err.to_string().contains("cycle"));
    }

    #[test]
    fn test_validate_rejects_unknown_and_duplicate() {
        let mut def = WorkflowDefinition::new("broken");
        def.steps = vec![StepDefinition::new("a").depends_on(["ghost"])];
        assert!(matches!(def.validate(), Err(StrideError::InvalidGraph(_))));

        def.steps = vec![StepDefinition::new("a"), StepDefinition::new("a")];
        assert!(matches!(def.validate(), Err(StrideError::InvalidGraph(_))));

        def.steps = vec![StepDefinition::new("a:b")];
        assert!(matches!(def.validate(), Err(StrideError::InvalidGraph(_))));
    }

    #[test]
    fn test_validate_rejects_empty() {
        let def = WorkflowDefinition::new("empty");
        assert!(matches!(def.validate(), Err(StrideError::InvalidGraph(_))));
    }
}
