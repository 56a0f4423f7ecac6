//! Workflow registry: stores and retrieves committed workflows
//!
//! Workflows are immutable once committed. Registering a workflow also
//! registers every nested workflow it uses as a step, so processors can
//! resolve nested runs by workflow id.

use std::collections::HashMap;
use std::sync::{Arc, RwLock};
use workflow_types::{WorkflowError, WorkflowResult};

use crate::graph::Workflow;

/// Registry of committed workflows
#[derive(Default)]
pub struct WorkflowRegistry {
    /// All registered workflows, keyed by ID
    workflows: RwLock<HashMap<String, Arc<Workflow>>>,
}

impl WorkflowRegistry {
    /// Create a new empty registry
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a workflow and the workflows nested in it
    pub fn register(&self, workflow: impl Into<Arc<Workflow>>) -> WorkflowResult<Arc<Workflow>> {
        let workflow = workflow.into();
        let mut workflows = self
            .workflows
            .write()
            .map_err(|_| WorkflowError::Storage("workflow registry lock poisoned".to_string()))?;

        for nested in workflow.nested_workflows() {
            tracing::debug!(workflow_id = %nested.id(), "Nested workflow registered");
            workflows.insert(nested.id().to_string(), nested);
        }
        workflows.insert(workflow.id().to_string(), workflow.clone());

        tracing::info!(workflow_id = %workflow.id(), "Workflow registered");
        Ok(workflow)
    }

    /// Get a workflow by ID
    pub fn get(&self, id: &str) -> WorkflowResult<Arc<Workflow>> {
        self.workflows
            .read()
            .map_err(|_| WorkflowError::Storage("workflow registry lock poisoned".to_string()))?
            .get(id)
            .cloned()
            .ok_or_else(|| WorkflowError::WorkflowNotFound(id.to_string()))
    }

    /// List all registered workflow ids
    pub fn list(&self) -> Vec<String> {
        self.workflows
            .read()
            .map(|workflows| {
                let mut ids: Vec<String> = workflows.keys().cloned().collect();
                ids.sort();
                ids
            })
            .unwrap_or_default()
    }

    /// Total number of registered workflows
    pub fn count(&self) -> usize {
        self.workflows.read().map(|w| w.len()).unwrap_or(0)
    }

    /// Check if a workflow exists
    pub fn contains(&self, id: &str) -> bool {
        self.workflows
            .read()
            .map(|w| w.contains_key(id))
            .unwrap_or(false)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::graph::passthrough;
    use crate::step::Step;

    fn simple(id: &str) -> Workflow {
        Workflow::builder(id)
            .then(passthrough("a"))
            .commit()
            .unwrap()
    }

    #[test]
    fn test_register_and_get() {
        let registry = WorkflowRegistry::new();
        registry.register(simple("Test Workflow")).unwrap();

        let retrieved = registry.get("Test Workflow").unwrap();
        assert_eq!(retrieved.id(), "Test Workflow");
        assert_eq!(registry.count(), 1);
    }

    #[test]
    fn test_get_nonexistent() {
        let registry = WorkflowRegistry::new();
        assert!(matches!(
            registry.get("nonexistent"),
            Err(WorkflowError::WorkflowNotFound(_))
        ));
    }

    #[test]
    fn test_nested_workflows_are_registered() {
        let registry = WorkflowRegistry::new();
        let outer = Workflow::builder("outer")
            .then(Step::from_workflow(simple("inner")))
            .commit()
            .unwrap();
        registry.register(outer).unwrap();

        assert!(registry.contains("inner"));
        assert_eq!(registry.list(), vec!["inner".to_string(), "outer".to_string()]);
    }
}
