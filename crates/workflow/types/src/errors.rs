//! Error types for the Workflow layer

use crate::{ExecutionPath, RunStatus};
use serde::{Deserialize, Serialize};

/// Errors that can occur in Workflow operations
#[derive(Debug, thiserror::Error)]
pub enum WorkflowError {
    #[error("Workflow not found: {0}")]
    WorkflowNotFound(String),

    #[error("Run not found: {workflow_id}/{run_id}")]
    RunNotFound { workflow_id: String, run_id: String },

    #[error("Step not found: {0}")]
    StepNotFound(String),

    #[error("No suspended path recorded for step: {0}")]
    NoSuspendedPath(String),

    #[error("Run {run_id} is not suspended (status: {status})")]
    RunNotSuspended { run_id: String, status: RunStatus },

    #[error("Resume requires at least one step id")]
    EmptyResumeSteps,

    #[error("Duplicate step ID: {0}")]
    DuplicateStepId(String),

    #[error("Invalid workflow graph: {0}")]
    InvalidGraph(String),

    #[error("Empty execution path")]
    EmptyExecutionPath,

    #[error("No step at execution path {0}")]
    StepMissingAtPath(ExecutionPath),

    #[error("Node at {path} is not executable: {kind}")]
    NotExecutable { path: ExecutionPath, kind: String },

    #[error("Invalid input for step {step_id}: {reason}")]
    InvalidInput { step_id: String, reason: String },

    #[error("Storage error: {0}")]
    Storage(String),

    #[error("Bus error: {0}")]
    Bus(String),

    #[error("Timed out waiting for run {run_id} to finish")]
    FinishTimeout { run_id: String },

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

impl WorkflowError {
    /// Classify the error for propagation decisions
    pub fn category(&self) -> ErrorCategory {
        match self {
            WorkflowError::WorkflowNotFound(_)
            | WorkflowError::RunNotFound { .. }
            | WorkflowError::StepNotFound(_)
            | WorkflowError::NoSuspendedPath(_)
            | WorkflowError::RunNotSuspended { .. }
            | WorkflowError::EmptyResumeSteps
            | WorkflowError::DuplicateStepId(_)
            | WorkflowError::InvalidGraph(_) => ErrorCategory::User,
            WorkflowError::EmptyExecutionPath
            | WorkflowError::StepMissingAtPath(_)
            | WorkflowError::NotExecutable { .. }
            | WorkflowError::InvalidInput { .. } => ErrorCategory::Structural,
            WorkflowError::Storage(_)
            | WorkflowError::Bus(_)
            | WorkflowError::FinishTimeout { .. }
            | WorkflowError::Serialization(_) => ErrorCategory::Transport,
        }
    }
}

/// Coarse error taxonomy
///
/// - `User`: raised synchronously to the caller of `start`/`resume`
/// - `Structural`: graph/path inconsistencies, converted into `workflow.fail`
/// - `Step`: step-body failures, subject to retry
/// - `Transport`: bus or storage failures, logged and swallowed
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ErrorCategory {
    User,
    Structural,
    Step,
    Transport,
}

impl std::fmt::Display for ErrorCategory {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ErrorCategory::User => write!(f, "user"),
            ErrorCategory::Structural => write!(f, "structural"),
            ErrorCategory::Step => write!(f, "step"),
            ErrorCategory::Transport => write!(f, "transport"),
        }
    }
}

/// Result type alias for workflow operations
pub type WorkflowResult<T> = Result<T, WorkflowError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_categories() {
        assert_eq!(
            WorkflowError::NoSuspendedPath("a".into()).category(),
            ErrorCategory::User
        );
        assert_eq!(
            WorkflowError::EmptyExecutionPath.category(),
            ErrorCategory::Structural
        );
        assert_eq!(
            WorkflowError::Bus("closed".into()).category(),
            ErrorCategory::Transport
        );
    }

    #[test]
    fn test_messages() {
        let err = WorkflowError::StepMissingAtPath(ExecutionPath::new(vec![3, 1]));
        assert_eq!(err.to_string(), "No step at execution path [3, 1]");
    }
}
