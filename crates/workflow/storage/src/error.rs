use thiserror::Error;
use workflow_types::WorkflowError;

/// Result type for storage operations.
pub type StorageResult<T> = Result<T, StorageError>;

/// Storage-layer errors.
#[derive(Debug, Error)]
pub enum StorageError {
    #[error("run not found: {workflow_name}/{run_id}")]
    RunNotFound {
        workflow_name: String,
        run_id: String,
    },

    #[error("backend error: {0}")]
    Backend(String),
}

impl From<StorageError> for WorkflowError {
    fn from(err: StorageError) -> Self {
        match err {
            StorageError::RunNotFound {
                workflow_name,
                run_id,
            } => WorkflowError::RunNotFound {
                workflow_id: workflow_name,
                run_id,
            },
            other => WorkflowError::Storage(other.to_string()),
        }
    }
}
