use thiserror::Error;
use workflow_types::WorkflowError;

/// Result type for bus operations.
pub type BusResult<T> = Result<T, BusError>;

/// Bus-layer errors.
#[derive(Debug, Error)]
pub enum BusError {
    #[error("bus closed")]
    Closed,

    #[error("no subscription {id} on topic '{topic}'")]
    NotSubscribed { topic: String, id: String },

    #[error("ack for message {0} could not be delivered")]
    AckFailed(String),
}

impl From<BusError> for WorkflowError {
    fn from(err: BusError) -> Self {
        WorkflowError::Bus(err.to_string())
    }
}
