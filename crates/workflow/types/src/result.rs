//! Step results: the outcome record of one step execution

use crate::ErrorCategory;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Discriminant of a [`StepResult`]
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum StepStatus {
    Running,
    Success,
    Failed,
    Suspended,
    Waiting,
    Skipped,
}

impl std::fmt::Display for StepStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            StepStatus::Running => write!(f, "running"),
            StepStatus::Success => write!(f, "success"),
            StepStatus::Failed => write!(f, "failed"),
            StepStatus::Suspended => write!(f, "suspended"),
            StepStatus::Waiting => write!(f, "waiting"),
            StepStatus::Skipped => write!(f, "skipped"),
        }
    }
}

/// Recovery marker stamped onto a suspended result
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SuspendMarker {
    pub run_id: String,
    /// Step id chain from the outermost run down to the suspended leaf
    pub path: Vec<String>,
}

/// Error captured from a failed step
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StepFailure {
    pub message: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub stack: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub category: Option<ErrorCategory>,
}

impl StepFailure {
    pub fn new(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
            stack: None,
            category: None,
        }
    }

    /// Capture an error, recording its source chain as the stack
    pub fn from_error(err: &(dyn std::error::Error + 'static)) -> Self {
        let mut chain = Vec::new();
        let mut source = err.source();
        while let Some(cause) = source {
            chain.push(cause.to_string());
            source = cause.source();
        }
        Self {
            message: err.to_string(),
            stack: if chain.is_empty() {
                None
            } else {
                Some(chain.join("\ncaused by: "))
            },
            category: None,
        }
    }

    pub fn with_category(mut self, category: ErrorCategory) -> Self {
        self.category = Some(category);
        self
    }
}

impl std::fmt::Display for StepFailure {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.message)
    }
}

/// State of one foreach iteration slot
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(tag = "state", content = "value", rename_all = "lowercase")]
pub enum SlotState {
    Pending,
    Suspended(Value),
    Complete(Value),
}

impl SlotState {
    pub fn is_complete(&self) -> bool {
        matches!(self, SlotState::Complete(_))
    }
}

/// Outcome of one step execution
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(
    tag = "status",
    rename_all = "lowercase",
    rename_all_fields = "camelCase"
)]
pub enum StepResult {
    Running {
        payload: Value,
        started_at: DateTime<Utc>,
        /// Iteration slots of a foreach in progress
        #[serde(default, skip_serializing_if = "Vec::is_empty")]
        slots: Vec<SlotState>,
    },
    Success {
        output: Value,
        payload: Value,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        resume_payload: Option<Value>,
        started_at: DateTime<Utc>,
        ended_at: DateTime<Utc>,
    },
    Failed {
        error: StepFailure,
        payload: Value,
        started_at: DateTime<Utc>,
        ended_at: DateTime<Utc>,
    },
    Suspended {
        payload: Value,
        suspend_payload: Value,
        marker: SuspendMarker,
        started_at: DateTime<Utc>,
        suspended_at: DateTime<Utc>,
    },
    Waiting {
        payload: Value,
        event: String,
        started_at: DateTime<Utc>,
    },
    Skipped {
        payload: Value,
        started_at: DateTime<Utc>,
    },
}

impl StepResult {
    pub fn running(payload: Value) -> Self {
        StepResult::Running {
            payload,
            started_at: Utc::now(),
            slots: Vec::new(),
        }
    }

    pub fn success(output: Value, payload: Value, started_at: DateTime<Utc>) -> Self {
        StepResult::Success {
            output,
            payload,
            resume_payload: None,
            started_at,
            ended_at: Utc::now(),
        }
    }

    pub fn failed(error: StepFailure, payload: Value, started_at: DateTime<Utc>) -> Self {
        StepResult::Failed {
            error,
            payload,
            started_at,
            ended_at: Utc::now(),
        }
    }

    pub fn skipped(payload: Value) -> Self {
        StepResult::Skipped {
            payload,
            started_at: Utc::now(),
        }
    }

    pub fn status(&self) -> StepStatus {
        match self {
            StepResult::Running { .. } => StepStatus::Running,
            StepResult::Success { .. } => StepStatus::Success,
            StepResult::Failed { .. } => StepStatus::Failed,
            StepResult::Suspended { .. } => StepStatus::Suspended,
            StepResult::Waiting { .. } => StepStatus::Waiting,
            StepResult::Skipped { .. } => StepStatus::Skipped,
        }
    }

    /// The value downstream steps receive as input
    ///
    /// A running foreach yields its slots as an array with `null` for
    /// iterations that have not completed.
    pub fn output(&self) -> Value {
        match self {
            StepResult::Success { output, .. } => output.clone(),
            StepResult::Running { slots, .. } if !slots.is_empty() => Value::Array(
                slots
                    .iter()
                    .map(|slot| match slot {
                        SlotState::Complete(value) => value.clone(),
                        _ => Value::Null,
                    })
                    .collect(),
            ),
            _ => Value::Null,
        }
    }

    /// The input the step was executed with
    pub fn payload(&self) -> &Value {
        match self {
            StepResult::Running { payload, .. }
            | StepResult::Success { payload, .. }
            | StepResult::Failed { payload, .. }
            | StepResult::Suspended { payload, .. }
            | StepResult::Waiting { payload, .. }
            | StepResult::Skipped { payload, .. } => payload,
        }
    }

    pub fn started_at(&self) -> DateTime<Utc> {
        match self {
            StepResult::Running { started_at, .. }
            | StepResult::Success { started_at, .. }
            | StepResult::Failed { started_at, .. }
            | StepResult::Suspended { started_at, .. }
            | StepResult::Waiting { started_at, .. }
            | StepResult::Skipped { started_at, .. } => *started_at,
        }
    }

    pub fn error(&self) -> Option<&StepFailure> {
        match self {
            StepResult::Failed { error, .. } => Some(error),
            _ => None,
        }
    }

    pub fn marker(&self) -> Option<&SuspendMarker> {
        match self {
            StepResult::Suspended { marker, .. } => Some(marker),
            _ => None,
        }
    }

    /// Success or skipped: counts as done for fan-in
    pub fn is_complete(&self) -> bool {
        matches!(self, StepResult::Success { .. } | StepResult::Skipped { .. })
    }

    pub fn is_terminal(&self) -> bool {
        !matches!(self, StepResult::Running { .. } | StepResult::Waiting { .. })
    }

    /// Whether two records describe the same execution outcome
    pub fn same_execution(&self, other: &StepResult) -> bool {
        self.status() == other.status() && self.started_at() == other.started_at()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_status_tag_and_camel_case_fields() {
        let result = StepResult::success(json!(2), json!(1), Utc::now());
        let value = serde_json::to_value(&result).unwrap();
        assert_eq!(value["status"], "success");
        assert!(value.get("startedAt").is_some());
        assert!(value.get("resumePayload").is_none());

        let back: StepResult = serde_json::from_value(value).unwrap();
        assert_eq!(back, result);
    }

    #[test]
    fn test_running_foreach_output() {
        let result = StepResult::Running {
            payload: json!([1, 2, 3]),
            started_at: Utc::now(),
            slots: vec![
                SlotState::Complete(json!(10)),
                SlotState::Pending,
                SlotState::Suspended(json!({"reason": "x"})),
            ],
        };
        assert_eq!(result.output(), json!([10, null, null]));
    }

    #[test]
    fn test_same_execution() {
        let started = Utc::now();
        let a = StepResult::success(json!(1), json!(0), started);
        let b = StepResult::success(json!(2), json!(0), started);
        let c = StepResult::failed(StepFailure::new("boom"), json!(0), started);
        assert!(a.same_execution(&b));
        assert!(!a.same_execution(&c));
    }

    #[derive(Debug, thiserror::Error)]
    #[error("outer")]
    struct Outer(#[source] Inner);

    #[derive(Debug, thiserror::Error)]
    #[error("inner")]
    struct Inner;

    #[test]
    fn test_failure_captures_source_chain() {
        let failure = StepFailure::from_error(&Outer(Inner));
        assert_eq!(failure.message, "outer");
        assert_eq!(failure.stack.as_deref(), Some("inner"));
    }
}
