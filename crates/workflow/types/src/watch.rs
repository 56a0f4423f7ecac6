//! Watch events: best-effort live notifications about a run

use crate::{RunStatus, StepResult, StepStatus};
use serde::{Deserialize, Serialize};
use serde_json::Value;

/// What a step is waiting on
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "lowercase")]
pub enum WaitKind {
    Timer { ms: u64 },
    Event { name: String },
}

/// Notification published on a run's watch topics
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(
    tag = "type",
    rename_all = "kebab-case",
    rename_all_fields = "camelCase"
)]
pub enum WatchEvent {
    WorkflowStart {
        run_id: String,
        workflow_id: String,
    },
    StepStart {
        run_id: String,
        step_id: String,
        payload: Value,
    },
    StepResult {
        run_id: String,
        step_id: String,
        result: StepResult,
    },
    StepSuspended {
        run_id: String,
        step_id: String,
        suspend_payload: Value,
    },
    StepWaiting {
        run_id: String,
        step_id: String,
        wait: WaitKind,
    },
    StepFinish {
        run_id: String,
        step_id: String,
    },
    WorkflowFinish {
        run_id: String,
        status: RunStatus,
    },
    /// Emitted by a step body
    Custom {
        run_id: String,
        step_id: String,
        name: String,
        data: Value,
    },
    /// Condensed form published on the v1 topic
    StateChange {
        run_id: String,
        current_step: Option<String>,
        status: StepStatus,
        run_status: RunStatus,
    },
}

impl WatchEvent {
    pub fn run_id(&self) -> &str {
        match self {
            WatchEvent::WorkflowStart { run_id, .. }
            | WatchEvent::StepStart { run_id, .. }
            | WatchEvent::StepResult { run_id, .. }
            | WatchEvent::StepSuspended { run_id, .. }
            | WatchEvent::StepWaiting { run_id, .. }
            | WatchEvent::StepFinish { run_id, .. }
            | WatchEvent::WorkflowFinish { run_id, .. }
            | WatchEvent::Custom { run_id, .. }
            | WatchEvent::StateChange { run_id, .. } => run_id,
        }
    }

    /// The v1 state change this event implies, if any
    pub fn state_change(&self) -> Option<WatchEvent> {
        let (step, status, run_status) = match self {
            WatchEvent::StepStart { step_id, .. } => {
                (Some(step_id.clone()), StepStatus::Running, RunStatus::Running)
            }
            WatchEvent::StepResult {
                step_id, result, ..
            } => (Some(step_id.clone()), result.status(), RunStatus::Running),
            WatchEvent::StepSuspended { step_id, .. } => (
                Some(step_id.clone()),
                StepStatus::Suspended,
                RunStatus::Suspended,
            ),
            WatchEvent::StepWaiting { step_id, .. } => {
                (Some(step_id.clone()), StepStatus::Waiting, RunStatus::Waiting)
            }
            WatchEvent::WorkflowFinish { status, .. } => {
                let step_status = match status {
                    RunStatus::Success => StepStatus::Success,
                    RunStatus::Suspended => StepStatus::Suspended,
                    _ => StepStatus::Failed,
                };
                (None, step_status, *status)
            }
            _ => return None,
        };
        Some(WatchEvent::StateChange {
            run_id: self.run_id().to_string(),
            current_step: step,
            status,
            run_status,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_kebab_case_tags() {
        let event = WatchEvent::StepWaiting {
            run_id: "r".into(),
            step_id: "sleep.1".into(),
            wait: WaitKind::Timer { ms: 50 },
        };
        let value = serde_json::to_value(&event).unwrap();
        assert_eq!(value["type"], "step-waiting");
        assert_eq!(value["stepId"], "sleep.1");
        assert_eq!(value["wait"], json!({"kind": "timer", "ms": 50}));
    }

    #[test]
    fn test_state_change_projection() {
        let start = WatchEvent::StepStart {
            run_id: "r".into(),
            step_id: "a".into(),
            payload: json!(1),
        };
        match start.state_change() {
            Some(WatchEvent::StateChange {
                current_step,
                status,
                ..
            }) => {
                assert_eq!(current_step.as_deref(), Some("a"));
                assert_eq!(status, StepStatus::Running);
            }
            other => panic!("unexpected {:?}", other),
        }

        let custom = WatchEvent::Custom {
            run_id: "r".into(),
            step_id: "a".into(),
            name: "progress".into(),
            data: json!(0.5),
        };
        assert!(custom.state_change().is_none());
    }
}
