//! Lifecycle events: the messages that drive a run forward
//!
//! Every transition of a run is triggered by exactly one event. Each
//! variant carries only the fields its transition needs; retry and loop
//! counters travel inside the event rather than in processor state.

use crate::{ExecutionPath, ParentWorkflow, StepResult};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::{BTreeMap, BTreeSet};

/// Topic carrying every lifecycle event
pub const WORKFLOWS_TOPIC: &str = "workflows";

/// Topic carrying terminal events for execution engine subscribers
pub const FINISH_TOPIC: &str = "workflows-finish";

/// Per-run topic for state-change notifications
pub fn watch_topic(run_id: &str) -> String {
    format!("workflow.events.{}", run_id)
}

/// Per-run topic for detailed watch events
pub fn watch_topic_v2(run_id: &str) -> String {
    format!("workflow.events.v2.{}", run_id)
}

/// Envelope of a lifecycle event
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct WorkflowEvent {
    pub id: String,
    pub run_id: String,
    pub emitted_at: DateTime<Utc>,
    pub event: LifecycleEvent,
}

impl WorkflowEvent {
    pub fn new(run_id: impl Into<String>, event: LifecycleEvent) -> Self {
        Self {
            id: uuid::Uuid::new_v4().to_string(),
            run_id: run_id.into(),
            emitted_at: Utc::now(),
            event,
        }
    }

    pub fn event_type(&self) -> String {
        self.event.event_type()
    }

    pub fn workflow_id(&self) -> &str {
        self.event.workflow_id()
    }

    /// Whether this event finishes a run
    pub fn is_terminal(&self) -> bool {
        matches!(
            self.event,
            LifecycleEvent::Suspend(_) | LifecycleEvent::Fail(_) | LifecycleEvent::End(_)
        )
    }
}

/// One lifecycle transition
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", content = "data")]
pub enum LifecycleEvent {
    #[serde(rename = "workflow.start")]
    Start(StartData),
    #[serde(rename = "workflow.resume")]
    Resume(ResumeData),
    #[serde(rename = "workflow.step.run")]
    StepRun(StepRunData),
    #[serde(rename = "workflow.step.end")]
    StepEnd(StepEndData),
    #[serde(rename = "workflow.suspend")]
    Suspend(TerminalData),
    #[serde(rename = "workflow.fail")]
    Fail(TerminalData),
    #[serde(rename = "workflow.end")]
    End(TerminalData),
    #[serde(rename = "workflow.cancel")]
    Cancel(CancelData),
    #[serde(rename = "workflow.user-event")]
    UserEvent(UserEventData),
}

impl LifecycleEvent {
    /// Event type name, e.g. `workflow.step.run` or `workflow.user-event.approved`
    pub fn event_type(&self) -> String {
        match self {
            LifecycleEvent::Start(_) => "workflow.start".to_string(),
            LifecycleEvent::Resume(_) => "workflow.resume".to_string(),
            LifecycleEvent::StepRun(_) => "workflow.step.run".to_string(),
            LifecycleEvent::StepEnd(_) => "workflow.step.end".to_string(),
            LifecycleEvent::Suspend(_) => "workflow.suspend".to_string(),
            LifecycleEvent::Fail(_) => "workflow.fail".to_string(),
            LifecycleEvent::End(_) => "workflow.end".to_string(),
            LifecycleEvent::Cancel(_) => "workflow.cancel".to_string(),
            LifecycleEvent::UserEvent(data) => format!("workflow.user-event.{}", data.name),
        }
    }

    pub fn workflow_id(&self) -> &str {
        match self {
            LifecycleEvent::Start(data) => &data.workflow_id,
            LifecycleEvent::Resume(data) => &data.workflow_id,
            LifecycleEvent::StepRun(data) => &data.workflow_id,
            LifecycleEvent::StepEnd(data) => &data.workflow_id,
            LifecycleEvent::Suspend(data)
            | LifecycleEvent::Fail(data)
            | LifecycleEvent::End(data) => &data.workflow_id,
            LifecycleEvent::Cancel(data) => &data.workflow_id,
            LifecycleEvent::UserEvent(data) => &data.workflow_id,
        }
    }

    pub fn parent(&self) -> Option<&ParentWorkflow> {
        match self {
            LifecycleEvent::Start(data) => data.parent.as_ref(),
            LifecycleEvent::Resume(data) => data.parent.as_ref(),
            LifecycleEvent::StepRun(data) => data.parent.as_ref(),
            LifecycleEvent::StepEnd(data) => data.parent.as_ref(),
            LifecycleEvent::Suspend(data)
            | LifecycleEvent::Fail(data)
            | LifecycleEvent::End(data) => data.parent.as_ref(),
            LifecycleEvent::Cancel(_) | LifecycleEvent::UserEvent(_) => None,
        }
    }
}

/// Which step(s) a resume targets and the data handed to them
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ResumeTarget {
    /// Step id chain, outermost first
    pub steps: Vec<String>,
    #[serde(default)]
    pub resume_payload: Value,
}

impl ResumeTarget {
    /// Whether the resume addresses `step_id` in this run
    pub fn targets(&self, step_id: &str) -> bool {
        self.steps.first().map(String::as_str) == Some(step_id)
    }

    /// The part of the target addressing a nested run
    pub fn nested(&self) -> ResumeTarget {
        ResumeTarget {
            steps: self.steps.iter().skip(1).cloned().collect(),
            resume_payload: self.resume_payload.clone(),
        }
    }
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StartData {
    pub workflow_id: String,
    /// Fresh per start request; redeliveries carry the same id
    #[serde(default)]
    pub start_id: String,
    pub input: Value,
    #[serde(default)]
    pub runtime_context: BTreeMap<String, Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub parent: Option<ParentWorkflow>,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ResumeData {
    pub workflow_id: String,
    pub execution_path: ExecutionPath,
    pub resume: ResumeTarget,
    #[serde(default)]
    pub step_results: BTreeMap<String, StepResult>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub parent: Option<ParentWorkflow>,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StepRunData {
    pub workflow_id: String,
    pub execution_path: ExecutionPath,
    #[serde(default)]
    pub step_results: BTreeMap<String, StepResult>,
    #[serde(default)]
    pub active_steps: BTreeSet<String>,
    pub input: Value,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub resume: Option<ResumeTarget>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub parent: Option<ParentWorkflow>,
    /// Executions of this node so far, retries and loop iterations included
    #[serde(default)]
    pub run_count: u32,
    /// Failed attempts of the current iteration
    #[serde(default)]
    pub attempt: u32,
    /// Completed loop iterations
    #[serde(default)]
    pub iteration: u32,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StepEndData {
    pub workflow_id: String,
    pub execution_path: ExecutionPath,
    #[serde(default)]
    pub step_results: BTreeMap<String, StepResult>,
    #[serde(default)]
    pub active_steps: BTreeSet<String>,
    pub result: StepResult,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub parent: Option<ParentWorkflow>,
    #[serde(default)]
    pub run_count: u32,
    #[serde(default)]
    pub iteration: u32,
}

/// Payload of `workflow.suspend`, `workflow.fail` and `workflow.end`
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TerminalData {
    pub workflow_id: String,
    pub execution_path: ExecutionPath,
    #[serde(default)]
    pub step_results: BTreeMap<String, StepResult>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub result: Option<StepResult>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub parent: Option<ParentWorkflow>,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CancelData {
    pub workflow_id: String,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct UserEventData {
    pub workflow_id: String,
    pub name: String,
    #[serde(default)]
    pub payload: Value,
}
