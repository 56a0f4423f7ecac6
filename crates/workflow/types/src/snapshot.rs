//! Run snapshots and the atomic patches applied to them
//!
//! A [`WorkflowRunState`] is the only state that survives between two
//! lifecycle events. Stores apply [`RunStateUpdate`] and [`ResultPatch`]
//! values under a per-run lock so concurrent branch completions cannot
//! clobber each other.

use crate::{ExecutionPath, SerializedStepFlowEntry, SlotState, StepFailure, StepResult};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::BTreeMap;

// ── Run Status ───────────────────────────────────────────────────────

/// Lifecycle status of a run
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RunStatus {
    Pending,
    Running,
    Suspended,
    Waiting,
    Success,
    Failed,
    Canceled,
}

impl RunStatus {
    /// Whether the run can make no further progress on its own
    pub fn is_finished(&self) -> bool {
        matches!(
            self,
            RunStatus::Success | RunStatus::Failed | RunStatus::Canceled
        )
    }
}

impl std::fmt::Display for RunStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            RunStatus::Pending => write!(f, "pending"),
            RunStatus::Running => write!(f, "running"),
            RunStatus::Suspended => write!(f, "suspended"),
            RunStatus::Waiting => write!(f, "waiting"),
            RunStatus::Success => write!(f, "success"),
            RunStatus::Failed => write!(f, "failed"),
            RunStatus::Canceled => write!(f, "canceled"),
        }
    }
}

// ── Parent Linkage ───────────────────────────────────────────────────

/// Links a nested run back to the step of the run that started it
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ParentWorkflow {
    pub workflow_id: String,
    pub run_id: String,
    pub execution_path: ExecutionPath,
    pub step_id: String,
    /// Outer step results at the time the nested run was started
    pub step_results: BTreeMap<String, StepResult>,
    pub run_count: u32,
    pub attempt: u32,
    pub iteration: u32,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub parent: Option<Box<ParentWorkflow>>,
}

impl ParentWorkflow {
    /// Number of enclosing runs, this one included
    pub fn depth(&self) -> usize {
        1 + self.parent.as_ref().map_or(0, |p| p.depth())
    }
}

// ── Snapshot ─────────────────────────────────────────────────────────

/// Durable record of one run
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct WorkflowRunState {
    pub run_id: String,
    pub workflow_name: String,
    pub status: RunStatus,
    pub input: Value,
    /// Latest result per step id
    pub context: BTreeMap<String, StepResult>,
    pub serialized_step_graph: Vec<SerializedStepFlowEntry>,
    /// Step id → path to resume from
    pub suspended_paths: BTreeMap<String, ExecutionPath>,
    /// External event name → path of the gate waiting on it
    pub waiting_paths: BTreeMap<String, ExecutionPath>,
    pub runtime_context: BTreeMap<String, Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub result: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<StepFailure>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub parent: Option<ParentWorkflow>,
    /// Id of the `workflow.start` that produced this run state
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub start_id: Option<String>,
    pub created_at: DateTime<Utc>,
    pub timestamp: DateTime<Utc>,
}

impl WorkflowRunState {
    /// Create a pending snapshot for a new run
    pub fn new(
        workflow_name: impl Into<String>,
        run_id: impl Into<String>,
        serialized_step_graph: Vec<SerializedStepFlowEntry>,
        input: Value,
    ) -> Self {
        let now = Utc::now();
        Self {
            run_id: run_id.into(),
            workflow_name: workflow_name.into(),
            status: RunStatus::Pending,
            input,
            context: BTreeMap::new(),
            serialized_step_graph,
            suspended_paths: BTreeMap::new(),
            waiting_paths: BTreeMap::new(),
            runtime_context: BTreeMap::new(),
            result: None,
            error: None,
            parent: None,
            start_id: None,
            created_at: now,
            timestamp: now,
        }
    }

    pub fn with_runtime_context(mut self, runtime_context: BTreeMap<String, Value>) -> Self {
        self.runtime_context = runtime_context;
        self
    }

    pub fn with_parent(mut self, parent: Option<ParentWorkflow>) -> Self {
        self.parent = parent;
        self
    }

    pub fn with_start_id(mut self, start_id: impl Into<String>) -> Self {
        self.start_id = Some(start_id.into());
        self
    }

    /// Whether `start_id` already produced this state
    pub fn started_by(&self, start_id: &str) -> bool {
        !start_id.is_empty() && self.start_id.as_deref() == Some(start_id)
    }

    pub fn with_status(mut self, status: RunStatus) -> Self {
        self.status = status;
        self
    }

    /// Step id chains of every suspended step, outermost id first
    pub fn suspended_chains(&self) -> Vec<Vec<String>> {
        self.suspended_paths
            .keys()
            .map(|step_id| match self.context.get(step_id).and_then(|r| r.marker()) {
                Some(marker) if !marker.path.is_empty() => marker.path.clone(),
                _ => vec![step_id.clone()],
            })
            .collect()
    }

    /// Apply a result patch, reporting whether the snapshot changed
    pub fn apply_result(&mut self, step_id: &str, patch: ResultPatch) -> PatchOutcome {
        let outcome = match patch {
            ResultPatch::Replace(result) => match self.context.get(step_id) {
                Some(existing) if existing.same_execution(&result) => PatchOutcome::unchanged(),
                _ => {
                    self.context.insert(step_id.to_string(), result);
                    PatchOutcome::applied()
                }
            },
            ResultPatch::ForeachStart { payload, initial } => {
                match self.context.get(step_id) {
                    Some(StepResult::Running { slots, .. }) if !slots.is_empty() => {
                        PatchOutcome::unchanged()
                    }
                    _ => {
                        self.context.insert(
                            step_id.to_string(),
                            StepResult::Running {
                                payload,
                                started_at: Utc::now(),
                                slots: vec![SlotState::Pending; initial],
                            },
                        );
                        PatchOutcome::applied()
                    }
                }
            }
            ResultPatch::ForeachSlot { index, result } => match self.context.get_mut(step_id) {
                Some(StepResult::Running { slots, .. }) => match slots.get_mut(index) {
                    Some(slot) if !slot.is_complete() => {
                        *slot = match result {
                            StepResult::Suspended {
                                suspend_payload, ..
                            } => SlotState::Suspended(suspend_payload),
                            StepResult::Success { output, .. } => SlotState::Complete(output),
                            StepResult::Skipped { .. } => SlotState::Complete(Value::Null),
                            _ => SlotState::Pending,
                        };
                        PatchOutcome::applied()
                    }
                    _ => PatchOutcome::unchanged(),
                },
                _ => PatchOutcome::unchanged(),
            },
            ResultPatch::ForeachDispatch { total } => match self.context.get_mut(step_id) {
                Some(StepResult::Running { slots, .. }) if slots.len() < total => {
                    slots.push(SlotState::Pending);
                    PatchOutcome {
                        applied: true,
                        slot: Some(slots.len() - 1),
                    }
                }
                _ => PatchOutcome::unchanged(),
            },
        };
        if outcome.applied {
            self.timestamp = Utc::now();
        }
        outcome
    }
}

// ── Patches ──────────────────────────────────────────────────────────

/// Partial update of a run's status and path bookkeeping
#[derive(Clone, Debug, Default, PartialEq)]
pub struct RunStateUpdate {
    pub status: Option<RunStatus>,
    pub result: Option<Value>,
    pub error: Option<StepFailure>,
    /// Record a suspended step id and the path it resumes from
    pub suspend: Option<(String, ExecutionPath)>,
    pub remove_suspended: Vec<String>,
    /// Record an external event name and the gate waiting on it
    pub wait: Option<(String, ExecutionPath)>,
    pub clear_waiting: Option<String>,
}

impl RunStateUpdate {
    pub fn status(status: RunStatus) -> Self {
        Self {
            status: Some(status),
            ..Default::default()
        }
    }

    pub fn with_result(mut self, result: Value) -> Self {
        self.result = Some(result);
        self
    }

    pub fn with_error(mut self, error: StepFailure) -> Self {
        self.error = Some(error);
        self
    }

    pub fn with_suspended(mut self, step_id: impl Into<String>, path: ExecutionPath) -> Self {
        self.suspend = Some((step_id.into(), path));
        self
    }

    pub fn without_suspended(mut self, step_id: impl Into<String>) -> Self {
        self.remove_suspended.push(step_id.into());
        self
    }

    pub fn with_waiting(mut self, event: impl Into<String>, path: ExecutionPath) -> Self {
        self.wait = Some((event.into(), path));
        self
    }

    pub fn without_waiting(mut self, event: impl Into<String>) -> Self {
        self.clear_waiting = Some(event.into());
        self
    }

    /// Apply to a snapshot in place
    pub fn apply(self, state: &mut WorkflowRunState) {
        if let Some(status) = self.status {
            state.status = status;
        }
        if let Some(result) = self.result {
            state.result = Some(result);
        }
        if let Some(error) = self.error {
            state.error = Some(error);
        }
        for step_id in self.remove_suspended {
            state.suspended_paths.remove(&step_id);
        }
        if let Some((step_id, path)) = self.suspend {
            state.suspended_paths.insert(step_id, path);
        }
        if let Some(event) = self.clear_waiting {
            state.waiting_paths.remove(&event);
        }
        if let Some((event, path)) = self.wait {
            state.waiting_paths.insert(event, path);
        }
        state.timestamp = Utc::now();
    }
}

/// Change to one entry of a run's result map
#[derive(Clone, Debug, PartialEq)]
pub enum ResultPatch {
    /// Store a result unless it duplicates the stored execution
    Replace(StepResult),
    /// Create a running foreach with `initial` pending slots
    ForeachStart { payload: Value, initial: usize },
    /// Record the outcome of one foreach slot
    ForeachSlot { index: usize, result: StepResult },
    /// Open one more slot while fewer than `total` are open
    ForeachDispatch { total: usize },
}

/// What a result patch did
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct PatchOutcome {
    pub applied: bool,
    /// Slot opened by a foreach dispatch
    pub slot: Option<usize>,
}

impl PatchOutcome {
    pub fn applied() -> Self {
        Self {
            applied: true,
            slot: None,
        }
    }

    pub fn unchanged() -> Self {
        Self::default()
    }
}

/// Result map after a patch, together with the patch outcome
#[derive(Clone, Debug, PartialEq)]
pub struct ResultsUpdate {
    pub context: BTreeMap<String, StepResult>,
    pub outcome: PatchOutcome,
}

/// Summary row for run listings
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RunSummary {
    pub run_id: String,
    pub workflow_name: String,
    pub status: RunStatus,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl From<&WorkflowRunState> for RunSummary {
    fn from(state: &WorkflowRunState) -> Self {
        Self {
            run_id: state.run_id.clone(),
            workflow_name: state.workflow_name.clone(),
            status: state.status,
            created_at: state.created_at,
            updated_at: state.timestamp,
        }
    }
}
