//! Serialized step graphs
//!
//! The data-only form of a workflow's structure. It is stored with every
//! run snapshot so a run can be inspected (and its paths resolved) without
//! access to the step functions that built it.

use crate::{ExecutionPath, WorkflowError, WorkflowResult};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

// ── Loop & Retry Settings ────────────────────────────────────────────

/// Loop continuation mode
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum LoopType {
    /// Re-run while the predicate holds
    #[serde(rename = "dowhile")]
    DoWhile,
    /// Re-run until the predicate holds
    #[serde(rename = "dountil")]
    DoUntil,
}

impl LoopType {
    /// Whether another iteration should run given the predicate outcome
    pub fn should_continue(&self, predicate: bool) -> bool {
        match self {
            LoopType::DoWhile => predicate,
            LoopType::DoUntil => !predicate,
        }
    }
}

/// Retry policy for a step or a whole workflow
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RetryConfig {
    /// Total number of executions allowed, including the first
    pub attempts: u32,
    /// Delay between two attempts in milliseconds
    #[serde(default)]
    pub delay_ms: u64,
}

impl RetryConfig {
    pub fn new(attempts: u32) -> Self {
        Self {
            attempts: attempts.max(1),
            delay_ms: 0,
        }
    }

    pub fn with_delay_ms(mut self, delay_ms: u64) -> Self {
        self.delay_ms = delay_ms;
        self
    }

    /// Whether a failure on 0-based `attempt` may be retried
    pub fn allows_retry(&self, attempt: u32) -> bool {
        attempt.saturating_add(1) < self.attempts
    }
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self::new(1)
    }
}

// ── Serialized Graph ─────────────────────────────────────────────────

/// What kind of body a step carries
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum StepComponent {
    Step,
    Workflow,
}

/// A leaf step (or nested workflow used as a step)
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SerializedStep {
    pub id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    pub component: StepComponent,
    /// Graph of the nested workflow, for `component == workflow`
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub graph: Option<Vec<SerializedStepFlowEntry>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub retry: Option<RetryConfig>,
}

/// One node of a serialized workflow graph
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "camelCase", rename_all_fields = "camelCase")]
pub enum SerializedStepFlowEntry {
    Step {
        step: SerializedStep,
    },
    Sleep {
        id: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        duration: Option<u64>,
        has_fn: bool,
    },
    SleepUntil {
        id: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        date: Option<DateTime<Utc>>,
        has_fn: bool,
    },
    WaitForEvent {
        event: String,
        step: SerializedStep,
    },
    Parallel {
        id: String,
        steps: Vec<SerializedStep>,
    },
    Conditional {
        id: String,
        steps: Vec<SerializedStep>,
        condition_count: usize,
    },
    Loop {
        step: SerializedStep,
        loop_type: LoopType,
    },
    Foreach {
        step: SerializedStep,
        concurrency: usize,
    },
}

impl SerializedStepFlowEntry {
    /// Id under which this entry's result is recorded
    pub fn id(&self) -> &str {
        match self {
            SerializedStepFlowEntry::Step { step }
            | SerializedStepFlowEntry::WaitForEvent { step, .. }
            | SerializedStepFlowEntry::Loop { step, .. }
            | SerializedStepFlowEntry::Foreach { step, .. } => &step.id,
            SerializedStepFlowEntry::Sleep { id, .. }
            | SerializedStepFlowEntry::SleepUntil { id, .. }
            | SerializedStepFlowEntry::Parallel { id, .. }
            | SerializedStepFlowEntry::Conditional { id, .. } => id,
        }
    }

    /// Node kind as it appears in the `type` tag
    pub fn kind(&self) -> &'static str {
        match self {
            SerializedStepFlowEntry::Step { .. } => "step",
            SerializedStepFlowEntry::Sleep { .. } => "sleep",
            SerializedStepFlowEntry::SleepUntil { .. } => "sleepUntil",
            SerializedStepFlowEntry::WaitForEvent { .. } => "waitForEvent",
            SerializedStepFlowEntry::Parallel { .. } => "parallel",
            SerializedStepFlowEntry::Conditional { .. } => "conditional",
            SerializedStepFlowEntry::Loop { .. } => "loop",
            SerializedStepFlowEntry::Foreach { .. } => "foreach",
        }
    }

    /// The step a second path index selects, if any
    fn child(&self, index: usize) -> Option<&SerializedStep> {
        match self {
            SerializedStepFlowEntry::Parallel { steps, .. }
            | SerializedStepFlowEntry::Conditional { steps, .. } => steps.get(index),
            SerializedStepFlowEntry::Foreach { step, .. } => Some(step),
            _ => None,
        }
    }

    /// The step a nested path continues into, if any
    fn single_step(&self) -> Option<&SerializedStep> {
        match self {
            SerializedStepFlowEntry::Step { step }
            | SerializedStepFlowEntry::Loop { step, .. }
            | SerializedStepFlowEntry::WaitForEvent { step, .. } => Some(step),
            _ => None,
        }
    }
}

/// A node located by an execution path in a serialized graph
#[derive(Clone, Copy, Debug)]
pub enum SerializedNode<'a> {
    /// A top-level entry
    Entry(&'a SerializedStepFlowEntry),
    /// A branch (or foreach slot) of a composite entry
    Branch {
        entry: &'a SerializedStepFlowEntry,
        index: usize,
        step: &'a SerializedStep,
    },
}

/// Resolve `path` against `graph`, descending into nested workflows
pub fn resolve_serialized<'a>(
    graph: &'a [SerializedStepFlowEntry],
    path: &ExecutionPath,
) -> WorkflowResult<SerializedNode<'a>> {
    let indices = path.as_slice();
    let top = *indices.first().ok_or(WorkflowError::EmptyExecutionPath)?;
    let entry = graph
        .get(top)
        .ok_or_else(|| WorkflowError::StepMissingAtPath(path.clone()))?;

    if indices.len() == 1 {
        return Ok(SerializedNode::Entry(entry));
    }

    if let Some(step) = entry.child(indices[1]) {
        if indices.len() == 2 {
            return Ok(SerializedNode::Branch {
                entry,
                index: indices[1],
                step,
            });
        }
        return descend(step, &path.tail(2), path);
    }

    match entry.single_step() {
        Some(step) => descend(step, &path.tail(1), path),
        None => Err(WorkflowError::StepMissingAtPath(path.clone())),
    }
}

fn descend<'a>(
    step: &'a SerializedStep,
    rest: &ExecutionPath,
    full: &ExecutionPath,
) -> WorkflowResult<SerializedNode<'a>> {
    match &step.graph {
        Some(nested) => resolve_serialized(nested, rest)
            .map_err(|_| WorkflowError::StepMissingAtPath(full.clone())),
        None => Err(WorkflowError::StepMissingAtPath(full.clone())),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn leaf(id: &str) -> SerializedStep {
        SerializedStep {
            id: id.to_string(),
            description: None,
            component: StepComponent::Step,
            graph: None,
            retry: None,
        }
    }

    fn sample() -> Vec<SerializedStepFlowEntry> {
        let nested = SerializedStep {
            id: "inner".into(),
            description: None,
            component: StepComponent::Workflow,
            graph: Some(vec![
                SerializedStepFlowEntry::Step { step: leaf("x") },
                SerializedStepFlowEntry::Parallel {
                    id: "parallel.1".into(),
                    steps: vec![leaf("y"), leaf("z")],
                },
            ]),
            retry: None,
        };
        vec![
            SerializedStepFlowEntry::Step { step: leaf("a") },
            SerializedStepFlowEntry::Parallel {
                id: "parallel.1".into(),
                steps: vec![leaf("b"), leaf("c")],
            },
            SerializedStepFlowEntry::Step { step: nested },
        ]
    }

    #[test]
    fn test_resolve_top_level_and_branch() {
        let graph = sample();
        match resolve_serialized(&graph, &ExecutionPath::top_level(0)).unwrap() {
            SerializedNode::Entry(entry) => assert_eq!(entry.id(), "a"),
            other => panic!("unexpected {:?}", other),
        }
        match resolve_serialized(&graph, &ExecutionPath::new(vec![1, 1])).unwrap() {
            SerializedNode::Branch { step, index, .. } => {
                assert_eq!(step.id, "c");
                assert_eq!(index, 1);
            }
            other => panic!("unexpected {:?}", other),
        }
    }

    #[test]
    fn test_resolve_into_nested_workflow() {
        let graph = sample();
        match resolve_serialized(&graph, &ExecutionPath::new(vec![2, 1, 0])).unwrap() {
            SerializedNode::Branch { step, .. } => assert_eq!(step.id, "y"),
            other => panic!("unexpected {:?}", other),
        }
    }

    #[test]
    fn test_resolve_errors() {
        let graph = sample();
        assert!(matches!(
            resolve_serialized(&graph, &ExecutionPath::default()),
            Err(WorkflowError::EmptyExecutionPath)
        ));
        assert!(matches!(
            resolve_serialized(&graph, &ExecutionPath::top_level(9)),
            Err(WorkflowError::StepMissingAtPath(_))
        ));
        assert!(matches!(
            resolve_serialized(&graph, &ExecutionPath::new(vec![0, 0])),
            Err(WorkflowError::StepMissingAtPath(_))
        ));
    }

    #[test]
    fn test_entry_tagging() {
        let entry = SerializedStepFlowEntry::Sleep {
            id: "sleep.0".into(),
            duration: Some(10),
            has_fn: false,
        };
        let json = serde_json::to_value(&entry).unwrap();
        assert_eq!(json["type"], "sleep");
        assert_eq!(json["hasFn"], false);

        let lp = SerializedStepFlowEntry::Loop {
            step: leaf("b"),
            loop_type: LoopType::DoUntil,
        };
        let json = serde_json::to_value(&lp).unwrap();
        assert_eq!(json["type"], "loop");
        assert_eq!(json["loopType"], "dountil");
    }

    #[test]
    fn test_retry_budget() {
        let retry = RetryConfig::new(3);
        assert!(retry.allows_retry(0));
        assert!(retry.allows_retry(1));
        assert!(!retry.allows_retry(2));
        assert!(!RetryConfig::default().allows_retry(0));
    }
}
