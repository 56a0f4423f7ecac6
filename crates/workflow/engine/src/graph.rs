//! Executable step graphs and the workflow builder
//!
//! A [`Workflow`] is an ordered list of [`StepFlowEntry`] values. Entries
//! hold the live step functions and predicates; [`Workflow::serialize`]
//! produces the data-only form stored with each run.

use chrono::{DateTime, Utc};
use serde_json::Value;
use std::collections::HashSet;
use std::future::Future;
use std::sync::Arc;
use workflow_types::{
    ExecutionPath, LoopType, RetryConfig, SerializedStepFlowEntry, WorkflowError, WorkflowResult,
};

use crate::step::{Condition, SleepFn, SleepUntilFn, Step, StepContext, StepError};

// ── Timers ───────────────────────────────────────────────────────────

/// Duration of a `sleep` entry
#[derive(Clone)]
pub enum SleepDuration {
    Fixed(u64),
    Dynamic(Arc<dyn SleepFn>),
}

/// End instant of a `sleepUntil` entry
#[derive(Clone)]
pub enum SleepDate {
    Fixed(DateTime<Utc>),
    Dynamic(Arc<dyn SleepUntilFn>),
}

// ── Step Flow Entries ────────────────────────────────────────────────

/// One node of an executable workflow graph
#[derive(Clone)]
pub enum StepFlowEntry {
    Step(Step),
    Sleep {
        id: String,
        duration: SleepDuration,
    },
    SleepUntil {
        id: String,
        date: SleepDate,
    },
    WaitForEvent {
        event: String,
        step: Step,
    },
    Parallel {
        id: String,
        steps: Vec<Step>,
    },
    Conditional {
        id: String,
        steps: Vec<Step>,
        conditions: Vec<Arc<dyn Condition>>,
    },
    Loop {
        step: Step,
        condition: Arc<dyn Condition>,
        loop_type: LoopType,
    },
    Foreach {
        step: Step,
        concurrency: usize,
    },
}

impl StepFlowEntry {
    /// Id under which this entry's result is recorded
    pub fn id(&self) -> &str {
        match self {
            StepFlowEntry::Step(step)
            | StepFlowEntry::WaitForEvent { step, .. }
            | StepFlowEntry::Loop { step, .. }
            | StepFlowEntry::Foreach { step, .. } => &step.id,
            StepFlowEntry::Sleep { id, .. }
            | StepFlowEntry::SleepUntil { id, .. }
            | StepFlowEntry::Parallel { id, .. }
            | StepFlowEntry::Conditional { id, .. } => id,
        }
    }

    pub fn kind(&self) -> &'static str {
        match self {
            StepFlowEntry::Step(_) => "step",
            StepFlowEntry::Sleep { .. } => "sleep",
            StepFlowEntry::SleepUntil { .. } => "sleepUntil",
            StepFlowEntry::WaitForEvent { .. } => "waitForEvent",
            StepFlowEntry::Parallel { .. } => "parallel",
            StepFlowEntry::Conditional { .. } => "conditional",
            StepFlowEntry::Loop { .. } => "loop",
            StepFlowEntry::Foreach { .. } => "foreach",
        }
    }

    /// Branch steps of a parallel or conditional entry
    pub fn branches(&self) -> &[Step] {
        match self {
            StepFlowEntry::Parallel { steps, .. } | StepFlowEntry::Conditional { steps, .. } => {
                steps
            }
            _ => &[],
        }
    }

    /// The step a second path index selects
    fn child(&self, index: usize) -> Option<&Step> {
        match self {
            StepFlowEntry::Parallel { steps, .. } | StepFlowEntry::Conditional { steps, .. } => {
                steps.get(index)
            }
            StepFlowEntry::Foreach { step, .. } => Some(step),
            _ => None,
        }
    }

    pub(crate) fn single_step(&self) -> Option<&Step> {
        match self {
            StepFlowEntry::Step(step)
            | StepFlowEntry::Loop { step, .. }
            | StepFlowEntry::WaitForEvent { step, .. } => Some(step),
            _ => None,
        }
    }

    pub fn serialize(&self) -> SerializedStepFlowEntry {
        match self {
            StepFlowEntry::Step(step) => SerializedStepFlowEntry::Step {
                step: step.serialize(),
            },
            StepFlowEntry::Sleep { id, duration } => SerializedStepFlowEntry::Sleep {
                id: id.clone(),
                duration: match duration {
                    SleepDuration::Fixed(ms) => Some(*ms),
                    SleepDuration::Dynamic(_) => None,
                },
                has_fn: matches!(duration, SleepDuration::Dynamic(_)),
            },
            StepFlowEntry::SleepUntil { id, date } => SerializedStepFlowEntry::SleepUntil {
                id: id.clone(),
                date: match date {
                    SleepDate::Fixed(date) => Some(*date),
                    SleepDate::Dynamic(_) => None,
                },
                has_fn: matches!(date, SleepDate::Dynamic(_)),
            },
            StepFlowEntry::WaitForEvent { event, step } => SerializedStepFlowEntry::WaitForEvent {
                event: event.clone(),
                step: step.serialize(),
            },
            StepFlowEntry::Parallel { id, steps } => SerializedStepFlowEntry::Parallel {
                id: id.clone(),
                steps: steps.iter().map(Step::serialize).collect(),
            },
            StepFlowEntry::Conditional {
                id,
                steps,
                conditions,
            } => SerializedStepFlowEntry::Conditional {
                id: id.clone(),
                steps: steps.iter().map(Step::serialize).collect(),
                condition_count: conditions.len(),
            },
            StepFlowEntry::Loop {
                step, loop_type, ..
            } => SerializedStepFlowEntry::Loop {
                step: step.serialize(),
                loop_type: *loop_type,
            },
            StepFlowEntry::Foreach { step, concurrency } => SerializedStepFlowEntry::Foreach {
                step: step.serialize(),
                concurrency: *concurrency,
            },
        }
    }
}

/// A node located by an execution path
#[derive(Clone, Copy)]
pub enum Node<'a> {
    /// A top-level entry
    Entry(&'a StepFlowEntry),
    /// A branch of a parallel/conditional entry, or a foreach slot
    Branch {
        entry: &'a StepFlowEntry,
        index: usize,
        step: &'a Step,
    },
}

impl<'a> Node<'a> {
    /// Id of the step whose result this node records
    pub fn step_id(&self) -> &'a str {
        match self {
            Node::Entry(entry) => entry.id(),
            Node::Branch { step, .. } => &step.id,
        }
    }

    /// The executable step at this node, if it is a leaf
    pub fn step(&self) -> Option<&'a Step> {
        match self {
            Node::Entry(entry) => entry.single_step(),
            Node::Branch { step, .. } => Some(step),
        }
    }
}

// ── Workflow ─────────────────────────────────────────────────────────

/// A committed, immutable workflow graph
pub struct Workflow {
    id: String,
    description: Option<String>,
    entries: Vec<StepFlowEntry>,
    retry: Option<RetryConfig>,
}

impl Workflow {
    pub fn builder(id: impl Into<String>) -> WorkflowBuilder {
        WorkflowBuilder::new(id)
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn description(&self) -> Option<&str> {
        self.description.as_deref()
    }

    pub fn entries(&self) -> &[StepFlowEntry] {
        &self.entries
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Workflow-wide retry policy
    pub fn retry(&self) -> Option<RetryConfig> {
        self.retry
    }

    /// Effective retry policy for a step, falling back to `default`
    pub fn retry_for(&self, step: &Step, default: RetryConfig) -> RetryConfig {
        step.retry.or(self.retry).unwrap_or(default)
    }

    /// Nested workflows used as steps, at any depth below this one
    pub fn nested_workflows(&self) -> Vec<Arc<Workflow>> {
        let mut nested = Vec::new();
        for entry in &self.entries {
            let steps: Vec<&Step> = match entry.single_step() {
                Some(step) => vec![step],
                None => match entry {
                    StepFlowEntry::Foreach { step, .. } => vec![step],
                    other => other.branches().iter().collect(),
                },
            };
            for step in steps {
                if let Some(workflow) = step.nested() {
                    nested.push(workflow.clone());
                    nested.extend(workflow.nested_workflows());
                }
            }
        }
        nested
    }

    /// Resolve `path`, descending into nested workflows
    pub fn resolve(&self, path: &ExecutionPath) -> WorkflowResult<Node<'_>> {
        let indices = path.as_slice();
        let top = *indices.first().ok_or(WorkflowError::EmptyExecutionPath)?;
        let entry = self
            .entries
            .get(top)
            .ok_or_else(|| WorkflowError::StepMissingAtPath(path.clone()))?;

        if indices.len() == 1 {
            return Ok(Node::Entry(entry));
        }

        if let Some(step) = entry.child(indices[1]) {
            if indices.len() == 2 {
                return Ok(Node::Branch {
                    entry,
                    index: indices[1],
                    step,
                });
            }
            return Self::descend(step, &path.tail(2), path);
        }

        match entry.single_step() {
            Some(step) => Self::descend(step, &path.tail(1), path),
            None => Err(WorkflowError::StepMissingAtPath(path.clone())),
        }
    }

    fn descend<'a>(
        step: &'a Step,
        rest: &ExecutionPath,
        full: &ExecutionPath,
    ) -> WorkflowResult<Node<'a>> {
        match step.nested() {
            Some(workflow) => workflow
                .resolve(rest)
                .map_err(|_| WorkflowError::StepMissingAtPath(full.clone())),
            None => Err(WorkflowError::StepMissingAtPath(full.clone())),
        }
    }

    pub fn serialize(&self) -> Vec<SerializedStepFlowEntry> {
        self.entries.iter().map(StepFlowEntry::serialize).collect()
    }
}

impl std::fmt::Debug for Workflow {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Workflow")
            .field("id", &self.id)
            .field(
                "entries",
                &self.entries.iter().map(|e| e.kind()).collect::<Vec<_>>(),
            )
            .finish()
    }
}

// ── Builder ──────────────────────────────────────────────────────────

/// Fluent construction of a [`Workflow`]
pub struct WorkflowBuilder {
    id: String,
    description: Option<String>,
    entries: Vec<StepFlowEntry>,
    retry: Option<RetryConfig>,
}

impl WorkflowBuilder {
    pub fn new(id: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            description: None,
            entries: Vec::new(),
            retry: None,
        }
    }

    pub fn description(mut self, description: impl Into<String>) -> Self {
        self.description = Some(description.into());
        self
    }

    /// Retry policy for every step that does not set its own
    pub fn retry(mut self, retry: RetryConfig) -> Self {
        self.retry = Some(retry);
        self
    }

    /// Run `step` after the previous entry
    pub fn then(mut self, step: Step) -> Self {
        self.entries.push(StepFlowEntry::Step(step));
        self
    }

    /// Run all `steps` concurrently; the output maps step id to output
    pub fn parallel(mut self, steps: Vec<Step>) -> Self {
        let id = self.composite_id("parallel");
        self.entries.push(StepFlowEntry::Parallel { id, steps });
        self
    }

    /// Run every branch whose predicate holds
    pub fn branch(mut self, branches: Vec<(Arc<dyn Condition>, Step)>) -> Self {
        let id = self.composite_id("conditional");
        let (conditions, steps) = branches.into_iter().unzip();
        self.entries.push(StepFlowEntry::Conditional {
            id,
            steps,
            conditions,
        });
        self
    }

    /// Repeat `step` while the predicate holds
    pub fn dowhile<F, Fut>(self, step: Step, condition: F) -> Self
    where
        F: Fn(StepContext) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<bool, StepError>> + Send + 'static,
    {
        self.repeat(step, Arc::new(condition), LoopType::DoWhile)
    }

    /// Repeat `step` until the predicate holds
    pub fn dountil<F, Fut>(self, step: Step, condition: F) -> Self
    where
        F: Fn(StepContext) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<bool, StepError>> + Send + 'static,
    {
        self.repeat(step, Arc::new(condition), LoopType::DoUntil)
    }

    fn repeat(mut self, step: Step, condition: Arc<dyn Condition>, loop_type: LoopType) -> Self {
        self.entries.push(StepFlowEntry::Loop {
            step,
            condition,
            loop_type,
        });
        self
    }

    /// Apply `step` to each element of the array input, at most
    /// `concurrency` at a time
    pub fn foreach(mut self, step: Step, concurrency: usize) -> Self {
        self.entries
            .push(StepFlowEntry::Foreach { step, concurrency });
        self
    }

    /// Pause for a fixed number of milliseconds
    pub fn sleep(mut self, ms: u64) -> Self {
        let id = self.composite_id("sleep");
        self.entries.push(StepFlowEntry::Sleep {
            id,
            duration: SleepDuration::Fixed(ms),
        });
        self
    }

    /// Pause for a computed number of milliseconds
    pub fn sleep_fn<F, Fut>(mut self, f: F) -> Self
    where
        F: Fn(StepContext) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<i64, StepError>> + Send + 'static,
    {
        let id = self.composite_id("sleep");
        self.entries.push(StepFlowEntry::Sleep {
            id,
            duration: SleepDuration::Dynamic(Arc::new(f)),
        });
        self
    }

    /// Pause until a fixed instant
    pub fn sleep_until(mut self, date: DateTime<Utc>) -> Self {
        let id = self.composite_id("sleep-until");
        self.entries.push(StepFlowEntry::SleepUntil {
            id,
            date: SleepDate::Fixed(date),
        });
        self
    }

    /// Pause until a computed instant
    pub fn sleep_until_fn<F, Fut>(mut self, f: F) -> Self
    where
        F: Fn(StepContext) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<DateTime<Utc>, StepError>> + Send + 'static,
    {
        let id = self.composite_id("sleep-until");
        self.entries.push(StepFlowEntry::SleepUntil {
            id,
            date: SleepDate::Dynamic(Arc::new(f)),
        });
        self
    }

    /// Pause until the external event `event` arrives, then run `step`
    /// with the event payload as resume data
    pub fn wait_for_event(mut self, event: impl Into<String>, step: Step) -> Self {
        self.entries.push(StepFlowEntry::WaitForEvent {
            event: event.into(),
            step,
        });
        self
    }

    fn composite_id(&self, kind: &str) -> String {
        format!("{}.{}", kind, self.entries.len())
    }

    /// Validate and freeze the graph
    pub fn commit(self) -> WorkflowResult<Workflow> {
        if self.entries.is_empty() {
            return Err(WorkflowError::InvalidGraph(format!(
                "workflow '{}' has no steps",
                self.id
            )));
        }

        let mut seen = HashSet::new();
        for entry in &self.entries {
            match entry {
                StepFlowEntry::Parallel { id, steps } if steps.is_empty() => {
                    return Err(WorkflowError::InvalidGraph(format!(
                        "{} has no branches",
                        id
                    )));
                }
                StepFlowEntry::Conditional {
                    id,
                    steps,
                    conditions,
                } => {
                    if steps.is_empty() {
                        return Err(WorkflowError::InvalidGraph(format!(
                            "{} has no branches",
                            id
                        )));
                    }
                    if steps.len() != conditions.len() {
                        return Err(WorkflowError::InvalidGraph(format!(
                            "{} has {} branches but {} predicates",
                            id,
                            steps.len(),
                            conditions.len()
                        )));
                    }
                }
                StepFlowEntry::Foreach { step, concurrency } if *concurrency == 0 => {
                    return Err(WorkflowError::InvalidGraph(format!(
                        "foreach '{}' needs a concurrency of at least 1",
                        step.id
                    )));
                }
                _ => {}
            }

            if !seen.insert(entry.id().to_string()) {
                return Err(WorkflowError::DuplicateStepId(entry.id().to_string()));
            }
            for step in entry.branches() {
                if !seen.insert(step.id.clone()) {
                    return Err(WorkflowError::DuplicateStepId(step.id.clone()));
                }
            }
        }

        tracing::debug!(workflow_id = %self.id, entries = self.entries.len(), "Workflow committed");
        Ok(Workflow {
            id: self.id,
            description: self.description,
            entries: self.entries,
            retry: self.retry,
        })
    }
}

/// Placeholder body that passes its input through unchanged
pub fn passthrough(id: impl Into<String>) -> Step {
    Step::new(id, |ctx: StepContext| async move {
        Ok::<Value, StepError>(ctx.input_data().clone())
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::step::predicate;
    use serde_json::json;

    fn nested() -> Workflow {
        Workflow::builder("inner")
            .then(passthrough("x"))
            .parallel(vec![passthrough("y"), passthrough("z")])
            .commit()
            .unwrap()
    }

    #[test]
    fn test_builder_assigns_composite_ids() {
        let workflow = Workflow::builder("wf")
            .then(passthrough("a"))
            .parallel(vec![passthrough("b"), passthrough("c")])
            .sleep(10)
            .commit()
            .unwrap();
        let ids: Vec<_> = workflow.entries().iter().map(|e| e.id()).collect();
        assert_eq!(ids, vec!["a", "parallel.1", "sleep.2"]);
    }

    #[test]
    fn test_commit_rejects_invalid_graphs() {
        assert!(matches!(
            Workflow::builder("empty").commit(),
            Err(WorkflowError::InvalidGraph(_))
        ));
        assert!(matches!(
            Workflow::builder("dup")
                .then(passthrough("a"))
                .parallel(vec![passthrough("a")])
                .commit(),
            Err(WorkflowError::DuplicateStepId(id)) if id == "a"
        ));
        assert!(matches!(
            Workflow::builder("wf").parallel(vec![]).commit(),
            Err(WorkflowError::InvalidGraph(_))
        ));
        assert!(matches!(
            Workflow::builder("wf").foreach(passthrough("f"), 0).commit(),
            Err(WorkflowError::InvalidGraph(_))
        ));
    }

    #[test]
    fn test_resolve_branch_and_nested() {
        let workflow = Workflow::builder("outer")
            .then(passthrough("a"))
            .branch(vec![
                (predicate(|_ctx| async { Ok(true) }), passthrough("b")),
                (predicate(|_ctx| async { Ok(false) }), passthrough("c")),
            ])
            .then(Step::from_workflow(nested()))
            .commit()
            .unwrap();

        match workflow.resolve(&ExecutionPath::new(vec![1, 1])).unwrap() {
            Node::Branch { step, index, .. } => {
                assert_eq!(step.id, "c");
                assert_eq!(index, 1);
            }
            Node::Entry(_) => panic!("expected branch"),
        }
        assert_eq!(
            workflow
                .resolve(&ExecutionPath::new(vec![2, 1, 1]))
                .unwrap()
                .step_id(),
            "z"
        );
        assert!(matches!(
            workflow.resolve(&ExecutionPath::top_level(5)),
            Err(WorkflowError::StepMissingAtPath(_))
        ));
    }

    #[test]
    fn test_serialized_graph_resolves_like_executable() {
        let workflow = Workflow::builder("outer")
            .then(passthrough("a"))
            .foreach(passthrough("each"), 2)
            .then(Step::from_workflow(nested()))
            .commit()
            .unwrap();
        let serialized = workflow.serialize();
        for path in [vec![0], vec![1, 3], vec![2, 0], vec![2, 1, 0]] {
            let path = ExecutionPath::new(path);
            let live = workflow.resolve(&path).unwrap().step_id().to_string();
            let stored = match workflow_types::resolve_serialized(&serialized, &path).unwrap() {
                workflow_types::SerializedNode::Entry(entry) => entry.id().to_string(),
                workflow_types::SerializedNode::Branch { step, .. } => step.id.clone(),
            };
            assert_eq!(live, stored, "path {}", path);
        }
        assert_eq!(
            serde_json::to_value(&serialized[1]).unwrap()["concurrency"],
            json!(2)
        );
    }

    #[test]
    fn test_nested_workflows_and_retry_fallback() {
        let workflow = Workflow::builder("outer")
            .retry(RetryConfig::new(2))
            .then(passthrough("a").with_retries(5))
            .then(Step::from_workflow(nested()))
            .commit()
            .unwrap();
        let nested: Vec<_> = workflow
            .nested_workflows()
            .iter()
            .map(|w| w.id().to_string())
            .collect();
        assert_eq!(nested, vec!["inner"]);

        let default = RetryConfig::new(1);
        let entries = workflow.entries();
        let StepFlowEntry::Step(a) = &entries[0] else {
            panic!("expected step");
        };
        let StepFlowEntry::Step(inner) = &entries[1] else {
            panic!("expected step");
        };
        assert_eq!(workflow.retry_for(a, default).attempts, 5);
        assert_eq!(workflow.retry_for(inner, default).attempts, 2);
    }
}
