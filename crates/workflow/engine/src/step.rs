//! Steps and the capability context handed to step bodies
//!
//! A step body is an async function of a [`StepContext`]. Besides the input
//! it can read prior results, suspend the run, bail out of the enclosing
//! composite, abort itself, and emit custom watch events.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde_json::Value;
use std::collections::BTreeMap;
use std::future::Future;
use std::sync::{Arc, Mutex};
use workflow_bus::{BusEvent, MessageBus};
use workflow_types::{
    watch_topic_v2, RetryConfig, SerializedStep, StepComponent, StepResult, WatchEvent,
};

use crate::abort::{AbortController, AbortSignal};
use crate::graph::Workflow;

// ── Step Errors ──────────────────────────────────────────────────────

/// Errors raised by step bodies and predicates
#[derive(Debug, thiserror::Error)]
pub enum StepError {
    #[error("{0}")]
    Failed(String),

    #[error("{0}() is not available while evaluating a predicate")]
    NotImplemented(&'static str),

    #[error("Step aborted")]
    Aborted,

    #[error("Step panicked: {0}")]
    Panicked(String),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error(transparent)]
    Other(#[from] Box<dyn std::error::Error + Send + Sync>),
}

impl StepError {
    pub fn failed(message: impl Into<String>) -> Self {
        StepError::Failed(message.into())
    }
}

// ── Step Bodies ──────────────────────────────────────────────────────

/// User logic of a leaf step
#[async_trait]
pub trait StepFn: Send + Sync {
    async fn run(&self, ctx: StepContext) -> Result<Value, StepError>;
}

#[async_trait]
impl<F, Fut> StepFn for F
where
    F: Fn(StepContext) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Result<Value, StepError>> + Send + 'static,
{
    async fn run(&self, ctx: StepContext) -> Result<Value, StepError> {
        (self)(ctx).await
    }
}

/// Predicate guarding a conditional branch or a loop
#[async_trait]
pub trait Condition: Send + Sync {
    async fn evaluate(&self, ctx: StepContext) -> Result<bool, StepError>;
}

#[async_trait]
impl<F, Fut> Condition for F
where
    F: Fn(StepContext) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Result<bool, StepError>> + Send + 'static,
{
    async fn evaluate(&self, ctx: StepContext) -> Result<bool, StepError> {
        (self)(ctx).await
    }
}

/// Computes a sleep duration in milliseconds
#[async_trait]
pub trait SleepFn: Send + Sync {
    async fn duration_ms(&self, ctx: StepContext) -> Result<i64, StepError>;
}

#[async_trait]
impl<F, Fut> SleepFn for F
where
    F: Fn(StepContext) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Result<i64, StepError>> + Send + 'static,
{
    async fn duration_ms(&self, ctx: StepContext) -> Result<i64, StepError> {
        (self)(ctx).await
    }
}

/// Computes the instant a sleep ends
#[async_trait]
pub trait SleepUntilFn: Send + Sync {
    async fn until(&self, ctx: StepContext) -> Result<DateTime<Utc>, StepError>;
}

#[async_trait]
impl<F, Fut> SleepUntilFn for F
where
    F: Fn(StepContext) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Result<DateTime<Utc>, StepError>> + Send + 'static,
{
    async fn until(&self, ctx: StepContext) -> Result<DateTime<Utc>, StepError> {
        (self)(ctx).await
    }
}

/// Wrap an async closure as a shareable predicate
pub fn predicate<F, Fut>(f: F) -> Arc<dyn Condition>
where
    F: Fn(StepContext) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Result<bool, StepError>> + Send + 'static,
{
    Arc::new(f)
}

// ── Step ─────────────────────────────────────────────────────────────

/// What a step runs
#[derive(Clone)]
pub enum StepBody {
    Function(Arc<dyn StepFn>),
    /// A whole workflow executed as a nested run
    Workflow(Arc<Workflow>),
}

/// A unit of work in a workflow graph
#[derive(Clone)]
pub struct Step {
    pub id: String,
    pub description: Option<String>,
    pub retry: Option<RetryConfig>,
    pub body: StepBody,
}

impl Step {
    pub fn new<F, Fut>(id: impl Into<String>, body: F) -> Self
    where
        F: Fn(StepContext) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<Value, StepError>> + Send + 'static,
    {
        Self::with_body(id, Arc::new(body))
    }

    /// Build a step around any [`StepFn`] implementation
    pub fn with_body(id: impl Into<String>, body: Arc<dyn StepFn>) -> Self {
        Self {
            id: id.into(),
            description: None,
            retry: None,
            body: StepBody::Function(body),
        }
    }

    /// Use a committed workflow as a step; the step id is the workflow id
    pub fn from_workflow(workflow: impl Into<Arc<Workflow>>) -> Self {
        let workflow = workflow.into();
        Self {
            id: workflow.id().to_string(),
            description: workflow.description().map(str::to_string),
            retry: None,
            body: StepBody::Workflow(workflow),
        }
    }

    pub fn with_description(mut self, description: impl Into<String>) -> Self {
        self.description = Some(description.into());
        self
    }

    /// Allow `attempts` executions in total
    pub fn with_retries(mut self, attempts: u32) -> Self {
        self.retry = Some(RetryConfig::new(attempts));
        self
    }

    pub fn with_retry(mut self, retry: RetryConfig) -> Self {
        self.retry = Some(retry);
        self
    }

    pub fn nested(&self) -> Option<&Arc<Workflow>> {
        match &self.body {
            StepBody::Workflow(workflow) => Some(workflow),
            StepBody::Function(_) => None,
        }
    }

    pub fn serialize(&self) -> SerializedStep {
        SerializedStep {
            id: self.id.clone(),
            description: self.description.clone(),
            component: match self.body {
                StepBody::Function(_) => StepComponent::Step,
                StepBody::Workflow(_) => StepComponent::Workflow,
            },
            graph: self.nested().map(|workflow| workflow.serialize()),
            retry: self.retry,
        }
    }
}

impl std::fmt::Debug for Step {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Step")
            .field("id", &self.id)
            .field("workflow", &self.nested().map(|w| w.id().to_string()))
            .field("retry", &self.retry)
            .finish()
    }
}

// ── Step Context ─────────────────────────────────────────────────────

/// Control-flow request recorded by a step body
#[derive(Clone, Debug, PartialEq)]
pub(crate) enum StepControl {
    Suspend(Value),
    Bail(Value),
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
enum ContextMode {
    Step,
    Predicate,
}

/// Capabilities available to a step body or predicate
#[derive(Clone)]
pub struct StepContext {
    run_id: String,
    workflow_id: String,
    step_id: String,
    input: Value,
    resume_data: Option<Value>,
    run_count: u32,
    iteration_count: u32,
    init_data: Value,
    step_results: Arc<BTreeMap<String, StepResult>>,
    runtime_context: Arc<BTreeMap<String, Value>>,
    abort: AbortController,
    bus: Option<Arc<dyn MessageBus>>,
    mode: ContextMode,
    control: Arc<Mutex<Option<StepControl>>>,
}

impl StepContext {
    #[allow(clippy::too_many_arguments)]
    pub(crate) fn new(
        run_id: &str,
        workflow_id: &str,
        step_id: &str,
        input: Value,
        init_data: Value,
        step_results: Arc<BTreeMap<String, StepResult>>,
        runtime_context: Arc<BTreeMap<String, Value>>,
        abort: AbortController,
    ) -> Self {
        Self {
            run_id: run_id.to_string(),
            workflow_id: workflow_id.to_string(),
            step_id: step_id.to_string(),
            input,
            resume_data: None,
            run_count: 0,
            iteration_count: 0,
            init_data,
            step_results,
            runtime_context,
            abort,
            bus: None,
            mode: ContextMode::Step,
            control: Arc::new(Mutex::new(None)),
        }
    }

    pub(crate) fn with_resume_data(mut self, resume_data: Option<Value>) -> Self {
        self.resume_data = resume_data;
        self
    }

    pub(crate) fn with_counts(mut self, run_count: u32, iteration_count: u32) -> Self {
        self.run_count = run_count;
        self.iteration_count = iteration_count;
        self
    }

    pub(crate) fn with_bus(mut self, bus: Arc<dyn MessageBus>) -> Self {
        self.bus = Some(bus);
        self
    }

    pub(crate) fn for_predicate(mut self) -> Self {
        self.mode = ContextMode::Predicate;
        self
    }

    pub(crate) fn take_control(&self) -> Option<StepControl> {
        self.control.lock().ok().and_then(|mut control| control.take())
    }

    pub fn run_id(&self) -> &str {
        &self.run_id
    }

    pub fn workflow_id(&self) -> &str {
        &self.workflow_id
    }

    pub fn step_id(&self) -> &str {
        &self.step_id
    }

    /// Input handed to this step
    pub fn input_data(&self) -> &Value {
        &self.input
    }

    /// Deserialize the input into a typed value
    pub fn input_as<T: serde::de::DeserializeOwned>(&self) -> Result<T, StepError> {
        Ok(serde_json::from_value(self.input.clone())?)
    }

    /// Data supplied when this step is resumed
    pub fn resume_data(&self) -> Option<&Value> {
        self.resume_data.as_ref()
    }

    /// Executions of this step before the current one
    pub fn run_count(&self) -> u32 {
        self.run_count
    }

    /// Completed loop iterations, the current one included
    pub fn iteration_count(&self) -> u32 {
        self.iteration_count
    }

    /// Input the run was started with
    pub fn init_data(&self) -> &Value {
        &self.init_data
    }

    /// Output of a prior successful step
    pub fn get_step_result(&self, step_id: &str) -> Option<Value> {
        match self.step_results.get(step_id) {
            Some(StepResult::Success { output, .. }) => Some(output.clone()),
            _ => None,
        }
    }

    pub fn runtime_context(&self) -> &BTreeMap<String, Value> {
        &self.runtime_context
    }

    /// Suspend the run at this step
    ///
    /// Returns the value the body should return; the suspend payload is
    /// recorded on the step result.
    pub fn suspend(&self, payload: Value) -> Result<Value, StepError> {
        self.record(StepControl::Suspend(payload), "suspend")
    }

    /// Finish the run early with `output`
    pub fn bail(&self, output: Value) -> Result<Value, StepError> {
        self.record(StepControl::Bail(output), "bail")
    }

    /// Abort this step's signal
    pub fn abort(&self) {
        self.abort.abort();
    }

    pub fn abort_signal(&self) -> AbortSignal {
        self.abort.signal()
    }

    pub fn is_aborted(&self) -> bool {
        self.abort.is_aborted()
    }

    /// Publish a custom watch event for this step
    pub async fn emit(&self, name: impl Into<String>, data: Value) -> Result<(), StepError> {
        let Some(bus) = &self.bus else {
            return Ok(());
        };
        let event = WatchEvent::Custom {
            run_id: self.run_id.clone(),
            step_id: self.step_id.clone(),
            name: name.into(),
            data,
        };
        bus.publish(&watch_topic_v2(&self.run_id), BusEvent::Watch(event))
            .await
            .map_err(|e| StepError::failed(e.to_string()))
    }

    fn record(&self, control: StepControl, name: &'static str) -> Result<Value, StepError> {
        if self.mode == ContextMode::Predicate {
            return Err(StepError::NotImplemented(name));
        }
        let mut slot = self
            .control
            .lock()
            .map_err(|_| StepError::failed("step control lock poisoned"))?;
        *slot = Some(control);
        Ok(Value::Null)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn context() -> StepContext {
        let mut results = BTreeMap::new();
        results.insert(
            "prev".to_string(),
            StepResult::success(json!({"n": 1}), json!(null), Utc::now()),
        );
        StepContext::new(
            "run-1",
            "wf",
            "step",
            json!({"n": 2}),
            json!({"n": 0}),
            Arc::new(results),
            Arc::new(BTreeMap::new()),
            AbortController::new(),
        )
    }

    #[test]
    fn test_prior_results_and_input() {
        let ctx = context();
        assert_eq!(ctx.get_step_result("prev"), Some(json!({"n": 1})));
        assert_eq!(ctx.get_step_result("missing"), None);
        assert_eq!(ctx.init_data(), &json!({"n": 0}));

        #[derive(serde::Deserialize)]
        struct Input {
            n: u32,
        }
        assert_eq!(ctx.input_as::<Input>().unwrap().n, 2);
    }

    #[test]
    fn test_suspend_is_recorded_once() {
        let ctx = context();
        ctx.suspend(json!({"why": "approval"})).unwrap();
        assert_eq!(
            ctx.take_control(),
            Some(StepControl::Suspend(json!({"why": "approval"})))
        );
        assert_eq!(ctx.take_control(), None);
    }

    #[test]
    fn test_predicates_cannot_suspend_or_bail() {
        let ctx = context().for_predicate();
        assert!(matches!(
            ctx.suspend(json!(null)),
            Err(StepError::NotImplemented("suspend"))
        ));
        assert!(matches!(
            ctx.bail(json!(null)),
            Err(StepError::NotImplemented("bail"))
        ));
    }

    #[tokio::test]
    async fn test_closure_steps() {
        let step = Step::new("double", |ctx: StepContext| async move {
            let n = ctx.input_data()["n"].as_i64().unwrap_or(0);
            Ok(json!({"n": n * 2}))
        });
        let StepBody::Function(body) = &step.body else {
            panic!("expected function body");
        };
        assert_eq!(body.run(context()).await.unwrap(), json!({"n": 4}));
        assert_eq!(step.serialize().component, StepComponent::Step);
    }
}
