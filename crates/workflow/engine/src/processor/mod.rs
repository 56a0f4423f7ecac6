//! Workflow event processor: the lifecycle state machine
//!
//! Every handler reads the persisted snapshot, applies at most a few atomic
//! patches and returns the events to publish next. No run state lives in
//! the processor between two events, so any number of processors may
//! share the `workflows` queue.
//!
//! Nothing escapes a handler: structural and validation errors become a
//! `workflow.fail` for the run, transport errors are logged and the
//! message is still acknowledged.

mod end;
mod lifecycle;
mod run;

use async_trait::async_trait;
use chrono::Utc;
use serde_json::Value;
use std::collections::{BTreeMap, BTreeSet};
use std::sync::Arc;
use std::time::Duration;
use workflow_bus::{Ack, BusEvent, BusMessage, EventHandler, MessageBus};
use workflow_storage::WorkflowStore;
use workflow_types::{
    watch_topic, watch_topic_v2, ErrorCategory, ExecutionPath, LifecycleEvent, ParentWorkflow,
    ResultPatch, ResultsUpdate, RunStateUpdate, RunStatus, StepEndData, StepFailure, StepResult,
    StepRunData, TerminalData, WatchEvent, WorkflowError, WorkflowEvent, WorkflowResult,
    WorkflowRunState, FINISH_TOPIC, WORKFLOWS_TOPIC,
};

use crate::abort::AbortRegistry;
use crate::config::EngineConfig;
use crate::executor::{StepExecutor, StepScope};
use crate::graph::Workflow;
use crate::registry::WorkflowRegistry;

// ── Outbound Events ──────────────────────────────────────────────────

/// An event a handler wants published
#[derive(Clone, Debug)]
pub enum Outbound {
    /// Next lifecycle event on the `workflows` queue
    Lifecycle(WorkflowEvent),
    /// Terminal event for execution engine subscribers
    Finish(WorkflowEvent),
    /// Lifecycle event published after a delay
    Delayed { delay: Duration, event: WorkflowEvent },
}

// ── Frame ────────────────────────────────────────────────────────────

/// The run an event addresses
#[derive(Clone)]
pub(crate) struct Frame {
    pub run_id: String,
    pub workflow: Arc<Workflow>,
    pub parent: Option<ParentWorkflow>,
}

impl Frame {
    fn workflow_id(&self) -> &str {
        self.workflow.id()
    }

    fn emit(&self, event: LifecycleEvent) -> Outbound {
        Outbound::Lifecycle(WorkflowEvent::new(&self.run_id, event))
    }

    fn step_run(
        &self,
        path: ExecutionPath,
        input: Value,
        step_results: &BTreeMap<String, StepResult>,
    ) -> StepRunData {
        StepRunData {
            workflow_id: self.workflow_id().to_string(),
            execution_path: path,
            step_results: step_results.clone(),
            active_steps: BTreeSet::new(),
            input,
            resume: None,
            parent: self.parent.clone(),
            run_count: 0,
            attempt: 0,
            iteration: 0,
        }
    }

    fn step_end(
        &self,
        path: ExecutionPath,
        result: StepResult,
        step_results: &BTreeMap<String, StepResult>,
    ) -> StepEndData {
        StepEndData {
            workflow_id: self.workflow_id().to_string(),
            execution_path: path,
            step_results: step_results.clone(),
            active_steps: BTreeSet::new(),
            result,
            parent: self.parent.clone(),
            run_count: 0,
            iteration: 0,
        }
    }

    fn terminal(
        &self,
        path: ExecutionPath,
        result: Option<StepResult>,
        step_results: &BTreeMap<String, StepResult>,
    ) -> TerminalData {
        TerminalData {
            workflow_id: self.workflow_id().to_string(),
            execution_path: path,
            step_results: step_results.clone(),
            result,
            parent: self.parent.clone(),
        }
    }
}

// ── Processor ────────────────────────────────────────────────────────

/// Consumes lifecycle events and drives runs forward
#[derive(Clone)]
pub struct EventProcessor {
    store: Arc<dyn WorkflowStore>,
    bus: Arc<dyn MessageBus>,
    registry: Arc<WorkflowRegistry>,
    aborts: Arc<AbortRegistry>,
    executor: StepExecutor,
    config: Arc<EngineConfig>,
}

impl EventProcessor {
    pub fn new(
        store: Arc<dyn WorkflowStore>,
        bus: Arc<dyn MessageBus>,
        registry: Arc<WorkflowRegistry>,
        aborts: Arc<AbortRegistry>,
        config: Arc<EngineConfig>,
    ) -> Self {
        Self {
            executor: StepExecutor::new(bus.clone()),
            store,
            bus,
            registry,
            aborts,
            config,
        }
    }

    /// Process one event and publish its follow-ups
    pub async fn dispatch(&self, event: WorkflowEvent) {
        let outbound = match self.process(&event).await {
            Ok(outbound) => outbound,
            Err(err) if !self.registry.contains(event.workflow_id()) => {
                self.reject(&event, err).await
            }
            Err(err) => self.on_error(&event, err),
        };
        for message in outbound {
            self.publish(message).await;
        }
    }

    /// Compute the transition an event triggers
    pub async fn process(&self, event: &WorkflowEvent) -> WorkflowResult<Vec<Outbound>> {
        let frame = Frame {
            run_id: event.run_id.clone(),
            workflow: self.registry.get(event.workflow_id())?,
            parent: event.event.parent().cloned(),
        };
        tracing::debug!(
            run_id = %event.run_id,
            workflow_id = %event.workflow_id(),
            event_type = %event.event_type(),
            "Processing lifecycle event"
        );

        match &event.event {
            LifecycleEvent::Start(data) => self.on_start(&frame, data).await,
            LifecycleEvent::Resume(data) => self.on_resume(&frame, data).await,
            LifecycleEvent::StepRun(data) => self.on_step_run(&frame, data).await,
            LifecycleEvent::StepEnd(data) => self.on_step_end(&frame, data).await,
            LifecycleEvent::Suspend(data) => self.on_suspend(&frame, event, data).await,
            LifecycleEvent::Fail(data) => self.on_fail(&frame, event, data).await,
            LifecycleEvent::End(data) => self.on_end(&frame, event, data).await,
            LifecycleEvent::Cancel(_) => self.on_cancel(&frame, event).await,
            LifecycleEvent::UserEvent(data) => self.on_user_event(&frame, data).await,
        }
    }

    fn on_error(&self, event: &WorkflowEvent, err: WorkflowError) -> Vec<Outbound> {
        let category = err.category();
        let terminal = event.is_terminal() || matches!(event.event, LifecycleEvent::Cancel(_));
        if category == ErrorCategory::Transport || terminal {
            tracing::error!(
                run_id = %event.run_id,
                event_type = %event.event_type(),
                error = %err,
                "Lifecycle event handling failed"
            );
            return Vec::new();
        }

        tracing::warn!(
            run_id = %event.run_id,
            event_type = %event.event_type(),
            category = %category,
            error = %err,
            "Lifecycle event failed, failing run"
        );
        let failure = StepFailure::new(err.to_string()).with_category(category);
        let data = TerminalData {
            workflow_id: event.workflow_id().to_string(),
            execution_path: event_path(&event.event),
            step_results: BTreeMap::new(),
            result: Some(StepResult::failed(failure, Value::Null, Utc::now())),
            parent: event.event.parent().cloned(),
        };
        vec![Outbound::Lifecycle(WorkflowEvent::new(
            &event.run_id,
            LifecycleEvent::Fail(data),
        ))]
    }

    /// Fail a run whose workflow this processor does not know
    ///
    /// A `workflow.fail` would hit the same lookup, so the failure is
    /// recorded here and the finish notification is published directly.
    async fn reject(&self, event: &WorkflowEvent, err: WorkflowError) -> Vec<Outbound> {
        tracing::error!(
            run_id = %event.run_id,
            workflow_id = %event.workflow_id(),
            event_type = %event.event_type(),
            error = %err,
            "Lifecycle event for unknown workflow"
        );
        let failure = StepFailure::new(err.to_string()).with_category(err.category());
        let update = RunStateUpdate::status(RunStatus::Failed).with_error(failure.clone());
        if let Err(err) = self
            .store
            .update_workflow_state(event.workflow_id(), &event.run_id, update)
            .await
        {
            tracing::debug!(run_id = %event.run_id, error = %err, "No snapshot to fail");
        }

        let result = StepResult::failed(failure, Value::Null, Utc::now());
        let mut outbound = Vec::new();
        if let Some(parent) = event.event.parent() {
            outbound.push(lifecycle::outer_step_end(parent, result.clone()));
        }
        let data = TerminalData {
            workflow_id: event.workflow_id().to_string(),
            execution_path: event_path(&event.event),
            step_results: BTreeMap::new(),
            result: Some(result),
            parent: event.event.parent().cloned(),
        };
        outbound.push(Outbound::Finish(WorkflowEvent::new(
            &event.run_id,
            LifecycleEvent::Fail(data),
        )));
        outbound
    }

    async fn publish(&self, message: Outbound) {
        let (topic, event) = match message {
            Outbound::Lifecycle(event) => (WORKFLOWS_TOPIC, event),
            Outbound::Finish(event) => (FINISH_TOPIC, event),
            Outbound::Delayed { delay, event } => {
                let bus = self.bus.clone();
                tokio::spawn(async move {
                    tokio::time::sleep(delay).await;
                    let run_id = event.run_id.clone();
                    if let Err(err) = bus
                        .publish(WORKFLOWS_TOPIC, BusEvent::Lifecycle(event))
                        .await
                    {
                        tracing::error!(run_id = %run_id, error = %err, "Delayed publish failed");
                    }
                });
                return;
            }
        };
        let run_id = event.run_id.clone();
        if let Err(err) = self.bus.publish(topic, BusEvent::Lifecycle(event)).await {
            tracing::error!(run_id = %run_id, topic = %topic, error = %err, "Publish failed");
        }
    }

    /// Publish a watch event on both per-run topics
    async fn notify(&self, event: WatchEvent) {
        let run_id = event.run_id().to_string();
        if let Some(change) = event.state_change() {
            if let Err(err) = self
                .bus
                .publish(&watch_topic(&run_id), BusEvent::Watch(change))
                .await
            {
                tracing::error!(run_id = %run_id, error = %err, "Watch publish failed");
            }
        }
        if let Err(err) = self
            .bus
            .publish(&watch_topic_v2(&run_id), BusEvent::Watch(event))
            .await
        {
            tracing::error!(run_id = %run_id, error = %err, "Watch publish failed");
        }
    }

    // ── Storage Helpers ──────────────────────────────────────────────

    async fn load(&self, frame: &Frame) -> WorkflowResult<WorkflowRunState> {
        self.store
            .load_workflow_snapshot(frame.workflow_id(), &frame.run_id)
            .await?
            .ok_or_else(|| WorkflowError::RunNotFound {
                workflow_id: frame.workflow_id().to_string(),
                run_id: frame.run_id.clone(),
            })
    }

    async fn patch(
        &self,
        frame: &Frame,
        step_id: &str,
        patch: ResultPatch,
    ) -> WorkflowResult<ResultsUpdate> {
        Ok(self
            .store
            .update_workflow_results(frame.workflow_id(), &frame.run_id, step_id, patch)
            .await?)
    }

    async fn update(
        &self,
        frame: &Frame,
        update: RunStateUpdate,
    ) -> WorkflowResult<WorkflowRunState> {
        Ok(self
            .store
            .update_workflow_state(frame.workflow_id(), &frame.run_id, update)
            .await?)
    }

    fn scope(
        &self,
        frame: &Frame,
        snapshot: &WorkflowRunState,
        input: Value,
        resume_data: Option<Value>,
        run_count: u32,
        iteration_count: u32,
    ) -> StepScope {
        StepScope {
            run_id: frame.run_id.clone(),
            workflow_id: frame.workflow_id().to_string(),
            input,
            init_data: snapshot.input.clone(),
            step_results: Arc::new(snapshot.context.clone()),
            runtime_context: Arc::new(snapshot.runtime_context.clone()),
            resume_data,
            run_count,
            iteration_count,
        }
    }
}

/// Skip events for runs that can no longer progress
fn finished(snapshot: &WorkflowRunState, event_type: &str) -> bool {
    if snapshot.status.is_finished() {
        tracing::debug!(
            run_id = %snapshot.run_id,
            status = %snapshot.status,
            event_type = %event_type,
            "Ignoring event for finished run"
        );
        return true;
    }
    false
}

/// Publish now, or after `delay_ms` when it is positive
pub(crate) fn schedule(delay_ms: u64, event: WorkflowEvent) -> Outbound {
    if delay_ms == 0 {
        Outbound::Lifecycle(event)
    } else {
        Outbound::Delayed {
            delay: Duration::from_millis(delay_ms),
            event,
        }
    }
}

/// Run id of the nested run a workflow step starts
pub(crate) fn nested_run_id(run_id: &str, step_id: &str, slot: Option<usize>) -> String {
    match slot {
        Some(index) => format!("{}.{}[{}]", run_id, step_id, index),
        None => format!("{}.{}", run_id, step_id),
    }
}

fn event_path(event: &LifecycleEvent) -> ExecutionPath {
    match event {
        LifecycleEvent::Resume(data) => data.execution_path.clone(),
        LifecycleEvent::StepRun(data) => data.execution_path.clone(),
        LifecycleEvent::StepEnd(data) => data.execution_path.clone(),
        LifecycleEvent::Suspend(data) | LifecycleEvent::Fail(data) | LifecycleEvent::End(data) => {
            data.execution_path.clone()
        }
        _ => ExecutionPath::root(),
    }
}

#[async_trait]
impl EventHandler for EventProcessor {
    async fn handle(&self, message: BusMessage, ack: Ack) {
        match message.payload {
            BusEvent::Lifecycle(event) => self.dispatch(event).await,
            BusEvent::Watch(event) => {
                tracing::warn!(run_id = %event.run_id(), "Watch event on lifecycle topic ignored");
            }
        }
        if let Err(err) = ack.ack() {
            tracing::error!(message_id = %message.id, error = %err, "Ack failed");
        }
    }
}
