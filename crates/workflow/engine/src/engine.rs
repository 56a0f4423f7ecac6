//! Execution engine: bridges `start`/`resume` calls to the event system
//!
//! The engine persists the initial snapshot (or validates the resume
//! request), publishes the first lifecycle event and waits on the
//! `workflows-finish` topic for a terminal event of the same run.

use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::BTreeMap;
use std::sync::{Arc, Mutex};
use tokio::sync::oneshot;
use uuid::Uuid;
use workflow_bus::{handler_fn, Ack, BusEvent, BusMessage, MessageBus};
use workflow_storage::WorkflowStore;
use workflow_types::{
    LifecycleEvent, ResumeData, ResumeTarget, RunStatus, StartData, StepFailure, StepResult,
    WorkflowError, WorkflowEvent, WorkflowResult, WorkflowRunState, FINISH_TOPIC,
    WORKFLOWS_TOPIC,
};

use crate::config::EngineConfig;
use crate::graph::Workflow;

/// What the engine is asked to do for a run
#[derive(Clone, Debug, PartialEq)]
pub enum ExecuteRequest {
    Start {
        input: Value,
        runtime_context: BTreeMap<String, Value>,
    },
    Resume {
        /// Step id chain of the suspended step, outermost first
        steps: Vec<String>,
        resume_data: Value,
    },
}

/// Outcome of a `start` or `resume` call
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RunOutput {
    pub status: RunStatus,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub result: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<StepFailure>,
    /// Step id chains of the suspended steps, outermost id first
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub suspended: Vec<Vec<String>>,
    pub steps: BTreeMap<String, StepResult>,
}

impl From<WorkflowRunState> for RunOutput {
    fn from(state: WorkflowRunState) -> Self {
        let suspended = if state.status == RunStatus::Suspended {
            state.suspended_chains()
        } else {
            Vec::new()
        };
        Self {
            status: state.status,
            result: state.result,
            error: state.error,
            suspended,
            steps: state.context,
        }
    }
}

/// Starts and resumes runs and waits for them to settle
#[derive(Clone)]
pub struct ExecutionEngine {
    store: Arc<dyn WorkflowStore>,
    bus: Arc<dyn MessageBus>,
    config: Arc<EngineConfig>,
}

impl ExecutionEngine {
    pub fn new(
        store: Arc<dyn WorkflowStore>,
        bus: Arc<dyn MessageBus>,
        config: Arc<EngineConfig>,
    ) -> Self {
        Self { store, bus, config }
    }

    /// Run `request` and wait for the run's next terminal event
    pub async fn execute(
        &self,
        workflow: &Arc<Workflow>,
        run_id: &str,
        request: ExecuteRequest,
    ) -> WorkflowResult<RunOutput> {
        let first = match request {
            ExecuteRequest::Start {
                input,
                runtime_context,
            } => self.prepare_start(workflow, run_id, input, runtime_context).await?,
            ExecuteRequest::Resume { steps, resume_data } => {
                self.prepare_resume(workflow, run_id, steps, resume_data)
                    .await?
            }
        };

        let (tx, rx) = oneshot::channel::<WorkflowEvent>();
        let tx = Arc::new(Mutex::new(Some(tx)));
        let target = run_id.to_string();
        // terminal events raised before this request belong to an earlier call
        let since = first.emitted_at;
        let handler = handler_fn(move |message: BusMessage, ack: Ack| {
            let tx = tx.clone();
            let target = target.clone();
            async move {
                if let BusEvent::Lifecycle(event) = &message.payload {
                    if event.run_id == target
                        && event.is_terminal()
                        && event.emitted_at >= since
                    {
                        let sender = tx.lock().ok().and_then(|mut sender| sender.take());
                        if let Some(sender) = sender {
                            let _ = sender.send(event.clone());
                        }
                    }
                }
                if let Err(err) = ack.ack() {
                    tracing::warn!(message_id = %message.id, error = %err, "Finish ack failed");
                }
            }
        });
        let subscription = self.bus.subscribe(FINISH_TOPIC, handler).await?;

        let event_type = first.event_type();
        if let Err(err) = self
            .bus
            .publish(WORKFLOWS_TOPIC, BusEvent::Lifecycle(first))
            .await
        {
            self.unsubscribe(&subscription).await;
            return Err(err.into());
        }
        tracing::debug!(run_id = %run_id, event_type = %event_type, "Run dispatched, awaiting finish");

        let finished = match self.config.execution.finish_timeout() {
            Some(timeout) => match tokio::time::timeout(timeout, rx).await {
                Ok(received) => received,
                Err(_) => {
                    self.unsubscribe(&subscription).await;
                    return Err(WorkflowError::FinishTimeout {
                        run_id: run_id.to_string(),
                    });
                }
            },
            None => rx.await,
        };
        self.unsubscribe(&subscription).await;
        let terminal =
            finished.map_err(|_| WorkflowError::Bus("finish subscription closed".to_string()))?;

        let state = self
            .store
            .load_workflow_snapshot(workflow.id(), run_id)
            .await?
            .ok_or_else(|| WorkflowError::RunNotFound {
                workflow_id: workflow.id().to_string(),
                run_id: run_id.to_string(),
            })?;
        tracing::info!(
            run_id = %run_id,
            event_type = %terminal.event_type(),
            status = %state.status,
            "Run settled"
        );
        Ok(RunOutput::from(state))
    }

    async fn unsubscribe(&self, subscription: &workflow_bus::SubscriptionId) {
        if let Err(err) = self.bus.unsubscribe(FINISH_TOPIC, subscription).await {
            tracing::warn!(subscription = %subscription, error = %err, "Finish unsubscribe failed");
        }
    }

    async fn prepare_start(
        &self,
        workflow: &Arc<Workflow>,
        run_id: &str,
        input: Value,
        runtime_context: BTreeMap<String, Value>,
    ) -> WorkflowResult<WorkflowEvent> {
        let state = WorkflowRunState::new(workflow.id(), run_id, workflow.serialize(), input.clone())
            .with_runtime_context(runtime_context.clone());
        self.store
            .persist_workflow_snapshot(workflow.id(), run_id, state)
            .await?;

        Ok(WorkflowEvent::new(
            run_id,
            LifecycleEvent::Start(StartData {
                workflow_id: workflow.id().to_string(),
                start_id: Uuid::new_v4().to_string(),
                input,
                runtime_context,
                parent: None,
            }),
        ))
    }

    async fn prepare_resume(
        &self,
        workflow: &Arc<Workflow>,
        run_id: &str,
        steps: Vec<String>,
        resume_data: Value,
    ) -> WorkflowResult<WorkflowEvent> {
        let first = steps.first().cloned().ok_or(WorkflowError::EmptyResumeSteps)?;
        let state = self
            .store
            .load_workflow_snapshot(workflow.id(), run_id)
            .await?
            .ok_or_else(|| WorkflowError::RunNotFound {
                workflow_id: workflow.id().to_string(),
                run_id: run_id.to_string(),
            })?;
        if state.status != RunStatus::Suspended {
            return Err(WorkflowError::RunNotSuspended {
                run_id: run_id.to_string(),
                status: state.status,
            });
        }
        let Some(path) = state.suspended_paths.get(&first).cloned() else {
            if state.context.contains_key(&first) {
                return Err(WorkflowError::NoSuspendedPath(first));
            }
            return Err(WorkflowError::StepNotFound(first));
        };

        tracing::debug!(run_id = %run_id, step_id = %first, path = %path, "Resume validated");
        Ok(WorkflowEvent::new(
            run_id,
            LifecycleEvent::Resume(ResumeData {
                workflow_id: workflow.id().to_string(),
                execution_path: path,
                resume: ResumeTarget {
                    steps,
                    resume_payload: resume_data,
                },
                step_results: state.context,
                parent: None,
            }),
        ))
    }
}
