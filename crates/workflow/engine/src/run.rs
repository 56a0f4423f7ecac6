//! Run façade: the caller-facing handle for one run of a workflow

use futures::Stream;
use serde::Serialize;
use serde_json::{json, Value};
use std::collections::BTreeMap;
use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use workflow_bus::{handler_fn, Ack, BusEvent, BusMessage, MessageBus, SubscriptionId};
use workflow_storage::WorkflowStore;
use workflow_types::{
    watch_topic, watch_topic_v2, CancelData, LifecycleEvent, RunStatus, StepResult,
    UserEventData, WaitKind, WatchEvent, WorkflowError, WorkflowEvent, WorkflowResult,
    WorkflowRunState, WORKFLOWS_TOPIC,
};

use crate::engine::{ExecuteRequest, ExecutionEngine, RunOutput};
use crate::graph::Workflow;

/// Custom event names surfaced on the stream as tool-call deltas
const TOOL_CALL_EVENTS: [&str; 2] = ["agent-call", "tool-call"];

/// Which suspended step to resume and with what data
#[derive(Clone, Debug, PartialEq)]
pub struct ResumeRequest {
    /// Step id chain, outermost first. A single id resumes the first
    /// suspended step inside a nested workflow.
    pub steps: Vec<String>,
    pub resume_data: Value,
}

impl ResumeRequest {
    pub fn step(step_id: impl Into<String>, resume_data: Value) -> Self {
        Self {
            steps: vec![step_id.into()],
            resume_data,
        }
    }

    pub fn chain<I, S>(steps: I, resume_data: Value) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            steps: steps.into_iter().map(Into::into).collect(),
            resume_data,
        }
    }
}

/// Handle to one run
#[derive(Clone)]
pub struct Run {
    run_id: String,
    workflow: Arc<Workflow>,
    engine: ExecutionEngine,
    store: Arc<dyn WorkflowStore>,
    bus: Arc<dyn MessageBus>,
}

impl Run {
    pub(crate) fn new(
        run_id: impl Into<String>,
        workflow: Arc<Workflow>,
        engine: ExecutionEngine,
        store: Arc<dyn WorkflowStore>,
        bus: Arc<dyn MessageBus>,
    ) -> Self {
        Self {
            run_id: run_id.into(),
            workflow,
            engine,
            store,
            bus,
        }
    }

    pub fn run_id(&self) -> &str {
        &self.run_id
    }

    pub fn workflow_id(&self) -> &str {
        self.workflow.id()
    }

    /// Start the run and wait until it finishes or suspends
    pub async fn start(&self, input: Value) -> WorkflowResult<RunOutput> {
        self.start_with_context(input, BTreeMap::new()).await
    }

    /// Start the run with a runtime context visible to every step
    pub async fn start_with_context(
        &self,
        input: Value,
        runtime_context: BTreeMap<String, Value>,
    ) -> WorkflowResult<RunOutput> {
        tracing::info!(
            workflow_id = %self.workflow.id(),
            run_id = %self.run_id,
            "Starting run"
        );
        self.engine
            .execute(
                &self.workflow,
                &self.run_id,
                ExecuteRequest::Start {
                    input,
                    runtime_context,
                },
            )
            .await
    }

    /// Resume a suspended step and wait until the run settles again
    pub async fn resume(&self, request: ResumeRequest) -> WorkflowResult<RunOutput> {
        tracing::info!(
            workflow_id = %self.workflow.id(),
            run_id = %self.run_id,
            steps = ?request.steps,
            "Resuming run"
        );
        self.engine
            .execute(
                &self.workflow,
                &self.run_id,
                ExecuteRequest::Resume {
                    steps: request.steps,
                    resume_data: request.resume_data,
                },
            )
            .await
    }

    /// Start the run and stream its watch events as chunks
    pub async fn stream(&self, input: Value) -> WorkflowResult<RunStream> {
        let (tx, rx) = mpsc::unbounded_channel();
        let handler = handler_fn(move |message: BusMessage, ack: Ack| {
            let tx = tx.clone();
            async move {
                if let BusEvent::Watch(event) = &message.payload {
                    if let Some(chunk) = StreamChunk::from_watch(event) {
                        let _ = tx.send(chunk);
                    }
                }
                if let Err(err) = ack.ack() {
                    tracing::warn!(message_id = %message.id, error = %err, "Stream ack failed");
                }
            }
        });
        let topic = watch_topic_v2(&self.run_id);
        let id = self.bus.subscribe(&topic, handler).await?;

        let run = self.clone();
        let result = tokio::spawn(async move { run.start(input).await });

        Ok(RunStream {
            rx,
            finished: false,
            result: Some(result),
            subscription: Some(Subscription {
                bus: self.bus.clone(),
                topic,
                id,
            }),
        })
    }

    /// Invoke `callback` with every state change of this run
    pub async fn watch<F>(&self, callback: F) -> WorkflowResult<WatchHandle>
    where
        F: Fn(WatchEvent) + Send + Sync + 'static,
    {
        let callback = Arc::new(callback);
        let handler = handler_fn(move |message: BusMessage, ack: Ack| {
            let callback = callback.clone();
            async move {
                if let BusEvent::Watch(event) = message.payload.clone() {
                    callback(event);
                }
                if let Err(err) = ack.ack() {
                    tracing::warn!(message_id = %message.id, error = %err, "Watch ack failed");
                }
            }
        });
        let topic = watch_topic(&self.run_id);
        let id = self.bus.subscribe(&topic, handler).await?;
        Ok(WatchHandle {
            subscription: Subscription {
                bus: self.bus.clone(),
                topic,
                id,
            },
        })
    }

    /// Request cancellation; in-flight steps see their abort signal fire
    pub async fn cancel(&self) -> WorkflowResult<()> {
        tracing::info!(run_id = %self.run_id, "Cancel requested");
        self.publish(LifecycleEvent::Cancel(CancelData {
            workflow_id: self.workflow.id().to_string(),
        }))
        .await
    }

    /// Deliver a named external event to a step waiting for it
    pub async fn send_event(&self, name: impl Into<String>, payload: Value) -> WorkflowResult<()> {
        let name = name.into();
        tracing::debug!(run_id = %self.run_id, event = %name, "Sending user event");
        self.publish(LifecycleEvent::UserEvent(UserEventData {
            workflow_id: self.workflow.id().to_string(),
            name,
            payload,
        }))
        .await
    }

    /// Current snapshot of the run, if it has been started
    pub async fn state(&self) -> WorkflowResult<Option<WorkflowRunState>> {
        Ok(self
            .store
            .load_workflow_snapshot(self.workflow.id(), &self.run_id)
            .await?)
    }

    async fn publish(&self, event: LifecycleEvent) -> WorkflowResult<()> {
        self.bus
            .publish(
                WORKFLOWS_TOPIC,
                BusEvent::Lifecycle(WorkflowEvent::new(self.run_id.clone(), event)),
            )
            .await?;
        Ok(())
    }
}

// ── Subscriptions ────────────────────────────────────────────────────

struct Subscription {
    bus: Arc<dyn MessageBus>,
    topic: String,
    id: SubscriptionId,
}

impl Subscription {
    async fn cancel(self) -> WorkflowResult<()> {
        self.bus.unsubscribe(&self.topic, &self.id).await?;
        Ok(())
    }

    /// Unsubscribe from a synchronous context
    fn detach(self) {
        match tokio::runtime::Handle::try_current() {
            Ok(handle) => {
                handle.spawn(async move {
                    if let Err(err) = self.cancel().await {
                        tracing::warn!(error = %err, "Unsubscribe failed");
                    }
                });
            }
            Err(_) => tracing::warn!(topic = %self.topic, "No runtime to unsubscribe on"),
        }
    }
}

/// Returned by [`Run::watch`]; call [`WatchHandle::unwatch`] to stop
pub struct WatchHandle {
    subscription: Subscription,
}

impl WatchHandle {
    pub async fn unwatch(self) -> WorkflowResult<()> {
        self.subscription.cancel().await
    }
}

// ── Streaming ────────────────────────────────────────────────────────

/// One item of a run's output stream
#[derive(Clone, Debug, PartialEq, Serialize)]
#[serde(
    tag = "type",
    rename_all = "kebab-case",
    rename_all_fields = "camelCase"
)]
pub enum StreamChunk {
    Start {
        run_id: String,
    },
    StepStart {
        step_id: String,
        payload: Value,
    },
    StepOutput {
        step_id: String,
        output: Value,
    },
    StepError {
        step_id: String,
        message: String,
    },
    StepSuspended {
        step_id: String,
        payload: Value,
    },
    StepWaiting {
        step_id: String,
        event: String,
    },
    StepFinish {
        step_id: String,
    },
    ToolCallDelta {
        tool_call_id: String,
        tool_name: String,
        args_text_delta: String,
    },
    Custom {
        step_id: String,
        name: String,
        data: Value,
    },
    Finish {
        status: RunStatus,
    },
}

impl StreamChunk {
    /// Translate a watch event into a stream chunk
    pub fn from_watch(event: &WatchEvent) -> Option<Self> {
        let chunk = match event {
            WatchEvent::WorkflowStart { run_id, .. } => StreamChunk::Start {
                run_id: run_id.clone(),
            },
            WatchEvent::StepStart {
                step_id, payload, ..
            } => StreamChunk::StepStart {
                step_id: step_id.clone(),
                payload: payload.clone(),
            },
            WatchEvent::StepResult {
                step_id, result, ..
            } => match result {
                StepResult::Success { output, .. } => StreamChunk::StepOutput {
                    step_id: step_id.clone(),
                    output: output.clone(),
                },
                StepResult::Failed { error, .. } => StreamChunk::StepError {
                    step_id: step_id.clone(),
                    message: error.message.clone(),
                },
                _ => return None,
            },
            WatchEvent::StepSuspended {
                step_id,
                suspend_payload,
                ..
            } => StreamChunk::StepSuspended {
                step_id: step_id.clone(),
                payload: suspend_payload.clone(),
            },
            WatchEvent::StepWaiting {
                step_id,
                wait: WaitKind::Timer { ms },
                ..
            } => StreamChunk::ToolCallDelta {
                tool_call_id: step_id.clone(),
                tool_name: "sleep".to_string(),
                args_text_delta: json!({ "ms": ms }).to_string(),
            },
            WatchEvent::StepWaiting {
                step_id,
                wait: WaitKind::Event { name },
                ..
            } => StreamChunk::StepWaiting {
                step_id: step_id.clone(),
                event: name.clone(),
            },
            WatchEvent::StepFinish { step_id, .. } => StreamChunk::StepFinish {
                step_id: step_id.clone(),
            },
            WatchEvent::WorkflowFinish { status, .. } => StreamChunk::Finish { status: *status },
            WatchEvent::Custom {
                step_id,
                name,
                data,
                ..
            } if TOOL_CALL_EVENTS.contains(&name.as_str()) => StreamChunk::ToolCallDelta {
                tool_call_id: text_field(data, "toolCallId").unwrap_or_else(|| step_id.clone()),
                tool_name: text_field(data, "toolName").unwrap_or_else(|| name.clone()),
                args_text_delta: text_field(data, "argsTextDelta")
                    .or_else(|| data.get("args").map(Value::to_string))
                    .unwrap_or_default(),
            },
            WatchEvent::Custom {
                step_id,
                name,
                data,
                ..
            } => StreamChunk::Custom {
                step_id: step_id.clone(),
                name: name.clone(),
                data: data.clone(),
            },
            WatchEvent::StateChange { .. } => return None,
        };
        Some(chunk)
    }
}

fn text_field(data: &Value, key: &str) -> Option<String> {
    data.get(key).and_then(Value::as_str).map(str::to_string)
}

/// Stream of a run's chunks; ends after the `finish` chunk
pub struct RunStream {
    rx: mpsc::UnboundedReceiver<StreamChunk>,
    finished: bool,
    result: Option<JoinHandle<WorkflowResult<RunOutput>>>,
    subscription: Option<Subscription>,
}

impl RunStream {
    /// Wait for the run's outcome
    pub async fn result(mut self) -> WorkflowResult<RunOutput> {
        let handle = self
            .result
            .take()
            .ok_or_else(|| WorkflowError::Bus("run result already taken".to_string()))?;
        handle
            .await
            .map_err(|err| WorkflowError::Bus(format!("run task failed: {}", err)))?
    }
}

impl Stream for RunStream {
    type Item = StreamChunk;

    fn poll_next(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        if self.finished {
            return Poll::Ready(None);
        }
        match self.rx.poll_recv(cx) {
            Poll::Ready(Some(chunk)) => {
                if matches!(chunk, StreamChunk::Finish { .. }) {
                    self.finished = true;
                }
                Poll::Ready(Some(chunk))
            }
            other => other,
        }
    }
}

impl Drop for RunStream {
    fn drop(&mut self) {
        if let Some(subscription) = self.subscription.take() {
            subscription.detach();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;
    use workflow_types::StepFailure;

    fn custom(name: &str, data: Value) -> WatchEvent {
        WatchEvent::Custom {
            run_id: "run-1".into(),
            step_id: "agent".into(),
            name: name.into(),
            data,
        }
    }

    #[test]
    fn test_timer_wait_becomes_tool_call_delta() {
        let event = WatchEvent::StepWaiting {
            run_id: "run-1".into(),
            step_id: "pause".into(),
            wait: WaitKind::Timer { ms: 250 },
        };
        let chunk = StreamChunk::from_watch(&event).unwrap();
        assert_eq!(
            chunk,
            StreamChunk::ToolCallDelta {
                tool_call_id: "pause".into(),
                tool_name: "sleep".into(),
                args_text_delta: "{\"ms\":250}".into(),
            }
        );
    }

    #[test]
    fn test_agent_call_uses_payload_fields() {
        let chunk = StreamChunk::from_watch(&custom(
            "agent-call",
            json!({"toolCallId": "call-7", "toolName": "search", "argsTextDelta": "{\"q\":"}),
        ))
        .unwrap();
        assert_eq!(
            chunk,
            StreamChunk::ToolCallDelta {
                tool_call_id: "call-7".into(),
                tool_name: "search".into(),
                args_text_delta: "{\"q\":".into(),
            }
        );

        let fallback = StreamChunk::from_watch(&custom("tool-call", json!({"args": {"x": 1}})))
            .unwrap();
        assert_eq!(
            fallback,
            StreamChunk::ToolCallDelta {
                tool_call_id: "agent".into(),
                tool_name: "tool-call".into(),
                args_text_delta: "{\"x\":1}".into(),
            }
        );
    }

    #[test]
    fn test_other_custom_events_pass_through() {
        let chunk = StreamChunk::from_watch(&custom("progress", json!(0.5))).unwrap();
        assert!(matches!(chunk, StreamChunk::Custom { ref name, .. } if name == "progress"));
    }

    #[test]
    fn test_step_results_map_to_output_or_error() {
        let ok = WatchEvent::StepResult {
            run_id: "r".into(),
            step_id: "a".into(),
            result: StepResult::success(json!(2), json!(1), Utc::now()),
        };
        assert_eq!(
            StreamChunk::from_watch(&ok),
            Some(StreamChunk::StepOutput {
                step_id: "a".into(),
                output: json!(2)
            })
        );

        let failed = WatchEvent::StepResult {
            run_id: "r".into(),
            step_id: "a".into(),
            result: StepResult::failed(StepFailure::new("boom"), json!(1), Utc::now()),
        };
        assert_eq!(
            StreamChunk::from_watch(&failed),
            Some(StreamChunk::StepError {
                step_id: "a".into(),
                message: "boom".into()
            })
        );

        let running = WatchEvent::StepResult {
            run_id: "r".into(),
            step_id: "a".into(),
            result: StepResult::running(json!(1)),
        };
        assert_eq!(StreamChunk::from_watch(&running), None);
    }

    #[test]
    fn test_chunk_serialization() {
        let chunk = StreamChunk::Finish {
            status: RunStatus::Success,
        };
        let value = serde_json::to_value(&chunk).unwrap();
        assert_eq!(value["type"], "finish");
        assert_eq!(value["status"], "success");

        let delta = StreamChunk::ToolCallDelta {
            tool_call_id: "c".into(),
            tool_name: "t".into(),
            args_text_delta: "{}".into(),
        };
        let value = serde_json::to_value(&delta).unwrap();
        assert_eq!(value["type"], "tool-call-delta");
        assert_eq!(value["argsTextDelta"], "{}");
    }
}
