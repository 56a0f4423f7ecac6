//! `workflow.step.run`: dispatch by node type

use chrono::Utc;
use serde_json::Value;
use std::collections::{BTreeMap, BTreeSet};
use std::sync::Arc;
use uuid::Uuid;
use workflow_types::{
    ErrorCategory, ExecutionPath, LifecycleEvent, ParentWorkflow, ResultPatch, ResumeData,
    ResumeTarget, RunStateUpdate, RunStatus, SlotState, StartData, StepFailure, StepResult,
    StepRunData, SuspendMarker, WaitKind, WatchEvent, WorkflowError, WorkflowEvent,
    WorkflowResult, WorkflowRunState,
};

use super::{finished, nested_run_id, schedule, EventProcessor, Frame, Outbound};
use crate::executor::StepOutcome;
use crate::graph::{Node, StepFlowEntry, Workflow};
use crate::step::{Condition, Step, StepBody, StepError};

impl EventProcessor {
    pub(super) async fn on_step_run(
        &self,
        frame: &Frame,
        data: &StepRunData,
    ) -> WorkflowResult<Vec<Outbound>> {
        let snapshot = self.load(frame).await?;
        if finished(&snapshot, "workflow.step.run") {
            return Ok(Vec::new());
        }

        let node = frame.workflow.resolve(&data.execution_path)?;
        tracing::debug!(
            run_id = %frame.run_id,
            path = %data.execution_path,
            step_id = %node.step_id(),
            run_count = data.run_count,
            "Dispatching step"
        );

        match node {
            Node::Branch {
                entry: StepFlowEntry::Foreach { .. },
                index,
                step,
            } => self.run_leaf(frame, &snapshot, data, step, Some(index)).await,
            Node::Branch { step, .. } => self.run_leaf(frame, &snapshot, data, step, None).await,
            Node::Entry(entry) => match entry {
                StepFlowEntry::Step(step) | StepFlowEntry::Loop { step, .. } => {
                    self.run_leaf(frame, &snapshot, data, step, None).await
                }
                StepFlowEntry::WaitForEvent { event, step } => match &data.resume {
                    Some(target) if target.targets(&step.id) => {
                        self.run_leaf(frame, &snapshot, data, step, None).await
                    }
                    _ => self.wait_for_event(frame, data, event, step).await,
                },
                StepFlowEntry::Parallel { id, steps } => {
                    self.run_parallel(frame, data, id, steps).await
                }
                StepFlowEntry::Conditional {
                    id,
                    steps,
                    conditions,
                } => {
                    self.run_conditional(frame, &snapshot, data, id, steps, conditions)
                        .await
                }
                StepFlowEntry::Sleep { id, duration } => {
                    let scope = self.scope(frame, &snapshot, data.input.clone(), None, 0, 0);
                    let delay = self.executor.resolve_sleep(id, duration, &scope).await;
                    self.run_timer(frame, data, id, delay).await
                }
                StepFlowEntry::SleepUntil { id, date } => {
                    let scope = self.scope(frame, &snapshot, data.input.clone(), None, 0, 0);
                    let delay = self.executor.resolve_sleep_until(id, date, &scope).await;
                    self.run_timer(frame, data, id, delay).await
                }
                StepFlowEntry::Foreach { step, concurrency } => {
                    self.run_foreach(frame, data, step, *concurrency).await
                }
            },
        }
    }

    // ── Leaves ───────────────────────────────────────────────────────

    /// Execute a leaf step; foreach slots pass their slot index
    async fn run_leaf(
        &self,
        frame: &Frame,
        snapshot: &WorkflowRunState,
        data: &StepRunData,
        step: &Step,
        slot: Option<usize>,
    ) -> WorkflowResult<Vec<Outbound>> {
        let path = &data.execution_path;
        let body = match &step.body {
            StepBody::Workflow(workflow) => {
                return self
                    .run_nested(frame, snapshot, data, step, workflow, slot)
                    .await
            }
            StepBody::Function(body) => body,
        };

        if slot.is_none() {
            let running = StepResult::running(data.input.clone());
            self.patch(frame, &step.id, ResultPatch::Replace(running))
                .await?;
        }
        self.notify(WatchEvent::StepStart {
            run_id: frame.run_id.clone(),
            step_id: step.id.clone(),
            payload: data.input.clone(),
        })
        .await;

        let resume_data = data
            .resume
            .as_ref()
            .filter(|target| target.targets(&step.id))
            .map(|target| target.resume_payload.clone());
        let scope = self.scope(
            frame,
            snapshot,
            data.input.clone(),
            resume_data,
            data.run_count,
            data.iteration + 1,
        );

        let (token, abort) = self.aborts.register(&frame.run_id);
        let outcome = self.executor.execute(&step.id, body, &scope, abort).await;
        self.aborts.unregister(&frame.run_id, token);

        let result = match outcome {
            StepOutcome::Bailed {
                output,
                payload,
                started_at,
            } => {
                let result = StepResult::success(output, payload, started_at);
                let patch = match slot {
                    Some(index) => ResultPatch::ForeachSlot {
                        index,
                        result: result.clone(),
                    },
                    None => ResultPatch::Replace(result.clone()),
                };
                let update = self.patch(frame, &step.id, patch).await?;
                tracing::info!(
                    run_id = %frame.run_id,
                    step_id = %step.id,
                    "Step bailed, ending run"
                );
                let end = frame.terminal(path.clone(), Some(result), &update.context);
                return Ok(vec![frame.emit(LifecycleEvent::End(end))]);
            }
            StepOutcome::Result(result) => result,
        };

        if let StepResult::Failed { error, .. } = &result {
            let retry = frame.workflow.retry_for(step, self.config.default_retry());
            if retry.allows_retry(data.attempt) {
                tracing::warn!(
                    run_id = %frame.run_id,
                    step_id = %step.id,
                    attempt = data.attempt + 1,
                    attempts = retry.attempts,
                    error = %error.message,
                    "Step failed, retrying"
                );
                let mut run = data.clone();
                run.run_count += 1;
                run.attempt += 1;
                let event = WorkflowEvent::new(&frame.run_id, LifecycleEvent::StepRun(run));
                return Ok(vec![schedule(retry.delay_ms, event)]);
            }
        }

        let mut end = frame.step_end(path.clone(), result, &snapshot.context);
        end.active_steps = data.active_steps.clone();
        end.run_count = data.run_count;
        end.iteration = data.iteration;
        Ok(vec![frame.emit(LifecycleEvent::StepEnd(end))])
    }

    /// Start or resume the nested run of a workflow step
    async fn run_nested(
        &self,
        frame: &Frame,
        snapshot: &WorkflowRunState,
        data: &StepRunData,
        step: &Step,
        workflow: &Arc<Workflow>,
        slot: Option<usize>,
    ) -> WorkflowResult<Vec<Outbound>> {
        if slot.is_none() {
            let running = StepResult::running(data.input.clone());
            self.patch(frame, &step.id, ResultPatch::Replace(running))
                .await?;
        }
        self.notify(WatchEvent::StepStart {
            run_id: frame.run_id.clone(),
            step_id: step.id.clone(),
            payload: data.input.clone(),
        })
        .await;

        let nested = Frame {
            run_id: nested_run_id(&frame.run_id, &step.id, slot),
            workflow: workflow.clone(),
            parent: Some(ParentWorkflow {
                workflow_id: frame.workflow_id().to_string(),
                run_id: frame.run_id.clone(),
                execution_path: data.execution_path.clone(),
                step_id: step.id.clone(),
                step_results: snapshot.context.clone(),
                run_count: data.run_count,
                attempt: data.attempt,
                iteration: data.iteration,
                parent: frame.parent.clone().map(Box::new),
            }),
        };

        if let Some(target) = data.resume.as_ref().filter(|t| t.targets(&step.id)) {
            if let Some(resume) = self.nested_resume(&nested, &target.nested()).await? {
                tracing::debug!(
                    run_id = %nested.run_id,
                    steps = ?resume.resume.steps,
                    "Resuming nested workflow"
                );
                return Ok(vec![nested.emit(LifecycleEvent::Resume(resume))]);
            }
        }

        tracing::debug!(
            run_id = %nested.run_id,
            workflow_id = %workflow.id(),
            "Starting nested workflow"
        );
        let start = StartData {
            workflow_id: workflow.id().to_string(),
            start_id: Uuid::new_v4().to_string(),
            input: data.input.clone(),
            runtime_context: snapshot.runtime_context.clone(),
            parent: nested.parent.clone(),
        };
        Ok(vec![nested.emit(LifecycleEvent::Start(start))])
    }

    /// Resume event for a suspended nested run, if there is one to resume
    async fn nested_resume(
        &self,
        nested: &Frame,
        target: &ResumeTarget,
    ) -> WorkflowResult<Option<ResumeData>> {
        let Some(state) = self
            .store
            .load_workflow_snapshot(nested.workflow_id(), &nested.run_id)
            .await?
        else {
            return Ok(None);
        };
        if state.status != RunStatus::Suspended {
            return Ok(None);
        }

        let requested = target
            .steps
            .first()
            .is_some_and(|id| state.suspended_paths.contains_key(id));
        let steps = if requested {
            target.steps.clone()
        } else {
            match state.suspended_chains().into_iter().next() {
                Some(chain) => chain,
                None => return Ok(None),
            }
        };
        let Some(path) = steps
            .first()
            .and_then(|id| state.suspended_paths.get(id))
            .cloned()
        else {
            return Ok(None);
        };

        Ok(Some(ResumeData {
            workflow_id: nested.workflow_id().to_string(),
            execution_path: path,
            resume: ResumeTarget {
                steps,
                resume_payload: target.resume_payload.clone(),
            },
            step_results: state.context,
            parent: nested.parent.clone(),
        }))
    }

    async fn wait_for_event(
        &self,
        frame: &Frame,
        data: &StepRunData,
        event: &str,
        step: &Step,
    ) -> WorkflowResult<Vec<Outbound>> {
        let waiting = StepResult::Waiting {
            payload: data.input.clone(),
            event: event.to_string(),
            started_at: Utc::now(),
        };
        self.patch(frame, &step.id, ResultPatch::Replace(waiting))
            .await?;
        self.update(
            frame,
            RunStateUpdate::status(RunStatus::Waiting)
                .with_waiting(event, data.execution_path.clone()),
        )
        .await?;

        tracing::info!(
            run_id = %frame.run_id,
            step_id = %step.id,
            event = %event,
            "Waiting for external event"
        );
        self.notify(WatchEvent::StepWaiting {
            run_id: frame.run_id.clone(),
            step_id: step.id.clone(),
            wait: WaitKind::Event {
                name: event.to_string(),
            },
        })
        .await;
        Ok(Vec::new())
    }

    // ── Composites ───────────────────────────────────────────────────

    async fn run_parallel(
        &self,
        frame: &Frame,
        data: &StepRunData,
        id: &str,
        steps: &[Step],
    ) -> WorkflowResult<Vec<Outbound>> {
        let context = self.mark_running(frame, data, id, steps).await?;
        let active: BTreeSet<String> = steps.iter().map(|step| step.id.clone()).collect();

        Ok((0..steps.len())
            .map(|index| {
                let mut run =
                    frame.step_run(data.execution_path.child(index), data.input.clone(), &context);
                run.active_steps = active.clone();
                frame.emit(LifecycleEvent::StepRun(run))
            })
            .collect())
    }

    async fn run_conditional(
        &self,
        frame: &Frame,
        snapshot: &WorkflowRunState,
        data: &StepRunData,
        id: &str,
        steps: &[Step],
        conditions: &[Arc<dyn Condition>],
    ) -> WorkflowResult<Vec<Outbound>> {
        let scope = self.scope(
            frame,
            snapshot,
            data.input.clone(),
            None,
            data.run_count,
            data.iteration + 1,
        );
        let truthy = match self.executor.evaluate_conditions(id, conditions, &scope).await {
            Ok(truthy) => truthy,
            Err(err) => {
                let failed = step_failure(&err, data.input.clone());
                return self
                    .fail_step(frame, &data.execution_path, id, failed)
                    .await;
            }
        };

        let context = self.mark_running(frame, data, id, steps).await?;
        let active: BTreeSet<String> = truthy.iter().map(|&i| steps[i].id.clone()).collect();
        tracing::debug!(
            run_id = %frame.run_id,
            step_id = %id,
            branches = ?active,
            "Conditional branches selected"
        );

        Ok((0..steps.len())
            .map(|index| {
                let path = data.execution_path.child(index);
                if truthy.contains(&index) {
                    let mut run = frame.step_run(path, data.input.clone(), &context);
                    run.active_steps = active.clone();
                    frame.emit(LifecycleEvent::StepRun(run))
                } else {
                    let skipped = StepResult::skipped(data.input.clone());
                    let end = frame.step_end(path, skipped, &context);
                    frame.emit(LifecycleEvent::StepEnd(end))
                }
            })
            .collect())
    }

    /// Mark a composite and all of its branches running
    async fn mark_running(
        &self,
        frame: &Frame,
        data: &StepRunData,
        id: &str,
        steps: &[Step],
    ) -> WorkflowResult<BTreeMap<String, StepResult>> {
        let mut update = self
            .patch(
                frame,
                id,
                ResultPatch::Replace(StepResult::running(data.input.clone())),
            )
            .await?;
        for step in steps {
            update = self
                .patch(
                    frame,
                    &step.id,
                    ResultPatch::Replace(StepResult::running(data.input.clone())),
                )
                .await?;
        }
        Ok(update.context)
    }

    async fn run_timer(
        &self,
        frame: &Frame,
        data: &StepRunData,
        id: &str,
        delay: Result<i64, StepError>,
    ) -> WorkflowResult<Vec<Outbound>> {
        let ms = match delay {
            Ok(ms) => ms.max(0),
            Err(err) => {
                let failed = step_failure(&err, data.input.clone());
                return self
                    .fail_step(frame, &data.execution_path, id, failed)
                    .await;
            }
        };

        let started_at = Utc::now();
        let running = StepResult::Running {
            payload: data.input.clone(),
            started_at,
            slots: Vec::new(),
        };
        let update = self
            .patch(frame, id, ResultPatch::Replace(running))
            .await?;

        let delay_ms = ms as u64;
        tracing::debug!(run_id = %frame.run_id, step_id = %id, delay_ms, "Timer scheduled");
        self.notify(WatchEvent::StepWaiting {
            run_id: frame.run_id.clone(),
            step_id: id.to_string(),
            wait: WaitKind::Timer { ms: delay_ms },
        })
        .await;

        let result = StepResult::Success {
            output: data.input.clone(),
            payload: data.input.clone(),
            resume_payload: None,
            started_at,
            ended_at: started_at + chrono::Duration::milliseconds(ms),
        };
        let end = frame.step_end(data.execution_path.clone(), result, &update.context);
        let event = WorkflowEvent::new(&frame.run_id, LifecycleEvent::StepEnd(end));
        Ok(vec![schedule(delay_ms, event)])
    }

    // ── Foreach ──────────────────────────────────────────────────────

    async fn run_foreach(
        &self,
        frame: &Frame,
        data: &StepRunData,
        step: &Step,
        concurrency: usize,
    ) -> WorkflowResult<Vec<Outbound>> {
        let path = &data.execution_path;
        let Value::Array(items) = &data.input else {
            return Err(WorkflowError::InvalidInput {
                step_id: step.id.clone(),
                reason: format!("foreach expects an array, got {}", value_kind(&data.input)),
            });
        };

        if items.is_empty() {
            let done = StepResult::success(Value::Array(Vec::new()), data.input.clone(), Utc::now());
            let end = frame.step_end(path.clone(), done, &data.step_results);
            return Ok(vec![frame.emit(LifecycleEvent::StepEnd(end))]);
        }

        let initial = concurrency.min(items.len());
        let start = self
            .patch(
                frame,
                &step.id,
                ResultPatch::ForeachStart {
                    payload: data.input.clone(),
                    initial,
                },
            )
            .await?;

        if start.outcome.applied {
            tracing::debug!(
                run_id = %frame.run_id,
                step_id = %step.id,
                total = items.len(),
                concurrency,
                "Foreach started"
            );
            self.notify(WatchEvent::StepStart {
                run_id: frame.run_id.clone(),
                step_id: step.id.clone(),
                payload: data.input.clone(),
            })
            .await;
            return Ok((0..initial)
                .map(|slot| slot_run(frame, path, slot, &items[slot], &start.context))
                .collect());
        }

        self.pull_foreach(frame, path, step, items, &start.context)
            .await
    }

    /// Finish the foreach, dispatch one more slot, or report a suspended
    /// slot once nothing else is in flight
    async fn pull_foreach(
        &self,
        frame: &Frame,
        path: &ExecutionPath,
        step: &Step,
        items: &[Value],
        context: &BTreeMap<String, StepResult>,
    ) -> WorkflowResult<Vec<Outbound>> {
        let total = items.len();
        let Some(container) = context.get(&step.id) else {
            return Ok(Vec::new());
        };
        let StepResult::Running {
            slots,
            payload,
            started_at,
        } = container
        else {
            return Ok(Vec::new());
        };

        if slots.len() == total && slots.iter().all(SlotState::is_complete) {
            tracing::debug!(run_id = %frame.run_id, step_id = %step.id, "Foreach complete");
            let done = StepResult::success(container.output(), payload.clone(), *started_at);
            let end = frame.step_end(path.clone(), done, context);
            return Ok(vec![frame.emit(LifecycleEvent::StepEnd(end))]);
        }

        let dispatch = self
            .patch(frame, &step.id, ResultPatch::ForeachDispatch { total })
            .await?;
        if let Some(slot) = dispatch.outcome.slot {
            return Ok(vec![slot_run(
                frame,
                path,
                slot,
                &items[slot],
                &dispatch.context,
            )]);
        }

        let Some(StepResult::Running { slots, .. }) = dispatch.context.get(&step.id) else {
            return Ok(Vec::new());
        };
        if slots.iter().any(|slot| *slot == SlotState::Pending) {
            return Ok(Vec::new());
        }
        let Some((index, suspend_payload)) =
            slots.iter().enumerate().find_map(|(index, slot)| match slot {
                SlotState::Suspended(payload) => Some((index, payload.clone())),
                _ => None,
            })
        else {
            return Ok(Vec::new());
        };

        let slot_path = path.child(index);
        let state = self
            .update(
                frame,
                RunStateUpdate::status(RunStatus::Suspended)
                    .with_suspended(step.id.clone(), slot_path.clone()),
            )
            .await?;
        let result = StepResult::Suspended {
            payload: items[index].clone(),
            suspend_payload,
            marker: SuspendMarker {
                run_id: frame.run_id.clone(),
                path: vec![step.id.clone()],
            },
            started_at: *started_at,
            suspended_at: Utc::now(),
        };
        let suspend = frame.terminal(slot_path, Some(result), &state.context);
        Ok(vec![frame.emit(LifecycleEvent::Suspend(suspend))])
    }
}

fn slot_run(
    frame: &Frame,
    path: &ExecutionPath,
    slot: usize,
    item: &Value,
    context: &BTreeMap<String, StepResult>,
) -> Outbound {
    let run = frame.step_run(path.child(slot), item.clone(), context);
    frame.emit(LifecycleEvent::StepRun(run))
}

/// Failed result for a predicate or timer function error
pub(super) fn step_failure(err: &StepError, payload: Value) -> StepResult {
    StepResult::failed(
        StepFailure::from_error(err).with_category(ErrorCategory::Step),
        payload,
        Utc::now(),
    )
}

fn value_kind(value: &Value) -> &'static str {
    match value {
        Value::Null => "null",
        Value::Bool(_) => "a boolean",
        Value::Number(_) => "a number",
        Value::String(_) => "a string",
        Value::Array(_) => "an array",
        Value::Object(_) => "an object",
    }
}
