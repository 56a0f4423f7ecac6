//! Run-level transitions: start, resume, terminal events, cancel and
//! external user events

use chrono::Utc;
use serde_json::Value;
use std::collections::BTreeSet;
use workflow_types::{
    CancelData, ExecutionPath, LifecycleEvent, ParentWorkflow, ResumeData, ResumeTarget,
    RunStateUpdate, RunStatus, SlotState, StartData, StepEndData, StepFailure, StepResult,
    StepRunData, SuspendMarker, TerminalData, UserEventData, WatchEvent, WorkflowEvent,
    WorkflowResult, WorkflowRunState,
};

use super::{finished, nested_run_id, schedule, EventProcessor, Frame, Outbound};
use crate::graph::{Node, StepFlowEntry};

impl EventProcessor {
    // ── Start / Resume ───────────────────────────────────────────────

    pub(super) async fn on_start(
        &self,
        frame: &Frame,
        data: &StartData,
    ) -> WorkflowResult<Vec<Outbound>> {
        let existing = self
            .store
            .load_workflow_snapshot(frame.workflow_id(), &frame.run_id)
            .await?;

        let mut state = WorkflowRunState::new(
            frame.workflow_id(),
            &frame.run_id,
            frame.workflow.serialize(),
            data.input.clone(),
        )
        .with_runtime_context(data.runtime_context.clone())
        .with_parent(data.parent.clone())
        .with_start_id(data.start_id.clone())
        .with_status(RunStatus::Running);

        match existing {
            Some(previous) if previous.started_by(&data.start_id) => {
                tracing::debug!(
                    run_id = %frame.run_id,
                    start_id = %data.start_id,
                    status = %previous.status,
                    "Duplicate start ignored"
                );
                return Ok(Vec::new());
            }
            Some(previous) if previous.status == RunStatus::Canceled => {
                tracing::warn!(run_id = %frame.run_id, "Start for canceled run ignored");
                return Ok(Vec::new());
            }
            Some(previous) if previous.status == RunStatus::Pending => {
                state.created_at = previous.created_at;
            }
            _ => {}
        }

        self.store
            .persist_workflow_snapshot(frame.workflow_id(), &frame.run_id, state.clone())
            .await?;

        tracing::info!(
            run_id = %frame.run_id,
            workflow_id = %frame.workflow_id(),
            nested = frame.parent.is_some(),
            "Workflow run started"
        );
        self.notify(WatchEvent::WorkflowStart {
            run_id: frame.run_id.clone(),
            workflow_id: frame.workflow_id().to_string(),
        })
        .await;

        let run = frame.step_run(ExecutionPath::root(), data.input.clone(), &state.context);
        Ok(vec![frame.emit(LifecycleEvent::StepRun(run))])
    }

    pub(super) async fn on_resume(
        &self,
        frame: &Frame,
        data: &ResumeData,
    ) -> WorkflowResult<Vec<Outbound>> {
        let snapshot = self.load(frame).await?;
        if finished(&snapshot, "workflow.resume") {
            return Ok(Vec::new());
        }

        let mut update = RunStateUpdate::status(RunStatus::Running);
        if let Some(step_id) = data.resume.steps.first() {
            update = update.without_suspended(step_id.clone());
        }
        let state = self.update(frame, update).await?;

        let node = frame.workflow.resolve(&data.execution_path)?;
        let input = resume_input(&state, &node);

        tracing::info!(
            run_id = %frame.run_id,
            path = %data.execution_path,
            steps = ?data.resume.steps,
            "Workflow run resumed"
        );

        let mut run = frame.step_run(data.execution_path.clone(), input, &state.context);
        run.resume = Some(data.resume.clone());
        run.active_steps = BTreeSet::from([node.step_id().to_string()]);
        Ok(vec![frame.emit(LifecycleEvent::StepRun(run))])
    }

    // ── Terminal Events ──────────────────────────────────────────────

    pub(super) async fn on_suspend(
        &self,
        frame: &Frame,
        event: &WorkflowEvent,
        data: &TerminalData,
    ) -> WorkflowResult<Vec<Outbound>> {
        let snapshot = self.load(frame).await?;
        if finished(&snapshot, "workflow.suspend") {
            return Ok(Vec::new());
        }
        if !snapshot
            .suspended_paths
            .values()
            .any(|path| *path == data.execution_path)
        {
            tracing::debug!(
                run_id = %frame.run_id,
                path = %data.execution_path,
                "Suspend for a resumed path ignored"
            );
            return Ok(Vec::new());
        }
        let state = self
            .update(frame, RunStateUpdate::status(RunStatus::Suspended))
            .await?;
        tracing::info!(
            run_id = %frame.run_id,
            suspended = ?state.suspended_paths.keys().collect::<Vec<_>>(),
            "Workflow run suspended"
        );

        let mut outbound = Vec::new();
        if let (Some(parent), Some(StepResult::Suspended {
            suspend_payload,
            marker,
            started_at,
            ..
        })) = (&frame.parent, &data.result)
        {
            let mut path = vec![parent.step_id.clone()];
            path.extend(marker.path.iter().cloned());
            let result = StepResult::Suspended {
                payload: state.input.clone(),
                suspend_payload: suspend_payload.clone(),
                marker: SuspendMarker {
                    run_id: parent.run_id.clone(),
                    path,
                },
                started_at: *started_at,
                suspended_at: Utc::now(),
            };
            outbound.push(outer_step_end(parent, result));
        }

        self.finish(frame, event, RunStatus::Suspended, &mut outbound)
            .await;
        Ok(outbound)
    }

    pub(super) async fn on_fail(
        &self,
        frame: &Frame,
        event: &WorkflowEvent,
        data: &TerminalData,
    ) -> WorkflowResult<Vec<Outbound>> {
        let snapshot = self.load(frame).await?;
        if finished(&snapshot, "workflow.fail") {
            return Ok(Vec::new());
        }

        let error = data
            .result
            .as_ref()
            .and_then(StepResult::error)
            .cloned()
            .unwrap_or_else(|| StepFailure::new("Workflow failed"));
        let state = self
            .update(
                frame,
                RunStateUpdate::status(RunStatus::Failed).with_error(error.clone()),
            )
            .await?;
        tracing::info!(
            run_id = %frame.run_id,
            path = %data.execution_path,
            error = %error.message,
            "Workflow run failed"
        );

        let mut outbound = Vec::new();
        if let Some(parent) = &frame.parent {
            match self.retry_parent(parent, &state)? {
                Some(retry) => outbound.push(retry),
                None => {
                    let result = StepResult::failed(error, state.input.clone(), state.created_at);
                    outbound.push(outer_step_end(parent, result));
                }
            }
        }

        self.finish(frame, event, RunStatus::Failed, &mut outbound)
            .await;
        Ok(outbound)
    }

    pub(super) async fn on_end(
        &self,
        frame: &Frame,
        event: &WorkflowEvent,
        data: &TerminalData,
    ) -> WorkflowResult<Vec<Outbound>> {
        let snapshot = self.load(frame).await?;
        let mut outbound = Vec::new();

        if snapshot.status == RunStatus::Canceled {
            self.finish(frame, event, RunStatus::Canceled, &mut outbound)
                .await;
            return Ok(outbound);
        }
        if finished(&snapshot, "workflow.end") {
            return Ok(outbound);
        }

        let output = data
            .result
            .as_ref()
            .map(StepResult::output)
            .unwrap_or(Value::Null);
        let state = self
            .update(
                frame,
                RunStateUpdate::status(RunStatus::Success).with_result(output.clone()),
            )
            .await?;
        tracing::info!(run_id = %frame.run_id, "Workflow run completed");

        if let Some(parent) = &frame.parent {
            let result = StepResult::success(output, state.input.clone(), state.created_at);
            outbound.push(outer_step_end(parent, result));
        }

        self.finish(frame, event, RunStatus::Success, &mut outbound)
            .await;
        Ok(outbound)
    }

    async fn finish(
        &self,
        frame: &Frame,
        event: &WorkflowEvent,
        status: RunStatus,
        outbound: &mut Vec<Outbound>,
    ) {
        self.notify(WatchEvent::WorkflowFinish {
            run_id: frame.run_id.clone(),
            status,
        })
        .await;
        outbound.push(Outbound::Finish(event.clone()));
    }

    /// Re-run the outer step of a failed nested run if its retry budget
    /// allows
    fn retry_parent(
        &self,
        parent: &ParentWorkflow,
        state: &WorkflowRunState,
    ) -> WorkflowResult<Option<Outbound>> {
        let outer = self.registry.get(&parent.workflow_id)?;
        let node = outer.resolve(&parent.execution_path)?;
        let Some(step) = node.step() else {
            return Ok(None);
        };
        let retry = outer.retry_for(step, self.config.default_retry());
        if !retry.allows_retry(parent.attempt) {
            return Ok(None);
        }

        tracing::warn!(
            run_id = %parent.run_id,
            step_id = %parent.step_id,
            attempt = parent.attempt + 1,
            "Nested workflow failed, retrying step"
        );
        let run = StepRunData {
            workflow_id: parent.workflow_id.clone(),
            execution_path: parent.execution_path.clone(),
            step_results: parent.step_results.clone(),
            active_steps: BTreeSet::from([step.id.clone()]),
            input: state.input.clone(),
            resume: None,
            parent: parent.parent.as_deref().cloned(),
            run_count: parent.run_count + 1,
            attempt: parent.attempt + 1,
            iteration: parent.iteration,
        };
        let event = WorkflowEvent::new(&parent.run_id, LifecycleEvent::StepRun(run));
        Ok(Some(schedule(retry.delay_ms, event)))
    }

    // ── Cancel ───────────────────────────────────────────────────────

    pub(super) async fn on_cancel(
        &self,
        frame: &Frame,
        event: &WorkflowEvent,
    ) -> WorkflowResult<Vec<Outbound>> {
        let snapshot = self.load(frame).await?;
        if finished(&snapshot, &event.event_type()) {
            return Ok(Vec::new());
        }

        let state = self
            .update(frame, RunStateUpdate::status(RunStatus::Canceled))
            .await?;
        let aborted = self.aborts.abort_run(&frame.run_id);
        tracing::info!(run_id = %frame.run_id, aborted, "Workflow run canceled");

        let mut outbound = Vec::new();
        for (run_id, workflow_id) in nested_runs(frame, &state) {
            outbound.push(Outbound::Lifecycle(WorkflowEvent::new(
                run_id,
                LifecycleEvent::Cancel(CancelData { workflow_id }),
            )));
        }

        let end = frame.terminal(ExecutionPath::root(), None, &state.context);
        outbound.push(frame.emit(LifecycleEvent::End(end)));
        Ok(outbound)
    }

    // ── External Events ──────────────────────────────────────────────

    pub(super) async fn on_user_event(
        &self,
        frame: &Frame,
        data: &UserEventData,
    ) -> WorkflowResult<Vec<Outbound>> {
        let snapshot = self.load(frame).await?;
        if finished(&snapshot, "workflow.user-event") {
            return Ok(Vec::new());
        }
        let Some(path) = snapshot.waiting_paths.get(&data.name).cloned() else {
            tracing::debug!(
                run_id = %frame.run_id,
                event = %data.name,
                "No step waiting for event, ignoring"
            );
            return Ok(Vec::new());
        };

        let node = frame.workflow.resolve(&path)?;
        let step_id = node.step_id().to_string();
        let input = snapshot
            .context
            .get(&step_id)
            .map(|result| result.payload().clone())
            .unwrap_or(Value::Null);

        let state = self
            .update(
                frame,
                RunStateUpdate::status(RunStatus::Running).without_waiting(data.name.clone()),
            )
            .await?;
        tracing::info!(
            run_id = %frame.run_id,
            event = %data.name,
            step_id = %step_id,
            "External event received"
        );

        let mut run = frame.step_run(path, input, &state.context);
        run.resume = Some(ResumeTarget {
            steps: vec![step_id.clone()],
            resume_payload: data.payload.clone(),
        });
        run.active_steps = BTreeSet::from([step_id]);
        Ok(vec![frame.emit(LifecycleEvent::StepRun(run))])
    }
}

/// Translate a nested run's outcome into a `step.end` of the outer run
pub(super) fn outer_step_end(parent: &ParentWorkflow, result: StepResult) -> Outbound {
    let end = StepEndData {
        workflow_id: parent.workflow_id.clone(),
        execution_path: parent.execution_path.clone(),
        step_results: parent.step_results.clone(),
        active_steps: BTreeSet::from([parent.step_id.clone()]),
        result,
        parent: parent.parent.as_deref().cloned(),
        run_count: parent.run_count,
        iteration: parent.iteration,
    };
    Outbound::Lifecycle(WorkflowEvent::new(
        &parent.run_id,
        LifecycleEvent::StepEnd(end),
    ))
}

/// Input a resumed step is re-run with
fn resume_input(state: &WorkflowRunState, node: &Node<'_>) -> Value {
    let Some(result) = state.context.get(node.step_id()) else {
        return Value::Null;
    };
    match node {
        Node::Branch {
            entry: StepFlowEntry::Foreach { .. },
            index,
            ..
        } => result.payload().get(*index).cloned().unwrap_or(Value::Null),
        _ => result.payload().clone(),
    }
}

/// Nested runs started by workflow steps that are still running
fn nested_runs(frame: &Frame, state: &WorkflowRunState) -> Vec<(String, String)> {
    let mut runs = Vec::new();
    for entry in frame.workflow.entries() {
        match entry {
            StepFlowEntry::Foreach { step, .. } => {
                let (Some(workflow), Some(StepResult::Running { slots, .. })) =
                    (step.nested(), state.context.get(&step.id))
                else {
                    continue;
                };
                for (index, slot) in slots.iter().enumerate() {
                    if *slot == SlotState::Pending {
                        runs.push((
                            nested_run_id(&frame.run_id, &step.id, Some(index)),
                            workflow.id().to_string(),
                        ));
                    }
                }
            }
            other => {
                let steps = match other.single_step() {
                    Some(step) => vec![step],
                    None => other.branches().iter().collect(),
                };
                for step in steps {
                    let running = matches!(
                        state.context.get(&step.id),
                        Some(StepResult::Running { .. })
                    );
                    if let (Some(workflow), true) = (step.nested(), running) {
                        runs.push((
                            nested_run_id(&frame.run_id, &step.id, None),
                            workflow.id().to_string(),
                        ));
                    }
                }
            }
        }
    }
    runs
}
