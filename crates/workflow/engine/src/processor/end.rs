//! `workflow.step.end`: persist a result, then fan in, loop or advance

use chrono::Utc;
use serde_json::{Map, Value};
use std::collections::BTreeMap;
use std::sync::Arc;
use workflow_types::{
    ErrorCategory, ExecutionPath, LifecycleEvent, LoopType, ResultPatch, RunStateUpdate,
    RunStatus, StepEndData, StepFailure, StepResult, WatchEvent, WorkflowError, WorkflowResult,
    WorkflowRunState,
};

use super::run::step_failure;
use super::{finished, EventProcessor, Frame, Outbound};
use crate::graph::{Node, StepFlowEntry};
use crate::step::{Condition, Step};

impl EventProcessor {
    pub(super) async fn on_step_end(
        &self,
        frame: &Frame,
        data: &StepEndData,
    ) -> WorkflowResult<Vec<Outbound>> {
        let snapshot = self.load(frame).await?;
        if finished(&snapshot, "workflow.step.end") {
            return Ok(Vec::new());
        }

        let path = &data.execution_path;
        let node = frame.workflow.resolve(path)?;
        if let Node::Branch {
            entry: StepFlowEntry::Foreach { step, .. },
            index,
            ..
        } = node
        {
            return self.end_slot(frame, data, step, index).await;
        }

        let step_id = node.step_id();
        let update = self
            .patch(frame, step_id, ResultPatch::Replace(data.result.clone()))
            .await?;
        if !update.outcome.applied {
            tracing::debug!(
                run_id = %frame.run_id,
                step_id = %step_id,
                path = %path,
                "Duplicate step.end ignored"
            );
            return Ok(Vec::new());
        }
        self.notify_result(frame, step_id, &data.result).await;

        match &data.result {
            StepResult::Failed { .. } => {
                return Ok(vec![fail(frame, path, data.result.clone(), &update.context)])
            }
            StepResult::Suspended { .. } => {
                return self
                    .suspend_at(frame, step_id, path, data.result.clone())
                    .await
            }
            StepResult::Running { .. } | StepResult::Waiting { .. } => {
                return Ok(vec![fail(
                    frame,
                    path,
                    unfinished(step_id, &data.result),
                    &update.context,
                )])
            }
            StepResult::Success { .. } | StepResult::Skipped { .. } => {}
        }

        match node {
            Node::Branch { entry, .. } => {
                self.fan_in(frame, path, entry, &update.context).await
            }
            Node::Entry(StepFlowEntry::Loop {
                step,
                condition,
                loop_type,
            }) => {
                self.continue_loop(
                    frame,
                    &snapshot,
                    data,
                    step,
                    condition,
                    *loop_type,
                    &update.context,
                )
                .await
            }
            Node::Entry(_) => Ok(advance(frame, path, &data.result, &update.context)),
        }
    }

    /// Write a foreach iteration into its slot and pull the next one
    async fn end_slot(
        &self,
        frame: &Frame,
        data: &StepEndData,
        step: &Step,
        index: usize,
    ) -> WorkflowResult<Vec<Outbound>> {
        let path = &data.execution_path;
        let update = self
            .patch(
                frame,
                &step.id,
                ResultPatch::ForeachSlot {
                    index,
                    result: data.result.clone(),
                },
            )
            .await?;
        if !update.outcome.applied {
            tracing::debug!(
                run_id = %frame.run_id,
                step_id = %step.id,
                slot = index,
                "Duplicate foreach step.end ignored"
            );
            return Ok(Vec::new());
        }
        self.notify_result(frame, &step.id, &data.result).await;

        match &data.result {
            StepResult::Failed { .. } => {
                Ok(vec![fail(frame, path, data.result.clone(), &update.context)])
            }
            StepResult::Suspended { .. } => {
                self.suspend_at(frame, &step.id, path, data.result.clone())
                    .await
            }
            StepResult::Running { .. } | StepResult::Waiting { .. } => Ok(vec![fail(
                frame,
                path,
                unfinished(&step.id, &data.result),
                &update.context,
            )]),
            StepResult::Success { .. } | StepResult::Skipped { .. } => {
                let top = path
                    .parent()
                    .ok_or_else(|| WorkflowError::StepMissingAtPath(path.clone()))?;
                let input = update
                    .context
                    .get(&step.id)
                    .map(|container| container.payload().clone())
                    .unwrap_or(Value::Null);
                let run = frame.step_run(top, input, &update.context);
                Ok(vec![frame.emit(LifecycleEvent::StepRun(run))])
            }
        }
    }

    #[allow(clippy::too_many_arguments)]
    async fn continue_loop(
        &self,
        frame: &Frame,
        snapshot: &WorkflowRunState,
        data: &StepEndData,
        step: &Step,
        condition: &Arc<dyn Condition>,
        loop_type: LoopType,
        context: &BTreeMap<String, StepResult>,
    ) -> WorkflowResult<Vec<Outbound>> {
        let path = &data.execution_path;
        let output = data.result.output();
        let mut scope = self.scope(
            frame,
            snapshot,
            output.clone(),
            None,
            data.run_count,
            data.iteration + 1,
        );
        scope.step_results = Arc::new(context.clone());

        let holds = match self
            .executor
            .evaluate_condition(&step.id, condition, &scope)
            .await
        {
            Ok(holds) => holds,
            Err(err) => {
                return self
                    .fail_step(frame, path, &step.id, step_failure(&err, output))
                    .await
            }
        };

        if !loop_type.should_continue(holds) {
            return Ok(advance(frame, path, &data.result, context));
        }

        tracing::debug!(
            run_id = %frame.run_id,
            step_id = %step.id,
            iteration = data.iteration + 1,
            "Loop continues"
        );
        let mut run = frame.step_run(path.clone(), output, context);
        run.run_count = data.run_count + 1;
        run.iteration = data.iteration + 1;
        Ok(vec![frame.emit(LifecycleEvent::StepRun(run))])
    }

    /// Complete a parallel or conditional entry once every branch is
    /// done, or suspend the run again when only suspended branches remain
    async fn fan_in(
        &self,
        frame: &Frame,
        path: &ExecutionPath,
        entry: &StepFlowEntry,
        context: &BTreeMap<String, StepResult>,
    ) -> WorkflowResult<Vec<Outbound>> {
        let steps = entry.branches();
        let Some(parent) = path.parent() else {
            return Ok(Vec::new());
        };

        let mut suspended = None;
        for (index, step) in steps.iter().enumerate() {
            match context.get(&step.id) {
                Some(result) if result.is_complete() => {}
                Some(result @ StepResult::Suspended { .. }) => {
                    if suspended.is_none() {
                        suspended = Some((index, step, result));
                    }
                }
                _ => {
                    tracing::debug!(
                        run_id = %frame.run_id,
                        step_id = %entry.id(),
                        "Waiting for remaining branches"
                    );
                    return Ok(Vec::new());
                }
            }
        }

        if let Some((index, step, result)) = suspended {
            tracing::debug!(
                run_id = %frame.run_id,
                step_id = %entry.id(),
                branch = %step.id,
                "Only suspended branches remain"
            );
            return self
                .suspend_at(frame, &step.id, &parent.child(index), result.clone())
                .await;
        }

        let output: Map<String, Value> = steps
            .iter()
            .filter_map(|step| match context.get(&step.id) {
                Some(StepResult::Success { output, .. }) => Some((step.id.clone(), output.clone())),
                _ => None,
            })
            .collect();
        let (payload, started_at) = context
            .get(entry.id())
            .map(|composite| (composite.payload().clone(), composite.started_at()))
            .unwrap_or_else(|| (Value::Null, Utc::now()));

        let result = StepResult::success(Value::Object(output), payload, started_at);
        let end = frame.step_end(parent, result, context);
        Ok(vec![frame.emit(LifecycleEvent::StepEnd(end))])
    }

    /// Record a suspended step and suspend the run
    async fn suspend_at(
        &self,
        frame: &Frame,
        step_id: &str,
        path: &ExecutionPath,
        result: StepResult,
    ) -> WorkflowResult<Vec<Outbound>> {
        let state = self
            .update(
                frame,
                RunStateUpdate::status(RunStatus::Suspended).with_suspended(step_id, path.clone()),
            )
            .await?;
        tracing::debug!(
            run_id = %frame.run_id,
            step_id = %step_id,
            path = %path,
            "Step suspended"
        );
        let suspend = frame.terminal(path.clone(), Some(result), &state.context);
        Ok(vec![frame.emit(LifecycleEvent::Suspend(suspend))])
    }

    /// Persist a failed result for `step_id` and fail the run
    pub(super) async fn fail_step(
        &self,
        frame: &Frame,
        path: &ExecutionPath,
        step_id: &str,
        result: StepResult,
    ) -> WorkflowResult<Vec<Outbound>> {
        let update = self
            .patch(frame, step_id, ResultPatch::Replace(result.clone()))
            .await?;
        self.notify_result(frame, step_id, &result).await;
        Ok(vec![fail(frame, path, result, &update.context)])
    }

    async fn notify_result(&self, frame: &Frame, step_id: &str, result: &StepResult) {
        self.notify(WatchEvent::StepResult {
            run_id: frame.run_id.clone(),
            step_id: step_id.to_string(),
            result: result.clone(),
        })
        .await;
        match result {
            StepResult::Suspended {
                suspend_payload, ..
            } => {
                self.notify(WatchEvent::StepSuspended {
                    run_id: frame.run_id.clone(),
                    step_id: step_id.to_string(),
                    suspend_payload: suspend_payload.clone(),
                })
                .await
            }
            result if result.is_terminal() => {
                self.notify(WatchEvent::StepFinish {
                    run_id: frame.run_id.clone(),
                    step_id: step_id.to_string(),
                })
                .await
            }
            _ => {}
        }
    }
}

/// Run the next top-level entry, or end the run after the last one
fn advance(
    frame: &Frame,
    path: &ExecutionPath,
    result: &StepResult,
    context: &BTreeMap<String, StepResult>,
) -> Vec<Outbound> {
    match path.next_sibling() {
        Some(next) if next.top().is_some_and(|top| top < frame.workflow.len()) => {
            let run = frame.step_run(next, result.output(), context);
            vec![frame.emit(LifecycleEvent::StepRun(run))]
        }
        _ => {
            let end = frame.terminal(path.clone(), Some(result.clone()), context);
            vec![frame.emit(LifecycleEvent::End(end))]
        }
    }
}

fn fail(
    frame: &Frame,
    path: &ExecutionPath,
    result: StepResult,
    context: &BTreeMap<String, StepResult>,
) -> Outbound {
    let data = frame.terminal(path.clone(), Some(result), context);
    frame.emit(LifecycleEvent::Fail(data))
}

fn unfinished(step_id: &str, result: &StepResult) -> StepResult {
    let failure = StepFailure::new(format!(
        "step '{}' ended while still {:?}",
        step_id,
        result.status()
    ))
    .with_category(ErrorCategory::Structural);
    StepResult::failed(failure, result.payload().clone(), Utc::now())
}
