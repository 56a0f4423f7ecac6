//! Step executor: runs one leaf step and turns its outcome into a result
//!
//! Nothing a step body does escapes this boundary: errors and panics
//! become `failed` results, and `suspend`/`bail` requests recorded on the
//! context become `suspended` results and [`StepOutcome::Bailed`].

use chrono::{DateTime, Utc};
use futures::future::join_all;
use futures::FutureExt;
use serde_json::Value;
use std::collections::BTreeMap;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use workflow_bus::MessageBus;
use workflow_types::{ErrorCategory, StepFailure, StepResult, SuspendMarker};

use crate::abort::AbortController;
use crate::graph::{SleepDate, SleepDuration};
use crate::step::{Condition, StepContext, StepControl, StepError, StepFn};

/// Everything a step or predicate sees about the run it belongs to
#[derive(Clone)]
pub struct StepScope {
    pub run_id: String,
    pub workflow_id: String,
    pub input: Value,
    pub init_data: Value,
    pub step_results: Arc<BTreeMap<String, StepResult>>,
    pub runtime_context: Arc<BTreeMap<String, Value>>,
    pub resume_data: Option<Value>,
    pub run_count: u32,
    pub iteration_count: u32,
}

impl StepScope {
    fn context(&self, step_id: &str, abort: AbortController) -> StepContext {
        StepContext::new(
            &self.run_id,
            &self.workflow_id,
            step_id,
            self.input.clone(),
            self.init_data.clone(),
            self.step_results.clone(),
            self.runtime_context.clone(),
            abort,
        )
        .with_resume_data(self.resume_data.clone())
        .with_counts(self.run_count, self.iteration_count)
    }
}

/// What executing a leaf produced
#[derive(Clone, Debug, PartialEq)]
pub enum StepOutcome {
    Result(StepResult),
    /// The step asked to finish the run with `output`
    Bailed {
        output: Value,
        payload: Value,
        started_at: DateTime<Utc>,
    },
}

/// Runs step bodies, predicates and timer functions
#[derive(Clone)]
pub struct StepExecutor {
    bus: Arc<dyn MessageBus>,
}

impl StepExecutor {
    pub fn new(bus: Arc<dyn MessageBus>) -> Self {
        Self { bus }
    }

    /// Execute one leaf step
    pub async fn execute(
        &self,
        step_id: &str,
        body: &Arc<dyn StepFn>,
        scope: &StepScope,
        abort: AbortController,
    ) -> StepOutcome {
        let started_at = Utc::now();
        let ctx = scope.context(step_id, abort).with_bus(self.bus.clone());
        let control = ctx.clone();

        let outcome = AssertUnwindSafe(body.run(ctx)).catch_unwind().await;
        let payload = scope.input.clone();

        let output = match outcome {
            Ok(Ok(output)) => output,
            Ok(Err(err)) => {
                tracing::debug!(run_id = %scope.run_id, step_id = %step_id, error = %err, "Step failed");
                return StepOutcome::Result(Self::failure(&err, payload, started_at));
            }
            Err(panic) => {
                let err = StepError::Panicked(panic_message(panic.as_ref()));
                tracing::warn!(run_id = %scope.run_id, step_id = %step_id, error = %err, "Step panicked");
                return StepOutcome::Result(Self::failure(&err, payload, started_at));
            }
        };

        match control.take_control() {
            Some(StepControl::Suspend(suspend_payload)) => {
                StepOutcome::Result(StepResult::Suspended {
                    payload,
                    suspend_payload,
                    marker: SuspendMarker {
                        run_id: scope.run_id.clone(),
                        path: vec![step_id.to_string()],
                    },
                    started_at,
                    suspended_at: Utc::now(),
                })
            }
            Some(StepControl::Bail(output)) => StepOutcome::Bailed {
                output,
                payload,
                started_at,
            },
            None => StepOutcome::Result(StepResult::Success {
                output,
                payload,
                resume_payload: scope.resume_data.clone(),
                started_at,
                ended_at: Utc::now(),
            }),
        }
    }

    fn failure(err: &StepError, payload: Value, started_at: DateTime<Utc>) -> StepResult {
        StepResult::failed(
            StepFailure::from_error(err).with_category(ErrorCategory::Step),
            payload,
            started_at,
        )
    }

    /// Evaluate one predicate; `suspend`/`bail` are rejected
    pub async fn evaluate_condition(
        &self,
        step_id: &str,
        condition: &Arc<dyn Condition>,
        scope: &StepScope,
    ) -> Result<bool, StepError> {
        let ctx = scope
            .context(step_id, AbortController::new())
            .for_predicate();
        match AssertUnwindSafe(condition.evaluate(ctx)).catch_unwind().await {
            Ok(result) => result,
            Err(panic) => Err(StepError::Panicked(panic_message(panic.as_ref()))),
        }
    }

    /// Evaluate all predicates concurrently, returning the indices that
    /// hold in branch order
    pub async fn evaluate_conditions(
        &self,
        step_id: &str,
        conditions: &[Arc<dyn Condition>],
        scope: &StepScope,
    ) -> Result<Vec<usize>, StepError> {
        let results = join_all(
            conditions
                .iter()
                .map(|condition| self.evaluate_condition(step_id, condition, scope)),
        )
        .await;

        let mut truthy = Vec::new();
        for (index, result) in results.into_iter().enumerate() {
            if result? {
                truthy.push(index);
            }
        }
        Ok(truthy)
    }

    /// Milliseconds a `sleep` entry waits; may be negative
    pub async fn resolve_sleep(
        &self,
        step_id: &str,
        duration: &SleepDuration,
        scope: &StepScope,
    ) -> Result<i64, StepError> {
        match duration {
            SleepDuration::Fixed(ms) => Ok(i64::try_from(*ms).unwrap_or(i64::MAX)),
            SleepDuration::Dynamic(f) => {
                let ctx = scope
                    .context(step_id, AbortController::new())
                    .for_predicate();
                f.duration_ms(ctx).await
            }
        }
    }

    /// Milliseconds until a `sleepUntil` entry's instant; may be negative
    pub async fn resolve_sleep_until(
        &self,
        step_id: &str,
        date: &SleepDate,
        scope: &StepScope,
    ) -> Result<i64, StepError> {
        let until = match date {
            SleepDate::Fixed(date) => *date,
            SleepDate::Dynamic(f) => {
                let ctx = scope
                    .context(step_id, AbortController::new())
                    .for_predicate();
                f.until(ctx).await?
            }
        };
        Ok((until - Utc::now()).num_milliseconds())
    }
}

fn panic_message(panic: &(dyn std::any::Any + Send)) -> String {
    if let Some(message) = panic.downcast_ref::<&str>() {
        message.to_string()
    } else if let Some(message) = panic.downcast_ref::<String>() {
        message.clone()
    } else {
        "unknown panic".to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::step::predicate;
    use serde_json::json;
    use std::time::Duration;
    use workflow_bus::InMemoryBus;

    fn executor() -> StepExecutor {
        StepExecutor::new(Arc::new(InMemoryBus::default()))
    }

    fn scope(input: Value) -> StepScope {
        StepScope {
            run_id: "run-1".into(),
            workflow_id: "wf".into(),
            input,
            init_data: json!({}),
            step_results: Arc::new(BTreeMap::new()),
            runtime_context: Arc::new(BTreeMap::new()),
            resume_data: None,
            run_count: 0,
            iteration_count: 0,
        }
    }

    fn body<F, Fut>(f: F) -> Arc<dyn StepFn>
    where
        F: Fn(StepContext) -> Fut + Send + Sync + 'static,
        Fut: std::future::Future<Output = Result<Value, StepError>> + Send + 'static,
    {
        Arc::new(f)
    }

    #[tokio::test]
    async fn test_success_carries_payload() {
        let step = body(|ctx| async move { Ok(json!(ctx.input_data()["n"].as_i64().unwrap_or(0) + 1)) });
        let outcome = executor()
            .execute("inc", &step, &scope(json!({"n": 1})), AbortController::new())
            .await;
        match outcome {
            StepOutcome::Result(StepResult::Success { output, payload, .. }) => {
                assert_eq!(output, json!(2));
                assert_eq!(payload, json!({"n": 1}));
            }
            other => panic!("unexpected {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_error_becomes_failed_result() {
        let step = body(|_ctx| async move { Err(StepError::failed("boom")) });
        let outcome = executor()
            .execute("bad", &step, &scope(json!(null)), AbortController::new())
            .await;
        match outcome {
            StepOutcome::Result(StepResult::Failed { error, .. }) => {
                assert_eq!(error.message, "boom");
                assert_eq!(error.category, Some(ErrorCategory::Step));
            }
            other => panic!("unexpected {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_panic_is_contained() {
        let step = body(|_ctx| async move {
            if true {
                panic!("kaboom");
            }
            Ok(json!(null))
        });
        let outcome = executor()
            .execute("panics", &step, &scope(json!(null)), AbortController::new())
            .await;
        match outcome {
            StepOutcome::Result(StepResult::Failed { error, .. }) => {
                assert!(error.message.contains("kaboom"));
            }
            other => panic!("unexpected {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_suspend_stamps_marker() {
        let step = body(|ctx| async move { ctx.suspend(json!({"ask": "approve"})) });
        let outcome = executor()
            .execute("gate", &step, &scope(json!(1)), AbortController::new())
            .await;
        match outcome {
            StepOutcome::Result(StepResult::Suspended {
                suspend_payload,
                marker,
                ..
            }) => {
                assert_eq!(suspend_payload, json!({"ask": "approve"}));
                assert_eq!(marker.run_id, "run-1");
                assert_eq!(marker.path, vec!["gate".to_string()]);
            }
            other => panic!("unexpected {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_bail() {
        let step = body(|ctx| async move { ctx.bail(json!("early")) });
        let outcome = executor()
            .execute("bail", &step, &scope(json!(1)), AbortController::new())
            .await;
        assert!(matches!(outcome, StepOutcome::Bailed { output, .. } if output == json!("early")));
    }

    #[tokio::test]
    async fn test_resume_data_is_visible_and_recorded() {
        let step = body(|ctx| async move { Ok(ctx.resume_data().cloned().unwrap_or(Value::Null)) });
        let mut scope = scope(json!(1));
        scope.resume_data = Some(json!({"approved": true}));
        let outcome = executor()
            .execute("gate", &step, &scope, AbortController::new())
            .await;
        match outcome {
            StepOutcome::Result(StepResult::Success {
                output,
                resume_payload,
                ..
            }) => {
                assert_eq!(output, json!({"approved": true}));
                assert_eq!(resume_payload, Some(json!({"approved": true})));
            }
            other => panic!("unexpected {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_abort_signal_is_observable() {
        let step = body(|ctx| async move {
            let signal = ctx.abort_signal();
            tokio::select! {
                _ = signal.aborted() => Err(StepError::Aborted),
                _ = tokio::time::sleep(Duration::from_secs(5)) => Ok(json!("finished")),
            }
        });
        let controller = AbortController::new();
        let trigger = controller.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(20)).await;
            trigger.abort();
        });
        let outcome = executor()
            .execute("slow", &step, &scope(json!(null)), controller)
            .await;
        assert!(matches!(
            outcome,
            StepOutcome::Result(StepResult::Failed { error, .. }) if error.message == "Step aborted"
        ));
    }

    #[tokio::test]
    async fn test_conditions_keep_branch_order() {
        let conditions = vec![
            predicate(|_ctx| async {
                tokio::time::sleep(Duration::from_millis(20)).await;
                Ok(true)
            }),
            predicate(|_ctx| async { Ok(false) }),
            predicate(|ctx| async move { Ok(ctx.input_data()["go"] == json!(true)) }),
        ];
        let truthy = executor()
            .evaluate_conditions("conditional.0", &conditions, &scope(json!({"go": true})))
            .await
            .unwrap();
        assert_eq!(truthy, vec![0, 2]);
    }

    #[tokio::test]
    async fn test_predicates_cannot_suspend() {
        let condition = predicate(|ctx| async move {
            ctx.suspend(json!(null))?;
            Ok(true)
        });
        let err = executor()
            .evaluate_condition("loop", &condition, &scope(json!(null)))
            .await
            .unwrap_err();
        assert!(matches!(err, StepError::NotImplemented("suspend")));
    }

    #[tokio::test]
    async fn test_sleep_resolution() {
        let executor = executor();
        let scope = scope(json!({"ms": 25}));
        assert_eq!(
            executor
                .resolve_sleep("sleep.0", &SleepDuration::Fixed(10), &scope)
                .await
                .unwrap(),
            10
        );
        let dynamic = SleepDuration::Dynamic(Arc::new(|ctx: StepContext| async move {
            Ok(ctx.input_data()["ms"].as_i64().unwrap_or(0))
        }));
        assert_eq!(
            executor.resolve_sleep("sleep.0", &dynamic, &scope).await.unwrap(),
            25
        );
        let past = SleepDate::Fixed(Utc::now() - chrono::Duration::seconds(5));
        assert!(
            executor
                .resolve_sleep_until("sleep-until.0", &past, &scope)
                .await
                .unwrap()
                < 0
        );
    }
}
