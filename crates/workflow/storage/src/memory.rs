//! In-memory workflow store for development and testing.
//!
//! Snapshots live in a [`DashMap`]; every update holds the shard lock of its
//! run key for the whole read-modify-write, so concurrent patches to the
//! same run are applied one after the other.

use async_trait::async_trait;
use dashmap::DashMap;
use std::sync::Arc;
use workflow_types::{ResultPatch, ResultsUpdate, RunStateUpdate, RunSummary, WorkflowRunState};

use crate::traits::{QueryWindow, WorkflowStore};
use crate::{StorageError, StorageResult};

type RunKey = (String, String);

/// In-memory workflow store.
#[derive(Clone, Default)]
pub struct InMemoryWorkflowStore {
    runs: Arc<DashMap<RunKey, WorkflowRunState>>,
}

impl InMemoryWorkflowStore {
    /// Create an empty store.
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of stored runs across all workflows.
    pub fn total_count(&self) -> usize {
        self.runs.len()
    }

    /// Remove every run.
    pub fn clear(&self) {
        self.runs.clear();
    }

    fn key(workflow_name: &str, run_id: &str) -> RunKey {
        (workflow_name.to_string(), run_id.to_string())
    }

    fn not_found(workflow_name: &str, run_id: &str) -> StorageError {
        StorageError::RunNotFound {
            workflow_name: workflow_name.to_string(),
            run_id: run_id.to_string(),
        }
    }
}

#[async_trait]
impl WorkflowStore for InMemoryWorkflowStore {
    async fn persist_workflow_snapshot(
        &self,
        workflow_name: &str,
        run_id: &str,
        snapshot: WorkflowRunState,
    ) -> StorageResult<()> {
        self.runs.insert(Self::key(workflow_name, run_id), snapshot);
        Ok(())
    }

    async fn load_workflow_snapshot(
        &self,
        workflow_name: &str,
        run_id: &str,
    ) -> StorageResult<Option<WorkflowRunState>> {
        Ok(self
            .runs
            .get(&Self::key(workflow_name, run_id))
            .map(|entry| entry.value().clone()))
    }

    async fn update_workflow_state(
        &self,
        workflow_name: &str,
        run_id: &str,
        update: RunStateUpdate,
    ) -> StorageResult<WorkflowRunState> {
        let mut entry = self
            .runs
            .get_mut(&Self::key(workflow_name, run_id))
            .ok_or_else(|| Self::not_found(workflow_name, run_id))?;
        update.apply(entry.value_mut());
        Ok(entry.value().clone())
    }

    async fn update_workflow_results(
        &self,
        workflow_name: &str,
        run_id: &str,
        step_id: &str,
        patch: ResultPatch,
    ) -> StorageResult<ResultsUpdate> {
        let mut entry = self
            .runs
            .get_mut(&Self::key(workflow_name, run_id))
            .ok_or_else(|| Self::not_found(workflow_name, run_id))?;
        let outcome = entry.value_mut().apply_result(step_id, patch);
        Ok(ResultsUpdate {
            context: entry.value().context.clone(),
            outcome,
        })
    }

    async fn list_workflow_runs(
        &self,
        workflow_name: &str,
        window: QueryWindow,
    ) -> StorageResult<Vec<RunSummary>> {
        let mut runs: Vec<RunSummary> = self
            .runs
            .iter()
            .filter(|entry| entry.key().0 == workflow_name)
            .map(|entry| RunSummary::from(entry.value()))
            .collect();
        runs.sort_by(|a, b| b.created_at.cmp(&a.created_at));

        let limit = if window.limit == 0 {
            usize::MAX
        } else {
            window.limit
        };
        Ok(runs.into_iter().skip(window.offset).take(limit).collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{Duration, Utc};
    use serde_json::json;
    use workflow_types::{ExecutionPath, RunStatus, StepResult};

    fn snapshot(run_id: &str) -> WorkflowRunState {
        WorkflowRunState::new("wf", run_id, Vec::new(), json!({"n": 0}))
    }

    #[tokio::test]
    async fn test_persist_and_load() {
        let store = InMemoryWorkflowStore::new();
        store
            .persist_workflow_snapshot("wf", "r1", snapshot("r1"))
            .await
            .unwrap();

        let loaded = store.load_workflow_snapshot("wf", "r1").await.unwrap();
        assert_eq!(loaded.map(|s| s.run_id), Some("r1".to_string()));
        assert!(store
            .load_workflow_snapshot("other", "r1")
            .await
            .unwrap()
            .is_none());
    }

    #[tokio::test]
    async fn test_update_missing_run() {
        let store = InMemoryWorkflowStore::new();
        let err = store
            .update_workflow_state("wf", "nope", RunStateUpdate::status(RunStatus::Running))
            .await
            .unwrap_err();
        assert!(matches!(err, StorageError::RunNotFound { .. }));
    }

    #[tokio::test]
    async fn test_update_state_returns_snapshot() {
        let store = InMemoryWorkflowStore::new();
        store
            .persist_workflow_snapshot("wf", "r1", snapshot("r1"))
            .await
            .unwrap();
        let updated = store
            .update_workflow_state(
                "wf",
                "r1",
                RunStateUpdate::status(RunStatus::Suspended)
                    .with_suspended("a", ExecutionPath::top_level(0)),
            )
            .await
            .unwrap();
        assert_eq!(updated.status, RunStatus::Suspended);
        assert!(updated.suspended_paths.contains_key("a"));
    }

    #[tokio::test]
    async fn test_concurrent_result_patches_are_not_lost() {
        let store = InMemoryWorkflowStore::new();
        store
            .persist_workflow_snapshot("wf", "r1", snapshot("r1"))
            .await
            .unwrap();

        let writes = (0..32).map(|i| {
            let store = store.clone();
            tokio::spawn(async move {
                store
                    .update_workflow_results(
                        "wf",
                        "r1",
                        &format!("step-{}", i),
                        ResultPatch::Replace(StepResult::success(json!(i), json!(null), Utc::now())),
                    )
                    .await
            })
        });
        for handle in futures::future::join_all(writes).await {
            assert!(handle.unwrap().unwrap().outcome.applied);
        }

        let loaded = store.load_workflow_snapshot("wf", "r1").await.unwrap().unwrap();
        assert_eq!(loaded.context.len(), 32);
    }

    #[tokio::test]
    async fn test_list_runs_newest_first() {
        let store = InMemoryWorkflowStore::new();
        let now = Utc::now();
        for (i, run_id) in ["old", "mid", "new"].iter().enumerate() {
            let mut state = snapshot(run_id);
            state.created_at = now + Duration::seconds(i as i64);
            store.persist_workflow_snapshot("wf", run_id, state).await.unwrap();
        }
        store
            .persist_workflow_snapshot("other", "x", snapshot("x"))
            .await
            .unwrap();

        let runs = store
            .list_workflow_runs("wf", QueryWindow::new(2, 0))
            .await
            .unwrap();
        let ids: Vec<_> = runs.iter().map(|r| r.run_id.as_str()).collect();
        assert_eq!(ids, vec!["new", "mid"]);

        let rest = store
            .list_workflow_runs("wf", QueryWindow::new(0, 2))
            .await
            .unwrap();
        assert_eq!(rest.len(), 1);
        assert_eq!(rest[0].run_id, "old");
    }
}
