use crate::StorageResult;
use async_trait::async_trait;
use workflow_types::{ResultPatch, ResultsUpdate, RunStateUpdate, RunSummary, WorkflowRunState};

/// Generic query window for paged reads.
#[derive(Debug, Clone, Copy, Default)]
pub struct QueryWindow {
    pub limit: usize,
    pub offset: usize,
}

impl QueryWindow {
    pub fn new(limit: usize, offset: usize) -> Self {
        Self { limit, offset }
    }
}

/// Storage interface for workflow run snapshots.
///
/// Runs are keyed by `(workflow_name, run_id)`. The two update operations
/// are read-modify-write cycles and must be atomic per run.
#[async_trait]
pub trait WorkflowStore: Send + Sync {
    /// Write a whole snapshot, replacing any previous one.
    async fn persist_workflow_snapshot(
        &self,
        workflow_name: &str,
        run_id: &str,
        snapshot: WorkflowRunState,
    ) -> StorageResult<()>;

    /// Read a snapshot, if the run exists.
    async fn load_workflow_snapshot(
        &self,
        workflow_name: &str,
        run_id: &str,
    ) -> StorageResult<Option<WorkflowRunState>>;

    /// Apply a status/path update and return the updated snapshot.
    async fn update_workflow_state(
        &self,
        workflow_name: &str,
        run_id: &str,
        update: RunStateUpdate,
    ) -> StorageResult<WorkflowRunState>;

    /// Patch one step's result and return the merged result map.
    async fn update_workflow_results(
        &self,
        workflow_name: &str,
        run_id: &str,
        step_id: &str,
        patch: ResultPatch,
    ) -> StorageResult<ResultsUpdate>;

    /// List runs of a workflow newest-first.
    async fn list_workflow_runs(
        &self,
        workflow_name: &str,
        window: QueryWindow,
    ) -> StorageResult<Vec<RunSummary>>;
}
