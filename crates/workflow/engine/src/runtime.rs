//! Workflow runtime: owns the store, the bus and the processor workers
//!
//! A runtime is the process-level entry point. It registers workflows,
//! subscribes [`EventProcessor`] workers to the `workflows` topic and hands
//! out [`Run`] handles.

use std::sync::{Arc, Mutex};
use workflow_bus::{InMemoryBus, MessageBus, SubscriptionId};
use workflow_storage::{InMemoryWorkflowStore, QueryWindow, WorkflowStore};
use workflow_types::{
    RunSummary, WorkflowError, WorkflowResult, WorkflowRunState, WORKFLOWS_TOPIC,
};

use crate::abort::AbortRegistry;
use crate::config::EngineConfig;
use crate::engine::ExecutionEngine;
use crate::graph::Workflow;
use crate::processor::EventProcessor;
use crate::registry::WorkflowRegistry;
use crate::run::Run;

pub struct WorkflowRuntime {
    config: Arc<EngineConfig>,
    store: Arc<dyn WorkflowStore>,
    bus: Arc<dyn MessageBus>,
    registry: Arc<WorkflowRegistry>,
    aborts: Arc<AbortRegistry>,
    engine: ExecutionEngine,
    workers: Mutex<Vec<SubscriptionId>>,
}

impl WorkflowRuntime {
    pub fn new(
        config: EngineConfig,
        store: Arc<dyn WorkflowStore>,
        bus: Arc<dyn MessageBus>,
    ) -> Self {
        let config = Arc::new(config);
        let engine = ExecutionEngine::new(store.clone(), bus.clone(), config.clone());
        Self {
            config,
            store,
            bus,
            registry: Arc::new(WorkflowRegistry::new()),
            aborts: Arc::new(AbortRegistry::new()),
            engine,
            workers: Mutex::new(Vec::new()),
        }
    }

    /// Runtime backed by the in-memory store and bus
    pub fn in_memory(config: EngineConfig) -> Self {
        let bus = Arc::new(InMemoryBus::new(config.bus.clone()));
        Self::new(config, Arc::new(InMemoryWorkflowStore::new()), bus)
    }

    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    pub fn store(&self) -> &Arc<dyn WorkflowStore> {
        &self.store
    }

    pub fn bus(&self) -> &Arc<dyn MessageBus> {
        &self.bus
    }

    pub fn registry(&self) -> &Arc<WorkflowRegistry> {
        &self.registry
    }

    /// Commit a workflow (and the workflows nested in it)
    pub fn register(&self, workflow: impl Into<Arc<Workflow>>) -> WorkflowResult<Arc<Workflow>> {
        self.registry.register(workflow)
    }

    /// A processor sharing this runtime's store, bus and registry
    pub fn processor(&self) -> EventProcessor {
        EventProcessor::new(
            self.store.clone(),
            self.bus.clone(),
            self.registry.clone(),
            self.aborts.clone(),
            self.config.clone(),
        )
    }

    /// Subscribe `count` processor workers to the `workflows` topic
    pub async fn start_workers(&self, count: usize) -> WorkflowResult<()> {
        let mut ids = Vec::with_capacity(count);
        for _ in 0..count.max(1) {
            let id = self
                .bus
                .subscribe(WORKFLOWS_TOPIC, Arc::new(self.processor()))
                .await?;
            ids.push(id);
        }
        let total = {
            let mut workers = self.lock_workers()?;
            workers.extend(ids);
            workers.len()
        };
        tracing::info!(workers = total, "Workflow processors subscribed");
        Ok(())
    }

    /// Subscribe as many workers as the configuration asks for
    pub async fn start(&self) -> WorkflowResult<()> {
        self.start_workers(self.config.execution.workers).await
    }

    /// Handle for a new run with a generated id
    pub fn create_run(&self, workflow_id: &str) -> WorkflowResult<Run> {
        self.create_run_with_id(workflow_id, uuid::Uuid::new_v4().to_string())
    }

    /// Handle for a run with a caller-chosen id
    pub fn create_run_with_id(
        &self,
        workflow_id: &str,
        run_id: impl Into<String>,
    ) -> WorkflowResult<Run> {
        let workflow = self.registry.get(workflow_id)?;
        let run_id = run_id.into();
        tracing::debug!(workflow_id = %workflow_id, run_id = %run_id, "Run created");
        Ok(Run::new(
            run_id,
            workflow,
            self.engine.clone(),
            self.store.clone(),
            self.bus.clone(),
        ))
    }

    pub async fn get_run_state(
        &self,
        workflow_id: &str,
        run_id: &str,
    ) -> WorkflowResult<Option<WorkflowRunState>> {
        Ok(self.store.load_workflow_snapshot(workflow_id, run_id).await?)
    }

    pub async fn list_runs(
        &self,
        workflow_id: &str,
        window: QueryWindow,
    ) -> WorkflowResult<Vec<RunSummary>> {
        Ok(self.store.list_workflow_runs(workflow_id, window).await?)
    }

    /// Unsubscribe every worker; in-flight handlers run to completion
    pub async fn shutdown(&self) -> WorkflowResult<()> {
        let ids = std::mem::take(&mut *self.lock_workers()?);
        for id in &ids {
            self.bus.unsubscribe(WORKFLOWS_TOPIC, id).await?;
        }
        tracing::info!(workers = ids.len(), "Workflow processors unsubscribed");
        Ok(())
    }

    fn lock_workers(&self) -> WorkflowResult<std::sync::MutexGuard<'_, Vec<SubscriptionId>>> {
        self.workers
            .lock()
            .map_err(|_| WorkflowError::Bus("worker list lock poisoned".to_string()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::step::Step;
    use serde_json::json;

    fn echo() -> Workflow {
        Workflow::builder("echo")
            .then(Step::new("echo", |ctx| async move { Ok(ctx.input_data().clone()) }))
            .commit()
            .unwrap()
    }

    #[tokio::test]
    async fn test_create_run_requires_registered_workflow() {
        let runtime = WorkflowRuntime::in_memory(EngineConfig::default());
        assert!(matches!(
            runtime.create_run("missing"),
            Err(WorkflowError::WorkflowNotFound(_))
        ));

        runtime.register(echo()).unwrap();
        let run = runtime.create_run_with_id("echo", "run-1").unwrap();
        assert_eq!(run.run_id(), "run-1");
        assert_eq!(run.workflow_id(), "echo");
    }

    #[tokio::test]
    async fn test_workers_subscribe_and_shut_down() {
        let bus = Arc::new(InMemoryBus::default());
        let runtime = WorkflowRuntime::new(
            EngineConfig::default(),
            Arc::new(InMemoryWorkflowStore::new()),
            bus.clone(),
        );
        runtime.start_workers(3).await.unwrap();
        assert_eq!(bus.subscriber_count(WORKFLOWS_TOPIC), 3);

        runtime.shutdown().await.unwrap();
        assert_eq!(bus.subscriber_count(WORKFLOWS_TOPIC), 0);
    }

    #[tokio::test]
    async fn test_run_state_is_listed_after_start() {
        let runtime = WorkflowRuntime::in_memory(EngineConfig::default());
        runtime.register(echo()).unwrap();
        runtime.start().await.unwrap();

        let run = runtime.create_run("echo").unwrap();
        let output = run.start(json!({"hello": "world"})).await.unwrap();
        assert_eq!(output.result, Some(json!({"hello": "world"})));

        let state = runtime
            .get_run_state("echo", run.run_id())
            .await
            .unwrap()
            .unwrap();
        assert!(state.status.is_finished());

        let runs = runtime
            .list_runs("echo", QueryWindow::new(10, 0))
            .await
            .unwrap();
        assert_eq!(runs.len(), 1);
        assert_eq!(runs[0].run_id, run.run_id());
    }
}
