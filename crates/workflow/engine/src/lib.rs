//! Event-Driven Workflow Engine
//!
//! Runs step graphs built with [`Workflow::builder`] by exchanging
//! lifecycle events over a [`MessageBus`](workflow_bus::MessageBus). No
//! handler keeps in-memory state between events: every transition reads
//! and patches the run snapshot held by a
//! [`WorkflowStore`](workflow_storage::WorkflowStore), so a run survives
//! suspension and can be resumed later, possibly by another process.
//!
//! # Architecture
//!
//! - [`StepExecutor`] runs one step body, isolating errors and panics and
//!   capturing suspend/bail/abort control signals
//! - [`EventProcessor`] consumes `workflow.*` events and emits the next ones
//! - [`ExecutionEngine`] turns a `start`/`resume` call into a first event and
//!   waits for the run's terminal event
//! - [`Run`] is the caller-facing handle: start, resume, stream, watch,
//!   cancel and external events
//! - [`WorkflowRuntime`] wires the store, the bus and processor workers
//!
//! # Example
//!
//! ```rust,no_run
//! use serde_json::json;
//! use workflow_engine::{EngineConfig, Step, Workflow, WorkflowRuntime};
//!
//! # async fn demo() -> workflow_types::WorkflowResult<()> {
//! let runtime = WorkflowRuntime::in_memory(EngineConfig::default());
//! runtime.register(
//!     Workflow::builder("greet")
//!         .then(Step::new("hello", |ctx| async move {
//!             let name = ctx.input_data()["name"].clone();
//!             Ok(json!({ "greeting": format!("hello {}", name) }))
//!         }))
//!         .commit()?,
//! )?;
//! runtime.start().await?;
//!
//! let run = runtime.create_run("greet")?;
//! let output = run.start(json!({ "name": "ada" })).await?;
//! assert!(output.result.is_some());
//! # Ok(())
//! # }
//! ```

#![deny(unsafe_code)]

pub mod abort;
pub mod config;
pub mod engine;
pub mod executor;
pub mod graph;
pub mod processor;
pub mod registry;
pub mod run;
pub mod runtime;
pub mod step;

// Re-export main types
pub use abort::{AbortController, AbortRegistry, AbortSignal};
pub use config::EngineConfig;
pub use engine::{ExecuteRequest, ExecutionEngine, RunOutput};
pub use executor::{StepExecutor, StepOutcome, StepScope};
pub use graph::{passthrough, Node, SleepDate, SleepDuration, StepFlowEntry, Workflow, WorkflowBuilder};
pub use processor::{EventProcessor, Outbound};
pub use registry::WorkflowRegistry;
pub use run::{ResumeRequest, Run, RunStream, StreamChunk, WatchHandle};
pub use runtime::WorkflowRuntime;
pub use step::{predicate, Condition, Step, StepBody, StepContext, StepError, StepFn};
