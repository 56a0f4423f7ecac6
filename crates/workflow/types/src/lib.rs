//! Workflow Domain Types
//!
//! A workflow is an ordered sequence of **step flow entries**: leaf steps,
//! timers, external-signal gates and composites (parallel, conditional,
//! loop, foreach). A run of a workflow is driven forward by discrete
//! lifecycle events on a message bus; between two events the only state
//! that survives is the persisted run snapshot.
//!
//! # Key Concepts
//!
//! - **ExecutionPath**: an integer address of one node in a (possibly
//!   nested) step graph. Every lifecycle event carries one.
//! - **SerializedStepFlowEntry**: the data-only form of a step graph that is
//!   stored with every run.
//! - **StepResult**: the outcome record of one step execution.
//! - **WorkflowRunState**: the durable snapshot of one run, together with
//!   the atomic patch operations storage backends apply to it.
//! - **ParentWorkflow**: the linkage threading a nested run back into the
//!   run that started it.
//! - **WorkflowEvent** / **LifecycleEvent**: the messages that drive state
//!   transitions.
//! - **WatchEvent**: best-effort live notifications for observers of a run.
//!
//! # Design Principles
//!
//! 1. Everything here is plain data: serializable, cloneable, free of
//!    closures and live references.
//! 2. Snapshot mutations are expressed as patches so a store can apply them
//!    under a per-run lock.
//! 3. One variant per lifecycle transition, each with exactly the fields it
//!    needs.

#![deny(unsafe_code)]

mod errors;
mod event;
mod graph;
mod path;
mod result;
mod snapshot;
mod watch;

pub use errors::*;
pub use event::*;
pub use graph::*;
pub use path::*;
pub use result::*;
pub use snapshot::*;
pub use watch::*;
