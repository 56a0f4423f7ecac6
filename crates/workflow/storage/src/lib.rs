//! Workflow run storage.
//!
//! This crate defines the persistence contract the workflow engine needs:
//! - whole-snapshot writes and reads keyed by `(workflow name, run id)`
//! - partial status updates (suspended/waiting path bookkeeping)
//! - atomic result patches returning the merged result map
//! - newest-first run listings
//!
//! Every update is a read-modify-write of one run. Implementations must
//! serialize updates per run; the in-memory store does so through the
//! per-key locks of its map.

#![deny(unsafe_code)]
#![warn(rust_2018_idioms)]

mod error;
pub mod memory;
mod traits;

pub use error::{StorageError, StorageResult};
pub use memory::InMemoryWorkflowStore;
pub use traits::{QueryWindow, WorkflowStore};
