//! Task batching and execution engine.
//!
//! Implements:
//! - Task model with a shared header and a tagged task kind
//! - Pending queue and batch builder with pipelined detach
//! - Result distribution into task handles and identity caches
//! - Batch and event sequence tracking

mod batch;
mod context;
pub mod handles;
mod queue;
mod task;
mod tracker;

pub(crate) use batch::{Batch, BatchEntry, SectionErrors};
pub(crate) use context::SyncContext;
pub(crate) use queue::TaskQueue;
pub(crate) use task::{PatchScope, TaskCell, TaskKind, TaskOutput};
pub use task::{TaskId, TaskState};
pub use tracker::SyncTracker;
