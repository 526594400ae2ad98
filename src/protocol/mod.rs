//! Wire model of the hub protocol.
//!
//! Implements:
//! - Batched requests with one result per task, in request order
//! - Per-container entity sections in responses
//! - Inbound change and message events
//! - Patch operations with structural diff

mod event;
pub mod patch;
mod request;
mod response;

pub use event::*;
pub use patch::{EntityPatch, PatchError, PatchOp};
pub use request::*;
pub use response::*;
