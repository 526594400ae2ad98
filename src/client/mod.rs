//! Client API.
//!
//! Implements:
//! - `HubClient` with batched task execution and pipelining
//! - Typed containers queuing tasks for one entity type
//! - Client configuration and builder
//! - Round trip outcome with a deterministic failure summary

#[allow(clippy::module_inception)]
mod client;
mod config;
mod container;
mod result;

pub use client::{HubClient, SyncInFlight};
pub use config::{ClientConfig, HubClientBuilder};
pub use container::Container;
pub use result::{FailedTask, SyncResult, SyncTasksError};
