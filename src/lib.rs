//! # hubsync
//!
//! Client-side synchronization engine for a batched, task-based document hub.
//!
//! Operations on typed containers are queued as tasks and sent as one batch
//! per round trip. Results are distributed back to task handles with partial
//! failure semantics:
//!
//! - **Identity cache**: one peer per key and container, shared by every handle
//! - **References**: chained reads of foreign keys inside the same round trip
//! - **Patches**: pull-based diffing of entities against their last synced payload
//! - **Subscriptions**: change and message events folded into the caches
//! - **Pipelining**: tasks for the next batch can be queued while one is in flight
//!
//! ## Feature Flags
//!
//! - `loopback` (default): in-process hub transport for offline use and tests
//!
//! ## Modules
//!
//! - [`core`]: keys, entity trait, codec, constants and error types
//! - [`protocol`]: wire model of requests, responses, events and patches
//! - [`cache`]: identity cache
//! - [`sync`]: task model, batching and task handles
//! - [`refs`]: field selectors and reference resolution
//! - [`patch`]: patch detection
//! - [`subscription`]: event application and dispatch policies
//! - [`client`]: `HubClient`, containers and configuration
//! - [`transport`]: transport trait and loopback hub
//!
//! ## Example Usage
//!
//! ```ignore
//! use hubsync::prelude::*;
//! use serde::{Deserialize, Serialize};
//!
//! #[derive(Clone, Serialize, Deserialize)]
//! struct Article {
//!     id: String,
//!     name: String,
//! }
//!
//! impl Entity for Article {
//!     const CONTAINER: &'static str = "articles";
//!     const KEY_KIND: KeyKind = KeyKind::String;
//! }
//!
//! let hub = LoopbackHub::new();
//! let client = HubClient::new(hub.connect(), ClientConfig::default());
//! let articles = client.container::<String, Article>()?;
//!
//! articles.create(&Article { id: "a1".into(), name: "Galaxy".into() })?;
//! client.sync_tasks().await?;
//!
//! articles.peer(&"a1".to_string()).modify(|a| a.name = "Galaxy S".into());
//! let patches = articles.detect_patches();
//! client.sync_tasks().await?;
//! assert_eq!(patches.count()?, 1);
//! ```

#![forbid(unsafe_code)]
#![warn(missing_docs)]
#![cfg_attr(docsrs, feature(doc_cfg))]

pub mod cache;
pub mod client;
pub mod core;
pub mod patch;
pub mod protocol;
pub mod refs;
pub mod subscription;
pub mod sync;
pub mod transport;

/// Prelude module for convenient imports.
pub mod prelude {
    pub use crate::cache::{Changes, EntityCache, Peer};
    pub use crate::client::*;
    pub use crate::core::*;
    pub use crate::patch::ContainerPatches;
    pub use crate::protocol::{ChangeKinds, EntityPatch, EventMessage, MessageEvent, PatchOp};
    pub use crate::subscription::{EventDispatch, EventSink};
    pub use crate::sync::handles::*;
    pub use crate::sync::{TaskId, TaskState};
    pub use crate::transport::{Transport, TransportError};

    #[cfg(feature = "loopback")]
    pub use crate::transport::loopback::{CommandCall, LoopbackHub, LoopbackTransport};
}

// Re-export commonly used items at crate root
pub use client::{ClientConfig, Container, HubClient, HubClientBuilder, SyncResult, SyncTasksError};
pub use crate::core::{ClientError, Entity, EntityKey, KeyKind, TaskAccessError, TaskError, TaskErrorKind};
pub use subscription::EventDispatch;
