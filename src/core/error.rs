//! Error types for hubsync.
//!
//! Errors come in three tiers:
//! - [`BatchError`]: the round trip as a whole failed
//! - [`TaskError`]: a single task failed, its siblings are unaffected
//! - [`EntityError`]: individual entities of an executed task failed
//!
//! Local validation errors ([`ClientError`]) are raised at the call site and
//! never enter a batch. Reading a task before its batch completed yields
//! [`TaskAccessError::NotSynced`].

use std::collections::BTreeMap;
use std::fmt;

use serde::{Deserialize, Serialize};
use thiserror::Error;

use super::key::{JsonKey, KeyError, KeyKind};

/// Kind of a task-level failure.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum TaskErrorKind {
    /// The hub raised an unexpected error while executing the task.
    UnhandledException,
    /// The underlying database failed.
    DatabaseError,
    /// The filter expression is invalid.
    FilterError,
    /// The task parameters failed validation.
    ValidationError,
    /// A command handler returned an error.
    CommandError,
    /// The task or command is not implemented by the hub.
    NotImplemented,
    /// The task is malformed.
    InvalidTask,
    /// The client is not authorized to execute the task.
    PermissionDenied,
    /// The response for this task does not match its request.
    InvalidResponse,
    /// The task executed but some entities failed.
    EntityErrors,
    /// The batch containing the task failed as a whole.
    SyncError,
}

impl TaskErrorKind {
    /// Stable name used in summaries.
    pub fn as_str(&self) -> &'static str {
        match self {
            TaskErrorKind::UnhandledException => "UnhandledException",
            TaskErrorKind::DatabaseError => "DatabaseError",
            TaskErrorKind::FilterError => "FilterError",
            TaskErrorKind::ValidationError => "ValidationError",
            TaskErrorKind::CommandError => "CommandError",
            TaskErrorKind::NotImplemented => "NotImplemented",
            TaskErrorKind::InvalidTask => "InvalidTask",
            TaskErrorKind::PermissionDenied => "PermissionDenied",
            TaskErrorKind::InvalidResponse => "InvalidResponse",
            TaskErrorKind::EntityErrors => "EntityErrors",
            TaskErrorKind::SyncError => "SyncError",
        }
    }
}

impl fmt::Display for TaskErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Kind of an entity-level failure.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum EntityErrorKind {
    /// The entity could not be read.
    ReadError,
    /// The entity could not be written.
    WriteError,
    /// The entity payload could not be decoded.
    ParseError,
    /// A patch could not be applied to the entity.
    PatchError,
}

impl fmt::Display for EntityErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            EntityErrorKind::ReadError => "ReadError",
            EntityErrorKind::WriteError => "WriteError",
            EntityErrorKind::ParseError => "ParseError",
            EntityErrorKind::PatchError => "PatchError",
        };
        f.write_str(name)
    }
}

/// Failure of a single entity.
#[derive(Debug, Clone, PartialEq, Eq, Error, Serialize, Deserialize)]
#[error("({kind}) [{key}] {message}")]
pub struct EntityError {
    /// What went wrong.
    pub kind: EntityErrorKind,
    /// Key of the failed entity.
    pub key: JsonKey,
    /// Human readable detail.
    pub message: String,
}

impl EntityError {
    /// Create a new entity error.
    pub fn new(kind: EntityErrorKind, key: JsonKey, message: impl Into<String>) -> Self {
        Self {
            kind,
            key,
            message: message.into(),
        }
    }
}

/// Entity errors of one task, ordered by key.
pub type EntityErrors = BTreeMap<JsonKey, EntityError>;

/// Failure of a single task.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TaskError {
    /// Task-level error kind.
    pub kind: TaskErrorKind,
    /// Human readable detail.
    pub message: String,
    /// Entity errors, populated when `kind` is [`TaskErrorKind::EntityErrors`].
    pub entity_errors: EntityErrors,
}

impl TaskError {
    /// Create a task error without entity errors.
    pub fn new(kind: TaskErrorKind, message: impl Into<String>) -> Self {
        Self {
            kind,
            message: message.into(),
            entity_errors: EntityErrors::new(),
        }
    }

    /// Create a task error from a set of entity errors.
    pub fn from_entities(errors: EntityErrors) -> Self {
        Self {
            kind: TaskErrorKind::EntityErrors,
            message: format!("count: {}", errors.len()),
            entity_errors: errors,
        }
    }

    /// Task error caused by a batch-level failure.
    pub fn from_batch(error: &BatchError) -> Self {
        Self::new(TaskErrorKind::SyncError, error.to_string())
    }
}

impl fmt::Display for TaskError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} ~ {}", self.kind, self.message)?;
        for error in self.entity_errors.values() {
            write!(f, "\n|   {error}")?;
        }
        Ok(())
    }
}

impl std::error::Error for TaskError {}

/// Failure of a whole round trip.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum BatchError {
    /// The transport could not deliver the request or its response.
    #[error("transport error: {0}")]
    Transport(String),

    /// The hub rejected the request as a whole.
    #[error("protocol error: {0}")]
    Protocol(String),

    /// The response does not have one result per request task.
    #[error("response mismatch: expected {expected} task results, got {actual}")]
    ResponseMismatch {
        /// Number of tasks sent.
        expected: usize,
        /// Number of results received.
        actual: usize,
    },

    /// The batch was cancelled before its response was applied.
    #[error("batch cancelled")]
    Cancelled,
}

/// Errors reading a task handle.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum TaskAccessError {
    /// The batch owning the task has not completed yet.
    #[error("task not synced: {task}")]
    NotSynced {
        /// Label of the task.
        task: String,
    },

    /// The task completed with an error.
    #[error("task failed: {0}")]
    Failed(TaskError),
}

/// Errors encoding or decoding entity payloads.
#[derive(Debug, Error)]
pub enum CodecError {
    /// serde_json failed.
    #[error("json error: {0}")]
    Json(#[from] serde_json::Error),

    /// Encoded entity is not a JSON object.
    #[error("entity payload is not an object")]
    NotAnObject,

    /// The key field is missing or null.
    #[error("missing key field '{0}'")]
    MissingKey(String),

    /// The key field has an unsupported value.
    #[error("invalid key: {0}")]
    InvalidKey(#[from] KeyError),
}

/// Misconfiguration detected when a container is created.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ConfigError {
    /// The container key type does not match the entity key field.
    #[error("container '{container}': declared key type {declared} does not match entity key {actual}")]
    KeyKindMismatch {
        /// Container name.
        container: String,
        /// Key kind of the container.
        declared: KeyKind,
        /// Key kind of the entity key field.
        actual: KeyKind,
    },

    /// A container with the same name was opened with other types.
    #[error("container '{0}' already registered with different types")]
    ContainerTypeMismatch(String),
}

/// Errors raised synchronously by client operations.
#[derive(Debug, Error)]
pub enum ClientError {
    /// An argument failed local validation.
    #[error("invalid argument: {0}")]
    InvalidArgument(String),

    /// A chained task was declared on an already synced source task.
    #[error("source task already synced: {task}")]
    SourceAlreadySynced {
        /// Label of the source task.
        task: String,
    },

    /// An entity requested for patch detection is not tracked.
    #[error("entity [{key}] not tracked by container '{container}'")]
    UnknownPeer {
        /// Container name.
        container: String,
        /// Requested key.
        key: JsonKey,
    },

    /// Configuration error.
    #[error("configuration error: {0}")]
    Config(#[from] ConfigError),

    /// Codec error.
    #[error("codec error: {0}")]
    Codec(#[from] CodecError),
}
