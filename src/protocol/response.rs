//! Response side of a round trip.
//!
//! Task results only carry keys. Entity payloads of all tasks are returned
//! once per container in [`ContainerEntities`], so an entity read by several
//! tasks travels once.

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::core::{EntityError, JsonKey, TaskError, TaskErrorKind};

/// Response to a [`super::SyncRequest`].
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SyncResponse {
    /// Batch sequence number of the request this responds to.
    pub seq: u64,
    /// Client identifier assigned by the hub.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub client_id: Option<String>,
    /// One result per request task, at the same index.
    pub tasks: Vec<SyncTaskResult>,
    /// Entity payloads of read, query and reference results.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub containers: Vec<ContainerEntities>,
}

impl SyncResponse {
    /// Entities section of a container, if any.
    pub fn container(&self, name: &str) -> Option<&ContainerEntities> {
        self.containers.iter().find(|c| c.container == name)
    }
}

/// Entity payloads of one container.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ContainerEntities {
    /// Container name.
    pub container: String,
    /// Found entities.
    #[serde(default)]
    pub entities: Vec<Value>,
    /// Requested keys without entity.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub not_found: Vec<JsonKey>,
    /// Entities that failed to read.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub errors: Vec<EntityError>,
}

/// Task-level error as sent by the hub.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TaskErrorResult {
    /// Error kind.
    pub kind: TaskErrorKind,
    /// Human readable detail.
    pub message: String,
}

impl From<TaskErrorResult> for TaskError {
    fn from(result: TaskErrorResult) -> Self {
        TaskError::new(result.kind, result.message)
    }
}

/// Keys resolved by following a reference.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ReferencesResult {
    /// Selector of the request this answers.
    pub selector: String,
    /// Target container.
    pub container: String,
    /// Distinct referenced keys in first-seen order.
    #[serde(default)]
    pub ids: Vec<JsonKey>,
    /// Set when reading the referenced container failed.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<TaskErrorResult>,
    /// Results of nested references.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub references: Vec<ReferencesResult>,
}

/// Result of a single request task.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "task", rename_all = "camelCase", rename_all_fields = "camelCase")]
pub enum SyncTaskResult {
    Create {
        #[serde(default, skip_serializing_if = "Vec::is_empty")]
        errors: Vec<EntityError>,
    },
    Upsert {
        #[serde(default, skip_serializing_if = "Vec::is_empty")]
        errors: Vec<EntityError>,
    },
    Read {
        #[serde(default, skip_serializing_if = "Vec::is_empty")]
        references: Vec<ReferencesResult>,
    },
    Query {
        ids: Vec<JsonKey>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        cursor: Option<String>,
        #[serde(default, skip_serializing_if = "Vec::is_empty")]
        references: Vec<ReferencesResult>,
    },
    Merge {
        #[serde(default, skip_serializing_if = "Vec::is_empty")]
        errors: Vec<EntityError>,
    },
    Delete {
        #[serde(default, skip_serializing_if = "Vec::is_empty")]
        errors: Vec<EntityError>,
    },
    DeleteAll,
    Count { count: u64 },
    SubscribeChanges,
    SubscribeMessage,
    ReserveKeys { keys: Vec<i64> },
    CloseCursors { count: u32 },
    Command { result: Value },
    Message,
    /// The task failed as a whole.
    Error(TaskErrorResult),
}

impl SyncTaskResult {
    /// Wire name of the result kind, matching [`super::SyncRequestTask::kind`].
    pub fn kind(&self) -> &'static str {
        match self {
            SyncTaskResult::Create { .. } => "create",
            SyncTaskResult::Upsert { .. } => "upsert",
            SyncTaskResult::Read { .. } => "read",
            SyncTaskResult::Query { .. } => "query",
            SyncTaskResult::Merge { .. } => "merge",
            SyncTaskResult::Delete { .. } => "delete",
            SyncTaskResult::DeleteAll => "deleteAll",
            SyncTaskResult::Count { .. } => "count",
            SyncTaskResult::SubscribeChanges => "subscribeChanges",
            SyncTaskResult::SubscribeMessage => "subscribeMessage",
            SyncTaskResult::ReserveKeys { .. } => "reserveKeys",
            SyncTaskResult::CloseCursors { .. } => "closeCursors",
            SyncTaskResult::Command { .. } => "command",
            SyncTaskResult::Message => "message",
            SyncTaskResult::Error(_) => "error",
        }
    }

    /// Shorthand for an error result.
    pub fn error(kind: TaskErrorKind, message: impl Into<String>) -> Self {
        SyncTaskResult::Error(TaskErrorResult {
            kind,
            message: message.into(),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_error_result_wire_format() {
        let result = SyncTaskResult::error(TaskErrorKind::FilterError, "bad filter");
        let value = serde_json::to_value(&result).unwrap();
        assert_eq!(
            value,
            json!({"task": "error", "kind": "FilterError", "message": "bad filter"})
        );
        let back: SyncTaskResult = serde_json::from_value(value).unwrap();
        assert_eq!(back, result);
    }

    #[test]
    fn test_response_container_lookup() {
        let response = SyncResponse {
            seq: 1,
            containers: vec![ContainerEntities {
                container: "articles".into(),
                entities: vec![json!({"id": "a"})],
                ..Default::default()
            }],
            ..Default::default()
        };
        assert!(response.container("articles").is_some());
        assert!(response.container("orders").is_none());
    }
}
