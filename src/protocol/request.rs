//! Request side of a round trip.
//!
//! A [`SyncRequest`] carries the tasks of one batch in queue order. The hub
//! answers with exactly one task result per request task, at the same index.

use serde::{Deserialize, Serialize};
use serde_json::Value;

use super::event::ChangeKinds;
use super::patch::EntityPatch;
use crate::core::JsonKey;

/// One batch as sent to the hub.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SyncRequest {
    /// Batch sequence number of the sending client.
    pub seq: u64,
    /// Client identifier, `None` until assigned by the hub.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub client_id: Option<String>,
    /// Authenticated user.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub user_id: Option<String>,
    /// Authentication token.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub token: Option<String>,
    /// Addressed database.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub database: Option<String>,
    /// Highest event sequence number applied by the client.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub event_ack: Option<u64>,
    /// Tasks in queue order.
    pub tasks: Vec<SyncRequestTask>,
}

/// A reference to follow from the entities of a read or query task.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RefsRequest {
    /// Field path selecting foreign keys, e.g. `.owner` or `.items[*].article`.
    pub selector: String,
    /// Container the foreign keys point into.
    pub container: String,
    /// Key field of the target container when not `id`.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub key_field: Option<String>,
    /// References to follow from the referenced entities.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub references: Vec<RefsRequest>,
}

/// A single task of a request.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "task", rename_all = "camelCase", rename_all_fields = "camelCase")]
pub enum SyncRequestTask {
    /// Create entities; fails per entity if the key exists.
    Create {
        container: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        key_field: Option<String>,
        entities: Vec<Value>,
    },
    /// Create or replace entities.
    Upsert {
        container: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        key_field: Option<String>,
        entities: Vec<Value>,
    },
    /// Read entities by key.
    Read {
        container: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        key_field: Option<String>,
        ids: Vec<JsonKey>,
        #[serde(default, skip_serializing_if = "Vec::is_empty")]
        references: Vec<RefsRequest>,
    },
    /// Query entities by filter.
    Query {
        container: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        key_field: Option<String>,
        filter: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        max_count: Option<u32>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        cursor: Option<String>,
        #[serde(default, skip_serializing_if = "Vec::is_empty")]
        references: Vec<RefsRequest>,
    },
    /// Apply patches to existing entities.
    Merge {
        container: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        key_field: Option<String>,
        patches: Vec<EntityPatch>,
    },
    /// Delete entities by key.
    Delete { container: String, ids: Vec<JsonKey> },
    /// Delete every entity of a container.
    DeleteAll { container: String },
    /// Count entities matching a filter.
    Count { container: String, filter: String },
    /// Subscribe to (or, with empty `changes`, unsubscribe from) container changes.
    SubscribeChanges {
        container: String,
        changes: ChangeKinds,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        filter: Option<String>,
    },
    /// Subscribe to (or unsubscribe from) messages by name.
    SubscribeMessage { name: String, remove: bool },
    /// Reserve integer keys.
    ReserveKeys { container: String, count: u32 },
    /// Release query cursors.
    CloseCursors { container: String, cursors: Vec<String> },
    /// Execute a command returning a result.
    Command { name: String, param: Value },
    /// Send a message without result.
    Message { name: String, param: Value },
}

impl SyncRequestTask {
    /// Wire name of the task kind.
    pub fn kind(&self) -> &'static str {
        match self {
            SyncRequestTask::Create { .. } => "create",
            SyncRequestTask::Upsert { .. } => "upsert",
            SyncRequestTask::Read { .. } => "read",
            SyncRequestTask::Query { .. } => "query",
            SyncRequestTask::Merge { .. } => "merge",
            SyncRequestTask::Delete { .. } => "delete",
            SyncRequestTask::DeleteAll { .. } => "deleteAll",
            SyncRequestTask::Count { .. } => "count",
            SyncRequestTask::SubscribeChanges { .. } => "subscribeChanges",
            SyncRequestTask::SubscribeMessage { .. } => "subscribeMessage",
            SyncRequestTask::ReserveKeys { .. } => "reserveKeys",
            SyncRequestTask::CloseCursors { .. } => "closeCursors",
            SyncRequestTask::Command { .. } => "command",
            SyncRequestTask::Message { .. } => "message",
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_task_wire_format() {
        let task = SyncRequestTask::Query {
            container: "articles".into(),
            key_field: None,
            filter: "true".into(),
            max_count: Some(10),
            cursor: None,
            references: vec![RefsRequest {
                selector: ".producer".into(),
                container: "producers".into(),
                key_field: None,
                references: vec![],
            }],
        };
        let value = serde_json::to_value(&task).unwrap();
        assert_eq!(
            value,
            json!({
                "task": "query",
                "container": "articles",
                "filter": "true",
                "maxCount": 10,
                "references": [{"selector": ".producer", "container": "producers"}]
            })
        );
        let back: SyncRequestTask = serde_json::from_value(value).unwrap();
        assert_eq!(back, task);
    }

    #[test]
    fn test_kind_names() {
        let task = SyncRequestTask::DeleteAll {
            container: "c".into(),
        };
        assert_eq!(task.kind(), "deleteAll");
        assert_eq!(serde_json::to_value(&task).unwrap()["task"], "deleteAll");
    }
}
