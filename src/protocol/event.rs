//! Inbound change events.
//!
//! The hub pushes one [`EventMessage`] per committed batch of a client to every
//! other client subscribed to the affected containers or message names.

use bitflags::bitflags;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::Value;

use super::patch::EntityPatch;
use crate::core::codec;
use crate::core::{CodecError, JsonKey};

bitflags! {
    /// Set of change kinds a subscription listens to.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
    pub struct ChangeKinds: u8 {
        /// Entities created.
        const CREATE = 1 << 0;
        /// Entities created or replaced.
        const UPSERT = 1 << 1;
        /// Entities deleted.
        const DELETE = 1 << 2;
        /// Entities patched.
        const PATCH = 1 << 3;
    }
}

/// A single change applied by the hub to one container.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "change", rename_all = "camelCase")]
pub enum ChangeRecord {
    /// Entities created.
    Create {
        /// Container name.
        container: String,
        /// Created payloads.
        entities: Vec<Value>,
    },
    /// Entities created or replaced.
    Upsert {
        /// Container name.
        container: String,
        /// Upserted payloads.
        entities: Vec<Value>,
    },
    /// Entities deleted.
    Delete {
        /// Container name.
        container: String,
        /// Deleted keys.
        ids: Vec<JsonKey>,
    },
    /// Entities patched.
    Patch {
        /// Container name.
        container: String,
        /// Applied patches.
        patches: Vec<EntityPatch>,
    },
}

impl ChangeRecord {
    /// Container the change applies to.
    pub fn container(&self) -> &str {
        match self {
            ChangeRecord::Create { container, .. }
            | ChangeRecord::Upsert { container, .. }
            | ChangeRecord::Delete { container, .. }
            | ChangeRecord::Patch { container, .. } => container,
        }
    }

    /// Kind of the change.
    pub fn kind(&self) -> ChangeKinds {
        match self {
            ChangeRecord::Create { .. } => ChangeKinds::CREATE,
            ChangeRecord::Upsert { .. } => ChangeKinds::UPSERT,
            ChangeRecord::Delete { .. } => ChangeKinds::DELETE,
            ChangeRecord::Patch { .. } => ChangeKinds::PATCH,
        }
    }
}

/// A message published to subscribers.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MessageEvent {
    /// Message name.
    pub name: String,
    /// Message parameter.
    pub param: Value,
}

impl MessageEvent {
    /// Decode the parameter into a typed value.
    pub fn decode_param<P: DeserializeOwned>(&self) -> Result<P, CodecError> {
        codec::decode(&self.param)
    }
}

/// One event pushed by the hub.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct EventMessage {
    /// Per-client event sequence number, starting at 1.
    pub seq: u64,
    /// Client whose batch caused the event.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub source_client: Option<String>,
    /// Container changes in commit order.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub changes: Vec<ChangeRecord>,
    /// Messages in send order.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub messages: Vec<MessageEvent>,
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_change_record_accessors() {
        let change = ChangeRecord::Delete {
            container: "articles".into(),
            ids: vec![JsonKey::from("a1")],
        };
        assert_eq!(change.container(), "articles");
        assert_eq!(change.kind(), ChangeKinds::DELETE);
    }

    #[test]
    fn test_event_wire_format() {
        let event = EventMessage {
            seq: 3,
            source_client: Some("2".into()),
            changes: vec![ChangeRecord::Upsert {
                container: "articles".into(),
                entities: vec![json!({"id": "a1"})],
            }],
            messages: vec![],
        };
        let value = serde_json::to_value(&event).unwrap();
        assert_eq!(value["changes"][0]["change"], "upsert");
        let back: EventMessage = serde_json::from_value(value).unwrap();
        assert_eq!(back, event);
    }

    #[test]
    fn test_decode_param() {
        let message = MessageEvent {
            name: "chat.post".into(),
            param: json!({"text": "hi"}),
        };
        let param: serde_json::Map<String, Value> = message.decode_param().unwrap();
        assert_eq!(param["text"], "hi");
        assert!(message.decode_param::<u32>().is_err());
    }

    #[test]
    fn test_change_kinds_all() {
        let all = ChangeKinds::all();
        assert!(all.contains(ChangeKinds::CREATE | ChangeKinds::PATCH));
        assert!(ChangeKinds::empty().is_empty());
    }
}
