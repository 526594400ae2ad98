//! Entity codec.
//!
//! Encodes entities to raw JSON payloads and back. Payload diffing and
//! patch application live in [`crate::protocol::patch`].

use serde::Serialize;
use serde::de::DeserializeOwned;
use serde_json::Value;

use super::error::CodecError;
use super::key::{EntityKey, JsonKey};

/// Encode an entity into its raw payload.
pub fn encode<T: Serialize>(entity: &T) -> Result<Value, CodecError> {
    Ok(serde_json::to_value(entity)?)
}

/// Decode an entity from its raw payload.
pub fn decode<T: DeserializeOwned>(payload: &Value) -> Result<T, CodecError> {
    Ok(T::deserialize(payload)?)
}

/// Read the untyped key of a payload.
pub fn payload_key(payload: &Value, key_field: &str) -> Result<JsonKey, CodecError> {
    let object = payload.as_object().ok_or(CodecError::NotAnObject)?;
    let value = object
        .get(key_field)
        .filter(|v| !v.is_null())
        .ok_or_else(|| CodecError::MissingKey(key_field.to_string()))?;
    JsonKey::from_value(value).ok_or_else(|| CodecError::MissingKey(key_field.to_string()))
}

/// Encode an entity and extract its typed key.
pub fn encode_keyed<K: EntityKey, T: Serialize>(
    entity: &T,
    key_field: &str,
) -> Result<(K, Value), CodecError> {
    let payload = encode(entity)?;
    let key = K::from_json_key(&payload_key(&payload, key_field)?)?;
    Ok((key, payload))
}
