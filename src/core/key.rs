//! Entity keys.
//!
//! Keys are restricted to a closed set of types: strings, fixed-width signed
//! integers and 128-bit GUIDs. On the wire every key is a [`JsonKey`]; typed
//! containers convert through [`EntityKey`].

use std::fmt;
use std::hash::Hash;

use serde::{Deserialize, Serialize};
use serde_json::Value;
use thiserror::Error;
use uuid::Uuid;

/// The declared type of an entity key.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum KeyKind {
    /// UTF-8 string key.
    String,
    /// 16-bit signed integer key.
    Int16,
    /// 32-bit signed integer key.
    Int32,
    /// 64-bit signed integer key.
    Int64,
    /// 128-bit GUID, encoded as a hyphenated string.
    Guid,
}

impl fmt::Display for KeyKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            KeyKind::String => "string",
            KeyKind::Int16 => "int16",
            KeyKind::Int32 => "int32",
            KeyKind::Int64 => "int64",
            KeyKind::Guid => "guid",
        };
        f.write_str(name)
    }
}

/// Errors converting between [`JsonKey`] and a typed key.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum KeyError {
    /// The key has the wrong JSON type.
    #[error("expected {expected} key, got '{actual}'")]
    TypeMismatch {
        /// Declared key kind.
        expected: KeyKind,
        /// The offending key.
        actual: String,
    },

    /// An integer key does not fit the declared width.
    #[error("key {value} out of range for {kind}")]
    OutOfRange {
        /// Declared key kind.
        kind: KeyKind,
        /// The offending value.
        value: i64,
    },

    /// A GUID key could not be parsed.
    #[error("invalid guid '{0}'")]
    InvalidGuid(String),
}

/// Untyped key as it appears in payloads and on the wire.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(untagged)]
pub enum JsonKey {
    /// Integer key.
    Int(i64),
    /// String key (also used for GUIDs).
    Str(String),
}

impl JsonKey {
    /// Read a key from a JSON value. Only integers and strings are keys.
    pub fn from_value(value: &Value) -> Option<Self> {
        match value {
            Value::String(s) => Some(JsonKey::Str(s.clone())),
            Value::Number(n) => n.as_i64().map(JsonKey::Int),
            _ => None,
        }
    }

    /// Convert back into a JSON value.
    pub fn to_value(&self) -> Value {
        match self {
            JsonKey::Int(i) => Value::from(*i),
            JsonKey::Str(s) => Value::String(s.clone()),
        }
    }
}

impl fmt::Display for JsonKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            JsonKey::Int(i) => write!(f, "{i}"),
            JsonKey::Str(s) => f.write_str(s),
        }
    }
}

impl From<&str> for JsonKey {
    fn from(s: &str) -> Self {
        JsonKey::Str(s.to_string())
    }
}

impl From<String> for JsonKey {
    fn from(s: String) -> Self {
        JsonKey::Str(s)
    }
}

impl From<i64> for JsonKey {
    fn from(i: i64) -> Self {
        JsonKey::Int(i)
    }
}

/// Key converter for typed containers.
///
/// Implemented for `String`, `i16`, `i32`, `i64` and [`Uuid`].
pub trait EntityKey: Clone + Eq + Hash + fmt::Debug + Send + Sync + 'static {
    /// The kind this key type represents.
    const KIND: KeyKind;

    /// Convert to the wire representation.
    fn to_json_key(&self) -> JsonKey;

    /// Convert from the wire representation.
    fn from_json_key(key: &JsonKey) -> Result<Self, KeyError>;
}

impl EntityKey for String {
    const KIND: KeyKind = KeyKind::String;

    fn to_json_key(&self) -> JsonKey {
        JsonKey::Str(self.clone())
    }

    fn from_json_key(key: &JsonKey) -> Result<Self, KeyError> {
        match key {
            JsonKey::Str(s) => Ok(s.clone()),
            JsonKey::Int(i) => Err(KeyError::TypeMismatch {
                expected: KeyKind::String,
                actual: i.to_string(),
            }),
        }
    }
}

impl EntityKey for Uuid {
    const KIND: KeyKind = KeyKind::Guid;

    fn to_json_key(&self) -> JsonKey {
        JsonKey::Str(self.hyphenated().to_string())
    }

    fn from_json_key(key: &JsonKey) -> Result<Self, KeyError> {
        match key {
            JsonKey::Str(s) => Uuid::parse_str(s).map_err(|_| KeyError::InvalidGuid(s.clone())),
            JsonKey::Int(i) => Err(KeyError::TypeMismatch {
                expected: KeyKind::Guid,
                actual: i.to_string(),
            }),
        }
    }
}

macro_rules! int_key {
    ($ty:ty, $kind:expr) => {
        impl EntityKey for $ty {
            const KIND: KeyKind = $kind;

            fn to_json_key(&self) -> JsonKey {
                JsonKey::Int(i64::from(*self))
            }

            fn from_json_key(key: &JsonKey) -> Result<Self, KeyError> {
                match key {
                    JsonKey::Int(i) => <$ty>::try_from(*i).map_err(|_| KeyError::OutOfRange {
                        kind: $kind,
                        value: *i,
                    }),
                    JsonKey::Str(s) => Err(KeyError::TypeMismatch {
                        expected: $kind,
                        actual: s.clone(),
                    }),
                }
            }
        }
    };
}

int_key!(i16, KeyKind::Int16);
int_key!(i32, KeyKind::Int32);
int_key!(i64, KeyKind::Int64);
