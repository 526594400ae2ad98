//! Field-path selection of foreign keys.
//!
//! A selector is a dotted field path such as `.producer` or
//! `.items[*].article`. `[*]` fans out over the elements of an array; an
//! array at the end of the path is flattened as well. Null and non-key
//! values are skipped.

use std::fmt;
use std::str::FromStr;

use indexmap::IndexSet;
use serde_json::Value;
use thiserror::Error;

use crate::core::JsonKey;

/// Errors parsing a selector.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum SelectorError {
    /// The selector has no field.
    #[error("empty selector")]
    Empty,

    /// The selector is malformed.
    #[error("invalid selector '{selector}': {reason}")]
    Invalid {
        /// The offending selector.
        selector: String,
        /// What is wrong.
        reason: &'static str,
    },
}

#[derive(Debug, Clone, PartialEq, Eq)]
struct Segment {
    field: String,
    each: bool,
}

/// Parsed field path.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Selector {
    source: String,
    segments: Vec<Segment>,
}

impl Selector {
    /// Parse a selector.
    pub fn parse(selector: &str) -> Result<Self, SelectorError> {
        let invalid = |reason| SelectorError::Invalid {
            selector: selector.to_string(),
            reason,
        };
        let path = selector.strip_prefix('.').unwrap_or(selector);
        if path.is_empty() {
            return Err(SelectorError::Empty);
        }
        let segments = path
            .split('.')
            .map(|part| {
                let (field, each) = match part.strip_suffix("[*]") {
                    Some(field) => (field, true),
                    None => (part, false),
                };
                if field.is_empty() {
                    return Err(invalid("empty field"));
                }
                if field.contains(['[', ']']) {
                    return Err(invalid("only [*] is supported"));
                }
                Ok(Segment {
                    field: field.to_string(),
                    each,
                })
            })
            .collect::<Result<Vec<_>, _>>()?;
        Ok(Self {
            source: selector.to_string(),
            segments,
        })
    }

    /// Keys selected from one payload, in document order.
    pub fn select(&self, payload: &Value) -> Vec<JsonKey> {
        let mut values = vec![payload];
        for segment in &self.segments {
            let mut next = Vec::new();
            for value in values {
                match (value.get(&segment.field), segment.each) {
                    (Some(Value::Array(items)), true) => next.extend(items),
                    (Some(field), false) => next.push(field),
                    _ => {}
                }
            }
            values = next;
        }
        values
            .into_iter()
            .flat_map(|value| match value {
                Value::Array(items) => items.iter().collect(),
                other => vec![other],
            })
            .filter_map(JsonKey::from_value)
            .collect()
    }

    /// Distinct keys selected from many payloads, in first-seen order.
    pub fn select_distinct<'a>(&self, payloads: impl IntoIterator<Item = &'a Value>) -> Vec<JsonKey> {
        let keys: IndexSet<JsonKey> = payloads
            .into_iter()
            .flat_map(|payload| self.select(payload))
            .collect();
        keys.into_iter().collect()
    }
}

impl FromStr for Selector {
    type Err = SelectorError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::parse(s)
    }
}

impl fmt::Display for Selector {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.source)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_scalar_field() {
        let selector = Selector::parse(".producer").unwrap();
        assert_eq!(
            selector.select(&json!({"id": "a1", "producer": "p1"})),
            vec![JsonKey::from("p1")]
        );
        assert!(selector.select(&json!({"id": "a2", "producer": null})).is_empty());
        assert!(selector.select(&json!({"id": "a3"})).is_empty());
    }

    #[test]
    fn test_array_fan_out() {
        let selector = Selector::parse(".items[*].article").unwrap();
        let order = json!({
            "id": 1,
            "items": [{"article": "a1"}, {"article": "a2"}, {"amount": 3}]
        });
        assert_eq!(
            selector.select(&order),
            vec![JsonKey::from("a1"), JsonKey::from("a2")]
        );
    }

    #[test]
    fn test_trailing_array_flattened() {
        let selector = Selector::parse("tags").unwrap();
        assert_eq!(
            selector.select(&json!({"tags": [1, 2]})),
            vec![JsonKey::Int(1), JsonKey::Int(2)]
        );
    }

    #[test]
    fn test_select_distinct() {
        let selector = Selector::parse(".owner").unwrap();
        let payloads = [
            json!({"owner": "u2"}),
            json!({"owner": "u1"}),
            json!({"owner": "u2"}),
        ];
        assert_eq!(
            selector.select_distinct(&payloads),
            vec![JsonKey::from("u2"), JsonKey::from("u1")]
        );
    }

    #[test]
    fn test_invalid_selectors() {
        assert_eq!(Selector::parse("."), Err(SelectorError::Empty));
        assert!(matches!(
            Selector::parse(".a..b"),
            Err(SelectorError::Invalid { .. })
        ));
        assert!(matches!(
            Selector::parse(".items[0]"),
            Err(SelectorError::Invalid { .. })
        ));
        assert_eq!(".owner".parse::<Selector>().unwrap().to_string(), ".owner");
    }
}
