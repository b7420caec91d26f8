//! Opaque field payloads.

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// A field value as seen by the core: a JSON-like structure with decidable
/// equality. The core never interprets it beyond comparing for equality;
/// typed accessors are the host's concern.
///
/// Note that `Value::Null` is a real payload, distinct from a deleted
/// field. Deletion is represented at the register level, never as a value.
#[derive(Clone, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Value {
    Null,
    Bool(bool),
    Int(i64),
    Text(String),
    Bytes(Vec<u8>),
    List(Vec<Value>),
    Map(BTreeMap<String, Value>),
}

impl Value {
    pub fn text(s: impl Into<String>) -> Self {
        Value::Text(s.into())
    }

    pub fn int(n: i64) -> Self {
        Value::Int(n)
    }

    pub fn bool(b: bool) -> Self {
        Value::Bool(b)
    }

    pub fn is_null(&self) -> bool {
        matches!(self, Value::Null)
    }
}

impl From<&str> for Value {
    fn from(s: &str) -> Self {
        Value::Text(s.to_string())
    }
}

impl From<String> for Value {
    fn from(s: String) -> Self {
        Value::Text(s)
    }
}

impl From<i64> for Value {
    fn from(n: i64) -> Self {
        Value::Int(n)
    }
}

impl From<bool> for Value {
    fn from(b: bool) -> Self {
        Value::Bool(b)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_json_round_trip() {
        let value = Value::Map(BTreeMap::from([
            ("title".to_string(), Value::text("plan")),
            ("done".to_string(), Value::bool(false)),
            ("attempts".to_string(), Value::int(3)),
            ("raw".to_string(), Value::Bytes(vec![1, 2, 3])),
        ]));

        let json = serde_json::to_string(&value).unwrap();
        let restored: Value = serde_json::from_str(&json).unwrap();
        assert_eq!(value, restored);
    }

    #[test]
    fn test_null_survives_encoding() {
        // A null payload must stay distinguishable from field absence,
        // which serializes as JSON null at the register level.
        let json = serde_json::to_string(&Value::Null).unwrap();
        assert_ne!(json, "null");
        assert_eq!(serde_json::from_str::<Value>(&json).unwrap(), Value::Null);
    }
}
