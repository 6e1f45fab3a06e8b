//! Typed attribute values
//!
//! Every attribute of every object flowing through the pipeline is a
//! [`Value`]: a tagged variant with canonical equality, total ordering and a
//! JSON-safe encoding. Timestamps serialize as ISO-8601 without timezone,
//! byte strings as base64; both are wrapped in a single-key tag object so
//! they survive a JSON round trip unambiguously.

use std::cmp::Ordering;
use std::collections::BTreeMap;
use std::fmt;
use std::hash::{Hash, Hasher};

use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine;
use chrono::NaiveDateTime;
use serde::de::Error as _;
use serde::{Deserialize, Deserializer, Serialize, Serializer};

/// Tag key used to encode byte values in JSON.
const BYTES_TAG: &str = "$bytes";
/// Tag key used to encode timestamps in JSON.
const DATETIME_TAG: &str = "$datetime";
/// Timestamp wire format (ISO-8601, no timezone).
const DATETIME_FORMAT: &str = "%Y-%m-%dT%H:%M:%S%.f";

/// A typed, comparable attribute value.
#[derive(Debug, Clone)]
pub enum Value {
    Bool(bool),
    Integer(i64),
    Float(f64),
    String(String),
    Bytes(Vec<u8>),
    DateTime(NaiveDateTime),
    List(Vec<Value>),
    Map(BTreeMap<String, Value>),
}

impl Value {
    /// Rank used to order values of different variants.
    fn rank(&self) -> u8 {
        match self {
            Value::Bool(_) => 0,
            Value::Integer(_) => 1,
            Value::Float(_) => 2,
            Value::String(_) => 3,
            Value::Bytes(_) => 4,
            Value::DateTime(_) => 5,
            Value::List(_) => 6,
            Value::Map(_) => 7,
        }
    }

    /// Borrow the inner string, if this is a string value.
    pub fn as_str(&self) -> Option<&str> {
        match self {
            Value::String(s) => Some(s),
            _ => None,
        }
    }

    /// Return the integer value, if this is an integer.
    pub fn as_i64(&self) -> Option<i64> {
        match self {
            Value::Integer(i) => Some(*i),
            _ => None,
        }
    }

    /// Check whether this value is an empty list.
    pub fn is_empty_list(&self) -> bool {
        matches!(self, Value::List(items) if items.is_empty())
    }

    /// Convert to a JSON value using the canonical wire encoding.
    pub fn to_json(&self) -> serde_json::Value {
        match self {
            Value::Bool(b) => serde_json::Value::Bool(*b),
            Value::Integer(i) => serde_json::Value::from(*i),
            Value::Float(f) => serde_json::Number::from_f64(*f)
                .map(serde_json::Value::Number)
                .unwrap_or_else(|| serde_json::Value::String(f.to_string())),
            Value::String(s) => serde_json::Value::String(s.clone()),
            Value::Bytes(b) => {
                let mut map = serde_json::Map::with_capacity(1);
                map.insert(
                    BYTES_TAG.to_string(),
                    serde_json::Value::String(BASE64.encode(b)),
                );
                serde_json::Value::Object(map)
            }
            Value::DateTime(dt) => {
                let mut map = serde_json::Map::with_capacity(1);
                map.insert(
                    DATETIME_TAG.to_string(),
                    serde_json::Value::String(dt.format(DATETIME_FORMAT).to_string()),
                );
                serde_json::Value::Object(map)
            }
            Value::List(items) => {
                serde_json::Value::Array(items.iter().map(Value::to_json).collect())
            }
            Value::Map(map) => serde_json::Value::Object(
                map.iter().map(|(k, v)| (k.clone(), v.to_json())).collect(),
            ),
        }
    }

    /// Decode a JSON value. Returns `None` for JSON null: the pipeline drops
    /// null attributes instead of storing them.
    pub fn from_json(json: serde_json::Value) -> Option<Value> {
        match json {
            serde_json::Value::Null => None,
            serde_json::Value::Bool(b) => Some(Value::Bool(b)),
            serde_json::Value::Number(n) => {
                if let Some(i) = n.as_i64() {
                    Some(Value::Integer(i))
                } else {
                    n.as_f64().map(Value::Float)
                }
            }
            serde_json::Value::String(s) => Some(Value::String(s)),
            serde_json::Value::Array(items) => Some(Value::List(
                items.into_iter().filter_map(Value::from_json).collect(),
            )),
            serde_json::Value::Object(map) => {
                if map.len() == 1 {
                    if let Some(serde_json::Value::String(b64)) = map.get(BYTES_TAG) {
                        return BASE64.decode(b64).ok().map(Value::Bytes);
                    }
                    if let Some(serde_json::Value::String(raw)) = map.get(DATETIME_TAG) {
                        return NaiveDateTime::parse_from_str(raw, DATETIME_FORMAT)
                            .ok()
                            .map(Value::DateTime);
                    }
                }
                Some(Value::Map(
                    map.into_iter()
                        .filter_map(|(k, v)| Value::from_json(v).map(|v| (k, v)))
                        .collect(),
                ))
            }
        }
    }
}

impl PartialEq for Value {
    fn eq(&self, other: &Self) -> bool {
        self.cmp(other) == Ordering::Equal
    }
}

impl Eq for Value {}

impl PartialOrd for Value {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for Value {
    fn cmp(&self, other: &Self) -> Ordering {
        match (self, other) {
            (Value::Bool(a), Value::Bool(b)) => a.cmp(b),
            (Value::Integer(a), Value::Integer(b)) => a.cmp(b),
            (Value::Float(a), Value::Float(b)) => a.total_cmp(b),
            (Value::String(a), Value::String(b)) => a.cmp(b),
            (Value::Bytes(a), Value::Bytes(b)) => a.cmp(b),
            (Value::DateTime(a), Value::DateTime(b)) => a.cmp(b),
            (Value::List(a), Value::List(b)) => a.cmp(b),
            (Value::Map(a), Value::Map(b)) => a.cmp(b),
            (a, b) => a.rank().cmp(&b.rank()),
        }
    }
}

impl Hash for Value {
    fn hash<H: Hasher>(&self, state: &mut H) {
        state.write_u8(self.rank());
        match self {
            Value::Bool(b) => b.hash(state),
            Value::Integer(i) => i.hash(state),
            Value::Float(f) => f.to_bits().hash(state),
            Value::String(s) => s.hash(state),
            Value::Bytes(b) => b.hash(state),
            Value::DateTime(dt) => dt.hash(state),
            Value::List(items) => items.hash(state),
            Value::Map(map) => map.hash(state),
        }
    }
}

impl fmt::Display for Value {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Value::Bool(b) => write!(f, "{b}"),
            Value::Integer(i) => write!(f, "{i}"),
            Value::Float(v) => write!(f, "{v}"),
            Value::String(s) => write!(f, "{s}"),
            Value::Bytes(b) => write!(f, "{}", BASE64.encode(b)),
            Value::DateTime(dt) => write!(f, "{}", dt.format(DATETIME_FORMAT)),
            Value::List(_) | Value::Map(_) => write!(f, "{}", self.to_json()),
        }
    }
}

impl Serialize for Value {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        self.to_json().serialize(serializer)
    }
}

impl<'de> Deserialize<'de> for Value {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let json = serde_json::Value::deserialize(deserializer)?;
        Value::from_json(json).ok_or_else(|| D::Error::custom("null is not a valid attribute value"))
    }
}

impl From<&str> for Value {
    fn from(s: &str) -> Self {
        Value::String(s.to_string())
    }
}

impl From<String> for Value {
    fn from(s: String) -> Self {
        Value::String(s)
    }
}

impl From<i64> for Value {
    fn from(i: i64) -> Self {
        Value::Integer(i)
    }
}

impl From<i32> for Value {
    fn from(i: i32) -> Self {
        Value::Integer(i64::from(i))
    }
}

impl From<bool> for Value {
    fn from(b: bool) -> Self {
        Value::Bool(b)
    }
}

impl From<f64> for Value {
    fn from(f: f64) -> Self {
        Value::Float(f)
    }
}

impl From<Vec<Value>> for Value {
    fn from(items: Vec<Value>) -> Self {
        Value::List(items)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_json_roundtrip_scalars() {
        for value in [
            Value::Bool(true),
            Value::Integer(-42),
            Value::Float(1.5),
            Value::String("alice".to_string()),
        ] {
            let json = serde_json::to_string(&value).unwrap();
            let back: Value = serde_json::from_str(&json).unwrap();
            assert_eq!(value, back);
        }
    }

    #[test]
    fn test_json_roundtrip_bytes() {
        let value = Value::Bytes(vec![0, 1, 2, 255]);
        let json = serde_json::to_string(&value).unwrap();
        assert!(json.contains("$bytes"));
        let back: Value = serde_json::from_str(&json).unwrap();
        assert_eq!(value, back);
    }

    #[test]
    fn test_json_roundtrip_datetime() {
        let dt = NaiveDateTime::parse_from_str("2024-03-01T08:30:00", "%Y-%m-%dT%H:%M:%S").unwrap();
        let value = Value::DateTime(dt);
        let json = serde_json::to_string(&value).unwrap();
        assert!(json.contains("2024-03-01T08:30:00"));
        let back: Value = serde_json::from_str(&json).unwrap();
        assert_eq!(value, back);
    }

    #[test]
    fn test_null_is_rejected() {
        assert!(serde_json::from_str::<Value>("null").is_err());
        assert_eq!(Value::from_json(serde_json::Value::Null), None);
    }

    #[test]
    fn test_nulls_dropped_from_lists() {
        let json: serde_json::Value = serde_json::from_str(r#"[1, null, 2]"#).unwrap();
        let value = Value::from_json(json).unwrap();
        assert_eq!(
            value,
            Value::List(vec![Value::Integer(1), Value::Integer(2)])
        );
    }

    #[test]
    fn test_ordering_across_variants_is_total() {
        let mut values = vec![
            Value::String("b".to_string()),
            Value::Integer(3),
            Value::Bool(false),
            Value::String("a".to_string()),
        ];
        values.sort();
        assert_eq!(values[0], Value::Bool(false));
        assert_eq!(values[1], Value::Integer(3));
        assert_eq!(values[2], Value::String("a".to_string()));
    }

    #[test]
    fn test_float_equality_is_bitwise_total() {
        assert_eq!(Value::Float(f64::NAN), Value::Float(f64::NAN));
        assert_ne!(Value::Float(0.1), Value::Float(0.2));
    }

    #[test]
    fn test_list_difference_detected() {
        let a = Value::List(vec![Value::Integer(1), Value::Integer(2)]);
        let b = Value::List(vec![Value::Integer(2), Value::Integer(1)]);
        assert_ne!(a, b);
    }
}
