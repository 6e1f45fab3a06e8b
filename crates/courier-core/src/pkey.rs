//! Primary keys
//!
//! A primary key is either a single scalar value or an ordered tuple of
//! values (composite key). Composite keys serialize as JSON arrays.

use std::fmt;

use serde::{Deserialize, Deserializer, Serialize, Serializer};

use crate::value::Value;

/// Primary key of an object: one value, or an ordered tuple for composite
/// keys.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum Pkey {
    Single(Value),
    Composite(Vec<Value>),
}

impl Pkey {
    /// Number of components (1 for a scalar key).
    pub fn arity(&self) -> usize {
        match self {
            Pkey::Single(_) => 1,
            Pkey::Composite(parts) => parts.len(),
        }
    }
}

impl fmt::Display for Pkey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Pkey::Single(v) => write!(f, "{v}"),
            Pkey::Composite(parts) => {
                write!(f, "(")?;
                for (i, part) in parts.iter().enumerate() {
                    if i > 0 {
                        write!(f, ", ")?;
                    }
                    write!(f, "{part}")?;
                }
                write!(f, ")")
            }
        }
    }
}

impl From<Value> for Pkey {
    fn from(value: Value) -> Self {
        Pkey::Single(value)
    }
}

impl From<&str> for Pkey {
    fn from(s: &str) -> Self {
        Pkey::Single(Value::from(s))
    }
}

impl From<i64> for Pkey {
    fn from(i: i64) -> Self {
        Pkey::Single(Value::from(i))
    }
}

impl Serialize for Pkey {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        match self {
            Pkey::Single(v) => v.serialize(serializer),
            Pkey::Composite(parts) => parts.serialize(serializer),
        }
    }
}

impl<'de> Deserialize<'de> for Pkey {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        // A JSON array always denotes a composite key; scalar keys are never
        // lists.
        let value = Value::deserialize(deserializer)?;
        match value {
            Value::List(parts) => Ok(Pkey::Composite(parts)),
            other => Ok(Pkey::Single(other)),
        }
    }
}
