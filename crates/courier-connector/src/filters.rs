//! Attribute filter registry
//!
//! Filters are pure functions applied inside mapping expressions:
//! `${login | lower}`, `${groups | join:','}`. They must be deterministic
//! given their inputs. The registry is fixed at process start; plugins
//! register additional filters explicitly before the first cycle.

use std::collections::BTreeMap;

use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine;
use regex::Regex;
use sha2::{Digest, Sha256};

use courier_core::Value;

/// A pure attribute filter: `(value, args) -> value`.
pub type FilterFn = fn(&Value, &[Value]) -> Result<Value, String>;

/// Named registry of attribute filters.
pub struct FilterRegistry {
    filters: BTreeMap<String, FilterFn>,
}

impl FilterRegistry {
    /// Registry with the built-in filters.
    pub fn builtin() -> FilterRegistry {
        let mut registry = FilterRegistry {
            filters: BTreeMap::new(),
        };
        registry.register("lower", lower);
        registry.register("upper", upper);
        registry.register("trim", trim);
        registry.register("first", first);
        registry.register("join", join);
        registry.register("split", split);
        registry.register("b64encode", b64encode);
        registry.register("b64decode", b64decode);
        registry.register("sha256", sha256_hex);
        registry.register("regex_search", regex_search);
        registry.register("default", default_value);
        registry
    }

    /// Register a filter under a name, replacing any previous one.
    pub fn register(&mut self, name: impl Into<String>, filter: FilterFn) {
        self.filters.insert(name.into(), filter);
    }

    pub fn get(&self, name: &str) -> Option<FilterFn> {
        self.filters.get(name).copied()
    }

    pub fn names(&self) -> impl Iterator<Item = &str> {
        self.filters.keys().map(String::as_str)
    }
}

fn expect_string(value: &Value) -> Result<&str, String> {
    value
        .as_str()
        .ok_or_else(|| format!("expected a string, got {value:?}"))
}

fn expect_string_arg<'a>(args: &'a [Value], index: usize, filter: &str) -> Result<&'a str, String> {
    args.get(index)
        .and_then(Value::as_str)
        .ok_or_else(|| format!("filter '{filter}' requires a string argument"))
}

fn lower(value: &Value, _args: &[Value]) -> Result<Value, String> {
    Ok(Value::String(expect_string(value)?.to_lowercase()))
}

fn upper(value: &Value, _args: &[Value]) -> Result<Value, String> {
    Ok(Value::String(expect_string(value)?.to_uppercase()))
}

fn trim(value: &Value, _args: &[Value]) -> Result<Value, String> {
    Ok(Value::String(expect_string(value)?.trim().to_string()))
}

fn first(value: &Value, _args: &[Value]) -> Result<Value, String> {
    match value {
        Value::List(items) => items
            .first()
            .cloned()
            .ok_or_else(|| "cannot take first element of an empty list".to_string()),
        other => Ok(other.clone()),
    }
}

fn join(value: &Value, args: &[Value]) -> Result<Value, String> {
    let separator = expect_string_arg(args, 0, "join")?;
    match value {
        Value::List(items) => {
            let parts: Vec<String> = items.iter().map(ToString::to_string).collect();
            Ok(Value::String(parts.join(separator)))
        }
        other => Err(format!("expected a list, got {other:?}")),
    }
}

fn split(value: &Value, args: &[Value]) -> Result<Value, String> {
    let separator = expect_string_arg(args, 0, "split")?;
    let text = expect_string(value)?;
    Ok(Value::List(
        text.split(separator)
            .filter(|part| !part.is_empty())
            .map(Value::from)
            .collect(),
    ))
}

fn b64encode(value: &Value, _args: &[Value]) -> Result<Value, String> {
    let encoded = match value {
        Value::Bytes(bytes) => BASE64.encode(bytes),
        Value::String(text) => BASE64.encode(text.as_bytes()),
        other => return Err(format!("expected bytes or string, got {other:?}")),
    };
    Ok(Value::String(encoded))
}

fn b64decode(value: &Value, _args: &[Value]) -> Result<Value, String> {
    BASE64
        .decode(expect_string(value)?)
        .map(Value::Bytes)
        .map_err(|e| format!("invalid base64: {e}"))
}

fn sha256_hex(value: &Value, _args: &[Value]) -> Result<Value, String> {
    let mut hasher = Sha256::new();
    match value {
        Value::Bytes(bytes) => hasher.update(bytes),
        Value::String(text) => hasher.update(text.as_bytes()),
        other => return Err(format!("expected bytes or string, got {other:?}")),
    }
    Ok(Value::String(format!("{:x}", hasher.finalize())))
}

fn regex_search(value: &Value, args: &[Value]) -> Result<Value, String> {
    let pattern = expect_string_arg(args, 0, "regex_search")?;
    let re = Regex::new(pattern).map_err(|e| format!("invalid pattern: {e}"))?;
    let text = expect_string(value)?;
    let result = match re.captures(text) {
        Some(caps) => caps
            .get(1)
            .or_else(|| caps.get(0))
            .map(|m| m.as_str())
            .unwrap_or(""),
        None => "",
    };
    Ok(Value::String(result.to_string()))
}

fn default_value(value: &Value, args: &[Value]) -> Result<Value, String> {
    let fallback = args
        .first()
        .ok_or_else(|| "filter 'default' requires an argument".to_string())?;
    let is_empty = match value {
        Value::String(s) => s.is_empty(),
        Value::List(items) => items.is_empty(),
        _ => false,
    };
    Ok(if is_empty {
        fallback.clone()
    } else {
        value.clone()
    })
}
