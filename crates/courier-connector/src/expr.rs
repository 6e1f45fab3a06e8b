//! Mapping expression templates
//!
//! A small, sandboxed template language used to project attributes and to
//! render query variables. A template is plain text with `${...}`
//! substitutions; inside the braces, a dotted variable path may be piped
//! through registered filters:
//!
//! ```text
//! ${LOGIN | lower}@corp.example
//! ${GROUPS | join:','}
//! ${ITEM_CACHED_VALUES.uid | default:'0'}
//! ```
//!
//! There is no arbitrary code execution: the only operations are variable
//! lookup and filter application. A template that consists of exactly one
//! substitution renders natively (the value keeps its type); any
//! surrounding literal text switches to string concatenation.
//!
//! A substitution whose variable is absent renders as the empty string -
//! the `default` filter turns that into a fallback - except for a bare
//! single substitution with no filters, which renders as "no value" so the
//! projected attribute is omitted.

use courier_core::Value;

use crate::error::{ConnectorError, ConnectorResult};
use crate::filters::FilterRegistry;

/// One compiled filter invocation.
#[derive(Debug, Clone, PartialEq)]
pub struct FilterCall {
    pub name: String,
    pub args: Vec<Value>,
}

#[derive(Debug, Clone, PartialEq)]
struct Subst {
    path: Vec<String>,
    filters: Vec<FilterCall>,
}

#[derive(Debug, Clone, PartialEq)]
enum Segment {
    Literal(String),
    Subst(Subst),
}

/// A compiled template.
#[derive(Debug, Clone)]
pub struct Template {
    /// Attribute or variable name this template computes, for diagnostics.
    attribute: String,
    segments: Vec<Segment>,
}

/// Check whether a raw mapping string is a template (as opposed to a plain
/// remote column name).
pub fn is_template(text: &str) -> bool {
    text.contains("${")
}

impl Template {
    /// Compile a template, verifying that every referenced filter exists.
    pub fn compile(
        attribute: &str,
        text: &str,
        registry: &FilterRegistry,
    ) -> ConnectorResult<Template> {
        let invalid = |message: String| ConnectorError::InvalidExpression {
            attribute: attribute.to_string(),
            message,
        };

        let mut segments = Vec::new();
        let mut rest = text;
        while let Some(start) = rest.find("${") {
            if start > 0 {
                segments.push(Segment::Literal(rest[..start].to_string()));
            }
            let after = &rest[start + 2..];
            let end = after
                .find('}')
                .ok_or_else(|| invalid("unterminated '${'".to_string()))?;
            let subst = parse_subst(&after[..end]).map_err(&invalid)?;
            for call in &subst.filters {
                if registry.get(&call.name).is_none() {
                    return Err(ConnectorError::UnknownFilter {
                        name: call.name.clone(),
                    });
                }
            }
            segments.push(Segment::Subst(subst));
            rest = &after[end + 1..];
        }
        if !rest.is_empty() {
            segments.push(Segment::Literal(rest.to_string()));
        }
        if segments.is_empty() {
            segments.push(Segment::Literal(String::new()));
        }

        Ok(Template {
            attribute: attribute.to_string(),
            segments,
        })
    }

    /// Root variable names referenced by this template.
    pub fn vars(&self) -> Vec<&str> {
        self.segments
            .iter()
            .filter_map(|segment| match segment {
                Segment::Subst(subst) => subst.path.first().map(String::as_str),
                Segment::Literal(_) => None,
            })
            .collect()
    }

    /// Render against a variable lookup. Returns `None` when the template is
    /// a bare substitution of an absent variable.
    pub fn render(
        &self,
        registry: &FilterRegistry,
        lookup: &dyn Fn(&[String]) -> Option<Value>,
    ) -> ConnectorResult<Option<Value>> {
        // Native mode: a lone substitution keeps the value type.
        if let [Segment::Subst(subst)] = self.segments.as_slice() {
            let resolved = lookup(&subst.path);
            if resolved.is_none() && subst.filters.is_empty() {
                return Ok(None);
            }
            let value = resolved.unwrap_or_else(|| Value::String(String::new()));
            return Ok(Some(self.apply_filters(registry, &subst.filters, value)?));
        }

        let mut out = String::new();
        for segment in &self.segments {
            match segment {
                Segment::Literal(text) => out.push_str(text),
                Segment::Subst(subst) => {
                    let value = lookup(&subst.path).unwrap_or_else(|| Value::String(String::new()));
                    let value = self.apply_filters(registry, &subst.filters, value)?;
                    out.push_str(&value.to_string());
                }
            }
        }
        Ok(Some(Value::String(out)))
    }

    fn apply_filters(
        &self,
        registry: &FilterRegistry,
        filters: &[FilterCall],
        mut value: Value,
    ) -> ConnectorResult<Value> {
        for call in filters {
            let filter = registry
                .get(&call.name)
                .ok_or_else(|| ConnectorError::UnknownFilter {
                    name: call.name.clone(),
                })?;
            value = filter(&value, &call.args).map_err(|message| ConnectorError::FilterFailed {
                filter: call.name.clone(),
                attribute: self.attribute.clone(),
                message,
            })?;
        }
        Ok(value)
    }
}

fn is_ident(text: &str) -> bool {
    !text.is_empty()
        && text
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || c == '_')
}

fn parse_subst(inner: &str) -> Result<Subst, String> {
    let mut parts = split_outside_quotes(inner, '|');
    if parts.is_empty() {
        return Err("empty substitution".to_string());
    }
    let path_text = parts.remove(0);
    let path: Vec<String> = path_text.trim().split('.').map(str::to_string).collect();
    if path.iter().any(|seg| !is_ident(seg)) {
        return Err(format!("invalid variable path '{}'", path_text.trim()));
    }

    let mut filters = Vec::new();
    for part in parts {
        let part = part.trim();
        let (name, raw_args) = match part.split_once(':') {
            Some((name, args)) => (name.trim(), Some(args)),
            None => (part, None),
        };
        if !is_ident(name) {
            return Err(format!("invalid filter name '{name}'"));
        }
        let args = match raw_args {
            Some(raw) => split_outside_quotes(raw, ',')
                .into_iter()
                .map(|arg| parse_arg(arg.trim()))
                .collect::<Result<Vec<Value>, String>>()?,
            None => Vec::new(),
        };
        filters.push(FilterCall {
            name: name.to_string(),
            args,
        });
    }

    Ok(Subst { path, filters })
}

fn parse_arg(text: &str) -> Result<Value, String> {
    if text.len() >= 2 && text.starts_with('\'') && text.ends_with('\'') {
        return Ok(Value::String(text[1..text.len() - 1].to_string()));
    }
    if let Ok(int) = text.parse::<i64>() {
        return Ok(Value::Integer(int));
    }
    Err(format!("invalid filter argument '{text}'"))
}

fn split_outside_quotes(text: &str, separator: char) -> Vec<String> {
    let mut parts = Vec::new();
    let mut current = String::new();
    let mut in_quotes = false;
    for c in text.chars() {
        if c == '\'' {
            in_quotes = !in_quotes;
            current.push(c);
        } else if c == separator && !in_quotes {
            parts.push(std::mem::take(&mut current));
        } else {
            current.push(c);
        }
    }
    if !current.is_empty() {
        parts.push(current);
    }
    parts
}
