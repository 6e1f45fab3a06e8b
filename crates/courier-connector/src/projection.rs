//! Attribute projection
//!
//! Evaluates a per-source mapping from remote columns to local attributes.
//! A mapping value is one of:
//!
//! - a remote column name - the value is taken as-is, nulls omitted;
//! - a list of remote column names - the non-null values are concatenated
//!   in order into a list, an empty result omits the attribute;
//! - an expression template - rendered with every remote column in scope
//!   plus `ITEM_CACHED_VALUES`, the previously cached object (empty on
//!   first sight).
//!
//! Projection never mutates its inputs; a failing filter aborts the row
//! with a recoverable diagnostic.

use std::collections::{BTreeMap, BTreeSet};

use serde::Deserialize;

use courier_core::Value;

use crate::error::{ConnectorError, ConnectorResult};
use crate::expr::{is_template, Template};
use crate::filters::FilterRegistry;
use crate::traits::Row;

/// Variable roots reserved for pipeline-provided bindings.
pub const RESERVED_VARS: &[&str] = &[
    "ITEM_CACHED_VALUES",
    "ITEM_FETCHED_VALUES",
    "CACHED_VALUES",
    "FETCHED_VALUES",
    "_SELF",
];

/// Raw mapping value as written in the configuration.
#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(untagged)]
pub enum AttrMapping {
    /// Single remote column, or an expression template.
    Column(String),
    /// Ordered list of remote columns, concatenated into a list value.
    Columns(Vec<String>),
}

#[derive(Debug, Clone)]
enum CompiledKind {
    Column(String),
    Columns(Vec<String>),
    Template(Template),
}

#[derive(Debug, Clone)]
struct CompiledAttr {
    target: String,
    kind: CompiledKind,
}

/// A compiled per-source attribute mapping, built once per cycle.
#[derive(Debug, Clone)]
pub struct Projection {
    attrs: Vec<CompiledAttr>,
    remote_attrs: BTreeSet<String>,
}

impl Projection {
    /// Compile the mapping, collecting the remote column names it reads.
    pub fn compile(
        mappings: &BTreeMap<String, AttrMapping>,
        registry: &FilterRegistry,
    ) -> ConnectorResult<Projection> {
        let mut attrs = Vec::new();
        let mut remote_attrs = BTreeSet::new();

        for (target, mapping) in mappings {
            let kind = match mapping {
                AttrMapping::Column(text) if is_template(text) => {
                    let template = Template::compile(target, text, registry)?;
                    for var in template.vars() {
                        if !RESERVED_VARS.contains(&var) {
                            remote_attrs.insert(var.to_string());
                        }
                    }
                    CompiledKind::Template(template)
                }
                AttrMapping::Column(name) => {
                    remote_attrs.insert(name.clone());
                    CompiledKind::Column(name.clone())
                }
                AttrMapping::Columns(names) => {
                    remote_attrs.extend(names.iter().cloned());
                    CompiledKind::Columns(names.clone())
                }
            };
            attrs.push(CompiledAttr {
                target: target.clone(),
                kind,
            });
        }

        Ok(Projection {
            attrs,
            remote_attrs,
        })
    }

    /// Remote column names this projection reads.
    pub fn remote_attrs(&self) -> &BTreeSet<String> {
        &self.remote_attrs
    }

    /// Local attribute names this projection produces.
    pub fn local_attrs(&self) -> BTreeSet<String> {
        self.attrs.iter().map(|attr| attr.target.clone()).collect()
    }

    /// Project one fetched row into local attributes.
    pub fn project(
        &self,
        registry: &FilterRegistry,
        row: &Row,
        cached: &Row,
    ) -> ConnectorResult<BTreeMap<String, Value>> {
        let lookup = bindings(row, cached);
        let mut out = BTreeMap::new();

        for attr in &self.attrs {
            match &attr.kind {
                CompiledKind::Column(name) => {
                    if let Some(value) = row.get(name) {
                        out.insert(attr.target.clone(), value.clone());
                    }
                }
                CompiledKind::Columns(names) => {
                    let items: Vec<Value> = names
                        .iter()
                        .filter_map(|name| row.get(name).cloned())
                        .collect();
                    if !items.is_empty() {
                        out.insert(attr.target.clone(), Value::List(items));
                    }
                }
                CompiledKind::Template(template) => {
                    if let Some(value) = template.render(registry, &lookup)? {
                        if !value.is_empty_list() {
                            out.insert(attr.target.clone(), value);
                        }
                    }
                }
            }
        }
        Ok(out)
    }

    /// Project a single attribute, used to compute the pkey of a raw row
    /// before the cached object can be looked up.
    pub fn project_attr(
        &self,
        registry: &FilterRegistry,
        name: &str,
        row: &Row,
    ) -> ConnectorResult<Option<Value>> {
        let empty = Row::new();
        let lookup = bindings(row, &empty);
        for attr in &self.attrs {
            if attr.target != name {
                continue;
            }
            return match &attr.kind {
                CompiledKind::Column(column) => Ok(row.get(column).cloned()),
                CompiledKind::Columns(columns) => {
                    let items: Vec<Value> = columns
                        .iter()
                        .filter_map(|column| row.get(column).cloned())
                        .collect();
                    Ok((!items.is_empty()).then_some(Value::List(items)))
                }
                CompiledKind::Template(template) => template.render(registry, &lookup),
            };
        }
        Err(ConnectorError::projection_failed(
            name,
            "attribute is not mapped",
        ))
    }
}

/// Build the variable lookup over a fetched row plus the cached object.
pub fn bindings<'a>(row: &'a Row, cached: &'a Row) -> impl Fn(&[String]) -> Option<Value> + 'a {
    move |path: &[String]| {
        let root = path.first()?;
        let mut value = if root == "ITEM_CACHED_VALUES" {
            if path.len() == 1 {
                return Some(Value::Map(cached.clone()));
            }
            cached.get(&path[1])?.clone()
        } else {
            let mut v = row.get(root)?.clone();
            if path.len() > 1 {
                v = descend(v, &path[1..])?;
            }
            return Some(v);
        };
        if path.len() > 2 {
            value = descend(value, &path[2..])?;
        }
        Some(value)
    }
}

fn descend(mut value: Value, path: &[String]) -> Option<Value> {
    for segment in path {
        match value {
            Value::Map(map) => value = map.get(segment)?.clone(),
            _ => return None,
        }
    }
    Some(value)
}
