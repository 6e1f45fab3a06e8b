//! Producer datamodel configuration
//!
//! The declared entity types, their source bindings and constraints, in
//! declaration order. Everything is validated at load time: unknown keys
//! are rejected by serde, pkeys must be fetched by every source, predicate
//! forms must be well-formed, and integrity predicates may only reference
//! previously-declared types.

use std::collections::{BTreeMap, BTreeSet};

use serde::Deserialize;

use courier_connector::{AttrMapping, QueryKind};
use courier_core::{Dataschema, ForeignKeyRef, PkeyAttr, PkeyMergeConstraint, TypeSchema};

use crate::error::{ProducerError, ProducerResult};
use crate::predicate::Predicate;

/// Policy applied when two sources disagree on an attribute value.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MergeConflictPolicy {
    /// Evict the row and fall back to its cached value when one exists.
    #[default]
    UseCachedEntry,
    /// Keep the value of the first source in declaration order.
    KeepFirstValue,
}

/// One query binding of a source: the statement kind, its text and its
/// variables. Variable values may be expression templates.
#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct QueryConfig {
    #[serde(rename = "type")]
    pub kind: QueryKind,
    #[serde(default)]
    pub query: String,
    #[serde(default)]
    pub vars: BTreeMap<String, VarValue>,
}

/// A query variable: a scalar, a template string, or a structured value
/// whose leaves may be templates (LDAP mutation lists).
#[derive(Debug, Clone, Deserialize)]
#[serde(untagged)]
pub enum VarValue {
    Bool(bool),
    Int(i64),
    Float(f64),
    Text(String),
    List(Vec<VarValue>),
    Map(BTreeMap<String, VarValue>),
}

/// Binding of one entity type to one source.
#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct SourceConfig {
    /// Registered datasource name.
    pub name: String,
    pub fetch: QueryConfig,
    /// Ran after each successfully published event of this type.
    #[serde(default)]
    pub commit_one: Option<QueryConfig>,
    /// Ran once at end of cycle.
    #[serde(default)]
    pub commit_all: Option<QueryConfig>,
    /// Local attribute -> remote column(s) or expression.
    pub attrsmapping: BTreeMap<String, AttrMapping>,
    #[serde(default)]
    pub secrets_attrs: BTreeSet<String>,
    #[serde(default)]
    pub cacheonly_attrs: BTreeSet<String>,
    #[serde(default)]
    pub local_attrs: BTreeSet<String>,
    #[serde(default)]
    pub pkey_merge_constraint: PkeyMergeConstraint,
    /// Per-source row predicates; peers are source names of this type.
    #[serde(default)]
    pub merge_constraints: Vec<Predicate>,
}

/// Declaration of one entity type.
#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct TypeConfig {
    pub name: String,
    pub primary_key: PkeyAttr,
    #[serde(default)]
    pub to_string: Option<String>,
    #[serde(default)]
    pub on_merge_conflict: MergeConflictPolicy,
    /// Cross-type row predicates; peers are previously-declared types.
    #[serde(default)]
    pub integrity_constraints: Vec<Predicate>,
    #[serde(default)]
    pub foreign_keys: BTreeMap<String, ForeignKeyRef>,
    /// Ordered source bindings; the first source seeds the merge.
    pub sources: Vec<SourceConfig>,
}

/// The whole producer datamodel, in declared type order.
#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct DatamodelConfig {
    pub types: Vec<TypeConfig>,
}

impl DatamodelConfig {
    /// Validate the declaration and derive the dataschema at the given
    /// revision.
    pub fn build_schema(&self, revision: u32) -> ProducerResult<Dataschema> {
        if self.types.is_empty() {
            return Err(ProducerError::config_invalid("no entity type declared"));
        }

        let mut types = Vec::with_capacity(self.types.len());
        let mut declared: Vec<&str> = Vec::new();

        for type_config in &self.types {
            if declared.contains(&type_config.name.as_str()) {
                return Err(ProducerError::config_invalid(format!(
                    "type '{}' is declared twice",
                    type_config.name
                )));
            }
            if type_config.sources.is_empty() {
                return Err(ProducerError::config_invalid(format!(
                    "type '{}' declares no source",
                    type_config.name
                )));
            }

            let mut attributes = BTreeSet::new();
            let mut secrets = BTreeSet::new();
            let mut cacheonly = BTreeSet::new();
            let mut local = BTreeSet::new();
            let source_names: Vec<&str> = type_config
                .sources
                .iter()
                .map(|s| s.name.as_str())
                .collect();

            for source in &type_config.sources {
                attributes.extend(source.attrsmapping.keys().cloned());
                secrets.extend(source.secrets_attrs.iter().cloned());
                cacheonly.extend(source.cacheonly_attrs.iter().cloned());
                local.extend(source.local_attrs.iter().cloned());

                // The pkey must be fetched from each datasource.
                for pkey_attr in type_config.primary_key.attrs() {
                    if !source.attrsmapping.contains_key(pkey_attr) {
                        return Err(ProducerError::config_invalid(format!(
                            "type '{}': primary key attribute '{pkey_attr}' is not mapped by source '{}'",
                            type_config.name, source.name
                        )));
                    }
                }

                for predicate in &source.merge_constraints {
                    predicate
                        .validate()
                        .map_err(ProducerError::config_invalid)?;
                    if let Some(peer) = predicate.peer() {
                        if !source_names.contains(&peer) {
                            return Err(ProducerError::config_invalid(format!(
                                "type '{}': merge constraint on '{}' references '{peer}', which is not a source of this type",
                                type_config.name, predicate.attr
                            )));
                        }
                    }
                }
            }

            // Integrity predicates may only look backwards in declaration
            // order, which keeps their evaluation deterministic.
            for predicate in &type_config.integrity_constraints {
                predicate
                    .validate()
                    .map_err(ProducerError::config_invalid)?;
                if let Some(peer) = predicate.peer() {
                    if !declared.contains(&peer) {
                        return Err(ProducerError::config_invalid(format!(
                            "type '{}': integrity constraint references '{peer}', which is not declared earlier",
                            type_config.name
                        )));
                    }
                }
            }

            declared.push(type_config.name.as_str());
            types.push((
                type_config.name.clone(),
                TypeSchema {
                    attributes,
                    secrets,
                    cacheonly,
                    local,
                    pkey: type_config.primary_key.clone(),
                    foreign_keys: type_config.foreign_keys.clone(),
                    to_string: type_config.to_string.clone(),
                },
            ));
        }

        let schema = Dataschema::new(revision, types);
        schema.validate()?;
        Ok(schema)
    }

    pub fn get(&self, name: &str) -> Option<&TypeConfig> {
        self.types.iter().find(|t| t.name == name)
    }
}
