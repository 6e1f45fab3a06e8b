//! Dataschema
//!
//! Declarative description of the entity types flowing through the
//! pipeline: attribute classes, primary keys, foreign keys and the declared
//! type order. The schema is versioned with a revision counter, comparable
//! across revisions, and has a public (wire) view that strips the
//! producer-private attribute classes.

use std::collections::{BTreeMap, BTreeSet};

use serde::{Deserialize, Serialize};

use crate::error::{CoreError, CoreResult};
use crate::pkey::Pkey;
use crate::value::Value;

/// Primary key declaration: one attribute or an ordered tuple of attributes.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum PkeyAttr {
    Single(String),
    Composite(Vec<String>),
}

impl PkeyAttr {
    /// Attribute names making up the key, in order.
    pub fn attrs(&self) -> Vec<&str> {
        match self {
            PkeyAttr::Single(attr) => vec![attr.as_str()],
            PkeyAttr::Composite(attrs) => attrs.iter().map(String::as_str).collect(),
        }
    }

    /// Extract the key value from an attribute map.
    pub fn extract(&self, entity: &str, attrs: &BTreeMap<String, Value>) -> CoreResult<Pkey> {
        let get = |attr: &str| -> CoreResult<Value> {
            attrs
                .get(attr)
                .cloned()
                .ok_or_else(|| CoreError::MissingPkeyAttribute {
                    entity: entity.to_string(),
                    attribute: attr.to_string(),
                })
        };
        match self {
            PkeyAttr::Single(attr) => Ok(Pkey::Single(get(attr)?)),
            PkeyAttr::Composite(parts) => {
                let mut values = Vec::with_capacity(parts.len());
                for attr in parts {
                    values.push(get(attr)?);
                }
                Ok(Pkey::Composite(values))
            }
        }
    }
}

/// Reference to the parent side of a foreign key.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ForeignKeyRef {
    /// Parent entity type.
    #[serde(rename = "type")]
    pub to_type: String,
    /// Parent attribute the local attribute refers to.
    pub attr: String,
}

/// Schema of one entity type.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TypeSchema {
    /// All datamodel attributes of the type.
    pub attributes: BTreeSet<String>,
    /// Sent but never cached; always diff as freshly present.
    #[serde(default, skip_serializing_if = "BTreeSet::is_empty")]
    pub secrets: BTreeSet<String>,
    /// Cached but never sent.
    #[serde(default, skip_serializing_if = "BTreeSet::is_empty")]
    pub cacheonly: BTreeSet<String>,
    /// Producer-side only: not sent, not cached, not diffed.
    #[serde(default, skip_serializing_if = "BTreeSet::is_empty")]
    pub local: BTreeSet<String>,
    /// Primary key attribute(s).
    pub pkey: PkeyAttr,
    /// Local attribute -> parent (type, attribute).
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub foreign_keys: BTreeMap<String, ForeignKeyRef>,
    /// Optional display template, e.g. `"${login} (${cn})"`.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub to_string: Option<String>,
}

impl TypeSchema {
    /// Whether the attribute participates in diffing (everything except
    /// local and cache-only attributes; secrets do participate).
    pub fn is_diffable(&self, attr: &str) -> bool {
        !self.local.contains(attr) && !self.cacheonly.contains(attr)
    }

    /// Whether the attribute is transmitted in events.
    pub fn is_sent(&self, attr: &str) -> bool {
        !self.local.contains(attr) && !self.cacheonly.contains(attr)
    }

    /// Whether the attribute is persisted in the cache.
    pub fn is_cached(&self, attr: &str) -> bool {
        !self.local.contains(attr) && !self.secrets.contains(attr)
    }
}

/// One entry of the declared type list.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TypeDecl {
    pub name: String,
    #[serde(flatten)]
    pub schema: TypeSchema,
}

/// Difference between two schema revisions, in type granularity.
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct SchemaDiff {
    pub added: Vec<String>,
    pub removed: Vec<String>,
    pub modified: Vec<String>,
}

impl SchemaDiff {
    pub fn is_empty(&self) -> bool {
        self.added.is_empty() && self.removed.is_empty() && self.modified.is_empty()
    }
}

/// The full datamodel schema: revisioned, ordered list of type declarations.
///
/// The declaration order is semantic: it fixes the apply order of adds and
/// modifies, and its reverse fixes the apply order of removals.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Dataschema {
    pub revision: u32,
    pub types: Vec<TypeDecl>,
}

impl Dataschema {
    /// Build a schema from an ordered list of `(name, schema)` pairs.
    pub fn new(revision: u32, types: Vec<(String, TypeSchema)>) -> Self {
        Dataschema {
            revision,
            types: types
                .into_iter()
                .map(|(name, schema)| TypeDecl { name, schema })
                .collect(),
        }
    }

    /// Look up one type's schema.
    pub fn get(&self, name: &str) -> Option<&TypeSchema> {
        self.types
            .iter()
            .find(|decl| decl.name == name)
            .map(|decl| &decl.schema)
    }

    /// Type names in declared order.
    pub fn type_names(&self) -> impl DoubleEndedIterator<Item = &str> {
        self.types.iter().map(|decl| decl.name.as_str())
    }

    pub fn contains(&self, name: &str) -> bool {
        self.get(name).is_some()
    }

    /// Secret attribute names of one type; empty set for unknown types.
    pub fn secrets_of(&self, name: &str) -> BTreeSet<String> {
        self.get(name)
            .map(|schema| schema.secrets.clone())
            .unwrap_or_default()
    }

    /// The wire view of the schema: cache-only and local attributes are
    /// producer-private and are stripped before the schema leaves the
    /// process.
    pub fn public(&self) -> Dataschema {
        let types = self
            .types
            .iter()
            .map(|decl| {
                let schema = &decl.schema;
                let attributes = schema
                    .attributes
                    .iter()
                    .filter(|attr| schema.is_sent(attr))
                    .cloned()
                    .collect();
                TypeDecl {
                    name: decl.name.clone(),
                    schema: TypeSchema {
                        attributes,
                        secrets: schema.secrets.clone(),
                        cacheonly: BTreeSet::new(),
                        local: BTreeSet::new(),
                        pkey: schema.pkey.clone(),
                        foreign_keys: schema.foreign_keys.clone(),
                        to_string: schema.to_string.clone(),
                    },
                }
            })
            .collect();
        Dataschema {
            revision: self.revision,
            types,
        }
    }

    /// Compare against another revision, assuming `self` is the newer one.
    pub fn diff_from(&self, other: &Dataschema) -> SchemaDiff {
        let mut diff = SchemaDiff::default();
        let new_names: BTreeSet<&str> = self.type_names().collect();
        let old_names: BTreeSet<&str> = other.type_names().collect();

        for name in self.type_names() {
            if !old_names.contains(name) {
                diff.added.push(name.to_string());
            } else if self.get(name) != other.get(name) {
                diff.modified.push(name.to_string());
            }
        }
        for name in other.type_names() {
            if !new_names.contains(name) {
                diff.removed.push(name.to_string());
            }
        }
        diff
    }

    /// Validate internal consistency: pkey attributes must be declared,
    /// foreign keys must reference declared parent types, and foreign keys
    /// must not form cycles.
    pub fn validate(&self) -> CoreResult<()> {
        for decl in &self.types {
            for attr in decl.schema.pkey.attrs() {
                if !decl.schema.attributes.contains(attr) {
                    return Err(CoreError::invalid_schema(format!(
                        "type '{}' declares pkey attribute '{attr}' outside its attributes",
                        decl.name
                    )));
                }
            }
            for (from_attr, fkey) in &decl.schema.foreign_keys {
                if !decl.schema.attributes.contains(from_attr) {
                    return Err(CoreError::invalid_schema(format!(
                        "type '{}' declares a foreign key on unknown attribute '{from_attr}'",
                        decl.name
                    )));
                }
                if !self.contains(&fkey.to_type) {
                    return Err(CoreError::invalid_schema(format!(
                        "type '{}' has a foreign key to undeclared type '{}'",
                        decl.name, fkey.to_type
                    )));
                }
            }
        }
        crate::foreignkey::check_circular_refs(self)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    pub(crate) fn users_schema() -> TypeSchema {
        TypeSchema {
            attributes: ["uid", "login", "mail", "pw", "last_change"]
                .iter()
                .map(ToString::to_string)
                .collect(),
            secrets: ["pw"].iter().map(ToString::to_string).collect(),
            cacheonly: BTreeSet::new(),
            local: ["last_change"].iter().map(ToString::to_string).collect(),
            pkey: PkeyAttr::Single("uid".to_string()),
            foreign_keys: BTreeMap::new(),
            to_string: None,
        }
    }

    fn members_schema() -> TypeSchema {
        TypeSchema {
            attributes: ["gid", "uid"].iter().map(ToString::to_string).collect(),
            secrets: BTreeSet::new(),
            cacheonly: BTreeSet::new(),
            local: BTreeSet::new(),
            pkey: PkeyAttr::Composite(vec!["gid".to_string(), "uid".to_string()]),
            foreign_keys: [(
                "uid".to_string(),
                ForeignKeyRef {
                    to_type: "Users".to_string(),
                    attr: "uid".to_string(),
                },
            )]
            .into_iter()
            .collect(),
            to_string: None,
        }
    }

    fn schema() -> Dataschema {
        Dataschema::new(
            1,
            vec![
                ("Users".to_string(), users_schema()),
                ("GroupsMembers".to_string(), members_schema()),
            ],
        )
    }

    #[test]
    fn test_declared_order_is_preserved() {
        let schema = schema();
        let names: Vec<&str> = schema.type_names().collect();
        assert_eq!(names, vec!["Users", "GroupsMembers"]);
    }

    #[test]
    fn test_composite_pkey_extract() {
        let attrs: BTreeMap<String, Value> = [
            ("gid".to_string(), Value::from(5)),
            ("uid".to_string(), Value::from(1)),
        ]
        .into_iter()
        .collect();
        let pkey = members_schema()
            .pkey
            .extract("GroupsMembers", &attrs)
            .unwrap();
        assert_eq!(pkey, Pkey::Composite(vec![Value::from(5), Value::from(1)]));
    }

    #[test]
    fn test_missing_pkey_attr_is_an_error() {
        let attrs = BTreeMap::new();
        let err = users_schema().pkey.extract("Users", &attrs).unwrap_err();
        assert!(err.to_string().contains("uid"));
    }

    #[test]
    fn test_public_view_strips_private_classes() {
        let public = schema().public();
        let users = public.get("Users").unwrap();
        assert!(!users.attributes.contains("last_change"));
        assert!(users.local.is_empty());
        assert!(users.secrets.contains("pw"));
    }

    #[test]
    fn test_diff_from_detects_changes() {
        let old = schema();
        let mut new = schema();
        new.types.retain(|decl| decl.name != "GroupsMembers");
        new.types[0].schema.attributes.insert("phone".to_string());

        let diff = new.diff_from(&old);
        assert_eq!(diff.removed, vec!["GroupsMembers".to_string()]);
        assert_eq!(diff.modified, vec!["Users".to_string()]);
        assert!(diff.added.is_empty());
    }

    #[test]
    fn test_validate_rejects_unknown_fkey_target() {
        let mut bad = schema();
        bad.types.remove(0); // Drop Users, leaving the dangling foreign key
        assert!(bad.validate().is_err());
    }

    #[test]
    fn test_validate_accepts_well_formed_schema() {
        assert!(schema().validate().is_ok());
    }

    #[test]
    fn test_json_roundtrip() {
        let original = schema();
        let json = serde_json::to_string(&original).unwrap();
        let back: Dataschema = serde_json::from_str(&json).unwrap();
        assert_eq!(original, back);
    }
}
