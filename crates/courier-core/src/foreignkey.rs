//! Foreign key resolution
//!
//! Foreign keys are declared in the schema as `(from_attr) -> (to_type,
//! to_attr)`. The dependency graph is rebuilt from declarations each time it
//! is needed; object graphs never hold direct references to each other.

use std::collections::BTreeMap;

use crate::error::{CoreError, CoreResult};
use crate::pkey::Pkey;
use crate::schema::{Dataschema, TypeSchema};
use crate::value::Value;

/// Check for circular references in the declared foreign keys.
pub fn check_circular_refs(schema: &Dataschema) -> CoreResult<()> {
    for start in schema.type_names() {
        let mut visited: Vec<&str> = vec![start];
        walk(schema, start, &mut visited)?;
    }
    Ok(())
}

fn walk<'a>(schema: &'a Dataschema, name: &str, visited: &mut Vec<&'a str>) -> CoreResult<()> {
    let Some(type_schema) = schema.get(name) else {
        return Ok(());
    };
    for fkey in type_schema.foreign_keys.values() {
        if visited.contains(&fkey.to_type.as_str()) {
            return Err(CoreError::CircularForeignKeys {
                through: visited.join(" -> "),
            });
        }
        visited.push(fkey.to_type.as_str());
        walk(schema, &fkey.to_type, visited)?;
        visited.pop();
    }
    Ok(())
}

/// Resolve the parent references of one object from its attribute values.
///
/// Returns `(parent_type, parent_pkey)` for every foreign-key attribute that
/// carries a value. The parent pkey is always scalar: foreign keys point at
/// a single parent attribute.
pub fn parent_refs(
    type_schema: &TypeSchema,
    attrs: &BTreeMap<String, Value>,
) -> Vec<(String, Pkey)> {
    let mut refs = Vec::new();
    for (from_attr, fkey) in &type_schema.foreign_keys {
        if let Some(value) = attrs.get(from_attr) {
            refs.push((fkey.to_type.clone(), Pkey::Single(value.clone())));
        }
    }
    refs
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::schema::{ForeignKeyRef, PkeyAttr, TypeDecl};
    use std::collections::BTreeSet;

    fn type_with_fkey(to_type: &str) -> TypeSchema {
        TypeSchema {
            attributes: ["id", "parent"].iter().map(ToString::to_string).collect(),
            secrets: BTreeSet::new(),
            cacheonly: BTreeSet::new(),
            local: BTreeSet::new(),
            pkey: PkeyAttr::Single("id".to_string()),
            foreign_keys: [(
                "parent".to_string(),
                ForeignKeyRef {
                    to_type: to_type.to_string(),
                    attr: "id".to_string(),
                },
            )]
            .into_iter()
            .collect(),
        to_string: None,
        }
    }

    fn leaf_type() -> TypeSchema {
        TypeSchema {
            attributes: ["id"].iter().map(ToString::to_string).collect(),
            secrets: BTreeSet::new(),
            cacheonly: BTreeSet::new(),
            local: BTreeSet::new(),
            pkey: PkeyAttr::Single("id".to_string()),
            foreign_keys: BTreeMap::new(),
            to_string: None,
        }
    }

    #[test]
    fn test_acyclic_graph_passes() {
        let schema = Dataschema {
            revision: 1,
            types: vec![
                TypeDecl {
                    name: "A".to_string(),
                    schema: leaf_type(),
                },
                TypeDecl {
                    name: "B".to_string(),
                    schema: type_with_fkey("A"),
                },
            ],
        };
        assert!(check_circular_refs(&schema).is_ok());
    }

    #[test]
    fn test_cycle_is_detected() {
        let schema = Dataschema {
            revision: 1,
            types: vec![
                TypeDecl {
                    name: "A".to_string(),
                    schema: type_with_fkey("B"),
                },
                TypeDecl {
                    name: "B".to_string(),
                    schema: type_with_fkey("A"),
                },
            ],
        };
        let err = check_circular_refs(&schema).unwrap_err();
        assert!(matches!(err, CoreError::CircularForeignKeys { .. }));
    }

    #[test]
    fn test_self_reference_is_detected() {
        let schema = Dataschema {
            revision: 1,
            types: vec![TypeDecl {
                name: "A".to_string(),
                schema: type_with_fkey("A"),
            }],
        };
        assert!(check_circular_refs(&schema).is_err());
    }

    #[test]
    fn test_parent_refs_resolution() {
        let schema = type_with_fkey("Users");
        let attrs: BTreeMap<String, Value> = [
            ("id".to_string(), Value::from(7)),
            ("parent".to_string(), Value::from(1)),
        ]
        .into_iter()
        .collect();
        let refs = parent_refs(&schema, &attrs);
        assert_eq!(refs, vec![("Users".to_string(), Pkey::from(1))]);
    }

    #[test]
    fn test_parent_refs_skips_absent_attrs() {
        let schema = type_with_fkey("Users");
        let attrs: BTreeMap<String, Value> =
            [("id".to_string(), Value::from(7))].into_iter().collect();
        assert!(parent_refs(&schema, &attrs).is_empty());
    }
}
