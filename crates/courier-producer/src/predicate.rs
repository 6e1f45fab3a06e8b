//! Merge and integrity predicates
//!
//! Constraints are structured declarations evaluated against the row under
//! test (`_SELF` is implicit) and named peer pkey sets - source names for
//! merge constraints, entity type names for integrity constraints. There is
//! no expression evaluation here: the predicate forms are closed, which is
//! what makes forward-reference rejection checkable at configuration load.

use std::collections::{BTreeMap, BTreeSet};

use serde::Deserialize;

use courier_core::{Object, Pkey, Value};

/// A single boolean predicate on one attribute of the row under test.
///
/// Exactly one of the test fields must be set:
///
/// ```yaml
/// - attr: uid
///   in_pkeys_of: Users
/// - attr: expired
///   equals: false
/// - attr: mail
///   present: true
/// ```
#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct Predicate {
    /// Attribute of the row under test.
    pub attr: String,
    /// True when the attribute value is a pkey of the named peer set.
    #[serde(default)]
    pub in_pkeys_of: Option<String>,
    /// True when the attribute value is absent from the named peer set
    /// (vacuously true when the attribute is unset).
    #[serde(default)]
    pub not_in_pkeys_of: Option<String>,
    /// True when the attribute presence matches.
    #[serde(default)]
    pub present: Option<bool>,
    /// True when the attribute carries exactly this value.
    #[serde(default)]
    pub equals: Option<Value>,
}

impl Predicate {
    /// Check that exactly one test form is declared.
    pub fn validate(&self) -> Result<(), String> {
        let set = usize::from(self.in_pkeys_of.is_some())
            + usize::from(self.not_in_pkeys_of.is_some())
            + usize::from(self.present.is_some())
            + usize::from(self.equals.is_some());
        if set != 1 {
            return Err(format!(
                "predicate on '{}' must declare exactly one of in_pkeys_of, not_in_pkeys_of, present, equals",
                self.attr
            ));
        }
        Ok(())
    }

    /// The peer pkey set this predicate references, if any.
    pub fn peer(&self) -> Option<&str> {
        self.in_pkeys_of
            .as_deref()
            .or(self.not_in_pkeys_of.as_deref())
    }

    /// Evaluate against one row and the peer pkey sets in scope.
    pub fn eval(&self, obj: &Object, pkeys: &BTreeMap<String, BTreeSet<Pkey>>) -> bool {
        let value = obj.get(&self.attr);

        if let Some(peer) = &self.in_pkeys_of {
            return match value {
                Some(v) => pkeys
                    .get(peer)
                    .is_some_and(|set| set.contains(&Pkey::Single(v.clone()))),
                None => false,
            };
        }
        if let Some(peer) = &self.not_in_pkeys_of {
            return match value {
                Some(v) => !pkeys
                    .get(peer)
                    .is_some_and(|set| set.contains(&Pkey::Single(v.clone()))),
                None => true,
            };
        }
        if let Some(expected) = self.present {
            return value.is_some() == expected;
        }
        if let Some(expected) = &self.equals {
            return value == Some(expected);
        }
        // Unreachable for validated predicates.
        false
    }
}

/// Evaluate a conjunction of predicates.
pub fn eval_all(
    predicates: &[Predicate],
    obj: &Object,
    pkeys: &BTreeMap<String, BTreeSet<Pkey>>,
) -> bool {
    predicates.iter().all(|p| p.eval(obj, pkeys))
}

#[cfg(test)]
mod tests {
    use super::*;
    use courier_core::{PkeyAttr, TypeSchema};

    fn schema() -> TypeSchema {
        TypeSchema {
            attributes: ["gid", "uid"].iter().map(ToString::to_string).collect(),
            secrets: BTreeSet::new(),
            cacheonly: BTreeSet::new(),
            local: BTreeSet::new(),
            pkey: PkeyAttr::Single("gid".to_string()),
            foreign_keys: BTreeMap::new(),
            to_string: None,
        }
    }

    fn obj(gid: i64, uid: Option<i64>) -> Object {
        let mut attrs: BTreeMap<String, Value> =
            [("gid".to_string(), Value::from(gid))].into_iter().collect();
        if let Some(uid) = uid {
            attrs.insert("uid".to_string(), Value::from(uid));
        }
        Object::from_attrs("GroupsMembers", &schema(), attrs).unwrap()
    }

    fn pkeys(users: &[i64]) -> BTreeMap<String, BTreeSet<Pkey>> {
        [(
            "Users".to_string(),
            users.iter().map(|uid| Pkey::from(*uid)).collect(),
        )]
        .into_iter()
        .collect()
    }

    fn in_users(attr: &str) -> Predicate {
        Predicate {
            attr: attr.to_string(),
            in_pkeys_of: Some("Users".to_string()),
            not_in_pkeys_of: None,
            present: None,
            equals: None,
        }
    }

    #[test]
    fn test_in_pkeys_of() {
        let p = in_users("uid");
        assert!(p.eval(&obj(5, Some(1)), &pkeys(&[1, 2])));
        assert!(!p.eval(&obj(5, Some(9)), &pkeys(&[1, 2])));
        assert!(!p.eval(&obj(5, None), &pkeys(&[1, 2])));
    }

    #[test]
    fn test_not_in_pkeys_of_is_vacuous_on_absent_attr() {
        let p = Predicate {
            attr: "uid".to_string(),
            in_pkeys_of: None,
            not_in_pkeys_of: Some("Users".to_string()),
            present: None,
            equals: None,
        };
        assert!(p.eval(&obj(5, None), &pkeys(&[1])));
        assert!(p.eval(&obj(5, Some(9)), &pkeys(&[1])));
        assert!(!p.eval(&obj(5, Some(1)), &pkeys(&[1])));
    }

    #[test]
    fn test_present_and_equals() {
        let present = Predicate {
            attr: "uid".to_string(),
            in_pkeys_of: None,
            not_in_pkeys_of: None,
            present: Some(true),
            equals: None,
        };
        assert!(present.eval(&obj(5, Some(1)), &BTreeMap::new()));
        assert!(!present.eval(&obj(5, None), &BTreeMap::new()));

        let equals = Predicate {
            attr: "gid".to_string(),
            in_pkeys_of: None,
            not_in_pkeys_of: None,
            present: None,
            equals: Some(Value::from(5)),
        };
        assert!(equals.eval(&obj(5, None), &BTreeMap::new()));
        assert!(!equals.eval(&obj(6, None), &BTreeMap::new()));
    }

    #[test]
    fn test_validate_requires_exactly_one_form() {
        let mut p = in_users("uid");
        assert!(p.validate().is_ok());
        p.present = Some(true);
        assert!(p.validate().is_err());
        let empty = Predicate {
            attr: "uid".to_string(),
            in_pkeys_of: None,
            not_in_pkeys_of: None,
            present: None,
            equals: None,
        };
        assert!(empty.validate().is_err());
    }

    #[test]
    fn test_yaml_form() {
        let p: Predicate = serde_yaml::from_str("attr: uid\nin_pkeys_of: Users").unwrap();
        assert_eq!(p.peer(), Some("Users"));
        assert!(p.validate().is_ok());
    }
}
