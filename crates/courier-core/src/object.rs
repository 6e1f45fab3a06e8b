//! Objects
//!
//! An [`Object`] is one realized row of an entity type: its primary key, its
//! typed attribute map, and a synthetic `remote_pkey` kept immutable across
//! local pkey renames so the object keeps its identity.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::diff::AttrDiff;
use crate::error::{CoreError, CoreResult};
use crate::pkey::Pkey;
use crate::schema::TypeSchema;
use crate::value::Value;

/// A realized row of an entity type.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Object {
    pub pkey: Pkey,
    /// Identity of the row as first seen, never changed by pkey renames.
    pub remote_pkey: Pkey,
    attrs: BTreeMap<String, Value>,
}

impl Object {
    /// Build an object from an attribute map, extracting the pkey per the
    /// type schema. The remote pkey is initialized to the local pkey.
    pub fn from_attrs(
        entity: &str,
        schema: &TypeSchema,
        attrs: BTreeMap<String, Value>,
    ) -> CoreResult<Object> {
        let pkey = schema.pkey.extract(entity, &attrs)?;
        Ok(Object {
            remote_pkey: pkey.clone(),
            pkey,
            attrs,
        })
    }

    pub fn get(&self, attr: &str) -> Option<&Value> {
        self.attrs.get(attr)
    }

    pub fn set(&mut self, attr: impl Into<String>, value: Value) {
        self.attrs.insert(attr.into(), value);
    }

    pub fn remove_attr(&mut self, attr: &str) -> Option<Value> {
        self.attrs.remove(attr)
    }

    pub fn attrs(&self) -> &BTreeMap<String, Value> {
        &self.attrs
    }

    /// Attributes transmitted in events: everything except local and
    /// cache-only attributes.
    pub fn sent_attrs(&self, schema: &TypeSchema) -> BTreeMap<String, Value> {
        self.attrs
            .iter()
            .filter(|(attr, _)| schema.is_sent(attr))
            .map(|(attr, value)| (attr.clone(), value.clone()))
            .collect()
    }

    /// A copy of this object suitable for the persisted cache: local and
    /// secret attributes are never written to disk.
    pub fn cached_view(&self, schema: &TypeSchema) -> Object {
        Object {
            pkey: self.pkey.clone(),
            remote_pkey: self.remote_pkey.clone(),
            attrs: self
                .attrs
                .iter()
                .filter(|(attr, _)| schema.is_cached(attr))
                .map(|(attr, value)| (attr.clone(), value.clone()))
                .collect(),
        }
    }

    /// Attribute-level diff against an older version of the same object,
    /// restricted to diffable attributes. Secrets are not cached, so a
    /// secret present on the new side always shows up as added.
    pub fn diff_from(&self, old: &Object, schema: &TypeSchema) -> AttrDiff {
        let mut diff = AttrDiff::default();

        for (attr, value) in &self.attrs {
            if !schema.is_diffable(attr) {
                continue;
            }
            match old.attrs.get(attr) {
                None => {
                    diff.added.insert(attr.clone(), value.clone());
                }
                Some(old_value) if old_value != value => {
                    diff.modified.insert(attr.clone(), value.clone());
                }
                Some(_) => {}
            }
        }
        for attr in old.attrs.keys() {
            if schema.is_diffable(attr) && !self.attrs.contains_key(attr) {
                diff.removed.insert(attr.clone());
            }
        }
        diff
    }

    /// Merge another source's view of the same row into this one.
    ///
    /// Attributes absent here are taken from `other`. Attributes present on
    /// both sides with different values are a merge conflict: with
    /// `fail_on_conflict` the merge aborts, otherwise the first (already
    /// present) value wins.
    pub fn merge_with(&mut self, other: &Object, fail_on_conflict: bool) -> CoreResult<()> {
        for (attr, value) in &other.attrs {
            match self.attrs.get(attr) {
                None => {
                    self.attrs.insert(attr.clone(), value.clone());
                }
                Some(current) if current != value => {
                    if fail_on_conflict {
                        return Err(CoreError::MergeConflict {
                            attribute: attr.clone(),
                            pkey: self.pkey.to_string(),
                        });
                    }
                    debug!(
                        pkey = %self.pkey,
                        attribute = %attr,
                        "merge conflict, keeping first value"
                    );
                }
                Some(_) => {}
            }
        }
        Ok(())
    }

    /// Apply an attribute diff (from a `modified` event) in place.
    pub fn apply_diff(&mut self, diff: &AttrDiff) {
        diff.apply_to(&mut self.attrs);
    }

    /// Recompute the local pkey from the attribute map, after a pkey rename.
    /// The remote pkey is left untouched.
    pub fn rekey(&mut self, entity: &str, schema: &TypeSchema) -> CoreResult<()> {
        self.pkey = schema.pkey.extract(entity, &self.attrs)?;
        Ok(())
    }

    /// Display label, using the type's `to_string` template when declared
    /// (plain `${attr}` substitution), `<entity[pkey]>` otherwise.
    pub fn label(&self, entity: &str, schema: &TypeSchema) -> String {
        if let Some(template) = &schema.to_string {
            let mut out = template.clone();
            for (attr, value) in &self.attrs {
                out = out.replace(&format!("${{{attr}}}"), &value.to_string());
            }
            return out;
        }
        format!("<{entity}[{}]>", self.pkey)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::schema::PkeyAttr;
    use std::collections::BTreeSet;

    fn schema() -> TypeSchema {
        TypeSchema {
            attributes: ["uid", "mail", "pw", "quota", "last_change"]
                .iter()
                .map(ToString::to_string)
                .collect(),
            secrets: ["pw"].iter().map(ToString::to_string).collect(),
            cacheonly: ["quota"].iter().map(ToString::to_string).collect(),
            local: ["last_change"].iter().map(ToString::to_string).collect(),
            pkey: PkeyAttr::Single("uid".to_string()),
            foreign_keys: BTreeMap::new(),
            to_string: None,
        }
    }

    fn object(pairs: &[(&str, Value)]) -> Object {
        let attrs = pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.clone()))
            .collect();
        Object::from_attrs("Users", &schema(), attrs).unwrap()
    }

    #[test]
    fn test_pkey_extraction() {
        let obj = object(&[("uid", Value::from(1)), ("mail", Value::from("a@x"))]);
        assert_eq!(obj.pkey, Pkey::from(1));
        assert_eq!(obj.remote_pkey, Pkey::from(1));
    }

    #[test]
    fn test_sent_attrs_exclude_local_and_cacheonly() {
        let obj = object(&[
            ("uid", Value::from(1)),
            ("quota", Value::from(10)),
            ("last_change", Value::from("ts")),
            ("pw", Value::from("h1")),
        ]);
        let sent = obj.sent_attrs(&schema());
        assert!(sent.contains_key("uid"));
        assert!(sent.contains_key("pw"));
        assert!(!sent.contains_key("quota"));
        assert!(!sent.contains_key("last_change"));
    }

    #[test]
    fn test_cached_view_excludes_local_and_secrets() {
        let obj = object(&[
            ("uid", Value::from(1)),
            ("quota", Value::from(10)),
            ("last_change", Value::from("ts")),
            ("pw", Value::from("h1")),
        ]);
        let cached = obj.cached_view(&schema());
        assert!(cached.get("quota").is_some());
        assert!(cached.get("pw").is_none());
        assert!(cached.get("last_change").is_none());
    }

    #[test]
    fn test_diff_ignores_local_and_cacheonly() {
        let new = object(&[
            ("uid", Value::from(1)),
            ("quota", Value::from(20)),
            ("last_change", Value::from("now")),
        ]);
        let old = object(&[
            ("uid", Value::from(1)),
            ("quota", Value::from(10)),
            ("last_change", Value::from("then")),
        ]);
        assert!(new.diff_from(&old, &schema()).is_empty());
    }

    #[test]
    fn test_secret_always_diffs_as_added() {
        // The cached side never carries the secret, so a fetched secret
        // shows up as added on every diff.
        let new = object(&[
            ("uid", Value::from(1)),
            ("mail", Value::from("a@x")),
            ("pw", Value::from("h2")),
        ]);
        let cached = object(&[("uid", Value::from(1)), ("mail", Value::from("a@x"))]);
        let diff = new.diff_from(&cached, &schema());
        assert_eq!(diff.added.get("pw"), Some(&Value::from("h2")));
        assert!(diff.modified.is_empty());
    }

    #[test]
    fn test_merge_fills_missing_attrs() {
        let mut a = object(&[("uid", Value::from(1))]);
        let b = object(&[("uid", Value::from(1)), ("mail", Value::from("a@x"))]);
        a.merge_with(&b, true).unwrap();
        assert_eq!(a.get("mail"), Some(&Value::from("a@x")));
    }

    #[test]
    fn test_merge_conflict_keeps_first_or_fails() {
        let mut a = object(&[("uid", Value::from(1)), ("mail", Value::from("a@x"))]);
        let b = object(&[("uid", Value::from(1)), ("mail", Value::from("b@x"))]);

        let mut keep_first = a.clone();
        keep_first.merge_with(&b, false).unwrap();
        assert_eq!(keep_first.get("mail"), Some(&Value::from("a@x")));

        let err = a.merge_with(&b, true).unwrap_err();
        assert!(matches!(err, CoreError::MergeConflict { .. }));
    }

    #[test]
    fn test_apply_diff() {
        let mut obj = object(&[("uid", Value::from(1)), ("mail", Value::from("a@x"))]);
        let mut diff = AttrDiff::default();
        diff.modified.insert("mail".to_string(), Value::from("b@x"));
        diff.added.insert("quota".to_string(), Value::from(5));
        obj.apply_diff(&diff);
        assert_eq!(obj.get("mail"), Some(&Value::from("b@x")));
        assert_eq!(obj.get("quota"), Some(&Value::from(5)));
    }

    #[test]
    fn test_rekey_preserves_remote_pkey() {
        let mut s = schema();
        let mut obj = object(&[("uid", Value::from(1)), ("mail", Value::from("a@x"))]);
        s.pkey = PkeyAttr::Single("mail".to_string());
        obj.rekey("Users", &s).unwrap();
        assert_eq!(obj.pkey, Pkey::from("a@x"));
        assert_eq!(obj.remote_pkey, Pkey::from(1));
    }

    #[test]
    fn test_label_with_template() {
        let mut s = schema();
        s.to_string = Some("user ${uid}".to_string());
        let obj = object(&[("uid", Value::from(1))]);
        assert_eq!(obj.label("Users", &s), "user 1");
    }
}
